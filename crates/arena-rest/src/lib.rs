//! REST data-access layer for the Arena SDK: typed record fetches with
//! pagination, the webhook payload model and dispatch, and the bridge
//! that feeds the chat core's context cache.

pub mod client;
pub mod error;
pub mod fetch;
pub mod models;
pub mod webhooks;

pub use client::RestClient;
pub use error::RestError;
pub use fetch::RestFetch;
pub use models::{Page, Ticket};
pub use webhooks::{WebhookDispatcher, WebhookEnvelope};
