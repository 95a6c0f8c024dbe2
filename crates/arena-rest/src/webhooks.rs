use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::RestError;

/// Envelope the platform POSTs to registered webhook endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEnvelope {
    /// Unique delivery id, for deduplication
    pub transaction_id: String,

    /// Event name, e.g. `match_status_finished`
    pub event: String,

    pub event_id: Option<String>,

    pub timestamp: Option<DateTime<Utc>>,

    /// Event-specific body, left untyped until a handler claims it
    #[serde(default)]
    pub payload: Value,
}

/// Typed views over the common event payloads.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchStatusPayload {
    pub match_id: String,
    pub status: Option<String>,
    pub hub_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubMemberPayload {
    pub hub_id: String,
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl WebhookEnvelope {
    pub fn parse(raw: &str) -> Result<Self, RestError> {
        serde_json::from_str(raw).map_err(|error| RestError::Decode(error.to_string()))
    }

    /// Decode the payload as a specific event body.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, RestError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|error| RestError::Decode(error.to_string()))
    }
}

type Handler = Box<dyn Fn(&WebhookEnvelope) + Send + Sync>;

/// Routes webhook envelopes to handlers registered per event name.
/// Unclaimed events are counted and dropped.
#[derive(Default)]
pub struct WebhookDispatcher {
    handlers: HashMap<String, Vec<Handler>>,
}

impl WebhookDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<H>(&mut self, event: impl Into<String>, handler: H) -> &mut Self
    where
        H: Fn(&WebhookEnvelope) + Send + Sync + 'static,
    {
        self.handlers
            .entry(event.into())
            .or_default()
            .push(Box::new(handler));
        self
    }

    /// Dispatch one raw delivery. Returns how many handlers ran.
    pub fn dispatch(&self, raw: &str) -> Result<usize, RestError> {
        let envelope = WebhookEnvelope::parse(raw)?;
        Ok(self.dispatch_envelope(&envelope))
    }

    pub fn dispatch_envelope(&self, envelope: &WebhookEnvelope) -> usize {
        let Some(handlers) = self.handlers.get(&envelope.event) else {
            debug!(event = %envelope.event, "webhook event has no handler");
            return 0;
        };
        for handler in handlers {
            handler(envelope);
        }
        handlers.len()
    }
}
