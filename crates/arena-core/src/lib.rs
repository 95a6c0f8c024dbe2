pub mod config;
pub mod error;
pub mod event;
pub mod records;

pub use error::{ArenaError, EventBusError, Result};
