use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One page of a listing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,

    /// Offset of the first item in this page
    #[serde(default)]
    pub start: usize,

    /// Offset one past the last item in this page
    #[serde(default)]
    pub end: usize,
}

impl<T> Page<T> {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Offset to request for the following page; `None` when this page
    /// came back empty.
    pub fn next_start(&self) -> Option<usize> {
        if self.items.is_empty() {
            None
        } else {
            Some(self.start + self.items.len())
        }
    }
}

/// A support/moderation ticket attached to a match or hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub id: String,

    pub subject: Option<String>,

    pub status: Option<String>,

    pub match_id: Option<String>,

    pub created_at: Option<DateTime<Utc>>,
}
