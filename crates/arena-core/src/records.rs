use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A community hub: a persistent space with its own general chat room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hub {
    /// Platform-assigned hub id
    pub id: String,

    /// Display name
    pub name: String,

    /// Game the hub is organized around
    pub game: Option<String>,

    /// Organizer (owner) user id
    pub organizer_id: Option<String>,

    /// Id of the hub's general chat room, when provisioned
    pub chat_room_id: Option<String>,
}

/// One side of a match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    /// Platform-assigned team id
    pub id: String,

    /// Display name
    pub name: String,

    /// Team captain user id
    pub leader_id: Option<String>,

    /// User ids of the roster, captain included
    #[serde(default)]
    pub roster: Vec<String>,
}

/// A scheduled or running match between two teams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchRecord {
    /// Platform-assigned match id
    pub id: String,

    pub game: Option<String>,

    pub region: Option<String>,

    /// Match lifecycle status as reported by the platform
    pub status: Option<String>,

    /// Teams keyed by their side; order matches the configured team keys
    #[serde(default)]
    pub teams: Vec<Team>,

    pub scheduled_at: Option<DateTime<Utc>>,

    /// Id of the match chat room, when provisioned
    pub chat_room_id: Option<String>,
}

impl MatchRecord {
    /// Look up a team of this match by id.
    pub fn team(&self, team_id: &str) -> Option<&Team> {
        self.teams.iter().find(|team| team.id == team_id)
    }
}

/// A platform user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Platform-assigned user id
    pub id: String,

    pub nickname: String,

    pub avatar: Option<String>,

    pub country: Option<String>,
}

/// A tournament (championship) record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tournament {
    /// Platform-assigned tournament id
    pub id: String,

    pub name: String,

    pub game: Option<String>,

    pub status: Option<String>,

    pub starts_at: Option<DateTime<Utc>>,
}

/// The authenticated account this SDK instance acts as.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Platform user id of the authenticated account
    pub user_id: String,

    pub nickname: String,

    /// Token presented to the chat server during SASL
    pub chat_token: Option<String>,
}
