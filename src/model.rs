use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A chat or channel being archived. `max_message_id` is the ingestion cursor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Channel {
    pub channel_id: i64,
    pub name: String,
    pub max_message_id: i64,
}

impl Channel {
    pub fn new(channel_id: i64, name: impl Into<String>, max_message_id: i64) -> Self {
        Self {
            channel_id,
            name: name.into(),
            max_message_id,
        }
    }
}

/// One remote message. `(channel_id, id)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: i64,
    pub channel_id: i64,
    pub sender_id: Option<i64>,
    pub message: Option<String>,
    pub message_utc: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(channel_id: i64, id: i64, message: Option<&str>) -> Self {
        Self {
            id,
            channel_id,
            sender_id: None,
            message: message.map(str::to_string),
            message_utc: None,
        }
    }

    pub fn sent_at(mut self, at: DateTime<Utc>) -> Self {
        self.message_utc = Some(at);
        self
    }

    pub fn from_sender(mut self, user_id: i64) -> Self {
        self.sender_id = Some(user_id);
        self
    }
}

/// A media payload that has been fetched and stored locally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Media {
    pub channel_id: i64,
    pub message_id: i64,
    pub kind: String,
    pub path: String,
}

/// Queue entry for media still waiting to be fetched. `data` is opaque to the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingMedia {
    pub channel_id: i64,
    pub data: String,
}

impl PendingMedia {
    pub fn new(channel_id: i64, data: impl Into<String>) -> Self {
        Self {
            channel_id,
            data: data.into(),
        }
    }
}

/// What the drivers put into [`PendingMedia::data`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaDescriptor {
    pub message_id: i64,
    pub kind: String,
    pub path: String,
}

impl MediaDescriptor {
    pub fn encode(&self, channel_id: i64) -> serde_json::Result<PendingMedia> {
        Ok(PendingMedia::new(channel_id, serde_json::to_string(self)?))
    }

    pub fn decode(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub user_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl User {
    pub fn new(user_id: i64) -> Self {
        Self {
            user_id,
            username: None,
            first_name: None,
            last_name: None,
        }
    }
}

/// Membership of a user in a channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct UserChannel {
    pub channel_id: i64,
    pub user_id: i64,
}

impl UserChannel {
    pub fn new(channel_id: i64, user_id: i64) -> Self {
        Self {
            channel_id,
            user_id,
        }
    }
}
