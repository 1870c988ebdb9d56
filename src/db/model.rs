//! Row and view models returned by the store's read accessors.

use crate::model::Channel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ChannelRow {
    pub channel_id: i64,
    pub name: String,
    pub max_message_id: i64,
}

impl From<ChannelRow> for Channel {
    fn from(row: ChannelRow) -> Self {
        Channel {
            channel_id: row.channel_id,
            name: row.name,
            max_message_id: row.max_message_id,
        }
    }
}

/// Reporting view over a timestamped message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct MessageRecord {
    pub id: i64,
    pub message: Option<String>,
    pub message_utc: DateTime<Utc>,
}
