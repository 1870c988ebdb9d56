//! The persistence contract the ingestion and media drivers are written against.
//!
//! A store is a unit of work: inserts are staged, `flush_changes` sends them to the
//! backend inside the open transaction, and `commit_changes` makes them durable.
//! Any flush or commit failure rolls the whole unit back before the error is
//! returned. The two operations that may race across sessions, the channel cursor
//! upsert and the media-queue claim, must each be a single atomic statement in the
//! backend.

use async_trait::async_trait;
use serde_json::Value;

use super::error::StoreError;
use super::model::MessageRecord;
use crate::model::{Channel, Media, Message, PendingMedia, User, UserChannel};

#[async_trait]
pub trait ArchiveStore: Send {
    /// Stage messages without an existence check. The caller only passes
    /// messages above the channel cursor.
    async fn insert_messages(&mut self, messages: Vec<Message>) -> Result<(), StoreError>;

    async fn insert_media(&mut self, media: Vec<Media>) -> Result<(), StoreError>;

    /// Append entries to the resumable media queue.
    async fn insert_resume_media(&mut self, pending: Vec<PendingMedia>) -> Result<(), StoreError>;

    /// Stage users whose id is not yet known to the store (or to this session).
    async fn insert_users(&mut self, users: Vec<User>) -> Result<(), StoreError>;

    /// Stage memberships whose `(channel_id, user_id)` pair is not yet known.
    async fn insert_users_channels(&mut self, links: Vec<UserChannel>) -> Result<(), StoreError>;

    /// Insert the channel, or advance its cursor if it already exists.
    async fn upsert_channel(&mut self, channel: &Channel) -> Result<(), StoreError>;

    /// Attach a metadata blob to an existing channel. Returns `false` when the
    /// channel is unknown.
    async fn upsert_channel_data(&mut self, channel_id: i64, data: &Value)
        -> Result<bool, StoreError>;

    async fn get_channel_by_id(&mut self, channel_id: i64) -> Result<Option<Channel>, StoreError>;

    /// Highest persisted message id, or `None` for a channel never seen.
    async fn get_max_message_id(&mut self, channel_id: i64) -> Result<Option<i64>, StoreError>;

    async fn list_channels(&mut self) -> Result<Vec<Channel>, StoreError>;

    /// Every message that carries a timestamp.
    async fn get_all_messages(&mut self) -> Result<Vec<MessageRecord>, StoreError>;

    /// Distinct message bodies matching a SQL `LIKE` pattern.
    async fn get_messages_with_pattern(&mut self, pattern: &str)
        -> Result<Vec<String>, StoreError>;

    /// Claim every queued payload for the channel. Claimed entries are removed in
    /// the same statement; a consumer that fails must re-enqueue them itself.
    async fn get_resume_media(&mut self, channel_id: i64) -> Result<Vec<String>, StoreError>;

    async fn flush_changes(&mut self) -> Result<(), StoreError>;

    async fn commit_changes(&mut self) -> Result<(), StoreError>;

    /// Discard staged rows and roll back the open transaction, if any.
    async fn rollback_changes(&mut self);
}
