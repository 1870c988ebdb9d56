//! Incremental ingestion driver.
//!
//! Reads each channel's cursor, asks a [`MessageSource`] for newer messages and
//! writes them through an [`ArchiveStore`] one batch per unit of work: senders,
//! memberships, messages and media descriptors are staged, the cursor is
//! advanced to the batch maximum, and the batch is committed. A failed batch is
//! rolled back, so the next run resumes from the last committed cursor.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use tracing::{info, instrument, warn};

use crate::db::{ArchiveStore, StoreError};
use crate::model::{Channel, MediaDescriptor, Message, PendingMedia, User, UserChannel};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceChannel {
    pub channel_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMessage {
    pub message: Message,
    pub sender: Option<User>,
    pub media: Vec<MediaDescriptor>,
}

/// Where messages come from. Implementations return messages in ascending id order.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn channels(&self) -> Result<Vec<SourceChannel>>;

    async fn participants(&self, channel_id: i64) -> Result<Vec<User>>;

    /// Up to `limit` messages with id strictly greater than `after`
    /// (all messages when `after` is `None`).
    async fn messages_after(
        &self,
        channel_id: i64,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<SourceMessage>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelReport {
    pub channel_id: i64,
    pub batches: usize,
    pub messages: usize,
    pub media_queued: usize,
    pub cursor: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    pub batch_size: usize,
    /// Only these channels; empty means every channel the source knows.
    pub channels: Vec<i64>,
    /// Record users and memberships without fetching messages.
    pub participants_only: bool,
}

#[derive(Debug, Default)]
pub struct IngestSummary {
    pub reports: Vec<ChannelReport>,
    pub failed: Vec<i64>,
}

/// True when the error chain carries a session cancellation.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<StoreError>(), Some(StoreError::Cancelled))
}

#[instrument(skip_all, fields(channel_id = channel.channel_id))]
pub async fn ingest_channel(
    store: &mut dyn ArchiveStore,
    source: &dyn MessageSource,
    channel: &SourceChannel,
    batch_size: usize,
) -> Result<ChannelReport> {
    let res = ingest_channel_batches(store, source, channel, batch_size).await;
    if res.is_err() {
        store.rollback_changes().await;
    }
    res
}

async fn ingest_channel_batches(
    store: &mut dyn ArchiveStore,
    source: &dyn MessageSource,
    channel: &SourceChannel,
    batch_size: usize,
) -> Result<ChannelReport> {
    let channel_id = channel.channel_id;
    let mut cursor = store.get_max_message_id(channel_id).await?;
    // Release the lock before talking to the source.
    store.commit_changes().await?;
    let mut report = ChannelReport {
        channel_id,
        cursor,
        ..Default::default()
    };
    info!(channel_id, ?cursor, "ingesting channel");

    loop {
        let mut batch = source
            .messages_after(channel_id, cursor, batch_size)
            .await
            .with_context(|| format!("failed to fetch messages for channel {channel_id}"))?;
        let fetched = batch.len();
        // Anything at or below the cursor is already stored.
        batch.retain(|m| cursor.map_or(true, |c| m.message.id > c));
        let Some(max_id) = batch.iter().map(|m| m.message.id).max() else {
            break;
        };

        let staged = stage_batch(channel_id, batch)?;
        report.messages += staged.messages.len();
        report.media_queued += staged.pending.len();

        store.insert_users(staged.users).await?;
        store.insert_users_channels(staged.links).await?;
        store.insert_messages(staged.messages).await?;
        store.insert_resume_media(staged.pending).await?;
        store
            .upsert_channel(&Channel::new(channel_id, &channel.name, max_id))
            .await?;
        store.commit_changes().await?;

        report.batches += 1;
        cursor = Some(max_id);
        report.cursor = cursor;
        info!(channel_id, cursor = max_id, "committed batch");

        if fetched < batch_size {
            break;
        }
    }

    if cursor.is_none() {
        // First sighting of an empty channel still records it.
        store
            .upsert_channel(&Channel::new(channel_id, &channel.name, 0))
            .await?;
        report.cursor = Some(0);
    }
    store.commit_changes().await?;

    Ok(report)
}

struct StagedBatch {
    users: Vec<User>,
    links: Vec<UserChannel>,
    messages: Vec<Message>,
    pending: Vec<PendingMedia>,
}

fn stage_batch(channel_id: i64, batch: Vec<SourceMessage>) -> Result<StagedBatch> {
    let mut staged = StagedBatch {
        users: Vec::new(),
        links: Vec::new(),
        messages: Vec::with_capacity(batch.len()),
        pending: Vec::new(),
    };
    let mut senders = HashSet::new();

    for SourceMessage {
        mut message,
        sender,
        media,
    } in batch
    {
        if let Some(user) = sender {
            message.sender_id.get_or_insert(user.user_id);
            if senders.insert(user.user_id) {
                staged.links.push(UserChannel::new(channel_id, user.user_id));
                staged.users.push(user);
            }
        }
        for desc in media {
            staged.pending.push(desc.encode(channel_id)?);
        }
        staged.messages.push(message);
    }
    Ok(staged)
}

/// Record a channel's participants without touching its messages.
#[instrument(skip_all, fields(channel_id = channel.channel_id))]
pub async fn ingest_participants(
    store: &mut dyn ArchiveStore,
    source: &dyn MessageSource,
    channel: &SourceChannel,
) -> Result<usize> {
    let res = ingest_participants_once(store, source, channel).await;
    if res.is_err() {
        store.rollback_changes().await;
    }
    res
}

async fn ingest_participants_once(
    store: &mut dyn ArchiveStore,
    source: &dyn MessageSource,
    channel: &SourceChannel,
) -> Result<usize> {
    let channel_id = channel.channel_id;
    let users = source
        .participants(channel_id)
        .await
        .with_context(|| format!("failed to fetch participants for channel {channel_id}"))?;
    let count = users.len();
    let links = users
        .iter()
        .map(|u| UserChannel::new(channel_id, u.user_id))
        .collect();

    store.insert_users(users).await?;
    store.insert_users_channels(links).await?;
    let cursor = store.get_max_message_id(channel_id).await?.unwrap_or(0);
    store
        .upsert_channel(&Channel::new(channel_id, &channel.name, cursor))
        .await?;
    store.commit_changes().await?;
    info!(channel_id, participants = count, "recorded participants");
    Ok(count)
}

/// Ingest every selected channel. A failing channel is logged and skipped;
/// cancellation stops the whole run.
#[instrument(skip_all)]
pub async fn ingest_all(
    store: &mut dyn ArchiveStore,
    source: &dyn MessageSource,
    opts: &IngestOptions,
) -> Result<IngestSummary> {
    let channels = source.channels().await.context("failed to list channels")?;
    let mut summary = IngestSummary::default();

    for channel in channels
        .iter()
        .filter(|c| opts.channels.is_empty() || opts.channels.contains(&c.channel_id))
    {
        let res = if opts.participants_only {
            ingest_participants(store, source, channel)
                .await
                .map(|_| ChannelReport {
                    channel_id: channel.channel_id,
                    ..Default::default()
                })
        } else {
            ingest_channel(store, source, channel, opts.batch_size).await
        };
        match res {
            Ok(report) => summary.reports.push(report),
            Err(err) if is_cancelled(&err) => return Err(err),
            Err(err) => {
                warn!(channel_id = channel.channel_id, ?err, "channel ingestion failed");
                summary.failed.push(channel.channel_id);
            }
        }
    }
    Ok(summary)
}
