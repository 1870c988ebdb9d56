use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite, Transaction};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::error::StoreError;
use super::model::{ChannelRow, MessageRecord};
use super::store::ArchiveStore;
use super::Pool;
use crate::model::{Channel, Media, Message, PendingMedia, User, UserChannel};

// Keeps `IN (...)` lists well under SQLite's bound-parameter limit.
const LOOKUP_CHUNK: usize = 500;

enum Staged {
    Message(Message),
    Media(Media),
    ResumeMedia(PendingMedia),
    User(User),
    UserChannel(UserChannel),
}

/// SQLite unit of work.
///
/// A transaction is begun lazily on first use and ends at `commit_changes` or
/// `rollback_changes`; the next operation begins a fresh one. Transactions start
/// with `BEGIN IMMEDIATE`: the write lock is taken up front, so a read followed by
/// a write inside one unit of work never fails on a snapshot another connection
/// has since committed past. Competing sessions wait up to the busy timeout. Reads and the
/// channel upsert flush staged rows first so the session always sees its own
/// writes. Dropping a session with an open transaction rolls it back.
pub struct SqliteSession {
    id: Uuid,
    pool: Pool,
    tx: Option<Transaction<'static, Sqlite>>,
    staged: Vec<Staged>,
    cancel: Option<watch::Receiver<bool>>,
}

impl SqliteSession {
    pub fn new(pool: Pool) -> Self {
        Self {
            id: Uuid::new_v4(),
            pool,
            tx: None,
            staged: Vec::new(),
            cancel: None,
        }
    }

    /// Once the receiver reads `true`, flush and commit roll back instead.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Rows staged but not yet flushed.
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    async fn transaction(&mut self) -> Result<&mut Transaction<'static, Sqlite>, StoreError> {
        let tx = match self.tx.take() {
            Some(tx) => tx,
            None => {
                debug!(session = %self.id, "begin immediate transaction");
                self.pool.begin_with("BEGIN IMMEDIATE").await?
            }
        };
        Ok(self.tx.insert(tx))
    }

    async fn write_staged(&mut self) -> Result<usize, StoreError> {
        if self.staged.is_empty() {
            return Ok(0);
        }
        let staged = std::mem::take(&mut self.staged);
        let count = staged.len();
        let tx = self.transaction().await?;
        for row in staged {
            write_row(tx, row).await?;
        }
        Ok(count)
    }

    async fn discard(&mut self) {
        self.staged.clear();
        if let Some(tx) = self.tx.take() {
            if let Err(err) = tx.rollback().await {
                warn!(session = %self.id, ?err, "rollback failed");
            }
        }
    }

    async fn flush_or_rollback(&mut self, op: &'static str) -> Result<(), StoreError> {
        if self.is_cancelled() {
            warn!(session = %self.id, op, "cancellation observed; rolling back");
            self.discard().await;
            return Err(StoreError::Cancelled);
        }
        match self.write_staged().await {
            Ok(0) => Ok(()),
            Ok(rows) => {
                debug!(session = %self.id, op, rows, "flushed staged rows");
                Ok(())
            }
            Err(err) => {
                error!(session = %self.id, op, error = %err, "failed to flush; rolling back");
                self.discard().await;
                Err(err)
            }
        }
    }
}

impl Drop for SqliteSession {
    fn drop(&mut self) {
        if self.tx.is_some() || !self.staged.is_empty() {
            warn!(
                session = %self.id,
                staged = self.staged.len(),
                "session dropped with uncommitted changes; rolling back"
            );
        }
    }
}

#[async_trait]
impl ArchiveStore for SqliteSession {
    #[instrument(skip_all)]
    async fn insert_messages(&mut self, messages: Vec<Message>) -> Result<(), StoreError> {
        debug!(session = %self.id, count = messages.len(), "stage messages");
        self.staged.extend(messages.into_iter().map(Staged::Message));
        Ok(())
    }

    #[instrument(skip_all)]
    async fn insert_media(&mut self, media: Vec<Media>) -> Result<(), StoreError> {
        debug!(session = %self.id, count = media.len(), "stage media");
        self.staged.extend(media.into_iter().map(Staged::Media));
        Ok(())
    }

    #[instrument(skip_all)]
    async fn insert_resume_media(&mut self, pending: Vec<PendingMedia>) -> Result<(), StoreError> {
        debug!(session = %self.id, count = pending.len(), "stage resume media");
        self.staged.extend(pending.into_iter().map(Staged::ResumeMedia));
        Ok(())
    }

    #[instrument(skip_all)]
    async fn insert_users(&mut self, users: Vec<User>) -> Result<(), StoreError> {
        if users.is_empty() {
            return Ok(());
        }
        self.flush_or_rollback("autoflush").await?;

        let mut seen = HashSet::new();
        let users: Vec<User> = users
            .into_iter()
            .filter(|u| seen.insert(u.user_id))
            .collect();
        let ids: Vec<i64> = users.iter().map(|u| u.user_id).collect();
        let existing = existing_user_ids(self.transaction().await?, &ids).await?;

        let offered = users.len();
        let fresh: Vec<User> = users
            .into_iter()
            .filter(|u| !existing.contains(&u.user_id))
            .collect();
        debug!(
            session = %self.id,
            staged = fresh.len(),
            skipped = offered - fresh.len(),
            "stage users"
        );
        self.staged.extend(fresh.into_iter().map(Staged::User));
        Ok(())
    }

    #[instrument(skip_all)]
    async fn insert_users_channels(&mut self, links: Vec<UserChannel>) -> Result<(), StoreError> {
        if links.is_empty() {
            return Ok(());
        }
        self.flush_or_rollback("autoflush").await?;

        let mut seen = HashSet::new();
        let links: Vec<UserChannel> = links.into_iter().filter(|l| seen.insert(*l)).collect();
        let channels: HashSet<i64> = links.iter().map(|l| l.channel_id).collect();
        let existing = existing_memberships(self.transaction().await?, &channels).await?;

        let offered = links.len();
        let fresh: Vec<UserChannel> = links
            .into_iter()
            .filter(|l| !existing.contains(l))
            .collect();
        debug!(
            session = %self.id,
            staged = fresh.len(),
            skipped = offered - fresh.len(),
            "stage memberships"
        );
        self.staged.extend(fresh.into_iter().map(Staged::UserChannel));
        Ok(())
    }

    #[instrument(skip_all, fields(channel_id = channel.channel_id))]
    async fn upsert_channel(&mut self, channel: &Channel) -> Result<(), StoreError> {
        if channel.max_message_id < 0 {
            return Err(StoreError::InvalidCursor {
                channel_id: channel.channel_id,
                value: channel.max_message_id,
            });
        }
        self.flush_or_rollback("autoflush").await?;
        let tx = self.transaction().await?;
        // The cursor only moves forward, even if a slower session upserts later.
        sqlx::query(
            "INSERT INTO channels (channel_id, name, max_message_id) VALUES (?, ?, ?) \
             ON CONFLICT(channel_id) DO UPDATE SET \
                max_message_id = MAX(channels.max_message_id, excluded.max_message_id), \
                updated_at = CURRENT_TIMESTAMP",
        )
        .bind(channel.channel_id)
        .bind(&channel.name)
        .bind(channel.max_message_id)
        .execute(&mut **tx)
        .await?;
        debug!(session = %self.id, max_message_id = channel.max_message_id, "upserted channel");
        Ok(())
    }

    #[instrument(skip_all, fields(channel_id = channel_id))]
    async fn upsert_channel_data(
        &mut self,
        channel_id: i64,
        data: &Value,
    ) -> Result<bool, StoreError> {
        let encoded = serde_json::to_string(data)?;
        self.flush_or_rollback("autoflush").await?;
        let tx = self.transaction().await?;
        let res = sqlx::query(
            "UPDATE channels SET data = ?, updated_at = CURRENT_TIMESTAMP WHERE channel_id = ?",
        )
        .bind(encoded)
        .bind(channel_id)
        .execute(&mut **tx)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    #[instrument(skip_all, fields(channel_id = channel_id))]
    async fn get_channel_by_id(&mut self, channel_id: i64) -> Result<Option<Channel>, StoreError> {
        self.flush_or_rollback("autoflush").await?;
        let tx = self.transaction().await?;
        let row = sqlx::query_as::<_, ChannelRow>(
            "SELECT channel_id, name, max_message_id FROM channels WHERE channel_id = ?",
        )
        .bind(channel_id)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row.map(Channel::from))
    }

    #[instrument(skip_all, fields(channel_id = channel_id))]
    async fn get_max_message_id(&mut self, channel_id: i64) -> Result<Option<i64>, StoreError> {
        self.flush_or_rollback("autoflush").await?;
        let tx = self.transaction().await?;
        let id = sqlx::query_scalar::<_, i64>(
            "SELECT max_message_id FROM channels WHERE channel_id = ?",
        )
        .bind(channel_id)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(id)
    }

    #[instrument(skip_all)]
    async fn list_channels(&mut self) -> Result<Vec<Channel>, StoreError> {
        self.flush_or_rollback("autoflush").await?;
        let tx = self.transaction().await?;
        let rows = sqlx::query_as::<_, ChannelRow>(
            "SELECT channel_id, name, max_message_id FROM channels ORDER BY channel_id",
        )
        .fetch_all(&mut **tx)
        .await?;
        Ok(rows.into_iter().map(Channel::from).collect())
    }

    #[instrument(skip_all)]
    async fn get_all_messages(&mut self) -> Result<Vec<MessageRecord>, StoreError> {
        self.flush_or_rollback("autoflush").await?;
        let tx = self.transaction().await?;
        let rows = sqlx::query_as::<_, MessageRecord>(
            "SELECT id, message, message_utc FROM messages WHERE message_utc IS NOT NULL \
             ORDER BY message_utc, channel_id, id",
        )
        .fetch_all(&mut **tx)
        .await?;
        Ok(rows)
    }

    #[instrument(skip_all)]
    async fn get_messages_with_pattern(
        &mut self,
        pattern: &str,
    ) -> Result<Vec<String>, StoreError> {
        self.flush_or_rollback("autoflush").await?;
        let tx = self.transaction().await?;
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT message FROM messages WHERE message LIKE ? ORDER BY message",
        )
        .bind(pattern)
        .fetch_all(&mut **tx)
        .await?;
        Ok(rows)
    }

    #[instrument(skip_all, fields(channel_id = channel_id))]
    async fn get_resume_media(&mut self, channel_id: i64) -> Result<Vec<String>, StoreError> {
        self.flush_or_rollback("autoflush").await?;
        let tx = self.transaction().await?;
        // Read and delete in one statement so two sessions never claim the same row.
        let mut rows: Vec<(i64, String)> = sqlx::query_as(
            "DELETE FROM resume_media WHERE channel_id = ? RETURNING id, data",
        )
        .bind(channel_id)
        .fetch_all(&mut **tx)
        .await?;
        rows.sort_by_key(|(id, _)| *id);
        debug!(session = %self.id, claimed = rows.len(), "claimed resume media");
        Ok(rows.into_iter().map(|(_, data)| data).collect())
    }

    #[instrument(skip_all)]
    async fn flush_changes(&mut self) -> Result<(), StoreError> {
        self.flush_or_rollback("flush").await
    }

    #[instrument(skip_all)]
    async fn commit_changes(&mut self) -> Result<(), StoreError> {
        self.flush_or_rollback("commit").await?;
        let Some(tx) = self.tx.take() else {
            return Ok(());
        };
        if let Err(err) = tx.commit().await {
            // The failed transaction is dropped here, which rolls it back.
            error!(session = %self.id, ?err, "failed to commit; rolled back");
            self.staged.clear();
            return Err(err.into());
        }
        debug!(session = %self.id, "committed");
        Ok(())
    }

    #[instrument(skip_all)]
    async fn rollback_changes(&mut self) {
        if self.tx.is_some() || !self.staged.is_empty() {
            info!(session = %self.id, staged = self.staged.len(), "rolling back session");
        }
        self.discard().await;
    }
}

async fn write_row(tx: &mut Transaction<'static, Sqlite>, row: Staged) -> Result<(), StoreError> {
    match row {
        Staged::Message(m) => {
            sqlx::query(
                "INSERT INTO messages (channel_id, id, sender_id, message, message_utc) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(m.channel_id)
            .bind(m.id)
            .bind(m.sender_id)
            .bind(m.message)
            .bind(m.message_utc)
            .execute(&mut **tx)
            .await?;
        }
        Staged::Media(m) => {
            sqlx::query(
                "INSERT INTO media (channel_id, message_id, kind, path) VALUES (?, ?, ?, ?)",
            )
            .bind(m.channel_id)
            .bind(m.message_id)
            .bind(m.kind)
            .bind(m.path)
            .execute(&mut **tx)
            .await?;
        }
        Staged::ResumeMedia(p) => {
            sqlx::query("INSERT INTO resume_media (channel_id, data) VALUES (?, ?)")
                .bind(p.channel_id)
                .bind(p.data)
                .execute(&mut **tx)
                .await?;
        }
        Staged::User(u) => {
            sqlx::query(
                "INSERT INTO users (user_id, username, first_name, last_name) VALUES (?, ?, ?, ?)",
            )
            .bind(u.user_id)
            .bind(u.username)
            .bind(u.first_name)
            .bind(u.last_name)
            .execute(&mut **tx)
            .await?;
        }
        Staged::UserChannel(l) => {
            sqlx::query("INSERT INTO users_channels (channel_id, user_id) VALUES (?, ?)")
                .bind(l.channel_id)
                .bind(l.user_id)
                .execute(&mut **tx)
                .await?;
        }
    }
    Ok(())
}

async fn existing_user_ids(
    tx: &mut Transaction<'static, Sqlite>,
    ids: &[i64],
) -> Result<HashSet<i64>, StoreError> {
    let mut found = HashSet::new();
    for chunk in ids.chunks(LOOKUP_CHUNK) {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT user_id FROM users WHERE user_id IN (");
        let mut sep = qb.separated(", ");
        for id in chunk {
            sep.push_bind(*id);
        }
        sep.push_unseparated(")");
        let rows = qb
            .build_query_scalar::<i64>()
            .fetch_all(&mut **tx)
            .await?;
        found.extend(rows);
    }
    Ok(found)
}

async fn existing_memberships(
    tx: &mut Transaction<'static, Sqlite>,
    channels: &HashSet<i64>,
) -> Result<HashSet<UserChannel>, StoreError> {
    let mut found = HashSet::new();
    for &channel_id in channels {
        let users: Vec<i64> =
            sqlx::query_scalar("SELECT user_id FROM users_channels WHERE channel_id = ?")
                .bind(channel_id)
                .fetch_all(&mut **tx)
                .await?;
        found.extend(users.into_iter().map(|u| UserChannel::new(channel_id, u)));
    }
    Ok(found)
}
