use anyhow::{anyhow, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

use sqlx::sqlite::SqlitePoolOptions;
use tg_archive::db::{ArchiveStore, SqliteSession};
use tg_archive::ingest::{
    self, IngestOptions, MessageSource, SourceChannel, SourceMessage,
};
use tg_archive::media::{self, MediaFetcher};
use tg_archive::model::{Media, MediaDescriptor, Message, PendingMedia, User};

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

async fn count(pool: &sqlx::SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await
        .unwrap()
}

/// In-memory source that records the cursor of every fetch.
#[derive(Clone, Default)]
struct RecordingSource {
    channels: Vec<SourceChannel>,
    messages: Arc<Mutex<Vec<SourceMessage>>>,
    fetches: Arc<Mutex<Vec<(i64, Option<i64>)>>>,
    fail_channels: HashSet<i64>,
}

impl RecordingSource {
    fn new(channel_id: i64, name: &str) -> Self {
        Self {
            channels: vec![SourceChannel {
                channel_id,
                name: name.to_string(),
            }],
            ..Default::default()
        }
    }

    async fn push_range(&self, channel_id: i64, ids: std::ops::RangeInclusive<i64>) {
        let mut guard = self.messages.lock().await;
        for id in ids {
            let sender = User::new(100 + id % 3);
            let media = if id % 5 == 0 {
                vec![MediaDescriptor {
                    message_id: id,
                    kind: "photo".into(),
                    path: format!("photos/{id}.jpg"),
                }]
            } else {
                Vec::new()
            };
            guard.push(SourceMessage {
                message: Message::new(channel_id, id, Some("hello")),
                sender: Some(sender),
                media,
            });
        }
    }

    async fn fetches(&self) -> Vec<(i64, Option<i64>)> {
        self.fetches.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl MessageSource for RecordingSource {
    async fn channels(&self) -> Result<Vec<SourceChannel>> {
        Ok(self.channels.clone())
    }

    async fn participants(&self, channel_id: i64) -> Result<Vec<User>> {
        let guard = self.messages.lock().await;
        Ok(guard
            .iter()
            .filter(|m| m.message.channel_id == channel_id)
            .filter_map(|m| m.sender.clone())
            .collect())
    }

    async fn messages_after(
        &self,
        channel_id: i64,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<SourceMessage>> {
        self.fetches.lock().await.push((channel_id, after));
        if self.fail_channels.contains(&channel_id) {
            return Err(anyhow!("remote unavailable"));
        }
        let guard = self.messages.lock().await;
        let mut out: Vec<SourceMessage> = guard
            .iter()
            .filter(|m| m.message.channel_id == channel_id)
            .filter(|m| after.map_or(true, |a| m.message.id > a))
            .cloned()
            .collect();
        out.sort_by_key(|m| m.message.id);
        out.truncate(limit);
        Ok(out)
    }
}

#[tokio::test]
async fn ingest_resumes_from_cursor() {
    let pool = setup_pool().await;
    let source = RecordingSource::new(1, "C1");
    source.push_range(1, 1..=10).await;

    let mut session = SqliteSession::new(pool.clone());
    let channel = source.channels[0].clone();

    let report = ingest::ingest_channel(&mut session, &source, &channel, 4)
        .await
        .unwrap();
    assert_eq!(report.messages, 10);
    assert_eq!(report.batches, 3);
    assert_eq!(report.cursor, Some(10));
    assert_eq!(report.media_queued, 2);
    assert_eq!(
        source.fetches().await,
        vec![(1, None), (1, Some(4)), (1, Some(8))]
    );

    source.push_range(1, 11..=15).await;
    let report = ingest::ingest_channel(&mut session, &source, &channel, 4)
        .await
        .unwrap();
    assert_eq!(report.messages, 5);
    assert_eq!(report.cursor, Some(15));

    assert_eq!(session.get_max_message_id(1).await.unwrap(), Some(15));
    session.commit_changes().await.unwrap();

    assert_eq!(count(&pool, "messages").await, 15);
    assert_eq!(count(&pool, "users").await, 3);
    assert_eq!(count(&pool, "users_channels").await, 3);
    assert_eq!(count(&pool, "resume_media").await, 3);

    let senders: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE sender_id IS NOT NULL")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(senders, 15);
}

#[tokio::test]
async fn rerun_without_new_messages_is_a_no_op() {
    let pool = setup_pool().await;
    let source = RecordingSource::new(1, "C1");
    source.push_range(1, 1..=3).await;
    let opts = IngestOptions {
        batch_size: 10,
        ..Default::default()
    };

    let mut session = SqliteSession::new(pool.clone());
    ingest::ingest_all(&mut session, &source, &opts).await.unwrap();
    let summary = ingest::ingest_all(&mut session, &source, &opts).await.unwrap();

    assert_eq!(summary.reports.len(), 1);
    assert_eq!(summary.reports[0].messages, 0);
    assert_eq!(summary.reports[0].cursor, Some(3));
    assert_eq!(count(&pool, "messages").await, 3);
}

#[tokio::test]
async fn empty_channel_is_recorded_on_first_sighting() {
    let pool = setup_pool().await;
    let source = RecordingSource::new(9, "quiet");
    let mut session = SqliteSession::new(pool.clone());

    let report = ingest::ingest_channel(&mut session, &source, &source.channels[0], 10)
        .await
        .unwrap();
    assert_eq!(report.cursor, Some(0));
    assert_eq!(session.get_max_message_id(9).await.unwrap(), Some(0));
    session.commit_changes().await.unwrap();
}

#[tokio::test]
async fn failing_channel_is_skipped_and_rolled_back() {
    let pool = setup_pool().await;
    let mut source = RecordingSource::new(1, "ok");
    source.channels.push(SourceChannel {
        channel_id: 2,
        name: "broken".into(),
    });
    source.fail_channels.insert(2);
    source.push_range(1, 1..=2).await;

    let mut session = SqliteSession::new(pool.clone());
    let summary = ingest::ingest_all(
        &mut session,
        &source,
        &IngestOptions {
            batch_size: 10,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(summary.failed, vec![2]);
    assert_eq!(summary.reports.len(), 1);
    assert!(!session.in_transaction());
    assert_eq!(count(&pool, "messages").await, 2);
    assert_eq!(count(&pool, "channels").await, 1);
}

#[tokio::test]
async fn cancellation_stops_the_run_without_commit() {
    let pool = setup_pool().await;
    let source = RecordingSource::new(1, "C1");
    source.push_range(1, 1..=5).await;

    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();
    let mut session = SqliteSession::new(pool.clone()).with_cancellation(rx);

    let err = ingest::ingest_all(
        &mut session,
        &source,
        &IngestOptions {
            batch_size: 10,
            ..Default::default()
        },
    )
    .await
    .unwrap_err();
    assert!(ingest::is_cancelled(&err));
    assert_eq!(count(&pool, "messages").await, 0);
    assert_eq!(count(&pool, "channels").await, 0);
}

#[tokio::test]
async fn participants_only_records_users_and_channel() {
    let pool = setup_pool().await;
    let source = RecordingSource::new(1, "C1");
    source.push_range(1, 1..=6).await;

    let mut session = SqliteSession::new(pool.clone());
    let summary = ingest::ingest_all(
        &mut session,
        &source,
        &IngestOptions {
            batch_size: 10,
            participants_only: true,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(summary.reports.len(), 1);

    assert_eq!(count(&pool, "users").await, 3);
    assert_eq!(count(&pool, "users_channels").await, 3);
    assert_eq!(count(&pool, "messages").await, 0);
    assert_eq!(count(&pool, "channels").await, 1);
}

/// Fetcher that fails for configured message ids and records every call.
#[derive(Clone, Default)]
struct RecordingFetcher {
    fail: HashSet<i64>,
    calls: Arc<Mutex<Vec<i64>>>,
}

#[async_trait::async_trait]
impl MediaFetcher for RecordingFetcher {
    async fn fetch(&self, channel_id: i64, descriptor: &MediaDescriptor) -> Result<Media> {
        self.calls.lock().await.push(descriptor.message_id);
        if self.fail.contains(&descriptor.message_id) {
            return Err(anyhow!("download failed"));
        }
        Ok(Media {
            channel_id,
            message_id: descriptor.message_id,
            kind: descriptor.kind.clone(),
            path: format!("/media/{}", descriptor.path),
        })
    }
}

async fn enqueue(pool: &sqlx::SqlitePool, channel_id: i64, ids: &[i64]) {
    let mut session = SqliteSession::new(pool.clone());
    let pending = ids
        .iter()
        .map(|&id| {
            MediaDescriptor {
                message_id: id,
                kind: "photo".into(),
                path: format!("{id}.jpg"),
            }
            .encode(channel_id)
            .unwrap()
        })
        .collect();
    session.insert_resume_media(pending).await.unwrap();
    session.commit_changes().await.unwrap();
}

#[tokio::test]
async fn drain_fetches_and_requeues_failures() {
    let pool = setup_pool().await;
    enqueue(&pool, 1, &[1, 2, 3]).await;

    let fetcher = RecordingFetcher {
        fail: HashSet::from([2]),
        ..Default::default()
    };
    let mut session = SqliteSession::new(pool.clone());
    let report = media::drain_channel_media(&mut session, &fetcher, 1, true)
        .await
        .unwrap();
    assert_eq!(report.claimed, 3);
    assert_eq!(report.fetched, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.requeued, 1);

    assert_eq!(count(&pool, "media").await, 2);
    assert_eq!(count(&pool, "resume_media").await, 1);

    // The retry picks up only the failed entry.
    let fetcher = RecordingFetcher::default();
    let report = media::drain_channel_media(&mut session, &fetcher, 1, true)
        .await
        .unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(*fetcher.calls.lock().await, vec![2]);
    assert_eq!(count(&pool, "media").await, 3);
    assert_eq!(count(&pool, "resume_media").await, 0);
}

#[tokio::test]
async fn drain_without_requeue_loses_failed_claims() {
    let pool = setup_pool().await;
    enqueue(&pool, 1, &[1, 2]).await;
    {
        let mut session = SqliteSession::new(pool.clone());
        session
            .insert_resume_media(vec![PendingMedia::new(1, "{not json")])
            .await
            .unwrap();
        session.commit_changes().await.unwrap();
    }

    let fetcher = RecordingFetcher {
        fail: HashSet::from([1, 2]),
        ..Default::default()
    };
    let mut session = SqliteSession::new(pool.clone());
    let report = media::drain_channel_media(&mut session, &fetcher, 1, false)
        .await
        .unwrap();
    assert_eq!(report.claimed, 3);
    assert_eq!(report.malformed, 1);
    assert_eq!(report.failed, 2);
    assert_eq!(report.requeued, 0);
    assert_eq!(count(&pool, "resume_media").await, 0);
    assert_eq!(count(&pool, "media").await, 0);
}

#[tokio::test]
async fn drain_all_walks_known_channels() {
    let pool = setup_pool().await;
    let source = RecordingSource::new(1, "C1");
    source.push_range(1, 1..=10).await;
    let mut session = SqliteSession::new(pool.clone());
    ingest::ingest_channel(&mut session, &source, &source.channels[0], 50)
        .await
        .unwrap();

    let fetcher = RecordingFetcher::default();
    let reports = media::drain_all(&mut session, &fetcher, None, true)
        .await
        .unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].fetched, 2);
    assert!(!session.in_transaction());
    assert_eq!(count(&pool, "media").await, 2);
}
