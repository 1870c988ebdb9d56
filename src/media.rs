use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, instrument, warn};

use crate::db::ArchiveStore;
use crate::model::{Media, MediaDescriptor, PendingMedia};

/// Moves one queued payload to local storage.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, channel_id: i64, descriptor: &MediaDescriptor) -> Result<Media>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub channel_id: i64,
    pub claimed: usize,
    pub fetched: usize,
    pub failed: usize,
    pub requeued: usize,
    pub malformed: usize,
}

/// Claim every queued payload for `channel_id` and fetch it.
///
/// The claim is committed before any fetch starts, so entries are gone from the
/// queue even if this process dies mid-download. Failed fetches go back on the
/// queue only when `requeue_failed` is set; undecodable entries are dropped.
#[instrument(skip_all, fields(channel_id = channel_id))]
pub async fn drain_channel_media(
    store: &mut dyn ArchiveStore,
    fetcher: &dyn MediaFetcher,
    channel_id: i64,
    requeue_failed: bool,
) -> Result<DrainReport> {
    let res = drain_once(store, fetcher, channel_id, requeue_failed).await;
    if res.is_err() {
        store.rollback_changes().await;
    }
    res
}

async fn drain_once(
    store: &mut dyn ArchiveStore,
    fetcher: &dyn MediaFetcher,
    channel_id: i64,
    requeue_failed: bool,
) -> Result<DrainReport> {
    let claimed = store.get_resume_media(channel_id).await?;
    store.commit_changes().await?;

    let mut report = DrainReport {
        channel_id,
        claimed: claimed.len(),
        ..Default::default()
    };
    if claimed.is_empty() {
        return Ok(report);
    }

    let mut fetched = Vec::new();
    let mut retry = Vec::new();
    for data in claimed {
        let desc = match MediaDescriptor::decode(&data) {
            Ok(desc) => desc,
            Err(err) => {
                warn!(channel_id, %err, "dropping malformed media descriptor");
                report.malformed += 1;
                continue;
            }
        };
        match fetcher.fetch(channel_id, &desc).await {
            Ok(media) => fetched.push(media),
            Err(err) => {
                warn!(channel_id, message_id = desc.message_id, ?err, "media fetch failed");
                report.failed += 1;
                if requeue_failed {
                    retry.push(PendingMedia::new(channel_id, data));
                }
            }
        }
    }

    report.fetched = fetched.len();
    report.requeued = retry.len();
    store.insert_media(fetched).await?;
    store.insert_resume_media(retry).await?;
    store.commit_changes().await?;

    info!(
        channel_id,
        claimed = report.claimed,
        fetched = report.fetched,
        failed = report.failed,
        requeued = report.requeued,
        "drained media queue"
    );
    Ok(report)
}

/// Drain the queue of every known channel, or only `only` when given.
#[instrument(skip_all)]
pub async fn drain_all(
    store: &mut dyn ArchiveStore,
    fetcher: &dyn MediaFetcher,
    only: Option<i64>,
    requeue_failed: bool,
) -> Result<Vec<DrainReport>> {
    let channel_ids: Vec<i64> = match only {
        Some(id) => vec![id],
        None => {
            let channels = store.list_channels().await?;
            store.commit_changes().await?;
            channels.into_iter().map(|c| c.channel_id).collect()
        }
    };

    let mut reports = Vec::with_capacity(channel_ids.len());
    for channel_id in channel_ids {
        reports.push(drain_channel_media(store, fetcher, channel_id, requeue_failed).await?);
    }
    Ok(reports)
}
