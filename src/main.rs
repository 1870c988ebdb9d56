use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

use tg_archive::config;
use tg_archive::db::{self, SqliteSession};
use tg_archive::export::ExportSource;
use tg_archive::ingest::{self, IngestOptions};
use tg_archive::shutdown;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Ingest chats, messages and participants from a chat export into the archive"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Export directory containing result.json
    #[arg(long)]
    export: PathBuf,

    /// Only ingest these channel ids (repeatable)
    #[arg(long = "channel")]
    channels: Vec<i64>,

    /// Record participants only; messages are left untouched
    #[arg(long)]
    get_participants: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = cfg.database_url();
    let pool = db::init_pool(&database_url, &cfg.database).await?;
    db::run_migrations(&pool).await?;

    let source = ExportSource::open(&args.export).await?;
    let mut session = SqliteSession::new(pool.clone()).with_cancellation(shutdown::cancel_on_ctrl_c());
    info!(session = %session.id(), database_url = %database_url, "starting ingestion");

    let opts = IngestOptions {
        batch_size: cfg.ingest.batch_size,
        channels: args.channels,
        participants_only: args.get_participants,
    };
    let summary = ingest::ingest_all(&mut session, &source, &opts).await?;

    let messages: usize = summary.reports.iter().map(|r| r.messages).sum();
    let media: usize = summary.reports.iter().map(|r| r.media_queued).sum();
    info!(
        channels = summary.reports.len(),
        messages,
        media_queued = media,
        "ingestion finished"
    );
    if !summary.failed.is_empty() {
        warn!(failed = ?summary.failed, "some channels failed; rerun to resume them");
    }

    drop(session);
    pool.close().await;
    Ok(())
}
