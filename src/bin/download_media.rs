use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use tg_archive::config;
use tg_archive::db::{self, SqliteSession};
use tg_archive::export::ExportFetcher;
use tg_archive::media;
use tg_archive::shutdown;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Claim queued media and copy it from the export into the archive"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Export directory the queued media paths are relative to
    #[arg(long)]
    export: PathBuf,

    /// Only drain this channel's queue
    #[arg(long)]
    channel: Option<i64>,

    /// Drop failed downloads instead of putting them back on the queue
    #[arg(long)]
    no_requeue: bool,
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

    let pool = db::init_pool(&cfg.database_url(), &cfg.database).await?;
    db::run_migrations(&pool).await?;

    let fetcher = ExportFetcher::new(&args.export, cfg.media_dir());
    let requeue = cfg.media.requeue_failed && !args.no_requeue;
    let mut session = SqliteSession::new(pool.clone()).with_cancellation(shutdown::cancel_on_ctrl_c());

    let reports = media::drain_all(&mut session, &fetcher, args.channel, requeue).await?;
    let fetched: usize = reports.iter().map(|r| r.fetched).sum();
    let failed: usize = reports.iter().map(|r| r.failed).sum();
    info!(channels = reports.len(), fetched, failed, "media download finished");

    drop(session);
    pool.close().await;
    Ok(())
}
