use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use tg_archive::config;
use tg_archive::db::{self, ArchiveStore, SqliteSession};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Print archived messages or channel cursors as JSON lines"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// SQL LIKE pattern; prints distinct matching message bodies
    #[arg(long)]
    pattern: Option<String>,

    /// Print every channel with its cursor instead of messages
    #[arg(long)]
    cursors: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;

    let pool = db::init_pool(&cfg.database_url(), &cfg.database).await?;
    db::run_migrations(&pool).await?;
    let mut session = SqliteSession::new(pool.clone());

    if args.cursors {
        for channel in session.list_channels().await? {
            println!("{}", serde_json::to_string(&channel)?);
        }
    } else if let Some(pattern) = args.pattern.as_deref() {
        for body in session.get_messages_with_pattern(pattern).await? {
            println!("{}", serde_json::to_string(&body)?);
        }
    } else {
        for record in session.get_all_messages().await? {
            println!("{}", serde_json::to_string(&record)?);
        }
    }

    // Read-only session; nothing to keep.
    session.rollback_changes().await;
    pool.close().await;
    Ok(())
}
