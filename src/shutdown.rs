use tokio::sync::watch;
use tracing::warn;

/// A receiver that flips to `true` on Ctrl-C. Sessions holding it roll back
/// instead of committing once the flag is set.
pub fn cancel_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; the open session will be rolled back");
            let _ = tx.send(true);
        }
    });
    rx
}
