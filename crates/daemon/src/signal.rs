//! Ctrl-C / SIGTERM listener.
//!
//! Workers are plain threads, so the listener gets its own single-threaded
//! runtime on a dedicated thread. The first signal cancels `token`.

use std::thread;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub fn cancel_on_signal(token: CancellationToken) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;

    thread::Builder::new()
        .name("geoscan-signal".to_string())
        .spawn(move || {
            runtime.block_on(async {
                tokio::select! {
                    _ = wait_for_signal() => {
                        info!("shutdown requested; pausing in-flight jobs");
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            })
        })
        .context("failed to spawn signal thread")?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable; listening for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
