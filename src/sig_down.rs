//! Process signal handling.
//!
//! [`SigDown`] listens for SIGINT and SIGTERM and cancels a shared
//! [`CancellationToken`] on the first one received. Long-running tasks and the
//! HTTP server observe clones of that token to stop gracefully.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct SigDown {
    cancellation_token: CancellationToken,
    _listener: JoinHandle<()>,
}

impl SigDown {
    pub fn try_new() -> Result<Self, std::io::Error> {
        let cancellation_token = CancellationToken::new();
        let signal = shutdown_signal()?;

        let token = cancellation_token.clone();
        let listener = tokio::spawn(async move {
            signal.await;
            tracing::info!("Shutdown signal received");
            token.cancel();
        });

        Ok(Self {
            cancellation_token,
            _listener: listener,
        })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }
}

#[cfg(unix)]
fn shutdown_signal() -> Result<impl Future<Output = ()> + Send + 'static, std::io::Error> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> Result<impl Future<Output = ()> + Send + 'static, std::io::Error> {
    Ok(async {
        let _ = tokio::signal::ctrl_c().await;
    })
}
