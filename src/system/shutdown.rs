//! Fleet-wide stop signal. Every long-running task subscribes before it is
//! spawned and winds down once anything broadcasts.
use tokio::sync::broadcast;
use tracing::{info, warn};

#[cfg(unix)]
use tokio::signal::unix::{Signal, SignalKind, signal};

pub type ShutdownSender = broadcast::Sender<()>;
pub type ShutdownReceiver = broadcast::Receiver<()>;

const SHUTDOWN_CHANNEL_CAPACITY: usize = 1;

/// Exit status used when a second signal cuts the graceful stop short.
const FORCED_EXIT_CODE: i32 = 130;

#[must_use]
pub fn shutdown_channel() -> (ShutdownSender, ShutdownReceiver) {
    broadcast::channel::<()>(SHUTDOWN_CHANNEL_CAPACITY)
}

/// Resolves once shutdown was broadcast or every sender is gone.
pub async fn wait_for_shutdown(shutdown_rx: &mut ShutdownReceiver) {
    loop {
        match shutdown_rx.recv().await {
            Ok(()) | Err(broadcast::error::RecvError::Closed) => return,
            Err(broadcast::error::RecvError::Lagged(_)) => {}
        }
    }
}

/// Broadcasts shutdown; returns false when nobody was listening anymore.
pub fn request_shutdown(shutdown_tx: &ShutdownSender) -> bool {
    shutdown_tx.send(()).is_ok()
}

struct Signals {
    #[cfg(unix)]
    terminate: Option<Signal>,
}

impl Signals {
    fn register() -> Self {
        #[cfg(unix)]
        {
            let terminate = match signal(SignalKind::terminate()) {
                Ok(terminate) => Some(terminate),
                Err(err) => {
                    warn!("SIGTERM handler unavailable: {}", err);
                    None
                }
            };
            Self { terminate }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }

    /// Waits for the next Ctrl-C or SIGTERM and names it.
    async fn next(&mut self) -> &'static str {
        #[cfg(unix)]
        {
            let terminate = async {
                match self.terminate.as_mut() {
                    Some(terminate) => {
                        terminate.recv().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "Ctrl-C",
                () = terminate => "SIGTERM",
            }
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
            "Ctrl-C"
        }
    }
}

/// The first Ctrl-C or SIGTERM starts a graceful stop (running tests are
/// stopped and workers terminated); a second one exits the process at once.
pub fn setup_signal_shutdown_handler(shutdown_tx: &ShutdownSender) -> tokio::task::JoinHandle<()> {
    let shutdown_tx = shutdown_tx.clone();
    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::spawn(async move {
        let mut signals = Signals::register();
        tokio::select! {
            () = wait_for_shutdown(&mut shutdown_rx) => {}
            name = signals.next() => {
                info!("{} received; stopping the fleet", name);
                if !request_shutdown(&shutdown_tx) {
                    return;
                }
            }
        }
        let name = signals.next().await;
        warn!("{} received again; exiting without cleanup", name);
        std::process::exit(FORCED_EXIT_CODE);
    })
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::time::Duration;

    use super::*;

    fn run_async_test<F>(future: F) -> Result<(), String>
    where
        F: Future<Output = Result<(), String>>,
    {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| err.to_string())?;
        runtime.block_on(future)
    }

    #[test]
    fn dropped_sender_counts_as_shutdown() -> Result<(), String> {
        run_async_test(async {
            let (shutdown_tx, mut shutdown_rx) = shutdown_channel();
            drop(shutdown_tx);
            tokio::time::timeout(Duration::from_secs(1), wait_for_shutdown(&mut shutdown_rx))
                .await
                .map_err(|_err| "wait_for_shutdown did not return".to_owned())
        })
    }

    #[test]
    fn every_subscriber_sees_one_request() -> Result<(), String> {
        run_async_test(async {
            let (shutdown_tx, mut first) = shutdown_channel();
            let mut second = shutdown_tx.subscribe();
            if !request_shutdown(&shutdown_tx) {
                return Err("request reported no listeners".to_owned());
            }
            for receiver in [&mut first, &mut second] {
                tokio::time::timeout(Duration::from_secs(1), wait_for_shutdown(receiver))
                    .await
                    .map_err(|_err| "subscriber missed the request".to_owned())?;
            }
            Ok(())
        })
    }

    #[test]
    fn request_without_listeners_reports_false() -> Result<(), String> {
        let (shutdown_tx, shutdown_rx) = shutdown_channel();
        drop(shutdown_rx);
        if request_shutdown(&shutdown_tx) {
            return Err("request reached a dropped receiver".to_owned());
        }
        Ok(())
    }
}
