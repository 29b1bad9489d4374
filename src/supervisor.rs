use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SupervisorConfig;
use crate::error::Result;

/// Cancels `token` on Ctrl-C or SIGTERM. The handler does nothing else; the
/// supervisor notices between runs.
pub fn install_signal_handlers(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("🛑 Shutdown requested, stopping after the current run");
        token.cancel();
    })
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!("⚠️  SIGTERM handler unavailable ({}), listening for Ctrl-C only", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorReport {
    pub attempts: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Reruns the training entrypoint until shutdown is requested.
///
/// Retryable failures and panics are logged and retried after
/// `failure_backoff`; a fatal error stops the loop and is returned.
pub struct Supervisor {
    restart_interval: Duration,
    failure_backoff: Duration,
    token: CancellationToken,
}

impl Supervisor {
    pub fn new(restart_interval: Duration, failure_backoff: Duration, token: CancellationToken) -> Self {
        Self {
            restart_interval,
            failure_backoff,
            token,
        }
    }

    pub fn from_config(config: &SupervisorConfig, token: CancellationToken) -> Self {
        Self::new(
            Duration::from_millis(config.restart_interval_ms),
            Duration::from_millis(config.failure_backoff_ms),
            token,
        )
    }

    pub async fn run<F, T>(&self, entrypoint: F) -> Result<SupervisorReport>
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let entrypoint = Arc::new(entrypoint);
        let mut report = SupervisorReport::default();

        while !self.token.is_cancelled() {
            if !self.pause(self.restart_interval).await {
                break;
            }

            report.attempts += 1;
            let entry = entrypoint.clone();
            match tokio::task::spawn_blocking(move || entry()).await {
                Ok(Ok(_)) => {
                    report.completed += 1;
                    info!("🏁 Training run {} completed", report.attempts);
                }
                Ok(Err(e)) if e.is_retryable() => {
                    report.failed += 1;
                    error!("💥 Training run {} failed: {}", report.attempts, e);
                    info!("⏳ Restarting in {:?}", self.failure_backoff);
                    if !self.pause(self.failure_backoff).await {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    error!("🚨 Fatal error in run {}, not restarting: {}", report.attempts, e);
                    return Err(e);
                }
                Err(join_error) => {
                    report.failed += 1;
                    error!("💥 Training run {} panicked: {}", report.attempts, join_error);
                    if !self.pause(self.failure_backoff).await {
                        break;
                    }
                }
            }
        }

        info!(
            "👋 Supervisor exiting after {} runs ({} completed, {} failed)",
            report.attempts, report.completed, report.failed
        );
        Ok(report)
    }

    /// Sleeps for `duration`; `false` if shutdown was requested meanwhile.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.token.is_cancelled(),
            _ = self.token.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn quick(token: CancellationToken) -> Supervisor {
        Supervisor::new(Duration::from_millis(1), Duration::from_millis(20), token)
    }

    #[tokio::test]
    async fn retries_failures_until_cancelled() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let entry_calls = calls.clone();
        let entry_token = token.clone();
        let entrypoint = move || -> Result<()> {
            let n = entry_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                return Err(Error::Transport(format!("injected failure {}", n)));
            }
            entry_token.cancel();
            Ok(())
        };

        let start = Instant::now();
        let report = quick(token).run(entrypoint).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            report,
            SupervisorReport {
                attempts: 3,
                completed: 1,
                failed: 2
            }
        );
        // Two failures, two backoffs.
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn successful_runs_are_repeated() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let entry_calls = calls.clone();
        let entry_token = token.clone();
        let report = quick(token)
            .run(move || -> Result<usize> {
                let n = entry_calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n == 4 {
                    entry_token.cancel();
                }
                Ok(n)
            })
            .await
            .unwrap();

        assert_eq!(report.completed, 4);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn panics_are_contained_and_retried() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let entry_calls = calls.clone();
        let entry_token = token.clone();
        let report = quick(token)
            .run(move || -> Result<()> {
                if entry_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("injected panic");
                }
                entry_token.cancel();
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(report.attempts, 2);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn fatal_errors_stop_the_loop() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let entry_calls = calls.clone();
        let err = quick(token.clone())
            .run(move || -> Result<()> {
                entry_calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Config("bad batch size".into()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Config(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_before_start_never_runs() {
        let token = CancellationToken::new();
        token.cancel();
        let report = quick(token).run(|| -> Result<()> { unreachable!() }).await.unwrap();
        assert_eq!(report.attempts, 0);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let token = CancellationToken::new();
        let supervisor = Supervisor::new(Duration::from_millis(1), Duration::from_secs(3600), token.clone());

        let entry_token = token.clone();
        let start = Instant::now();
        let report = supervisor
            .run(move || -> Result<()> {
                entry_token.cancel();
                Err(Error::Transport("peer vanished".into()))
            })
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        assert!(start.elapsed() < Duration::from_secs(60));
    }
}
