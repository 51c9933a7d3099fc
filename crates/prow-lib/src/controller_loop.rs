//! Periodic reconciliation loop
//!
//! Drives a [`Reconciler`] once per tick. A pass in flight always finishes
//! before shutdown is honoured, and a slow pass delays the next tick rather
//! than causing a burst of catch-up passes.

use crate::health::HealthRegistry;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

/// One controller's periodic unit of work
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Name used for logs and health tracking
    fn name(&self) -> &'static str;

    /// Time between passes; re-read after every pass
    fn interval(&self) -> Duration;

    async fn reconcile(&self) -> Result<()>;
}

pub struct ControllerLoop {
    reconciler: Arc<dyn Reconciler>,
    health: Option<HealthRegistry>,
}

fn ticker(period: Duration, immediate: bool) -> Interval {
    let mut ticker = if immediate {
        interval(period)
    } else {
        interval_at(Instant::now() + period, period)
    };
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

impl ControllerLoop {
    pub fn new(reconciler: Arc<dyn Reconciler>) -> Self {
        Self {
            reconciler,
            health: None,
        }
    }

    /// Report each pass outcome to `health`
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Run a single pass
    pub async fn run_once(&self) -> Result<()> {
        let name = self.reconciler.name();
        let start = Instant::now();
        let result = self.reconciler.reconcile().await;
        let elapsed = start.elapsed();

        match &result {
            Ok(()) => debug!(
                controller = name,
                elapsed_ms = elapsed.as_millis() as u64,
                "Reconciliation pass finished"
            ),
            Err(e) => error!(
                controller = name,
                elapsed_ms = elapsed.as_millis() as u64,
                error = %format!("{:#}", e),
                "Reconciliation pass failed"
            ),
        }

        if let Some(health) = &self.health {
            health.record_pass(name, &result).await;
        }
        result
    }

    /// Run passes until a shutdown signal arrives
    ///
    /// The first pass starts immediately.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let name = self.reconciler.name();
        let mut period = self.reconciler.interval();
        info!(
            controller = name,
            interval_secs = period.as_secs_f64(),
            "Starting controller loop"
        );

        let mut ticks = ticker(period, true);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    info!(controller = name, "Shutting down controller loop");
                    break;
                }
                _ = ticks.tick() => {
                    // Errors are logged and reported to health; the loop keeps going
                    let _ = self.run_once().await;

                    let next = self.reconciler.interval();
                    if next != period {
                        info!(
                            controller = name,
                            old_secs = period.as_secs_f64(),
                            new_secs = next.as_secs_f64(),
                            "Controller interval changed"
                        );
                        period = next;
                        ticks = ticker(period, false);
                    }
                }
            }
        }
    }
}

/// Resolve when the process receives SIGINT or SIGTERM
pub async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT received",
        _ = terminate => "SIGTERM received",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{components, ComponentStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        passes: AtomicUsize,
        fail: bool,
        pass_duration: Duration,
    }

    impl Counting {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                passes: AtomicUsize::new(0),
                fail,
                pass_duration: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl Reconciler for Counting {
        fn name(&self) -> &'static str {
            components::SINKER
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(20)
        }

        async fn reconcile(&self) -> Result<()> {
            tokio::time::sleep(self.pass_duration).await;
            self.passes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("cluster unreachable");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_run_once_reports_health() {
        let health = HealthRegistry::new();
        let failing = Counting::new(true);
        let controller = ControllerLoop::new(failing.clone()).with_health(health.clone());

        assert!(controller.run_once().await.is_err());
        assert_eq!(failing.passes.load(Ordering::SeqCst), 1);
        assert_eq!(
            health.health().await.components[components::SINKER].status,
            ComponentStatus::Degraded
        );
    }

    #[tokio::test]
    async fn test_loop_keeps_running_after_errors() {
        let failing = Counting::new(true);
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(ControllerLoop::new(failing.clone()).run(rx));

        tokio::time::sleep(Duration::from_millis(110)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();

        assert!(failing.passes.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_pass_in_flight() {
        let slow = Arc::new(Counting {
            passes: AtomicUsize::new(0),
            fail: false,
            pass_duration: Duration::from_millis(80),
        });
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(ControllerLoop::new(slow.clone()).run(rx));

        // Signal while the first pass is still sleeping
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();

        assert_eq!(slow.passes.load(Ordering::SeqCst), 1);
    }
}
