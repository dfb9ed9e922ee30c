//! Periodic supervisor loop.
//!
//! One long-lived task wakes on a fixed period and asks the registry to
//! sweep: idle sessions past their bound are stopped, persistent sessions
//! get a health probe and are removed on failure. Daemon shutdown ends the
//! loop before the next tick via the shared shutdown signal.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::sessions::{SessionManager, SweepEvent};

/// Fixed sweep period.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Spawn the supervisor loop. The task exits when `shutdown` fires.
pub fn spawn(manager: SessionManager, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    spawn_with_interval(
        manager,
        async move {
            let _ = shutdown.changed().await;
        },
        SWEEP_INTERVAL,
    )
}

/// Spawn with an explicit period (tests use a short one).
pub fn spawn_with_interval<F>(
    manager: SessionManager,
    shutdown: F,
    period: Duration,
) -> JoinHandle<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // The first tick fires immediately; the sweep should not.
        interval.tick().await;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for event in manager.sweep().await {
                        match event {
                            SweepEvent::IdleReaped(name) => {
                                info!("Supervisor reaped idle session: {name}");
                            }
                            SweepEvent::HealthFailed(name, reason) => {
                                info!("Supervisor removed unhealthy session {name}: {reason}");
                            }
                        }
                    }
                }
                () = &mut shutdown => {
                    info!("Supervisor loop stopped");
                    return;
                }
            }
        }
    })
}
