//! # watchdog
//!
//! Hardware-agnostic stall watchdog.
//!
//! Components register callbacks; the watchdog task ticks them on a fixed
//! period and a callback returning `true` latches a stall, which asks the
//! supervisor for a reboot. The tick period is part of the contract: the
//! protocol silence limit is expressed in ticks of this clock.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::supervisor::ShutdownCause;

/// One tick every ten seconds; `COMM_MAX_DELAY` hours * 360 ticks.
pub const WATCHDOG_TICK: Duration = Duration::from_secs(10);

type StallCheck = Box<dyn Fn() -> bool + Send + Sync>;

#[derive(Default)]
pub struct Watchdog {
    checks: Mutex<Vec<(String, StallCheck)>>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, check: impl Fn() -> bool + Send + Sync + 'static) {
        self.checks
            .lock()
            .unwrap()
            .push((name.to_string(), Box::new(check)));
        info!("watchdog: registered '{name}'");
    }

    /// Tick loop. A latched stall requests a reboot through the supervisor
    /// and keeps ticking; the supervisor decides when to act.
    pub async fn run(
        self: std::sync::Arc<Self>,
        reboot: mpsc::Sender<ShutdownCause>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(WATCHDOG_TICK) => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            let stalled: Vec<String> = {
                let checks = self.checks.lock().unwrap();
                checks
                    .iter()
                    .filter(|(_, f)| f())
                    .map(|(n, _)| n.clone())
                    .collect()
            };
            for name in stalled {
                warn!("watchdog: '{name}' latched a stall, requesting reboot");
                let _ = reboot.try_send(ShutdownCause::Watchdog(name));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn stall_requests_reboot() {
        let wd = Arc::new(Watchdog::new());
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        // Stalls on the third tick.
        wd.register("test", move || c.fetch_add(1, Ordering::Relaxed) + 1 >= 3);

        let (tx, mut rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(wd.run(tx, stop_rx));

        tokio::time::advance(WATCHDOG_TICK * 3 + Duration::from_millis(1)).await;
        let cause = rx.recv().await.unwrap();
        assert!(matches!(cause, ShutdownCause::Watchdog(ref n) if n == "test"));

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
