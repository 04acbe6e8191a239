//! # clock
//!
//! Clock synchronization state shared between the GPS task (satellite time)
//! and the protocol engine (server time).
//!
//! While `synchronized` is false no non-identification server packets are
//! honored; the engine closes the session early, applies the pending
//! adjustment, then rewrites queued event timestamps by the same delta.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

/// Clock may be disciplined from server EOT/Auth time.
pub const CLOCK_SYNC_INTERNET: u32 = 0x01;
/// Clock may be disciplined from GPS RMC time.
pub const CLOCK_SYNC_GPS: u32 = 0x80;

#[derive(Debug, Default)]
struct ClockState {
    server_time: i64,
    /// Local wall clock captured when `server_time` was received.
    local_at_receipt: i64,
    need_adjust: bool,
}

pub struct ClockSync {
    /// Bitmask of enabled sync sources.
    pub source: u32,
    /// Seconds of disagreement tolerated before an adjustment is scheduled.
    pub delta: i64,
    state: Mutex<ClockState>,
    synchronized: AtomicBool,
    /// Wall-clock seconds at process start, shifted with every clock jump so
    /// monotonic ages keep converting to stable UTC values.
    startup_epoch: AtomicI64,
    /// One-shot flag raised after a jump; consumed by tag-reader producers
    /// that stamp their own queues.
    time_adjusted: AtomicBool,
}

pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl ClockSync {
    pub fn new(source: u32, delta: i64) -> Self {
        Self {
            source,
            delta,
            state: Mutex::new(ClockState::default()),
            // Server-synchronized sources start unsynchronized and gate the
            // first session on an Auth/EOT exchange.
            synchronized: AtomicBool::new(source & CLOCK_SYNC_INTERNET == 0),
            startup_epoch: AtomicI64::new(now_secs()),
            time_adjusted: AtomicBool::new(false),
        }
    }

    pub fn is_synchronized(&self) -> bool {
        self.synchronized.load(Ordering::Relaxed)
    }

    /// Record a server-supplied UTC second count. Schedules an adjustment
    /// when the disagreement exceeds the configured delta.
    pub fn note_server_time(&self, server_time: i64) {
        if self.source & CLOCK_SYNC_INTERNET == 0 {
            return;
        }
        let mut st = self.state.lock().unwrap();
        st.server_time = server_time;
        st.local_at_receipt = now_secs();
        let diff = server_time - st.local_at_receipt;
        if diff.abs() > self.delta {
            st.need_adjust = true;
        } else {
            self.synchronized.store(true, Ordering::Relaxed);
        }
    }

    pub fn needs_adjust(&self) -> bool {
        self.state.lock().unwrap().need_adjust
    }

    /// Apply a pending server adjustment after session close. Returns the
    /// delta applied to the system clock, if any.
    pub fn apply_pending(&self) -> Option<i64> {
        let mut st = self.state.lock().unwrap();
        if !st.need_adjust {
            return None;
        }
        st.need_adjust = false;
        let diff = st.server_time - st.local_at_receipt;
        if diff.abs() <= self.delta {
            self.synchronized.store(true, Ordering::Relaxed);
            return None;
        }
        // Re-anchor: the session may have taken a while since receipt.
        let target = st.server_time + (now_secs() - st.local_at_receipt);
        drop(st);
        match self.set_system_clock(target) {
            Ok(()) => {
                self.synchronized.store(true, Ordering::Relaxed);
                info!("clock synchronized with server ({diff:+}s)");
                Some(diff)
            }
            Err(e) => {
                warn!("failed to set system clock: {e}");
                None
            }
        }
    }

    /// GPS-sourced synchronization, called directly by the GPS task.
    pub fn sync_from_gps(&self, fixtime: i64) -> Option<i64> {
        if self.source & CLOCK_SYNC_GPS == 0 {
            return None;
        }
        let diff = fixtime - now_secs();
        match self.set_system_clock(fixtime) {
            Ok(()) => {
                self.synchronized.store(true, Ordering::Relaxed);
                info!("clock synchronized from GPS ({diff:+}s)");
                Some(diff)
            }
            Err(e) => {
                warn!("failed to set system clock: {e}");
                None
            }
        }
    }

    /// Set the realtime clock and shift the startup anchor by the same
    /// amount so elapsed-time conversions stay stable across the jump.
    fn set_system_clock(&self, new_time: i64) -> std::io::Result<()> {
        let before = now_secs();
        let ts = libc::timespec {
            tv_sec: new_time as libc::time_t,
            tv_nsec: 10_000_000,
        };
        // SAFETY: plain syscall with a stack-allocated timespec.
        let rc = unsafe { libc::clock_settime(libc::CLOCK_REALTIME, &ts) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        self.startup_epoch
            .fetch_add(new_time - before, Ordering::Relaxed);
        self.time_adjusted.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Wall-clock second count corresponding to process start.
    pub fn startup_epoch(&self) -> i64 {
        self.startup_epoch.load(Ordering::Relaxed)
    }

    /// One-shot: true exactly once after each clock jump.
    pub fn take_time_adjusted(&self) -> bool {
        self.time_adjusted.swap(false, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_server_delta_synchronizes_without_adjust() {
        let c = ClockSync::new(CLOCK_SYNC_INTERNET, 10);
        assert!(!c.is_synchronized());
        c.note_server_time(now_secs() + 3);
        assert!(!c.needs_adjust());
        assert!(c.is_synchronized());
    }

    #[test]
    fn large_server_delta_schedules_adjust() {
        let c = ClockSync::new(CLOCK_SYNC_INTERNET, 10);
        c.note_server_time(now_secs() + 60);
        assert!(c.needs_adjust());
        assert!(!c.is_synchronized());
    }

    #[test]
    fn gps_only_source_ignores_server_time() {
        let c = ClockSync::new(CLOCK_SYNC_GPS, 10);
        assert!(c.is_synchronized());
        c.note_server_time(now_secs() + 600);
        assert!(!c.needs_adjust());
    }
}
