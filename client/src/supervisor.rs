//! # supervisor
//!
//! Connectivity supervisor.
//!
//! Owns the wireless link: brings it up at boot, probes it when the
//! protocol engine reports trouble, tears it down and rebuilds it on an
//! escalating idle schedule, and gates every session on link state through
//! [`LinkState`]. Reboot requests from the watchdog and install-complete
//! signals from the updater funnel in here, where the shutdown cause is
//! persisted for the next boot to report.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::clock::now_secs;
use crate::events::{Diagnostic, EventSink, RebootReason};
use crate::props::*;
use crate::queue::EventQueue;

/// Idle before the first three rebuild attempts, seconds.
const NETWORK_TERMINATE_IDLE: u64 = 180;
/// Pause between probe rounds, seconds.
const NETWORK_BREAK_PERIOD: u64 = 10;
const RESOLV_CONF: &str = "/etc/resolv.conf";

// ── Link state ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkHealth {
    Init,
    Up,
    Checking,
    Down,
    Rebuilding,
    Terminating,
}

/// Shared link-state handle. The supervisor is the only writer; the
/// protocol engine reads, waits, and files reports through it.
pub struct LinkState {
    tx: watch::Sender<LinkHealth>,
    /// Protocol engine nudges the supervisor to look at the link.
    pub down_notify: Notify,
    terminate: AtomicBool,
    down_occurred: AtomicBool,
}

impl LinkState {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(LinkHealth::Init);
        Self {
            tx,
            down_notify: Notify::new(),
            terminate: AtomicBool::new(false),
            down_occurred: AtomicBool::new(false),
        }
    }

    pub fn health(&self) -> LinkHealth {
        *self.tx.borrow()
    }

    pub fn is_up(&self) -> bool {
        self.health() == LinkHealth::Up
    }

    pub fn set(&self, health: LinkHealth) {
        self.tx.send_replace(health);
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkHealth> {
        self.tx.subscribe()
    }

    /// Protocol-side report: sessions are failing, go probe the link.
    pub fn report_down(&self) {
        if self.is_up() {
            self.set(LinkHealth::Checking);
        }
        self.down_notify.notify_one();
    }

    /// Ask the supervisor to tear the link down (power saving, URL
    /// rotation exhausted).
    pub fn request_terminate(&self) {
        self.terminate.store(true, Ordering::Relaxed);
        self.down_notify.notify_one();
    }

    pub fn take_terminate(&self) -> bool {
        self.terminate.swap(false, Ordering::Relaxed)
    }

    /// Whether the last probe actually found the link dead (as opposed to
    /// the server merely being unresponsive).
    pub fn down_occurred(&self) -> bool {
        self.down_occurred.load(Ordering::Relaxed)
    }

    fn set_down_occurred(&self, v: bool) {
        self.down_occurred.store(v, Ordering::Relaxed);
    }

    /// Block until the link is up, preserving queued events on each idle
    /// period while it is not. Returns false on shutdown.
    pub async fn wait_up_preserving(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        period: Duration,
        preserve: bool,
        queue: &EventQueue,
    ) -> bool {
        loop {
            if self.is_up() {
                return true;
            }
            let mut rx = self.subscribe();
            tokio::select! {
                r = timeout(period, rx.changed()) => {
                    if r.is_err() && preserve {
                        let _ = queue.preserve_all();
                    }
                }
                _ = shutdown.changed() => return false,
            }
        }
    }
}

// ── Shutdown cause record ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownCause {
    Watchdog(String),
    UpdateReady,
    Signal,
}

impl ShutdownCause {
    pub fn label(&self) -> String {
        match self {
            Self::Watchdog(name) => format!("watchdog:{name}"),
            Self::UpdateReady => "update".to_string(),
            Self::Signal => "signal".to_string(),
        }
    }
}

/// Persisted across restarts so the next boot can report why it happened.
#[derive(Debug, Serialize, Deserialize)]
pub struct BootCause {
    pub cause: String,
    pub timestamp: i64,
}

pub fn write_shutdown_cause(path: &Path, cause: &ShutdownCause) {
    let record = BootCause {
        cause: cause.label(),
        timestamp: now_secs(),
    };
    match serde_json::to_string(&record) {
        Ok(json) => {
            if let Err(e) = std::fs::write(path, json) {
                warn!("writing shutdown cause: {e}");
            }
        }
        Err(e) => warn!("serializing shutdown cause: {e}"),
    }
}

/// Read and remove the previous shutdown cause, if one was left behind.
pub fn take_boot_cause(path: &Path) -> Option<BootCause> {
    let text = std::fs::read_to_string(path).ok()?;
    let _ = std::fs::remove_file(path);
    serde_json::from_str(&text).ok()
}

// ── Wireless link controller ──────────────────────────────────────────────────

/// Seam to the platform's wireless control layer. Establish/terminate run
/// the configured commands under the stall ceiling; a command that blows
/// the ceiling latches the stuck flag the network watchdog watches.
pub struct LinkController {
    props: Arc<PropertyStore>,
    pub stuck: Arc<AtomicBool>,
}

impl LinkController {
    pub fn new(props: Arc<PropertyStore>) -> Self {
        Self {
            props,
            stuck: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn establish(&self) -> bool {
        info!("start wireless link");
        let cmd = self.props.get_string(PROP_STATE_NETWORK_UP_CMD, "");
        let ceiling = self.props.get_u32(PROP_STATE_STUCK_TIMEOUT, 900) as u64;
        self.run_command(&cmd, ceiling).await
    }

    pub async fn terminate(&self) -> bool {
        info!("terminate wireless link");
        let cmd = self.props.get_string(PROP_STATE_NETWORK_DOWN_CMD, "");
        let ceiling = self.props.get_u32(PROP_STATE_CHECKNETWORK_TIMEOUT, 79) as u64;
        self.run_command(&cmd, ceiling).await
    }

    async fn run_command(&self, cmd: &str, ceiling_secs: u64) -> bool {
        if cmd.is_empty() {
            // No platform command configured (wired/dev setups).
            return true;
        }
        let mut command = tokio::process::Command::new("sh");
        command.arg("-c").arg(cmd).kill_on_drop(true);
        match timeout(Duration::from_secs(ceiling_secs), command.status()).await {
            Ok(Ok(status)) if status.success() => {
                self.stuck.store(false, Ordering::Relaxed);
                true
            }
            Ok(Ok(status)) => {
                warn!("link command exited with {status}");
                false
            }
            Ok(Err(e)) => {
                warn!("link command failed to run: {e}");
                false
            }
            Err(_) => {
                // The library call wedged; the watchdog counts these.
                warn!("link command exceeded {ceiling_secs}s ceiling");
                self.stuck.store(true, Ordering::Relaxed);
                false
            }
        }
    }
}

// ── Link probe ────────────────────────────────────────────────────────────────

fn resolver_nameservers(path: &Path) -> Vec<String> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    text.lines()
        .filter_map(|l| {
            let l = l.trim();
            l.strip_prefix("nameserver")
                .map(|rest| rest.trim().to_string())
        })
        .filter(|s| !s.is_empty())
        .collect()
}

/// Minimal DNS query for the root NS record; any well-formed reply proves
/// the path through the resolver is alive.
fn dns_probe_query(id: u16) -> Vec<u8> {
    let mut q = Vec::with_capacity(17);
    q.extend_from_slice(&id.to_be_bytes());
    q.extend_from_slice(&[0x01, 0x00]); // recursion desired
    q.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 0]);
    q.push(0); // root name
    q.extend_from_slice(&[0, 2, 0, 1]); // NS IN
    q
}

async fn probe_nameserver(ns: &str, id: u16, ceiling: Duration) -> bool {
    let Ok(sock) = tokio::net::UdpSocket::bind("0.0.0.0:0").await else {
        return false;
    };
    if sock.connect((ns, 53)).await.is_err() {
        return false;
    }
    if sock.send(&dns_probe_query(id)).await.is_err() {
        return false;
    }
    let mut buf = [0u8; 512];
    match timeout(ceiling, sock.recv(&mut buf)).await {
        Ok(Ok(n)) => n >= 12 && buf[..2] == id.to_be_bytes(),
        _ => false,
    }
}

// ── Supervisor ────────────────────────────────────────────────────────────────

pub struct Supervisor {
    pub props: Arc<PropertyStore>,
    pub sink: EventSink,
    pub link: Arc<LinkState>,
    pub controller: LinkController,
    pub queue: Arc<EventQueue>,
    /// Consecutive wireless-library stalls observed by the watchdog.
    pub stuck_ticks: Arc<AtomicU32>,
}

impl Supervisor {
    /// Watchdog callback watching the wireless library. Three consecutive
    /// stalled ticks force a reboot.
    pub fn network_monitor(&self) -> impl Fn() -> bool + Send + Sync + 'static {
        let stuck = self.controller.stuck.clone();
        let ticks = self.stuck_ticks.clone();
        let sink = self.sink.clone();
        move || {
            if stuck.load(Ordering::Relaxed) {
                let n = ticks.fetch_add(1, Ordering::Relaxed) + 1;
                sink.diagnostic(Diagnostic::LibStuck(true));
                if n >= 3 {
                    sink.diagnostic(Diagnostic::ClientReboot(RebootReason::LibraryStuck));
                    return true;
                }
            } else {
                ticks.store(0, Ordering::Relaxed);
            }
            false
        }
    }

    /// Probe the link through every resolver nameserver. Returns true when
    /// the link is down (no nameserver answered).
    pub async fn check_network_down(&self) -> bool {
        let ceiling =
            Duration::from_secs(self.props.get_u32(PROP_STATE_CHECKNETWORK_TIMEOUT, 79) as u64);
        let servers = resolver_nameservers(Path::new(RESOLV_CONF));
        if servers.is_empty() {
            warn!("no resolver nameservers found, treating link as down");
            return true;
        }
        let per_server = ceiling / servers.len() as u32;
        for (i, ns) in servers.iter().enumerate() {
            if probe_nameserver(ns, 0x4447u16.wrapping_add(i as u16), per_server).await {
                self.controller.stuck.store(false, Ordering::Relaxed);
                return false;
            }
        }
        true
    }

    /// Main supervisor loop. Returns the shutdown cause once the process
    /// should come down.
    pub async fn run(
        mut self,
        mut reboot_rx: mpsc::Receiver<ShutdownCause>,
        mut shutdown: watch::Receiver<bool>,
    ) -> ShutdownCause {
        let power_saving = self.props.get_bool(PROP_COMM_POWER_SAVING, false);
        let min_rate = self.props.get_u32(PROP_COMM_MIN_XMIT_RATE, 60).max(1) as u64;
        let down_idle =
            self.props.get_u32_at(PROP_COMM_NET_IDLE_MINUTES, 0, 30) as u64 * 60;
        let mut link_down_count: u32 = 0;

        // Boot-time establishment. A failure falls straight into the
        // rebuild ladder below.
        let mut pending_rebuild = false;
        if self.link.health() == LinkHealth::Init {
            if self.controller.establish().await {
                self.link.set(LinkHealth::Up);
            } else {
                self.link.set(LinkHealth::Down);
                self.link.set_down_occurred(true);
                pending_rebuild = true;
            }
        }

        'outer: loop {
            if !pending_rebuild {
                // Housekeeping wait until the engine reports link trouble.
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(min_rate)) => {
                            self.props.maintain();
                        }
                        _ = self.link.down_notify.notified() => break,
                        cause = reboot_rx.recv() => {
                            return self.terminating(cause.unwrap_or(ShutdownCause::Signal)).await;
                        }
                        _ = shutdown.changed() => {
                            return self.terminating(ShutdownCause::Signal).await;
                        }
                    }
                }
                if *shutdown.borrow() {
                    return self.terminating(ShutdownCause::Signal).await;
                }

                // Explicit teardown request. Under power saving the link
                // stays parked until the engine asks for it again.
                if self.link.take_terminate() {
                    self.link.set(LinkHealth::Terminating);
                    self.controller.terminate().await;
                    self.link.set(LinkHealth::Down);
                    if power_saving {
                        continue 'outer;
                    }
                }
            }
            pending_rebuild = false;

            let mut link_down;
            if power_saving || self.link.health() == LinkHealth::Down {
                // Known down (power-saving park or failed boot): rebuild.
                self.link.set(LinkHealth::Down);
                self.link.set_down_occurred(true);
                link_down = true;
            } else {
                self.link.set(LinkHealth::Checking);
                self.sink.diagnostic(Diagnostic::CnnctCheck);
                link_down = self.check_network_down().await;
                if link_down {
                    info!("network is down");
                    self.sink.diagnostic(Diagnostic::CnnctDown(true));
                    self.link.set(LinkHealth::Down);
                    self.link.set_down_occurred(true);
                    tokio::time::sleep(Duration::from_secs(NETWORK_BREAK_PERIOD)).await;
                } else {
                    info!("network is alive");
                    self.sink.diagnostic(Diagnostic::CnnctDown(false));
                    self.link.set_down_occurred(false);
                    self.link.set(LinkHealth::Up);
                    continue;
                }
            }

            // Rebuild ladder: short idles for the first three outages, then
            // the long configured idle. Power saving rebuilds immediately.
            while link_down {
                if *shutdown.borrow() {
                    return self.terminating(ShutdownCause::Signal).await;
                }
                if !power_saving {
                    self.controller.terminate().await;
                    let idle = if link_down_count < 3 {
                        NETWORK_TERMINATE_IDLE
                    } else {
                        down_idle
                    };
                    link_down_count += 1;
                    info!("network is down, rebuilding in {} min", idle / 60);
                    self.sink.diagnostic(Diagnostic::Message(format!(
                        "Connection outage, rebuild in {} min",
                        idle / 60
                    )));
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(idle)) => {}
                        cause = reboot_rx.recv() => {
                            return self.terminating(cause.unwrap_or(ShutdownCause::Signal)).await;
                        }
                        _ = shutdown.changed() => {
                            return self.terminating(ShutdownCause::Signal).await;
                        }
                    }
                }
                self.sink.diagnostic(Diagnostic::CnnctRebuilt(false));
                self.link.set(LinkHealth::Rebuilding);
                link_down = !self.controller.establish().await;
                if link_down {
                    self.sink.diagnostic(Diagnostic::CnnctDown(true));
                } else {
                    self.sink.diagnostic(Diagnostic::CnnctRebuilt(true));
                    link_down_count = 0;
                }
            }
            self.link.set(LinkHealth::Up);
        }
    }

    /// Reverse-order teardown: preserve events, drop the link, record the
    /// cause for the next boot.
    async fn terminating(&mut self, cause: ShutdownCause) -> ShutdownCause {
        info!("supervisor terminating: {}", cause.label());
        self.link.set(LinkHealth::Terminating);
        let _ = self.queue.preserve_all();
        self.controller.terminate().await;
        cause
    }
}

pub fn shutdown_cause_path(cache_dir: &Path) -> PathBuf {
    cache_dir.join("shutdown.cause")
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_state_transitions_and_reports() {
        let link = LinkState::new();
        assert_eq!(link.health(), LinkHealth::Init);
        link.set(LinkHealth::Up);
        assert!(link.is_up());
        link.report_down();
        assert_eq!(link.health(), LinkHealth::Checking);
        assert!(!link.is_up());
    }

    #[test]
    fn terminate_request_is_one_shot() {
        let link = LinkState::new();
        link.request_terminate();
        assert!(link.take_terminate());
        assert!(!link.take_terminate());
    }

    #[test]
    fn boot_cause_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = shutdown_cause_path(dir.path());
        write_shutdown_cause(&path, &ShutdownCause::Watchdog("protocol".into()));
        let cause = take_boot_cause(&path).unwrap();
        assert_eq!(cause.cause, "watchdog:protocol");
        // Consumed on read.
        assert!(take_boot_cause(&path).is_none());
    }

    #[test]
    fn resolv_conf_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        std::fs::write(&path, "# comment\nnameserver 10.0.0.1\nsearch lan\nnameserver 8.8.8.8\n")
            .unwrap();
        assert_eq!(resolver_nameservers(&path), vec!["10.0.0.1", "8.8.8.8"]);
    }

    #[test]
    fn dns_probe_query_is_wellformed() {
        let q = dns_probe_query(0x1234);
        assert_eq!(q.len(), 17);
        assert_eq!(&q[..2], &[0x12, 0x34]);
        assert_eq!(q[12], 0); // root label
        assert_eq!(&q[13..], &[0, 2, 0, 1]);
    }

    #[tokio::test]
    async fn wait_up_preserving_returns_on_up() {
        let link = Arc::new(LinkState::new());
        link.set(LinkHealth::Down);
        let queue = Arc::new(EventQueue::new(
            64,
            std::env::temp_dir().join("dmtp-sup-test.bak"),
        ));
        let (_tx, mut shutdown) = watch::channel(false);
        let l = link.clone();
        let waiter = tokio::spawn(async move {
            l.wait_up_preserving(&mut shutdown, Duration::from_secs(30), false, &queue)
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        link.set(LinkHealth::Up);
        assert!(waiter.await.unwrap());
    }
}
