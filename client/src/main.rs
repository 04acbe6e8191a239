//! dmtp-client: embedded telematics client.
//!
//! Gathers GPS and sensor-tag events on the vehicle, persists them across
//! power and connectivity loss, and delivers them to the fleet server over
//! the DMTP protocol. Runs as a set of long-lived Tokio tasks: GPS
//! acquisition, motion sampling, the protocol engine, the stall watchdog
//! and the connectivity supervisor.

mod clock;
mod events;
mod gps;
mod motion;
mod nmea;
mod props;
mod protocol;
mod queue;
mod supervisor;
mod transport;
mod updater;
mod uploader;
mod watchdog;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dmtp_codec::packet::PacketPriority;
use dmtp_codec::status::status;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{error, info, warn};

use clock::{ClockSync, CLOCK_SYNC_GPS};
use events::EventSink;
use gps::{GpsShared, GpsTask};
use motion::MotionChecker;
use props::*;
use protocol::{ProtocolEngine, PROTO_VERSION_TCP, PROTO_VERSION_UDP};
use queue::EventQueue;
use supervisor::{shutdown_cause_path, LinkController, LinkState, ShutdownCause, Supervisor};
use updater::{UpdateRequest, Updater, UPDATE_STAT_FILE};
use watchdog::Watchdog;

const EVENT_QUEUE_SIZE: usize = 1024;
const EVENT_BACKING_FILE: &str = "events.bak";
const CLIENT_LOG_FILE: &str = "dmtp-client.log";

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "dmtp-client", version, about = "Fleet telematics DMTP client")]
struct Args {
    /// Property file loaded over the cached configuration
    #[arg(long = "pfile")]
    pfile: Option<PathBuf>,
    /// Print the effective properties and exit
    #[arg(long = "pp")]
    print_properties: bool,
    /// Verbose logging
    #[arg(long)]
    debug: bool,
    /// Errors only
    #[arg(long)]
    silent: bool,
    /// Log filter directive (overrides --debug/--silent)
    #[arg(long = "log")]
    log: Option<String>,
    /// GPS port and optional baud rate: --gps <port> [bps]
    #[arg(long = "gps", num_args = 1..=2)]
    gps: Option<Vec<String>>,
    /// TCP server: --tcp <host> [port]
    #[arg(long = "tcp", num_args = 1..=2)]
    tcp: Option<Vec<String>>,
    /// UDP server: --udp <host> [port]
    #[arg(long = "udp", num_args = 1..=2)]
    udp: Option<Vec<String>>,
    /// Writable state directory (property cache, event backing file)
    #[arg(long = "cache-dir", default_value = "/var/lib/dmtp")]
    cache_dir: PathBuf,
}

fn apply_cli_overrides(args: &Args, props: &PropertyStore) {
    if let Some(gps) = &args.gps {
        props.set_string(PROP_CFG_GPS_PORT, &gps[0]);
        if let Some(bps) = gps.get(1) {
            props.set_string(PROP_CFG_GPS_BPS, bps);
        }
    }
    let mut server = |spec: &Vec<String>, version: u32| {
        props.set_u32(PROP_STATE_PROTOCOL, version);
        props.set_string(PROP_COMM_HOST, &spec[0]);
        if let Some(port) = spec.get(1) {
            props.set_string(PROP_COMM_PORT, port);
        }
    };
    if let Some(tcp) = &args.tcp {
        server(tcp, PROTO_VERSION_TCP);
    }
    if let Some(udp) = &args.udp {
        server(udp, PROTO_VERSION_UDP);
    }
}

// ── Bootup report ─────────────────────────────────────────────────────────────

fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// First event after restart: why the last run ended, whether events were
/// restored from the backing file, and how a pending update went.
fn report_bootup_status(
    props: &PropertyStore,
    sink: &EventSink,
    cache_dir: &std::path::Path,
    restored: usize,
) {
    if !props.get_bool(PROP_STATE_BOOTUP_REPORT, true) {
        return;
    }
    let serial = props.get_string(PROP_STATE_SERIAL, "0");
    let mut reason = format!("{serial} @{}", hostname());
    if restored > 0 {
        reason.push_str(" events restored");
    }
    if let Some(cause) = supervisor::take_boot_cause(&shutdown_cause_path(cache_dir)) {
        reason.push_str(&format!(" last shutdown: {}", cause.cause));
    }

    let mut code = status::CLIENT_REBOOT;
    let stat_path = cache_dir.join(UPDATE_STAT_FILE);
    if let Ok(stat) = std::fs::read_to_string(&stat_path) {
        if stat.starts_with("SUCCESS") {
            code = status::CLIENT_UPDATE_OK;
            reason.push_str(" updated successfully");
        } else {
            code = status::CLIENT_UPDATE_FAILED;
            reason = format!("{serial} UPDATE Failed: {}", stat.trim());
        }
        let _ = std::fs::remove_file(&stat_path);
    }
    sink.text_event(PacketPriority::High, code, &reason);
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(a) => a,
        Err(e) if e.use_stderr() => {
            eprintln!("{e}");
            return ExitCode::from(3);
        }
        Err(e) => {
            // --help / --version
            print!("{e}");
            return ExitCode::SUCCESS;
        }
    };

    let default_filter = if let Some(f) = &args.log {
        f.clone()
    } else if args.debug {
        "dmtp_client=debug".to_string()
    } else if args.silent {
        "dmtp_client=error".to_string()
    } else {
        "dmtp_client=info".to_string()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    if let Err(e) = std::fs::create_dir_all(&args.cache_dir) {
        error!("cannot create state directory {}: {e}", args.cache_dir.display());
        return ExitCode::from(1);
    }

    // Configuration: cached properties, then the explicit file, then CLI.
    let props = Arc::new(PropertyStore::new(&args.cache_dir));
    let _ = props.load();
    if let Some(pfile) = &args.pfile {
        if let Err(e) = props.load_file(pfile) {
            error!("{e:#}");
            return ExitCode::from(1);
        }
    }
    apply_cli_overrides(&args, &props);
    if args.print_properties {
        props.print_all();
        return ExitCode::SUCCESS;
    }
    info!(
        "dmtp-client v{} starting (device '{}')",
        env!("CARGO_PKG_VERSION"),
        props.device_id()
    );
    if props.get_string(PROP_COMM_HOST, "").is_empty() {
        warn!("no server host configured; events will queue but never transmit");
    }

    // Clock discipline configuration.
    let mut clock_source = props.get_u32_at(PROP_GPS_CLOCK_DELTA, 1, 7);
    let clock_delta = props.get_u32_at(PROP_GPS_CLOCK_DELTA, 0, 10) as i64;
    if props.get_bool(PROP_GPS_POWER_SAVING, false) {
        clock_source |= CLOCK_SYNC_GPS;
    } else if clock_source == 0 {
        clock_source = CLOCK_SYNC_GPS;
    }
    let clock = Arc::new(ClockSync::new(clock_source, clock_delta));

    // Durable event queue: restore before any transport may open.
    let queue = Arc::new(EventQueue::new(
        EVENT_QUEUE_SIZE,
        args.cache_dir.join(EVENT_BACKING_FILE),
    ));
    let restored = match queue.restore() {
        Ok(n) => n,
        Err(e) => {
            warn!("event restore failed: {e}");
            0
        }
    };
    if restored > 0 {
        if let Some((seq, ts)) = queue.with(|q| q.last_sequence()) {
            info!("restored through sequence {seq} (last event at {ts:?})");
        }
    }
    let sink = EventSink::new(queue.clone(), props.clone());
    report_bootup_status(&props, &sink, &args.cache_dir, restored);

    // Shared runtime state.
    let link = Arc::new(LinkState::new());
    let start_session = Arc::new(Notify::new());
    let gps_shared = Arc::new(GpsShared::new());
    let watchdog = Arc::new(Watchdog::new());
    let (reboot_tx, reboot_rx) = mpsc::channel::<ShutdownCause>(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Property commands addressable from the server.
    {
        let p = props.clone();
        props.set_command(PROP_CMD_SAVE_PROPS, move |_| {
            p.save().map_err(|_| dmtp_codec::status::client_error::COMMAND_ERROR)
        });
        let s = sink.clone();
        let cache = args.cache_dir.clone();
        let reboot = reboot_tx.clone();
        props.set_command(PROP_CMD_UPDATE, move |payload| {
            let request = UpdateRequest::parse(payload)
                .map_err(|_| dmtp_codec::status::client_error::COMMAND_INVALID)?;
            info!("update triggered: {}", request.url);
            let updater = Updater {
                sink: s.clone(),
                cache_dir: cache.clone(),
                reboot: reboot.clone(),
            };
            tokio::spawn(updater.run(request));
            Ok(())
        });
        let p = props.clone();
        let cache = args.cache_dir.clone();
        props.set_command(PROP_CMD_UPLOAD_LOG, move |_| {
            uploader::spawn_upload(p.clone(), cache.join(CLIENT_LOG_FILE));
            Ok(())
        });
        let s = sink.clone();
        let g = gps_shared.clone();
        props.set_command(PROP_CMD_STATUS_EVENT, move |_| {
            match g.get_last(3600) {
                Some(fix) => s.gps_event(PacketPriority::Normal, status::LOCATION, &fix),
                None => s.text_event(PacketPriority::Normal, status::LOCATION, "no fix"),
            }
            Ok(())
        });
        let reboot = reboot_tx.clone();
        props.set_command(PROP_CMD_RESET, move |_| {
            let _ = reboot.try_send(ShutdownCause::Watchdog("server-reset".into()));
            Ok(())
        });
        let p = props.clone();
        props.subscribe(PROP_STATE_DEVICE_ID, move |_| {
            info!("device id changed to '{}'", p.device_id());
        });
    }

    // Protocol engine, with its silent-link watchdog.
    let down_ticks = Arc::new(AtomicU32::new(0));
    let mut engine = ProtocolEngine::new(
        props.clone(),
        clock.clone(),
        sink.clone(),
        link.clone(),
        start_session.clone(),
        down_ticks.clone(),
    );
    engine.set_gps_shared(gps_shared.clone());
    {
        let ticks = down_ticks.clone();
        let limit = ProtocolEngine::reboot_tick_limit(&props);
        let s = sink.clone();
        watchdog.register("protocol", move || {
            use std::sync::atomic::Ordering;
            let n = ticks.fetch_add(1, Ordering::Relaxed) + 1;
            if n > limit {
                s.diagnostic(events::Diagnostic::ClientReboot(
                    events::RebootReason::DownTooLong,
                ));
                ticks.store(0, Ordering::Relaxed);
                true
            } else {
                false
            }
        });
    }

    // Connectivity supervisor and its wireless-library watchdog.
    let sup = Supervisor {
        props: props.clone(),
        sink: sink.clone(),
        link: link.clone(),
        controller: LinkController::new(props.clone()),
        queue: queue.clone(),
        stuck_ticks: Arc::new(AtomicU32::new(0)),
    };
    watchdog.register("network-monitor", sup.network_monitor());

    // Spawn the worker tasks.
    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(
        watchdog.clone().run(reboot_tx.clone(), shutdown_rx.clone()),
    ));
    let gps_task = GpsTask {
        shared: gps_shared.clone(),
        props: props.clone(),
        sink: sink.clone(),
        clock: clock.clone(),
    };
    tasks.push(tokio::spawn(gps_task.run(shutdown_rx.clone())));
    let motion = MotionChecker::new(sink.clone(), props.clone());
    tasks.push(tokio::spawn(gps::run_sample_loop(
        gps_shared.clone(),
        props.clone(),
        sink.clone(),
        clock.clone(),
        motion,
        start_session.clone(),
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(engine.run(shutdown_rx.clone())));

    // SIGINT/SIGTERM initiate a clean shutdown.
    {
        let tx = shutdown_tx.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("interrupt received, shutting down");
            let _ = tx.send(true);
        });
    }

    // The supervisor runs on the main task; it returns with the cause.
    let cause = sup.run(reboot_rx, shutdown_rx.clone()).await;

    // Teardown in reverse start order: stop every worker, record the cause.
    let _ = shutdown_tx.send(true);
    start_session.notify_waiters();
    for task in tasks {
        if tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .is_err()
        {
            warn!("worker task did not stop in time");
        }
    }
    let _ = queue.preserve_all();
    supervisor::write_shutdown_cause(&shutdown_cause_path(&args.cache_dir), &cause);
    props.maintain();
    info!(
        "shutdown complete ({}) after {}s up",
        cause.label(),
        clock::now_secs() - clock.startup_epoch()
    );
    ExitCode::SUCCESS
}
