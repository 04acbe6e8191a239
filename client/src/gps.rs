//! # gps
//!
//! GPS acquisition task.
//!
//! Reads NMEA sentences from either a serial receiver or the local
//! gps_publisher datagram socket, assembles them into fixes, keeps the
//! shared last-fix snapshot fresh, disciplines the system clock from RMC
//! time, and tracks signal loss. A separate sampling loop consumes fixes at
//! the configured rate and feeds the motion checker.
//!
//! The receiver port is owned exclusively by this task; power saving closes
//! it between wake windows and re-opens it with a warm-start hint carrying
//! the last known position and GPS week/time-of-week.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dmtp_codec::checksum::nmea_finalize;
use dmtp_codec::packet::PacketPriority;
use dmtp_codec::status::status;
use dmtp_codec::GpsPoint;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixDatagram;
use tokio::sync::{watch, Notify};
use tokio::time::{timeout, Instant};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use crate::clock::{now_secs, ClockSync};
use crate::events::{Diagnostic, EventSink};
use crate::motion::MotionChecker;
use crate::nmea::{self, Sentence, NMEA_GPGGA, NMEA_GPGSA, NMEA_GPRMC};
use crate::props::*;

/// Sentences are expected at least once per wake period sample; this many
/// fruitless samples end a power-saving wake window.
const POWER_SAVING_WAKE_PERIOD: u32 = 240;

/// Ceiling on a single blocking read of the GPS source.
const GPS_PORT_TIMEOUT: Duration = Duration::from_secs(86_400);

/// Subscriber socket path and the publisher it subscribes to.
const DMTP_GPS_SOCKET: &str = "/tmp/dmtp_gps";
const GPS_PUBLISHER_SOCKET: &str = "/tmp/gps_publisher";
const MESSAGE_ID_SUBSCRIBE: u16 = 0;
const MESSAGE_ID_UNSUBSCRIBE: u16 = 1;

/// First GPS week of the warm-start epoch (2011-07-10, week 1644).
const GPS_WEEK_EPOCH: i64 = 1_310_256_000;
const GPS_WEEK_EPOCH_WN: i64 = 1644;
const SECONDS_PER_WEEK: i64 = 604_800;

// ── Fix ───────────────────────────────────────────────────────────────────────

/// One assembled GPS sample. Valid once both the position sentence (GGA)
/// and the validity sentence (RMC) have contributed.
#[derive(Debug, Clone, Default)]
pub struct Fix {
    pub point: GpsPoint,
    pub altitude: f64,
    pub speed_kph: f64,
    pub heading: f64,
    pub pdop: f64,
    pub hdop: f64,
    pub vdop: f64,
    pub fixtype: u8,
    pub nmea: u32,
    /// UTC seconds from the RMC time fields.
    pub fixtime: i64,
    /// Acquisition instant on the runtime clock, for age checks.
    pub age: Option<Instant>,
}

impl Fix {
    pub fn is_valid(&self) -> bool {
        self.nmea & (NMEA_GPRMC | NMEA_GPGGA) == (NMEA_GPRMC | NMEA_GPGGA)
    }

    pub fn invalidate(&mut self) {
        self.nmea = 0;
    }

    pub fn age_secs(&self) -> u64 {
        self.age.map(|t| t.elapsed().as_secs()).unwrap_or(u64::MAX)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GpsDiagnostics {
    pub last_sample_time: i64,
    pub last_valid_time: i64,
    pub sample_count_a: u32,
    pub sample_count_v: u32,
    pub restart_count: u32,
}

// ── Shared snapshot ───────────────────────────────────────────────────────────

/// Last-fix snapshot owned by the GPS task; readers copy under the lock.
/// A fix older than the expiration interval is dead no matter what its
/// sentence bits say: pure receiver silence invalidates it on the next
/// query, without waiting for another sentence to arrive.
pub struct GpsShared {
    last_fix: Mutex<Fix>,
    /// Notified when a valid fix replaces an invalid one.
    pub acquire: Notify,
    stats: Mutex<GpsDiagnostics>,
    power_saving: AtomicBool,
    /// Seconds after which an unrefreshed fix expires.
    expire_secs: AtomicU64,
    /// Latch so "GPS signal LOST" is reported once per outage, whichever
    /// path notices it first.
    lost_reported: AtomicBool,
}

impl GpsShared {
    pub fn new() -> Self {
        Self {
            last_fix: Mutex::new(Fix::default()),
            acquire: Notify::new(),
            stats: Mutex::new(GpsDiagnostics::default()),
            power_saving: AtomicBool::new(false),
            expire_secs: AtomicU64::new(1200),
            lost_reported: AtomicBool::new(false),
        }
    }

    pub fn set_expiration(&self, secs: u64) {
        self.expire_secs.store(secs.max(1), Ordering::Relaxed);
    }

    fn expiration(&self) -> u64 {
        self.expire_secs.load(Ordering::Relaxed)
    }

    /// Drop an expired fix entirely, exactly as the acquisition task does
    /// when the receiver reports in but never regains a fix.
    fn expire_if_stale(&self, fix: &mut Fix) {
        if fix.age.is_some() && fix.age_secs() > self.expiration() {
            *fix = Fix::default();
        }
    }

    /// Snapshot the last fix. A fresh valid fix is returned (and consumed
    /// under power saving); an invalid-but-positioned fix is returned only
    /// within `max_age_secs`; anything past the expiration interval is
    /// gone.
    pub fn get_last(&self, max_age_secs: u64) -> Option<Fix> {
        let mut fix = self.last_fix.lock().unwrap();
        self.expire_if_stale(&mut fix);
        if fix.is_valid() {
            let snap = fix.clone();
            if self.power_saving.load(Ordering::Relaxed) {
                fix.invalidate();
            }
            Some(snap)
        } else if fix.point.is_valid() && fix.age_secs() <= max_age_secs {
            Some(fix.clone())
        } else {
            None
        }
    }

    /// Block until the task publishes a valid fix.
    pub async fn acquire_wait(&self, shutdown: &mut watch::Receiver<bool>) {
        loop {
            {
                let mut fix = self.last_fix.lock().unwrap();
                self.expire_if_stale(&mut fix);
                if fix.is_valid() {
                    return;
                }
            }
            tokio::select! {
                _ = self.acquire.notified() => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    pub fn is_stale(&self) -> bool {
        let mut fix = self.last_fix.lock().unwrap();
        self.expire_if_stale(&mut fix);
        !fix.is_valid()
    }

    /// First reporter of an outage wins; the rest stay quiet.
    pub fn try_report_lost(&self) -> bool {
        !self.lost_reported.swap(true, Ordering::Relaxed)
    }

    /// True when a reported outage just ended.
    pub fn try_report_back(&self) -> bool {
        self.lost_reported.swap(false, Ordering::Relaxed)
    }

    pub fn diagnostics(&self) -> GpsDiagnostics {
        *self.stats.lock().unwrap()
    }

    fn publish(&self, fix: &Fix) {
        let mut last = self.last_fix.lock().unwrap();
        let was_invalid = !last.is_valid();
        *last = fix.clone();
        drop(last);
        if was_invalid {
            self.acquire.notify_waiters();
        }
    }
}

// ── Source ────────────────────────────────────────────────────────────────────

enum GpsSource {
    Serial(tokio_serial::SerialStream),
    Publisher(UnixDatagram),
}

impl GpsSource {
    async fn open(props: &PropertyStore) -> anyhow::Result<Self> {
        let port = props.get_string(PROP_CFG_GPS_PORT, "ttyS3");
        if port == "publisher" {
            let _ = std::fs::remove_file(DMTP_GPS_SOCKET);
            let sock = UnixDatagram::bind(DMTP_GPS_SOCKET)?;
            subscribe(MESSAGE_ID_SUBSCRIBE).await?;
            info!("subscribed to {GPS_PUBLISHER_SOCKET}");
            Ok(Self::Publisher(sock))
        } else {
            let path = if port.starts_with('/') {
                port.clone()
            } else {
                format!("/dev/{port}")
            };
            let bps = props.get_u32(PROP_CFG_GPS_BPS, 9600);
            let mut stream = tokio_serial::new(&path, bps).open_native_async()?;
            info!("opened GPS port {path} [{bps} bps]");
            configure_receiver(&mut stream, &props.get_string(PROP_CFG_GPS_MODEL, "")).await;
            Ok(Self::Serial(stream))
        }
    }

    async fn close(self) {
        if let Self::Publisher(_) = self {
            if let Err(e) = subscribe(MESSAGE_ID_UNSUBSCRIBE).await {
                debug!("gps unsubscribe: {e}");
            }
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Serial(s) => s.read(buf).await,
            Self::Publisher(s) => s.recv(buf).await,
        }
    }

    async fn write_sentence(&mut self, sentence: &str) {
        if let Self::Serial(s) = self {
            if let Err(e) = s.write_all(sentence.as_bytes()).await {
                warn!("GPS init write failed: {e}");
            }
        }
    }
}

/// Register or cancel with the publisher: 'M', message id, path length,
/// then the subscriber socket path.
async fn subscribe(message_id: u16) -> std::io::Result<()> {
    let sock = UnixDatagram::unbound()?;
    sock.connect(GPS_PUBLISHER_SOCKET)?;
    let mut buf = Vec::with_capacity(4 + DMTP_GPS_SOCKET.len());
    buf.push(b'M');
    buf.extend_from_slice(&message_id.to_be_bytes());
    buf.push(DMTP_GPS_SOCKET.len() as u8);
    buf.extend_from_slice(DMTP_GPS_SOCKET.as_bytes());
    sock.send(&buf).await?;
    Ok(())
}

/// Model-specific receiver setup. Only the Garmin sentence selection is
/// done in-band; receiver power control belongs to the platform layer.
async fn configure_receiver(stream: &mut tokio_serial::SerialStream, model: &str) {
    if model.eq_ignore_ascii_case("garmin") {
        for cmd in [
            "$PGRMO,,2\r\n",        // disable all sentences
            "$PGRMC1,2,,2,,,,1,W\r\n", // 2s output, WAAS
            "$PGRMO,GPRMC,1\r\n",
            "$PGRMO,GPGGA,1\r\n",
        ] {
            if let Err(e) = stream.write_all(cmd.as_bytes()).await {
                warn!("Garmin config write failed: {e}");
                return;
            }
        }
        debug!("Garmin GPS configured");
    }
}

/// Warm-start hint: last position, altitude, clock drift, time-of-week and
/// week number let the receiver skip a cold search.
fn warm_start_sentence(fix: &Fix, now: i64) -> String {
    let elapsed = (now - GPS_WEEK_EPOCH).max(0);
    let wn = elapsed / SECONDS_PER_WEEK + GPS_WEEK_EPOCH_WN;
    let tow = elapsed % SECONDS_PER_WEEK;
    let mut msg = format!(
        "$PSRF104,{:.6},{:.6},{:.1},96000,{},{},12,3*00",
        fix.point.latitude, fix.point.longitude, fix.altitude, tow, wn
    );
    nmea_finalize(&mut msg);
    msg
}

// ── Acquisition task ──────────────────────────────────────────────────────────

pub struct GpsTask {
    pub shared: Arc<GpsShared>,
    pub props: Arc<PropertyStore>,
    pub sink: EventSink,
    pub clock: Arc<ClockSync>,
}

struct LostState {
    count: u32,
    lost: bool,
}

impl GpsTask {
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let power_saving = self.props.get_bool(PROP_GPS_POWER_SAVING, false);
        let power_cycle = self.props.get_u32_at(PROP_GPS_POWER_SAVING, 1, 3600) as u64;
        let expire = self.props.get_u32(PROP_GPS_EXPIRATION, 1200) as i64;
        let min_speed = self.props.get_f64(PROP_GPS_MIN_SPEED, 1.0).min(3.0);
        // Power saving implies GPS clock discipline with a tight delta.
        let time_delta = if power_saving { 3 } else { self.clock.delta };
        self.shared.power_saving.store(power_saving, Ordering::Relaxed);
        self.shared.set_expiration(expire.max(1) as u64);

        let mut source = Some(match GpsSource::open(&self.props).await {
            Ok(s) => s,
            Err(e) => {
                warn!("unable to open GPS: {e}");
                self.sink
                    .diagnostic(Diagnostic::Message("GPS Open Failed".into()));
                return;
            }
        });

        let mut working = Fix::default();
        let mut lost = LostState {
            count: 0,
            lost: false,
        };
        let mut line_buf = Vec::with_capacity(512);
        let mut read_buf = [0u8; 512];
        let mut nwake: u32 = 0;
        let mut fix_valid = false;
        let mut wake_started = Instant::now();

        while !*shutdown.borrow() {
            let n = tokio::select! {
                r = timeout(GPS_PORT_TIMEOUT, source.as_mut().unwrap().read(&mut read_buf)) => match r {
                    Ok(Ok(0)) | Err(_) => {
                        // Port wedged or silent for the whole ceiling.
                        warn!("GPS port timeout, reopening");
                        self.shared.last_fix.lock().unwrap().invalidate();
                        working.invalidate();
                        source.take().unwrap().close().await;
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        self.shared.stats.lock().unwrap().restart_count += 1;
                        match GpsSource::open(&self.props).await {
                            Ok(s) => { source = Some(s); continue; }
                            Err(e) => { warn!("GPS reopen failed: {e}"); return; }
                        }
                    }
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) => {
                        warn!("GPS read error: {e}");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                },
                _ = shutdown.changed() => break,
            };

            line_buf.extend_from_slice(&read_buf[..n]);
            while let Some(nl) = line_buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = line_buf.drain(..=nl).collect();
                if let Ok(text) = std::str::from_utf8(&line) {
                    self.apply_sentence(text, &mut working, &mut lost);
                }
            }
            // Guard against a sentence stream with no terminators.
            if line_buf.len() > 4096 {
                line_buf.clear();
            }

            let now = now_secs();
            if working.is_valid() {
                let mut snap = working.clone();
                if snap.speed_kph < min_speed {
                    snap.speed_kph = 0.0;
                }
                self.shared.publish(&snap);
                fix_valid = true;
                self.shared.stats.lock().unwrap().last_valid_time = now;
                if self.clock.source & crate::clock::CLOCK_SYNC_GPS != 0 {
                    let diff = snap.fixtime - now;
                    if diff.abs() > time_delta {
                        if let Some(delta) = self.clock.sync_from_gps(snap.fixtime) {
                            self.sink.queue().apply_clock_adjustment(delta);
                        }
                    }
                }
            } else {
                // Carry sentence state onto the stored fix and expire it.
                let mut last = self.shared.last_fix.lock().unwrap();
                if last.point.is_valid() {
                    last.nmea = working.nmea;
                    if now - last.fixtime > expire {
                        *last = Fix::default();
                    }
                }
                drop(last);
                if power_saving {
                    nwake += 1;
                }
            }

            if power_saving && (nwake > POWER_SAVING_WAKE_PERIOD || fix_valid) {
                let awake = wake_started.elapsed().as_secs();
                let sleep_for = power_cycle.saturating_sub(awake.min(power_cycle));
                debug!("GPS power saving: sleeping {sleep_for}s");
                source.take().unwrap().close().await;
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(sleep_for)) => {}
                    _ = shutdown.changed() => break,
                }
                source = Some(match GpsSource::open(&self.props).await {
                    Ok(mut s) => {
                        let hint = warm_start_sentence(&working, now_secs());
                        s.write_sentence(&hint).await;
                        s
                    }
                    Err(e) => {
                        warn!("GPS reopen failed: {e}");
                        return;
                    }
                });
                nwake = 0;
                fix_valid = false;
                wake_started = Instant::now();
            }
        }
        if let Some(s) = source {
            s.close().await;
        }
    }

    fn apply_sentence(&self, line: &str, working: &mut Fix, lost: &mut LostState) {
        let now = now_secs();
        {
            let mut stats = self.shared.stats.lock().unwrap();
            stats.last_sample_time = now;
        }
        match nmea::parse(line) {
            Some(Sentence::Rmc(rmc)) => {
                let mut stats = self.shared.stats.lock().unwrap();
                if rmc.valid {
                    stats.sample_count_a += 1;
                } else {
                    stats.sample_count_v += 1;
                }
                drop(stats);
                if rmc.valid {
                    working.fixtime = rmc.fixtime;
                    working.speed_kph = rmc.speed_kph;
                    working.heading = rmc.heading;
                    working.age = Some(Instant::now());
                    working.nmea |= NMEA_GPRMC;
                } else {
                    working.nmea &= !NMEA_GPRMC;
                }
            }
            Some(Sentence::Gga(gga)) => {
                if let Some(point) = gga.point {
                    if self.shared.try_report_back() {
                        self.sink.diagnostic(Diagnostic::GpsLost(false));
                    }
                    lost.lost = false;
                    lost.count = 0;
                    working.point = point;
                    working.altitude = gga.altitude;
                    working.fixtype = gga.fix_quality;
                    working.hdop = gga.hdop;
                    working.nmea |= NMEA_GPGGA;
                } else {
                    let tolerance = self.props.get_u32(PROP_GPS_LOST_COUNTER, 10);
                    if !lost.lost {
                        if lost.count >= tolerance {
                            info!("GPS lost");
                            lost.lost = true;
                        } else {
                            lost.count += 1;
                        }
                    }
                    if lost.lost && self.shared.try_report_lost() {
                        self.sink.diagnostic(Diagnostic::GpsLost(true));
                    }
                    working.nmea &= !NMEA_GPGGA;
                }
            }
            Some(Sentence::Gsa(gsa)) => {
                working.pdop = gsa.pdop;
                working.hdop = gsa.hdop;
                working.vdop = gsa.vdop;
                working.nmea |= NMEA_GPGSA;
            }
            None => {}
        }
    }
}

// ── Sampling loop ─────────────────────────────────────────────────────────────

/// Consume fixes at the configured sample rate, queue the first-fix event,
/// and drive the motion checker. Mirrors the acquisition half of the main
/// loop; housekeeping stays with the supervisor.
pub async fn run_sample_loop(
    shared: Arc<GpsShared>,
    props: Arc<PropertyStore>,
    sink: EventSink,
    clock: Arc<ClockSync>,
    mut motion: MotionChecker,
    session_start: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    let power_saving = props.get_bool(PROP_GPS_POWER_SAVING, false);
    let mut acquired = false;
    let mut last_valid = Fix::default();

    while !*shutdown.borrow() {
        let cycle = props.get_u32(PROP_GPS_SAMPLE_RATE, 10).max(2) as u64;
        let max_age = props.get_u32(PROP_GPS_AQUIRE_WAIT, 0) as u64;

        // A clock jump re-stamps everything; note it once for this consumer.
        if clock.take_time_adjusted() {
            debug!("system clock jumped; fix timestamps re-anchored");
        }

        if !acquired {
            shared.acquire_wait(&mut shutdown).await;
            if *shutdown.borrow() {
                break;
            }
            if let Some(fix) = shared.get_last(max_age) {
                info!(
                    "GPS fix: {:.5}/{:.5}",
                    fix.point.latitude, fix.point.longitude
                );
                if shared.try_report_back() {
                    sink.diagnostic(Diagnostic::GpsLost(false));
                }
                sink.gps_event(PacketPriority::Normal, status::INITIALIZED, &fix);
                last_valid = fix;
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(cycle)) => {}
                _ = shutdown.changed() => break,
            }
            if power_saving {
                // One report per wake window; hand the floor to the engine.
                session_start.notify_waiters();
                continue;
            }
            acquired = true;
        }

        match shared.get_last(max_age) {
            Some(fix) => {
                motion.check(&last_valid, &fix, now_secs());
                last_valid = fix;
            }
            None => {
                last_valid.speed_kph = 0.0;
                let frozen = last_valid.clone();
                motion.check(&frozen, &frozen, now_secs());
                motion.reset_status();
                acquired = false;
                info!("lost GPS signal");
                if shared.try_report_lost() {
                    sink.diagnostic(Diagnostic::GpsLost(true));
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(cycle)) => {}
            _ = shutdown.changed() => break,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fix_needs_both_position_and_validity() {
        let mut f = Fix::default();
        assert!(!f.is_valid());
        f.nmea = NMEA_GPRMC;
        assert!(!f.is_valid());
        f.nmea |= NMEA_GPGGA;
        assert!(f.is_valid());
        f.invalidate();
        assert!(!f.is_valid());
    }

    #[test]
    fn get_last_consumes_fix_under_power_saving() {
        let shared = GpsShared::new();
        shared.power_saving.store(true, Ordering::Relaxed);
        let fix = Fix {
            point: GpsPoint::new(43.5, -80.2),
            nmea: NMEA_GPRMC | NMEA_GPGGA,
            age: Some(Instant::now()),
            ..Default::default()
        };
        shared.publish(&fix);
        assert!(shared.get_last(0).is_some());
        // The stored copy was invalidated by the first read: only the
        // aged-position fallback remains.
        assert!(!shared.last_fix.lock().unwrap().is_valid());
        assert!(shared.get_last(60).is_some());
    }

    #[test]
    fn warm_start_sentence_is_checksummed() {
        let fix = Fix {
            point: GpsPoint::new(43.493125, -80.204365),
            altitude: 346.3,
            ..Default::default()
        };
        let s = warm_start_sentence(&fix, GPS_WEEK_EPOCH + 3 * SECONDS_PER_WEEK + 120);
        assert!(s.starts_with("$PSRF104,43.493125,-80.204365,346.3,96000,120,1647,"));
        assert!(dmtp_codec::checksum::nmea_verify(s.trim_end()));
    }

    #[tokio::test(start_paused = true)]
    async fn fix_expires_on_pure_silence() {
        let shared = GpsShared::new();
        shared.set_expiration(30);
        let fix = Fix {
            point: GpsPoint::new(43.5, -80.2),
            nmea: NMEA_GPRMC | NMEA_GPGGA,
            age: Some(Instant::now()),
            ..Default::default()
        };
        shared.publish(&fix);
        assert!(shared.get_last(0).is_some());
        assert!(!shared.is_stale());

        // Nothing at all arrives from the receiver past the expiration
        // interval: the fix is gone, whatever the caller's max age.
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(shared.get_last(0).is_none());
        assert!(shared.get_last(3600).is_none());
        assert!(shared.is_stale());
        assert!(!shared.last_fix.lock().unwrap().point.is_valid());
    }

    #[tokio::test(start_paused = true)]
    async fn sample_loop_reports_lost_once_after_expiration_silence() {
        use crate::events::EventSink;
        use crate::motion::MotionChecker;
        use crate::queue::EventQueue;
        use dmtp_codec::status::status as status_code;

        let shared = Arc::new(GpsShared::new());
        shared.set_expiration(25);
        let queue = Arc::new(EventQueue::new(
            64,
            std::env::temp_dir().join("dmtp-gps-starve-test.bak"),
        ));
        let props = Arc::new(PropertyStore::new(std::path::Path::new("/tmp")));
        let sink = EventSink::new(queue.clone(), props.clone());
        let clock = Arc::new(ClockSync::new(crate::clock::CLOCK_SYNC_GPS, 10));
        let motion = MotionChecker::new(sink.clone(), props.clone());

        let fix = Fix {
            point: GpsPoint::new(43.5, -80.2),
            nmea: NMEA_GPRMC | NMEA_GPGGA,
            fixtime: 1_700_000_000,
            age: Some(Instant::now()),
            ..Default::default()
        };
        shared.publish(&fix);

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_sample_loop(
            shared.clone(),
            props,
            sink,
            clock,
            motion,
            Arc::new(Notify::new()),
            stop_rx,
        ));

        // Starve the source well past the expiration interval.
        tokio::time::sleep(Duration::from_secs(120)).await;
        stop_tx.send(true).unwrap();
        task.await.unwrap();

        let statuses: Vec<u16> = queue.with(|q| {
            let mut out = Vec::new();
            let mut cur = q.cursor();
            while let Some(p) = q.next_packet(&mut cur) {
                out.push(u16::from_be_bytes([p.data[0], p.data[1]]));
            }
            out
        });
        assert!(statuses.contains(&status_code::INITIALIZED));
        // The "GPS signal LOST" diagnostic is queued exactly once.
        assert_eq!(
            statuses
                .iter()
                .filter(|&&s| s == status_code::CLIENT_DIAGNOSTIC_MSG)
                .count(),
            1
        );
    }
}
