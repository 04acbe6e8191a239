//! # props
//!
//! Typed key/value configuration store.
//!
//! Properties are keyed by a 16-bit integer and carry a read-only flag, a
//! save flag, and the current value as a comma-separated text field. The
//! store persists to two cache files written in turn so a crash mid-write
//! leaves one intact copy; unknown keys found in a file are preserved across
//! read/write round trips.
//!
//! Writes take the store lock and fire any change-notify subscribers after
//! the lock is released. Server-addressable command keys dispatch to a
//! registered handler instead of storing a value.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};
use dmtp_codec::status::client_error;
use tracing::{info, warn};

pub type PropKey = u16;

// ── Key constants ─────────────────────────────────────────────────────────────
// 0x11xx hardware config, 0x31xx comm, 0x51xx GPS, 0x61xx motion,
// 0x71xx log upload, 0xD1xx client state, 0xF5xx commands.

pub const PROP_CFG_GPS_PORT: PropKey = 0x1112;
pub const PROP_CFG_GPS_BPS: PropKey = 0x1113;
pub const PROP_CFG_GPS_MODEL: PropKey = 0x1114;

pub const PROP_COMM_HOST: PropKey = 0x3111;
pub const PROP_COMM_PORT: PropKey = 0x3112;
pub const PROP_COMM_HOST_B: PropKey = 0x3113;
pub const PROP_COMM_PORT_B: PropKey = 0x3114;
pub const PROP_COMM_MIN_XMIT_RATE: PropKey = 0x3121;
pub const PROP_COMM_MAX_XMIT_RATE: PropKey = 0x3122;
pub const PROP_COMM_MAX_DELAY: PropKey = 0x3123;
pub const PROP_COMM_POWER_SAVING: PropKey = 0x3124;
pub const PROP_COMM_MTU: PropKey = 0x3125;
pub const PROP_COMM_ENCODINGS: PropKey = 0x3126;
pub const PROP_COMM_SAVE_RATE: PropKey = 0x3127;
pub const PROP_COMM_NET_IDLE_MINUTES: PropKey = 0x3128;
pub const PROP_COMM_URL_SWAP_LIMIT: PropKey = 0x3129;
pub const PROP_COMM_CUSTOM_FORMATS: PropKey = 0x312A;
pub const PROP_COMM_BYTES_READ: PropKey = 0x312B;
pub const PROP_COMM_BYTES_WRITTEN: PropKey = 0x312C;

pub const PROP_GPS_SAMPLE_RATE: PropKey = 0x5111;
pub const PROP_GPS_DISTANCE_DELTA: PropKey = 0x5112;
pub const PROP_GPS_EXPIRATION: PropKey = 0x5113;
pub const PROP_GPS_MIN_SPEED: PropKey = 0x5114;
pub const PROP_GPS_CLOCK_DELTA: PropKey = 0x5115;
pub const PROP_GPS_POWER_SAVING: PropKey = 0x5116;
pub const PROP_GPS_LOST_COUNTER: PropKey = 0x5117;
pub const PROP_GPS_AQUIRE_WAIT: PropKey = 0x5118;

pub const PROP_MOTION_START: PropKey = 0x6111;
pub const PROP_MOTION_START_TYPE: PropKey = 0x6112;
pub const PROP_MOTION_STOP: PropKey = 0x6113;
pub const PROP_MOTION_STOP_TYPE: PropKey = 0x6114;
pub const PROP_MOTION_IN_MOTION: PropKey = 0x6115;
pub const PROP_MOTION_EXCESS_SPEED: PropKey = 0x6116;
pub const PROP_MOTION_DORMANT_INTRVL: PropKey = 0x6117;
pub const PROP_MOTION_DORMANT_COUNT: PropKey = 0x6118;

pub const PROP_LOGGING_SERVER: PropKey = 0x7111;
pub const PROP_LOGGING_USER: PropKey = 0x7112;
pub const PROP_LOGGING_PASS: PropKey = 0x7113;

pub const PROP_STATE_ACCOUNT_ID: PropKey = 0xD111;
pub const PROP_STATE_DEVICE_ID: PropKey = 0xD112;
pub const PROP_STATE_SERIAL: PropKey = 0xD113;
pub const PROP_STATE_PROTOCOL: PropKey = 0xD114;
pub const PROP_STATE_DIAGNOSTIC: PropKey = 0xD115;
pub const PROP_STATE_BOOTUP_REPORT: PropKey = 0xD116;
pub const PROP_STATE_STUCK_TIMEOUT: PropKey = 0xD117;
pub const PROP_STATE_CHECKNETWORK_TIMEOUT: PropKey = 0xD118;
pub const PROP_STATE_NETWORK_CHECK_WAIT_TIMES: PropKey = 0xD119;
pub const PROP_STATE_NETWORK_UP_CMD: PropKey = 0xD11A;
pub const PROP_STATE_NETWORK_DOWN_CMD: PropKey = 0xD11B;
pub const PROP_STATE_FIRMWARE: PropKey = 0xD11C;

pub const PROP_CMD_SAVE_PROPS: PropKey = 0xF511;
pub const PROP_CMD_UPDATE: PropKey = 0xF512;
pub const PROP_CMD_UPLOAD_LOG: PropKey = 0xF513;
pub const PROP_CMD_STATUS_EVENT: PropKey = 0xF514;
pub const PROP_CMD_RESET: PropKey = 0xF515;

// ── Property table ────────────────────────────────────────────────────────────

struct PropDef {
    key: PropKey,
    name: &'static str,
    default: &'static str,
    read_only: bool,
    save: bool,
}

const fn def(key: PropKey, name: &'static str, default: &'static str) -> PropDef {
    PropDef {
        key,
        name,
        default,
        read_only: false,
        save: true,
    }
}

const fn vol(key: PropKey, name: &'static str, default: &'static str) -> PropDef {
    PropDef {
        key,
        name,
        default,
        read_only: false,
        save: false,
    }
}

#[rustfmt::skip]
static PROP_TABLE: &[PropDef] = &[
    def(PROP_CFG_GPS_PORT,          "cfg.gps.port",         "ttyS3"),
    def(PROP_CFG_GPS_BPS,           "cfg.gps.bps",          "9600"),
    def(PROP_CFG_GPS_MODEL,         "cfg.gps.model",        "sirf"),

    def(PROP_COMM_HOST,             "comm.host",            ""),
    def(PROP_COMM_PORT,             "comm.port",            "31000"),
    def(PROP_COMM_HOST_B,           "comm.host.b",          ""),
    def(PROP_COMM_PORT_B,           "comm.port.b",          "31000"),
    def(PROP_COMM_MIN_XMIT_RATE,    "comm.minrate",         "60"),
    def(PROP_COMM_MAX_XMIT_RATE,    "comm.maxrate",         "3600"),
    def(PROP_COMM_MAX_DELAY,        "comm.maxdelay",        "24"),
    def(PROP_COMM_POWER_SAVING,     "comm.powersaving",     "0"),
    def(PROP_COMM_MTU,              "comm.mtu",             "1500"),
    def(PROP_COMM_ENCODINGS,        "comm.encodings",       "0x1"),
    def(PROP_COMM_SAVE_RATE,        "comm.saverate",        "1"),
    def(PROP_COMM_NET_IDLE_MINUTES, "comm.netidle",         "30"),
    def(PROP_COMM_URL_SWAP_LIMIT,   "comm.urlswaplimit",    "18"),
    def(PROP_COMM_CUSTOM_FORMATS,   "comm.customformats",   "1"),
    def(PROP_COMM_BYTES_READ,       "comm.bytes.read",      "0"),
    def(PROP_COMM_BYTES_WRITTEN,    "comm.bytes.written",   "0"),

    def(PROP_GPS_SAMPLE_RATE,       "gps.smprate",          "10"),
    def(PROP_GPS_DISTANCE_DELTA,    "gps.dstdelta",         "150"),
    def(PROP_GPS_EXPIRATION,        "gps.expire",           "1200"),
    def(PROP_GPS_MIN_SPEED,         "gps.minspd",           "1.0"),
    def(PROP_GPS_CLOCK_DELTA,       "gps.clockdelta",       "10,7"),
    def(PROP_GPS_POWER_SAVING,      "gps.powersaving",      "0,3600"),
    def(PROP_GPS_LOST_COUNTER,      "gps.lostcount",        "10"),
    def(PROP_GPS_AQUIRE_WAIT,       "gps.aquirewait",       "0"),

    def(PROP_MOTION_START,          "motion.start",         "0.0"),
    def(PROP_MOTION_START_TYPE,     "motion.start.type",    "0"),
    def(PROP_MOTION_STOP,           "motion.stop",          "600"),
    def(PROP_MOTION_STOP_TYPE,      "motion.stop.type",     "0"),
    def(PROP_MOTION_IN_MOTION,      "motion.inmotion",      "900"),
    def(PROP_MOTION_EXCESS_SPEED,   "motion.exspeed",       "120.0"),
    def(PROP_MOTION_DORMANT_INTRVL, "motion.dorm.rate",     "0"),
    def(PROP_MOTION_DORMANT_COUNT,  "motion.dorm.count",    "1"),

    def(PROP_LOGGING_SERVER,        "log.server",           ""),
    def(PROP_LOGGING_USER,          "log.user",             ""),
    def(PROP_LOGGING_PASS,          "log.pass",             ""),

    def(PROP_STATE_ACCOUNT_ID,      "state.account",        ""),
    def(PROP_STATE_DEVICE_ID,       "state.device",         ""),
    def(PROP_STATE_SERIAL,          "state.serial",         "0"),
    def(PROP_STATE_PROTOCOL,        "state.protocol",       "3"),
    def(PROP_STATE_DIAGNOSTIC,      "state.diagnostic",     "1"),
    def(PROP_STATE_BOOTUP_REPORT,   "state.bootup.report",  "1"),
    def(PROP_STATE_STUCK_TIMEOUT,   "state.stucktimeout",   "900"),
    def(PROP_STATE_CHECKNETWORK_TIMEOUT, "state.checktimeout", "79"),
    def(PROP_STATE_NETWORK_CHECK_WAIT_TIMES, "state.checkwait", "3"),
    def(PROP_STATE_NETWORK_UP_CMD,  "state.net.up.cmd",     ""),
    def(PROP_STATE_NETWORK_DOWN_CMD, "state.net.down.cmd",  ""),
    vol(PROP_STATE_FIRMWARE,        "state.firmware",       ""),

    vol(PROP_CMD_SAVE_PROPS,        "cmd.saveprops",        ""),
    vol(PROP_CMD_UPDATE,            "cmd.update",           ""),
    vol(PROP_CMD_UPLOAD_LOG,        "cmd.uploadlog",        ""),
    vol(PROP_CMD_STATUS_EVENT,      "cmd.statusevent",      ""),
    vol(PROP_CMD_RESET,             "cmd.reset",            ""),
];

fn lookup(key: PropKey) -> Option<&'static PropDef> {
    PROP_TABLE.iter().find(|d| d.key == key)
}

fn lookup_name(name: &str) -> Option<&'static PropDef> {
    PROP_TABLE.iter().find(|d| d.name == name)
}

// ── Store ─────────────────────────────────────────────────────────────────────

struct Entry {
    raw: String,
    read_only: bool,
}

type NotifyFn = Box<dyn Fn(PropKey) + Send + Sync>;
type CommandFn = Box<dyn Fn(&[u8]) -> std::result::Result<(), u16> + Send + Sync>;

#[derive(Default)]
struct Inner {
    values: HashMap<PropKey, Entry>,
    /// Unknown `KEY=VALUE` lines carried through a load/save round trip.
    unknown: Vec<String>,
}

pub struct PropertyStore {
    inner: Mutex<Inner>,
    notify: Mutex<HashMap<PropKey, Vec<NotifyFn>>>,
    commands: Mutex<HashMap<PropKey, CommandFn>>,
    cache_files: [PathBuf; 2],
    dirty: AtomicBool,
}

impl PropertyStore {
    pub fn new(cache_dir: &Path) -> Self {
        let mut inner = Inner::default();
        for d in PROP_TABLE {
            inner.values.insert(
                d.key,
                Entry {
                    raw: d.default.to_string(),
                    read_only: d.read_only,
                },
            );
        }
        Self {
            inner: Mutex::new(inner),
            notify: Mutex::new(HashMap::new()),
            commands: Mutex::new(HashMap::new()),
            cache_files: [
                cache_dir.join("props.cache"),
                cache_dir.join("props.cache.1"),
            ],
            dirty: AtomicBool::new(false),
        }
    }

    // ── Typed accessors ───────────────────────────────────────────────────────

    fn raw(&self, key: PropKey) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .values
            .get(&key)
            .map(|e| e.raw.clone())
    }

    fn field(&self, key: PropKey, index: usize) -> Option<String> {
        let raw = self.raw(key)?;
        raw.split(',').nth(index).map(|s| s.trim().to_string())
    }

    pub fn get_u32(&self, key: PropKey, dft: u32) -> u32 {
        self.get_u32_at(key, 0, dft)
    }

    pub fn get_u32_at(&self, key: PropKey, index: usize, dft: u32) -> u32 {
        match self.field(key, index) {
            Some(s) => parse_u32(&s).unwrap_or(dft),
            None => dft,
        }
    }

    pub fn get_f64(&self, key: PropKey, dft: f64) -> f64 {
        self.field(key, 0)
            .and_then(|s| s.parse().ok())
            .unwrap_or(dft)
    }

    pub fn get_bool(&self, key: PropKey, dft: bool) -> bool {
        self.get_u32(key, dft as u32) != 0
    }

    pub fn get_string(&self, key: PropKey, dft: &str) -> String {
        self.raw(key).unwrap_or_else(|| dft.to_string())
    }

    pub fn set_u32(&self, key: PropKey, value: u32) {
        self.set_string(key, &value.to_string());
    }

    pub fn set_bool(&self, key: PropKey, value: bool) {
        self.set_u32(key, value as u32);
    }

    pub fn set_string(&self, key: PropKey, value: &str) {
        {
            let mut inner = self.inner.lock().unwrap();
            match inner.values.get_mut(&key) {
                Some(e) => e.raw = value.to_string(),
                None => return,
            }
        }
        self.dirty.store(true, Ordering::Relaxed);
        self.fire_notify(key);
    }

    pub fn account_id(&self) -> String {
        self.get_string(PROP_STATE_ACCOUNT_ID, "")
    }

    pub fn device_id(&self) -> String {
        let id = self.get_string(PROP_STATE_DEVICE_ID, "");
        if id.is_empty() {
            self.get_string(PROP_STATE_SERIAL, "0")
        } else {
            id
        }
    }

    // ── Change notification and commands ──────────────────────────────────────

    pub fn subscribe(&self, key: PropKey, f: impl Fn(PropKey) + Send + Sync + 'static) {
        self.notify
            .lock()
            .unwrap()
            .entry(key)
            .or_default()
            .push(Box::new(f));
    }

    fn fire_notify(&self, key: PropKey) {
        let notify = self.notify.lock().unwrap();
        if let Some(subs) = notify.get(&key) {
            for f in subs {
                f(key);
            }
        }
    }

    pub fn set_command(
        &self,
        key: PropKey,
        f: impl Fn(&[u8]) -> std::result::Result<(), u16> + Send + Sync + 'static,
    ) {
        self.commands.lock().unwrap().insert(key, Box::new(f));
    }

    // ── Server packet entry points ────────────────────────────────────────────

    /// Handle a `SetProperty` payload: 2-byte key then the value bytes.
    /// Command keys dispatch to their handler. Returns the client error code
    /// on failure.
    pub fn set_from_server(&self, payload: &[u8]) -> std::result::Result<(), u16> {
        if payload.len() < 2 {
            return Err(client_error::PROPERTY_INVALID_ID);
        }
        let key = u16::from_be_bytes([payload[0], payload[1]]);
        let value = &payload[2..];
        if let Some(cmd) = self.commands.lock().unwrap().get(&key) {
            return cmd(value);
        }
        let def = lookup(key).ok_or(client_error::PROPERTY_INVALID_ID)?;
        {
            let inner = self.inner.lock().unwrap();
            if inner.values.get(&key).map(|e| e.read_only).unwrap_or(false) {
                return Err(client_error::PROPERTY_READ_ONLY);
            }
        }
        let text =
            std::str::from_utf8(value).map_err(|_| client_error::PROPERTY_INVALID_VALUE)?;
        self.set_string(key, text.trim());
        info!("property {} set to '{}'", def.name, text.trim());
        Ok(())
    }

    /// Handle a `GetProperty` payload: the value bytes for a property-value
    /// reply packet, or the client error code.
    pub fn get_for_server(&self, payload: &[u8]) -> std::result::Result<Vec<u8>, u16> {
        if payload.len() < 2 {
            return Err(client_error::PROPERTY_INVALID_ID);
        }
        let key = u16::from_be_bytes([payload[0], payload[1]]);
        let raw = self.raw(key).ok_or(client_error::PROPERTY_INVALID_ID)?;
        let mut out = Vec::with_capacity(2 + raw.len());
        out.extend_from_slice(&key.to_be_bytes());
        out.extend_from_slice(raw.as_bytes());
        Ok(out)
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    /// Load the first readable cache file, falling back to the second copy.
    pub fn load(&self) -> Result<()> {
        for path in &self.cache_files {
            match std::fs::read_to_string(path) {
                Ok(text) => {
                    self.load_text(&text);
                    info!("properties loaded from {}", path.display());
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => warn!("property cache {}: {e}", path.display()),
            }
        }
        info!("no property cache found, using defaults");
        Ok(())
    }

    /// Load an explicit property file (the `-pfile` argument).
    pub fn load_file(&self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("property file {}", path.display()))?;
        self.load_text(&text);
        Ok(())
    }

    fn load_text(&self, text: &str) {
        let mut inner = self.inner.lock().unwrap();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((name, value)) = line.split_once('=') else {
                continue;
            };
            match lookup_name(name.trim()) {
                Some(d) => {
                    if let Some(e) = inner.values.get_mut(&d.key) {
                        e.raw = value.trim().to_string();
                    }
                }
                None => inner.unknown.push(line.to_string()),
            }
        }
    }

    /// Write both cache copies. Only save-flagged properties are written;
    /// unknown keys ride along unchanged.
    pub fn save(&self) -> Result<()> {
        let mut text = String::new();
        {
            let inner = self.inner.lock().unwrap();
            for d in PROP_TABLE.iter().filter(|d| d.save) {
                if let Some(e) = inner.values.get(&d.key) {
                    text.push_str(d.name);
                    text.push('=');
                    text.push_str(&e.raw);
                    text.push('\n');
                }
            }
            for line in &inner.unknown {
                text.push_str(line);
                text.push('\n');
            }
        }
        for path in &self.cache_files {
            std::fs::write(path, &text)
                .with_context(|| format!("saving properties to {}", path.display()))?;
        }
        self.dirty.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Persist the store when a writer has marked it dirty.
    pub fn maintain(&self) {
        if self.dirty.load(Ordering::Relaxed) {
            if let Err(e) = self.save() {
                warn!("property save failed: {e}");
            }
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    /// Dump every property for the `-pp` flag.
    pub fn print_all(&self) {
        let inner = self.inner.lock().unwrap();
        for d in PROP_TABLE {
            if let Some(e) = inner.values.get(&d.key) {
                println!("0x{:04X} {:<24} = {}", d.key, d.name, e.raw);
            }
        }
    }
}

fn parse_u32(s: &str) -> Option<u32> {
    if let Some(hexpart) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hexpart, 16).ok()
    } else {
        s.parse().ok().or_else(|| s.parse::<f64>().ok().map(|f| f as u32))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> PropertyStore {
        PropertyStore::new(Path::new("/tmp"))
    }

    #[test]
    fn defaults_and_indexed_fields() {
        let p = store();
        assert_eq!(p.get_u32(PROP_GPS_SAMPLE_RATE, 0), 10);
        assert_eq!(p.get_u32_at(PROP_GPS_CLOCK_DELTA, 0, 99), 10);
        assert_eq!(p.get_u32_at(PROP_GPS_CLOCK_DELTA, 1, 99), 7);
        assert_eq!(p.get_u32_at(PROP_GPS_CLOCK_DELTA, 2, 99), 99);
        assert_eq!(p.get_u32(PROP_COMM_ENCODINGS, 0), 0x1);
    }

    #[test]
    fn set_marks_dirty_and_notifies() {
        let p = store();
        let hits = std::sync::Arc::new(AtomicBool::new(false));
        let h = hits.clone();
        p.subscribe(PROP_COMM_ENCODINGS, move |_| h.store(true, Ordering::Relaxed));
        assert!(!p.is_dirty());
        p.set_u32(PROP_COMM_ENCODINGS, 0x2);
        assert!(p.is_dirty());
        assert!(hits.load(Ordering::Relaxed));
    }

    #[test]
    fn unknown_keys_survive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let p = PropertyStore::new(dir.path());
        p.load_text("comm.host=10.0.0.1\nvendor.extra=keepme\n");
        p.save().unwrap();
        let q = PropertyStore::new(dir.path());
        q.load().unwrap();
        assert_eq!(q.get_string(PROP_COMM_HOST, ""), "10.0.0.1");
        let text = std::fs::read_to_string(dir.path().join("props.cache")).unwrap();
        assert!(text.contains("vendor.extra=keepme"));
    }

    #[test]
    fn server_set_and_get_round_trip() {
        let p = store();
        let mut payload = PROP_COMM_HOST.to_be_bytes().to_vec();
        payload.extend_from_slice(b"server.example");
        p.set_from_server(&payload).unwrap();
        assert_eq!(p.get_string(PROP_COMM_HOST, ""), "server.example");

        let reply = p.get_for_server(&PROP_COMM_HOST.to_be_bytes()).unwrap();
        assert_eq!(&reply[..2], &PROP_COMM_HOST.to_be_bytes());
        assert_eq!(&reply[2..], b"server.example");
    }

    #[test]
    fn server_set_of_unknown_key_is_an_error() {
        let p = store();
        let err = p.set_from_server(&0x0099u16.to_be_bytes()).unwrap_err();
        assert_eq!(err, client_error::PROPERTY_INVALID_ID);
    }

    #[test]
    fn command_key_dispatches() {
        let p = store();
        let hit = std::sync::Arc::new(AtomicBool::new(false));
        let h = hit.clone();
        p.set_command(PROP_CMD_STATUS_EVENT, move |_| {
            h.store(true, Ordering::Relaxed);
            Ok(())
        });
        let payload = PROP_CMD_STATUS_EVENT.to_be_bytes().to_vec();
        p.set_from_server(&payload).unwrap();
        assert!(hit.load(Ordering::Relaxed));
    }
}
