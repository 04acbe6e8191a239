//! # events
//!
//! Event packet construction and the diagnostic status family.
//!
//! Two payload layouts cover everything the client emits:
//! - format 1 (GPS report): `status u16 | fixtime u32 | point 8B | speed u8 |
//!   heading u8 | altitude i16 | seq u8`
//! - format 3 (status report): `status u16 | timestamp u32 | text | seq u8`
//!
//! The sequence byte is a placeholder patched by the queue when the packet
//! receives its sequence number; `seq_pos` records where it sits.

use std::sync::Arc;

use dmtp_codec::packet::{client, Packet, PacketPriority};
use tracing::warn;

use crate::clock::now_secs;
use crate::gps::Fix;
use crate::props::{PropertyStore, PROP_COMM_MAX_DELAY, PROP_STATE_DIAGNOSTIC};
use crate::queue::EventQueue;

// ── Payload builders ──────────────────────────────────────────────────────────

/// GPS event payload (format 1).
pub fn format1(status: u16, timestamp: u32, fix: &Fix) -> Packet {
    let mut data = Vec::with_capacity(19);
    data.extend_from_slice(&status.to_be_bytes());
    data.extend_from_slice(&timestamp.to_be_bytes());
    data.extend_from_slice(&fix.point.encode());
    data.push(fix.speed_kph.clamp(0.0, 255.0) as u8);
    data.push((fix.heading / 2.0).clamp(0.0, 180.0) as u8);
    data.extend_from_slice(&(fix.altitude.clamp(-32768.0, 32767.0) as i16).to_be_bytes());
    let seq_pos = data.len() as u16;
    data.push(0);
    Packet {
        header_type: client::DMTSP_FORMAT_1,
        seq_pos,
        seq_len: 1,
        data,
        ..Default::default()
    }
}

/// Text status payload (format 3).
pub fn format3(status: u16, timestamp: u32, text: &str) -> Packet {
    let text = &text.as_bytes()[..text.len().min(247)];
    let mut data = Vec::with_capacity(7 + text.len());
    data.extend_from_slice(&status.to_be_bytes());
    data.extend_from_slice(&timestamp.to_be_bytes());
    data.extend_from_slice(text);
    let seq_pos = data.len() as u16;
    data.push(0);
    Packet {
        header_type: client::DMTSP_FORMAT_3,
        seq_pos,
        seq_len: 1,
        data,
        ..Default::default()
    }
}

// ── Diagnostics ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootReason {
    LibraryStuck,
    DownTooLong,
}

/// Supervisor and GPS transitions surfaced to the server as durable events.
#[derive(Debug, Clone)]
pub enum Diagnostic {
    CnnctCheck,
    /// true = down, false = alive
    CnnctDown(bool),
    /// true = rebuilt, false = attempting rebuild
    CnnctRebuilt(bool),
    /// true = lost, false = back
    GpsLost(bool),
    ClientReboot(RebootReason),
    /// true = stall latched, false = cleared
    LibStuck(bool),
    CellDown(bool),
    Message(String),
}

// ── Event sink ────────────────────────────────────────────────────────────────

/// Clonable producer handle to the durable event queue. Collaborator
/// subsystems (tag readers, supervisor, GPS) all enqueue through this.
#[derive(Clone)]
pub struct EventSink {
    queue: Arc<EventQueue>,
    props: Arc<PropertyStore>,
}

impl EventSink {
    pub fn new(queue: Arc<EventQueue>, props: Arc<PropertyStore>) -> Self {
        Self { queue, props }
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    /// Queue a GPS-stamped event carrying the fix's own time. Failures never
    /// block or propagate to the producer.
    pub fn gps_event(&self, priority: PacketPriority, status: u16, fix: &Fix) {
        self.gps_event_at(priority, status, fix.fixtime.max(0) as u32, fix);
    }

    /// Queue a GPS event stamped with an explicit time (motion events are
    /// stamped with the moment of detection, not the fix time).
    pub fn gps_event_at(&self, priority: PacketPriority, status: u16, timestamp: u32, fix: &Fix) {
        if !self.queue.add_event(format1(status, timestamp, fix), priority) {
            warn!("event 0x{status:04X} dropped: queue full");
        }
    }

    /// Queue a free-text status event stamped with the current time.
    pub fn text_event(&self, priority: PacketPriority, status: u16, text: &str) {
        let pkt = format3(status, now_secs().max(0) as u32, text);
        if !self.queue.add_event(pkt, priority) {
            warn!("status event 0x{status:04X} dropped: queue full");
        }
    }

    /// Queue a diagnostic transition message, honoring the configured
    /// diagnostic level (0 silences everything).
    pub fn diagnostic(&self, diag: Diagnostic) {
        if self.props.get_u32(PROP_STATE_DIAGNOSTIC, 1) == 0 {
            return;
        }
        use dmtp_codec::status::status::CLIENT_DIAGNOSTIC_MSG;
        let text = match &diag {
            Diagnostic::CnnctCheck => "Check Network status".to_string(),
            Diagnostic::CnnctDown(true) => "Connection DOWN".to_string(),
            Diagnostic::CnnctDown(false) => "Connection ALIVE".to_string(),
            Diagnostic::CnnctRebuilt(true) => "Connection REBUILT".to_string(),
            Diagnostic::CnnctRebuilt(false) => "TRY REBUILD Connection".to_string(),
            Diagnostic::GpsLost(true) => "GPS signal LOST".to_string(),
            Diagnostic::GpsLost(false) => "GPS signal BACK".to_string(),
            Diagnostic::ClientReboot(RebootReason::LibraryStuck) => {
                "Reboot ALERT due to stuck in library".to_string()
            }
            Diagnostic::ClientReboot(RebootReason::DownTooLong) => {
                let hours = self.props.get_u32(PROP_COMM_MAX_DELAY, 0);
                format!("Reboot ALERT due to connection DOWN for {hours} hours")
            }
            Diagnostic::LibStuck(true) => "Wireless Stuck set".to_string(),
            Diagnostic::LibStuck(false) => "Wireless Stuck cleared".to_string(),
            Diagnostic::CellDown(true) => "Cellular Connection DOWN".to_string(),
            Diagnostic::CellDown(false) => "Cellular Connection ALIVE".to_string(),
            Diagnostic::Message(s) => s.clone(),
        };
        self.text_event(PacketPriority::Normal, CLIENT_DIAGNOSTIC_MSG, &text);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use dmtp_codec::status::status;
    use std::path::Path;

    fn sink() -> EventSink {
        let dir = std::env::temp_dir().join("dmtp-events-test.bak");
        let queue = Arc::new(EventQueue::new(64, dir));
        let props = Arc::new(PropertyStore::new(Path::new("/tmp")));
        EventSink::new(queue, props)
    }

    #[test]
    fn format3_layout_matches_wire_contract() {
        let pkt = format3(status::INITIALIZED, 1_700_000_000, "boot");
        assert_eq!(pkt.header_type, client::DMTSP_FORMAT_3);
        assert_eq!(&pkt.data[..2], &status::INITIALIZED.to_be_bytes());
        assert_eq!(&pkt.data[2..6], &1_700_000_000u32.to_be_bytes());
        assert_eq!(&pkt.data[6..10], b"boot");
        assert_eq!(pkt.seq_pos, 10);
        assert_eq!(pkt.data.len(), 11);
    }

    #[test]
    fn format1_carries_point_and_kinematics() {
        let fix = Fix {
            point: dmtp_codec::GpsPoint::new(43.5, -80.25),
            altitude: 340.0,
            speed_kph: 72.4,
            heading: 181.0,
            fixtime: 1_700_000_000,
            ..Default::default()
        };
        let pkt = format1(status::MOTION_START, fix.fixtime as u32, &fix);
        assert_eq!(pkt.data.len(), 19);
        assert_eq!(pkt.seq_pos, 18);
        let point = dmtp_codec::GpsPoint::decode(&pkt.data[6..14].try_into().unwrap());
        assert!((point.latitude - 43.5).abs() < 1e-6);
        assert_eq!(pkt.data[14], 72); // speed
        assert_eq!(pkt.data[15], 90); // heading / 2
    }

    #[test]
    fn sequence_byte_is_patched_on_enqueue() {
        let s = sink();
        s.text_event(PacketPriority::Normal, status::LOCATION, "a");
        s.text_event(PacketPriority::Normal, status::LOCATION, "b");
        s.queue().with(|q| {
            let mut cur = q.cursor();
            let p0 = q.next_packet(&mut cur).unwrap();
            let p1 = q.next_packet(&mut cur).unwrap();
            assert_eq!(p0.data[p0.seq_pos as usize], 0);
            assert_eq!(p1.data[p1.seq_pos as usize], 1);
        });
    }

    #[test]
    fn diagnostic_level_zero_is_silent() {
        let s = sink();
        s.props.set_u32(PROP_STATE_DIAGNOSTIC, 0);
        s.diagnostic(Diagnostic::CnnctDown(true));
        assert!(!s.queue().has_packets());
        s.props.set_u32(PROP_STATE_DIAGNOSTIC, 1);
        s.diagnostic(Diagnostic::CnnctDown(true));
        assert!(s.queue().has_packets());
    }
}
