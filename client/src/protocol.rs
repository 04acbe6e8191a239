//! # protocol
//!
//! DMTP session engine.
//!
//! One long-lived task per protocol instance. It sleeps on its condition
//! until the transmit pulse fires, a producer reports a non-empty queue, or
//! a session is requested, then runs one UDP or TCP session against the
//! configured server. Session failures feed the URL rotation and the
//! link-recovery ladder; successes reset every counter and, when a server
//! clock adjustment is pending, discipline the system clock and rewrite
//! queued event timestamps.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dmtp_codec::encoding::{Encoding, SessionEncoding, REQUIRED_MASK};
use dmtp_codec::packet::{client, server, FrameIter, Packet, PacketPriority};
use dmtp_codec::status::server_error;
use dmtp_codec::Fletcher;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::clock::{now_secs, ClockSync};
use crate::events::{Diagnostic, EventSink};
use crate::props::*;
use crate::queue::{EventQueue, PacketQueue};
use crate::supervisor::LinkState;
use crate::transport::{
    ServerUrls, Transport, TransportError, BLOCK_RECEIVING_TIMEOUT, NETWORK_RECEIVE_TIMEOUT,
};

pub const PROTO_VERSION_UDP: u32 = 3;
pub const PROTO_VERSION_TCP: u32 = 4;

/// Three checksum NAKs in one session make it severe.
const MAX_CHECKSUM_ERRORS: u32 = 3;
/// Lifetime severe-error latch that throttles a runaway client.
const EXCESSIVE_SEVERE_ERRORS: u32 = 10;
const READ_BUF_SIZE: usize = (255 + 3) * 7;
/// Pause between failed sessions while probing the alternate URL.
const DEFAULT_SESSION_PERIOD: u64 = 79;
const PENDING_QUEUE_SIZE: usize = 64;

// ── Session state ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendIdent {
    None,
    Unique,
    Account,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PayloadType {
    Pending,
    Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Ok,
    /// The wireless link itself is suspect.
    LinkError,
    /// The link looked fine but the server dialog failed.
    ServerError,
}

struct Session {
    send_identification: SendIdent,
    encoding: SessionEncoding,
    severe_errors: u32,
    checksum_errors: u32,
    invalid_acct_errors: u32,
    sequence_first: u32,
    num_sent: u32,
    payload_type: PayloadType,
    pending: bool,
    session_continue: bool,
    /// Set once the first packet is written; the duplex first-packet
    /// encoding restriction only applies before this.
    sent_any: bool,
    ident_len: usize,
    send_buf: Vec<u8>,
    read_buf: Vec<u8>,
    fletcher: Fletcher,
    read_bytes: u32,
    written_bytes: u32,
}

impl Session {
    fn new(encoding: SessionEncoding) -> Self {
        Self {
            send_identification: SendIdent::Unique,
            encoding,
            severe_errors: 0,
            checksum_errors: 0,
            invalid_acct_errors: 0,
            sequence_first: 0,
            num_sent: 0,
            payload_type: PayloadType::Event,
            pending: false,
            session_continue: true,
            sent_any: false,
            ident_len: 0,
            send_buf: Vec::with_capacity(1024),
            read_buf: Vec::with_capacity(READ_BUF_SIZE),
            fletcher: Fletcher::new(),
            read_bytes: 0,
            written_bytes: 0,
        }
    }
}

// ── Engine timing ─────────────────────────────────────────────────────────────

/// Pulse schedule derived from the save/transmit rate properties. When the
/// preservation period is shorter than the transmit pulse the engine runs
/// on the preservation period and preserves paranoidly on idle beats.
#[derive(Debug, Clone, Copy)]
struct Timing {
    main_period: u64,
    session_cycle: u32,
    silent_cycle: u32,
    recession_period: u64,
    paranoid_preserving: bool,
    event_preserving: bool,
}

fn init_timing(props: &PropertyStore) -> Timing {
    let t0 = props.get_u32(PROP_COMM_SAVE_RATE, 1) as u64 * 60;
    let t1 = (props.get_u32(PROP_COMM_MIN_XMIT_RATE, 1) as u64).max(1);
    let t2 = (props.get_u32(PROP_COMM_MAX_XMIT_RATE, 1) as u64).max(1);
    let half = t0 / 2;
    if t0 == 0 || t0 + half > t1 {
        Timing {
            main_period: t1,
            session_cycle: 1,
            silent_cycle: t2.div_ceil(t1).max(1) as u32,
            recession_period: if t0 == 0 { t2 } else { t0 },
            paranoid_preserving: false,
            event_preserving: t0 != 0,
        }
    } else {
        Timing {
            main_period: t0,
            session_cycle: ((t1 + half) / t0).max(1) as u32,
            silent_cycle: ((t2 + half) / t0).max(1) as u32,
            recession_period: t0,
            paranoid_preserving: true,
            event_preserving: true,
        }
    }
}

fn send_buf_size(mtu: u32) -> (usize, usize) {
    let size = match mtu {
        0..=999 => 640,
        1000..=1499 => 1024,
        1500..=1999 => 1536,
        2000..=2999 => 2048,
        3000..=3999 => 3072,
        _ => 4096,
    };
    let safety = if size <= 1024 { 80 } else { 128 };
    (size, safety)
}

// ── Engine ────────────────────────────────────────────────────────────────────

pub struct ProtocolEngine {
    props: Arc<PropertyStore>,
    clock: Arc<ClockSync>,
    sink: EventSink,
    queue: Arc<EventQueue>,
    link: Arc<LinkState>,
    start_session: Arc<Notify>,
    /// Watchdog tick counter since the last successful round trip.
    down_ticks: Arc<AtomicU32>,
    transport: Transport,
    urls: ServerUrls,
    gps: Option<Arc<crate::gps::GpsShared>>,
    pending: PacketQueue,
    pending_sequence: u32,
    timing: Timing,
    send_buf_limit: usize,
    safety_block: usize,
    power_saving: bool,
    protocol_version: u32,
    total_read: u32,
    total_written: u32,
    total_severe: u32,
    session: Session,
}

enum Pulse {
    Notified,
    Timeout,
    Shutdown,
}

impl ProtocolEngine {
    pub fn new(
        props: Arc<PropertyStore>,
        clock: Arc<ClockSync>,
        sink: EventSink,
        link: Arc<LinkState>,
        start_session: Arc<Notify>,
        down_ticks: Arc<AtomicU32>,
    ) -> Self {
        let protocol_version = props.get_u32(PROP_STATE_PROTOCOL, PROTO_VERSION_UDP);
        let transport = if protocol_version == PROTO_VERSION_TCP {
            Transport::tcp()
        } else {
            Transport::udp()
        };
        let (limit, safety) = send_buf_size(props.get_u32(PROP_COMM_MTU, 1500));
        let timing = init_timing(&props);
        let power_saving = props.get_bool(PROP_COMM_POWER_SAVING, false);
        let queue = sink.queue().clone();
        let encoding = initial_encoding(&props);
        Self {
            props,
            clock,
            sink,
            queue,
            link,
            start_session,
            down_ticks,
            transport,
            urls: ServerUrls::new(),
            gps: None,
            pending: PacketQueue::new(PENDING_QUEUE_SIZE),
            pending_sequence: 0,
            timing,
            send_buf_limit: limit,
            safety_block: safety,
            power_saving,
            protocol_version,
            total_read: 0,
            total_written: 0,
            total_severe: 0,
            session: Session::new(encoding),
        }
    }

    /// Number of watchdog ticks after which a silent link forces a reboot.
    pub fn reboot_tick_limit(props: &PropertyStore) -> u32 {
        props.get_u32(PROP_COMM_MAX_DELAY, 24) * 360
    }

    /// Attach the GPS snapshot so sessions can report fix staleness.
    pub fn set_gps_shared(&mut self, gps: Arc<crate::gps::GpsShared>) {
        self.gps = Some(gps);
    }

    // ── Main loop ─────────────────────────────────────────────────────────────

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let check_wait_times = self
            .props
            .get_u32(PROP_STATE_NETWORK_CHECK_WAIT_TIMES, 3);
        let swap_limit = self.props.get_u32(PROP_COMM_URL_SWAP_LIMIT, 18);
        let mut link_recover = !self.link.is_up();
        let mut link_down_symptom = false;
        let mut url_swap_count = 0u32;
        let mut check_countdown = 0u32;

        'outer: while !*shutdown.borrow() {
            if !link_recover {
                // Waiting loop: sleep the pulse schedule away until there is
                // something to send or the silent bound expires.
                let mut beat1 = 1u32;
                let mut beats = 0u32;
                loop {
                    if beats >= self.timing.silent_cycle {
                        break;
                    }
                    match self.wait_pulse(&mut shutdown).await {
                        Pulse::Shutdown => break 'outer,
                        Pulse::Notified => {
                            if self.queue.has_packets() {
                                break;
                            }
                            beat1 = 0;
                        }
                        Pulse::Timeout => {
                            if beat1 >= self.timing.session_cycle {
                                if self.queue.has_packets() {
                                    break;
                                }
                                beat1 = 0;
                            } else if self.queue.with(|q| q.highest_priority())
                                >= PacketPriority::High
                            {
                                // Urgent events do not wait out the pulse.
                                break;
                            } else if self.timing.paranoid_preserving {
                                let _ = self.queue.preserve_all();
                            }
                        }
                    }
                    beats += 1;
                    beat1 += 1;
                }
                if self.power_saving {
                    // The link stays down between sessions; ask for it now.
                    self.link.report_down();
                }
            }

            // Gate on link-up, preserving events while stuck down.
            if !self
                .link
                .wait_up_preserving(
                    &mut shutdown,
                    Duration::from_secs(self.timing.recession_period),
                    self.timing.event_preserving,
                    &self.queue,
                )
                .await
            {
                break;
            }

            if link_down_symptom && !self.link.down_occurred() {
                // The supervisor found the link healthy, so the server is
                // the suspect: rest, then try the other URL.
                tokio::time::sleep(Duration::from_secs(DEFAULT_SESSION_PERIOD)).await;
                link_down_symptom = false;
                url_swap_count += 1;
                if url_swap_count > swap_limit {
                    self.link.request_terminate();
                    self.link.report_down();
                    url_swap_count = 0;
                    link_recover = true;
                    continue;
                }
                let next = self.urls.url_id ^ 1;
                self.urls.reset(next);
            }

            debug!("TX->Server...");
            let outcome = if self.protocol_version == PROTO_VERSION_TCP {
                self.tcp_session().await
            } else {
                self.udp_session().await
            };

            match outcome {
                SessionOutcome::Ok => {
                    debug!("...RX<-Server");
                    if self.urls.url_id != 0 {
                        self.urls.reset(0);
                    }
                    if self.power_saving {
                        self.link.request_terminate();
                    }
                    link_recover = false;
                    link_down_symptom = false;
                    url_swap_count = 0;
                    check_countdown = 0;
                    self.down_ticks.store(0, Ordering::Relaxed);
                    self.finish_clock_adjust().await;
                }
                SessionOutcome::LinkError => {
                    if check_countdown < check_wait_times {
                        check_countdown += 1;
                        debug!(
                            "retry TX {} more times",
                            check_wait_times - check_countdown + 1
                        );
                        if self.urls.url_id != 0 {
                            self.urls.reset(0);
                        }
                        link_recover = false;
                        link_down_symptom = false;
                        url_swap_count = 0;
                        continue;
                    }
                    if self.timing.event_preserving {
                        let _ = self.queue.preserve_all();
                    }
                    link_recover = true;
                    link_down_symptom = true;
                    let id = self.urls.url_id;
                    self.urls.reset(id);
                    self.link.report_down();
                }
                SessionOutcome::ServerError => {
                    link_recover = true;
                    if self.timing.event_preserving {
                        let _ = self.queue.preserve_all();
                    }
                    url_swap_count += 1;
                    if url_swap_count > swap_limit {
                        self.link.request_terminate();
                        self.link.report_down();
                        url_swap_count = 0;
                    } else {
                        let next = self.urls.url_id ^ 1;
                        self.urls.reset(next);
                        tokio::time::sleep(Duration::from_secs(DEFAULT_SESSION_PERIOD)).await;
                    }
                }
            }
        }
        info!("protocol engine stopped");
    }

    async fn wait_pulse(&self, shutdown: &mut watch::Receiver<bool>) -> Pulse {
        tokio::select! {
            _ = self.start_session.notified() => Pulse::Notified,
            _ = self.queue.nonempty.notified() => Pulse::Notified,
            _ = shutdown.changed() => Pulse::Shutdown,
            _ = tokio::time::sleep(Duration::from_secs(self.timing.main_period)) => Pulse::Timeout,
        }
    }

    /// Apply a pending server clock adjustment after a good session.
    async fn finish_clock_adjust(&mut self) {
        if !self.clock.needs_adjust() {
            return;
        }
        let before = now_secs();
        if let Some(delta) = self.clock.apply_pending() {
            self.queue.apply_clock_adjustment(delta);
            if delta.abs() > 86_400 {
                self.pending.update_timestamps(delta);
            } else {
                self.pending.tune_timestamps(delta);
            }
            let msg = format!("Clock synchronized from {} to {}", before, before + delta);
            self.sink.diagnostic(Diagnostic::Message(msg));
            // Give dependent tasks a beat to observe the jump.
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    // ── Session plumbing ──────────────────────────────────────────────────────

    async fn open_session(&mut self) -> Result<(), TransportError> {
        let addr = self.urls.resolve(&self.props).await?;
        self.transport.open(addr).await?;
        self.queue.with(|q| q.set_overwrite(false));
        self.total_read = self.props.get_u32(PROP_COMM_BYTES_READ, 0);
        self.total_written = self.props.get_u32(PROP_COMM_BYTES_WRITTEN, 0);
        self.session = Session::new(initial_encoding(&self.props));
        // TCP carries data mid-dialog, so assume traffic until told otherwise.
        self.session.pending = self.transport.is_duplex();
        Ok(())
    }

    async fn close_session(&mut self) {
        self.transport.close().await;
        self.props.set_u32(PROP_COMM_BYTES_READ, self.total_read);
        self.props.set_u32(PROP_COMM_BYTES_WRITTEN, self.total_written);
        self.queue.with(|q| q.set_overwrite(true));
        debug!(
            "session closed: {}B out, {}B in, {} invalid-account errors",
            self.session.written_bytes, self.session.read_bytes, self.session.invalid_acct_errors
        );

        if self.session.severe_errors > 0 {
            self.total_severe += self.session.severe_errors;
            warn!("severe errors encountered: {}", self.total_severe);
            if self.total_severe >= EXCESSIVE_SEVERE_ERRORS {
                warn!("excessive severe errors");
                self.total_severe = 0;
            }
        } else {
            self.total_severe = 0;
        }

        // Unacknowledged packets return to fresh state; empty queues reset.
        if self.pending.count() > 0 {
            self.pending.restore_sent();
        } else {
            self.pending.reset();
        }
        let emptied = self.queue.with(|q| {
            if q.count() > 0 {
                q.restore_sent();
                false
            } else {
                q.reset();
                true
            }
        });
        if emptied {
            self.queue.reset_preserve();
        }
    }

    /// Serialize one packet in the negotiated session encoding. CSV cannot
    /// open a duplex dialog, so the very first packet of a stream session
    /// falls back to the duplex-safe encoding.
    fn write_packet(&mut self, pkt: &Packet) {
        let encoding = if self.transport.is_duplex() && !self.session.sent_any {
            self.session.encoding.first_for_duplex()
        } else {
            self.session.encoding.encoding
        };
        pkt.encode_encoded_into(
            encoding,
            self.session.encoding.checksummed,
            &mut self.session.send_buf,
        );
        self.session.sent_any = true;
    }

    async fn flush(&mut self) -> Result<usize, TransportError> {
        let n = self.session.send_buf.len();
        if n == 0 {
            return Ok(0);
        }
        let buf = std::mem::take(&mut self.session.send_buf);
        let r = self.transport.write_all(&buf).await;
        self.session.send_buf = buf;
        match r {
            Ok(()) => {
                self.total_written = self.total_written.wrapping_add(n as u32);
                self.session.written_bytes += n as u32;
                Ok(n)
            }
            Err(e) => Err(e),
        }
    }

    fn identification_packets(&mut self) -> Vec<Packet> {
        let mut out = Vec::with_capacity(3);
        // After a NAK_ID_INVALID the unique id is withheld and the server
        // authenticates on account/device alone.
        if self.session.send_identification != SendIdent::Account {
            out.push(Packet::new(
                client::UNIQUE_ID,
                vec![self.protocol_version as u8],
            ));
        }
        let acct = self.props.account_id();
        let acct = &acct.as_bytes()[..acct.len().min(dmtp_codec::packet::MAX_ID_LEN)];
        out.push(Packet::new(client::ACCOUNT_ID, acct.to_vec()));
        let dev = self.props.device_id();
        let dev = &dev.as_bytes()[..dev.len().min(dmtp_codec::packet::MAX_ID_LEN)];
        out.push(Packet::new(client::DEVICE_ID, dev.to_vec()));
        self.session.send_identification = SendIdent::None;
        out
    }

    /// Drain unsent packets from a queue into the send buffer, marking each
    /// SENT and recording the block's first sequence.
    fn send_queue_into_buf(&mut self, which: PayloadType) -> usize {
        let mut count = 0usize;
        let mut first = None;
        fn collect(q: &mut PacketQueue, buf_room: &mut usize, safety: usize) -> Vec<Packet> {
            let mut out = Vec::new();
            let mut cur = q.cursor();
            while let Some(p) = q.next_packet(&mut cur) {
                if p.is_sent() {
                    continue;
                }
                if p.wire_len() + safety > *buf_room {
                    break;
                }
                *buf_room -= p.wire_len();
                q.mark_sent(p.sequence);
                out.push(p);
            }
            out
        }
        let mut room = self.send_buf_limit.saturating_sub(self.session.send_buf.len());
        let safety = self.safety_block;
        let frames = match which {
            PayloadType::Pending => collect(&mut self.pending, &mut room, safety),
            PayloadType::Event => self.queue.with(|q| collect(q, &mut room, safety)),
        };
        for p in &frames {
            if first.is_none() {
                first = Some(p.sequence);
            }
            self.write_packet(p);
            count += 1;
        }
        if let Some(seq) = first {
            self.session.sequence_first = seq;
        }
        self.session.num_sent = count as u32;
        if count > 0 {
            self.session.payload_type = which;
        }
        count
    }

    /// Append a client error packet to the outgoing buffer.
    fn queue_error(&mut self, code: u16, arg: u16) {
        let mut data = Vec::with_capacity(4);
        data.extend_from_slice(&code.to_be_bytes());
        data.extend_from_slice(&arg.to_be_bytes());
        let pkt = Packet::new(client::ERROR, data);
        self.write_packet(&pkt);
        self.session.pending = true;
    }

    /// Queue a reply packet (property value) onto the pending queue.
    fn queue_pending(&mut self, pkt: Packet) {
        let mut pkt = pkt;
        pkt.sequence = self.pending_sequence;
        self.pending_sequence = self.pending_sequence.wrapping_add(1);
        if !self.pending.add(pkt) {
            warn!("pending queue overflow");
        }
        self.session.pending = true;
    }

    /// Report fix staleness at session start so the server learns about GPS
    /// trouble even when no events flow.
    fn queue_gps_error(&mut self, gps: &crate::gps::GpsShared) {
        if !gps.is_stale() {
            return;
        }
        use dmtp_codec::status::client_error;
        let stats = gps.diagnostics();
        let (code, stamp) = if now_secs() > stats.last_sample_time + 30 {
            (client_error::GPS_FAILURE, stats.last_sample_time)
        } else {
            (client_error::GPS_EXPIRED, stats.last_valid_time)
        };
        let mut data = Vec::with_capacity(6);
        data.extend_from_slice(&code.to_be_bytes());
        data.extend_from_slice(&(stamp.max(0) as u32).to_be_bytes());
        let pkt = Packet::new(client::ERROR, data);
        self.write_packet(&pkt);
        self.session.pending = true;
    }

    // ── UDP session ───────────────────────────────────────────────────────────

    async fn udp_session(&mut self) -> SessionOutcome {
        if let Err(e) = self.open_session().await {
            info!("failed establishing UDP connection: {e}");
            return self.classify(Some(e));
        }
        let mut error: Option<TransportError> = None;

        loop {
            // Identification rides at the head of every datagram.
            if self.session.ident_len == 0 {
                for pkt in self.identification_packets() {
                    self.write_packet(&pkt);
                }
                self.session.ident_len = self.session.send_buf.len();
            }

            if self.clock.is_synchronized() {
                if self.pending.has_unsent() {
                    self.send_queue_into_buf(PayloadType::Pending);
                } else if self.queue.with(|q| q.has_unsent()) {
                    self.send_queue_into_buf(PayloadType::Event);
                }
            }

            // Zero-length EOB closes the datagram. End-of-block markers
            // always ride binary so the block framing stays fixed.
            self.session.send_buf.extend_from_slice(&[
                dmtp_codec::packet::PACKET_HEADER_BASIC,
                (client::EOB_DONE & 0xFF) as u8,
                0,
            ]);
            match self.flush().await {
                Ok(_) => {}
                Err(e) => {
                    error = Some(e);
                    break;
                }
            }
            self.session.send_buf.truncate(self.session.ident_len);
            self.session.pending = false;

            let mut buf = vec![0u8; READ_BUF_SIZE];
            let n = match self.transport.read(&mut buf, NETWORK_RECEIVE_TIMEOUT).await {
                Ok(n) => n,
                Err(e) => {
                    error = Some(e);
                    break;
                }
            };
            self.total_read = self.total_read.wrapping_add(n as u32);
            self.session.read_bytes += n as u32;

            for pkt in FrameIter::new(&buf[..n]) {
                self.handle_server_packet(&pkt, false);
            }

            if !self.clock.is_synchronized() {
                break;
            }
            let more =
                self.queue.with(|q| q.has_unsent()) || self.pending.has_unsent();
            if !(self.session.pending || more) || self.session.severe_errors > 0 {
                break;
            }
        }

        self.close_session().await;
        self.classify(error)
    }

    // ── TCP session ───────────────────────────────────────────────────────────

    async fn tcp_session(&mut self) -> SessionOutcome {
        if let Err(e) = self.open_session().await {
            info!("failed establishing TCP connection: {e}");
            return self.classify(Some(e));
        }
        let mut error: Option<TransportError> = None;

        'session: {
            // Identification block, folded into the running block checksum.
            for pkt in self.identification_packets() {
                self.write_packet(&pkt);
            }
            let sent = self.session.send_buf.clone();
            match self.flush().await {
                Ok(_) => {
                    self.session.fletcher.update(&sent);
                    self.session.send_buf.clear();
                }
                Err(e) => {
                    error = Some(e);
                    break 'session;
                }
            }
            if let Some(gps) = self.gps.clone() {
                self.queue_gps_error(&gps);
            }

            match self.read_block(true).await {
                Ok(_) => {}
                Err(e) => {
                    error = Some(e);
                    break 'session;
                }
            }
            self.dispatch_read_buf();
            if !self.clock.is_synchronized() || self.session.severe_errors > 0 {
                let _ = self.send_eob(false).await;
                break 'session;
            }

            let mut more = self.queue.with(|q| q.has_unsent());
            while self.session.session_continue && (self.session.pending || more) {
                if self.pending.has_unsent() {
                    self.send_queue_into_buf(PayloadType::Pending);
                } else if self.queue.with(|q| q.has_unsent()) {
                    self.send_queue_into_buf(PayloadType::Event);
                }
                more = self.queue.with(|q| q.has_unsent());
                if let Err(e) = self.send_eob(more).await {
                    error = Some(e);
                    break;
                }
                match self.read_block(true).await {
                    Ok(_) => {}
                    Err(e) => {
                        error = Some(e);
                        break;
                    }
                }
                if !dmtp_codec::packet::ends_transmission(&self.session.read_buf) {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    if let Err(e) = self.read_block(false).await {
                        error = Some(e);
                        break;
                    }
                }
                self.session.pending = false;
                self.dispatch_read_buf();
            }
        }

        self.close_session().await;
        self.classify(error)
    }

    /// Read one server turn into the session buffer. `blocking` selects the
    /// long receive ceiling; the short one covers tail reads.
    async fn read_block(&mut self, blocking: bool) -> Result<usize, TransportError> {
        if blocking {
            self.session.read_buf.clear();
        }
        let ceiling = if blocking {
            NETWORK_RECEIVE_TIMEOUT
        } else {
            BLOCK_RECEIVING_TIMEOUT
        };
        let mut chunk = vec![0u8; READ_BUF_SIZE];
        let n = self.transport.read(&mut chunk, ceiling).await?;
        self.session.read_buf.extend_from_slice(&chunk[..n]);
        self.total_read = self.total_read.wrapping_add(n as u32);
        self.session.read_bytes += n as u32;
        Ok(n)
    }

    fn dispatch_read_buf(&mut self) {
        let buf = std::mem::take(&mut self.session.read_buf);
        for pkt in FrameIter::new(&buf) {
            self.handle_server_packet(&pkt, true);
        }
        self.session.read_buf = buf;
    }

    async fn send_eob(&mut self, more: bool) -> Result<(), TransportError> {
        let pkt_type = if more {
            client::EOB_MORE
        } else {
            client::EOB_DONE
        };
        // The checksum is computed with a zeroed placeholder, then patched.
        self.session.send_buf.extend_from_slice(&[
            dmtp_codec::packet::PACKET_HEADER_BASIC,
            (pkt_type & 0xFF) as u8,
            2,
            0,
            0,
        ]);
        self.session.fletcher.update(&self.session.send_buf);
        let check = self.session.fletcher.check_bytes();
        let len = self.session.send_buf.len();
        self.session.send_buf[len - 2..].copy_from_slice(&check);
        self.flush().await?;
        self.session.send_buf.clear();
        self.session.fletcher.reset();
        Ok(())
    }

    fn classify(&self, error: Option<TransportError>) -> SessionOutcome {
        if let Some(e) = error {
            if e.is_link_error() {
                return SessionOutcome::LinkError;
            }
            return SessionOutcome::ServerError;
        }
        if self.session.severe_errors > 0 {
            SessionOutcome::ServerError
        } else {
            SessionOutcome::Ok
        }
    }

    // ── Server packet handling ────────────────────────────────────────────────

    fn acknowledge(&mut self, num_ack: u32) -> bool {
        if num_ack == 0 {
            return false;
        }
        let first = self.session.sequence_first;
        let did = match self.session.payload_type {
            PayloadType::Event => self
                .queue
                .with(|q| q.delete_sent(first, num_ack as usize)),
            PayloadType::Pending => self.pending.delete_sent(first, num_ack as usize),
        };
        self.session.num_sent = 0;
        did
    }

    /// Explicit-sequence ACK arithmetic: the payload byte is the low byte of
    /// the last packet the server accepted.
    fn ack_count_from(&self, low_seq: u8) -> u32 {
        let first_low = (self.session.sequence_first & 0xFF) as u8;
        let n = low_seq.wrapping_add(1).wrapping_sub(first_low) as u32;
        if n == 0 {
            0x100
        } else {
            n
        }
    }

    fn handle_server_packet(&mut self, pkt: &Packet, duplex: bool) -> bool {
        // Until the clock gate clears, property and upload traffic is held
        // off; only identification-level dialog proceeds.
        if !self.clock.is_synchronized()
            && matches!(
                pkt.header_type,
                server::SET_PROPERTY | server::GET_PROPERTY | server::FILE_UPLOAD
            )
        {
            return true;
        }

        match pkt.header_type {
            server::EOB_DONE | server::EOB_SPEAK_FREELY => {
                if duplex {
                    if self.session.payload_type == PayloadType::Pending
                        && self.session.num_sent > 0
                    {
                        let n = self.session.num_sent;
                        if !self.acknowledge(n) {
                            warn!("server acknowledge: cannot find corresponding packets");
                        }
                    }
                } else if pkt.header_type == server::EOB_SPEAK_FREELY {
                    self.session.pending = true;
                }
                true
            }
            server::ACK => {
                let num_ack = if pkt.data.is_empty() {
                    self.session.num_sent
                } else {
                    self.ack_count_from(pkt.data[0])
                };
                if !self.acknowledge(num_ack) {
                    warn!("server acknowledge: cannot find corresponding packets");
                }
                true
            }
            server::AUTH => {
                if pkt.data.len() == 4 {
                    let t = u32::from_be_bytes(pkt.data[..4].try_into().unwrap()) as i64;
                    self.clock.note_server_time(t);
                }
                true
            }
            server::EOT => {
                if duplex {
                    if self.session.payload_type == PayloadType::Pending
                        && self.session.num_sent > 0
                    {
                        let n = self.session.num_sent;
                        let _ = self.acknowledge(n);
                    }
                    self.session.session_continue = false;
                }
                if pkt.data.len() == 4 {
                    let t = u32::from_be_bytes(pkt.data[..4].try_into().unwrap()) as i64;
                    self.clock.note_server_time(t);
                }
                true
            }
            server::GET_PROPERTY => {
                match self.props.get_for_server(&pkt.data) {
                    Ok(value) => {
                        self.queue_pending(Packet::new(client::PROPERTY_VALUE, value));
                    }
                    Err(code) => {
                        let key = key_of(&pkt.data);
                        self.queue_error(code, key);
                    }
                }
                self.session.pending = true;
                true
            }
            server::SET_PROPERTY => {
                if let Err(code) = self.props.set_from_server(&pkt.data) {
                    let key = key_of(&pkt.data);
                    self.queue_error(code, key);
                }
                self.session.pending = true;
                true
            }
            server::FILE_UPLOAD => {
                self.queue_error(
                    dmtp_codec::status::client_error::PACKET_TYPE,
                    pkt.header_type,
                );
                false
            }
            server::ERROR => {
                if pkt.data.len() >= 2 {
                    let code = u16::from_be_bytes([pkt.data[0], pkt.data[1]]);
                    let against = if pkt.data.len() >= 4 {
                        u16::from_be_bytes([pkt.data[2], pkt.data[3]])
                    } else {
                        0
                    };
                    self.handle_error_code(code, against)
                } else {
                    true
                }
            }
            _ => {
                self.queue_error(
                    dmtp_codec::status::client_error::PACKET_TYPE,
                    pkt.header_type,
                );
                false
            }
        }
    }

    fn handle_error_code(&mut self, code: u16, against: u16) -> bool {
        match code {
            server_error::ID_INVALID => {
                // Unique id unknown upstream: fall back to account/device.
                self.session.send_identification = SendIdent::Account;
                true
            }
            server_error::ACCOUNT_ERROR
            | server_error::DEVICE_ERROR
            | server_error::ACCOUNT_INVALID
            | server_error::DEVICE_INVALID
            | server_error::ACCOUNT_INACTIVE
            | server_error::DEVICE_INACTIVE => {
                warn!("login error: account or device id rejected by server");
                self.session.severe_errors += 1;
                self.session.invalid_acct_errors += 1;
                true
            }
            server_error::PACKET_ENCODING => {
                let supported = self.props.get_u32(PROP_COMM_ENCODINGS, 0);
                if let Some(mask) = self.session.encoding.downgrade(supported) {
                    self.props
                        .set_u32(PROP_COMM_ENCODINGS, mask | REQUIRED_MASK);
                    if matches!(
                        against,
                        client::UNIQUE_ID | client::ACCOUNT_ID | client::DEVICE_ID
                    ) {
                        // The server never parsed who we are: resend the
                        // identification triple in the lower encoding.
                        self.session.send_identification = SendIdent::Unique;
                        self.session.ident_len = 0;
                        self.session.send_buf.clear();
                    }
                }
                true
            }
            server_error::PACKET_CHECKSUM | server_error::BLOCK_CHECKSUM => {
                self.session.checksum_errors += 1;
                if self.session.checksum_errors >= MAX_CHECKSUM_ERRORS {
                    self.session.severe_errors += 1;
                }
                true
            }
            server_error::PROTOCOL_ERROR => {
                warn!("protocol error: data unrecognized by server");
                self.session.severe_errors += 1;
                true
            }
            server_error::FORMAT_DEFINITION_INVALID
            | server_error::PACKET_LENGTH
            | server_error::PACKET_PAYLOAD
            | server_error::FORMAT_NOT_SUPPORTED
            | server_error::FORMAT_NOT_RECOGNIZED => {
                // The server could not parse the block: count it as
                // delivered and stop sending custom formats.
                let n = self.session.num_sent;
                let _ = self.acknowledge(n);
                warn!("format error: data format unrecognized by server");
                self.session.severe_errors += 1;
                self.props.set_bool(PROP_COMM_CUSTOM_FORMATS, false);
                true
            }
            _ => {
                warn!("unknown error 0x{code:04X} indicated by server");
                self.session.severe_errors += 1;
                false
            }
        }
    }
}

fn key_of(payload: &[u8]) -> u16 {
    if payload.len() >= 2 {
        u16::from_be_bytes([payload[0], payload[1]])
    } else {
        0
    }
}

/// Highest encoding the supported-encodings property advertises. ASCII
/// encodings always carry the per-line character checksum.
fn initial_encoding(props: &PropertyStore) -> SessionEncoding {
    let mask = props.get_u32(PROP_COMM_ENCODINGS, 0) | REQUIRED_MASK;
    let top = if mask & Encoding::Csv.mask() != 0 {
        Encoding::Csv
    } else if mask & Encoding::Hex.mask() != 0 {
        Encoding::Hex
    } else if mask & Encoding::Base64.mask() != 0 {
        Encoding::Base64
    } else {
        Encoding::Binary
    };
    SessionEncoding::new(top, top != Encoding::Binary)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ClockSync, CLOCK_SYNC_GPS};
    use crate::events::EventSink;
    use std::path::Path;

    fn engine(proto: u32) -> (ProtocolEngine, Arc<EventQueue>, Arc<PropertyStore>) {
        let props = Arc::new(PropertyStore::new(Path::new("/tmp")));
        props.set_u32(PROP_STATE_PROTOCOL, proto);
        props.set_string(PROP_STATE_ACCOUNT_ID, "fleet01");
        props.set_string(PROP_STATE_DEVICE_ID, "truck");
        let queue = Arc::new(EventQueue::new(
            256,
            std::env::temp_dir().join(format!("dmtp-proto-test-{proto}.bak")),
        ));
        let sink = EventSink::new(queue.clone(), props.clone());
        let clock = Arc::new(ClockSync::new(CLOCK_SYNC_GPS, 10));
        let link = Arc::new(LinkState::new());
        let eng = ProtocolEngine::new(
            props.clone(),
            clock,
            sink,
            link,
            Arc::new(Notify::new()),
            Arc::new(AtomicU32::new(0)),
        );
        (eng, queue, props)
    }

    fn sent_event(queue: &EventQueue, seq_offset: u32) {
        let mut data = vec![0xF0, 0x20];
        data.extend_from_slice(&(1_700_000_000u32 + seq_offset).to_be_bytes());
        data.push(0);
        let pkt = Packet {
            header_type: client::DMTSP_FORMAT_3,
            seq_pos: 6,
            seq_len: 1,
            data,
            ..Default::default()
        };
        assert!(queue.add_event(pkt, PacketPriority::Normal));
    }

    #[tokio::test]
    async fn udp_session_sends_ident_and_acks_partial_block() {
        let (mut eng, queue, _props) = engine(PROTO_VERSION_UDP);
        for i in 0..4 {
            sent_event(&queue, i);
        }

        let server = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let server_task = tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            let pkts: Vec<Packet> = FrameIter::new(&buf[..n]).collect();
            // ident triple + 4 events + EOB
            let types: Vec<u16> = pkts.iter().map(|p| p.header_type).collect();
            assert_eq!(types[0], client::UNIQUE_ID);
            assert_eq!(types[1], client::ACCOUNT_ID);
            assert_eq!(types[2], client::DEVICE_ID);
            assert_eq!(
                types
                    .iter()
                    .filter(|&&t| t == client::DMTSP_FORMAT_3)
                    .count(),
                4
            );
            assert_eq!(*types.last().unwrap(), client::EOB_DONE);
            // ACK the first two (sequences 0 and 1 -> low byte 0x01),
            // then end the dialog.
            let mut reply = Vec::new();
            Packet::new(server::ACK, vec![0x01]).encode_into(&mut reply);
            Packet::new(server::EOT, vec![]).encode_into(&mut reply);
            server.send_to(&reply, from).await.unwrap();
        });

        eng.urls.resolved_for_tests(addr);
        let outcome = tokio::time::timeout(Duration::from_secs(10), eng.udp_session())
            .await
            .unwrap();
        server_task.await.unwrap();

        // Two packets acknowledged; the unacknowledged tail went back to
        // unsent at close, ready for the next session.
        assert_eq!(outcome, SessionOutcome::Ok);
        let remaining: Vec<u32> = queue.with(|q| {
            let mut out = Vec::new();
            let mut cur = q.cursor();
            while let Some(p) = q.next_packet(&mut cur) {
                assert!(!p.is_sent());
                out.push(p.sequence);
            }
            out
        });
        assert_eq!(remaining, vec![2, 3]);
    }

    #[test]
    fn encoding_downgrade_changes_wire_bytes_and_resends_ident() {
        let (mut eng, _queue, props) = engine(PROTO_VERSION_UDP);
        props.set_u32(PROP_COMM_ENCODINGS, 0x0F); // all four advertised
        eng.session = Session::new(initial_encoding(&props));
        assert_eq!(eng.session.encoding.encoding, Encoding::Csv);

        // CSV on a datagram transport: one `$`-line per packet, comma
        // separator, templateless payload as a single hex field.
        let pkt = Packet::new(client::ACCOUNT_ID, b"fleet01".to_vec());
        eng.write_packet(&pkt);
        assert!(eng.session.send_buf.starts_with(b"$E012,"));
        eng.session.ident_len = 12;

        assert!(eng.handle_error_code(server_error::PACKET_ENCODING, client::ACCOUNT_ID));
        assert_eq!(eng.session.encoding.encoding, Encoding::Hex);
        assert_eq!(eng.session.send_identification, SendIdent::Unique);
        assert_eq!(eng.session.ident_len, 0);
        assert!(eng.session.send_buf.is_empty());
        let mask = props.get_u32(PROP_COMM_ENCODINGS, 0);
        assert_eq!(mask & Encoding::Csv.mask(), 0);
        assert!(props.is_dirty());

        // The retry goes out hex-encoded with its line checksum.
        eng.write_packet(&pkt);
        assert!(eng.session.send_buf.starts_with(b"$E012:"));
        assert!(eng.session.send_buf.contains(&b'*'));

        // Second NAK in the same session is ignored.
        assert!(eng.handle_error_code(server_error::PACKET_ENCODING, client::ACCOUNT_ID));
        assert_eq!(eng.session.encoding.encoding, Encoding::Hex);
    }

    #[test]
    fn default_encoding_is_binary_on_the_wire() {
        let (mut eng, _queue, _props) = engine(PROTO_VERSION_UDP);
        let pkt = Packet::new(client::UNIQUE_ID, vec![0x03]);
        eng.write_packet(&pkt);
        assert_eq!(eng.session.send_buf, vec![0xE0, 0x11, 0x01, 0x03]);
    }

    #[test]
    fn csv_session_opens_duplex_with_base64_first_packet() {
        let (mut eng, _queue, props) = engine(PROTO_VERSION_TCP);
        props.set_u32(PROP_COMM_ENCODINGS, 0x0F);
        eng.session = Session::new(initial_encoding(&props));

        let pkt = Packet::new(client::UNIQUE_ID, vec![0x03]);
        eng.write_packet(&pkt);
        // The first packet of a duplex session avoids CSV.
        assert!(eng.session.send_buf.starts_with(b"$E011="));

        eng.write_packet(&pkt);
        let second = eng
            .session
            .send_buf
            .iter()
            .position(|&b| b == b'\r')
            .unwrap()
            + 1;
        assert!(eng.session.send_buf[second..].starts_with(b"$E011,"));
    }

    #[test]
    fn three_checksum_naks_become_severe() {
        let (mut eng, _queue, _props) = engine(PROTO_VERSION_UDP);
        eng.handle_error_code(server_error::PACKET_CHECKSUM, 0);
        eng.handle_error_code(server_error::BLOCK_CHECKSUM, 0);
        assert_eq!(eng.session.severe_errors, 0);
        eng.handle_error_code(server_error::PACKET_CHECKSUM, 0);
        assert_eq!(eng.session.severe_errors, 1);
    }

    #[test]
    fn unknown_server_error_is_severe_and_stops_dialog() {
        let (mut eng, _queue, _props) = engine(PROTO_VERSION_UDP);
        assert!(!eng.handle_error_code(0x0BAD, 0));
        assert_eq!(eng.session.severe_errors, 1);
    }

    #[test]
    fn ack_arithmetic_wraps_modulo_256() {
        let (mut eng, _q, _p) = engine(PROTO_VERSION_UDP);
        eng.session.sequence_first = 0xFE;
        assert_eq!(eng.ack_count_from(0xFF), 2);
        assert_eq!(eng.ack_count_from(0x01), 4);
    }

    #[tokio::test]
    async fn tcp_eot_after_identification_sends_no_events() {
        let (mut eng, queue, _props) = engine(PROTO_VERSION_TCP);
        for i in 0..3 {
            sent_event(&queue, i);
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_task = tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = sock.read(&mut buf).await.unwrap();
            let got: Vec<Packet> = FrameIter::new(&buf[..n]).collect();
            assert!(got
                .iter()
                .all(|p| !client::is_event(p.header_type)));
            let mut reply = Vec::new();
            Packet::new(server::EOT, vec![]).encode_into(&mut reply);
            sock.write_all(&reply).await.unwrap();
            // Drain whatever else arrives until the client closes.
            let mut rest = Vec::new();
            let _ = tokio::time::timeout(
                Duration::from_secs(2),
                sock.read_to_end(&mut rest),
            )
            .await;
            let tail: Vec<Packet> = FrameIter::new(&rest).collect();
            assert!(tail.iter().all(|p| !client::is_event(p.header_type)));
        });

        eng.urls.resolved_for_tests(addr);
        let outcome = eng.tcp_session().await;
        server_task.await.unwrap();
        assert_eq!(outcome, SessionOutcome::Ok);
        // Nothing was acknowledged; everything is still queued unsent.
        assert_eq!(queue.with(|q| q.count()), 3);
        assert!(queue.with(|q| q.has_unsent()));
    }
}
