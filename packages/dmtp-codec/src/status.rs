//! # status
//!
//! Event status codes and the client/server error code vocabulary.
//!
//! Status codes ride in the first two payload bytes of every event packet.
//! Server errors arrive in `server::ERROR` packets; client errors go out in
//! `client::ERROR` packets.

// ── Event status codes ────────────────────────────────────────────────────────

pub mod status {
    /// First valid fix after startup.
    pub const INITIALIZED: u16 = 0xF010;
    pub const LOCATION: u16 = 0xF020;

    pub const MOTION_START: u16 = 0xF111;
    pub const MOTION_IN_MOTION: u16 = 0xF112;
    pub const MOTION_STOP: u16 = 0xF113;
    pub const MOTION_DORMANT: u16 = 0xF114;
    pub const MOTION_EXCESS_SPEED: u16 = 0xF11A;

    /// Free-form client diagnostic message (format 3 text payload).
    pub const CLIENT_DIAGNOSTIC_MSG: u16 = 0xF8A0;
    pub const CLIENT_REBOOT: u16 = 0xF8B0;
    pub const CLIENT_UPDATE_OK: u16 = 0xF8B1;
    pub const CLIENT_UPDATE_FAILED: u16 = 0xF8B2;
}

// ── Server NAK codes ──────────────────────────────────────────────────────────

pub mod server_error {
    /// Unique ID not recognized; retry with account/device identification.
    pub const ID_INVALID: u16 = 0xF011;
    pub const ACCOUNT_ERROR: u16 = 0xF021;
    pub const DEVICE_ERROR: u16 = 0xF022;
    pub const ACCOUNT_INVALID: u16 = 0xF023;
    pub const DEVICE_INVALID: u16 = 0xF024;
    pub const ACCOUNT_INACTIVE: u16 = 0xF025;
    pub const DEVICE_INACTIVE: u16 = 0xF026;

    pub const PACKET_HEADER: u16 = 0xF111;
    pub const PACKET_TYPE: u16 = 0xF112;
    pub const PACKET_LENGTH: u16 = 0xF113;
    pub const PACKET_ENCODING: u16 = 0xF114;
    pub const PACKET_PAYLOAD: u16 = 0xF115;
    pub const PACKET_CHECKSUM: u16 = 0xF116;
    pub const BLOCK_CHECKSUM: u16 = 0xF117;
    pub const PROTOCOL_ERROR: u16 = 0xF118;

    pub const FORMAT_DEFINITION_INVALID: u16 = 0xF121;
    pub const FORMAT_NOT_SUPPORTED: u16 = 0xF122;
    pub const FORMAT_NOT_RECOGNIZED: u16 = 0xF123;
}

// ── Client error codes ────────────────────────────────────────────────────────

pub mod client_error {
    pub const PACKET_HEADER: u16 = 0xF111;
    pub const PACKET_TYPE: u16 = 0xF112;
    pub const PROPERTY_READ_ONLY: u16 = 0xF201;
    pub const PROPERTY_INVALID_ID: u16 = 0xF202;
    pub const PROPERTY_INVALID_VALUE: u16 = 0xF203;
    pub const COMMAND_INVALID: u16 = 0xF311;
    pub const COMMAND_ERROR: u16 = 0xF321;
    /// GPS fix older than the expiration interval.
    pub const GPS_EXPIRED: u16 = 0xF911;
    /// Nothing received from the GPS receiver at all.
    pub const GPS_FAILURE: u16 = 0xF912;
}
