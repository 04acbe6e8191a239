//! # checksum
//!
//! Fletcher checksum for DMTP block integrity and the XOR checksum used by
//! NMEA-0183 sentences.

// ── Fletcher ──────────────────────────────────────────────────────────────────

/// Running Fletcher checksum accumulated over every byte written to the
/// server since the last end-of-block. The two check bytes are chosen so the
/// whole block, check bytes included, sums to zero under the same recurrence.
#[derive(Debug, Default, Clone, Copy)]
pub struct Fletcher {
    c0: u8,
    c1: u8,
}

/// Length of the checksum carried by an EOB packet on stream transports.
pub const FLETCHER_CHECKSUM_LEN: usize = 2;

impl Fletcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn update(&mut self, data: &[u8]) {
        for &b in data {
            self.c0 = self.c0.wrapping_add(b);
            self.c1 = self.c1.wrapping_add(self.c0);
        }
    }

    /// Check bytes to place in the EOB payload.
    pub fn check_bytes(&self) -> [u8; FLETCHER_CHECKSUM_LEN] {
        [
            self.c0.wrapping_sub(self.c1),
            self.c1.wrapping_sub(self.c0.wrapping_mul(2)),
        ]
    }

    /// Verify a block that includes its own check bytes.
    pub fn is_valid(&self) -> bool {
        self.c0 == 0 && self.c1 == 0
    }
}

// ── Character XOR ─────────────────────────────────────────────────────────────

/// XOR of every byte between `$` and `*`, exclusive. NMEA sentences and
/// ASCII-encoded packet lines share this rule.
pub fn char_xor(line: &str) -> u8 {
    let body = line
        .strip_prefix('$')
        .unwrap_or(line)
        .split('*')
        .next()
        .unwrap_or("");
    body.bytes().fold(0u8, |acc, b| acc ^ b)
}

// ── NMEA ──────────────────────────────────────────────────────────────────────

pub fn nmea_checksum(sentence: &str) -> u8 {
    char_xor(sentence)
}

/// Validate a full `$...*HH` sentence. Sentences without a checksum field
/// are accepted; receivers in the field routinely omit it.
pub fn nmea_verify(line: &str) -> bool {
    let line = line.trim_end();
    match line.rsplit_once('*') {
        Some((_, hex_part)) if hex_part.len() >= 2 => {
            match u8::from_str_radix(&hex_part[..2], 16) {
                Ok(want) => nmea_checksum(line) == want,
                Err(_) => false,
            }
        }
        _ => true,
    }
}

/// Replace the `*..` tail of an outgoing receiver command with its computed
/// checksum and line terminator.
pub fn nmea_finalize(msg: &mut String) {
    if let Some(star) = msg.rfind('*') {
        let sum = nmea_checksum(&msg[..star]);
        msg.truncate(star + 1);
        msg.push_str(&format!("{sum:02X}\r\n"));
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fletcher_block_sums_to_zero() {
        let mut f = Fletcher::new();
        f.update(b"\xE0\x11\x01\x02\xE0\x12\x03abc");
        let check = f.check_bytes();
        f.update(&check);
        assert!(f.is_valid());
    }

    #[test]
    fn fletcher_detects_corruption() {
        let mut f = Fletcher::new();
        f.update(b"\xE0\x11\x01\x02");
        let check = f.check_bytes();
        let mut g = Fletcher::new();
        g.update(b"\xE0\x11\x01\x03");
        g.update(&check);
        assert!(!g.is_valid());
    }

    #[test]
    fn nmea_known_vector() {
        // Reference sentence from a SiRF receiver log.
        let line = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";
        assert!(nmea_verify(line));
        assert!(!nmea_verify(&line.replace("4807", "4808")));
    }

    #[test]
    fn nmea_finalize_overwrites_placeholder() {
        let mut msg = String::from("$PSRF104,43.493125,-80.204365,346.3,96000,302400,2300,12,3*99");
        nmea_finalize(&mut msg);
        assert!(msg.ends_with("\r\n"));
        assert!(nmea_verify(msg.trim_end()));
    }
}
