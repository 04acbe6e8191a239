//! # nmea
//!
//! NMEA-0183 sentence parsing for the GPS task.
//!
//! Only the three sentences the fix assembler consumes are decoded: `GPRMC`
//! (validity, speed, heading, UTC date/time), `GPGGA` (position, altitude,
//! fix type, HDOP) and `GPGSA` (DOP triple). Anything else is ignored.

use chrono::NaiveDate;
use dmtp_codec::checksum::nmea_verify;
use dmtp_codec::GpsPoint;

pub const NMEA_GPRMC: u32 = 0x0001;
pub const NMEA_GPGGA: u32 = 0x0002;
pub const NMEA_GPGSA: u32 = 0x0004;

const KM_PER_KNOT: f64 = 1.852;

#[derive(Debug, Clone, PartialEq)]
pub struct RmcData {
    pub valid: bool,
    /// UTC seconds from the RMC date and time fields.
    pub fixtime: i64,
    pub speed_kph: f64,
    pub heading: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GgaData {
    /// 0 = no fix; 1/2 = GPS/DGPS.
    pub fix_quality: u8,
    pub point: Option<GpsPoint>,
    pub altitude: f64,
    pub hdop: f64,
    pub sat_count: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GsaData {
    pub pdop: f64,
    pub hdop: f64,
    pub vdop: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Sentence {
    Rmc(RmcData),
    Gga(GgaData),
    Gsa(GsaData),
}

/// Parse one sentence. Returns `None` for unknown talkers/types, malformed
/// fields, or a failed checksum.
pub fn parse(line: &str) -> Option<Sentence> {
    let line = line.trim();
    if !line.starts_with('$') || !nmea_verify(line) {
        return None;
    }
    let body = line[1..].split('*').next()?;
    let fields: Vec<&str> = body.split(',').collect();
    match *fields.first()? {
        "GPRMC" => parse_rmc(&fields),
        "GPGGA" => parse_gga(&fields),
        "GPGSA" => parse_gsa(&fields),
        _ => None,
    }
}

// ── Field helpers ─────────────────────────────────────────────────────────────

fn num(fields: &[&str], idx: usize) -> Option<f64> {
    fields.get(idx)?.trim().parse().ok()
}

fn num_or_zero(fields: &[&str], idx: usize) -> f64 {
    num(fields, idx).unwrap_or(0.0)
}

/// NMEA `ddmm.mmmm` to signed decimal degrees.
/// Degrees are the digits left of the two-digit minute field.
fn parse_coord(raw: &str, hemi: &str) -> Option<f64> {
    let v: f64 = raw.trim().parse().ok()?;
    let deg = (v / 100.0).trunc();
    let minutes = v - deg * 100.0;
    let dec = deg + minutes / 60.0;
    match hemi.trim() {
        "N" | "E" => Some(dec),
        "S" | "W" => Some(-dec),
        _ => None,
    }
}

fn parse_rmc(fields: &[&str]) -> Option<Sentence> {
    let valid = fields.get(2).map(|f| f.trim() == "A").unwrap_or(false);
    if !valid {
        return Some(Sentence::Rmc(RmcData {
            valid: false,
            fixtime: 0,
            speed_kph: 0.0,
            heading: 0.0,
        }));
    }
    let fixtime = rmc_utc(fields.get(1)?, fields.get(9)?)?;
    Some(Sentence::Rmc(RmcData {
        valid: true,
        fixtime,
        speed_kph: num_or_zero(fields, 7) * KM_PER_KNOT,
        heading: num_or_zero(fields, 8),
    }))
}

/// Combine `hhmmss(.sss)` and `ddmmyy` into UTC seconds.
fn rmc_utc(time: &str, date: &str) -> Option<i64> {
    let t = time.trim().split('.').next()?;
    if t.len() < 6 || date.trim().len() < 6 {
        return None;
    }
    let (h, m, s) = (t[0..2].parse().ok()?, t[2..4].parse().ok()?, t[4..6].parse().ok()?);
    let d = date.trim();
    let (day, mon, yy): (u32, u32, i32) =
        (d[0..2].parse().ok()?, d[2..4].parse().ok()?, d[4..6].parse().ok()?);
    let year = if yy < 70 { 2000 + yy } else { 1900 + yy };
    let dt = NaiveDate::from_ymd_opt(year, mon, day)?.and_hms_opt(h, m, s)?;
    Some(dt.and_utc().timestamp())
}

fn parse_gga(fields: &[&str]) -> Option<Sentence> {
    let fix_quality = fields
        .get(6)
        .and_then(|f| f.trim().parse::<u8>().ok())
        .unwrap_or(0);
    if fix_quality == 0 {
        return Some(Sentence::Gga(GgaData {
            fix_quality: 0,
            point: None,
            altitude: 0.0,
            hdop: 0.0,
            sat_count: 0,
        }));
    }
    let lat = parse_coord(fields.get(2)?, fields.get(3)?)?;
    let lon = parse_coord(fields.get(4)?, fields.get(5)?)?;
    Some(Sentence::Gga(GgaData {
        fix_quality,
        point: Some(GpsPoint::new(lat, lon)),
        altitude: num_or_zero(fields, 9),
        hdop: num_or_zero(fields, 8),
        sat_count: num_or_zero(fields, 7) as u8,
    }))
}

fn parse_gsa(fields: &[&str]) -> Option<Sentence> {
    // Mode 1 means no fix; the DOP fields trail the twelve SV slots.
    let mode: u8 = fields.get(2).and_then(|f| f.trim().parse().ok())?;
    if mode <= 1 {
        return None;
    }
    Some(Sentence::Gsa(GsaData {
        pdop: num_or_zero(fields, 15),
        hdop: num_or_zero(fields, 16),
        vdop: num_or_zero(fields, 17),
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rmc_valid_fix() {
        let s = parse("$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A");
        let Some(Sentence::Rmc(rmc)) = s else {
            panic!("expected RMC, got {s:?}")
        };
        assert!(rmc.valid);
        assert!((rmc.speed_kph - 22.4 * 1.852).abs() < 1e-6);
        assert!((rmc.heading - 84.4).abs() < 1e-6);
        // 1994-03-23T12:35:19Z
        assert_eq!(rmc.fixtime, 764_426_119);
    }

    #[test]
    fn rmc_void_fix_reports_invalid() {
        let s = parse("$GPRMC,123519,V,,,,,,,230394,,");
        assert_eq!(
            s,
            Some(Sentence::Rmc(RmcData {
                valid: false,
                fixtime: 0,
                speed_kph: 0.0,
                heading: 0.0
            }))
        );
    }

    #[test]
    fn gga_position_and_altitude() {
        let s = parse("$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47");
        let Some(Sentence::Gga(gga)) = s else {
            panic!("expected GGA, got {s:?}")
        };
        assert_eq!(gga.fix_quality, 1);
        let p = gga.point.unwrap();
        // 48 deg 7.038 min = 48.1173
        assert!((p.latitude - 48.1173).abs() < 1e-4);
        assert!((p.longitude - 11.5166667).abs() < 1e-4);
        assert!((gga.altitude - 545.4).abs() < 1e-9);
        assert_eq!(gga.sat_count, 8);
    }

    #[test]
    fn gga_without_fix_has_no_point() {
        let s = parse("$GPGGA,123519,,,,,0,00,,,M,,M,,");
        let Some(Sentence::Gga(gga)) = s else {
            panic!()
        };
        assert_eq!(gga.fix_quality, 0);
        assert!(gga.point.is_none());
    }

    #[test]
    fn gsa_dop_triple() {
        let s = parse("$GPGSA,A,3,04,05,,09,12,,,24,,,,,2.5,1.3,2.1*39");
        let Some(Sentence::Gsa(gsa)) = s else {
            panic!("expected GSA, got {s:?}")
        };
        assert!((gsa.pdop - 2.5).abs() < 1e-9);
        assert!((gsa.hdop - 1.3).abs() < 1e-9);
        assert!((gsa.vdop - 2.1).abs() < 1e-9);
    }

    #[test]
    fn southern_western_hemispheres_are_negative() {
        assert!(parse_coord("3351.123", "S").unwrap() < 0.0);
        assert!(parse_coord("15112.000", "W").unwrap() < 0.0);
    }

    #[test]
    fn bad_checksum_is_dropped() {
        assert_eq!(
            parse("$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*00"),
            None
        );
    }
}
