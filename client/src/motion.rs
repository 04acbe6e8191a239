//! # motion
//!
//! Motion event derivation from successive GPS fixes.
//!
//! The checker compares each new fix against the last "motion fix" and
//! drives a start / in-motion / stop / dormant cycle. Two start definitions
//! are supported (speed threshold or distance from the last motion fix) and
//! two stop definitions (first below-threshold sample, or a delay of
//! continuous below-threshold samples).
//!
//! Invariant: two `MotionStart` events are always separated by a
//! `MotionStop`.

use std::sync::Arc;

use dmtp_codec::packet::PacketPriority;
use dmtp_codec::status::status;

use crate::events::EventSink;
use crate::gps::Fix;
use crate::props::{
    PropertyStore, PROP_GPS_DISTANCE_DELTA, PROP_GPS_SAMPLE_RATE, PROP_MOTION_DORMANT_COUNT,
    PROP_MOTION_DORMANT_INTRVL, PROP_MOTION_EXCESS_SPEED, PROP_MOTION_IN_MOTION,
    PROP_MOTION_START, PROP_MOTION_START_TYPE, PROP_MOTION_STOP, PROP_MOTION_STOP_TYPE,
};

/// Start on GPS speed crossing the threshold (kph).
pub const MOTION_START_GPS_KPH: u32 = 0;
/// Start on distance from the last motion fix (meters).
pub const MOTION_START_GPS_METERS: u32 = 1;

pub const MOTION_STOP_WHEN_STOPPED: u32 = 0;
pub const MOTION_STOP_AFTER_DELAY: u32 = 1;

/// Once excess speed triggers, the vehicle must slow this far below the
/// limit before the indicator re-arms.
const EXCESS_SPEED_SETBACK: f64 = 5.0;

pub struct MotionChecker {
    sink: EventSink,
    props: Arc<PropertyStore>,
    is_in_motion: bool,
    is_dormant: bool,
    excess_latched: bool,
    last_motion_fix: Fix,
    stop_timer: u32,
    in_motion_cycle: u32,
    dormant_cycle: u32,
    dormant_count: u32,
}

impl MotionChecker {
    pub fn new(sink: EventSink, props: Arc<PropertyStore>) -> Self {
        Self {
            sink,
            props,
            is_in_motion: false,
            is_dormant: false,
            excess_latched: false,
            last_motion_fix: Fix::default(),
            stop_timer: 0,
            in_motion_cycle: 0,
            dormant_cycle: 0,
            dormant_count: 0,
        }
    }

    /// Forget all motion state, e.g. after losing the GPS signal.
    pub fn reset_status(&mut self) {
        self.is_in_motion = false;
        self.stop_timer = 0;
        self.dormant_count = 0;
        self.excess_latched = false;
        self.last_motion_fix = Fix::default();
    }

    fn sample_rate(&self) -> u32 {
        self.props.get_u32(PROP_GPS_SAMPLE_RATE, 10).max(2)
    }

    /// Seconds-to-cycles conversion aligned to the GPS sample rate.
    fn cycles(&self, seconds: u32) -> u32 {
        let rate = self.sample_rate();
        let seconds = if seconds == 0 { u16::MAX as u32 } else { seconds };
        seconds.div_ceil(rate)
    }

    fn emit(&self, code: u16, now: i64, fix: &Fix) {
        self.sink
            .gps_event_at(PacketPriority::Normal, code, now.max(0) as u32, fix);
    }

    /// Emit the periodic while-moving event, excess speed taking precedence.
    fn in_motion_event(&mut self, speed_kph: f64, now: i64, fix: &Fix) {
        let limit = self.props.get_f64(PROP_MOTION_EXCESS_SPEED, 120.0);
        let trigger = if self.excess_latched {
            limit - EXCESS_SPEED_SETBACK
        } else {
            limit
        };
        if speed_kph > trigger {
            self.excess_latched = true;
            self.emit(status::MOTION_EXCESS_SPEED, now, fix);
        } else {
            self.excess_latched = false;
            self.emit(status::MOTION_IN_MOTION, now, fix);
        }
    }

    /// Examine one fix transition. `now` is the wall-clock second of the
    /// sample; fixes arrive one per GPS sample period.
    pub fn check(&mut self, old_fix: &Fix, new_fix: &Fix, now: i64) {
        let speed_kph = new_fix.speed_kph;
        let start_type = self.props.get_u32(PROP_MOTION_START_TYPE, MOTION_START_GPS_KPH);
        let start_threshold = self.props.get_f64(PROP_MOTION_START, 0.0);

        let mut is_moving = if start_type == MOTION_START_GPS_METERS {
            old_fix.point.meters_to(&new_fix.point) > start_threshold
        } else {
            speed_kph > start_threshold
        };

        if !self.last_motion_fix.point.is_valid() {
            self.last_motion_fix = new_fix.clone();
        }

        // A dormant vehicle re-arms on displacement alone; a stationary
        // receiver drifting within the distance delta stays dormant.
        if self.is_dormant {
            let delta = self.props.get_u32(PROP_GPS_DISTANCE_DELTA, 150).max(30) as f64;
            if self.last_motion_fix.point.meters_to(&new_fix.point) >= delta {
                is_moving = true;
            }
        }

        if is_moving {
            if !self.is_in_motion {
                self.is_in_motion = true;
                self.is_dormant = false;
                self.in_motion_cycle = 0;
                self.emit(status::MOTION_START, now, new_fix);
            } else {
                self.in_motion_cycle += 1;
                let interval = self.cycles(self.props.get_u32(PROP_MOTION_IN_MOTION, 0));
                if self.in_motion_cycle >= interval {
                    self.in_motion_event(speed_kph, now, new_fix);
                    self.in_motion_cycle = 0;
                }
            }
            self.last_motion_fix = new_fix.clone();
            self.stop_timer = 0;
        } else if self.is_in_motion {
            self.stop_timer += 1;
            let stop_type = self.props.get_u32(PROP_MOTION_STOP_TYPE, MOTION_STOP_WHEN_STOPPED);
            let stop_cycles = if stop_type == MOTION_STOP_WHEN_STOPPED {
                0
            } else {
                self.props.get_u32(PROP_MOTION_STOP, 0) / self.sample_rate()
            };
            if self.stop_timer >= stop_cycles {
                self.emit(status::MOTION_STOP, now, new_fix);
                self.is_in_motion = false;
                self.dormant_count = 0;
                self.dormant_cycle = 0;
            } else {
                // Still officially moving through the stop delay: keep the
                // in-motion cadence alive.
                self.in_motion_cycle += 1;
                let interval = self.cycles(self.props.get_u32(PROP_MOTION_IN_MOTION, 0));
                if self.in_motion_cycle >= interval {
                    self.in_motion_event(speed_kph, now, new_fix);
                    self.in_motion_cycle = 0;
                }
            }
        } else {
            let raw_interval = self.props.get_u32(PROP_MOTION_DORMANT_INTRVL, 0);
            let max_count = self.props.get_u32(PROP_MOTION_DORMANT_COUNT, 0);
            if self.dormant_count < max_count && raw_interval > 0 {
                let interval = self.cycles(raw_interval);
                self.dormant_cycle += 1;
                if self.dormant_cycle >= interval {
                    self.emit(status::MOTION_DORMANT, now, new_fix);
                    self.dormant_count += 1;
                    self.dormant_cycle = 0;
                    self.is_dormant = true;
                    self.last_motion_fix = new_fix.clone();
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EventQueue;
    use dmtp_codec::GpsPoint;
    use std::path::Path;

    fn fix(lat: f64, lon: f64, speed: f64) -> Fix {
        Fix {
            point: GpsPoint::new(lat, lon),
            speed_kph: speed,
            fixtime: 1_700_000_000,
            ..Default::default()
        }
    }

    fn harness() -> (MotionChecker, Arc<EventQueue>, Arc<PropertyStore>) {
        let queue = Arc::new(EventQueue::new(
            256,
            std::env::temp_dir().join("dmtp-motion-test.bak"),
        ));
        let props = Arc::new(PropertyStore::new(Path::new("/tmp")));
        props.set_string(PROP_MOTION_START, "8.0");
        props.set_u32(PROP_GPS_SAMPLE_RATE, 10);
        props.set_u32(PROP_MOTION_IN_MOTION, 30); // 3 cycles
        let sink = EventSink::new(queue.clone(), props.clone());
        (MotionChecker::new(sink, props.clone()), queue, props)
    }

    fn statuses(queue: &EventQueue) -> Vec<u16> {
        queue.with(|q| {
            let mut out = Vec::new();
            let mut cur = q.cursor();
            while let Some(p) = q.next_packet(&mut cur) {
                out.push(u16::from_be_bytes([p.data[0], p.data[1]]));
            }
            out
        })
    }

    #[test]
    fn single_start_for_monotonic_motion() {
        let (mut mc, queue, _props) = harness();
        let base = fix(43.5, -80.2, 0.0);
        let mut now = 1_700_000_000;
        let mut prev = base.clone();
        for i in 0..8 {
            let f = fix(43.5 + i as f64 * 0.001, -80.2, 20.0 + i as f64);
            mc.check(&prev, &f, now);
            prev = f;
            now += 10;
        }
        let got = statuses(&queue);
        assert_eq!(
            got.iter().filter(|&&s| s == status::MOTION_START).count(),
            1
        );
        assert!(!got.contains(&status::MOTION_STOP));
        // in-motion events every 3 cycles after the start
        assert!(got.contains(&status::MOTION_IN_MOTION));
    }

    #[test]
    fn excess_speed_only_at_interval() {
        let (mut mc, queue, props) = harness();
        props.set_string(PROP_MOTION_EXCESS_SPEED, "100.0");
        let mut now = 1_700_000_000;
        let mut prev = fix(43.5, -80.2, 0.0);
        for _ in 0..7 {
            let f = fix(43.5, -80.2, 130.0);
            mc.check(&prev, &f, now);
            prev = f;
            now += 10;
        }
        let got = statuses(&queue);
        // start, then excess at cycles 3 and 6: never in-motion while above limit
        assert_eq!(got[0], status::MOTION_START);
        assert_eq!(
            got.iter()
                .filter(|&&s| s == status::MOTION_EXCESS_SPEED)
                .count(),
            2
        );
        assert!(!got.contains(&status::MOTION_IN_MOTION));
    }

    #[test]
    fn immediate_stop_when_stop_type_zero() {
        let (mut mc, queue, _props) = harness();
        let mut now = 1_700_000_000;
        let moving = fix(43.5, -80.2, 30.0);
        let still = fix(43.5, -80.2, 0.0);
        mc.check(&still, &moving, now);
        now += 10;
        mc.check(&moving, &still, now);
        let got = statuses(&queue);
        assert_eq!(got, vec![status::MOTION_START, status::MOTION_STOP]);
    }

    #[test]
    fn delayed_stop_waits_for_continuous_stillness() {
        let (mut mc, queue, props) = harness();
        props.set_u32(PROP_MOTION_STOP_TYPE, MOTION_STOP_AFTER_DELAY);
        props.set_u32(PROP_MOTION_STOP, 30); // 3 cycles at 10s
        let mut now = 1_700_000_000;
        let moving = fix(43.5, -80.2, 30.0);
        let still = fix(43.5, -80.2, 0.0);
        mc.check(&still, &moving, now);
        for _ in 0..2 {
            now += 10;
            mc.check(&moving, &still, now);
            assert!(!statuses(&queue).contains(&status::MOTION_STOP));
        }
        now += 10;
        mc.check(&moving, &still, now);
        assert!(statuses(&queue).contains(&status::MOTION_STOP));
    }

    #[test]
    fn dormant_count_is_bounded() {
        let (mut mc, queue, props) = harness();
        props.set_u32(PROP_MOTION_DORMANT_INTRVL, 20); // 2 cycles
        props.set_u32(PROP_MOTION_DORMANT_COUNT, 2);
        let still = fix(43.5, -80.2, 0.0);
        let mut now = 1_700_000_000;
        for _ in 0..20 {
            mc.check(&still, &still, now);
            now += 10;
        }
        let dormants = statuses(&queue)
            .iter()
            .filter(|&&s| s == status::MOTION_DORMANT)
            .count();
        assert_eq!(dormants, 2);
    }

    #[test]
    fn distance_start_type_triggers_on_displacement() {
        let (mut mc, queue, props) = harness();
        props.set_u32(PROP_MOTION_START_TYPE, MOTION_START_GPS_METERS);
        props.set_string(PROP_MOTION_START, "100.0");
        let a = fix(43.5000, -80.2, 0.0);
        // ~220 m north
        let b = fix(43.5020, -80.2, 0.0);
        mc.check(&a, &b, 1_700_000_000);
        assert_eq!(statuses(&queue), vec![status::MOTION_START]);
    }
}
