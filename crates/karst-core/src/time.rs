//! Tick-based day/night cycle.

use crate::data::{DataContainer, DataValue, intern_key};

/// World clock: 24000 ticks to a day, 20 ticks per second by default.
///
/// Time-of-day [0, 1): 0.0 dawn, 0.25 noon, 0.5 sunset, 0.75 midnight.
#[derive(Clone, Debug)]
pub struct WorldTime {
    total_ticks: i64,
    accumulator: f32,
    ticks_per_second: f32,
    time_speed: f32,
    frozen: bool,
}

impl Default for WorldTime {
    fn default() -> Self {
        Self {
            total_ticks: 0,
            accumulator: 0.0,
            ticks_per_second: 20.0,
            time_speed: 1.0,
            frozen: false,
        }
    }
}

impl WorldTime {
    pub const TICKS_PER_DAY: i64 = 24_000;
    pub const DAWN: i64 = 0;
    pub const NOON: i64 = 6_000;
    pub const SUNSET: i64 = 12_000;
    pub const MIDNIGHT: i64 = 18_000;

    pub fn new() -> Self {
        Self::default()
    }

    /// Advance by wall-clock seconds, honoring speed and freeze.
    pub fn advance(&mut self, delta_seconds: f32) {
        if self.frozen || delta_seconds <= 0.0 {
            return;
        }
        self.accumulator += delta_seconds * self.ticks_per_second * self.time_speed;
        let whole = self.accumulator.floor();
        if whole >= 1.0 {
            self.total_ticks += whole as i64;
            self.accumulator -= whole;
        }
    }

    #[inline]
    pub fn total_ticks(&self) -> i64 {
        self.total_ticks
    }

    #[inline]
    pub fn day_ticks(&self) -> i64 {
        self.total_ticks.rem_euclid(Self::TICKS_PER_DAY)
    }

    #[inline]
    pub fn day_number(&self) -> i64 {
        self.total_ticks.div_euclid(Self::TICKS_PER_DAY)
    }

    #[inline]
    pub fn time_of_day(&self) -> f32 {
        self.day_ticks() as f32 / Self::TICKS_PER_DAY as f32
    }

    #[inline]
    pub fn is_daytime(&self) -> bool {
        let t = self.day_ticks();
        (Self::DAWN..Self::SUNSET).contains(&t)
    }

    #[inline]
    pub fn is_nighttime(&self) -> bool {
        !self.is_daytime()
    }

    /// Ambient sky light for gameplay queries (0-15).
    pub fn sky_light_level(&self) -> u8 {
        (self.sky_brightness() * 15.0).round() as u8
    }

    /// Continuous sky brightness [0, 1] with short dawn/dusk ramps.
    pub fn sky_brightness(&self) -> f32 {
        const RAMP: f32 = 0.05;
        let t = self.time_of_day();
        if t < RAMP {
            t / RAMP
        } else if t < 0.5 - RAMP {
            1.0
        } else if t < 0.5 {
            (0.5 - t) / RAMP
        } else {
            0.0
        }
    }

    pub fn set_ticks_per_second(&mut self, tps: f32) {
        self.ticks_per_second = tps.max(0.0);
    }

    #[inline]
    pub fn ticks_per_second(&self) -> f32 {
        self.ticks_per_second
    }

    pub fn set_time_speed(&mut self, speed: f32) {
        self.time_speed = speed.max(0.0);
    }

    pub fn set_time(&mut self, ticks: i64) {
        self.total_ticks = ticks;
        self.accumulator = 0.0;
    }

    pub fn set_frozen(&mut self, frozen: bool) {
        self.frozen = frozen;
    }

    #[inline]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn save_to(&self, dc: &mut DataContainer) {
        dc.set(intern_key("time_ticks"), DataValue::I64(self.total_ticks));
        dc.set(
            intern_key("time_speed"),
            DataValue::F64(self.time_speed as f64),
        );
        dc.set(
            intern_key("time_frozen"),
            DataValue::I64(self.frozen as i64),
        );
    }

    pub fn load_from(dc: &DataContainer) -> WorldTime {
        let mut time = WorldTime::default();
        time.total_ticks = dc.get_i64(intern_key("time_ticks"), 0);
        time.time_speed = dc.get_f64(intern_key("time_speed"), 1.0) as f32;
        time.frozen = dc.get_i64(intern_key("time_frozen"), 0) != 0;
        time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_accumulates_fractional_ticks() {
        let mut t = WorldTime::new();
        t.advance(0.04); // 0.8 ticks at 20 tps
        assert_eq!(t.total_ticks(), 0);
        t.advance(0.04);
        assert_eq!(t.total_ticks(), 1);
    }

    #[test]
    fn day_boundaries() {
        let mut t = WorldTime::new();
        t.set_time(WorldTime::SUNSET);
        assert!(t.is_nighttime());
        t.set_time(WorldTime::NOON);
        assert!(t.is_daytime());
        assert_eq!(t.sky_light_level(), 15);
        t.set_time(WorldTime::TICKS_PER_DAY + 5);
        assert_eq!(t.day_number(), 1);
        assert_eq!(t.day_ticks(), 5);
    }

    #[test]
    fn frozen_time_does_not_advance() {
        let mut t = WorldTime::new();
        t.set_frozen(true);
        t.advance(10.0);
        assert_eq!(t.total_ticks(), 0);
    }

    #[test]
    fn persistence_roundtrip() {
        let mut t = WorldTime::new();
        t.set_time(12345);
        t.set_time_speed(2.0);
        let mut dc = DataContainer::new();
        t.save_to(&mut dc);
        let loaded = WorldTime::load_from(&dc);
        assert_eq!(loaded.total_ticks(), 12345);
    }
}
