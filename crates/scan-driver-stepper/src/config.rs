//! Per-axis stage configuration and position arithmetic.

use scan_core::{ScanError, ScanResult};
use serde::{Deserialize, Serialize};

/// Full steps per motor revolution.
pub const STEPS_PER_REV: u32 = 200;

/// Mechanical kind of an axis, which decides how positions map to revolutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisKind {
    /// Lead screw: `relation` is the travel per revolution.
    Linear,
    /// Gear train: `relation` is motor revolutions per output revolution.
    #[serde(alias = "rotatory")]
    Rotary,
}

impl AxisKind {
    /// Motor revolutions needed to reach `position`.
    pub fn revolutions(self, position: f64, relation: f64) -> f64 {
        match self {
            AxisKind::Linear => position / relation,
            AxisKind::Rotary => position / 360.0 * relation,
        }
    }

    /// Unit of positions on this kind of axis.
    pub fn unit(self) -> &'static str {
        match self {
            AxisKind::Linear => "mm",
            AxisKind::Rotary => "deg",
        }
    }
}

/// Configuration of one stage axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Axis kind (`linear` or `rotary`).
    #[serde(rename = "type")]
    pub kind: AxisKind,
    /// Travel per revolution (linear) or gear ratio (rotary).
    pub relation: f64,
    /// Driver microstepping factor.
    pub microstep: u32,
    /// First sweep position.
    pub start: f64,
    /// Last sweep position (inclusive when reachable by whole steps).
    pub end: f64,
    /// Sweep increment.
    pub step_size: f64,
    /// Cruise speed in steps per second.
    pub speed: f64,
    /// Speed ceiling in steps per second.
    pub max_speed: f64,
    /// Acceleration in steps per second squared.
    pub acceleration: f64,
    /// Seconds to wait for a move acknowledgement; falls back to the link timeout.
    #[serde(default)]
    pub while_timeout: Option<f64>,
}

impl StageConfig {
    /// Signed microstep count for an absolute position, truncated toward zero.
    ///
    /// Pure: does not touch any stage state.
    pub fn position_to_steps(&self, position: f64) -> i64 {
        let revolutions = self.kind.revolutions(position, self.relation);
        (revolutions * f64::from(STEPS_PER_REV) * f64::from(self.microstep)) as i64
    }

    /// The positions this axis visits during a sweep.
    pub fn positions(&self) -> Vec<f64> {
        enumerate_positions(self.start, self.end, self.step_size)
    }

    /// Check the values a stage cannot work with.
    pub fn validate(&self, name: &str) -> ScanResult<()> {
        let fail = |message: &str| Err(ScanError::Configuration(format!("{name}: {message}")));

        if !positive(self.relation) {
            return fail("relation must be greater than 0");
        }
        if self.microstep == 0 {
            return fail("microstep must be at least 1");
        }
        if !positive(self.step_size) {
            return fail("step_size must be greater than 0");
        }
        if self.end < self.start {
            return fail("end must not be smaller than start");
        }
        if ![self.speed, self.max_speed, self.acceleration]
            .into_iter()
            .all(positive)
        {
            return fail("speed, max_speed and acceleration must be greater than 0");
        }
        if self.while_timeout.is_some_and(|t| !positive(t)) {
            return fail("while_timeout must be greater than 0");
        }
        Ok(())
    }
}

/// Arithmetic progression `start, start + step, ...` up to and including
/// `end` when `end` is reachable.
///
/// Length is `floor((end - start) / step) + 1`, with a small tolerance so that
/// decimal steps like 0.1 do not lose their last point to rounding. An empty
/// vector is returned for a non-positive step or `end < start`.
pub fn enumerate_positions(start: f64, end: f64, step: f64) -> Vec<f64> {
    if !positive(step) || end < start {
        return Vec::new();
    }
    let count = ((end - start) / step + 1e-9).floor() as usize + 1;
    (0..count).map(|i| start + i as f64 * step).collect()
}

fn positive(value: f64) -> bool {
    value > 0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear(relation: f64, microstep: u32) -> StageConfig {
        StageConfig {
            kind: AxisKind::Linear,
            relation,
            microstep,
            start: 0.0,
            end: 10.0,
            step_size: 2.5,
            speed: 400.0,
            max_speed: 800.0,
            acceleration: 200.0,
            while_timeout: None,
        }
    }

    #[test]
    fn test_linear_steps() {
        let cfg = linear(8.0, 16);
        // 10 mm / 8 mm per rev * 200 * 16
        assert_eq!(cfg.position_to_steps(10.0), 4000);
        assert_eq!(cfg.position_to_steps(0.0), 0);
    }

    #[test]
    fn test_rotary_steps() {
        let cfg = StageConfig {
            kind: AxisKind::Rotary,
            relation: 10.0,
            microstep: 1,
            ..linear(1.0, 1)
        };
        assert_eq!(cfg.position_to_steps(90.0), 500);
        assert_eq!(cfg.position_to_steps(360.0), 2000);
    }

    #[test]
    fn test_steps_truncate_toward_zero() {
        let cfg = linear(3.0, 1);
        assert_eq!(cfg.position_to_steps(1.0), 66);
        assert_eq!(cfg.position_to_steps(-1.0), -66);
    }

    #[test]
    fn test_enumerate_positions_inclusive() {
        assert_eq!(enumerate_positions(0.0, 10.0, 2.5), vec![0.0, 2.5, 5.0, 7.5, 10.0]);
    }

    #[test]
    fn test_enumerate_positions_end_not_reachable() {
        let positions = enumerate_positions(1.0, 2.0, 0.3);
        assert_eq!(positions.len(), 4);
        assert!(positions.iter().all(|p| *p <= 2.0));
    }

    #[test]
    fn test_enumerate_positions_decimal_step() {
        let positions = enumerate_positions(0.0, 1.0, 0.1);
        assert_eq!(positions.len(), 11);
        assert!((positions[10] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_enumerate_positions_degenerate() {
        assert_eq!(enumerate_positions(5.0, 5.0, 1.0), vec![5.0]);
        assert!(enumerate_positions(5.0, 4.0, 1.0).is_empty());
        assert!(enumerate_positions(0.0, 4.0, 0.0).is_empty());
    }

    #[test]
    fn test_rotatory_alias_deserializes() {
        #[derive(Deserialize)]
        struct Wrapper {
            kind: AxisKind,
        }
        let w: Wrapper = from_pair("rotatory");
        assert_eq!(w.kind, AxisKind::Rotary);

        fn from_pair(value: &str) -> Wrapper {
            use serde::de::value::{Error, MapDeserializer};
            let map = MapDeserializer::<_, Error>::new(std::iter::once(("kind", value)));
            Wrapper::deserialize(map).unwrap()
        }
    }

    #[test]
    fn test_validate() {
        assert!(linear(8.0, 16).validate("motorX").is_ok());

        let err = linear(0.0, 16).validate("motorX").unwrap_err();
        assert!(err.to_string().contains("motorX: relation"));

        let mut cfg = linear(8.0, 16);
        cfg.end = -1.0;
        assert!(cfg.validate("motorY").is_err());

        let mut cfg = linear(8.0, 16);
        cfg.step_size = 0.0;
        assert!(cfg.validate("motorZ").is_err());
    }
}
