// src/config/mod.rs - Motion pipeline configuration
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::motion::axis::{AXIS_NAMES, NUM_AXES};

/// Complete configuration of the motion pipeline.
///
/// Loaded once at startup from TOML; every field has a sensible default so a
/// partial file (or none at all) yields a working Cartesian machine. Per-axis
/// arrays are ordered X, Y, Z, E.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Steps per millimeter for each axis.
    pub steps_per_mm: [f64; NUM_AXES],

    /// Maximum feedrate per axis (mm/s).
    pub max_feedrate: [f64; NUM_AXES],

    /// Feedrate used by homing moves per axis (mm/s).
    pub homing_feedrate: [f64; NUM_AXES],

    /// Peak acceleration for printing moves per axis (mm/s^2).
    pub max_acceleration: [f64; NUM_AXES],

    /// Peak acceleration for travel moves per axis (mm/s^2).
    pub max_travel_acceleration: [f64; NUM_AXES],

    /// Junction speed allowance per axis (mm/s). The instantaneous speed
    /// change on an axis across a junction may not exceed this.
    pub max_yank: [f64; NUM_AXES],

    /// Lower position bound per axis (mm). E is unbounded in practice.
    pub min_pos: [f64; NUM_AXES],

    /// Upper position bound per axis (mm).
    pub max_pos: [f64; NUM_AXES],

    /// Homing direction per axis: -1 toward min, 1 toward max, 0 not homed.
    pub home_dir: [i8; NUM_AXES],

    /// Backlash distance per axis (mm), folded in when an axis reverses.
    pub backlash: [f64; NUM_AXES],

    /// Pressure advance coefficient (seconds): extra extruder travel is
    /// `advance * extrusion_speed`. Zero disables advance.
    pub pressure_advance: f64,

    /// Frequency of the segment-generator tick (Hz). One micro-slice of
    /// duration `1 / prepare_frequency` is produced per tick.
    pub prepare_frequency: u32,

    /// Base frequency of the step tick (Hz). Wait durations are counted in
    /// these granules and slice tick counts are sized against it.
    pub step_frequency: u32,

    /// Feedrate floor (mm/s). Requests below it are clamped up.
    pub min_feedrate: f64,

    /// Depth of the move queue (L1).
    pub move_cache_size: usize,

    /// Reject targets outside `[min_pos, max_pos]` before queueing.
    pub enforce_bounds: bool,

    /// Kinematic model selection.
    pub kinematics: KinematicsConfig,
}

/// Which kinematic transform links Cartesian space to motor space.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KinematicsConfig {
    /// One motor per Cartesian axis.
    Cartesian,
    /// Two motors drive a Cartesian pair through crossed belts.
    CoreXy {
        #[serde(default)]
        pair: CorePair,
    },
    /// Three vertical carriages drive the effector through diagonal rods.
    Delta(DeltaConfig),
}

/// Axis pair coupled by the CoreXY belt arrangement.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CorePair {
    #[default]
    Xy,
    Yx,
    Xz,
}

/// Delta tower geometry.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DeltaConfig {
    /// Horizontal distance from the column to the effector center when the
    /// arms are horizontal (mm).
    pub horizontal_radius: f64,

    /// Diagonal rod length (mm).
    pub diagonal_length: f64,

    /// Angular position of each tower on the build plane (degrees).
    pub alpha: [f64; 3],

    /// Per-tower correction added to the horizontal radius (mm).
    pub radius_correction: [f64; 3],

    /// Per-tower correction added to the diagonal length (mm).
    pub diagonal_correction: [f64; 3],

    /// Radius of the printable disc used for reachability checks (mm).
    pub printable_radius: f64,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            horizontal_radius: 150.0,
            diagonal_length: 350.0,
            alpha: [210.0, 330.0, 90.0],
            radius_correction: [0.0; 3],
            diagonal_correction: [0.0; 3],
            printable_radius: 120.0,
        }
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            steps_per_mm: [80.0, 80.0, 400.0, 500.0],
            max_feedrate: [200.0, 200.0, 5.0, 50.0],
            homing_feedrate: [40.0, 40.0, 4.0, 10.0],
            max_acceleration: [1000.0, 1000.0, 100.0, 2000.0],
            max_travel_acceleration: [2000.0, 2000.0, 100.0, 2000.0],
            max_yank: [10.0, 10.0, 0.1, 5.0],
            min_pos: [0.0, 0.0, 0.0, -10000.0],
            max_pos: [200.0, 200.0, 200.0, 10000.0],
            home_dir: [-1, -1, -1, 0],
            backlash: [0.0; NUM_AXES],
            pressure_advance: 0.0,
            prepare_frequency: 1000,
            step_frequency: 40_000,
            min_feedrate: 0.1,
            move_cache_size: 32,
            enforce_bounds: true,
            kinematics: KinematicsConfig::Cartesian,
        }
    }
}

impl MotionConfig {
    /// Parse a configuration from TOML text and validate it.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: MotionConfig = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a configuration file from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut text = String::new();
        File::open(path)?.read_to_string(&mut text)?;
        Self::from_toml_str(&text)
    }

    /// Check cross-field consistency. Called by `from_toml_str` and by
    /// `MotionSystem::new` for hand-built configurations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for i in 0..NUM_AXES {
            if self.steps_per_mm[i] <= 0.0 {
                return Err(invalid(format!(
                    "steps_per_mm[{}] must be positive",
                    AXIS_NAMES[i]
                )));
            }
            if self.max_feedrate[i] <= 0.0 {
                return Err(invalid(format!(
                    "max_feedrate[{}] must be positive",
                    AXIS_NAMES[i]
                )));
            }
            if self.max_acceleration[i] <= 0.0 || self.max_travel_acceleration[i] <= 0.0 {
                return Err(invalid(format!(
                    "acceleration limits for {} must be positive",
                    AXIS_NAMES[i]
                )));
            }
            if self.max_yank[i] < 0.0 {
                return Err(invalid(format!(
                    "max_yank[{}] may not be negative",
                    AXIS_NAMES[i]
                )));
            }
            if self.min_pos[i] >= self.max_pos[i] {
                return Err(invalid(format!(
                    "min_pos[{}] must be below max_pos[{}]",
                    AXIS_NAMES[i], AXIS_NAMES[i]
                )));
            }
            if self.backlash[i] < 0.0 {
                return Err(invalid(format!(
                    "backlash[{}] may not be negative",
                    AXIS_NAMES[i]
                )));
            }
        }
        if self.pressure_advance < 0.0 {
            return Err(invalid("pressure_advance may not be negative".into()));
        }
        if self.prepare_frequency == 0 {
            return Err(invalid("prepare_frequency must be positive".into()));
        }
        if self.step_frequency < self.prepare_frequency {
            return Err(invalid(
                "step_frequency must be at least prepare_frequency".into(),
            ));
        }
        if self.min_feedrate <= 0.0 {
            return Err(invalid("min_feedrate must be positive".into()));
        }
        if self.move_cache_size < 4 {
            return Err(invalid("move_cache_size must be at least 4".into()));
        }
        if self.move_cache_size > 250 {
            return Err(invalid("move_cache_size must fit the 8-bit slot id".into()));
        }
        if let KinematicsConfig::Delta(ref delta) = self.kinematics {
            if delta.diagonal_length <= delta.horizontal_radius {
                return Err(invalid(
                    "delta diagonal_length must exceed horizontal_radius".into(),
                ));
            }
            if delta.printable_radius >= delta.diagonal_length {
                return Err(invalid(
                    "delta printable_radius must be below diagonal_length".into(),
                ));
            }
        }
        Ok(())
    }

    /// Duration of one micro-slice (seconds).
    #[inline]
    pub fn slice_dt(&self) -> f64 {
        1.0 / self.prepare_frequency as f64
    }
}

fn invalid(msg: String) -> ConfigError {
    ConfigError::Invalid(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(MotionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_parse_partial_toml() {
        let cfg = MotionConfig::from_toml_str(
            r#"
            steps_per_mm = [160.0, 160.0, 800.0, 420.0]
            max_feedrate = [300.0, 300.0, 10.0, 60.0]

            [kinematics]
            type = "core_xy"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.steps_per_mm[0], 160.0);
        assert_eq!(
            cfg.kinematics,
            KinematicsConfig::CoreXy {
                pair: CorePair::Xy
            }
        );
        // unspecified fields keep their defaults
        assert_eq!(cfg.prepare_frequency, 1000);
    }

    #[test]
    fn test_parse_delta_toml() {
        let cfg = MotionConfig::from_toml_str(
            r#"
            [kinematics]
            type = "delta"
            horizontal_radius = 140.0
            diagonal_length = 330.0
            printable_radius = 110.0
            "#,
        )
        .unwrap();
        match cfg.kinematics {
            KinematicsConfig::Delta(d) => {
                assert_eq!(d.horizontal_radius, 140.0);
                assert_eq!(d.alpha, [210.0, 330.0, 90.0]);
            }
            other => panic!("expected delta kinematics, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut cfg = MotionConfig::default();
        cfg.steps_per_mm[2] = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = MotionConfig::default();
        cfg.min_pos[0] = 300.0;
        assert!(cfg.validate().is_err());

        let mut cfg = MotionConfig::default();
        cfg.step_frequency = 100;
        assert!(cfg.validate().is_err());
    }
}
