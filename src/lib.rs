// steppipe: three-stage motion pipeline for stepper-driven machines
//! Turns a stream of target coordinates into precisely timed step pulses
//! while honoring per-axis acceleration limits, junction speeds, kinematic
//! transforms (Cartesian / CoreXY / Delta), endstop events and extruder
//! pressure advance.
//!
//! The pipeline is three producer/consumer stages over bounded rings:
//!
//! ```text
//! caller ──► [move queue] ──► [segment queue] ──► [step queue] ──► pins
//!            plan & profile    transform & slice   pulse on tick
//! ```
//!
//! Construct a [`MotionSystem`] from a [`MotionConfig`] and a hardware
//! backend, then drive it with timers (see [`driver`]) or by calling the
//! ticks directly:
//!
//! ```
//! use steppipe::{MotionConfig, MotionSystem};
//! use steppipe::hardware::recording_backends;
//!
//! let (backends, handle) = recording_backends();
//! let system = MotionSystem::new(MotionConfig::default(), backends).unwrap();
//! system.queue_move([10.0, 0.0, 0.0, 0.0], Some(60.0)).unwrap();
//! loop {
//!     system.prepare_tick();
//!     for _ in 0..40 {
//!         system.step_tick();
//!     }
//!     if system.is_idle() {
//!         break;
//!     }
//! }
//! assert_eq!(handle.steps()[0], 800);
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod hardware;
pub mod motion;
pub mod system;

pub use config::{CorePair, DeltaConfig, KinematicsConfig, MotionConfig};
pub use error::{ConfigError, MotionAlert, MotionError, QueueOutcome};
pub use motion::axis::{AxisMask, E_AXIS, NUM_AXES, X_AXIS, Y_AXIS, Z_AXIS};
pub use motion::endstops::EndstopMode;
pub use motion::tool::ToolPower;
pub use system::{MotionSystem, QueueStats};
