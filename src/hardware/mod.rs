// src/hardware/mod.rs - Hardware abstraction boundary
//! Trait-based interfaces the pipeline drives. Integrations implement these
//! against real pins and timers; tests use [`RecordingBackend`].
//!
//! All methods are synchronous because they are called from tick context and
//! must complete in bounded time.

use std::sync::atomic::{AtomicI64, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::motion::axis::{AxisMask, NUM_AXES};

/// Stepper driver outputs.
pub trait StepperBackend: Send {
    /// Emit one step edge on the axis. Direction was set beforehand.
    fn step(&mut self, axis: usize);

    /// Latch the direction pin for the axis.
    fn set_direction(&mut self, axis: usize, positive: bool);

    /// Energize the given motors.
    fn enable(&mut self, axes: AxisMask);

    /// De-energize the given motors.
    fn disable(&mut self, axes: AxisMask);
}

/// Secondary tool output (laser PWM, spindle speed) and warmup readiness.
pub trait ToolBackend: Send {
    /// Apply the tool intensity for the slice that just completed.
    fn set_intensity(&mut self, value: u16);

    /// Whether the tool has reached the requested temperature. Polled by
    /// warmup entries; thermal regulation itself is outside the pipeline.
    fn is_warm(&mut self, _tool: usize, _target_c: f64) -> bool {
        true
    }
}

/// Endstop level readback for integrations that poll instead of wiring
/// interrupts. Interrupt-driven setups call
/// `MotionSystem::endstop_triggered` directly.
pub trait EndstopBackend: Send {
    fn read(&self, axis: usize, positive_side: bool) -> bool;
}

/// Backend bundle handed to the system at construction.
pub struct Backends {
    pub stepper: Box<dyn StepperBackend>,
    pub tool: Box<dyn ToolBackend>,
}

// ---------------------------------------------------------------------------
// Recording backend for tests and the simulator
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RecordingState {
    steps: [AtomicI64; NUM_AXES],
    pulses: AtomicU64,
    enabled: AtomicU8,
    intensity: AtomicU16,
    intensity_writes: AtomicU64,
    warm_after: AtomicU32,
}

impl RecordingState {
    fn record_intensity(&self, value: u16) {
        self.intensity.store(value, Ordering::SeqCst);
        self.intensity_writes.fetch_add(1, Ordering::SeqCst);
    }

    fn poll_warm(&self) -> bool {
        let remaining = self.warm_after.load(Ordering::SeqCst);
        if remaining == 0 {
            true
        } else {
            self.warm_after.store(remaining - 1, Ordering::SeqCst);
            false
        }
    }
}

/// Inspection handle for a [`RecordingBackend`]; stays valid after the
/// backend moves into the system.
#[derive(Debug, Clone)]
pub struct RecordingHandle {
    state: Arc<RecordingState>,
}

impl RecordingHandle {
    /// Net signed steps emitted per axis.
    pub fn steps(&self) -> [i64; NUM_AXES] {
        let mut out = [0i64; NUM_AXES];
        for i in 0..NUM_AXES {
            out[i] = self.state.steps[i].load(Ordering::SeqCst);
        }
        out
    }

    /// Total pulse count across all axes (unsigned).
    pub fn pulses(&self) -> u64 {
        self.state.pulses.load(Ordering::SeqCst)
    }

    pub fn enabled_mask(&self) -> AxisMask {
        AxisMask::from_raw(self.state.enabled.load(Ordering::SeqCst))
    }

    /// Last tool intensity applied.
    pub fn intensity(&self) -> u16 {
        self.state.intensity.load(Ordering::SeqCst)
    }

    pub fn intensity_writes(&self) -> u64 {
        self.state.intensity_writes.load(Ordering::SeqCst)
    }

    /// Make `is_warm` report cold for the next `polls` queries.
    pub fn set_warmup_polls(&self, polls: u32) {
        self.state.warm_after.store(polls, Ordering::SeqCst);
    }
}

/// Mock stepper backend counting signed pulses per axis.
pub struct RecordingBackend {
    state: Arc<RecordingState>,
    direction: [i8; NUM_AXES],
}

impl RecordingBackend {
    pub fn new() -> (Self, RecordingHandle) {
        let state = Arc::new(RecordingState::default());
        (
            Self {
                state: state.clone(),
                direction: [1; NUM_AXES],
            },
            RecordingHandle { state },
        )
    }
}

impl StepperBackend for RecordingBackend {
    fn step(&mut self, axis: usize) {
        self.state.steps[axis].fetch_add(self.direction[axis] as i64, Ordering::SeqCst);
        self.state.pulses.fetch_add(1, Ordering::SeqCst);
    }

    fn set_direction(&mut self, axis: usize, positive: bool) {
        self.direction[axis] = if positive { 1 } else { -1 };
    }

    fn enable(&mut self, axes: AxisMask) {
        self.state.enabled.fetch_or(axes.raw(), Ordering::SeqCst);
    }

    fn disable(&mut self, axes: AxisMask) {
        self.state.enabled.fetch_and(!axes.raw(), Ordering::SeqCst);
    }
}

struct RecordingTool {
    state: Arc<RecordingState>,
}

impl ToolBackend for RecordingTool {
    fn set_intensity(&mut self, value: u16) {
        self.state.record_intensity(value);
    }

    fn is_warm(&mut self, _tool: usize, _target_c: f64) -> bool {
        self.state.poll_warm()
    }
}

/// Recording [`Backends`] bundle plus its inspection handle.
pub fn recording_backends() -> (Backends, RecordingHandle) {
    let (stepper, handle) = RecordingBackend::new();
    let tool = RecordingTool {
        state: handle.state.clone(),
    };
    (
        Backends {
            stepper: Box::new(stepper),
            tool: Box::new(tool),
        },
        handle,
    )
}
