// src/motion/pulser.rs - Step pulser (level 3)
//! The step-tick consumer. Each micro-slice carries pre-loaded Bresenham
//! state; the tick replays it against the stepper outputs, one step at most
//! per axis per iteration. The surrounding `MotionSystem` owns the locks and
//! the retirement chain; this module holds the slice contract and the pure
//! per-tick update.

use crate::motion::axis::{AxisMask, NUM_AXES};

/// Sentinel parent id meaning "no skip requested".
pub const NO_PARENT: u8 = u8::MAX;

/// One constant-speed micro-slice, the unit of work of the step tick.
#[derive(Debug, Clone, Copy)]
pub struct StepSlice {
    /// Id of the L2 buffer this slice belongs to.
    pub parent_id: u8,
    /// Final slice of its parent.
    pub last: bool,
    pub used_axes: AxisMask,
    /// Direction sign bits: set = positive motion.
    pub directions: AxisMask,
    /// Twice the absolute step count per axis.
    pub delta: [i32; NUM_AXES],
    /// Bresenham accumulators, pre-loaded to `-steps_remaining`.
    pub error: [i32; NUM_AXES],
    /// Twice the tick count; added back whenever an accumulator crosses zero.
    pub error_update: i32,
    /// Step-tick iterations this slice spans.
    pub steps_remaining: u32,
    /// Bresenham iterations executed per tick (1, 2 or 4) so the pulse rate
    /// stays under the timer ceiling.
    pub steps_per_call: u32,
    pub check_endstops: bool,
    /// Tool intensity applied when the slice completes.
    pub second_speed: u16,
}

impl Default for StepSlice {
    fn default() -> Self {
        Self {
            parent_id: NO_PARENT,
            last: false,
            used_axes: AxisMask::NONE,
            directions: AxisMask::NONE,
            delta: [0; NUM_AXES],
            error: [0; NUM_AXES],
            error_update: 0,
            steps_remaining: 0,
            steps_per_call: 1,
            check_endstops: false,
            second_speed: 0,
        }
    }
}

/// Consumer-side state: the slice being pulsed and the direction latch.
#[derive(Debug, Default)]
pub struct StepPulser {
    pub current: Option<StepSlice>,
    /// Direction bits currently latched on the drivers, to skip redundant
    /// pin writes between slices of the same move.
    latched_dirs: AxisMask,
    /// Axes whose direction pin has been written at least once.
    latched_known: AxisMask,
}

impl StepPulser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-latch the direction pins `slice` needs, pushing each changed pin
    /// through `latch` as an `(axis, positive)` pair.
    pub fn latch_directions(&mut self, slice: &StepSlice, mut latch: impl FnMut(usize, bool)) {
        for axis in slice.used_axes.iter() {
            let positive = slice.directions.test(axis);
            if !self.latched_known.test(axis) || self.latched_dirs.test(axis) != positive {
                latch(axis, positive);
            }
            self.latched_known.set(axis);
            if positive {
                self.latched_dirs.set(axis);
            } else {
                self.latched_dirs.clear(axis);
            }
        }
    }

    pub fn clear(&mut self) {
        self.current = None;
        self.latched_known = AxisMask::NONE;
    }
}

/// Run one step tick worth of Bresenham on `slice`, invoking `emit(axis)`
/// for every step edge. Returns `true` when the slice is exhausted.
pub fn bresenham_tick(slice: &mut StepSlice, emit: &mut impl FnMut(usize)) -> bool {
    for _ in 0..slice.steps_per_call.max(1) {
        if slice.steps_remaining == 0 {
            return true;
        }
        for axis in 0..NUM_AXES {
            if slice.used_axes.test(axis) {
                slice.error[axis] += slice.delta[axis];
                if slice.error[axis] >= 0 {
                    emit(axis);
                    slice.error[axis] -= slice.error_update;
                }
            }
        }
        slice.steps_remaining -= 1;
        if slice.steps_remaining == 0 {
            return true;
        }
    }
    false
}
