// src/motion/segments.rs - Segment generator (level 2)
//! The prepare-tick worker between the move planner and the step pulser.
//!
//! Each tick adopts at most one committed move and produces at most one
//! micro-slice along its velocity profile: advance the profile one slice,
//! clamp the covered arc length, transform the interpolated position into
//! motor steps, fold pressure advance into the extruder delta, and pre-load
//! the Bresenham state the step tick replays.
//!
//! The motor position is tracked double-buffered: the tick writes the new
//! snapshot into the inactive half and flips the selector, so a concurrent
//! reader never sees a torn position.

use crate::hardware::Backends;
use crate::motion::axis::{E_AXIS, NUM_AXES};
use crate::motion::kinematics::Kinematics;
use crate::motion::planner::{ForwardedMove, Move, MoveAction};
use crate::motion::profile::{Trapezoid, VelocityProfile};
use crate::motion::pulser::StepSlice;
use crate::motion::ring::Ring;
use crate::motion::tool::compute_intensity;

/// Depth of the segment ring.
pub const SEGMENT_CACHE_SIZE: usize = 16;

/// Wait slices are chunked so tick counters stay 16-bit safe.
const MAX_WAIT_TICKS: u32 = 32_000;

/// Profile phase of a working segment buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SegPhase {
    #[default]
    NotInitialized,
    AccelerateInit,
    Accelerating,
    PlateauInit,
    Plateau,
    DecelerateInit,
    Decelerating,
    Finished,
}

/// Working buffer for one move while its slices are generated and pulsed.
#[derive(Debug, Clone, Default)]
pub struct SegBuffer {
    /// Slot id; slices reference their parent through it.
    pub id: u8,
    /// L1 slot to release when the final slice has been pulsed.
    pub m1_id: u8,
    pub mv: Move,
    pub trap: Trapezoid,
    pub phase: SegPhase,
    /// Arc-length offset of the deceleration phase (`s1 + s2`).
    pub soff: f64,
    /// Absolute motor steps still to emit per axis; the pulser decrements
    /// these for endstop-guarded moves so a trigger can snapshot them.
    pub steps_remaining: [i32; NUM_AXES],
    pub in_use: bool,
}

/// Follow-up phase once the current one is exhausted, skipping empty phases.
fn next_phase(phase: SegPhase, trap: &Trapezoid) -> SegPhase {
    if phase == SegPhase::NotInitialized {
        if trap.t1 > 0.0 {
            return SegPhase::AccelerateInit;
        }
        if trap.t2 > 0.0 {
            return SegPhase::PlateauInit;
        }
        if trap.t3 > 0.0 {
            return SegPhase::DecelerateInit;
        }
    }
    if phase == SegPhase::Accelerating {
        if trap.t2 > 0.0 {
            return SegPhase::PlateauInit;
        }
        if trap.t3 > 0.0 {
            return SegPhase::DecelerateInit;
        }
    }
    if phase == SegPhase::Plateau && trap.t3 > 0.0 {
        return SegPhase::DecelerateInit;
    }
    SegPhase::Finished
}

/// Level-2 state: the segment ring, the phase integrator, and the
/// double-buffered motor position.
pub struct SegmentGenerator {
    ring: Ring<SegBuffer>,
    /// Slot currently being sliced, if any.
    act: Option<usize>,
    profile: VelocityProfile,
    last_motor: [[i32; NUM_AXES]; 2],
    last_motor_idx: usize,
    /// Pressure-advance steps already folded into emitted deltas.
    advance_steps: i32,
    /// Arc length at the previous slice, for regression detection.
    last_s: f64,
    reversals: u64,
    /// Step ticks per unit of profile arc for Cartesian moves.
    steps_per_unit_move: f64,
    steps_per_mm: [f64; NUM_AXES],
    /// Step ticks available per prepare tick before the rate upshift kicks in.
    ticks_per_slice: u32,
    /// Tick count of one warmup poll chunk.
    warmup_chunk: u32,
}

impl SegmentGenerator {
    pub fn new(
        steps_per_mm: [f64; NUM_AXES],
        prepare_frequency: u32,
        step_frequency: u32,
        rate_bound: f64,
    ) -> Self {
        let max_spmm = steps_per_mm.iter().cloned().fold(0.0, f64::max);
        Self {
            ring: Ring::new(SEGMENT_CACHE_SIZE),
            act: None,
            profile: VelocityProfile::new(prepare_frequency),
            last_motor: [[0; NUM_AXES]; 2],
            last_motor_idx: 0,
            advance_steps: 0,
            last_s: 0.0,
            reversals: 0,
            steps_per_unit_move: max_spmm * rate_bound,
            steps_per_mm,
            ticks_per_slice: (step_frequency / prepare_frequency).max(1),
            warmup_chunk: (step_frequency / 100).max(1),
        }
    }

    pub fn has_work(&self) -> bool {
        self.act.is_some()
    }

    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn reversals(&self) -> u64 {
        self.reversals
    }

    /// Current motor position snapshot.
    pub fn motor_position(&self) -> [i32; NUM_AXES] {
        self.last_motor[self.last_motor_idx]
    }

    /// Re-seed both halves of the motor position buffer (homing, G92).
    pub fn set_motor_position(&mut self, motor: [i32; NUM_AXES]) {
        self.last_motor = [motor, motor];
        self.advance_steps = 0;
    }

    /// Shared-slot access for endstop accounting.
    pub fn buffer(&self, id: u8) -> Option<&SegBuffer> {
        let buf = self.ring.slot(id as usize);
        buf.in_use.then_some(buf)
    }

    pub fn buffer_mut(&mut self, id: u8) -> Option<&mut SegBuffer> {
        let buf = self.ring.slot_mut(id as usize);
        buf.in_use.then_some(buf)
    }

    /// Adopt a freshly forwarded move into a segment buffer. The caller has
    /// checked `is_full()`.
    pub fn adopt(&mut self, fwd: ForwardedMove, kin: &dyn Kinematics) {
        let Some(idx) = self.ring.try_reserve() else {
            debug_assert!(false, "adopt on a full segment ring");
            return;
        };
        let lp = self.last_motor[self.last_motor_idx];

        let buf = self.ring.slot_mut(idx);
        buf.id = idx as u8;
        buf.m1_id = fwd.id;
        buf.mv = fwd.mv;
        buf.trap = fwd.trap;
        buf.phase = SegPhase::NotInitialized;
        buf.soff = 0.0;
        buf.steps_remaining = [0; NUM_AXES];
        buf.in_use = true;

        // motor-space start for homing moves is wherever the motors are now
        if buf.mv.action == MoveAction::MoveSteps {
            for i in 0..NUM_AXES {
                buf.mv.start[i] = lp[i] as f64;
            }
        }

        // endstop accounting needs the absolute step total of the move
        if buf.mv.check_endstops
            && matches!(buf.mv.action, MoveAction::Move | MoveAction::MoveSteps)
        {
            let mut end = [0.0; NUM_AXES];
            for i in 0..NUM_AXES {
                end[i] = buf.mv.start[i] + buf.mv.unit_dir[i] * buf.mv.length;
            }
            let mut target = [0i32; NUM_AXES];
            if buf.mv.action == MoveAction::Move {
                kin.transform(&end, &mut target);
            } else {
                for i in 0..NUM_AXES {
                    target[i] = end[i].round() as i32;
                }
            }
            for i in 0..NUM_AXES {
                buf.steps_remaining[i] = (target[i] - lp[i]).abs();
            }
        }

        self.ring.commit();
        self.act = Some(idx);
        self.last_s = 0.0;
    }

    /// Produce the next micro-slice of the adopted move, if any. `skip` is
    /// the parent id an endstop abort asked the pipeline to drain.
    pub fn generate(
        &mut self,
        kin: &dyn Kinematics,
        backends: &mut Backends,
        skip: Option<u8>,
    ) -> Option<StepSlice> {
        let idx = self.act?;
        match self.ring.slot(idx).mv.action {
            MoveAction::Move | MoveAction::MoveSteps => self.generate_linear(idx, kin, skip),
            MoveAction::Wait => self.generate_wait(idx),
            MoveAction::Warmup { tool, target_c } => {
                let buf = self.ring.slot(idx);
                let intensity = if buf.mv.tool_power.active {
                    buf.mv.tool_power.base
                } else {
                    0
                };
                let id = buf.id;
                if backends.tool.is_warm(tool, target_c) {
                    self.act = None;
                    Some(end_of_move_slice(id, intensity))
                } else {
                    Some(dwell_slice(id, self.warmup_chunk, false, intensity))
                }
            }
        }
    }

    fn generate_linear(
        &mut self,
        idx: usize,
        kin: &dyn Kinematics,
        skip: Option<u8>,
    ) -> Option<StepSlice> {
        let is_cartesian = self.ring.slot(idx).mv.action == MoveAction::Move;
        let steps_per_unit = if is_cartesian {
            self.steps_per_unit_move
        } else {
            1.0
        };

        // Pressure advance offsets accumulate in the emitted deltas; re-seed
        // the extruder snapshot from the move's own start so they cannot
        // leak into the first delta of this move.
        if self.ring.slot(idx).phase == SegPhase::NotInitialized {
            if is_cartesian {
                let e_start = self.ring.slot(idx).mv.start[E_AXIS];
                self.last_motor[self.last_motor_idx][E_AXIS] =
                    (e_start * self.steps_per_mm[E_AXIS]).round() as i32;
            }
            let buf = self.ring.slot_mut(idx);
            buf.phase = next_phase(SegPhase::NotInitialized, &buf.trap);
        }

        // advance the velocity profile one slice
        let (phase, trap, start_speed, end_speed) = {
            let buf = self.ring.slot(idx);
            (buf.phase, buf.trap, buf.mv.start_speed, buf.mv.end_speed)
        };
        let mut new_phase = phase;
        let s_factor;
        match phase {
            SegPhase::AccelerateInit => {
                new_phase = SegPhase::Accelerating;
                if self.profile.start(start_speed, trap.cruise, trap.t1, steps_per_unit) {
                    new_phase = next_phase(SegPhase::Accelerating, &trap);
                }
                s_factor = self.profile.s;
            }
            SegPhase::Accelerating => {
                if self.profile.next(steps_per_unit) {
                    new_phase = next_phase(SegPhase::Accelerating, &trap);
                }
                s_factor = self.profile.s;
            }
            SegPhase::PlateauInit => {
                new_phase = SegPhase::Plateau;
                if self.profile.start(trap.cruise, trap.cruise, trap.t2, steps_per_unit) {
                    new_phase = next_phase(SegPhase::Plateau, &trap);
                }
                s_factor = self.profile.s + trap.s1;
            }
            SegPhase::Plateau => {
                if self.profile.next(steps_per_unit) {
                    new_phase = next_phase(SegPhase::Plateau, &trap);
                }
                s_factor = self.profile.s + trap.s1;
            }
            SegPhase::DecelerateInit => {
                new_phase = SegPhase::Decelerating;
                self.ring.slot_mut(idx).soff = trap.s1 + trap.s2;
                if self.profile.start(trap.cruise, end_speed, trap.t3, steps_per_unit) {
                    new_phase = SegPhase::Finished;
                }
                s_factor = self.profile.s + trap.s1 + trap.s2;
            }
            SegPhase::Decelerating => {
                if self.profile.next(steps_per_unit) {
                    new_phase = SegPhase::Finished;
                }
                s_factor = self.profile.s + self.ring.slot(idx).soff;
            }
            SegPhase::Finished => {
                // the move ended exactly on a phase boundary; emit the
                // end-of-move tick and move on
                self.act = None;
                let buf = self.ring.slot(idx);
                return Some(end_of_move_slice(
                    buf.id,
                    compute_intensity(buf.mv.end_speed, buf.mv.tool_power),
                ));
            }
            SegPhase::NotInitialized => unreachable!("phase advanced above"),
        }
        self.ring.slot_mut(idx).phase = new_phase;

        let buf_id = self.ring.slot(idx).id;
        let mut last = skip == Some(buf_id);
        let length = self.ring.slot(idx).mv.length;
        let mut s = s_factor;
        if new_phase == SegPhase::Finished || s > length {
            // clamp against integration rounding
            s = length;
            last = true;
        }

        if is_cartesian && s < self.last_s {
            tracing::warn!(regression = s - self.last_s, "reversal: arc length regressed");
            self.reversals += 1;
        }
        self.last_s = s;

        // interpolate and transform into motor steps
        let lp = self.last_motor[self.last_motor_idx];
        let mut np = [0i32; NUM_AXES];
        {
            let mv = &self.ring.slot(idx).mv;
            let mut pos = [0.0; NUM_AXES];
            for i in 0..NUM_AXES {
                pos[i] = if mv.axis_used.test(i) {
                    mv.start[i] + s * mv.unit_dir[i]
                } else {
                    mv.start[i]
                };
            }
            if is_cartesian {
                kin.transform(&pos, &mut np);
            } else {
                for i in 0..NUM_AXES {
                    np[i] = pos[i].round() as i32;
                }
            }
        }

        // per-axis deltas with pressure advance folded into the extruder
        let (e_adv, check_endstops, tool_power) = {
            let mv = &self.ring.slot(idx).mv;
            (mv.e_adv, mv.check_endstops, mv.tool_power)
        };
        let mut d = [0i32; NUM_AXES];
        let mut adv_applied = 0;
        let mut max_abs = 0i32;
        for i in 0..NUM_AXES {
            d[i] = np[i] - lp[i];
            if i == E_AXIS && is_cartesian && (self.advance_steps != 0 || e_adv != 0.0) {
                let adv_target = (self.profile.f * e_adv).round() as i32;
                adv_applied = adv_target - self.advance_steps;
                d[i] += adv_applied;
            }
            max_abs = max_abs.max(d[i].abs());
        }

        let mut ticks = self.profile.steps_per_segment;
        if ticks == 0 && max_abs == 0 {
            if last {
                self.act = None;
                return Some(end_of_move_slice(
                    buf_id,
                    compute_intensity(self.profile.f, tool_power),
                ));
            }
            // empty slice: drop it, the covered arc carries into the next one
            return None;
        }
        // the tick count may never undercut the largest axis delta, or the
        // one-step-per-tick Bresenham bound breaks
        ticks = ticks.max(max_abs as u32);

        self.advance_steps += adv_applied;

        let mut slice = StepSlice {
            parent_id: buf_id,
            last,
            error_update: 2 * ticks as i32,
            steps_remaining: ticks,
            steps_per_call: rate_upshift(ticks, self.ticks_per_slice),
            check_endstops,
            second_speed: compute_intensity(self.profile.f, tool_power),
            ..StepSlice::default()
        };
        for i in 0..NUM_AXES {
            if d[i] > 0 {
                slice.used_axes.set(i);
                slice.directions.set(i);
            } else if d[i] < 0 {
                slice.used_axes.set(i);
            }
            slice.delta[i] = 2 * d[i].abs();
            slice.error[i] = -(ticks as i32);
        }

        // publish the new motor snapshot by flipping the selector
        let next_idx = 1 - self.last_motor_idx;
        self.last_motor[next_idx] = np;
        self.last_motor_idx = next_idx;

        if last {
            self.act = None;
        }
        Some(slice)
    }

    fn generate_wait(&mut self, idx: usize) -> Option<StepSlice> {
        let buf = self.ring.slot_mut(idx);
        let intensity = if buf.mv.tool_power.active {
            buf.mv.tool_power.base
        } else {
            0
        };
        if buf.mv.wait_ticks > MAX_WAIT_TICKS {
            buf.mv.wait_ticks -= MAX_WAIT_TICKS;
            Some(dwell_slice(buf.id, MAX_WAIT_TICKS, false, intensity))
        } else {
            let ticks = buf.mv.wait_ticks.max(1);
            buf.mv.wait_ticks = 0;
            let id = buf.id;
            self.act = None;
            Some(dwell_slice(id, ticks, true, intensity))
        }
    }

    /// Called by the pulser when the final slice of `parent` has been
    /// pulsed; frees the segment buffer and reports the L1 slot to release.
    pub fn complete_parent(&mut self, parent: u8) -> Option<u8> {
        let head_idx = self.ring.head_index()?;
        debug_assert_eq!(head_idx as u8, parent, "segments retire in FIFO order");
        if head_idx as u8 != parent {
            return None;
        }
        let buf = self.ring.slot_mut(head_idx);
        buf.in_use = false;
        let m1 = buf.m1_id;
        self.ring.advance();
        Some(m1)
    }

    /// Drop all buffered segments (emergency stop). Returns the L1 slots
    /// that were still referenced.
    pub fn clear(&mut self) -> Vec<u8> {
        let mut released = Vec::new();
        while let Some(head_idx) = self.ring.head_index() {
            let buf = self.ring.slot_mut(head_idx);
            if buf.in_use {
                released.push(buf.m1_id);
                buf.in_use = false;
            }
            self.ring.advance();
        }
        self.act = None;
        self.last_s = 0.0;
        self.advance_steps = 0;
        released
    }
}

/// Pick the Bresenham iterations per step tick (1, 2 or 4) so the tick rate
/// stays under the timer budget.
fn rate_upshift(ticks: u32, ticks_per_slice: u32) -> u32 {
    let mut per_call = 1;
    while ticks > ticks_per_slice * per_call && per_call < 4 {
        per_call *= 2;
    }
    per_call
}

/// Idle tick giving the pulser a clean end-of-move boundary.
fn end_of_move_slice(parent: u8, second_speed: u16) -> StepSlice {
    StepSlice {
        parent_id: parent,
        last: true,
        steps_remaining: 1,
        error_update: 2,
        second_speed,
        ..StepSlice::default()
    }
}

fn dwell_slice(parent: u8, ticks: u32, last: bool, second_speed: u16) -> StepSlice {
    StepSlice {
        parent_id: parent,
        last,
        steps_remaining: ticks,
        error_update: 2 * ticks as i32,
        second_speed,
        ..StepSlice::default()
    }
}
