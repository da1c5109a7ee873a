// src/motion/planner.rs - Move queue with look-ahead (level 1)
//! Accepts Cartesian or motor-space targets and keeps a bounded queue of
//! move records whose entry/exit speeds respect the per-axis junction
//! allowances with every neighbouring move still in the queue.
//!
//! Entry speeds are only ever raised by look-ahead as newer moves arrive;
//! once the segment generator pulls a move via [`Planner::forward`] its
//! profile is frozen and the successor's entry speed is locked to it, which
//! keeps exit/entry continuity exact.

use crate::config::MotionConfig;
use crate::error::{MotionError, QueueOutcome};
use crate::motion::axis::{AxisMask, AXIS_NAMES, E_AXIS, NUM_AXES, Z_AXIS};
use crate::motion::kinematics::Kinematics;
use crate::motion::profile::Trapezoid;
use crate::motion::ring::Ring;
use crate::motion::tool::ToolPower;

/// Moves shorter than this are absorbed (position still updates).
pub const MIN_MOVE_LENGTH: f64 = 1e-6;

/// Unit-direction components below this do not mark the axis as used.
const MIN_COMPONENT: f64 = 1e-9;

/// `cos(theta)` at or below this counts as a full reversal.
const REVERSAL_COS: f64 = -1.0 + 1e-4;

/// What an L1 entry asks the pipeline to do.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MoveAction {
    /// Linear move in Cartesian space, transformed per slice.
    Move,
    /// Linear move in motor space (homing); the transform is the identity.
    MoveSteps,
    /// Dwell for `wait_ticks` step granules.
    Wait,
    /// Dwell until the tool reports warm.
    Warmup { tool: usize, target_c: f64 },
}

/// One queued move. `start` and `length` are millimeters for `Move` and
/// steps for `MoveSteps`; speeds follow the same unit.
#[derive(Debug, Clone, Copy)]
pub struct Move {
    pub action: MoveAction,
    pub start: [f64; NUM_AXES],
    pub unit_dir: [f64; NUM_AXES],
    pub length: f64,
    pub axis_used: AxisMask,
    pub axis_dir: AxisMask,
    pub feedrate: f64,
    pub start_speed: f64,
    pub end_speed: f64,
    pub acceleration: f64,
    /// Signed pressure-advance gain: extra E steps per unit of path speed.
    pub e_adv: f64,
    pub tool_power: ToolPower,
    pub check_endstops: bool,
    pub wait_ticks: u32,
}

impl Default for Move {
    fn default() -> Self {
        Self {
            action: MoveAction::Wait,
            start: [0.0; NUM_AXES],
            unit_dir: [0.0; NUM_AXES],
            length: 0.0,
            axis_used: AxisMask::NONE,
            axis_dir: AxisMask::NONE,
            feedrate: 0.0,
            start_speed: 0.0,
            end_speed: 0.0,
            acceleration: 1.0,
            e_adv: 0.0,
            tool_power: ToolPower::default(),
            check_endstops: false,
            wait_ticks: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum SlotState {
    #[default]
    Free,
    Queued,
    Forwarded,
}

/// Ring slot: the move plus its planner-side bookkeeping.
#[derive(Debug, Clone, Default)]
struct MoveSlot {
    mv: Move,
    state: SlotState,
    /// L2 references; the slot retires only when forwarded and unreferenced.
    refs: u8,
    /// Current planned entry speed.
    entry: f64,
    /// Junction allowance with the predecessor, capped at both feedrates.
    max_entry: f64,
    /// Set once the predecessor is forwarded; the entry may no longer move.
    entry_locked: bool,
}

/// Move handed to the segment generator: a frozen copy plus its trapezoid.
#[derive(Debug, Clone, Copy)]
pub struct ForwardedMove {
    /// L1 slot id, passed back through [`Planner::release`] on retirement.
    pub id: u8,
    pub mv: Move,
    pub trap: Trapezoid,
}

/// Level-1 state: the move ring plus position bookkeeping.
pub struct Planner {
    cfg: MotionConfig,
    ring: Ring<MoveSlot>,
    /// Logical position in the caller's frame (updates at queue time).
    current_position: [f64; NUM_AXES],
    /// Workspace origin added to incoming targets.
    origin: [f64; NUM_AXES],
    /// Machine-frame position without backlash shift.
    machine_position: [f64; NUM_AXES],
    /// Machine-frame position including the current backlash shift; this is
    /// the frame moves are planned in.
    applied_position: [f64; NUM_AXES],
    backlash_shift: [f64; NUM_AXES],
    default_feedrate: f64,
    tool_power: ToolPower,
    /// New entries ask the step pulser to watch endstops.
    guard_moves: bool,
}

impl Planner {
    pub fn new(cfg: &MotionConfig) -> Self {
        Self {
            cfg: cfg.clone(),
            ring: Ring::new(cfg.move_cache_size),
            current_position: [0.0; NUM_AXES],
            origin: [0.0; NUM_AXES],
            machine_position: [0.0; NUM_AXES],
            applied_position: [0.0; NUM_AXES],
            backlash_shift: [0.0; NUM_AXES],
            default_feedrate: 50.0,
            tool_power: ToolPower::default(),
            guard_moves: false,
        }
    }

    // -- queueing ----------------------------------------------------------

    /// Append a Cartesian move toward `target` (caller frame, mm).
    pub fn queue_move(
        &mut self,
        target: [f64; NUM_AXES],
        feedrate: Option<f64>,
        path_optimize: bool,
        kin: &dyn Kinematics,
    ) -> Result<QueueOutcome, MotionError> {
        let feedrate = feedrate
            .unwrap_or(self.default_feedrate)
            .max(self.cfg.min_feedrate);

        let mut machine = [0.0; NUM_AXES];
        for i in 0..NUM_AXES {
            machine[i] = target[i] + self.origin[i];
        }

        if self.cfg.enforce_bounds {
            for i in 0..NUM_AXES - 1 {
                if machine[i] < self.cfg.min_pos[i] - MIN_MOVE_LENGTH
                    || machine[i] > self.cfg.max_pos[i] + MIN_MOVE_LENGTH
                {
                    return Err(MotionError::OutsideBounds {
                        axis: AXIS_NAMES[i],
                        value: machine[i],
                        min: self.cfg.min_pos[i],
                        max: self.cfg.max_pos[i],
                    });
                }
            }
            if !kin.reachable(&machine) {
                return Err(MotionError::Unreachable);
            }
        }

        // fold backlash: a reversing axis shifts the applied frame so the
        // first move after the reversal absorbs the slack
        let mut shift = self.backlash_shift;
        for i in 0..NUM_AXES {
            if self.cfg.backlash[i] > 0.0 {
                let d = machine[i] - self.machine_position[i];
                if d > MIN_COMPONENT {
                    shift[i] = self.cfg.backlash[i];
                } else if d < -MIN_COMPONENT {
                    shift[i] = 0.0;
                }
            }
        }

        let mut delta = [0.0; NUM_AXES];
        let mut length_sq = 0.0;
        for i in 0..NUM_AXES {
            delta[i] = machine[i] + shift[i] - self.applied_position[i];
            length_sq += delta[i] * delta[i];
        }
        let length = length_sq.sqrt();
        if length < MIN_MOVE_LENGTH {
            self.current_position = target;
            self.machine_position = machine;
            return Ok(QueueOutcome::Empty);
        }

        let Some(idx) = self.ring.try_reserve() else {
            return Ok(QueueOutcome::Blocked);
        };

        let mut unit_dir = [0.0; NUM_AXES];
        let mut axis_used = AxisMask::NONE;
        let mut axis_dir = AxisMask::NONE;
        for i in 0..NUM_AXES {
            let u = delta[i] / length;
            if u.abs() > MIN_COMPONENT {
                unit_dir[i] = u;
                axis_used.set(i);
                if u > 0.0 {
                    axis_dir.set(i);
                }
            }
        }

        // clamp feedrate so no axis exceeds its projected maximum
        let mut clamped = feedrate;
        for i in axis_used.iter() {
            clamped = clamped.min(self.cfg.max_feedrate[i] / unit_dir[i].abs());
        }
        if clamped < feedrate {
            tracing::debug!(requested = feedrate, clamped, "feedrate clamped to axis limits");
        }
        let clamped = clamped.max(self.cfg.min_feedrate);

        // travel moves (no extrusion) may accelerate harder
        let is_print = axis_used.test(E_AXIS) && (axis_used.raw() & 0b0111) != 0;
        let accel_table = if axis_used == AxisMask::bit(E_AXIS) || is_print {
            &self.cfg.max_acceleration
        } else {
            &self.cfg.max_travel_acceleration
        };
        let mut accel = f64::INFINITY;
        for i in axis_used.iter() {
            accel = accel.min(accel_table[i] / unit_dir[i].abs());
        }

        let e_adv = if is_print && self.cfg.pressure_advance > 0.0 {
            self.cfg.pressure_advance * unit_dir[E_AXIS] * self.cfg.steps_per_mm[E_AXIS]
        } else {
            0.0
        };

        let mv = Move {
            action: MoveAction::Move,
            start: self.applied_position,
            unit_dir,
            length,
            axis_used,
            axis_dir,
            feedrate: clamped,
            start_speed: 0.0,
            end_speed: 0.0,
            acceleration: accel,
            e_adv,
            tool_power: self.tool_power,
            check_endstops: self.guard_moves,
            wait_ticks: 0,
        };

        let (max_entry, locked) = self.entry_constraint(&mv);
        let slot = self.ring.slot_mut(idx);
        slot.mv = mv;
        slot.state = SlotState::Queued;
        slot.refs = 0;
        slot.entry = 0.0;
        slot.max_entry = max_entry;
        slot.entry_locked = locked;
        self.ring.commit();

        self.current_position = target;
        self.machine_position = machine;
        self.applied_position = {
            let mut p = machine;
            for i in 0..NUM_AXES {
                p[i] += shift[i];
            }
            p
        };
        self.backlash_shift = shift;

        if path_optimize {
            self.optimize();
        }
        tracing::trace!(length, feedrate = clamped, queued = self.ring.len(), "move queued");
        Ok(QueueOutcome::Queued)
    }

    /// Append a motor-space move of `delta_steps`, used by homing and
    /// probing. Speeds are converted to step units internally; the position
    /// bookkeeping is untouched (callers re-seed it afterwards).
    pub fn queue_steps(&mut self, delta_steps: [i32; NUM_AXES], feedrate: f64) -> QueueOutcome {
        let mut delta = [0.0; NUM_AXES];
        let mut length_sq = 0.0;
        for i in 0..NUM_AXES {
            delta[i] = delta_steps[i] as f64;
            length_sq += delta[i] * delta[i];
        }
        let length = length_sq.sqrt();
        if length < 1.0 {
            return QueueOutcome::Empty;
        }
        let Some(idx) = self.ring.try_reserve() else {
            return QueueOutcome::Blocked;
        };

        let mut unit_dir = [0.0; NUM_AXES];
        let mut axis_used = AxisMask::NONE;
        let mut axis_dir = AxisMask::NONE;
        let mut steps_per_mm = 0.0f64;
        let mut accel_steps = f64::INFINITY;
        for i in 0..NUM_AXES {
            let u = delta[i] / length;
            if u.abs() > MIN_COMPONENT {
                unit_dir[i] = u;
                axis_used.set(i);
                if u > 0.0 {
                    axis_dir.set(i);
                }
                steps_per_mm = steps_per_mm.max(self.cfg.steps_per_mm[i]);
                accel_steps =
                    accel_steps.min(self.cfg.max_travel_acceleration[i] * self.cfg.steps_per_mm[i]);
            }
        }

        let slot = self.ring.slot_mut(idx);
        slot.mv = Move {
            action: MoveAction::MoveSteps,
            start: [0.0; NUM_AXES],
            unit_dir,
            length,
            axis_used,
            axis_dir,
            feedrate: (feedrate.max(self.cfg.min_feedrate) * steps_per_mm).max(1.0),
            start_speed: 0.0,
            end_speed: 0.0,
            acceleration: accel_steps,
            e_adv: 0.0,
            tool_power: self.tool_power,
            check_endstops: self.guard_moves,
            wait_ticks: 0,
        };
        slot.state = SlotState::Queued;
        slot.refs = 0;
        slot.entry = 0.0;
        slot.max_entry = 0.0;
        slot.entry_locked = true;
        self.ring.commit();
        QueueOutcome::Queued
    }

    /// Append a dwell of `ticks` step granules.
    pub fn queue_wait_ticks(&mut self, ticks: u32) -> QueueOutcome {
        self.queue_housekeeping(MoveAction::Wait, ticks)
    }

    /// Append a block-until-warm entry for the given tool.
    pub fn queue_warmup(&mut self, tool: usize, target_c: f64) -> QueueOutcome {
        self.queue_housekeeping(MoveAction::Warmup { tool, target_c }, 0)
    }

    fn queue_housekeeping(&mut self, action: MoveAction, ticks: u32) -> QueueOutcome {
        let Some(idx) = self.ring.try_reserve() else {
            return QueueOutcome::Blocked;
        };
        let slot = self.ring.slot_mut(idx);
        slot.mv = Move {
            action,
            wait_ticks: ticks,
            tool_power: self.tool_power,
            ..Move::default()
        };
        slot.state = SlotState::Queued;
        slot.refs = 0;
        slot.entry = 0.0;
        slot.max_entry = 0.0;
        slot.entry_locked = true;
        self.ring.commit();
        QueueOutcome::Queued
    }

    /// Junction allowance between the newest queued entry and the incoming
    /// move, and whether the entry is already frozen.
    fn entry_constraint(&self, mv: &Move) -> (f64, bool) {
        let len = self.ring.len();
        if len == 0 {
            return (0.0, true);
        }
        let prev = self.ring.slot(self.ring.index_of(len - 1));
        if prev.state != SlotState::Queued || prev.mv.action != MoveAction::Move {
            return (0.0, true);
        }
        (junction_allowance(&prev.mv, mv, &self.cfg.max_yank), false)
    }

    /// Backward/forward look-ahead sweep over the queued suffix.
    fn optimize(&mut self) {
        let len = self.ring.len();
        let mut first = 0;
        while first < len {
            let slot = self.ring.slot(self.ring.index_of(first));
            if slot.state == SlotState::Queued {
                break;
            }
            first += 1;
        }
        if len - first < 2 {
            return;
        }

        // backward: pull entry speeds up to what the junctions and the
        // deceleration to the queue end permit
        let mut succ_entry = 0.0;
        for off in (first..len).rev() {
            let idx = self.ring.index_of(off);
            let slot = self.ring.slot_mut(idx);
            if slot.mv.action == MoveAction::Move {
                if !slot.entry_locked {
                    let reach = (succ_entry * succ_entry
                        + 2.0 * slot.mv.acceleration * slot.mv.length)
                        .sqrt();
                    slot.entry = slot.max_entry.min(reach);
                }
                succ_entry = slot.entry;
            } else {
                succ_entry = 0.0;
            }
        }

        // forward: no entry may exceed what the predecessor can accelerate to
        let mut deliverable = f64::INFINITY;
        for off in first..len {
            let idx = self.ring.index_of(off);
            let slot = self.ring.slot_mut(idx);
            if slot.mv.action == MoveAction::Move {
                if !slot.entry_locked && slot.entry > deliverable {
                    slot.entry = deliverable;
                }
                deliverable = (slot.entry * slot.entry
                    + 2.0 * slot.mv.acceleration * slot.mv.length)
                    .sqrt();
            } else {
                deliverable = 0.0;
            }
        }
    }

    // -- hand-off to the segment generator ---------------------------------

    /// Pull the oldest not-yet-forwarded entry, freezing its profile. The
    /// successor's entry speed is locked to this move's exit speed, so
    /// junction continuity is exact.
    pub fn forward(&mut self) -> Option<ForwardedMove> {
        let len = self.ring.len();
        let mut off = 0;
        while off < len {
            let slot = self.ring.slot(self.ring.index_of(off));
            match slot.state {
                SlotState::Forwarded => off += 1,
                SlotState::Queued => break,
                SlotState::Free => return None,
            }
        }
        if off == len {
            return None;
        }

        let end_speed = if off + 1 < len {
            let succ_idx = self.ring.index_of(off + 1);
            let succ = self.ring.slot_mut(succ_idx);
            succ.entry_locked = true;
            if succ.mv.action == MoveAction::Move {
                succ.entry
            } else {
                0.0
            }
        } else {
            0.0
        };

        let idx = self.ring.index_of(off);
        let slot = self.ring.slot_mut(idx);
        slot.state = SlotState::Forwarded;
        slot.refs = 1;
        slot.mv.start_speed = slot.entry;
        slot.mv.end_speed = end_speed;

        let trap = match slot.mv.action {
            MoveAction::Move | MoveAction::MoveSteps => Trapezoid::fit(
                slot.mv.length,
                slot.mv.start_speed,
                slot.mv.feedrate,
                slot.mv.end_speed,
                slot.mv.acceleration,
            ),
            _ => Trapezoid::default(),
        };
        Some(ForwardedMove {
            id: idx as u8,
            mv: slot.mv,
            trap,
        })
    }

    /// Drop one reference from the slot; retire exhausted head entries.
    pub fn release(&mut self, id: u8) {
        let slot = self.ring.slot_mut(id as usize);
        debug_assert!(slot.state == SlotState::Forwarded && slot.refs > 0);
        slot.refs = slot.refs.saturating_sub(1);
        loop {
            let retire = self
                .ring
                .head()
                .map(|head| head.state == SlotState::Forwarded && head.refs == 0)
                .unwrap_or(false);
            if !retire {
                break;
            }
            if let Some(idx) = self.ring.head_index() {
                self.ring.slot_mut(idx).state = SlotState::Free;
            }
            self.ring.advance();
        }
    }

    // -- position and mode bookkeeping -------------------------------------

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    pub fn current_position(&self) -> [f64; NUM_AXES] {
        self.current_position
    }

    /// Machine-frame position of the last queued target including the
    /// backlash shift; this is what the kinematics sees.
    pub fn applied_position(&self) -> [f64; NUM_AXES] {
        self.applied_position
    }

    /// Re-seed the position bookkeeping (homing, G92). Clears the backlash
    /// shift; only valid while the queue is drained.
    pub fn set_position(&mut self, position: [f64; NUM_AXES]) {
        self.current_position = position;
        for i in 0..NUM_AXES {
            self.machine_position[i] = position[i] + self.origin[i];
        }
        self.applied_position = self.machine_position;
        self.backlash_shift = [0.0; NUM_AXES];
        tracing::debug!(?position, "planner position set");
    }

    pub fn set_origin(&mut self, origin: [f64; NUM_AXES]) {
        self.origin = origin;
    }

    pub fn set_default_feedrate(&mut self, feedrate: f64) {
        self.default_feedrate = feedrate.max(self.cfg.min_feedrate);
    }

    pub fn set_tool_power(&mut self, power: ToolPower) {
        self.tool_power = power;
    }

    pub fn set_guard_moves(&mut self, guard: bool) {
        self.guard_moves = guard;
    }

    /// Drop all not-yet-forwarded entries; in-flight moves keep their slots.
    /// Called when an endstop abort discards the buffered tail.
    pub fn discard_queued(&mut self) {
        while self.ring.len() > 0 {
            let idx = self.ring.index_of(self.ring.len() - 1);
            if self.ring.slot(idx).state != SlotState::Queued {
                break;
            }
            self.ring.slot_mut(idx).state = SlotState::Free;
            self.ring.pop_tail();
        }
    }

    /// Drop every queued entry (emergency stop).
    pub fn clear(&mut self) {
        for off in 0..self.ring.len() {
            let idx = self.ring.index_of(off);
            self.ring.slot_mut(idx).state = SlotState::Free;
        }
        self.ring.clear();
    }

    /// Snapshot of the queued moves, oldest first. Test and debug aid.
    pub fn snapshot(&self) -> Vec<Move> {
        (0..self.ring.len())
            .map(|off| self.ring.slot(self.ring.index_of(off)).mv)
            .collect()
    }

    /// Default homing travel for an axis: the full span plus margin.
    pub fn homing_span(&self, axis: usize) -> f64 {
        let span = self.cfg.max_pos[axis] - self.cfg.min_pos[axis];
        if axis == Z_AXIS {
            span * 1.1 + 5.0
        } else {
            span * 1.2 + 5.0
        }
    }
}

/// Maximum speed both moves can share at their junction without exceeding
/// any per-axis yank allowance. Zero for a full reversal.
fn junction_allowance(prev: &Move, next: &Move, yank: &[f64; NUM_AXES]) -> f64 {
    let mut cos = 0.0;
    for i in 0..NUM_AXES {
        cos += prev.unit_dir[i] * next.unit_dir[i];
    }
    if cos <= REVERSAL_COS {
        return 0.0;
    }
    let mut cap = prev.feedrate.min(next.feedrate);
    for i in 0..NUM_AXES {
        let du = (next.unit_dir[i] - prev.unit_dir[i]).abs();
        if du > MIN_COMPONENT {
            cap = cap.min(yank[i] / du);
        }
    }
    cap
}
