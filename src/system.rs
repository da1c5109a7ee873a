// src/system.rs - The motion system facade
//! Single owner of the three-stage pipeline: the move planner (L1), the
//! segment generator (L2), the step ring and pulser (L3), the endstop state
//! and the hardware backends.
//!
//! Three entry points mirror the three execution contexts of the firmware:
//! the queueing API (command loop, may block cooperatively), `prepare_tick`
//! (mid-priority timer) and `step_tick` (step timer). Stage state lives
//! behind short-held mutexes acquired in the fixed order
//! `pulser -> segments -> step ring -> planner -> backends`; ISR-shared
//! words (skip id, trigger masks, homed flags) are atomics.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::MotionConfig;
use crate::error::{ConfigError, MotionAlert, MotionError, QueueOutcome};
use crate::hardware::Backends;
use crate::motion::axis::{AxisMask, AXIS_NAMES, NUM_AXES, Z_AXIS};
use crate::motion::endstops::{EndstopMode, EndstopState};
use crate::motion::kinematics::{self, Kinematics};
use crate::motion::planner::Planner;
use crate::motion::pulser::{bresenham_tick, StepPulser, StepSlice, NO_PARENT};
use crate::motion::ring::Ring;
use crate::motion::segments::SegmentGenerator;
use crate::motion::tool::ToolPower;

/// Depth of the step-slice ring.
pub const STEP_CACHE_SIZE: usize = 32;

/// Ring occupancy snapshot for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub moves: usize,
    pub segments: usize,
    pub slices: usize,
}

/// The pipeline. Construct once, share via `Arc`, and drive the two ticks
/// from timers (see the `driver` module) or directly in tests.
pub struct MotionSystem {
    cfg: MotionConfig,
    kin: Box<dyn Kinematics>,
    planner: Mutex<Planner>,
    seg: Mutex<SegmentGenerator>,
    l3: Mutex<Ring<StepSlice>>,
    pulser: Mutex<StepPulser>,
    endstops: EndstopState,
    /// Parent id the pulser fast-forwards past after an endstop abort.
    skip_parent: AtomicU8,
    backends: Mutex<Backends>,
    alert: Mutex<Option<MotionAlert>>,
}

impl MotionSystem {
    pub fn new(cfg: MotionConfig, backends: Backends) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let kin = kinematics::from_config(&cfg);
        let seg = SegmentGenerator::new(
            cfg.steps_per_mm,
            cfg.prepare_frequency,
            cfg.step_frequency,
            kin.rate_bound(),
        );
        tracing::info!(
            kinematics = ?cfg.kinematics,
            prepare_hz = cfg.prepare_frequency,
            step_hz = cfg.step_frequency,
            "motion system ready"
        );
        Ok(Self {
            planner: Mutex::new(Planner::new(&cfg)),
            seg: Mutex::new(seg),
            l3: Mutex::new(Ring::new(STEP_CACHE_SIZE)),
            pulser: Mutex::new(StepPulser::new()),
            endstops: EndstopState::new(),
            skip_parent: AtomicU8::new(NO_PARENT),
            backends: Mutex::new(backends),
            alert: Mutex::new(None),
            kin,
            cfg,
        })
    }

    pub fn config(&self) -> &MotionConfig {
        &self.cfg
    }

    // -- queueing API (command-loop context) --------------------------------

    /// Queue a Cartesian move. `Blocked` means no slot was free; position
    /// only advances on `Queued`/`Empty`.
    pub fn queue_move(
        &self,
        target: [f64; NUM_AXES],
        feedrate: Option<f64>,
    ) -> Result<QueueOutcome, MotionError> {
        self.lock_planner()
            .queue_move(target, feedrate, true, self.kin.as_ref())
    }

    /// Queue a motor-space move (homing, probing).
    pub fn queue_steps(&self, delta_steps: [i32; NUM_AXES], feedrate: f64) -> QueueOutcome {
        self.lock_planner().queue_steps(delta_steps, feedrate)
    }

    /// Queue a dwell.
    pub fn queue_wait(&self, duration: Duration) -> QueueOutcome {
        let ticks = (duration.as_secs_f64() * self.cfg.step_frequency as f64)
            .round()
            .min(u32::MAX as f64) as u32;
        self.lock_planner().queue_wait_ticks(ticks)
    }

    /// Queue a block-until-warm entry for a tool.
    pub fn queue_warmup(&self, tool: usize, target_c: f64) -> QueueOutcome {
        self.lock_planner().queue_warmup(tool, target_c)
    }

    /// As [`queue_move`](Self::queue_move), but yields to the runtime until
    /// a queue slot frees up. The yield doubles as the watchdog feed point.
    pub async fn move_blocking(
        &self,
        target: [f64; NUM_AXES],
        feedrate: Option<f64>,
    ) -> Result<(), MotionError> {
        loop {
            match self.queue_move(target, feedrate)? {
                QueueOutcome::Blocked => tokio::time::sleep(Duration::from_micros(200)).await,
                QueueOutcome::Queued | QueueOutcome::Empty => return Ok(()),
            }
        }
    }

    /// Resolve once every queued move has been pulsed out.
    pub async fn wait_until_drained(&self) {
        loop {
            if self.is_idle() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    pub fn is_queue_full(&self) -> bool {
        self.lock_planner().is_full()
    }

    /// All three levels empty and no slice in flight.
    pub fn is_idle(&self) -> bool {
        if !self.lock_planner().is_empty() {
            return false;
        }
        {
            let seg = self.seg.lock().unwrap_or_else(|e| e.into_inner());
            if seg.has_work() || !seg.is_empty() {
                return false;
            }
        }
        if !self.l3.lock().unwrap_or_else(|e| e.into_inner()).is_empty() {
            return false;
        }
        self.pulser
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .current
            .is_none()
    }

    /// Logical position in the caller frame; advances at queue time.
    pub fn current_position(&self) -> [f64; NUM_AXES] {
        self.lock_planner().current_position()
    }

    /// Motor-step snapshot tracked by the segment generator.
    pub fn motor_position(&self) -> [i32; NUM_AXES] {
        self.seg
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .motor_position()
    }

    /// Re-seed the logical position and the motor tracking (G92 and the end
    /// of homing). Only meaningful while drained.
    pub fn set_position(&self, position: [f64; NUM_AXES]) {
        let applied = {
            let mut pl = self.lock_planner();
            pl.set_position(position);
            pl.applied_position()
        };
        let mut motor = [0i32; NUM_AXES];
        self.kin.transform(&applied, &mut motor);
        self.seg
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .set_motor_position(motor);
    }

    pub fn set_origin(&self, origin: [f64; NUM_AXES]) {
        self.lock_planner().set_origin(origin);
    }

    /// Feedrate used when a queueing call passes `None`.
    pub fn set_feedrate(&self, feedrate: f64) {
        self.lock_planner().set_default_feedrate(feedrate);
    }

    /// Tool intensity settings copied into subsequently queued moves.
    pub fn set_tool_power(&self, power: ToolPower) {
        self.lock_planner().set_tool_power(power);
    }

    /// One-shot alert raised from tick context; read once per loop.
    pub fn take_alert(&self) -> Option<MotionAlert> {
        self.alert.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn is_axis_homed(&self, axis: usize) -> bool {
        self.endstops.is_homed(axis)
    }

    /// Count of arc-length regressions observed by the generator.
    pub fn reversal_count(&self) -> u64 {
        self.seg.lock().unwrap_or_else(|e| e.into_inner()).reversals()
    }

    pub fn queue_stats(&self) -> QueueStats {
        QueueStats {
            moves: self.lock_planner().len(),
            segments: self.seg.lock().unwrap_or_else(|e| e.into_inner()).len(),
            slices: self.l3.lock().unwrap_or_else(|e| e.into_inner()).len(),
        }
    }

    /// Log ring occupancy.
    pub fn report_queues(&self) {
        let stats = self.queue_stats();
        tracing::info!(
            moves = stats.moves,
            segments = stats.segments,
            slices = stats.slices,
            "queue occupancy"
        );
    }

    /// Drain everything, de-energize the motors and drop homed flags.
    pub fn kill(&self) {
        let mut pu = self.pulser.lock().unwrap_or_else(|e| e.into_inner());
        let mut seg = self.seg.lock().unwrap_or_else(|e| e.into_inner());
        let mut l3 = self.l3.lock().unwrap_or_else(|e| e.into_inner());
        let mut pl = self.lock_planner();
        pu.clear();
        seg.clear();
        l3.clear();
        pl.clear();
        self.skip_parent.store(NO_PARENT, Ordering::Release);
        self.endstops.clear_homed();
        self.endstops.arm(EndstopMode::Ignore, AxisMask::NONE);
        self.backends
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stepper
            .disable(AxisMask::ALL);
        tracing::warn!("motion killed: queues drained, motors disabled");
    }

    // -- homing and probing -------------------------------------------------

    /// Home one axis: drive into its endstop, then re-seed positions at the
    /// configured end of travel.
    pub async fn home_axis(&self, axis: usize) -> Result<(), MotionError> {
        let dir = self.cfg.home_dir[axis];
        if dir == 0 {
            tracing::warn!(axis = %AXIS_NAMES[axis], "axis has no homing direction configured");
            return Ok(());
        }
        self.wait_until_drained().await;
        self.endstops.arm(EndstopMode::StopAtAnyHit, AxisMask::bit(axis));
        {
            let mut pl = self.lock_planner();
            pl.set_guard_moves(true);
            let span = pl.homing_span(axis);
            let mut delta = [0i32; NUM_AXES];
            delta[axis] = (span * self.cfg.steps_per_mm[axis]) as i32 * dir as i32;
            pl.queue_steps(delta, self.cfg.homing_feedrate[axis]);
        }
        self.wait_until_drained().await;
        self.lock_planner().set_guard_moves(false);

        let hit = self.endstops.hit();
        self.endstops.arm(EndstopMode::Ignore, AxisMask::NONE);
        if !hit {
            return Err(MotionError::HomingFailed {
                axis: AXIS_NAMES[axis],
            });
        }

        let mut pos = self.current_position();
        pos[axis] = if dir < 0 {
            self.cfg.min_pos[axis]
        } else {
            self.cfg.max_pos[axis]
        };
        self.set_position(pos);
        self.endstops.set_homed(axis, true);
        tracing::info!(axis = %AXIS_NAMES[axis], "axis homed");
        Ok(())
    }

    /// Descend Z until the probe fires; report the trigger height. Homed
    /// flags are left untouched on failure.
    pub async fn probe_descend(&self, max_travel: f64) -> Result<f64, MotionError> {
        self.wait_until_drained().await;
        self.endstops.arm(EndstopMode::Probing, AxisMask::bit(Z_AXIS));
        {
            let mut pl = self.lock_planner();
            pl.set_guard_moves(true);
            let mut delta = [0i32; NUM_AXES];
            delta[Z_AXIS] = -((max_travel * self.cfg.steps_per_mm[Z_AXIS]) as i32);
            pl.queue_steps(delta, self.cfg.homing_feedrate[Z_AXIS]);
        }
        self.wait_until_drained().await;
        self.lock_planner().set_guard_moves(false);

        let hit = self.endstops.hit();
        let probe_motor = self.endstops.probe_position();
        self.endstops.arm(EndstopMode::Ignore, AxisMask::NONE);
        if !hit {
            return Err(MotionError::ProbeFailedToTrigger);
        }

        // re-seed bookkeeping at the latched trigger position
        let mut cart = [0.0; NUM_AXES];
        self.kin.inverse(&probe_motor, &mut cart);
        {
            let mut pl = self.lock_planner();
            pl.set_position(cart);
        }
        self.seg
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .set_motor_position(probe_motor);
        tracing::info!(height = cart[Z_AXIS], "probe triggered");
        Ok(cart[Z_AXIS])
    }

    // -- prep-timer context -------------------------------------------------

    /// One segment-generator tick: adopt at most one move, emit at most one
    /// micro-slice. Short and non-blocking; call at `prepare_frequency`.
    pub fn prepare_tick(&self) {
        let mut seg = self.seg.lock().unwrap_or_else(|e| e.into_inner());
        // back-pressure: hold the slice until the step ring has room
        {
            let l3 = self.l3.lock().unwrap_or_else(|e| e.into_inner());
            if l3.is_full() {
                return;
            }
        }
        if !seg.has_work() {
            if seg.is_full() {
                return;
            }
            let fwd = self.lock_planner().forward();
            match fwd {
                Some(fwd) => seg.adopt(fwd, self.kin.as_ref()),
                None => return,
            }
        }
        let slice = {
            let mut backends = self.backends.lock().unwrap_or_else(|e| e.into_inner());
            seg.generate(self.kin.as_ref(), &mut backends, self.skip())
        };
        let Some(slice) = slice else {
            return;
        };
        if !slice.used_axes.is_empty() {
            let motors = self.kin.motor_mask(slice.used_axes);
            self.backends
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .stepper
                .enable(motors);
        }
        let mut l3 = self.l3.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(idx) = l3.try_reserve() {
            *l3.slot_mut(idx) = slice;
            l3.commit();
        } else {
            debug_assert!(false, "step ring filled underneath its only producer");
        }
    }

    // -- step-timer context -------------------------------------------------

    /// One step tick: replay the Bresenham state of the current slice
    /// against the stepper outputs. Bounded work; call at `step_frequency`.
    pub fn step_tick(&self) {
        let mut pu = self.pulser.lock().unwrap_or_else(|e| e.into_inner());

        if pu.current.is_none() {
            let popped = {
                let mut l3 = self.l3.lock().unwrap_or_else(|e| e.into_inner());
                match l3.head() {
                    Some(head) => {
                        let slice = *head;
                        l3.advance();
                        Some(slice)
                    }
                    None => None,
                }
            };
            let Some(slice) = popped else {
                return; // idle
            };
            {
                let mut backends = self.backends.lock().unwrap_or_else(|e| e.into_inner());
                let stepper = backends.stepper.as_mut();
                pu.latch_directions(&slice, |axis, positive| {
                    stepper.set_direction(axis, positive)
                });
            }
            pu.current = Some(slice);
        }

        // endstop abort: drop the remaining steps of every slice of the
        // aborted parent, one slice per tick
        let parent = pu.current.as_ref().map(|s| s.parent_id).unwrap_or(NO_PARENT);
        if self.skip() == Some(parent) {
            let slice = pu.current.take().unwrap_or_default();
            if slice.last {
                self.finish_parent(parent);
            }
            return;
        }

        let mut slice = match pu.current.take() {
            Some(slice) => slice,
            None => return,
        };
        let mut stepped = [0i32; NUM_AXES];
        let done = {
            let mut backends = self.backends.lock().unwrap_or_else(|e| e.into_inner());
            let stepper = backends.stepper.as_mut();
            bresenham_tick(&mut slice, &mut |axis| {
                stepper.step(axis);
                stepped[axis] += 1;
            })
        };

        if slice.check_endstops && stepped.iter().any(|&n| n != 0) {
            let mut seg = self.seg.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(buf) = seg.buffer_mut(slice.parent_id) {
                for i in 0..NUM_AXES {
                    buf.steps_remaining[i] = (buf.steps_remaining[i] - stepped[i]).max(0);
                }
            }
        }

        if done {
            self.backends
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .tool
                .set_intensity(slice.second_speed);
            if slice.last {
                self.finish_parent(slice.parent_id);
            }
        } else {
            pu.current = Some(slice);
        }
    }

    /// Final slice of `parent` has been pulsed (or skipped): free the L2
    /// buffer, release the L1 entry, clear a matching skip request.
    fn finish_parent(&self, parent: u8) {
        let m1 = self
            .seg
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .complete_parent(parent);
        if let Some(m1) = m1 {
            self.lock_planner().release(m1);
        }
        let _ = self.skip_parent.compare_exchange(
            parent,
            NO_PARENT,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    // -- endstop interrupt path ---------------------------------------------

    /// Endstop interrupt entry. `positive_dir` names the side that fired.
    /// Discards stale signals (idle pipeline, unguarded slice, unused axis,
    /// motion away from the switch), otherwise records the trigger and
    /// aborts per the armed [`EndstopMode`].
    pub fn endstop_triggered(&self, axis: usize, positive_dir: bool) {
        let mode = self.endstops.mode();
        if mode == EndstopMode::Ignore {
            return;
        }
        let pu = self.pulser.lock().unwrap_or_else(|e| e.into_inner());
        // the slice in flight, or the one about to start: a pressed switch
        // may race the slice boundary
        let slice = match pu.current {
            Some(slice) => slice,
            None => {
                let l3 = self.l3.lock().unwrap_or_else(|e| e.into_inner());
                match l3.head() {
                    Some(head) => *head,
                    None => return,
                }
            }
        };
        if !slice.check_endstops {
            return;
        }
        let triggered = self.endstops.record_trigger(axis, positive_dir);

        let seg = self.seg.lock().unwrap_or_else(|e| e.into_inner());
        let Some(buf) = seg.buffer(slice.parent_id) else {
            return;
        };
        if !buf.mv.axis_used.test(axis) {
            return; // not a motion direction of this move
        }
        if buf.mv.axis_dir.test(axis) != positive_dir {
            return; // moving away from the switch, stale signal
        }
        self.endstops.set_homed(axis, false);
        tracing::debug!(axis = %AXIS_NAMES[axis], ?mode, "endstop triggered");

        match mode {
            EndstopMode::Ignore => {}
            EndstopMode::StopAtAnyHit | EndstopMode::Probing => {
                self.endstops.store_steps_remaining(&buf.steps_remaining);
                if mode == EndstopMode::Probing {
                    self.endstops.store_probe_position(&seg.motor_position());
                }
                self.skip_parent.store(slice.parent_id, Ordering::Release);
                self.endstops.latch_hit();
                self.lock_planner().discard_queued();
                if mode == EndstopMode::StopAtAnyHit {
                    *self.alert.lock().unwrap_or_else(|e| e.into_inner()) =
                        Some(MotionAlert::EndstopHit { axes: triggered });
                }
            }
            EndstopMode::StopPerAxis => {
                self.endstops
                    .store_steps_remaining_axis(axis, buf.steps_remaining[axis]);
                if triggered.contains(self.endstops.stop_mask()) {
                    self.skip_parent.store(slice.parent_id, Ordering::Release);
                    self.endstops.latch_hit();
                    self.lock_planner().discard_queued();
                }
            }
        }
    }

    /// Remaining-step snapshot captured at the last trigger.
    pub fn steps_remaining_at_hit(&self) -> [i32; NUM_AXES] {
        self.endstops.steps_remaining_at_hit()
    }

    /// Endstop state handle for arming from integration code.
    pub fn endstops(&self) -> &EndstopState {
        &self.endstops
    }

    // -- internals ----------------------------------------------------------

    fn lock_planner(&self) -> std::sync::MutexGuard<'_, Planner> {
        self.planner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn skip(&self) -> Option<u8> {
        let raw = self.skip_parent.load(Ordering::Acquire);
        (raw != NO_PARENT).then_some(raw)
    }
}
