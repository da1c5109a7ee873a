// src/motion/profile.rs
//! Velocity profile primitives.
//!
//! [`Trapezoid`] fits the accel/cruise/decel phases of one move;
//! [`VelocityProfile`] walks a single phase in uniform time slices of
//! `1 / prepare_frequency` for the segment generator.

/// Piecewise trapezoidal profile of one move.
///
/// Durations `t1..t3` and distances `s1..s3` cover acceleration, cruise and
/// deceleration. Phases may be empty. `cruise` is the actually reachable
/// peak speed; it equals the requested feedrate unless the move is too short
/// for a full trapezoid.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Trapezoid {
    pub t1: f64,
    pub t2: f64,
    pub t3: f64,
    pub s1: f64,
    pub s2: f64,
    pub s3: f64,
    pub cruise: f64,
}

impl Trapezoid {
    /// Fit a trapezoid over `length` with the given entry/cruise/exit speeds
    /// and a single acceleration magnitude.
    ///
    /// When accel and decel distances together exceed the length, the cruise
    /// speed is reduced to the peak the length allows (triangle profile).
    /// Entry and exit speeds are honored as-is; the caller guarantees their
    /// feasibility through the look-ahead sweeps.
    pub fn fit(length: f64, start_speed: f64, cruise: f64, end_speed: f64, accel: f64) -> Trapezoid {
        debug_assert!(length > 0.0 && accel > 0.0);
        let mut cruise = cruise.max(start_speed).max(end_speed);

        let inv_2a = 0.5 / accel;
        let mut s1 = (cruise * cruise - start_speed * start_speed) * inv_2a;
        let mut s3 = (cruise * cruise - end_speed * end_speed) * inv_2a;

        if s1 + s3 > length {
            // triangle: solve for the peak both ramps meet at
            let peak_sq = accel * length + 0.5 * (start_speed * start_speed + end_speed * end_speed);
            cruise = peak_sq.sqrt().max(start_speed).max(end_speed);
            s1 = ((cruise * cruise - start_speed * start_speed) * inv_2a).max(0.0);
            s3 = (length - s1).max(0.0);
        }

        let s2 = (length - s1 - s3).max(0.0);
        let t1 = (cruise - start_speed) / accel;
        let t3 = (cruise - end_speed) / accel;
        let t2 = if cruise > 0.0 { s2 / cruise } else { 0.0 };

        Trapezoid {
            t1,
            t2,
            t3,
            s1,
            s2,
            s3,
            cruise,
        }
    }

    /// Total duration of the move.
    #[inline]
    pub fn duration(&self) -> f64 {
        self.t1 + self.t2 + self.t3
    }
}

/// Uniform-time integrator over one profile phase.
///
/// `start` divides a phase of duration `t` into `ceil(t * prepare_frequency)`
/// slices and yields the first slice; each `next` yields another. Both
/// return `true` when the phase is exhausted. After each call, `s` is the
/// arc length covered since the phase began, `f` the speed at the slice end,
/// and `steps_per_segment` the step-tick count the slice represents.
#[derive(Debug, Clone)]
pub struct VelocityProfile {
    dt: f64,
    /// Speed at the end of the current slice (profile units per second).
    pub f: f64,
    /// Arc length covered since the phase started (profile units).
    pub s: f64,
    /// Step ticks the current slice represents.
    pub steps_per_segment: u32,
    accel: f64,
    /// Phase end speed; `f` is clamped against it so the ceil'd slice count
    /// cannot overshoot the target.
    target: f64,
    segments: u32,
}

impl VelocityProfile {
    pub fn new(prepare_frequency: u32) -> Self {
        Self {
            dt: 1.0 / prepare_frequency as f64,
            f: 0.0,
            s: 0.0,
            steps_per_segment: 0,
            accel: 0.0,
            target: 0.0,
            segments: 0,
        }
    }

    #[inline]
    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// Begin a phase ramping from `v0` to `v1` over `t` seconds and advance
    /// into its first slice. `steps_per_unit` converts profile units to step
    /// ticks (steps/mm for Cartesian moves, 1 for motor-space moves).
    ///
    /// Returns `true` when the phase is empty or single-sliced.
    pub fn start(&mut self, v0: f64, v1: f64, t: f64, steps_per_unit: f64) -> bool {
        self.s = 0.0;
        self.target = v1;
        if t <= 0.0 {
            self.f = v1;
            self.steps_per_segment = 0;
            self.segments = 0;
            self.accel = 0.0;
            return true;
        }
        self.segments = (t / self.dt).ceil() as u32;
        self.accel = (v1 - v0) / t;
        self.f = v0;
        self.advance(steps_per_unit)
    }

    /// Advance one slice within the running phase.
    pub fn next(&mut self, steps_per_unit: f64) -> bool {
        debug_assert!(self.segments > 0);
        self.advance(steps_per_unit)
    }

    fn advance(&mut self, steps_per_unit: f64) -> bool {
        let f_prev = self.f;
        self.f += self.accel * self.dt;
        // the ceil'd slice count can run past the phase duration; hold the
        // speed at the target instead of integrating through it
        if (self.accel > 0.0 && self.f > self.target)
            || (self.accel < 0.0 && self.f < self.target)
        {
            self.f = self.target;
        }
        // trapezoidal mean; equals f_prev*dt + a*dt^2/2 while unclamped
        self.s += 0.5 * (f_prev + self.f) * self.dt;
        self.steps_per_segment = (self.f * self.dt * steps_per_unit).round() as u32;
        self.segments -= 1;
        self.segments == 0
    }
}
