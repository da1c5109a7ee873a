// src/motion/kinematics.rs
//! Kinematic transforms between Cartesian space and motor steps.
//!
//! Each model implements the small capability set the pipeline needs:
//! the forward transform into motor steps (called once per micro-slice),
//! the inverse used for endstop and probe readback, the map from moving
//! Cartesian axes to the motors that must be energized, and a bound on how
//! fast a motor can run relative to path speed (used to size slice tick
//! counts).

use crate::config::{CorePair, DeltaConfig, KinematicsConfig, MotionConfig};
use crate::motion::axis::{AxisMask, E_AXIS, NUM_AXES, X_AXIS, Y_AXIS, Z_AXIS};

/// Capability set of a kinematic model.
pub trait Kinematics: Send + Sync {
    /// Cartesian position (mm) to motor position (steps).
    fn transform(&self, cart: &[f64; NUM_AXES], motor: &mut [i32; NUM_AXES]);

    /// Motor position (steps) back to Cartesian (mm). Used only for
    /// endstop-hit and probe reporting, not in the slice hot path.
    fn inverse(&self, motor: &[i32; NUM_AXES], cart: &mut [f64; NUM_AXES]);

    /// Motors that must be energized when the given Cartesian axes move.
    fn motor_mask(&self, axes: AxisMask) -> AxisMask;

    /// Worst-case ratio of motor speed (in mm-equivalent) to path speed
    /// inside the reachable volume. 1.0 for uncoupled axes.
    fn rate_bound(&self) -> f64;

    /// Geometric reachability beyond the per-axis bounding box.
    fn reachable(&self, _cart: &[f64; NUM_AXES]) -> bool {
        true
    }
}

/// Build the configured model.
pub fn from_config(cfg: &MotionConfig) -> Box<dyn Kinematics> {
    match &cfg.kinematics {
        KinematicsConfig::Cartesian => Box::new(Cartesian::new(cfg.steps_per_mm)),
        KinematicsConfig::CoreXy { pair } => Box::new(CoreXy::new(cfg.steps_per_mm, *pair)),
        KinematicsConfig::Delta(delta) => Box::new(Delta::new(cfg.steps_per_mm, delta)),
    }
}

/// One motor per axis. Also covers gantry machines whose coupling is
/// resolved upstream of the pipeline.
pub struct Cartesian {
    steps_per_mm: [f64; NUM_AXES],
}

impl Cartesian {
    pub fn new(steps_per_mm: [f64; NUM_AXES]) -> Self {
        Self { steps_per_mm }
    }
}

impl Kinematics for Cartesian {
    fn transform(&self, cart: &[f64; NUM_AXES], motor: &mut [i32; NUM_AXES]) {
        for i in 0..NUM_AXES {
            motor[i] = (cart[i] * self.steps_per_mm[i]).round() as i32;
        }
    }

    fn inverse(&self, motor: &[i32; NUM_AXES], cart: &mut [f64; NUM_AXES]) {
        for i in 0..NUM_AXES {
            cart[i] = motor[i] as f64 / self.steps_per_mm[i];
        }
    }

    fn motor_mask(&self, axes: AxisMask) -> AxisMask {
        axes
    }

    fn rate_bound(&self) -> f64 {
        1.0
    }
}

/// Crossed-belt kinematics: two motors drive a Cartesian pair as their sum
/// and difference. The coupled pair is selectable (XY, YX, XZ).
pub struct CoreXy {
    steps_per_mm: [f64; NUM_AXES],
    /// Indices of the coupled pair: motor `p` carries `c[p] + c[q]`,
    /// motor `q` carries `c[p] - c[q]`.
    p: usize,
    q: usize,
}

impl CoreXy {
    pub fn new(steps_per_mm: [f64; NUM_AXES], pair: CorePair) -> Self {
        let (p, q) = match pair {
            CorePair::Xy => (X_AXIS, Y_AXIS),
            CorePair::Yx => (Y_AXIS, X_AXIS),
            CorePair::Xz => (X_AXIS, Z_AXIS),
        };
        Self { steps_per_mm, p, q }
    }
}

impl Kinematics for CoreXy {
    fn transform(&self, cart: &[f64; NUM_AXES], motor: &mut [i32; NUM_AXES]) {
        for i in 0..NUM_AXES {
            if i == self.p {
                motor[i] = ((cart[self.p] + cart[self.q]) * self.steps_per_mm[i]).round() as i32;
            } else if i == self.q {
                motor[i] = ((cart[self.p] - cart[self.q]) * self.steps_per_mm[i]).round() as i32;
            } else {
                motor[i] = (cart[i] * self.steps_per_mm[i]).round() as i32;
            }
        }
    }

    fn inverse(&self, motor: &[i32; NUM_AXES], cart: &mut [f64; NUM_AXES]) {
        let a = motor[self.p] as f64 / self.steps_per_mm[self.p];
        let b = motor[self.q] as f64 / self.steps_per_mm[self.q];
        for i in 0..NUM_AXES {
            if i == self.p {
                cart[i] = 0.5 * (a + b);
            } else if i == self.q {
                cart[i] = 0.5 * (a - b);
            } else {
                cart[i] = motor[i] as f64 / self.steps_per_mm[i];
            }
        }
    }

    fn motor_mask(&self, axes: AxisMask) -> AxisMask {
        let mut out = axes;
        if axes.test(self.p) || axes.test(self.q) {
            out.set(self.p);
            out.set(self.q);
        }
        out
    }

    fn rate_bound(&self) -> f64 {
        // |d(p±q)/ds| <= sqrt(2); round up for rounding slack
        2.0
    }
}

/// Delta kinematics: three vertical carriages on towers A/B/C (occupying
/// the X/Y/Z motor slots) drive the effector through fixed diagonals.
pub struct Delta {
    steps_per_mm: [f64; NUM_AXES],
    /// Tower column positions on the build plane.
    towers: [[f64; 2]; 3],
    diagonal: [f64; 3],
    diagonal_sq: [f64; 3],
    printable_radius: f64,
    rate_bound: f64,
}

impl Delta {
    pub fn new(steps_per_mm: [f64; NUM_AXES], cfg: &DeltaConfig) -> Self {
        let mut towers = [[0.0; 2]; 3];
        let mut diagonal = [0.0; 3];
        let mut diagonal_sq = [0.0; 3];
        for k in 0..3 {
            let r = cfg.horizontal_radius + cfg.radius_correction[k];
            let alpha = cfg.alpha[k].to_radians();
            towers[k] = [r * alpha.cos(), r * alpha.sin()];
            diagonal[k] = cfg.diagonal_length + cfg.diagonal_correction[k];
            diagonal_sq[k] = diagonal[k] * diagonal[k];
        }
        // Worst-case carriage speed per unit path speed occurs at the rim:
        // 1 (vertical component) + r / sqrt(d^2 - r^2) (horizontal lever).
        let d_min = diagonal.iter().cloned().fold(f64::INFINITY, f64::min);
        let lever = {
            let reach = cfg.horizontal_radius + cfg.printable_radius;
            let h_sq = (d_min * d_min - reach * reach).max(d_min * d_min * 0.05);
            reach / h_sq.sqrt()
        };
        Self {
            steps_per_mm,
            towers,
            diagonal,
            diagonal_sq,
            printable_radius: cfg.printable_radius,
            rate_bound: 1.0 + lever,
        }
    }

    /// Carriage height for one tower at the given effector position.
    fn carriage_height(&self, k: usize, x: f64, y: f64, z: f64) -> f64 {
        let dx = x - self.towers[k][0];
        let dy = y - self.towers[k][1];
        let arm_sq = (self.diagonal_sq[k] - dx * dx - dy * dy).max(0.0);
        z + arm_sq.sqrt()
    }
}

impl Kinematics for Delta {
    fn transform(&self, cart: &[f64; NUM_AXES], motor: &mut [i32; NUM_AXES]) {
        let (x, y, z) = (cart[X_AXIS], cart[Y_AXIS], cart[Z_AXIS]);
        for k in 0..3 {
            motor[k] =
                (self.carriage_height(k, x, y, z) * self.steps_per_mm[Z_AXIS]).round() as i32;
        }
        motor[E_AXIS] = (cart[E_AXIS] * self.steps_per_mm[E_AXIS]).round() as i32;
    }

    fn inverse(&self, motor: &[i32; NUM_AXES], cart: &mut [f64; NUM_AXES]) {
        // Trilateration: intersect the three spheres centered at the
        // carriages. Subtracting pairs of sphere equations gives x and y as
        // linear functions of z; substituting back yields a quadratic whose
        // lower root is the effector (it hangs below the carriages).
        let h: [f64; 3] = [
            motor[0] as f64 / self.steps_per_mm[Z_AXIS],
            motor[1] as f64 / self.steps_per_mm[Z_AXIS],
            motor[2] as f64 / self.steps_per_mm[Z_AXIS],
        ];
        let t = &self.towers;
        let norm =
            |k: usize| t[k][0] * t[k][0] + t[k][1] * t[k][1] + h[k] * h[k] - self.diagonal_sq[k];

        let (a1, b1, c1) = (
            2.0 * (t[0][0] - t[1][0]),
            2.0 * (t[0][1] - t[1][1]),
            2.0 * (h[0] - h[1]),
        );
        let w1 = norm(0) - norm(1);
        let (a2, b2, c2) = (
            2.0 * (t[0][0] - t[2][0]),
            2.0 * (t[0][1] - t[2][1]),
            2.0 * (h[0] - h[2]),
        );
        let w2 = norm(0) - norm(2);

        let det = a1 * b2 - b1 * a2;
        // Towers are not collinear for any sane geometry; fall back to the
        // tower-frame origin if a degenerate config sneaks through.
        if det.abs() < 1e-12 {
            cart[X_AXIS] = 0.0;
            cart[Y_AXIS] = 0.0;
            cart[Z_AXIS] = h[0] - self.diagonal[0];
            cart[E_AXIS] = motor[E_AXIS] as f64 / self.steps_per_mm[E_AXIS];
            return;
        }

        // x = x0 + x1 * z, y = y0 + y1 * z
        let x0 = (w1 * b2 - b1 * w2) / det;
        let x1 = (b1 * c2 - c1 * b2) / det;
        let y0 = (a1 * w2 - w1 * a2) / det;
        let y1 = (c1 * a2 - a1 * c2) / det;

        let ex = x0 - t[0][0];
        let ey = y0 - t[0][1];
        let qa = x1 * x1 + y1 * y1 + 1.0;
        let qb = 2.0 * (x1 * ex + y1 * ey - h[0]);
        let qc = ex * ex + ey * ey + h[0] * h[0] - self.diagonal_sq[0];
        let disc = (qb * qb - 4.0 * qa * qc).max(0.0);

        let z = (-qb - disc.sqrt()) / (2.0 * qa);
        cart[X_AXIS] = x0 + x1 * z;
        cart[Y_AXIS] = y0 + y1 * z;
        cart[Z_AXIS] = z;
        cart[E_AXIS] = motor[E_AXIS] as f64 / self.steps_per_mm[E_AXIS];
    }

    fn motor_mask(&self, axes: AxisMask) -> AxisMask {
        let mut out = axes & AxisMask::bit(E_AXIS);
        if axes.test(X_AXIS) || axes.test(Y_AXIS) || axes.test(Z_AXIS) {
            out.set(X_AXIS);
            out.set(Y_AXIS);
            out.set(Z_AXIS);
        }
        out
    }

    fn rate_bound(&self) -> f64 {
        self.rate_bound
    }

    fn reachable(&self, cart: &[f64; NUM_AXES]) -> bool {
        let r_sq = cart[X_AXIS] * cart[X_AXIS] + cart[Y_AXIS] * cart[Y_AXIS];
        if r_sq > self.printable_radius * self.printable_radius {
            return false;
        }
        // every tower must keep a real arm solution
        (0..3).all(|k| {
            let dx = cart[X_AXIS] - self.towers[k][0];
            let dy = cart[Y_AXIS] - self.towers[k][1];
            dx * dx + dy * dy < self.diagonal_sq[k]
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPMM: [f64; NUM_AXES] = [80.0, 80.0, 80.0, 500.0];

    #[test]
    fn test_cartesian_identity() {
        let kin = Cartesian::new(SPMM);
        let mut motor = [0i32; NUM_AXES];
        kin.transform(&[10.0, -2.5, 1.0, 3.0], &mut motor);
        assert_eq!(motor, [800, -200, 80, 1500]);

        let mut cart = [0.0; NUM_AXES];
        kin.inverse(&motor, &mut cart);
        assert!((cart[0] - 10.0).abs() < 1e-9);
        assert!((cart[1] + 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_corexy_sum_difference() {
        let kin = CoreXy::new(SPMM, CorePair::Xy);
        let mut motor = [0i32; NUM_AXES];
        kin.transform(&[10.0, 4.0, 2.0, 0.0], &mut motor);
        assert_eq!(motor[X_AXIS], 80 * 14);
        assert_eq!(motor[Y_AXIS], 80 * 6);
        assert_eq!(motor[Z_AXIS], 160);

        let mut cart = [0.0; NUM_AXES];
        kin.inverse(&motor, &mut cart);
        assert!((cart[X_AXIS] - 10.0).abs() < 1e-9);
        assert!((cart[Y_AXIS] - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_corexy_motor_mask_couples_pair() {
        let kin = CoreXy::new(SPMM, CorePair::Xy);
        let mask = kin.motor_mask(AxisMask::bit(X_AXIS));
        assert!(mask.test(X_AXIS) && mask.test(Y_AXIS));
        assert!(!mask.test(Z_AXIS));

        let mask = kin.motor_mask(AxisMask::bit(Z_AXIS) | AxisMask::bit(E_AXIS));
        assert!(!mask.test(X_AXIS));
        assert!(mask.test(Z_AXIS) && mask.test(E_AXIS));
    }

    fn delta_kin() -> Delta {
        Delta::new(SPMM, &DeltaConfig::default())
    }

    #[test]
    fn test_delta_pure_z_moves_towers_equally() {
        let kin = delta_kin();
        let mut at_zero = [0i32; NUM_AXES];
        let mut raised = [0i32; NUM_AXES];
        // same Z step count on all towers regardless of the XY position
        for &(x, y) in &[(0.0, 0.0), (40.0, -25.0), (-60.0, 10.0)] {
            kin.transform(&[x, y, 10.0, 0.0], &mut at_zero);
            kin.transform(&[x, y, 11.0, 0.0], &mut raised);
            for k in 0..3 {
                assert_eq!(raised[k] - at_zero[k], 80, "tower {} at ({}, {})", k, x, y);
            }
        }
    }

    #[test]
    fn test_delta_inverse_roundtrip() {
        let kin = delta_kin();
        let mut motor = [0i32; NUM_AXES];
        let mut cart = [0.0; NUM_AXES];
        for &(x, y, z) in &[(0.0, 0.0, 5.0), (30.0, 40.0, 100.0), (-50.0, 12.0, 7.5)] {
            kin.transform(&[x, y, z, 2.0], &mut motor);
            kin.inverse(&motor, &mut cart);
            // one step is 1/80 mm; allow a couple steps of rounding
            assert!((cart[X_AXIS] - x).abs() < 0.05, "x {} vs {}", cart[X_AXIS], x);
            assert!((cart[Y_AXIS] - y).abs() < 0.05, "y {} vs {}", cart[Y_AXIS], y);
            assert!((cart[Z_AXIS] - z).abs() < 0.05, "z {} vs {}", cart[Z_AXIS], z);
        }
    }

    #[test]
    fn test_delta_reachability() {
        let kin = delta_kin();
        assert!(kin.reachable(&[0.0, 0.0, 10.0, 0.0]));
        assert!(kin.reachable(&[100.0, 0.0, 10.0, 0.0]));
        assert!(!kin.reachable(&[150.0, 0.0, 10.0, 0.0]));
    }

    #[test]
    fn test_delta_motor_mask() {
        let kin = delta_kin();
        let mask = kin.motor_mask(AxisMask::bit(X_AXIS));
        assert!(mask.test(X_AXIS) && mask.test(Y_AXIS) && mask.test(Z_AXIS));
        assert!(!mask.test(E_AXIS));
    }
}
