// Look-ahead integration tests against the planner level directly:
// junction continuity, yank limits, and the freeze-on-forward discipline.

use steppipe::motion::kinematics::Cartesian;
use steppipe::motion::planner::Planner;
use steppipe::{MotionConfig, NUM_AXES};

fn planner(cfg: &MotionConfig) -> (Planner, Cartesian) {
    (Planner::new(cfg), Cartesian::new(cfg.steps_per_mm))
}

fn xy(x: f64, y: f64) -> [f64; NUM_AXES] {
    [x, y, 0.0, 0.0]
}

#[test]
fn test_colinear_chain_cruises_through_junctions() {
    let cfg = MotionConfig::default();
    let (mut pl, kin) = planner(&cfg);
    for x in [10.0, 20.0, 30.0] {
        pl.queue_move(xy(x, 0.0), Some(60.0), true, &kin).unwrap();
    }

    let a = pl.forward().unwrap();
    let b = pl.forward().unwrap();
    let c = pl.forward().unwrap();

    // middle junctions run at full cruise, ends at rest
    assert_eq!(a.mv.start_speed, 0.0);
    assert!((a.mv.end_speed - 60.0).abs() < 1e-9);
    assert!((b.mv.start_speed - 60.0).abs() < 1e-9);
    assert!((b.mv.end_speed - 60.0).abs() < 1e-9);
    assert!((c.mv.start_speed - 60.0).abs() < 1e-9);
    assert_eq!(c.mv.end_speed, 0.0);
}

#[test]
fn test_exit_entry_continuity_is_exact() {
    let cfg = MotionConfig::default();
    let (mut pl, kin) = planner(&cfg);
    // an obtuse dogleg
    pl.queue_move(xy(10.0, 0.0), Some(120.0), true, &kin).unwrap();
    pl.queue_move(xy(20.0, 0.1), Some(120.0), true, &kin).unwrap();
    pl.queue_move(xy(20.0, 10.0), Some(120.0), true, &kin).unwrap();

    let mut prev_end = None;
    while let Some(fwd) = pl.forward() {
        if let Some(prev) = prev_end {
            assert_eq!(
                prev, fwd.mv.start_speed,
                "junction speeds must match bit-for-bit"
            );
        }
        assert!(fwd.mv.start_speed <= fwd.mv.feedrate + 1e-12);
        assert!(fwd.mv.end_speed <= fwd.mv.feedrate + 1e-12);
        prev_end = Some(fwd.mv.end_speed);
    }
    assert_eq!(prev_end, Some(0.0), "queue tail always plans to rest");
}

#[test]
fn test_sharp_corner_respects_per_axis_yank() {
    let cfg = MotionConfig::default();
    let (mut pl, kin) = planner(&cfg);
    pl.queue_move(xy(10.0, 0.0), Some(120.0), true, &kin).unwrap();
    pl.queue_move(xy(10.0, 10.0), Some(120.0), true, &kin).unwrap();

    let a = pl.forward().unwrap();
    let b = pl.forward().unwrap();
    let v = a.mv.end_speed;
    assert_eq!(v, b.mv.start_speed);
    // 90 degree corner at yank 10: junction is held to 10 mm/s
    assert!((v - 10.0).abs() < 1e-9, "junction speed {}", v);
    for i in 0..NUM_AXES {
        let du = (b.mv.unit_dir[i] - a.mv.unit_dir[i]).abs();
        assert!(v * du <= cfg.max_yank[i] + 1e-9);
    }
}

#[test]
fn test_short_segments_limit_junctions_by_acceleration() {
    let mut cfg = MotionConfig::default();
    cfg.max_travel_acceleration = [1000.0; NUM_AXES];
    let (mut pl, kin) = planner(&cfg);
    // 0.5 mm colinear segments: entry speeds are reachability-limited, not
    // yank-limited
    for i in 1..=5 {
        pl.queue_move(xy(i as f64 * 0.5, 0.0), Some(200.0), true, &kin)
            .unwrap();
    }

    let mut speeds = Vec::new();
    while let Some(fwd) = pl.forward() {
        speeds.push((fwd.mv.start_speed, fwd.mv.end_speed));
    }
    // every junction obeys v^2 <= v_prev^2 + 2 a L in both directions
    for &(start, end) in &speeds {
        let reach = (start * start + 2.0 * 1000.0 * 0.5).sqrt();
        assert!(end <= reach + 1e-9, "end {} exceeds reach {}", end, reach);
        let back = (end * end + 2.0 * 1000.0 * 0.5).sqrt();
        assert!(start <= back + 1e-9, "start {} exceeds decel reach {}", start, back);
    }
    assert_eq!(speeds.last().unwrap().1, 0.0);
}

#[test]
fn test_lookahead_raises_committed_tail_entries() {
    let cfg = MotionConfig::default();
    let (mut pl, kin) = planner(&cfg);
    pl.queue_move(xy(10.0, 0.0), Some(60.0), true, &kin).unwrap();
    // alone in the queue, the move must plan to stop
    let solo = pl.snapshot()[0];
    assert_eq!(solo.end_speed, 0.0);

    // a colinear successor lets the first junction carry speed
    pl.queue_move(xy(20.0, 0.0), Some(60.0), true, &kin).unwrap();
    let first = pl.forward().unwrap();
    assert!(
        first.mv.end_speed > 0.0,
        "look-ahead should have raised the junction"
    );
}

#[test]
fn test_forward_freezes_junction_against_later_arrivals() {
    let cfg = MotionConfig::default();
    let (mut pl, kin) = planner(&cfg);
    pl.queue_move(xy(10.0, 0.0), Some(60.0), true, &kin).unwrap();
    let first = pl.forward().unwrap();
    assert_eq!(first.mv.end_speed, 0.0);

    // the successor arrives after the freeze: it must start from rest even
    // though the junction is colinear
    pl.queue_move(xy(20.0, 0.0), Some(60.0), true, &kin).unwrap();
    let second = pl.forward().unwrap();
    assert_eq!(second.mv.start_speed, 0.0);
}

#[test]
fn test_move_steps_entry_is_a_barrier() {
    let cfg = MotionConfig::default();
    let (mut pl, kin) = planner(&cfg);
    pl.queue_move(xy(10.0, 0.0), Some(60.0), true, &kin).unwrap();
    pl.queue_steps([-4000, 0, 0, 0], 40.0);
    pl.queue_move(xy(20.0, 0.0), Some(60.0), true, &kin).unwrap();

    let a = pl.forward().unwrap();
    assert_eq!(a.mv.end_speed, 0.0);
    let steps = pl.forward().unwrap();
    assert_eq!(steps.mv.start_speed, 0.0);
    assert_eq!(steps.mv.end_speed, 0.0);
    let c = pl.forward().unwrap();
    assert_eq!(c.mv.start_speed, 0.0);
}
