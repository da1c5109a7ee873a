// Benchmark of the planner and the full three-stage pipeline.
// Run with: cargo bench

use criterion::{criterion_group, criterion_main, Criterion};
use steppipe::hardware::recording_backends;
use steppipe::motion::kinematics::Cartesian;
use steppipe::motion::planner::Planner;
use steppipe::{MotionConfig, MotionSystem};

fn bench_planner_lookahead(c: &mut Criterion) {
    let cfg = MotionConfig::default();
    let kin = Cartesian::new(cfg.steps_per_mm);
    c.bench_function("queue+forward 1k zigzag moves", |b| {
        b.iter(|| {
            let mut pl = Planner::new(&cfg);
            let mut queued = 0u32;
            let mut pulled = 0u32;
            while pulled < 1000 {
                let mut progressed = false;
                if queued < 1000 {
                    let y = if queued % 2 == 0 { 1.0 } else { -1.0 };
                    let x = (queued as f64) * 0.1;
                    if let Ok(steppipe::QueueOutcome::Queued) =
                        pl.queue_move([x, 40.0 + y, 0.0, 0.0], Some(100.0), true, &kin)
                    {
                        queued += 1;
                        progressed = true;
                    }
                }
                if !progressed || queued == 1000 {
                    if let Some(fwd) = pl.forward() {
                        pl.release(fwd.id);
                        pulled += 1;
                    }
                }
            }
        });
    });
}

fn bench_pipeline_pump(c: &mut Criterion) {
    c.bench_function("pump 20 moves through all three stages", |b| {
        b.iter(|| {
            let (backends, _handle) = recording_backends();
            let sys = MotionSystem::new(MotionConfig::default(), backends).unwrap();
            for i in 1..=20 {
                sys.queue_move([(i as f64) * 2.0, (i % 3) as f64, 0.0, 0.0], Some(150.0))
                    .unwrap();
            }
            let mut guard = 0;
            loop {
                sys.prepare_tick();
                for _ in 0..40 {
                    sys.step_tick();
                }
                if sys.is_idle() {
                    break;
                }
                guard += 1;
                assert!(guard < 1_000_000);
            }
        });
    });
}

criterion_group!(benches, bench_planner_lookahead, bench_pipeline_pump);
criterion_main!(benches);
