// src/driver.rs - Host-side tick pump and ISR dispatch registration
//! Two ways to drive the pipeline:
//!
//! * [`MotionDriver::spawn`] runs the prepare and step ticks from tokio
//!   tasks at the configured frequencies, for hosts and simulators. The
//!   step tick is batched per millisecond since no host timer fires
//!   reliably at tens of kilohertz.
//! * [`install`] registers the process-wide system instance so real timer
//!   interrupts can dispatch into it through the free functions
//!   [`prepare_isr`], [`step_isr`] and [`endstop_isr`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::system::MotionSystem;

static INSTALLED: OnceLock<Arc<MotionSystem>> = OnceLock::new();

/// Register the process-wide instance the ISR entry points dispatch into.
/// Returns `false` if one was already registered.
pub fn install(system: Arc<MotionSystem>) -> bool {
    INSTALLED.set(system).is_ok()
}

/// The registered instance, if any.
pub fn installed() -> Option<&'static Arc<MotionSystem>> {
    INSTALLED.get()
}

/// Prep-timer ISR entry point.
pub fn prepare_isr() {
    if let Some(sys) = INSTALLED.get() {
        sys.prepare_tick();
    }
}

/// Step-timer ISR entry point.
pub fn step_isr() {
    if let Some(sys) = INSTALLED.get() {
        sys.step_tick();
    }
}

/// Endstop interrupt entry point.
pub fn endstop_isr(axis: usize, positive_dir: bool) {
    if let Some(sys) = INSTALLED.get() {
        sys.endstop_triggered(axis, positive_dir);
    }
}

/// Tokio-based tick pump for host use.
pub struct MotionDriver {
    shutdown: Arc<AtomicBool>,
    prep_task: tokio::task::JoinHandle<()>,
    step_task: tokio::task::JoinHandle<()>,
}

impl MotionDriver {
    /// Spawn the two pump tasks on the current runtime.
    pub fn spawn(system: Arc<MotionSystem>) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let prepare_hz = system.config().prepare_frequency;
        let step_hz = system.config().step_frequency;

        let prep_sys = system.clone();
        let prep_stop = shutdown.clone();
        let prep_task = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs_f64(1.0 / prepare_hz as f64));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Burst);
            while !prep_stop.load(Ordering::Acquire) {
                interval.tick().await;
                prep_sys.prepare_tick();
            }
        });

        let step_stop = shutdown.clone();
        let step_task = tokio::spawn(async move {
            // batch the step tick per millisecond; sub-millisecond host
            // timers are not dependable
            let batch = (step_hz / 1000).max(1) as usize;
            let mut interval = tokio::time::interval(Duration::from_millis(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Burst);
            while !step_stop.load(Ordering::Acquire) {
                interval.tick().await;
                for _ in 0..batch {
                    system.step_tick();
                }
            }
        });

        tracing::debug!(prepare_hz, step_hz, "motion driver running");
        Self {
            shutdown,
            prep_task,
            step_task,
        }
    }

    /// Stop both pump tasks and wait for them to finish.
    pub async fn shutdown(self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.prep_task.await;
        let _ = self.step_task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MotionConfig;
    use crate::hardware::recording_backends;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_driver_pumps_a_move_through() {
        let (backends, handle) = recording_backends();
        let sys = Arc::new(MotionSystem::new(MotionConfig::default(), backends).unwrap());
        let driver = MotionDriver::spawn(sys.clone());

        sys.move_blocking([2.0, 0.0, 0.0, 0.0], Some(100.0))
            .await
            .unwrap();
        sys.wait_until_drained().await;
        driver.shutdown().await;

        assert_eq!(handle.steps()[0], 160, "2 mm at 80 steps/mm");
    }
}
