use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::watchdog::Watchdog;

/// Number of steps of the training pipeline: preprocessing, entity extraction and the three
/// concurrent training branches
pub const NB_STEPS: f64 = 5.0;
/// A step never reports completion before it actually returns
const MAX_STEP_PROGRESS: f64 = 0.99;

/// Called with the progress lock held, it must not report progress itself
pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

struct ProgressState {
    callback: ProgressCallback,
    last: Mutex<f64>,
}

/// Overall progress of a training. Reported values never decrease, and the last value is
/// emitted again whenever no new value was reported during the heartbeat interval.
pub struct ProgressReporter {
    state: Arc<ProgressState>,
    watchdog: Watchdog,
}

impl ProgressReporter {
    pub fn start(callback: ProgressCallback, heartbeat: Duration) -> Self {
        let state = Arc::new(ProgressState {
            callback,
            last: Mutex::new(0.0),
        });
        (state.callback)(*state.last.lock());
        let heartbeat_state = state.clone();
        let watchdog = Watchdog::start(heartbeat, move || {
            let last = heartbeat_state.last.lock();
            (heartbeat_state.callback)(*last)
        });
        Self { state, watchdog }
    }

    /// Reports that `completed_steps` steps of the pipeline are done
    pub fn report_steps(&self, completed_steps: f64) {
        self.report((completed_steps / NB_STEPS).min(1.0))
    }

    /// Reports the progress of the step following `completed_steps` steps
    pub fn report_step_progress(&self, completed_steps: f64, step_progress: f64) {
        self.report_steps(completed_steps + step_progress.min(MAX_STEP_PROGRESS).max(0.0))
    }

    fn report(&self, progress: f64) {
        // emitted under the lock so that a concurrent heartbeat cannot interleave a lower value
        let mut last = self.state.last.lock();
        if progress <= *last {
            return;
        }
        *last = progress;
        self.watchdog.reset();
        (self.state.callback)(progress);
    }

    pub fn last(&self) -> f64 {
        *self.state.last.lock()
    }

    pub fn stop(&self) {
        self.watchdog.stop();
    }
}

/// Progress of the concurrent training branches, each one weighing one step
pub struct BranchesProgress<'a> {
    reporter: &'a ProgressReporter,
    completed_steps: f64,
    branches: Mutex<Vec<f64>>,
}

impl<'a> BranchesProgress<'a> {
    pub fn new(reporter: &'a ProgressReporter, completed_steps: f64, nb_branches: usize) -> Self {
        Self {
            reporter,
            completed_steps,
            branches: Mutex::new(vec![0.0; nb_branches]),
        }
    }

    pub fn report(&self, branch: usize, progress: f64) {
        let total = {
            let mut branches = self.branches.lock();
            if let Some(value) = branches.get_mut(branch) {
                *value = progress.min(MAX_STEP_PROGRESS).max(*value);
            }
            branches.iter().sum::<f64>()
        };
        self.reporter.report_steps(self.completed_steps + total)
    }

    pub fn complete(&self, branch: usize) {
        let total = {
            let mut branches = self.branches.lock();
            if let Some(value) = branches.get_mut(branch) {
                *value = 1.0;
            }
            branches.iter().sum::<f64>()
        };
        self.reporter.report_steps(self.completed_steps + total)
    }
}

/// Mean progress of units trained concurrently
pub struct UnitsProgress {
    units: Mutex<Vec<f64>>,
}

impl UnitsProgress {
    pub fn new(nb_units: usize) -> Self {
        Self {
            units: Mutex::new(vec![0.0; nb_units]),
        }
    }

    /// Updates the progress of one unit and returns the mean progress
    pub fn update(&self, unit: usize, progress: f64) -> f64 {
        let mut units = self.units.lock();
        if units.is_empty() {
            return 1.0;
        }
        if let Some(value) = units.get_mut(unit) {
            *value = progress.max(*value);
        }
        units.iter().sum::<f64>() / units.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (ProgressCallback, Arc<Mutex<Vec<f64>>>) {
        let values = Arc::new(Mutex::new(vec![]));
        let values_clone = values.clone();
        let callback: ProgressCallback = Arc::new(move |p| values_clone.lock().push(p));
        (callback, values)
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_never_decreases() {
        // Given
        let (callback, values) = recorder();
        let reporter = ProgressReporter::start(callback, Duration::from_secs(10));

        // When
        reporter.report_steps(2.0);
        reporter.report_step_progress(1.0, 0.5);
        reporter.report_step_progress(2.0, 0.5);
        reporter.report_steps(6.0);
        reporter.stop();

        // Then
        assert_eq!(vec![0.0, 0.4, 0.5, 1.0], *values.lock());
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_progress_is_clamped_until_done() {
        // Given
        let (callback, values) = recorder();
        let reporter = ProgressReporter::start(callback, Duration::from_secs(10));

        // When
        reporter.report_step_progress(4.0, 1.0);

        // Then
        assert!(reporter.last() < 1.0);
        reporter.report_steps(5.0);
        assert_eq!(Some(&1.0), values.lock().last());
        reporter.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_emits_last_progress() {
        // Given
        let (callback, values) = recorder();
        let reporter = ProgressReporter::start(callback, Duration::from_millis(100));
        reporter.report_steps(1.0);

        // When
        tokio::time::sleep(Duration::from_millis(250)).await;
        reporter.stop();

        // Then
        assert_eq!(vec![0.0, 0.2, 0.2, 0.2], *values.lock());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_progress_stays_ordered_with_concurrent_heartbeats() {
        // Given
        let (callback, values) = recorder();
        let reporter = Arc::new(ProgressReporter::start(callback, Duration::from_millis(1)));

        // When
        let writers = (0..4)
            .map(|writer| {
                let reporter = reporter.clone();
                tokio::task::spawn_blocking(move || {
                    for i in 0..500 {
                        reporter.report_steps((i * 4 + writer) as f64 / 400.0);
                        if i % 50 == 0 {
                            std::thread::sleep(Duration::from_millis(2));
                        }
                    }
                })
            })
            .collect::<Vec<_>>();
        for writer in writers {
            writer.await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        reporter.stop();

        // Then
        let values = values.lock();
        assert!(values.len() > 1);
        assert!(
            values.windows(2).all(|pair| pair[0] <= pair[1]),
            "progress decreased: {:?}",
            *values
        );
        assert_eq!(Some(&(1999.0 / 400.0 / NB_STEPS)), values.last());
    }

    #[tokio::test(start_paused = true)]
    async fn test_branches_are_summed() {
        // Given
        let (callback, _) = recorder();
        let reporter = ProgressReporter::start(callback, Duration::from_secs(10));
        let branches = BranchesProgress::new(&reporter, 2.0, 3);

        // When
        branches.report(0, 0.5);
        branches.complete(1);
        branches.report(2, 0.5);

        // Then
        assert!((reporter.last() - 4.0 / 5.0).abs() < 1e-9);
        reporter.stop();
    }

    #[test]
    fn test_units_progress_is_a_mean() {
        let units = UnitsProgress::new(4);
        assert_eq!(0.25, units.update(0, 1.0));
        assert_eq!(0.375, units.update(1, 0.5));
        assert_eq!(0.375, units.update(1, 0.2));
    }
}
