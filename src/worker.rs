use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use failure::format_err;
use futures::future::try_join_all;
use itertools::Itertools;
use log::debug;
use tokio::sync::{watch, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};

use crate::errors::*;

/// Flag shared between the requester of a cancellation and the tasks which observe it
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst)
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a running task sees of the queue: where to send progress and whether it should stop
pub struct TaskContext {
    name: String,
    progress: watch::Sender<f64>,
    cancel: CancellationToken,
}

impl TaskContext {
    /// Context of a task executed outside of any queue
    pub fn detached(name: &str, cancel: CancellationToken) -> Self {
        let (progress, _) = watch::channel(0.0);
        Self {
            name: name.to_string(),
            progress,
            cancel,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn report_progress(&self, progress: f64) {
        let _ = self.progress.send(progress.max(0.0).min(1.0));
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }

    /// Fails with a cancellation error once cancellation was requested
    pub fn check_canceled(&self) -> Result<()> {
        if self.cancel.is_canceled() {
            return Err(NluEngineError::TrainingCanceled(self.name.clone()).into());
        }
        Ok(())
    }
}

pub struct TaskHandle<T> {
    progress: watch::Receiver<f64>,
    cancel: CancellationToken,
    join: JoinHandle<Result<T>>,
}

impl<T> TaskHandle<T> {
    pub fn progress(&self) -> watch::Receiver<f64> {
        self.progress.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel()
    }

    /// Handle which drops the task without waiting for it, unlike `cancel` which is seen by
    /// every task sharing the token
    pub fn abort_handle(&self) -> AbortHandle {
        self.join.abort_handle()
    }

    pub async fn join(self) -> Result<T> {
        self.join
            .await
            .map_err(|e| format_err!("Worker task failed: {}", e))?
    }

    /// Waits for the task while forwarding every progress update it sends
    pub async fn join_with_progress<F: Fn(f64)>(mut self, on_progress: F) -> Result<T> {
        loop {
            tokio::select! {
                result = &mut self.join => {
                    return result.map_err(|e| format_err!("Worker task failed: {}", e))?;
                }
                changed = self.progress.changed() => {
                    if changed.is_err() {
                        return self
                            .join
                            .await
                            .map_err(|e| format_err!("Worker task failed: {}", e))?;
                    }
                    let progress = *self.progress.borrow();
                    on_progress(progress);
                }
            }
        }
    }
}

/// Runs blocking numeric work on a bounded number of threads. Tasks only talk to the
/// outside world through their progress channel and cancellation token.
#[derive(Clone)]
pub struct TaskQueue {
    permits: Arc<Semaphore>,
}

impl TaskQueue {
    pub fn new(max_concurrent_tasks: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent_tasks.max(1))),
        }
    }

    pub fn submit<T, F>(&self, name: &str, cancel: CancellationToken, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&TaskContext) -> Result<T> + Send + 'static,
    {
        let (progress_sender, progress_receiver) = watch::channel(0.0);
        let context = TaskContext {
            name: name.to_string(),
            progress: progress_sender,
            cancel: cancel.clone(),
        };
        let join = tokio::spawn(run_task(self.permits.clone(), context, task));
        TaskHandle {
            progress: progress_receiver,
            cancel,
            join,
        }
    }
}

/// Waits for all the tasks concurrently, calling `on_joined` with the number of tasks done so
/// far. The first failure is returned right away and the tasks still pending are aborted.
pub async fn join_all<T, F>(handles: Vec<TaskHandle<T>>, on_joined: F) -> Result<Vec<T>>
where
    F: Fn(usize),
{
    let abort_handles = handles.iter().map(|h| h.abort_handle()).collect_vec();
    let joined = AtomicUsize::new(0);
    let result = try_join_all(handles.into_iter().map(|handle| {
        let joined = &joined;
        let on_joined = &on_joined;
        async move {
            let output = handle.join().await?;
            on_joined(joined.fetch_add(1, Ordering::SeqCst) + 1);
            Ok::<_, ::failure::Error>(output)
        }
    }))
    .await;
    if result.is_err() {
        abort_handles.iter().for_each(|h| h.abort());
    }
    result
}

async fn run_task<T, F>(permits: Arc<Semaphore>, context: TaskContext, task: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&TaskContext) -> Result<T> + Send + 'static,
{
    let _permit = permits
        .acquire_owned()
        .await
        .map_err(|e| format_err!("Task queue closed: {}", e))?;
    context.check_canceled()?;
    debug!("Running task {}", context.name());
    tokio::task::spawn_blocking(move || task(&context)).await?
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use crate::errors::is_training_canceled;

    #[tokio::test]
    async fn test_task_result_and_progress_are_forwarded() {
        // Given
        let queue = TaskQueue::new(2);
        let reported = Arc::new(Mutex::new(vec![]));

        // When
        let handle = queue.submit("sum", CancellationToken::new(), |ctx| {
            ctx.report_progress(0.5);
            ctx.report_progress(1.0);
            Ok(40 + 2)
        });
        let reported_clone = reported.clone();
        let result = handle
            .join_with_progress(move |p| reported_clone.lock().unwrap().push(p))
            .await
            .unwrap();

        // Then
        assert_eq!(42, result);
        let reported = reported.lock().unwrap();
        assert!(reported.iter().all(|p| *p >= 0.0 && *p <= 1.0));
    }

    #[tokio::test]
    async fn test_canceled_task_fails_with_cancellation() {
        // Given
        let queue = TaskQueue::new(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        // When
        let result = queue
            .submit("never", cancel, |_| Ok(()))
            .join()
            .await;

        // Then
        assert!(is_training_canceled(&result.unwrap_err()));
    }

    #[tokio::test]
    async fn test_join_all_keeps_submission_order() {
        // Given
        let queue = TaskQueue::new(2);
        let handles = (0..5)
            .map(|i| queue.submit("chunk", CancellationToken::new(), move |_| Ok(i * 10)))
            .collect_vec();
        let joined = Arc::new(Mutex::new(vec![]));
        let joined_clone = joined.clone();

        // When
        let results = join_all(handles, move |done| joined_clone.lock().unwrap().push(done))
            .await
            .unwrap();

        // Then
        assert_eq!(vec![0, 10, 20, 30, 40], results);
        assert_eq!(vec![1, 2, 3, 4, 5], *joined.lock().unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_join_all_fails_without_waiting_for_slower_tasks() {
        // Given
        let queue = TaskQueue::new(3);
        let slow = queue.submit("slow", CancellationToken::new(), |_| {
            std::thread::sleep(std::time::Duration::from_millis(1000));
            Ok(1)
        });
        let failing = queue.submit("failing", CancellationToken::new(), |_| -> Result<i32> {
            Err(format_err!("chunk failed"))
        });
        let started = std::time::Instant::now();

        // When
        let result = join_all(vec![slow, failing], |_| {}).await;

        // Then
        assert_eq!("chunk failed", result.unwrap_err().to_string());
        assert!(started.elapsed() < std::time::Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_task_observes_cancellation_between_iterations() {
        // Given
        let queue = TaskQueue::new(1);
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        // When
        let result: Result<usize> = queue
            .submit("loop", cancel, move |ctx| {
                for i in 0..1000 {
                    if i == 10 {
                        cancel_clone.cancel();
                    }
                    ctx.check_canceled()?;
                }
                Ok(1000)
            })
            .join()
            .await;

        // Then
        assert!(is_training_canceled(&result.unwrap_err()));
    }
}
