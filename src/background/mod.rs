//! Background tasks: work deferred until after the response is produced.
//!
//! Handlers enqueue closures on the request's [`BackgroundTasks`] handle
//! (`ctx.background()`). Once the dispatch pipeline holds the final response it
//! drains the queue into a freshly spawned Tokio task, so the response is
//! returned without waiting for any of the queued work.
//!
//! Queued tasks run one after another in enqueue order. Each runs at most once;
//! a failing or panicking task is logged and the next one still runs. The queue
//! is drained once: tasks added afterwards are logged and dropped.

use std::{
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::{BoxFuture, error::Error};

type Task = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), Error>> + Send>;

/// What a background task may return: nothing, or a `Result` whose error is logged.
pub trait TaskOutcome: Send + 'static {
    fn into_result(self) -> Result<(), Error>;
}

impl TaskOutcome for () {
    fn into_result(self) -> Result<(), Error> {
        Ok(())
    }
}

impl<E> TaskOutcome for Result<(), E>
where
    E: Into<Error> + Send + 'static,
{
    fn into_result(self) -> Result<(), Error> {
        self.map_err(Into::into)
    }
}

/// A request's queue of deferred work. Clones share the same queue.
///
/// # Examples
///
/// ```rust,no_run
/// use blaze::{Context, Error};
///
/// async fn signup(ctx: Context) -> Result<&'static str, Error> {
///     let email: String = ctx.arg("email")?;
///     ctx.background().add(move || async move {
///         tracing::info!(%email, "sending welcome mail");
///     });
///     Ok("registered")
/// }
/// ```
#[derive(Clone, Default)]
pub struct BackgroundTasks {
    queue: Arc<Mutex<Queue>>,
}

#[derive(Default)]
struct Queue {
    tasks: Vec<Task>,
    drained: bool,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues an async task.
    ///
    /// After [`spawn`](Self::spawn) has drained the queue the task is dropped
    /// with a warning instead; it never runs.
    pub fn add<F, Fut>(&self, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: TaskOutcome,
    {
        self.push(Box::new(move || Box::pin(async move { task().await.into_result() })));
    }

    /// Enqueues a blocking task, run on Tokio's blocking thread pool. Dropped
    /// like [`add`](Self::add) once the queue is drained.
    pub fn add_blocking<F, O>(&self, task: F)
    where
        F: FnOnce() -> O + Send + 'static,
        O: TaskOutcome,
    {
        self.push(Box::new(move || {
            Box::pin(async move {
                match tokio::task::spawn_blocking(task).await {
                    Ok(outcome) => outcome.into_result(),
                    Err(e) => Err(e.into()),
                }
            })
        }));
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().tasks.is_empty()
    }

    /// Drains the queue and runs its tasks on a new Tokio task.
    ///
    /// Returns `None` when nothing was queued. The returned handle completes once
    /// every task has finished. Later calls find the queue closed.
    pub fn spawn(&self) -> Option<JoinHandle<()>> {
        let tasks = {
            let mut queue = self.lock();
            queue.drained = true;
            std::mem::take(&mut queue.tasks)
        };
        if tasks.is_empty() {
            return None;
        }
        Some(tokio::spawn(run_all(tasks)))
    }

    fn push(&self, task: Task) {
        let mut queue = self.lock();
        if queue.drained {
            warn!("background task added after the queue was drained, dropping it");
            return;
        }
        queue.tasks.push(task);
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for BackgroundTasks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundTasks")
            .field("queued", &self.len())
            .finish()
    }
}

async fn run_all(tasks: Vec<Task>) {
    let total = tasks.len();
    for (index, task) in tasks.into_iter().enumerate() {
        match tokio::spawn(task()).await {
            Ok(Ok(())) => debug!(task = index, total, "background task finished"),
            Ok(Err(e)) => error!(
                task = index,
                error = %e.message(),
                type_name = e.type_name(),
                "background task failed"
            ),
            Err(e) => error!(task = index, error = %e, "background task panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn tasks_run_in_order_after_spawn() {
        let tasks = BackgroundTasks::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let log = Arc::clone(&log);
            tasks.add(move || async move { log.lock().unwrap().push(i) });
        }
        assert_eq!(tasks.len(), 3);
        assert!(log.lock().unwrap().is_empty());

        tasks.spawn().unwrap().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
        assert!(tasks.is_empty());
    }

    fn ran_before_panic() -> bool {
        true
    }

    #[tokio::test]
    async fn failures_do_not_stop_later_tasks() {
        let tasks = BackgroundTasks::new();
        let ran = Arc::new(AtomicUsize::new(0));

        tasks.add(|| async { Err::<(), _>(std::io::Error::other("smtp down")) });
        tasks.add(|| async {
            if ran_before_panic() {
                panic!("task exploded");
            }
        });
        let counter = Arc::clone(&ran);
        tasks.add_blocking(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tasks.spawn().unwrap().await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_queue_spawns_nothing() {
        assert!(BackgroundTasks::new().spawn().is_none());
    }

    #[tokio::test]
    async fn clones_share_a_queue_and_tasks_run_once() {
        let tasks = BackgroundTasks::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        tasks.clone().add(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tasks.spawn().unwrap().await.unwrap();
        assert!(tasks.spawn().is_none());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tasks_added_after_the_drain_never_run() {
        let tasks = BackgroundTasks::new();
        let ran = Arc::new(AtomicUsize::new(0));
        tasks.add(|| async {});
        tasks.spawn().unwrap().await.unwrap();

        let counter = Arc::clone(&ran);
        tasks.add(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&ran);
        tasks.add_blocking(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(tasks.is_empty());
        assert!(tasks.spawn().is_none());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
