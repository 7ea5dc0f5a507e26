use crate::config::MAX_JOB_BUFFER;
use crate::delay_queue::DelayQueue;
use crate::engine::EngineShared;
use crate::handler::TaskHandler;
use crate::heap::Item;
use crate::stats::GroupStats;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::backtrace::Backtrace;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use task_engine_core::Task;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A unit of work for the execution pool
type Job = BoxFuture<'static, ()>;

/// Counts jobs handed to the pool so shutdown can wait for them
struct InFlight {
    count: Mutex<usize>,
    drained: Notify,
}

struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl InFlight {
    fn new() -> Self {
        InFlight {
            count: Mutex::new(0),
            drained: Notify::new(),
        }
    }

    /// Register one more job unless the engine is closing.
    ///
    /// The closed flag is read under the counter lock, so once `wait` has seen
    /// zero after a stop no new job can be counted.
    fn acquire(self: &Arc<Self>, closed: &AtomicBool) -> Option<InFlightGuard> {
        let mut count = self.count.lock();
        if closed.load(Ordering::SeqCst) {
            return None;
        }
        *count += 1;
        Some(InFlightGuard {
            in_flight: self.clone(),
        })
    }

    fn current(&self) -> usize {
        *self.count.lock()
    }

    async fn drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.current() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut count = self.in_flight.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.in_flight.drained.notify_waiters();
        }
    }
}

/// One weighted group: a ready FIFO, a delay queue and a fixed execution pool
pub(crate) struct GroupWorker {
    group: u32,
    concurrency: usize,
    batch_size: usize,
    default_max_retry: u32,

    ready: Mutex<VecDeque<Task>>,
    ready_signal: Notify,
    delayed: DelayQueue<Task>,

    jobs: Mutex<Option<mpsc::Sender<Job>>>,
    in_flight: Arc<InFlight>,

    loops: Mutex<Vec<JoinHandle<()>>>,
    pool: Mutex<Vec<JoinHandle<()>>>,

    shared: Arc<EngineShared>,
}

impl GroupWorker {
    /// Create the worker and spawn its execution pool
    pub(crate) fn new(
        group: u32,
        concurrency: usize,
        batch_size: usize,
        default_max_retry: u32,
        shared: Arc<EngineShared>,
    ) -> Arc<Self> {
        let concurrency = concurrency.max(1);
        let (tx, rx) = mpsc::channel::<Job>(concurrency.min(MAX_JOB_BUFFER));
        let rx = Arc::new(AsyncMutex::new(rx));

        let pool = (0..concurrency)
            .map(|_| tokio::spawn(pool_slot(group, rx.clone())))
            .collect();

        Arc::new(GroupWorker {
            group,
            concurrency,
            batch_size: batch_size.max(1),
            default_max_retry,
            ready: Mutex::new(VecDeque::new()),
            ready_signal: Notify::new(),
            delayed: DelayQueue::new(),
            jobs: Mutex::new(Some(tx)),
            in_flight: Arc::new(InFlight::new()),
            loops: Mutex::new(Vec::new()),
            pool: Mutex::new(pool),
            shared,
        })
    }

    /// Spawn the dequeue loop and the delay consumer
    pub(crate) fn start(self: &Arc<Self>) {
        let mut loops = self.loops.lock();
        loops.push(tokio::spawn(self.clone().dequeue_loop()));

        match self.delayed.pop_chan() {
            Some(due) => loops.push(tokio::spawn(self.clone().delay_consumer(due))),
            None => warn!("Delay consumer for group {} already running", self.group),
        }

        info!(
            "Worker for group {} started (concurrency: {}, batch size: {})",
            self.group, self.concurrency, self.batch_size
        );
    }

    /// Route a task to the delay queue or the ready FIFO
    pub(crate) fn enqueue(&self, mut task: Task) {
        if !self.shared.is_accepting() {
            debug!("Engine is not accepting tasks, dropping {}", task);
            return;
        }

        let now = Utc::now();
        let run_at = *task.run_at.get_or_insert(now);
        if run_at > now {
            self.delayed.push(task, run_at);
            return;
        }

        let mut ready = self.ready.lock();
        ready.push_back(task);
        self.ready_signal.notify_one();
    }

    async fn dequeue_loop(self: Arc<Self>) {
        let close = self.shared.close_signal.clone();

        loop {
            if close.is_cancelled() {
                break;
            }

            let batch = tokio::select! {
                _ = close.cancelled() => break,
                batch = self.next_batch() => batch,
            };

            for task in batch {
                self.dispatch(task).await;
            }
        }

        debug!("Dequeue loop for group {} exited", self.group);
    }

    /// Wait until the ready FIFO is non-empty, then drain up to `batch_size` tasks
    async fn next_batch(&self) -> Vec<Task> {
        loop {
            let notified = self.ready_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut ready = self.ready.lock();
                if !ready.is_empty() {
                    let n = ready.len().min(self.batch_size);
                    return ready.drain(..n).collect();
                }
            }

            notified.await;
        }
    }

    async fn delay_consumer(self: Arc<Self>, mut due: mpsc::Receiver<Item<Task>>) {
        let close = self.shared.close_signal.clone();

        loop {
            let item = tokio::select! {
                _ = close.cancelled() => break,
                item = due.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            if item.due_at > Utc::now() {
                self.enqueue(item.value);
                continue;
            }
            self.dispatch(item.value).await;
        }

        debug!("Delay consumer for group {} exited", self.group);
    }

    /// Hand a task to the execution pool
    async fn dispatch(self: &Arc<Self>, task: Task) {
        if self.shared.close_signal.is_cancelled() {
            return;
        }

        // Unknown task names are dropped without a log line
        let Some(handler) = self.shared.handlers.get(&task.name) else {
            return;
        };

        let Some(guard) = self.in_flight.acquire(&self.shared.closed) else {
            return;
        };

        let Some(jobs) = self.jobs.lock().clone() else {
            return;
        };

        let task_id = task.id.clone();
        let worker = self.clone();
        let job: Job = Box::pin(async move {
            let _guard = guard;
            worker.execute(task, handler).await;
        });

        tokio::select! {
            sent = jobs.send(job) => {
                if sent.is_err() {
                    warn!("Execution pool for group {} is gone, dropping task {}", self.group, task_id);
                }
            }
            _ = self.shared.close_signal.cancelled() => {
                debug!("Engine closed while task {} waited for a pool slot", task_id);
            }
        }
    }

    /// Run one attempt; panics are logged and never retried
    async fn execute(&self, task: Task, handler: Arc<dyn TaskHandler>) {
        let outcome = AssertUnwindSafe(handler.handle(&task)).catch_unwind().await;

        match outcome {
            Ok(Ok(())) => debug!("Task {} completed", task),
            Ok(Err(err)) => self.retry_or_drop(task, err),
            Err(panic) => error!("{}", panic_report(&task, &*panic)),
        }
    }

    fn retry_or_drop(&self, task: Task, err: anyhow::Error) {
        let max_retry = task.effective_max_retry(self.default_max_retry);
        if task.retried >= max_retry {
            error!(
                "Task {} retried {} times (max retry {}) but still failed: {:#}; data: {}",
                task,
                task.retried,
                max_retry,
                err,
                String::from_utf8_lossy(&task.data)
            );
            return;
        }

        let next = task.next_attempt(Utc::now());
        warn!(
            "Task {} failed: {:#}; retry {}/{} scheduled",
            task, err, next.retried, max_retry
        );
        self.enqueue(next);
    }

    /// Stop delayed delivery and wake the dequeue loop
    pub(crate) fn close(&self) {
        self.delayed.close();
        self.ready_signal.notify_waiters();
    }

    /// Wait for in-flight jobs and the worker loops; retire the pool once closed
    pub(crate) async fn wait(&self) {
        self.in_flight.drained().await;

        let loops: Vec<_> = self.loops.lock().drain(..).collect();
        for handle in loops {
            if let Err(e) = handle.await {
                error!("Worker loop for group {} failed: {}", self.group, e);
            }
        }

        if self.shared.closed.load(Ordering::SeqCst) {
            self.retire_pool().await;
        }
    }

    async fn retire_pool(&self) {
        // Dropping the last sender ends every pool slot once the buffer is empty
        self.jobs.lock().take();

        let pool: Vec<_> = self.pool.lock().drain(..).collect();
        for handle in pool {
            if let Err(e) = handle.await {
                error!("Pool slot for group {} failed: {}", self.group, e);
            }
        }
    }

    pub(crate) fn stats(&self) -> GroupStats {
        let jobs_buffered = self
            .jobs
            .lock()
            .as_ref()
            .map_or(0, |tx| tx.max_capacity() - tx.capacity());

        GroupStats {
            concurrency: self.concurrency,
            queue_size: self.ready.lock().len(),
            jobs_buffered,
            delayed_size: self.delayed.len(),
            in_flight: self.in_flight.current(),
        }
    }
}

/// One execution slot: takes jobs off the shared channel until it closes
async fn pool_slot(group: u32, jobs: Arc<AsyncMutex<mpsc::Receiver<Job>>>) {
    loop {
        let job = {
            let mut rx = jobs.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            break;
        };

        if let Err(panic) = AssertUnwindSafe(job).catch_unwind().await {
            error!(
                "Pool slot for group {} recovered from panic: {}",
                group,
                panic_message(&*panic)
            );
        }
    }
}

/// Log text for a handler panic. The backtrace is taken after unwinding, so it
/// shows where the panic was caught, not where it was raised.
fn panic_report(task: &Task, panic: &(dyn Any + Send)) -> String {
    format!(
        "Task {} panicked: {}\nrecovered at:\n{}",
        task,
        panic_message(panic),
        Backtrace::force_capture()
    )
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
