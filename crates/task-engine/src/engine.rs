use crate::config::{EngineOptions, ResolvedOptions};
use crate::handler::{HandlerMap, HandlerRegistry, TaskHandler};
use crate::stats::EngineStats;
use crate::worker::GroupWorker;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use task_engine_core::{Task, DEFAULT_GROUP};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// State every group worker reads: handlers and the lifecycle flags
pub(crate) struct EngineShared {
    pub(crate) handlers: HandlerRegistry,
    pub(crate) accepting: AtomicBool,
    pub(crate) closed: AtomicBool,
    pub(crate) close_signal: CancellationToken,
}

impl EngineShared {
    pub(crate) fn new() -> Self {
        EngineShared {
            handlers: HandlerRegistry::new(),
            accepting: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            close_signal: CancellationToken::new(),
        }
    }

    pub(crate) fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }
}

/// In-process task engine.
///
/// Tasks are routed by group id to that group's worker; unknown groups fall back
/// to group 1. The handle is cheap to clone and every clone drives the same
/// engine. The last handle to drop stops the engine without waiting.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    options: ResolvedOptions,
    workers: BTreeMap<u32, Arc<GroupWorker>>,
    shared: Arc<EngineShared>,
    started: AtomicBool,
}

impl Engine {
    /// Build the engine and spawn every group's execution pool.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(options: EngineOptions) -> Self {
        let options = options.resolve();
        let shared = Arc::new(EngineShared::new());

        let workers = options
            .groups
            .iter()
            .map(|(&group, &concurrency)| {
                let worker = GroupWorker::new(
                    group,
                    concurrency,
                    options.batch_size,
                    options.default_max_retry,
                    shared.clone(),
                );
                (group, worker)
            })
            .collect();

        Engine {
            inner: Arc::new(EngineInner {
                options,
                workers,
                shared,
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Options after defaults were applied
    pub fn options(&self) -> &ResolvedOptions {
        &self.inner.options
    }

    /// Register the handler for a task name. The first registration wins.
    ///
    /// # Panics
    ///
    /// Panics if `name` is empty.
    pub fn register<H: TaskHandler + 'static>(&self, name: impl Into<String>, handler: H) {
        self.register_arc(name, Arc::new(handler));
    }

    /// Same as [`Engine::register`] for a handler that is already shared
    pub fn register_arc(&self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let name = name.into();
        assert!(!name.is_empty(), "task name cannot be empty");

        if self.inner.shared.handlers.register(name.clone(), handler) {
            info!("Registered task handler: {}", name);
        } else {
            warn!(
                "Task handler for '{}' already exists, skipping registration",
                name
            );
        }
    }

    /// Submit a task. Fire-and-forget: ignored once the engine is stopping.
    pub fn enqueue(&self, task: Task) {
        if !self.inner.shared.is_accepting() {
            debug!("Engine stopped, ignoring task {}", task);
            return;
        }
        self.inner.route(task.group).enqueue(task);
    }

    /// Start every group's dequeue loop and delay consumer. Idempotent.
    pub fn start_server(&self) {
        if self.is_closed() {
            warn!("Engine already stopped, not starting");
            return;
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Starting task engine with {} worker groups", self.inner.workers.len());
        for worker in self.inner.workers.values() {
            worker.start();
        }
    }

    /// Register every handler in `handlers`, then start the engine
    pub fn start_with_handlers(&self, handlers: HandlerMap) {
        for (name, handler) in handlers {
            self.register_arc(name, handler);
        }
        self.start_server();
    }

    /// Stop accepting tasks and signal every loop to exit. Idempotent.
    ///
    /// Tasks still waiting in a ready or delay queue are abandoned.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Wait until in-flight handlers finish and the worker loops exit.
    ///
    /// Without a prior [`Engine::stop`] this keeps waiting for the loops, which
    /// only exit on stop.
    pub async fn wait(&self) {
        for worker in self.inner.workers.values() {
            worker.wait().await;
        }
    }

    /// Stop, then wait for the drain
    pub async fn stop_and_wait(&self) {
        self.stop();
        self.wait().await;
        info!("Task engine stopped");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shared.closed.load(Ordering::SeqCst)
    }

    /// Advisory snapshot of queue sizes; not meant for flow control
    pub fn stats(&self) -> EngineStats {
        let groups: BTreeMap<_, _> = self
            .inner
            .workers
            .iter()
            .map(|(&group, worker)| (group, worker.stats()))
            .collect();

        EngineStats {
            total_queue_size: groups.values().map(|g| g.queue_size).sum(),
            groups,
            is_closed: self.is_closed(),
        }
    }
}

impl EngineInner {
    fn route(&self, group: u32) -> &Arc<GroupWorker> {
        match self.workers.get(&group) {
            Some(worker) => worker,
            None => &self.workers[&DEFAULT_GROUP],
        }
    }

    fn stop(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        shared.accepting.store(false, Ordering::SeqCst);
        shared.close_signal.cancel();

        for worker in self.workers.values() {
            worker.close();
        }
        info!("Task engine stopping");
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.stop();
    }
}
