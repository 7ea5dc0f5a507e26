use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use task_engine_core::Task;

/// Result type for task handlers; an error schedules a retry
pub type HandlerResult = anyhow::Result<()>;

/// Handlers keyed by task name, for bulk registration
pub type HandlerMap = HashMap<String, Arc<dyn TaskHandler>>;

/// Trait for task handlers
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run one attempt of the task
    async fn handle(&self, task: &Task) -> HandlerResult;
}

/// Registry of task handlers by task name. Entries are never replaced or removed.
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry {
            handlers: DashMap::new(),
        }
    }

    /// Register a handler; returns false if the name was already taken
    pub fn register(&self, name: String, handler: Arc<dyn TaskHandler>) -> bool {
        match self.handlers.entry(name) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(handler);
                true
            }
        }
    }

    /// Get a handler for a task name
    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).map(|h| h.value().clone())
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Get all registered task names
    pub fn task_names(&self) -> Vec<String> {
        self.handlers.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler built from a closure that receives its own copy of the task
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a [`TaskHandler`]
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, task: &Task) -> HandlerResult {
        (self.f)(task.clone()).await
    }
}

/// Handler that decodes the JSON payload into `T` before calling `f`.
///
/// A payload that does not decode is a handler error and goes through the
/// normal retry path.
pub struct JsonHandler<T, F> {
    f: F,
    _payload: PhantomData<fn() -> T>,
}

impl<T, F> JsonHandler<T, F> {
    pub fn new(f: F) -> Self {
        JsonHandler {
            f,
            _payload: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut> TaskHandler for JsonHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, task: &Task) -> HandlerResult {
        let payload: T = task.decode_json()?;
        (self.f)(payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_registry_first_wins() {
        let registry = HandlerRegistry::new();
        let first = Arc::new(AtomicUsize::new(0));
        let counter = first.clone();

        assert!(registry.register(
            "echo".to_string(),
            Arc::new(handler_fn(move |_task| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })),
        ));
        assert!(!registry.register(
            "echo".to_string(),
            Arc::new(handler_fn(|_task| async { anyhow::bail!("second handler") })),
        ));

        assert!(registry.has_handler("echo"));
        assert!(!registry.has_handler("unknown"));
        assert_eq!(registry.task_names(), vec!["echo".to_string()]);

        let task = Task::new("echo", b"x".to_vec()).unwrap();
        registry.get("echo").unwrap().handle(&task).await.unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 1);
    }

    #[derive(Deserialize)]
    struct Resize {
        width: u32,
    }

    #[tokio::test]
    async fn test_json_handler() {
        let seen = Arc::new(AtomicUsize::new(0));
        let sink = seen.clone();
        let handler = JsonHandler::<Resize, _>::new(move |payload: Resize| {
            let sink = sink.clone();
            async move {
                sink.store(payload.width as usize, Ordering::SeqCst);
                Ok(())
            }
        });

        let task = Task::json("resize", &serde_json::json!({ "width": 640 })).unwrap();
        handler.handle(&task).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 640);

        let bad = Task::new("resize", b"{".to_vec()).unwrap();
        assert!(handler.handle(&bad).await.is_err());
    }
}
