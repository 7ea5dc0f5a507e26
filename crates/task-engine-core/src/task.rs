use crate::{Result, TaskError, DEFAULT_GROUP};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a task
pub type TaskId = String;

/// Maps the retry count of the next attempt to the delay before it runs
pub type RetryDelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Linear backoff: the n-th retry waits n seconds.
pub fn default_retry_delay(retried: u32) -> Duration {
    Duration::from_secs(u64::from(retried))
}

/// A named unit of work with its scheduling and retry metadata
#[derive(Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier (kept across retries)
    pub id: TaskId,

    /// Task name, used to look up the handler (e.g., "send_email")
    pub name: String,

    /// Opaque payload
    pub data: Vec<u8>,

    /// Number of retries already performed for this lineage
    pub retried: u32,

    /// Worker group the task is routed to
    pub group: u32,

    /// When the task was created
    pub created_at: DateTime<Utc>,

    /// Per-task retry bound; `None` inherits the engine default
    pub max_retry: Option<u32>,

    /// Backoff curve; `None` uses [`default_retry_delay`]
    #[serde(skip)]
    pub retry_delay: Option<RetryDelayFn>,

    /// Earliest time the task may run; `None` means "now" at enqueue time
    pub run_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a task for immediate execution in the default group
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Result<Self> {
        Task::builder(name, data).build()
    }

    /// Create a task whose payload is the JSON encoding of `payload`
    pub fn json<T: Serialize + ?Sized>(name: impl Into<String>, payload: &T) -> Result<Self> {
        TaskBuilder::json(name, payload)?.build()
    }

    /// Create a new task builder
    pub fn builder(name: impl Into<String>, data: impl Into<Vec<u8>>) -> TaskBuilder {
        TaskBuilder::new(name, data)
    }

    /// Decode the payload as JSON
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.data).map_err(TaskError::from)
    }

    /// Check if the task may run at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.run_at.map_or(true, |at| at <= now)
    }

    /// Check if the task was created more than `timeout` ago
    pub fn is_expired(&self, timeout: Duration) -> bool {
        match (Utc::now() - self.created_at).to_std() {
            Ok(age) => age > timeout,
            Err(_) => false,
        }
    }

    /// Resolve the retry bound against the engine default
    pub fn effective_max_retry(&self, default_max_retry: u32) -> u32 {
        self.max_retry.unwrap_or(default_max_retry)
    }

    /// Delay before the attempt carrying retry count `retried`
    pub fn retry_delay_for(&self, retried: u32) -> Duration {
        match &self.retry_delay {
            Some(delay) => delay(retried),
            None => default_retry_delay(retried),
        }
    }

    /// Build the next attempt of this task.
    ///
    /// The copy owns a fresh payload buffer, carries `retried + 1` and is
    /// scheduled at `now + backoff(retried + 1)`.
    pub fn next_attempt(&self, now: DateTime<Utc>) -> Task {
        let retried = self.retried.saturating_add(1);
        let delay = chrono::Duration::from_std(self.retry_delay_for(retried))
            .unwrap_or(chrono::Duration::MAX);
        let run_at = now
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Task {
            id: self.id.clone(),
            name: self.name.clone(),
            data: self.data.to_vec(),
            retried,
            group: self.group,
            created_at: self.created_at,
            max_retry: self.max_retry,
            retry_delay: self.retry_delay.clone(),
            run_at: Some(run_at),
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Task{{id: {}, name: {}, group: {}, retried: {}}}",
            self.id, self.name, self.group, self.retried
        )
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("data_len", &self.data.len())
            .field("retried", &self.retried)
            .field("group", &self.group)
            .field("created_at", &self.created_at)
            .field("max_retry", &self.max_retry)
            .field("custom_retry_delay", &self.retry_delay.is_some())
            .field("run_at", &self.run_at)
            .finish()
    }
}

/// Builder for creating tasks with custom configuration
pub struct TaskBuilder {
    id: Option<TaskId>,
    name: String,
    data: Vec<u8>,
    group: u32,
    max_retry: Option<u32>,
    retry_delay: Option<RetryDelayFn>,
    run_at: Option<DateTime<Utc>>,
}

impl TaskBuilder {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        TaskBuilder {
            id: None,
            name: name.into(),
            data: data.into(),
            group: DEFAULT_GROUP,
            max_retry: None,
            retry_delay: None,
            run_at: None,
        }
    }

    pub fn json<T: Serialize + ?Sized>(name: impl Into<String>, payload: &T) -> Result<Self> {
        let data = serde_json::to_vec(payload)?;
        Ok(TaskBuilder::new(name, data))
    }

    /// Override the generated identifier; an empty id is ignored
    pub fn id(mut self, id: impl Into<TaskId>) -> Self {
        let id = id.into();
        if !id.is_empty() {
            self.id = Some(id);
        }
        self
    }

    pub fn group(mut self, group: u32) -> Self {
        self.group = group;
        self
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = Some(max_retry);
        self
    }

    pub fn inherit_max_retry(mut self) -> Self {
        self.max_retry = None;
        self
    }

    pub fn retry_delay<F>(mut self, delay: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.retry_delay = Some(Arc::new(delay));
        self
    }

    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn build(self) -> Result<Task> {
        if self.name.is_empty() {
            return Err(TaskError::EmptyName);
        }

        let now = Utc::now();
        Ok(Task {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: self.name,
            data: self.data,
            retried: 0,
            group: self.group,
            created_at: now,
            max_retry: self.max_retry,
            retry_delay: self.retry_delay,
            run_at: Some(self.run_at.unwrap_or(now)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_task_creation() {
        let task = Task::new("send_email", b"hello".to_vec()).unwrap();

        assert_eq!(task.name, "send_email");
        assert_eq!(task.data, b"hello");
        assert_eq!(task.retried, 0);
        assert_eq!(task.group, DEFAULT_GROUP);
        assert_eq!(task.max_retry, None);
        assert_eq!(task.run_at, Some(task.created_at));
        assert!(!task.id.is_empty());
    }

    #[test]
    fn test_empty_name_rejected() {
        match Task::new("", Vec::new()) {
            Err(TaskError::EmptyName) => {}
            other => panic!("Expected EmptyName error, got {:?}", other),
        }
    }

    #[test]
    fn test_task_builder() {
        let run_at = Utc::now() + chrono::Duration::hours(1);
        let task = Task::builder("report", "data")
            .id("report-42")
            .group(3)
            .max_retry(5)
            .run_at(run_at)
            .build()
            .unwrap();

        assert_eq!(task.id, "report-42");
        assert_eq!(task.group, 3);
        assert_eq!(task.max_retry, Some(5));
        assert_eq!(task.run_at, Some(run_at));
        assert!(!task.is_due(Utc::now()));
    }

    #[test]
    fn test_empty_id_keeps_generated() {
        let task = Task::builder("t", Vec::new()).id("").build().unwrap();
        assert!(!task.id.is_empty());
    }

    #[test]
    fn test_json_payload() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Email {
            to: String,
        }

        let task = Task::json("email", &Email { to: "a@b.c".into() }).unwrap();
        let decoded: Email = task.decode_json().unwrap();
        assert_eq!(decoded, Email { to: "a@b.c".into() });

        let broken = Task::new("email", b"not json".to_vec()).unwrap();
        assert!(matches!(
            broken.decode_json::<Email>(),
            Err(TaskError::Serialization(_))
        ));
    }

    #[test]
    fn test_default_retry_delay_is_linear() {
        assert_eq!(default_retry_delay(0), Duration::ZERO);
        assert_eq!(default_retry_delay(1), Duration::from_secs(1));
        assert_eq!(default_retry_delay(3), Duration::from_secs(3));
    }

    #[test]
    fn test_effective_max_retry() {
        let inherit = Task::new("t", Vec::new()).unwrap();
        assert_eq!(inherit.effective_max_retry(4), 4);

        let explicit = Task::builder("t", Vec::new()).max_retry(0).build().unwrap();
        assert_eq!(explicit.effective_max_retry(4), 0);
    }

    #[test]
    fn test_next_attempt_is_independent_copy() {
        let task = Task::builder("t", b"abc".to_vec())
            .retry_delay(|n| Duration::from_millis(100 * u64::from(n)))
            .build()
            .unwrap();

        let now = Utc::now();
        let mut next = task.next_attempt(now);
        next.data[0] = b'z';

        assert_eq!(task.data, b"abc");
        assert_eq!(next.id, task.id);
        assert_eq!(next.retried, 1);
        assert_eq!(next.run_at, Some(now + chrono::Duration::milliseconds(100)));
        assert_ne!(task.data.as_ptr(), next.data.as_ptr());
    }

    #[test]
    fn test_is_expired() {
        let mut task = Task::new("t", Vec::new()).unwrap();
        assert!(!task.is_expired(Duration::from_secs(60)));

        task.created_at = Utc::now() - chrono::Duration::seconds(120);
        assert!(task.is_expired(Duration::from_secs(60)));
    }

    #[test]
    fn test_task_serialization_skips_backoff() {
        let task = Task::builder("t", b"x".to_vec())
            .retry_delay(|_| Duration::from_secs(9))
            .build()
            .unwrap();

        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();

        assert_eq!(back.id, task.id);
        assert_eq!(back.data, task.data);
        assert!(back.retry_delay.is_none());
        assert_eq!(back.retry_delay_for(2), Duration::from_secs(2));
    }

    proptest! {
        #[test]
        fn prop_retry_lineage_is_monotonic(steps in 1usize..20, step_ms in 0u64..5_000) {
            let mut task = Task::builder("t", vec![1, 2, 3])
                .retry_delay(move |n| Duration::from_millis(step_ms * u64::from(n)))
                .build()
                .unwrap();

            for _ in 0..steps {
                let now = Utc::now();
                let next = task.next_attempt(now);
                prop_assert_eq!(next.retried, task.retried + 1);
                let min_run_at = now + chrono::Duration::milliseconds((step_ms * u64::from(next.retried)) as i64);
                prop_assert!(next.run_at.unwrap() >= min_run_at);
                prop_assert_eq!(&next.data, &task.data);
                task = next;
            }
        }
    }
}
