pub mod config;
pub mod delay_queue;
pub mod engine;
pub mod handler;
pub mod heap;
pub mod stats;
mod worker;

pub use config::{EngineOptions, ResolvedOptions};
pub use delay_queue::DelayQueue;
pub use engine::Engine;
pub use handler::{handler_fn, HandlerMap, HandlerRegistry, HandlerResult, JsonHandler, TaskHandler};
pub use heap::{Item, MinHeap};
pub use stats::{EngineStats, GroupStats};

pub use task_engine_core::{Task, TaskBuilder, TaskError, DEFAULT_GROUP};
