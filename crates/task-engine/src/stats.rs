use serde::Serialize;
use std::collections::BTreeMap;

/// Snapshot of one worker group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GroupStats {
    /// Execution pool size
    pub concurrency: usize,
    /// Tasks waiting in the ready FIFO
    pub queue_size: usize,
    /// Jobs sitting in the pool channel buffer
    pub jobs_buffered: usize,
    /// Tasks waiting for their due time
    pub delayed_size: usize,
    /// Jobs handed to the pool and not finished yet
    pub in_flight: usize,
}

/// Advisory snapshot of the whole engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub total_queue_size: usize,
    pub groups: BTreeMap<u32, GroupStats>,
    pub is_closed: bool,
}
