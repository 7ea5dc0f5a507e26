//! Delayed delivery backed by a min-heap and a single timer.
//!
//! Every queue runs one control task that owns the timer. Producers push into
//! the heap under a short lock and nudge the control task when the earliest
//! due time moves forward. Due items come out of a bounded channel in due-time
//! order; a slow consumer stalls the control task instead of losing items.

use crate::heap::{Item, MinHeap};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Output buffer used by [`DelayQueue::new`]
pub const DEFAULT_CAPACITY: usize = 128;

struct State<T> {
    heap: MinHeap<T>,
    closed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    wake: Notify,
    stop: CancellationToken,
}

/// Heap-backed delay queue with a single timer
pub struct DelayQueue<T> {
    shared: Arc<Shared<T>>,
    output: Mutex<Option<mpsc::Receiver<Item<T>>>>,
}

impl<T: Send + 'static> DelayQueue<T> {
    /// Create a queue and start its control task. Must be called within a tokio runtime.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                heap: MinHeap::new(),
                closed: false,
            }),
            wake: Notify::new(),
            stop: CancellationToken::new(),
        });

        let control = ControlLoop {
            shared: shared.clone(),
            tx,
        };
        tokio::spawn(control.run());

        DelayQueue {
            shared,
            output: Mutex::new(Some(rx)),
        }
    }
}

impl<T> DelayQueue<T> {
    /// Schedule `value` for delivery at `at`. No-op once the queue is closed.
    pub fn push(&self, value: T, at: DateTime<Utc>) {
        let need_wake = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            let need_wake = match state.heap.next_due() {
                None => true,
                Some(earliest) => at < earliest,
            };
            state.heap.push(Item { due_at: at, value });
            need_wake
        };

        if need_wake {
            // Stores a single permit when the loop is busy, so repeated wakes coalesce
            self.shared.wake.notify_one();
        }
    }

    /// Take the receiving end of the output channel.
    ///
    /// There is exactly one consumer; every call after the first returns `None`.
    /// The channel closes once the queue is closed and the control task exits.
    pub fn pop_chan(&self) -> Option<mpsc::Receiver<Item<T>>> {
        self.output.lock().take()
    }

    /// Number of items still waiting in the heap
    pub fn len(&self) -> usize {
        self.shared.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Stop the control task. Pending items are abandoned. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.shared.stop.cancel();
    }
}

impl<T: Send + 'static> Default for DelayQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for DelayQueue<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// The only owner of the timer and of the sending half of the output channel
struct ControlLoop<T> {
    shared: Arc<Shared<T>>,
    tx: mpsc::Sender<Item<T>>,
}

impl<T> ControlLoop<T> {
    async fn run(self) {
        let timer = sleep(Duration::ZERO);
        tokio::pin!(timer);

        loop {
            let (closed, next_due) = {
                let state = self.shared.state.lock();
                (state.closed, state.heap.next_due())
            };
            if closed {
                break;
            }

            let armed = match next_due {
                Some(due_at) => match (due_at - Utc::now()).to_std() {
                    Ok(wait) if !wait.is_zero() => {
                        // Resetting the deadline replaces whatever was armed before
                        timer.as_mut().reset(Instant::now() + wait);
                        true
                    }
                    _ => {
                        if !self.deliver_due().await {
                            break;
                        }
                        continue;
                    }
                },
                None => false,
            };

            tokio::select! {
                _ = self.shared.stop.cancelled() => continue,
                _ = self.shared.wake.notified() => continue,
                _ = &mut timer, if armed => {
                    if !self.deliver_due().await {
                        break;
                    }
                }
            }
        }

        debug!("Delay queue control loop exited");
        // Dropping `self.tx` here closes the output channel
    }

    /// Pop and send every item that is due. Returns false once the consumer is gone.
    async fn deliver_due(&self) -> bool {
        loop {
            let item = {
                let mut state = self.shared.state.lock();
                if state.closed {
                    return true;
                }
                match state.heap.pop_due(Utc::now()) {
                    Some(item) => item,
                    None => return true,
                }
            };

            tokio::select! {
                sent = self.tx.send(item) => {
                    if sent.is_err() {
                        self.shared.state.lock().closed = true;
                        return false;
                    }
                }
                _ = self.shared.stop.cancelled() => return true,
            }
        }
    }
}
