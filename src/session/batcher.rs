//! Inbound message batching
//!
//! The worker enqueues every received message; a ticker task drains the
//! buffer at a fixed interval and hands the whole batch to the session in
//! one delivery. The buffer is the only state shared between the worker
//! and the tick side, so it sits behind its own lock.

use super::message::Message;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

/// Shared, unbounded, order-preserving inbound buffer
#[derive(Debug, Clone, Default)]
pub struct MessageBatcher {
    buffer: Arc<Mutex<Vec<Message>>>,
}

impl MessageBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn buffer(&self) -> MutexGuard<'_, Vec<Message>> {
        // A panic while holding the lock cannot leave a Vec half-written
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a message. Never blocks on the consumer and never fails.
    pub fn enqueue(&self, message: Message) {
        self.buffer().push(message);
    }

    /// Take everything buffered so far, or `None` if nothing arrived
    pub fn take_batch(&self) -> Option<Vec<Message>> {
        let mut buffer = self.buffer();
        if buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut *buffer))
        }
    }

    pub fn pending(&self) -> usize {
        self.buffer().len()
    }

    /// Spawn the tick task
    ///
    /// Every `period` the buffer is drained and passed to `flush`; empty ticks
    /// are skipped. The task stops when `flush` returns false or when
    /// `shutdown` flips to true, flushing whatever is still buffered first.
    pub fn spawn_ticker<F>(
        &self,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
        mut flush: F,
    ) -> JoinHandle<()>
    where
        F: FnMut(Vec<Message>) -> bool + Send + 'static,
    {
        let batcher = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of an interval completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Some(batch) = batcher.take_batch() {
                            trace!(count = batch.len(), "Flushing message batch");
                            if !flush(batch) {
                                debug!("Batch consumer gone, stopping ticker");
                                break;
                            }
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            if let Some(batch) = batcher.take_batch() {
                                let _ = flush(batch);
                            }
                            debug!("Batch ticker stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}
