use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::buffer::SharedBuffer;

/// Terminal error stored in a receiver when its flow shuts down.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    /// The owning session was cancelled.
    #[error("flow interrupted")]
    Interrupted,
    /// The producer hit the end of its input.
    #[error("end of stream")]
    EndOfStream,
    /// The producer failed.
    #[error("source failed: {0}")]
    Source(String),
}

type Hook = Box<dyn Fn() + Send + Sync>;

struct Hooks {
    on_start: Hook,
    on_stop: Hook,
}

struct Slot {
    id: u64,
    tx: mpsc::Sender<SharedBuffer>,
    error: Arc<Mutex<Option<FlowError>>>,
    misses: Arc<AtomicU64>,
}

struct Shared {
    receivers: Mutex<Vec<Slot>>,
    hooks: OnceLock<Hooks>,
    next_id: AtomicU64,
}

/// Single-writer, multi-reader broadcaster of [`SharedBuffer`] references.
///
/// `put` takes one hold per live receiver and delivers without blocking; a
/// receiver whose queue is full loses the incoming buffer (drop-newest) and
/// the miss is counted against that receiver only. The `Start` hook fires on
/// the 0-to-1 receiver transition, the `Stop` hook on 1-to-0.
#[derive(Clone)]
pub struct Flow {
    shared: Arc<Shared>,
}

/// One subscriber's end of a [`Flow`]: a bounded FIFO of buffers plus a
/// terminal error slot populated when the flow shuts down.
pub struct FlowReceiver {
    id: u64,
    rx: mpsc::Receiver<SharedBuffer>,
    error: Arc<Mutex<Option<FlowError>>>,
}

impl Flow {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                receivers: Mutex::new(Vec::new()),
                hooks: OnceLock::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Bind the producer lifecycle hooks. May be called once, before the
    /// first receiver is added.
    pub fn set_hooks(
        &self,
        on_start: impl Fn() + Send + Sync + 'static,
        on_stop: impl Fn() + Send + Sync + 'static,
    ) {
        let _ = self.shared.hooks.set(Hooks {
            on_start: Box::new(on_start),
            on_stop: Box::new(on_stop),
        });
    }

    /// Register a receiver with the given queue capacity (must be >= 1).
    ///
    /// The `Start` hook runs before this returns on the 0-to-1 transition,
    /// so the producer is live before the first `put` can be observed.
    pub fn add_receiver(&self, capacity: usize) -> FlowReceiver {
        assert!(capacity >= 1, "flow receiver capacity must be at least 1");
        let (tx, rx) = mpsc::channel(capacity);
        let error = Arc::new(Mutex::new(None));
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let first = {
            let mut receivers = self.shared.receivers.lock().unwrap_or_else(|e| e.into_inner());
            receivers.push(Slot {
                id,
                tx,
                error: Arc::clone(&error),
                misses: Arc::new(AtomicU64::new(0)),
            });
            receivers.len() == 1
        };
        if first && let Some(hooks) = self.shared.hooks.get() {
            (hooks.on_start)();
        }
        FlowReceiver { id, rx, error }
    }

    /// Remove a receiver; its channel closes and any queued buffers are
    /// released when the receiver drops. The `Stop` hook runs on the
    /// 1-to-0 transition.
    pub fn remove_receiver(&self, receiver: FlowReceiver) {
        let emptied = {
            let mut receivers = self.shared.receivers.lock().unwrap_or_else(|e| e.into_inner());
            let before = receivers.len();
            receivers.retain(|slot| slot.id != receiver.id);
            before > 0 && receivers.is_empty()
        };
        drop(receiver);
        if emptied && let Some(hooks) = self.shared.hooks.get() {
            (hooks.on_stop)();
        }
    }

    /// Broadcast one buffer: one hold per live receiver, then the caller's
    /// initial hold is released when `buf` drops at the end of this call.
    pub fn put(&self, buf: SharedBuffer) {
        // Snapshot the slots so no lock is held across channel operations.
        let slots: Vec<(u64, mpsc::Sender<SharedBuffer>, Arc<AtomicU64>)> = {
            let receivers = self.shared.receivers.lock().unwrap_or_else(|e| e.into_inner());
            receivers
                .iter()
                .map(|s| (s.id, s.tx.clone(), Arc::clone(&s.misses)))
                .collect()
        };
        for (id, tx, misses) in slots {
            match tx.try_send(buf.hold()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(dropped)) => {
                    // Drop-newest: this receiver keeps its queued prefix and
                    // loses the incoming buffer. The hold releases with
                    // `dropped`.
                    let total = misses.fetch_add(1, Ordering::Relaxed) + 1;
                    if total == 1 || total.is_multiple_of(100) {
                        debug!(receiver = id, total, "Flow receiver full, dropping buffer");
                    }
                    drop(dropped);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Receiver side was dropped without remove_receiver; it
                    // gets cleaned up on the next shutdown/remove pass.
                }
            }
        }
    }

    /// Store `err` in every receiver's terminal slot and close all channels.
    pub fn shutdown(&self, err: FlowError) {
        let slots: Vec<Slot> = {
            let mut receivers = self.shared.receivers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *receivers)
        };
        if slots.is_empty() {
            return;
        }
        warn!(error = %err, receivers = slots.len(), "Flow shutting down");
        for slot in &slots {
            let mut error = slot.error.lock().unwrap_or_else(|e| e.into_inner());
            error.get_or_insert(err.clone());
        }
        // Dropping the senders closes every receiver channel.
        drop(slots);
        if let Some(hooks) = self.shared.hooks.get() {
            (hooks.on_stop)();
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.shared.receivers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for Flow {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowReceiver {
    /// Receive the next buffer; `None` once the channel is closed and
    /// drained, after which [`FlowReceiver::error`] reports why.
    pub async fn recv(&mut self) -> Option<SharedBuffer> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SharedBuffer> {
        self.rx.try_recv().ok()
    }

    /// Terminal error, if the owning flow shut down.
    pub fn error(&self) -> Option<FlowError> {
        self.error.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn counted_buffer(released: &Arc<AtomicU32>) -> SharedBuffer {
        let released = Arc::clone(released);
        SharedBuffer::with_release(vec![0u8; 8], move || {
            released.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn delivers_to_all_receivers() {
        let flow = Flow::new();
        let mut a = flow.add_receiver(4);
        let mut b = flow.add_receiver(4);

        flow.put(SharedBuffer::new(vec![1u8, 2, 3]));

        assert_eq!(&*a.recv().await.unwrap(), &[1, 2, 3]);
        assert_eq!(&*b.recv().await.unwrap(), &[1, 2, 3]);
    }

    #[tokio::test]
    async fn put_net_hold_delta_is_receiver_count() {
        let flow = Flow::new();
        let mut a = flow.add_receiver(4);
        let _b = flow.add_receiver(4);

        let buf = SharedBuffer::new(vec![9u8]);
        let probe = buf.hold(); // keep one hold to observe the count
        flow.put(buf);

        // probe + one per receiver
        assert_eq!(probe.holds(), 3);
        let delivered = a.recv().await.unwrap();
        drop(delivered);
        assert_eq!(probe.holds(), 2);
    }

    #[tokio::test]
    async fn drop_on_full_keeps_queue_and_releases_drops() {
        let released = Arc::new(AtomicU32::new(0));
        let flow = Flow::new();
        let mut rx = flow.add_receiver(1);

        // A, B, C back-to-back with no reads: capacity 1 keeps only A.
        flow.put(counted_buffer(&released));
        flow.put(counted_buffer(&released));
        flow.put(counted_buffer(&released));

        // B and C were dropped (their delivery holds and producer holds both
        // released); A's producer hold released at the end of its put.
        assert_eq!(released.load(Ordering::SeqCst), 2);

        let kept = rx.recv().await.unwrap();
        drop(kept);
        assert_eq!(released.load(Ordering::SeqCst), 3);
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn shutdown_sets_terminal_error_and_closes() {
        let flow = Flow::new();
        let mut rx = flow.add_receiver(2);
        flow.put(SharedBuffer::new(vec![1u8]));
        flow.shutdown(FlowError::Interrupted);

        // Queued data is still drained first, then the channel reports closed.
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
        assert_eq!(rx.error(), Some(FlowError::Interrupted));
    }

    #[tokio::test]
    async fn closed_receiver_releases_queued_buffers() {
        let released = Arc::new(AtomicU32::new(0));
        let flow = Flow::new();
        let rx = flow.add_receiver(4);
        flow.put(counted_buffer(&released));
        flow.put(counted_buffer(&released));

        flow.remove_receiver(rx);
        assert_eq!(released.load(Ordering::SeqCst), 2);
        assert_eq!(flow.receiver_count(), 0);
    }

    #[tokio::test]
    async fn start_stop_hooks_fire_on_transitions() {
        let starts = Arc::new(AtomicU32::new(0));
        let stops = Arc::new(AtomicU32::new(0));
        let flow = Flow::new();
        {
            let starts = Arc::clone(&starts);
            let stops = Arc::clone(&stops);
            flow.set_hooks(
                move || {
                    starts.fetch_add(1, Ordering::SeqCst);
                },
                move || {
                    stops.fetch_add(1, Ordering::SeqCst);
                },
            );
        }

        let a = flow.add_receiver(1);
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        let b = flow.add_receiver(1);
        // Second receiver is not a 0->1 transition
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        flow.remove_receiver(a);
        assert_eq!(stops.load(Ordering::SeqCst), 0);
        flow.remove_receiver(b);
        assert_eq!(stops.load(Ordering::SeqCst), 1);

        let _c = flow.add_receiver(1);
        assert_eq!(starts.load(Ordering::SeqCst), 2);
    }

    #[test]
    #[should_panic(expected = "capacity")]
    fn zero_capacity_panics() {
        let flow = Flow::new();
        let _ = flow.add_receiver(0);
    }
}
