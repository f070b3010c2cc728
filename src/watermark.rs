//! Watermarks track the highest index (commit timestamp) up to which all
//! work has finished.
//!
//! Callers mark an index as begun and later as done; a processing task
//! serializes those marks, advances the watermark once every index below a
//! point has completed, and wakes waiters whose index was crossed.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

struct Mark {
    index: u64,
    done: bool,
    waiter: Option<oneshot::Sender<()>>,
}

struct Shared {
    name: &'static str,
    done_until: AtomicU64,
    last_index: AtomicU64,
    sender: mpsc::UnboundedSender<Mark>,
}

/// A monotonic watermark with waiter support.
pub struct WaterMark {
    shared: Arc<Shared>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Mark>>>,
}

impl WaterMark {
    pub fn new(name: &'static str) -> WaterMark {
        let (sender, receiver) = mpsc::unbounded_channel();
        WaterMark {
            shared: Arc::new(Shared {
                name,
                done_until: AtomicU64::new(0),
                last_index: AtomicU64::new(0),
                sender,
            }),
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Marks `index` as begun.
    pub fn begin(&self, index: u64) {
        self.shared.last_index.fetch_max(index, Ordering::SeqCst);
        let _ = self.shared.sender.send(Mark {
            index,
            done: false,
            waiter: None,
        });
    }

    /// Marks `index` as finished.
    pub fn done(&self, index: u64) {
        let _ = self.shared.sender.send(Mark {
            index,
            done: true,
            waiter: None,
        });
    }

    /// Highest index below which everything has completed.
    pub fn done_until(&self) -> u64 {
        self.shared.done_until.load(Ordering::SeqCst)
    }

    /// Highest index ever begun.
    pub fn last_index(&self) -> u64 {
        self.shared.last_index.load(Ordering::SeqCst)
    }

    /// Resolves once the watermark reaches `index`.
    pub async fn wait_for(&self, index: u64) {
        if self.done_until() >= index {
            return;
        }
        let (tx, rx) = oneshot::channel();
        let _ = self.shared.sender.send(Mark {
            index,
            done: false,
            waiter: Some(tx),
        });
        // The processor drops the sender once the index is crossed, which
        // resolves the wait either way.
        let _ = rx.await;
    }

    /// Spawns the serializing processor. Must be called exactly once before
    /// marks are expected to advance the watermark.
    pub fn process(&self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let mut receiver = self
            .receiver
            .lock()
            .expect("watermark receiver poisoned")
            .take()
            .expect("watermark processor already started");
        let shared = Arc::clone(&self.shared);

        tokio::spawn(async move {
            // Pending begin/done balance and waiters keyed by index.
            let mut pending: HashMap<u64, i64> = HashMap::new();
            let mut waiters: HashMap<u64, Vec<oneshot::Sender<()>>> = HashMap::new();
            let mut indices: BinaryHeap<Reverse<u64>> = BinaryHeap::new();

            loop {
                tokio::select! {
                    mark = receiver.recv() => {
                        match mark {
                            Some(mark) => shared.process_one(
                                mark,
                                &mut pending,
                                &mut waiters,
                                &mut indices,
                            ),
                            None => break,
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }
}

impl Shared {
    fn process_one(
        &self,
        mark: Mark,
        pending: &mut HashMap<u64, i64>,
        waiters: &mut HashMap<u64, Vec<oneshot::Sender<()>>>,
        indices: &mut BinaryHeap<Reverse<u64>>,
    ) {
        if let Some(waiter) = mark.waiter {
            if self.done_until.load(Ordering::SeqCst) >= mark.index {
                drop(waiter); // Resolves the wait immediately.
            } else {
                waiters.entry(mark.index).or_default().push(waiter);
            }
            return;
        }

        let entry = pending.entry(mark.index).or_insert_with(|| {
            indices.push(Reverse(mark.index));
            0
        });
        *entry += if mark.done { -1 } else { 1 };

        let previous = self.done_until.load(Ordering::SeqCst);
        let mut until = previous;
        while let Some(&Reverse(min)) = indices.peek() {
            if pending.get(&min).copied().unwrap_or(0) > 0 {
                break; // Still outstanding begins at this index.
            }
            indices.pop();
            pending.remove(&min);
            until = min;
        }

        if until != previous {
            self.done_until.store(until, Ordering::SeqCst);
            tracing::trace!(watermark = self.name, until, "watermark advanced");
            // Wake everyone whose index was crossed.
            let crossed: Vec<u64> = waiters
                .keys()
                .copied()
                .filter(|&idx| idx <= until)
                .collect();
            for idx in crossed {
                waiters.remove(&idx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn shutdown_pair() -> (broadcast::Sender<()>, broadcast::Receiver<()>) {
        broadcast::channel(1)
    }

    #[tokio::test]
    async fn test_watermark_advances_in_order() {
        let (tx, rx) = shutdown_pair();
        let mark = Arc::new(WaterMark::new("test"));
        let handle = mark.process(rx);

        mark.begin(1);
        mark.begin(2);
        mark.done(1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mark.done_until(), 1);

        mark.done(2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mark.done_until(), 2);

        tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_done_holds_watermark() {
        let (tx, rx) = shutdown_pair();
        let mark = Arc::new(WaterMark::new("test"));
        let handle = mark.process(rx);

        mark.begin(1);
        mark.begin(2);
        mark.done(2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Index 1 is still outstanding, so 2 cannot be visible yet.
        assert_eq!(mark.done_until(), 0);

        mark.done(1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mark.done_until(), 2);

        tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_waiter_wakes_when_crossed() {
        let (tx, rx) = shutdown_pair();
        let mark = Arc::new(WaterMark::new("test"));
        let handle = mark.process(rx);

        mark.begin(5);

        let waiter = {
            let mark = mark.clone();
            tokio::spawn(async move {
                mark.wait_for(5).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        mark.done(5);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();

        tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_already_done_returns_immediately() {
        let (tx, rx) = shutdown_pair();
        let mark = Arc::new(WaterMark::new("test"));
        let handle = mark.process(rx);

        mark.begin(1);
        mark.done(1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        mark.wait_for(1).await;

        tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn test_last_index_tracks_begins() {
        let mark = WaterMark::new("test");
        mark.begin(3);
        mark.begin(7);
        mark.begin(5);
        assert_eq!(mark.last_index(), 7);
    }
}
