//! Monotonic commit-timestamp source.
//!
//! The oracle hands out commit timestamps and tracks two watermarks: the
//! read mark (which timestamps are still being read) and the transaction
//! mark (which commits have been fully applied and are safe to read).

use std::sync::{Arc, Mutex};

use crate::watermark::WaterMark;

pub struct Oracle {
    next_txn_ts: Mutex<u64>,

    /// Timestamps handed to readers; held open until the read finishes.
    pub read_mark: Arc<WaterMark>,

    /// Commit timestamps; done once the commit is applied to the LSM.
    pub txn_mark: Arc<WaterMark>,
}

impl Oracle {
    /// An oracle whose next commit timestamp is `next_ts`.
    pub fn new(next_ts: u64) -> Oracle {
        Oracle {
            next_txn_ts: Mutex::new(next_ts),
            read_mark: Arc::new(WaterMark::new("emberdb.pending-reads")),
            txn_mark: Arc::new(WaterMark::new("emberdb.txn-ts")),
        }
    }

    /// Resets the next commit timestamp after recovery, before any writer
    /// runs. Everything below `ts` is already applied, so the transaction
    /// watermark is advanced to `ts - 1`; without this a reader at the
    /// recovered timestamp would wait forever.
    pub fn set_next_ts(&self, ts: u64) {
        *self.next_txn_ts.lock().expect("oracle poisoned") = ts;
        if ts > 0 {
            self.txn_mark.begin(ts - 1);
            self.txn_mark.done(ts - 1);
        }
    }

    /// Allocates the next commit timestamp and marks it begun on the
    /// transaction watermark.
    pub fn next_commit_ts(&self) -> u64 {
        let mut next = self.next_txn_ts.lock().expect("oracle poisoned");
        let ts = *next;
        *next += 1;
        self.txn_mark.begin(ts);
        ts
    }

    /// Marks a commit as fully applied.
    pub fn done_commit(&self, ts: u64) {
        self.txn_mark.done(ts);
    }

    /// The timestamp reads should happen at: everything committed so far.
    pub fn read_ts(&self) -> u64 {
        let next = self.next_txn_ts.lock().expect("oracle poisoned");
        next.saturating_sub(1)
    }

    /// Waits until every commit at or below `ts` has been applied, so a
    /// read at `ts` observes a consistent state.
    pub async fn wait_for_ts(&self, ts: u64) {
        self.txn_mark.wait_for(ts).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_timestamps_are_monotonic() {
        let oracle = Oracle::new(1);
        let a = oracle.next_commit_ts();
        let b = oracle.next_commit_ts();
        let c = oracle.next_commit_ts();
        assert!(a < b && b < c);
        assert_eq!(a, 1);
    }

    #[test]
    fn test_read_ts_trails_next_commit() {
        let oracle = Oracle::new(5);
        assert_eq!(oracle.read_ts(), 4);
        let ts = oracle.next_commit_ts();
        assert_eq!(ts, 5);
        assert_eq!(oracle.read_ts(), 5);
    }

    #[tokio::test]
    async fn test_wait_for_applied_commit() {
        let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
        let oracle = Arc::new(Oracle::new(1));
        let handle = oracle.txn_mark.process(shutdown_rx);

        let ts = oracle.next_commit_ts();
        oracle.done_commit(ts);
        tokio::time::timeout(std::time::Duration::from_secs(1), oracle.wait_for_ts(ts))
            .await
            .expect("commit should become visible");

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
