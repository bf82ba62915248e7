//! KV client with optional write buffering.
//!
//! Two client instances normally front the same [`Store`]: a buffered one
//! whose puts and deletes accumulate until the flush interval fires, and a
//! zero-interval one that writes through immediately. Callers that asked to
//! wait for their mutations (`with_wait`) are routed to the second.
//!
//! Reads, compare-and-set and increments always bypass the buffer: the commit
//! protocol depends on their results.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::oneshot;

use super::{decode_increment, encode_increment, Cell, Family, KvOp, PointGet, RangeGet, Store};

#[derive(Default)]
struct PendingBatch {
    ops: Vec<KvOp>,
    waiters: Vec<oneshot::Sender<Result<(), String>>>,
}

/// Handle over the store with last-hop dispatch of [`KvOp`]s.
pub struct Client {
    store: Arc<Store>,
    flush_interval_ms: u64,
    pending: Mutex<PendingBatch>,
}

impl Client {
    /// Create a client. A non-zero flush interval spawns a background flusher
    /// task, so buffered clients must be created inside a tokio runtime.
    pub fn new(store: Arc<Store>, flush_interval_ms: u64) -> Arc<Self> {
        let client = Arc::new(Self {
            store,
            flush_interval_ms,
            pending: Mutex::new(PendingBatch::default()),
        });
        if flush_interval_ms > 0 {
            spawn_flusher(Arc::downgrade(&client), flush_interval_ms);
        }
        client
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn is_buffered(&self) -> bool {
        self.flush_interval_ms > 0
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn get(&self, request: &PointGet) -> Result<Vec<Cell>> {
        self.store.get(request)
    }

    pub fn scan(&self, request: &RangeGet) -> Result<Vec<Cell>> {
        self.store.scan(request)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Enqueue ops on a buffered client, or apply them immediately on a
    /// write-through one.
    pub fn apply(&self, ops: Vec<KvOp>) -> Result<()> {
        if !self.is_buffered() {
            for op in &ops {
                self.dispatch(op)?;
            }
            return Ok(());
        }
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        pending.ops.extend(ops);
        Ok(())
    }

    /// Apply ops and wait until they are durably dispatched.
    ///
    /// On a buffered client this parks the caller on the next flush tick,
    /// following the flush-marker pattern of the mutation writer.
    pub async fn apply_sync(&self, ops: Vec<KvOp>) -> Result<()> {
        if !self.is_buffered() {
            for op in &ops {
                self.dispatch(op)?;
            }
            return Ok(());
        }

        let rx = {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            pending.ops.extend(ops);
            let (tx, rx) = oneshot::channel();
            pending.waiters.push(tx);
            rx
        };
        match rx.await.context("Flusher dropped completion channel")? {
            Ok(()) => Ok(()),
            Err(msg) => Err(anyhow::anyhow!(msg)),
        }
    }

    /// Drain and dispatch all buffered ops now.
    pub fn flush(&self) -> Result<()> {
        let batch = {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            std::mem::take(&mut *pending)
        };
        if batch.ops.is_empty() && batch.waiters.is_empty() {
            return Ok(());
        }

        let mut result: Result<(), String> = Ok(());
        for op in &batch.ops {
            if let Err(e) = self.dispatch(op) {
                tracing::warn!(err = %e, "Dropping failed buffered op");
                result = Err(e.to_string());
            }
        }
        for waiter in batch.waiters {
            let _ = waiter.send(result.clone());
        }
        result.map_err(|msg| anyhow::anyhow!(msg))
    }

    /// Compare-and-set on a cell's payload bytes; never buffered.
    pub fn compare_and_set(
        &self,
        family: Family,
        row: &[u8],
        qualifier: &[u8],
        expected: &[u8],
        new_value: &[u8],
        ts: u64,
    ) -> Result<bool> {
        self.store
            .compare_and_set(family, row, qualifier, expected, new_value, ts)
    }

    /// Atomic increment taking the wire-encoded amount
    /// (`[marker][i64 BE]`); never buffered. Returns the new counter value.
    pub fn increment(&self, family: Family, row: &[u8], qualifier: &[u8], value: &[u8]) -> Result<i64> {
        let (kind, amount) = decode_increment(value)?;
        tracing::trace!(?kind, amount, "Dispatching increment");
        self.store.atomic_increment(family, row, qualifier, amount)
    }

    fn dispatch(&self, op: &KvOp) -> Result<()> {
        match op {
            KvOp::Put {
                family,
                row,
                qualifier,
                value,
                ts,
            } => self.store.put(*family, row, qualifier, value, *ts),
            KvOp::Delete {
                family,
                row,
                qualifier,
                ts,
            } => self.store.delete(*family, row, qualifier, *ts),
            KvOp::DeleteRow { family, row, ts } => self.store.delete_row(*family, row, *ts),
            KvOp::Increment {
                family,
                row,
                qualifier,
                amount,
                kind,
            } => {
                let wire = encode_increment(*kind, *amount);
                self.increment(*family, row, qualifier, &wire)?;
                Ok(())
            }
        }
    }
}

fn spawn_flusher(client: Weak<Client>, flush_interval_ms: u64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(flush_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(client) = client.upgrade() else {
                break;
            };
            if let Err(e) = client.flush() {
                tracing::warn!(err = %e, "Buffered flush failed");
            }
        }
        tracing::debug!("Flusher shutting down - client dropped");
    });
}
