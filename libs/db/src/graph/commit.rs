//! Strong-consistency commit engine.
//!
//! The snapshot-edge cell is the single serialization point. A write takes
//! the lock by CASing the cell from its observed value to a lock-edge (the
//! same state plus the lock sentinel), applies the index-row delta, CASes
//! the cell to the new snapshot, and only then fires the degree increments.
//! Index writes between acquire and release are invisible to other strong
//! writers because they cannot take the lock; eventual readers may observe
//! in-between states and tolerate them.
//!
//! The lock sentinel carries the writer's timestamp and its encoded target
//! snapshot value. A contender observing a lock whose timestamp and pending
//! bytes equal its own request infers it is retrying its own interrupted
//! write (crash recovery or a delayed response) and resumes from the
//! index-mutation step; any other lock means the write is owned elsewhere.

use std::sync::Arc;

use anyhow::Result;

use super::codec::SnapshotEdgeCodec;
use super::fetcher::Fetcher;
use super::model::{build_operation, Edge, EdgeMutate, LockState, Op, SnapshotEdge};
use super::mutation::MutationBuilder;
use super::retry::{retry_on_success, DeadLetter, DeadLetterQueue};
use super::schema::Label;
use crate::kv::{Client, Family};
use crate::GraphConfig;

/// Protocol outcome. Zero means success; every non-zero code is retryable
/// and doubles as the retry predicate of the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommitOutcome {
    Success = 0,
    /// Lost the acquire CAS to a concurrent writer.
    LockContended = 1,
    /// Index-row mutations failed after the lock was taken; the lock stays
    /// for the self-retry rule to reclaim.
    MutateFailed = 2,
    /// The release CAS failed.
    ReleaseFailed = 3,
    /// Degree increments failed after release.
    IncrementFailed = 4,
    /// Observed a lock owned by a different writer.
    LockHeldByOther = 5,
}

impl CommitOutcome {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn is_success(self) -> bool {
        self == CommitOutcome::Success
    }
}

/// The strong and eventual write paths, wired to one synchronous KV client,
/// the fetcher, and the codec/mutation-builder bundle.
pub struct CommitEngine {
    client: Arc<Client>,
    fetcher: Arc<Fetcher>,
    builder: MutationBuilder,
    max_retry: usize,
    max_back_off_ms: u64,
    dead_letters: DeadLetterQueue,
}

impl CommitEngine {
    pub fn new(
        client: Arc<Client>,
        fetcher: Arc<Fetcher>,
        builder: MutationBuilder,
        config: &GraphConfig,
        dead_letters: DeadLetterQueue,
    ) -> Self {
        Self {
            client,
            fetcher,
            builder,
            max_retry: config.max_retry,
            max_back_off_ms: config.max_back_off_ms,
            dead_letters,
        }
    }

    /// Commit a batch sharing one edge identity, retrying with backoff until
    /// success or exhaustion. Exhausted batches are dead-lettered.
    #[tracing::instrument(skip(self, label, edges), fields(label = label.id, count = edges.len()))]
    pub async fn mutate_strong(&self, label: &Label, edges: &[Edge]) -> Result<CommitOutcome> {
        let result = retry_on_success(
            self.max_retry,
            self.max_back_off_ms,
            || self.commit_once(label, edges),
            |outcome: &CommitOutcome| outcome.is_success(),
        )
        .await;

        match result {
            Ok(outcome) if outcome.is_success() => Ok(outcome),
            Ok(outcome) => {
                self.dead_letters.enqueue(DeadLetter {
                    label_id: label.id,
                    reason: format!("commit exhausted retries with {:?}", outcome),
                    edge: edges.first().cloned(),
                });
                Ok(outcome)
            }
            Err(e) => {
                self.dead_letters.enqueue(DeadLetter {
                    label_id: label.id,
                    reason: format!("commit failed: {}", e),
                    edge: edges.first().cloned(),
                });
                Err(e)
            }
        }
    }

    /// One attempt of the commit protocol.
    pub async fn commit_once(&self, label: &Label, edges: &[Edge]) -> Result<CommitOutcome> {
        if edges.is_empty() {
            return Ok(CommitOutcome::Success);
        }
        let version = label.schema_version;
        let id = edges[0].normalized().id();
        let snapshot = self.fetcher.fetch_snapshot(&id, label).await?;

        if let Some(snap) = snapshot.as_ref().filter(|s| s.is_locked()) {
            return self.resume_or_yield(label, snap, edges).await;
        }

        // No lock observed: build the delta against the current snapshot.
        let Some((new_snapshot, mutate)) = build_operation(label, snapshot.as_ref(), edges)? else {
            // Everything in the batch is older than the snapshot; a later
            // write already superseded it.
            tracing::debug!(identity = %id, "Batch is stale, no-op");
            return Ok(CommitOutcome::Success);
        };
        let request_ts = new_snapshot.edge.ts;
        let new_value = SnapshotEdgeCodec::encode_value(&new_snapshot, version);

        // The lock-edge keeps the pre-lock state so a failed write can be
        // reverted and a retrying owner can rebuild its delta. An absent
        // prior snapshot is recorded as a tombstone.
        let prior_value = snapshot
            .as_ref()
            .map(|s| SnapshotEdgeCodec::encode_value(s, version))
            .unwrap_or_default();
        let lock_edge = SnapshotEdge {
            edge: snapshot.as_ref().map(|s| s.edge.clone()).unwrap_or_else(|| {
                let mut absent = new_snapshot.edge.clone();
                absent.op = Op::Delete;
                absent.props.clear();
                absent
            }),
            lock: Some(LockState {
                lock_ts: request_ts,
                pending: new_value.clone(),
            }),
        };
        let lock_value = SnapshotEdgeCodec::encode_value(&lock_edge, version);

        let row = SnapshotEdgeCodec::row(&id, version);
        let qualifier = SnapshotEdgeCodec::qualifier(&id, version);
        let acquired = self.client.compare_and_set(
            Family::Edge,
            &row,
            &qualifier,
            &prior_value,
            &lock_value,
            request_ts,
        )?;
        if !acquired {
            tracing::debug!(identity = %id, "Lock acquisition lost");
            return Ok(CommitOutcome::LockContended);
        }

        self.complete(label, &new_snapshot, &mutate, &lock_value, &new_value)
            .await
    }

    /// Handle an observed lock: resume our own interrupted write, or yield.
    async fn resume_or_yield(
        &self,
        label: &Label,
        locked: &SnapshotEdge,
        edges: &[Edge],
    ) -> Result<CommitOutcome> {
        let version = label.schema_version;
        let lock = locked.lock.as_ref().expect("caller checked lock presence");

        // Rebuild what this batch would write over the pre-lock state. The
        // lock cell's timestamp is the locker's, so the staleness filter is
        // disabled for the reconstruction.
        let mut prior = locked.clone();
        prior.lock = None;
        prior.edge.ts = 0;
        let Some((candidate, mutate)) = build_operation(label, Some(&prior), edges)? else {
            return Ok(CommitOutcome::LockHeldByOther);
        };
        let candidate_value = SnapshotEdgeCodec::encode_value(&candidate, version);

        if lock.lock_ts != candidate.edge.ts || lock.pending != candidate_value {
            tracing::debug!(identity = %candidate.edge.id(), lock_ts = lock.lock_ts, "Lock held by another writer");
            return Ok(CommitOutcome::LockHeldByOther);
        }

        tracing::info!(identity = %candidate.edge.id(), lock_ts = lock.lock_ts, "Resuming own interrupted write");
        let lock_value = SnapshotEdgeCodec::encode_value(locked, version);
        self.complete(label, &candidate, &mutate, &lock_value, &candidate_value)
            .await
    }

    /// Steps shared by the first attempt and the self-retry: index
    /// mutations, lock release, degree increments.
    async fn complete(
        &self,
        label: &Label,
        new_snapshot: &SnapshotEdge,
        mutate: &EdgeMutate,
        lock_value: &[u8],
        new_value: &[u8],
    ) -> Result<CommitOutcome> {
        let version = label.schema_version;
        let id = new_snapshot.edge.id();
        let request_ts = new_snapshot.edge.ts;
        let row = SnapshotEdgeCodec::row(&id, version);
        let qualifier = SnapshotEdgeCodec::qualifier(&id, version);

        // Step 2: index-row mutations. On failure the lock is left in place;
        // a later attempt with the same request reclaims it.
        let index_ops = match self.builder.edge_mutate_ops(mutate, label, request_ts) {
            Ok(ops) => ops,
            Err(e) => {
                tracing::warn!(identity = %id, err = %e, "Failed to build index mutations");
                return Ok(CommitOutcome::MutateFailed);
            }
        };
        if let Err(e) = self.client.apply_sync(index_ops).await {
            tracing::warn!(identity = %id, err = %e, "Index mutations failed");
            return Ok(CommitOutcome::MutateFailed);
        }

        // Step 3: release by CASing the lock-edge to the new snapshot. When
        // the delta carries no new snapshot, revert to the pre-lock state
        // with the lock cleared (with no prior state both branches write the
        // same bytes).
        let release_value = match &mutate.new_snapshot {
            Some(snapshot) => SnapshotEdgeCodec::encode_value(snapshot, version),
            None => {
                let mut reverted = new_snapshot.clone();
                reverted.lock = None;
                SnapshotEdgeCodec::encode_value(&reverted, version)
            }
        };
        debug_assert_eq!(release_value, new_value);
        let released = self.client.compare_and_set(
            Family::Edge,
            &row,
            &qualifier,
            lock_value,
            &release_value,
            request_ts,
        )?;
        if !released {
            tracing::warn!(identity = %id, "Lock release CAS failed");
            return Ok(CommitOutcome::ReleaseFailed);
        }

        // Step 4: degree increments, after release. Only one writer reaches
        // this step per logical transition, so they never double-apply.
        let degree_ops = match self.builder.degree_ops(mutate, label) {
            Ok(ops) => ops,
            Err(e) => {
                tracing::warn!(identity = %id, err = %e, "Failed to build degree increments");
                return Ok(CommitOutcome::IncrementFailed);
            }
        };
        if let Err(e) = self.client.apply(degree_ops) {
            tracing::warn!(identity = %id, err = %e, "Degree increments failed");
            return Ok(CommitOutcome::IncrementFailed);
        }

        tracing::debug!(identity = %id, ts = request_ts, "Commit complete");
        Ok(CommitOutcome::Success)
    }

    /// Eventual-consistency path: no lock steps, direct index and snapshot
    /// writes plus degree increments, ordered by the edges' timestamps at
    /// the store.
    pub async fn mutate_weak(&self, label: &Label, edges: &[Edge], client: &Client) -> Result<()> {
        for edge in edges {
            let (ops, increments) = self.builder.weak_edge_ops(edge, label)?;
            client.apply(ops)?;
            client.apply(increments)?;
        }
        Ok(())
    }
}
