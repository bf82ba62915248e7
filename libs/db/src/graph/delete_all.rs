//! Recursive retirement of adjacency sets.
//!
//! For each `(source vertex, label)` pair the traversal reads a bounded
//! batch of the adjacency set, synthesizes a delete per fetched edge at the
//! request timestamp, and repeats until a fetch yields nothing eligible.
//! Edges written at or after the request timestamp are deliberately ignored,
//! so a concurrent insert survives the sweep.
//!
//! V3 labels route every synthesized delete through the commit engine;
//! V1/V2 labels use the legacy direct-write sequence (reverse index deletes
//! and decrement, snapshot delete, forward index deletes and decrement).

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;

use super::codec::{IndexEdgeCodec, SnapshotEdgeCodec, DEGREE_QUALIFIER};
use super::commit::CommitEngine;
use super::fetcher::Fetcher;
use super::model::{Direction, Edge, IndexEdge, Op, VertexId};
use super::mutation::MutationBuilder;
use super::query::{DuplicatePolicy, QueryParam};
use super::retry::retry_on_success;
use super::schema::{Label, SchemaCatalog, StorageVersion};
use crate::kv::{Client, Family, IncrementKind, KvOp};
use crate::GraphConfig;

pub struct DeleteAll<'a> {
    pub fetcher: &'a Fetcher,
    pub engine: &'a CommitEngine,
    pub builder: &'a MutationBuilder,
    pub client: &'a Client,
    pub catalog: &'a dyn SchemaCatalog,
    pub config: &'a GraphConfig,
}

impl DeleteAll<'_> {
    /// Retire every edge touching the source vertices under the given labels
    /// and direction, as of `request_ts`. Returns
    /// `(all_deleted, deletes_succeeded)`.
    #[tracing::instrument(skip(self, src_vertices, label_ids), fields(vertices = src_vertices.len(), labels = label_ids.len(), request_ts))]
    pub async fn run(
        &self,
        src_vertices: &[VertexId],
        label_ids: &[u32],
        dir: Direction,
        request_ts: u64,
    ) -> Result<(bool, bool)> {
        let mut all_deleted = true;
        let mut deletes_succeeded = true;

        for src in src_vertices {
            for label_id in label_ids {
                let label = self.catalog.find_label(*label_id)?;
                let (done, ok) = self.retire_adjacency(src, &label, dir, request_ts).await?;
                all_deleted &= done;
                deletes_succeeded &= ok;
            }
        }
        Ok((all_deleted, deletes_succeeded))
    }

    async fn retire_adjacency(
        &self,
        src: &VertexId,
        label: &Label,
        dir: Direction,
        request_ts: u64,
    ) -> Result<(bool, bool)> {
        let deletes_ok = AtomicBool::new(true);

        // Each sweep re-reads the adjacency; the loop ends when a fetch
        // returns no eligible edges, bounded by the retry harness.
        let remaining = retry_on_success(
            self.config.max_retry,
            self.config.max_back_off_ms,
            || self.sweep(src, label, dir, request_ts, &deletes_ok),
            |remaining| *remaining == 0,
        )
        .await?;

        Ok((remaining == 0, deletes_ok.load(Ordering::Relaxed)))
    }

    /// One bounded read-then-delete pass. Returns how many eligible edges
    /// the fetch produced.
    async fn sweep(
        &self,
        src: &VertexId,
        label: &Label,
        dir: Direction,
        request_ts: u64,
        deletes_ok: &AtomicBool,
    ) -> Result<usize> {
        let param = QueryParam::new(src.clone(), label.id, dir)
            .with_limit(self.config.delete_all_fetch_size)
            .with_duplicate_policy(DuplicatePolicy::Raw)
            .with_ts_range(0, request_ts);
        let result = self.fetcher.fetch_uncached(&param).await?;
        if result.edges.is_empty() {
            return Ok(0);
        }

        tracing::debug!(
            src = %src,
            label = label.id,
            count = result.edges.len(),
            "Retiring adjacency batch"
        );
        for fetched in &result.edges {
            let ok = self.retire_edge(fetched, label, request_ts).await?;
            if !ok {
                deletes_ok.store(false, Ordering::Relaxed);
            }
        }
        Ok(result.edges.len())
    }

    async fn retire_edge(&self, fetched: &Edge, label: &Label, request_ts: u64) -> Result<bool> {
        if label.schema_version == StorageVersion::V3 {
            let mut delete = fetched.normalized();
            delete.ts = request_ts;
            delete.op = Op::Delete;
            delete.props.clear();
            let outcome = self.engine.mutate_strong(label, &[delete]).await?;
            return Ok(outcome.is_success());
        }
        self.retire_edge_legacy(fetched, label, request_ts)
    }

    /// Legacy direct-write retirement for V1/V2 labels, using the fetched
    /// edge's properties to reconstruct the index qualifiers.
    fn retire_edge_legacy(&self, fetched: &Edge, label: &Label, request_ts: u64) -> Result<bool> {
        let forward = fetched.normalized();
        let reversed = forward.reversed();
        let version = label.schema_version;

        let mut ops = Vec::with_capacity(label.indices.len() * 2 + 1);
        let mut increments = Vec::with_capacity(2);

        for index in &label.indices {
            ops.push(self.builder.index_edge_delete(
                &IndexEdge::new(reversed.clone(), index.seq),
                label,
                request_ts,
            )?);
        }
        increments.push(KvOp::Increment {
            family: Family::Edge,
            row: IndexEdgeCodec::counter_row(label, &forward.tgt, Direction::In)?,
            qualifier: DEGREE_QUALIFIER.to_vec(),
            amount: -1,
            kind: IncrementKind::Degree,
        });

        let id = forward.id();
        ops.push(KvOp::Delete {
            family: Family::Edge,
            row: SnapshotEdgeCodec::row(&id, version),
            qualifier: SnapshotEdgeCodec::qualifier(&id, version),
            ts: request_ts,
        });

        for index in &label.indices {
            ops.push(self.builder.index_edge_delete(
                &IndexEdge::new(forward.clone(), index.seq),
                label,
                request_ts,
            )?);
        }
        increments.push(KvOp::Increment {
            family: Family::Edge,
            row: IndexEdgeCodec::counter_row(label, &forward.src, Direction::Out)?,
            qualifier: DEGREE_QUALIFIER.to_vec(),
            amount: -1,
            kind: IncrementKind::Degree,
        });

        match self
            .client
            .apply(ops)
            .and_then(|_| self.client.apply(increments))
        {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::warn!(identity = %forward.id(), err = %e, "Legacy edge retirement failed");
                Ok(false)
            }
        }
    }
}
