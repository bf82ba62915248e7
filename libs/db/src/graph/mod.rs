//! Property-graph engine over the wide-column store.
//!
//! ## Module Structure
//!
//! - `mod.rs` - the `Graph` facade and module exports
//! - `model.rs` - entities and the operation builder
//! - `schema.rs` - schema catalog types and lookups
//! - `codec/` - physical layout of vertices, index-edges, snapshot-edges
//! - `mutation.rs` - entity-to-KvOp translation
//! - `query.rs` / `fetcher.rs` - read path with coalescing and result caches
//! - `commit.rs` - strong-consistency commit protocol
//! - `delete_all.rs` - adjacency retirement traversal
//! - `retry.rs` - retry combinators and the dead-letter channel
//! - `writer.rs` - Writer handle and mutation consumer

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;

pub mod codec;
pub mod commit;
pub mod delete_all;
pub mod fetcher;
pub mod model;
pub mod mutation;
pub mod query;
pub mod retry;
pub mod schema;
pub mod writer;

#[cfg(test)]
mod tests;

pub use commit::{CommitEngine, CommitOutcome};
pub use fetcher::{Fetcher, QueryResult};
pub use mutation::MutationBuilder;
pub use query::{DuplicatePolicy, QueryParam};
pub use retry::{DeadLetter, DeadLetterQueue};

use delete_all::DeleteAll;
use model::{Direction, Edge, EdgeId, Vertex, VertexId};
use schema::SchemaCatalog;
use crate::kv::{encode_increment, Client, Family, KvOp, PointGet, Store, StoreMetrics};
use crate::GraphConfig;

/// The engine facade: two KV clients (buffered and zero-flush), the schema
/// catalog, the fetcher and the commit engine, wired explicitly at open time.
pub struct Graph {
    store: Arc<Store>,
    buffered_client: Arc<Client>,
    sync_client: Arc<Client>,
    catalog: Arc<dyn SchemaCatalog>,
    fetcher: Arc<Fetcher>,
    engine: CommitEngine,
    builder: MutationBuilder,
    config: GraphConfig,
}

impl Graph {
    /// Open the store at `db_path` and wire the engine. Returns the receiving
    /// end of the dead-letter channel for the embedder to drain.
    ///
    /// Must be called inside a tokio runtime (the buffered client spawns its
    /// flusher task).
    pub fn open(
        db_path: &Path,
        catalog: Arc<dyn SchemaCatalog>,
        config: GraphConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DeadLetter>)> {
        let mut store = Store::new(db_path);
        store.ready()?;
        let store = Arc::new(store);

        let sync_client = Client::new(store.clone(), 0);
        let buffered_client = Client::new(store.clone(), config.buffered_flush_interval_ms);
        let fetcher = Arc::new(Fetcher::new(buffered_client.clone(), catalog.clone(), &config));
        let (dead_letters, receiver) = DeadLetterQueue::channel();
        // The protocol client is the synchronous one: every commit step needs
        // its result before the next may run.
        let engine = CommitEngine::new(
            sync_client.clone(),
            fetcher.clone(),
            MutationBuilder,
            &config,
            dead_letters,
        );

        Ok((
            Self {
                store,
                buffered_client,
                sync_client,
                catalog,
                fetcher,
                engine,
                builder: MutationBuilder,
                config,
            },
            receiver,
        ))
    }

    fn client(&self, with_wait: bool) -> &Arc<Client> {
        if with_wait {
            &self.sync_client
        } else {
            &self.buffered_client
        }
    }

    pub fn fetcher(&self) -> &Arc<Fetcher> {
        &self.fetcher
    }

    pub fn store_metrics(&self) -> &StoreMetrics {
        self.store.metrics()
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Apply vertex mutations, retrying transient KV failures. Returns one
    /// success flag per vertex.
    pub async fn mutate_vertices(&self, vertices: &[Vertex], with_wait: bool) -> Result<Vec<bool>> {
        let client = self.client(with_wait);
        let mut results = Vec::with_capacity(vertices.len());
        for vertex in vertices {
            let applied = match self.catalog.find_service_column(vertex.id.column_id) {
                Ok(column) => match self.builder.vertex_ops(vertex, &column) {
                    Ok(ops) => {
                        retry::retry_on_failure(
                            self.config.max_retry,
                            self.config.max_back_off_ms,
                            || {
                                let ops = ops.clone();
                                let client = client.clone();
                                async move {
                                    client.apply(ops)?;
                                    Ok(true)
                                }
                            },
                            false,
                        )
                        .await
                    }
                    Err(e) => {
                        tracing::warn!(vertex = %vertex.id, err = %e, "Vertex mutation build failed");
                        false
                    }
                },
                Err(e) => {
                    tracing::warn!(vertex = %vertex.id, err = %e, "Vertex column lookup failed");
                    false
                }
            };
            results.push(applied);
        }
        Ok(results)
    }

    /// Apply edge mutations, grouped by edge identity. Strong labels go
    /// through the commit engine; weak labels through direct writes on the
    /// selected client. Returns one success flag per input edge.
    pub async fn mutate_edges(&self, edges: &[Edge], with_wait: bool) -> Result<Vec<bool>> {
        let mut groups: HashMap<EdgeId, Vec<usize>> = HashMap::new();
        for (i, edge) in edges.iter().enumerate() {
            groups.entry(edge.id().normalized()).or_default().push(i);
        }

        let mut results = vec![false; edges.len()];
        for (identity, members) in groups {
            let batch: Vec<Edge> = members.iter().map(|i| edges[*i].clone()).collect();
            let ok = match self.catalog.find_label(identity.label_id) {
                Ok(label) => {
                    if label.is_strong() {
                        match self.engine.mutate_strong(&label, &batch).await {
                            Ok(outcome) => outcome.is_success(),
                            Err(e) => {
                                tracing::warn!(identity = %identity, err = %e, "Strong mutation failed");
                                false
                            }
                        }
                    } else {
                        match self.engine.mutate_weak(&label, &batch, self.client(with_wait)).await {
                            Ok(()) => true,
                            Err(e) => {
                                tracing::warn!(identity = %identity, err = %e, "Weak mutation failed");
                                false
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(identity = %identity, err = %e, "Label lookup failed");
                    false
                }
            };
            for i in members {
                results[i] = ok;
            }
        }
        Ok(results)
    }

    /// Fire count increments for the given edges. Returns the new counter
    /// values in input order.
    pub async fn increment_counts(&self, edges: &[Edge]) -> Result<Vec<i64>> {
        let mut values = Vec::with_capacity(edges.len());
        for edge in edges {
            let label = self.catalog.find_label(edge.label_id)?;
            for op in self.builder.count_ops(std::slice::from_ref(edge), &label)? {
                let KvOp::Increment {
                    family,
                    row,
                    qualifier,
                    amount,
                    kind,
                } = op
                else {
                    anyhow::bail!("count_ops produced a non-increment op");
                };
                let wire = encode_increment(kind, amount);
                values.push(self.sync_client.increment(family, &row, &qualifier, &wire)?);
            }
        }
        Ok(values)
    }

    /// Retire every edge touching the source vertices, as of `request_ts`.
    /// Returns `(all_deleted, deletes_succeeded)`.
    pub async fn delete_all_adjacent_edges(
        &self,
        src_vertices: &[VertexId],
        label_ids: &[u32],
        dir: Direction,
        request_ts: u64,
    ) -> Result<(bool, bool)> {
        DeleteAll {
            fetcher: &self.fetcher,
            engine: &self.engine,
            builder: &self.builder,
            client: &self.sync_client,
            catalog: self.catalog.as_ref(),
            config: &self.config,
        }
        .run(src_vertices, label_ids, dir, request_ts)
        .await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Execute an edge query through the fetch path.
    pub async fn get_edges(&self, param: &QueryParam) -> Result<Arc<QueryResult>> {
        self.fetcher.fetch(param).await
    }

    /// Read a vertex back, `None` when absent.
    pub async fn get_vertex(&self, id: &VertexId) -> Result<Option<Vertex>> {
        let column = self.catalog.find_service_column(id.column_id)?;
        let cells = self.sync_client.get(&PointGet {
            family: Family::Vertex,
            row: codec::VertexCodec::row(id, column.schema_version),
            qualifiers: None,
        })?;
        codec::VertexCodec::decode(&cells, &column)
    }

    /// Drain the buffered client so earlier fire-and-forget writes become
    /// visible to readers.
    pub async fn flush(&self) -> Result<()> {
        self.buffered_client.flush()
    }
}
