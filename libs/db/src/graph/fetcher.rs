//! Asynchronous fetch path with read coalescing.
//!
//! Two caches sit at the physical-request layer, both keyed by the full
//! request byte string:
//!
//! - The **coalescing cache** maps an in-flight request to the shared read
//!   of its first caller. Concurrent identical requests within the short TTL
//!   perform exactly one store read. A per-entry hit counter evicts hot
//!   entries past `inflight_max_hits` to bound amplification.
//! - The **result cache** is opt-in per query (`cache_ttl_ms > 0`) and holds
//!   materialized results with their production time.
//!
//! Neither cache ever coalesces across different RPC timeouts or filters:
//! those are part of the request key.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::sync::OnceCell;

use super::codec::{IndexEdgeCodec, SnapshotEdgeCodec, DEGREE_QUALIFIER};
use super::model::{Direction, Edge, EdgeId, SnapshotEdge, VertexId};
use super::query::{DuplicatePolicy, QueryParam};
use super::schema::{Label, SchemaCatalog};
use crate::kv::{Cell, Client, Family, PointGet, ReadRequest};
use crate::GraphConfig;

const INFLIGHT_MAX_ENTRIES: usize = 4096;

/// Materialized result of one query execution.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub edges: Vec<Edge>,
    /// Value of the degree counter when the scanned row carried one.
    pub degree: i64,
    /// Value of the count counter when the scanned row carried one.
    pub count: i64,
}

struct Inflight {
    cells: OnceCell<Arc<Vec<Cell>>>,
    created: Instant,
    hits: AtomicU32,
}

struct CachedResult {
    produced_at: Instant,
    result: Arc<QueryResult>,
}

pub struct Fetcher {
    client: Arc<Client>,
    catalog: Arc<dyn SchemaCatalog>,
    inflight: DashMap<Vec<u8>, Arc<Inflight>>,
    results: DashMap<Vec<u8>, CachedResult>,
    inflight_ttl: Duration,
    inflight_max_hits: u32,
    result_cache_max_entries: usize,
    default_timeout_ms: u64,
}

impl Fetcher {
    pub fn new(client: Arc<Client>, catalog: Arc<dyn SchemaCatalog>, config: &GraphConfig) -> Self {
        Self {
            client,
            catalog,
            inflight: DashMap::new(),
            results: DashMap::new(),
            inflight_ttl: Duration::from_millis(config.inflight_ttl_ms),
            inflight_max_hits: config.inflight_max_hits,
            result_cache_max_entries: config.result_cache_max_entries,
            default_timeout_ms: config.rpc_timeout_ms,
        }
    }

    /// Execute a query through both cache layers.
    pub async fn fetch(&self, param: &QueryParam) -> Result<Arc<QueryResult>> {
        let label = self.catalog.find_label(param.label_id)?;
        let read = param.build_read(&label, self.default_timeout_ms)?;
        let physical_key = read.cache_key();

        let result_key = if param.cache_ttl_ms > 0 {
            let key = param.result_cache_key(&physical_key);
            if let Some(cached) = self.results.get(&key) {
                if cached.produced_at.elapsed() < Duration::from_millis(param.cache_ttl_ms) {
                    tracing::trace!(query = %param, "Result cache hit");
                    return Ok(cached.result.clone());
                }
            }
            Some(key)
        } else {
            None
        };

        let cells = self.read_coalesced(physical_key, &read).await?;
        let result = Arc::new(self.materialize(param, &label, &cells)?);

        if let Some(key) = result_key {
            if self.results.len() >= self.result_cache_max_entries {
                self.sweep_results();
            }
            self.results.insert(
                key,
                CachedResult {
                    produced_at: Instant::now(),
                    result: result.clone(),
                },
            );
        }
        Ok(result)
    }

    /// Read-through without either cache layer. The deleteAll traversal
    /// must observe its own deletions between iterations, so its reads never
    /// coalesce.
    pub(crate) async fn fetch_uncached(&self, param: &QueryParam) -> Result<QueryResult> {
        let label = self.catalog.find_label(param.label_id)?;
        let read = param.build_read(&label, self.default_timeout_ms)?;
        let cells = self.read_direct(&read).await?;
        self.materialize(param, &label, &cells)
    }

    /// Read the snapshot-edge of an identity, bypassing both caches: the
    /// commit protocol must observe current state.
    pub async fn fetch_snapshot(&self, id: &EdgeId, label: &Label) -> Result<Option<SnapshotEdge>> {
        let id = id.normalized();
        let version = label.schema_version;
        let request = ReadRequest::Point(PointGet {
            family: Family::Edge,
            row: SnapshotEdgeCodec::row(&id, version),
            qualifiers: Some(vec![SnapshotEdgeCodec::qualifier(&id, version)]),
        });
        let cells = self.read_direct(&request).await?;
        match cells.first() {
            None => Ok(None),
            Some(cell) => Ok(Some(SnapshotEdgeCodec::decode(cell, label)?)),
        }
    }

    /// Current degree counter for `(src, label, dir)`.
    pub async fn fetch_degree(&self, label: &Label, src: &VertexId, dir: Direction) -> Result<i64> {
        let request = ReadRequest::Point(PointGet {
            family: Family::Edge,
            row: IndexEdgeCodec::counter_row(label, src, dir)?,
            qualifiers: Some(vec![DEGREE_QUALIFIER.to_vec()]),
        });
        let cells = self.read_direct(&request).await?;
        match cells.first() {
            None => Ok(0),
            Some(cell) => decode_counter(&cell.value),
        }
    }

    // =========================================================================
    // Coalescing layer
    // =========================================================================

    async fn read_coalesced(&self, key: Vec<u8>, read: &ReadRequest) -> Result<Arc<Vec<Cell>>> {
        // Lazily retire entries that aged out or served too many callers.
        let stale = self
            .inflight
            .get(&key)
            .map(|entry| {
                entry.created.elapsed() >= self.inflight_ttl
                    || entry.hits.load(Ordering::Relaxed) >= self.inflight_max_hits
            })
            .unwrap_or(false);
        if stale {
            self.inflight.remove(&key);
        }
        if self.inflight.len() >= INFLIGHT_MAX_ENTRIES {
            let ttl = self.inflight_ttl;
            self.inflight.retain(|_, entry| entry.created.elapsed() < ttl);
        }

        let entry = self
            .inflight
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Inflight {
                    cells: OnceCell::new(),
                    created: Instant::now(),
                    hits: AtomicU32::new(0),
                })
            })
            .clone();
        entry.hits.fetch_add(1, Ordering::Relaxed);

        let cells = entry
            .cells
            .get_or_try_init(|| async {
                let cells = self.read_direct(read).await?;
                Ok::<_, anyhow::Error>(Arc::new(cells))
            })
            .await?;
        Ok(cells.clone())
    }

    /// Bound the result cache: drop entries older than the longest sensible
    /// TTL, then fall back to clearing if the map is still full.
    fn sweep_results(&self) {
        let horizon = Duration::from_secs(60);
        self.results.retain(|_, cached| cached.produced_at.elapsed() < horizon);
        if self.results.len() >= self.result_cache_max_entries {
            self.results.clear();
        }
    }

    async fn read_direct(&self, read: &ReadRequest) -> Result<Vec<Cell>> {
        let client = self.client.clone();
        let read = read.clone();
        let timeout_ms = match &read {
            ReadRequest::Point(_) => self.default_timeout_ms,
            ReadRequest::Range(scan) => scan.timeout_ms,
        };
        let task = tokio::task::spawn_blocking(move || match &read {
            ReadRequest::Point(get) => client.get(get),
            ReadRequest::Range(scan) => client.scan(scan),
        });
        tokio::time::timeout(Duration::from_millis(timeout_ms), task)
            .await
            .map_err(|_| anyhow::anyhow!("read timed out after {}ms", timeout_ms))?
            .context("read task panicked")?
    }

    // =========================================================================
    // Decode
    // =========================================================================

    fn materialize(&self, param: &QueryParam, label: &Label, cells: &[Cell]) -> Result<QueryResult> {
        if param.tgt.is_some() {
            let mut result = QueryResult::default();
            if let Some(cell) = cells.first() {
                let snapshot = SnapshotEdgeCodec::decode(cell, label)?;
                if !snapshot.edge.op.is_delete() {
                    result.edges.push(snapshot.edge);
                }
            }
            return Ok(result);
        }

        let mut result = QueryResult::default();
        let mut edges = Vec::with_capacity(cells.len());
        for cell in cells {
            if IndexEdgeCodec::is_degree_cell(cell) {
                result.degree = decode_counter(&cell.value)?;
                continue;
            }
            if IndexEdgeCodec::is_count_cell(cell) {
                result.count = decode_counter(&cell.value)?;
                continue;
            }
            edges.push(IndexEdgeCodec::decode(cell, label)?);
        }

        if param.duplicate_policy == DuplicatePolicy::First {
            let mut seen = std::collections::HashSet::new();
            edges.retain(|edge| seen.insert(edge.tgt.clone()));
        }

        result.edges = edges
            .into_iter()
            .skip(param.offset)
            .take(param.limit)
            .collect();
        Ok(result)
    }
}

fn decode_counter(payload: &[u8]) -> Result<i64> {
    if payload.len() != 8 {
        anyhow::bail!("counter cell has invalid length {}", payload.len());
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(payload);
    Ok(i64::from_be_bytes(buf))
}
