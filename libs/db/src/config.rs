use serde::{Deserialize, Serialize};

/// Tunables for the graph engine.
///
/// All durations are milliseconds. `Default` values match the production
/// settings the engine is normally deployed with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Flush interval for the buffered KV client. The synchronous client
    /// used by `with_wait` callers always runs with a zero interval.
    pub buffered_flush_interval_ms: u64,

    /// Retry bound for the commit protocol and the deleteAll traversal.
    pub max_retry: usize,

    /// Upper bound for the randomized delay between retries.
    pub max_back_off_ms: u64,

    /// Batch size for adjacency reads during deleteAll.
    pub delete_all_fetch_size: usize,

    /// Access/write TTL of the in-flight read coalescing cache.
    pub inflight_ttl_ms: u64,

    /// Hit count after which a coalescing-cache entry is evicted, bounding
    /// amplification on a single hot entry.
    pub inflight_max_hits: u32,

    /// Maximum number of materialized entries in the opt-in result cache.
    pub result_cache_max_entries: usize,

    /// Default RPC timeout applied to reads that do not specify one.
    pub rpc_timeout_ms: u64,

    /// Buffer size of the mutation writer channel.
    pub channel_buffer_size: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            buffered_flush_interval_ms: 100,
            max_retry: 10,
            max_back_off_ms: 50,
            delete_all_fetch_size: 1000,
            inflight_ttl_ms: 10,
            inflight_max_hits: 10,
            result_cache_max_entries: 10_000,
            rpc_timeout_ms: 1000,
            channel_buffer_size: 1000,
        }
    }
}
