//! Property-graph storage over a wide-column transactional KV store.
//!
//! The crate is organized in two layers:
//!
//! - [`kv`] - the wide-column cell model (row, family, qualifier, value,
//!   per-cell timestamp) and a RocksDB-backed store providing last-write-wins
//!   puts, compare-and-set on cell value bytes, and atomic counters.
//! - [`graph`] - the property-graph engine: version-tagged codecs for
//!   vertices, index-edges and snapshot-edges, the mutation builder, the
//!   fetch path with its coalescing and result caches, the strong-consistency
//!   commit engine, and the deleteAll traversal.

mod config;
pub use config::GraphConfig;

mod request;
pub use request::{new_request_id, ReplyEnvelope, RequestEnvelope};

pub mod kv;

pub mod graph;
pub use graph::model::{
    Direction, Edge, EdgeId, EdgeMutate, IndexEdge, InnerVal, Op, Props, SnapshotEdge, Vertex,
    VertexId,
};
pub use graph::schema::{
    CatalogError, ConsistencyLevel, Label, LabelIndex, LabelMeta, MemoryCatalog, SchemaCatalog,
    Service, ServiceColumn, StorageVersion, ValueType,
};
pub use graph::writer::{
    create_writer, spawn_consumer, Consumer as MutationConsumer, GraphMutation, Writer,
    WriterConfig,
};
pub use graph::Graph;

use serde::{Deserialize, Serialize};

/// A timestamp as milliseconds since the Unix epoch.
///
/// Edge and vertex timestamps double as the KV write-timestamp, so a single
/// representation is used everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimestampMilli(pub u64);

impl TimestampMilli {
    /// Create a new timestamp from the current time.
    pub fn now() -> Self {
        TimestampMilli(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_millis() as u64,
        )
    }
}

impl std::fmt::Display for TimestampMilli {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TimestampMilli {
    fn from(ms: u64) -> Self {
        TimestampMilli(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_now_is_monotonic_enough() {
        let a = TimestampMilli::now();
        let b = TimestampMilli::now();
        assert!(a <= b);
    }

    #[test]
    fn test_timestamp_ordering() {
        assert!(TimestampMilli(1) < TimestampMilli(2));
        assert_eq!(TimestampMilli::from(7), TimestampMilli(7));
    }
}
