//! Query parameters and physical read construction.
//!
//! A [`QueryParam`] either names a target vertex (point read of the snapshot
//! cell) or describes a bounded range over one index row. The physical
//! request over-fetches by the caller's offset plus the two counter cells;
//! offset, limit and duplicate policy are applied after decode so counter
//! cells never consume result slots.

use anyhow::Result;

use super::codec::{IndexEdgeCodec, SnapshotEdgeCodec};
use super::model::{Direction, EdgeId, VertexId};
use super::schema::Label;
use crate::kv::{Family, PointGet, RangeGet, ReadRequest};

/// How duplicate adjacency entries for the same target are collapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Keep the first entry in index order per target vertex.
    First,
    /// Keep every entry as read. Used by the deleteAll traversal.
    Raw,
}

#[derive(Debug, Clone)]
pub struct QueryParam {
    pub label_id: u32,
    pub dir: Direction,
    pub src: VertexId,
    /// When set, the query is a point read of the snapshot-edge.
    pub tgt: Option<VertexId>,
    /// Index to scan; `None` selects the label's first index.
    pub index_seq: Option<u8>,
    pub offset: usize,
    pub limit: usize,
    /// Cell timestamp window, `min_ts <= ts < max_ts`.
    pub min_ts: u64,
    pub max_ts: u64,
    /// Optional inclusive qualifier interval.
    pub column_range: Option<(Vec<u8>, Vec<u8>)>,
    /// Per-query RPC timeout; falls back to the engine default.
    pub rpc_timeout_ms: Option<u64>,
    pub duplicate_policy: DuplicatePolicy,
    /// Result-cache TTL; zero disables the result cache for this query.
    pub cache_ttl_ms: u64,
}

impl QueryParam {
    pub fn new(src: VertexId, label_id: u32, dir: Direction) -> Self {
        Self {
            label_id,
            dir,
            src,
            tgt: None,
            index_seq: None,
            offset: 0,
            limit: 100,
            min_ts: 0,
            max_ts: u64::MAX,
            column_range: None,
            rpc_timeout_ms: None,
            duplicate_policy: DuplicatePolicy::First,
            cache_ttl_ms: 0,
        }
    }

    pub fn with_tgt(mut self, tgt: VertexId) -> Self {
        self.tgt = Some(tgt);
        self
    }

    pub fn with_index(mut self, index_seq: u8) -> Self {
        self.index_seq = Some(index_seq);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_ts_range(mut self, min_ts: u64, max_ts: u64) -> Self {
        self.min_ts = min_ts;
        self.max_ts = max_ts;
        self
    }

    pub fn with_column_range(mut self, low: Vec<u8>, high: Vec<u8>) -> Self {
        self.column_range = Some((low, high));
        self
    }

    pub fn with_rpc_timeout(mut self, timeout_ms: u64) -> Self {
        self.rpc_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }

    pub fn with_cache_ttl(mut self, ttl_ms: u64) -> Self {
        self.cache_ttl_ms = ttl_ms;
        self
    }

    /// Build the physical read this parameter describes.
    pub fn build_read(&self, label: &Label, default_timeout_ms: u64) -> Result<ReadRequest> {
        let version = label.schema_version;
        let timeout_ms = self.rpc_timeout_ms.unwrap_or(default_timeout_ms);

        if let Some(tgt) = &self.tgt {
            let id = EdgeId {
                src: self.src.clone(),
                tgt: tgt.clone(),
                label_id: self.label_id,
                dir: self.dir,
            };
            return Ok(ReadRequest::Point(PointGet {
                family: Family::Edge,
                row: SnapshotEdgeCodec::row(&id, version),
                qualifiers: Some(vec![SnapshotEdgeCodec::qualifier(&id, version)]),
            }));
        }

        let index_seq = match self.index_seq {
            Some(seq) => label.index(seq)?.seq,
            None => label.first_index()?.seq,
        };
        let row = IndexEdgeCodec::row(&self.src, self.label_id, self.dir, index_seq, version);
        let (min_qualifier, max_qualifier) = match &self.column_range {
            Some((low, high)) => (Some(low.clone()), Some(high.clone())),
            None => (None, None),
        };

        Ok(ReadRequest::Range(RangeGet {
            family: Family::Edge,
            row,
            min_qualifier,
            max_qualifier,
            offset: 0,
            // Over-fetch to cover the caller's offset and the two counter
            // cells that share the first index row; trimmed after decode.
            limit: self.offset.saturating_add(self.limit).saturating_add(2),
            min_ts: self.min_ts,
            max_ts: self.max_ts,
            timeout_ms,
        }))
    }

    /// Result-cache key: the physical request key plus everything applied
    /// after decode.
    pub fn result_cache_key(&self, physical_key: &[u8]) -> Vec<u8> {
        let mut key = physical_key.to_vec();
        key.extend_from_slice(&(self.offset as u64).to_be_bytes());
        key.extend_from_slice(&(self.limit as u64).to_be_bytes());
        key.push(match self.duplicate_policy {
            DuplicatePolicy::First => 0,
            DuplicatePolicy::Raw => 1,
        });
        key
    }
}

impl std::fmt::Display for QueryParam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.tgt {
            Some(tgt) => write!(
                f,
                "EdgeQuery: src={}, tgt={}, label={}, dir={:?}",
                self.src, tgt, self.label_id, self.dir
            ),
            None => write!(
                f,
                "AdjacencyQuery: src={}, label={}, dir={:?}, offset={}, limit={}",
                self.src, self.label_id, self.dir, self.offset, self.limit
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::model::InnerVal;
    use crate::graph::schema::test_support::friend_label;

    fn src() -> VertexId {
        VertexId::new(1, InnerVal::Long(1))
    }

    #[test]
    fn test_point_read_when_target_present() {
        let label = friend_label();
        let param = QueryParam::new(src(), 10, Direction::Out)
            .with_tgt(VertexId::new(1, InnerVal::Long(2)));
        match param.build_read(&label, 1000).unwrap() {
            ReadRequest::Point(get) => {
                assert_eq!(get.family, Family::Edge);
                assert_eq!(get.qualifiers.as_ref().unwrap().len(), 1);
            }
            other => panic!("expected point read, got {:?}", other),
        }
    }

    #[test]
    fn test_range_read_over_first_index() {
        let label = friend_label();
        let param = QueryParam::new(src(), 10, Direction::Out).with_limit(5).with_offset(3);
        match param.build_read(&label, 1000).unwrap() {
            ReadRequest::Range(scan) => {
                assert_eq!(
                    scan.row,
                    IndexEdgeCodec::row(&src(), 10, Direction::Out, 1, label.schema_version)
                );
                // offset + limit + counter cells
                assert_eq!(scan.limit, 10);
                assert_eq!(scan.offset, 0);
                assert_eq!(scan.timeout_ms, 1000);
            }
            other => panic!("expected range read, got {:?}", other),
        }
    }

    #[test]
    fn test_rpc_timeout_override() {
        let label = friend_label();
        let param = QueryParam::new(src(), 10, Direction::Out).with_rpc_timeout(250);
        match param.build_read(&label, 1000).unwrap() {
            ReadRequest::Range(scan) => assert_eq!(scan.timeout_ms, 250),
            other => panic!("expected range read, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_index_is_rejected() {
        let label = friend_label();
        let param = QueryParam::new(src(), 10, Direction::Out).with_index(9);
        assert!(param.build_read(&label, 1000).is_err());
    }

    #[test]
    fn test_result_cache_key_covers_post_decode_params() {
        let label = friend_label();
        let a = QueryParam::new(src(), 10, Direction::Out).with_limit(5);
        let b = QueryParam::new(src(), 10, Direction::Out).with_limit(6);
        let read_a = a.build_read(&label, 1000).unwrap();
        let read_b = b.build_read(&label, 1000).unwrap();
        // Different limits but also different physical keys here; compare the
        // param layer on a shared physical key to isolate its contribution.
        assert_ne!(a.result_cache_key(b"k"), b.result_cache_key(b"k"));
        assert_ne!(read_a.cache_key(), read_b.cache_key());
    }
}
