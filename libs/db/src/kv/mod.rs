//! Wide-column KV model.
//!
//! The store exposes HBase-style cells: a row holds many qualifiers, each
//! qualifier a value with a server-side timestamp. Qualifier order within a
//! row is lexicographic and is the adjacency sort order the graph layer
//! relies on.
//!
//! All physical layout above the cell level (what goes into rows, qualifiers
//! and values) belongs to the graph codecs; this module only knows bytes.

mod client;
mod rocks;

pub use client::Client;
pub use rocks::{Store, StoreMetrics};

use anyhow::Result;

/// Column family for vertex rows.
pub const VERTEX_CF: &str = "graph/vertices";
/// Column family for edge rows (index-edges, snapshot-edges, counters).
pub const EDGE_CF: &str = "graph/edges";

/// Logical cell family. Maps onto a RocksDB column family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Vertex,
    Edge,
}

impl Family {
    pub fn cf_name(self) -> &'static str {
        match self {
            Family::Vertex => VERTEX_CF,
            Family::Edge => EDGE_CF,
        }
    }

    fn tag(self) -> u8 {
        match self {
            Family::Vertex => 0,
            Family::Edge => 1,
        }
    }
}

/// A single cell as returned by reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub row: Vec<u8>,
    pub qualifier: Vec<u8>,
    pub value: Vec<u8>,
    pub ts: u64,
}

/// Marker distinguishing the two kinds of atomic counter a cell can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementKind {
    Degree,
    Count,
}

/// A write-side operation, produced by the mutation builder and consumed by
/// a single dispatcher in the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    Put {
        family: Family,
        row: Vec<u8>,
        qualifier: Vec<u8>,
        value: Vec<u8>,
        ts: u64,
    },
    Delete {
        family: Family,
        row: Vec<u8>,
        qualifier: Vec<u8>,
        ts: u64,
    },
    /// Remove every qualifier of a row.
    DeleteRow {
        family: Family,
        row: Vec<u8>,
        ts: u64,
    },
    Increment {
        family: Family,
        row: Vec<u8>,
        qualifier: Vec<u8>,
        amount: i64,
        kind: IncrementKind,
    },
}

/// A point read of one row, optionally restricted to specific qualifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointGet {
    pub family: Family,
    pub row: Vec<u8>,
    pub qualifiers: Option<Vec<Vec<u8>>>,
}

/// A ranged read over the qualifiers of one row.
///
/// `min_qualifier`/`max_qualifier` are inclusive bounds; `min_ts`/`max_ts`
/// bound the cell timestamp as `min_ts <= ts < max_ts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeGet {
    pub family: Family,
    pub row: Vec<u8>,
    pub min_qualifier: Option<Vec<u8>>,
    pub max_qualifier: Option<Vec<u8>>,
    pub offset: usize,
    pub limit: usize,
    pub min_ts: u64,
    pub max_ts: u64,
    pub timeout_ms: u64,
}

/// A read request as handed to the fetch path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadRequest {
    Point(PointGet),
    Range(RangeGet),
}

impl ReadRequest {
    /// Content-addressed cache key covering the full physical request.
    ///
    /// Every field that changes what the store would return (bounds, limits,
    /// timestamp window, timeout) participates, so two requests coalesce only
    /// when they are byte-identical. The full byte string is kept rather than
    /// a short hash.
    pub fn cache_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(64);
        match self {
            ReadRequest::Point(get) => {
                key.push(0u8);
                key.push(get.family.tag());
                push_chunk(&mut key, &get.row);
                match &get.qualifiers {
                    None => key.push(0),
                    Some(qs) => {
                        key.push(qs.len() as u8);
                        for q in qs {
                            push_chunk(&mut key, q);
                        }
                    }
                }
            }
            ReadRequest::Range(scan) => {
                key.push(1u8);
                key.push(scan.family.tag());
                push_chunk(&mut key, &scan.row);
                push_opt_chunk(&mut key, scan.min_qualifier.as_deref());
                push_opt_chunk(&mut key, scan.max_qualifier.as_deref());
                key.extend_from_slice(&(scan.offset as u64).to_be_bytes());
                key.extend_from_slice(&(scan.limit as u64).to_be_bytes());
                key.extend_from_slice(&scan.min_ts.to_be_bytes());
                key.extend_from_slice(&scan.max_ts.to_be_bytes());
                key.extend_from_slice(&scan.timeout_ms.to_be_bytes());
            }
        }
        key
    }
}

fn push_chunk(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn push_opt_chunk(buf: &mut Vec<u8>, bytes: Option<&[u8]>) {
    match bytes {
        None => buf.push(0),
        Some(b) => {
            buf.push(1);
            push_chunk(buf, b);
        }
    }
}

/// Wire encoding of an increment amount: a one-byte marker followed by the
/// amount as an 8-byte big-endian signed integer.
pub const INCREMENT_MARKER_DEGREE: u8 = 0x01;
pub const INCREMENT_MARKER_COUNT: u8 = 0x02;

pub fn encode_increment(kind: IncrementKind, amount: i64) -> [u8; 9] {
    let mut out = [0u8; 9];
    out[0] = match kind {
        IncrementKind::Degree => INCREMENT_MARKER_DEGREE,
        IncrementKind::Count => INCREMENT_MARKER_COUNT,
    };
    out[1..9].copy_from_slice(&amount.to_be_bytes());
    out
}

pub fn decode_increment(bytes: &[u8]) -> Result<(IncrementKind, i64)> {
    if bytes.len() != 9 {
        anyhow::bail!("invalid increment encoding: expected 9 bytes, got {}", bytes.len());
    }
    let kind = match bytes[0] {
        INCREMENT_MARKER_DEGREE => IncrementKind::Degree,
        INCREMENT_MARKER_COUNT => IncrementKind::Count,
        other => anyhow::bail!("invalid increment marker: {:#04x}", other),
    };
    let mut amount = [0u8; 8];
    amount.copy_from_slice(&bytes[1..9]);
    Ok((kind, i64::from_be_bytes(amount)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(row: &[u8], limit: usize, timeout_ms: u64) -> ReadRequest {
        ReadRequest::Range(RangeGet {
            family: Family::Edge,
            row: row.to_vec(),
            min_qualifier: None,
            max_qualifier: None,
            offset: 0,
            limit,
            min_ts: 0,
            max_ts: u64::MAX,
            timeout_ms,
        })
    }

    #[test]
    fn test_cache_key_identical_requests_match() {
        assert_eq!(range(b"r1", 10, 500).cache_key(), range(b"r1", 10, 500).cache_key());
    }

    #[test]
    fn test_cache_key_differs_by_timeout() {
        // Requests with different RPC timeouts must never coalesce.
        assert_ne!(range(b"r1", 10, 500).cache_key(), range(b"r1", 10, 900).cache_key());
    }

    #[test]
    fn test_cache_key_differs_by_bounds() {
        assert_ne!(range(b"r1", 10, 500).cache_key(), range(b"r1", 11, 500).cache_key());
        assert_ne!(range(b"r1", 10, 500).cache_key(), range(b"r2", 10, 500).cache_key());
    }

    #[test]
    fn test_cache_key_point_vs_range() {
        let point = ReadRequest::Point(PointGet {
            family: Family::Edge,
            row: b"r1".to_vec(),
            qualifiers: None,
        });
        assert_ne!(point.cache_key(), range(b"r1", 10, 500).cache_key());
    }

    #[test]
    fn test_increment_roundtrip() {
        for (kind, amount) in [
            (IncrementKind::Degree, 1i64),
            (IncrementKind::Degree, -1),
            (IncrementKind::Count, 42),
            (IncrementKind::Count, i64::MIN),
        ] {
            let encoded = encode_increment(kind, amount);
            let (k, a) = decode_increment(&encoded).unwrap();
            assert_eq!(k, kind);
            assert_eq!(a, amount);
        }
    }

    #[test]
    fn test_increment_rejects_bad_marker() {
        let mut bytes = encode_increment(IncrementKind::Degree, 1);
        bytes[0] = 0x7f;
        assert!(decode_increment(&bytes).is_err());
    }
}
