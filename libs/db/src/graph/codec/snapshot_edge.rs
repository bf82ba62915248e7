//! Snapshot-edge codec.
//!
//! One cell per edge identity holding the authoritative property state, the
//! operation tag, and the optional lock sentinel. The encoded value bytes
//! are the unit of compare-and-set, so the encoding must be canonical:
//! identical logical state always yields identical bytes.
//!
//! V1/V2 place the target id in the qualifier; V3 promotes it into the row
//! key and leaves the qualifier empty.

use anyhow::Result;

use super::{
    decode_props, decode_vertex_id, encode_props, encode_vertex_id, ByteReader, SNAPSHOT_MARKER,
};
use crate::graph::model::{Direction, Edge, EdgeId, LockState, Op, SnapshotEdge};
use crate::graph::schema::{Label, StorageVersion};
use crate::kv::Cell;

const LOCK_ABSENT: u8 = 0x00;
const LOCK_PRESENT: u8 = 0x01;

pub struct SnapshotEdgeCodec;

impl SnapshotEdgeCodec {
    /// Row key of the snapshot cell for a (normalized) edge identity.
    pub fn row(id: &EdgeId, version: StorageVersion) -> Vec<u8> {
        let id = id.normalized();
        let mut row = Vec::with_capacity(32);
        encode_vertex_id(&mut row, &id.src, version);
        row.extend_from_slice(&id.label_id.to_be_bytes());
        row.push(SNAPSHOT_MARKER);
        if version == StorageVersion::V3 {
            encode_vertex_id(&mut row, &id.tgt, version);
        }
        row
    }

    pub fn qualifier(id: &EdgeId, version: StorageVersion) -> Vec<u8> {
        let id = id.normalized();
        match version {
            StorageVersion::V3 => Vec::new(),
            _ => {
                let mut qualifier = Vec::with_capacity(16);
                encode_vertex_id(&mut qualifier, &id.tgt, version);
                qualifier
            }
        }
    }

    /// Canonical value bytes: `[op][props][lock]`. These are the bytes the
    /// commit protocol CASes on.
    pub fn encode_value(snapshot: &SnapshotEdge, version: StorageVersion) -> Vec<u8> {
        let mut value = Vec::with_capacity(32);
        value.push(snapshot.edge.op.as_u8());
        encode_props(&mut value, &snapshot.edge.props, version);
        match &snapshot.lock {
            None => value.push(LOCK_ABSENT),
            Some(lock) => {
                value.push(LOCK_PRESENT);
                value.extend_from_slice(&lock.lock_ts.to_be_bytes());
                value.extend_from_slice(&(lock.pending.len() as u16).to_be_bytes());
                value.extend_from_slice(&lock.pending);
            }
        }
        value
    }

    pub fn encode(snapshot: &SnapshotEdge, label: &Label) -> Cell {
        let version = label.schema_version;
        let id = snapshot.edge.id();
        Cell {
            row: Self::row(&id, version),
            qualifier: Self::qualifier(&id, version),
            value: Self::encode_value(snapshot, version),
            ts: snapshot.edge.ts,
        }
    }

    pub fn decode(cell: &Cell, label: &Label) -> Result<SnapshotEdge> {
        let version = label.schema_version;

        let mut row = ByteReader::new(&cell.row);
        let src = decode_vertex_id(&mut row, version, label.src_column_id)?;
        let label_id = row.u32()?;
        if label_id != label.id {
            anyhow::bail!("cell label {} does not match label {}", label_id, label.id);
        }
        let marker = row.u8()?;
        if marker != SNAPSHOT_MARKER {
            anyhow::bail!("not a snapshot-edge row (marker {:#04x})", marker);
        }
        let tgt = match version {
            StorageVersion::V3 => {
                let tgt = decode_vertex_id(&mut row, version, label.tgt_column_id)?;
                if !row.is_empty() {
                    anyhow::bail!("trailing bytes in snapshot-edge row");
                }
                tgt
            }
            _ => {
                let mut qualifier = ByteReader::new(&cell.qualifier);
                let tgt = decode_vertex_id(&mut qualifier, version, label.tgt_column_id)?;
                if !qualifier.is_empty() {
                    anyhow::bail!("trailing bytes in snapshot-edge qualifier");
                }
                tgt
            }
        };

        let (op, props, lock) = Self::decode_value(&cell.value, version)?;

        Ok(SnapshotEdge {
            edge: Edge {
                src,
                tgt,
                label_id,
                dir: Direction::Out,
                ts: cell.ts,
                op,
                props,
            },
            lock,
        })
    }

    pub fn decode_value(
        bytes: &[u8],
        version: StorageVersion,
    ) -> Result<(Op, crate::graph::model::Props, Option<LockState>)> {
        let mut r = ByteReader::new(bytes);
        let op = Op::from_u8(r.u8()?)?;
        let props = decode_props(&mut r, version)?;
        let lock = match r.u8()? {
            LOCK_ABSENT => None,
            LOCK_PRESENT => {
                let lock_ts = r.u64()?;
                let pending_len = r.u16()? as usize;
                let pending = r.take(pending_len)?.to_vec();
                Some(LockState { lock_ts, pending })
            }
            other => anyhow::bail!("invalid lock marker: {:#04x}", other),
        };
        if !r.is_empty() {
            anyhow::bail!("trailing bytes in snapshot-edge value");
        }
        Ok((op, props, lock))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::model::{InnerVal, VertexId};
    use crate::graph::schema::test_support::friend_label;

    fn label_with_version(version: StorageVersion) -> Label {
        let mut label = friend_label();
        label.schema_version = version;
        label
    }

    fn sample_snapshot(label: &Label) -> SnapshotEdge {
        let mut edge = Edge::new(
            VertexId::new(label.src_column_id, InnerVal::Long(1)),
            VertexId::new(label.tgt_column_id, InnerVal::Long(2)),
            label.id,
            Direction::Out,
            1000,
            Op::Insert,
        );
        edge.props.insert(1, InnerVal::Long(2020));
        edge.props.insert(2, InnerVal::Str("memo".into()));
        SnapshotEdge::from_edge(edge)
    }

    #[test]
    fn test_snapshot_roundtrip_all_versions() {
        for version in [StorageVersion::V1, StorageVersion::V2, StorageVersion::V3] {
            let label = label_with_version(version);
            let snapshot = sample_snapshot(&label);
            let cell = SnapshotEdgeCodec::encode(&snapshot, &label);
            let decoded = SnapshotEdgeCodec::decode(&cell, &label).unwrap();
            assert_eq!(decoded, snapshot, "version {:?}", version);
        }
    }

    #[test]
    fn test_locked_snapshot_roundtrip() {
        let label = label_with_version(StorageVersion::V3);
        let mut snapshot = sample_snapshot(&label);
        snapshot.lock = Some(LockState {
            lock_ts: 2000,
            pending: vec![1, 2, 3],
        });
        let cell = SnapshotEdgeCodec::encode(&snapshot, &label);
        let decoded = SnapshotEdgeCodec::decode(&cell, &label).unwrap();
        assert_eq!(decoded.lock, snapshot.lock);
    }

    #[test]
    fn test_v3_row_contains_target() {
        let v2 = label_with_version(StorageVersion::V2);
        let v3 = label_with_version(StorageVersion::V3);
        let id = sample_snapshot(&v3).edge.id();

        assert!(SnapshotEdgeCodec::row(&id, v3.schema_version).len()
            > SnapshotEdgeCodec::row(&id, v2.schema_version).len());
        assert!(SnapshotEdgeCodec::qualifier(&id, v3.schema_version).is_empty());
        assert!(!SnapshotEdgeCodec::qualifier(&id, v2.schema_version).is_empty());
    }

    #[test]
    fn test_row_is_direction_normalized() {
        let label = label_with_version(StorageVersion::V3);
        let forward = sample_snapshot(&label).edge;
        let mirrored = forward.reversed();
        assert_eq!(
            SnapshotEdgeCodec::row(&forward.id(), label.schema_version),
            SnapshotEdgeCodec::row(&mirrored.id(), label.schema_version)
        );
    }

    #[test]
    fn test_canonical_value_bytes() {
        // CAS correctness requires identical state -> identical bytes.
        let label = label_with_version(StorageVersion::V3);
        let a = sample_snapshot(&label);
        let b = sample_snapshot(&label);
        assert_eq!(
            SnapshotEdgeCodec::encode_value(&a, label.schema_version),
            SnapshotEdgeCodec::encode_value(&b, label.schema_version)
        );
    }

    #[test]
    fn test_tombstone_roundtrip() {
        let label = label_with_version(StorageVersion::V3);
        let mut snapshot = sample_snapshot(&label);
        snapshot.edge.op = Op::Delete;
        snapshot.edge.props.clear();
        let cell = SnapshotEdgeCodec::encode(&snapshot, &label);
        let decoded = SnapshotEdgeCodec::decode(&cell, &label).unwrap();
        assert_eq!(decoded.edge.op, Op::Delete);
        assert!(decoded.edge.props.is_empty());
    }
}
