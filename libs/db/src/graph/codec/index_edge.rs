//! Index-edge codec.
//!
//! One row per `(source vertex, label, direction, index)`; each edge of the
//! adjacency set is a qualifier whose leading bytes are the indexed property
//! tuple, so qualifier order is index order. The degree counter lives on the
//! first index row under the empty qualifier; the count counter under the
//! `0xFF` qualifier.

use anyhow::{Context, Result};

use super::{
    decode_props, decode_vertex_id, encode_inner_val, encode_vertex_id, ByteReader,
    COUNT_QUALIFIER, DEGREE_QUALIFIER,
};
use crate::graph::model::{Direction, Edge, IndexEdge, Op, Props, VertexId};
use crate::graph::schema::{Label, StorageVersion};
use crate::kv::Cell;

pub struct IndexEdgeCodec;

impl IndexEdgeCodec {
    /// Row key of an index row: `[source][label][dir][index_seq]`.
    pub fn row(src: &VertexId, label_id: u32, dir: Direction, index_seq: u8, version: StorageVersion) -> Vec<u8> {
        let mut row = Vec::with_capacity(24);
        encode_vertex_id(&mut row, src, version);
        row.extend_from_slice(&label_id.to_be_bytes());
        row.push(dir.as_u8());
        row.push(index_seq);
        row
    }

    /// Row carrying the degree and count counter cells.
    pub fn counter_row(label: &Label, src: &VertexId, dir: Direction) -> Result<Vec<u8>> {
        let first = label.first_index()?;
        Ok(Self::row(src, label.id, dir, first.seq, label.schema_version))
    }

    pub fn is_degree_cell(cell: &Cell) -> bool {
        cell.qualifier == DEGREE_QUALIFIER
    }

    pub fn is_count_cell(cell: &Cell) -> bool {
        cell.qualifier == COUNT_QUALIFIER
    }

    pub fn encode(index_edge: &IndexEdge, label: &Label) -> Result<Cell> {
        let version = label.schema_version;
        let edge = &index_edge.edge;
        let index = label.index(index_edge.index_seq)?;

        // Indexed values in declared order; absent ones fall back to the
        // meta's default.
        let mut indexed: Vec<(u8, &crate::graph::model::InnerVal)> = Vec::with_capacity(index.meta_seqs.len());
        for seq in &index.meta_seqs {
            match edge.props.get(seq) {
                Some(value) => indexed.push((*seq, value)),
                None => {
                    let meta = label.meta(*seq)?;
                    let default = meta.default_value.as_ref().with_context(|| {
                        format!(
                            "edge missing indexed prop '{}' (seq {}) and no default declared",
                            meta.name, seq
                        )
                    })?;
                    indexed.push((*seq, default));
                }
            }
        }

        let mut qualifier = Vec::with_capacity(24);
        qualifier.push(indexed.len() as u8);
        for &(seq, value) in &indexed {
            qualifier.push(seq);
            encode_inner_val(&mut qualifier, value, version);
        }
        encode_vertex_id(&mut qualifier, &edge.tgt, version);

        let mut value = Vec::new();
        match version {
            StorageVersion::V3 => {
                // V3 keeps the qualifier purely positional: op and the full
                // props payload (defaulted indexed values included) live in
                // the value.
                value.push(edge.op.as_u8());
                let mut full = edge.props.clone();
                for &(seq, default) in &indexed {
                    full.entry(seq).or_insert_with(|| default.clone());
                }
                super::encode_props(&mut value, &full, version);
            }
            _ => {
                qualifier.push(edge.op.as_u8());
                let others: Props = edge
                    .props
                    .iter()
                    .filter(|(seq, _)| !index.meta_seqs.contains(seq))
                    .map(|(seq, v)| (*seq, v.clone()))
                    .collect();
                super::encode_props(&mut value, &others, version);
            }
        }

        Ok(Cell {
            row: Self::row(&edge.src, edge.label_id, edge.dir, index_edge.index_seq, version),
            qualifier,
            value,
            ts: edge.ts,
        })
    }

    /// Decode one adjacency cell back into an edge. Counter cells must be
    /// filtered out by the caller before decoding.
    pub fn decode(cell: &Cell, label: &Label) -> Result<Edge> {
        let version = label.schema_version;

        let mut row = ByteReader::new(&cell.row);
        // V1 rows do not carry the column id; it is recovered from the label
        // once the direction is known.
        let (row_column, inner_id) = if version == StorageVersion::V1 {
            (None, super::decode_inner_val(&mut row, version)?)
        } else {
            let column = row.u32()?;
            (Some(column), super::decode_inner_val(&mut row, version)?)
        };
        let label_id = row.u32()?;
        if label_id != label.id {
            anyhow::bail!("cell label {} does not match label {}", label_id, label.id);
        }
        let dir = Direction::from_u8(row.u8()?)?;
        let index_seq = row.u8()?;
        label.index(index_seq)?;
        if !row.is_empty() {
            anyhow::bail!("trailing bytes in index-edge row");
        }

        let (src_fallback, tgt_fallback) = match dir {
            Direction::Out => (label.src_column_id, label.tgt_column_id),
            Direction::In => (label.tgt_column_id, label.src_column_id),
        };
        let src = VertexId {
            column_id: row_column.unwrap_or(src_fallback),
            inner_id,
        };

        let mut qualifier = ByteReader::new(&cell.qualifier);
        let indexed = decode_props(&mut qualifier, version)?;
        let tgt = decode_vertex_id(&mut qualifier, version, tgt_fallback)?;

        let (op, props) = match version {
            StorageVersion::V3 => {
                if !qualifier.is_empty() {
                    anyhow::bail!("trailing bytes in index-edge qualifier");
                }
                let mut value = ByteReader::new(&cell.value);
                let op = Op::from_u8(value.u8()?)?;
                let props = decode_props(&mut value, version)?;
                (op, props)
            }
            _ => {
                let op = Op::from_u8(qualifier.u8()?)?;
                if !qualifier.is_empty() {
                    anyhow::bail!("trailing bytes in index-edge qualifier");
                }
                let mut value = ByteReader::new(&cell.value);
                let mut props = decode_props(&mut value, version)?;
                props.extend(indexed);
                (op, props)
            }
        };

        Ok(Edge {
            src,
            tgt,
            label_id,
            dir,
            ts: cell.ts,
            op,
            props,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::model::{IndexEdge, InnerVal};
    use crate::graph::schema::test_support::friend_label;
    use crate::graph::schema::{ConsistencyLevel, StorageVersion};

    fn label_with_version(version: StorageVersion) -> Label {
        let mut label = friend_label();
        label.schema_version = version;
        label.consistency = ConsistencyLevel::Strong;
        label
    }

    fn sample_edge(label: &Label) -> Edge {
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
        edge
    }

    #[test]
    fn test_index_edge_roundtrip_all_versions() {
        for version in [StorageVersion::V1, StorageVersion::V2, StorageVersion::V3] {
            let label = label_with_version(version);
            let edge = sample_edge(&label);
            let cell = IndexEdgeCodec::encode(&IndexEdge::new(edge.clone(), 1), &label).unwrap();
            let decoded = IndexEdgeCodec::decode(&cell, &label).unwrap();
            assert_eq!(decoded, edge, "version {:?}", version);
        }
    }

    #[test]
    fn test_reversed_edge_roundtrip() {
        let label = label_with_version(StorageVersion::V3);
        let edge = sample_edge(&label).reversed();
        let cell = IndexEdgeCodec::encode(&IndexEdge::new(edge.clone(), 1), &label).unwrap();
        let decoded = IndexEdgeCodec::decode(&cell, &label).unwrap();
        assert_eq!(decoded, edge);
        assert_eq!(decoded.dir, Direction::In);
    }

    #[test]
    fn test_missing_indexed_prop_uses_default() {
        let label = label_with_version(StorageVersion::V3);
        let mut edge = sample_edge(&label);
        edge.props.remove(&1);
        let cell = IndexEdgeCodec::encode(&IndexEdge::new(edge, 1), &label).unwrap();
        let decoded = IndexEdgeCodec::decode(&cell, &label).unwrap();
        assert_eq!(decoded.props.get(&1), Some(&InnerVal::Long(0)));
    }

    #[test]
    fn test_qualifier_sorts_by_indexed_value() {
        let label = label_with_version(StorageVersion::V3);
        let mut early = sample_edge(&label);
        early.props.insert(1, InnerVal::Long(10));
        let mut late = sample_edge(&label);
        late.props.insert(1, InnerVal::Long(20));

        let early_cell = IndexEdgeCodec::encode(&IndexEdge::new(early, 1), &label).unwrap();
        let late_cell = IndexEdgeCodec::encode(&IndexEdge::new(late, 1), &label).unwrap();
        assert!(early_cell.qualifier < late_cell.qualifier);
        assert_eq!(early_cell.row, late_cell.row);
    }

    #[test]
    fn test_decode_rejects_wrong_label() {
        let label = label_with_version(StorageVersion::V3);
        let mut other = label_with_version(StorageVersion::V3);
        other.id = 99;
        let cell = IndexEdgeCodec::encode(&IndexEdge::new(sample_edge(&label), 1), &label).unwrap();
        assert!(IndexEdgeCodec::decode(&cell, &other).is_err());
    }

    #[test]
    fn test_counter_row_is_first_index_row() {
        let label = label_with_version(StorageVersion::V3);
        let src = VertexId::new(1, InnerVal::Long(1));
        let row = IndexEdgeCodec::counter_row(&label, &src, Direction::Out).unwrap();
        assert_eq!(
            row,
            IndexEdgeCodec::row(&src, label.id, Direction::Out, 1, label.schema_version)
        );
    }
}
