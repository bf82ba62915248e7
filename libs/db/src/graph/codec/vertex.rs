//! Vertex codec.
//!
//! A vertex is one row holding one qualifier per property. Regular
//! properties use the one-byte meta sequence as qualifier; label-membership
//! qualifiers are two bytes at `LABEL_PROP_KEY_BASE + label_id`, partitioning
//! the keyspace. The reserved sequence 0 always carries the last-modified
//! timestamp so a vertex without user properties still has a presence cell.

use anyhow::Result;

use super::{
    decode_inner_val, encode_inner_val, ByteReader, LABEL_PROP_KEY_BASE, VERTEX_LAST_MODIFIED_SEQ,
};
use crate::graph::model::{InnerVal, Op, Props, Vertex, VertexId};
use crate::graph::schema::{ServiceColumn, StorageVersion};
use crate::kv::Cell;

pub struct VertexCodec;

impl VertexCodec {
    pub fn row(id: &VertexId, version: StorageVersion) -> Vec<u8> {
        let mut row = Vec::with_capacity(16);
        // Vertex rows always carry the column id; only inner-id widths are
        // version-dependent.
        row.extend_from_slice(&id.column_id.to_be_bytes());
        encode_inner_val(&mut row, &id.inner_id, version);
        row
    }

    pub fn decode_row(row: &[u8], version: StorageVersion) -> Result<VertexId> {
        let mut r = ByteReader::new(row);
        let column_id = r.u32()?;
        let inner_id = decode_inner_val(&mut r, version)?;
        if !r.is_empty() {
            anyhow::bail!("trailing bytes in vertex row");
        }
        Ok(VertexId { column_id, inner_id })
    }

    pub fn prop_qualifier(seq: u8) -> Vec<u8> {
        vec![seq]
    }

    pub fn belongs_to_qualifier(label_id: u32) -> Vec<u8> {
        (LABEL_PROP_KEY_BASE + label_id as u16).to_be_bytes().to_vec()
    }

    /// Encode a vertex into its cells, including the reserved last-modified
    /// cell and one membership cell per belongs-to label id.
    pub fn encode(vertex: &Vertex, version: StorageVersion) -> Vec<Cell> {
        let row = Self::row(&vertex.id, version);
        let mut cells = Vec::with_capacity(vertex.props.len() + vertex.belongs_to.len() + 1);

        let mut last_modified = Vec::new();
        encode_inner_val(&mut last_modified, &InnerVal::Long(vertex.ts as i64), version);
        cells.push(Cell {
            row: row.clone(),
            qualifier: Self::prop_qualifier(VERTEX_LAST_MODIFIED_SEQ),
            value: last_modified,
            ts: vertex.ts,
        });

        for (seq, value) in &vertex.props {
            if *seq == VERTEX_LAST_MODIFIED_SEQ {
                continue;
            }
            let mut buf = Vec::new();
            encode_inner_val(&mut buf, value, version);
            cells.push(Cell {
                row: row.clone(),
                qualifier: Self::prop_qualifier(*seq),
                value: buf,
                ts: vertex.ts,
            });
        }

        for label_id in &vertex.belongs_to {
            let mut buf = Vec::new();
            encode_inner_val(&mut buf, &InnerVal::Long(vertex.ts as i64), version);
            cells.push(Cell {
                row: row.clone(),
                qualifier: Self::belongs_to_qualifier(*label_id),
                value: buf,
                ts: vertex.ts,
            });
        }

        cells
    }

    /// Reconstruct a vertex from the cells of its row. Returns `None` when
    /// the row is empty (vertex absent).
    pub fn decode(cells: &[Cell], column: &ServiceColumn) -> Result<Option<Vertex>> {
        let Some(first) = cells.first() else {
            return Ok(None);
        };
        let version = column.schema_version;
        let id = Self::decode_row(&first.row, version)?;
        if !column.value_type.matches(&id.inner_id) {
            anyhow::bail!(
                "vertex inner id {} does not match column '{}' type",
                id.inner_id,
                column.column_name
            );
        }

        let mut props = Props::new();
        let mut belongs_to = Vec::new();
        let mut ts = 0u64;
        for cell in cells {
            ts = ts.max(cell.ts);
            match cell.qualifier.len() {
                1 => {
                    let seq = cell.qualifier[0];
                    let mut r = ByteReader::new(&cell.value);
                    let value = decode_inner_val(&mut r, version)?;
                    if seq != VERTEX_LAST_MODIFIED_SEQ {
                        props.insert(seq, value);
                    }
                }
                2 => {
                    let packed = u16::from_be_bytes([cell.qualifier[0], cell.qualifier[1]]);
                    if packed < LABEL_PROP_KEY_BASE {
                        anyhow::bail!("invalid vertex qualifier {:#06x}", packed);
                    }
                    belongs_to.push((packed - LABEL_PROP_KEY_BASE) as u32);
                }
                other => anyhow::bail!("invalid vertex qualifier length {}", other),
            }
        }
        belongs_to.sort_unstable();

        Ok(Some(Vertex {
            id,
            ts,
            op: Op::Insert,
            props,
            belongs_to,
        }))
    }
}
