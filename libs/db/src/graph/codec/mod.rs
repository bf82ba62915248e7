//! Version-tagged binary layout of graph entities over KV cells.
//!
//! This module is the only place that knows the physical layout; every other
//! component deals in cells and entities. Layout differences between schema
//! versions:
//!
//! - V1 packs vertex ids without the column id and uses u8 string lengths.
//! - V2 adds the column id to packed vertex ids and widens string lengths
//!   to u16.
//! - V3 additionally moves the operation byte and all properties of an
//!   index-edge into the cell value, and promotes the target id into the
//!   snapshot-edge row key.

pub mod index_edge;
pub mod snapshot_edge;
pub mod vertex;

pub use index_edge::IndexEdgeCodec;
pub use snapshot_edge::SnapshotEdgeCodec;
pub use vertex::VertexCodec;

use anyhow::Result;

use super::model::{InnerVal, Props, VertexId};
use super::schema::StorageVersion;

/// Row-key byte marking a snapshot-edge row (index rows use index sequences,
/// which never reach this value).
pub(crate) const SNAPSHOT_MARKER: u8 = 0xFF;

/// Qualifier of the degree counter cell on the first index row.
pub(crate) const DEGREE_QUALIFIER: &[u8] = &[];

/// Qualifier of the count counter cell on the first index row.
pub(crate) const COUNT_QUALIFIER: &[u8] = &[0xFF];

/// Base offset partitioning vertex qualifiers: label-membership qualifiers
/// occupy `LABEL_PROP_KEY_BASE + label_id` and never collide with one-byte
/// property sequences.
pub const LABEL_PROP_KEY_BASE: u16 = 128;

/// Reserved vertex property sequence carrying the last-modified timestamp.
pub(crate) const VERTEX_LAST_MODIFIED_SEQ: u8 = 0;

const VAL_LONG: u8 = 0x01;
const VAL_STR: u8 = 0x02;
const VAL_COMPOSITE: u8 = 0x03;

/// Cursor over cell bytes with length-checked primitive reads.
pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            anyhow::bail!(
                "truncated cell: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.buf.len() - self.pos
            );
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(bytes);
        Ok(u32::from_be_bytes(buf))
    }

    pub fn u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(buf))
    }
}

/// Order-preserving encoding of a signed long: flipping the sign bit makes
/// the big-endian byte order match numeric order.
fn long_to_sortable(v: i64) -> u64 {
    (v as u64) ^ (1 << 63)
}

fn sortable_to_long(v: u64) -> i64 {
    (v ^ (1 << 63)) as i64
}

pub(crate) fn encode_inner_val(buf: &mut Vec<u8>, value: &InnerVal, version: StorageVersion) {
    match value {
        InnerVal::Long(v) => {
            buf.push(VAL_LONG);
            buf.extend_from_slice(&long_to_sortable(*v).to_be_bytes());
        }
        InnerVal::Str(s) => {
            buf.push(VAL_STR);
            match version {
                StorageVersion::V1 => buf.push(s.len() as u8),
                _ => buf.extend_from_slice(&(s.len() as u16).to_be_bytes()),
            }
            buf.extend_from_slice(s.as_bytes());
        }
        InnerVal::Composite(vs) => {
            buf.push(VAL_COMPOSITE);
            buf.push(vs.len() as u8);
            for v in vs {
                encode_inner_val(buf, v, version);
            }
        }
    }
}

pub(crate) fn decode_inner_val(r: &mut ByteReader<'_>, version: StorageVersion) -> Result<InnerVal> {
    match r.u8()? {
        VAL_LONG => Ok(InnerVal::Long(sortable_to_long(r.u64()?))),
        VAL_STR => {
            let len = match version {
                StorageVersion::V1 => r.u8()? as usize,
                _ => r.u16()? as usize,
            };
            let bytes = r.take(len)?;
            Ok(InnerVal::Str(
                std::str::from_utf8(bytes)
                    .map_err(|e| anyhow::anyhow!("invalid utf-8 in string value: {}", e))?
                    .to_string(),
            ))
        }
        VAL_COMPOSITE => {
            let count = r.u8()? as usize;
            let mut vs = Vec::with_capacity(count);
            for _ in 0..count {
                vs.push(decode_inner_val(r, version)?);
            }
            Ok(InnerVal::Composite(vs))
        }
        other => anyhow::bail!("invalid value marker: {:#04x}", other),
    }
}

/// Pack a vertex id. V1 omits the column id (it is recovered from the schema
/// at decode time); V2/V3 carry it.
pub(crate) fn encode_vertex_id(buf: &mut Vec<u8>, id: &VertexId, version: StorageVersion) {
    if version != StorageVersion::V1 {
        buf.extend_from_slice(&id.column_id.to_be_bytes());
    }
    encode_inner_val(buf, &id.inner_id, version);
}

/// Unpack a vertex id. `fallback_column` supplies the column id for V1,
/// which does not store it.
pub(crate) fn decode_vertex_id(
    r: &mut ByteReader<'_>,
    version: StorageVersion,
    fallback_column: u32,
) -> Result<VertexId> {
    let column_id = if version == StorageVersion::V1 {
        fallback_column
    } else {
        r.u32()?
    };
    let inner_id = decode_inner_val(r, version)?;
    Ok(VertexId { column_id, inner_id })
}

/// Props payload: a count byte followed by `(seq, value)` pairs in ascending
/// sequence order (BTreeMap iteration order keeps the encoding canonical,
/// which compare-and-set on snapshot values depends on).
pub(crate) fn encode_props(buf: &mut Vec<u8>, props: &Props, version: StorageVersion) {
    buf.push(props.len() as u8);
    for (seq, value) in props {
        buf.push(*seq);
        encode_inner_val(buf, value, version);
    }
}

pub(crate) fn decode_props(r: &mut ByteReader<'_>, version: StorageVersion) -> Result<Props> {
    let count = r.u8()? as usize;
    let mut props = Props::new();
    for _ in 0..count {
        let seq = r.u8()?;
        props.insert(seq, decode_inner_val(r, version)?);
    }
    Ok(props)
}
