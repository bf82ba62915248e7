//! Graph entities and the operation builder.
//!
//! Everything here is plain data: the physical layout of these types lives in
//! the codecs, and the KV operations derived from them in the mutation
//! builder.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::schema::Label;

/// A typed property value. Longs use an order-preserving big-endian encoding
/// so that indexed adjacency sorts numerically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InnerVal {
    Long(i64),
    Str(String),
    Composite(Vec<InnerVal>),
}

impl InnerVal {
    pub fn long(v: i64) -> Self {
        InnerVal::Long(v)
    }

    pub fn str(v: impl Into<String>) -> Self {
        InnerVal::Str(v.into())
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            InnerVal::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            InnerVal::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for InnerVal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InnerVal::Long(v) => write!(f, "{}", v),
            InnerVal::Str(s) => write!(f, "{}", s),
            InnerVal::Composite(vs) => {
                write!(f, "(")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Properties keyed by label-meta (or column-meta) sequence.
pub type Props = BTreeMap<u8, InnerVal>;

/// Vertex identity: a schema column plus a typed inner id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexId {
    pub column_id: u32,
    pub inner_id: InnerVal,
}

impl VertexId {
    pub fn new(column_id: u32, inner_id: InnerVal) -> Self {
        Self { column_id, inner_id }
    }
}

impl std::fmt::Display for VertexId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.column_id, self.inner_id)
    }
}

/// Edge direction. An edge physically exists in both directions as two
/// mirrored representations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    Out,
    In,
}

impl Direction {
    pub fn as_u8(self) -> u8 {
        match self {
            Direction::Out => 0,
            Direction::In => 1,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Direction::Out),
            1 => Ok(Direction::In),
            other => anyhow::bail!("invalid direction byte: {}", other),
        }
    }

    pub fn flip(self) -> Self {
        match self {
            Direction::Out => Direction::In,
            Direction::In => Direction::Out,
        }
    }
}

/// Operation tag, carried as a single byte per entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Insert,
    Delete,
    Update,
    DeleteAll,
    InsertBulk,
}

impl Op {
    pub fn as_u8(self) -> u8 {
        match self {
            Op::Insert => 0,
            Op::Delete => 1,
            Op::Update => 2,
            Op::DeleteAll => 3,
            Op::InsertBulk => 4,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Op::Insert),
            1 => Ok(Op::Delete),
            2 => Ok(Op::Update),
            3 => Ok(Op::DeleteAll),
            4 => Ok(Op::InsertBulk),
            other => anyhow::bail!("invalid operation byte: {}", other),
        }
    }

    pub fn is_delete(self) -> bool {
        matches!(self, Op::Delete | Op::DeleteAll)
    }
}

/// A vertex with its properties and optional "belongs-to" label memberships.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vertex {
    pub id: VertexId,
    pub ts: u64,
    pub op: Op,
    pub props: Props,
    /// Ids of edge-labels this vertex participates in as source.
    pub belongs_to: Vec<u32>,
}

impl Vertex {
    pub fn new(id: VertexId, ts: u64, op: Op) -> Self {
        Self {
            id,
            ts,
            op,
            props: Props::new(),
            belongs_to: Vec::new(),
        }
    }
}

/// Edge identity: `(src, tgt, label, direction)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EdgeId {
    pub src: VertexId,
    pub tgt: VertexId,
    pub label_id: u32,
    pub dir: Direction,
}

impl EdgeId {
    /// Canonical form: in-direction identities are flipped so one snapshot
    /// row serves both mirrored representations.
    pub fn normalized(&self) -> EdgeId {
        match self.dir {
            Direction::Out => self.clone(),
            Direction::In => EdgeId {
                src: self.tgt.clone(),
                tgt: self.src.clone(),
                label_id: self.label_id,
                dir: Direction::Out,
            },
        }
    }
}

impl std::fmt::Display for EdgeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-[{}:{:?}]->{}", self.src, self.label_id, self.dir, self.tgt)
    }
}

/// A labeled directed edge with properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub src: VertexId,
    pub tgt: VertexId,
    pub label_id: u32,
    pub dir: Direction,
    pub ts: u64,
    pub op: Op,
    pub props: Props,
}

impl Edge {
    pub fn new(src: VertexId, tgt: VertexId, label_id: u32, dir: Direction, ts: u64, op: Op) -> Self {
        Self {
            src,
            tgt,
            label_id,
            dir,
            ts,
            op,
            props: Props::new(),
        }
    }

    pub fn with_props(mut self, props: Props) -> Self {
        self.props = props;
        self
    }

    pub fn id(&self) -> EdgeId {
        EdgeId {
            src: self.src.clone(),
            tgt: self.tgt.clone(),
            label_id: self.label_id,
            dir: self.dir,
        }
    }

    /// The mirrored representation of this edge.
    pub fn reversed(&self) -> Edge {
        Edge {
            src: self.tgt.clone(),
            tgt: self.src.clone(),
            label_id: self.label_id,
            dir: self.dir.flip(),
            ts: self.ts,
            op: self.op,
            props: self.props.clone(),
        }
    }

    /// Canonical out-direction form of this edge.
    pub fn normalized(&self) -> Edge {
        match self.dir {
            Direction::Out => self.clone(),
            Direction::In => self.reversed(),
        }
    }
}

/// Lock sentinel stored in a snapshot-edge while a strong write is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockState {
    /// Timestamp of the writer holding the lock.
    pub lock_ts: u64,
    /// Encoded snapshot value of the pending write, used by the self-retry
    /// rule to recognize the writer's own earlier attempt.
    pub pending: Vec<u8>,
}

/// Authoritative single-row representation of an edge's current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEdge {
    pub edge: Edge,
    pub lock: Option<LockState>,
}

impl SnapshotEdge {
    pub fn from_edge(edge: Edge) -> Self {
        Self { edge, lock: None }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }
}

/// One per-index presence of an edge in its sorted adjacency list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEdge {
    pub edge: Edge,
    pub index_seq: u8,
}

impl IndexEdge {
    pub fn new(edge: Edge, index_seq: u8) -> Self {
        Self { edge, index_seq }
    }
}

/// The delta produced by the operation builder.
#[derive(Debug, Clone, Default)]
pub struct EdgeMutate {
    pub edges_to_insert: Vec<IndexEdge>,
    pub edges_to_delete: Vec<IndexEdge>,
    pub new_snapshot: Option<SnapshotEdge>,
}

impl EdgeMutate {
    /// Degree delta derived from the shape of the delta: pure deletions
    /// decrement, pure insertions increment, updates leave the counter alone.
    pub fn degree_delta(&self) -> i64 {
        let has_insert = !self.edges_to_insert.is_empty();
        let has_delete = !self.edges_to_delete.is_empty();
        match (has_insert, has_delete) {
            (false, true) => -1,
            (true, false) => 1,
            _ => 0,
        }
    }
}

/// Squash pending edges against the current snapshot into the new edge state
/// and the index-row delta.
///
/// Requests not newer than the snapshot are discarded (a later write
/// supersedes earlier state; an older one never mutates the snapshot).
/// Returns `None` when nothing survives - the caller treats that as a
/// successful no-op.
pub fn build_operation(
    label: &Label,
    snapshot: Option<&SnapshotEdge>,
    requests: &[Edge],
) -> Result<Option<(SnapshotEdge, EdgeMutate)>> {
    let base_ts = snapshot.map(|s| s.edge.ts).unwrap_or(0);
    let mut pending: Vec<&Edge> = requests
        .iter()
        .filter(|e| snapshot.is_none() || e.ts > base_ts)
        .collect();
    if pending.is_empty() {
        return Ok(None);
    }
    pending.sort_by_key(|e| e.ts);

    let identity = pending[0].normalized();
    for req in &pending {
        let normalized = req.normalized();
        if normalized.src != identity.src
            || normalized.tgt != identity.tgt
            || normalized.label_id != identity.label_id
        {
            anyhow::bail!(
                "requests span multiple edge identities: {} vs {}",
                identity.id(),
                normalized.id()
            );
        }
    }

    let old_state = snapshot.filter(|s| !s.edge.op.is_delete()).map(|s| &s.edge);
    let mut exists = old_state.is_some();
    let mut props = old_state.map(|e| e.props.clone()).unwrap_or_default();
    let mut ts = base_ts;

    for req in &pending {
        match req.op {
            Op::Insert | Op::InsertBulk => {
                if exists {
                    for (seq, value) in &req.props {
                        props.insert(*seq, value.clone());
                    }
                } else {
                    props = req.props.clone();
                }
                exists = true;
            }
            Op::Update => {
                for (seq, value) in &req.props {
                    props.insert(*seq, value.clone());
                }
                exists = true;
            }
            Op::Delete | Op::DeleteAll => {
                props.clear();
                exists = false;
            }
        }
        ts = req.ts;
    }

    let new_edge = Edge {
        src: identity.src.clone(),
        tgt: identity.tgt.clone(),
        label_id: identity.label_id,
        dir: Direction::Out,
        ts,
        op: if exists { Op::Insert } else { Op::Delete },
        props,
    };

    let mut mutate = EdgeMutate {
        new_snapshot: Some(SnapshotEdge::from_edge(new_edge.clone())),
        ..Default::default()
    };
    if let Some(old) = old_state {
        mutate.edges_to_delete = index_edges(label, old);
    }
    if exists {
        mutate.edges_to_insert = index_edges(label, &new_edge);
    }

    Ok(Some((SnapshotEdge::from_edge(new_edge), mutate)))
}

/// Index-edges of both mirrored representations, one per declared index.
pub fn index_edges(label: &Label, edge: &Edge) -> Vec<IndexEdge> {
    let mut out = Vec::with_capacity(label.indices.len() * 2);
    let reversed = edge.reversed();
    for index in &label.indices {
        out.push(IndexEdge::new(edge.clone(), index.seq));
        out.push(IndexEdge::new(reversed.clone(), index.seq));
    }
    out
}
