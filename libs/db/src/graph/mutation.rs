//! Mutation builder: translates entities and [`EdgeMutate`] deltas into
//! ordered [`KvOp`]s.
//!
//! Ordering matters on the edge path: index deletions first, then index
//! insertions, then the snapshot put, so a reader that races a direct write
//! never observes an index row without its adjacency peers for longer than
//! one operation.

use anyhow::Result;

use super::codec::{IndexEdgeCodec, SnapshotEdgeCodec, VertexCodec, COUNT_QUALIFIER, DEGREE_QUALIFIER};
use super::model::{index_edges, Direction, Edge, EdgeMutate, IndexEdge, Op, SnapshotEdge, Vertex};
use super::schema::{Label, ServiceColumn};
use crate::kv::{Family, IncrementKind, KvOp};

/// Stateless translator from entities to KV operations. Bundled with the
/// codecs into the commit engine at wiring time.
#[derive(Debug, Clone, Copy, Default)]
pub struct MutationBuilder;

impl MutationBuilder {
    // =========================================================================
    // Vertices
    // =========================================================================

    pub fn vertex_ops(&self, vertex: &Vertex, column: &ServiceColumn) -> Result<Vec<KvOp>> {
        let version = column.schema_version;
        match vertex.op {
            Op::Insert | Op::Update | Op::InsertBulk => Ok(VertexCodec::encode(vertex, version)
                .into_iter()
                .map(|cell| KvOp::Put {
                    family: Family::Vertex,
                    row: cell.row,
                    qualifier: cell.qualifier,
                    value: cell.value,
                    ts: cell.ts,
                })
                .collect()),
            Op::Delete => Ok(vec![KvOp::DeleteRow {
                family: Family::Vertex,
                row: VertexCodec::row(&vertex.id, version),
                ts: vertex.ts,
            }]),
            // deleteAll on a vertex retires only its label memberships; the
            // adjacency itself is retired by the deleteAll traversal.
            Op::DeleteAll => Ok(self.delete_belongs_to_ops(vertex, column)),
        }
    }

    /// Remove exactly the qualifiers carrying label membership.
    pub fn delete_belongs_to_ops(&self, vertex: &Vertex, column: &ServiceColumn) -> Vec<KvOp> {
        let row = VertexCodec::row(&vertex.id, column.schema_version);
        vertex
            .belongs_to
            .iter()
            .map(|label_id| KvOp::Delete {
                family: Family::Vertex,
                row: row.clone(),
                qualifier: VertexCodec::belongs_to_qualifier(*label_id),
                ts: vertex.ts,
            })
            .collect()
    }

    // =========================================================================
    // Edges
    // =========================================================================

    pub fn snapshot_put(&self, snapshot: &SnapshotEdge, label: &Label) -> KvOp {
        let cell = SnapshotEdgeCodec::encode(snapshot, label);
        KvOp::Put {
            family: Family::Edge,
            row: cell.row,
            qualifier: cell.qualifier,
            value: cell.value,
            ts: cell.ts,
        }
    }

    pub fn index_edge_put(&self, index_edge: &IndexEdge, label: &Label) -> Result<KvOp> {
        let cell = IndexEdgeCodec::encode(index_edge, label)?;
        Ok(KvOp::Put {
            family: Family::Edge,
            row: cell.row,
            qualifier: cell.qualifier,
            value: cell.value,
            ts: cell.ts,
        })
    }

    pub fn index_edge_delete(&self, index_edge: &IndexEdge, label: &Label, ts: u64) -> Result<KvOp> {
        let cell = IndexEdgeCodec::encode(index_edge, label)?;
        Ok(KvOp::Delete {
            family: Family::Edge,
            row: cell.row,
            qualifier: cell.qualifier,
            ts,
        })
    }

    /// Index-row operations of a delta, ordered deletes-then-inserts.
    /// Deletions carry the request timestamp `ts` so they supersede the
    /// cells written by the previous state.
    pub fn edge_mutate_ops(&self, mutate: &EdgeMutate, label: &Label, ts: u64) -> Result<Vec<KvOp>> {
        let mut ops = Vec::with_capacity(mutate.edges_to_delete.len() + mutate.edges_to_insert.len());
        for index_edge in &mutate.edges_to_delete {
            ops.push(self.index_edge_delete(index_edge, label, ts)?);
        }
        for index_edge in &mutate.edges_to_insert {
            ops.push(self.index_edge_put(index_edge, label)?);
        }
        Ok(ops)
    }

    /// Degree increments prescribed by a delta: one per mirrored direction
    /// on the first index row, or none when the adjacency set did not change
    /// size.
    pub fn degree_ops(&self, mutate: &EdgeMutate, label: &Label) -> Result<Vec<KvOp>> {
        let delta = mutate.degree_delta();
        if delta == 0 {
            return Ok(Vec::new());
        }
        let representative = mutate
            .new_snapshot
            .as_ref()
            .map(|s| &s.edge)
            .or_else(|| mutate.edges_to_delete.first().map(|ie| &ie.edge))
            .ok_or_else(|| anyhow::anyhow!("degree delta without any edge in the delta"))?;
        let forward = representative.normalized();

        Ok(vec![
            KvOp::Increment {
                family: Family::Edge,
                row: IndexEdgeCodec::counter_row(label, &forward.src, Direction::Out)?,
                qualifier: DEGREE_QUALIFIER.to_vec(),
                amount: delta,
                kind: IncrementKind::Degree,
            },
            KvOp::Increment {
                family: Family::Edge,
                row: IndexEdgeCodec::counter_row(label, &forward.tgt, Direction::In)?,
                qualifier: DEGREE_QUALIFIER.to_vec(),
                amount: delta,
                kind: IncrementKind::Degree,
            },
        ])
    }

    /// Count increments for analytics rows. Emitted only here; degree
    /// increments are emitted only by the commit and direct write paths.
    pub fn count_ops(&self, edges: &[Edge], label: &Label) -> Result<Vec<KvOp>> {
        let mut ops = Vec::with_capacity(edges.len());
        for edge in edges {
            let forward = edge.normalized();
            ops.push(KvOp::Increment {
                family: Family::Edge,
                row: IndexEdgeCodec::counter_row(label, &forward.src, Direction::Out)?,
                qualifier: COUNT_QUALIFIER.to_vec(),
                amount: 1,
                kind: IncrementKind::Count,
            });
        }
        Ok(ops)
    }

    /// Direct-write plan for an eventual-consistency edge: `(mutations,
    /// increments)`. Index edges are derived from the request alone since no
    /// snapshot is consulted on this path.
    pub fn weak_edge_ops(&self, edge: &Edge, label: &Label) -> Result<(Vec<KvOp>, Vec<KvOp>)> {
        let forward = edge.normalized();
        let ies = index_edges(label, &forward);
        let mut ops = Vec::with_capacity(ies.len() + 1);
        let mut increments = Vec::new();

        match edge.op {
            Op::Insert | Op::InsertBulk | Op::Update => {
                for index_edge in &ies {
                    ops.push(self.index_edge_put(index_edge, label)?);
                }
                ops.push(self.snapshot_put(&SnapshotEdge::from_edge(forward.clone()), label));
                if edge.op != Op::Update {
                    increments = self.degree_increments(&forward, label, 1)?;
                }
            }
            Op::Delete | Op::DeleteAll => {
                for index_edge in &ies {
                    ops.push(self.index_edge_delete(index_edge, label, edge.ts)?);
                }
                let mut tombstone = forward.clone();
                tombstone.op = Op::Delete;
                tombstone.props.clear();
                ops.push(self.snapshot_put(&SnapshotEdge::from_edge(tombstone), label));
                increments = self.degree_increments(&forward, label, -1)?;
            }
        }

        Ok((ops, increments))
    }

    fn degree_increments(&self, forward: &Edge, label: &Label, amount: i64) -> Result<Vec<KvOp>> {
        Ok(vec![
            KvOp::Increment {
                family: Family::Edge,
                row: IndexEdgeCodec::counter_row(label, &forward.src, Direction::Out)?,
                qualifier: DEGREE_QUALIFIER.to_vec(),
                amount,
                kind: IncrementKind::Degree,
            },
            KvOp::Increment {
                family: Family::Edge,
                row: IndexEdgeCodec::counter_row(label, &forward.tgt, Direction::In)?,
                qualifier: DEGREE_QUALIFIER.to_vec(),
                amount,
                kind: IncrementKind::Degree,
            },
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::model::{build_operation, InnerVal, VertexId};
    use crate::graph::schema::test_support::{friend_label, user_column};

    fn edge(src: i64, tgt: i64, ts: u64, op: Op) -> Edge {
        let mut e = Edge::new(
            VertexId::new(1, InnerVal::Long(src)),
            VertexId::new(1, InnerVal::Long(tgt)),
            10,
            Direction::Out,
            ts,
            op,
        );
        e.props.insert(1, InnerVal::Long(1));
        e
    }

    #[test]
    fn test_vertex_insert_ops_are_puts() {
        let column = user_column();
        let mut vertex = Vertex::new(VertexId::new(1, InnerVal::Long(7)), 100, Op::Insert);
        vertex.props.insert(3, InnerVal::Long(30));
        let ops = MutationBuilder.vertex_ops(&vertex, &column).unwrap();
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().all(|op| matches!(op, KvOp::Put { family: Family::Vertex, .. })));
    }

    #[test]
    fn test_vertex_delete_removes_row() {
        let column = user_column();
        let vertex = Vertex::new(VertexId::new(1, InnerVal::Long(7)), 100, Op::Delete);
        let ops = MutationBuilder.vertex_ops(&vertex, &column).unwrap();
        assert!(matches!(ops.as_slice(), [KvOp::DeleteRow { .. }]));
    }

    #[test]
    fn test_delete_belongs_to_targets_membership_qualifiers_only() {
        let column = user_column();
        let mut vertex = Vertex::new(VertexId::new(1, InnerVal::Long(7)), 100, Op::DeleteAll);
        vertex.belongs_to = vec![10, 11];
        let ops = MutationBuilder.vertex_ops(&vertex, &column).unwrap();
        assert_eq!(ops.len(), 2);
        for op in &ops {
            match op {
                KvOp::Delete { qualifier, .. } => assert_eq!(qualifier.len(), 2),
                other => panic!("unexpected op {:?}", other),
            }
        }
    }

    #[test]
    fn test_edge_mutate_ops_order_deletes_first() {
        let label = friend_label();
        let (snapshot, _) = build_operation(&label, None, &[edge(1, 2, 100, Op::Insert)])
            .unwrap()
            .unwrap();
        let (_, mutate) = build_operation(&label, Some(&snapshot), &[edge(1, 2, 200, Op::Update)])
            .unwrap()
            .unwrap();

        let ops = MutationBuilder.edge_mutate_ops(&mutate, &label, 200).unwrap();
        let first_put = ops.iter().position(|op| matches!(op, KvOp::Put { .. })).unwrap();
        let last_delete = ops.iter().rposition(|op| matches!(op, KvOp::Delete { .. })).unwrap();
        assert!(last_delete < first_put);
    }

    #[test]
    fn test_degree_ops_insert_increments_both_directions() {
        let label = friend_label();
        let (_, mutate) = build_operation(&label, None, &[edge(1, 2, 100, Op::Insert)])
            .unwrap()
            .unwrap();
        let ops = MutationBuilder.degree_ops(&mutate, &label).unwrap();
        assert_eq!(ops.len(), 2);
        for op in &ops {
            match op {
                KvOp::Increment { amount, kind, qualifier, .. } => {
                    assert_eq!(*amount, 1);
                    assert_eq!(*kind, IncrementKind::Degree);
                    assert!(qualifier.is_empty());
                }
                other => panic!("unexpected op {:?}", other),
            }
        }
    }

    #[test]
    fn test_degree_ops_update_is_empty() {
        let label = friend_label();
        let (snapshot, _) = build_operation(&label, None, &[edge(1, 2, 100, Op::Insert)])
            .unwrap()
            .unwrap();
        let (_, mutate) = build_operation(&label, Some(&snapshot), &[edge(1, 2, 200, Op::Update)])
            .unwrap()
            .unwrap();
        assert!(MutationBuilder.degree_ops(&mutate, &label).unwrap().is_empty());
    }

    #[test]
    fn test_count_ops_use_count_marker() {
        let label = friend_label();
        let ops = MutationBuilder.count_ops(&[edge(1, 2, 100, Op::Insert)], &label).unwrap();
        match ops.as_slice() {
            [KvOp::Increment { kind, qualifier, amount, .. }] => {
                assert_eq!(*kind, IncrementKind::Count);
                assert_eq!(qualifier.as_slice(), COUNT_QUALIFIER);
                assert_eq!(*amount, 1);
            }
            other => panic!("unexpected ops {:?}", other),
        }
    }

    #[test]
    fn test_weak_delete_plan() {
        let label = friend_label();
        let (ops, increments) = MutationBuilder
            .weak_edge_ops(&edge(1, 2, 100, Op::Delete), &label)
            .unwrap();

        // Index deletes for both directions, then the tombstone snapshot put.
        assert_eq!(ops.len(), 3);
        assert!(matches!(ops[0], KvOp::Delete { .. }));
        assert!(matches!(ops[2], KvOp::Put { .. }));
        assert_eq!(increments.len(), 2);
        assert!(increments
            .iter()
            .all(|op| matches!(op, KvOp::Increment { amount: -1, .. })));
    }
}
