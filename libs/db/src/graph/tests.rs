//! End-to-end scenarios over a real store: the writer pipeline, degree
//! accounting, contention between strong writers, deleteAll, and the
//! eventual-consistency path.

use std::sync::Arc;

use tempfile::TempDir;

use super::model::{Direction, Edge, InnerVal, Op, Vertex, VertexId};
use super::query::QueryParam;
use super::schema::{test_support, ConsistencyLevel, MemoryCatalog, SchemaCatalog};
use super::writer::{spawn_writer_with_graph, GraphMutation, Writer, WriterConfig};
use super::Graph;
use crate::GraphConfig;

struct Harness {
    _dir: TempDir,
    graph: Arc<Graph>,
    catalog: Arc<MemoryCatalog>,
    writer: Writer,
}

async fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let catalog = test_support::catalog();

    // A weak-consistency label alongside the strong one.
    let mut follow = test_support::friend_label();
    follow.id = 20;
    follow.label_name = "follow".to_string();
    follow.consistency = ConsistencyLevel::Weak;
    catalog.add_label(follow);

    let config = GraphConfig {
        buffered_flush_interval_ms: 5,
        max_retry: 20,
        max_back_off_ms: 2,
        ..GraphConfig::default()
    };
    let (graph, _dead_letters) = Graph::open(&dir.path().join("db"), catalog.clone(), config).unwrap();
    let graph = Arc::new(graph);
    let (writer, _handle) = spawn_writer_with_graph(graph.clone(), WriterConfig::default());

    Harness {
        _dir: dir,
        graph,
        catalog,
        writer,
    }
}

fn user(id: i64) -> VertexId {
    VertexId::new(1, InnerVal::Long(id))
}

fn friend_edge(src: i64, tgt: i64, ts: u64, op: Op) -> Edge {
    let mut e = Edge::new(user(src), user(tgt), 10, Direction::Out, ts, op);
    e.props.insert(1, InnerVal::Long(ts as i64));
    e
}

async fn out_degree(graph: &Graph, src: i64) -> i64 {
    let label = test_support::friend_label();
    graph
        .fetcher()
        .fetch_degree(&label, &user(src), Direction::Out)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_vertex_put_and_get() {
    let h = harness().await;

    let mut vertex = Vertex::new(user(7000), 12345, Op::Insert);
    vertex.props.insert(3, InnerVal::Long(30));
    h.writer
        .send_sync(vec![GraphMutation::MutateVertices(vec![vertex])])
        .await
        .unwrap();

    let read = h.graph.get_vertex(&user(7000)).await.unwrap().unwrap();
    assert_eq!(read.id, user(7000));
    assert_eq!(read.props.get(&3), Some(&InnerVal::Long(30)));
    assert_eq!(read.ts, 12345);

    assert!(h.graph.get_vertex(&user(7001)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_edge_insert_tracks_degree() {
    let h = harness().await;

    h.writer
        .send_sync(vec![GraphMutation::MutateEdges(vec![friend_edge(1, 2, 100, Op::Insert)])])
        .await
        .unwrap();
    assert_eq!(out_degree(&h.graph, 1).await, 1);

    h.writer
        .send_sync(vec![GraphMutation::MutateEdges(vec![friend_edge(1, 3, 110, Op::Insert)])])
        .await
        .unwrap();
    assert_eq!(out_degree(&h.graph, 1).await, 2);

    h.writer
        .send_sync(vec![GraphMutation::MutateEdges(vec![friend_edge(1, 2, 120, Op::Delete)])])
        .await
        .unwrap();
    assert_eq!(out_degree(&h.graph, 1).await, 1);

    // The surviving adjacency is B-less.
    let result = h
        .graph
        .get_edges(&QueryParam::new(user(1), 10, Direction::Out))
        .await
        .unwrap();
    assert_eq!(result.edges.len(), 1);
    assert_eq!(result.edges[0].tgt, user(3));

    // Mirrored representation is visible from the target side.
    let incoming = h
        .graph
        .get_edges(&QueryParam::new(user(3), 10, Direction::In))
        .await
        .unwrap();
    assert_eq!(incoming.edges.len(), 1);
    assert_eq!(incoming.edges[0].tgt, user(1));
}

#[tokio::test]
async fn test_strong_commit_under_contention() {
    let h = harness().await;
    let label = h.catalog.find_label(10).unwrap();

    let mut first = friend_edge(1, 2, 100, Op::Insert);
    first.props.insert(2, InnerVal::str("writer-1"));
    let mut second = friend_edge(1, 2, 200, Op::Insert);
    second.props.insert(2, InnerVal::str("writer-2"));

    let g1 = h.graph.clone();
    let g2 = h.graph.clone();
    let t1 = tokio::spawn(async move { g1.mutate_edges(&[first], true).await.unwrap() });
    let t2 = tokio::spawn(async move { g2.mutate_edges(&[second], true).await.unwrap() });
    let (r1, r2) = (t1.await.unwrap(), t2.await.unwrap());

    // Both eventually succeed after retries.
    assert_eq!(r1, vec![true]);
    assert_eq!(r2, vec![true]);

    // The newer writer's state wins regardless of interleaving.
    let snapshot = h
        .graph
        .fetcher()
        .fetch_snapshot(&friend_edge(1, 2, 0, Op::Insert).id(), &label)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.edge.ts, 200);
    assert_eq!(snapshot.edge.props.get(&2), Some(&InnerVal::str("writer-2")));
    assert!(snapshot.lock.is_none());

    // One logical edge, counted once.
    assert_eq!(out_degree(&h.graph, 1).await, 1);
}

#[tokio::test]
async fn test_many_writers_single_identity() {
    let h = harness().await;
    let label = h.catalog.find_label(10).unwrap();

    let mut tasks = Vec::new();
    for i in 0..8i64 {
        let graph = h.graph.clone();
        tasks.push(tokio::spawn(async move {
            let mut edge = friend_edge(1, 2, 100 + i as u64, Op::Insert);
            edge.props.insert(2, InnerVal::str(format!("w{}", i)));
            graph.mutate_edges(&[edge], true).await.unwrap()
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), vec![true]);
    }

    let snapshot = h
        .graph
        .fetcher()
        .fetch_snapshot(&friend_edge(1, 2, 0, Op::Insert).id(), &label)
        .await
        .unwrap()
        .unwrap();
    // Timestamps are monotone: the final snapshot belongs to the newest
    // writer, and the lock is clear.
    assert_eq!(snapshot.edge.ts, 107);
    assert_eq!(snapshot.edge.props.get(&2), Some(&InnerVal::str("w7")));
    assert!(snapshot.lock.is_none());
    assert_eq!(out_degree(&h.graph, 1).await, 1);
}

#[tokio::test]
async fn test_snapshot_ts_is_monotone_across_reads() {
    let h = harness().await;
    let label = h.catalog.find_label(10).unwrap();
    let id = friend_edge(1, 2, 0, Op::Insert).id();

    let mut last_seen = 0u64;
    for ts in [100u64, 150, 220, 300] {
        h.graph
            .mutate_edges(&[friend_edge(1, 2, ts, Op::Update)], true)
            .await
            .unwrap();
        let snapshot = h
            .graph
            .fetcher()
            .fetch_snapshot(&id, &label)
            .await
            .unwrap()
            .unwrap();
        assert!(snapshot.edge.ts >= last_seen);
        last_seen = snapshot.edge.ts;
    }
    assert_eq!(last_seen, 300);
}

#[tokio::test]
async fn test_delete_all_adjacent_edges() {
    let h = harness().await;

    let edges: Vec<Edge> = [10u64, 20, 30, 40, 50]
        .iter()
        .enumerate()
        .map(|(i, ts)| friend_edge(1, i as i64 + 2, *ts, Op::Insert))
        .collect();
    h.writer
        .send_sync(vec![GraphMutation::MutateEdges(edges)])
        .await
        .unwrap();
    h.writer
        .send_sync(vec![GraphMutation::MutateEdges(vec![friend_edge(1, 99, 500, Op::Insert)])])
        .await
        .unwrap();
    assert_eq!(out_degree(&h.graph, 1).await, 6);

    let reply = h
        .writer
        .send_with_result(
            vec![GraphMutation::DeleteAllAdjacent {
                src_vertices: vec![user(1)],
                label_ids: vec![10],
                dir: Direction::Out,
                request_ts: 100,
            }],
            true,
        )
        .await
        .unwrap();
    assert_eq!(reply.payload, vec![true]);

    // The edge written after the request timestamp survives.
    let result = h
        .graph
        .get_edges(&QueryParam::new(user(1), 10, Direction::Out))
        .await
        .unwrap();
    assert_eq!(result.edges.len(), 1);
    assert_eq!(result.edges[0].tgt, user(99));
    assert_eq!(out_degree(&h.graph, 1).await, 1);
}

#[tokio::test]
async fn test_weak_label_deletes_converge() {
    let h = harness().await;

    let mut insert = friend_edge(1, 2, 100, Op::Insert);
    insert.label_id = 20;
    h.writer
        .send_with_result(vec![GraphMutation::MutateEdges(vec![insert])], true)
        .await
        .unwrap();

    // Two racing deletes on the weak label; both succeed without CAS.
    let mut d1 = friend_edge(1, 2, 200, Op::Delete);
    d1.label_id = 20;
    let mut d2 = friend_edge(1, 2, 201, Op::Delete);
    d2.label_id = 20;
    let g1 = h.graph.clone();
    let g2 = h.graph.clone();
    let t1 = tokio::spawn(async move { g1.mutate_edges(&[d1], true).await.unwrap() });
    let t2 = tokio::spawn(async move { g2.mutate_edges(&[d2], true).await.unwrap() });
    assert_eq!(t1.await.unwrap(), vec![true]);
    assert_eq!(t2.await.unwrap(), vec![true]);

    // Absent from adjacency, tombstone snapshot present.
    let result = h
        .graph
        .get_edges(&QueryParam::new(user(1), 20, Direction::Out))
        .await
        .unwrap();
    assert!(result.edges.is_empty());

    let follow = h.catalog.find_label(20).unwrap();
    let mut probe = friend_edge(1, 2, 0, Op::Insert);
    probe.label_id = 20;
    let snapshot = h
        .graph
        .fetcher()
        .fetch_snapshot(&probe.id(), &follow)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.edge.op, Op::Delete);
}

#[tokio::test]
async fn test_increment_counts() {
    let h = harness().await;
    let values = h
        .graph
        .increment_counts(&[friend_edge(1, 2, 100, Op::Insert), friend_edge(1, 3, 101, Op::Insert)])
        .await
        .unwrap();
    assert_eq!(values, vec![1, 1]);
    let again = h
        .graph
        .increment_counts(&[friend_edge(1, 4, 102, Op::Insert)])
        .await
        .unwrap();
    assert_eq!(again, vec![2]);
}

#[tokio::test]
async fn test_writer_flush_makes_buffered_writes_visible() {
    let h = harness().await;

    h.writer
        .send(vec![GraphMutation::MutateVertices(vec![Vertex::new(
            user(42),
            100,
            Op::Insert,
        )])])
        .await
        .unwrap();
    h.writer.flush().await.unwrap();

    assert!(h.graph.get_vertex(&user(42)).await.unwrap().is_some());
}

#[tokio::test]
async fn test_unknown_label_mutation_reports_failure() {
    let h = harness().await;
    let mut edge = friend_edge(1, 2, 100, Op::Insert);
    edge.label_id = 999;
    let results = h.graph.mutate_edges(&[edge], true).await.unwrap();
    assert_eq!(results, vec![false]);
}
