//! Mutation writer infrastructure.
//!
//! - `Writer` - handle for sending mutation batches
//! - `WriterConfig` - configuration
//! - `Consumer` - processes batches from the channel against a [`Graph`]
//! - Spawn functions for creating consumers
//!
//! Batches flow through a bounded MPSC channel; `flush()` rides the same
//! channel as a marker mutation so it returns only after everything sent
//! before it has been applied and the buffered client drained.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::model::{Direction, Edge, Vertex, VertexId};
use super::Graph;
use crate::request::{new_request_id, ReplyEnvelope, RequestEnvelope};

// ============================================================================
// Flush Marker
// ============================================================================

/// Marker for flush synchronization.
///
/// Contains a oneshot sender that signals when the flush completes. Uses
/// `Mutex<Option<...>>` to allow taking ownership from a shared reference,
/// since the consumer receives batches by reference.
pub struct FlushMarker {
    completion: Mutex<Option<oneshot::Sender<()>>>,
}

impl FlushMarker {
    pub fn new(completion: oneshot::Sender<()>) -> Self {
        Self {
            completion: Mutex::new(Some(completion)),
        }
    }

    /// Take the completion sender (can only be called once).
    pub fn take_completion(&self) -> Option<oneshot::Sender<()>> {
        self.completion.lock().ok()?.take()
    }
}

impl std::fmt::Debug for FlushMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let has_completion = self
            .completion
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false);
        f.debug_struct("FlushMarker")
            .field("has_completion", &has_completion)
            .finish()
    }
}

// Cloning a marker produces an empty one; only the original can signal.
impl Clone for FlushMarker {
    fn clone(&self) -> Self {
        Self {
            completion: Mutex::new(None),
        }
    }
}

// ============================================================================
// Mutation Enum
// ============================================================================

#[derive(Debug, Clone)]
pub enum GraphMutation {
    MutateVertices(Vec<Vertex>),
    MutateEdges(Vec<Edge>),
    IncrementCounts(Vec<Edge>),
    DeleteAllAdjacent {
        src_vertices: Vec<VertexId>,
        label_ids: Vec<u32>,
        dir: Direction,
        request_ts: u64,
    },
    /// Synchronization marker; not persisted.
    Flush(FlushMarker),
}

/// A batch plus its routing flag: `with_wait` selects the zero-flush client
/// so the caller observes its writes on return.
#[derive(Debug)]
pub struct MutationBatch {
    pub mutations: Vec<GraphMutation>,
    pub with_wait: bool,
}

pub type MutationRequest = RequestEnvelope<MutationBatch, Vec<bool>>;

// ============================================================================
// Writer
// ============================================================================

/// Configuration for the mutation writer.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Size of the MPSC channel buffer.
    pub channel_buffer_size: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_buffer_size: 1000,
        }
    }
}

/// Handle for sending mutations to the consumer.
#[derive(Clone)]
pub struct Writer {
    sender: mpsc::Sender<MutationRequest>,
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer").field("sender", &"<mpsc::Sender>").finish()
    }
}

impl Writer {
    pub fn new(sender: mpsc::Sender<MutationRequest>) -> Self {
        Writer { sender }
    }

    /// Send a batch to be processed asynchronously.
    pub async fn send(&self, mutations: Vec<GraphMutation>) -> Result<()> {
        self.sender
            .send(RequestEnvelope::new(MutationBatch {
                mutations,
                with_wait: false,
            }))
            .await
            .context("Failed to send mutations to writer queue")
    }

    /// Send a batch and wait for its per-mutation results. `with_wait`
    /// additionally routes the batch through the zero-flush client.
    pub async fn send_with_result(
        &self,
        mutations: Vec<GraphMutation>,
        with_wait: bool,
    ) -> Result<ReplyEnvelope<Vec<bool>>> {
        if mutations.is_empty() {
            return Ok(ReplyEnvelope::new(new_request_id(), 0, Vec::new()));
        }
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(
                RequestEnvelope::new(MutationBatch {
                    mutations,
                    with_wait,
                })
                .with_reply(tx),
            )
            .await
            .context("Failed to send mutations to writer queue")?;
        let payload = rx.await.context("Mutation reply channel dropped")??;
        Ok(ReplyEnvelope::new(new_request_id(), 0, payload))
    }

    /// Wait until every mutation sent before this call is applied and the
    /// buffered client is drained.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RequestEnvelope::new(MutationBatch {
                mutations: vec![GraphMutation::Flush(FlushMarker::new(tx))],
                with_wait: false,
            }))
            .await
            .context("Failed to send flush marker - channel closed")?;
        rx.await
            .context("Flush failed - consumer dropped completion channel")?;
        Ok(())
    }

    /// Convenience: `send()` followed by `flush()`.
    pub async fn send_sync(&self, mutations: Vec<GraphMutation>) -> Result<()> {
        if mutations.is_empty() {
            return Ok(());
        }
        self.send(mutations).await?;
        self.flush().await
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Create a new mutation writer and receiver pair.
pub fn create_writer(config: &WriterConfig) -> (Writer, mpsc::Receiver<MutationRequest>) {
    let (sender, receiver) = mpsc::channel(config.channel_buffer_size);
    (Writer::new(sender), receiver)
}

// ============================================================================
// Consumer
// ============================================================================

/// Consumer that applies mutation batches to a [`Graph`].
pub struct Consumer {
    receiver: mpsc::Receiver<MutationRequest>,
    config: WriterConfig,
    graph: Arc<Graph>,
}

impl Consumer {
    pub fn new(receiver: mpsc::Receiver<MutationRequest>, config: WriterConfig, graph: Arc<Graph>) -> Self {
        Self {
            receiver,
            config,
            graph,
        }
    }

    /// Process batches continuously until the channel is closed.
    #[tracing::instrument(skip(self), name = "mutation_consumer")]
    pub async fn run(mut self) -> Result<()> {
        tracing::info!(config = ?self.config, "Starting mutation consumer");
        loop {
            match self.receiver.recv().await {
                Some(request) => self.process_request(request).await,
                None => {
                    tracing::info!("Mutation consumer shutting down - channel closed");
                    return Ok(());
                }
            }
        }
    }

    #[tracing::instrument(skip(self, request), fields(batch_size = request.payload.mutations.len()))]
    async fn process_request(&self, mut request: MutationRequest) {
        let with_wait = request.payload.with_wait;
        for mutation in &request.payload.mutations {
            match mutation {
                GraphMutation::MutateVertices(vertices) => {
                    tracing::debug!(count = vertices.len(), "Processing MutateVertices");
                }
                GraphMutation::MutateEdges(edges) => {
                    tracing::debug!(count = edges.len(), with_wait, "Processing MutateEdges");
                }
                GraphMutation::IncrementCounts(edges) => {
                    tracing::debug!(count = edges.len(), "Processing IncrementCounts");
                }
                GraphMutation::DeleteAllAdjacent {
                    src_vertices,
                    label_ids,
                    request_ts,
                    ..
                } => {
                    tracing::debug!(
                        vertices = src_vertices.len(),
                        labels = label_ids.len(),
                        request_ts,
                        "Processing DeleteAllAdjacent"
                    );
                }
                GraphMutation::Flush(_) => {
                    tracing::debug!("Processing Flush marker");
                }
            }
        }

        let result = self.apply_batch(&request.payload.mutations, with_wait).await;

        match result {
            Ok(results) => request.respond(Ok(results)),
            Err(e) => {
                tracing::warn!(err = %e, "Mutation batch failed");
                request.respond(Err(e));
                return;
            }
        }

        // Signal flush markers only after the batch is applied and the
        // buffered client drained, so everything sent before the marker is
        // visible to readers.
        for mutation in &request.payload.mutations {
            if let GraphMutation::Flush(marker) = mutation {
                if let Err(e) = self.graph.flush().await {
                    tracing::warn!(err = %e, "Flush on marker failed");
                }
                if let Some(completion) = marker.take_completion() {
                    let _ = completion.send(());
                    tracing::debug!("Flush completion signaled");
                }
            }
        }
    }

    async fn apply_batch(&self, mutations: &[GraphMutation], with_wait: bool) -> Result<Vec<bool>> {
        let mut results = Vec::new();
        for mutation in mutations {
            match mutation {
                GraphMutation::MutateVertices(vertices) => {
                    results.extend(self.graph.mutate_vertices(vertices, with_wait).await?);
                }
                GraphMutation::MutateEdges(edges) => {
                    results.extend(self.graph.mutate_edges(edges, with_wait).await?);
                }
                GraphMutation::IncrementCounts(edges) => {
                    let values = self.graph.increment_counts(edges).await?;
                    results.extend(values.iter().map(|_| true));
                }
                GraphMutation::DeleteAllAdjacent {
                    src_vertices,
                    label_ids,
                    dir,
                    request_ts,
                } => {
                    let (all_deleted, deletes_succeeded) = self
                        .graph
                        .delete_all_adjacent_edges(src_vertices, label_ids, *dir, *request_ts)
                        .await?;
                    results.push(all_deleted && deletes_succeeded);
                }
                GraphMutation::Flush(_) => {}
            }
        }
        Ok(results)
    }
}

/// Spawn a mutation consumer as a background task.
pub fn spawn_consumer(consumer: Consumer) -> JoinHandle<Result<()>> {
    tokio::spawn(async move { consumer.run().await })
}

/// Create the writer and spawn its consumer against a graph.
pub fn spawn_writer_with_graph(graph: Arc<Graph>, config: WriterConfig) -> (Writer, JoinHandle<Result<()>>) {
    let (writer, receiver) = create_writer(&config);
    let consumer = Consumer::new(receiver, config, graph);
    let handle = spawn_consumer(consumer);
    (writer, handle)
}
