use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::oneshot;

/// Generic envelope for request/response over async channels.
///
/// `T` is the payload carried to the consumer, `R` the reply sent back over
/// the optional oneshot channel.
pub struct RequestEnvelope<T, R> {
    pub payload: T,
    pub reply: Option<oneshot::Sender<anyhow::Result<R>>>,
    pub timeout: Option<Duration>,
    pub request_id: u64,
    pub created_at: Instant,
}

impl<T, R> RequestEnvelope<T, R> {
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            reply: None,
            timeout: None,
            request_id: new_request_id(),
            created_at: Instant::now(),
        }
    }

    pub fn with_reply(mut self, reply: oneshot::Sender<anyhow::Result<R>>) -> Self {
        self.reply = Some(reply);
        self
    }

    pub fn respond(&mut self, result: anyhow::Result<R>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(result);
        }
    }

    pub fn elapsed_nanos(&self) -> u64 {
        self.created_at.elapsed().as_nanos() as u64
    }
}

/// Generic response envelope for request/reply APIs.
#[derive(Debug, Clone)]
pub struct ReplyEnvelope<T> {
    pub request_id: u64,
    pub elapsed_time: u64,
    pub payload: T,
}

impl<T> ReplyEnvelope<T> {
    pub fn new(request_id: u64, elapsed_time: u64, payload: T) -> Self {
        Self {
            request_id,
            elapsed_time,
            payload,
        }
    }
}

pub fn new_request_id() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
