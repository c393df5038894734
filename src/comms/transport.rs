//! Transport boundary between the dispatcher and the RPC framework.
//!
//! A transport accepts fire-and-forget sends tagged with a `Token` and hands
//! completions back through a single notification channel that the
//! dispatcher polls with zero wait. Implementations may run I/O on their own
//! threads; the only thing that crosses back is what `poll` returns.

use thiserror::Error;

use crate::comms::messages::{Reply, Request};
use crate::comms::registry::Token;

/// Identifies one established connection. A new handle is issued on every
/// successful `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub u64);

/// What a single completion says about its operation.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The call (or one stream step) succeeded. A stream's first success
    /// only announces readiness and carries no reply.
    Success(Option<Reply>),
    /// The peer closed the stream cleanly.
    Finished,
    /// The call failed; the status comes from the peer or the channel.
    Failed(tonic::Status),
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub token:   Token,
    pub outcome: Outcome,
}

/// Result of one zero-timeout poll.
#[derive(Debug, Clone)]
pub enum Poll {
    Completion(Completion),
    Empty,
    /// The connection is gone; nothing already sent will complete.
    Shutdown,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid endpoint '{0}': {1}")]
    InvalidEndpoint(String, String),

    #[error("connect to '{0}' failed: {1}")]
    Connect(String, String),
}

/// Non-blocking request/response/streaming primitive.
pub trait Transport {
    /// Establish (possibly lazily) a connection to `endpoint`.
    fn connect(&mut self, endpoint: &str) -> Result<ConnectionHandle, TransportError>;

    /// Start a unary call; exactly one completion will follow for `token`.
    fn send_unary(&mut self, conn: ConnectionHandle, request: Request, token: Token);

    /// Open a server stream; the first completion signals readiness.
    fn send_stream_open(&mut self, conn: ConnectionHandle, request: Request, token: Token);

    /// Arm the stream for its next message.
    fn read_next(&mut self, conn: ConnectionHandle, token: Token);

    /// Zero-wait poll of the notification channel.
    fn poll(&mut self) -> Poll;

    /// Tear the connection down; the next `poll` reports `Shutdown`.
    fn shutdown(&mut self);
}
