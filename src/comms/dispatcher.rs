//! Async dispatcher
//! ================
//! Single-threaded reactor over a `Transport`. Requests are registered,
//! sent without blocking, and their completions are pulled back out of the
//! transport's notification channel in bounded batches by `drain`. Every
//! callback runs inside `drain` or `shutdown`, on the caller's thread.
//
//! Connection lifecycle
//! ─────────────────────
//!   Disconnected ──submit──▶ Connected ──Poll::Shutdown──▶ ShuttingDown
//!        ▲                                                   │
//!        └──────────────── sent operations failed ───────────┘
//!
//! `shutdown()` enters ShuttingDown itself and fails everything at once; the
//! move back to Disconnected still waits for the transport to confirm on the
//! next `drain`. Submits made meanwhile are held and sent after reconnecting.

use std::collections::VecDeque;

use log::Level;
use thiserror::Error;

use crate::agent_log;
use crate::comms::messages::{Reply, Request};
use crate::comms::registry::{Operation, OperationKind, OperationState, Registry, Token};
use crate::comms::transport::{Completion, ConnectionHandle, Outcome, Poll, Transport};

/// Invoked with each data message (streams) and once with the final result.
/// Any `Err` is terminal.
pub type Callback = Box<dyn FnMut(Result<Reply, DispatchError>)>;

/// What an operation's callback can be told went wrong.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("transport disconnected")]
    TransportDisconnected,

    #[error("operation failed: {0}")]
    OperationFailed(tonic::Status),

    #[error("stream closed by peer")]
    StreamEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    ShuttingDown,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Companion endpoint handed to `Transport::connect`.
    pub endpoint: String,
    /// Upper bound of completions handled per `drain` when driven by the
    /// control loop.
    pub max_loop_events: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { endpoint: "http://127.0.0.1:7601".into(), max_loop_events: 100 }
    }
}

pub struct Dispatcher<T> {
    config:    DispatcherConfig,
    transport: T,
    registry:  Registry,
    state:     ConnectionState,
    conn:      Option<ConnectionHandle>,
    /// Set when the transport reported shutdown; cleared by the next connect.
    lost:      bool,
    /// Failures decided locally (connect errors, misrouted requests),
    /// delivered by `drain`.
    local_failures: VecDeque<(Token, DispatchError)>,
    /// Connections lost to the peer, not counting our own `shutdown`.
    disconnects: u64,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(config: DispatcherConfig, transport: T) -> Self {
        Self {
            config,
            transport,
            registry: Registry::new(),
            state: ConnectionState::Disconnected,
            conn: None,
            lost: false,
            local_failures: VecDeque::new(),
            disconnects: 0,
        }
    }

    /// Start a request/response call; `callback` fires exactly once.
    pub fn submit_unary(
        &mut self,
        request: Request,
        callback: impl FnMut(Result<Reply, DispatchError>) + 'static,
    ) -> Token {
        self.submit(OperationKind::Unary, request, Box::new(callback))
    }

    /// Open a server stream; `callback` fires once per message and once more
    /// with the terminal `Err`.
    pub fn submit_stream(
        &mut self,
        request: Request,
        callback: impl FnMut(Result<Reply, DispatchError>) + 'static,
    ) -> Token {
        self.submit(OperationKind::Stream, request, Box::new(callback))
    }

    fn submit(&mut self, kind: OperationKind, request: Request, callback: Callback) -> Token {
        let message_type = request.message_type();
        let token = self.registry.register(Operation::new(kind, request, callback));
        metrics::counter!("dispatcher_submitted_total").increment(1);
        metrics::gauge!("dispatcher_in_flight").set(self.registry.len() as f64);
        agent_log!(Level::Debug, "dispatcher", "submit {:?} {:?} as {}", kind, message_type, token);

        if message_type.is_streaming() != (kind == OperationKind::Stream) {
            agent_log!(
                Level::Warn,
                "dispatcher",
                "{:?} submitted as {:?}, refusing {}",
                message_type,
                kind,
                token
            );
            if let Some(op) = self.registry.lookup_mut(token) {
                op.request = None;
            }
            let status = tonic::Status::invalid_argument(format!(
                "{} cannot be called as {:?}",
                message_type.method_path(),
                kind
            ));
            self.local_failures.push_back((token, DispatchError::OperationFailed(status)));
            return token;
        }

        match self.state {
            ConnectionState::Connected => self.send(token),
            ConnectionState::ShuttingDown => {
                agent_log!(Level::Debug, "dispatcher", "{} held until reconnect", token);
            }
            ConnectionState::Disconnected => self.reconnect(),
        }
        token
    }

    /// Lazily connect and push every held request to the transport. A failed
    /// connect fails the held operations on the next `drain`.
    fn reconnect(&mut self) {
        match self.transport.connect(&self.config.endpoint) {
            Ok(handle) => {
                agent_log!(Level::Info, "dispatcher", "connected to {}", self.config.endpoint);
                self.conn = Some(handle);
                self.state = ConnectionState::Connected;
                self.lost = false;
                for token in self.registry.unsent() {
                    self.send(token);
                }
            }
            Err(e) => {
                agent_log!(Level::Error, "dispatcher", "{}", e);
                for token in self.registry.unsent() {
                    if let Some(op) = self.registry.lookup_mut(token) {
                        op.request = None;
                    }
                    self.local_failures
                        .push_back((token, DispatchError::TransportDisconnected));
                }
            }
        }
    }

    fn send(&mut self, token: Token) {
        let Some(conn) = self.conn else { return };
        let Some(op) = self.registry.lookup_mut(token) else { return };
        let Some(request) = op.request.take() else { return };
        match op.kind {
            OperationKind::Unary => self.transport.send_unary(conn, request, token),
            OperationKind::Stream => self.transport.send_stream_open(conn, request, token),
        }
    }

    /// Handle at most `max_ops` completions without waiting. Returns `false`
    /// if the transport reported a disconnection, here or in an earlier drain
    /// with no reconnect since.
    pub fn drain(&mut self, max_ops: u32) -> bool {
        let mut processed = 0;
        while processed < max_ops {
            if let Some((token, err)) = self.local_failures.pop_front() {
                self.finish(token, OperationState::Failed, Err(err));
                processed += 1;
                continue;
            }
            if self.state == ConnectionState::Disconnected {
                break;
            }
            match self.transport.poll() {
                Poll::Empty => break,
                Poll::Shutdown => {
                    self.on_transport_shutdown();
                    return false;
                }
                Poll::Completion(completion) => {
                    self.dispatch(completion);
                    processed += 1;
                }
            }
        }
        !self.lost
    }

    /// Drain using the configured per-tick cap.
    pub fn pump(&mut self) -> bool {
        self.drain(self.config.max_loop_events)
    }

    fn dispatch(&mut self, completion: Completion) {
        let Completion { token, outcome } = completion;
        let Some(op) = self.registry.lookup_mut(token) else {
            metrics::counter!("dispatcher_stale_completions_total").increment(1);
            agent_log!(Level::Debug, "dispatcher", "stale completion for {} ignored", token);
            return;
        };
        metrics::counter!("dispatcher_completions_total").increment(1);

        match op.kind {
            OperationKind::Stream => match outcome {
                Outcome::Success(_) if op.state == OperationState::AwaitingCompletion => {
                    op.state = OperationState::StreamReady;
                    agent_log!(
                        Level::Debug,
                        "dispatcher",
                        "{:?} stream {} ready",
                        op.message_type,
                        token
                    );
                    self.read_next(token);
                }
                Outcome::Success(Some(reply)) => {
                    (op.callback)(Ok(reply));
                    self.read_next(token);
                }
                Outcome::Success(None) => self.read_next(token),
                Outcome::Finished => {
                    self.finish(token, OperationState::Completed, Err(DispatchError::StreamEnded))
                }
                Outcome::Failed(status) => {
                    agent_log!(
                        Level::Warn,
                        "dispatcher",
                        "{:?} stream {} failed: {}",
                        op.message_type,
                        token,
                        status
                    );
                    self.finish(
                        token,
                        OperationState::Failed,
                        Err(DispatchError::OperationFailed(status)),
                    )
                }
            },
            OperationKind::Unary => match outcome {
                Outcome::Success(Some(reply)) => {
                    self.finish(token, OperationState::Completed, Ok(reply))
                }
                Outcome::Success(None) | Outcome::Finished => self.finish(
                    token,
                    OperationState::Failed,
                    Err(DispatchError::OperationFailed(tonic::Status::internal(
                        "unary call completed without a reply",
                    ))),
                ),
                Outcome::Failed(status) => {
                    agent_log!(
                        Level::Debug,
                        "dispatcher",
                        "{:?} call {} failed: {}",
                        op.message_type,
                        token,
                        status
                    );
                    self.finish(
                        token,
                        OperationState::Failed,
                        Err(DispatchError::OperationFailed(status)),
                    )
                }
            },
        }
    }

    fn read_next(&mut self, token: Token) {
        if let Some(conn) = self.conn {
            self.transport.read_next(conn, token);
        }
    }

    /// The only place an operation leaves the registry on the completion path.
    fn finish(&mut self, token: Token, state: OperationState, result: Result<Reply, DispatchError>) {
        let Some(mut op) = self.registry.retire(token) else {
            unreachable!("operation {token} retired twice");
        };
        op.state = state;
        (op.callback)(result);
        metrics::gauge!("dispatcher_in_flight").set(self.registry.len() as f64);
    }

    fn on_transport_shutdown(&mut self) {
        if self.state == ConnectionState::ShuttingDown {
            agent_log!(Level::Debug, "dispatcher", "transport confirmed shutdown");
        } else {
            agent_log!(
                Level::Error,
                "dispatcher",
                "companion transport shut down, disconnecting ({} in flight)",
                self.registry.len()
            );
            metrics::counter!("dispatcher_disconnects_total").increment(1);
            self.disconnects += 1;
        }
        self.state = ConnectionState::ShuttingDown;
        self.conn = None;
        self.lost = true;

        // held requests never reached the old connection; they go to the next one
        let sent = self.registry.retire_matching(|op| op.request.is_none());
        fail_all(sent);
        self.state = ConnectionState::Disconnected;
        metrics::gauge!("dispatcher_in_flight").set(self.registry.len() as f64);

        if !self.registry.unsent().is_empty() {
            self.reconnect();
        }
    }

    /// Fail every outstanding operation before returning.
    pub fn shutdown(&mut self) {
        agent_log!(
            Level::Info,
            "dispatcher",
            "shutdown with {} operation(s) in flight",
            self.registry.len()
        );
        if self.conn.take().is_some() {
            self.transport.shutdown();
            self.state = ConnectionState::ShuttingDown;
        }
        self.local_failures.clear();
        fail_all(self.registry.retire_all());
        metrics::gauge!("dispatcher_in_flight").set(0.0);
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Times the peer dropped the connection.
    pub fn disconnects(&self) -> u64 {
        self.disconnects
    }

    pub fn in_flight(&self) -> usize {
        self.registry.len()
    }

    pub fn is_registered(&self, token: Token) -> bool {
        self.registry.lookup(token).is_some()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

fn fail_all(retired: Vec<(Token, Operation)>) {
    for (_, mut op) in retired {
        op.state = OperationState::Failed;
        (op.callback)(Err(DispatchError::TransportDisconnected));
    }
}
