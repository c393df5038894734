//! Scripted in-memory transport.
//!
//! Nothing is sent anywhere: requests are recorded, and completions are
//! whatever the test queued. Useful for driving the dispatcher and the
//! action tracker deterministically.

use std::collections::{HashMap, VecDeque};

use crate::comms::messages::{Reply, Request};
use crate::comms::registry::Token;
use crate::comms::transport::{
    Completion, ConnectionHandle, Outcome, Poll, Transport, TransportError,
};

#[derive(Debug, Default)]
pub struct MockTransport {
    queue:       VecDeque<Poll>,
    sent:        Vec<(Token, Request)>,
    reads:       HashMap<Token, usize>,
    connects:    u64,
    shutdowns:   usize,
    refuse:      bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `connect` fail until switched back.
    pub fn refuse_connections(&mut self, refuse: bool) {
        self.refuse = refuse;
    }

    pub fn complete(&mut self, token: Token, outcome: Outcome) {
        self.queue.push_back(Poll::Completion(Completion { token, outcome }));
    }

    pub fn reply(&mut self, token: Token, reply: Reply) {
        self.complete(token, Outcome::Success(Some(reply)));
    }

    /// Stream readiness notification.
    pub fn ready(&mut self, token: Token) {
        self.complete(token, Outcome::Success(None));
    }

    pub fn fail(&mut self, token: Token, status: tonic::Status) {
        self.complete(token, Outcome::Failed(status));
    }

    pub fn finish(&mut self, token: Token) {
        self.complete(token, Outcome::Finished);
    }

    /// Peer went away: queue a shutdown signal behind what is already queued.
    pub fn signal_shutdown(&mut self) {
        self.queue.push_back(Poll::Shutdown);
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn sent(&self) -> &[(Token, Request)] {
        &self.sent
    }

    pub fn reads(&self, token: Token) -> usize {
        self.reads.get(&token).copied().unwrap_or(0)
    }

    pub fn connects(&self) -> u64 {
        self.connects
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns
    }
}

impl Transport for MockTransport {
    fn connect(&mut self, endpoint: &str) -> Result<ConnectionHandle, TransportError> {
        if self.refuse {
            return Err(TransportError::Connect(endpoint.into(), "refused by mock".into()));
        }
        self.connects += 1;
        Ok(ConnectionHandle(self.connects))
    }

    fn send_unary(&mut self, _conn: ConnectionHandle, request: Request, token: Token) {
        self.sent.push((token, request));
    }

    fn send_stream_open(&mut self, _conn: ConnectionHandle, request: Request, token: Token) {
        self.sent.push((token, request));
    }

    fn read_next(&mut self, _conn: ConnectionHandle, token: Token) {
        *self.reads.entry(token).or_default() += 1;
    }

    fn poll(&mut self) -> Poll {
        self.queue.pop_front().unwrap_or(Poll::Empty)
    }

    fn shutdown(&mut self) {
        self.shutdowns += 1;
        self.queue.clear();
        self.queue.push_back(Poll::Shutdown);
    }
}
