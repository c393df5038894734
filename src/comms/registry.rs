//! Operation registry: the sole owner of every in-flight operation.
//!
//! Tokens come from a monotonic counter and are plain integers, so a
//! completion that arrives after its operation was retired simply fails to
//! resolve instead of pointing at freed state.

use std::collections::HashMap;
use std::fmt;

use crate::comms::dispatcher::Callback;
use crate::comms::messages::{MessageType, Request};

/// Correlation key for one in-flight operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub u64);

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Unary,
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Submitted,
    AwaitingCompletion,
    StreamReady,
    Completed,
    Failed,
}

pub struct Operation {
    pub kind:         OperationKind,
    pub state:        OperationState,
    pub message_type: MessageType,
    /// Held until the operation reaches the transport; `None` once sent.
    pub request:      Option<Request>,
    pub callback:     Callback,
}

impl Operation {
    pub fn new(kind: OperationKind, request: Request, callback: Callback) -> Self {
        let state = match kind {
            OperationKind::Unary => OperationState::Submitted,
            OperationKind::Stream => OperationState::AwaitingCompletion,
        };
        Self {
            kind,
            state,
            message_type: request.message_type(),
            request: Some(request),
            callback,
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("message_type", &self.message_type)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct Registry {
    next:       u64,
    operations: HashMap<Token, Operation>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self { next: 1, operations: HashMap::new() }
    }

    /// Take ownership of `operation` and issue its token.
    pub fn register(&mut self, operation: Operation) -> Token {
        let token = Token(self.next);
        self.next += 1;
        let previous = self.operations.insert(token, operation);
        assert!(previous.is_none(), "registry token {token} issued twice");
        token
    }

    pub fn lookup(&self, token: Token) -> Option<&Operation> {
        self.operations.get(&token)
    }

    pub fn lookup_mut(&mut self, token: Token) -> Option<&mut Operation> {
        self.operations.get_mut(&token)
    }

    /// Remove the operation and hand it back. `None` means the token is
    /// unknown or already retired.
    pub fn retire(&mut self, token: Token) -> Option<Operation> {
        self.operations.remove(&token)
    }

    /// Retire everything, oldest token first.
    pub fn retire_all(&mut self) -> Vec<(Token, Operation)> {
        self.retire_matching(|_| true)
    }

    /// Retire every operation `pred` selects, oldest token first.
    pub fn retire_matching(
        &mut self,
        mut pred: impl FnMut(&Operation) -> bool,
    ) -> Vec<(Token, Operation)> {
        let tokens: Vec<Token> = self
            .operations
            .iter()
            .filter(|(_, op)| pred(op))
            .map(|(token, _)| *token)
            .collect();
        let mut retired: Vec<_> = tokens
            .into_iter()
            .filter_map(|token| self.operations.remove(&token).map(|op| (token, op)))
            .collect();
        retired.sort_by_key(|(token, _)| *token);
        retired
    }

    /// Tokens whose request has not reached the transport yet, oldest first.
    pub fn unsent(&self) -> Vec<Token> {
        let mut tokens: Vec<_> = self
            .operations
            .iter()
            .filter(|(_, op)| op.request.is_some())
            .map(|(token, _)| *token)
            .collect();
        tokens.sort();
        tokens
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::messages::Ping;

    fn op() -> Operation {
        Operation::new(OperationKind::Unary, Request::Ping(Ping { token: 0 }), Box::new(|_| {}))
    }

    #[test]
    fn tokens_are_never_reused() {
        let mut reg = Registry::new();
        let a = reg.register(op());
        assert!(reg.retire(a).is_some());
        let b = reg.register(op());
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn stale_lookup_is_empty() {
        let mut reg = Registry::new();
        let a = reg.register(op());
        reg.retire(a);
        assert!(reg.lookup(a).is_none());
        assert!(reg.retire(a).is_none());
        assert!(reg.lookup(Token(999)).is_none());
    }

    #[test]
    fn stream_operations_start_awaiting() {
        let stream = Operation::new(
            OperationKind::Stream,
            Request::Ping(Ping { token: 0 }),
            Box::new(|_| {}),
        );
        assert_eq!(stream.state, OperationState::AwaitingCompletion);
        assert_eq!(op().state, OperationState::Submitted);
    }

    #[test]
    fn retire_all_is_ordered_and_empties() {
        let mut reg = Registry::new();
        let tokens: Vec<_> = (0..5).map(|_| reg.register(op())).collect();
        let retired: Vec<_> = reg.retire_all().into_iter().map(|(t, _)| t).collect();
        assert_eq!(retired, tokens);
        assert!(reg.is_empty());
    }
}
