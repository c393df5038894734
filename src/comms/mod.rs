//! Companion communication: registry, dispatcher and transports.

pub mod channel;
pub mod companion;
pub mod dispatcher;
pub mod grpc;
pub mod messages;
pub mod mock;
pub mod registry;
pub mod transport;

pub use dispatcher::{Callback, ConnectionState, DispatchError, Dispatcher, DispatcherConfig};
pub use registry::Token;
pub use transport::{Completion, ConnectionHandle, Outcome, Poll, Transport, TransportError};
