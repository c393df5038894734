//! Typed entry points for the companion's methods.
//!
//! Thin wrappers that build the right `Request` and submit it through the
//! dispatcher. Swarm state is the odd one out: the companion answers it
//! slowly and expensively, so only one request may be outstanding.

use log::Level;

use crate::agent_log;
use crate::comms::dispatcher::{DispatchError, Dispatcher};
use crate::comms::messages::{
    ContainerCmd, ContainerCommand, OrchestratorEventsCommand, Ping, Reply, Request,
    SwarmStateCommand,
};
use crate::comms::registry::Token;
use crate::comms::transport::Transport;

#[derive(Debug, Default)]
pub struct Companion {
    swarm_state: Option<Token>,
}

impl Companion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Liveness probe; the reply echoes `token`.
    pub fn ping<T: Transport>(
        &self,
        dispatcher: &mut Dispatcher<T>,
        token: i64,
        callback: impl FnMut(Result<Reply, DispatchError>) + 'static,
    ) -> Token {
        dispatcher.submit_unary(Request::Ping(Ping { token }), callback)
    }

    pub fn container_command<T: Transport>(
        &self,
        dispatcher: &mut Dispatcher<T>,
        cmd: ContainerCmd,
        container_id: &str,
        callback: impl FnMut(Result<Reply, DispatchError>) + 'static,
    ) -> Token {
        let request = ContainerCommand { cmd: cmd as i32, container_id: container_id.into() };
        dispatcher.submit_unary(Request::ContainerCommand(request), callback)
    }

    /// Returns `None` without submitting while an earlier request is still
    /// in flight.
    pub fn swarm_state<T: Transport>(
        &mut self,
        dispatcher: &mut Dispatcher<T>,
        callback: impl FnMut(Result<Reply, DispatchError>) + 'static,
    ) -> Option<Token> {
        if let Some(token) = self.swarm_state {
            if dispatcher.is_registered(token) {
                agent_log!(
                    Level::Warn,
                    "companion",
                    "swarm state requested while {} is still pending",
                    token
                );
                return None;
            }
        }
        let token = dispatcher.submit_unary(Request::SwarmState(SwarmStateCommand {}), callback);
        self.swarm_state = Some(token);
        Some(token)
    }

    /// Subscribe to orchestrator events; the callback sees one `Ok` per event.
    pub fn orchestrator_events<T: Transport>(
        &self,
        dispatcher: &mut Dispatcher<T>,
        include_types: Vec<String>,
        callback: impl FnMut(Result<Reply, DispatchError>) + 'static,
    ) -> Token {
        let request = OrchestratorEventsCommand { include_types };
        dispatcher.submit_stream(Request::OrchestratorEvents(request), callback)
    }
}
