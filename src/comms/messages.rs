//! Messages exchanged with the companion process.
//!
//! The companion speaks gRPC service `agentcompanion.Companion`. The types
//! below are the prost messages for each method; `Request` and `Reply` wrap
//! them into the closed set the dispatcher carries around, so a single
//! operation never needs to know which concrete message it owns.

use serde::{Deserialize, Serialize};

// ───── unary messages ───────────────────────────────────────────────────────

#[derive(Clone, PartialEq, prost::Message)]
pub struct Ping {
    #[prost(int64, tag = "1")]
    pub token: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Pong {
    #[prost(int64, tag = "1")]
    pub token: i64,
    #[prost(uint32, tag = "2")]
    pub pid: u32,
}

/// Container lifecycle commands the companion can run.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    prost::Enumeration, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum ContainerCmd {
    Stop = 0,
    Pause = 1,
    Unpause = 2,
    Kill = 3,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ContainerCommand {
    #[prost(enumeration = "ContainerCmd", tag = "1")]
    pub cmd: i32,
    #[prost(string, tag = "2")]
    pub container_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ContainerCommandResult {
    #[prost(bool, tag = "1")]
    pub successful: bool,
    #[prost(string, tag = "2")]
    pub errstr: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SwarmStateCommand {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SwarmStateResult {
    #[prost(bool, tag = "1")]
    pub successful: bool,
    #[prost(string, tag = "2")]
    pub errstr: String,
    /// JSON document describing nodes, services and tasks.
    #[prost(string, tag = "3")]
    pub state: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct NotifyCommand {
    #[prost(string, tag = "1")]
    pub channel: String,
    #[prost(string, tag = "2")]
    pub message: String,
    /// The policy event, serialized as JSON, for templating on the far side.
    #[prost(string, tag = "3")]
    pub event_json: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct NotifyResult {
    #[prost(bool, tag = "1")]
    pub successful: bool,
    #[prost(string, tag = "2")]
    pub errstr: String,
}

// ───── streaming messages ───────────────────────────────────────────────────

#[derive(Clone, PartialEq, prost::Message)]
pub struct OrchestratorEventsCommand {
    #[prost(string, repeated, tag = "1")]
    pub include_types: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct OrchestratorEvent {
    #[prost(string, tag = "1")]
    pub kind: String,
    #[prost(string, tag = "2")]
    pub uid: String,
    #[prost(string, tag = "3")]
    pub body: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TraceCommand {
    #[prost(string, tag = "1")]
    pub container_id: String,
    #[prost(uint32, tag = "2")]
    pub max_records: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TraceRecord {
    #[prost(uint64, tag = "1")]
    pub ts_ns: u64,
    #[prost(string, tag = "2")]
    pub summary: String,
}

// ───── closed request / reply sets ──────────────────────────────────────────

/// Kind of companion call, one per service method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Ping,
    ContainerCommand,
    SwarmState,
    Notify,
    OrchestratorEvents,
    Trace,
}

impl MessageType {
    pub fn is_streaming(self) -> bool {
        matches!(self, MessageType::OrchestratorEvents | MessageType::Trace)
    }

    /// gRPC method path on the companion service.
    pub fn method_path(self) -> &'static str {
        match self {
            MessageType::Ping => "/agentcompanion.Companion/PerformPing",
            MessageType::ContainerCommand => "/agentcompanion.Companion/PerformContainerCommand",
            MessageType::SwarmState => "/agentcompanion.Companion/PerformSwarmState",
            MessageType::Notify => "/agentcompanion.Companion/PerformNotify",
            MessageType::OrchestratorEvents => {
                "/agentcompanion.Companion/PerformOrchestratorEventsStream"
            }
            MessageType::Trace => "/agentcompanion.Companion/PerformTrace",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Ping(Ping),
    ContainerCommand(ContainerCommand),
    SwarmState(SwarmStateCommand),
    Notify(NotifyCommand),
    OrchestratorEvents(OrchestratorEventsCommand),
    Trace(TraceCommand),
}

impl Request {
    pub fn message_type(&self) -> MessageType {
        match self {
            Request::Ping(_) => MessageType::Ping,
            Request::ContainerCommand(_) => MessageType::ContainerCommand,
            Request::SwarmState(_) => MessageType::SwarmState,
            Request::Notify(_) => MessageType::Notify,
            Request::OrchestratorEvents(_) => MessageType::OrchestratorEvents,
            Request::Trace(_) => MessageType::Trace,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Pong(Pong),
    ContainerCommand(ContainerCommandResult),
    SwarmState(SwarmStateResult),
    Notify(NotifyResult),
    OrchestratorEvent(OrchestratorEvent),
    TraceRecord(TraceRecord),
}

impl Reply {
    /// Application-level verdict carried inside the reply, if it has one.
    /// Replies without a verdict field count as successful.
    pub fn verdict(&self) -> Result<(), String> {
        let (ok, err) = match self {
            Reply::ContainerCommand(r) => (r.successful, &r.errstr),
            Reply::SwarmState(r) => (r.successful, &r.errstr),
            Reply::Notify(r) => (r.successful, &r.errstr),
            Reply::Pong(_) | Reply::OrchestratorEvent(_) | Reply::TraceRecord(_) => return Ok(()),
        };
        if ok { Ok(()) } else { Err(err.clone()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn streaming_kinds() {
        assert!(MessageType::Trace.is_streaming());
        assert!(MessageType::OrchestratorEvents.is_streaming());
        assert!(!MessageType::Notify.is_streaming());
        assert!(!MessageType::Ping.is_streaming());
    }

    #[test]
    fn container_command_carries_enum() {
        let cmd = ContainerCommand { cmd: ContainerCmd::Pause as i32, container_id: "abc".into() };
        let decoded = ContainerCommand::decode(&*cmd.encode_to_vec()).unwrap();
        assert_eq!(decoded.cmd(), ContainerCmd::Pause);
        assert_eq!(decoded.container_id, "abc");
    }

    #[test]
    fn verdict_reads_success_flag() {
        let bad = Reply::Notify(NotifyResult { successful: false, errstr: "no webhook".into() });
        assert_eq!(bad.verdict(), Err("no webhook".to_string()));
        assert!(Reply::Pong(Pong { token: 1, pid: 2 }).verdict().is_ok());
    }
}
