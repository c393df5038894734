//! Action specifications attached to policies.
//!
//! The tracker never looks inside an action beyond asking how it executes:
//! locally on the control thread, or as a unary/streaming companion call.

use serde::{Deserialize, Serialize};

use crate::comms::messages::{ContainerCmd, ContainerCommand, NotifyCommand, Request, TraceCommand};
use crate::policy::event::PolicyEvent;

fn default_capture_secs() -> u64 { 10 }
fn default_max_records() -> u32 { 1_000 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionSpec {
    /// Start a local capture job around the event.
    Capture {
        name: String,
        #[serde(default = "default_capture_secs")]
        duration_secs: u64,
    },
    /// Attach a tag to the event.
    Tag { key: String, value: String },
    /// Ask the companion to deliver a notification.
    Notify {
        channel: String,
        /// Falls back to the event's output line when empty.
        #[serde(default)]
        message: String,
    },
    /// Run a container lifecycle command through the companion.
    Container {
        command: ContainerCmd,
        /// Defaults to the container of the matched event.
        #[serde(default)]
        container_id: Option<String>,
    },
    /// Stream trace records from the companion until it closes the stream.
    Trace {
        #[serde(default)]
        container_id: Option<String>,
        #[serde(default = "default_max_records")]
        max_records: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Capture,
    Tag,
    Notify,
    Container,
    Trace,
}

/// How one action is carried out.
#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    Local,
    Unary(Request),
    Stream(Request),
    /// Cannot run for this event; recorded as a failure straight away.
    Rejected(String),
}

impl ActionSpec {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionSpec::Capture { .. } => ActionKind::Capture,
            ActionSpec::Tag { .. } => ActionKind::Tag,
            ActionSpec::Notify { .. } => ActionKind::Notify,
            ActionSpec::Container { .. } => ActionKind::Container,
            ActionSpec::Trace { .. } => ActionKind::Trace,
        }
    }

    pub fn execution(&self, event: &PolicyEvent) -> Execution {
        match self {
            ActionSpec::Capture { .. } | ActionSpec::Tag { .. } => Execution::Local,
            ActionSpec::Notify { channel, message } => {
                let message = if message.is_empty() { event.output.clone() } else { message.clone() };
                Execution::Unary(Request::Notify(NotifyCommand {
                    channel: channel.clone(),
                    message,
                    event_json: serde_json::to_string(event).unwrap_or_default(),
                }))
            }
            ActionSpec::Container { command, container_id } => {
                match container_id.as_ref().or(event.container_id.as_ref()) {
                    Some(id) => Execution::Unary(Request::ContainerCommand(ContainerCommand {
                        cmd: *command as i32,
                        container_id: id.clone(),
                    })),
                    None => Execution::Rejected("event has no container".into()),
                }
            }
            ActionSpec::Trace { container_id, max_records } => {
                match container_id.as_ref().or(event.container_id.as_ref()) {
                    Some(id) => Execution::Stream(Request::Trace(TraceCommand {
                        container_id: id.clone(),
                        max_records: *max_records,
                    })),
                    None => Execution::Rejected("event has no container".into()),
                }
            }
        }
    }
}
