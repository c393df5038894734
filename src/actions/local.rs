//! Actions that complete on the control thread.

use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam::channel::{Receiver, Sender, unbounded};
use log::Level;

use crate::agent_log;
use crate::actions::spec::ActionSpec;
use crate::policy::event::{ActionResult, PolicyEvent};

pub trait LocalActions {
    /// Run `spec` against `event` (which it may modify) and report the result.
    fn execute(&mut self, spec: &ActionSpec, event: &mut PolicyEvent) -> ActionResult;
}

/// Request for the capture subsystem to record activity around an event.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureJob {
    pub name:         String,
    pub event_id:     u64,
    pub container_id: Option<String>,
    pub duration:     Duration,
    pub requested_at: DateTime<Utc>,
}

/// Tags go straight onto the event; captures are queued for whoever
/// consumes the job channel.
pub struct LocalExecutor {
    captures: Sender<CaptureJob>,
}

impl LocalExecutor {
    pub fn new() -> (Self, Receiver<CaptureJob>) {
        let (captures, rx) = unbounded();
        (Self { captures }, rx)
    }
}

impl LocalActions for LocalExecutor {
    fn execute(&mut self, spec: &ActionSpec, event: &mut PolicyEvent) -> ActionResult {
        let kind = spec.kind();
        match spec {
            ActionSpec::Tag { key, value } => {
                event.tags.insert(key.clone(), value.clone());
                ActionResult::completed(kind, None)
            }
            ActionSpec::Capture { name, duration_secs } => {
                let job = CaptureJob {
                    name:         name.clone(),
                    event_id:     event.id,
                    container_id: event.container_id.clone(),
                    duration:     Duration::from_secs(*duration_secs),
                    requested_at: Utc::now(),
                };
                match self.captures.send(job) {
                    Ok(()) => ActionResult::completed(kind, Some(format!("capture '{name}' queued"))),
                    Err(_) => {
                        agent_log!(Level::Error, "actions", "capture queue closed, '{}' dropped", name);
                        ActionResult::failed(kind, "capture queue closed")
                    }
                }
            }
            ActionSpec::Notify { .. } | ActionSpec::Container { .. } | ActionSpec::Trace { .. } => {
                ActionResult::failed(kind, "not a local action")
            }
        }
    }
}
