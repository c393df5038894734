//! Event model on both sides of the policy engine.
//!
//! `SystemEvent` is what the sensors hand in; `PolicyEvent` is the report
//! the action tracker builds for a match and hands to the sink once every
//! triggered action has resolved. Both serialize as JSON.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::actions::spec::ActionKind;

/// One observed system activity, as produced by the sensors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
    #[serde(default = "Utc::now")]
    pub ts: DateTime<Utc>,
    /// Event type, e.g. `execve`, `open`, `connect`.
    pub kind: String,
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub process_name: String,
    #[serde(default)]
    pub container_id: Option<String>,
    #[serde(default)]
    pub container_image: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl SystemEvent {
    /// Resolve a field by name. Well-known names map onto the typed
    /// members; anything else is looked up in `fields`.
    pub fn field(&self, name: &str) -> Option<String> {
        match name {
            "evt.type" => Some(self.kind.clone()),
            "proc.name" => Some(self.process_name.clone()),
            "proc.pid" => Some(self.pid.to_string()),
            "container.id" => self.container_id.clone(),
            "container.image" => self.container_image.clone(),
            other => self.fields.get(other).cloned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Not resolved (yet). Left in place when an event is force-emitted.
    Pending,
    Completed,
    Failed,
    /// The event deadline passed before the action answered.
    TimedOut,
}

/// Result slot for one triggered action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub kind:   ActionKind,
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Messages received so far, for streaming actions.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub records: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl ActionResult {
    pub fn pending(kind: ActionKind) -> Self {
        Self { kind, status: ActionStatus::Pending, detail: None, records: 0 }
    }

    pub fn completed(kind: ActionKind, detail: Option<String>) -> Self {
        Self { kind, status: ActionStatus::Completed, detail, records: 0 }
    }

    pub fn failed(kind: ActionKind, detail: impl Into<String>) -> Self {
        Self { kind, status: ActionStatus::Failed, detail: Some(detail.into()), records: 0 }
    }

    pub fn successful(&self) -> bool {
        self.status == ActionStatus::Completed
    }
}

/// Report for one policy match, with the merged results of its actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyEvent {
    /// Assigned by the action tracker when the event is triggered.
    #[serde(default)]
    pub id: u64,
    pub ts: DateTime<Utc>,
    pub policy_id: u64,
    pub policy_name: String,
    #[serde(default)]
    pub container_id: Option<String>,
    pub output: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub action_results: Vec<ActionResult>,
}

impl PolicyEvent {
    pub fn new(policy_id: u64, policy_name: &str, source: &SystemEvent, output: String) -> Self {
        let mut fields = source.fields.clone();
        fields.insert("evt.type".into(), source.kind.clone());
        fields.insert("proc.name".into(), source.process_name.clone());
        fields.insert("proc.pid".into(), source.pid.to_string());
        Self {
            id: 0,
            ts: source.ts,
            policy_id,
            policy_name: policy_name.into(),
            container_id: source.container_id.clone(),
            output,
            fields,
            tags: BTreeMap::new(),
            action_results: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_event_defaults_from_sparse_json() {
        let ev: SystemEvent =
            serde_json::from_str(r#"{"kind":"execve","process_name":"nc","fields":{"fd.name":"/etc/shadow"}}"#)
                .unwrap();
        assert_eq!(ev.pid, 0);
        assert_eq!(ev.field("proc.name").as_deref(), Some("nc"));
        assert_eq!(ev.field("fd.name").as_deref(), Some("/etc/shadow"));
        assert_eq!(ev.field("container.id"), None);
    }

    #[test]
    fn empty_detail_and_records_are_omitted() {
        let json = serde_json::to_value(ActionResult::completed(ActionKind::Tag, None)).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "tag", "status": "completed"}));

        let timed_out = ActionResult { status: ActionStatus::TimedOut, ..ActionResult::pending(ActionKind::Notify) };
        assert_eq!(serde_json::to_value(&timed_out).unwrap()["status"], "timed_out");
    }
}
