//! Response policies.
//!
//! A policy is a rule over `SystemEvent`s plus the actions to run when it
//! matches. Rules are a closed set of variants, deserialized straight from
//! the `[[policies]]` tables of the config.

pub mod event;
pub mod manager;

use serde::{Deserialize, Serialize};

use crate::actions::spec::ActionSpec;
use event::{PolicyEvent, SystemEvent};

fn default_enabled() -> bool { true }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Rule {
    /// Process name is one of `names` (exact match).
    ProcessName { names: Vec<String> },
    /// Container image starts with one of `prefixes`.
    ContainerImage { prefixes: Vec<String> },
    /// Any field resolvable through `SystemEvent::field` equals `value`.
    FieldEquals { field: String, value: String },
}

impl Rule {
    fn matches(&self, event: &SystemEvent) -> bool {
        match self {
            Rule::ProcessName { names } => names.iter().any(|n| *n == event.process_name),
            Rule::ContainerImage { prefixes } => event
                .container_image
                .as_deref()
                .is_some_and(|image| prefixes.iter().any(|p| image.starts_with(p.as_str()))),
            Rule::FieldEquals { field, value } => {
                event.field(field).is_some_and(|v| v == *value)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id:      u64,
    pub name:    String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub rule:    Rule,
    pub actions: Vec<ActionSpec>,
}

/// A policy hit: the report to build, and what to run for it.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub event:   PolicyEvent,
    pub actions: Vec<ActionSpec>,
}

impl Policy {
    pub fn try_match(&self, event: &SystemEvent) -> Option<MatchResult> {
        if !self.enabled || !self.rule.matches(event) {
            return None;
        }
        let output = format!(
            "{}: {} by {} (pid {}){}",
            self.name,
            event.kind,
            event.process_name,
            event.pid,
            event
                .container_id
                .as_deref()
                .map(|c| format!(" in container {c}"))
                .unwrap_or_default()
        );
        Some(MatchResult {
            event:   PolicyEvent::new(self.id, &self.name, event, output),
            actions: self.actions.clone(),
        })
    }

    pub fn describe(&self) -> String {
        let rule = match &self.rule {
            Rule::ProcessName { names } => format!("process name in [{}]", names.join(", ")),
            Rule::ContainerImage { prefixes } => {
                format!("container image starting with [{}]", prefixes.join(", "))
            }
            Rule::FieldEquals { field, value } => format!("{field} == {value}"),
        };
        let state = if self.enabled { "" } else { " (disabled)" };
        format!(
            "policy {} '{}'{}: {} -> {} action(s)",
            self.id,
            self.name,
            state,
            rule,
            self.actions.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Policy {
        toml::from_str(
            r#"
            id = 7
            name = "shell in container"
            rule = { type = "process_name", names = ["sh", "bash"] }
            actions = [{ type = "tag", key = "severity", value = "high" }]
            "#,
        )
        .unwrap()
    }

    fn event(process: &str, image: Option<&str>) -> SystemEvent {
        SystemEvent {
            ts: chrono::Utc::now(),
            kind: "execve".into(),
            pid: 42,
            process_name: process.into(),
            container_id: Some("c0ffee".into()),
            container_image: image.map(Into::into),
            fields: Default::default(),
        }
    }

    #[test]
    fn process_name_rule_builds_report() {
        let hit = sample().try_match(&event("bash", None)).unwrap();
        assert_eq!(hit.event.policy_id, 7);
        assert_eq!(hit.event.output, "shell in container: execve by bash (pid 42) in container c0ffee");
        assert_eq!(hit.actions.len(), 1);
        assert!(sample().try_match(&event("nginx", None)).is_none());
    }

    #[test]
    fn disabled_policy_never_matches() {
        let mut p = sample();
        p.enabled = false;
        assert!(p.try_match(&event("sh", None)).is_none());
        assert!(p.describe().contains("(disabled)"));
    }

    #[test]
    fn image_prefix_and_field_rules() {
        let mut p = sample();
        p.rule = Rule::ContainerImage { prefixes: vec!["docker.io/library/".into()] };
        assert!(p.try_match(&event("x", Some("docker.io/library/redis:7"))).is_some());
        assert!(p.try_match(&event("x", Some("quay.io/redis"))).is_none());
        assert!(p.try_match(&event("x", None)).is_none());

        p.rule = Rule::FieldEquals { field: "proc.pid".into(), value: "42".into() };
        assert!(p.try_match(&event("x", None)).is_some());
        assert_eq!(p.describe(), "policy 7 'shell in container': proc.pid == 42 -> 1 action(s)");
    }
}
