//! Where finished policy events go.

use std::io::Write;

use crossbeam::channel::Sender;
use log::Level;

use crate::agent_log;
use crate::policy::event::PolicyEvent;

/// Receives every triggered event exactly once.
pub trait EventSink {
    fn emit(&mut self, event: PolicyEvent);
}

impl EventSink for Sender<PolicyEvent> {
    fn emit(&mut self, event: PolicyEvent) {
        let id = event.id;
        if self.send(event).is_err() {
            agent_log!(Level::Error, "sink", "event queue closed, discarding event {}", id);
        }
    }
}

impl EventSink for Vec<PolicyEvent> {
    fn emit(&mut self, event: PolicyEvent) {
        self.push(event);
    }
}

/// One JSON document per line.
pub struct JsonLinesSink<W> {
    out: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> EventSink for JsonLinesSink<W> {
    fn emit(&mut self, event: PolicyEvent) {
        let written = serde_json::to_writer(&mut self.out, &event)
            .map_err(std::io::Error::from)
            .and_then(|()| self.out.write_all(b"\n"))
            .and_then(|()| self.out.flush());
        if let Err(e) = written {
            agent_log!(Level::Error, "sink", "failed to write event {}: {}", event.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::event::SystemEvent;

    #[test]
    fn json_lines_are_newline_terminated() {
        let src: SystemEvent = serde_json::from_str(r#"{"kind":"connect"}"#).unwrap();
        let mut sink = JsonLinesSink::new(Vec::new());
        sink.emit(PolicyEvent::new(1, "a", &src, "x".into()));
        sink.emit(PolicyEvent::new(2, "b", &src, "y".into()));

        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let back: PolicyEvent = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(back.policy_name, "b");
    }
}
