//! Action tracker
//! ==============
//! Holds each policy event open until every action it triggered has
//! resolved, then hands it to the sink exactly once.
//
//! Synchronous actions are merged while the event is being triggered.
//! Asynchronous ones go through the dispatcher; their callbacks never touch
//! tracker state directly but post an `ActionUpdate` on a channel the
//! tracker owns, applied at the start of every `tick`. An event therefore
//! leaves the tracker in one of three ways:
//!   • all slots resolved        → emitted as is
//!   • deadline passed           → unresolved slots marked `TimedOut`
//!   • `force_emit` / `flush`    → unresolved slots left `Pending`
//! Updates for an event that already left are dropped.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, unbounded};
use log::Level;

use crate::agent_log;
use crate::actions::local::LocalActions;
use crate::actions::sink::EventSink;
use crate::actions::spec::{ActionSpec, Execution};
use crate::comms::dispatcher::{DispatchError, Dispatcher};
use crate::comms::messages::Reply;
use crate::comms::transport::Transport;
use crate::policy::event::{ActionResult, ActionStatus, PolicyEvent};

/// Identifies a triggered event for its whole life in the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventHandle(pub u64);

#[derive(Debug)]
enum UpdateKind {
    /// A streaming action produced one more message.
    Record,
    Resolved(ActionStatus, Option<String>),
}

#[derive(Debug)]
struct ActionUpdate {
    event:  u64,
    slot:   usize,
    kind:   UpdateKind,
}

/// An event waiting on its asynchronous actions.
#[derive(Debug, Clone)]
pub struct PendingEvent {
    /// Results accumulate in `payload.action_results`, one slot per action.
    pub payload:    PolicyEvent,
    pub expected:   usize,
    pub remaining:  usize,
    pub created_at: Instant,
    pub force_emit: bool,
}

pub struct ActionTracker {
    next_id:    u64,
    pending:    BTreeMap<u64, PendingEvent>,
    updates_tx: Sender<ActionUpdate>,
    updates_rx: Receiver<ActionUpdate>,
    local:      Box<dyn LocalActions>,
    sink:       Box<dyn EventSink>,
    emitted:    u64,
}

impl ActionTracker {
    pub fn new(local: Box<dyn LocalActions>, sink: Box<dyn EventSink>) -> Self {
        let (updates_tx, updates_rx) = unbounded();
        Self {
            next_id: 1,
            pending: BTreeMap::new(),
            updates_tx,
            updates_rx,
            local,
            sink,
            emitted: 0,
        }
    }

    /// Run or submit every action of a matched event. Events with no
    /// asynchronous action are emitted before this returns.
    pub fn trigger<T: Transport>(
        &mut self,
        dispatcher: &mut Dispatcher<T>,
        mut payload: PolicyEvent,
        actions: &[ActionSpec],
        now: Instant,
    ) -> EventHandle {
        let id = self.next_id;
        self.next_id += 1;
        payload.id = id;

        let mut submissions = Vec::new();
        for spec in actions {
            let kind = spec.kind();
            match spec.execution(&payload) {
                Execution::Local => {
                    let result = self.local.execute(spec, &mut payload);
                    payload.action_results.push(result);
                }
                Execution::Rejected(reason) => {
                    payload.action_results.push(ActionResult::failed(kind, reason));
                }
                remote => {
                    submissions.push((payload.action_results.len(), remote));
                    payload.action_results.push(ActionResult::pending(kind));
                }
            }
        }

        let expected = submissions.len();
        if expected == 0 {
            self.emit(payload);
            return EventHandle(id);
        }

        agent_log!(
            Level::Debug,
            "tracker",
            "event {} ({}) waits on {} action(s)",
            id,
            payload.policy_name,
            expected
        );
        self.pending.insert(id, PendingEvent {
            payload,
            expected,
            remaining: expected,
            created_at: now,
            force_emit: false,
        });

        for (slot, execution) in submissions {
            let tx = self.updates_tx.clone();
            match execution {
                Execution::Unary(request) => {
                    dispatcher.submit_unary(request, move |result: Result<Reply, DispatchError>| {
                        let (status, detail) = match result {
                            Ok(reply) => match reply.verdict() {
                                Ok(()) => (ActionStatus::Completed, None),
                                Err(e) => (ActionStatus::Failed, Some(e)),
                            },
                            Err(e) => (ActionStatus::Failed, Some(e.to_string())),
                        };
                        let kind = UpdateKind::Resolved(status, detail);
                        let _ = tx.send(ActionUpdate { event: id, slot, kind });
                    });
                }
                Execution::Stream(request) => {
                    dispatcher.submit_stream(request, move |result: Result<Reply, DispatchError>| {
                        let kind = match result {
                            Ok(_) => UpdateKind::Record,
                            Err(DispatchError::StreamEnded) => {
                                UpdateKind::Resolved(ActionStatus::Completed, None)
                            }
                            Err(e) => UpdateKind::Resolved(ActionStatus::Failed, Some(e.to_string())),
                        };
                        let _ = tx.send(ActionUpdate { event: id, slot, kind });
                    });
                }
                Execution::Local | Execution::Rejected(_) => {}
            }
        }
        EventHandle(id)
    }

    /// Apply posted results, then emit every event that is complete, forced,
    /// or older than `deadline`.
    pub fn tick(&mut self, now: Instant, deadline: Duration) {
        self.apply_updates();

        let due: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| {
                // a deadline too large to represent never expires
                p.force_emit || p.created_at.checked_add(deadline).is_some_and(|due| due <= now)
            })
            .map(|(id, _)| *id)
            .collect();

        for id in due {
            let Some(mut pending) = self.pending.remove(&id) else { continue };
            if !pending.force_emit {
                agent_log!(
                    Level::Warn,
                    "tracker",
                    "event {} timed out with {}/{} action(s) unresolved",
                    id,
                    pending.remaining,
                    pending.expected
                );
                metrics::counter!("actions_timeouts_total").increment(pending.remaining as u64);
                for result in &mut pending.payload.action_results {
                    if result.status == ActionStatus::Pending {
                        result.status = ActionStatus::TimedOut;
                    }
                }
            }
            self.emit(pending.payload);
        }
    }

    fn apply_updates(&mut self) {
        while let Ok(update) = self.updates_rx.try_recv() {
            let Some(pending) = self.pending.get_mut(&update.event) else {
                agent_log!(
                    Level::Debug,
                    "tracker",
                    "late result for event {} slot {} ignored",
                    update.event,
                    update.slot
                );
                continue;
            };
            let Some(result) = pending.payload.action_results.get_mut(update.slot) else {
                continue;
            };
            if result.status != ActionStatus::Pending {
                continue;
            }
            match update.kind {
                UpdateKind::Record => result.records += 1,
                UpdateKind::Resolved(status, detail) => {
                    result.status = status;
                    result.detail = detail;
                    pending.remaining -= 1;
                    if pending.remaining == 0 {
                        if let Some(done) = self.pending.remove(&update.event) {
                            self.emit(done.payload);
                        }
                    }
                }
            }
        }
    }

    /// Emit on the next `tick` without waiting for outstanding actions.
    /// Returns `false` if the event is no longer pending.
    pub fn force_emit(&mut self, handle: EventHandle) -> bool {
        match self.pending.get_mut(&handle.0) {
            Some(pending) => {
                pending.force_emit = true;
                true
            }
            None => false,
        }
    }

    /// Emit everything still pending. Used on shutdown.
    pub fn flush(&mut self) {
        self.apply_updates();
        for (_, pending) in std::mem::take(&mut self.pending) {
            self.emit(pending.payload);
        }
    }

    fn emit(&mut self, payload: PolicyEvent) {
        agent_log!(
            Level::Debug,
            "tracker",
            "emitting event {} ({})",
            payload.id,
            payload.policy_name
        );
        self.emitted += 1;
        metrics::counter!("actions_events_emitted_total").increment(1);
        self.sink.emit(payload);
    }

    pub fn pending(&self, handle: EventHandle) -> Option<&PendingEvent> {
        self.pending.get(&handle.0)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::local::LocalExecutor;
    use crate::comms::dispatcher::DispatcherConfig;
    use crate::comms::messages::{NotifyResult, Request};
    use crate::comms::mock::MockTransport;
    use crate::policy::event::SystemEvent;
    use crossbeam::channel::Receiver;

    fn setup() -> (ActionTracker, Dispatcher<MockTransport>, Receiver<PolicyEvent>) {
        let (local, _captures) = LocalExecutor::new();
        let (tx, rx) = unbounded();
        let tracker = ActionTracker::new(Box::new(local), Box::new(tx));
        let dispatcher = Dispatcher::new(DispatcherConfig::default(), MockTransport::new());
        (tracker, dispatcher, rx)
    }

    fn payload() -> PolicyEvent {
        let src: SystemEvent = serde_json::from_str(r#"{"kind":"execve","container_id":"c1"}"#).unwrap();
        PolicyEvent::new(1, "policy", &src, "matched".into())
    }

    fn notify() -> ActionSpec {
        ActionSpec::Notify { channel: "ops".into(), message: "hi".into() }
    }

    #[test]
    fn sync_only_event_is_emitted_immediately() {
        let (mut tracker, mut d, rx) = setup();
        let actions = [ActionSpec::Tag { key: "a".into(), value: "b".into() }];
        let handle = tracker.trigger(&mut d, payload(), &actions, Instant::now());

        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.id, handle.0);
        assert_eq!(ev.action_results.len(), 1);
        assert!(tracker.pending(handle).is_none());
        assert_eq!(d.in_flight(), 0);
    }

    #[test]
    fn pending_event_counts_async_actions_only() {
        let (mut tracker, mut d, rx) = setup();
        let actions = [notify(), ActionSpec::Tag { key: "a".into(), value: "b".into() }, notify()];
        let handle = tracker.trigger(&mut d, payload(), &actions, Instant::now());

        let pending = tracker.pending(handle).unwrap();
        assert_eq!((pending.expected, pending.remaining), (2, 2));
        assert!(rx.try_recv().is_err());
        assert_eq!(d.transport().sent().len(), 2);
    }

    #[test]
    fn negative_verdict_is_a_failed_slot() {
        let (mut tracker, mut d, rx) = setup();
        let now = Instant::now();
        tracker.trigger(&mut d, payload(), &[notify()], now);
        let token = d.transport().sent()[0].0;
        assert!(matches!(d.transport().sent()[0].1, Request::Notify(_)));

        d.transport_mut().reply(token, Reply::Notify(NotifyResult { successful: false, errstr: "429".into() }));
        d.drain(10);
        tracker.tick(now, Duration::from_secs(30));

        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.action_results[0].status, ActionStatus::Failed);
        assert_eq!(ev.action_results[0].detail.as_deref(), Some("429"));
    }

    #[test]
    fn force_emit_leaves_unresolved_pending() {
        let (mut tracker, mut d, rx) = setup();
        let now = Instant::now();
        let handle = tracker.trigger(&mut d, payload(), &[notify()], now);
        assert!(tracker.force_emit(handle));
        tracker.tick(now, Duration::from_secs(30));

        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.action_results[0].status, ActionStatus::Pending);
        assert!(!tracker.force_emit(handle));
    }
}
