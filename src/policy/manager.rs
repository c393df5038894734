//! Security manager
//! ================
//! The control loop that ties policies to actions. It owns the dispatcher
//! and the action tracker and is driven from a single thread:
//!
//!   process_event  match every enabled policy, trigger actions of each hit
//!   run_once       drain companion completions, then tick the tracker
//!   shutdown       fail everything in flight and emit whatever is left

use std::time::{Duration, Instant};

use log::Level;

use crate::agent_log;
use crate::actions::tracker::{ActionTracker, EventHandle};
use crate::comms::dispatcher::Dispatcher;
use crate::comms::transport::Transport;
use crate::policy::Policy;
use crate::policy::event::SystemEvent;

pub struct SecurityManager<T> {
    dispatcher: Dispatcher<T>,
    tracker:    ActionTracker,
    policies:   Vec<Policy>,
    deadline:   Duration,
}

impl<T: Transport> SecurityManager<T> {
    pub fn new(
        dispatcher: Dispatcher<T>,
        tracker: ActionTracker,
        policies: Vec<Policy>,
        deadline: Duration,
    ) -> Self {
        for policy in &policies {
            agent_log!(Level::Info, "manager", "loaded {}", policy.describe());
        }
        Self { dispatcher, tracker, policies, deadline }
    }

    /// Trigger the actions of every policy `event` matches, in policy order.
    pub fn process_event(&mut self, event: &SystemEvent, now: Instant) -> Vec<EventHandle> {
        let mut handles = Vec::new();
        for policy in &self.policies {
            let Some(hit) = policy.try_match(event) else { continue };
            agent_log!(Level::Info, "manager", "{}", hit.event.output);
            metrics::counter!("policy_matches_total").increment(1);
            handles.push(self.tracker.trigger(&mut self.dispatcher, hit.event, &hit.actions, now));
        }
        handles
    }

    /// One reactor cycle. Returns `false` while the companion connection is
    /// lost.
    pub fn run_once(&mut self, now: Instant) -> bool {
        let connected = self.dispatcher.pump();
        self.tracker.tick(now, self.deadline);
        connected
    }

    pub fn shutdown(&mut self, now: Instant) {
        agent_log!(
            Level::Info,
            "manager",
            "shutting down with {} pending event(s)",
            self.tracker.pending_count()
        );
        self.dispatcher.shutdown();
        self.tracker.tick(now, self.deadline);
        self.tracker.flush();
    }

    /// Nothing in flight and nothing waiting to be emitted.
    pub fn is_idle(&self) -> bool {
        self.dispatcher.in_flight() == 0 && self.tracker.pending_count() == 0
    }

    pub fn dispatcher(&self) -> &Dispatcher<T> {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher<T> {
        &mut self.dispatcher
    }

    pub fn tracker(&self) -> &ActionTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut ActionTracker {
        &mut self.tracker
    }

    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }
}
