//! Policy actions and the tracker that merges their results.

pub mod local;
pub mod sink;
pub mod spec;
pub mod tracker;

pub use local::{CaptureJob, LocalActions, LocalExecutor};
pub use sink::{EventSink, JsonLinesSink};
pub use spec::{ActionKind, ActionSpec, Execution};
pub use tracker::{ActionTracker, EventHandle, PendingEvent};
