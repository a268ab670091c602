//! Flow lifecycle shared across both address families: the connection /
//! reporting state machine and the per-entry timers that drive it.

pub mod state;
pub mod timer;

pub use state::{ConnState, FlowCounters, ReportState};
pub use timer::Clock;
