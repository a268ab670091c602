//! Stateful NAT engine core for a router-style egress/ingress path.
//!
//! IPv4 traffic goes through a port-allocating NAPT with paired
//! bidirectional mappings; IPv6 traffic through per-suffix prefix
//! translation. Both families share one conntrack state machine with
//! timer-driven lifecycle (idle, staged timeouts, release) and periodic
//! flow-metric events on a bounded ring. Packet parsing and re-injection
//! live outside the crate: callers hand in [`PacketOffsetInfo`] plus an
//! address pair and receive rewrites through the [`PacketEditor`] contract.

mod config;
mod conn;
mod engine;
mod error;
mod metrics;
mod nat4;
mod nat6;
mod packet;

pub use config::{init_tracing, NatConfig, PortRange};
pub use conn::{Clock, ConnState, FlowCounters, ReportState};
pub use engine::{EngineStats, NatEngine, PacketPair};
pub use error::{NatError, Verdict};
pub use metrics::{MetricStatus, NatConnMetricEvent};
pub use packet::editor::{BufEditor, CsumFlags, PacketEditor};
pub use packet::{
    Gress, L3Proto, L4Proto, PacketOffsetInfo, Pair4, Pair6, PktType, SkbMeta,
    INGRESS_STATIC_MARK, MARK_ALLOW_REUSE, MARK_CACHE_MASK, MARK_FLOW_ID_MASK,
};
