//! Flow-metric events and the bounded ring they are published on.
//!
//! The data path and timer callbacks never block on metrics: submission is
//! a `try_send` onto a bounded channel, and a full ring surfaces as
//! [`NatError::RingFull`] so the caller defers cleanup to the next tick.
//! A userspace drain task consumes the receiving end.

use std::net::IpAddr;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::NatError;
use crate::packet::{Gress, L3Proto, L4Proto};

/// Whether an event reports a live flow or its deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MetricStatus {
    Active,
    Delete,
}

/// One periodic flow report.
///
/// For IPv4 the src/dst are (client, server); for IPv6 the src is the
/// client address reassembled from the stored prefix and the conntrack-key
/// suffix, and the dst is the flow trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NatConnMetricEvent {
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub l3_proto: L3Proto,
    pub l4_proto: L4Proto,
    pub flow_id: u8,
    /// Reserved; always zero.
    pub trace_id: u8,
    /// Engine-monotonic creation timestamp of the flow.
    pub create_time_ns: u64,
    /// Engine-monotonic emission timestamp.
    pub time_ns: u64,
    pub ingress_bytes: u64,
    pub ingress_packets: u64,
    pub egress_bytes: u64,
    pub egress_packets: u64,
    pub cpu_id: u32,
    pub status: MetricStatus,
    /// Direction of the packet that created the flow.
    pub gress: Gress,
}

/// Producer half of the metric ring.
pub(crate) struct MetricReporter {
    tx: mpsc::Sender<NatConnMetricEvent>,
}

impl MetricReporter {
    pub(crate) fn new(capacity: usize) -> (Self, mpsc::Receiver<NatConnMetricEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Non-blocking submit. A full ring is the caller's signal to retry at
    /// the next tick; a disconnected drain discards the event so shutdown
    /// can never wedge flow cleanup.
    pub(crate) fn try_report(&self, event: NatConnMetricEvent) -> Result<(), NatError> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(NatError::RingFull),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::trace!("metric drain disconnected, discarding event");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn sample_event(status: MetricStatus) -> NatConnMetricEvent {
        NatConnMetricEvent {
            src_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
            dst_addr: IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
            src_port: 40000,
            dst_port: 80,
            l3_proto: L3Proto::Ipv4,
            l4_proto: L4Proto::Tcp,
            flow_id: 3,
            trace_id: 0,
            create_time_ns: 1_000,
            time_ns: 6_000,
            ingress_bytes: 1500,
            ingress_packets: 2,
            egress_bytes: 700,
            egress_packets: 5,
            cpu_id: 1,
            status,
            gress: Gress::Egress,
        }
    }

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (reporter, mut rx) = MetricReporter::new(8);
        reporter.try_report(sample_event(MetricStatus::Active)).unwrap();
        reporter.try_report(sample_event(MetricStatus::Delete)).unwrap();

        assert_eq!(rx.recv().await.unwrap().status, MetricStatus::Active);
        assert_eq!(rx.recv().await.unwrap().status, MetricStatus::Delete);
    }

    #[tokio::test]
    async fn test_full_ring_reports_ring_full() {
        let (reporter, mut rx) = MetricReporter::new(1);
        reporter.try_report(sample_event(MetricStatus::Active)).unwrap();
        let err = reporter.try_report(sample_event(MetricStatus::Active)).unwrap_err();
        assert!(matches!(err, NatError::RingFull));

        // Draining one slot makes room again.
        rx.recv().await.unwrap();
        assert!(reporter.try_report(sample_event(MetricStatus::Active)).is_ok());
    }

    #[tokio::test]
    async fn test_closed_drain_discards_instead_of_wedging() {
        let (reporter, rx) = MetricReporter::new(1);
        drop(rx);
        assert!(
            reporter.try_report(sample_event(MetricStatus::Delete)).is_ok(),
            "cleanup must proceed when the drain is gone"
        );
    }

    #[test]
    fn test_event_serializes_with_expected_fields() {
        let json = serde_json::to_value(sample_event(MetricStatus::Active)).unwrap();
        assert_eq!(json["src_addr"], "10.0.0.5");
        assert_eq!(json["dst_port"], 80);
        assert_eq!(json["status"], "Active");
        assert_eq!(json["trace_id"], 0);
        assert_eq!(json["gress"], "Egress");
    }
}
