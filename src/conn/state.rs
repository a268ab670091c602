//! Shared per-flow state machine and counters.
//!
//! Each conntrack value embeds one [`FlowState`]: two per-direction
//! connection states, the orthogonal reporting state, the byte/packet
//! counters, and the flow timer. All mutation goes through atomics
//! (fetch-add counters, compare-and-swap state hops) so the data path
//! stays lock-free under concurrent packets of the same flow.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use crate::config::NatConfig;
use crate::conn::timer::{Clock, FlowTimer};
use crate::error::NatError;
use crate::packet::{Gress, L4Proto, PktType};

/// Per-direction position in the connection lifecycle. This is the engine's
/// coarse view, not the full TCP state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ConnState {
    Init = 0,
    Syn = 1,
    LessEst = 2,
    Fin = 3,
}

impl ConnState {
    fn from_raw(raw: u64) -> Self {
        match raw {
            1 => ConnState::Syn,
            2 => ConnState::LessEst,
            3 => ConnState::Fin,
            _ => ConnState::Init,
        }
    }

    /// Connection-axis target for a packet class; `None` means the class
    /// does not move the connection state.
    fn target_for(pkt_type: PktType) -> Option<ConnState> {
        match pkt_type {
            PktType::Connless => Some(ConnState::LessEst),
            PktType::TcpSyn => Some(ConnState::Syn),
            PktType::TcpRst => Some(ConnState::Init),
            PktType::TcpFin => Some(ConnState::Fin),
            PktType::TcpAck | PktType::IcmpError => None,
        }
    }
}

/// Position on the reporting/idle-timeout axis, advanced by timer ticks and
/// bounced back to `Active` by any data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ReportState {
    Init = 0,
    Active = 1,
    Timeout1 = 2,
    Timeout2 = 3,
    Release = 4,
}

impl ReportState {
    fn from_raw(raw: u64) -> Self {
        match raw {
            1 => ReportState::Active,
            2 => ReportState::Timeout1,
            3 => ReportState::Timeout2,
            4 => ReportState::Release,
            _ => ReportState::Init,
        }
    }
}

/// The idle timeout scheduled on the `Timeout2 -> Release` hop: full TCP
/// timeout only for synchronized flows, the short SYN timeout otherwise,
/// and the UDP timeout for everything connectionless.
pub(crate) fn idle_timeout(
    l4proto: L4Proto,
    client: ConnState,
    server: ConnState,
    config: &NatConfig,
) -> Duration {
    match l4proto {
        L4Proto::Tcp => {
            if client == ConnState::Syn && server == ConnState::Syn {
                config.tcp_timeout
            } else {
                config.tcp_syn_timeout
            }
        }
        _ => config.udp_timeout,
    }
}

/// Next reporting state and tick delay for a timer callback observing
/// `current`. `Release` itself never reaches this function; the callback
/// handles deletion before advancing.
pub(crate) fn next_report_step(
    current: ReportState,
    l4proto: L4Proto,
    client: ConnState,
    server: ConnState,
    config: &NatConfig,
) -> (ReportState, Duration) {
    match current {
        ReportState::Active => (ReportState::Timeout1, config.report_interval),
        ReportState::Timeout1 => (ReportState::Timeout2, config.report_interval),
        ReportState::Timeout2 => (
            ReportState::Release,
            idle_timeout(l4proto, client, server, config),
        ),
        // Init (or anything unexpected) drifts toward release.
        ReportState::Init | ReportState::Release => (ReportState::Timeout2, config.report_interval),
    }
}

/// Snapshot of the traffic counters for metric emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowCounters {
    pub ingress_bytes: u64,
    pub ingress_packets: u64,
    pub egress_bytes: u64,
    pub egress_packets: u64,
}

/// Lock-free mutable core shared by the v4 and v6 conntrack values.
#[derive(Debug)]
pub(crate) struct FlowState {
    client_state: AtomicU64,
    server_state: AtomicU64,
    report_state: AtomicU64,
    ingress_bytes: AtomicU64,
    ingress_packets: AtomicU64,
    egress_bytes: AtomicU64,
    egress_packets: AtomicU64,
    create_time_ns: u64,
    /// Direction of the packet that created the entry.
    gress: Gress,
    flow_id: AtomicU8,
    cpu_id: u32,
    timer: FlowTimer,
}

impl FlowState {
    /// Fresh state with the timer already armed at the report interval.
    pub(crate) fn new(
        clock: &Clock,
        gress: Gress,
        flow_id: u8,
        cpu_id: u32,
        report_interval: Duration,
    ) -> Self {
        Self {
            client_state: AtomicU64::new(ConnState::Init as u64),
            server_state: AtomicU64::new(ConnState::Init as u64),
            report_state: AtomicU64::new(ReportState::Init as u64),
            ingress_bytes: AtomicU64::new(0),
            ingress_packets: AtomicU64::new(0),
            egress_bytes: AtomicU64::new(0),
            egress_packets: AtomicU64::new(0),
            create_time_ns: clock.now_ns(),
            gress,
            flow_id: AtomicU8::new(flow_id),
            cpu_id,
            timer: FlowTimer::armed(clock, report_interval),
        }
    }

    pub(crate) fn timer(&self) -> &FlowTimer {
        &self.timer
    }

    pub(crate) fn client_state(&self) -> ConnState {
        ConnState::from_raw(self.client_state.load(Ordering::Acquire))
    }

    pub(crate) fn server_state(&self) -> ConnState {
        ConnState::from_raw(self.server_state.load(Ordering::Acquire))
    }

    pub(crate) fn report_state(&self) -> ReportState {
        ReportState::from_raw(self.report_state.load(Ordering::Acquire))
    }

    pub(crate) fn create_time_ns(&self) -> u64 {
        self.create_time_ns
    }

    pub(crate) fn gress(&self) -> Gress {
        self.gress
    }

    pub(crate) fn flow_id(&self) -> u8 {
        self.flow_id.load(Ordering::Relaxed)
    }

    pub(crate) fn set_flow_id(&self, flow_id: u8) {
        self.flow_id.store(flow_id, Ordering::Relaxed);
    }

    pub(crate) fn cpu_id(&self) -> u32 {
        self.cpu_id
    }

    /// Applies a packet to the state machine: connection-axis CAS for the
    /// packet's direction, then an exchange of the reporting state to
    /// `Active`, re-arming the timer if it was not already active.
    ///
    /// A lost CAS means a concurrent packet moved the state first; the
    /// caller drops this packet and the flow recovers on the next one.
    pub(crate) fn on_packet(
        &self,
        gress: Gress,
        pkt_type: PktType,
        clock: &Clock,
        report_interval: Duration,
    ) -> Result<(), NatError> {
        let slot = match gress {
            Gress::Ingress => &self.server_state,
            Gress::Egress => &self.client_state,
        };
        if let Some(next) = ConnState::target_for(pkt_type) {
            let current = slot.load(Ordering::Acquire);
            slot.compare_exchange(current, next as u64, Ordering::AcqRel, Ordering::Acquire)
                .map_err(|_| NatError::StateRace)?;
        }

        let prev = self.report_state.swap(ReportState::Active as u64, Ordering::AcqRel);
        if prev != ReportState::Active as u64 {
            self.timer.arm(clock, report_interval);
        }
        Ok(())
    }

    /// Adds a packet to the per-direction counters.
    pub(crate) fn accumulate(&self, ingress: bool, bytes: u64) {
        if ingress {
            self.ingress_bytes.fetch_add(bytes, Ordering::Relaxed);
            self.ingress_packets.fetch_add(1, Ordering::Relaxed);
        } else {
            self.egress_bytes.fetch_add(bytes, Ordering::Relaxed);
            self.egress_packets.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn counters(&self) -> FlowCounters {
        FlowCounters {
            ingress_bytes: self.ingress_bytes.load(Ordering::Relaxed),
            ingress_packets: self.ingress_packets.load(Ordering::Relaxed),
            egress_bytes: self.egress_bytes.load(Ordering::Relaxed),
            egress_packets: self.egress_packets.load(Ordering::Relaxed),
        }
    }

    /// One reporting-state hop from a timer callback. Returns the delay for
    /// the next tick; a lost CAS (a data packet bounced the state back to
    /// `Active` meanwhile) is reported so the caller re-arms at the plain
    /// report interval.
    pub(crate) fn advance_report(
        &self,
        l4proto: L4Proto,
        config: &NatConfig,
    ) -> Result<Duration, NatError> {
        let current = self.report_state();
        let (next, delay) = next_report_step(
            current,
            l4proto,
            self.client_state(),
            self.server_state(),
            config,
        );
        self.report_state
            .compare_exchange(
                current as u64,
                next as u64,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| NatError::StateRace)?;
        Ok(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(clock: &Clock) -> FlowState {
        FlowState::new(clock, Gress::Egress, 7, 0, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_new_flow_starts_in_init() {
        let clock = Clock::new();
        let f = flow(&clock);
        assert_eq!(f.client_state(), ConnState::Init);
        assert_eq!(f.server_state(), ConnState::Init);
        assert_eq!(f.report_state(), ReportState::Init);
        assert_eq!(f.counters(), FlowCounters {
            ingress_bytes: 0,
            ingress_packets: 0,
            egress_bytes: 0,
            egress_packets: 0,
        });
        assert_eq!(f.flow_id(), 7);
    }

    #[tokio::test]
    async fn test_packet_classes_move_connection_state() {
        let clock = Clock::new();
        let interval = Duration::from_secs(5);

        let f = flow(&clock);
        f.on_packet(Gress::Egress, PktType::TcpSyn, &clock, interval).unwrap();
        assert_eq!(f.client_state(), ConnState::Syn);
        assert_eq!(f.server_state(), ConnState::Init, "other direction untouched");

        f.on_packet(Gress::Ingress, PktType::TcpSyn, &clock, interval).unwrap();
        assert_eq!(f.server_state(), ConnState::Syn);

        f.on_packet(Gress::Egress, PktType::TcpFin, &clock, interval).unwrap();
        assert_eq!(f.client_state(), ConnState::Fin);

        f.on_packet(Gress::Egress, PktType::TcpRst, &clock, interval).unwrap();
        assert_eq!(f.client_state(), ConnState::Init);

        let f = flow(&clock);
        f.on_packet(Gress::Egress, PktType::Connless, &clock, interval).unwrap();
        assert_eq!(f.client_state(), ConnState::LessEst);
    }

    #[tokio::test]
    async fn test_ack_and_icmp_error_leave_connection_state() {
        let clock = Clock::new();
        let interval = Duration::from_secs(5);
        let f = flow(&clock);
        f.on_packet(Gress::Egress, PktType::TcpSyn, &clock, interval).unwrap();
        f.on_packet(Gress::Egress, PktType::TcpAck, &clock, interval).unwrap();
        assert_eq!(f.client_state(), ConnState::Syn);
        f.on_packet(Gress::Egress, PktType::IcmpError, &clock, interval).unwrap();
        assert_eq!(f.client_state(), ConnState::Syn);
    }

    #[tokio::test]
    async fn test_any_packet_sets_report_active_and_rearms() {
        let clock = Clock::new();
        let f = flow(&clock);
        let deadline_before = f.timer().deadline_ns();

        tokio::time::sleep(Duration::from_millis(10)).await;
        f.on_packet(Gress::Egress, PktType::TcpAck, &clock, Duration::from_secs(5)).unwrap();
        assert_eq!(f.report_state(), ReportState::Active);
        assert!(
            f.timer().deadline_ns() >= deadline_before,
            "timer re-armed when state was not Active"
        );

        // Second packet while already Active must not move the deadline.
        let deadline = f.timer().deadline_ns();
        f.on_packet(Gress::Egress, PktType::TcpAck, &clock, Duration::from_secs(5)).unwrap();
        assert_eq!(f.timer().deadline_ns(), deadline);
    }

    #[tokio::test]
    async fn test_accumulate_per_direction() {
        let clock = Clock::new();
        let f = flow(&clock);
        f.accumulate(false, 100);
        f.accumulate(false, 50);
        f.accumulate(true, 900);
        let c = f.counters();
        assert_eq!(c.egress_bytes, 150);
        assert_eq!(c.egress_packets, 2);
        assert_eq!(c.ingress_bytes, 900);
        assert_eq!(c.ingress_packets, 1);
    }

    #[test]
    fn test_report_progression_order() {
        let cfg = NatConfig::default();
        let (s1, d1) = next_report_step(
            ReportState::Active,
            L4Proto::Udp,
            ConnState::LessEst,
            ConnState::LessEst,
            &cfg,
        );
        assert_eq!((s1, d1), (ReportState::Timeout1, cfg.report_interval));

        let (s2, d2) =
            next_report_step(s1, L4Proto::Udp, ConnState::LessEst, ConnState::LessEst, &cfg);
        assert_eq!((s2, d2), (ReportState::Timeout2, cfg.report_interval));

        let (s3, d3) =
            next_report_step(s2, L4Proto::Udp, ConnState::LessEst, ConnState::LessEst, &cfg);
        assert_eq!((s3, d3), (ReportState::Release, cfg.udp_timeout));
    }

    #[test]
    fn test_release_delay_depends_on_handshake() {
        let cfg = NatConfig::default();
        assert_eq!(
            idle_timeout(L4Proto::Tcp, ConnState::Syn, ConnState::Syn, &cfg),
            cfg.tcp_timeout,
            "synchronized TCP gets the long timeout"
        );
        assert_eq!(
            idle_timeout(L4Proto::Tcp, ConnState::Syn, ConnState::Init, &cfg),
            cfg.tcp_syn_timeout,
            "half-open TCP gets the short timeout"
        );
        assert_eq!(
            idle_timeout(L4Proto::Icmp, ConnState::LessEst, ConnState::Init, &cfg),
            cfg.udp_timeout
        );
    }

    #[test]
    fn test_unexpected_state_drifts_to_timeout2() {
        let cfg = NatConfig::default();
        let (s, d) = next_report_step(
            ReportState::Init,
            L4Proto::Tcp,
            ConnState::Init,
            ConnState::Init,
            &cfg,
        );
        assert_eq!((s, d), (ReportState::Timeout2, cfg.report_interval));
    }

    #[tokio::test]
    async fn test_advance_report_walks_to_release() {
        let clock = Clock::new();
        let cfg = NatConfig::default();
        let f = flow(&clock);
        f.on_packet(Gress::Egress, PktType::Connless, &clock, cfg.report_interval).unwrap();
        assert_eq!(f.report_state(), ReportState::Active);

        assert_eq!(f.advance_report(L4Proto::Udp, &cfg).unwrap(), cfg.report_interval);
        assert_eq!(f.report_state(), ReportState::Timeout1);
        assert_eq!(f.advance_report(L4Proto::Udp, &cfg).unwrap(), cfg.report_interval);
        assert_eq!(f.report_state(), ReportState::Timeout2);
        assert_eq!(f.advance_report(L4Proto::Udp, &cfg).unwrap(), cfg.udp_timeout);
        assert_eq!(f.report_state(), ReportState::Release);
    }
}
