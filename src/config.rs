//! Runtime tunables for the NAT engine.
//!
//! All timeouts, port ranges, and capacities are collected here so a
//! deployment can adjust them in one place (or deserialize them from its
//! config file) instead of hunting constants across modules.

use std::time::Duration;

use serde::Deserialize;

use crate::packet::L4Proto;

/// Inclusive port range used for NAT port allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Number of ports in the range.
    pub fn len(&self) -> u32 {
        u32::from(self.end) - u32::from(self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    /// Maps an arbitrary port into the range, keeping in-range ports as-is.
    pub fn clamp_into(&self, port: u16) -> u16 {
        if self.contains(port) {
            port
        } else {
            self.start + (u32::from(port) % self.len()) as u16
        }
    }

    /// Next candidate during a scan, wrapping from `end` back to `start`.
    pub fn next_wrapping(&self, port: u16) -> u16 {
        if port >= self.end {
            self.start
        } else {
            port + 1
        }
    }
}

fn default_tcp_syn_timeout() -> Duration {
    Duration::from_secs(6)
}

fn default_tcp_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_udp_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_report_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_port_range() -> PortRange {
    PortRange::new(32768, 65535)
}

fn default_mapping_capacity() -> usize {
    2 * 64 * 1024
}

fn default_conntrack_capacity() -> usize {
    2 * 64 * 1024
}

fn default_static6_capacity() -> usize {
    64 * 1024
}

fn default_metric_ring_capacity() -> usize {
    64 * 1024
}

fn default_drop_log_per_second() -> u32 {
    10
}

fn default_log_filter() -> String {
    "natcore=info".into()
}

/// Engine configuration; every field has a production default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatConfig {
    /// Idle timeout for TCP flows that never completed a handshake.
    pub tcp_syn_timeout: Duration,
    /// Idle timeout for synchronized TCP flows.
    pub tcp_timeout: Duration,
    /// Idle timeout for UDP and ICMP flows.
    pub udp_timeout: Duration,
    /// Spacing of flow-metric reports and reporting-state hops.
    pub report_interval: Duration,
    pub tcp_ports: PortRange,
    pub udp_ports: PortRange,
    pub icmp_ports: PortRange,
    /// Max entries in the v4 mapping table (egress + ingress rows).
    pub mapping_capacity: usize,
    /// Max entries per conntrack table.
    pub conntrack_capacity: usize,
    /// Max entries in the v6 static mapping store.
    pub static6_capacity: usize,
    /// Bounded capacity of the metric event ring.
    pub metric_ring_capacity: usize,
    /// Budget for drop-path log lines; 0 disables them entirely.
    pub drop_log_per_second: u32,
    /// Default `tracing` filter directive when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            tcp_syn_timeout: default_tcp_syn_timeout(),
            tcp_timeout: default_tcp_timeout(),
            udp_timeout: default_udp_timeout(),
            report_interval: default_report_interval(),
            tcp_ports: default_port_range(),
            udp_ports: default_port_range(),
            icmp_ports: default_port_range(),
            mapping_capacity: default_mapping_capacity(),
            conntrack_capacity: default_conntrack_capacity(),
            static6_capacity: default_static6_capacity(),
            metric_ring_capacity: default_metric_ring_capacity(),
            drop_log_per_second: default_drop_log_per_second(),
            log_filter: default_log_filter(),
        }
    }
}

impl NatConfig {
    /// Allocation range for the given transport.
    pub fn port_range(&self, l4: L4Proto) -> PortRange {
        match l4 {
            L4Proto::Tcp => self.tcp_ports,
            L4Proto::Udp => self.udp_ports,
            L4Proto::Icmp | L4Proto::Icmpv6 => self.icmp_ports,
        }
    }

    /// Staleness horizon for mapping-slot reclaim. ICMP shares the UDP
    /// timeout.
    pub fn mapping_timeout(&self, l4: L4Proto) -> Duration {
        match l4 {
            L4Proto::Tcp => self.tcp_timeout,
            _ => self.udp_timeout,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, range) in [
            ("tcp_ports", self.tcp_ports),
            ("udp_ports", self.udp_ports),
            ("icmp_ports", self.icmp_ports),
        ] {
            anyhow::ensure!(!range.is_empty(), "{name}: start must not exceed end");
        }
        anyhow::ensure!(
            !self.report_interval.is_zero(),
            "report_interval must be non-zero"
        );
        anyhow::ensure!(self.mapping_capacity >= 2, "mapping_capacity too small");
        anyhow::ensure!(self.conntrack_capacity >= 1, "conntrack_capacity too small");
        anyhow::ensure!(
            self.metric_ring_capacity >= 1,
            "metric_ring_capacity too small"
        );
        Ok(())
    }
}

/// Initializes the global `tracing` subscriber.
///
/// `RUST_LOG` wins when set; otherwise the configured filter applies.
pub fn init_tracing(config: &NatConfig) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_filter.clone().into()),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let cfg = NatConfig::default();
        assert_eq!(cfg.tcp_syn_timeout, Duration::from_secs(6));
        assert_eq!(cfg.tcp_timeout, Duration::from_secs(600));
        assert_eq!(cfg.udp_timeout, Duration::from_secs(300));
        assert_eq!(cfg.report_interval, Duration::from_secs(5));
        assert_eq!(cfg.tcp_ports, PortRange::new(32768, 65535));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_port_range_selection() {
        let cfg = NatConfig::default();
        assert_eq!(cfg.port_range(L4Proto::Tcp), cfg.tcp_ports);
        assert_eq!(cfg.port_range(L4Proto::Udp), cfg.udp_ports);
        assert_eq!(cfg.port_range(L4Proto::Icmp), cfg.icmp_ports);
    }

    #[test]
    fn test_icmp_shares_udp_timeout() {
        let cfg = NatConfig::default();
        assert_eq!(cfg.mapping_timeout(L4Proto::Icmp), cfg.udp_timeout);
        assert_eq!(cfg.mapping_timeout(L4Proto::Udp), cfg.udp_timeout);
        assert_eq!(cfg.mapping_timeout(L4Proto::Tcp), cfg.tcp_timeout);
    }

    #[test]
    fn test_clamp_into_preserves_in_range_ports() {
        let range = PortRange::new(32768, 65535);
        assert_eq!(range.clamp_into(40000), 40000);
        assert_eq!(range.clamp_into(32768), 32768);
        assert_eq!(range.clamp_into(65535), 65535);
    }

    #[test]
    fn test_clamp_into_wraps_low_ports() {
        let range = PortRange::new(32768, 65535);
        let mapped = range.clamp_into(80);
        assert!(range.contains(mapped));
        assert_eq!(mapped, 32768 + (80 % range.len()) as u16);
    }

    #[test]
    fn test_next_wrapping() {
        let range = PortRange::new(100, 102);
        assert_eq!(range.next_wrapping(100), 101);
        assert_eq!(range.next_wrapping(101), 102);
        assert_eq!(range.next_wrapping(102), 100);
        assert_eq!(range.len(), 3);
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        let cfg = NatConfig { tcp_ports: PortRange::new(5000, 4000), ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let cfg = NatConfig { report_interval: Duration::ZERO, ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial_config() {
        let cfg: NatConfig = serde_json::from_str(
            r#"{
                "udp_timeout": { "secs": 60, "nanos": 0 },
                "tcp_ports": { "start": 40000, "end": 50000 }
            }"#,
        )
        .expect("partial config should deserialize");
        assert_eq!(cfg.udp_timeout, Duration::from_secs(60));
        assert_eq!(cfg.tcp_ports, PortRange::new(40000, 50000));
        assert_eq!(cfg.tcp_timeout, Duration::from_secs(600), "defaults fill gaps");
    }
}
