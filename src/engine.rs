//! The NAT engine: owned table handles, control-plane surface, and the
//! timer plumbing shared by both families.
//!
//! All state lives behind one `Arc`; packet paths, timer tasks, and the
//! control plane share it without locks. Timer tasks hold only a weak
//! reference plus the conntrack key, so dropping the last engine handle
//! (or calling [`NatEngine::shutdown`]) winds everything down.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::sync::mpsc;

use crate::config::NatConfig;
use crate::conn::timer::{drive_flow_timer, Clock, ShutdownSignal, TickOutcome};
use crate::error::NatError;
use crate::metrics::{MetricReporter, NatConnMetricEvent};
use crate::nat4::conntrack::{ConnKey4, ConnTable4};
use crate::nat4::mapping::MappingTable4;
use crate::nat6::conntrack::{ConnKey6, ConnTable6};
use crate::nat6::statics::StaticMapTable6;
use crate::packet::editor::PacketEditor;
use crate::packet::{L3Proto, L4Proto, PacketOffsetInfo, Pair4, Pair6, SkbMeta};
use crate::Verdict;

/// Key of the externally maintained WAN address binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct WanKey {
    pub ifindex: u32,
    pub l3proto: L3Proto,
}

/// Table sizes, exposed for operational visibility and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub v4_mapping_entries: usize,
    pub v4_conn_entries: usize,
    pub v6_static_entries: usize,
    pub v6_conn_entries: usize,
}

/// Address pair of a packet in either family.
#[derive(Debug, Clone, Copy)]
pub enum PacketPair {
    V4(Pair4),
    V6(Pair6),
}

pub(crate) struct EngineInner {
    /// Self-reference handed to timer tasks; they must never keep the
    /// engine alive on their own.
    weak: Weak<EngineInner>,
    pub(crate) config: NatConfig,
    pub(crate) clock: Clock,
    pub(crate) mappings4: MappingTable4,
    pub(crate) conns4: ConnTable4,
    pub(crate) statics6: StaticMapTable6,
    pub(crate) conns6: ConnTable6,
    pub(crate) wan_ips: DashMap<WanKey, IpAddr>,
    pub(crate) reporter: MetricReporter,
    metric_rx: Mutex<Option<mpsc::Receiver<NatConnMetricEvent>>>,
    drop_log: Option<DefaultDirectRateLimiter>,
    pub(crate) shutdown: Arc<ShutdownSignal>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        // Wake every sleeping timer task so it can observe the dead Weak.
        self.shutdown.trigger();
    }
}

impl EngineInner {
    /// WAN IPv4 address bound to the interface.
    pub(crate) fn wan_v4(&self, ifindex: u32) -> Result<Ipv4Addr, NatError> {
        match self.wan_ips.get(&WanKey { ifindex, l3proto: L3Proto::Ipv4 }) {
            Some(entry) => match *entry.value() {
                IpAddr::V4(addr) => Ok(addr),
                IpAddr::V6(_) => Err(NatError::WanIpMissing { ifindex }),
            },
            None => Err(NatError::WanIpMissing { ifindex }),
        }
    }

    /// Upper 64 bits of the WAN IPv6 address bound to the interface.
    pub(crate) fn wan_v6_prefix(&self, ifindex: u32) -> Result<u64, NatError> {
        match self.wan_ips.get(&WanKey { ifindex, l3proto: L3Proto::Ipv6 }) {
            Some(entry) => match *entry.value() {
                IpAddr::V6(addr) => Ok(crate::packet::prefix64(&addr)),
                IpAddr::V4(_) => Err(NatError::WanIpMissing { ifindex }),
            },
            None => Err(NatError::WanIpMissing { ifindex }),
        }
    }

    /// Rate-limited drop logging; best effort by design.
    pub(crate) fn note_drop(&self, path: &'static str, err: &NatError) {
        if let Some(limiter) = &self.drop_log {
            if limiter.check().is_ok() {
                tracing::debug!(path, kind = err.kind(), "packet dropped: {err}");
            }
        }
    }

    /// Detaches the timer task of a freshly created v4 conntrack entry.
    /// Failure to reach a runtime means the entry cannot age out; the
    /// caller must roll the insert back.
    pub(crate) fn spawn_timer_v4(&self, key: ConnKey4) -> Result<(), NatError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| NatError::TimerSetup)?;
        let lookup_engine = self.weak.clone();
        let tick_engine = self.weak.clone();
        let tick_key = key;
        handle.spawn(drive_flow_timer(
            self.clock.clone(),
            Arc::clone(&self.shutdown),
            move || lookup_engine.upgrade().and_then(|e| e.conns4.get(&key)),
            move || {
                tick_engine
                    .upgrade()
                    .map_or(TickOutcome::Released, |e| e.tick_v4(&tick_key))
            },
        ));
        Ok(())
    }

    /// v6 counterpart of [`Self::spawn_timer_v4`].
    pub(crate) fn spawn_timer_v6(&self, key: ConnKey6) -> Result<(), NatError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| NatError::TimerSetup)?;
        let lookup_engine = self.weak.clone();
        let tick_engine = self.weak.clone();
        let tick_key = key;
        handle.spawn(drive_flow_timer(
            self.clock.clone(),
            Arc::clone(&self.shutdown),
            move || lookup_engine.upgrade().and_then(|e| e.conns6.get(&key)),
            move || {
                tick_engine
                    .upgrade()
                    .map_or(TickOutcome::Released, |e| e.tick_v6(&tick_key))
            },
        ));
        Ok(())
    }
}

/// Handle to a running NAT engine. Cloning is cheap; all clones share the
/// same tables.
#[derive(Clone)]
pub struct NatEngine {
    pub(crate) inner: Arc<EngineInner>,
}

impl NatEngine {
    /// Builds an engine from a validated configuration.
    pub fn new(config: NatConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let (reporter, metric_rx) = MetricReporter::new(config.metric_ring_capacity);
        let drop_log = NonZeroU32::new(config.drop_log_per_second)
            .map(|per_second| RateLimiter::direct(Quota::per_second(per_second)));
        let inner = Arc::new_cyclic(|weak| EngineInner {
            weak: weak.clone(),
            clock: Clock::new(),
            mappings4: MappingTable4::new(config.mapping_capacity),
            conns4: ConnTable4::new(config.conntrack_capacity),
            statics6: StaticMapTable6::new(config.static6_capacity),
            conns6: ConnTable6::new(config.conntrack_capacity),
            wan_ips: DashMap::new(),
            reporter,
            metric_rx: Mutex::new(Some(metric_rx)),
            drop_log,
            shutdown: Arc::new(ShutdownSignal::new()),
            config,
        });
        tracing::info!("NAT engine initialized");
        Ok(Self { inner })
    }

    /// Hands out the consuming end of the metric ring. The first caller
    /// gets it; later calls return `None`.
    pub fn metric_events(&self) -> Option<mpsc::Receiver<NatConnMetricEvent>> {
        self.inner.metric_rx.lock().unwrap().take()
    }

    /// Binds (or replaces) the WAN address for an interface and family.
    pub fn bind_wan_ip(&self, ifindex: u32, addr: IpAddr) {
        let l3proto = match addr {
            IpAddr::V4(_) => L3Proto::Ipv4,
            IpAddr::V6(_) => L3Proto::Ipv6,
        };
        self.inner.wan_ips.insert(WanKey { ifindex, l3proto }, addr);
        tracing::info!(ifindex, %addr, "WAN address bound");
    }

    pub fn unbind_wan_ip(&self, ifindex: u32, l3proto: L3Proto) {
        self.inner.wan_ips.remove(&WanKey { ifindex, l3proto });
    }

    /// Installs a static v4 port forward. `nat_addr = None` creates an
    /// ingress wildcard matching any destination address on `nat_port`.
    pub fn install_static_nat4(
        &self,
        l4proto: L4Proto,
        lan_addr: Ipv4Addr,
        lan_port: u16,
        nat_addr: Option<Ipv4Addr>,
        nat_port: u16,
    ) -> Result<(), NatError> {
        let now = self.inner.clock.now_ns();
        self.inner
            .mappings4
            .install_static(l4proto, lan_addr, lan_port, nat_addr, nat_port, now)
    }

    pub fn remove_static_nat4(
        &self,
        l4proto: L4Proto,
        lan_addr: Ipv4Addr,
        lan_port: u16,
        nat_addr: Option<Ipv4Addr>,
        nat_port: u16,
    ) {
        self.inner
            .mappings4
            .remove_static(l4proto, lan_addr, lan_port, nat_addr, nat_port);
    }

    /// Installs a static v6 ingress forward; see
    /// [`crate::nat6`] for the target-address semantics.
    pub fn install_static_nat6_ingress(
        &self,
        l4proto: L4Proto,
        nat_port: u16,
        target: Ipv6Addr,
        allow_reuse: bool,
    ) -> Result<(), NatError> {
        self.inner
            .statics6
            .install_ingress(l4proto, nat_port, target, allow_reuse)
    }

    pub fn remove_static_nat6_ingress(&self, l4proto: L4Proto, nat_port: u16) {
        self.inner.statics6.remove_ingress(l4proto, nat_port);
    }

    /// Marks a LAN v6 endpoint as statically translated on egress.
    pub fn install_static_nat6_egress(
        &self,
        l4proto: L4Proto,
        client_addr: Ipv6Addr,
        client_port: u16,
    ) -> Result<(), NatError> {
        self.inner.statics6.install_egress(l4proto, client_addr, client_port)
    }

    pub fn remove_static_nat6_egress(
        &self,
        l4proto: L4Proto,
        client_addr: Ipv6Addr,
        client_port: u16,
    ) {
        self.inner.statics6.remove_egress(l4proto, client_addr, client_port);
    }

    /// Outbound entry point dispatching on the packet family.
    pub fn egress(
        &self,
        skb: &mut SkbMeta,
        editor: &mut dyn PacketEditor,
        offsets: &PacketOffsetInfo,
        pair: &PacketPair,
    ) -> Verdict {
        match pair {
            PacketPair::V4(p) => self.egress_v4(skb, editor, offsets, p),
            PacketPair::V6(p) => self.egress_v6(skb, editor, offsets, p),
        }
    }

    /// Inbound entry point dispatching on the packet family.
    pub fn ingress(
        &self,
        skb: &mut SkbMeta,
        editor: &mut dyn PacketEditor,
        offsets: &PacketOffsetInfo,
        pair: &PacketPair,
    ) -> Verdict {
        match pair {
            PacketPair::V4(p) => self.ingress_v4(skb, editor, offsets, p),
            PacketPair::V6(p) => self.ingress_v6(skb, editor, offsets, p),
        }
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            v4_mapping_entries: self.inner.mappings4.len(),
            v4_conn_entries: self.inner.conns4.len(),
            v6_static_entries: self.inner.statics6.len(),
            v6_conn_entries: self.inner.conns6.len(),
        }
    }

    /// Cooperative shutdown: stop every timer task, then drain the tables.
    /// The data path must already be quiesced by the caller.
    pub fn shutdown(&self) {
        self.inner.shutdown.trigger();
        self.inner.conns4.clear();
        self.inner.conns6.clear();
        self.inner.mappings4.clear();
        self.inner.statics6.clear();
        self.inner.wan_ips.clear();
        tracing::info!("NAT engine shut down");
    }
}
