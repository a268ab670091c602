//! Bidirectional IPv4 NAT mapping store.
//!
//! Every dynamic mapping lives as two rows: the egress row keyed on the LAN
//! `(client addr, client port)` and its mirror ingress row keyed on the WAN
//! `(NAT addr, NAT port)`. Pair insert/delete are the only mutation
//! primitives, which keeps the pairing invariant mechanical. Static rows
//! are installed by the control plane and never expire; a static ingress
//! row may use `0.0.0.0` as a wildcard destination.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::config::PortRange;
use crate::error::NatError;
use crate::packet::{Gress, L4Proto, Pair4};

/// Key of one mapping row. `from_*` is the LAN side for egress rows and the
/// WAN side for ingress rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct MappingKey4 {
    pub gress: Gress,
    pub l4proto: L4Proto,
    pub from_port: u16,
    pub from_addr: Ipv4Addr,
}

/// One mapping row. The rewrite target (`addr`, `port`) is fixed at insert;
/// the trigger, reuse flag, and activity timestamp are last-writer-wins
/// hints refreshed from the data path.
#[derive(Debug)]
pub(crate) struct Mapping4 {
    addr: Ipv4Addr,
    port: u16,
    is_static: bool,
    trigger_addr: AtomicU32,
    trigger_port: AtomicU16,
    allow_reuse: AtomicBool,
    active_time_ns: AtomicU64,
}

impl Mapping4 {
    fn new(
        addr: Ipv4Addr,
        port: u16,
        trigger: (Ipv4Addr, u16),
        is_static: bool,
        allow_reuse: bool,
        now_ns: u64,
    ) -> Self {
        Self {
            addr,
            port,
            is_static,
            trigger_addr: AtomicU32::new(trigger.0.into()),
            trigger_port: AtomicU16::new(trigger.1),
            allow_reuse: AtomicBool::new(allow_reuse),
            active_time_ns: AtomicU64::new(now_ns),
        }
    }

    pub(crate) fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn is_static(&self) -> bool {
        self.is_static
    }

    pub(crate) fn trigger(&self) -> (Ipv4Addr, u16) {
        (
            Ipv4Addr::from(self.trigger_addr.load(Ordering::Relaxed)),
            self.trigger_port.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn allow_reuse(&self) -> bool {
        self.allow_reuse.load(Ordering::Relaxed)
    }

    pub(crate) fn set_allow_reuse(&self, allow: bool) {
        self.allow_reuse.store(allow, Ordering::Relaxed);
    }

    pub(crate) fn active_time_ns(&self) -> u64 {
        self.active_time_ns.load(Ordering::Relaxed)
    }

    pub(crate) fn refresh(&self, now_ns: u64) {
        self.active_time_ns.store(now_ns, Ordering::Relaxed);
    }

    /// Strictly stale: idle for *longer* than the protocol timeout. An
    /// entry exactly at the boundary is still live.
    fn is_stale(&self, now_ns: u64, timeout: Duration) -> bool {
        now_ns.saturating_sub(self.active_time_ns()) > timeout.as_nanos() as u64
    }
}

/// Concurrent mapping table holding both directions of every pair.
pub(crate) struct MappingTable4 {
    entries: DashMap<MappingKey4, Arc<Mapping4>>,
    capacity: usize,
}

impl MappingTable4 {
    pub(crate) fn new(capacity: usize) -> Self {
        Self { entries: DashMap::new(), capacity }
    }

    pub(crate) fn get(&self, key: &MappingKey4) -> Option<Arc<Mapping4>> {
        self.entries.get(key).map(|e| Arc::clone(e.value()))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Egress lookup with optional allocation, the entry point of the
    /// outbound v4 path.
    ///
    /// On a hit both rows of the pair get their activity refreshed; a hit
    /// whose mirror row has vanished is treated as broken and dropped. On a
    /// miss with `allow_create`, a WAN address is resolved, a free port is
    /// searched starting from the client's source port, and both rows are
    /// inserted.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn egress_lookup_or_create(
        &self,
        l4proto: L4Proto,
        pair: &Pair4,
        allow_create: bool,
        allow_reuse: bool,
        range: PortRange,
        timeout: Duration,
        now_ns: u64,
        resolve_wan: impl FnOnce() -> Result<Ipv4Addr, NatError>,
    ) -> Result<(Arc<Mapping4>, Arc<Mapping4>), NatError> {
        let egress_key = MappingKey4 {
            gress: Gress::Egress,
            l4proto,
            from_port: pair.src_port,
            from_addr: pair.src_addr,
        };

        if let Some(egress) = self.get(&egress_key) {
            let ingress_key = MappingKey4 {
                gress: Gress::Ingress,
                l4proto,
                from_port: egress.port(),
                from_addr: egress.addr(),
            };
            let ingress = self.get(&ingress_key).ok_or(NatError::PairBroken)?;
            egress.refresh(now_ns);
            ingress.refresh(now_ns);
            return Ok((egress, ingress));
        }

        if !allow_create {
            return Err(NatError::MappingNotFound);
        }

        let wan_addr = resolve_wan()?;
        let nat_port = self
            .find_free_port(l4proto, wan_addr, pair.src_port, range, timeout, now_ns)
            .ok_or(NatError::PortExhausted)?;

        let value = Mapping4::new(
            wan_addr,
            nat_port,
            (pair.dst_addr, pair.dst_port),
            false,
            allow_reuse,
            now_ns,
        );
        self.pair_insert(egress_key, value, now_ns, timeout)
    }

    /// Inbound lookup: exact WAN `(addr, port)` first, then the static
    /// `0.0.0.0` wildcard. Refreshes the activity of the row it returns.
    pub(crate) fn ingress_lookup(
        &self,
        l4proto: L4Proto,
        pair: &Pair4,
        now_ns: u64,
    ) -> Option<Arc<Mapping4>> {
        let mut key = MappingKey4 {
            gress: Gress::Ingress,
            l4proto,
            from_port: pair.dst_port,
            from_addr: pair.dst_addr,
        };
        let value = self.get(&key).or_else(|| {
            key.from_addr = Ipv4Addr::UNSPECIFIED;
            self.get(&key)
        })?;
        value.refresh(now_ns);
        Some(value)
    }

    /// Scans for a NAT port usable on `(l4proto, wan_addr)`, starting at the
    /// client's own port and wrapping through the range at most once.
    ///
    /// A slot is usable when no ingress row claims it, or the claim is
    /// dynamic and strictly stale; a static wildcard row on the same port
    /// blocks the slot regardless.
    fn find_free_port(
        &self,
        l4proto: L4Proto,
        wan_addr: Ipv4Addr,
        preferred: u16,
        range: PortRange,
        timeout: Duration,
        now_ns: u64,
    ) -> Option<u16> {
        if range.is_empty() {
            return None;
        }
        let mut port = range.clamp_into(preferred);
        for _ in 0..range.len() {
            let key = MappingKey4 {
                gress: Gress::Ingress,
                l4proto,
                from_port: port,
                from_addr: wan_addr,
            };
            let slot_free = match self.get(&key) {
                None => true,
                Some(existing) => !existing.is_static() && existing.is_stale(now_ns, timeout),
            };
            if slot_free {
                let wildcard = MappingKey4 {
                    gress: Gress::Ingress,
                    l4proto,
                    from_port: port,
                    from_addr: Ipv4Addr::UNSPECIFIED,
                };
                if !self.entries.contains_key(&wildcard) {
                    return Some(port);
                }
            }
            port = range.next_wrapping(port);
        }
        None
    }

    /// Inserts both rows of a mapping, claiming the ingress slot first so
    /// two processors allocating the same port cannot both win. The loser
    /// gets [`NatError::InsertRace`] and nothing is left behind; the flow's
    /// next packet retries.
    fn pair_insert(
        &self,
        egress_key: MappingKey4,
        value: Mapping4,
        now_ns: u64,
        timeout: Duration,
    ) -> Result<(Arc<Mapping4>, Arc<Mapping4>), NatError> {
        if self.entries.len() + 2 > self.capacity {
            return Err(NatError::TableFull { table: "nat4_mappings" });
        }

        let ingress_key = MappingKey4 {
            gress: egress_key.gress.dual(),
            l4proto: egress_key.l4proto,
            from_port: value.port,
            from_addr: value.addr,
        };
        let ingress_value = Arc::new(Mapping4::new(
            egress_key.from_addr,
            egress_key.from_port,
            value.trigger(),
            value.is_static,
            value.allow_reuse(),
            value.active_time_ns(),
        ));
        let egress_value = Arc::new(value);

        match self.entries.entry(ingress_key) {
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&ingress_value));
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get();
                if existing.is_static() || !existing.is_stale(now_ns, timeout) {
                    return Err(NatError::InsertRace);
                }
                slot.insert(Arc::clone(&ingress_value));
            }
        }
        self.entries.insert(egress_key, Arc::clone(&egress_value));
        Ok((egress_value, ingress_value))
    }

    /// Removes both rows of a pair. Missing rows are ignored so release can
    /// race with a concurrent replacement without harm.
    pub(crate) fn pair_delete(&self, egress_key: &MappingKey4, ingress_key: &MappingKey4) {
        self.entries.remove(egress_key);
        self.entries.remove(ingress_key);
    }

    /// Installs a static port forward as a pair of rows. A `None` WAN
    /// address makes the ingress row a wildcard matching any destination.
    pub(crate) fn install_static(
        &self,
        l4proto: L4Proto,
        lan_addr: Ipv4Addr,
        lan_port: u16,
        nat_addr: Option<Ipv4Addr>,
        nat_port: u16,
        now_ns: u64,
    ) -> Result<(), NatError> {
        if self.entries.len() + 2 > self.capacity {
            return Err(NatError::TableFull { table: "nat4_mappings" });
        }
        let wan = nat_addr.unwrap_or(Ipv4Addr::UNSPECIFIED);
        let egress_key = MappingKey4 {
            gress: Gress::Egress,
            l4proto,
            from_port: lan_port,
            from_addr: lan_addr,
        };
        let ingress_key = MappingKey4 {
            gress: Gress::Ingress,
            l4proto,
            from_port: nat_port,
            from_addr: wan,
        };
        let trigger = (Ipv4Addr::UNSPECIFIED, 0);
        self.entries.insert(
            egress_key,
            Arc::new(Mapping4::new(wan, nat_port, trigger, true, false, now_ns)),
        );
        self.entries.insert(
            ingress_key,
            Arc::new(Mapping4::new(lan_addr, lan_port, trigger, true, false, now_ns)),
        );
        Ok(())
    }

    /// Removes a static forward installed by [`Self::install_static`].
    pub(crate) fn remove_static(
        &self,
        l4proto: L4Proto,
        lan_addr: Ipv4Addr,
        lan_port: u16,
        nat_addr: Option<Ipv4Addr>,
        nat_port: u16,
    ) {
        let egress_key = MappingKey4 {
            gress: Gress::Egress,
            l4proto,
            from_port: lan_port,
            from_addr: lan_addr,
        };
        let ingress_key = MappingKey4 {
            gress: Gress::Ingress,
            l4proto,
            from_port: nat_port,
            from_addr: nat_addr.unwrap_or(Ipv4Addr::UNSPECIFIED),
        };
        self.pair_delete(&egress_key, &ingress_key);
    }

    pub(crate) fn clear(&self) {
        self.entries.clear();
    }
}
