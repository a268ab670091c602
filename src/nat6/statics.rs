//! Static IPv6 mapping store (port forwards and DMZ entries).
//!
//! The control plane installs entries at two prefix depths: egress rows
//! match the full client address and port (/192 over the composite key),
//! ingress rows match the NAT port alone (/96, address zeroed). Lookup
//! tries the deeper prefix first, which is all the longest-prefix-match
//! the two installed depths require.

use std::net::Ipv6Addr;
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::NatError;
use crate::packet::{prefix64, suffix8, Gress, L4Proto};

/// Composite key bit depth of an egress row: every field participates.
pub(crate) const PREFIXLEN_EGRESS: u32 = 192;
/// Composite key bit depth of an ingress row: protocol and port only.
pub(crate) const PREFIXLEN_INGRESS: u32 = 96;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct StaticKey6 {
    pub prefixlen: u32,
    pub gress: Gress,
    pub l4proto: L4Proto,
    pub port: u16,
    /// Zeroed beyond the prefix depth (always `::` for ingress rows).
    pub addr: Ipv6Addr,
}

/// Value of a static row. The address field is interpreted by
/// [`StaticMapTable6::classify_ingress`]; the trigger/reuse fields seed
/// conntrack entries created for inbound static flows.
pub(crate) struct StaticMapping6 {
    pub addr: Ipv6Addr,
    pub allow_reuse: bool,
}

/// How an inbound packet relates to the static store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StaticOutcome6 {
    /// Entry address is all zero: deliver to this host, no rewrite.
    MapToLocal,
    /// Entry carries a prefix: rewrite the destination prefix to it.
    RewritePrefix(u64),
    /// Entry carries only a suffix and it matches the packet: no rewrite.
    VerifySuffix,
}

pub(crate) struct StaticMapTable6 {
    entries: DashMap<StaticKey6, Arc<StaticMapping6>>,
    capacity: usize,
}

impl StaticMapTable6 {
    pub(crate) fn new(capacity: usize) -> Self {
        Self { entries: DashMap::new(), capacity }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&self) {
        self.entries.clear();
    }

    /// Longest-prefix lookup over the two installed depths.
    pub(crate) fn lookup(
        &self,
        gress: Gress,
        l4proto: L4Proto,
        port: u16,
        addr: &Ipv6Addr,
    ) -> Option<Arc<StaticMapping6>> {
        let full = StaticKey6 { prefixlen: PREFIXLEN_EGRESS, gress, l4proto, port, addr: *addr };
        if let Some(hit) = self.entries.get(&full) {
            return Some(Arc::clone(hit.value()));
        }
        let port_only = StaticKey6 {
            prefixlen: PREFIXLEN_INGRESS,
            gress,
            l4proto,
            port,
            addr: Ipv6Addr::UNSPECIFIED,
        };
        self.entries.get(&port_only).map(|e| Arc::clone(e.value()))
    }

    /// Whether an outbound packet's source is covered by a static egress row.
    pub(crate) fn egress_match(&self, l4proto: L4Proto, src_addr: &Ipv6Addr, src_port: u16) -> bool {
        self.lookup(Gress::Egress, l4proto, src_port, src_addr).is_some()
    }

    /// Classifies an inbound packet against the static store.
    ///
    /// `None` means no usable entry (including a suffix-only entry whose
    /// suffix does not match); the caller falls back to the dynamic path.
    pub(crate) fn classify_ingress(
        &self,
        l4proto: L4Proto,
        dst_addr: &Ipv6Addr,
        dst_port: u16,
    ) -> Option<StaticOutcome6> {
        let value = self.lookup(Gress::Ingress, l4proto, dst_port, dst_addr)?;
        let prefix = prefix64(&value.addr);
        let suffix = suffix8(&value.addr);

        if prefix == 0 && suffix == [0u8; 8] {
            return Some(StaticOutcome6::MapToLocal);
        }
        if prefix != 0 {
            return Some(StaticOutcome6::RewritePrefix(prefix));
        }
        if suffix == suffix8(dst_addr) {
            return Some(StaticOutcome6::VerifySuffix);
        }
        None
    }

    /// Installs an ingress forward on `nat_port`. The `target` address uses
    /// the classification semantics: `::` maps to the local host, a set
    /// prefix rewrites, a bare suffix only verifies.
    pub(crate) fn install_ingress(
        &self,
        l4proto: L4Proto,
        nat_port: u16,
        target: Ipv6Addr,
        allow_reuse: bool,
    ) -> Result<(), NatError> {
        self.insert(
            StaticKey6 {
                prefixlen: PREFIXLEN_INGRESS,
                gress: Gress::Ingress,
                l4proto,
                port: nat_port,
                addr: Ipv6Addr::UNSPECIFIED,
            },
            StaticMapping6 { addr: target, allow_reuse },
        )
    }

    /// Marks a LAN client endpoint as statically translated on egress.
    pub(crate) fn install_egress(
        &self,
        l4proto: L4Proto,
        client_addr: Ipv6Addr,
        client_port: u16,
    ) -> Result<(), NatError> {
        self.insert(
            StaticKey6 {
                prefixlen: PREFIXLEN_EGRESS,
                gress: Gress::Egress,
                l4proto,
                port: client_port,
                addr: client_addr,
            },
            StaticMapping6 { addr: Ipv6Addr::UNSPECIFIED, allow_reuse: true },
        )
    }

    pub(crate) fn remove_ingress(&self, l4proto: L4Proto, nat_port: u16) {
        self.entries.remove(&StaticKey6 {
            prefixlen: PREFIXLEN_INGRESS,
            gress: Gress::Ingress,
            l4proto,
            port: nat_port,
            addr: Ipv6Addr::UNSPECIFIED,
        });
    }

    pub(crate) fn remove_egress(&self, l4proto: L4Proto, client_addr: Ipv6Addr, client_port: u16) {
        self.entries.remove(&StaticKey6 {
            prefixlen: PREFIXLEN_EGRESS,
            gress: Gress::Egress,
            l4proto,
            port: client_port,
            addr: client_addr,
        });
    }

    fn insert(&self, key: StaticKey6, value: StaticMapping6) -> Result<(), NatError> {
        if self.entries.len() >= self.capacity {
            return Err(NatError::TableFull { table: "nat6_static_mappings" });
        }
        self.entries.insert(key, Arc::new(value));
        Ok(())
    }
}
