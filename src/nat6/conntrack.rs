//! IPv6 conntrack table.
//!
//! The key deliberately excludes the client's routing prefix: the suffix
//! (interface identifier) plus the low nibble of prefix byte 7 identify a
//! LAN client even while its delegated prefix rotates. The current prefix,
//! trigger endpoint, and reuse flag live in the value as last-writer-wins
//! hints refreshed from the data path.

use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::conn::state::FlowState;
use crate::conn::timer::{FlowTimer, TimerOwner};
use crate::error::NatError;
use crate::nat4::conntrack::CtLookup;
use crate::packet::{id_nibble, prefix64, suffix8, L4Proto};

/// Conntrack key: `{l4proto, client suffix, id nibble, client port}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ConnKey6 {
    pub l4proto: L4Proto,
    pub client_suffix: [u8; 8],
    pub id_byte: u8,
    pub client_port: u16,
}

impl ConnKey6 {
    /// Builds the key from the client-side address of a packet.
    pub(crate) fn from_client(l4proto: L4Proto, addr: &Ipv6Addr, port: u16) -> Self {
        Self {
            l4proto,
            client_suffix: suffix8(addr),
            id_byte: id_nibble(addr),
            client_port: port,
        }
    }
}

#[derive(Debug)]
pub(crate) struct ConnEntry6 {
    /// Upper 64 bits of the client's current address.
    client_prefix: AtomicU64,
    trigger_hi: AtomicU64,
    trigger_lo: AtomicU64,
    trigger_port: AtomicU16,
    allow_reuse: AtomicBool,
    pub flow: FlowState,
}

impl ConnEntry6 {
    pub(crate) fn new(
        client_prefix: u64,
        trigger: (Ipv6Addr, u16),
        allow_reuse: bool,
        flow: FlowState,
    ) -> Self {
        let octets = trigger.0.octets();
        let hi = u64::from_be_bytes(octets[..8].try_into().unwrap());
        let lo = u64::from_be_bytes(octets[8..].try_into().unwrap());
        Self {
            client_prefix: AtomicU64::new(client_prefix),
            trigger_hi: AtomicU64::new(hi),
            trigger_lo: AtomicU64::new(lo),
            trigger_port: AtomicU16::new(trigger.1),
            allow_reuse: AtomicBool::new(allow_reuse),
            flow,
        }
    }

    pub(crate) fn client_prefix(&self) -> u64 {
        self.client_prefix.load(Ordering::Relaxed)
    }

    pub(crate) fn trigger(&self) -> (Ipv6Addr, u16) {
        let hi = self.trigger_hi.load(Ordering::Relaxed).to_be_bytes();
        let lo = self.trigger_lo.load(Ordering::Relaxed).to_be_bytes();
        let mut octets = [0u8; 16];
        octets[..8].copy_from_slice(&hi);
        octets[8..].copy_from_slice(&lo);
        (Ipv6Addr::from(octets), self.trigger_port.load(Ordering::Relaxed))
    }

    pub(crate) fn allow_reuse(&self) -> bool {
        self.allow_reuse.load(Ordering::Relaxed)
    }

    /// Refreshes the rotation-sensitive hints from an outbound packet:
    /// current prefix, trigger endpoint, reuse flag, and flow id.
    pub(crate) fn refresh(
        &self,
        client_addr: &Ipv6Addr,
        trigger: (Ipv6Addr, u16),
        allow_reuse: bool,
        flow_id: u8,
    ) {
        self.client_prefix.store(prefix64(client_addr), Ordering::Relaxed);
        let octets = trigger.0.octets();
        self.trigger_hi
            .store(u64::from_be_bytes(octets[..8].try_into().unwrap()), Ordering::Relaxed);
        self.trigger_lo
            .store(u64::from_be_bytes(octets[8..].try_into().unwrap()), Ordering::Relaxed);
        self.trigger_port.store(trigger.1, Ordering::Relaxed);
        self.allow_reuse.store(allow_reuse, Ordering::Relaxed);
        self.flow.set_flow_id(flow_id);
    }
}

impl TimerOwner for ConnEntry6 {
    fn flow_timer(&self) -> &FlowTimer {
        self.flow.timer()
    }
}

pub(crate) struct ConnTable6 {
    entries: DashMap<ConnKey6, Arc<ConnEntry6>>,
    capacity: usize,
}

impl ConnTable6 {
    pub(crate) fn new(capacity: usize) -> Self {
        Self { entries: DashMap::new(), capacity }
    }

    pub(crate) fn get(&self, key: &ConnKey6) -> Option<Arc<ConnEntry6>> {
        self.entries.get(key).map(|e| Arc::clone(e.value()))
    }

    pub(crate) fn remove(&self, key: &ConnKey6) {
        self.entries.remove(key);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&self) {
        self.entries.clear();
    }

    /// Looks up an entry, creating it with only-if-absent semantics when
    /// `allow_create` holds.
    pub(crate) fn lookup_or_create(
        &self,
        key: ConnKey6,
        allow_create: bool,
        make: impl FnOnce() -> ConnEntry6,
    ) -> Result<CtLookup<ConnEntry6>, NatError> {
        if let Some(existing) = self.get(&key) {
            return Ok(CtLookup::Existing(existing));
        }
        if !allow_create {
            return Err(NatError::ConnNotFound);
        }
        if self.entries.len() >= self.capacity {
            return Err(NatError::TableFull { table: "nat6_conn_timer" });
        }
        match self.entries.entry(key) {
            Entry::Occupied(slot) => Ok(CtLookup::Existing(Arc::clone(slot.get()))),
            Entry::Vacant(slot) => {
                let entry = Arc::new(make());
                slot.insert(Arc::clone(&entry));
                Ok(CtLookup::Created(entry))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::timer::Clock;
    use crate::packet::{same_prefix60, Gress};
    use std::time::Duration;

    fn addr(s: &str) -> Ipv6Addr {
        s.parse().unwrap()
    }

    fn flow(clock: &Clock) -> FlowState {
        FlowState::new(clock, Gress::Egress, 0, 0, Duration::from_secs(5))
    }

    #[test]
    fn test_key_ignores_rotating_prefix_bits() {
        let before = addr("2001:db8:1::5");
        let after = addr("2001:db8:2::5");
        let k1 = ConnKey6::from_client(L4Proto::Tcp, &before, 40000);
        let k2 = ConnKey6::from_client(L4Proto::Tcp, &after, 40000);
        assert_eq!(k1, k2, "prefix rotation must land on the same key");
    }

    #[test]
    fn test_key_keeps_topology_nibble() {
        let a = ConnKey6::from_client(L4Proto::Tcp, &addr("2001:db8:0:1::5"), 40000);
        let b = ConnKey6::from_client(L4Proto::Tcp, &addr("2001:db8:0:2::5"), 40000);
        assert_ne!(a, b, "different id nibbles are different clients");
    }

    #[tokio::test]
    async fn test_refresh_rotates_prefix_in_place() {
        let clock = Clock::new();
        let client = addr("2001:db8:1::5");
        let entry = ConnEntry6::new(
            prefix64(&client),
            (addr("2606:4700::1"), 443),
            false,
            flow(&clock),
        );
        assert!(same_prefix60(entry.client_prefix(), prefix64(&client)));

        let rotated = addr("2001:db8:2::5");
        entry.refresh(&rotated, (addr("2606:4700::1"), 443), true, 9);
        assert_eq!(entry.client_prefix(), prefix64(&rotated));
        assert!(entry.allow_reuse());
        assert_eq!(entry.flow.flow_id(), 9);
    }

    #[tokio::test]
    async fn test_trigger_roundtrip() {
        let clock = Clock::new();
        let trigger = (addr("2606:4700:4700::1111"), 853);
        let entry = ConnEntry6::new(0, trigger, false, flow(&clock));
        assert_eq!(entry.trigger(), trigger);
    }

    #[tokio::test]
    async fn test_lookup_or_create_semantics() {
        let clock = Clock::new();
        let table = ConnTable6::new(4);
        let key = ConnKey6::from_client(L4Proto::Udp, &addr("2001:db8:1::5"), 5353);

        let err = table
            .lookup_or_create(key, false, || {
                ConnEntry6::new(0, (Ipv6Addr::UNSPECIFIED, 0), false, flow(&clock))
            })
            .unwrap_err();
        assert!(matches!(err, NatError::ConnNotFound));

        let created = table
            .lookup_or_create(key, true, || {
                ConnEntry6::new(0, (Ipv6Addr::UNSPECIFIED, 0), false, flow(&clock))
            })
            .unwrap();
        assert!(created.is_created());
        assert_eq!(table.len(), 1);
    }
}
