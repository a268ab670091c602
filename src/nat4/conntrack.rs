//! IPv4 conntrack table.
//!
//! Keyed on the server-side and NAT-side endpoints so both directions of a
//! flow land on the same entry. The value owns the shared [`FlowState`]
//! (states, counters, timer) plus the LAN client endpoint needed to rebuild
//! mapping keys and metric events.

use std::net::Ipv4Addr;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::conn::state::FlowState;
use crate::conn::timer::{FlowTimer, TimerOwner};
use crate::error::NatError;
use crate::packet::L4Proto;

/// Conntrack key: `{l4proto, server addr:port, NAT addr:port}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ConnKey4 {
    pub l4proto: L4Proto,
    pub server_addr: Ipv4Addr,
    pub server_port: u16,
    pub nat_addr: Ipv4Addr,
    pub nat_port: u16,
}

/// Conntrack value; the client endpoint is fixed at creation.
#[derive(Debug)]
pub(crate) struct ConnEntry4 {
    pub client_addr: Ipv4Addr,
    pub client_port: u16,
    pub flow: FlowState,
}

impl TimerOwner for ConnEntry4 {
    fn flow_timer(&self) -> &FlowTimer {
        self.flow.timer()
    }
}

/// Result of a conntrack lookup that may create.
#[derive(Debug)]
pub(crate) enum CtLookup<E> {
    Existing(Arc<E>),
    Created(Arc<E>),
}

impl<E> CtLookup<E> {
    pub(crate) fn entry(&self) -> &Arc<E> {
        match self {
            CtLookup::Existing(e) | CtLookup::Created(e) => e,
        }
    }

    pub(crate) fn into_entry(self) -> Arc<E> {
        match self {
            CtLookup::Existing(e) | CtLookup::Created(e) => e,
        }
    }

    pub(crate) fn is_created(&self) -> bool {
        matches!(self, CtLookup::Created(_))
    }
}

pub(crate) struct ConnTable4 {
    entries: DashMap<ConnKey4, Arc<ConnEntry4>>,
    capacity: usize,
}

impl ConnTable4 {
    pub(crate) fn new(capacity: usize) -> Self {
        Self { entries: DashMap::new(), capacity }
    }

    pub(crate) fn get(&self, key: &ConnKey4) -> Option<Arc<ConnEntry4>> {
        self.entries.get(key).map(|e| Arc::clone(e.value()))
    }

    pub(crate) fn remove(&self, key: &ConnKey4) {
        self.entries.remove(key);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&self) {
        self.entries.clear();
    }

    /// Looks up an entry, creating it with only-if-absent semantics when
    /// `allow_create` holds. Two racing creators resolve to the same entry.
    pub(crate) fn lookup_or_create(
        &self,
        key: ConnKey4,
        allow_create: bool,
        make: impl FnOnce() -> ConnEntry4,
    ) -> Result<CtLookup<ConnEntry4>, NatError> {
        if let Some(existing) = self.get(&key) {
            return Ok(CtLookup::Existing(existing));
        }
        if !allow_create {
            return Err(NatError::ConnNotFound);
        }
        if self.entries.len() >= self.capacity {
            return Err(NatError::TableFull { table: "nat4_conntrack" });
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
    use crate::packet::Gress;
    use std::time::Duration;

    fn key(nat_port: u16) -> ConnKey4 {
        ConnKey4 {
            l4proto: L4Proto::Tcp,
            server_addr: Ipv4Addr::new(1, 1, 1, 1),
            server_port: 80,
            nat_addr: Ipv4Addr::new(203, 0, 113, 1),
            nat_port,
        }
    }

    fn entry(clock: &Clock) -> ConnEntry4 {
        ConnEntry4 {
            client_addr: Ipv4Addr::new(10, 0, 0, 5),
            client_port: 40000,
            flow: FlowState::new(clock, Gress::Egress, 0, 0, Duration::from_secs(5)),
        }
    }

    #[tokio::test]
    async fn test_create_then_lookup() {
        let clock = Clock::new();
        let table = ConnTable4::new(16);
        let created = table.lookup_or_create(key(40000), true, || entry(&clock)).unwrap();
        assert!(created.is_created());

        let found = table.lookup_or_create(key(40000), true, || entry(&clock)).unwrap();
        assert!(!found.is_created(), "second lookup must reuse the entry");
        assert!(Arc::ptr_eq(created.entry(), found.entry()));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_lookup_without_create_fails() {
        let clock = Clock::new();
        let table = ConnTable4::new(16);
        let err = table.lookup_or_create(key(40000), false, || entry(&clock)).unwrap_err();
        assert!(matches!(err, NatError::ConnNotFound));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let clock = Clock::new();
        let table = ConnTable4::new(1);
        table.lookup_or_create(key(40000), true, || entry(&clock)).unwrap();
        let err = table.lookup_or_create(key(40001), true, || entry(&clock)).unwrap_err();
        assert!(matches!(err, NatError::TableFull { .. }));
    }

    #[tokio::test]
    async fn test_remove() {
        let clock = Clock::new();
        let table = ConnTable4::new(16);
        table.lookup_or_create(key(40000), true, || entry(&clock)).unwrap();
        table.remove(&key(40000));
        assert!(table.get(&key(40000)).is_none());
    }
}
