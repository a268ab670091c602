//! IPv4 NAPT data path: egress allocation, ingress restoration, endpoint
//! filtering, conntrack bookkeeping, and header rewrite.
//!
//! The egress path may allocate a mapping pair (connectionless or TCP SYN
//! only), enforces RFC 4787 endpoint-dependent filtering against the flow
//! trigger unless port reuse is allowed, then rewrites the source to the
//! WAN endpoint. The ingress path restores the LAN endpoint, admitting
//! packets through dynamic mappings (trigger / reuse checked) or static
//! forwards (which also tag the packet with the routing mark).

pub(crate) mod conntrack;
pub(crate) mod mapping;

use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::conn::state::{FlowState, ReportState};
use crate::conn::timer::TickOutcome;
use crate::engine::{EngineInner, NatEngine};
use crate::error::NatError;
use crate::metrics::{MetricStatus, NatConnMetricEvent};
use crate::packet::editor::{CsumFlags, PacketEditor};
use crate::packet::{hdr, Gress, L3Proto, L4Proto, PacketOffsetInfo, Pair4, SkbMeta};
use crate::Verdict;

use conntrack::{ConnEntry4, ConnKey4};
use mapping::MappingKey4;

/// A single header rewrite: the engine guarantees `from` matches the
/// packet's current contents when the editor is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NatAction4 {
    pub from_addr: Ipv4Addr,
    pub from_port: u16,
    pub to_addr: Ipv4Addr,
    pub to_port: u16,
}

impl NatEngine {
    /// Translates an outbound IPv4 packet in place.
    pub fn egress_v4(
        &self,
        skb: &mut SkbMeta,
        editor: &mut dyn PacketEditor,
        offsets: &PacketOffsetInfo,
        pair: &Pair4,
    ) -> Verdict {
        match self.inner.egress_v4(skb, editor, offsets, pair) {
            Ok(()) => Verdict::Pass,
            Err(err) => {
                let verdict = err.verdict();
                if verdict == Verdict::Drop {
                    self.inner.note_drop("nat_v4_egress", &err);
                }
                verdict
            }
        }
    }

    /// Translates an inbound IPv4 packet in place.
    pub fn ingress_v4(
        &self,
        skb: &mut SkbMeta,
        editor: &mut dyn PacketEditor,
        offsets: &PacketOffsetInfo,
        pair: &Pair4,
    ) -> Verdict {
        match self.inner.ingress_v4(skb, editor, offsets, pair) {
            Ok(()) => Verdict::Pass,
            Err(err) => {
                let verdict = err.verdict();
                if verdict == Verdict::Drop {
                    self.inner.note_drop("nat_v4_ingress", &err);
                }
                verdict
            }
        }
    }
}

impl EngineInner {
    pub(crate) fn egress_v4(
        &self,
        skb: &mut SkbMeta,
        editor: &mut dyn PacketEditor,
        offsets: &PacketOffsetInfo,
        pair: &Pair4,
    ) -> Result<(), NatError> {
        if offsets.l3_protocol != L3Proto::Ipv4
            || !offsets.l4_protocol.handled_for(L3Proto::Ipv4)
        {
            return Err(NatError::UnhandledProtocol);
        }
        let flow_l4 = offsets.flow_l4_protocol();
        let is_icmp_error = offsets.is_icmp_error();
        let allow_create = !is_icmp_error && offsets.pkt_type.allows_initiating();
        let now = self.clock.now_ns();

        let (egress_map, ingress_map) = self.mappings4.egress_lookup_or_create(
            flow_l4,
            pair,
            allow_create,
            skb.allow_reuse_port(),
            self.config.port_range(flow_l4),
            self.config.mapping_timeout(flow_l4),
            now,
            || self.wan_v4(skb.ifindex),
        )?;

        // Endpoint-dependent filtering against the trigger that created the
        // mapping; static rows and ICMP are exempt.
        if !egress_map.is_static()
            && !egress_map.allow_reuse()
            && !offsets.l4_protocol.is_icmp()
            && (pair.dst_addr, pair.dst_port) != egress_map.trigger()
        {
            return Err(NatError::EndpointFiltered);
        }

        // Packets toward the trigger re-latch the reuse flag on both rows.
        if !egress_map.is_static() && (pair.dst_addr, pair.dst_port) == egress_map.trigger() {
            let allow = skb.allow_reuse_port();
            egress_map.set_allow_reuse(allow);
            ingress_map.set_allow_reuse(allow);
        }

        // Static rows resolve the WAN address per packet so address renewal
        // does not invalidate them.
        let nat_addr = if egress_map.is_static() {
            self.wan_v4(skb.ifindex)?
        } else {
            egress_map.addr()
        };

        let ct_key = ConnKey4 {
            l4proto: flow_l4,
            server_addr: pair.dst_addr,
            server_port: pair.dst_port,
            nat_addr,
            nat_port: egress_map.port(),
        };
        let entry =
            self.conntrack_v4(skb, ct_key, pair.src_addr, pair.src_port, Gress::Egress, allow_create)?;
        entry
            .flow
            .on_packet(Gress::Egress, offsets.pkt_type, &self.clock, self.config.report_interval)?;
        entry.flow.accumulate(false, skb.len as u64);

        let action = NatAction4 {
            from_addr: pair.src_addr,
            from_port: pair.src_port,
            to_addr: nat_addr,
            to_port: egress_map.port(),
        };
        modify_headers_v4(editor, offsets, is_icmp_error, true, &action)
    }

    pub(crate) fn ingress_v4(
        &self,
        skb: &mut SkbMeta,
        editor: &mut dyn PacketEditor,
        offsets: &PacketOffsetInfo,
        pair: &Pair4,
    ) -> Result<(), NatError> {
        if offsets.l3_protocol != L3Proto::Ipv4
            || !offsets.l4_protocol.handled_for(L3Proto::Ipv4)
        {
            return Err(NatError::UnhandledProtocol);
        }
        let flow_l4 = offsets.flow_l4_protocol();
        let is_icmp_error = offsets.is_icmp_error();
        let now = self.clock.now_ns();

        let mapping = self
            .mappings4
            .ingress_lookup(flow_l4, pair, now)
            .ok_or(NatError::MappingNotFound)?;

        if !mapping.is_static()
            && !mapping.allow_reuse()
            && !offsets.l4_protocol.is_icmp()
            && (pair.src_addr, pair.src_port) != mapping.trigger()
        {
            return Err(NatError::EndpointFiltered);
        }

        if mapping.is_static() {
            skb.set_ingress_static_mark();
        }

        // A static row with an all-zero target maps to this host: keep the
        // packet's own destination address.
        let lan_addr = if mapping.is_static() && mapping.addr() == Ipv4Addr::UNSPECIFIED {
            pair.dst_addr
        } else {
            mapping.addr()
        };

        let ct_key = ConnKey4 {
            l4proto: flow_l4,
            server_addr: pair.src_addr,
            server_port: pair.src_port,
            nat_addr: pair.dst_addr,
            nat_port: pair.dst_port,
        };
        // Dynamic flows must already be tracked; static forwards may accept
        // fresh inbound connections.
        let allow_create =
            mapping.is_static() && !is_icmp_error && offsets.pkt_type.allows_initiating();
        let entry =
            self.conntrack_v4(skb, ct_key, lan_addr, mapping.port(), Gress::Ingress, allow_create)?;
        entry
            .flow
            .on_packet(Gress::Ingress, offsets.pkt_type, &self.clock, self.config.report_interval)?;
        entry.flow.accumulate(true, skb.len as u64);

        let action = NatAction4 {
            from_addr: pair.dst_addr,
            from_port: pair.dst_port,
            to_addr: lan_addr,
            to_port: mapping.port(),
        };
        modify_headers_v4(editor, offsets, is_icmp_error, false, &action)
    }

    /// Conntrack lookup/create plus timer-task setup for new entries. A
    /// failed timer setup rolls the insert back so no untracked entry can
    /// linger.
    fn conntrack_v4(
        &self,
        skb: &SkbMeta,
        key: ConnKey4,
        client_addr: Ipv4Addr,
        client_port: u16,
        gress: Gress,
        allow_create: bool,
    ) -> Result<Arc<ConnEntry4>, NatError> {
        let lookup = self.conns4.lookup_or_create(key, allow_create, || ConnEntry4 {
            client_addr,
            client_port,
            flow: FlowState::new(
                &self.clock,
                gress,
                skb.flow_id(),
                skb.cpu_id,
                self.config.report_interval,
            ),
        })?;
        if lookup.is_created() {
            if let Err(err) = self.spawn_timer_v4(key) {
                self.conns4.remove(&key);
                return Err(err);
            }
            tracing::debug!(
                client = %client_addr,
                client_port,
                nat_port = key.nat_port,
                "v4 conntrack created"
            );
        }
        Ok(lookup.into_entry())
    }

    /// One reporting-state tick for a v4 flow, invoked by its timer task.
    pub(crate) fn tick_v4(&self, key: &ConnKey4) -> TickOutcome {
        let Some(entry) = self.conns4.get(key) else {
            return TickOutcome::Released;
        };
        let interval = self.config.report_interval;

        if entry.flow.report_state() == ReportState::Release {
            let event = self.v4_event(key, &entry, MetricStatus::Delete);
            if self.reporter.try_report(event).is_err() {
                // The entry outlives the ring pressure: retry next tick.
                entry.flow.timer().arm(&self.clock, interval);
                return TickOutcome::Rearmed;
            }
            self.release_v4(key, &entry);
            return TickOutcome::Released;
        }

        let event = self.v4_event(key, &entry, MetricStatus::Active);
        if self.reporter.try_report(event).is_err() {
            entry.flow.timer().arm(&self.clock, interval);
            return TickOutcome::Rearmed;
        }

        // A lost CAS means a data packet bounced the flow back to Active.
        let delay = entry
            .flow
            .advance_report(key.l4proto, &self.config)
            .unwrap_or(interval);
        entry.flow.timer().arm(&self.clock, delay);
        TickOutcome::Rearmed
    }

    /// Deletes a released flow and, unless the owning mapping is static,
    /// both rows of its mapping pair.
    fn release_v4(&self, key: &ConnKey4, entry: &ConnEntry4) {
        let egress_key = MappingKey4 {
            gress: Gress::Egress,
            l4proto: key.l4proto,
            from_port: entry.client_port,
            from_addr: entry.client_addr,
        };
        let ingress_key = MappingKey4 {
            gress: Gress::Ingress,
            l4proto: key.l4proto,
            from_port: key.nat_port,
            from_addr: key.nat_addr,
        };
        let keep_mapping = self
            .mappings4
            .get(&egress_key)
            .is_some_and(|m| m.is_static());
        if !keep_mapping {
            self.mappings4.pair_delete(&egress_key, &ingress_key);
        }
        self.conns4.remove(key);
        tracing::debug!(
            client = %entry.client_addr,
            client_port = entry.client_port,
            nat_port = key.nat_port,
            "v4 flow released"
        );
    }

    fn v4_event(
        &self,
        key: &ConnKey4,
        entry: &ConnEntry4,
        status: MetricStatus,
    ) -> NatConnMetricEvent {
        let counters = entry.flow.counters();
        NatConnMetricEvent {
            src_addr: entry.client_addr.into(),
            dst_addr: key.server_addr.into(),
            src_port: entry.client_port,
            dst_port: key.server_port,
            l3_proto: L3Proto::Ipv4,
            l4_proto: key.l4proto,
            flow_id: entry.flow.flow_id(),
            trace_id: 0,
            create_time_ns: entry.flow.create_time_ns(),
            time_ns: self.clock.now_ns(),
            ingress_bytes: counters.ingress_bytes,
            ingress_packets: counters.ingress_packets,
            egress_bytes: counters.egress_bytes,
            egress_packets: counters.egress_packets,
            cpu_id: entry.flow.cpu_id(),
            status,
            gress: entry.flow.gress(),
        }
    }
}

/// Per-protocol layout of the transport fields the rewrite touches.
fn l4_layout(
    flow_l4: L4Proto,
    modify_source: bool,
) -> Result<(usize, usize, bool, bool), NatError> {
    match flow_l4 {
        L4Proto::Tcp => Ok((
            if modify_source { hdr::TCP_SOURCE } else { hdr::TCP_DEST },
            hdr::TCP_CHECK,
            true,
            false,
        )),
        L4Proto::Udp => Ok((
            if modify_source { hdr::UDP_SOURCE } else { hdr::UDP_DEST },
            hdr::UDP_CHECK,
            true,
            true,
        )),
        L4Proto::Icmp => Ok((hdr::ICMP_ECHO_ID, hdr::ICMP_CHECK, false, false)),
        L4Proto::Icmpv6 => Err(NatError::UnhandledProtocol),
    }
}

/// Applies a [`NatAction4`] to the packet: address, port (or echo id), and
/// every checksum the change touches. For ICMP errors the embedded headers
/// are rewritten too and the outer ICMP checksum is cascaded through the
/// embedded deltas.
pub(crate) fn modify_headers_v4(
    editor: &mut dyn PacketEditor,
    offsets: &PacketOffsetInfo,
    is_icmp_error: bool,
    modify_source: bool,
    action: &NatAction4,
) -> Result<(), NatError> {
    let l3 = offsets.l3_offset;
    let addr_field = if modify_source { hdr::IPV4_SADDR } else { hdr::IPV4_DADDR };
    let from_addr = u32::from(action.from_addr);
    let to_addr = u32::from(action.to_addr);

    editor.store_bytes(l3 + addr_field, &action.to_addr.octets())?;
    editor.l3_csum_replace(l3 + hdr::IPV4_CHECK, from_addr, to_addr, 4)?;

    let Some(l4_off) = offsets.l4_offset else {
        // Non-first fragment: address-only rewrite.
        return Ok(());
    };

    let flow_l4 = offsets.flow_l4_protocol();
    let (mut port_field, check_field, pseudo, mangled) = l4_layout(flow_l4, modify_source)?;

    if is_icmp_error {
        // The embedded packet is the original flow direction, so its port
        // fields are mirrored relative to the outer rewrite.
        if matches!(flow_l4, L4Proto::Tcp | L4Proto::Udp) {
            port_field = if modify_source { hdr::TCP_DEST } else { hdr::TCP_SOURCE };
        }
        let inner_l3 = l4_off + hdr::ICMP_HDR_LEN;
        let inner_addr_field = if modify_source { hdr::IPV4_DADDR } else { hdr::IPV4_SADDR };
        editor.store_bytes(inner_l3 + inner_addr_field, &action.to_addr.octets())?;

        let inner_l4 = offsets
            .icmp_error_inner_l4_offset
            .ok_or(NatError::UnhandledProtocol)?;
        editor.store_bytes(inner_l4 + port_field, &action.to_port.to_be_bytes())?;

        update_csum_icmp_error(
            editor,
            l4_off + hdr::ICMP_CHECK,
            inner_l3 + hdr::IPV4_CHECK,
            inner_l4 + check_field,
            action,
            pseudo,
            mangled,
        )
    } else {
        editor.store_bytes(l4_off + port_field, &action.to_port.to_be_bytes())?;
        let csum_off = l4_off + check_field;
        let flags = CsumFlags { pseudo_header: false, mangled_zero: mangled };
        editor.l4_csum_replace(
            csum_off,
            action.from_port as u32,
            action.to_port as u32,
            2,
            flags,
        )?;
        if pseudo {
            editor.l4_csum_replace(
                csum_off,
                from_addr,
                to_addr,
                4,
                CsumFlags { pseudo_header: true, mangled_zero: mangled },
            )?;
        }
        Ok(())
    }
}

/// Checksum cascade for an ICMP error rewrite, in dependency order: the
/// embedded IP checksum, the embedded L4 checksum (when its bytes were
/// captured), then the outer ICMP checksum over each embedded change and
/// finally over the raw address/port deltas.
fn update_csum_icmp_error(
    editor: &mut dyn PacketEditor,
    icmp_csum_off: usize,
    inner_ip_csum_off: usize,
    inner_l4_csum_off: usize,
    action: &NatAction4,
    inner_pseudo: bool,
    inner_mangled: bool,
) -> Result<(), NatError> {
    let from_addr = u32::from(action.from_addr);
    let to_addr = u32::from(action.to_addr);

    let prev_ip_csum = editor.load_u16(inner_ip_csum_off)?;
    editor.l3_csum_replace(inner_ip_csum_off, from_addr, to_addr, 4)?;
    let curr_ip_csum = editor.load_u16(inner_ip_csum_off)?;
    editor.l4_csum_replace(
        icmp_csum_off,
        prev_ip_csum as u32,
        curr_ip_csum as u32,
        2,
        CsumFlags::NONE,
    )?;

    // ICMP errors only quote the leading bytes of the offending packet, so
    // the embedded transport checksum may not be present at all.
    if let Ok(prev_l4_csum) = editor.load_u16(inner_l4_csum_off) {
        let skip = inner_mangled && prev_l4_csum == 0;
        if !skip {
            editor.l3_csum_replace(
                inner_l4_csum_off,
                action.from_port as u32,
                action.to_port as u32,
                2,
            )?;
            if inner_pseudo {
                editor.l3_csum_replace(inner_l4_csum_off, from_addr, to_addr, 4)?;
            }
        }
        let curr_l4_csum = editor.load_u16(inner_l4_csum_off)?;
        editor.l4_csum_replace(
            icmp_csum_off,
            prev_l4_csum as u32,
            curr_l4_csum as u32,
            2,
            CsumFlags::NONE,
        )?;
    }

    editor.l4_csum_replace(icmp_csum_off, from_addr, to_addr, 4, CsumFlags::NONE)?;
    editor.l4_csum_replace(
        icmp_csum_off,
        action.from_port as u32,
        action.to_port as u32,
        2,
        CsumFlags::NONE,
    )?;
    Ok(())
}
