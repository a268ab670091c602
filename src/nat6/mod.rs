//! IPv6 prefix-translation data path.
//!
//! Unlike the v4 NAPT, the v6 engine never touches ports: it swaps the
//! upper 60 bits of the routing prefix between the LAN client's delegated
//! prefix and the WAN prefix, keyed per client suffix so flows survive
//! prefix rotation. Static entries cover port forwards, DMZ suffixes, and
//! map-to-local delivery.

pub(crate) mod conntrack;
pub(crate) mod statics;

use crate::conn::state::{FlowState, ReportState};
use crate::conn::timer::TickOutcome;
use crate::engine::{EngineInner, NatEngine};
use crate::error::NatError;
use crate::metrics::{MetricStatus, NatConnMetricEvent};
use crate::nat4::conntrack::CtLookup;
use crate::packet::editor::{CsumFlags, PacketEditor};
use crate::packet::{
    hdr, join_prefix_suffix, merge_prefix60, prefix64, same_prefix60, Gress, L3Proto, L4Proto,
    PacketOffsetInfo, Pair6, SkbMeta,
};
use crate::Verdict;

use conntrack::{ConnEntry6, ConnKey6};
use statics::StaticOutcome6;

impl NatEngine {
    /// Translates an outbound IPv6 packet in place.
    pub fn egress_v6(
        &self,
        skb: &mut SkbMeta,
        editor: &mut dyn PacketEditor,
        offsets: &PacketOffsetInfo,
        pair: &Pair6,
    ) -> Verdict {
        match self.inner.egress_v6(skb, editor, offsets, pair) {
            Ok(()) => Verdict::Pass,
            Err(err) => {
                let verdict = err.verdict();
                if verdict == Verdict::Drop {
                    self.inner.note_drop("nat_v6_egress", &err);
                }
                verdict
            }
        }
    }

    /// Translates an inbound IPv6 packet in place.
    pub fn ingress_v6(
        &self,
        skb: &mut SkbMeta,
        editor: &mut dyn PacketEditor,
        offsets: &PacketOffsetInfo,
        pair: &Pair6,
    ) -> Verdict {
        match self.inner.ingress_v6(skb, editor, offsets, pair) {
            Ok(()) => Verdict::Pass,
            Err(err) => {
                let verdict = err.verdict();
                if verdict == Verdict::Drop {
                    self.inner.note_drop("nat_v6_ingress", &err);
                }
                verdict
            }
        }
    }
}

impl EngineInner {
    pub(crate) fn egress_v6(
        &self,
        skb: &mut SkbMeta,
        editor: &mut dyn PacketEditor,
        offsets: &PacketOffsetInfo,
        pair: &Pair6,
    ) -> Result<(), NatError> {
        if offsets.l3_protocol != L3Proto::Ipv6
            || !offsets.l4_protocol.handled_for(L3Proto::Ipv6)
        {
            return Err(NatError::UnhandledProtocol);
        }
        let flow_l4 = offsets.flow_l4_protocol();
        let is_static = self.statics6.egress_match(flow_l4, &pair.src_addr, pair.src_port);

        // Static endpoints keep translating even when conntrack cannot be
        // established (table full, non-SYN first packet after a flush).
        match self.conntrack_v6_egress(skb, offsets, pair) {
            Ok(()) => {}
            Err(err) if !is_static => return Err(err),
            Err(_) => {}
        }

        let wan_prefix = self.wan_v6_prefix(skb.ifindex)?;
        if offsets.is_icmp_error() {
            rewrite_egress_v6_icmp_error(editor, offsets, pair, wan_prefix)
        } else {
            rewrite_egress_v6(editor, offsets, pair, wan_prefix)
        }
    }

    pub(crate) fn ingress_v6(
        &self,
        skb: &mut SkbMeta,
        editor: &mut dyn PacketEditor,
        offsets: &PacketOffsetInfo,
        pair: &Pair6,
    ) -> Result<(), NatError> {
        if offsets.l3_protocol != L3Proto::Ipv6
            || !offsets.l4_protocol.handled_for(L3Proto::Ipv6)
        {
            return Err(NatError::UnhandledProtocol);
        }
        let flow_l4 = offsets.flow_l4_protocol();

        let outcome = self.statics6.classify_ingress(flow_l4, &pair.dst_addr, pair.dst_port);
        let is_static = outcome.is_some();
        let prefix_hint = match outcome {
            Some(StaticOutcome6::RewritePrefix(prefix)) => prefix,
            Some(_) => prefix64(&pair.dst_addr),
            None => 0,
        };
        let mut need_replace = matches!(outcome, Some(StaticOutcome6::RewritePrefix(_)));
        let mut client_prefix = prefix_hint;

        let static_allow_reuse = if is_static {
            self.statics6
                .lookup(Gress::Ingress, flow_l4, pair.dst_port, &pair.dst_addr)
                .map_or(true, |m| m.allow_reuse)
        } else {
            true
        };

        let key = ConnKey6::from_client(flow_l4, &pair.dst_addr, pair.dst_port);
        let allow_create =
            is_static && !offsets.is_icmp_error() && offsets.pkt_type.allows_initiating();
        let lookup = self.conns6.lookup_or_create(key, allow_create, || {
            ConnEntry6::new(
                prefix_hint,
                (pair.src_addr, pair.src_port),
                static_allow_reuse,
                FlowState::new(
                    &self.clock,
                    Gress::Ingress,
                    skb.flow_id(),
                    skb.cpu_id,
                    self.config.report_interval,
                ),
            )
        });

        match lookup {
            Ok(lookup) => {
                if lookup.is_created() {
                    if let Err(err) = self.spawn_timer_v6(key) {
                        self.conns6.remove(&key);
                        if !is_static {
                            return Err(err);
                        }
                    }
                }
                let entry = lookup.into_entry();
                if !is_static {
                    // Dynamic path: the stored prefix routes the packet and
                    // the trigger gates it.
                    client_prefix = entry.client_prefix();
                    if !entry.allow_reuse()
                        && !offsets.l4_protocol.is_icmp()
                        && (pair.src_addr, pair.src_port) != entry.trigger()
                    {
                        return Err(NatError::EndpointFiltered);
                    }
                    need_replace = true;
                }
                entry.flow.on_packet(
                    Gress::Ingress,
                    offsets.pkt_type,
                    &self.clock,
                    self.config.report_interval,
                )?;
                entry.flow.accumulate(true, skb.len as u64);
            }
            Err(err) => {
                if !is_static {
                    return Err(err);
                }
            }
        }

        match outcome {
            Some(StaticOutcome6::MapToLocal) | Some(StaticOutcome6::VerifySuffix) => {
                skb.set_ingress_static_mark();
                return Ok(());
            }
            _ => {}
        }
        if !need_replace {
            return Ok(());
        }

        if offsets.is_icmp_error() {
            rewrite_ingress_v6_icmp_error(editor, offsets, client_prefix)
        } else {
            rewrite_ingress_v6(editor, offsets, pair, client_prefix)
        }
    }

    /// Per-suffix conntrack upkeep for an outbound packet: create on
    /// flow-initiating packets, refresh the rotation-sensitive hints when
    /// the observed prefix moved, then run the state machine.
    fn conntrack_v6_egress(
        &self,
        skb: &SkbMeta,
        offsets: &PacketOffsetInfo,
        pair: &Pair6,
    ) -> Result<(), NatError> {
        let flow_l4 = offsets.flow_l4_protocol();
        let key = ConnKey6::from_client(flow_l4, &pair.src_addr, pair.src_port);
        let allow_create = offsets.pkt_type.allows_initiating();

        let lookup = self.conns6.lookup_or_create(key, allow_create, || {
            ConnEntry6::new(
                prefix64(&pair.src_addr),
                (pair.dst_addr, pair.dst_port),
                skb.allow_reuse_port(),
                FlowState::new(
                    &self.clock,
                    Gress::Egress,
                    skb.flow_id(),
                    skb.cpu_id,
                    self.config.report_interval,
                ),
            )
        })?;

        match &lookup {
            CtLookup::Created(_) => {
                if let Err(err) = self.spawn_timer_v6(key) {
                    self.conns6.remove(&key);
                    return Err(err);
                }
                tracing::debug!(port = key.client_port, "v6 conntrack created");
            }
            CtLookup::Existing(entry) => {
                if !same_prefix60(entry.client_prefix(), prefix64(&pair.src_addr)) {
                    entry.refresh(
                        &pair.src_addr,
                        (pair.dst_addr, pair.dst_port),
                        skb.allow_reuse_port(),
                        skb.flow_id(),
                    );
                    tracing::debug!(port = key.client_port, "v6 client prefix rotated");
                }
            }
        }

        let entry = lookup.into_entry();
        entry.flow.on_packet(
            Gress::Egress,
            offsets.pkt_type,
            &self.clock,
            self.config.report_interval,
        )?;
        entry.flow.accumulate(false, skb.len as u64);
        Ok(())
    }

    /// One reporting-state tick for a v6 flow, invoked by its timer task.
    pub(crate) fn tick_v6(&self, key: &ConnKey6) -> TickOutcome {
        let Some(entry) = self.conns6.get(key) else {
            return TickOutcome::Released;
        };
        let interval = self.config.report_interval;

        if entry.flow.report_state() == ReportState::Release {
            let event = self.v6_event(key, &entry, MetricStatus::Delete);
            if self.reporter.try_report(event).is_err() {
                entry.flow.timer().arm(&self.clock, interval);
                return TickOutcome::Rearmed;
            }
            self.conns6.remove(key);
            tracing::debug!(port = key.client_port, "v6 flow released");
            return TickOutcome::Released;
        }

        let event = self.v6_event(key, &entry, MetricStatus::Active);
        if self.reporter.try_report(event).is_err() {
            entry.flow.timer().arm(&self.clock, interval);
            return TickOutcome::Rearmed;
        }

        let delay = entry
            .flow
            .advance_report(key.l4proto, &self.config)
            .unwrap_or(interval);
        entry.flow.timer().arm(&self.clock, delay);
        TickOutcome::Rearmed
    }

    fn v6_event(
        &self,
        key: &ConnKey6,
        entry: &ConnEntry6,
        status: MetricStatus,
    ) -> NatConnMetricEvent {
        let counters = entry.flow.counters();
        let (trigger_addr, trigger_port) = entry.trigger();
        NatConnMetricEvent {
            src_addr: join_prefix_suffix(entry.client_prefix(), &key.client_suffix).into(),
            dst_addr: trigger_addr.into(),
            src_port: key.client_port,
            dst_port: trigger_port,
            l3_proto: L3Proto::Ipv6,
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

fn l4_csum_offset(l4_offset: usize, l4proto: L4Proto) -> Result<usize, NatError> {
    match l4proto {
        L4Proto::Tcp => Ok(l4_offset + hdr::TCP_CHECK),
        L4Proto::Udp => Ok(l4_offset + hdr::UDP_CHECK),
        L4Proto::Icmpv6 => Ok(l4_offset + hdr::ICMPV6_CHECK),
        L4Proto::Icmp => Err(NatError::UnhandledProtocol),
    }
}

/// A 64-bit address delta folded through two 32-bit checksum fixups.
fn l4_csum_replace_u64(
    editor: &mut dyn PacketEditor,
    csum_offset: usize,
    old: u64,
    new: u64,
    flags: CsumFlags,
) -> Result<(), NatError> {
    editor.l4_csum_replace(csum_offset, (old >> 32) as u32, (new >> 32) as u32, 4, flags)?;
    editor.l4_csum_replace(csum_offset, old as u32, new as u32, 4, flags)
}

/// Egress prefix substitution: the upper 60 bits of the source become the
/// WAN prefix, the topology nibble stays with the client.
fn rewrite_egress_v6(
    editor: &mut dyn PacketEditor,
    offsets: &PacketOffsetInfo,
    pair: &Pair6,
    wan_prefix: u64,
) -> Result<(), NatError> {
    let l4_off = offsets.l4_offset.ok_or(NatError::UnhandledProtocol)?;
    let csum_off = l4_csum_offset(l4_off, offsets.l4_protocol)?;
    let old = prefix64(&pair.src_addr);
    let new = merge_prefix60(old, wan_prefix);
    editor.store_bytes(offsets.l3_offset + hdr::IPV6_SADDR, &new.to_be_bytes())?;
    l4_csum_replace_u64(editor, csum_off, old, new, CsumFlags::PSEUDO)
}

/// Egress rewrite of an outbound ICMPv6 error: the quoted destination and
/// the outer sender both move to the WAN prefix, with the checksum cascade
/// ordered inner-L4, outer-over-inner-L3, outer-over-inner-csum, then the
/// outer pseudo-header delta.
fn rewrite_egress_v6_icmp_error(
    editor: &mut dyn PacketEditor,
    offsets: &PacketOffsetInfo,
    pair: &Pair6,
    wan_prefix: u64,
) -> Result<(), NatError> {
    let l4_off = offsets.l4_offset.ok_or(NatError::UnhandledProtocol)?;
    let inner_l3 = offsets.icmp_error_l3_offset.ok_or(NatError::UnhandledProtocol)?;
    let inner_l4 = offsets
        .icmp_error_inner_l4_offset
        .ok_or(NatError::UnhandledProtocol)?;
    let inner_proto = offsets
        .icmp_error_l4_protocol
        .ok_or(NatError::UnhandledProtocol)?;

    let old_prefix = prefix64(&pair.src_addr);
    let new_prefix = merge_prefix60(old_prefix, wan_prefix);

    let sender_off = offsets.l3_offset + hdr::IPV6_SADDR;
    let old_sender = editor.load_u64(sender_off)?;
    let new_sender = merge_prefix60(old_sender, wan_prefix);

    let inner_csum_off = l4_csum_offset(inner_l4, inner_proto)?;
    let outer_csum_off = l4_csum_offset(l4_off, offsets.l4_protocol)?;

    let old_inner_csum = editor.load_u16(inner_csum_off)?;
    editor.store_bytes(inner_l3 + hdr::IPV6_DADDR, &new_prefix.to_be_bytes())?;
    l4_csum_replace_u64(editor, inner_csum_off, old_prefix, new_prefix, CsumFlags::NONE)?;
    l4_csum_replace_u64(editor, outer_csum_off, old_prefix, new_prefix, CsumFlags::NONE)?;
    let new_inner_csum = editor.load_u16(inner_csum_off)?;
    editor.l4_csum_replace(
        outer_csum_off,
        old_inner_csum as u32,
        new_inner_csum as u32,
        2,
        CsumFlags::NONE,
    )?;

    editor.store_bytes(sender_off, &new_sender.to_be_bytes())?;
    l4_csum_replace_u64(editor, outer_csum_off, old_sender, new_sender, CsumFlags::PSEUDO)
}

/// Ingress prefix restoration: the destination's upper 64 bits become the
/// stored client prefix.
fn rewrite_ingress_v6(
    editor: &mut dyn PacketEditor,
    offsets: &PacketOffsetInfo,
    pair: &Pair6,
    client_prefix: u64,
) -> Result<(), NatError> {
    let l4_off = offsets.l4_offset.ok_or(NatError::UnhandledProtocol)?;
    let csum_off = l4_csum_offset(l4_off, offsets.l4_protocol)?;
    let old = prefix64(&pair.dst_addr);
    editor.store_bytes(offsets.l3_offset + hdr::IPV6_DADDR, &client_prefix.to_be_bytes())?;
    l4_csum_replace_u64(editor, csum_off, old, client_prefix, CsumFlags::PSEUDO)
}

/// Ingress rewrite of an inbound ICMPv6 error: the quoted source and the
/// outer destination both return to the client prefix.
fn rewrite_ingress_v6_icmp_error(
    editor: &mut dyn PacketEditor,
    offsets: &PacketOffsetInfo,
    client_prefix: u64,
) -> Result<(), NatError> {
    let l4_off = offsets.l4_offset.ok_or(NatError::UnhandledProtocol)?;
    let inner_l3 = offsets.icmp_error_l3_offset.ok_or(NatError::UnhandledProtocol)?;
    let inner_l4 = offsets
        .icmp_error_inner_l4_offset
        .ok_or(NatError::UnhandledProtocol)?;
    let inner_proto = offsets
        .icmp_error_l4_protocol
        .ok_or(NatError::UnhandledProtocol)?;

    let inner_src_off = inner_l3 + hdr::IPV6_SADDR;
    let old_prefix = editor.load_u64(inner_src_off)?;

    let inner_csum_off = l4_csum_offset(inner_l4, inner_proto)?;
    let outer_csum_off = l4_csum_offset(l4_off, offsets.l4_protocol)?;

    let old_inner_csum = editor.load_u16(inner_csum_off)?;
    editor.store_bytes(inner_src_off, &client_prefix.to_be_bytes())?;
    l4_csum_replace_u64(editor, inner_csum_off, old_prefix, client_prefix, CsumFlags::NONE)?;
    l4_csum_replace_u64(editor, outer_csum_off, old_prefix, client_prefix, CsumFlags::NONE)?;
    let new_inner_csum = editor.load_u16(inner_csum_off)?;
    editor.l4_csum_replace(
        outer_csum_off,
        old_inner_csum as u32,
        new_inner_csum as u32,
        2,
        CsumFlags::NONE,
    )?;

    editor.store_bytes(offsets.l3_offset + hdr::IPV6_DADDR, &client_prefix.to_be_bytes())?;
    l4_csum_replace_u64(editor, outer_csum_off, old_prefix, client_prefix, CsumFlags::PSEUDO)
}
