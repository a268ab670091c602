//! Parsed-packet types shared by both address families.
//!
//! The engine never parses wire bytes itself: an external scanner hands it a
//! [`PacketOffsetInfo`] plus a [`Pair4`]/[`Pair6`] address pair, and the
//! engine hands rewrites back through the [`editor::PacketEditor`] contract.
//! This module also owns the packet-mark bit layout (flow id, allow-reuse
//! flag, ingress-static routing mark).

pub mod checksum;
pub mod editor;

use std::net::{Ipv4Addr, Ipv6Addr};

use serde::Serialize;

/// Network-layer protocol of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum L3Proto {
    Ipv4,
    Ipv6,
}

/// Transport-layer protocols the engine knows about.
///
/// Anything else never reaches the translation paths; the engine returns
/// [`crate::Verdict::Pass`] and lets the stack handle the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum L4Proto {
    Tcp,
    Udp,
    Icmp,
    Icmpv6,
}

impl L4Proto {
    /// Maps an IP protocol number to a handled transport, if any.
    pub fn from_ip_proto(proto: u8) -> Option<Self> {
        match proto {
            6 => Some(L4Proto::Tcp),
            17 => Some(L4Proto::Udp),
            1 => Some(L4Proto::Icmp),
            58 => Some(L4Proto::Icmpv6),
            _ => None,
        }
    }

    /// Whether this transport is valid inside the given network layer.
    pub fn handled_for(self, l3: L3Proto) -> bool {
        match (self, l3) {
            (L4Proto::Icmp, L3Proto::Ipv4) | (L4Proto::Icmpv6, L3Proto::Ipv6) => true,
            (L4Proto::Icmp, _) | (L4Proto::Icmpv6, _) => false,
            _ => true,
        }
    }

    /// ICMP-family protocols are exempt from endpoint filtering.
    pub fn is_icmp(self) -> bool {
        matches!(self, L4Proto::Icmp | L4Proto::Icmpv6)
    }
}

/// Direction of a packet relative to the NAT boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Gress {
    Ingress,
    Egress,
}

impl Gress {
    /// The opposite direction. `dual(dual(g)) == g`.
    pub fn dual(self) -> Self {
        match self {
            Gress::Ingress => Gress::Egress,
            Gress::Egress => Gress::Ingress,
        }
    }
}

/// Classification of a packet produced by the external scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PktType {
    /// UDP or ICMP query traffic: no handshake, established on first packet.
    Connless,
    TcpSyn,
    TcpAck,
    TcpFin,
    TcpRst,
    /// ICMP/ICMPv6 error carrying the offending packet's headers.
    IcmpError,
}

impl PktType {
    /// Only connectionless traffic and TCP SYN may create new flow state.
    pub fn allows_initiating(self) -> bool {
        matches!(self, PktType::Connless | PktType::TcpSyn)
    }
}

/// IPv4 address/port pair as seen on the wire.
///
/// For ICMP the ports carry the echo identifier; for ICMP errors the pair
/// describes the embedded original flow, oriented like a regular packet of
/// that flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pair4 {
    pub src_addr: Ipv4Addr,
    pub src_port: u16,
    pub dst_addr: Ipv4Addr,
    pub dst_port: u16,
}

/// IPv6 counterpart of [`Pair4`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pair6 {
    pub src_addr: Ipv6Addr,
    pub src_port: u16,
    pub dst_addr: Ipv6Addr,
    pub dst_port: u16,
}

/// Header offsets and protocol info delivered by the external packet scanner.
///
/// For ICMP-error packets `l4_offset`/`l4_protocol` describe the outer
/// ICMP/ICMPv6 header while the `icmp_error_*` fields describe the embedded
/// original headers; flow lookups key on [`Self::flow_l4_protocol`].
#[derive(Debug, Clone, Copy)]
pub struct PacketOffsetInfo {
    /// Byte offset of the IP header (14 behind an Ethernet header).
    pub l3_offset: usize,
    pub l3_protocol: L3Proto,
    /// Offset of the transport header. `None` for a non-first fragment,
    /// in which case only the address is rewritten.
    pub l4_offset: Option<usize>,
    pub l4_protocol: L4Proto,
    pub pkt_type: PktType,
    /// Offset of the embedded IP header inside an ICMP error payload.
    pub icmp_error_l3_offset: Option<usize>,
    /// Offset of the embedded transport header inside an ICMP error payload.
    pub icmp_error_inner_l4_offset: Option<usize>,
    /// Transport protocol of the embedded original packet.
    pub icmp_error_l4_protocol: Option<L4Proto>,
}

impl PacketOffsetInfo {
    pub fn is_icmp_error(&self) -> bool {
        self.pkt_type == PktType::IcmpError
    }

    /// The protocol that identifies the flow in the mapping and conntrack
    /// tables: the embedded protocol for ICMP errors, the outer one otherwise.
    pub fn flow_l4_protocol(&self) -> L4Proto {
        if self.is_icmp_error() {
            self.icmp_error_l4_protocol.unwrap_or(self.l4_protocol)
        } else {
            self.l4_protocol
        }
    }
}

/// Low byte of the packet mark carries the flow id.
pub const MARK_FLOW_ID_MASK: u32 = 0x0000_00ff;
/// Bit 8 of the mark requests endpoint-independent filtering (port reuse).
pub const MARK_ALLOW_REUSE: u32 = 0x0000_0100;
/// Mark region reserved for cache/routing decisions made by the engine.
pub const MARK_CACHE_MASK: u32 = 0x00ff_0000;
/// Routing mark set on packets admitted by a static ingress mapping.
pub const INGRESS_STATIC_MARK: u32 = 0x0001_0000;

/// Per-packet metadata travelling with the frame (a `__sk_buff` shadow).
#[derive(Debug, Clone, Copy)]
pub struct SkbMeta {
    /// Total frame length in bytes, used for the byte counters.
    pub len: u32,
    /// Interface the packet was received on / will leave through.
    pub ifindex: u32,
    /// Packet mark; low bits are set by the flow classifier upstream.
    pub mark: u32,
    /// Processor that handles this packet, recorded into metric events.
    pub cpu_id: u32,
}

impl SkbMeta {
    pub fn flow_id(&self) -> u8 {
        (self.mark & MARK_FLOW_ID_MASK) as u8
    }

    pub fn allow_reuse_port(&self) -> bool {
        self.mark & MARK_ALLOW_REUSE != 0
    }

    /// Masked write of [`INGRESS_STATIC_MARK`] into the cache region,
    /// leaving all other mark bits intact.
    pub fn set_ingress_static_mark(&mut self) {
        self.mark = (self.mark & !MARK_CACHE_MASK) | (INGRESS_STATIC_MARK & MARK_CACHE_MASK);
    }
}

/// Upper 64 bits of an IPv6 address as a big-endian integer.
pub fn prefix64(addr: &Ipv6Addr) -> u64 {
    let o = addr.octets();
    u64::from_be_bytes([o[0], o[1], o[2], o[3], o[4], o[5], o[6], o[7]])
}

/// Lower 64 bits (the interface identifier) of an IPv6 address.
pub fn suffix8(addr: &Ipv6Addr) -> [u8; 8] {
    let o = addr.octets();
    [o[8], o[9], o[10], o[11], o[12], o[13], o[14], o[15]]
}

/// Low nibble of prefix byte 7, preserved across prefix rewrites as a
/// topology identifier.
pub fn id_nibble(addr: &Ipv6Addr) -> u8 {
    addr.octets()[7] & 0x0f
}

/// Bits of the 64-bit prefix that get replaced on translation; the low
/// nibble of byte 7 stays with the client.
const PREFIX_TRANS_MASK: u64 = !0x0f;

/// True when two prefixes agree on the translated 60 bits.
pub fn same_prefix60(a: u64, b: u64) -> bool {
    a & PREFIX_TRANS_MASK == b & PREFIX_TRANS_MASK
}

/// Replaces the upper 60 bits of `old` with those of `new`, keeping the
/// topology nibble of `old`.
pub fn merge_prefix60(old: u64, new: u64) -> u64 {
    (old & !PREFIX_TRANS_MASK) | (new & PREFIX_TRANS_MASK)
}

/// Rebuilds a full address from a stored prefix and a conntrack-key suffix.
pub fn join_prefix_suffix(prefix: u64, suffix: &[u8; 8]) -> Ipv6Addr {
    let p = prefix.to_be_bytes();
    Ipv6Addr::from([
        p[0], p[1], p[2], p[3], p[4], p[5], p[6], p[7], suffix[0], suffix[1], suffix[2], suffix[3],
        suffix[4], suffix[5], suffix[6], suffix[7],
    ])
}

/// Common header field offsets used by the rewrite paths.
pub(crate) mod hdr {
    pub const IPV4_CHECK: usize = 10;
    pub const IPV4_SADDR: usize = 12;
    pub const IPV4_DADDR: usize = 16;

    pub const IPV6_SADDR: usize = 8;
    pub const IPV6_DADDR: usize = 24;

    pub const TCP_SOURCE: usize = 0;
    pub const TCP_DEST: usize = 2;
    pub const TCP_CHECK: usize = 16;

    pub const UDP_SOURCE: usize = 0;
    pub const UDP_DEST: usize = 2;
    pub const UDP_CHECK: usize = 6;

    pub const ICMP_CHECK: usize = 2;
    pub const ICMP_ECHO_ID: usize = 4;
    pub const ICMPV6_CHECK: usize = 2;

    /// Fixed ICMP header length; the embedded IP header of an error packet
    /// starts right behind it.
    pub const ICMP_HDR_LEN: usize = 8;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gress_dual_is_involution() {
        assert_eq!(Gress::Ingress.dual(), Gress::Egress);
        assert_eq!(Gress::Egress.dual(), Gress::Ingress);
        assert_eq!(Gress::Ingress.dual().dual(), Gress::Ingress);
    }

    #[test]
    fn test_l4_from_ip_proto() {
        assert_eq!(L4Proto::from_ip_proto(6), Some(L4Proto::Tcp));
        assert_eq!(L4Proto::from_ip_proto(17), Some(L4Proto::Udp));
        assert_eq!(L4Proto::from_ip_proto(1), Some(L4Proto::Icmp));
        assert_eq!(L4Proto::from_ip_proto(58), Some(L4Proto::Icmpv6));
        assert_eq!(L4Proto::from_ip_proto(47), None, "GRE is not handled");
    }

    #[test]
    fn test_l4_family_consistency() {
        assert!(L4Proto::Tcp.handled_for(L3Proto::Ipv4));
        assert!(L4Proto::Tcp.handled_for(L3Proto::Ipv6));
        assert!(L4Proto::Icmp.handled_for(L3Proto::Ipv4));
        assert!(!L4Proto::Icmp.handled_for(L3Proto::Ipv6));
        assert!(L4Proto::Icmpv6.handled_for(L3Proto::Ipv6));
        assert!(!L4Proto::Icmpv6.handled_for(L3Proto::Ipv4));
    }

    #[test]
    fn test_only_syn_and_connless_initiate() {
        assert!(PktType::Connless.allows_initiating());
        assert!(PktType::TcpSyn.allows_initiating());
        assert!(!PktType::TcpAck.allows_initiating());
        assert!(!PktType::TcpFin.allows_initiating());
        assert!(!PktType::TcpRst.allows_initiating());
        assert!(!PktType::IcmpError.allows_initiating());
    }

    #[test]
    fn test_mark_accessors() {
        let skb = SkbMeta { len: 100, ifindex: 2, mark: 0x0000_01a7, cpu_id: 0 };
        assert_eq!(skb.flow_id(), 0xa7);
        assert!(skb.allow_reuse_port());

        let skb = SkbMeta { len: 100, ifindex: 2, mark: 0x0000_0042, cpu_id: 0 };
        assert_eq!(skb.flow_id(), 0x42);
        assert!(!skb.allow_reuse_port());
    }

    #[test]
    fn test_static_mark_is_masked_write() {
        let mut skb = SkbMeta { len: 0, ifindex: 1, mark: 0x00ff_01a7, cpu_id: 0 };
        skb.set_ingress_static_mark();
        assert_eq!(skb.mark & MARK_CACHE_MASK, INGRESS_STATIC_MARK);
        assert_eq!(skb.mark & 0xff00_ffff, 0x0000_01a7, "other bits untouched");
        assert_eq!(skb.flow_id(), 0xa7);
    }

    #[test]
    fn test_prefix_and_suffix_split() {
        let addr: Ipv6Addr = "2001:db8:1:2:aaaa:bbbb:cccc:dddd".parse().unwrap();
        assert_eq!(prefix64(&addr), 0x2001_0db8_0001_0002);
        assert_eq!(
            suffix8(&addr),
            [0xaa, 0xaa, 0xbb, 0xbb, 0xcc, 0xcc, 0xdd, 0xdd]
        );
        assert_eq!(id_nibble(&addr), 0x2);
    }

    #[test]
    fn test_merge_prefix60_preserves_nibble() {
        let old = 0x2001_0db8_0001_000a_u64;
        let new = 0x2001_0db8_0002_0000_u64;
        let merged = merge_prefix60(old, new);
        assert_eq!(merged, 0x2001_0db8_0002_000a);
        assert!(same_prefix60(merged, new));
        assert!(!same_prefix60(old, new));
    }

    #[test]
    fn test_same_prefix60_ignores_only_low_nibble() {
        assert!(same_prefix60(0x2001_0db8_0001_0000, 0x2001_0db8_0001_000f));
        assert!(!same_prefix60(0x2001_0db8_0001_0000, 0x2001_0db8_0001_0010));
    }

    #[test]
    fn test_join_prefix_suffix_roundtrip() {
        let addr: Ipv6Addr = "2001:db8:5:6:1:2:3:4".parse().unwrap();
        let rebuilt = join_prefix_suffix(prefix64(&addr), &suffix8(&addr));
        assert_eq!(rebuilt, addr);
    }

    #[test]
    fn test_flow_protocol_uses_inner_for_icmp_error() {
        let offsets = PacketOffsetInfo {
            l3_offset: 14,
            l3_protocol: L3Proto::Ipv4,
            l4_offset: Some(34),
            l4_protocol: L4Proto::Icmp,
            pkt_type: PktType::IcmpError,
            icmp_error_l3_offset: Some(42),
            icmp_error_inner_l4_offset: Some(62),
            icmp_error_l4_protocol: Some(L4Proto::Udp),
        };
        assert!(offsets.is_icmp_error());
        assert_eq!(offsets.flow_l4_protocol(), L4Proto::Udp);
    }
}
