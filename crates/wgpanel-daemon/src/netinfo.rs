//! Kernel network state reads: link and address lookups, the "best
//! address" selection the roaming engine keys on, and L2/port availability
//! probes used by validation.

use std::cmp::Ordering;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use futures::TryStreamExt;
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use thiserror::Error;
use tracing::debug;
use wgpanel_types::{CidrError, HostNet};

#[derive(Debug, Error)]
pub enum NetError {
    #[error("interface {0} does not exist")]
    NoSuchInterface(String),

    #[error("interface {0:?} is not a Layer 2 device (no MAC address)")]
    NotLayer2(String),

    #[error("UDP port {0} is not available: {1}")]
    PortUnavailable(u16, std::io::Error),

    #[error("netlink error: {0}")]
    Netlink(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// IFA_F_* address flags as sent by the kernel.
pub const IFA_F_SECONDARY: u32 = 0x01;
pub const IFA_F_DADFAILED: u32 = 0x08;
pub const IFA_F_DEPRECATED: u32 = 0x20;
pub const IFA_F_TENTATIVE: u32 = 0x40;
pub const IFA_F_PERMANENT: u32 = 0x80;

/// One address bound to an interface, as reported over netlink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IfaceAddress {
    pub addr: IpAddr,
    pub prefix: u8,
    pub flags: u32,
}

/// Everything the roaming engine needs to know about an upstream interface
/// in one read: the best primary address per family plus every bound
/// address (for the responder skip sets).
#[derive(Debug, Clone, Default)]
pub struct IfaceSnapshot {
    pub best_v4: Option<HostNet>,
    pub best_v6: Option<HostNet>,
    pub bound_v4: Vec<Ipv4Addr>,
    pub bound_v6: Vec<Ipv6Addr>,
}

// -- Synchronous probes (no netlink round trip) -----------------------------

pub fn link_exists(ifname: &str) -> bool {
    pnet::datalink::interfaces().iter().any(|i| i.name == ifname)
}

pub fn interface_mac(ifname: &str) -> Option<[u8; 6]> {
    pnet::datalink::interfaces()
        .into_iter()
        .find(|i| i.name == ifname)
        .and_then(|i| i.mac)
        .map(|m| m.octets())
}

/// A pseudo-bridge or roaming master must be a real L2 device: present and
/// carrying a non-zero hardware address.
pub fn ensure_layer2(ifname: &str) -> Result<(), NetError> {
    if !link_exists(ifname) {
        return Err(NetError::NoSuchInterface(ifname.to_owned()));
    }
    match interface_mac(ifname) {
        Some(mac) if mac != [0u8; 6] => Ok(()),
        _ => Err(NetError::NotLayer2(ifname.to_owned())),
    }
}

/// Probe that a UDP port can still be bound (new interface validation).
pub fn udp_port_available(port: u16) -> Result<(), NetError> {
    std::net::UdpSocket::bind(("0.0.0.0", port))
        .map(drop)
        .map_err(|e| NetError::PortUnavailable(port, e))
}

// -- Netlink address reads --------------------------------------------------

async fn link_index(handle: &rtnetlink::Handle, ifname: &str) -> Result<u32, NetError> {
    let mut links = handle.link().get().match_name(ifname.to_string()).execute();
    let link = links
        .try_next()
        .await
        .map_err(|e| NetError::Netlink(e.to_string()))?
        .ok_or_else(|| NetError::NoSuchInterface(ifname.to_owned()))?;
    Ok(link.header.index)
}

fn parse_address(msg: &AddressMessage) -> Option<IfaceAddress> {
    let mut addr = None;
    let mut local = None;
    let mut flags = None;
    for attr in &msg.attributes {
        match attr {
            AddressAttribute::Local(a) => local = Some(*a),
            AddressAttribute::Address(a) => addr = Some(*a),
            AddressAttribute::Flags(f) => {
                flags = Some(f.iter().fold(0u32, |acc, fl| acc | u32::from(*fl)))
            }
            _ => {}
        }
    }
    // IFA_LOCAL is the interface's own address where it differs from
    // IFA_ADDRESS (IPv4 peer notation).
    let addr = local.or(addr)?;
    let flags = flags.unwrap_or_else(|| {
        msg.header
            .flags
            .iter()
            .fold(0u32, |acc, fl| acc | u32::from(u8::from(*fl)))
    });
    Some(IfaceAddress {
        addr,
        prefix: msg.header.prefix_len,
        flags,
    })
}

/// Dump every address bound to `ifname`.
pub async fn dump_addresses(ifname: &str) -> Result<Vec<IfaceAddress>, NetError> {
    let (conn, handle, _) = rtnetlink::new_connection()?;
    tokio::spawn(conn);
    dump_addresses_with(&handle, ifname).await
}

pub async fn dump_addresses_with(
    handle: &rtnetlink::Handle,
    ifname: &str,
) -> Result<Vec<IfaceAddress>, NetError> {
    let index = link_index(handle, ifname).await?;
    let messages: Vec<AddressMessage> = handle
        .address()
        .get()
        .set_link_index_filter(index)
        .execute()
        .try_collect()
        .await
        .map_err(|e| NetError::Netlink(e.to_string()))?;
    let addrs: Vec<IfaceAddress> = messages.iter().filter_map(parse_address).collect();
    debug!(ifname, count = addrs.len(), "dumped interface addresses");
    Ok(addrs)
}

/// One-shot snapshot: best primary address per family plus all bound
/// addresses.
pub async fn interface_snapshot(ifname: &str) -> Result<IfaceSnapshot, NetError> {
    let addrs = dump_addresses(ifname).await?;
    let (best_v4, best_v6) = pick_best(&addrs);
    let mut snapshot = IfaceSnapshot {
        best_v4,
        best_v6,
        ..Default::default()
    };
    for a in &addrs {
        match a.addr {
            IpAddr::V4(v4) => snapshot.bound_v4.push(v4),
            IpAddr::V6(v6) => snapshot.bound_v6.push(v6),
        }
    }
    Ok(snapshot)
}

// -- Best-address selection -------------------------------------------------

fn v6_link_local_unicast(a: Ipv6Addr) -> bool {
    a.segments()[0] & 0xffc0 == 0xfe80
}

fn v6_link_local_multicast(a: Ipv6Addr) -> bool {
    a.segments()[0] == 0xff02
}

fn is_ula(a: Ipv6Addr) -> bool {
    a.octets()[0] & 0xfe == 0xfc
}

fn is_private_or_ula(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(a) => a.is_private(),
        IpAddr::V6(a) => is_ula(a),
    }
}

fn is_link_local_unicast(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(a) => a.is_link_local(),
        IpAddr::V6(a) => v6_link_local_unicast(a),
    }
}

fn is_global_unicast(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(a) => {
            !a.is_unspecified()
                && !a.is_loopback()
                && !a.is_multicast()
                && !a.is_link_local()
                && !a.is_broadcast()
        }
        IpAddr::V6(a) => {
            !a.is_unspecified() && !a.is_loopback() && !a.is_multicast() && !v6_link_local_unicast(a)
        }
    }
}

/// Addresses the roaming engine refuses to bind to: unusable DAD states,
/// link-local of either kind, loopback.
pub(crate) fn eligible(a: &IfaceAddress) -> bool {
    if a.flags & (IFA_F_TENTATIVE | IFA_F_DEPRECATED | IFA_F_DADFAILED) != 0 {
        return false;
    }
    match a.addr {
        IpAddr::V4(v4) => {
            !v4.is_loopback() && !v4.is_link_local() && !(v4.is_multicast() && v4.octets()[..3] == [224, 0, 0])
        }
        IpAddr::V6(v6) => {
            !v6.is_loopback() && !v6_link_local_unicast(v6) && !v6_link_local_multicast(v6)
        }
    }
}

/// v4 prefix priority: blocks of /24 and longer first (more specific
/// wins), then shorter blocks (less specific wins).
fn v4_prefix_key(prefix: u8) -> (u8, i16) {
    if prefix >= 24 {
        (0, -(prefix as i16))
    } else {
        (1, prefix as i16)
    }
}

/// v6 prefix priority groups, best group first:
/// /48…/64 (longer wins), /33…/47 (shorter wins), /65…/124 (longer wins),
/// /0…/32 (shorter wins), /125…/128 (longer wins).
fn v6_prefix_key(prefix: u8) -> (u8, i16) {
    match prefix {
        48..=64 => (0, -(prefix as i16)),
        33..=47 => (1, prefix as i16),
        65..=124 => (2, -(prefix as i16)),
        0..=32 => (3, prefix as i16),
        _ => (4, -(prefix as i16)),
    }
}

fn prefix_key(a: &IfaceAddress) -> (u8, i16) {
    match a.addr {
        IpAddr::V4(_) => v4_prefix_key(a.prefix),
        IpAddr::V6(_) => v6_prefix_key(a.prefix),
    }
}

/// Scope rank: public global unicast, then private/ULA, then link-local,
/// then everything else.
pub(crate) fn scope_rank(addr: IpAddr) -> u8 {
    if is_global_unicast(addr) && !is_private_or_ula(addr) {
        return 0;
    }
    if is_private_or_ula(addr) {
        return 1;
    }
    if is_link_local_unicast(addr) {
        return 2;
    }
    3
}

/// Flag rank: permanent beats temporary/secondary beats the rest. The
/// kernel shares one bit for temporary (v6) and secondary (v4).
pub(crate) fn flag_rank(flags: u32) -> u8 {
    if flags & IFA_F_PERMANENT != 0 {
        return 0;
    }
    if flags & IFA_F_SECONDARY != 0 {
        return 1;
    }
    2
}

fn addr_bytes(addr: IpAddr) -> [u8; 16] {
    match addr {
        IpAddr::V4(a) => a.to_ipv6_mapped().octets(),
        IpAddr::V6(a) => a.octets(),
    }
}

/// Total order over candidate addresses; the minimum is the best.
pub(crate) fn better(a: &IfaceAddress, b: &IfaceAddress) -> Ordering {
    prefix_key(a)
        .cmp(&prefix_key(b))
        .then_with(|| scope_rank(a.addr).cmp(&scope_rank(b.addr)))
        .then_with(|| flag_rank(a.flags).cmp(&flag_rank(b.flags)))
        .then_with(|| addr_bytes(a.addr).cmp(&addr_bytes(b.addr)))
}

/// Pick the best eligible address per family. The result keeps the bound
/// prefix, so its network is the interface's base network.
pub(crate) fn pick_best(addrs: &[IfaceAddress]) -> (Option<HostNet>, Option<HostNet>) {
    let mut v4: Vec<&IfaceAddress> = addrs
        .iter()
        .filter(|a| eligible(a) && a.addr.is_ipv4())
        .collect();
    let mut v6: Vec<&IfaceAddress> = addrs
        .iter()
        .filter(|a| eligible(a) && a.addr.is_ipv6())
        .collect();
    v4.sort_by(|a, b| better(a, b));
    v6.sort_by(|a, b| better(a, b));

    let to_net = |a: &&IfaceAddress| HostNet::new(a.addr, a.prefix).ok();
    (v4.first().and_then(to_net), v6.first().and_then(to_net))
}

/// Resolve a roaming offset against a discovered base network. A matching
/// mask selects the bound block itself; a longer mask carves the sub-block
/// out of it.
pub fn resolve_roaming_net(base: &HostNet, offset: &HostNet) -> Result<HostNet, CidrError> {
    if base.family() == offset.family() && base.prefix() == offset.prefix() {
        return Ok(base.network());
    }
    base.network().subnet_by_offset(offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str, prefix: u8, flags: u32) -> IfaceAddress {
        IfaceAddress {
            addr: s.parse().unwrap(),
            prefix,
            flags,
        }
    }

    #[test]
    fn tentative_and_deprecated_are_skipped() {
        assert!(!eligible(&addr("203.0.113.5", 24, IFA_F_TENTATIVE)));
        assert!(!eligible(&addr("203.0.113.5", 24, IFA_F_DEPRECATED)));
        assert!(!eligible(&addr("203.0.113.5", 24, IFA_F_DADFAILED)));
        assert!(eligible(&addr("203.0.113.5", 24, IFA_F_PERMANENT)));
    }

    #[test]
    fn local_scopes_are_skipped() {
        assert!(!eligible(&addr("127.0.0.1", 8, 0)));
        assert!(!eligible(&addr("169.254.1.1", 16, 0)));
        assert!(!eligible(&addr("::1", 128, 0)));
        assert!(!eligible(&addr("fe80::1", 64, 0)));
        assert!(eligible(&addr("2001:db8::1", 64, 0)));
    }

    #[test]
    fn v4_prefers_specific_within_24_and_up() {
        let (best, _) = pick_best(&[
            addr("10.0.0.1", 24, 0),
            addr("10.0.1.1", 28, 0),
            addr("10.1.0.1", 16, 0),
        ]);
        // /28 beats /24 (both >= /24, more specific wins); /16 trails.
        assert_eq!(best.unwrap().to_string(), "10.0.1.1/28");
    }

    #[test]
    fn v4_short_prefixes_prefer_shorter() {
        let (best, _) = pick_best(&[addr("10.1.0.1", 16, 0), addr("10.2.0.1", 8, 0)]);
        assert_eq!(best.unwrap().to_string(), "10.2.0.1/8");
    }

    #[test]
    fn v6_group_order_and_direction() {
        // Group /48..=/64 beats /65..=/124 beats /0..=/32 beats /125..=/128.
        let (_, best) = pick_best(&[
            addr("2001:db8:f::1", 128, 0),
            addr("2001:db8:a::1", 64, 0),
            addr("2001:db8:b::1", 32, 0),
            addr("2001:db8:c::1", 96, 0),
        ]);
        assert_eq!(best.unwrap().to_string(), "2001:db8:a::1/64");

        // Inside /48..=/64 the longer mask wins.
        let (_, best) = pick_best(&[addr("2001:db8:a::1", 48, 0), addr("2001:db8:b::1", 64, 0)]);
        assert_eq!(best.unwrap().to_string(), "2001:db8:b::1/64");

        // Inside /33..=/47 the shorter mask wins.
        let (_, best) = pick_best(&[addr("2001:db8:a::1", 40, 0), addr("2001:db8:b::1", 45, 0)]);
        assert_eq!(best.unwrap().to_string(), "2001:db8:a::1/40");
    }

    #[test]
    fn scope_breaks_prefix_ties() {
        // Same prefix: public beats private.
        let (best, _) = pick_best(&[addr("10.0.0.9", 24, 0), addr("203.0.113.9", 24, 0)]);
        assert_eq!(best.unwrap().addr().to_string(), "203.0.113.9");

        assert_eq!(scope_rank("203.0.113.1".parse().unwrap()), 0);
        assert_eq!(scope_rank("10.0.0.1".parse().unwrap()), 1);
        assert_eq!(scope_rank("fd00::1".parse().unwrap()), 1);
        assert_eq!(scope_rank("fe80::1".parse().unwrap()), 2);
    }

    #[test]
    fn flags_break_scope_ties_then_smaller_ip() {
        let (best, _) = pick_best(&[
            addr("203.0.113.20", 24, IFA_F_SECONDARY),
            addr("203.0.113.10", 24, IFA_F_PERMANENT),
        ]);
        assert_eq!(best.unwrap().addr().to_string(), "203.0.113.10");

        let (best, _) = pick_best(&[
            addr("203.0.113.20", 24, IFA_F_PERMANENT),
            addr("203.0.113.10", 24, IFA_F_PERMANENT),
        ]);
        assert_eq!(best.unwrap().addr().to_string(), "203.0.113.10");
    }

    #[test]
    fn best_keeps_bound_prefix() {
        let (best, _) = pick_best(&[addr("203.0.113.5", 22, IFA_F_PERMANENT)]);
        let best = best.unwrap();
        assert_eq!(best.prefix(), 22);
        assert_eq!(best.network_str(), "203.0.113.4/22");
    }

    #[test]
    fn roaming_resolution_equal_mask_takes_bound_block() {
        let base: HostNet = "2001:db8:abcd::1/64".parse().unwrap();
        let offset: HostNet = "2001:db8:1::/64".parse().unwrap();
        assert_eq!(
            resolve_roaming_net(&base, &offset).unwrap().to_string(),
            "2001:db8:abcd::/64"
        );
    }

    #[test]
    fn roaming_resolution_longer_mask_carves_sub_block() {
        let base: HostNet = "2001:db8:abcd::1/64".parse().unwrap();
        let offset: HostNet = "0:0:0:0:8000::/65".parse().unwrap();
        assert_eq!(
            resolve_roaming_net(&base, &offset).unwrap().to_string(),
            "2001:db8:abcd:0:8000::/65"
        );
    }

    #[test]
    fn roaming_resolution_rejects_shorter_mask() {
        let base: HostNet = "2001:db8:abcd::1/64".parse().unwrap();
        let offset: HostNet = "::/48".parse().unwrap();
        assert!(resolve_roaming_net(&base, &offset).is_err());
    }
}
