// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Pseudo-bridge responder: per-upstream-interface ARP / IPv6 Neighbor
//! Solicitation proxies that make tunnel subnets appear locally present on
//! an upstream L2 segment.
//!
//! Each responder owns a pcap handle with a BPF filter for ARP and NS, a
//! working set of networks (configured networks plus offsets resolved
//! against the interface's current base network) and a skip set of
//! addresses it must never impersonate (the host's own binds plus
//! configured exclusions). Capture runs on a dedicated OS thread; open
//! failures retry every five seconds.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use pnet::packet::arp::{ArpHardwareTypes, ArpOperations, ArpPacket, MutableArpPacket};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::icmpv6::{self, Icmpv6Code, Icmpv6Packet, Icmpv6Types, MutableIcmpv6Packet};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv6::{Ipv6Packet, MutableIpv6Packet};
use pnet::packet::{MutablePacket, Packet};
use pnet::util::MacAddr;
use tracing::{debug, info, warn};
use wgpanel_types::{HostNet, ResponderNetworks};

use crate::netinfo::{interface_mac, resolve_roaming_net};

const BPF_FILTER: &str = "(arp or (icmp6 and ip6[40] == 135)) and not vlan";
const SNAPLEN: i32 = 9200;
const RETRY_DELAY: Duration = Duration::from_secs(5);
/// Capture read timeout; doubles as the stop-flag poll interval.
const READ_TIMEOUT_MS: i32 = 500;

pub struct PseudoBridgeService {
    responders: Mutex<HashMap<String, Responder>>,
}

struct Responder {
    configured: ResponderNetworks,
    shared: Arc<ResponderShared>,
}

pub(crate) struct ResponderShared {
    ifname: String,
    stop: AtomicBool,
    state: RwLock<WorkingState>,
}

/// The responder's answer set, rebuilt whenever configuration or base
/// networks change. Published snapshots are deep copies; the packet loop
/// only ever reads.
#[derive(Debug, Default, Clone)]
pub(crate) struct WorkingState {
    configured: ResponderNetworks,
    v4_base: Option<HostNet>,
    v6_base: Option<HostNet>,
    working_v4: Vec<HostNet>,
    working_v6: Vec<HostNet>,
    skip_v4: HashSet<Ipv4Addr>,
    skip_v6: HashSet<Ipv6Addr>,
    bound_v4: Vec<Ipv4Addr>,
    bound_v6: Vec<Ipv6Addr>,
}

impl WorkingState {
    /// Expand configured networks and offsets into the concrete answer set
    /// and refresh the skip sets.
    fn recompute(&mut self, ifname: &str) {
        self.working_v4 = self.configured.v4_networks.clone();
        if let Some(base) = self.v4_base {
            for offset in &self.configured.v4_offsets {
                match resolve_roaming_net(&base, offset) {
                    Ok(net) => self.working_v4.push(net),
                    Err(e) => {
                        warn!(ifname, %offset, %base, error = %e, "cannot resolve v4 offset")
                    }
                }
            }
        }
        self.working_v6 = self.configured.v6_networks.clone();
        if let Some(base) = self.v6_base {
            for offset in &self.configured.v6_offsets {
                match resolve_roaming_net(&base, offset) {
                    Ok(net) => self.working_v6.push(net),
                    Err(e) => {
                        warn!(ifname, %offset, %base, error = %e, "cannot resolve v6 offset")
                    }
                }
            }
        }

        self.skip_v4 = self.configured.v4_skipped.iter().copied().collect();
        self.skip_v4.extend(self.bound_v4.iter().copied());
        self.skip_v6 = self.configured.v6_skipped.iter().copied().collect();
        self.skip_v6.extend(self.bound_v6.iter().copied());
    }
}

pub(crate) fn should_answer_v4(state: &WorkingState, target: Ipv4Addr) -> bool {
    if state.skip_v4.contains(&target) {
        return false;
    }
    state
        .working_v4
        .iter()
        .any(|net| net.contains(IpAddr::V4(target)))
}

pub(crate) fn should_answer_v6(state: &WorkingState, target: Ipv6Addr) -> bool {
    if state.skip_v6.contains(&target) {
        return false;
    }
    state
        .working_v6
        .iter()
        .any(|net| net.contains(IpAddr::V6(target)))
}

/// Target address of a Neighbor Solicitation: 4 reserved bytes, then the
/// 16-byte target, inside the ICMPv6 payload.
pub(crate) fn ns_target(icmp_payload: &[u8]) -> Option<Ipv6Addr> {
    let bytes: [u8; 16] = icmp_payload.get(4..20)?.try_into().ok()?;
    Some(Ipv6Addr::from(bytes))
}

impl PseudoBridgeService {
    pub fn new() -> Arc<Self> {
        Arc::new(PseudoBridgeService {
            responders: Mutex::new(HashMap::new()),
        })
    }

    /// Reconcile the running responder set against the published
    /// configuration: start new upstreams, update changed ones (set
    /// equality per family, skip sets included), stop unseen ones.
    pub fn update_configuration(&self, want: HashMap<String, ResponderNetworks>) {
        let mut responders = self.lock();

        let stale: Vec<String> = responders
            .keys()
            .filter(|name| !want.contains_key(*name))
            .cloned()
            .collect();
        for ifname in stale {
            if let Some(responder) = responders.remove(&ifname) {
                responder.shared.request_stop();
                info!(ifname, "stopped pseudo-bridge responder");
            }
        }

        for (ifname, networks) in want {
            match responders.get_mut(&ifname) {
                Some(responder) => {
                    if !responder.configured.same_set(&networks) {
                        responder.configured = networks.clone();
                        responder.shared.set_networks(networks);
                        info!(ifname, "updated pseudo-bridge responder");
                    }
                }
                None => {
                    let responder = Responder::start(ifname.clone(), networks);
                    responders.insert(ifname.clone(), responder);
                    info!(ifname, "started pseudo-bridge responder");
                }
            }
        }
    }

    /// Bind-state publication from the roaming engine: the base networks
    /// used to resolve offsets, and the live addresses joining the skip
    /// set.
    pub fn update_iface_binds(
        &self,
        ifname: &str,
        v4_base: Option<HostNet>,
        v6_base: Option<HostNet>,
        bound_v4: Vec<Ipv4Addr>,
        bound_v6: Vec<Ipv6Addr>,
    ) {
        let responders = self.lock();
        match responders.get(ifname) {
            Some(responder) => {
                responder
                    .shared
                    .set_binds(v4_base, v6_base, bound_v4, bound_v6);
            }
            None => {
                debug!(ifname, "no pseudo-bridge responder for bind update");
            }
        }
    }

    pub fn stop(&self) {
        let mut responders = self.lock();
        for (ifname, responder) in responders.drain() {
            responder.shared.request_stop();
            debug!(ifname, "signalled responder stop");
        }
        info!("pseudo-bridge service stopped");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Responder>> {
        self.responders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn running_interfaces(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn shared_for(&self, ifname: &str) -> Option<Arc<ResponderShared>> {
        self.lock().get(ifname).map(|r| r.shared.clone())
    }
}

impl Responder {
    fn start(ifname: String, networks: ResponderNetworks) -> Responder {
        let shared = Arc::new(ResponderShared {
            ifname: ifname.clone(),
            stop: AtomicBool::new(false),
            state: RwLock::new(WorkingState::default()),
        });
        shared.set_networks(networks.clone());

        let thread_shared = shared.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("pbridge-{ifname}"))
            .spawn(move || run_responder(thread_shared));
        if let Err(e) = spawned {
            warn!(ifname, error = %e, "failed to spawn responder thread");
        }

        Responder {
            configured: networks,
            shared,
        }
    }
}

impl ResponderShared {
    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, WorkingState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn read_state(&self) -> std::sync::RwLockReadGuard<'_, WorkingState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_networks(&self, networks: ResponderNetworks) {
        let mut state = self.write_state();
        state.configured = networks;
        state.recompute(&self.ifname);
    }

    fn set_binds(
        &self,
        v4_base: Option<HostNet>,
        v6_base: Option<HostNet>,
        bound_v4: Vec<Ipv4Addr>,
        bound_v6: Vec<Ipv6Addr>,
    ) {
        let mut state = self.write_state();
        state.v4_base = v4_base;
        state.v6_base = v6_base;
        state.bound_v4 = bound_v4;
        state.bound_v6 = bound_v6;
        state.recompute(&self.ifname);
    }

    fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub(crate) fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Sleep in small slices so a stop request is observed promptly.
    /// Returns false when stopping.
    fn sleep_unless_stopped(&self, total: Duration) -> bool {
        let slice = Duration::from_millis(250);
        let mut remaining = total;
        while !remaining.is_zero() {
            if self.stopped() {
                return false;
            }
            let step = remaining.min(slice);
            std::thread::sleep(step);
            remaining -= step;
        }
        !self.stopped()
    }
}

fn mac_addr(octets: [u8; 6]) -> MacAddr {
    MacAddr::new(
        octets[0], octets[1], octets[2], octets[3], octets[4], octets[5],
    )
}

fn open_capture(ifname: &str) -> Result<pcap::Capture<pcap::Active>, pcap::Error> {
    let mut capture = pcap::Capture::from_device(ifname)?
        .snaplen(SNAPLEN)
        .promisc(false)
        .timeout(READ_TIMEOUT_MS)
        .open()?;
    capture.filter(BPF_FILTER, true)?;
    Ok(capture)
}

/// The packet loop: open with retry backoff, serve until the handle fails,
/// close and reopen. A stop request is observed at every suspension point.
fn run_responder(shared: Arc<ResponderShared>) {
    info!(ifname = %shared.ifname, "pseudo-bridge packet loop starting");
    loop {
        if shared.stopped() {
            break;
        }
        let mut capture = match open_capture(&shared.ifname) {
            Ok(capture) => capture,
            Err(e) => {
                warn!(ifname = %shared.ifname, error = %e, "pcap open failed, retrying in 5s");
                if !shared.sleep_unless_stopped(RETRY_DELAY) {
                    break;
                }
                continue;
            }
        };

        loop {
            if shared.stopped() {
                info!(ifname = %shared.ifname, "pseudo-bridge packet loop stopping");
                return;
            }
            let data = match capture.next_packet() {
                Ok(packet) => packet.data.to_vec(),
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(e) => {
                    warn!(ifname = %shared.ifname, error = %e, "capture failed, reopening in 5s");
                    break;
                }
            };
            handle_packet(&shared, &mut capture, &data);
        }

        drop(capture);
        if !shared.sleep_unless_stopped(RETRY_DELAY) {
            break;
        }
    }
    info!(ifname = %shared.ifname, "pseudo-bridge packet loop exited");
}

fn handle_packet(
    shared: &ResponderShared,
    capture: &mut pcap::Capture<pcap::Active>,
    data: &[u8],
) {
    let Some(eth) = EthernetPacket::new(data) else {
        return;
    };
    match eth.get_ethertype() {
        EtherTypes::Arp => handle_arp(shared, capture, &eth),
        EtherTypes::Ipv6 => handle_ipv6(shared, capture, &eth),
        _ => {}
    }
}

fn handle_arp(
    shared: &ResponderShared,
    capture: &mut pcap::Capture<pcap::Active>,
    eth: &EthernetPacket<'_>,
) {
    let Some(arp) = ArpPacket::new(eth.payload()) else {
        return;
    };
    if arp.get_operation() != ArpOperations::Request {
        return;
    }
    let target = arp.get_target_proto_addr();
    {
        let state = shared.read_state();
        if !should_answer_v4(&state, target) {
            return;
        }
    }
    let Some(mac) = interface_mac(&shared.ifname) else {
        return;
    };
    let reply = build_arp_reply(
        mac_addr(mac),
        eth.get_source(),
        target,
        arp.get_sender_hw_addr(),
        arp.get_sender_proto_addr(),
    );
    debug!(ifname = %shared.ifname, %target, "answering ARP request");
    if let Err(e) = capture.sendpacket(&reply[..]) {
        warn!(ifname = %shared.ifname, error = %e, "failed to send ARP reply");
    }
}

fn handle_ipv6(
    shared: &ResponderShared,
    capture: &mut pcap::Capture<pcap::Active>,
    eth: &EthernetPacket<'_>,
) {
    let Some(ipv6) = Ipv6Packet::new(eth.payload()) else {
        return;
    };
    if ipv6.get_next_header() != IpNextHeaderProtocols::Icmpv6 {
        return;
    }
    let Some(icmp) = Icmpv6Packet::new(ipv6.payload()) else {
        return;
    };
    if icmp.get_icmpv6_type() != Icmpv6Types::NeighborSolicit {
        return;
    }
    let Some(target) = ns_target(icmp.payload()) else {
        return;
    };
    {
        let state = shared.read_state();
        if !should_answer_v6(&state, target) {
            return;
        }
    }
    let Some(mac) = interface_mac(&shared.ifname) else {
        return;
    };
    let reply = build_neighbor_advertisement(
        mac_addr(mac),
        eth.get_source(),
        target,
        ipv6.get_source(),
    );
    debug!(ifname = %shared.ifname, %target, "answering neighbor solicitation");
    if let Err(e) = capture.sendpacket(&reply[..]) {
        warn!(ifname = %shared.ifname, error = %e, "failed to send neighbor advertisement");
    }
}

/// Ethernet + ARP reply claiming `target_ip` with our hardware address.
pub(crate) fn build_arp_reply(
    our_mac: MacAddr,
    requester_mac: MacAddr,
    target_ip: Ipv4Addr,
    requester_hw: MacAddr,
    requester_ip: Ipv4Addr,
) -> [u8; 42] {
    let mut buf = [0u8; 42];
    if let Some(mut eth) = MutableEthernetPacket::new(&mut buf[..]) {
        eth.set_destination(requester_mac);
        eth.set_source(our_mac);
        eth.set_ethertype(EtherTypes::Arp);
    }
    if let Some(mut arp) = MutableArpPacket::new(&mut buf[14..]) {
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(ArpOperations::Reply);
        arp.set_sender_hw_addr(our_mac);
        arp.set_sender_proto_addr(target_ip);
        arp.set_target_hw_addr(requester_hw);
        arp.set_target_proto_addr(requester_ip);
    }
    buf
}

/// Ethernet + IPv6 + ICMPv6 Neighbor Advertisement: Solicited flag, target
/// address, and a Target Link-layer Address option carrying our MAC.
pub(crate) fn build_neighbor_advertisement(
    our_mac: MacAddr,
    requester_mac: MacAddr,
    target: Ipv6Addr,
    requester_ip: Ipv6Addr,
) -> [u8; 86] {
    let mut buf = [0u8; 86];
    if let Some(mut eth) = MutableEthernetPacket::new(&mut buf[..]) {
        eth.set_destination(requester_mac);
        eth.set_source(our_mac);
        eth.set_ethertype(EtherTypes::Ipv6);
    }
    if let Some(mut ipv6) = MutableIpv6Packet::new(&mut buf[14..]) {
        ipv6.set_version(6);
        ipv6.set_payload_length(32);
        ipv6.set_next_header(IpNextHeaderProtocols::Icmpv6);
        ipv6.set_hop_limit(255);
        ipv6.set_source(target);
        ipv6.set_destination(requester_ip);
    }
    if let Some(mut icmp) = MutableIcmpv6Packet::new(&mut buf[54..]) {
        icmp.set_icmpv6_type(Icmpv6Types::NeighborAdvert);
        icmp.set_icmpv6_code(Icmpv6Code(0));
        {
            let payload = icmp.payload_mut();
            payload[0] = 0x40; // Solicited
            payload[4..20].copy_from_slice(&target.octets());
            payload[20] = 2; // Target Link-layer Address
            payload[21] = 1; // length in 8-byte units
            payload[22..28].copy_from_slice(&our_mac.octets());
        }
        let sum = icmpv6::checksum(&icmp.to_immutable(), &target, &requester_ip);
        icmp.set_checksum(sum);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn networks(nets: &[&str], skipped: &[&str]) -> ResponderNetworks {
        ResponderNetworks {
            v4_networks: nets.iter().map(|s| s.parse().unwrap()).collect(),
            v4_skipped: skipped.iter().map(|s| s.parse().unwrap()).collect(),
            ..Default::default()
        }
    }

    fn state_for(networks: ResponderNetworks) -> WorkingState {
        let mut state = WorkingState {
            configured: networks,
            ..Default::default()
        };
        state.recompute("test0");
        state
    }

    #[test]
    fn answers_inside_managed_net_silent_outside_and_on_skips() {
        let state = state_for(networks(&["10.8.0.0/24"], &["10.8.0.1"]));

        assert!(should_answer_v4(&state, "10.8.0.5".parse().unwrap()));
        assert!(!should_answer_v4(&state, "10.8.0.1".parse().unwrap()));
        assert!(!should_answer_v4(&state, "10.9.0.5".parse().unwrap()));
    }

    #[test]
    fn live_binds_join_the_skip_set() {
        let mut state = state_for(networks(&["10.8.0.0/24"], &[]));
        assert!(should_answer_v4(&state, "10.8.0.7".parse().unwrap()));

        state.bound_v4 = vec!["10.8.0.7".parse().unwrap()];
        state.recompute("test0");
        assert!(!should_answer_v4(&state, "10.8.0.7".parse().unwrap()));
        // Other addresses still answered.
        assert!(should_answer_v4(&state, "10.8.0.8".parse().unwrap()));
    }

    #[test]
    fn v6_offsets_resolve_against_the_base() {
        let mut state = WorkingState::default();
        state.configured.v6_offsets = vec!["2001:db8:1::/64".parse().unwrap()];
        state.recompute("test0");
        // No base yet: offset stays unresolved, nothing is answered.
        assert!(!should_answer_v6(&state, "2001:db8:abcd::5".parse().unwrap()));

        state.v6_base = Some("2001:db8:abcd::9/64".parse().unwrap());
        state.recompute("test0");
        assert!(should_answer_v6(&state, "2001:db8:abcd::5".parse().unwrap()));
        assert!(!should_answer_v6(&state, "2001:db8:ffff::5".parse().unwrap()));
    }

    #[test]
    fn ns_target_extraction() {
        // reserved(4) + target(16)
        let mut payload = vec![0u8; 20];
        payload[4..20].copy_from_slice(&"2001:db8::42".parse::<Ipv6Addr>().unwrap().octets());
        assert_eq!(ns_target(&payload), Some("2001:db8::42".parse().unwrap()));
        assert_eq!(ns_target(&payload[..10]), None);
    }

    #[test]
    fn arp_reply_wire_format() {
        let ours = MacAddr::new(0x02, 0, 0, 0, 0, 1);
        let theirs = MacAddr::new(0x02, 0, 0, 0, 0, 2);
        let reply = build_arp_reply(
            ours,
            theirs,
            "10.8.0.5".parse().unwrap(),
            theirs,
            "10.8.0.200".parse().unwrap(),
        );

        let eth = EthernetPacket::new(&reply).unwrap();
        assert_eq!(eth.get_ethertype(), EtherTypes::Arp);
        assert_eq!(eth.get_source(), ours);
        assert_eq!(eth.get_destination(), theirs);

        let arp = ArpPacket::new(eth.payload()).unwrap();
        assert_eq!(arp.get_operation(), ArpOperations::Reply);
        assert_eq!(arp.get_sender_hw_addr(), ours);
        assert_eq!(arp.get_sender_proto_addr(), "10.8.0.5".parse::<Ipv4Addr>().unwrap());
        assert_eq!(arp.get_target_proto_addr(), "10.8.0.200".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn neighbor_advertisement_wire_format() {
        let ours = MacAddr::new(0x02, 0, 0, 0, 0, 1);
        let theirs = MacAddr::new(0x02, 0, 0, 0, 0, 2);
        let target: Ipv6Addr = "2001:db8::5".parse().unwrap();
        let requester: Ipv6Addr = "fe80::2".parse().unwrap();
        let reply = build_neighbor_advertisement(ours, theirs, target, requester);

        let eth = EthernetPacket::new(&reply).unwrap();
        assert_eq!(eth.get_ethertype(), EtherTypes::Ipv6);

        let ipv6 = Ipv6Packet::new(eth.payload()).unwrap();
        assert_eq!(ipv6.get_source(), target);
        assert_eq!(ipv6.get_destination(), requester);
        assert_eq!(ipv6.get_hop_limit(), 255);
        assert_eq!(ipv6.get_payload_length(), 32);

        let icmp = Icmpv6Packet::new(ipv6.payload()).unwrap();
        assert_eq!(icmp.get_icmpv6_type(), Icmpv6Types::NeighborAdvert);
        let payload = icmp.payload();
        assert_eq!(payload[0], 0x40); // Solicited flag
        assert_eq!(&payload[4..20], &target.octets());
        assert_eq!(payload[20], 2);
        assert_eq!(payload[21], 1);
        assert_ne!(icmp.get_checksum(), 0);
    }

    #[test]
    fn reconcile_starts_updates_and_stops_responders() {
        let service = PseudoBridgeService::new();

        let mut want = HashMap::new();
        want.insert("pbr-test0".to_string(), networks(&["10.8.0.0/24"], &[]));
        service.update_configuration(want.clone());
        assert_eq!(service.running_interfaces(), vec!["pbr-test0".to_string()]);

        let shared = service.shared_for("pbr-test0").unwrap();
        assert!(should_answer_v4(
            &shared.read_state(),
            "10.8.0.3".parse().unwrap()
        ));

        // Unchanged set: same responder instance remains.
        service.update_configuration(want);
        let same = service.shared_for("pbr-test0").unwrap();
        assert!(Arc::ptr_eq(&shared, &same));

        // Changed set: networks replaced in place.
        let mut updated = HashMap::new();
        updated.insert("pbr-test0".to_string(), networks(&["10.9.0.0/24"], &[]));
        service.update_configuration(updated);
        let state = shared.read_state().clone();
        assert!(should_answer_v4(&state, "10.9.0.3".parse().unwrap()));
        assert!(!should_answer_v4(&state, "10.8.0.3".parse().unwrap()));

        // Removed from config: stopped and discarded.
        service.update_configuration(HashMap::new());
        assert!(service.running_interfaces().is_empty());
        assert!(shared.stopped());
    }

    #[test]
    fn bind_updates_only_reach_known_responders() {
        let service = PseudoBridgeService::new();
        // Unknown interface: no-op rather than an error.
        service.update_iface_binds("pbr-nope", None, None, vec![], vec![]);

        let mut want = HashMap::new();
        want.insert("pbr-test1".to_string(), networks(&["10.8.0.0/24"], &[]));
        service.update_configuration(want);

        service.update_iface_binds(
            "pbr-test1",
            Some("192.0.2.10/24".parse().unwrap()),
            None,
            vec!["10.8.0.9".parse().unwrap()],
            vec![],
        );
        let shared = service.shared_for("pbr-test1").unwrap();
        assert!(!should_answer_v4(
            &shared.read_state(),
            "10.8.0.9".parse().unwrap()
        ));
        service.stop();
    }
}
