//! Client write path: peers stored as offsets inside their server network.
//! Allocation is either manual (a concrete address validated for
//! containment and uniqueness) or `auto` (the lowest free host index,
//! skipping the network address, the v4 broadcast and the server's own
//! host).

use std::collections::HashMap;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use tracing::info;
use wgpanel_types::{Client, HostNet, PeerState, Server};

use crate::error::ServiceError;
use crate::keys;
use crate::sanitize;
use crate::store::Store;
use crate::wg::WgService;

#[derive(Debug, Clone, Default)]
pub struct ClientCreateRequest {
    pub name: String,
    /// `"auto"` or a concrete address; `None` skips the family.
    pub ip: Option<String>,
    pub ipv6: Option<String>,
    pub dns: Vec<String>,
    pub private_key: Option<String>,
    pub public_key: Option<String>,
    pub preshared_key: Option<String>,
    pub keepalive: Option<u16>,
}

#[derive(Debug, Clone, Default)]
pub struct ClientUpdateRequest {
    pub name: String,
    pub ip: Option<String>,
    pub ipv6: Option<String>,
    pub dns: Option<Vec<String>>,
    pub private_key: Option<String>,
    pub public_key: Option<String>,
    /// `Some("")` clears the preshared key.
    pub preshared_key: Option<String>,
    pub keepalive: Option<u16>,
}

pub struct ClientService {
    store: Arc<Store>,
    wg: Arc<WgService>,
}

impl ClientService {
    pub fn new(store: Arc<Store>, wg: Arc<WgService>) -> Self {
        ClientService { store, wg }
    }

    pub async fn create(
        &self,
        iface_id: &str,
        server_id: &str,
        req: ClientCreateRequest,
    ) -> Result<Client, ServiceError> {
        let mut iface = self
            .store
            .get_interface(iface_id)
            .ok_or(ServiceError::InterfaceNotFound)?;
        let server = self.store.get_server(iface_id, server_id)?;

        sanitize::is_safe_name(&req.name)?;
        let wants_v4 = req.ip.as_deref().is_some_and(|s| !s.is_empty());
        let wants_v6 = req.ipv6.as_deref().is_some_and(|s| !s.is_empty());
        if !wants_v4 && !wants_v6 {
            return Err(ServiceError::validation(
                "at least one of IPv4 or IPv6 must be specified",
            ));
        }
        for dns in &req.dns {
            sanitize::validate_ip_or_domain(dns)?;
        }

        let (private_key, public_key) = match (&req.private_key, &req.public_key) {
            (Some(private), _) if !private.is_empty() => {
                (Some(private.clone()), keys::private_to_public(private)?)
            }
            (_, Some(public)) if !public.is_empty() => (None, public.clone()),
            _ => {
                let (private, public) = keys::generate_keypair()?;
                (Some(private), public)
            }
        };

        let mut client = Client {
            id: self.store.next_client_id(&server),
            name: req.name.clone(),
            enabled: false,
            ipv4_offset: None,
            ipv6_offset: None,
            dns: req.dns.clone(),
            private_key,
            public_key,
            preshared_key: req.preshared_key.clone(),
            keepalive: req.keepalive,
        };

        if wants_v4 {
            let request = req.ip.as_deref().unwrap_or_default();
            allocate_v4(&mut client, &server, request)
                .map_err(|e| prefixed(e, "IPv4 allocation failed"))?;
        }
        if wants_v6 {
            let request = req.ipv6.as_deref().unwrap_or_default();
            allocate_v6(&mut client, &server, request)
                .map_err(|e| prefixed(e, "IPv6 allocation failed"))?;
        }

        match iface.server_mut(server_id) {
            Some(slot) => slot.clients.push(client.clone()),
            None => return Err(ServiceError::ServerNotFound),
        }
        self.store.set_interface(iface);
        self.store.save().await?;

        info!(iface_id, server_id, client_id = %client.id, name = %client.name, "created client");
        Ok(client)
    }

    pub fn get(
        &self,
        iface_id: &str,
        server_id: &str,
        client_id: &str,
    ) -> Result<Client, ServiceError> {
        self.store.get_client(iface_id, server_id, client_id)
    }

    pub fn get_all(&self, iface_id: &str, server_id: &str) -> Result<Vec<Client>, ServiceError> {
        Ok(self.store.get_server(iface_id, server_id)?.clients)
    }

    pub async fn update(
        &self,
        iface_id: &str,
        server_id: &str,
        client_id: &str,
        req: ClientUpdateRequest,
    ) -> Result<Client, ServiceError> {
        let mut iface = self
            .store
            .get_interface(iface_id)
            .ok_or(ServiceError::InterfaceNotFound)?;
        let server = self.store.get_server(iface_id, server_id)?;
        let mut client = self.store.get_client(iface_id, server_id, client_id)?;

        sanitize::is_safe_name(&req.name)?;
        if let Some(dns) = &req.dns {
            for entry in dns {
                sanitize::validate_ip_or_domain(entry)?;
            }
        }

        let mut needs_wg_sync = false;

        client.name = req.name.clone();
        if let Some(dns) = req.dns {
            client.dns = dns;
        }
        if let Some(keepalive) = req.keepalive {
            client.keepalive = Some(keepalive);
            needs_wg_sync = true;
        }

        if let Some(private) = req.private_key.as_deref().filter(|k| !k.is_empty()) {
            client.public_key = keys::private_to_public(private)?;
            client.private_key = Some(private.to_owned());
            needs_wg_sync = true;
        } else if let Some(public) = req.public_key.as_deref().filter(|k| !k.is_empty()) {
            client.public_key = public.to_owned();
            client.private_key = None;
            needs_wg_sync = true;
        }

        if let Some(psk) = &req.preshared_key {
            client.preshared_key = if psk.is_empty() {
                None
            } else {
                Some(psk.clone())
            };
            needs_wg_sync = true;
        }

        match req.ip.as_deref().filter(|s| !s.is_empty()) {
            None => {
                needs_wg_sync |= client.ipv4_offset.is_some();
                client.ipv4_offset = None;
            }
            Some(request) => {
                let before = client.ipv4_offset;
                allocate_v4(&mut client, &server, request)
                    .map_err(|e| prefixed(e, "IPv4 update failed"))?;
                needs_wg_sync |= before != client.ipv4_offset;
            }
        }
        match req.ipv6.as_deref().filter(|s| !s.is_empty()) {
            None => {
                needs_wg_sync |= client.ipv6_offset.is_some();
                client.ipv6_offset = None;
            }
            Some(request) => {
                let before = client.ipv6_offset;
                allocate_v6(&mut client, &server, request)
                    .map_err(|e| prefixed(e, "IPv6 update failed"))?;
                needs_wg_sync |= before != client.ipv6_offset;
            }
        }

        match iface
            .server_mut(server_id)
            .and_then(|s| s.client_mut(client_id))
        {
            Some(slot) => *slot = client.clone(),
            None => return Err(ServiceError::ClientNotFound),
        }
        self.store.set_interface(iface.clone());
        self.store.save().await?;

        if needs_wg_sync && server.enabled {
            self.wg.sync_to_conf_and_interface(&iface).await?;
        }
        Ok(client)
    }

    pub async fn set_enabled(
        &self,
        iface_id: &str,
        server_id: &str,
        client_id: &str,
        enabled: bool,
    ) -> Result<(), ServiceError> {
        let mut iface = self
            .store
            .get_interface(iface_id)
            .ok_or(ServiceError::InterfaceNotFound)?;
        let server = self.store.get_server(iface_id, server_id)?;
        let client = self.store.get_client(iface_id, server_id, client_id)?;

        if client.enabled == enabled {
            return Ok(());
        }
        match iface
            .server_mut(server_id)
            .and_then(|s| s.client_mut(client_id))
        {
            Some(slot) => slot.enabled = enabled,
            None => return Err(ServiceError::ClientNotFound),
        }
        self.store.set_interface(iface.clone());
        self.store.save().await?;

        if server.enabled {
            self.wg.sync_to_conf_and_interface(&iface).await?;
        }
        Ok(())
    }

    pub async fn delete(
        &self,
        iface_id: &str,
        server_id: &str,
        client_id: &str,
    ) -> Result<(), ServiceError> {
        let client = self.store.get_client(iface_id, server_id, client_id)?;
        if client.enabled {
            self.set_enabled(iface_id, server_id, client_id, false)
                .await?;
        }

        let mut iface = self
            .store
            .get_interface(iface_id)
            .ok_or(ServiceError::InterfaceNotFound)?;
        match iface.server_mut(server_id) {
            Some(server) => server.clients.retain(|c| c.id != client_id),
            None => return Err(ServiceError::ServerNotFound),
        }
        self.store.set_interface(iface);
        self.store.save().await
    }

    /// Live peer state for one client; absent peers and stats failures
    /// yield the empty state.
    pub async fn client_state(
        &self,
        iface_id: &str,
        server_id: &str,
        client_id: &str,
    ) -> Result<PeerState, ServiceError> {
        let iface = self
            .store
            .get_interface(iface_id)
            .ok_or(ServiceError::InterfaceNotFound)?;
        let client = self.store.get_client(iface_id, server_id, client_id)?;

        let stats = match self.wg.peer_stats(&iface.ifname).await {
            Ok(stats) => stats,
            Err(_) => HashMap::new(),
        };
        Ok(stats.get(&client.public_key).cloned().unwrap_or_default())
    }

    /// Every client of a server paired with its live peer state.
    pub async fn clients_with_state(
        &self,
        iface_id: &str,
        server_id: &str,
    ) -> Result<Vec<(Client, PeerState)>, ServiceError> {
        let iface = self
            .store
            .get_interface(iface_id)
            .ok_or(ServiceError::InterfaceNotFound)?;
        let server = self.store.get_server(iface_id, server_id)?;

        let stats = match self.wg.peer_stats(&iface.ifname).await {
            Ok(stats) => stats,
            Err(_) => HashMap::new(),
        };
        Ok(server
            .clients
            .into_iter()
            .map(|client| {
                let state = stats.get(&client.public_key).cloned().unwrap_or_default();
                (client, state)
            })
            .collect())
    }
}

fn prefixed(err: ServiceError, context: &str) -> ServiceError {
    ServiceError::validation(format!("{context}: {err}"))
}

fn allocate_v4(client: &mut Client, server: &Server, request: &str) -> Result<(), ServiceError> {
    let config = server
        .ipv4
        .as_ref()
        .filter(|c| c.enabled)
        .ok_or_else(|| ServiceError::validation("server does not have IPv4 enabled"))?;
    let network = config
        .network
        .ok_or_else(|| ServiceError::validation("server does not have an IPv4 network"))?;

    if request == "auto" {
        return auto_allocate_v4(client, server, &network);
    }
    let addr: Ipv4Addr = request
        .parse()
        .map_err(|_| ServiceError::validation(format!("{request:?} is not a valid IPv4 address")))?;
    set_client_addr_v4(client, &server.clients, &network, addr)
}

fn allocate_v6(client: &mut Client, server: &Server, request: &str) -> Result<(), ServiceError> {
    let config = server
        .ipv6
        .as_ref()
        .filter(|c| c.enabled)
        .ok_or_else(|| ServiceError::validation("server does not have IPv6 enabled"))?;
    let network = config
        .network
        .ok_or_else(|| ServiceError::validation("server does not have an IPv6 network"))?;

    if request == "auto" {
        return auto_allocate_v6(client, server, &network);
    }
    let addr: Ipv6Addr = request
        .parse()
        .map_err(|_| ServiceError::validation(format!("{request:?} is not a valid IPv6 address")))?;
    set_client_addr_v6(client, &server.clients, &network, addr)
}

/// Lowest free host index, skipping the network address, the broadcast
/// address and the server's own host.
fn auto_allocate_v4(
    client: &mut Client,
    server: &Server,
    network: &HostNet,
) -> Result<(), ServiceError> {
    let host_bits = 32 - u32::from(network.prefix());
    if host_bits <= 2 {
        return Err(ServiceError::validation(
            "network too small for client allocation",
        ));
    }

    let mut used: HashSet<u64> = server
        .clients
        .iter()
        .filter(|other| other.id != client.id)
        .filter_map(|other| other.ipv4_offset)
        .map(|offset| u64::from(u32::from(offset)))
        .collect();
    let total = 1u64 << host_bits;
    used.insert(0);
    used.insert(total - 1);
    if let IpAddr::V4(server_offset) = network.offset() {
        used.insert(u64::from(u32::from(server_offset)));
    }

    for index in 1..total - 1 {
        if !used.contains(&index) {
            client.ipv4_offset = Some(Ipv4Addr::from(index as u32));
            return Ok(());
        }
    }
    Err(ServiceError::NetworkFull)
}

fn auto_allocate_v6(
    client: &mut Client,
    server: &Server,
    network: &HostNet,
) -> Result<(), ServiceError> {
    let host_bits = 128 - u32::from(network.prefix());
    if host_bits <= 1 {
        return Err(ServiceError::validation(
            "network too small for client allocation",
        ));
    }

    let mut used: HashSet<u128> = server
        .clients
        .iter()
        .filter(|other| other.id != client.id)
        .filter_map(|other| other.ipv6_offset)
        .map(u128::from)
        .collect();
    used.insert(0);
    if let IpAddr::V6(server_offset) = network.offset() {
        used.insert(u128::from(server_offset));
    }

    // Sequential scan over the low host indices; plenty for any practical
    // allocation before operators switch to manual addressing.
    let limit = if host_bits >= 16 {
        1u128 << 16
    } else {
        1u128 << host_bits
    };
    for index in 1..limit {
        if !used.contains(&index) {
            client.ipv6_offset = Some(Ipv6Addr::from(index));
            return Ok(());
        }
    }
    Err(ServiceError::NetworkFull)
}

/// Manual assignment: the address must sit inside the server network, must
/// not be the network address, the server's own address, or any other
/// client's address.
fn set_client_addr_v4(
    client: &mut Client,
    clients: &[Client],
    network: &HostNet,
    addr: Ipv4Addr,
) -> Result<(), ServiceError> {
    if !network.contains(IpAddr::V4(addr)) {
        return Err(ServiceError::validation(format!(
            "address {addr} is outside the server network {}",
            network.network_str()
        )));
    }
    if IpAddr::V4(addr) == network.addr() {
        return Err(ServiceError::AddressConflict(format!(
            "address {addr} is the server's own address"
        )));
    }
    let offset = match HostNet::new(IpAddr::V4(addr), network.prefix())?.offset() {
        IpAddr::V4(offset) => offset,
        IpAddr::V6(_) => unreachable!("v4 address yields a v4 offset"),
    };
    if u32::from(offset) == 0 {
        return Err(ServiceError::validation(format!(
            "address {addr} is the network address"
        )));
    }
    for other in clients.iter().filter(|other| other.id != client.id) {
        if other.ipv4_offset == Some(offset) {
            return Err(ServiceError::AddressConflict(format!(
                "address {addr} conflicts with client {:?}",
                other.name
            )));
        }
    }
    client.ipv4_offset = Some(offset);
    Ok(())
}

fn set_client_addr_v6(
    client: &mut Client,
    clients: &[Client],
    network: &HostNet,
    addr: Ipv6Addr,
) -> Result<(), ServiceError> {
    if !network.contains(IpAddr::V6(addr)) {
        return Err(ServiceError::validation(format!(
            "address {addr} is outside the server network {}",
            network.network_str()
        )));
    }
    if IpAddr::V6(addr) == network.addr() {
        return Err(ServiceError::AddressConflict(format!(
            "address {addr} is the server's own address"
        )));
    }
    let offset = match HostNet::new(IpAddr::V6(addr), network.prefix())?.offset() {
        IpAddr::V6(offset) => offset,
        IpAddr::V4(_) => unreachable!("v6 address yields a v6 offset"),
    };
    if u128::from(offset) == 0 {
        return Err(ServiceError::validation(format!(
            "address {addr} is the network address"
        )));
    }
    for other in clients.iter().filter(|other| other.id != client.id) {
        if other.ipv6_offset == Some(offset) {
            return Err(ServiceError::AddressConflict(format!(
                "address {addr} conflicts with client {:?}",
                other.name
            )));
        }
    }
    client.ipv6_offset = Some(offset);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wgpanel_types::ServerNetworkConfig;

    fn test_server(network: &str) -> Server {
        Server {
            id: "s0".into(),
            name: "office".into(),
            enabled: true,
            dns: vec![],
            ipv4: Some(ServerNetworkConfig {
                enabled: true,
                network: Some(network.parse().unwrap()),
                pseudo_bridge_master_interface: None,
                snat: None,
                routed_networks: vec![],
                routed_networks_firewall: false,
                comment_string: "c".into(),
            }),
            ipv6: None,
            keepalive: None,
            clients: vec![],
        }
    }

    fn blank_client(id: &str) -> Client {
        Client {
            id: id.into(),
            name: format!("client-{id}"),
            enabled: false,
            ipv4_offset: None,
            ipv6_offset: None,
            dns: vec![],
            private_key: None,
            public_key: "pk".into(),
            preshared_key: None,
            keepalive: None,
        }
    }

    #[test]
    fn auto_allocation_skips_reserved_hosts() {
        // Server at 10.8.0.1/24: auto clients land on .2, .3, .4 — the
        // network address, the broadcast and the server host are reserved.
        let mut server = test_server("10.8.0.1/24");
        let network: HostNet = "10.8.0.1/24".parse().unwrap();

        for (id, expected) in [("c0", 2u32), ("c1", 3), ("c2", 4)] {
            let mut client = blank_client(id);
            auto_allocate_v4(&mut client, &server, &network).unwrap();
            assert_eq!(client.ipv4_offset, Some(Ipv4Addr::from(expected)));
            assert_eq!(
                client.addr_v4(Some(&network)).unwrap().addr().to_string(),
                format!("10.8.0.{expected}")
            );
            server.clients.push(client);
        }
    }

    #[test]
    fn auto_allocation_fills_gaps_first() {
        let mut server = test_server("10.8.0.1/24");
        let mut a = blank_client("c0");
        a.ipv4_offset = Some(Ipv4Addr::from(2u32));
        let mut b = blank_client("c1");
        b.ipv4_offset = Some(Ipv4Addr::from(4u32));
        server.clients = vec![a, b];

        let network: HostNet = "10.8.0.1/24".parse().unwrap();
        let mut c = blank_client("c2");
        auto_allocate_v4(&mut c, &server, &network).unwrap();
        assert_eq!(c.ipv4_offset, Some(Ipv4Addr::from(3u32)));
    }

    #[test]
    fn auto_allocation_exhaustion() {
        // /30 has 2 host bits; rejected outright.
        let server = test_server("10.8.0.1/30");
        let network: HostNet = "10.8.0.1/30".parse().unwrap();
        let mut client = blank_client("c0");
        assert!(auto_allocate_v4(&mut client, &server, &network).is_err());

        // /29: hosts .1(server) .2...6; fill all five assignable, next fails.
        let mut server = test_server("10.8.0.1/29");
        let network: HostNet = "10.8.0.1/29".parse().unwrap();
        for id in 0..5 {
            let mut client = blank_client(&format!("c{id}"));
            auto_allocate_v4(&mut client, &server, &network).unwrap();
            server.clients.push(client);
        }
        let mut overflow = blank_client("c9");
        assert!(matches!(
            auto_allocate_v4(&mut overflow, &server, &network),
            Err(ServiceError::NetworkFull)
        ));
    }

    #[test]
    fn auto_allocation_v6_starts_at_one_skipping_server() {
        let mut server = test_server("10.8.0.1/24");
        server.ipv6 = Some(ServerNetworkConfig {
            enabled: true,
            network: Some("2001:db8::1/64".parse().unwrap()),
            pseudo_bridge_master_interface: None,
            snat: None,
            routed_networks: vec![],
            routed_networks_firewall: false,
            comment_string: "c6".into(),
        });
        let network: HostNet = "2001:db8::1/64".parse().unwrap();

        let mut client = blank_client("c0");
        auto_allocate_v6(&mut client, &server, &network).unwrap();
        // ::1 is the server; the first client gets ::2.
        assert_eq!(client.ipv6_offset, Some(Ipv6Addr::from(2u128)));
    }

    #[test]
    fn manual_assignment_validation() {
        let mut server = test_server("10.8.0.1/24");
        let network: HostNet = "10.8.0.1/24".parse().unwrap();
        let mut taken = blank_client("c0");
        set_client_addr_v4(&mut taken, &server.clients.clone(), &network, "10.8.0.2".parse().unwrap())
            .unwrap();
        server.clients.push(taken);

        let mut client = blank_client("c1");
        // Outside the network.
        assert!(set_client_addr_v4(
            &mut client,
            &server.clients,
            &network,
            "10.9.0.2".parse().unwrap()
        )
        .is_err());
        // The server's own address.
        assert!(matches!(
            set_client_addr_v4(&mut client, &server.clients, &network, "10.8.0.1".parse().unwrap()),
            Err(ServiceError::AddressConflict(_))
        ));
        // The network address.
        assert!(set_client_addr_v4(
            &mut client,
            &server.clients,
            &network,
            "10.8.0.0".parse().unwrap()
        )
        .is_err());
        // A taken address.
        assert!(matches!(
            set_client_addr_v4(&mut client, &server.clients, &network, "10.8.0.2".parse().unwrap()),
            Err(ServiceError::AddressConflict(_))
        ));
        // A free one works and stores the offset.
        set_client_addr_v4(&mut client, &server.clients, &network, "10.8.0.7".parse().unwrap())
            .unwrap();
        assert_eq!(client.ipv4_offset, Some(Ipv4Addr::from(7u32)));
    }

    #[test]
    fn allocation_requires_enabled_family() {
        let mut server = test_server("10.8.0.1/24");
        server.ipv4.as_mut().unwrap().enabled = false;
        let mut client = blank_client("c0");
        assert!(allocate_v4(&mut client, &server, "auto").is_err());
        assert!(allocate_v6(&mut client, &server, "auto").is_err());
    }
}
