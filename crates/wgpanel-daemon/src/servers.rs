//! Server write path: carving subnets out of an interface, with the full
//! validation set (family presence, VRF-scoped overlap, routed-network
//! partitioning, SNAT mode consistency, pseudo-bridge master checks) and
//! the enable/disable flow that drives firewall and WireGuard state.

use std::sync::Arc;

use tracing::{info, warn};
use wgpanel_types::{
    HostNet, Interface, IpFamily, Server, ServerNetworkConfig, SnatConfig,
};

use crate::error::ServiceError;
use crate::firewall::{self, RuleFamily};
use crate::fsutil::random_string;
use crate::netinfo;
use crate::sanitize;
use crate::store::Store;
use crate::wg::WgService;

#[derive(Debug, Clone, Default)]
pub struct ServerCreateRequest {
    pub name: String,
    pub dns: Vec<String>,
    pub ipv4: Option<ServerNetworkConfigRequest>,
    pub ipv6: Option<ServerNetworkConfigRequest>,
    pub keepalive: Option<u16>,
}

#[derive(Debug, Clone, Default)]
pub struct ServerNetworkConfigRequest {
    pub enabled: bool,
    pub network: String,
    pub pseudo_bridge_master_interface: Option<String>,
    pub snat: Option<SnatConfigRequest>,
    pub routed_networks: Vec<String>,
    pub routed_networks_firewall: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SnatConfigRequest {
    pub enabled: bool,
    pub snat_ip_net: String,
    pub snat_excluded_network: String,
    pub roaming_master_interface: Option<String>,
    pub roaming_pseudo_bridge: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SnatMode {
    Masquerade,
    Snat,
    Netmap,
}

pub struct ServerService {
    store: Arc<Store>,
    wg: Arc<WgService>,
}

impl ServerService {
    pub fn new(store: Arc<Store>, wg: Arc<WgService>) -> Self {
        ServerService { store, wg }
    }

    pub async fn create(
        &self,
        iface_id: &str,
        req: ServerCreateRequest,
    ) -> Result<Server, ServiceError> {
        let mut iface = self
            .store
            .get_interface(iface_id)
            .ok_or(ServiceError::InterfaceNotFound)?;
        info!(iface_id, name = %req.name, "creating server");

        let mut server = self.validate_and_build(&iface, &req, None).await?;
        server.id = self.store.next_server_id(&iface);

        iface.servers.push(server.clone());
        self.store.set_interface(iface);
        self.store.save().await?;

        info!(iface_id, server_id = %server.id, name = %server.name, "created server");
        Ok(server)
    }

    pub fn get(&self, iface_id: &str, server_id: &str) -> Result<Server, ServiceError> {
        self.store.get_server(iface_id, server_id)
    }

    pub fn get_all(&self, iface_id: &str) -> Result<Vec<Server>, ServiceError> {
        self.store
            .get_interface(iface_id)
            .map(|i| i.servers)
            .ok_or(ServiceError::InterfaceNotFound)
    }

    pub async fn update(
        &self,
        iface_id: &str,
        server_id: &str,
        req: ServerCreateRequest,
    ) -> Result<Server, ServiceError> {
        let iface = self
            .store
            .get_interface(iface_id)
            .ok_or(ServiceError::InterfaceNotFound)?;
        let old = self.store.get_server(iface_id, server_id)?;
        let was_enabled = old.enabled;

        let mut new_server = self.validate_and_build(&iface, &req, Some(&old)).await?;
        new_server.id = old.id.clone();
        new_server.enabled = false;

        // The rule shape may change even when the comments stay; clear both
        // families before rebuilding.
        for config in [new_server.ipv4.as_ref(), new_server.ipv6.as_ref()]
            .into_iter()
            .flatten()
        {
            if let Some(family) = config.family() {
                if let Err(e) = firewall::cleanup_rules(
                    &config.comment_string,
                    RuleFamily::from(family),
                    None,
                    false,
                )
                .await
                {
                    warn!(error = %e, "stale rule cleanup failed");
                }
            }
        }

        if was_enabled {
            self.set_enabled(iface_id, server_id, false, false).await?;
        }

        let mut iface = self
            .store
            .get_interface(iface_id)
            .ok_or(ServiceError::InterfaceNotFound)?;
        match iface.server_mut(server_id) {
            Some(slot) => *slot = new_server,
            None => return Err(ServiceError::ServerNotFound),
        }
        self.store.set_interface(iface);
        self.store.save().await?;

        if was_enabled {
            self.set_enabled(iface_id, server_id, true, true).await?;
        } else {
            self.store.sync_to_internal_service().await;
        }
        self.store.get_server(iface_id, server_id)
    }

    /// Flip a server's enabled state. Firewall rules are applied or removed
    /// when the owning interface is live; `sync_service_and_config` gates
    /// the WireGuard resync and the internal-service publication (the
    /// update flow batches those at the end).
    pub async fn set_enabled(
        &self,
        iface_id: &str,
        server_id: &str,
        enabled: bool,
        sync_service_and_config: bool,
    ) -> Result<(), ServiceError> {
        let mut iface = self
            .store
            .get_interface(iface_id)
            .ok_or(ServiceError::InterfaceNotFound)?;
        let server = iface
            .server(server_id)
            .cloned()
            .ok_or(ServiceError::ServerNotFound)?;

        if server.enabled == enabled {
            return Ok(());
        }
        info!(iface_id, server_id, enabled, "setting server enabled state");

        match iface.server_mut(server_id) {
            Some(slot) => slot.enabled = enabled,
            None => return Err(ServiceError::ServerNotFound),
        }
        self.store.set_interface(iface.clone());
        if sync_service_and_config {
            self.store.save().await?;
            self.wg.sync_to_conf_and_interface(&iface).await?;
        }

        if iface.enabled {
            for config in [server.ipv4.as_ref(), server.ipv6.as_ref()]
                .into_iter()
                .flatten()
                .filter(|c| c.enabled)
            {
                if enabled {
                    firewall::apply_server_config(&iface.ifname, config).await?;
                } else {
                    firewall::remove_server_config(&iface.ifname, config).await;
                }
            }
        }

        if sync_service_and_config {
            self.store.sync_to_internal_service().await;
        }
        Ok(())
    }

    pub async fn delete(&self, iface_id: &str, server_id: &str) -> Result<(), ServiceError> {
        let server = self.store.get_server(iface_id, server_id)?;
        info!(iface_id, server_id, name = %server.name, "deleting server");

        if server.enabled {
            self.set_enabled(iface_id, server_id, false, true).await?;
        }

        let mut iface = self
            .store
            .get_interface(iface_id)
            .ok_or(ServiceError::InterfaceNotFound)?;
        iface.servers.retain(|s| s.id != server_id);
        self.store.set_interface(iface);
        self.store.save().await
    }

    /// Move a server to another interface: disable, detach, attach,
    /// re-enable, resync both devices.
    pub async fn move_server(
        &self,
        iface_id: &str,
        server_id: &str,
        new_iface_id: &str,
    ) -> Result<(), ServiceError> {
        let server = self.store.get_server(iface_id, server_id)?;
        let dest = self
            .store
            .get_interface(new_iface_id)
            .ok_or(ServiceError::InterfaceNotFound)?;

        // The server's networks must be admissible in the destination VRF.
        for family in [IpFamily::V4, IpFamily::V6] {
            if let Some(network) = server.network(family) {
                self.store.check_network_overlaps_in_vrf(
                    dest.vrf_name.as_deref(),
                    None,
                    Some(server_id),
                    network,
                )?;
            }
        }

        let was_enabled = server.enabled;
        if was_enabled {
            self.set_enabled(iface_id, server_id, false, true).await?;
        }

        let mut src = self
            .store
            .get_interface(iface_id)
            .ok_or(ServiceError::InterfaceNotFound)?;
        let position = src
            .servers
            .iter()
            .position(|s| s.id == server_id)
            .ok_or(ServiceError::ServerNotFound)?;
        let server = src.servers.remove(position);

        let mut dest = self
            .store
            .get_interface(new_iface_id)
            .ok_or(ServiceError::InterfaceNotFound)?;
        dest.servers.push(server);

        self.store.set_interface(src.clone());
        self.store.set_interface(dest.clone());
        self.store.save().await?;

        if was_enabled {
            self.set_enabled(new_iface_id, server_id, true, true).await?;
        }

        let src = self
            .store
            .get_interface(iface_id)
            .ok_or(ServiceError::InterfaceNotFound)?;
        let dest = self
            .store
            .get_interface(new_iface_id)
            .ok_or(ServiceError::InterfaceNotFound)?;
        self.wg.sync_to_conf_and_interface(&src).await?;
        self.wg.sync_to_conf_and_interface(&dest).await?;
        self.store.sync_to_internal_service().await;
        info!(server_id, from = iface_id, to = new_iface_id, "moved server");
        Ok(())
    }

    async fn validate_and_build(
        &self,
        iface: &Interface,
        req: &ServerCreateRequest,
        old: Option<&Server>,
    ) -> Result<Server, ServiceError> {
        sanitize::is_safe_name(&req.name)?;
        for dns in &req.dns {
            sanitize::validate_ip_or_domain(dns)?;
        }

        let mut req = req.clone();
        let v4_enabled = req.ipv4.as_ref().is_some_and(|c| c.enabled);
        let v6_enabled = req.ipv6.as_ref().is_some_and(|c| c.enabled);
        if !v4_enabled && !v6_enabled {
            return Err(ServiceError::validation(
                "at least one of IPv4 or IPv6 must be enabled",
            ));
        }

        partition_routed_networks(&mut req)?;

        let exclude = old.map(|s| s.id.as_str());
        if let Some(cfg) = &req.ipv4 {
            if !cfg.network.is_empty() {
                self.validate_network_config(IpFamily::V4, iface, cfg, exclude)
                    .await?;
            } else if cfg.enabled {
                return Err(ServiceError::validation("IPv4 enabled but network missing"));
            }
        }
        if let Some(cfg) = &req.ipv6 {
            if !cfg.network.is_empty() {
                self.validate_network_config(IpFamily::V6, iface, cfg, exclude)
                    .await?;
            } else if cfg.enabled {
                return Err(ServiceError::validation("IPv6 enabled but network missing"));
            }
        }

        // One random token per server, per-family comment strings.
        let panel_id = self.store.panel_id();
        let token = random_string("", 12);
        let v4_comment = format!("{panel_id}--v4-{token}");
        let v6_comment = format!("{panel_id}--v6-{token}");

        match old {
            None => Ok(Server {
                id: String::new(),
                name: req.name.clone(),
                enabled: false,
                dns: req.dns.clone(),
                ipv4: prepare_network_config(IpFamily::V4, req.ipv4.as_ref(), v4_comment)?,
                ipv6: prepare_network_config(IpFamily::V6, req.ipv6.as_ref(), v6_comment)?,
                keepalive: req.keepalive,
                clients: Vec::new(),
            }),
            Some(old) => {
                // Renumbering must keep every existing client address
                // inside the new networks.
                if let Some(cfg) = &req.ipv4 {
                    if !cfg.network.is_empty() {
                        let network = HostNet::parse_addr_or_net_family(IpFamily::V4, &cfg.network)?;
                        validate_clients_in_network(IpFamily::V4, &old.clients, &network)?;
                    }
                }
                if let Some(cfg) = &req.ipv6 {
                    if !cfg.network.is_empty() {
                        let network = HostNet::parse_addr_or_net_family(IpFamily::V6, &cfg.network)?;
                        validate_clients_in_network(IpFamily::V6, &old.clients, &network)?;
                    }
                }

                let mut server = old.clone();
                server.name = req.name.clone();
                server.dns = req.dns.clone();
                server.keepalive = req.keepalive;

                let v4_comment = old
                    .ipv4
                    .as_ref()
                    .map(|c| c.comment_string.clone())
                    .unwrap_or(v4_comment);
                let v6_comment = old
                    .ipv6
                    .as_ref()
                    .map(|c| c.comment_string.clone())
                    .unwrap_or(v6_comment);

                let new_v4 = prepare_network_config(IpFamily::V4, req.ipv4.as_ref(), v4_comment)?;
                let new_v6 = prepare_network_config(IpFamily::V6, req.ipv6.as_ref(), v6_comment)?;
                server.ipv4 = rewrite_for_renumber(old.ipv4.as_ref(), new_v4);
                server.ipv6 = rewrite_for_renumber(old.ipv6.as_ref(), new_v6);
                Ok(server)
            }
        }
    }

    async fn validate_network_config(
        &self,
        family: IpFamily,
        iface: &Interface,
        cfg: &ServerNetworkConfigRequest,
        exclude_server: Option<&str>,
    ) -> Result<(), ServiceError> {
        let network = HostNet::parse_addr_or_net_family(family, &cfg.network)?;

        self.store.check_network_overlaps_in_vrf(
            iface.vrf_name.as_deref(),
            None,
            exclude_server,
            &network,
        )?;

        validate_routed_networks_overlap(family, &cfg.routed_networks)?;

        if let Some(master) = cfg
            .pseudo_bridge_master_interface
            .as_deref()
            .filter(|m| !m.is_empty())
        {
            sanitize::validate_phys_ifname(master)?;
            netinfo::ensure_layer2(master)?;
        }

        if let Some(snat) = &cfg.snat {
            if snat.enabled {
                validate_snat_config(family, &network, snat)?;
            }
        }
        Ok(())
    }
}

/// Routed networks may arrive mixed across both family sections; sort each
/// entry into the section of its own family.
fn partition_routed_networks(req: &mut ServerCreateRequest) -> Result<(), ServiceError> {
    let mut pool = Vec::new();
    if let Some(cfg) = &mut req.ipv4 {
        pool.append(&mut cfg.routed_networks);
    }
    if let Some(cfg) = &mut req.ipv6 {
        pool.append(&mut cfg.routed_networks);
    }
    for entry in pool {
        let network = HostNet::parse_addr_or_net(&entry)?;
        match (network.family(), &mut req.ipv4, &mut req.ipv6) {
            (IpFamily::V4, Some(cfg), _) => cfg.routed_networks.push(entry),
            (IpFamily::V6, _, Some(cfg)) => cfg.routed_networks.push(entry),
            _ => {
                return Err(ServiceError::validation(format!(
                    "routed network {entry} has no matching address family section"
                )))
            }
        }
    }
    Ok(())
}

fn validate_routed_networks_overlap(
    family: IpFamily,
    routed_networks: &[String],
) -> Result<(), ServiceError> {
    if routed_networks.len() <= 1 {
        return Ok(());
    }
    let mut networks = Vec::with_capacity(routed_networks.len());
    for entry in routed_networks {
        let network = HostNet::parse_addr_or_net_family(family, entry)?;
        networks.push(network.network());
    }
    for i in 0..networks.len() {
        for j in i + 1..networks.len() {
            if networks[i].overlaps(&networks[j]) {
                return Err(ServiceError::NetworkOverlap(format!(
                    "routed networks {} and {} overlap",
                    networks[i], networks[j]
                )));
            }
        }
    }
    Ok(())
}

/// SNAT mode consistency (per family):
/// - no target → MASQUERADE, roaming unsupported
/// - v4 target must be `/32`; `0.0.0.0/32` requires roaming
/// - v6 target is `/128` (SNAT; `::/128` requires roaming) or a block of
///   the server network's exact mask (NETMAP)
/// - RoamingPseudoBridge requires roaming and NETMAP
fn validate_snat_config(
    family: IpFamily,
    server_network: &HostNet,
    snat: &SnatConfigRequest,
) -> Result<(), ServiceError> {
    let roaming = snat
        .roaming_master_interface
        .as_deref()
        .is_some_and(|m| !m.is_empty());

    let mode = if snat.snat_ip_net.is_empty() {
        if roaming {
            return Err(ServiceError::validation(
                "MASQUERADE mode doesn't support roaming: set snatIpNet or unset the \
                 roaming master interface",
            ));
        }
        SnatMode::Masquerade
    } else {
        let snat_net = HostNet::parse_addr_or_net_family(family, &snat.snat_ip_net)?;
        let mode = match family {
            IpFamily::V4 => {
                if snat_net.prefix() != 32 {
                    return Err(ServiceError::validation(
                        "IPv4 SNAT doesn't support NETMAP mode; the target must be /32",
                    ));
                }
                if roaming && !snat_net.is_zero_host() {
                    return Err(ServiceError::validation(
                        "in roaming mode the SNAT target must be 0.0.0.0/32",
                    ));
                }
                SnatMode::Snat
            }
            IpFamily::V6 => {
                if snat_net.prefix() == 128 {
                    if roaming && !snat_net.is_zero_host() {
                        return Err(ServiceError::validation(
                            "in roaming mode the SNAT target must be ::/128",
                        ));
                    }
                    SnatMode::Snat
                } else {
                    if snat_net.prefix() != server_network.prefix() {
                        return Err(ServiceError::validation(format!(
                            "IPv6 SNAT target must be /128 (SNAT mode) or match the server \
                             network /{} (NETMAP mode)",
                            server_network.prefix()
                        )));
                    }
                    SnatMode::Netmap
                }
            }
        };
        if snat_net.is_zero_host() && !roaming {
            return Err(ServiceError::validation(
                "a zero SNAT target requires a roaming master interface",
            ));
        }
        mode
    };

    if roaming {
        let master = snat.roaming_master_interface.as_deref().unwrap_or_default();
        sanitize::validate_phys_ifname(master)?;
        netinfo::ensure_layer2(master)?;
    }
    if snat.roaming_pseudo_bridge && !roaming {
        return Err(ServiceError::validation(
            "roamingPseudoBridge requires a roaming master interface",
        ));
    }
    if snat.roaming_pseudo_bridge && mode != SnatMode::Netmap {
        return Err(ServiceError::validation(
            "roamingPseudoBridge only works in NETMAP mode",
        ));
    }
    Ok(())
}

fn validate_clients_in_network(
    family: IpFamily,
    clients: &[wgpanel_types::Client],
    network: &HostNet,
) -> Result<(), ServiceError> {
    for client in clients {
        if let Some(offset) = client.offset(family) {
            if network.by_offset(offset).is_err() {
                return Err(ServiceError::validation(format!(
                    "client {:?} would fall outside the new network {network}",
                    client.name
                )));
            }
        }
    }
    Ok(())
}

/// Build the stored network config from a request: parse the network,
/// normalize routed networks (defaulting to the server's own base net) and
/// the SNAT exclusion (same default).
fn prepare_network_config(
    family: IpFamily,
    req: Option<&ServerNetworkConfigRequest>,
    comment_string: String,
) -> Result<Option<ServerNetworkConfig>, ServiceError> {
    let Some(req) = req else {
        return Ok(None);
    };

    let mut config = ServerNetworkConfig {
        enabled: req.enabled,
        network: None,
        pseudo_bridge_master_interface: req.pseudo_bridge_master_interface.clone(),
        snat: None,
        routed_networks: Vec::new(),
        routed_networks_firewall: req.routed_networks_firewall,
        comment_string,
    };

    if !req.network.is_empty() {
        config.network = Some(HostNet::parse_addr_or_net_family(family, &req.network)?);
    }

    if !req.routed_networks.is_empty() {
        for entry in &req.routed_networks {
            let network = HostNet::parse_addr_or_net_family(family, entry)?;
            config.routed_networks.push(network.network());
        }
    } else if let Some(network) = &config.network {
        config.routed_networks = vec![network.network()];
    }

    if let Some(snat_req) = &req.snat {
        let mut snat = SnatConfig {
            enabled: snat_req.enabled,
            snat_ip_net: None,
            snat_excluded_network: None,
            roaming_master_interface: snat_req.roaming_master_interface.clone(),
            roaming_pseudo_bridge: snat_req.roaming_pseudo_bridge,
        };
        if !snat_req.snat_ip_net.is_empty() {
            snat.snat_ip_net = Some(HostNet::parse_addr_or_net_family(
                family,
                &snat_req.snat_ip_net,
            )?);
        }
        if !snat_req.snat_excluded_network.is_empty() {
            let excluded =
                HostNet::parse_addr_or_net_family(family, &snat_req.snat_excluded_network)?;
            snat.snat_excluded_network = Some(excluded.network());
        } else if let Some(network) = &config.network {
            snat.snat_excluded_network = Some(network.network());
        }
        config.snat = Some(snat);
    }

    Ok(Some(config))
}

/// When a server network is renumbered, rewrite list entries that pointed
/// at the old base network (routed networks and the SNAT exclusion) to the
/// new one, unless the routed list already covers the new base.
fn rewrite_for_renumber(
    old: Option<&ServerNetworkConfig>,
    new: Option<ServerNetworkConfig>,
) -> Option<ServerNetworkConfig> {
    let mut new = new?;
    let Some(old) = old else {
        return Some(new);
    };
    let (Some(old_net), Some(new_net)) = (&old.network, &new.network) else {
        return Some(new);
    };
    let old_base = old_net.network();
    let new_base = new_net.network();
    if old_base == new_base {
        return Some(new);
    }

    let covers_new_base = new
        .routed_networks
        .iter()
        .any(|routed| routed.overlaps(&new_base));
    if !covers_new_base {
        for routed in &mut new.routed_networks {
            if *routed == old_base {
                *routed = new_base;
            }
        }
    }
    if let Some(snat) = &mut new.snat {
        if snat.snat_excluded_network == Some(old_base) {
            snat.snat_excluded_network = Some(new_base);
        }
    }
    Some(new)
}
