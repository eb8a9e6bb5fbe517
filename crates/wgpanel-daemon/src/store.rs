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

//! Thread-safe document store.
//!
//! A single reader-writer lock guards the in-memory document; every read
//! hands out copies so callers never alias the guarded state. Writes are
//! persisted with an atomic rename. Publication to the pseudo-bridge and
//! roaming engines happens through [`Store::sync_to_internal_service`],
//! which builds both snapshots under the read lock, releases it, and only
//! then hands them over.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;
use wgpanel_types::{
    Client, Document, HostNet, Interface, IpFamily, LogLevel, ResponderNetworks, Server,
    ServerNetworkConfig, Session,
};

use crate::bridge::PseudoBridgeService;
use crate::error::ServiceError;
use crate::fsutil::write_file_atomic;
use crate::roaming::{RoamingConfigs, SnatRoamingService};

const ID_SCAN_LIMIT: u32 = 100_000;
const SESSION_LIFETIME_HOURS: i64 = 24;

pub struct Store {
    path: PathBuf,
    doc: RwLock<Document>,
    pbs: Arc<PseudoBridgeService>,
    srs: Arc<SnatRoamingService>,
}

impl Store {
    pub fn new(
        path: impl Into<PathBuf>,
        doc: Document,
        pbs: Arc<PseudoBridgeService>,
        srs: Arc<SnatRoamingService>,
    ) -> Arc<Store> {
        Arc::new(Store {
            path: path.into(),
            doc: RwLock::new(doc),
            pbs,
            srs,
        })
    }

    pub async fn load(path: &Path) -> Result<Document, ServiceError> {
        let data = tokio::fs::read(path).await?;
        let doc: Document = serde_json::from_slice(&data)?;
        info!(
            path = %path.display(),
            interfaces = doc.interfaces.len(),
            "loaded document"
        );
        Ok(doc)
    }

    fn read(&self) -> RwLockReadGuard<'_, Document> {
        self.doc.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Document> {
        self.doc.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serialize under the read lock, then write outside it with an atomic
    /// rename.
    pub async fn save(&self) -> Result<(), ServiceError> {
        let data = {
            let doc = self.read();
            serde_json::to_vec_pretty(&*doc)?
        };
        write_file_atomic(&self.path, &data, 0o600).await?;
        debug!(path = %self.path.display(), "persisted document");
        Ok(())
    }

    // -- Scalar accessors ----------------------------------------------------

    pub fn panel_id(&self) -> String {
        self.read().panel_id.clone()
    }

    pub fn wg_if_prefix(&self) -> String {
        self.read().wg_if_prefix.clone()
    }

    pub fn wireguard_config_path(&self) -> String {
        self.read().wireguard_config_path.clone()
    }

    pub fn log_level(&self) -> LogLevel {
        self.read().log_level
    }

    pub fn set_password_hash(&self, hash: String) {
        self.write().password = hash;
    }

    pub fn snapshot(&self) -> Document {
        self.read().clone()
    }

    // -- Interface / server / client reads (always copies) --------------------

    pub fn interfaces(&self) -> Vec<Interface> {
        self.read().interfaces.values().cloned().collect()
    }

    pub fn get_interface(&self, id: &str) -> Option<Interface> {
        self.read().interfaces.get(id).cloned()
    }

    pub fn set_interface(&self, iface: Interface) {
        self.write().interfaces.insert(iface.id.clone(), iface);
    }

    pub fn delete_interface(&self, id: &str) {
        self.write().interfaces.remove(id);
    }

    pub fn get_server(&self, iface_id: &str, server_id: &str) -> Result<Server, ServiceError> {
        let doc = self.read();
        let iface = doc
            .interfaces
            .get(iface_id)
            .ok_or(ServiceError::InterfaceNotFound)?;
        iface
            .server(server_id)
            .cloned()
            .ok_or(ServiceError::ServerNotFound)
    }

    pub fn get_client(
        &self,
        iface_id: &str,
        server_id: &str,
        client_id: &str,
    ) -> Result<Client, ServiceError> {
        let doc = self.read();
        let iface = doc
            .interfaces
            .get(iface_id)
            .ok_or(ServiceError::InterfaceNotFound)?;
        let server = iface.server(server_id).ok_or(ServiceError::ServerNotFound)?;
        server
            .client(client_id)
            .cloned()
            .ok_or(ServiceError::ClientNotFound)
    }

    // -- Sessions --------------------------------------------------------------

    pub fn add_session(&self, token: String, session: Session) {
        self.write().sessions.insert(token, session);
    }

    pub fn get_session(&self, token: &str) -> Option<Session> {
        self.read().sessions.get(token).cloned()
    }

    pub fn delete_session(&self, token: &str) {
        self.write().sessions.remove(token);
    }

    /// Drop sessions idle for more than 24 hours.
    pub fn clean_expired_sessions(&self) {
        let cutoff = Utc::now() - Duration::hours(SESSION_LIFETIME_HOURS);
        let mut doc = self.write();
        let before = doc.sessions.len();
        doc.sessions.retain(|_, session| session.last_seen > cutoff);
        let removed = before - doc.sessions.len();
        if removed > 0 {
            info!(removed, "expired sessions removed");
        }
    }

    // -- Identifier allocation ---------------------------------------------------

    pub fn next_interface_id(&self) -> String {
        let doc = self.read();
        let taken: HashSet<&str> = doc.interfaces.keys().map(String::as_str).collect();
        lowest_free_id('i', &taken)
    }

    pub fn next_server_id(&self, iface: &Interface) -> String {
        let taken: HashSet<&str> = iface.servers.iter().map(|s| s.id.as_str()).collect();
        lowest_free_id('s', &taken)
    }

    pub fn next_client_id(&self, server: &Server) -> String {
        let taken: HashSet<&str> = server.clients.iter().map(|c| c.id.as_str()).collect();
        lowest_free_id('c', &taken)
    }

    // -- Validation helpers -------------------------------------------------------

    /// Reject `network` when it overlaps any other server network of the
    /// same family inside the target VRF. `skip_server` lets updates
    /// compare against everything but themselves.
    pub fn check_network_overlaps_in_vrf(
        &self,
        vrf_name: Option<&str>,
        skip_iface: Option<&str>,
        skip_server: Option<&str>,
        network: &HostNet,
    ) -> Result<(), ServiceError> {
        let doc = self.read();
        for iface in doc.interfaces.values() {
            if iface.vrf_name.as_deref() != vrf_name {
                continue;
            }
            if skip_iface.is_some_and(|id| id == iface.id) {
                continue;
            }
            for server in &iface.servers {
                if skip_server.is_some_and(|id| id == server.id) {
                    continue;
                }
                if let Some(existing) = server.network(network.family()) {
                    if existing.overlaps(network) {
                        return Err(ServiceError::NetworkOverlap(format!(
                            "network {network} overlaps {existing} at server {} in interface {}",
                            server.name, iface.ifname
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    // -- Publication to the live engines ----------------------------------------

    /// Build the responder and roaming snapshots under the read lock, drop
    /// it, then publish. This is the only coupling between the document and
    /// the event loops.
    pub async fn sync_to_internal_service(&self) {
        let (pbs_config, srs_config) = {
            let doc = self.read();
            build_internal_config(&doc)
        };
        debug!(
            responders = pbs_config.len(),
            roaming = srs_config.len(),
            "publishing internal service configuration"
        );
        self.pbs.update_configuration(pbs_config);
        self.srs.update_configuration(srs_config).await;
    }
}

fn lowest_free_id(prefix: char, taken: &HashSet<&str>) -> String {
    for n in 0..ID_SCAN_LIMIT {
        let id = format!("{prefix}{n}");
        if !taken.contains(id.as_str()) {
            return id;
        }
    }
    // Exhausted the numeric space; fall back to a UUID.
    Uuid::new_v4().to_string()
}

fn add_roaming(srs_config: &mut RoamingConfigs, ifname: &str, config: &ServerNetworkConfig) {
    if config.comment_string.is_empty() {
        warn!("roaming config with empty comment string ignored");
        return;
    }
    let entry = srs_config.entry(ifname.to_owned()).or_insert(None);
    entry
        .get_or_insert_with(HashMap::new)
        .insert(config.comment_string.clone(), config.clone());
}

/// Walk enabled interfaces and servers and derive the two per-upstream
/// maps: responder networks (with the server's own address in the skip
/// set) and roaming SNAT configs keyed by comment string. An upstream seen
/// only for pseudo-bridging gets an explicit `None` roaming entry so its
/// listener keeps feeding bind info without owning rules; a roaming entry
/// for the same upstream always wins.
fn build_internal_config(doc: &Document) -> (HashMap<String, ResponderNetworks>, RoamingConfigs) {
    let mut pbs_config: HashMap<String, ResponderNetworks> = HashMap::new();
    let mut srs_config: RoamingConfigs = HashMap::new();

    for iface in doc.interfaces.values() {
        if !iface.enabled {
            continue;
        }
        for server in iface.servers.iter().filter(|s| s.enabled) {
            for family in [IpFamily::V4, IpFamily::V6] {
                let Some(config) = server.network_config(family) else {
                    continue;
                };
                if !config.enabled {
                    continue;
                }

                if let (Some(network), true) = (&config.network, config.has_pseudo_bridge()) {
                    let master = config
                        .pseudo_bridge_master_interface
                        .clone()
                        .unwrap_or_default();
                    let nets = pbs_config.entry(master.clone()).or_default();
                    match family {
                        IpFamily::V4 => {
                            nets.v4_networks.push(network.network());
                            if let std::net::IpAddr::V4(addr) = network.addr() {
                                nets.v4_skipped.push(addr);
                            }
                        }
                        IpFamily::V6 => {
                            nets.v6_networks.push(network.network());
                            if let std::net::IpAddr::V6(addr) = network.addr() {
                                nets.v6_skipped.push(addr);
                            }
                        }
                    }
                    srs_config.entry(master).or_insert(None);
                }

                let Some(snat) = config.snat.as_ref() else {
                    continue;
                };
                if !snat.enabled || !snat.is_roaming() {
                    continue;
                }
                let master = snat.roaming_master_interface.clone().unwrap_or_default();
                let Some(snat_ip) = snat.snat_ip_net.as_ref() else {
                    warn!(
                        server = %server.name,
                        "roaming SNAT without a target network ignored"
                    );
                    continue;
                };

                match family {
                    IpFamily::V4 => {
                        if snat_ip.is_zero_host() {
                            add_roaming(&mut srs_config, &master, config);
                        } else {
                            warn!(
                                server = %server.name,
                                target = %snat_ip,
                                "IPv4 roaming requires 0.0.0.0/32, config ignored"
                            );
                        }
                    }
                    IpFamily::V6 => {
                        if snat_ip.is_zero_host() {
                            add_roaming(&mut srs_config, &master, config);
                        } else if config.network.map(|n| n.prefix()) == Some(snat_ip.prefix()) {
                            // NETMAP roaming; optionally proxied on the master.
                            add_roaming(&mut srs_config, &master, config);
                            if snat.roaming_pseudo_bridge {
                                pbs_config
                                    .entry(master.clone())
                                    .or_default()
                                    .v6_offsets
                                    .push(*snat_ip);
                            }
                        } else {
                            warn!(
                                server = %server.name,
                                target = %snat_ip,
                                "IPv6 roaming target must be ::/128 or match the server mask, \
                                 config ignored"
                            );
                        }
                    }
                }
            }
        }
    }

    (pbs_config, srs_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_config(network: &str, comment: &str) -> ServerNetworkConfig {
        ServerNetworkConfig {
            enabled: true,
            network: Some(network.parse().unwrap()),
            pseudo_bridge_master_interface: None,
            snat: None,
            routed_networks: vec![],
            routed_networks_firewall: false,
            comment_string: comment.into(),
        }
    }

    fn doc_with(interfaces: Vec<Interface>) -> Document {
        Document {
            wireguard_config_path: "/etc/wireguard".into(),
            wg_if_prefix: "wg-".into(),
            log_level: LogLevel::Info,
            user: "admin".into(),
            password: "hash".into(),
            listen_ip: "0.0.0.0".into(),
            listen_port: 5000,
            base_path: "/".into(),
            api_prefix: "/api".into(),
            panel_id: "p4n3l".into(),
            interfaces: interfaces.into_iter().map(|i| (i.id.clone(), i)).collect(),
            sessions: HashMap::new(),
        }
    }

    fn iface(id: &str, ifname: &str, vrf: Option<&str>, servers: Vec<Server>) -> Interface {
        Interface {
            id: id.into(),
            ifname: ifname.into(),
            enabled: true,
            vrf_name: vrf.map(String::from),
            fw_mark: None,
            endpoint: "203.0.113.1".into(),
            port: 51820,
            mtu: 1420,
            private_key: "priv".into(),
            public_key: "pub".into(),
            servers,
        }
    }

    fn server(id: &str, name: &str, v4: Option<ServerNetworkConfig>) -> Server {
        Server {
            id: id.into(),
            name: name.into(),
            enabled: true,
            dns: vec![],
            ipv4: v4,
            ipv6: None,
            keepalive: None,
            clients: vec![],
        }
    }

    #[test]
    fn lowest_free_id_reuses_gaps() {
        let taken: HashSet<&str> = ["i0", "i1", "i3"].into_iter().collect();
        assert_eq!(lowest_free_id('i', &taken), "i2");
        assert_eq!(lowest_free_id('c', &HashSet::new()), "c0");
    }

    #[test]
    fn overlap_check_scopes_by_vrf_and_family() {
        let doc = doc_with(vec![
            iface(
                "i0",
                "wg-a",
                Some("vrf-blue"),
                vec![server("s0", "alpha", Some(server_config("10.8.0.1/25", "c0")))],
            ),
            iface(
                "i1",
                "wg-b",
                None,
                vec![server("s0", "beta", Some(server_config("10.20.0.1/24", "c1")))],
            ),
        ]);
        let store = store_for(doc);

        // Same VRF: overlapping /24 rejected.
        let candidate: HostNet = "10.8.0.0/24".parse().unwrap();
        assert!(matches!(
            store.check_network_overlaps_in_vrf(Some("vrf-blue"), None, None, &candidate),
            Err(ServiceError::NetworkOverlap(_))
        ));

        // Different VRF (default): the same network is fine, the check
        // only sees wg-b's 10.20.0.0/24 there.
        assert!(store
            .check_network_overlaps_in_vrf(None, None, None, &candidate)
            .is_ok());
        let colliding: HostNet = "10.20.0.128/25".parse().unwrap();
        assert!(store
            .check_network_overlaps_in_vrf(None, None, None, &colliding)
            .is_err());

        // Excluding the owning server admits its own update.
        assert!(store
            .check_network_overlaps_in_vrf(Some("vrf-blue"), None, Some("s0"), &candidate)
            .is_ok());

        // Cross family never overlaps.
        let v6: HostNet = "2001:db8::/64".parse().unwrap();
        assert!(store
            .check_network_overlaps_in_vrf(Some("vrf-blue"), None, None, &v6)
            .is_ok());
    }

    #[test]
    fn internal_config_collects_pseudo_bridge_and_skips() {
        let mut cfg = server_config("10.8.0.1/24", "c0");
        cfg.pseudo_bridge_master_interface = Some("eth0".into());
        let doc = doc_with(vec![iface(
            "i0",
            "wg-a",
            None,
            vec![server("s0", "alpha", Some(cfg))],
        )]);

        let (pbs, srs) = build_internal_config(&doc);
        let nets = &pbs["eth0"];
        assert_eq!(nets.v4_networks.len(), 1);
        assert_eq!(nets.v4_networks[0].to_string(), "10.8.0.0/24");
        // The server's own address is never impersonated.
        assert_eq!(nets.v4_skipped, vec!["10.8.0.1".parse::<std::net::Ipv4Addr>().unwrap()]);
        // Pseudo-bridge-only upstream: roaming entry exists but is None.
        assert!(srs.contains_key("eth0"));
        assert!(srs["eth0"].is_none());
    }

    #[test]
    fn internal_config_roaming_wins_over_pseudo_bridge_none() {
        let mut pb_cfg = server_config("10.8.0.1/24", "c0");
        pb_cfg.pseudo_bridge_master_interface = Some("eth0".into());

        let mut roam_cfg = server_config("10.9.0.1/24", "c1");
        roam_cfg.snat = Some(wgpanel_types::SnatConfig {
            enabled: true,
            snat_ip_net: Some("0.0.0.0/32".parse().unwrap()),
            snat_excluded_network: None,
            roaming_master_interface: Some("eth0".into()),
            roaming_pseudo_bridge: false,
        });

        // Order of servers must not matter: the roaming config survives
        // even when the pseudo-bridge sighting comes later.
        let doc = doc_with(vec![iface(
            "i0",
            "wg-a",
            None,
            vec![
                server("s0", "roamer", Some(roam_cfg)),
                server("s1", "bridged", Some(pb_cfg)),
            ],
        )]);
        let (_, srs) = build_internal_config(&doc);
        let eth0 = srs["eth0"].as_ref().expect("roaming entry present");
        assert!(eth0.contains_key("c1"));
    }

    #[test]
    fn internal_config_netmap_offset_feeds_responder() {
        let mut cfg = server_config("2001:db8:1::1/64", "c6");
        cfg.snat = Some(wgpanel_types::SnatConfig {
            enabled: true,
            snat_ip_net: Some("2001:db8:1::/64".parse().unwrap()),
            snat_excluded_network: None,
            roaming_master_interface: Some("eth0".into()),
            roaming_pseudo_bridge: true,
        });
        let mut srv = server("s0", "v6", None);
        srv.ipv6 = Some(cfg);
        let doc = doc_with(vec![iface("i0", "wg-a", None, vec![srv])]);

        let (pbs, srs) = build_internal_config(&doc);
        assert_eq!(pbs["eth0"].v6_offsets.len(), 1);
        assert_eq!(pbs["eth0"].v6_offsets[0].to_string(), "2001:db8:1::/64");
        assert!(srs["eth0"].as_ref().unwrap().contains_key("c6"));
    }

    #[test]
    fn internal_config_skips_disabled_branches() {
        let mut cfg = server_config("10.8.0.1/24", "c0");
        cfg.pseudo_bridge_master_interface = Some("eth0".into());

        // Disabled server.
        let mut disabled_server = server("s0", "off", Some(cfg.clone()));
        disabled_server.enabled = false;
        let doc = doc_with(vec![iface("i0", "wg-a", None, vec![disabled_server])]);
        let (pbs, srs) = build_internal_config(&doc);
        assert!(pbs.is_empty());
        assert!(srs.is_empty());

        // Disabled interface.
        let mut off_iface = iface("i0", "wg-a", None, vec![server("s0", "on", Some(cfg))]);
        off_iface.enabled = false;
        let doc = doc_with(vec![off_iface]);
        let (pbs, _) = build_internal_config(&doc);
        assert!(pbs.is_empty());
    }

    #[test]
    fn invalid_v4_roaming_target_is_ignored() {
        let mut cfg = server_config("10.8.0.1/24", "c0");
        cfg.snat = Some(wgpanel_types::SnatConfig {
            enabled: true,
            snat_ip_net: Some("198.51.100.7/32".parse().unwrap()),
            snat_excluded_network: None,
            roaming_master_interface: Some("eth0".into()),
            roaming_pseudo_bridge: false,
        });
        let doc = doc_with(vec![iface(
            "i0",
            "wg-a",
            None,
            vec![server("s0", "bad", Some(cfg))],
        )]);
        let (_, srs) = build_internal_config(&doc);
        assert!(srs.is_empty());
    }

    fn store_for(doc: Document) -> Arc<Store> {
        // Tests never publish, so the engines are inert placeholders.
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = rt.enter();
        let pbs = PseudoBridgeService::new();
        let srs = SnatRoamingService::new(pbs.clone());
        Store::new("/tmp/wgpanel-test.json", doc, pbs, srs)
    }

    #[test]
    fn session_expiry() {
        let store = store_for(doc_with(vec![]));
        store.add_session(
            "fresh".into(),
            Session {
                username: "admin".into(),
                created_at: Utc::now(),
                last_seen: Utc::now(),
            },
        );
        store.add_session(
            "stale".into(),
            Session {
                username: "admin".into(),
                created_at: Utc::now() - Duration::hours(30),
                last_seen: Utc::now() - Duration::hours(25),
            },
        );
        store.clean_expired_sessions();
        assert!(store.get_session("fresh").is_some());
        assert!(store.get_session("stale").is_none());
    }
}
