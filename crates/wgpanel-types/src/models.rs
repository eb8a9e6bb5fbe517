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

//! The persisted document model: interfaces own servers, servers own
//! clients. The whole tree is serialized as one JSON blob; CIDR values
//! marshal as strings and client addresses as offsets from their server
//! network.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cidr::{ips_equal, networks_equal, HostNet, IpFamily};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    #[default]
    Info,
    Verbose,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Info => "info",
            LogLevel::Verbose => "verbose",
        }
    }
}

/// Top-level persisted document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    #[serde(default = "default_wireguard_config_path")]
    pub wireguard_config_path: String,
    #[serde(default = "default_wg_if_prefix")]
    pub wg_if_prefix: String,
    #[serde(default)]
    pub log_level: LogLevel,
    pub user: String,
    /// bcrypt hash of the admin password.
    pub password: String,
    #[serde(rename = "listenIP", default = "default_listen_ip")]
    pub listen_ip: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_base_path")]
    pub base_path: String,
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    /// 6-character random identifier; prefixes every firewall comment this
    /// instance emits, so cleanup can sweep everything it ever created.
    #[serde(rename = "serverId", default)]
    pub panel_id: String,
    #[serde(default)]
    pub interfaces: HashMap<String, Interface>,
    #[serde(default)]
    pub sessions: HashMap<String, Session>,
}

fn default_wireguard_config_path() -> String {
    "/etc/wireguard".to_owned()
}

fn default_wg_if_prefix() -> String {
    "wg-".to_owned()
}

fn default_listen_ip() -> String {
    "0.0.0.0".to_owned()
}

fn default_listen_port() -> u16 {
    5000
}

fn default_base_path() -> String {
    "/".to_owned()
}

fn default_api_prefix() -> String {
    "/api".to_owned()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// A WireGuard tunnel device plus the servers carved out of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    pub id: String,
    pub ifname: String,
    #[serde(default)]
    pub enabled: bool,
    pub vrf_name: Option<String>,
    pub fw_mark: Option<String>,
    pub endpoint: String,
    pub port: u16,
    pub mtu: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub private_key: String,
    pub public_key: String,
    #[serde(default)]
    pub servers: Vec<Server>,
}

impl Interface {
    pub fn server(&self, id: &str) -> Option<&Server> {
        self.servers.iter().find(|s| s.id == id)
    }

    pub fn server_mut(&mut self, id: &str) -> Option<&mut Server> {
        self.servers.iter_mut().find(|s| s.id == id)
    }
}

/// A subnet within an interface; groups clients sharing an address plan and
/// firewall policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub dns: Vec<String>,
    pub ipv4: Option<ServerNetworkConfig>,
    pub ipv6: Option<ServerNetworkConfig>,
    pub keepalive: Option<u16>,
    #[serde(default)]
    pub clients: Vec<Client>,
}

impl Server {
    pub fn network_config(&self, family: IpFamily) -> Option<&ServerNetworkConfig> {
        match family {
            IpFamily::V4 => self.ipv4.as_ref(),
            IpFamily::V6 => self.ipv6.as_ref(),
        }
    }

    pub fn network(&self, family: IpFamily) -> Option<&HostNet> {
        self.network_config(family).and_then(|c| c.network.as_ref())
    }

    pub fn client(&self, id: &str) -> Option<&Client> {
        self.clients.iter().find(|c| c.id == id)
    }

    pub fn client_mut(&mut self, id: &str) -> Option<&mut Client> {
        self.clients.iter_mut().find(|c| c.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerNetworkConfig {
    pub enabled: bool,
    /// The host part is the server's own tunnel address; the mask defines
    /// the subnet clients are allocated from.
    pub network: Option<HostNet>,
    pub pseudo_bridge_master_interface: Option<String>,
    pub snat: Option<SnatConfig>,
    #[serde(default)]
    pub routed_networks: Vec<HostNet>,
    #[serde(default)]
    pub routed_networks_firewall: bool,
    /// Per-family token tagging every firewall rule this config emits.
    pub comment_string: String,
}

impl ServerNetworkConfig {
    pub fn family(&self) -> Option<IpFamily> {
        self.network.map(|n| n.family())
    }

    pub fn has_pseudo_bridge(&self) -> bool {
        self.pseudo_bridge_master_interface
            .as_deref()
            .is_some_and(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnatConfig {
    pub enabled: bool,
    pub snat_ip_net: Option<HostNet>,
    pub snat_excluded_network: Option<HostNet>,
    pub roaming_master_interface: Option<String>,
    #[serde(default)]
    pub roaming_pseudo_bridge: bool,
}

impl SnatConfig {
    pub fn is_roaming(&self) -> bool {
        self.roaming_master_interface
            .as_deref()
            .is_some_and(|s| !s.is_empty())
    }
}

/// A WireGuard peer. Tunnel addresses are stored as offsets from the server
/// network so renumbering the server translates every client in one pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(rename = "ipv4offset")]
    pub ipv4_offset: Option<Ipv4Addr>,
    #[serde(rename = "ipv6offset")]
    pub ipv6_offset: Option<Ipv6Addr>,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    pub public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<String>,
    pub keepalive: Option<u16>,
}

impl Client {
    /// Effective IPv4 address inside `server_net`, if both sides are set.
    pub fn addr_v4(&self, server_net: Option<&HostNet>) -> Option<HostNet> {
        let net = server_net?;
        let offset = self.ipv4_offset?;
        net.by_offset(IpAddr::V4(offset)).ok()
    }

    /// Effective IPv6 address inside `server_net`, if both sides are set.
    pub fn addr_v6(&self, server_net: Option<&HostNet>) -> Option<HostNet> {
        let net = server_net?;
        let offset = self.ipv6_offset?;
        net.by_offset(IpAddr::V6(offset)).ok()
    }

    pub fn offset(&self, family: IpFamily) -> Option<IpAddr> {
        match family {
            IpFamily::V4 => self.ipv4_offset.map(IpAddr::V4),
            IpFamily::V6 => self.ipv6_offset.map(IpAddr::V6),
        }
    }
}

/// Live peer state parsed from `wg show <if> dump`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerState {
    pub endpoint: Option<String>,
    pub latest_handshake: Option<DateTime<Utc>>,
    pub transfer_rx: Option<u64>,
    pub transfer_tx: Option<u64>,
}

/// Per-upstream-interface input for the pseudo-bridge responder.
///
/// Offsets stay unresolved until the roaming engine discovers the upstream's
/// base network; the skip sets hold addresses the responder must never
/// impersonate.
#[derive(Debug, Clone, Default)]
pub struct ResponderNetworks {
    pub v4_networks: Vec<HostNet>,
    pub v6_networks: Vec<HostNet>,
    pub v4_offsets: Vec<HostNet>,
    pub v6_offsets: Vec<HostNet>,
    pub v4_skipped: Vec<Ipv4Addr>,
    pub v6_skipped: Vec<Ipv6Addr>,
}

impl ResponderNetworks {
    /// Set equality, family by family, ignoring order.
    pub fn same_set(&self, other: &ResponderNetworks) -> bool {
        networks_equal(&self.v4_networks, &other.v4_networks)
            && networks_equal(&self.v6_networks, &other.v6_networks)
            && networks_equal(&self.v4_offsets, &other.v4_offsets)
            && networks_equal(&self.v6_offsets, &other.v6_offsets)
            && ips_equal(&self.v4_skipped, &other.v4_skipped)
            && ips_equal(&self.v6_skipped, &other.v6_skipped)
    }
}
