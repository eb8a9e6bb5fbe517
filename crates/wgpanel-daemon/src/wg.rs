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

//! The bridge between the document model and live WireGuard devices.
//!
//! Configuration is rendered as standalone wg-quick files whose PostUp and
//! PreDown lines carry the VRF and firewall commands, so `wg-quick up` and
//! `wg-quick down` alone reproduce and revert the full state. Applying to a
//! running device goes through `wg-quick strip` piped into `wg syncconf`,
//! which preserves peer handshake state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use wgpanel_types::{Interface, IpFamily, PeerState, Server};

use crate::command::{run, run_with_output, run_with_stdin};
use crate::error::ServiceError;
use crate::firewall;
use crate::fsutil::write_file_atomic;
use crate::keys;

pub struct WgService {
    config_dir: PathBuf,
}

impl WgService {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        WgService {
            config_dir: config_dir.into(),
        }
    }

    pub fn conf_path(&self, ifname: &str) -> PathBuf {
        self.config_dir.join(format!("{ifname}.conf"))
    }

    pub async fn conf_exists(&self, ifname: &str) -> bool {
        tokio::fs::metadata(self.conf_path(ifname)).await.is_ok()
    }

    /// Render the wg-quick configuration for an interface: one `[Interface]`
    /// block, then one `[Peer]` block per enabled client of every enabled
    /// server.
    pub fn render_config(iface: &Interface) -> String {
        let mut out = String::new();
        out.push_str("[Interface]\n");
        out.push_str(&format!("PrivateKey = {}\n", iface.private_key));
        out.push_str(&format!("ListenPort = {}\n", iface.port));
        if let Some(fwmark) = iface.fw_mark.as_deref().filter(|m| !m.is_empty()) {
            out.push_str(&format!("FwMark = {fwmark}\n"));
        }

        let mut addresses = Vec::new();
        for server in iface.servers.iter().filter(|s| s.enabled) {
            for family in [IpFamily::V4, IpFamily::V6] {
                if let Some(cfg) = server.network_config(family) {
                    if cfg.enabled {
                        if let Some(network) = &cfg.network {
                            addresses.push(network.to_string());
                        }
                    }
                }
            }
        }
        if !addresses.is_empty() {
            out.push_str(&format!("Address = {}\n", addresses.join(", ")));
        }

        for cmd in Self::post_up_commands(iface, true) {
            out.push_str(&format!("PostUp = {cmd}\n"));
        }
        for cmd in Self::pre_down_commands(iface) {
            out.push_str(&format!("PreDown = {cmd}\n"));
        }
        out.push('\n');

        for server in iface.servers.iter().filter(|s| s.enabled) {
            for client in server.clients.iter().filter(|c| c.enabled) {
                out.push_str("[Peer]\n");
                out.push_str(&format!("PublicKey = {}\n", client.public_key));
                if let Some(psk) = client.preshared_key.as_deref().filter(|k| !k.is_empty()) {
                    out.push_str(&format!("PresharedKey = {psk}\n"));
                }
                let allowed = Self::allowed_ips(client, server);
                if !allowed.is_empty() {
                    out.push_str(&format!("AllowedIPs = {}\n", allowed.join(", ")));
                }
                let keepalive = client.keepalive.or(server.keepalive).unwrap_or(0);
                if keepalive > 0 {
                    out.push_str(&format!("PersistentKeepalive = {keepalive}\n"));
                }
                out.push('\n');
            }
        }

        out
    }

    /// Host routes for a peer: always `/32` and `/128`, derived from the
    /// client's offsets in the server networks.
    fn allowed_ips(client: &wgpanel_types::Client, server: &Server) -> Vec<String> {
        let mut allowed = Vec::new();
        if server.ipv4.as_ref().is_some_and(|c| c.enabled) {
            if let Some(addr) = client.addr_v4(server.network(IpFamily::V4)) {
                allowed.push(format!("{}/32", addr.addr()));
            }
        }
        if server.ipv6.as_ref().is_some_and(|c| c.enabled) {
            if let Some(addr) = client.addr_v6(server.network(IpFamily::V6)) {
                allowed.push(format!("{}/128", addr.addr()));
            }
        }
        allowed
    }

    /// PostUp lines: VRF master assignment first, then the firewall rules of
    /// every enabled server network. With `use_placeholder` the firewall
    /// lines reference `%i` so wg-quick substitutes the live device name.
    fn post_up_commands(iface: &Interface, use_placeholder: bool) -> Vec<String> {
        let mut commands = Vec::new();
        if let Some(vrf) = iface.vrf_name.as_deref().filter(|v| !v.is_empty()) {
            commands.push(format!("ip link set dev {} master {vrf}", iface.ifname));
        }
        let ifname = if use_placeholder { "%i" } else { &iface.ifname };
        for server in iface.servers.iter().filter(|s| s.enabled) {
            for family in [IpFamily::V4, IpFamily::V6] {
                if let Some(cfg) = server.network_config(family) {
                    if cfg.enabled {
                        commands.extend(firewall::server_rules(ifname, cfg));
                    }
                }
            }
        }
        commands
    }

    /// PreDown lines: comment-scoped rule cleanup per enabled server
    /// network, then VRF release.
    fn pre_down_commands(iface: &Interface) -> Vec<String> {
        let mut commands = Vec::new();
        for server in iface.servers.iter().filter(|s| s.enabled) {
            for family in [IpFamily::V4, IpFamily::V6] {
                if let Some(cfg) = server.network_config(family) {
                    if cfg.enabled && !cfg.comment_string.is_empty() {
                        commands.push(firewall::cleanup_shell_line(&cfg.comment_string, family));
                    }
                }
            }
        }
        if let Some(vrf) = iface.vrf_name.as_deref().filter(|v| !v.is_empty()) {
            commands.push(format!("ip link set dev {} nomaster", iface.ifname));
        }
        commands
    }

    /// Render and atomically write the interface's config file (mode 0600:
    /// it contains the private key).
    pub async fn sync_conf(&self, iface: &Interface) -> Result<(), ServiceError> {
        let config = Self::render_config(iface);
        let path = self.conf_path(&iface.ifname);
        write_file_atomic(&path, config.as_bytes(), 0o600).await?;
        info!(path = %path.display(), "wrote wireguard configuration");
        Ok(())
    }

    pub async fn sync_to_conf_and_interface(&self, iface: &Interface) -> Result<(), ServiceError> {
        self.sync_conf(iface).await?;
        self.sync_to_interface(&iface.ifname, iface.enabled, &iface.private_key)
            .await
    }

    /// Reconcile the live device with the rendered config:
    ///
    /// - enabled, link absent → `wg-quick up`
    /// - enabled, link present → `wg-quick strip` | `wg syncconf`
    /// - disabled, link present → `wg-quick down`
    /// - disabled, link absent → no-op
    ///
    /// When the link exists it must be a WireGuard device whose public key
    /// matches the one derived from `private_key`; a foreign link with the
    /// same name is never touched.
    pub async fn sync_to_interface(
        &self,
        ifname: &str,
        enabled: bool,
        private_key: &str,
    ) -> Result<(), ServiceError> {
        let config_file = self.conf_path(ifname);
        let expected_pubkey = if private_key.is_empty() {
            String::new()
        } else {
            keys::private_to_public(private_key)?
        };

        let link_exists = run("ip", &["link", "show", ifname]).await.is_ok();

        if enabled {
            if !link_exists {
                info!(ifname, "bringing up wireguard interface");
                run("wg-quick", &["up", &path_str(&config_file)]).await?;
            } else {
                self.guard_target_link(ifname, &expected_pubkey).await?;
                info!(ifname, "syncing configuration to live interface");
                let stripped =
                    run_with_output("wg-quick", &["strip", &path_str(&config_file)]).await?;
                run_with_stdin("wg", &["syncconf", ifname, "/dev/stdin"], &stripped).await?;
            }
        } else if link_exists {
            self.guard_target_link(ifname, &expected_pubkey).await?;
            info!(ifname, "bringing down wireguard interface");
            run("wg-quick", &["down", &path_str(&config_file)]).await?;
        }

        Ok(())
    }

    /// Refuse to operate on a link that is not our WireGuard device.
    async fn guard_target_link(&self, ifname: &str, pubkey: &str) -> Result<(), ServiceError> {
        if run("wg", &["show", ifname]).await.is_err() {
            return Err(ServiceError::validation(format!(
                "interface {ifname} exists but is not a WireGuard interface"
            )));
        }
        if pubkey.is_empty() {
            return Ok(());
        }
        let current = run_with_output("wg", &["show", ifname, "public-key"]).await?;
        if current.trim() != pubkey {
            return Err(ServiceError::validation(format!(
                "interface {ifname} is not the target WireGuard interface (public key mismatch)"
            )));
        }
        Ok(())
    }

    pub async fn remove_config(&self, ifname: &str) -> Result<(), ServiceError> {
        let path = self.conf_path(ifname);
        info!(path = %path.display(), "removing wireguard configuration");
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn set_mtu(&self, ifname: &str, mtu: u32) -> Result<(), ServiceError> {
        run("ip", &["link", "show", ifname]).await?;
        run("ip", &["link", "set", "dev", ifname, "mtu", &mtu.to_string()]).await?;
        Ok(())
    }

    /// Parse `wg show <if> dump` into per-peer state. Peer lines have eight
    /// tab-separated fields; the leading interface line has four and is
    /// skipped. `(none)` and `0` decode to absent.
    pub async fn peer_stats(
        &self,
        ifname: &str,
    ) -> Result<HashMap<String, PeerState>, ServiceError> {
        let output = run_with_output("wg", &["show", ifname, "dump"]).await?;
        Ok(parse_peer_dump(&output))
    }
}

fn path_str(path: &Path) -> String {
    path.display().to_string()
}

fn parse_peer_dump(output: &str) -> HashMap<String, PeerState> {
    let mut stats = HashMap::new();
    for line in output.lines() {
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() < 8 || parts[0].is_empty() {
            continue;
        }
        let mut state = PeerState::default();
        if parts[2] != "(none)" && !parts[2].is_empty() {
            state.endpoint = Some(parts[2].to_owned());
        }
        state.latest_handshake = parse_timestamp(parts[4]);
        state.transfer_rx = parse_counter(parts[5]);
        state.transfer_tx = parse_counter(parts[6]);
        stats.insert(parts[0].to_owned(), state);
    }
    debug!(peers = stats.len(), "parsed wg dump");
    stats
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let secs: i64 = s.trim().parse().ok().filter(|&v| v != 0)?;
    DateTime::<Utc>::from_timestamp(secs, 0)
}

fn parse_counter(s: &str) -> Option<u64> {
    s.trim().parse().ok().filter(|&v| v != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use wgpanel_types::{Client, ServerNetworkConfig, SnatConfig};

    fn sample_interface() -> Interface {
        Interface {
            id: "i0".into(),
            ifname: "wg-a".into(),
            enabled: true,
            vrf_name: Some("vrf-blue".into()),
            fw_mark: Some("0xca6c".into()),
            endpoint: "203.0.113.1".into(),
            port: 51820,
            mtu: 1420,
            private_key: "PRIVKEY".into(),
            public_key: "PUBKEY".into(),
            servers: vec![Server {
                id: "s0".into(),
                name: "office".into(),
                enabled: true,
                dns: vec![],
                ipv4: Some(ServerNetworkConfig {
                    enabled: true,
                    network: Some("10.8.0.1/24".parse().unwrap()),
                    pseudo_bridge_master_interface: None,
                    snat: Some(SnatConfig {
                        enabled: true,
                        snat_ip_net: None,
                        snat_excluded_network: None,
                        roaming_master_interface: None,
                        roaming_pseudo_bridge: false,
                    }),
                    routed_networks: vec!["10.8.0.0/24".parse().unwrap()],
                    routed_networks_firewall: false,
                    comment_string: "p4n3l--v4-abcdefghijkl".into(),
                }),
                ipv6: None,
                keepalive: None,
                clients: vec![
                    Client {
                        id: "c0".into(),
                        name: "laptop".into(),
                        enabled: true,
                        ipv4_offset: Some(Ipv4Addr::new(0, 0, 0, 2)),
                        ipv6_offset: None,
                        dns: vec![],
                        private_key: None,
                        public_key: "CLIENTKEY".into(),
                        preshared_key: Some("PSK".into()),
                        keepalive: Some(25),
                    },
                    Client {
                        id: "c1".into(),
                        name: "disabled".into(),
                        enabled: false,
                        ipv4_offset: Some(Ipv4Addr::new(0, 0, 0, 3)),
                        ipv6_offset: None,
                        dns: vec![],
                        private_key: None,
                        public_key: "OTHERKEY".into(),
                        preshared_key: None,
                        keepalive: None,
                    },
                ],
            }],
        }
    }

    #[test]
    fn render_contains_interface_block_and_enabled_peers() {
        let config = WgService::render_config(&sample_interface());

        assert!(config.starts_with("[Interface]\nPrivateKey = PRIVKEY\nListenPort = 51820\n"));
        assert!(config.contains("FwMark = 0xca6c\n"));
        assert!(config.contains("Address = 10.8.0.1/24\n"));
        assert!(config.contains("PostUp = ip link set dev wg-a master vrf-blue\n"));
        assert!(config.contains("PostUp = iptables -t nat -A POSTROUTING -s 10.8.0.0/24"));
        assert!(config.contains("PreDown = iptables-save | awk"));
        assert!(config.contains("PreDown = ip link set dev wg-a nomaster\n"));

        assert!(!config.contains("-A FORWARD")); // no routed firewall configured
        assert!(config.contains("PublicKey = CLIENTKEY\n"));
        assert!(config.contains("PresharedKey = PSK\n"));
        assert!(config.contains("AllowedIPs = 10.8.0.2/32\n"));
        assert!(config.contains("PersistentKeepalive = 25\n"));
        // The disabled client is absent.
        assert!(!config.contains("OTHERKEY"));
    }

    #[test]
    fn render_skips_disabled_servers_entirely() {
        let mut iface = sample_interface();
        iface.servers[0].enabled = false;
        let config = WgService::render_config(&iface);
        assert!(!config.contains("Address ="));
        assert!(!config.contains("[Peer]"));
    }

    #[test]
    fn post_up_uses_placeholder_for_firewall_rules() {
        let iface = sample_interface();
        let commands = WgService::post_up_commands(&iface, true);
        assert_eq!(commands[0], "ip link set dev wg-a master vrf-blue");
        assert!(commands[1].contains("iptables -t nat -A POSTROUTING"));
        // VRF line names the device; firewall lines would use %i when the
        // ifname appears (it does not in nat rules).
        let literal = WgService::post_up_commands(&iface, false);
        assert_eq!(literal.len(), commands.len());
    }

    #[test]
    fn server_keepalive_is_the_fallback() {
        let mut iface = sample_interface();
        iface.servers[0].keepalive = Some(53);
        iface.servers[0].clients[0].keepalive = None;
        let config = WgService::render_config(&iface);
        assert!(config.contains("PersistentKeepalive = 53\n"));
    }

    #[test]
    fn parse_peer_dump_decodes_sentinels() {
        let dump = "PRIVATE\tPUBLIC\t51820\toff\n\
            peer1\t(none)\t203.0.113.9:51820\t10.8.0.2/32\t1719834000\t1024\t2048\t25\n\
            peer2\t(none)\t(none)\t10.8.0.3/32\t0\t0\t0\toff\n";
        let stats = parse_peer_dump(dump);
        assert_eq!(stats.len(), 2);

        let p1 = &stats["peer1"];
        assert_eq!(p1.endpoint.as_deref(), Some("203.0.113.9:51820"));
        assert_eq!(p1.latest_handshake.unwrap().timestamp(), 1719834000);
        assert_eq!(p1.transfer_rx, Some(1024));
        assert_eq!(p1.transfer_tx, Some(2048));

        let p2 = &stats["peer2"];
        assert_eq!(p2.endpoint, None);
        assert_eq!(p2.latest_handshake, None);
        assert_eq!(p2.transfer_rx, None);
        assert_eq!(p2.transfer_tx, None);
    }

    #[tokio::test]
    async fn sync_conf_writes_mode_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let service = WgService::new(dir.path());
        let iface = sample_interface();
        service.sync_conf(&iface).await.unwrap();

        let path = service.conf_path("wg-a");
        let metadata = tokio::fs::metadata(&path).await.unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(content.contains("PrivateKey = PRIVKEY"));
    }

    #[tokio::test]
    async fn remove_config_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let service = WgService::new(dir.path());
        service.remove_config("wg-never-existed").await.unwrap();
    }
}
