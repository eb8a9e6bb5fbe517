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

//! SNAT roaming engine: reacts to address changes on upstream interfaces
//! and rewrites SNAT/NETMAP rules so tunnel traffic follows the host's
//! currently-bound address on a mobile link.
//!
//! One global netlink subscription (link + v4/v6 address groups) feeds
//! per-upstream listeners. Each listener tracks the best primary address
//! per family; when it changes, every managed config is re-derived into a
//! non-roaming "simulated" config with the resolved target address and
//! pushed through the rule engine, remove-then-add. After every sync the
//! listener publishes the bind state into the pseudo-bridge service so
//! responders can resolve offset networks and skip host-owned addresses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
use netlink_packet_route::link::{LinkAttribute, LinkMessage};
use netlink_packet_route::RouteNetlinkMessage;
use netlink_sys::{AsyncSocket, SocketAddr};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use wgpanel_types::cidr::networks_equal;
use wgpanel_types::{HostNet, ServerNetworkConfig, SnatConfig};

use crate::bridge::PseudoBridgeService;
use crate::error::ServiceError;
use crate::firewall;
use crate::netinfo::{self, IfaceSnapshot};

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

// rtnetlink multicast groups (RTNLGRP_*).
const RTNLGRP_LINK: u32 = 1;
const RTNLGRP_IPV4_IFADDR: u32 = 5;
const RTNLGRP_IPV6_IFADDR: u32 = 9;

fn nl_mgrp(group: u32) -> u32 {
    1 << (group - 1)
}

/// Configuration the roaming engine receives from the document store:
/// per upstream interface, the roaming server network configs keyed by
/// comment string. `None` marks an upstream that only feeds pseudo-bridge
/// bind info and owns no SNAT rules.
pub type RoamingConfigs = HashMap<String, Option<HashMap<String, ServerNetworkConfig>>>;

pub struct SnatRoamingService {
    pbs: Arc<PseudoBridgeService>,
    listeners: Mutex<HashMap<String, Arc<IfaceListener>>>,
    stop_tx: watch::Sender<bool>,
}

pub struct IfaceListener {
    ifname: String,
    configs: Mutex<HashMap<String, ServerNetworkConfig>>,
    best: Mutex<(Option<HostNet>, Option<HostNet>)>,
}

impl SnatRoamingService {
    /// Create the service and start the netlink event loop. Must be called
    /// inside a tokio runtime.
    pub fn new(pbs: Arc<PseudoBridgeService>) -> Arc<Self> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let service = Arc::new(SnatRoamingService {
            pbs,
            listeners: Mutex::new(HashMap::new()),
            stop_tx,
        });
        info!("starting SNAT roaming service");
        let event_service = service.clone();
        tokio::spawn(async move { event_service.event_loop(stop_rx).await });
        service
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<IfaceListener>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reconcile the listener set against a published snapshot: create
    /// listeners for new upstreams, re-diff configs for existing ones,
    /// tear down listeners whose upstream disappeared from the document.
    pub async fn update_configuration(&self, want: RoamingConfigs) {
        let mut to_stop = Vec::new();
        let mut to_sync = Vec::new();
        {
            let mut listeners = self.lock();
            let stale: Vec<String> = listeners
                .keys()
                .filter(|name| !want.contains_key(*name))
                .cloned()
                .collect();
            for ifname in stale {
                if let Some(listener) = listeners.remove(&ifname) {
                    to_stop.push(listener);
                }
            }
            for (ifname, configs) in want {
                let configs = configs.unwrap_or_default();
                match listeners.get(&ifname) {
                    Some(listener) => to_sync.push((listener.clone(), configs, false)),
                    None => {
                        let listener = Arc::new(IfaceListener::new(ifname.clone()));
                        listeners.insert(ifname.clone(), listener.clone());
                        info!(ifname, "started roaming listener");
                        to_sync.push((listener, configs, true));
                    }
                }
            }
        }

        for listener in to_stop {
            listener.teardown().await;
            info!(ifname = %listener.ifname, "stopped roaming listener");
        }
        for (listener, configs, is_new) in to_sync {
            if is_new {
                // Learn the current addresses before the first rule build.
                listener.sync_from_iface(&self.pbs).await;
            }
            listener.reconcile_configs(configs, false).await;
        }
    }

    /// Stop the event loop and remove every rule the engine owns.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let listeners: Vec<Arc<IfaceListener>> = {
            let mut map = self.lock();
            map.drain().map(|(_, l)| l).collect()
        };
        for listener in listeners {
            listener.teardown().await;
        }
        info!("SNAT roaming service stopped");
    }

    async fn event_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        loop {
            if *stop.borrow() {
                return;
            }
            let (handle, mut messages) = match subscribe() {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "netlink subscribe failed, retrying in 5s");
                    if wait_or_stop(&mut stop, RESUBSCRIBE_DELAY).await {
                        return;
                    }
                    continue;
                }
            };
            info!("subscribed to netlink link and address updates");

            loop {
                tokio::select! {
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            return;
                        }
                    }
                    message = messages.next() => {
                        let Some((message, _)) = message else {
                            warn!("netlink update stream closed, resubscribing in 5s");
                            break;
                        };
                        self.dispatch(&handle, &message).await;
                    }
                }
            }

            if wait_or_stop(&mut stop, RESUBSCRIBE_DELAY).await {
                return;
            }
        }
    }

    /// Route one netlink event to the listener of the interface it names.
    async fn dispatch(
        &self,
        handle: &rtnetlink::Handle,
        message: &NetlinkMessage<RouteNetlinkMessage>,
    ) {
        let ifname = match &message.payload {
            NetlinkPayload::InnerMessage(inner) => match inner {
                RouteNetlinkMessage::NewLink(link) | RouteNetlinkMessage::DelLink(link) => {
                    link_name(link)
                }
                RouteNetlinkMessage::NewAddress(addr) | RouteNetlinkMessage::DelAddress(addr) => {
                    link_name_by_index(handle, addr.header.index).await
                }
                _ => None,
            },
            _ => None,
        };
        let Some(ifname) = ifname else {
            return;
        };
        let listener = self.lock().get(&ifname).cloned();
        if let Some(listener) = listener {
            debug!(ifname, "netlink event on managed upstream");
            listener.sync_from_iface(&self.pbs).await;
        }
    }
}

fn subscribe() -> std::io::Result<(
    rtnetlink::Handle,
    futures::channel::mpsc::UnboundedReceiver<(NetlinkMessage<RouteNetlinkMessage>, SocketAddr)>,
)> {
    let (mut conn, handle, messages) = rtnetlink::new_connection()?;
    let groups = nl_mgrp(RTNLGRP_LINK) | nl_mgrp(RTNLGRP_IPV4_IFADDR) | nl_mgrp(RTNLGRP_IPV6_IFADDR);
    let addr = SocketAddr::new(0, groups);
    conn.socket_mut().socket_mut().bind(&addr)?;
    tokio::spawn(conn);
    Ok((handle, messages))
}

/// Wait for the delay; returns true when a stop was requested meanwhile.
async fn wait_or_stop(stop: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        changed = stop.changed() => changed.is_err() || *stop.borrow(),
        _ = tokio::time::sleep(delay) => false,
    }
}

fn link_name(link: &LinkMessage) -> Option<String> {
    link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::IfName(name) => Some(name.clone()),
        _ => None,
    })
}

async fn link_name_by_index(handle: &rtnetlink::Handle, index: u32) -> Option<String> {
    use futures::TryStreamExt;
    let mut links = handle.link().get().match_index(index).execute();
    match links.try_next().await {
        Ok(Some(link)) => link_name(&link),
        _ => None,
    }
}

impl IfaceListener {
    fn new(ifname: String) -> Self {
        IfaceListener {
            ifname,
            configs: Mutex::new(HashMap::new()),
            best: Mutex::new((None, None)),
        }
    }

    fn lock_configs(&self) -> std::sync::MutexGuard<'_, HashMap<String, ServerNetworkConfig>> {
        self.configs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_best(&self) -> std::sync::MutexGuard<'_, (Option<HostNet>, Option<HostNet>)> {
        self.best.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Re-read the interface's addresses. A change of the best primary
    /// address per family triggers a forced resync of every managed
    /// config; the bind info is pushed to the pseudo-bridge either way.
    pub async fn sync_from_iface(&self, pbs: &PseudoBridgeService) {
        let snapshot = match netinfo::interface_snapshot(&self.ifname).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                // The interface may be gone; treat as no addresses.
                debug!(ifname = %self.ifname, error = %e, "address read failed");
                IfaceSnapshot::default()
            }
        };

        let changed = {
            let mut best = self.lock_best();
            let new = (snapshot.best_v4, snapshot.best_v6);
            let changed = *best != new;
            *best = new;
            changed
        };

        pbs.update_iface_binds(
            &self.ifname,
            snapshot.best_v4,
            snapshot.best_v6,
            snapshot.bound_v4,
            snapshot.bound_v6,
        );

        if changed {
            info!(ifname = %self.ifname, "primary address changed, resyncing SNAT rules");
            let current = self.lock_configs().clone();
            self.reconcile_configs(current, true).await;
        }
    }

    /// Diff `new` against the managed set and converge the kernel:
    /// deletions are comment-scoped nat cleanups, additions and updates
    /// apply the simulated config (remove-then-add on update, since the
    /// target address may have moved even when the comment is stable).
    pub async fn reconcile_configs(&self, new: HashMap<String, ServerNetworkConfig>, force_all: bool) {
        let new: HashMap<String, ServerNetworkConfig> = new
            .into_iter()
            .filter(|(_, config)| is_roaming_config(config))
            .collect();

        let (to_add, to_update, to_del) = {
            let mut configs = self.lock_configs();
            let diff = partition_configs(&configs, &new, force_all);
            *configs = new;
            diff
        };
        let best = *self.lock_best();

        for config in to_del {
            if let Err(e) = remove_config_rules(&config).await {
                warn!(ifname = %self.ifname, error = %e, "failed to remove roaming rules");
            }
        }
        for config in to_update {
            if let Err(e) = remove_config_rules(&config).await {
                warn!(ifname = %self.ifname, error = %e, "failed to remove stale roaming rules");
            }
            self.apply_config(&config, best).await;
        }
        for config in to_add {
            self.apply_config(&config, best).await;
        }
    }

    async fn apply_config(&self, config: &ServerNetworkConfig, best: (Option<HostNet>, Option<HostNet>)) {
        let Some(family) = config.family() else {
            return;
        };
        let best_for_family = match family {
            wgpanel_types::IpFamily::V4 => best.0,
            wgpanel_types::IpFamily::V6 => best.1,
        };
        let Some(base) = best_for_family else {
            warn!(
                ifname = %self.ifname,
                comment = %config.comment_string,
                "no usable address on master yet, rules deferred"
            );
            return;
        };
        match simulated_config(config, &base) {
            Ok(simulated) => {
                if let Err(e) = firewall::apply_snat_rules(&simulated).await {
                    warn!(ifname = %self.ifname, error = %e, "failed to apply roaming SNAT rules");
                }
            }
            Err(e) => {
                warn!(
                    ifname = %self.ifname,
                    comment = %config.comment_string,
                    error = %e,
                    "cannot derive roaming target"
                );
            }
        }
    }

    /// Remove every rule this listener manages.
    pub async fn teardown(&self) {
        let configs: Vec<ServerNetworkConfig> = self.lock_configs().values().cloned().collect();
        for config in configs {
            if let Err(e) = remove_config_rules(&config).await {
                warn!(ifname = %self.ifname, error = %e, "failed to remove rules on teardown");
            }
        }
        self.lock_configs().clear();
    }
}

fn is_roaming_config(config: &ServerNetworkConfig) -> bool {
    config.enabled
        && config.network.is_some()
        && config
            .snat
            .as_ref()
            .is_some_and(|s| s.enabled && s.is_roaming())
}

async fn remove_config_rules(config: &ServerNetworkConfig) -> Result<(), ServiceError> {
    let Some(family) = config.family() else {
        return Ok(());
    };
    firewall::remove_snat_rules(family, &config.comment_string).await
}

/// True when the fields that shape the emitted rules differ.
pub(crate) fn config_changed(old: &ServerNetworkConfig, new: &ServerNetworkConfig) -> bool {
    if old.network != new.network {
        return true;
    }
    let (old_snat, new_snat) = (old.snat.as_ref(), new.snat.as_ref());
    let snat_ip = |s: Option<&SnatConfig>| s.and_then(|s| s.snat_ip_net);
    let excluded = |s: Option<&SnatConfig>| s.and_then(|s| s.snat_excluded_network);
    if snat_ip(old_snat) != snat_ip(new_snat) || excluded(old_snat) != excluded(new_snat) {
        return true;
    }
    !networks_equal(&old.routed_networks, &new.routed_networks)
}

/// Partition `new` against `old` into (add, update, delete) by comment key.
pub(crate) fn partition_configs(
    old: &HashMap<String, ServerNetworkConfig>,
    new: &HashMap<String, ServerNetworkConfig>,
    force_all: bool,
) -> (
    Vec<ServerNetworkConfig>,
    Vec<ServerNetworkConfig>,
    Vec<ServerNetworkConfig>,
) {
    let mut to_add = Vec::new();
    let mut to_update = Vec::new();
    let mut to_del = Vec::new();

    for (key, config) in new {
        match old.get(key) {
            None => to_add.push(config.clone()),
            Some(previous) => {
                if force_all || config_changed(previous, config) {
                    to_update.push(config.clone());
                }
            }
        }
    }
    for (key, config) in old {
        if !new.contains_key(key) {
            to_del.push(config.clone());
        }
    }
    (to_add, to_update, to_del)
}

/// Rewrite a roaming config into the non-roaming config whose rules should
/// currently be installed: a zero `/32`//`128` target becomes the master's
/// present address, a NETMAP target becomes the currently-mapped block.
pub(crate) fn simulated_config(
    config: &ServerNetworkConfig,
    master_best: &HostNet,
) -> Result<ServerNetworkConfig, ServiceError> {
    let snat = config
        .snat
        .as_ref()
        .ok_or_else(|| ServiceError::validation("roaming config without SNAT section"))?;
    let snat_ip = snat
        .snat_ip_net
        .ok_or_else(|| ServiceError::validation("roaming config without SNAT target"))?;

    let resolved = if snat_ip.prefix() == snat_ip.family().bits() {
        HostNet::from_addr(master_best.addr())
    } else {
        netinfo::resolve_roaming_net(master_best, &snat_ip)?
    };

    Ok(ServerNetworkConfig {
        enabled: true,
        network: config.network,
        pseudo_bridge_master_interface: None,
        snat: Some(SnatConfig {
            enabled: true,
            snat_ip_net: Some(resolved),
            snat_excluded_network: snat.snat_excluded_network,
            roaming_master_interface: None,
            roaming_pseudo_bridge: false,
        }),
        routed_networks: config.routed_networks.clone(),
        routed_networks_firewall: config.routed_networks_firewall,
        comment_string: config.comment_string.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roaming_config(network: &str, snat_ip: &str, comment: &str) -> ServerNetworkConfig {
        ServerNetworkConfig {
            enabled: true,
            network: Some(network.parse().unwrap()),
            pseudo_bridge_master_interface: None,
            snat: Some(SnatConfig {
                enabled: true,
                snat_ip_net: Some(snat_ip.parse().unwrap()),
                snat_excluded_network: None,
                roaming_master_interface: Some("eth0".into()),
                roaming_pseudo_bridge: false,
            }),
            routed_networks: vec![],
            routed_networks_firewall: false,
            comment_string: comment.into(),
        }
    }

    #[test]
    fn zero_target_becomes_master_address() {
        let config = roaming_config("10.8.0.1/24", "0.0.0.0/32", "c1");
        let master: HostNet = "203.0.113.5/24".parse().unwrap();
        let simulated = simulated_config(&config, &master).unwrap();
        let snat = simulated.snat.unwrap();
        assert_eq!(snat.snat_ip_net.unwrap().to_string(), "203.0.113.5/32");
        assert!(!snat.roaming_pseudo_bridge);
        assert_eq!(snat.roaming_master_interface, None);
    }

    #[test]
    fn netmap_target_becomes_mapped_block() {
        // Server 2001:db8:1::/64, SNAT offset of matching mask, master
        // bound to 2001:db8:abcd::/64: the rules must NETMAP to the
        // master's block.
        let config = roaming_config("2001:db8:1::1/64", "2001:db8:1::/64", "c6");
        let master: HostNet = "2001:db8:abcd::9/64".parse().unwrap();
        let simulated = simulated_config(&config, &master).unwrap();

        let rules: Vec<String> = firewall::snat_rule_args(&simulated)
            .into_iter()
            .map(|args| args.join(" "))
            .collect();
        assert_eq!(
            rules,
            vec![
                "-t nat -A POSTROUTING -s 2001:db8:1::/64 ! -d 2001:db8:1::/64 -j NETMAP \
                 --to 2001:db8:abcd::/64 -m comment --comment c6",
                "-t nat -A PREROUTING -d 2001:db8:abcd::/64 -j NETMAP --to 2001:db8:1::/64 \
                 -m comment --comment c6",
            ]
        );
    }

    #[test]
    fn missing_snat_target_is_an_error() {
        let mut config = roaming_config("10.8.0.1/24", "0.0.0.0/32", "c1");
        config.snat.as_mut().unwrap().snat_ip_net = None;
        let master: HostNet = "203.0.113.5/24".parse().unwrap();
        assert!(simulated_config(&config, &master).is_err());
    }

    #[test]
    fn change_detection_covers_rule_shaping_fields() {
        let a = roaming_config("10.8.0.1/24", "0.0.0.0/32", "c1");

        let mut b = a.clone();
        assert!(!config_changed(&a, &b));

        b.network = Some("10.9.0.1/24".parse().unwrap());
        assert!(config_changed(&a, &b));

        let mut c = a.clone();
        c.snat.as_mut().unwrap().snat_excluded_network = Some("10.0.0.0/8".parse().unwrap());
        assert!(config_changed(&a, &c));

        let mut d = a.clone();
        d.routed_networks = vec!["192.168.0.0/16".parse().unwrap()];
        assert!(config_changed(&a, &d));

        // Comment churn alone does not count; identity is the map key.
        let mut e = a.clone();
        e.comment_string = "other".into();
        assert!(!config_changed(&a, &e));
    }

    #[test]
    fn partition_add_update_delete() {
        let mut old = HashMap::new();
        old.insert("keep".to_string(), roaming_config("10.8.0.1/24", "0.0.0.0/32", "keep"));
        old.insert("gone".to_string(), roaming_config("10.9.0.1/24", "0.0.0.0/32", "gone"));

        let mut new = HashMap::new();
        new.insert("keep".to_string(), roaming_config("10.8.0.1/24", "0.0.0.0/32", "keep"));
        new.insert("born".to_string(), roaming_config("10.10.0.1/24", "0.0.0.0/32", "born"));

        let (add, update, del) = partition_configs(&old, &new, false);
        assert_eq!(add.len(), 1);
        assert_eq!(add[0].comment_string, "born");
        assert!(update.is_empty());
        assert_eq!(del.len(), 1);
        assert_eq!(del[0].comment_string, "gone");

        // force_all promotes unchanged entries to updates.
        let (_, update, _) = partition_configs(&old, &new, true);
        assert_eq!(update.len(), 1);
        assert_eq!(update[0].comment_string, "keep");
    }
}
