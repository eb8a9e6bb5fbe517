//! Interface write path: create, update (rename modeled as remove-old +
//! create-new), enable/disable, delete. Every mutation runs validate →
//! persist → wg sync → publish.

use std::sync::Arc;

use tracing::{info, warn};
use wgpanel_types::Interface;

use crate::error::ServiceError;
use crate::keys;
use crate::netinfo;
use crate::sanitize;
use crate::store::Store;
use crate::wg::WgService;

const DEFAULT_MTU: u32 = 1420;

#[derive(Debug, Clone, Default)]
pub struct InterfaceCreateRequest {
    pub ifname: String,
    pub vrf_name: Option<String>,
    pub fw_mark: Option<String>,
    pub endpoint: String,
    pub port: u16,
    /// 0 means the default (1420).
    pub mtu: u32,
    /// Empty means generate a fresh key.
    pub private_key: String,
}

/// Update request; empty strings and `None` leave fields unchanged. The
/// VRF uses a nested option so it can be explicitly cleared.
#[derive(Debug, Clone, Default)]
pub struct InterfaceUpdateRequest {
    pub ifname: String,
    pub vrf_name: Option<Option<String>>,
    pub fw_mark: Option<String>,
    pub endpoint: String,
    pub port: u16,
    pub mtu: u32,
    pub private_key: String,
}

pub struct InterfaceService {
    store: Arc<Store>,
    wg: Arc<WgService>,
}

impl InterfaceService {
    pub fn new(store: Arc<Store>, wg: Arc<WgService>) -> Self {
        InterfaceService { store, wg }
    }

    pub async fn create(&self, req: InterfaceCreateRequest) -> Result<Interface, ServiceError> {
        let prefix = self.store.wg_if_prefix();
        sanitize::validate_ifname(&prefix, &req.ifname)?;

        if self
            .store
            .interfaces()
            .iter()
            .any(|i| i.ifname == req.ifname)
        {
            return Err(ServiceError::validation(format!(
                "interface with ifname {:?} already exists",
                req.ifname
            )));
        }
        self.check_ifname_available(&req.ifname).await?;

        let private_key = if req.private_key.is_empty() {
            keys::generate_private_key()
        } else {
            req.private_key.clone()
        };
        let public_key = keys::private_to_public(&private_key)?;

        let endpoint = sanitize::validate_endpoint(&req.endpoint)?;
        netinfo::udp_port_available(req.port)?;
        let mtu = if req.mtu == 0 { DEFAULT_MTU } else { req.mtu };

        let iface = Interface {
            id: self.store.next_interface_id(),
            ifname: req.ifname,
            enabled: false,
            vrf_name: req.vrf_name,
            fw_mark: req.fw_mark,
            endpoint,
            port: req.port,
            mtu,
            private_key,
            public_key,
            servers: Vec::new(),
        };

        self.store.set_interface(iface.clone());
        self.store.save().await?;
        self.wg.sync_conf(&iface).await?;

        info!(id = %iface.id, ifname = %iface.ifname, "created interface");
        Ok(sanitized(iface))
    }

    pub fn get(&self, id: &str) -> Result<Interface, ServiceError> {
        self.store
            .get_interface(id)
            .map(sanitized)
            .ok_or(ServiceError::InterfaceNotFound)
    }

    pub fn get_all(&self) -> Vec<Interface> {
        self.store.interfaces().into_iter().map(sanitized).collect()
    }

    pub async fn update(
        &self,
        id: &str,
        req: InterfaceUpdateRequest,
    ) -> Result<Interface, ServiceError> {
        let mut iface = self
            .store
            .get_interface(id)
            .ok_or(ServiceError::InterfaceNotFound)?;
        let old_private_key = iface.private_key.clone();

        let mut recreate_old: Option<String> = None;
        let mut needs_regeneration = false;
        let mut needs_mtu_update = false;

        if !req.ifname.is_empty() && req.ifname != iface.ifname {
            let prefix = self.store.wg_if_prefix();
            sanitize::validate_ifname(&prefix, &req.ifname)?;
            if self
                .store
                .interfaces()
                .iter()
                .any(|other| other.id != id && other.ifname == req.ifname)
            {
                return Err(ServiceError::validation(format!(
                    "interface with ifname {:?} already exists",
                    req.ifname
                )));
            }
            self.check_ifname_available(&req.ifname).await?;
            recreate_old = Some(iface.ifname.clone());
            iface.ifname = req.ifname.clone();
            needs_regeneration = true;
        }

        if let Some(vrf_name) = req.vrf_name {
            if vrf_name != iface.vrf_name {
                // Every owned server network must fit into the target VRF.
                for server in &iface.servers {
                    for family in [wgpanel_types::IpFamily::V4, wgpanel_types::IpFamily::V6] {
                        if let Some(network) = server.network(family) {
                            self.store.check_network_overlaps_in_vrf(
                                vrf_name.as_deref(),
                                Some(id),
                                None,
                                network,
                            )?;
                        }
                    }
                }
                iface.vrf_name = vrf_name;
                needs_regeneration = true;
            }
        }

        if let Some(fw_mark) = req.fw_mark {
            if iface.fw_mark.as_deref() != Some(fw_mark.as_str()) {
                iface.fw_mark = Some(fw_mark);
                needs_regeneration = true;
            }
        }

        if !req.endpoint.is_empty() && req.endpoint != iface.endpoint {
            iface.endpoint = sanitize::validate_endpoint(&req.endpoint)?;
        }

        if req.port > 0 && req.port != iface.port {
            netinfo::udp_port_available(req.port)?;
            iface.port = req.port;
            needs_regeneration = true;
        }

        if req.mtu > 0 && req.mtu != iface.mtu {
            iface.mtu = req.mtu;
            needs_regeneration = true;
            needs_mtu_update = true;
        }

        if !req.private_key.is_empty() && req.private_key != iface.private_key {
            iface.public_key = keys::private_to_public(&req.private_key)?;
            iface.private_key = req.private_key.clone();
            needs_regeneration = true;
        }

        self.store.set_interface(iface.clone());
        self.store.save().await?;

        match &recreate_old {
            None => {
                if needs_regeneration {
                    self.wg.sync_conf(&iface).await?;
                }
                if needs_mtu_update && iface.enabled {
                    self.wg.set_mtu(&iface.ifname, iface.mtu).await?;
                }
            }
            Some(old_ifname) => {
                // Rename: bring the old device down with its old identity,
                // drop the old config, render the new one.
                self.wg
                    .sync_to_interface(old_ifname, false, &old_private_key)
                    .await?;
                self.wg.remove_config(old_ifname).await?;
                self.wg.sync_conf(&iface).await?;
            }
        }

        if iface.enabled {
            self.wg
                .sync_to_interface(&iface.ifname, true, &iface.private_key)
                .await?;
        }

        self.store.sync_to_internal_service().await;
        info!(id = %iface.id, ifname = %iface.ifname, "updated interface");
        Ok(sanitized(iface))
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), ServiceError> {
        let mut iface = self
            .store
            .get_interface(id)
            .ok_or(ServiceError::InterfaceNotFound)?;
        info!(id, ifname = %iface.ifname, enabled, "setting interface enabled state");

        iface.enabled = enabled;
        self.store.set_interface(iface.clone());
        self.store.save().await?;

        self.wg.sync_conf(&iface).await?;
        self.wg
            .sync_to_interface(&iface.ifname, enabled, &iface.private_key)
            .await?;

        self.store.sync_to_internal_service().await;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<(), ServiceError> {
        let iface = self
            .store
            .get_interface(id)
            .ok_or(ServiceError::InterfaceNotFound)?;
        info!(id, ifname = %iface.ifname, "deleting interface");

        if let Err(e) = self
            .wg
            .sync_to_interface(&iface.ifname, false, &iface.private_key)
            .await
        {
            // Best effort: a missing or foreign link must not wedge the
            // document delete.
            warn!(ifname = %iface.ifname, error = %e, "failed to bring interface down");
        }
        self.wg.remove_config(&iface.ifname).await?;

        self.store.delete_interface(id);
        self.store.save().await?;
        self.store.sync_to_internal_service().await;
        Ok(())
    }

    /// The name must be free in the OS and in the config directory.
    async fn check_ifname_available(&self, ifname: &str) -> Result<(), ServiceError> {
        if netinfo::link_exists(ifname) {
            return Err(ServiceError::validation(format!(
                "interface {ifname:?} already exists in OS"
            )));
        }
        if self.wg.conf_exists(ifname).await {
            return Err(ServiceError::validation(format!(
                "WireGuard config file for {ifname:?} already exists"
            )));
        }
        Ok(())
    }
}

/// Copy handed to callers: the private key never leaves the store.
fn sanitized(mut iface: Interface) -> Interface {
    iface.private_key = String::new();
    iface
}
