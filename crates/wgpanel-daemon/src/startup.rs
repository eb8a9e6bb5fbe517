//! Boot and shutdown orchestration: the initial reconcile that brings
//! enabled interfaces and their firewall state up, system prerequisite
//! checks (warnings only), and the best-effort teardown that sweeps every
//! rule tagged with the panel identifier.

use tracing::{error, info, warn};
use wgpanel_types::IpFamily;

use crate::command::{run, run_with_output};
use crate::firewall::{self, RuleFamily};
use crate::store::Store;
use crate::wg::WgService;

/// Bring every enabled interface with enabled servers up and apply its
/// firewall state. Per-interface failures are logged and skipped; boot
/// continues.
pub async fn initialize_interfaces(store: &Store, wg: &WgService) {
    let interfaces = store.interfaces();
    if interfaces.is_empty() {
        info!("no interfaces configured, skipping initialization");
        return;
    }
    info!(count = interfaces.len(), "initializing WireGuard interfaces");

    for iface in interfaces {
        if !iface.enabled {
            continue;
        }
        if !iface.servers.iter().any(|s| s.enabled) {
            info!(ifname = %iface.ifname, "no enabled servers, skipping");
            continue;
        }

        if let Err(e) = wg.sync_to_conf_and_interface(&iface).await {
            error!(ifname = %iface.ifname, error = %e, "failed to initialize interface");
            continue;
        }

        for server in iface.servers.iter().filter(|s| s.enabled) {
            for config in [server.ipv4.as_ref(), server.ipv6.as_ref()]
                .into_iter()
                .flatten()
                .filter(|c| c.enabled)
            {
                if let Err(e) = firewall::apply_server_config(&iface.ifname, config).await {
                    error!(
                        ifname = %iface.ifname,
                        server = %server.name,
                        error = %e,
                        "failed to apply firewall rules"
                    );
                }
            }
        }
        info!(ifname = %iface.ifname, "initialized interface");
    }
}

/// Remove rules left behind by previous runs: everything whose comment
/// begins with the panel identifier, both families, all tables.
pub async fn cleanup_orphaned_rules(store: &Store) {
    let panel_id = store.panel_id();
    if panel_id.is_empty() {
        return;
    }
    info!(panel_id, "sweeping rules from previous runs");
    if let Err(e) = firewall::cleanup_rules(&panel_id, RuleFamily::Both, None, true).await {
        warn!(error = %e, "orphaned rule cleanup failed");
    }
}

/// Graceful shutdown: bring every enabled interface down, then sweep all
/// rules tagged with the panel identifier. Everything is best-effort.
pub async fn shutdown_cleanup(store: &Store, wg: &WgService) {
    info!("performing cleanup before shutdown");

    for iface in store.interfaces() {
        if !iface.enabled {
            continue;
        }
        if let Err(e) = wg
            .sync_to_interface(&iface.ifname, false, &iface.private_key)
            .await
        {
            warn!(ifname = %iface.ifname, error = %e, "failed to bring interface down");
        }
    }

    let panel_id = store.panel_id();
    if !panel_id.is_empty() {
        if let Err(e) = firewall::cleanup_rules(&panel_id, RuleFamily::Both, None, true).await {
            warn!(error = %e, "rule sweep failed during shutdown");
        }
    }
    info!("cleanup complete");
}

/// System prerequisite checks. Violations are reported as warnings and do
/// not prevent boot.
pub async fn system_checks() -> Vec<String> {
    let mut warnings = Vec::new();

    check_forwarding(&mut warnings).await;
    check_required_tools(&mut warnings).await;
    check_forward_policies(&mut warnings).await;

    for warning in &warnings {
        warn!("system check: {warning}");
    }
    warnings
}

async fn check_forwarding(warnings: &mut Vec<String>) {
    for (path, sysctl) in [
        ("/proc/sys/net/ipv4/ip_forward", "net.ipv4.ip_forward"),
        (
            "/proc/sys/net/ipv6/conf/all/forwarding",
            "net.ipv6.conf.all.forwarding",
        ),
    ] {
        match tokio::fs::read_to_string(path).await {
            Ok(value) if value.trim() == "1" => {}
            Ok(_) => warnings.push(format!(
                "forwarding is disabled; enable with: sysctl -w {sysctl}=1"
            )),
            Err(_) => warnings.push(format!("unable to check {path}")),
        }
    }
}

async fn check_required_tools(warnings: &mut Vec<String>) {
    for tool in [
        "ip",
        "wg",
        "wg-quick",
        "iptables",
        "ip6tables",
        "iptables-save",
        "ip6tables-save",
    ] {
        if run("which", &[tool]).await.is_err() {
            warnings.push(format!("{tool} not found in PATH"));
        }
    }
}

async fn check_forward_policies(warnings: &mut Vec<String>) {
    for family in [IpFamily::V4, IpFamily::V6] {
        let cmd = firewall::iptables_cmd(family);
        match run_with_output(cmd, &["-L", "FORWARD", "-n"]).await {
            Ok(output) => {
                let first_line = output.lines().next().unwrap_or_default();
                if !first_line.contains("policy ACCEPT") {
                    warnings.push(format!(
                        "{cmd} FORWARD chain policy is not ACCEPT; forwarded tunnel traffic \
                         may be dropped"
                    ));
                }
            }
            Err(_) => warnings.push(format!("unable to check {cmd} FORWARD policy")),
        }
    }
}
