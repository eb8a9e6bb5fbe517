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

//! The netfilter rule engine.
//!
//! Rule strings are generated deterministically per `(interface, network
//! config, family)`, always tagged with `-m comment --comment <token>` as
//! the last match. The comment is the rule's identity: adds are made
//! idempotent with an `iptables -C` probe, and removal parses the saved
//! ruleset and deletes exactly the lines carrying the comment. The engine
//! never edits a rule in place.

use tracing::{info, warn};
use wgpanel_types::{IpFamily, ServerNetworkConfig};

use crate::command::{run, run_ignore_error, run_with_output, CommandError};
use crate::error::ServiceError;

/// Which rulesets an operation targets. `Both` runs the v4 and v6 pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleFamily {
    V4,
    V6,
    Both,
}

impl From<IpFamily> for RuleFamily {
    fn from(family: IpFamily) -> Self {
        match family {
            IpFamily::V4 => RuleFamily::V4,
            IpFamily::V6 => RuleFamily::V6,
        }
    }
}

impl RuleFamily {
    fn passes(self) -> &'static [IpFamily] {
        match self {
            RuleFamily::V4 => &[IpFamily::V4],
            RuleFamily::V6 => &[IpFamily::V6],
            RuleFamily::Both => &[IpFamily::V4, IpFamily::V6],
        }
    }
}

pub fn iptables_cmd(family: IpFamily) -> &'static str {
    match family {
        IpFamily::V4 => "iptables",
        IpFamily::V6 => "ip6tables",
    }
}

fn comment_args(comment: &str) -> [String; 4] {
    [
        "-m".into(),
        "comment".into(),
        "--comment".into(),
        comment.into(),
    ]
}

/// The `! -d <net>` destination exclusion, if any. The excluded network
/// defaults to the server's own network; an explicit zero network disables
/// the exclusion entirely.
fn excluded_destination(config: &ServerNetworkConfig) -> Option<String> {
    let network = config.network.as_ref()?;
    let snat = config.snat.as_ref()?;
    match &snat.snat_excluded_network {
        None => Some(network.network_str()),
        Some(excluded) if excluded.is_zero_host() => None,
        Some(excluded) => Some(excluded.network_str()),
    }
}

/// SNAT/NETMAP rule argument vectors (no binary name) for a non-roaming
/// config. Roaming configs yield nothing here; the roaming engine owns
/// their rules and substitutes the discovered master address.
pub fn snat_rule_args(config: &ServerNetworkConfig) -> Vec<Vec<String>> {
    let (Some(network), Some(snat)) = (config.network.as_ref(), config.snat.as_ref()) else {
        return vec![];
    };
    if !snat.enabled || snat.is_roaming() {
        return vec![];
    }

    let source = network.network_str();
    let comment = &config.comment_string;
    let excluded = excluded_destination(config);

    let postrouting = |jump: &[String]| -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-t".into(),
            "nat".into(),
            "-A".into(),
            "POSTROUTING".into(),
            "-s".into(),
            source.clone(),
        ];
        if let Some(excluded) = &excluded {
            args.extend(["!".into(), "-d".into(), excluded.clone()]);
        }
        args.extend_from_slice(jump);
        args.extend(comment_args(comment));
        args
    };

    match &snat.snat_ip_net {
        None => {
            vec![postrouting(&["-j".into(), "MASQUERADE".into()])]
        }
        Some(snat_ip) if snat_ip.prefix() == network.family().bits() => {
            if snat_ip.is_zero_host() {
                // Zero address means roaming; nothing to emit statically.
                return vec![];
            }
            vec![postrouting(&[
                "-j".into(),
                "SNAT".into(),
                "--to-source".into(),
                snat_ip.addr().to_string(),
            ])]
        }
        Some(snat_ip) => {
            if network.family() != IpFamily::V6 {
                // v4 NETMAP is unsupported; validation rejects it upstream.
                return vec![];
            }
            let target = snat_ip.network_str();
            let forward = postrouting(&[
                "-j".into(),
                "NETMAP".into(),
                "--to".into(),
                target.clone(),
            ]);
            let mut reverse: Vec<String> = vec![
                "-t".into(),
                "nat".into(),
                "-A".into(),
                "PREROUTING".into(),
                "-d".into(),
                target,
                "-j".into(),
                "NETMAP".into(),
                "--to".into(),
                source,
            ];
            reverse.extend(comment_args(comment));
            vec![forward, reverse]
        }
    }
}

/// FORWARD-chain argument vectors implementing the routed-networks policy:
/// one ACCEPT per routed destination, then a terminal REJECT. An allow-all
/// routed network (`0.0.0.0/0` / `::/0`) suppresses the whole set.
pub fn routed_rule_args(ifname: &str, config: &ServerNetworkConfig) -> Vec<Vec<String>> {
    let Some(network) = config.network.as_ref() else {
        return vec![];
    };
    if config.routed_networks.is_empty() {
        return vec![];
    }

    let allow_all = config
        .routed_networks
        .iter()
        .any(|net| net.prefix() == 0 && net.family() == network.family());
    if allow_all {
        return vec![];
    }

    let source = network.network_str();
    let comment = &config.comment_string;
    let mut rules = Vec::new();
    for routed in &config.routed_networks {
        let mut args: Vec<String> = vec![
            "-A".into(),
            "FORWARD".into(),
            "-i".into(),
            ifname.into(),
            "-s".into(),
            source.clone(),
            "-d".into(),
            routed.network_str(),
            "-j".into(),
            "ACCEPT".into(),
        ];
        args.extend(comment_args(comment));
        rules.push(args);
    }
    let mut reject: Vec<String> = vec![
        "-A".into(),
        "FORWARD".into(),
        "-i".into(),
        ifname.into(),
        "-s".into(),
        source,
        "-j".into(),
        "REJECT".into(),
    ];
    reject.extend(comment_args(comment));
    rules.push(reject);
    rules
}

/// Full command strings (binary included) for a server network config, in
/// apply order. These are what PostUp lines carry, so `wg-quick up` alone
/// reproduces the rule state.
pub fn server_rules(ifname: &str, config: &ServerNetworkConfig) -> Vec<String> {
    if !config.enabled {
        return vec![];
    }
    let Some(family) = config.family() else {
        return vec![];
    };
    let cmd = iptables_cmd(family);

    let mut rules = Vec::new();
    for args in snat_rule_args(config) {
        rules.push(format!("{cmd} {}", args.join(" ")));
    }
    if config.routed_networks_firewall {
        for args in routed_rule_args(ifname, config) {
            rules.push(format!("{cmd} {}", args.join(" ")));
        }
    }
    rules
}

/// A self-contained shell line deleting every rule tagged with `comment`,
/// for PreDown: pipes the saved ruleset through awk and re-invokes iptables
/// with `-t <table> -D` per match.
pub fn cleanup_shell_line(comment: &str, family: IpFamily) -> String {
    let cmd = iptables_cmd(family);
    format!(
        r#"{cmd}-save | awk -v c="-m comment --comment {comment}" '/^\*/{{t=substr($1,2);next}} c && index($0,c){{sub(/^-A /,"",$0);system("{cmd} -t " t " -D " $0)}}'"#
    )
}

/// Extract the `-t <table> -D …` argument vectors that would delete every
/// `-A` line of `saved` carrying `comment`. Pure text processing so the
/// matching rules are testable without a kernel.
///
/// Without `match_prefix` the comment must be the whole token (followed by
/// a space or the end of line); with it, any comment beginning with
/// `comment` matches. `tables` constrains the sweep when supplied.
pub fn cleanup_commands(
    saved: &str,
    comment: &str,
    match_prefix: bool,
    tables: Option<&[&str]>,
) -> Vec<Vec<String>> {
    let needle = format!("-m comment --comment {comment}");
    let mut commands = Vec::new();
    let mut current_table = "";

    for line in saved.lines() {
        if let Some(table) = line.strip_prefix('*') {
            current_table = table.trim();
            continue;
        }
        if let Some(tables) = tables {
            if !tables.contains(&current_table) {
                continue;
            }
        }
        let matched = if match_prefix {
            line.contains(&needle)
        } else {
            line.contains(&format!("{needle} ")) || line.ends_with(&needle)
        };
        if !matched {
            continue;
        }
        let Some(rest) = line.strip_prefix("-A ") else {
            continue;
        };
        let mut args: Vec<String> = vec!["-t".into(), current_table.into(), "-D".into()];
        args.extend(rest.split_whitespace().map(String::from));
        commands.push(args);
    }
    commands
}

/// Remove every rule tagged with `comment` by re-reading the saved ruleset
/// and deleting the matches. Tolerates concurrent edits: each pass works on
/// a fresh `iptables-save` snapshot.
pub async fn cleanup_rules(
    comment: &str,
    family: RuleFamily,
    tables: Option<&[&str]>,
    match_prefix: bool,
) -> Result<(), ServiceError> {
    if comment.is_empty() {
        return Err(ServiceError::validation("cleanup comment cannot be empty"));
    }

    let mut last_err = None;
    for &pass in family.passes() {
        let cmd = iptables_cmd(pass);
        let saved = run_with_output(&format!("{cmd}-save"), &[]).await?;
        let commands = cleanup_commands(&saved, comment, match_prefix, tables);
        let removed = commands.len();

        for args in commands {
            let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
            info!(command = cmd, args = %args.join(" "), "removing firewall rule");
            if let Err(e) = run(cmd, &arg_refs).await {
                warn!(error = %e, "failed to remove firewall rule");
                last_err = Some(e);
            }
        }
        if removed > 0 {
            info!(comment, family = ?pass, removed, "cleaned up firewall rules");
        }
    }

    match last_err {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

/// Rewrite an `-A` argument vector into the `-C` probe for the same rule,
/// with the `-t <table>` pair moved to the front.
pub(crate) fn check_args(args: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(args.len());
    let table_pos = args.iter().position(|a| a == "-t");
    if let Some(pos) = table_pos {
        if pos + 1 < args.len() {
            out.push(args[pos].clone());
            out.push(args[pos + 1].clone());
        }
    }
    let mut replaced = false;
    for (i, arg) in args.iter().enumerate() {
        if let Some(pos) = table_pos {
            if i == pos || i == pos + 1 {
                continue;
            }
        }
        if !replaced && arg == "-A" {
            out.push("-C".into());
            replaced = true;
            continue;
        }
        out.push(arg.clone());
    }
    out
}

/// Probe whether a rule exists. `iptables -C` exits 1 when the rule is
/// absent; anything other than 0/1 (or a spawn failure) is a real error.
async fn rule_exists(cmd: &str, args: &[String]) -> Result<bool, CommandError> {
    let check = check_args(args);
    let check_refs: Vec<&str> = check.iter().map(String::as_str).collect();
    match run(cmd, &check_refs).await {
        Ok(()) => Ok(true),
        Err(e) if e.exit_code == Some(1) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Idempotent add: probe with `-C`, insert with `-A` only when absent.
pub async fn add_rule_if_missing(cmd: &str, args: &[String]) -> Result<(), ServiceError> {
    if rule_exists(cmd, args).await? {
        return Ok(());
    }
    info!(command = cmd, args = %args.join(" "), "adding firewall rule");
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    run(cmd, &arg_refs).await?;
    Ok(())
}

/// Apply the non-roaming SNAT/NETMAP rules of a config.
pub async fn apply_snat_rules(config: &ServerNetworkConfig) -> Result<(), ServiceError> {
    let Some(family) = config.family() else {
        return Ok(());
    };
    let cmd = iptables_cmd(family);
    for args in snat_rule_args(config) {
        add_rule_if_missing(cmd, &args).await?;
    }
    Ok(())
}

/// Remove a config's SNAT/NETMAP rules by comment, constrained to the nat
/// table so roaming churn never disturbs FORWARD policy rules.
pub async fn remove_snat_rules(family: IpFamily, comment: &str) -> Result<(), ServiceError> {
    cleanup_rules(comment, family.into(), Some(&["nat"]), false).await
}

/// Bring a server network config live on an interface: assign the tunnel
/// address, then the SNAT and routed-network rules.
pub async fn apply_server_config(
    ifname: &str,
    config: &ServerNetworkConfig,
) -> Result<(), ServiceError> {
    if !config.enabled {
        return Ok(());
    }
    info!(ifname, comment = %config.comment_string, "applying firewall state");

    if let Some(network) = &config.network {
        ensure_address(ifname, &network.to_string()).await?;
    }

    if config
        .snat
        .as_ref()
        .is_some_and(|s| s.enabled && !s.is_roaming())
    {
        apply_snat_rules(config).await?;
    }

    if config.routed_networks_firewall && !config.routed_networks.is_empty() {
        let Some(family) = config.family() else {
            return Ok(());
        };
        let cmd = iptables_cmd(family);
        for args in routed_rule_args(ifname, config) {
            add_rule_if_missing(cmd, &args).await?;
        }
    }
    Ok(())
}

/// Tear down a config's address and every rule carrying its comment.
/// Best-effort: the next reconcile or restart re-converges.
pub async fn remove_server_config(ifname: &str, config: &ServerNetworkConfig) {
    if !config.enabled {
        return;
    }
    info!(ifname, comment = %config.comment_string, "removing firewall state");

    if let Some(network) = &config.network {
        remove_address(ifname, &network.to_string()).await;
    }
    let Some(family) = config.family() else {
        return;
    };
    if let Err(e) = cleanup_rules(&config.comment_string, family.into(), None, false).await {
        warn!(error = %e, "failed to remove firewall rules");
    }
}

async fn address_present(ifname: &str, addr: &str) -> Result<bool, CommandError> {
    match run_with_output("ip", &["addr", "show", "dev", ifname]).await {
        Ok(output) => Ok(output.contains(addr)),
        Err(e)
            if e.stderr.contains("does not exist") || e.stderr.contains("Device not found") =>
        {
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Assign `addr` to `ifname` unless it is already present.
pub async fn ensure_address(ifname: &str, addr: &str) -> Result<(), ServiceError> {
    if address_present(ifname, addr).await? {
        return Ok(());
    }
    info!(ifname, addr, "assigning address");
    run("ip", &["addr", "add", addr, "dev", ifname]).await?;
    Ok(())
}

/// Remove `addr` from `ifname` if present; errors are ignored.
pub async fn remove_address(ifname: &str, addr: &str) {
    match address_present(ifname, addr).await {
        Ok(true) => {
            info!(ifname, addr, "removing address");
            run_ignore_error("ip", &["addr", "del", addr, "dev", ifname]).await;
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wgpanel_types::SnatConfig;

    fn config(network: &str, snat: Option<SnatConfig>) -> ServerNetworkConfig {
        ServerNetworkConfig {
            enabled: true,
            network: Some(network.parse().unwrap()),
            pseudo_bridge_master_interface: None,
            snat,
            routed_networks: vec![],
            routed_networks_firewall: false,
            comment_string: "p4n3l--v4-abcdefghijkl".into(),
        }
    }

    fn snat(ip: Option<&str>, excluded: Option<&str>) -> SnatConfig {
        SnatConfig {
            enabled: true,
            snat_ip_net: ip.map(|s| s.parse().unwrap()),
            snat_excluded_network: excluded.map(|s| s.parse().unwrap()),
            roaming_master_interface: None,
            roaming_pseudo_bridge: false,
        }
    }

    fn joined(rules: Vec<Vec<String>>) -> Vec<String> {
        rules.into_iter().map(|args| args.join(" ")).collect()
    }

    #[test]
    fn masquerade_rule() {
        let cfg = config("10.8.0.1/24", Some(snat(None, None)));
        assert_eq!(
            joined(snat_rule_args(&cfg)),
            vec![
                "-t nat -A POSTROUTING -s 10.8.0.0/24 ! -d 10.8.0.0/24 -j MASQUERADE \
                 -m comment --comment p4n3l--v4-abcdefghijkl"
            ]
        );
    }

    #[test]
    fn zero_exclusion_is_omitted() {
        let cfg = config("10.8.0.1/24", Some(snat(None, Some("0.0.0.0/32"))));
        assert_eq!(
            joined(snat_rule_args(&cfg)),
            vec![
                "-t nat -A POSTROUTING -s 10.8.0.0/24 -j MASQUERADE \
                 -m comment --comment p4n3l--v4-abcdefghijkl"
            ]
        );
    }

    #[test]
    fn static_snat_rule() {
        let cfg = config(
            "10.8.0.1/24",
            Some(snat(Some("198.51.100.7/32"), Some("10.0.0.0/8"))),
        );
        assert_eq!(
            joined(snat_rule_args(&cfg)),
            vec![
                "-t nat -A POSTROUTING -s 10.8.0.0/24 ! -d 10.0.0.0/8 -j SNAT \
                 --to-source 198.51.100.7 -m comment --comment p4n3l--v4-abcdefghijkl"
            ]
        );
    }

    #[test]
    fn v6_netmap_emits_forward_and_reverse() {
        let cfg = config(
            "2001:db8:1::1/64",
            Some(snat(Some("2001:db8:f::/64"), Some("::/128"))),
        );
        let rules = joined(snat_rule_args(&cfg));
        assert_eq!(
            rules,
            vec![
                "-t nat -A POSTROUTING -s 2001:db8:1::/64 -j NETMAP --to 2001:db8:f::/64 \
                 -m comment --comment p4n3l--v4-abcdefghijkl",
                "-t nat -A PREROUTING -d 2001:db8:f::/64 -j NETMAP --to 2001:db8:1::/64 \
                 -m comment --comment p4n3l--v4-abcdefghijkl",
            ]
        );
    }

    #[test]
    fn roaming_config_emits_nothing_statically() {
        let mut roaming = snat(Some("0.0.0.0/32"), None);
        roaming.roaming_master_interface = Some("eth0".into());
        let cfg = config("10.8.0.1/24", Some(roaming));
        assert!(snat_rule_args(&cfg).is_empty());
        assert!(server_rules("wg-a", &cfg).is_empty());
    }

    #[test]
    fn v4_netmap_is_not_generated() {
        let cfg = config("10.8.0.1/24", Some(snat(Some("198.51.100.0/24"), None)));
        assert!(snat_rule_args(&cfg).is_empty());
    }

    #[test]
    fn routed_networks_accept_then_reject() {
        let mut cfg = config("10.8.0.1/24", None);
        cfg.routed_networks_firewall = true;
        cfg.routed_networks = vec![
            "10.8.0.0/24".parse().unwrap(),
            "192.168.1.0/24".parse().unwrap(),
        ];
        let rules = joined(routed_rule_args("wg-a", &cfg));
        assert_eq!(rules.len(), 3);
        assert!(rules[0].starts_with("-A FORWARD -i wg-a -s 10.8.0.0/24 -d 10.8.0.0/24 -j ACCEPT"));
        assert!(rules[1].contains("-d 192.168.1.0/24 -j ACCEPT"));
        assert!(rules[2].starts_with("-A FORWARD -i wg-a -s 10.8.0.0/24 -j REJECT"));
        assert!(rules.iter().all(|r| r.ends_with("p4n3l--v4-abcdefghijkl")));
    }

    #[test]
    fn allow_all_routed_network_suppresses_firewall() {
        let mut cfg = config("10.8.0.1/24", None);
        cfg.routed_networks_firewall = true;
        cfg.routed_networks = vec!["0.0.0.0/0".parse().unwrap()];
        assert!(routed_rule_args("wg-a", &cfg).is_empty());
    }

    #[test]
    fn server_rules_prefix_the_binary() {
        let mut cfg = config("10.8.0.1/24", Some(snat(None, None)));
        cfg.routed_networks_firewall = true;
        cfg.routed_networks = vec!["10.8.0.0/24".parse().unwrap()];
        let rules = server_rules("wg-a", &cfg);
        assert_eq!(rules.len(), 3);
        assert!(rules.iter().all(|r| r.starts_with("iptables ")));

        cfg.enabled = false;
        assert!(server_rules("wg-a", &cfg).is_empty());
    }

    const SAVED: &str = "\
# Generated by iptables-save\n\
*filter\n\
:FORWARD ACCEPT [0:0]\n\
-A FORWARD -i wg-a -s 10.8.0.0/24 -j REJECT -m comment --comment p4n3l--v4-abcdefghijkl\n\
-A FORWARD -i wg-b -s 10.9.0.0/24 -j REJECT -m comment --comment other--v4-zzzzzzzzzzzz\n\
COMMIT\n\
*nat\n\
:POSTROUTING ACCEPT [0:0]\n\
-A POSTROUTING -s 10.8.0.0/24 -j MASQUERADE -m comment --comment p4n3l--v4-abcdefghijkl\n\
-A POSTROUTING -s 10.9.0.0/24 -j MASQUERADE -m comment --comment p4n3l--v4-abcdefghijklmore\n\
COMMIT\n";

    #[test]
    fn cleanup_matches_exact_comment_only() {
        let commands = cleanup_commands(SAVED, "p4n3l--v4-abcdefghijkl", false, None);
        assert_eq!(commands.len(), 2);
        assert_eq!(
            commands[0][..4],
            ["-t", "filter", "-D", "FORWARD"].map(String::from)
        );
        assert_eq!(
            commands[1][..4],
            ["-t", "nat", "-D", "POSTROUTING"].map(String::from)
        );
        // The longer comment sharing the prefix is untouched.
        assert!(commands
            .iter()
            .all(|c| !c.join(" ").contains("abcdefghijklmore")));
    }

    #[test]
    fn cleanup_prefix_match_sweeps_the_panel() {
        let commands = cleanup_commands(SAVED, "p4n3l--", true, None);
        assert_eq!(commands.len(), 3);
        // The unrelated comment survives even a prefix sweep.
        assert!(commands.iter().all(|c| !c.join(" ").contains("other--")));
    }

    #[test]
    fn cleanup_respects_table_constraint() {
        let commands = cleanup_commands(SAVED, "p4n3l--v4-abcdefghijkl", false, Some(&["nat"]));
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0][1], "nat");
    }

    #[test]
    fn check_args_moves_table_to_front() {
        let args: Vec<String> = ["-t", "nat", "-A", "POSTROUTING", "-j", "MASQUERADE"]
            .map(String::from)
            .to_vec();
        assert_eq!(
            check_args(&args),
            ["-t", "nat", "-C", "POSTROUTING", "-j", "MASQUERADE"].map(String::from)
        );

        let args: Vec<String> = ["-A", "FORWARD", "-j", "ACCEPT"].map(String::from).to_vec();
        assert_eq!(
            check_args(&args),
            ["-C", "FORWARD", "-j", "ACCEPT"].map(String::from)
        );
    }

    #[test]
    fn cleanup_shell_line_embeds_comment_and_binary() {
        let line = cleanup_shell_line("p4n3l--v4-abcdefghijkl", IpFamily::V6);
        assert!(line.starts_with("ip6tables-save | awk"));
        assert!(line.contains("-m comment --comment p4n3l--v4-abcdefghijkl"));
        assert!(line.contains(r#"system("ip6tables -t " t " -D " $0)"#));
    }
}
