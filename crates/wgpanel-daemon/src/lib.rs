//! wgpanel-daemon: the control-plane core of the wgpanel WireGuard
//! management service.
//!
//! The document store ([`store::Store`]) holds the desired state
//! (interfaces → servers → clients); the service modules translate
//! mutations into ordered host changes (WireGuard config sync, netfilter
//! rules, address assignment) and publish snapshots to the two live
//! engines: the pseudo-bridge responder ([`bridge`]) and the SNAT roaming
//! engine ([`roaming`]).

pub mod bridge;
pub mod clients;
pub mod command;
pub mod error;
pub mod firewall;
pub mod fsutil;
pub mod interfaces;
pub mod keys;
pub mod netinfo;
pub mod roaming;
pub mod sanitize;
pub mod servers;
pub mod startup;
pub mod store;
pub mod wg;
