//! wgpanel-types: shared data model and address algebra for the wgpanel
//! control plane.
//!
//! This crate holds the persisted document tree (interfaces → servers →
//! clients) and the [`cidr::HostNet`] address algebra both the daemon
//! services and the kernel-facing engines are built on.

pub mod cidr;
pub mod models;

pub use cidr::{CidrError, HostNet, IpFamily};
pub use models::{
    Client, Document, Interface, LogLevel, PeerState, ResponderNetworks, Server,
    ServerNetworkConfig, Session, SnatConfig,
};
