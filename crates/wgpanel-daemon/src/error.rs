use wgpanel_types::CidrError;

use crate::command::CommandError;
use crate::keys::KeyError;
use crate::netinfo::NetError;
use crate::sanitize::NameError;

/// Error surface of the document write path. Validation variants map to the
/// caller's 400/404/409 equivalents; the rest are I/O or kernel trouble.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("interface not found")]
    InterfaceNotFound,

    #[error("server not found")]
    ServerNotFound,

    #[error("client not found")]
    ClientNotFound,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("network overlap: {0}")]
    NetworkOverlap(String),

    #[error("address conflict: {0}")]
    AddressConflict(String),

    #[error("no available addresses in this network")]
    NetworkFull,

    #[error(transparent)]
    Name(#[from] NameError),

    #[error(transparent)]
    Cidr(#[from] CidrError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize document: {0}")]
    Persist(#[from] serde_json::Error),
}

impl ServiceError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ServiceError::Validation(msg.into())
    }
}
