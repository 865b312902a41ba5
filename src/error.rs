use std::net::Ipv4Addr;

/// Hard failures of role activation.
///
/// Per-attempt probe failures never show up here: they are recorded as
/// [`ProbeStatus`](crate::types::ProbeStatus) values and absorbed by the scanner.
#[derive(thiserror::Error, Debug)]
pub enum RoleError {
    /// Another machine already serves the database on the LAN.
    #[error("conflicting database server already active at {address}")]
    RoleConflict { address: Ipv4Addr },

    /// A client was asked to connect to a loopback, local-only or own address.
    #[error("invalid client target: {address}")]
    InvalidTarget { address: String },

    /// No local engine accepted any administrative credential.
    #[error("no local database engine reachable with any administrative credential")]
    EngineUnavailable,

    /// The engine authenticated but rejected an administrative statement.
    #[error("database engine error: {0}")]
    Engine(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<tokio_postgres::Error> for RoleError {
    fn from(e: tokio_postgres::Error) -> Self {
        RoleError::Engine(e.to_string())
    }
}

pub type RoleResult<T> = std::result::Result<T, RoleError>;
