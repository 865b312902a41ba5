//! Library crate for lan-role-rs: LAN discovery of a shared PostgreSQL
//! server and negotiation of this machine's role (client, server or offline).
pub mod activator;
pub mod engine;
pub mod error;
pub mod negotiator;
pub mod netdetect;
pub mod octets;
pub mod pgconf;
pub mod prober;
pub mod scanner;
pub mod settings;
pub mod types;

pub use error::{RoleError, RoleResult};
pub use negotiator::{bootstrap, Negotiator};
pub use settings::Settings;
pub use types::{ClientConfig, Credential, Mode, OfflineConfig, RoleConfig, ServerConfig};
