//! Administrative access to the database engine running on this machine.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio_postgres::Client;
use tracing::{debug, info};

use crate::error::{RoleError, RoleResult};
use crate::prober::open_session;
use crate::types::Credential;

/// On-disk configuration files of the engine, as reported by the engine itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfigPaths {
    /// Host-based access control file (`pg_hba.conf`).
    pub access_file: PathBuf,
    /// Main settings file (`postgresql.conf`).
    pub settings_file: PathBuf,
}

/// The engine on loopback, seen through its administrative interface.
#[async_trait]
pub trait LocalEngine: Send + Sync {
    /// First credential that opens a session on loopback, if any.
    async fn detect(&self, candidates: &[Credential]) -> Option<Credential>;

    /// Open an administrative session. Fails when the credential is rejected.
    async fn admin_session(&self, credential: &Credential) -> RoleResult<Box<dyn AdminSession>>;
}

/// Statements the server activator issues over an administrative session.
#[async_trait]
pub trait AdminSession: Send {
    /// Create `name` if missing. Returns `true` when it was created.
    async fn ensure_database(&mut self, name: &str) -> RoleResult<bool>;

    /// Create the login role, or reset its password when it exists.
    async fn ensure_role(&mut self, credential: &Credential) -> RoleResult<()>;

    async fn grant_all(&mut self, database: &str, username: &str) -> RoleResult<()>;

    async fn config_paths(&mut self) -> RoleResult<EngineConfigPaths>;

    /// Ask the engine to re-read its configuration files.
    async fn reload(&mut self) -> RoleResult<()>;
}

/// PostgreSQL on `127.0.0.1:<port>`.
#[derive(Debug, Clone)]
pub struct PgEngine {
    port: u16,
    maintenance_db: String,
    timeout: Duration,
}

impl PgEngine {
    pub fn new(port: u16, maintenance_db: impl Into<String>, timeout: Duration) -> Self {
        Self {
            port,
            maintenance_db: maintenance_db.into(),
            timeout,
        }
    }
}

#[async_trait]
impl LocalEngine for PgEngine {
    async fn detect(&self, candidates: &[Credential]) -> Option<Credential> {
        for credential in candidates {
            match open_session(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                self.port,
                credential,
                &self.maintenance_db,
                self.timeout,
            )
            .await
            {
                Ok(_client) => {
                    info!(user = %credential.username, port = self.port, "local database engine detected");
                    return Some(credential.clone());
                }
                Err(e) => debug!(user = %credential.username, error = %e, "local engine rejected credential"),
            }
        }
        None
    }

    async fn admin_session(&self, credential: &Credential) -> RoleResult<Box<dyn AdminSession>> {
        let client = open_session(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            self.port,
            credential,
            &self.maintenance_db,
            self.timeout,
        )
        .await
        .map_err(|e| RoleError::Engine(e.to_string()))?;
        Ok(Box::new(PgAdminSession { client }))
    }
}

struct PgAdminSession {
    client: Client,
}

#[async_trait]
impl AdminSession for PgAdminSession {
    async fn ensure_database(&mut self, name: &str) -> RoleResult<bool> {
        let exists = self
            .client
            .query_opt("SELECT 1 FROM pg_database WHERE datname = $1", &[&name])
            .await?
            .is_some();
        if exists {
            return Ok(false);
        }
        // DDL does not take bind parameters.
        self.client
            .batch_execute(&format!("CREATE DATABASE {}", quote_ident(name)))
            .await?;
        Ok(true)
    }

    async fn ensure_role(&mut self, credential: &Credential) -> RoleResult<()> {
        let exists = self
            .client
            .query_opt(
                "SELECT 1 FROM pg_roles WHERE rolname = $1",
                &[&credential.username],
            )
            .await?
            .is_some();
        let verb = if exists { "ALTER" } else { "CREATE" };
        self.client
            .batch_execute(&format!(
                "{verb} ROLE {} WITH LOGIN PASSWORD {}",
                quote_ident(&credential.username),
                quote_literal(&credential.password)
            ))
            .await?;
        Ok(())
    }

    async fn grant_all(&mut self, database: &str, username: &str) -> RoleResult<()> {
        self.client
            .batch_execute(&format!(
                "GRANT ALL PRIVILEGES ON DATABASE {} TO {}",
                quote_ident(database),
                quote_ident(username)
            ))
            .await?;
        Ok(())
    }

    async fn config_paths(&mut self) -> RoleResult<EngineConfigPaths> {
        let row = self
            .client
            .query_one(
                "SELECT current_setting('hba_file'), current_setting('config_file')",
                &[],
            )
            .await?;
        let hba: String = row.get(0);
        let conf: String = row.get(1);
        Ok(EngineConfigPaths {
            access_file: PathBuf::from(hba),
            settings_file: PathBuf::from(conf),
        })
    }

    async fn reload(&mut self) -> RoleResult<()> {
        self.client.batch_execute("SELECT pg_reload_conf()").await?;
        Ok(())
    }
}

/// Quote an SQL identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote an SQL string literal, doubling embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    if value.contains('\\') {
        format!("E'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
    } else {
        format!("'{}'", value.replace('\'', "''"))
    }
}
