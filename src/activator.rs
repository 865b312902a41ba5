use std::net::Ipv4Addr;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{AdminSession, LocalEngine};
use crate::error::{RoleError, RoleResult};
use crate::netdetect;
use crate::pgconf;
use crate::prober::Prober;
use crate::scanner::Scanner;
use crate::settings::Settings;
use crate::types::{ClientConfig, Credential, ServerConfig};

/// Turns this machine into the shared database server.
pub struct ServerActivator<'a, P, E: ?Sized> {
    scanner: &'a Scanner<P>,
    engine: &'a E,
    admin_credentials: Vec<Credential>,
    full_range: (u8, u8),
    verify_timeout: Duration,
}

impl<'a, P, E> ServerActivator<'a, P, E>
where
    P: Prober,
    E: LocalEngine + ?Sized,
{
    pub fn new(scanner: &'a Scanner<P>, engine: &'a E, settings: &Settings) -> Self {
        Self {
            scanner,
            engine,
            admin_credentials: settings.admin_credentials.clone(),
            full_range: settings.full_range,
            verify_timeout: settings.attempt_timeout,
        }
    }

    /// Activate server mode bound to `bind_address`.
    ///
    /// Fails with [`RoleError::RoleConflict`] before touching the engine when
    /// another server answers anywhere else in the full range. A failed LAN
    /// self-test is reported through [`ServerConfig::lan_verified`] rather
    /// than as an error.
    pub async fn activate(
        &self,
        bind_address: Ipv4Addr,
        port: u16,
        credential: &Credential,
        database_name: &str,
    ) -> RoleResult<ServerConfig> {
        if netdetect::is_local_only(&bind_address.to_string()) {
            return Err(RoleError::InvalidTarget {
                address: bind_address.to_string(),
            });
        }

        self.check_no_conflict(bind_address).await?;

        let mut session = self.admin_session().await?;
        self.provision(session.as_mut(), credential, database_name)
            .await?;
        self.open_to_lan(session.as_mut()).await;
        drop(session);

        let lan_verified = self
            .scanner
            .prober()
            .try_connect(bind_address, credential, database_name, self.verify_timeout)
            .await;
        if lan_verified {
            info!(%bind_address, port, "server reachable over the LAN address");
        } else {
            warn!(
                %bind_address,
                port,
                "server not reachable over the LAN address yet; the engine may need a restart"
            );
        }

        Ok(ServerConfig {
            bind_address,
            port,
            credential: credential.clone(),
            database_name: database_name.to_string(),
            lan_verified,
        })
    }

    async fn check_no_conflict(&self, bind_address: Ipv4Addr) -> RoleResult<()> {
        let (start, end) = self.full_range;
        let results = self
            .scanner
            .scan_range(start, end, Some(bind_address), false)
            .await;
        if let Some(conflict) = results.servers().find(|r| r.address != bind_address) {
            warn!(address = %conflict.address, "another database server is already active");
            return Err(RoleError::RoleConflict {
                address: conflict.address,
            });
        }
        Ok(())
    }

    async fn admin_session(&self) -> RoleResult<Box<dyn AdminSession>> {
        for credential in &self.admin_credentials {
            match self.engine.admin_session(credential).await {
                Ok(session) => {
                    debug!(user = %credential.username, "administrative session opened");
                    return Ok(session);
                }
                Err(e) => {
                    debug!(user = %credential.username, error = %e, "administrative login rejected")
                }
            }
        }
        Err(RoleError::EngineUnavailable)
    }

    async fn provision(
        &self,
        session: &mut dyn AdminSession,
        credential: &Credential,
        database_name: &str,
    ) -> RoleResult<()> {
        if session.ensure_database(database_name).await? {
            info!(database = database_name, "created database");
        }
        session.ensure_role(credential).await?;
        session
            .grant_all(database_name, &credential.username)
            .await?;
        Ok(())
    }

    /// Config file changes are best effort: the engine still serves this
    /// machine when they fail, and the LAN self-test reports the outcome.
    async fn open_to_lan(&self, session: &mut dyn AdminSession) {
        let paths = match session.config_paths().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "could not locate engine configuration files");
                return;
            }
        };
        let update = pgconf::allow_lan_access(&paths);
        for e in &update.errors {
            warn!(error = %e, "failed to update engine configuration");
        }
        if !update.changed {
            if update.errors.is_empty() {
                debug!("LAN access already configured");
            }
            return;
        }
        info!(
            access_file = %paths.access_file.display(),
            settings_file = %paths.settings_file.display(),
            "enabled LAN access"
        );
        if let Err(e) = session.reload().await {
            warn!(error = %e, "configuration reload failed");
        }
    }
}

/// Build the descriptor for connecting to a remote server.
///
/// Loopback, unspecified, `localhost` and this machine's own address are
/// always rejected: a client pointed at itself would silently run single
/// machine. No network I/O happens here.
pub fn activate_client(
    server_address: &str,
    port: u16,
    credential: &Credential,
    database_name: &str,
    local_address: Option<Ipv4Addr>,
) -> RoleResult<ClientConfig> {
    let invalid = || RoleError::InvalidTarget {
        address: server_address.to_string(),
    };
    if netdetect::is_local_only(server_address) {
        return Err(invalid());
    }
    let address: Ipv4Addr = server_address.trim().parse().map_err(|_| invalid())?;
    if Some(address) == local_address {
        return Err(invalid());
    }
    Ok(ClientConfig {
        server_address: address,
        port,
        credential: credential.clone(),
        database_name: database_name.to_string(),
    })
}
