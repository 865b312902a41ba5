//! Role negotiation: client of an existing server, else server, else offline.

use std::fmt;
use std::net::Ipv4Addr;

use tracing::{info, warn};

use crate::activator::{activate_client, ServerActivator};
use crate::engine::{LocalEngine, PgEngine};
use crate::error::{RoleError, RoleResult};
use crate::netdetect;
use crate::prober::{PgProber, Prober};
use crate::scanner::{rank_servers, ScanOptions, Scanner};
use crate::settings::Settings;
use crate::types::{Credential, RoleConfig, ScanResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationState {
    Scanning,
    /// A remote server accepted a live session.
    ClientCandidate {
        address: Ipv4Addr,
        credential: Credential,
        database: String,
    },
    /// No usable remote server, but the local engine answered.
    ServerCandidate { detected_with: Credential },
    Offline { reason: String },
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationState::Scanning => write!(f, "scanning"),
            NegotiationState::ClientCandidate { address, .. } => {
                write!(f, "client-candidate({address})")
            }
            NegotiationState::ServerCandidate { .. } => write!(f, "server-candidate"),
            NegotiationState::Offline { .. } => write!(f, "offline"),
        }
    }
}

/// Decides this machine's role. Built explicitly by the caller, which owns
/// the scanner and engine handle for the life of the bootstrap.
pub struct Negotiator<P, E> {
    settings: Settings,
    scanner: Scanner<P>,
    engine: E,
    local_address: Ipv4Addr,
}

impl<P, E> Negotiator<P, E>
where
    P: Prober,
    E: LocalEngine,
{
    pub fn new(settings: Settings, scanner: Scanner<P>, engine: E, local_address: Ipv4Addr) -> Self {
        Self {
            settings,
            scanner,
            engine,
            local_address,
        }
    }

    pub fn local_address(&self) -> Ipv4Addr {
        self.local_address
    }

    pub fn scanner(&self) -> &Scanner<P> {
        &self.scanner
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run the priority order once: client of an external server, else
    /// server, else offline. Hard failures of the chosen activation are
    /// returned as errors.
    pub async fn negotiate(&self) -> RoleResult<RoleConfig> {
        let mut state = NegotiationState::Scanning;
        loop {
            info!(%state, local = %self.local_address, "negotiation state");
            state = match state {
                NegotiationState::Scanning => self.discover().await,
                NegotiationState::ClientCandidate {
                    address,
                    credential,
                    database,
                } => {
                    let cfg = activate_client(
                        &address.to_string(),
                        self.settings.port,
                        &credential,
                        &database,
                        Some(self.local_address),
                    )?;
                    info!(server = %cfg.server_address, database = %cfg.database_name, "client mode");
                    return Ok(RoleConfig::Client(cfg));
                }
                NegotiationState::ServerCandidate { detected_with } => {
                    info!(user = %detected_with.username, "local engine present, activating server mode");
                    let cfg = ServerActivator::new(&self.scanner, &self.engine, &self.settings)
                        .activate(
                            self.local_address,
                            self.settings.port,
                            &self.settings.app_credential,
                            &self.settings.database_name,
                        )
                        .await?;
                    info!(bind = %cfg.bind_address, verified = cfg.lan_verified, "server mode");
                    return Ok(RoleConfig::Server(cfg));
                }
                NegotiationState::Offline { reason } => {
                    info!(%reason, "offline mode");
                    return Ok(RoleConfig::offline(reason));
                }
            };
        }
    }

    /// Like [`Negotiator::negotiate`] but never fails: every error resolves
    /// to an offline configuration.
    pub async fn bootstrap(&self) -> RoleConfig {
        self.bootstrap_with_retries(0).await
    }

    /// Re-run the whole negotiation up to `retries` times after a role
    /// conflict, so a machine that lost the race to become server falls
    /// into client mode instead.
    pub async fn bootstrap_with_retries(&self, retries: u32) -> RoleConfig {
        let mut attempt = 0;
        loop {
            match self.negotiate().await {
                Ok(cfg) => return cfg,
                Err(RoleError::RoleConflict { address }) if attempt < retries => {
                    attempt += 1;
                    warn!(%address, attempt, "server role taken by another machine, renegotiating");
                }
                Err(e) => {
                    warn!(error = %e, "bootstrap failed, falling back to offline");
                    return RoleConfig::offline(offline_reason(&e));
                }
            }
        }
    }

    async fn discover(&self) -> NegotiationState {
        if let Some(found) = self.scanner.quick_scan(Some(self.local_address)).await {
            if let Some(state) = self.connect_any(&[&found]).await {
                return state;
            }
        }

        let (start, end) = self.settings.bootstrap_range;
        let mut results = self.scanner.scan_range(start, end, None, false).await;
        results.remove(self.local_address);

        let candidates = rank_servers(&results, &self.settings.app_credential.username);
        if let Some(state) = self.connect_any(&candidates).await {
            return state;
        }

        match self.engine.detect(&self.settings.local_credentials()).await {
            Some(credential) => NegotiationState::ServerCandidate {
                detected_with: credential,
            },
            None => NegotiationState::Offline {
                reason: format!(
                    "no database server found on {} and no local database engine available",
                    self.scanner.network()
                ),
            },
        }
    }

    /// First candidate that accepts a live session, primary database first,
    /// then the fallback database.
    async fn connect_any(&self, candidates: &[&ScanResult]) -> Option<NegotiationState> {
        let prober = self.scanner.prober();
        let timeout = self.settings.attempt_timeout;
        for candidate in candidates {
            if candidate.address == self.local_address
                || netdetect::is_local_only(&candidate.address.to_string())
            {
                continue;
            }
            let Some(credential) = candidate.credential.as_ref() else {
                continue;
            };
            for database in self.settings.databases() {
                if prober
                    .try_connect(candidate.address, credential, &database, timeout)
                    .await
                {
                    return Some(NegotiationState::ClientCandidate {
                        address: candidate.address,
                        credential: credential.clone(),
                        database,
                    });
                }
            }
            warn!(address = %candidate.address, "server answered the scan but refused a session");
        }
        None
    }
}

fn offline_reason(e: &RoleError) -> String {
    match e {
        RoleError::RoleConflict { address } => format!(
            "another machine ({address}) became the database server; restart to join it as a client"
        ),
        RoleError::EngineUnavailable => {
            "local database engine rejected every administrative credential".to_string()
        }
        other => other.to_string(),
    }
}

/// Discover this machine's role with the PostgreSQL prober and engine.
pub async fn bootstrap(settings: Settings) -> RoleConfig {
    let local = match netdetect::local_lan_address() {
        Ok(ip) => ip,
        Err(e) => {
            warn!(error = %e, "could not determine a LAN address");
            return RoleConfig::offline(format!("no LAN address available: {e}"));
        }
    };
    let prober = PgProber::from_settings(&settings);
    let scanner = Scanner::new(prober, local, ScanOptions::from_settings(&settings));
    let engine = PgEngine::new(
        settings.port,
        settings.fallback_database.clone(),
        settings.attempt_timeout,
    );
    let retries = settings.retries;
    Negotiator::new(settings, scanner, engine, local)
        .bootstrap_with_retries(retries)
        .await
}
