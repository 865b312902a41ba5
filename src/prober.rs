use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tokio_postgres::{Client, Config, NoTls};
use tracing::debug;

use crate::settings::{ProbeMode, Settings};
use crate::types::{Credential, ScanResult};

/// Classifies a single address as a database server, an open port, or
/// unreachable.
///
/// Implementations swallow every per-attempt failure: a probe always yields
/// a [`ScanResult`], never an error.
#[async_trait]
pub trait Prober: Send + Sync + 'static {
    /// Try every known combination against `address`, stopping at the first
    /// that opens a session. Must not block longer than
    /// `attempts() * timeout_per_attempt` in total.
    async fn probe(&self, address: Ipv4Addr, timeout_per_attempt: Duration) -> ScanResult;

    /// One live session attempt with a specific credential and database.
    async fn try_connect(
        &self,
        address: Ipv4Addr,
        credential: &Credential,
        database: &str,
        timeout: Duration,
    ) -> bool;

    /// Number of session attempts a full `probe` may make.
    fn attempts(&self) -> usize {
        1
    }
}

/// PostgreSQL prober guessing credentials against a fixed database list.
#[derive(Debug, Clone)]
pub struct PgProber {
    port: u16,
    credentials: Vec<Credential>,
    databases: Vec<String>,
    mode: ProbeMode,
}

impl PgProber {
    pub fn new(
        port: u16,
        credentials: Vec<Credential>,
        databases: Vec<String>,
        mode: ProbeMode,
    ) -> Self {
        Self {
            port,
            credentials,
            databases,
            mode,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.port,
            settings.credentials.clone(),
            settings.databases(),
            settings.probe_mode,
        )
    }

    pub fn mode(&self) -> ProbeMode {
        self.mode
    }
}

#[async_trait]
impl Prober for PgProber {
    async fn probe(&self, address: Ipv4Addr, timeout_per_attempt: Duration) -> ScanResult {
        let start = Instant::now();
        // One budget for the reachability check and every session attempt.
        let deadline = start + timeout_per_attempt * self.attempts() as u32;

        // A closed or silent port fails every combination, so check it once
        // instead of paying the full timeout per credential.
        let Some(budget) = attempt_budget(deadline, timeout_per_attempt) else {
            return ScanResult::unreachable(address);
        };
        if !tcp_reachable(IpAddr::V4(address), self.port, budget).await {
            return ScanResult::unreachable(address);
        }

        if self.mode == ProbeMode::Tcp {
            return ScanResult::port_open(address, start.elapsed().as_millis() as u64);
        }

        for credential in &self.credentials {
            for database in &self.databases {
                let Some(budget) = attempt_budget(deadline, timeout_per_attempt) else {
                    debug!(%address, "attempt budget exhausted");
                    return ScanResult::unreachable(address);
                };
                match open_session(IpAddr::V4(address), self.port, credential, database, budget)
                    .await
                {
                    Ok(client) => {
                        drop(client);
                        return ScanResult::server_found(
                            address,
                            credential.clone(),
                            database.clone(),
                            start.elapsed().as_millis() as u64,
                        );
                    }
                    Err(e) => {
                        debug!(%address, user = %credential.username, %database, error = %e, "probe attempt failed");
                    }
                }
            }
        }

        ScanResult::unreachable(address)
    }

    async fn try_connect(
        &self,
        address: Ipv4Addr,
        credential: &Credential,
        database: &str,
        timeout: Duration,
    ) -> bool {
        if self.mode == ProbeMode::Tcp {
            return false;
        }
        match open_session(IpAddr::V4(address), self.port, credential, database, timeout).await {
            Ok(_client) => true,
            Err(e) => {
                debug!(%address, user = %credential.username, %database, error = %e, "connection attempt failed");
                false
            }
        }
    }

    fn attempts(&self) -> usize {
        match self.mode {
            ProbeMode::Tcp => 1,
            ProbeMode::Database => (self.credentials.len() * self.databases.len()).max(1),
        }
    }
}

/// Time left for the next attempt: `per_attempt`, cut short by `deadline`.
/// `None` once the deadline has passed.
pub(crate) fn attempt_budget(deadline: Instant, per_attempt: Duration) -> Option<Duration> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        None
    } else {
        Some(remaining.min(per_attempt))
    }
}

/// Bare TCP connect-and-close with a deadline.
pub async fn tcp_reachable(ip: IpAddr, port: u16, timeout: Duration) -> bool {
    matches!(
        time::timeout(timeout, TcpStream::connect(SocketAddr::new(ip, port))).await,
        Ok(Ok(_))
    )
}

/// Open an authenticated session. The connection driver runs on a spawned
/// task and ends when the returned client is dropped.
pub(crate) async fn open_session(
    host: IpAddr,
    port: u16,
    credential: &Credential,
    database: &str,
    timeout: Duration,
) -> Result<Client> {
    let mut config = Config::new();
    config
        .host(&host.to_string())
        .port(port)
        .user(&credential.username)
        .password(&credential.password)
        .dbname(database)
        .connect_timeout(timeout);

    let (client, connection) = time::timeout(timeout, config.connect(NoTls))
        .await
        .map_err(|_| anyhow!("session setup timed out after {timeout:?}"))??;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "database connection closed with error");
        }
    });

    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn prober(mode: ProbeMode, port: u16) -> PgProber {
        PgProber::new(
            port,
            vec![Credential::new("a", "b"), Credential::new("c", "d")],
            vec!["appdb".into(), "postgres".into()],
            mode,
        )
    }

    #[test]
    fn attempts_cover_every_combination() {
        assert_eq!(prober(ProbeMode::Database, 5432).attempts(), 4);
        assert_eq!(prober(ProbeMode::Tcp, 5432).attempts(), 1);
    }

    #[tokio::test]
    async fn tcp_mode_reports_port_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let p = prober(ProbeMode::Tcp, port);
        let res = p.probe(Ipv4Addr::LOCALHOST, Duration::from_millis(500)).await;
        assert_eq!(res.status, crate::types::ProbeStatus::PortOpen);
        assert!(res.credential.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn budget_shrinks_to_the_deadline() {
        let per_attempt = Duration::from_millis(100);
        let deadline = Instant::now() + Duration::from_millis(250);

        assert_eq!(attempt_budget(deadline, per_attempt), Some(per_attempt));
        time::advance(Duration::from_millis(200)).await;
        assert_eq!(attempt_budget(deadline, per_attempt), Some(Duration::from_millis(50)));
        time::advance(Duration::from_millis(50)).await;
        assert_eq!(attempt_budget(deadline, per_attempt), None);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_server_stays_within_total_budget() {
        // Accepts connections and never answers the startup message.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((sock, _)) = listener.accept().await {
                held.push(sock);
            }
        });

        let p = prober(ProbeMode::Database, port);
        let per_attempt = Duration::from_millis(100);
        let start = Instant::now();
        let res = p.probe(Ipv4Addr::LOCALHOST, per_attempt).await;

        assert_eq!(res.status, crate::types::ProbeStatus::Unreachable);
        assert!(start.elapsed() <= per_attempt * p.attempts() as u32);
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        // Bind then drop to get a port nothing listens on.
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let p = prober(ProbeMode::Database, port);
        let res = p.probe(Ipv4Addr::LOCALHOST, Duration::from_millis(300)).await;
        assert_eq!(res.status, crate::types::ProbeStatus::Unreachable);
    }
}
