#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lan_role_rs::engine::{AdminSession, EngineConfigPaths, LocalEngine};
use lan_role_rs::prober::Prober;
use lan_role_rs::scanner::{ScanOptions, Scanner};
use lan_role_rs::settings::Settings;
use lan_role_rs::types::{Credential, ScanResult};
use lan_role_rs::{RoleError, RoleResult};

pub const LOCAL: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 42);

pub fn addr(last: u8) -> Ipv4Addr {
    Ipv4Addr::new(192, 168, 1, last)
}

pub fn app_cred() -> Credential {
    Settings::default().app_credential
}

pub fn admin_cred() -> Credential {
    Credential::new("postgres", "postgres")
}

pub fn test_settings() -> Settings {
    Settings {
        attempt_timeout: Duration::from_millis(50),
        ..Settings::default()
    }
}

pub fn scanner(prober: MockProber, settings: &Settings) -> Scanner<MockProber> {
    Scanner::new(prober, LOCAL, ScanOptions::from_settings(settings))
}

struct MockServer {
    credential: Credential,
    databases: Vec<String>,
    accepts_sessions: bool,
}

/// In-memory network: which addresses run a database and what they accept.
#[derive(Default)]
pub struct MockProber {
    servers: HashMap<Ipv4Addr, MockServer>,
    open_ports: HashSet<Ipv4Addr>,
    delays: HashMap<Ipv4Addr, Duration>,
    probes: Mutex<HashMap<Ipv4Addr, usize>>,
    connects: Mutex<Vec<(Ipv4Addr, String)>>,
}

impl MockProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server(mut self, address: Ipv4Addr, credential: Credential, databases: &[&str]) -> Self {
        self.servers.insert(
            address,
            MockServer {
                credential,
                databases: databases.iter().map(|d| d.to_string()).collect(),
                accepts_sessions: true,
            },
        );
        self
    }

    /// Answers probes as a server but refuses every follow-up session.
    pub fn with_refusing_server(mut self, address: Ipv4Addr, credential: Credential) -> Self {
        self.servers.insert(
            address,
            MockServer {
                credential,
                databases: vec!["postgres".to_string()],
                accepts_sessions: false,
            },
        );
        self
    }

    /// Make `address` answer only after `delay`.
    pub fn with_delay(mut self, address: Ipv4Addr, delay: Duration) -> Self {
        self.delays.insert(address, delay);
        self
    }

    pub fn with_open_port(mut self, address: Ipv4Addr) -> Self {
        self.open_ports.insert(address);
        self
    }

    pub fn probe_count(&self, address: Ipv4Addr) -> usize {
        self.probes.lock().unwrap().get(&address).copied().unwrap_or(0)
    }

    pub fn total_probes(&self) -> usize {
        self.probes.lock().unwrap().values().sum()
    }

    pub fn probed_addresses(&self) -> HashMap<Ipv4Addr, usize> {
        self.probes.lock().unwrap().clone()
    }

    pub fn connect_attempts(&self) -> Vec<(Ipv4Addr, String)> {
        self.connects.lock().unwrap().clone()
    }
}

#[async_trait]
impl Prober for MockProber {
    async fn probe(&self, address: Ipv4Addr, _timeout: Duration) -> ScanResult {
        *self.probes.lock().unwrap().entry(address).or_default() += 1;
        if let Some(delay) = self.delays.get(&address) {
            tokio::time::sleep(*delay).await;
        }
        if let Some(s) = self.servers.get(&address) {
            return ScanResult::server_found(address, s.credential.clone(), s.databases[0].clone(), 1);
        }
        if self.open_ports.contains(&address) {
            return ScanResult::port_open(address, 1);
        }
        ScanResult::unreachable(address)
    }

    async fn try_connect(
        &self,
        address: Ipv4Addr,
        credential: &Credential,
        database: &str,
        _timeout: Duration,
    ) -> bool {
        self.connects
            .lock()
            .unwrap()
            .push((address, database.to_string()));
        self.servers.get(&address).is_some_and(|s| {
            s.accepts_sessions
                && &s.credential == credential
                && s.databases.iter().any(|d| d == database)
        })
    }
}

/// Local engine double recording every administrative call.
pub struct MockEngine {
    accepts: Vec<Credential>,
    paths: Option<EngineConfigPaths>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockEngine {
    pub fn absent() -> Self {
        Self {
            accepts: Vec::new(),
            paths: None,
            calls: Arc::default(),
        }
    }

    pub fn accepting(accepts: Vec<Credential>, paths: EngineConfigPaths) -> Self {
        Self {
            accepts,
            paths: Some(paths),
            calls: Arc::default(),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls other than detection, i.e. anything that could change the engine.
    pub fn admin_calls(&self) -> Vec<String> {
        self.calls().into_iter().filter(|c| c != "detect").collect()
    }
}

#[async_trait]
impl LocalEngine for MockEngine {
    async fn detect(&self, candidates: &[Credential]) -> Option<Credential> {
        self.calls.lock().unwrap().push("detect".to_string());
        candidates.iter().find(|c| self.accepts.contains(c)).cloned()
    }

    async fn admin_session(&self, credential: &Credential) -> RoleResult<Box<dyn AdminSession>> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("login:{}:{}", credential.username, credential.password));
        if !self.accepts.contains(credential) {
            return Err(RoleError::Engine("password authentication failed".into()));
        }
        Ok(Box::new(MockSession {
            paths: self.paths.clone(),
            calls: self.calls.clone(),
        }))
    }
}

struct MockSession {
    paths: Option<EngineConfigPaths>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockSession {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl AdminSession for MockSession {
    async fn ensure_database(&mut self, name: &str) -> RoleResult<bool> {
        self.record(format!("ensure_database:{name}"));
        Ok(true)
    }

    async fn ensure_role(&mut self, credential: &Credential) -> RoleResult<()> {
        self.record(format!("ensure_role:{}", credential.username));
        Ok(())
    }

    async fn grant_all(&mut self, database: &str, username: &str) -> RoleResult<()> {
        self.record(format!("grant:{database}:{username}"));
        Ok(())
    }

    async fn config_paths(&mut self) -> RoleResult<EngineConfigPaths> {
        self.record("config_paths".to_string());
        self.paths
            .clone()
            .ok_or_else(|| RoleError::Engine("config paths unavailable".into()))
    }

    async fn reload(&mut self) -> RoleResult<()> {
        self.record("reload".to_string());
        Ok(())
    }
}

/// Fresh `pg_hba.conf` / `postgresql.conf` pair inside `dir`.
pub fn engine_files(dir: &Path) -> EngineConfigPaths {
    let access_file = dir.join("pg_hba.conf");
    let settings_file = dir.join("postgresql.conf");
    fs::write(&access_file, "local   all   all   peer\n").unwrap();
    fs::write(&settings_file, "port = 5432\n").unwrap();
    EngineConfigPaths {
        access_file,
        settings_file,
    }
}

pub fn read_files(paths: &EngineConfigPaths) -> (String, String) {
    (
        fs::read_to_string(&paths.access_file).unwrap(),
        fs::read_to_string(&paths.settings_file).unwrap(),
    )
}
