//! Runtime settings with environment variable overrides.
//!
//! Environment variables (all optional):
//! - `LANROLE_PORT` - database port (default `5432`)
//! - `LANROLE_DATABASE` / `LANROLE_FALLBACK_DATABASE` - primary and fallback database names
//! - `LANROLE_APP_USER` / `LANROLE_APP_PASSWORD` - application login role (the canonical user)
//! - `LANROLE_CREDENTIALS` - guess list, `user:password` pairs separated by commas
//! - `LANROLE_ADMIN_CREDENTIALS` - local administrative credentials, same format
//! - `LANROLE_BOOTSTRAP_RANGE` / `LANROLE_FULL_RANGE` - host octet ranges such as `1-254`
//! - `LANROLE_QUICK_OCTETS` - conventional server octets, e.g. `1,10,50,100,150`
//! - `LANROLE_WORKERS` - scanner pool size
//! - `LANROLE_TIMEOUT_MS` - per-attempt connect timeout
//! - `LANROLE_PROBE_MODE` - `database` or `tcp`
//! - `LANROLE_RETRIES` - bootstrap re-runs after a role conflict

use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::octets;
use crate::types::Credential;

pub const DEFAULT_PORT: u16 = 5432;

/// How the prober talks to candidate hosts.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProbeMode {
    /// Open real database sessions with guessed credentials.
    #[default]
    Database,
    /// Bare TCP connect-and-close on the database port.
    Tcp,
}

impl FromStr for ProbeMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "database" | "db" | "postgres" => Ok(ProbeMode::Database),
            "tcp" => Ok(ProbeMode::Tcp),
            other => bail!("unknown probe mode: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    /// Database the application expects on the shared server.
    pub database_name: String,
    /// Generic database every engine ships with, tried when the primary one is missing.
    pub fallback_database: String,
    /// Login role the application uses. Its username is the canonical user
    /// preferred when several servers answer.
    pub app_credential: Credential,
    /// Credentials guessed against remote hosts.
    pub credentials: Vec<Credential>,
    /// Credentials tried in order against the local engine's admin interface.
    pub admin_credentials: Vec<Credential>,
    /// Host octets swept by the negotiator before deciding.
    pub bootstrap_range: (u8, u8),
    /// Host octets swept by the server pre-check.
    pub full_range: (u8, u8),
    pub quick_octets: Vec<u8>,
    pub workers: usize,
    pub attempt_timeout: Duration,
    pub probe_mode: ProbeMode,
    pub retries: u32,
}

impl Default for Settings {
    fn default() -> Self {
        let app_credential = Credential::new("app_user", "app_password");
        let admin_credentials = vec![
            Credential::new("postgres", "postgres"),
            Credential::new("postgres", "admin"),
            Credential::new("postgres", "password"),
            Credential::new("postgres", ""),
        ];
        let mut credentials = vec![app_credential.clone()];
        credentials.extend(admin_credentials.iter().cloned());
        Self {
            port: DEFAULT_PORT,
            database_name: "appdb".to_string(),
            fallback_database: "postgres".to_string(),
            app_credential,
            credentials,
            admin_credentials,
            bootstrap_range: (1, 254),
            full_range: (1, 254),
            quick_octets: vec![1, 10, 50, 100, 150],
            workers: 10,
            attempt_timeout: Duration::from_millis(1500),
            probe_mode: ProbeMode::Database,
            retries: 1,
        }
    }
}

impl Settings {
    /// Defaults overridden by `LANROLE_*` environment variables. Values that
    /// fail to parse are logged and ignored.
    pub fn from_env() -> Self {
        let mut s = Self::default();

        if let Some(port) = env_parsed::<u16>("LANROLE_PORT") {
            s.port = port;
        }
        if let Ok(db) = std::env::var("LANROLE_DATABASE") {
            s.database_name = db;
        }
        if let Ok(db) = std::env::var("LANROLE_FALLBACK_DATABASE") {
            s.fallback_database = db;
        }
        if let Ok(user) = std::env::var("LANROLE_APP_USER") {
            s.app_credential.username = user;
        }
        if let Ok(password) = std::env::var("LANROLE_APP_PASSWORD") {
            s.app_credential.password = password;
        }
        if let Some(list) = env_with("LANROLE_CREDENTIALS", parse_credentials) {
            s.credentials = list;
        }
        if let Some(list) = env_with("LANROLE_ADMIN_CREDENTIALS", parse_credentials) {
            s.admin_credentials = list;
        }
        if let Some(r) = env_with("LANROLE_BOOTSTRAP_RANGE", octets::parse_range_str) {
            s.bootstrap_range = r;
        }
        if let Some(r) = env_with("LANROLE_FULL_RANGE", octets::parse_range_str) {
            s.full_range = r;
        }
        if let Some(list) = env_with("LANROLE_QUICK_OCTETS", octets::parse_octets_str) {
            s.quick_octets = list;
        }
        if let Some(workers) = env_parsed::<usize>("LANROLE_WORKERS") {
            s.workers = workers.max(1);
        }
        if let Some(ms) = env_parsed::<u64>("LANROLE_TIMEOUT_MS") {
            s.attempt_timeout = Duration::from_millis(ms);
        }
        if let Some(mode) = env_parsed::<ProbeMode>("LANROLE_PROBE_MODE") {
            s.probe_mode = mode;
        }
        if let Some(retries) = env_parsed::<u32>("LANROLE_RETRIES") {
            s.retries = retries;
        }

        s.ensure_app_credential_guessed();
        s
    }

    /// Database names a prober tries, primary first.
    pub fn databases(&self) -> Vec<String> {
        let mut dbs = vec![self.database_name.clone()];
        if self.fallback_database != self.database_name {
            dbs.push(self.fallback_database.clone());
        }
        dbs
    }

    /// Credentials used to detect a local engine on loopback: the
    /// application role first, then the administrative list.
    pub fn local_credentials(&self) -> Vec<Credential> {
        let mut creds = vec![self.app_credential.clone()];
        for c in &self.admin_credentials {
            if !creds.contains(c) {
                creds.push(c.clone());
            }
        }
        creds
    }

    /// The application role must be in the guess list, otherwise remote
    /// servers provisioned by this crate would never be recognised.
    pub fn ensure_app_credential_guessed(&mut self) {
        if !self.credentials.contains(&self.app_credential) {
            self.credentials.insert(0, self.app_credential.clone());
        }
    }
}

/// Parse `user:password,user:password`. The password may be empty and may
/// itself contain `:`.
pub fn parse_credentials(s: &str) -> Result<Vec<Credential>> {
    let mut out = Vec::new();
    for item in s.split(',').map(str::trim).filter(|i| !i.is_empty()) {
        let Some((user, password)) = item.split_once(':') else {
            bail!("expected user:password, got: {item}");
        };
        if user.is_empty() {
            bail!("empty username in credential: {item}");
        }
        out.push(Credential::new(user, password));
    }
    Ok(out)
}

fn env_parsed<T>(key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(key).ok()?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "ignoring invalid environment override");
            None
        }
    }
}

fn env_with<T>(key: &str, parse: impl Fn(&str) -> Result<T>) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match parse(&raw) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "ignoring invalid environment override");
            None
        }
    }
}
