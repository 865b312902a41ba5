use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

use lan_role_rs::prober::PgProber;
use lan_role_rs::scanner::{best_server, ScanOptions, Scanner};
use lan_role_rs::settings::{ProbeMode, Settings};
use lan_role_rs::types::{ProbeStatus, RoleConfig, ScanResults};
use lan_role_rs::{netdetect, octets};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// lan-role-rs — find the shared database server on the LAN, become it, or fall back to offline.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "lan-role-rs",
    version,
    about = "Find the shared database server on the LAN, become it, or fall back to offline.",
    long_about = None
)]
struct Cli {
    /// Database port.
    #[arg(long)]
    port: Option<u16>,

    /// Database the application expects on the shared server.
    #[arg(long)]
    database: Option<String>,

    /// Generic database tried when the primary one is missing.
    #[arg(long = "fallback-database")]
    fallback_database: Option<String>,

    /// Host octet range swept before deciding, e.g. 1-254.
    #[arg(long)]
    range: Option<String>,

    /// Conventional server octets probed first, e.g. 1,10,50,100,150.
    #[arg(long = "quick-octets")]
    quick_octets: Option<String>,

    /// Scanner worker pool size.
    #[arg(long)]
    workers: Option<usize>,

    /// Per-attempt connect timeout in milliseconds.
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// `database` to open real sessions, `tcp` for bare port checks.
    #[arg(long = "probe-mode")]
    probe_mode: Option<ProbeMode>,

    /// Bootstrap re-runs after losing the server role to another machine.
    #[arg(long)]
    retries: Option<u32>,

    /// Only sweep the network and print what answered.
    #[arg(long = "scan-only", default_value_t = false)]
    scan_only: bool,

    /// Write the result as pretty JSON to this path (optional).
    #[arg(long)]
    output: Option<PathBuf>,
}

impl Cli {
    fn apply(&self, s: &mut Settings) -> Result<()> {
        if let Some(port) = self.port {
            s.port = port;
        }
        if let Some(db) = &self.database {
            s.database_name = db.clone();
        }
        if let Some(db) = &self.fallback_database {
            s.fallback_database = db.clone();
        }
        if let Some(r) = &self.range {
            s.bootstrap_range = octets::parse_range_str(r).context("invalid --range")?;
        }
        if let Some(q) = &self.quick_octets {
            s.quick_octets = octets::parse_octets_str(q).context("invalid --quick-octets")?;
        }
        if let Some(w) = self.workers {
            s.workers = w.max(1);
        }
        if let Some(ms) = self.timeout_ms {
            s.attempt_timeout = Duration::from_millis(ms);
        }
        if let Some(mode) = self.probe_mode {
            s.probe_mode = mode;
        }
        if let Some(r) = self.retries {
            s.retries = r;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::from_env();
    cli.apply(&mut settings)?;

    println!("lan-role-rs configuration:");
    println!("  port         : {}", settings.port);
    println!(
        "  databases    : {}",
        settings.databases().join(", ")
    );
    println!(
        "  range        : {}-{}",
        settings.bootstrap_range.0, settings.bootstrap_range.1
    );
    println!("  workers      : {}", settings.workers);
    println!("  timeout_ms   : {}", settings.attempt_timeout.as_millis());
    println!("  probe_mode   : {:?}", settings.probe_mode);

    if cli.scan_only {
        let results = scan_only(&settings).await?;
        print_results_table(&results, &settings.app_credential.username);
        if let Some(path) = cli.output.as_deref() {
            write_json(path, &results)?;
            println!("Wrote JSON results to {}", path.display());
        }
        return Ok(());
    }

    let role = lan_role_rs::bootstrap(settings).await;
    print_role(&role);
    if let Some(path) = cli.output.as_deref() {
        write_json(path, &role)?;
        println!("Wrote JSON role to {}", path.display());
    }
    Ok(())
}

async fn scan_only(settings: &Settings) -> Result<ScanResults> {
    let local = netdetect::local_lan_address().context("failed to determine LAN address")?;
    let scanner = Scanner::new(
        PgProber::from_settings(settings),
        local,
        ScanOptions::from_settings(settings),
    );
    println!("Scanning {} (local address {})...", scanner.network(), local);

    // Ctrl-C stops dispatching; probes already in flight are still collected.
    let cancel = CancellationToken::new();
    let cancel_ctrlc = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel_ctrlc.cancel();
    });

    let (start, end) = settings.bootstrap_range;
    Ok(scanner
        .scan_range_with_cancel(start, end, None, false, cancel)
        .await)
}

fn print_role(role: &RoleConfig) {
    println!();
    match role {
        RoleConfig::Server(s) => {
            println!("Role: SERVER");
            println!("  bind_address : {}", s.bind_address);
            println!("  port         : {}", s.port);
            println!("  database     : {}", s.database_name);
            println!("  user         : {}", s.credential.username);
            println!("  lan_verified : {}", s.lan_verified);
        }
        RoleConfig::Client(c) => {
            println!("Role: CLIENT");
            println!("  server       : {}", c.server_address);
            println!("  port         : {}", c.port);
            println!("  database     : {}", c.database_name);
            println!("  user         : {}", c.credential.username);
        }
        RoleConfig::Offline(o) => {
            println!("Role: OFFLINE");
            println!("  reason       : {}", o.reason);
        }
    }
}

fn print_results_table(results: &ScanResults, canonical_user: &str) {
    let rows: Vec<_> = results
        .entries()
        .iter()
        .filter(|e| e.status != ProbeStatus::Unreachable)
        .collect();

    let mut ip_w = "address".len();
    let mut user_w = "user".len();
    let mut db_w = "database".len();
    for e in &rows {
        ip_w = ip_w.max(e.address.to_string().len());
        if let Some(c) = &e.credential {
            user_w = user_w.max(c.username.len());
        }
        if let Some(d) = &e.database {
            db_w = db_w.max(d.len());
        }
    }
    let status_w = "server-found".len();
    let lat_w = "latency_ms".len();

    println!(
        "\nServers: {}  responding: {} (scanned: {}/{})",
        results.found_count,
        rows.len(),
        results.scanned_done,
        results.scanned_total
    );
    println!(
        "{:<ip_w$}  {:<status_w$}  {:<user_w$}  {:<db_w$}  {:>lat_w$}",
        "address", "status", "user", "database", "latency_ms",
    );
    println!(
        "{:-<ip_w$}  {:-<status_w$}  {:-<user_w$}  {:-<db_w$}  {:-<lat_w$}",
        "", "", "", "", "",
    );
    for e in rows {
        let status = match e.status {
            ProbeStatus::ServerFound => "server-found",
            ProbeStatus::PortOpen => "port-open",
            ProbeStatus::Unreachable => "unreachable",
        };
        println!(
            "{:<ip_w$}  {:<status_w$}  {:<user_w$}  {:<db_w$}  {:>lat_w$}",
            e.address.to_string(),
            status,
            e.credential.as_ref().map(|c| c.username.as_str()).unwrap_or("-"),
            e.database.as_deref().unwrap_or("-"),
            e.latency_ms,
        );
    }
    if let Some(best) = best_server(results, canonical_user) {
        println!("\nPreferred server: {}", best.address);
    }
}

fn write_json<T: Serialize>(path: &std::path::Path, value: &T) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create output file: {}", path.display()))?;
    serde_json::to_writer_pretty(file, value)?;
    Ok(())
}
