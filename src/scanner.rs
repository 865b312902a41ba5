use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ipnet::Ipv4Net;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::netdetect;
use crate::prober::Prober;
use crate::settings::Settings;
use crate::types::{ProbeStatus, ScanResult, ScanResults};

/// Grace period on top of a probe's own worst case before its result is
/// abandoned.
const COLLECT_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Fixed pool size, independent of the range being swept.
    pub workers: usize,
    pub attempt_timeout: Duration,
    /// Last octets tried by [`Scanner::quick_scan`], in order.
    pub quick_octets: Vec<u8>,
}

impl ScanOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            workers: settings.workers,
            attempt_timeout: settings.attempt_timeout,
            quick_octets: settings.quick_octets.clone(),
        }
    }
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Sweeps a /24 network with a [`Prober`].
///
/// Owned by the caller and passed around explicitly; there is no global
/// scanner state.
pub struct Scanner<P> {
    prober: Arc<P>,
    network: Ipv4Net,
    opts: ScanOptions,
}

impl<P: Prober> Scanner<P> {
    /// Build a scanner for the /24 that contains `local`.
    pub fn new(prober: P, local: Ipv4Addr, opts: ScanOptions) -> Self {
        Self {
            prober: Arc::new(prober),
            network: netdetect::ipv4_to_default_cidr(local),
            opts,
        }
    }

    pub fn prober(&self) -> &P {
        &self.prober
    }

    pub fn network(&self) -> Ipv4Net {
        self.network
    }

    pub fn options(&self) -> &ScanOptions {
        &self.opts
    }

    /// Upper bound for one probe; past it the result is abandoned and the
    /// address counted as unreachable.
    pub fn probe_deadline(&self) -> Duration {
        let attempts = self.prober.attempts().max(1) as u32;
        self.opts.attempt_timeout * attempts + COLLECT_SLACK
    }

    /// Probe the conventional server addresses one by one and stop at the
    /// first `server-found`. The worker pool is not used.
    pub async fn quick_scan(&self, exclude: Option<Ipv4Addr>) -> Option<ScanResult> {
        let targets = netdetect::hosts_from_octets(self.network, &self.opts.quick_octets);
        for address in targets {
            if Some(address) == exclude {
                continue;
            }
            let res = self.probe_bounded(address).await;
            if res.is_server() {
                info!(%address, "quick scan found a database server");
                return Some(res);
            }
        }
        None
    }

    /// Probe every address in `base.start ..= base.end` except `exclude`.
    ///
    /// With `fast_mode` the addresses are probed sequentially in order;
    /// otherwise each address is dispatched to the bounded worker pool and
    /// results arrive in completion order. Either way each remaining address
    /// gets exactly one probe.
    pub async fn scan_range(
        &self,
        start: u8,
        end: u8,
        exclude: Option<Ipv4Addr>,
        fast_mode: bool,
    ) -> ScanResults {
        self.scan_range_with_cancel(start, end, exclude, fast_mode, CancellationToken::new())
            .await
    }

    /// Variant of [`Scanner::scan_range`] that stops dispatching new probes
    /// once `cancel` fires. Probes already running are still collected.
    pub async fn scan_range_with_cancel(
        &self,
        start: u8,
        end: u8,
        exclude: Option<Ipv4Addr>,
        fast_mode: bool,
        cancel: CancellationToken,
    ) -> ScanResults {
        let mut targets = netdetect::host_range(self.network, start, end);
        if let Some(ex) = exclude {
            targets.retain(|a| *a != ex);
        }
        debug!(
            network = %self.network,
            start,
            end,
            count = targets.len(),
            fast_mode,
            "scanning range"
        );

        let results = if fast_mode {
            self.scan_sequential(&targets, &cancel).await
        } else {
            self.scan_pooled(&targets, &cancel).await
        };

        info!(
            scanned = results.scanned_done,
            total = results.scanned_total,
            servers = results.found_count,
            "scan finished"
        );
        results
    }

    async fn scan_sequential(&self, targets: &[Ipv4Addr], cancel: &CancellationToken) -> ScanResults {
        let mut results = ScanResults::with_total(targets.len() as u64);
        for &address in targets {
            if cancel.is_cancelled() {
                break;
            }
            let res = self.probe_bounded(address).await;
            log_result(&res);
            results.insert(res);
            results.scanned_done += 1;
        }
        results
    }

    async fn scan_pooled(&self, targets: &[Ipv4Addr], cancel: &CancellationToken) -> ScanResults {
        let scanned_done = Arc::new(AtomicU64::new(0));
        let entries = Arc::new(Mutex::new(ScanResults::with_total(targets.len() as u64)));

        let sem = Arc::new(Semaphore::new(self.opts.workers.clamp(1, 256)));
        let mut set = JoinSet::new();
        let deadline = self.probe_deadline();
        let attempt_timeout = self.opts.attempt_timeout;

        for &address in targets {
            if cancel.is_cancelled() {
                break;
            }
            let Ok(permit) = sem.clone().acquire_owned().await else {
                break;
            };
            let prober = self.prober.clone();
            let entries = entries.clone();
            let scanned_done = scanned_done.clone();

            set.spawn(async move {
                let _permit = permit; // keep permit until task completes
                let res = match time::timeout(deadline, prober.probe(address, attempt_timeout)).await {
                    Ok(res) => res,
                    Err(_) => {
                        debug!(%address, "probe abandoned after deadline");
                        ScanResult::unreachable(address)
                    }
                };
                log_result(&res);
                entries.lock().await.insert(res);
                scanned_done.fetch_add(1, Ordering::Relaxed);
            });
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "probe task failed");
            }
        }

        let mut results = std::mem::take(&mut *entries.lock().await);
        results.scanned_done = scanned_done.load(Ordering::Relaxed);
        results
    }

    async fn probe_bounded(&self, address: Ipv4Addr) -> ScanResult {
        match time::timeout(
            self.probe_deadline(),
            self.prober.probe(address, self.opts.attempt_timeout),
        )
        .await
        {
            Ok(res) => res,
            Err(_) => ScanResult::unreachable(address),
        }
    }
}

fn log_result(res: &ScanResult) {
    match res.status {
        ProbeStatus::ServerFound => info!(
            address = %res.address,
            user = res.credential.as_ref().map(|c| c.username.as_str()).unwrap_or(""),
            latency_ms = res.latency_ms,
            "database server found"
        ),
        ProbeStatus::PortOpen => {
            debug!(address = %res.address, "database port open, no working credential")
        }
        ProbeStatus::Unreachable => {}
    }
}

/// Pick the server a client should use: a result whose credential belongs to
/// `canonical_user` if there is one, otherwise any `server-found` result.
/// Ties go to the lowest address.
pub fn best_server<'a>(results: &'a ScanResults, canonical_user: &str) -> Option<&'a ScanResult> {
    rank_servers(results, canonical_user).into_iter().next()
}

/// All `server-found` results, canonical-user matches first, each group
/// ordered by address.
///
/// Pooled sweeps collect results in completion order, so the order must not
/// depend on it: every machine on the LAN has to rank the same servers the
/// same way.
pub fn rank_servers<'a>(results: &'a ScanResults, canonical_user: &str) -> Vec<&'a ScanResult> {
    let is_canonical = |r: &ScanResult| {
        r.credential
            .as_ref()
            .is_some_and(|c| c.username == canonical_user)
    };
    let mut ranked: Vec<&ScanResult> = results.servers().collect();
    ranked.sort_by_key(|r| (!is_canonical(r), u32::from(r.address)));
    ranked
}
