//! Internet reachability, per-provider health, and the background
//! scheduler that maintains both.
//!
//! The monitor is a single cooperative task ticking once a second. Every
//! sub-check gates itself on its own cadence, so one slow probe never
//! starves the others. Readers of [`HealthState`] observe eventually
//! consistent values; the monitor is the only writer.

use crate::breaker::BreakerRegistry;
use crate::config::RuntimeSettings;
use crate::gateway::ToolGateway;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_secs(1);
/// Staggered startup probe offsets.
const STARTUP_PROBES: [Duration; 3] = [
    Duration::from_secs(5),
    Duration::from_secs(15),
    Duration::from_secs(60),
];
const STARTUP_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const STEADY_PROBE_INTERVAL: Duration = Duration::from_secs(60);
const STEADY_PROBE_TIMEOUT: Duration = Duration::from_secs(15);
const CORE_PROBE_TIMEOUT: Duration = Duration::from_secs(20);
const RECOVERY_TEST_INTERVAL: Duration = Duration::from_secs(30);
const ZOMBIE_SCAN_INTERVAL: Duration = Duration::from_secs(60);
const ZOMBIE_AGE_MINUTES: u64 = 5;
const INTERNET_TARGET_TIMEOUT: Duration = Duration::from_secs(5);

const INTERNET_TARGETS: [&str; 4] = [
    "https://www.google.com",
    "https://www.cloudflare.com",
    "https://www.microsoft.com",
    "https://1.1.1.1",
];

// ============================================================================
// Shared health state
// ============================================================================

/// Health record for one provider.
#[derive(Debug, Clone)]
pub struct ProviderHealth {
    pub healthy: bool,
    pub error: Option<String>,
    pub last_check: Option<Instant>,
    pub last_success: Option<Instant>,
    pub last_failure: Option<Instant>,
    pub consecutive_failures: u32,
}

impl ProviderHealth {
    fn unknown() -> Self {
        Self {
            healthy: true,
            error: None,
            last_check: None,
            last_success: None,
            last_failure: None,
            consecutive_failures: 0,
        }
    }

    /// Whether the last probe is recent enough to act on.
    pub fn checked_within(&self, window: Duration) -> bool {
        self.last_check.is_some_and(|t| t.elapsed() < window)
    }
}

/// Serializable view for the health report endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealthReport {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds_since_check: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds_since_success: Option<f64>,
    pub consecutive_failures: u32,
}

/// Single-writer, many-reader health facts.
pub struct HealthState {
    internet: AtomicBool,
    providers: RwLock<HashMap<String, ProviderHealth>>,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            // Assume online until the first probe says otherwise.
            internet: AtomicBool::new(true),
            providers: RwLock::new(HashMap::new()),
        }
    }

    pub fn internet_available(&self) -> bool {
        self.internet.load(Ordering::Relaxed)
    }

    /// Set the flag; returns the previous value so callers can log
    /// transitions.
    pub fn set_internet(&self, available: bool) -> bool {
        self.internet.swap(available, Ordering::Relaxed)
    }

    pub fn provider(&self, name: &str) -> Option<ProviderHealth> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Record the outcome of a health probe.
    pub fn record_probe(&self, name: &str, outcome: Result<usize, String>) {
        let now = Instant::now();
        let mut providers = self.providers.write().unwrap_or_else(PoisonError::into_inner);
        let entry = providers
            .entry(name.to_string())
            .or_insert_with(ProviderHealth::unknown);

        entry.last_check = Some(now);
        match outcome {
            Ok(_) => {
                entry.healthy = true;
                entry.error = None;
                entry.last_success = Some(now);
                entry.consecutive_failures = 0;
            }
            Err(err) => {
                entry.healthy = false;
                entry.error = Some(err);
                entry.last_failure = Some(now);
                entry.consecutive_failures += 1;
            }
        }
    }

    /// Immediate unhealthy verdict from the call path (safety timeout or
    /// unexpected transport collapse).
    pub fn mark_unhealthy(&self, name: &str, error: &str) {
        self.record_probe(name, Err(error.to_string()));
    }

    pub fn report(&self) -> HashMap<String, ProviderHealthReport> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, h)| {
                (
                    name.clone(),
                    ProviderHealthReport {
                        healthy: h.healthy,
                        error: h.error.clone(),
                        seconds_since_check: h.last_check.map(|t| t.elapsed().as_secs_f64()),
                        seconds_since_success: h.last_success.map(|t| t.elapsed().as_secs_f64()),
                        consecutive_failures: h.consecutive_failures,
                    },
                )
            })
            .collect()
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Background monitor
// ============================================================================

pub struct HealthMonitor {
    gateway: Arc<ToolGateway>,
    breakers: Arc<BreakerRegistry>,
    health: Arc<HealthState>,
    settings: Arc<RuntimeSettings>,
    started_at: Instant,
    /// Index of the next staggered startup probe to run.
    startup_stage: AtomicUsize,
    last_internet_check: Mutex<Option<Instant>>,
    last_steady_probe: Mutex<Option<Instant>>,
    last_recovery_test: Mutex<Option<Instant>>,
    last_core_recovery: Mutex<Option<Instant>>,
    last_zombie_scan: Mutex<Option<Instant>>,
}

impl HealthMonitor {
    pub fn new(
        gateway: Arc<ToolGateway>,
        breakers: Arc<BreakerRegistry>,
        health: Arc<HealthState>,
        settings: Arc<RuntimeSettings>,
    ) -> Self {
        Self {
            gateway,
            breakers,
            health,
            settings,
            started_at: Instant::now(),
            startup_stage: AtomicUsize::new(0),
            last_internet_check: Mutex::new(None),
            last_steady_probe: Mutex::new(None),
            last_recovery_test: Mutex::new(None),
            last_core_recovery: Mutex::new(None),
            last_zombie_scan: Mutex::new(None),
        }
    }

    /// Run the monitor until the task is aborted.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.tick().await;
                tokio::time::sleep(TICK).await;
            }
        })
    }

    pub async fn tick(&self) {
        self.check_internet().await;
        self.gateway.sweep_stdio_children().await;
        self.probe_providers().await;
        self.test_breaker_recovery().await;
        self.recover_core_services().await;
        self.reap_zombies().await;
    }

    // ------------------------------------------------------------------
    // Internet probe
    // ------------------------------------------------------------------

    async fn check_internet(&self) {
        if !due(&self.last_internet_check, self.settings.internet_check_interval) {
            return;
        }

        let available = internet_reachable().await;
        let was = self.health.set_internet(available);
        if was != available {
            if available {
                info!("internet connectivity RESTORED");
            } else {
                warn!("internet connectivity LOST");
            }
        }
    }

    // ------------------------------------------------------------------
    // Provider probes (staggered startup, then steady-state)
    // ------------------------------------------------------------------

    async fn probe_providers(&self) {
        let uptime = self.started_at.elapsed();

        if uptime < STARTUP_PROBES[STARTUP_PROBES.len() - 1] + STEADY_PROBE_INTERVAL {
            let stage = self.startup_stage.load(Ordering::Relaxed);
            if stage < STARTUP_PROBES.len() && uptime >= STARTUP_PROBES[stage] {
                self.startup_stage.store(stage + 1, Ordering::Relaxed);
                info!(
                    "startup health check at ~{}s ({} elapsed)",
                    STARTUP_PROBES[stage].as_secs(),
                    uptime.as_secs()
                );
                self.probe_round(|_| STARTUP_PROBE_TIMEOUT).await;
                // Push the steady-state clock out so the 60 s startup
                // probe is not immediately followed by a steady round.
                *self
                    .last_steady_probe
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
                return;
            }
            if stage < STARTUP_PROBES.len() {
                return;
            }
        }

        if !due(&self.last_steady_probe, STEADY_PROBE_INTERVAL) {
            return;
        }
        debug!("steady-state provider health check");
        self.probe_round(|core| if core { CORE_PROBE_TIMEOUT } else { STEADY_PROBE_TIMEOUT })
            .await;
    }

    async fn probe_round(&self, timeout_for: impl Fn(bool) -> Duration) {
        let names = self.gateway.provider_names();
        let mut checks = Vec::new();
        for name in names {
            let Some(cfg) = self.gateway.provider_config(&name) else { continue };
            if !cfg.enabled {
                continue;
            }
            let timeout = timeout_for(cfg.core);
            let gateway = self.gateway.clone();
            checks.push(async move {
                let outcome = gateway.probe(&name, timeout).await;
                (name, outcome)
            });
        }

        let results = futures::future::join_all(checks).await;
        let total = results.len();
        let mut healthy = 0usize;
        for (name, outcome) in results {
            if outcome.is_ok() {
                healthy += 1;
            } else if let Err(err) = &outcome {
                debug!("provider '{name}' unhealthy: {err}");
            }
            self.health.record_probe(&name, outcome);
        }
        if total > 0 {
            info!("provider health: {healthy}/{total} healthy");
        }
    }

    // ------------------------------------------------------------------
    // Breaker recovery testing
    // ------------------------------------------------------------------

    /// Drive open breakers through their half-open probe instead of
    /// waiting for organic traffic to do it.
    async fn test_breaker_recovery(&self) {
        if !due(&self.last_recovery_test, RECOVERY_TEST_INTERVAL) {
            return;
        }

        for snapshot in self.breakers.snapshots() {
            if snapshot.state != "open" || snapshot.permanently_disabled {
                continue;
            }
            let name = snapshot.name;
            if self.gateway.provider_config(&name).is_none() {
                continue;
            }
            // Only proceeds once the backoff expired; consumes the
            // half-open probe budget.
            if !self.breakers.is_allowed(&name) {
                continue;
            }

            info!("testing circuit breaker recovery for '{name}'");
            match self.gateway.probe(&name, STEADY_PROBE_TIMEOUT).await {
                Ok(_) => {
                    info!("provider '{name}' recovery test passed");
                    self.breakers.record_success(&name);
                }
                Err(err) => {
                    info!("provider '{name}' recovery test failed: {err}");
                    self.breakers.record_failure(&name, 1, Some(&err));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Core-service auto-recovery
    // ------------------------------------------------------------------

    async fn recover_core_services(&self) {
        if !due(&self.last_core_recovery, self.settings.core_recovery_interval) {
            return;
        }

        for name in self.gateway.core_provider_names() {
            let snapshot = self.breakers.breaker(&name).snapshot();
            if snapshot.state != "open" {
                continue;
            }

            info!("attempting automatic recovery for core provider '{name}'");
            self.breakers.reset(&name);
            // Gated call so the outcome lands on the freshly reset breaker.
            let outcome = self
                .gateway
                .call(&name, "tools/list", serde_json::json!({}), false)
                .await;
            if outcome.ok {
                info!("core provider '{name}' recovered");
            } else {
                warn!("core provider '{name}' recovery test failed: {}", outcome.error_text());
            }
        }
    }

    // ------------------------------------------------------------------
    // Zombie reaper
    // ------------------------------------------------------------------

    /// Kill provider-shaped processes older than five minutes that do not
    /// belong to our child set. Best effort only.
    async fn reap_zombies(&self) {
        if !due(&self.last_zombie_scan, ZOMBIE_SCAN_INTERVAL) {
            return;
        }

        #[cfg(unix)]
        {
            let patterns = self.gateway.stdio_command_names();
            if patterns.is_empty() {
                return;
            }
            let ours = self.gateway.stdio_child_pids().await;

            let listed = tokio::process::Command::new("ps")
                .args(["-eo", "pid,etime,command"])
                .output()
                .await;
            let output = match listed {
                Ok(output) => output,
                Err(err) => {
                    debug!("zombie scan skipped: {err}");
                    return;
                }
            };

            let text = String::from_utf8_lossy(&output.stdout);
            for line in text.lines().skip(1) {
                let mut parts = line.split_whitespace();
                let (Some(pid_raw), Some(etime)) = (parts.next(), parts.next()) else { continue };
                let command = parts.collect::<Vec<_>>().join(" ");
                let Ok(pid) = pid_raw.parse::<u32>() else { continue };

                if pid == std::process::id() || ours.contains(&pid) {
                    continue;
                }
                if !patterns.iter().any(|p| command.contains(p.as_str())) {
                    continue;
                }
                let Some(minutes) = parse_etime_minutes(etime) else { continue };
                if minutes <= ZOMBIE_AGE_MINUTES {
                    continue;
                }

                error!("ZOMBIE DETECTED: pid {pid} ({command}) running {etime}, terminating");
                let _ = tokio::process::Command::new("kill")
                    .args(["-9", pid_raw])
                    .status()
                    .await;
            }
        }
    }
}

/// Gate helper: true when `interval` has elapsed since the stored stamp,
/// updating the stamp.
fn due(slot: &Mutex<Option<Instant>>, interval: Duration) -> bool {
    let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
    let now = Instant::now();
    match *guard {
        Some(last) if now.duration_since(last) < interval => false,
        _ => {
            *guard = Some(now);
            true
        }
    }
}

/// Parse `ps` elapsed time (`[[dd-]hh:]mm:ss`) into whole minutes.
fn parse_etime_minutes(etime: &str) -> Option<u64> {
    let mut minutes = 0u64;
    let rest = match etime.split_once('-') {
        Some((days, rest)) => {
            minutes += days.parse::<u64>().ok()? * 24 * 60;
            rest
        }
        None => etime,
    };

    let fields: Vec<&str> = rest.split(':').collect();
    match fields.as_slice() {
        [hours, mins, _secs] => {
            minutes += hours.parse::<u64>().ok()? * 60 + mins.parse::<u64>().ok()?;
        }
        [mins, _secs] => {
            minutes += mins.parse::<u64>().ok()?;
        }
        _ => return None,
    }
    Some(minutes)
}

/// HEAD a handful of well-known targets in parallel with a fresh client;
/// reachable if any succeeds. A dedicated client avoids tying the check
/// to the shared pool's health.
async fn internet_reachable() -> bool {
    let Ok(client) = reqwest::Client::builder().timeout(INTERNET_TARGET_TIMEOUT).build() else {
        return false;
    };

    let checks: Vec<_> = INTERNET_TARGETS
        .iter()
        .map(|url| {
            let client = client.clone();
            let url = url.to_string();
            Box::pin(async move {
                match client.head(&url).send().await {
                    Ok(resp) if resp.status().as_u16() < 400 => Ok(()),
                    Ok(_) | Err(_) => Err(()),
                }
            }) as std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), ()>> + Send>>
        })
        .collect();

    futures::future::select_ok(checks).await.is_ok()
}
