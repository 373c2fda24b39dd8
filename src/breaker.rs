//! Circuit breakers guarding model backends and tool providers.
//!
//! Every named target (a model identifier or a provider name) gets its own
//! breaker. Breakers are owned by the [`BreakerRegistry`] for the process
//! lifetime and mutated only through registry methods; each breaker holds
//! an internal mutex so its state transitions are total-ordered.
//!
//! Disable decisions are persisted through [`ConfigStore`] with a 5 s
//! debounce: each transition bumps a per-breaker version counter and
//! schedules a task that sleeps, re-checks the version, and writes only if
//! no newer transition superseded it.

use crate::config::{ConfigStore, DisabledReason};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

// ============================================================================
// States and policy
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation.
    Closed,
    /// Failing; calls are blocked until `disabled_until`.
    Open,
    /// Testing recovery with a bounded number of probes.
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Per-target tuning. Core services get higher tolerance and faster
/// recovery.
#[derive(Debug, Clone)]
pub struct BreakerPolicy {
    pub threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_tests: u32,
    pub max_recovery_attempts: u32,
    pub max_backoff: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_tests: 1,
            max_recovery_attempts: 10,
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl BreakerPolicy {
    pub fn core() -> Self {
        Self {
            threshold: 10,
            recovery_timeout: Duration::from_secs(30),
            ..Self::default()
        }
    }
}

// ============================================================================
// Single breaker
// ============================================================================

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_tests: u32,
    total_failures: u64,
    total_successes: u64,
    /// `None` while closed, and while permanently disabled (never expires).
    disabled_until: Option<Instant>,
    recovery_attempts: u32,
    permanently_disabled: bool,
    last_error: Option<String>,
    last_failure_at: Option<Instant>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            half_open_tests: 0,
            total_failures: 0,
            total_successes: 0,
            disabled_until: None,
            recovery_attempts: 0,
            permanently_disabled: false,
            last_error: None,
            last_failure_at: None,
        }
    }
}

/// Persistence request produced by a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PersistAction {
    None,
    Debounced {
        enabled: bool,
        reason: Option<DisabledReason>,
    },
    Immediate {
        enabled: bool,
        reason: Option<DisabledReason>,
    },
}

pub struct CircuitBreaker {
    name: String,
    policy: BreakerPolicy,
    inner: Mutex<BreakerInner>,
    persist_version: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, policy: BreakerPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            inner: Mutex::new(BreakerInner::new()),
            persist_version: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a call to this target should proceed. Open breakers whose
    /// backoff expired transition to half-open here; half-open breakers
    /// admit only the first `half_open_max_tests` probes.
    pub fn is_allowed(&self) -> bool {
        let mut inner = self.lock();

        if inner.permanently_disabled {
            return false;
        }

        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => match inner.disabled_until {
                Some(until) if Instant::now() >= until => {
                    info!(
                        "breaker '{}': entering half-open for recovery test (attempt {}/{})",
                        self.name,
                        inner.recovery_attempts + 1,
                        self.policy.max_recovery_attempts
                    );
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_tests = 1;
                    true
                }
                _ => false,
            },
            BreakerState::HalfOpen => {
                if inner.half_open_tests >= self.policy.half_open_max_tests {
                    false
                } else {
                    inner.half_open_tests += 1;
                    true
                }
            }
        }
    }

    fn record_success(&self) -> PersistAction {
        let mut inner = self.lock();
        inner.total_successes += 1;

        match inner.state {
            BreakerState::HalfOpen => {
                info!("breaker '{}': recovery successful, closing", self.name);
                inner.state = BreakerState::Closed;
                inner.consecutive_failures = 0;
                inner.half_open_tests = 0;
                inner.recovery_attempts = 0;
                inner.permanently_disabled = false;
                inner.disabled_until = None;
                PersistAction::Immediate {
                    enabled: true,
                    reason: None,
                }
            }
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
                PersistAction::None
            }
            BreakerState::Open => PersistAction::None,
        }
    }

    fn record_failure(&self, weight: u32, error: Option<&str>) -> PersistAction {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.total_failures += 1;
        inner.consecutive_failures += weight;
        inner.last_failure_at = Some(now);
        if let Some(err) = error {
            inner.last_error = Some(err.to_string());
        }

        match inner.state {
            BreakerState::HalfOpen => {
                inner.recovery_attempts += 1;
                inner.half_open_tests = 0;

                if inner.recovery_attempts >= self.policy.max_recovery_attempts {
                    inner.permanently_disabled = true;
                    inner.state = BreakerState::Open;
                    inner.disabled_until = None;
                    error!(
                        "breaker '{}': {} failed recovery attempts, permanently disabled until manual reset",
                        self.name, inner.recovery_attempts
                    );
                    PersistAction::Immediate {
                        enabled: false,
                        reason: Some(DisabledReason::PermanentlyDisabled),
                    }
                } else {
                    let shift = (inner.recovery_attempts - 1).min(16);
                    let backoff = self
                        .policy
                        .recovery_timeout
                        .checked_mul(1u32 << shift)
                        .map(|d| d.min(self.policy.max_backoff))
                        .unwrap_or(self.policy.max_backoff);
                    inner.state = BreakerState::Open;
                    inner.disabled_until = Some(now + backoff);
                    warn!(
                        "breaker '{}': recovery test failed ({}/{}), reopening for {:.0?}",
                        self.name, inner.recovery_attempts, self.policy.max_recovery_attempts, backoff
                    );
                    PersistAction::Debounced {
                        enabled: false,
                        reason: Some(DisabledReason::CircuitBreakerOpened),
                    }
                }
            }
            BreakerState::Closed => {
                if inner.consecutive_failures >= self.policy.threshold {
                    inner.state = BreakerState::Open;
                    inner.disabled_until = Some(now + self.policy.recovery_timeout);
                    error!(
                        "breaker '{}': threshold {} reached, opening. last error: {:?}",
                        self.name, self.policy.threshold, inner.last_error
                    );
                    PersistAction::Debounced {
                        enabled: false,
                        reason: Some(DisabledReason::CircuitBreakerOpened),
                    }
                } else {
                    debug!(
                        "breaker '{}': failure {}/{}",
                        self.name, inner.consecutive_failures, self.policy.threshold
                    );
                    PersistAction::None
                }
            }
            BreakerState::Open => PersistAction::None,
        }
    }

    /// Manual override back to closed; clears permanent disable too.
    pub fn reset(&self) {
        let mut inner = self.lock();
        info!("breaker '{}': manual reset to closed", self.name);
        let total_failures = inner.total_failures;
        let total_successes = inner.total_successes;
        *inner = BreakerInner {
            total_failures,
            total_successes,
            ..BreakerInner::new()
        };
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        let seconds_remaining = match (inner.state, inner.disabled_until) {
            (BreakerState::Open, Some(until)) => {
                Some(until.saturating_duration_since(Instant::now()).as_secs_f64())
            }
            _ => None,
        };
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state.as_str().to_string(),
            consecutive_failures: inner.consecutive_failures,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            recovery_attempts: inner.recovery_attempts,
            permanently_disabled: inner.permanently_disabled,
            seconds_remaining,
            last_error: inner.last_error.clone(),
        }
    }
}

/// Point-in-time view of one breaker, for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: String,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub recovery_attempts: u32,
    pub permanently_disabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds_remaining: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

// ============================================================================
// Registry
// ============================================================================

const ALLOWED_CACHE_TTL: Duration = Duration::from_secs(1);

pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    core_targets: HashSet<String>,
    store: Option<Arc<dyn ConfigStore>>,
    /// `is_allowed` is on the hot path of every tool and model call;
    /// closed-state answers are cached briefly and invalidated by any
    /// `record_*` call for the target.
    allowed_cache: Mutex<HashMap<String, (bool, Instant)>>,
    debounce: Duration,
}

impl BreakerRegistry {
    pub fn new(core_targets: HashSet<String>, store: Option<Arc<dyn ConfigStore>>) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            core_targets,
            store,
            allowed_cache: Mutex::new(HashMap::new()),
            debounce: Duration::from_secs(5),
        }
    }

    /// Override the persistence debounce window (used by tests).
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Fetch or create the breaker for a target.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(found) = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return found.clone();
        }

        let mut writable = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        writable
            .entry(name.to_string())
            .or_insert_with(|| {
                let policy = if self.core_targets.contains(name) {
                    debug!("breaker '{name}': using core-service policy");
                    BreakerPolicy::core()
                } else {
                    BreakerPolicy::default()
                };
                Arc::new(CircuitBreaker::new(name, policy))
            })
            .clone()
    }

    pub fn is_allowed(&self, name: &str) -> bool {
        let now = Instant::now();
        {
            let cache = self.allowed_cache.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some((allowed, stamp)) = cache.get(name) {
                if now.duration_since(*stamp) < ALLOWED_CACHE_TTL {
                    return *allowed;
                }
            }
        }

        let breaker = self.breaker(name);
        let allowed = breaker.is_allowed();

        // Only closed-state answers are safe to reuse: half-open admission
        // is a counted budget and must see every caller.
        if breaker.state() == BreakerState::Closed {
            self.allowed_cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(name.to_string(), (allowed, now));
        }

        allowed
    }

    pub fn record_success(&self, name: &str) {
        let breaker = self.breaker(name);
        let action = breaker.record_success();
        self.invalidate(name);
        self.apply_persist(&breaker, action);
    }

    pub fn record_failure(&self, name: &str, weight: u32, error: Option<&str>) {
        let breaker = self.breaker(name);
        let action = breaker.record_failure(weight.max(1), error);
        self.invalidate(name);
        self.apply_persist(&breaker, action);
    }

    pub fn reset(&self, name: &str) {
        if let Some(breaker) = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            breaker.reset();
        }
        self.invalidate(name);
    }

    pub fn reset_all(&self) {
        for breaker in self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
        {
            breaker.reset();
        }
        self.allowed_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut all: Vec<BreakerSnapshot> = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|b| b.snapshot())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// True iff every monitored breaker in `critical` is open. Indicates a
    /// dependency deadlock where targets cannot recover because they wait
    /// on each other.
    pub fn detect_system_lockdown(&self, critical: &[String]) -> bool {
        let breakers = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
        let mut monitored = 0usize;
        let mut down = 0usize;
        for name in critical {
            if let Some(breaker) = breakers.get(name) {
                monitored += 1;
                if breaker.state() == BreakerState::Open {
                    down += 1;
                }
            }
        }
        monitored > 0 && down == monitored
    }

    /// Force-reset the critical set to break a detected deadlock.
    pub fn emergency_release_lockdown(&self, critical: &[String]) {
        for name in critical {
            error!("CRITICAL: forcing reset of breaker '{name}' to break system lockdown");
            self.reset(name);
        }
    }

    fn invalidate(&self, name: &str) {
        self.allowed_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    fn apply_persist(&self, breaker: &Arc<CircuitBreaker>, action: PersistAction) {
        let (delay, enabled, reason) = match action {
            PersistAction::None => return,
            PersistAction::Debounced { enabled, reason } => (self.debounce, enabled, reason),
            PersistAction::Immediate { enabled, reason } => (Duration::ZERO, enabled, reason),
        };

        let Some(store) = self.store.clone() else {
            return;
        };

        // New transitions bump the version; a sleeping writer that wakes up
        // to a different version exits without writing.
        let version = breaker.persist_version.fetch_add(1, Ordering::SeqCst) + 1;
        let breaker = breaker.clone();

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("breaker '{}': no runtime, skipping persistence", breaker.name());
            return;
        };
        handle.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if breaker.persist_version.load(Ordering::SeqCst) != version {
                return;
            }
            if let Err(err) = store.persist_provider_state(breaker.name(), enabled, reason).await {
                warn!("breaker '{}': persistence failed: {err}", breaker.name());
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeError;
    use async_trait::async_trait;

    fn fast_policy() -> BreakerPolicy {
        BreakerPolicy {
            threshold: 3,
            recovery_timeout: Duration::from_millis(20),
            half_open_max_tests: 1,
            max_recovery_attempts: 3,
            max_backoff: Duration::from_millis(100),
        }
    }

    #[test]
    fn test_closed_to_open_on_threshold() {
        let breaker = CircuitBreaker::new("svc", fast_policy());
        assert!(breaker.is_allowed());

        breaker.record_failure(1, Some("boom"));
        breaker.record_failure(1, None);
        assert_eq!(breaker.state(), BreakerState::Closed);

        let action = breaker.record_failure(1, None);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.is_allowed());
        assert!(matches!(action, PersistAction::Debounced { enabled: false, .. }));
    }

    #[test]
    fn test_open_to_half_open_to_closed() {
        let breaker = CircuitBreaker::new("svc", fast_policy());
        for _ in 0..3 {
            breaker.record_failure(1, None);
        }
        assert!(!breaker.is_allowed());

        std::thread::sleep(Duration::from_millis(30));
        // Backoff elapsed: the next caller is the half-open probe.
        assert!(breaker.is_allowed());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        // Probe budget (1) consumed; the next caller is rejected.
        assert!(!breaker.is_allowed());

        let action = breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.is_allowed());
        assert!(matches!(action, PersistAction::Immediate { enabled: true, reason: None }));
    }

    #[test]
    fn test_half_open_failure_reopens_with_backoff() {
        let breaker = CircuitBreaker::new("svc", fast_policy());
        for _ in 0..3 {
            breaker.record_failure(1, None);
        }
        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.is_allowed());

        breaker.record_failure(1, Some("still down"));
        assert_eq!(breaker.state(), BreakerState::Open);

        let snap = breaker.snapshot();
        assert_eq!(snap.recovery_attempts, 1);
        assert!(!snap.permanently_disabled);
    }

    #[test]
    fn test_permanent_disable_after_max_recovery_attempts() {
        let breaker = CircuitBreaker::new("svc", fast_policy());
        for _ in 0..3 {
            breaker.record_failure(1, None);
        }

        // Three failed recovery rounds (max_recovery_attempts = 3).
        for round in 0..3 {
            std::thread::sleep(Duration::from_millis(110));
            assert!(breaker.is_allowed(), "probe {round} should be admitted");
            breaker.record_failure(1, Some("dead"));
        }

        let snap = breaker.snapshot();
        assert_eq!(snap.state, "open");
        assert!(snap.permanently_disabled);
        assert!(snap.seconds_remaining.is_none());

        // Blocked forever, regardless of elapsed time.
        std::thread::sleep(Duration::from_millis(120));
        assert!(!breaker.is_allowed());

        // Until a manual reset.
        breaker.reset();
        assert!(breaker.is_allowed());
        assert!(!breaker.snapshot().permanently_disabled);
    }

    #[test]
    fn test_weighted_failures() {
        let breaker = CircuitBreaker::new("svc", fast_policy());
        breaker.record_failure(3, Some("process crash"));
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_recovery_idempotence_after_reset() {
        let breaker = CircuitBreaker::new("svc", fast_policy());
        for _ in 0..3 {
            breaker.record_failure(1, None);
        }
        breaker.reset();

        breaker.record_success();
        breaker.record_success();

        let snap = breaker.snapshot();
        assert_eq!(snap.state, "closed");
        assert_eq!(snap.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_registry_cache_invalidation() {
        let registry = BreakerRegistry::new(HashSet::new(), None);
        assert!(registry.is_allowed("svc"));

        // Open the breaker; the cached `true` must not survive.
        for _ in 0..5 {
            registry.record_failure("svc", 1, None);
        }
        assert!(!registry.is_allowed("svc"));
    }

    #[tokio::test]
    async fn test_registry_core_policy() {
        let core: HashSet<String> = ["memory".to_string()].into_iter().collect();
        let registry = BreakerRegistry::new(core, None);

        // Five failures open a default breaker but not a core one.
        for _ in 0..5 {
            registry.record_failure("memory", 1, None);
            registry.record_failure("other", 1, None);
        }
        assert!(registry.is_allowed("memory"));
        assert!(!registry.is_allowed("other"));
    }

    #[test]
    fn test_lockdown_detection() {
        let registry = BreakerRegistry::new(HashSet::new(), None);
        let critical = vec!["a".to_string(), "b".to_string()];

        assert!(!registry.detect_system_lockdown(&critical));

        for _ in 0..5 {
            registry.record_failure("a", 1, None);
        }
        assert!(!registry.detect_system_lockdown(&critical));

        for _ in 0..5 {
            registry.record_failure("b", 1, None);
        }
        assert!(registry.detect_system_lockdown(&critical));

        registry.emergency_release_lockdown(&critical);
        assert!(!registry.detect_system_lockdown(&critical));
        assert!(registry.is_allowed("a"));
    }

    struct RecordingStore {
        writes: std::sync::Mutex<Vec<(String, bool, Option<DisabledReason>)>>,
    }

    #[async_trait]
    impl ConfigStore for RecordingStore {
        async fn persist_provider_state(
            &self,
            name: &str,
            enabled: bool,
            reason: Option<DisabledReason>,
        ) -> Result<(), RuntimeError> {
            self.writes
                .lock()
                .unwrap()
                .push((name.to_string(), enabled, reason));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_debounced_persistence_single_write() {
        let store = Arc::new(RecordingStore {
            writes: std::sync::Mutex::new(Vec::new()),
        });
        let registry = BreakerRegistry::new(HashSet::new(), Some(store.clone()))
            .with_debounce(Duration::from_millis(30));

        for _ in 0..5 {
            registry.record_failure("svc", 1, Some("down"));
        }
        // Transition happened; the write is still pending.
        assert!(store.writes.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(80)).await;

        let writes = store.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(
            writes[0],
            (
                "svc".to_string(),
                false,
                Some(DisabledReason::CircuitBreakerOpened)
            )
        );
    }

    #[tokio::test]
    async fn test_debounced_persistence_superseded_by_newer_transition() {
        let store = Arc::new(RecordingStore {
            writes: std::sync::Mutex::new(Vec::new()),
        });
        let registry = BreakerRegistry::new(HashSet::new(), Some(store.clone()))
            .with_debounce(Duration::from_millis(40));

        // Trip the breaker (schedules a debounced disable) ...
        for _ in 0..5 {
            registry.record_failure("svc", 1, None);
        }
        // ... then recover within the debounce window. The half-open probe
        // succeeds, which persists enabled=true immediately and cancels the
        // pending disable.
        registry.breaker("svc").lock().state = BreakerState::HalfOpen;
        registry.record_success("svc");

        tokio::time::sleep(Duration::from_millis(100)).await;

        let writes = store.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0], ("svc".to_string(), true, None));
    }
}
