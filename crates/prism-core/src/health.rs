use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use prism_common::{ApiFormat, KeyId};

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Rolling sample window per (key, format).
    pub window: usize,
    /// Minimum samples before the failure-rate breaker can trip.
    pub min_samples: usize,
    pub failure_rate_threshold: f64,
    /// Consecutive auth failures that open the breaker outright.
    pub auth_failure_threshold: u32,
    pub breaker_base_backoff: Duration,
    pub breaker_max_backoff: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window: 20,
            min_samples: 5,
            failure_rate_threshold: 0.5,
            auth_failure_threshold: 2,
            breaker_base_backoff: Duration::from_secs(30),
            breaker_max_backoff: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdaptiveRpmConfig {
    pub initial_limit: u32,
    /// Multiplicative decrease on an explicit rate-limit signal.
    pub decrease_factor: f64,
    /// Additive increase on sustained success near the learned limit.
    pub increase_step: u32,
    pub ceiling: u32,
    pub cooldown: Duration,
    /// Upshift only when the observed rpm is at least this share of the
    /// learned limit (the key is actually being pushed).
    pub upshift_usage_ratio: f64,
}

impl Default for AdaptiveRpmConfig {
    fn default() -> Self {
        Self {
            initial_limit: 10,
            decrease_factor: 0.5,
            increase_step: 1,
            ceiling: 300,
            cooldown: Duration::from_secs(30),
            upshift_usage_ratio: 0.8,
        }
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    open: bool,
    next_probe_at: Option<Instant>,
    backoff_level: u32,
}

#[derive(Debug, Default)]
struct KeyHealth {
    samples: VecDeque<(bool, Instant)>,
    consecutive_auth_failures: u32,
    breaker: BreakerState,
}

#[derive(Debug, Default)]
struct AdaptiveState {
    learned: Option<u32>,
    last_change: Option<Instant>,
}

/// Per-(key, format) health windows and circuit breakers, plus the
/// per-key adaptive RPM controller. In-process state: each worker learns
/// independently; the shared RPM counters still live in Redis.
pub struct HealthMonitor {
    config: HealthConfig,
    adaptive_config: AdaptiveRpmConfig,
    health: Mutex<HashMap<(KeyId, ApiFormat), KeyHealth>>,
    adaptive: Mutex<HashMap<KeyId, AdaptiveState>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, adaptive_config: AdaptiveRpmConfig) -> Self {
        Self {
            config,
            adaptive_config,
            health: Mutex::new(HashMap::new()),
            adaptive: Mutex::new(HashMap::new()),
        }
    }

    /// True while the breaker excludes this (key, format) from candidate
    /// lists. Once the probe time passes the pair is admitted again for a
    /// single attempt; success closes the breaker, failure re-opens it
    /// with doubled backoff.
    pub fn is_excluded(&self, key_id: KeyId, format: ApiFormat) -> bool {
        let guard = self.lock_health();
        let Some(health) = guard.get(&(key_id, format)) else {
            return false;
        };
        health.breaker.open
            && health
                .breaker
                .next_probe_at
                .is_some_and(|at| Instant::now() < at)
    }

    pub fn record_success(&self, key_id: KeyId, format: ApiFormat) {
        let mut guard = self.lock_health();
        let health = guard.entry((key_id, format)).or_default();
        push_sample(health, true, self.config.window);
        health.consecutive_auth_failures = 0;
        if health.breaker.open {
            health.breaker = BreakerState::default();
            tracing::info!(key_id, format = format.as_str(), "circuit breaker closed");
        }
    }

    pub fn record_failure(&self, key_id: KeyId, format: ApiFormat, auth_failure: bool) {
        let mut guard = self.lock_health();
        let health = guard.entry((key_id, format)).or_default();
        push_sample(health, false, self.config.window);

        if auth_failure {
            health.consecutive_auth_failures += 1;
        } else {
            health.consecutive_auth_failures = 0;
        }

        let probing = health.breaker.open
            && health
                .breaker
                .next_probe_at
                .is_some_and(|at| Instant::now() >= at);

        let should_open = probing
            || health.consecutive_auth_failures >= self.config.auth_failure_threshold
            || self.failure_rate_exceeded(health);
        if should_open {
            let level = if health.breaker.open {
                health.breaker.backoff_level + 1
            } else {
                0
            };
            let backoff = self
                .config
                .breaker_base_backoff
                .saturating_mul(1u32 << level.min(16))
                .min(self.config.breaker_max_backoff);
            health.breaker = BreakerState {
                open: true,
                next_probe_at: Some(Instant::now() + backoff),
                backoff_level: level,
            };
            tracing::warn!(
                key_id,
                format = format.as_str(),
                backoff_secs = backoff.as_secs(),
                "circuit breaker opened",
            );
        }
    }

    /// Health score in [0, 1] for operators; 1.0 with no samples.
    pub fn score(&self, key_id: KeyId, format: ApiFormat) -> f64 {
        let guard = self.lock_health();
        let Some(health) = guard.get(&(key_id, format)) else {
            return 1.0;
        };
        if health.samples.is_empty() {
            return 1.0;
        }
        let ok = health.samples.iter().filter(|(ok, _)| *ok).count();
        ok as f64 / health.samples.len() as f64
    }

    pub fn learned_rpm(&self, key_id: KeyId) -> Option<u32> {
        self.lock_adaptive().get(&key_id).and_then(|s| s.learned)
    }

    /// Multiplicative decrease on an explicit upstream rate-limit signal.
    pub fn note_rate_limited(&self, key_id: KeyId, effective_limit: u32) {
        let mut guard = self.lock_adaptive();
        let state = guard.entry(key_id).or_default();
        let current = state.learned.unwrap_or(effective_limit);
        let lowered =
            ((f64::from(current) * self.adaptive_config.decrease_factor) as u32).max(1);
        state.learned = Some(lowered);
        state.last_change = Some(Instant::now());
        tracing::info!(key_id, lowered, "adaptive rpm limit decreased");
    }

    /// Additive increase once successes run near the learned limit, with a
    /// ceiling and a cool-down between steps.
    pub fn note_success_at(&self, key_id: KeyId, observed_rpm: i64, effective_limit: u32) {
        let mut guard = self.lock_adaptive();
        let state = guard.entry(key_id).or_default();
        let current = state.learned.unwrap_or(self.adaptive_config.initial_limit);
        if current >= self.adaptive_config.ceiling {
            return;
        }
        let near_limit = observed_rpm.max(0) as f64
            >= f64::from(effective_limit) * self.adaptive_config.upshift_usage_ratio;
        if !near_limit {
            return;
        }
        if state
            .last_change
            .is_some_and(|at| at.elapsed() < self.adaptive_config.cooldown)
        {
            return;
        }
        state.learned = Some(
            (current + self.adaptive_config.increase_step).min(self.adaptive_config.ceiling),
        );
        state.last_change = Some(Instant::now());
    }

    fn failure_rate_exceeded(&self, health: &KeyHealth) -> bool {
        if health.samples.len() < self.config.min_samples {
            return false;
        }
        let failures = health.samples.iter().filter(|(ok, _)| !*ok).count();
        failures as f64 / health.samples.len() as f64 >= self.config.failure_rate_threshold
    }

    fn lock_health(&self) -> std::sync::MutexGuard<'_, HashMap<(KeyId, ApiFormat), KeyHealth>> {
        match self.health.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_adaptive(&self) -> std::sync::MutexGuard<'_, HashMap<KeyId, AdaptiveState>> {
        match self.adaptive.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthConfig::default(), AdaptiveRpmConfig::default())
    }
}

fn push_sample(health: &mut KeyHealth, ok: bool, window: usize) {
    health.samples.push_back((ok, Instant::now()));
    while health.samples.len() > window {
        health.samples.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: KeyId = 7;
    const FMT: ApiFormat = ApiFormat::Claude;

    #[test]
    fn auth_failures_open_after_threshold() {
        let monitor = HealthMonitor::default();
        monitor.record_failure(KEY, FMT, true);
        assert!(!monitor.is_excluded(KEY, FMT));
        monitor.record_failure(KEY, FMT, true);
        assert!(monitor.is_excluded(KEY, FMT));
    }

    #[test]
    fn success_closes_the_breaker() {
        let monitor = HealthMonitor::default();
        monitor.record_failure(KEY, FMT, true);
        monitor.record_failure(KEY, FMT, true);
        assert!(monitor.is_excluded(KEY, FMT));
        monitor.record_success(KEY, FMT);
        assert!(!monitor.is_excluded(KEY, FMT));
    }

    #[test]
    fn probe_is_allowed_after_backoff() {
        let config = HealthConfig {
            breaker_base_backoff: Duration::from_millis(0),
            ..HealthConfig::default()
        };
        let monitor = HealthMonitor::new(config, AdaptiveRpmConfig::default());
        monitor.record_failure(KEY, FMT, true);
        monitor.record_failure(KEY, FMT, true);
        // Zero backoff: probe time has already passed.
        assert!(!monitor.is_excluded(KEY, FMT));
    }

    #[test]
    fn failure_rate_trips_breaker() {
        let monitor = HealthMonitor::default();
        for _ in 0..3 {
            monitor.record_success(KEY, FMT);
        }
        for _ in 0..4 {
            monitor.record_failure(KEY, FMT, false);
        }
        assert!(monitor.is_excluded(KEY, FMT));
        assert!(monitor.score(KEY, FMT) < 0.5);
    }

    #[test]
    fn adaptive_decrease_halves_and_floors_at_one() {
        let monitor = HealthMonitor::default();
        monitor.note_rate_limited(KEY, 10);
        assert_eq!(monitor.learned_rpm(KEY), Some(5));
        for _ in 0..10 {
            monitor.note_rate_limited(KEY, 10);
        }
        assert_eq!(monitor.learned_rpm(KEY), Some(1));
    }

    #[test]
    fn adaptive_increase_needs_load_near_limit() {
        let config = AdaptiveRpmConfig {
            cooldown: Duration::from_millis(0),
            ..AdaptiveRpmConfig::default()
        };
        let monitor = HealthMonitor::new(HealthConfig::default(), config);
        // Idle key: no upshift.
        monitor.note_success_at(KEY, 1, 10);
        assert_eq!(monitor.learned_rpm(KEY), None);
        // Running at the limit: additive step.
        monitor.note_success_at(KEY, 9, 10);
        assert_eq!(monitor.learned_rpm(KEY), Some(11));
    }
}
