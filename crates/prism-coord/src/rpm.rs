use std::sync::Arc;
use std::time::Duration;

use prism_common::KeyId;

use crate::{CoordResult, CoordinationStore, keys};

#[derive(Debug, Clone)]
pub struct RpmGuardConfig {
    /// Fallback limit for adaptive keys that have not learned one yet.
    pub initial_limit: u32,
    pub window: Duration,
    pub reservation: ReservationConfig,
}

impl Default for RpmGuardConfig {
    fn default() -> Self {
        Self {
            initial_limit: 10,
            window: Duration::from_secs(60),
            reservation: ReservationConfig::default(),
        }
    }
}

/// Dynamic-reservation policy: a slice of each key's RPM budget is held
/// back for cache-affinity traffic so sticky clients keep their discount
/// under load.
#[derive(Debug, Clone)]
pub struct ReservationConfig {
    /// Below this many observed requests the key is still in probe phase.
    pub probe_threshold: u64,
    pub probe_ratio: f64,
    pub min_ratio: f64,
    pub max_ratio: f64,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            probe_threshold: 50,
            probe_ratio: 0.10,
            min_ratio: 0.05,
            max_ratio: 0.30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationPhase {
    Probe,
    Stable,
}

#[derive(Debug, Clone, Copy)]
pub struct ReservationResult {
    pub ratio: f64,
    pub phase: ReservationPhase,
}

/// Probe phase keeps the reservation low while little is known about the
/// key; stable phase scales it with observed load between min and max.
pub fn calculate_reservation(
    config: &ReservationConfig,
    observed_requests: u64,
    current_usage: i64,
    effective_limit: u32,
) -> ReservationResult {
    if observed_requests < config.probe_threshold {
        return ReservationResult {
            ratio: config.probe_ratio,
            phase: ReservationPhase::Probe,
        };
    }
    let load = if effective_limit == 0 {
        1.0
    } else {
        (current_usage.max(0) as f64 / f64::from(effective_limit)).clamp(0.0, 1.0)
    };
    ReservationResult {
        ratio: config.min_ratio + (config.max_ratio - config.min_ratio) * load,
        phase: ReservationPhase::Stable,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RpmAdmission {
    pub admitted: bool,
    /// Counter value observed before the increment.
    pub observed: i64,
    pub limit: u32,
    pub reservation: ReservationResult,
}

/// Per-key RPM admission guard over the shared counter window.
///
/// Counters are never decremented; the window TTL releases capacity. A
/// rejected attempt leaves the counter untouched.
pub struct RpmGuard {
    store: Arc<dyn CoordinationStore>,
    config: RpmGuardConfig,
}

impl RpmGuard {
    pub fn new(store: Arc<dyn CoordinationStore>, config: RpmGuardConfig) -> Self {
        Self { store, config }
    }

    pub fn effective_limit(&self, rpm_limit: Option<u32>, learned: Option<u32>) -> u32 {
        rpm_limit
            .or(learned)
            .unwrap_or(self.config.initial_limit)
            .max(1)
    }

    pub async fn admit(
        &self,
        key_id: KeyId,
        effective_limit: u32,
        is_cached: bool,
    ) -> CoordResult<RpmAdmission> {
        let counter_key = keys::rpm_counter(key_id);
        let observed = self.store.get_i64(&counter_key).await?.unwrap_or(0);
        let observed_total = self
            .store
            .get_i64(&keys::rpm_observed(key_id))
            .await?
            .unwrap_or(0)
            .max(0) as u64;

        let reservation = calculate_reservation(
            &self.config.reservation,
            observed_total,
            observed,
            effective_limit,
        );

        let threshold = if is_cached {
            i64::from(effective_limit)
        } else {
            (f64::from(effective_limit) * (1.0 - reservation.ratio)).floor() as i64
        };

        if observed >= threshold {
            return Ok(RpmAdmission {
                admitted: false,
                observed,
                limit: effective_limit,
                reservation,
            });
        }

        self.store
            .incr_with_ttl(&counter_key, self.config.window)
            .await?;
        self.store
            .incr_with_ttl(&keys::rpm_observed(key_id), Duration::from_secs(3600))
            .await?;

        Ok(RpmAdmission {
            admitted: true,
            observed,
            limit: effective_limit,
            reservation,
        })
    }

    /// Current window counter, for telemetry.
    pub async fn current_count(&self, key_id: KeyId) -> CoordResult<i64> {
        Ok(self
            .store
            .get_i64(&keys::rpm_counter(key_id))
            .await?
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    fn guard() -> RpmGuard {
        RpmGuard::new(Arc::new(MemoryStore::new()), RpmGuardConfig::default())
    }

    #[tokio::test]
    async fn admits_up_to_reserved_share_for_non_cached() {
        // Probe phase with ratio 0.2 against limit 60: floor(60 * 0.8) = 48.
        let config = RpmGuardConfig {
            reservation: ReservationConfig {
                probe_threshold: 1_000_000,
                probe_ratio: 0.2,
                ..ReservationConfig::default()
            },
            ..RpmGuardConfig::default()
        };
        let guard = RpmGuard::new(Arc::new(MemoryStore::new()), config);

        let mut admitted = 0;
        for _ in 0..50 {
            if guard.admit(7, 60, false).await.unwrap().admitted {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 48);

        // Cache-affinity traffic can still use the reserved slice.
        let mut cached_admitted = 0;
        for _ in 0..20 {
            if guard.admit(7, 60, true).await.unwrap().admitted {
                cached_admitted += 1;
            }
        }
        assert_eq!(cached_admitted, 12);
    }

    #[tokio::test]
    async fn rejection_does_not_consume_capacity() {
        let guard = guard();
        // initial_limit 10, probe ratio 0.1 -> floor(9) non-cached slots.
        for _ in 0..9 {
            assert!(guard.admit(1, 10, false).await.unwrap().admitted);
        }
        assert!(!guard.admit(1, 10, false).await.unwrap().admitted);
        assert_eq!(guard.current_count(1).await.unwrap(), 9);
        // Cached attempt still fits into the reserved slot.
        assert!(guard.admit(1, 10, true).await.unwrap().admitted);
    }

    #[tokio::test]
    async fn effective_limit_prefers_fixed_then_learned() {
        let guard = guard();
        assert_eq!(guard.effective_limit(Some(120), Some(40)), 120);
        assert_eq!(guard.effective_limit(None, Some(40)), 40);
        assert_eq!(guard.effective_limit(None, None), 10);
    }

    #[test]
    fn reservation_phases() {
        let config = ReservationConfig::default();
        let probe = calculate_reservation(&config, 10, 0, 60);
        assert_eq!(probe.phase, ReservationPhase::Probe);
        assert!((probe.ratio - 0.10).abs() < 1e-9);

        let idle = calculate_reservation(&config, 1_000, 0, 60);
        assert_eq!(idle.phase, ReservationPhase::Stable);
        assert!((idle.ratio - 0.05).abs() < 1e-9);

        let saturated = calculate_reservation(&config, 1_000, 60, 60);
        assert!((saturated.ratio - 0.30).abs() < 1e-9);
    }
}
