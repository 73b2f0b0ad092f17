//! Pool health derived from periodic probe results

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Failure streak at which a pool is reported unhealthy.
const UNHEALTHY_AFTER: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn from_failures(consecutive_failures: u32) -> Self {
        match consecutive_failures {
            0 => Self::Healthy,
            n if n < UNHEALTHY_AFTER => Self::Degraded,
            _ => Self::Unhealthy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolHealth {
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub latency_ms: f64,
    pub last_check_time: Option<DateTime<Utc>>,
}

impl Default for PoolHealth {
    fn default() -> Self {
        Self {
            is_healthy: true,
            consecutive_failures: 0,
            latency_ms: 0.0,
            last_check_time: None,
        }
    }
}

impl PoolHealth {
    pub fn record_success(&mut self, latency: Duration) {
        self.consecutive_failures = 0;
        self.is_healthy = true;
        self.latency_ms = latency.as_secs_f64() * 1000.0;
        self.last_check_time = Some(Utc::now());
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.is_healthy = self.consecutive_failures < UNHEALTHY_AFTER;
        self.last_check_time = Some(Utc::now());
    }

    pub fn status(&self) -> HealthStatus {
        HealthStatus::from_failures(self.consecutive_failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_failure_streak() {
        assert_eq!(HealthStatus::from_failures(0), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_failures(1), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_failures(2), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_failures(3), HealthStatus::Unhealthy);
        assert_eq!(HealthStatus::from_failures(40), HealthStatus::Unhealthy);
    }

    #[test]
    fn success_resets_streak() {
        let mut health = PoolHealth::default();
        for _ in 0..3 {
            health.record_failure();
        }
        assert!(!health.is_healthy);
        assert_eq!(health.status(), HealthStatus::Unhealthy);

        health.record_success(Duration::from_millis(4));
        assert!(health.is_healthy);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.latency_ms, 4.0);
        assert_eq!(health.status(), HealthStatus::Healthy);
    }
}
