use serde::{Deserialize, Serialize};

use super::metrics::DbStats;

/// WAL size above which the database reports itself degraded.
pub const WAL_SIZE_THRESHOLD: u64 = 256 * 1024 * 1024;

/// Overall verdict of a [`HealthCheck`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every check passed.
    Healthy,
    /// Serving, with at least one soft check failing.
    Degraded,
    /// Not able to serve writes.
    Unhealthy,
}

/// One health check and its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum Check {
    /// Live WAL size against the checkpoint threshold.
    WalSize {
        /// Bytes in the live WAL.
        bytes: u64,
        /// Degradation threshold.
        threshold: u64,
        /// Outcome.
        healthy: bool,
    },
    /// Index entries that pointed at missing nodes.
    IndexDrift {
        /// Drift events since open.
        events: u64,
        /// Outcome.
        healthy: bool,
    },
    /// Whether the database still accepts transactions.
    Open {
        /// Outcome.
        healthy: bool,
    },
    /// Whether every WAL flush so far succeeded.
    Durability {
        /// Outcome.
        healthy: bool,
    },
}

impl Check {
    fn healthy(&self) -> bool {
        match self {
            Check::WalSize { healthy, .. }
            | Check::IndexDrift { healthy, .. }
            | Check::Open { healthy }
            | Check::Durability { healthy } => *healthy,
        }
    }

    fn fatal(&self) -> bool {
        matches!(
            self,
            Check::Open { healthy: false } | Check::Durability { healthy: false }
        )
    }
}

/// Result of evaluating every check, served by `/health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Worst status across the checks.
    pub status: HealthStatus,
    /// Individual outcomes in evaluation order.
    pub checks: Vec<Check>,
}

impl HealthCheck {
    /// Healthy verdict with no checks.
    pub fn new() -> Self {
        Self {
            status: HealthStatus::Healthy,
            checks: Vec::new(),
        }
    }

    /// Evaluates the standard checks against a stats snapshot.
    pub fn from_stats(stats: &DbStats, open: bool) -> Self {
        let mut health = Self::new();
        health.add_check(Check::Open { healthy: open });
        health.add_check(Check::Durability {
            healthy: !stats.halted,
        });
        health.add_check(Check::WalSize {
            bytes: stats.wal_bytes,
            threshold: WAL_SIZE_THRESHOLD,
            healthy: stats.wal_bytes <= WAL_SIZE_THRESHOLD,
        });
        health.add_check(Check::IndexDrift {
            events: stats.index.drift_events,
            healthy: stats.index.drift_events == 0,
        });
        health
    }

    /// Records `check` and downgrades the status when it failed.
    pub fn add_check(&mut self, check: Check) {
        if !check.healthy() && self.status == HealthStatus::Healthy {
            self.status = HealthStatus::Degraded;
        }
        if check.fatal() {
            self.status = HealthStatus::Unhealthy;
        }
        self.checks.push(check);
    }

    /// True when every check passed.
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drift_degrades_and_closed_is_unhealthy() {
        let mut stats = DbStats::default();
        assert!(HealthCheck::from_stats(&stats, true).is_healthy());
        stats.index.drift_events = 2;
        assert_eq!(HealthCheck::from_stats(&stats, true).status, HealthStatus::Degraded);
        assert_eq!(HealthCheck::from_stats(&stats, false).status, HealthStatus::Unhealthy);
    }

    #[test]
    fn failed_flush_is_unhealthy_while_open() {
        let stats = DbStats {
            halted: true,
            ..DbStats::default()
        };
        let health = HealthCheck::from_stats(&stats, true);
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(health
            .checks
            .iter()
            .any(|c| matches!(c, Check::Durability { healthy: false })));
    }
}
