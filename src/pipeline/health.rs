//! Health monitoring and metrics for a relayed pipeline

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

/// Health metrics for a pipeline
///
/// Updated from engine streaming threads and the event loop, so every field is
/// atomic.
pub struct RelayHealth {
    /// Data units handed to the consumer
    pub units_relayed: AtomicU64,

    /// Payload bytes handed to the consumer
    pub bytes_relayed: AtomicU64,

    /// "Unit ready" notifications that had nothing to pull
    pub empty_notifications: AtomicU64,

    /// Stats snapshots forwarded
    pub stats_samples: AtomicU64,

    /// Stats snapshots that could not be decoded
    pub stats_decode_failures: AtomicU64,

    /// Feedback buffers accepted by an ingestion point
    pub feedback_pushes: AtomicU64,

    /// Feedback buffers refused by an ingestion point
    pub feedback_failures: AtomicU64,

    /// Timestamp (as Unix microseconds) of the last relayed unit
    pub last_unit_time: AtomicU64,
}

impl RelayHealth {
    /// Create a new health metrics instance
    pub fn new() -> Self {
        Self {
            units_relayed: AtomicU64::new(0),
            bytes_relayed: AtomicU64::new(0),
            empty_notifications: AtomicU64::new(0),
            stats_samples: AtomicU64::new(0),
            stats_decode_failures: AtomicU64::new(0),
            feedback_pushes: AtomicU64::new(0),
            feedback_failures: AtomicU64::new(0),
            last_unit_time: AtomicU64::new(now_micros()),
        }
    }

    /// Record a unit handed to the consumer
    pub fn record_unit(&self, size: usize) {
        self.last_unit_time.store(now_micros(), Ordering::Relaxed);
        self.units_relayed.fetch_add(1, Ordering::Relaxed);
        self.bytes_relayed.fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn record_empty_notification(&self) {
        self.empty_notifications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stats_sample(&self) {
        self.stats_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stats_decode_failure(&self) {
        self.stats_decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_feedback_push(&self) {
        self.feedback_pushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_feedback_failure(&self) {
        self.feedback_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn units_relayed(&self) -> u64 {
        self.units_relayed.load(Ordering::Relaxed)
    }

    pub fn bytes_relayed(&self) -> u64 {
        self.bytes_relayed.load(Ordering::Relaxed)
    }

    pub fn empty_notifications(&self) -> u64 {
        self.empty_notifications.load(Ordering::Relaxed)
    }

    pub fn stats_samples(&self) -> u64 {
        self.stats_samples.load(Ordering::Relaxed)
    }

    pub fn stats_decode_failures(&self) -> u64 {
        self.stats_decode_failures.load(Ordering::Relaxed)
    }

    pub fn feedback_pushes(&self) -> u64 {
        self.feedback_pushes.load(Ordering::Relaxed)
    }

    pub fn feedback_failures(&self) -> u64 {
        self.feedback_failures.load(Ordering::Relaxed)
    }

    /// Get the timestamp of the last relayed unit (Unix microseconds)
    pub fn last_unit_time(&self) -> u64 {
        self.last_unit_time.load(Ordering::Relaxed)
    }

    /// Check if the relay has stalled (no units for given duration)
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        let elapsed_micros = now_micros().saturating_sub(self.last_unit_time());
        elapsed_micros > threshold.as_micros() as u64
    }

    /// Get a summary of health metrics
    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            units_relayed: self.units_relayed(),
            bytes_relayed: self.bytes_relayed(),
            empty_notifications: self.empty_notifications(),
            stats_samples: self.stats_samples(),
            stats_decode_failures: self.stats_decode_failures(),
            feedback_pushes: self.feedback_pushes(),
            feedback_failures: self.feedback_failures(),
        }
    }
}

impl Default for RelayHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSummary {
    pub units_relayed: u64,
    pub bytes_relayed: u64,
    pub empty_notifications: u64,
    pub stats_samples: u64,
    pub stats_decode_failures: u64,
    pub feedback_pushes: u64,
    pub feedback_failures: u64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Health: {} units ({} bytes, {} empty), {} stats ({} undecodable), {} feedback pushes ({} failed)",
            self.units_relayed,
            self.bytes_relayed,
            self.empty_notifications,
            self.stats_samples,
            self.stats_decode_failures,
            self.feedback_pushes,
            self.feedback_failures
        )
    }
}

/// Health alert types
#[derive(Debug, Clone, PartialEq)]
pub enum HealthAlert {
    /// No unit relayed for the threshold duration
    Stalled { duration: Duration },

    /// New undecodable stats snapshots since the last check
    StatsDecodeFailures { count: u64 },

    /// New refused feedback pushes since the last check
    FeedbackFailures { count: u64 },
}

impl std::fmt::Display for HealthAlert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthAlert::Stalled { duration } => {
                write!(f, "Relay stalled for {:?}", duration)
            }
            HealthAlert::StatsDecodeFailures { count } => {
                write!(f, "Stats decode failures: {}", count)
            }
            HealthAlert::FeedbackFailures { count } => {
                write!(f, "Feedback push failures: {}", count)
            }
        }
    }
}

/// Health monitoring service
///
/// Periodically checks relay health and sends alerts when issues are detected.
pub struct HealthMonitor {
    health: Arc<RelayHealth>,
    alert_tx: mpsc::Sender<HealthAlert>,
    check_interval: Duration,
    stall_threshold: Duration,
}

impl HealthMonitor {
    /// Create a new health monitor
    pub fn new(health: Arc<RelayHealth>, alert_tx: mpsc::Sender<HealthAlert>) -> Self {
        Self {
            health,
            alert_tx,
            check_interval: Duration::from_secs(5),
            stall_threshold: Duration::from_secs(5),
        }
    }

    /// Configure the check interval
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Configure the stall threshold
    pub fn with_stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold = threshold;
        self
    }

    /// Run the health monitor until `cancel` fires or the alert receiver goes away
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.check_interval);
        let mut last_decode_failures = 0u64;
        let mut last_feedback_failures = 0u64;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let mut alerts = Vec::new();

            if self.health.is_stalled(self.stall_threshold) {
                alerts.push(HealthAlert::Stalled {
                    duration: self.stall_threshold,
                });
            }

            let decode_failures = self.health.stats_decode_failures();
            if decode_failures > last_decode_failures {
                alerts.push(HealthAlert::StatsDecodeFailures {
                    count: decode_failures - last_decode_failures,
                });
                last_decode_failures = decode_failures;
            }

            let feedback_failures = self.health.feedback_failures();
            if feedback_failures > last_feedback_failures {
                alerts.push(HealthAlert::FeedbackFailures {
                    count: feedback_failures - last_feedback_failures,
                });
                last_feedback_failures = feedback_failures;
            }

            for alert in alerts {
                if self.alert_tx.send(alert).await.is_err() {
                    return;
                }
            }
        }
    }
}
