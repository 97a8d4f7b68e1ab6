//! Broker statistics
//!
//! `StatsRecorder` is the mutable side: counters plus bounded windows of
//! recent latencies, outcomes, failures and performance alerts. The broker
//! turns it into an immutable [`BrokerStatistics`] snapshot on demand.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::error::DeliveryFailure;

const ALERT_HISTORY_LIMIT: usize = 20;

/// One failed dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub message_id: String,
    pub recipient: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub reason: String,
}

impl FailureRecord {
    pub fn new(message_id: &str, recipient: Option<&str>, failure: &DeliveryFailure) -> Self {
        Self {
            message_id: message_id.to_string(),
            recipient: recipient.map(str::to_string),
            timestamp: Utc::now(),
            kind: failure.kind().to_string(),
            reason: failure.to_string(),
        }
    }
}

/// Result of one performance aggregation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub timestamp: DateTime<Utc>,
    pub success_rate: f64,
    pub average_latency_ms: f64,
    pub samples: usize,
}

/// Warning raised when a performance pass crosses a configured bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceAlert {
    pub timestamp: DateTime<Utc>,
    pub success_rate: f64,
    pub average_latency_ms: f64,
    pub reason: String,
}

/// Point-in-time view returned by `MessageBroker::statistics`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerStatistics {
    pub messages_sent: u64,
    pub messages_failed: u64,
    pub messages_expired: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub queue_depths: BTreeMap<String, usize>,
    pub active_agents: usize,
    pub total_agents: usize,
    pub subscription_topics: usize,
    pub average_latency_ms: f64,
    pub success_rate: f64,
    pub recent_failure_count: usize,
    pub recent_failures: Vec<FailureRecord>,
    pub last_performance: Option<PerformanceReport>,
    pub performance_alerts: Vec<PerformanceAlert>,
}

#[derive(Debug)]
pub struct StatsRecorder {
    sent: u64,
    failed: u64,
    expired: u64,
    received: u64,
    dropped: u64,
    latencies_ms: VecDeque<f64>,
    outcomes: VecDeque<bool>,
    sample_limit: usize,
    failures: VecDeque<FailureRecord>,
    failure_limit: usize,
    alerts: VecDeque<PerformanceAlert>,
    last_performance: Option<PerformanceReport>,
}

impl StatsRecorder {
    pub fn new(sample_limit: usize, failure_limit: usize) -> Self {
        Self {
            sent: 0,
            failed: 0,
            expired: 0,
            received: 0,
            dropped: 0,
            latencies_ms: VecDeque::with_capacity(sample_limit),
            outcomes: VecDeque::with_capacity(sample_limit),
            sample_limit,
            failures: VecDeque::with_capacity(failure_limit),
            failure_limit,
            alerts: VecDeque::new(),
            last_performance: None,
        }
    }

    pub fn record_success(&mut self, latency_ms: f64) {
        self.sent += 1;
        push_bounded(&mut self.latencies_ms, latency_ms.max(0.0), self.sample_limit);
        push_bounded(&mut self.outcomes, true, self.sample_limit);
    }

    pub fn record_failure(&mut self, record: FailureRecord) {
        self.failed += 1;
        push_bounded(&mut self.outcomes, false, self.sample_limit);
        push_bounded(&mut self.failures, record, self.failure_limit);
    }

    /// Expired at dispatch time: counted as expired, kept in the failure history.
    pub fn record_expired(&mut self, record: FailureRecord) {
        self.expired += 1;
        push_bounded(&mut self.failures, record, self.failure_limit);
    }

    /// Expired while queued, removed by a sweep or on dequeue.
    pub fn record_swept(&mut self, count: usize) {
        self.expired += count as u64;
    }

    pub fn record_dropped(&mut self) {
        self.dropped += 1;
    }

    pub fn record_received(&mut self) {
        self.received += 1;
    }

    pub fn expired(&self) -> u64 {
        self.expired
    }

    pub fn success_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 1.0;
        }
        let ok = self.outcomes.iter().filter(|o| **o).count();
        ok as f64 / self.outcomes.len() as f64
    }

    pub fn average_latency_ms(&self) -> f64 {
        if self.latencies_ms.is_empty() {
            return 0.0;
        }
        self.latencies_ms.iter().sum::<f64>() / self.latencies_ms.len() as f64
    }

    /// Aggregate the recent windows and remember the result.
    pub fn aggregate(&mut self) -> PerformanceReport {
        let report = PerformanceReport {
            timestamp: Utc::now(),
            success_rate: self.success_rate(),
            average_latency_ms: self.average_latency_ms(),
            samples: self.outcomes.len(),
        };
        self.last_performance = Some(report.clone());
        report
    }

    pub fn push_alert(&mut self, alert: PerformanceAlert) {
        push_bounded(&mut self.alerts, alert, ALERT_HISTORY_LIMIT);
    }

    pub fn snapshot(&self) -> BrokerStatistics {
        BrokerStatistics {
            messages_sent: self.sent,
            messages_failed: self.failed,
            messages_expired: self.expired,
            messages_received: self.received,
            messages_dropped: self.dropped,
            queue_depths: BTreeMap::new(),
            active_agents: 0,
            total_agents: 0,
            subscription_topics: 0,
            average_latency_ms: self.average_latency_ms(),
            success_rate: self.success_rate(),
            recent_failure_count: self.failures.len(),
            recent_failures: self.failures.iter().cloned().collect(),
            last_performance: self.last_performance.clone(),
            performance_alerts: self.alerts.iter().cloned().collect(),
        }
    }
}

fn push_bounded<T>(buf: &mut VecDeque<T>, item: T, limit: usize) {
    if buf.len() >= limit {
        buf.pop_front();
    }
    buf.push_back(item);
}
