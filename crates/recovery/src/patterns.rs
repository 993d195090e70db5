//! Rolling error pattern tracking and anomaly detection.
//!
//! Each classified error is recorded as an observation of its type together
//! with the correlated system factors at the time. Observations older than
//! the window are pruned on every update; the derived patterns, recent
//! anomalies and overall risk level are published as one snapshot.

use audit::{AuditEvent, AuditSink};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::system::SystemState;
use crate::taxonomy::{Severity, TransactionError};

/// Frequency at which the frequency component of the risk score saturates.
const FREQUENCY_THRESHOLD: f64 = 10.0;

/// Anomalies below this confidence are not counted by risk assessment.
pub const ANOMALY_CONFIDENCE_THRESHOLD: f64 = 0.7;

/// Minimum change of a correlated factor that counts as a shift.
const CORRELATION_SHIFT: f64 = 0.3;

const FACTOR_NETWORK: &str = "network_congestion";
const FACTOR_BLOCKCHAIN: &str = "blockchain_state";

/// Four-level risk scale shared by pattern analysis and forensics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Bucket a weighted risk score.
    #[must_use]
    pub fn from_score(score: f64) -> Self {
        if score >= 6.0 {
            Self::Critical
        } else if score >= 4.0 {
            Self::High
        } else if score >= 2.0 {
            Self::Medium
        } else {
            Self::Low
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Weighted risk score: severity, anomaly count and saturating frequency.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn risk_score(severity: Severity, anomaly_count: usize, frequency: usize) -> f64 {
    let frequency_score = (frequency as f64 / FREQUENCY_THRESHOLD).min(1.0) * 2.0;
    f64::from(severity.score()) + anomaly_count as f64 * 0.5 + frequency_score
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyKind {
    FrequencySpike,
    PatternShift,
    SeverityEscalation,
    CorrelationChange,
}

impl AnomalyKind {
    #[must_use]
    pub const fn confidence(&self) -> f64 {
        match self {
            Self::FrequencySpike => 0.8,
            Self::PatternShift => 0.75,
            Self::SeverityEscalation => 0.9,
            Self::CorrelationChange => 0.85,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::FrequencySpike => "FREQUENCY_SPIKE",
            Self::PatternShift => "PATTERN_SHIFT",
            Self::SeverityEscalation => "SEVERITY_ESCALATION",
            Self::CorrelationChange => "CORRELATION_CHANGE",
        }
    }
}

/// A detected deviation from an error type's recent history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub error_type: String,
    pub description: String,
    pub confidence: f64,
    pub detected_at: DateTime<Utc>,
}

impl Anomaly {
    fn new(kind: AnomalyKind, error_type: &str, description: String, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            error_type: error_type.to_string(),
            description,
            confidence: kind.confidence(),
            detected_at: at,
        }
    }
}

/// Aggregate of one error type inside the window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub error_type: String,
    pub frequency: usize,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub max_severity: Severity,
    pub affected_transactions: Vec<String>,
    /// Factor values observed with the most recent occurrence
    pub correlated_factors: BTreeMap<String, f64>,
}

/// Published view of the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSnapshot {
    pub patterns: Vec<ErrorPattern>,
    pub anomalies: Vec<Anomaly>,
    pub risk_level: RiskLevel,
    pub updated_at: DateTime<Utc>,
}

impl Default for PatternSnapshot {
    fn default() -> Self {
        Self {
            patterns: Vec::new(),
            anomalies: Vec::new(),
            risk_level: RiskLevel::Low,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
struct Observation {
    error_type: &'static str,
    transaction_id: String,
    severity: Severity,
    at: DateTime<Utc>,
    factors: BTreeMap<String, f64>,
}

#[derive(Default)]
struct TrackerState {
    observations: VecDeque<Observation>,
    anomalies: Vec<Anomaly>,
}

impl TrackerState {
    fn prune(&mut self, cutoff: DateTime<Utc>) {
        self.observations.retain(|o| o.at >= cutoff);
        self.anomalies.retain(|a| a.detected_at >= cutoff);
    }

    fn of_type<'a>(&'a self, error_type: &'a str) -> impl Iterator<Item = &'a Observation> + 'a {
        self.observations
            .iter()
            .filter(move |o| o.error_type == error_type)
    }

    fn frequencies(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for o in &self.observations {
            *counts.entry(o.error_type).or_default() += 1;
        }
        counts
    }

    fn patterns(&self) -> Vec<ErrorPattern> {
        let mut patterns: BTreeMap<&'static str, ErrorPattern> = BTreeMap::new();
        for o in &self.observations {
            patterns
                .entry(o.error_type)
                .and_modify(|p| {
                    p.frequency += 1;
                    p.last_seen = p.last_seen.max(o.at);
                    p.first_seen = p.first_seen.min(o.at);
                    p.max_severity = p.max_severity.max(o.severity);
                    if !p.affected_transactions.contains(&o.transaction_id) {
                        p.affected_transactions.push(o.transaction_id.clone());
                    }
                    p.correlated_factors.clone_from(&o.factors);
                })
                .or_insert_with(|| ErrorPattern {
                    error_type: o.error_type.to_string(),
                    frequency: 1,
                    first_seen: o.at,
                    last_seen: o.at,
                    max_severity: o.severity,
                    affected_transactions: vec![o.transaction_id.clone()],
                    correlated_factors: o.factors.clone(),
                });
        }
        patterns.into_values().collect()
    }
}

fn factors_for(state: &SystemState) -> BTreeMap<String, f64> {
    BTreeMap::from([
        (FACTOR_NETWORK.to_string(), state.network_congestion_factor()),
        (FACTOR_BLOCKCHAIN.to_string(), state.blockchain_congestion_factor()),
    ])
}

/// Live pattern inputs for one error type, consumed by risk assessment.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PatternSignal {
    /// Occurrences of the type inside the window
    pub frequency: usize,
    /// Recent anomalies for the type at or above the confidence threshold
    pub anomaly_count: usize,
}

/// Rolling-window pattern tracker.
pub struct PatternTracker {
    window: chrono::Duration,
    state: Mutex<TrackerState>,
    publisher: watch::Sender<Arc<PatternSnapshot>>,
    audit: Arc<dyn AuditSink>,
}

impl PatternTracker {
    pub fn new(window: Duration, audit: Arc<dyn AuditSink>) -> Self {
        let (publisher, _) = watch::channel(Arc::new(PatternSnapshot::default()));
        Self {
            window: chrono::Duration::from_std(window).unwrap_or(chrono::Duration::hours(1)),
            state: Mutex::new(TrackerState::default()),
            publisher,
            audit,
        }
    }

    /// Record an error observed under `system` and return the anomalies it
    /// triggered.
    pub fn observe(&self, error: &TransactionError, system: &SystemState) -> Vec<Anomaly> {
        self.observe_at(error, system, Utc::now())
    }

    /// [`observe`](Self::observe) with an explicit clock.
    #[allow(clippy::cast_precision_loss)]
    pub fn observe_at(
        &self,
        error: &TransactionError,
        system: &SystemState,
        now: DateTime<Utc>,
    ) -> Vec<Anomaly> {
        let error_type = error.kind_name();
        let factors = factors_for(system);

        let (anomalies, snapshot, frequency, risk_level) = {
            let mut state = self.state.lock();
            state.prune(now - self.window);

            let history: Vec<&Observation> = state.of_type(error_type).collect();
            let mut anomalies = Vec::new();

            if !history.is_empty() {
                let prior_max = history.iter().map(|o| o.severity).max();
                if prior_max.is_some_and(|max| error.severity > max) {
                    anomalies.push(Anomaly::new(
                        AnomalyKind::SeverityEscalation,
                        error_type,
                        format!("{error_type} severity escalated to {}", error.severity),
                        now,
                    ));
                }

                let mut shifted = Vec::new();
                for (factor, value) in &factors {
                    let samples: Vec<f64> = history
                        .iter()
                        .filter_map(|o| o.factors.get(factor).copied())
                        .collect();
                    if samples.is_empty() {
                        continue;
                    }
                    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
                    if (value - mean).abs() > CORRELATION_SHIFT {
                        shifted.push(factor.clone());
                    }
                }
                if !shifted.is_empty() {
                    anomalies.push(Anomaly::new(
                        AnomalyKind::PatternShift,
                        error_type,
                        format!("{error_type} correlations shifted"),
                        now,
                    ));
                    for factor in shifted {
                        anomalies.push(Anomaly::new(
                            AnomalyKind::CorrelationChange,
                            error_type,
                            format!("Significant change in correlation with factor: {factor}"),
                            now,
                        ));
                    }
                }
            }

            state.observations.push_back(Observation {
                error_type,
                transaction_id: error.transaction_id.clone(),
                severity: error.severity,
                at: now,
                factors,
            });

            let frequencies = state.frequencies();
            let frequency = frequencies.get(error_type).copied().unwrap_or(0);
            let peers: Vec<usize> = frequencies
                .iter()
                .filter(|(t, _)| **t != error_type)
                .map(|(_, f)| *f)
                .collect();
            if !peers.is_empty() {
                let peer_mean = peers.iter().sum::<usize>() as f64 / peers.len() as f64;
                if frequency as f64 > peer_mean * 2.0 {
                    anomalies.push(Anomaly::new(
                        AnomalyKind::FrequencySpike,
                        error_type,
                        format!("Unusual increase in {error_type} frequency ({frequency} in window)"),
                        now,
                    ));
                }
            }

            state.anomalies.extend(anomalies.iter().cloned());
            let risk_level =
                RiskLevel::from_score(risk_score(error.severity, anomalies.len(), frequency));

            let snapshot = PatternSnapshot {
                patterns: state.patterns(),
                anomalies: state.anomalies.clone(),
                risk_level,
                updated_at: now,
            };
            (anomalies, snapshot, frequency, risk_level)
        };

        self.publisher.send_replace(Arc::new(snapshot));

        debug!(error_type, frequency, risk_level = %risk_level, "Pattern updated");
        self.audit.log_event(
            AuditEvent::new("PATTERN_RECOGNITION_UPDATE", "Updated error pattern analysis")
                .with("error_type", error_type)
                .with("frequency", frequency)
                .with("risk_level", risk_level)
                .with("anomalies_detected", anomalies.len()),
        );
        if !anomalies.is_empty() {
            let kinds: Vec<&str> = anomalies.iter().map(|a| a.kind.as_str()).collect();
            info!(error_type, anomalies = ?kinds, "Anomalies detected");
            self.audit.log_event(
                AuditEvent::new("ANOMALIES_DETECTED", "Detected anomalies in error patterns")
                    .with("anomaly_count", anomalies.len())
                    .with("anomaly_types", kinds.join(",")),
            );
        }

        anomalies
    }

    /// Frequency and confident anomaly count for one error type.
    pub fn signal(&self, error_type: &str) -> PatternSignal {
        let state = self.state.lock();
        PatternSignal {
            frequency: state.of_type(error_type).count(),
            anomaly_count: state
                .anomalies
                .iter()
                .filter(|a| a.error_type == error_type)
                .filter(|a| a.confidence >= ANOMALY_CONFIDENCE_THRESHOLD)
                .count(),
        }
    }

    pub fn snapshot(&self) -> Arc<PatternSnapshot> {
        Arc::clone(&self.publisher.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<PatternSnapshot>> {
        self.publisher.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{Amount, NetworkStatus};
    use crate::taxonomy::CongestionLevel;
    use audit::AuditLog;

    fn tracker() -> (PatternTracker, Arc<AuditLog>) {
        let audit = Arc::new(AuditLog::in_memory());
        (
            PatternTracker::new(Duration::from_secs(3600), audit.clone()),
            audit,
        )
    }

    fn funds(tx: &str) -> TransactionError {
        TransactionError::insufficient_funds(tx, Amount::from_units(2), Amount::ZERO, "XLM")
    }

    #[test]
    fn test_risk_buckets() {
        assert_eq!(RiskLevel::from_score(risk_score(Severity::Low, 0, 0)), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(risk_score(Severity::Medium, 0, 0)), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(risk_score(Severity::High, 2, 0)), RiskLevel::High);
        assert_eq!(
            RiskLevel::from_score(risk_score(Severity::Critical, 0, 25)),
            RiskLevel::Critical
        );
    }

    #[test]
    fn test_frequency_spike_against_peers() {
        let (tracker, audit) = tracker();
        let state = SystemState::healthy();
        let now = Utc::now();

        tracker.observe_at(
            &TransactionError::wallet_connection_lost("tx-w", None),
            &state,
            now,
        );
        tracker.observe_at(&funds("tx-1"), &state, now);
        let anomalies = tracker.observe_at(&funds("tx-2"), &state, now);
        assert!(anomalies.is_empty());

        let anomalies = tracker.observe_at(&funds("tx-3"), &state, now);
        assert!(anomalies.iter().any(|a| a.kind == AnomalyKind::FrequencySpike));
        assert_eq!(tracker.signal("InsufficientFunds").frequency, 3);
        assert!(!audit.trail().events_of_type("ANOMALIES_DETECTED").is_empty());
    }

    #[test]
    fn test_correlation_shift_reports_each_factor() {
        let (tracker, _) = tracker();
        let now = Utc::now();
        let healthy = SystemState::healthy();
        tracker.observe_at(&funds("tx-1"), &healthy, now);

        let mut offline = SystemState::healthy();
        offline.network_status = NetworkStatus::Offline;
        let anomalies = tracker.observe_at(&funds("tx-2"), &offline, now);

        let kinds: Vec<_> = anomalies.iter().map(|a| a.kind).collect();
        assert!(kinds.contains(&AnomalyKind::PatternShift));
        assert_eq!(
            kinds
                .iter()
                .filter(|k| **k == AnomalyKind::CorrelationChange)
                .count(),
            1
        );
    }

    #[test]
    fn test_severity_escalation() {
        let (tracker, _) = tracker();
        let state = SystemState::healthy();
        let now = Utc::now();
        tracker.observe_at(
            &TransactionError::network_congestion("tx-1", CongestionLevel::Low, 15),
            &state,
            now,
        );
        let anomalies = tracker.observe_at(
            &TransactionError::network_congestion("tx-2", CongestionLevel::High, 30),
            &state,
            now,
        );
        assert!(anomalies
            .iter()
            .any(|a| a.kind == AnomalyKind::SeverityEscalation));
        assert!(tracker.signal("NetworkCongestion").anomaly_count >= 1);
    }

    #[test]
    fn test_window_prunes_old_observations() {
        let (tracker, _) = tracker();
        let state = SystemState::healthy();
        let start = Utc::now();
        tracker.observe_at(&funds("tx-1"), &state, start);
        tracker.observe_at(&funds("tx-2"), &state, start + chrono::Duration::minutes(30));
        tracker.observe_at(&funds("tx-3"), &state, start + chrono::Duration::minutes(75));

        assert_eq!(tracker.signal("InsufficientFunds").frequency, 2);
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.patterns.len(), 1);
        assert_eq!(snapshot.patterns[0].frequency, 2);
        assert_eq!(
            snapshot.patterns[0].affected_transactions,
            vec!["tx-2".to_string(), "tx-3".to_string()]
        );
    }

    #[tokio::test]
    async fn test_snapshot_is_published() {
        let (tracker, _) = tracker();
        let mut rx = tracker.subscribe();
        tracker.observe(&funds("tx-1"), &SystemState::healthy());
        rx.changed().await.unwrap();
        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.patterns[0].error_type, "InsufficientFunds");
        assert_eq!(snapshot.risk_level, RiskLevel::Medium);
    }
}
