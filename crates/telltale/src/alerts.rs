// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::{HashMap, VecDeque};
use std::fmt::Display;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::config::AlertOptions;
use crate::constants::{DEFAULT_CRITICAL_RATIO, DEFAULT_ERROR_RATIO};
use crate::history::MetricSample;

/// Tolerance of [`Comparison::Equal`].
const EQUALITY_TOLERANCE: f64 = 1e-9;

/// How a sample value is compared against a rule's threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Comparison {
    /// The value is strictly greater than the threshold.
    #[serde(rename = ">", alias = "above")]
    Above,
    /// The value is strictly less than the threshold.
    #[serde(rename = "<", alias = "below")]
    Below,
    /// The value equals the threshold within `1e-9`.
    #[serde(rename = "=", alias = "equal")]
    Equal,
}

impl Comparison {
    /// `>`, `<` or `=`.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Above => ">",
            Self::Below => "<",
            Self::Equal => "=",
        }
    }

    /// Whether `value` satisfies the comparison against `threshold`. `NaN` never does.
    #[must_use]
    pub fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Above => value > threshold,
            Self::Below => value < threshold,
            Self::Equal => (value - threshold).abs() <= EQUALITY_TOLERANCE,
        }
    }
}

impl Display for Comparison {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.symbol())
    }
}

/// A condition on one metric that raises an alert while it holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThresholdRule {
    /// Name of the metric the rule watches, e.g. `cpu_usage_percent`.
    pub metric: String,
    /// How the metric is compared against `threshold`.
    pub comparison: Comparison,
    /// The boundary value.
    pub threshold: f64,
    /// Disabled rules are never evaluated.
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

const fn enabled_by_default() -> bool {
    true
}

impl ThresholdRule {
    /// An enabled rule.
    #[must_use]
    pub fn new(metric: impl Into<String>, comparison: Comparison, threshold: f64) -> Self {
        Self {
            metric: metric.into(),
            comparison,
            threshold,
            enabled: true,
        }
    }

    /// Returns the rule with evaluation turned off.
    #[must_use]
    pub const fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// The identity shared by every alert this rule raises.
    #[must_use]
    pub fn id(&self) -> AlertId {
        AlertId(format!("{}{}{}", self.metric, self.comparison.symbol(), self.threshold))
    }
}

/// Identity of an alert: metric, comparison and threshold, e.g. `cpu_usage_percent>85`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertId(String);

impl AlertId {
    /// The id as text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for AlertId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AlertId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// How far a value is past its threshold, least severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    /// Raised by equality rules.
    Info,
    /// Excess below the error ratio.
    Warning,
    /// Excess of at least the error ratio.
    Error,
    /// Excess of at least the critical ratio.
    Critical,
}

impl AlertSeverity {
    /// Lowercase name, as serialized.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps the proportional excess of a value over its threshold to a severity.
///
/// The excess is `|value - threshold| / |threshold|`. Below `error_ratio` an alert is a
/// warning, from `error_ratio` an error, and from `critical_ratio` critical. Equality rules
/// always raise informational alerts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SeverityBands {
    /// Excess from which an alert is an error. Defaults to `0.05`.
    pub error_ratio: f64,
    /// Excess from which an alert is critical. Defaults to `0.15`.
    pub critical_ratio: f64,
}

impl Default for SeverityBands {
    fn default() -> Self {
        Self {
            error_ratio: DEFAULT_ERROR_RATIO,
            critical_ratio: DEFAULT_CRITICAL_RATIO,
        }
    }
}

impl SeverityBands {
    /// Checks that both ratios are finite, non-negative and ordered.
    ///
    /// # Errors
    ///
    /// Returns the reason the bands are unusable.
    pub fn validate(&self) -> Result<(), String> {
        for (name, ratio) in [("error_ratio", self.error_ratio), ("critical_ratio", self.critical_ratio)] {
            if !ratio.is_finite() || ratio < 0.0 {
                return Err(format!("{name} must be a finite non-negative ratio, got {ratio}"));
            }
        }

        if self.error_ratio > self.critical_ratio {
            return Err(format!(
                "error_ratio ({}) must not exceed critical_ratio ({})",
                self.error_ratio, self.critical_ratio
            ));
        }

        Ok(())
    }

    /// The severity of `value` breaching `rule`.
    #[must_use]
    pub fn classify(&self, rule: &ThresholdRule, value: f64) -> AlertSeverity {
        if rule.comparison == Comparison::Equal {
            return AlertSeverity::Info;
        }

        let distance = (value - rule.threshold).abs();
        let excess = if rule.threshold.abs() > f64::EPSILON {
            distance / rule.threshold.abs()
        } else {
            distance
        };

        if excess >= self.critical_ratio {
            AlertSeverity::Critical
        } else if excess >= self.error_ratio {
            AlertSeverity::Error
        } else {
            AlertSeverity::Warning
        }
    }
}

/// A threshold breach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Identity of the rule that raised it.
    pub id: AlertId,
    /// The breached metric.
    pub metric: String,
    /// How far the raising value was past the threshold.
    pub severity: AlertSeverity,
    /// Human-readable description.
    pub message: String,
    /// The sample value that raised the alert.
    pub value: f64,
    /// The rule's threshold.
    pub threshold: f64,
    /// The rule's comparison.
    pub comparison: Comparison,
    /// Timestamp of the sample that raised the alert.
    pub timestamp: Timestamp,
    /// Set once the alert is resolved by hand or its condition ends.
    pub resolved: bool,
    /// When `resolved` was set.
    pub resolved_at: Option<Timestamp>,
}

impl Alert {
    fn resolve(&mut self, at: Timestamp) {
        if !self.resolved {
            self.resolved = true;
            self.resolved_at = Some(at);
        }
    }
}

/// A change in the set of active alerts caused by one sample.
#[derive(Debug, Clone, PartialEq)]
pub enum AlertTransition {
    /// The condition started to hold.
    Raised(Alert),
    /// The condition stopped holding.
    Cleared(Alert),
}

/// Evaluates threshold rules with hysteresis.
///
/// An alert is raised the first time its rule's condition holds, is left alone while the
/// condition keeps holding, and is cleared by the first sample for which it no longer holds.
/// Every raised alert is also appended to a bounded history log, which keeps its entry after
/// the alert is cleared or resolved.
#[derive(Debug, Clone)]
pub struct AlertEngine {
    rules: Vec<ThresholdRule>,
    bands: SeverityBands,
    active: HashMap<AlertId, Alert>,
    log: VecDeque<Alert>,
    log_capacity: usize,
}

impl AlertEngine {
    /// An engine with no active alerts.
    #[must_use]
    pub fn new(options: &AlertOptions) -> Self {
        Self {
            rules: options.rules.clone(),
            bands: options.bands,
            active: HashMap::new(),
            log: VecDeque::new(),
            log_capacity: options.log_capacity.max(1),
        }
    }

    /// The configured rules, enabled or not.
    #[must_use]
    pub fn rules(&self) -> &[ThresholdRule] {
        &self.rules
    }

    /// Evaluates every enabled rule watching the sample's metric.
    pub fn evaluate(&mut self, sample: &MetricSample) -> Vec<AlertTransition> {
        let mut transitions = Vec::new();

        for rule in self.rules.iter().filter(|rule| rule.enabled && rule.metric == sample.metric()) {
            let id = rule.id();
            let holds = rule.comparison.holds(sample.value(), rule.threshold);

            if holds && !self.active.contains_key(&id) {
                let alert = Alert {
                    severity: self.bands.classify(rule, sample.value()),
                    message: format!(
                        "{} is {:.2}{} (threshold {} {:.2})",
                        rule.metric,
                        sample.value(),
                        sample.unit(),
                        rule.comparison,
                        rule.threshold
                    ),
                    id: id.clone(),
                    metric: rule.metric.clone(),
                    value: sample.value(),
                    threshold: rule.threshold,
                    comparison: rule.comparison,
                    timestamp: sample.timestamp(),
                    resolved: false,
                    resolved_at: None,
                };

                tracing::event!(
                    name: "telltale.alert.raised",
                    tracing::Level::WARN,
                    alert.id = %alert.id,
                    alert.severity = alert.severity.as_str(),
                    alert.value = alert.value,
                );

                if self.log.len() == self.log_capacity {
                    self.log.pop_front();
                }
                self.log.push_back(alert.clone());
                self.active.insert(id, alert.clone());
                transitions.push(AlertTransition::Raised(alert));
            } else if !holds && let Some(mut alert) = self.active.remove(&id) {
                alert.resolve(sample.timestamp());
                sync_log(&mut self.log, &alert);

                tracing::event!(
                    name: "telltale.alert.cleared",
                    tracing::Level::INFO,
                    alert.id = %alert.id,
                    alert.value = sample.value(),
                );

                transitions.push(AlertTransition::Cleared(alert));
            }
        }

        transitions
    }

    /// Marks the active alert `id` as resolved.
    ///
    /// The alert stays registered, so it is not raised again while its condition keeps holding,
    /// but it no longer shows up in [`AlertEngine::active_alerts`]. Returns `false` when no
    /// unresolved alert with that id is active.
    pub fn resolve(&mut self, id: &AlertId, at: Timestamp) -> bool {
        let Some(alert) = self.active.get_mut(id) else {
            return false;
        };
        if alert.resolved {
            return false;
        }

        alert.resolve(at);
        let alert = alert.clone();
        sync_log(&mut self.log, &alert);

        tracing::event!(name: "telltale.alert.resolved", tracing::Level::INFO, alert.id = %alert.id);
        true
    }

    /// Unresolved alerts, oldest first.
    #[must_use]
    pub fn active_alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<_> = self.active.values().filter(|alert| !alert.resolved).cloned().collect();
        alerts.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        alerts
    }

    /// The most recent alerts, oldest first, including cleared and resolved ones.
    #[must_use]
    pub fn history(&self) -> Vec<Alert> {
        self.log.iter().cloned().collect()
    }
}

/// Mirrors the resolution state of `alert` onto its log entry.
fn sync_log(log: &mut VecDeque<Alert>, alert: &Alert) {
    if let Some(entry) = log
        .iter_mut()
        .rev()
        .find(|entry| entry.id == alert.id && entry.timestamp == alert.timestamp)
    {
        entry.resolved = alert.resolved;
        entry.resolved_at = alert.resolved_at;
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn at(second: i64) -> Timestamp {
        Timestamp::from_second(1_700_000_000 + second).unwrap()
    }

    fn cpu(second: i64, value: f64) -> MetricSample {
        MetricSample::new(at(second), "cpu_usage_percent", value, "%")
    }

    fn engine(rules: Vec<ThresholdRule>) -> AlertEngine {
        AlertEngine::new(&AlertOptions {
            rules,
            ..AlertOptions::default()
        })
    }

    fn cpu_above_85() -> ThresholdRule {
        ThresholdRule::new("cpu_usage_percent", Comparison::Above, 85.0)
    }

    #[rstest]
    #[case(Comparison::Above, 90.0, true)]
    #[case(Comparison::Above, 85.0, false)]
    #[case(Comparison::Below, 80.0, true)]
    #[case(Comparison::Equal, 85.000_000_000_1, true)]
    #[case(Comparison::Equal, 85.1, false)]
    #[case(Comparison::Above, f64::NAN, false)]
    fn comparisons(#[case] comparison: Comparison, #[case] value: f64, #[case] expected: bool) {
        assert_eq!(comparison.holds(value, 85.0), expected);
    }

    #[test]
    fn id_combines_metric_comparison_and_threshold() {
        assert_eq!(cpu_above_85().id().as_str(), "cpu_usage_percent>85");
        assert_eq!(
            ThresholdRule::new("load_average_1m", Comparison::Below, 0.5).id().as_str(),
            "load_average_1m<0.5"
        );
    }

    #[rstest]
    #[case(86.0, AlertSeverity::Warning)]
    #[case(90.0, AlertSeverity::Error)]
    #[case(99.0, AlertSeverity::Critical)]
    fn severity_from_proportional_excess(#[case] value: f64, #[case] expected: AlertSeverity) {
        assert_eq!(SeverityBands::default().classify(&cpu_above_85(), value), expected);
    }

    #[test]
    fn bands_validation() {
        SeverityBands::default().validate().unwrap();
        assert!(
            SeverityBands {
                error_ratio: 0.5,
                critical_ratio: 0.1
            }
            .validate()
            .is_err()
        );
        assert!(
            SeverityBands {
                error_ratio: f64::NAN,
                critical_ratio: 0.1
            }
            .validate()
            .is_err()
        );
    }

    #[test]
    fn raise_once_then_clear_once() {
        let mut engine = engine(vec![cpu_above_85()]);

        let raised = engine.evaluate(&cpu(0, 90.0));
        assert!(matches!(raised.as_slice(), [AlertTransition::Raised(alert)] if alert.value == 90.0));
        assert_eq!(engine.active_alerts().len(), 1);

        assert!(engine.evaluate(&cpu(12, 95.0)).is_empty());
        assert_eq!(engine.active_alerts()[0].value, 90.0);

        let cleared = engine.evaluate(&cpu(24, 80.0));
        let [AlertTransition::Cleared(alert)] = cleared.as_slice() else {
            panic!("expected a single clear, got {cleared:?}");
        };
        assert!(alert.resolved);
        assert_eq!(alert.resolved_at, Some(at(24)));
        assert!(engine.active_alerts().is_empty());
        assert!(engine.evaluate(&cpu(36, 70.0)).is_empty());

        let history = engine.history();
        assert_eq!(history.len(), 1);
        assert!(history[0].resolved);
    }

    #[test]
    fn other_metrics_and_disabled_rules_are_ignored() {
        let mut engine = engine(vec![
            cpu_above_85().disabled(),
            ThresholdRule::new("memory_usage_percent", Comparison::Above, 90.0),
        ]);

        assert!(engine.evaluate(&cpu(0, 99.0)).is_empty());
        assert!(engine.active_alerts().is_empty());
    }

    #[test]
    fn resolve_keeps_alert_registered_until_condition_clears() {
        let mut engine = engine(vec![cpu_above_85()]);
        engine.evaluate(&cpu(0, 90.0));
        let id = cpu_above_85().id();

        assert!(engine.resolve(&id, at(5)));
        assert!(!engine.resolve(&id, at(6)));
        assert!(engine.active_alerts().is_empty());
        assert_eq!(engine.history()[0].resolved_at, Some(at(5)));

        assert!(engine.evaluate(&cpu(12, 92.0)).is_empty());

        let cleared = engine.evaluate(&cpu(24, 80.0));
        assert!(matches!(cleared.as_slice(), [AlertTransition::Cleared(alert)] if alert.resolved_at == Some(at(5))));

        assert_eq!(engine.evaluate(&cpu(36, 91.0)).len(), 1);
        assert_eq!(engine.history().len(), 2);
    }

    #[test]
    fn resolving_unknown_alert_is_a_no_op() {
        let mut engine = engine(vec![cpu_above_85()]);

        assert!(!engine.resolve(&AlertId::from("cpu_usage_percent>85"), at(0)));
    }

    #[test]
    fn history_is_bounded() {
        let mut engine = AlertEngine::new(&AlertOptions {
            rules: vec![cpu_above_85()],
            log_capacity: 3,
            ..AlertOptions::default()
        });

        for i in 0..5 {
            engine.evaluate(&cpu(i * 2, 90.0 + f64::from(u8::try_from(i).unwrap())));
            engine.evaluate(&cpu(i * 2 + 1, 10.0));
        }

        let history = engine.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].value, 92.0);
        assert!(history.iter().all(|alert| alert.resolved));
    }
}
