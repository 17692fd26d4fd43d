// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use super::{Validate, ensure_non_negative, ensure_non_negative_or_absent, ensure_percentage};
use crate::history::MetricSample;

/// A point-in-time view of the service's host and application metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// When the service collected the snapshot.
    pub timestamp: Timestamp,
    /// Host-level resource usage.
    pub system: SystemMetrics,
    /// Application-level counters.
    pub application: ApplicationMetrics,
    /// Static hardware description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<HardwareInfo>,
    /// Build and runtime description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeInfo>,
}

/// Host-level resource usage.
///
/// Ratios the service derives by division (`memory_usage_percent`, `disk_usage_percent`) are
/// sent as `null` when their denominator is zero; they deserialize as `None` and produce no
/// history sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    /// Global CPU usage across all cores.
    pub cpu_usage_percent: f64,
    /// Share of physical memory in use.
    #[serde(default)]
    pub memory_usage_percent: Option<f64>,
    /// Installed physical memory.
    pub memory_total_gb: f64,
    /// Memory available to new allocations.
    pub memory_available_gb: f64,
    /// Share of the primary disk in use.
    #[serde(default)]
    pub disk_usage_percent: Option<f64>,
    /// One-minute load average.
    pub load_average_1m: f64,
    /// Five-minute load average.
    pub load_average_5m: f64,
    /// Fifteen-minute load average.
    pub load_average_15m: f64,
    /// Host uptime.
    #[serde(default)]
    pub uptime_seconds: u64,
    /// Number of running processes.
    #[serde(default)]
    pub active_processes: u32,
}

/// Application-level counters.
///
/// Averages and ratios are `None` when the service reports them as `null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationMetrics {
    /// Requests served since start.
    pub requests_handled: u64,
    /// Mean response time of served requests.
    pub average_response_time_ms: Option<f64>,
    /// Fractals rendered since start.
    pub fractal_computations: u64,
    /// Share of requests served from the service's cache.
    pub cache_hit_rate: Option<f64>,
    /// Resident memory of the service process.
    pub memory_usage_mb: Option<f64>,
}

/// Static hardware description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareInfo {
    /// CPU brand string.
    pub cpu_model: String,
    /// Physical cores.
    pub cpu_cores: u32,
    /// Logical threads.
    pub cpu_threads: u32,
    /// Target architecture, e.g. `x86_64`.
    pub architecture: String,
    /// Installed physical memory.
    pub total_memory_gb: f64,
}

/// Build and runtime description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    /// Toolchain the service was built with.
    pub rust_version: String,
    /// `debug` or `release`.
    pub build_type: String,
    /// Cargo features compiled into the service.
    #[serde(default)]
    pub features_enabled: Vec<String>,
}

/// Response of `GET /api/performance/system`: a lightweight host description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    /// When the service collected the description.
    pub timestamp: Timestamp,
    /// Operating system name, empty when unknown.
    #[serde(default)]
    pub os_name: String,
}

impl Validate for SystemInfo {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

impl MetricsSnapshot {
    /// Flattens the snapshot into one sample per tracked metric, stamped with the snapshot time.
    #[must_use]
    pub fn samples(&self) -> Vec<MetricSample> {
        let system = &self.system;
        let application = &self.application;

        [
            ("cpu_usage_percent", Some(system.cpu_usage_percent), "%"),
            ("memory_usage_percent", system.memory_usage_percent, "%"),
            ("disk_usage_percent", system.disk_usage_percent, "%"),
            ("load_average_1m", Some(system.load_average_1m), "load"),
            ("load_average_5m", Some(system.load_average_5m), "load"),
            ("load_average_15m", Some(system.load_average_15m), "load"),
            ("memory_available_gb", Some(system.memory_available_gb), "GB"),
            ("average_response_time_ms", application.average_response_time_ms, "ms"),
            ("cache_hit_rate", application.cache_hit_rate, "ratio"),
            ("app_memory_usage_mb", application.memory_usage_mb, "MB"),
        ]
        .into_iter()
        .filter_map(|(metric, value, unit)| value.map(|value| MetricSample::new(self.timestamp, metric, value, unit)))
        .collect()
    }
}

impl Validate for MetricsSnapshot {
    fn validate(&self) -> Result<(), String> {
        let system = &self.system;
        let application = &self.application;

        ensure_percentage("system.cpu_usage_percent", system.cpu_usage_percent)?;
        if let Some(value) = system.memory_usage_percent {
            ensure_percentage("system.memory_usage_percent", value)?;
        }
        if let Some(value) = system.disk_usage_percent {
            ensure_percentage("system.disk_usage_percent", value)?;
        }
        ensure_non_negative("system.memory_total_gb", system.memory_total_gb)?;
        ensure_non_negative("system.memory_available_gb", system.memory_available_gb)?;
        ensure_non_negative("system.load_average_1m", system.load_average_1m)?;
        ensure_non_negative("system.load_average_5m", system.load_average_5m)?;
        ensure_non_negative("system.load_average_15m", system.load_average_15m)?;

        if system.memory_available_gb > system.memory_total_gb {
            return Err(format!(
                "system.memory_available_gb ({}) exceeds system.memory_total_gb ({})",
                system.memory_available_gb, system.memory_total_gb
            ));
        }

        ensure_non_negative_or_absent("application.average_response_time_ms", application.average_response_time_ms)?;
        ensure_non_negative_or_absent("application.cache_hit_rate", application.cache_hit_rate)?;
        ensure_non_negative_or_absent("application.memory_usage_mb", application.memory_usage_mb)
    }
}
