// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeMap;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use super::Validate;

/// Overall service condition as reported by the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// Every component works.
    #[serde(alias = "Healthy")]
    Healthy,
    /// The service answers, but some component is impaired.
    #[serde(alias = "Degraded")]
    Degraded,
    /// The service cannot do useful work.
    #[serde(alias = "Unhealthy")]
    Unhealthy,
}

impl ServiceStatus {
    /// Whether the service considers itself fit to serve requests.
    #[must_use]
    pub const fn is_serving(self) -> bool {
        !matches!(self, Self::Unhealthy)
    }
}

/// Response of `GET /health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Overall condition.
    pub status: ServiceStatus,
    /// When the service ran its checks.
    pub timestamp: Timestamp,
    /// Time since the service started.
    #[serde(default)]
    pub uptime_seconds: u64,
    /// Per-component details, passed through as reported.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub services: serde_json::Value,
}

impl Validate for HealthReport {
    fn validate(&self) -> Result<(), String> {
        if self.services.is_null() || self.services.is_object() {
            Ok(())
        } else {
            Err("services must be an object when present".to_string())
        }
    }
}

/// Response of `GET /health/ready`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessReport {
    /// Whether every dependency needed to serve traffic is available.
    pub ready: bool,
    /// When the service ran its checks.
    pub timestamp: Timestamp,
    /// Outcome per dependency, e.g. `"database"`.
    #[serde(default)]
    pub checks: BTreeMap<String, bool>,
}

impl Validate for ReadinessReport {
    fn validate(&self) -> Result<(), String> {
        if self.ready && self.checks.values().any(|passed| !passed) {
            return Err("ready is reported while a dependency check failed".to_string());
        }
        Ok(())
    }
}

/// Response of `GET /health/live`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessReport {
    /// Always `true` when the service answers at all.
    pub alive: bool,
    /// When the service answered.
    pub timestamp: Timestamp,
    /// Time since the service started.
    #[serde(default)]
    pub uptime_seconds: u64,
}

impl Validate for LivenessReport {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}
