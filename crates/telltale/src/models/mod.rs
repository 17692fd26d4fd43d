// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Typed request and response shapes of the remote performance service.
//!
//! Every response type implements [`Validate`]. The executor runs the validation right after
//! deserialization, so a response that parses but carries nonsensical values (a negative
//! percentage, a pixel buffer that does not match its dimensions, ...) is rejected as a
//! validation error instead of being passed on partially.

mod benchmark;
mod fractal;
mod health;
pub(crate) mod metrics;

pub use benchmark::{
    BenchmarkReport, BenchmarkSections, CpuBenchmark, CpuRun, FractalBenchmarkReport, FractalBenchmarkRun, FractalTiming,
    MemoryBenchmark, MemoryRun,
};
pub use fractal::{Complexity, FractalImage, FractalKind, FractalParams, RenderStats};
pub use health::{HealthReport, LivenessReport, ReadinessReport, ServiceStatus};
pub use metrics::{ApplicationMetrics, HardwareInfo, MetricsSnapshot, RuntimeInfo, SystemInfo, SystemMetrics};

/// A response that can check its own consistency after deserialization.
pub trait Validate {
    /// Returns a description of the first inconsistency found.
    ///
    /// # Errors
    ///
    /// Returns the reason the value must not be accepted.
    fn validate(&self) -> Result<(), String>;
}

pub(crate) fn ensure_percentage(field: &str, value: f64) -> Result<(), String> {
    if value.is_finite() && (0.0..=100.0).contains(&value) {
        Ok(())
    } else {
        Err(format!("{field} must be a percentage, got {value}"))
    }
}

pub(crate) fn ensure_non_negative(field: &str, value: f64) -> Result<(), String> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(format!("{field} must be a finite non-negative number, got {value}"))
    }
}

/// Like [`ensure_non_negative`], for ratios the service reports as `null` when undefined.
pub(crate) fn ensure_non_negative_or_absent(field: &str, value: Option<f64>) -> Result<(), String> {
    value.map_or(Ok(()), |value| ensure_non_negative(field, value))
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_bounds() {
        ensure_percentage("cpu", 0.0).unwrap();
        ensure_percentage("cpu", 100.0).unwrap();
        assert!(ensure_percentage("cpu", 100.5).is_err());
        assert!(ensure_percentage("cpu", f64::NAN).is_err());
    }

    #[test]
    fn non_negative_rejects_infinity() {
        ensure_non_negative("load", 12.5).unwrap();
        assert!(ensure_non_negative("load", -0.1).is_err());
        assert!(ensure_non_negative("load", f64::INFINITY).is_err());
        ensure_non_negative_or_absent("rate", None).unwrap();
        assert!(ensure_non_negative_or_absent("rate", Some(-1.0)).is_err());
    }
}
