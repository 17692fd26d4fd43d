// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use super::{Validate, ensure_non_negative, ensure_non_negative_or_absent};

/// Result of a full benchmark run on the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkReport {
    /// Identifier assigned by the service.
    pub benchmark_id: String,
    /// When the run finished.
    pub timestamp: Timestamp,
    /// Wall-clock duration of the whole run.
    pub total_duration_ms: f64,
    /// Per-area results.
    pub benchmarks: BenchmarkSections,
    /// Free-form description of the host the run executed on.
    #[serde(default)]
    pub system_info: serde_json::Value,
    /// Human-readable verdict, e.g. `"Excellent"`.
    pub performance_rating: String,
}

/// CPU and memory results of a benchmark run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkSections {
    /// Prime-sieve results.
    pub cpu: CpuBenchmark,
    /// Array allocation and traversal results.
    pub memory: MemoryBenchmark,
}

/// Prime-sieve results, single- and multi-threaded.
///
/// Rates are derived by division on the service and are `None` when reported as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuBenchmark {
    /// Sieve on one thread.
    pub single_thread: CpuRun,
    /// Sieve on every thread.
    pub multi_thread: CpuRun,
    /// Multi-threaded speedup divided by the thread count.
    #[serde(default)]
    pub parallel_efficiency: Option<f64>,
}

/// One sieve run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuRun {
    /// Primes found.
    pub primes_found: u64,
    /// Duration of the run.
    pub duration_ms: f64,
    /// Throughput of the run.
    #[serde(default)]
    pub primes_per_second: Option<f64>,
}

/// Memory results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryBenchmark {
    /// Allocating and filling a large array.
    pub allocation: MemoryRun,
    /// Summing the array.
    pub sequential_read: MemoryRun,
    /// Overwriting the array.
    pub sequential_write: MemoryRun,
}

/// One memory run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRun {
    /// Duration of the run.
    pub duration_ms: f64,
    /// Throughput of the run.
    #[serde(default)]
    pub mb_per_second: Option<f64>,
}

impl Validate for BenchmarkReport {
    fn validate(&self) -> Result<(), String> {
        if self.benchmark_id.trim().is_empty() {
            return Err("benchmark_id must not be empty".to_string());
        }

        ensure_non_negative("total_duration_ms", self.total_duration_ms)?;

        let cpu = &self.benchmarks.cpu;
        for (name, run) in [("single_thread", &cpu.single_thread), ("multi_thread", &cpu.multi_thread)] {
            ensure_non_negative(&format!("benchmarks.cpu.{name}.duration_ms"), run.duration_ms)?;
            ensure_non_negative_or_absent(&format!("benchmarks.cpu.{name}.primes_per_second"), run.primes_per_second)?;
        }
        ensure_non_negative_or_absent("benchmarks.cpu.parallel_efficiency", cpu.parallel_efficiency)?;

        let memory = &self.benchmarks.memory;
        for (name, run) in [
            ("allocation", &memory.allocation),
            ("sequential_read", &memory.sequential_read),
            ("sequential_write", &memory.sequential_write),
        ] {
            ensure_non_negative(&format!("benchmarks.memory.{name}.duration_ms"), run.duration_ms)?;
            ensure_non_negative_or_absent(&format!("benchmarks.memory.{name}.mb_per_second"), run.mb_per_second)?;
        }

        Ok(())
    }
}

/// Response of `POST /api/fractals/benchmark`: render timings over a fixed ladder of
/// resolutions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FractalBenchmarkReport {
    /// One entry per resolution, cheapest first.
    pub benchmark_results: Vec<FractalBenchmarkRun>,
    /// Number of entries in `benchmark_results`.
    pub total_benchmarks: usize,
    /// When the suite finished.
    pub benchmark_timestamp: Timestamp,
    /// Free-form description of the host the suite ran on.
    #[serde(default)]
    pub system_context: serde_json::Value,
}

/// Render timings at one resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FractalBenchmarkRun {
    /// Label of the step, e.g. `"medium"`.
    pub complexity: String,
    /// `"{width}x{height}"`.
    pub resolution: String,
    /// Iteration cap used at this step.
    pub max_iterations: u32,
    /// Pixels per image.
    pub total_pixels: u64,
    /// Mandelbrot timing.
    pub mandelbrot: FractalTiming,
    /// Julia timing.
    pub julia: FractalTiming,
}

/// Timing of one benchmark render.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FractalTiming {
    /// Time the render took.
    pub computation_time_ms: u64,
    /// Throughput; `None` when the render finished within a millisecond.
    #[serde(default)]
    pub pixels_per_ms: Option<f64>,
    /// Human-readable verdict, e.g. `"Very Good"`.
    pub performance_rating: String,
}

impl Validate for FractalBenchmarkReport {
    fn validate(&self) -> Result<(), String> {
        if self.total_benchmarks != self.benchmark_results.len() {
            return Err(format!(
                "total_benchmarks is {} but {} results were sent",
                self.total_benchmarks,
                self.benchmark_results.len()
            ));
        }

        self.benchmark_results.iter().try_for_each(|run| {
            ensure_non_negative_or_absent(&format!("{}.mandelbrot.pixels_per_ms", run.resolution), run.mandelbrot.pixels_per_ms)?;
            ensure_non_negative_or_absent(&format!("{}.julia.pixels_per_ms", run.resolution), run.julia.pixels_per_ms)
        })
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    fn report_json() -> serde_json::Value {
        let run = serde_json::json!({ "duration_ms": 80.0, "mb_per_second": 950.5 });
        serde_json::json!({
            "benchmark_id": "4b0c7e0e-54a4-4c38-8f0a-1f3a4ae1d7a0",
            "timestamp": "2024-05-01T12:00:00Z",
            "total_duration_ms": 1840,
            "benchmarks": {
                "cpu": {
                    "single_thread": { "primes_found": 9592, "duration_ms": 410, "primes_per_second": 23395.1 },
                    "multi_thread": { "primes_found": 9592, "duration_ms": 95, "primes_per_second": 100968.4 },
                    "parallel_efficiency": 0.54
                },
                "memory": { "allocation": run, "sequential_read": run, "sequential_write": run }
            },
            "system_info": { "cpu_model": "Test CPU", "cpu_cores": 8 },
            "performance_rating": "Excellent"
        })
    }

    #[test]
    fn deserializes_benchmark_report() {
        let report: BenchmarkReport = serde_json::from_value(report_json()).unwrap();

        assert_eq!(report.benchmarks.cpu.multi_thread.primes_found, 9592);
        assert_eq!(report.system_info["cpu_cores"], 8);
        report.validate().unwrap();
    }

    #[test]
    fn negative_throughput_fails_validation() {
        let mut json = report_json();
        json["benchmarks"]["memory"]["sequential_read"]["mb_per_second"] = serde_json::json!(-1.0);
        let report: BenchmarkReport = serde_json::from_value(json).unwrap();

        let reason = report.validate().unwrap_err();
        assert!(reason.contains("sequential_read"), "{reason}");
    }

    #[test]
    fn null_rates_are_accepted() {
        let mut json = report_json();
        json["benchmarks"]["cpu"]["parallel_efficiency"] = serde_json::Value::Null;
        json["benchmarks"]["memory"]["sequential_read"]["mb_per_second"] = serde_json::Value::Null;
        let report: BenchmarkReport = serde_json::from_value(json).unwrap();

        report.validate().unwrap();
        assert_eq!(report.benchmarks.memory.sequential_read.mb_per_second, None);
        assert_eq!(report.benchmarks.memory.allocation.mb_per_second, Some(950.5));
    }

    fn fractal_run(resolution: &str, mandelbrot_rate: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "complexity": "low",
            "resolution": resolution,
            "max_iterations": 100,
            "total_pixels": 65536,
            "mandelbrot": { "computation_time_ms": 0, "pixels_per_ms": mandelbrot_rate, "performance_rating": "Needs Optimization" },
            "julia": { "computation_time_ms": 4, "pixels_per_ms": 16384.0, "performance_rating": "Exceptional" }
        })
    }

    #[test]
    fn fractal_benchmark_accepts_instant_renders() {
        let report: FractalBenchmarkReport = serde_json::from_value(serde_json::json!({
            "benchmark_results": [fractal_run("256x256", serde_json::Value::Null)],
            "total_benchmarks": 1,
            "benchmark_timestamp": "2024-05-01T12:00:00Z",
            "system_context": { "cpu_cores": 8 }
        }))
        .unwrap();

        report.validate().unwrap();
        assert_eq!(report.benchmark_results[0].mandelbrot.pixels_per_ms, None);
        assert_eq!(report.benchmark_results[0].julia.performance_rating, "Exceptional");
    }

    #[test]
    fn fractal_benchmark_count_must_match() {
        let report: FractalBenchmarkReport = serde_json::from_value(serde_json::json!({
            "benchmark_results": [fractal_run("256x256", serde_json::json!(12.0))],
            "total_benchmarks": 4,
            "benchmark_timestamp": "2024-05-01T12:00:00Z"
        }))
        .unwrap();

        let reason = report.validate().unwrap_err();
        assert!(reason.contains("total_benchmarks is 4"), "{reason}");
    }

    #[test]
    fn blank_id_fails_validation() {
        let mut json = report_json();
        json["benchmark_id"] = serde_json::json!("  ");
        let report: BenchmarkReport = serde_json::from_value(json).unwrap();

        assert!(report.validate().is_err());
    }
}
