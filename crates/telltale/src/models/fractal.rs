// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::Validate;
use crate::coalesce::{CacheKey, CanonicalKey, KeyBuilder};
use crate::constants::{JULIA_PATH, MANDELBROT_PATH};

const MIN_DIMENSION: u32 = 64;
const MAX_DIMENSION: u32 = 4096;
const MIN_CENTER: f64 = -2.0;
const MAX_CENTER: f64 = 2.0;
const MIN_ZOOM: f64 = 0.1;
const MAX_ZOOM: f64 = 1e15;
const MIN_ITERATIONS: u32 = 50;
const MAX_ITERATIONS: u32 = 10_000;

/// Which fractal family to render.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FractalKind {
    /// The Mandelbrot set.
    Mandelbrot,
    /// A Julia set for the constant `c = c_real + c_imag·i`.
    Julia {
        /// Real part of the constant.
        c_real: f64,
        /// Imaginary part of the constant.
        c_imag: f64,
    },
}

impl FractalKind {
    /// The name used in cache keys and logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Mandelbrot => "mandelbrot",
            Self::Julia { .. } => "julia",
        }
    }

    /// The service path that renders this kind.
    #[must_use]
    pub const fn path(self) -> &'static str {
        match self {
            Self::Mandelbrot => MANDELBROT_PATH,
            Self::Julia { .. } => JULIA_PATH,
        }
    }
}

/// How expensive a render is expected to be.
///
/// The score is `pixels × iterations × max(log10(zoom), 0) / 1e6`; deep zooms dominate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    /// Score below 1.
    Low,
    /// Score below 10.
    Medium,
    /// Score below 100.
    High,
    /// Everything else.
    Extreme,
}

impl Complexity {
    const fn timeout_multiplier(self) -> u32 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 4,
            Self::Extreme => 8,
        }
    }
}

/// Parameters of a fractal render.
///
/// Out-of-range values are clamped by [`FractalParams::clamped`], which the client applies
/// before keying and sending, so two parameter sets that the service would render identically
/// share one cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FractalParams {
    /// Fractal family, with the Julia constant when applicable.
    pub kind: FractalKind,
    /// Image width in pixels, 64 to 4096.
    pub width: u32,
    /// Image height in pixels, 64 to 4096.
    pub height: u32,
    /// Real coordinate of the view center, -2 to 2.
    pub center_x: f64,
    /// Imaginary coordinate of the view center, -2 to 2.
    pub center_y: f64,
    /// Magnification, 0.1 to 1e15.
    pub zoom: f64,
    /// Iteration cap per pixel, 50 to 10000.
    pub max_iterations: u32,
}

impl FractalParams {
    /// An 800×600 Mandelbrot view centered on `(-0.5, 0)`.
    #[must_use]
    pub const fn mandelbrot() -> Self {
        Self {
            kind: FractalKind::Mandelbrot,
            width: 800,
            height: 600,
            center_x: -0.5,
            center_y: 0.0,
            zoom: 1.0,
            max_iterations: 100,
        }
    }

    /// An 800×600 Julia view centered on the origin.
    #[must_use]
    pub const fn julia(c_real: f64, c_imag: f64) -> Self {
        Self {
            kind: FractalKind::Julia { c_real, c_imag },
            center_x: 0.0,
            ..Self::mandelbrot()
        }
    }

    /// Sets the image size.
    #[must_use]
    pub const fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Sets the view center.
    #[must_use]
    pub const fn with_center(mut self, x: f64, y: f64) -> Self {
        self.center_x = x;
        self.center_y = y;
        self
    }

    /// Sets the magnification.
    #[must_use]
    pub const fn with_zoom(mut self, zoom: f64) -> Self {
        self.zoom = zoom;
        self
    }

    /// Sets the iteration cap.
    #[must_use]
    pub const fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Returns a copy with every field forced into the range the service accepts.
    ///
    /// Non-finite floats fall back to the defaults of the fractal kind.
    #[must_use]
    pub fn clamped(self) -> Self {
        let defaults = match self.kind {
            FractalKind::Mandelbrot => Self::mandelbrot(),
            FractalKind::Julia { c_real, c_imag } => Self::julia(c_real, c_imag),
        };
        let clamp = |value: f64, fallback: f64, min: f64, max: f64| {
            if value.is_finite() { value.clamp(min, max) } else { fallback }
        };

        let kind = match self.kind {
            FractalKind::Mandelbrot => FractalKind::Mandelbrot,
            FractalKind::Julia { c_real, c_imag } => FractalKind::Julia {
                c_real: clamp(c_real, -0.7, MIN_CENTER, MAX_CENTER),
                c_imag: clamp(c_imag, 0.270_15, MIN_CENTER, MAX_CENTER),
            },
        };

        Self {
            kind,
            width: self.width.clamp(MIN_DIMENSION, MAX_DIMENSION),
            height: self.height.clamp(MIN_DIMENSION, MAX_DIMENSION),
            center_x: clamp(self.center_x, defaults.center_x, MIN_CENTER, MAX_CENTER),
            center_y: clamp(self.center_y, defaults.center_y, MIN_CENTER, MAX_CENTER),
            zoom: clamp(self.zoom, defaults.zoom, MIN_ZOOM, MAX_ZOOM),
            max_iterations: self.max_iterations.clamp(MIN_ITERATIONS, MAX_ITERATIONS),
        }
    }

    /// Number of pixels in the rendered image.
    #[must_use]
    pub fn pixel_count(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Classifies how expensive the render is; see [`Complexity`].
    #[must_use]
    #[expect(clippy::cast_precision_loss, reason = "scores only need a rough magnitude")]
    pub fn complexity(&self) -> Complexity {
        let depth = self.zoom.log10().max(0.0);
        let score = self.pixel_count() as f64 * f64::from(self.max_iterations) * depth / 1_000_000.0;

        match score {
            s if s < 1.0 => Complexity::Low,
            s if s < 10.0 => Complexity::Medium,
            s if s < 100.0 => Complexity::High,
            _ => Complexity::Extreme,
        }
    }

    /// The timeout for rendering these parameters: `base` scaled by complexity, capped at `max`.
    #[must_use]
    pub fn timeout(&self, base: Duration, max: Duration) -> Duration {
        base.saturating_mul(self.complexity().timeout_multiplier()).min(max)
    }

    /// The query parameters sent to the service, in cache-key field order.
    ///
    /// The service reads render parameters from the query string only.
    #[must_use]
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("width", self.width.to_string()),
            ("height", self.height.to_string()),
            ("center_x", self.center_x.to_string()),
            ("center_y", self.center_y.to_string()),
            ("zoom", self.zoom.to_string()),
            ("max_iterations", self.max_iterations.to_string()),
        ];

        if let FractalKind::Julia { c_real, c_imag } = self.kind {
            pairs.push(("c_real", c_real.to_string()));
            pairs.push(("c_imag", c_imag.to_string()));
        }

        pairs
    }
}

impl Default for FractalParams {
    fn default() -> Self {
        Self::mandelbrot()
    }
}

impl CanonicalKey for FractalParams {
    fn canonical_key(&self, precision: u8) -> CacheKey {
        let mut key = KeyBuilder::new(self.kind.name(), precision);
        key.int("width", self.width)
            .int("height", self.height)
            .float("center_x", self.center_x)
            .float("center_y", self.center_y)
            .float("zoom", self.zoom)
            .int("max_iterations", self.max_iterations);

        if let FractalKind::Julia { c_real, c_imag } = self.kind {
            key.float("c_real", c_real).float("c_imag", c_imag);
        }

        key.finish()
    }
}

/// Timing details reported alongside a render.
///
/// These are diagnostics derived by division on the service; a render that finishes within a
/// millisecond reports an infinite rate, which arrives as `null` and deserializes as `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderStats {
    /// Rendered pixels per second of computation.
    pub pixels_per_second: Option<f64>,
    /// Speedup over a single thread, relative to the ideal.
    pub parallel_efficiency: Option<f64>,
    /// Memory growth of the service during the render.
    pub memory_usage_mb: Option<f64>,
    /// CPU usage growth of the service during the render.
    pub cpu_utilization: Option<f64>,
}

/// A rendered fractal: row-major RGBA pixels plus render details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FractalImage {
    /// RGBA bytes, four per pixel.
    pub data: Vec<u8>,
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Time the service spent rendering.
    pub computation_time_ms: u64,
    /// Magnification the image was rendered at.
    pub zoom_level: f64,
    /// Parameters as echoed back by the service.
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// Render diagnostics, when reported.
    #[serde(default)]
    pub performance_metrics: Option<RenderStats>,
}

impl Validate for FractalImage {
    fn validate(&self) -> Result<(), String> {
        if self.width == 0 || self.height == 0 {
            return Err(format!("image dimensions must be non-zero, got {}x{}", self.width, self.height));
        }

        let expected = u64::from(self.width) * u64::from(self.height) * 4;
        if self.data.len() as u64 != expected {
            return Err(format!(
                "pixel data holds {} bytes, expected {expected} for a {}x{} RGBA image",
                self.data.len(),
                self.width,
                self.height
            ));
        }

        if !(self.zoom_level.is_finite() && self.zoom_level > 0.0) {
            return Err(format!("zoom_level must be positive, got {}", self.zoom_level));
        }

        Ok(())
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn clamped_forces_service_ranges() {
        let params = FractalParams::mandelbrot()
            .with_size(10, 9000)
            .with_center(-5.0, f64::NAN)
            .with_zoom(0.0)
            .with_max_iterations(1)
            .clamped();

        assert_eq!(params.width, 64);
        assert_eq!(params.height, 4096);
        assert_eq!(params.center_x, -2.0);
        assert_eq!(params.center_y, 0.0);
        assert_eq!(params.zoom, 0.1);
        assert_eq!(params.max_iterations, 50);
    }

    #[rstest]
    #[case(256, 256, 50, 1.0, Complexity::Low)]
    #[case(800, 600, 100, 10.0, Complexity::High)]
    #[case(800, 600, 10, 10.0, Complexity::Medium)]
    #[case(2048, 2048, 1000, 1000.0, Complexity::Extreme)]
    fn complexity_classification(
        #[case] width: u32,
        #[case] height: u32,
        #[case] iterations: u32,
        #[case] zoom: f64,
        #[case] expected: Complexity,
    ) {
        let params = FractalParams::mandelbrot()
            .with_size(width, height)
            .with_max_iterations(iterations)
            .with_zoom(zoom);

        assert_eq!(params.complexity(), expected);
    }

    #[test]
    fn timeout_scales_with_complexity_and_caps() {
        let base = Duration::from_secs(15);
        let max = Duration::from_secs(90);

        let shallow = FractalParams::mandelbrot();
        assert_eq!(shallow.timeout(base, max), base);

        let deep = FractalParams::mandelbrot().with_size(2048, 2048).with_zoom(1e6).with_max_iterations(1000);
        assert_eq!(deep.timeout(base, max), max);
    }

    #[test]
    fn equivalent_params_share_a_key() {
        let a = FractalParams::mandelbrot().with_center(-0.500_000_01, 0.0);
        let b = FractalParams::mandelbrot().with_center(-0.5, -0.0);

        assert_eq!(a.canonical_key(6), b.canonical_key(6));
        assert_ne!(a.canonical_key(9), b.canonical_key(9));
    }

    #[test]
    fn julia_key_includes_constant() {
        let a = FractalParams::julia(-0.7, 0.27);
        let b = FractalParams::julia(-0.7, 0.28);

        assert_ne!(a.canonical_key(6), b.canonical_key(6));
        assert_ne!(a.canonical_key(6), FractalParams::mandelbrot().canonical_key(6));
    }

    #[test]
    fn julia_query_carries_constant() {
        let pairs = FractalParams::julia(-0.7, 0.27).query_pairs();

        assert_eq!(pairs.last(), Some(&("c_imag", "0.27".to_string())));
        assert!(pairs.contains(&("c_real", "-0.7".to_string())));
        assert!(pairs.contains(&("center_x", "0".to_string())));
        assert!(FractalParams::mandelbrot().query_pairs().iter().all(|(name, _)| *name != "c_real"));
    }

    #[test]
    fn null_render_stats_are_accepted() {
        let json = serde_json::json!({
            "data": vec![0_u8; 64 * 64 * 4],
            "width": 64,
            "height": 64,
            "computation_time_ms": 0,
            "zoom_level": 1.0,
            "performance_metrics": {
                "pixels_per_second": null,
                "parallel_efficiency": null,
                "memory_usage_mb": 0.5,
                "cpu_utilization": 1.0
            }
        });

        let image: FractalImage = serde_json::from_value(json).unwrap();
        image.validate().unwrap();

        let stats = image.performance_metrics.unwrap();
        assert_eq!(stats.pixels_per_second, None);
        assert_eq!(stats.memory_usage_mb, Some(0.5));
    }

    #[test]
    fn image_validation_checks_pixel_buffer() {
        let mut image = FractalImage {
            data: vec![0; 64 * 64 * 4],
            width: 64,
            height: 64,
            computation_time_ms: 12,
            zoom_level: 1.0,
            parameters: serde_json::Value::Null,
            performance_metrics: None,
        };
        image.validate().unwrap();

        image.data.pop();
        let reason = image.validate().unwrap_err();
        assert!(reason.contains("16383 bytes"), "{reason}");
    }
}
