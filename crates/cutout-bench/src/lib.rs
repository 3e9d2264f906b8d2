use std::time::Instant;

use cutout_core::{CoreError, Mask, RefinementConfig, Variant};
use cutout_refine::MaskRefiner;
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct BenchmarkCase {
    pub name: String,
    pub width: u32,
    pub height: u32,
}

pub fn default_cases() -> Vec<BenchmarkCase> {
    vec![
        BenchmarkCase {
            name: "quality-budget".to_string(),
            width: 512,
            height: 512,
        },
        BenchmarkCase {
            name: "constrained-budget".to_string(),
            width: 640,
            height: 640,
        },
        BenchmarkCase {
            name: "fast-budget".to_string(),
            width: 832,
            height: 832,
        },
    ]
}

pub fn describe(cases: &[BenchmarkCase]) -> String {
    cases
        .iter()
        .map(|c| format!("{}:{}x{}", c.name, c.width, c.height))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkReport {
    pub case: String,
    pub variant: Variant,
    pub width: u32,
    pub height: u32,
    pub iterations: u32,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

/// Soft-edged disk with speckle noise, a rough stand-in for model output.
pub fn synthetic_mask(width: u32, height: u32) -> Result<Mask, CoreError> {
    let cx = width as f32 / 2.0;
    let cy = height as f32 / 2.0;
    let radius = width.min(height) as f32 * 0.35;
    Mask::from_fn(width, height, |x, y| {
        let d = ((x as f32 - cx).powi(2) + (y as f32 - cy).powi(2)).sqrt();
        let base = (radius + 4.0 - d) / 8.0;
        let speckle = if (x.wrapping_mul(7919) ^ y.wrapping_mul(104_729)) % 97 == 0 {
            0.6
        } else {
            0.0
        };
        (base + speckle).clamp(0.0, 1.0)
    })
}

/// Times the refinement passes for `variant` on a fresh synthetic mask per
/// iteration.
pub fn run_case(case: &BenchmarkCase, variant: Variant, iterations: u32) -> Result<BenchmarkReport, CoreError> {
    let refiner = MaskRefiner::new(RefinementConfig::for_variant(variant))?;
    let source = synthetic_mask(case.width, case.height)?;
    let iterations = iterations.max(1);
    let mut samples = Vec::with_capacity(iterations as usize);
    for _ in 0..iterations {
        let mut mask = source.clone();
        let start = Instant::now();
        refiner.refine(&mut mask)?;
        samples.push(start.elapsed().as_secs_f64() * 1000.0);
    }
    let total: f64 = samples.iter().sum();
    Ok(BenchmarkReport {
        case: case.name.clone(),
        variant,
        width: case.width,
        height: case.height,
        iterations,
        mean_ms: total / samples.len() as f64,
        min_ms: samples.iter().copied().fold(f64::INFINITY, f64::min),
        max_ms: samples.iter().copied().fold(0.0, f64::max),
    })
}

pub fn run_all(cases: &[BenchmarkCase], iterations: u32) -> Result<Vec<BenchmarkReport>, CoreError> {
    let mut reports = Vec::with_capacity(cases.len() * 2);
    for case in cases {
        for variant in [Variant::Quality, Variant::Fast] {
            reports.push(run_case(case, variant, iterations)?);
        }
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_lists_every_case() {
        assert_eq!(
            describe(&default_cases()),
            "quality-budget:512x512, constrained-budget:640x640, fast-budget:832x832"
        );
    }

    #[test]
    fn reports_cover_both_variants() {
        let cases = [BenchmarkCase {
            name: "tiny".to_string(),
            width: 24,
            height: 16,
        }];
        let reports = run_all(&cases, 2).expect("bench");
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].variant, Variant::Quality);
        assert_eq!(reports[1].variant, Variant::Fast);
        assert!(reports.iter().all(|r| r.min_ms <= r.mean_ms && r.mean_ms <= r.max_ms));
    }

    #[test]
    fn synthetic_mask_is_in_unit_range() {
        let mask = synthetic_mask(64, 48).expect("mask");
        assert!(mask.values().iter().all(|v| (0.0..=1.0).contains(v)));
        assert_eq!(mask.get(32, 24), 1.0);
        assert_eq!(mask.get(1, 1), 0.0);
    }
}
