//! Alpha-matte refinement passes.
//!
//! Every pass is a single sweep that reads the previous pass's complete
//! output (`src`) and writes a fresh buffer (`dst`); [`MaskRefiner`] swaps
//! the two between passes. Windowed passes leave a border of
//! `neighborhood / 2` pixels (one pixel for edge sharpening) copied through
//! unchanged instead of padding.

use cutout_core::{CoreError, Mask, RefinePass, RefinementConfig};

const OPAQUE_NEIGHBOR_ALPHA: f32 = 0.4;
const ISOLATED_KEEP_ALPHA: f32 = 0.7;
/// 6 of 24 for the default 5x5 window.
const ISOLATED_MIN_NEIGHBOR_FRACTION: f32 = 0.25;
const HOLE_ALPHA: f32 = 0.2;
const HOLE_NEIGHBOR_ALPHA: f32 = 0.8;
const SIGMOID_STEEPNESS: f32 = 10.0;
const BACKGROUND_FEATHER_GAIN: f32 = 0.3;

#[derive(Debug, Clone)]
pub struct MaskRefiner {
    config: RefinementConfig,
}

impl MaskRefiner {
    pub fn new(config: RefinementConfig) -> Result<Self, CoreError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn refine(&self, mask: &mut Mask) -> Result<(), CoreError> {
        let mut swap = Vec::new();
        let mut blur = Vec::new();
        self.refine_with(mask, &mut swap, &mut blur, |_| {})
    }

    /// Runs the configured passes in order using caller-provided scratch
    /// buffers. `on_pass` fires before each pass starts.
    pub fn refine_with<F>(
        &self,
        mask: &mut Mask,
        swap: &mut Vec<f32>,
        blur: &mut Vec<f32>,
        mut on_pass: F,
    ) -> Result<(), CoreError>
    where
        F: FnMut(RefinePass),
    {
        mask.clamp_unit();
        let (width, height) = (mask.width() as usize, mask.height() as usize);
        for &pass in self.config.passes() {
            on_pass(pass);
            let _span = tracing::debug_span!("refine_pass", pass = pass.label()).entered();
            swap.clear();
            swap.resize(mask.len(), 0.0);
            apply_pass(pass, &self.config, width, height, mask.values(), swap, blur);
            mask.swap_values(swap)?;
        }
        Ok(())
    }
}

pub fn apply_pass(
    pass: RefinePass,
    config: &RefinementConfig,
    width: usize,
    height: usize,
    src: &[f32],
    dst: &mut [f32],
    blur: &mut Vec<f32>,
) {
    match pass {
        RefinePass::HardClip | RefinePass::FastClamp => clip(src, dst, config.low_cut, config.high_cut),
        RefinePass::SuppressIsolated => suppress_isolated(src, dst, width, height, config),
        RefinePass::SharpenEdges => sharpen_edges(src, dst, width, height, config),
        RefinePass::FillHoles => fill_holes(src, dst, width, height, config),
        RefinePass::Feather => feather(src, dst, blur, width, height, config),
    }
}

fn clip(src: &[f32], dst: &mut [f32], low: f32, high: f32) {
    for (out, &a) in dst.iter_mut().zip(src) {
        *out = if a < low {
            0.0
        } else if a > high {
            1.0
        } else {
            a
        };
    }
}

fn count_neighbors(src: &[f32], width: usize, x: usize, y: usize, radius: usize, pred: impl Fn(f32) -> bool) -> u32 {
    let mut count = 0;
    for ny in y - radius..=y + radius {
        let row = ny * width;
        for nx in x - radius..=x + radius {
            if (nx != x || ny != y) && pred(src[row + nx]) {
                count += 1;
            }
        }
    }
    count
}

fn window_neighbors(config: &RefinementConfig) -> u32 {
    config.artifact_neighborhood * config.artifact_neighborhood - 1
}

fn suppress_isolated(src: &[f32], dst: &mut [f32], width: usize, height: usize, config: &RefinementConfig) {
    dst.copy_from_slice(src);
    let radius = (config.artifact_neighborhood / 2) as usize;
    let min_neighbors = (window_neighbors(config) as f32 * ISOLATED_MIN_NEIGHBOR_FRACTION).round() as u32;
    for y in radius..height.saturating_sub(radius) {
        for x in radius..width.saturating_sub(radius) {
            let i = y * width + x;
            let a = src[i];
            if a <= 0.0 || a >= ISOLATED_KEEP_ALPHA {
                continue;
            }
            let opaque = count_neighbors(src, width, x, y, radius, |v| v > OPAQUE_NEIGHBOR_ALPHA);
            if opaque < min_neighbors {
                dst[i] = 0.0;
            }
        }
    }
}

fn sigmoid(a: f32) -> f32 {
    1.0 / (1.0 + (-SIGMOID_STEEPNESS * (a - 0.5)).exp())
}

fn sharpen_edges(src: &[f32], dst: &mut [f32], width: usize, height: usize, config: &RefinementConfig) {
    dst.copy_from_slice(src);
    for y in 1..height.saturating_sub(1) {
        for x in 1..width.saturating_sub(1) {
            let i = y * width + x;
            let a = src[i];
            if a <= config.low_cut || a >= config.high_cut {
                continue;
            }
            let gx = src[i + 1] - src[i - 1];
            let gy = src[i + width] - src[i - width];
            dst[i] = if gx.hypot(gy) > config.edge_gradient_threshold {
                if a >= 0.5 {
                    1.0
                } else {
                    0.0
                }
            } else {
                sigmoid(a)
            };
        }
    }
}

fn fill_holes(src: &[f32], dst: &mut [f32], width: usize, height: usize, config: &RefinementConfig) {
    dst.copy_from_slice(src);
    let radius = (config.artifact_neighborhood / 2) as usize;
    let total = window_neighbors(config) as f32;
    for y in radius..height.saturating_sub(radius) {
        for x in radius..width.saturating_sub(radius) {
            let i = y * width + x;
            if src[i] >= HOLE_ALPHA {
                continue;
            }
            let opaque = count_neighbors(src, width, x, y, radius, |v| v > HOLE_NEIGHBOR_ALPHA);
            if opaque as f32 / total > config.hole_fill_threshold {
                dst[i] = 1.0;
            }
        }
    }
}

fn box_blur_horizontal(src: &[f32], dst: &mut [f32], width: usize, height: usize, radius: usize) {
    let last = width as isize - 1;
    let window = (2 * radius + 1) as f32;
    for y in 0..height {
        let row = &src[y * width..(y + 1) * width];
        for x in 0..width {
            let mut sum = 0.0f32;
            for dx in -(radius as isize)..=radius as isize {
                sum += row[(x as isize + dx).clamp(0, last) as usize];
            }
            dst[y * width + x] = sum / window;
        }
    }
}

fn box_blur_vertical(src: &[f32], dst: &mut [f32], width: usize, height: usize, radius: usize) {
    let last = height as isize - 1;
    let window = (2 * radius + 1) as f32;
    for y in 0..height {
        for x in 0..width {
            let mut sum = 0.0f32;
            for dy in -(radius as isize)..=radius as isize {
                sum += src[(y as isize + dy).clamp(0, last) as usize * width + x];
            }
            dst[y * width + x] = sum / window;
        }
    }
}

fn feather(src: &[f32], dst: &mut [f32], blur: &mut Vec<f32>, width: usize, height: usize, config: &RefinementConfig) {
    let radius = config.feather_radius as usize;
    blur.clear();
    blur.resize(src.len(), 0.0);
    box_blur_horizontal(src, blur, width, height, radius);
    box_blur_vertical(blur, dst, width, height, radius);

    for (out, &a) in dst.iter_mut().zip(src) {
        if a > config.high_cut {
            *out = a;
        } else if a < config.low_cut {
            *out *= BACKGROUND_FEATHER_GAIN;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(pass: RefinePass, config: &RefinementConfig, mask: &Mask) -> Mask {
        let mut dst = vec![0.0; mask.len()];
        let mut blur = Vec::new();
        apply_pass(
            pass,
            config,
            mask.width() as usize,
            mask.height() as usize,
            mask.values(),
            &mut dst,
            &mut blur,
        );
        Mask::from_values(mask.width(), mask.height(), dst).expect("pass keeps size")
    }

    fn disk(size: u32, radius: f32) -> Mask {
        let c = size as f32 / 2.0;
        Mask::from_fn(size, size, |x, y| {
            let d = ((x as f32 - c).powi(2) + (y as f32 - c).powi(2)).sqrt();
            if d <= radius {
                1.0
            } else {
                0.0
            }
        })
        .expect("disk mask")
    }

    /// Sets the first `opaque` non-center pixels of a square window to 1.0.
    fn hole_window(size: u32, opaque: usize) -> Mask {
        let center = size / 2;
        let mut remaining = opaque;
        Mask::from_fn(size, size, |x, y| {
            if (x, y) == (center, center) || remaining == 0 {
                0.0
            } else {
                remaining -= 1;
                1.0
            }
        })
        .expect("window mask")
    }

    #[test]
    fn hard_clip_snaps_tails() {
        let mask = Mask::from_values(4, 1, vec![0.05, 0.1, 0.9, 0.95]).expect("mask");
        let out = run(RefinePass::HardClip, &RefinementConfig::quality(), &mask);
        assert_eq!(out.values(), &[0.0, 0.1, 0.9, 1.0]);
    }

    #[test]
    fn lone_faint_pixel_is_suppressed() {
        let mut mask = Mask::filled(9, 9, 0.0).expect("mask");
        mask.set(4, 4, 0.5);
        let out = run(RefinePass::SuppressIsolated, &RefinementConfig::quality(), &mask);
        assert_eq!(out.get(4, 4), 0.0);
    }

    #[test]
    fn lone_strong_pixel_survives_suppression() {
        let mut mask = Mask::filled(9, 9, 0.0).expect("mask");
        mask.set(4, 4, 0.75);
        let out = run(RefinePass::SuppressIsolated, &RefinementConfig::quality(), &mask);
        assert_eq!(out.get(4, 4), 0.75);
    }

    #[test]
    fn six_opaque_neighbors_keep_pixel() {
        let mut mask = Mask::filled(9, 9, 0.0).expect("mask");
        mask.set(4, 4, 0.5);
        for x in 2..=6 {
            mask.set(x, 2, 1.0);
        }
        mask.set(2, 3, 1.0);
        // Outside the 5x5 window; must not count.
        mask.set(7, 4, 1.0);
        let out = run(RefinePass::SuppressIsolated, &RefinementConfig::quality(), &mask);
        assert_eq!(out.get(4, 4), 0.5);

        mask.set(2, 3, 0.0);
        let out = run(RefinePass::SuppressIsolated, &RefinementConfig::quality(), &mask);
        assert_eq!(out.get(4, 4), 0.0);
    }

    #[test]
    fn border_pixels_are_not_processed() {
        let mut mask = Mask::filled(9, 9, 0.0).expect("mask");
        mask.set(1, 4, 0.5);
        mask.set(4, 0, 0.1);
        let config = RefinementConfig::quality();
        let out = run(RefinePass::SuppressIsolated, &config, &mask);
        assert_eq!(out.get(1, 4), 0.5);
        let out = run(RefinePass::FillHoles, &config, &Mask::filled(9, 9, 1.0).expect("mask"));
        assert!(out.values().iter().all(|v| *v == 1.0));
        let out = run(RefinePass::FillHoles, &config, &mask);
        assert_eq!(out.get(4, 0), 0.1);
    }

    #[test]
    fn steep_edge_snaps_to_hard_value() {
        let mask = Mask::from_fn(3, 3, |x, _| [0.0, 0.6, 1.0][x as usize]).expect("mask");
        let out = run(RefinePass::SharpenEdges, &RefinementConfig::quality(), &mask);
        assert_eq!(out.get(1, 1), 1.0);

        let falling = Mask::from_fn(3, 3, |x, _| [1.0, 0.4, 0.0][x as usize]).expect("mask");
        let out = run(RefinePass::SharpenEdges, &RefinementConfig::quality(), &falling);
        assert_eq!(out.get(1, 1), 0.0);
    }

    #[test]
    fn flat_region_gets_sigmoid_contrast() {
        let mask = Mask::filled(3, 3, 0.6).expect("mask");
        let out = run(RefinePass::SharpenEdges, &RefinementConfig::quality(), &mask);
        let expected = 1.0 / (1.0 + (-1.0f32).exp());
        assert!((out.get(1, 1) - expected).abs() < 1e-6);
        assert_eq!(out.get(0, 0), 0.6);
    }

    #[test]
    fn hole_fill_requires_strictly_more_than_threshold() {
        let config = RefinementConfig {
            artifact_neighborhood: 11,
            ..RefinementConfig::quality()
        };
        // 84 of 120 neighbours is exactly 70%.
        let out = run(RefinePass::FillHoles, &config, &hole_window(11, 84));
        assert_eq!(out.get(5, 5), 0.0);

        // 86 of 120 is ~71.7%.
        let out = run(RefinePass::FillHoles, &config, &hole_window(11, 86));
        assert_eq!(out.get(5, 5), 1.0);
    }

    #[test]
    fn hole_fill_default_window_boundary() {
        let config = RefinementConfig::quality();
        let out = run(RefinePass::FillHoles, &config, &hole_window(5, 16));
        assert_eq!(out.get(2, 2), 0.0);
        let out = run(RefinePass::FillHoles, &config, &hole_window(5, 17));
        assert_eq!(out.get(2, 2), 1.0);
    }

    #[test]
    fn feather_preserves_interior_and_damps_background() {
        let mask = Mask::from_fn(15, 15, |x, y| {
            if (4..11).contains(&x) && (4..11).contains(&y) {
                1.0
            } else {
                0.0
            }
        })
        .expect("mask");
        let out = run(RefinePass::Feather, &RefinementConfig::quality(), &mask);
        assert_eq!(out.get(7, 7), 1.0);
        assert_eq!(out.get(4, 4), 1.0);
        assert_eq!(out.get(0, 0), 0.0);
        let halo = out.get(3, 7);
        assert!(halo > 0.0 && halo <= BACKGROUND_FEATHER_GAIN);
    }

    #[test]
    fn feather_uses_blur_for_mid_values() {
        let mask = Mask::filled(6, 6, 0.5).expect("mask");
        let out = run(RefinePass::Feather, &RefinementConfig::quality(), &mask);
        assert!(out.values().iter().all(|v| (v - 0.5).abs() < 1e-6));
    }

    #[test]
    fn fast_variant_only_clamps() {
        let refiner = MaskRefiner::new(RefinementConfig::fast()).expect("refiner");
        let mut mask = Mask::from_values(5, 1, vec![0.05, 0.5, 0.95, 1.4, -0.3]).expect("mask");
        refiner.refine(&mut mask).expect("refine");
        assert_eq!(mask.values(), &[0.0, 0.5, 1.0, 1.0, 0.0]);
    }

    #[test]
    fn quality_runs_passes_in_order() {
        let refiner = MaskRefiner::new(RefinementConfig::quality()).expect("refiner");
        let mut mask = disk(16, 5.0);
        let mut seen = Vec::new();
        refiner
            .refine_with(&mut mask, &mut Vec::new(), &mut Vec::new(), |pass| seen.push(pass))
            .expect("refine");
        assert_eq!(seen, RefinementConfig::quality().passes());
    }

    fn alpha_drift<'m>(a: &'m Mask, b: &'m Mask) -> impl Iterator<Item = f32> + 'm {
        a.values()
            .iter()
            .zip(b.values())
            .map(|(x, y)| ((x * 255.0).round() - (y * 255.0).round()).abs())
    }

    fn refine_twice(mask: Mask) -> (Mask, Mask) {
        let refiner = MaskRefiner::new(RefinementConfig::quality()).expect("refiner");
        let mut once = mask;
        refiner.refine(&mut once).expect("first refine");
        let mut twice = once.clone();
        refiner.refine(&mut twice).expect("second refine");
        (once, twice)
    }

    #[test]
    fn binary_mask_refinement_reaches_fixed_point() {
        let (once, twice) = refine_twice(disk(64, 20.0));
        let worst = alpha_drift(&once, &twice).fold(0.0f32, f32::max);
        assert!(worst <= 2.0, "alpha drifted by {} levels", worst);
    }

    // Soft edges are re-feathered on every run, so only the edge band moves.
    #[test]
    fn soft_mask_refinement_drift_stays_in_edge_band() {
        let size = 128u32;
        let c = size as f32 / 2.0;
        let dist = |x: u32, y: u32| ((x as f32 - c).powi(2) + (y as f32 - c).powi(2)).sqrt();
        let soft = Mask::from_fn(size, size, |x, y| ((46.0 - dist(x, y)) / 12.0).clamp(0.0, 1.0)).expect("soft disk");
        let (once, twice) = refine_twice(soft);

        let worst = alpha_drift(&once, &twice).fold(0.0f32, f32::max);
        assert!(worst <= 90.0, "alpha drifted by {} levels", worst);

        for y in 0..size {
            for x in 0..size {
                let d = dist(x, y);
                if d <= 30.0 {
                    assert_eq!(once.get(x, y), 1.0);
                    assert_eq!(twice.get(x, y), 1.0);
                } else if d >= 60.0 {
                    assert_eq!(once.get(x, y), 0.0);
                    assert_eq!(twice.get(x, y), 0.0);
                }
            }
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = RefinementConfig {
            low_cut: 0.95,
            ..RefinementConfig::quality()
        };
        assert!(MaskRefiner::new(config).is_err());
    }
}
