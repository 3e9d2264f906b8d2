use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const QUALITY_RESOLUTION_BUDGET: u32 = 512;
pub const FAST_RESOLUTION_BUDGET: u32 = 832;
pub const CONSTRAINED_RESOLUTION_BUDGET: u32 = 640;

pub const DEFAULT_LABEL_PRIORITY: [&str; 4] = ["person", "foreground", "subject", "human"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Variant {
    Quality,
    Fast,
}

impl Variant {
    pub fn resolution_budget(self) -> u32 {
        match self {
            Self::Quality => QUALITY_RESOLUTION_BUDGET,
            Self::Fast => FAST_RESOLUTION_BUDGET,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Quality => "quality",
            Self::Fast => "fast",
        }
    }
}

/// RGBA8 image, row-major, four bytes per pixel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterBuffer {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl RasterBuffer {
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Result<Self, CoreError> {
        let len = rgba_len(width, height)?;
        let pixels = rgba.iter().copied().cycle().take(len).collect();
        Ok(Self { width, height, pixels })
    }

    pub fn from_rgba(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, CoreError> {
        let len = rgba_len(width, height)?;
        if pixels.len() != len {
            return Err(CoreError::InvalidDimensions { width, height });
        }
        Ok(Self { width, height, pixels })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn pixel_count(&self) -> usize {
        self.pixels.len() / 4
    }

    pub fn as_raw(&self) -> &[u8] {
        &self.pixels
    }

    pub fn as_raw_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }
}

fn rgba_len(width: u32, height: u32) -> Result<usize, CoreError> {
    pixel_len(width, height)?
        .checked_mul(4)
        .ok_or(CoreError::InvalidDimensions { width, height })
}

fn pixel_len(width: u32, height: u32) -> Result<usize, CoreError> {
    if width == 0 || height == 0 {
        return Err(CoreError::InvalidDimensions { width, height });
    }
    (width as usize)
        .checked_mul(height as usize)
        .ok_or(CoreError::InvalidDimensions { width, height })
}

/// Dense foreground-probability map. Values are expected in `[0, 1]`; call
/// [`Mask::clamp_unit`] on anything produced outside this workspace.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    width: u32,
    height: u32,
    values: Vec<f32>,
}

impl Mask {
    pub fn filled(width: u32, height: u32, value: f32) -> Result<Self, CoreError> {
        let len = pixel_len(width, height)?;
        Ok(Self {
            width,
            height,
            values: vec![value; len],
        })
    }

    pub fn from_values(width: u32, height: u32, values: Vec<f32>) -> Result<Self, CoreError> {
        if values.len() != pixel_len(width, height)? {
            return Err(CoreError::InvalidDimensions { width, height });
        }
        Ok(Self { width, height, values })
    }

    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> f32) -> Result<Self, CoreError> {
        let len = pixel_len(width, height)?;
        let mut values = Vec::with_capacity(len);
        for y in 0..height {
            for x in 0..width {
                values.push(f(x, y));
            }
        }
        Ok(Self { width, height, values })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.values[y as usize * self.width as usize + x as usize]
    }

    pub fn set(&mut self, x: u32, y: u32, value: f32) {
        self.values[y as usize * self.width as usize + x as usize] = value;
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Exchanges the backing storage with `other`, which must hold exactly
    /// `len()` values. Used to double-buffer full-mask sweeps.
    pub fn swap_values(&mut self, other: &mut Vec<f32>) -> Result<(), CoreError> {
        if other.len() != self.values.len() {
            return Err(CoreError::InvalidDimensions {
                width: self.width,
                height: self.height,
            });
        }
        std::mem::swap(&mut self.values, other);
        Ok(())
    }

    /// Clamps every value into `[0, 1]`; NaN becomes background.
    pub fn clamp_unit(&mut self) {
        for v in &mut self.values {
            *v = if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefinePass {
    HardClip,
    SuppressIsolated,
    SharpenEdges,
    FillHoles,
    Feather,
    FastClamp,
}

impl RefinePass {
    pub fn label(self) -> &'static str {
        match self {
            Self::HardClip => "hard-clip",
            Self::SuppressIsolated => "suppress-isolated",
            Self::SharpenEdges => "sharpen-edges",
            Self::FillHoles => "fill-holes",
            Self::Feather => "feather",
            Self::FastClamp => "fast-clamp",
        }
    }
}

const QUALITY_PASSES: [RefinePass; 5] = [
    RefinePass::HardClip,
    RefinePass::SuppressIsolated,
    RefinePass::SharpenEdges,
    RefinePass::FillHoles,
    RefinePass::Feather,
];
const FAST_PASSES: [RefinePass; 1] = [RefinePass::FastClamp];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefinementConfig {
    pub variant: Variant,
    pub feather_radius: u32,
    pub artifact_neighborhood: u32,
    pub hole_fill_threshold: f32,
    pub edge_gradient_threshold: f32,
    pub low_cut: f32,
    pub high_cut: f32,
}

impl RefinementConfig {
    pub fn quality() -> Self {
        Self {
            variant: Variant::Quality,
            feather_radius: 3,
            artifact_neighborhood: 5,
            hole_fill_threshold: 0.7,
            edge_gradient_threshold: 0.3,
            low_cut: 0.1,
            high_cut: 0.9,
        }
    }

    pub fn fast() -> Self {
        Self {
            variant: Variant::Fast,
            feather_radius: 0,
            ..Self::quality()
        }
    }

    pub fn for_variant(variant: Variant) -> Self {
        match variant {
            Variant::Quality => Self::quality(),
            Variant::Fast => Self::fast(),
        }
    }

    /// Passes in execution order.
    pub fn passes(&self) -> &'static [RefinePass] {
        match self.variant {
            Variant::Quality => &QUALITY_PASSES,
            Variant::Fast => &FAST_PASSES,
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.artifact_neighborhood < 3 || self.artifact_neighborhood % 2 == 0 {
            return Err(CoreError::InvalidConfig(format!(
                "artifactNeighborhood must be an odd number >= 3 (received {})",
                self.artifact_neighborhood
            )));
        }
        let unit = |name: &str, v: f32| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(CoreError::InvalidConfig(format!("{} must lie in [0, 1] (received {})", name, v)))
            }
        };
        unit("holeFillThreshold", self.hole_fill_threshold)?;
        unit("lowCut", self.low_cut)?;
        unit("highCut", self.high_cut)?;
        if !(self.edge_gradient_threshold >= 0.0) {
            return Err(CoreError::InvalidConfig(format!(
                "edgeGradientThreshold must be non-negative (received {})",
                self.edge_gradient_threshold
            )));
        }
        if self.low_cut >= self.high_cut {
            return Err(CoreError::InvalidConfig(format!(
                "lowCut ({}) must be below highCut ({})",
                self.low_cut, self.high_cut
            )));
        }
        Ok(())
    }
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self::quality()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentCandidate {
    pub label: String,
    pub mask: Option<Mask>,
}

impl SegmentCandidate {
    pub fn new(label: impl Into<String>, mask: Mask) -> Self {
        Self {
            label: label.into(),
            mask: Some(mask),
        }
    }

    fn usable_mask(&self) -> bool {
        self.mask.as_ref().map(|m| !m.is_empty()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectedMask {
    pub label: String,
    pub mask: Mask,
    pub matched_priority: bool,
}

/// Ordered label preferences used to pick one mask out of a segmentation
/// result. Matching is a case-insensitive substring test; earlier entries
/// win over later ones regardless of candidate order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelPriority(Vec<String>);

impl LabelPriority {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            labels
                .into_iter()
                .map(|l| l.as_ref().trim().to_ascii_lowercase())
                .filter(|l| !l.is_empty())
                .collect(),
        )
    }

    pub fn labels(&self) -> &[String] {
        &self.0
    }

    /// Falls back to the first candidate carrying a usable mask when no
    /// priority label matches.
    pub fn select(&self, candidates: Vec<SegmentCandidate>) -> Result<SelectedMask, CoreError> {
        if candidates.is_empty() {
            return Err(CoreError::NoSegmentationResult);
        }
        let lowered: Vec<String> = candidates.iter().map(|c| c.label.to_ascii_lowercase()).collect();
        let matched = self.0.iter().find_map(|wanted| {
            candidates
                .iter()
                .zip(&lowered)
                .position(|(c, label)| c.usable_mask() && label.contains(wanted.as_str()))
        });
        let (index, matched_priority) = match matched {
            Some(index) => (index, true),
            None => match candidates.iter().position(SegmentCandidate::usable_mask) {
                Some(index) => (index, false),
                None => return Err(CoreError::NoSubjectDetected),
            },
        };
        let candidate = candidates
            .into_iter()
            .nth(index)
            .ok_or(CoreError::NoSubjectDetected)?;
        let mask = candidate.mask.ok_or(CoreError::NoSubjectDetected)?;
        Ok(SelectedMask {
            label: candidate.label,
            mask,
            matched_priority,
        })
    }
}

impl Default for LabelPriority {
    fn default() -> Self {
        Self::new(DEFAULT_LABEL_PRIORITY)
    }
}

pub trait SegmentationAdapter: Send + Sync {
    fn segment(&self, raster: &RasterBuffer) -> Result<Vec<SegmentCandidate>, CoreError>;
}

/// One entry of the model backend fallback chain.
pub trait ModelLoader: Send + Sync {
    fn label(&self) -> &str;
    fn load(&self) -> Result<Arc<dyn SegmentationAdapter>, CoreError>;
}

pub trait DeviceCapability: Send + Sync {
    fn is_low_power(&self) -> bool;
    fn is_low_memory(&self) -> bool;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticDevice {
    pub low_power: bool,
    pub low_memory: bool,
}

impl DeviceCapability for StaticDevice {
    fn is_low_power(&self) -> bool {
        self.low_power
    }

    fn is_low_memory(&self) -> bool {
        self.low_memory
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressStage {
    ModelLoad,
    Resize,
    Inference,
    MaskProcessing,
    Feathering,
    Compositing,
    Complete,
}

impl ProgressStage {
    pub fn name(self) -> &'static str {
        match self {
            Self::ModelLoad => "model-load",
            Self::Resize => "resize",
            Self::Inference => "inference",
            Self::MaskProcessing => "mask-processing",
            Self::Feathering => "feathering",
            Self::Compositing => "compositing",
            Self::Complete => "complete",
        }
    }

    pub fn percent(self) -> u8 {
        match self {
            Self::ModelLoad => 5,
            Self::Resize => 15,
            Self::Inference => 30,
            Self::MaskProcessing => 60,
            Self::Feathering => 75,
            Self::Compositing => 90,
            Self::Complete => 100,
        }
    }
}

pub trait ProgressReporter {
    fn report(&self, stage: ProgressStage, percent: u8);
}

impl<F> ProgressReporter for F
where
    F: Fn(ProgressStage, u8),
{
    fn report(&self, stage: ProgressStage, percent: u8) {
        self(stage, percent)
    }
}

/// Cooperative cancellation flag, checked between pipeline stages.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), CoreError> {
        if self.is_cancelled() {
            Err(CoreError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TelemetryEventType {
    LoadStart,
    LoadSuccess,
    LoadError,
    PipelineStart,
    PipelineSuccess,
    PipelineError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub event_type: TelemetryEventType,
    pub variant: Option<Variant>,
    pub backend: Option<String>,
    pub duration_ms: Option<u64>,
    pub detail: Option<String>,
}

pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("could not decode input image: {0}")]
    Decode(String),
    #[error("model load failed: {0}")]
    ModelLoad(String),
    #[error("segmentation returned no result")]
    NoSegmentationResult,
    #[error("no subject detected")]
    NoSubjectDetected,
    #[error("scratch canvas unavailable: {0}")]
    CanvasUnavailable(String),
    #[error("could not encode cutout: {0}")]
    Encode(String),
    #[error("segmentation failed: {0}")]
    Segmentation(String),
    #[error("invalid dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("model service has been disposed")]
    ModelDisposed,
    #[error("pipeline cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    DecodeError,
    ModelLoadFailure,
    NoSegmentationResult,
    NoSubjectDetected,
    CanvasContextUnavailable,
    EncodeFailure,
    SegmentationError,
    InvalidDimensions,
    InvalidConfig,
    ModelDisposed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl CoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Decode(_) => ErrorCode::DecodeError,
            Self::ModelLoad(_) => ErrorCode::ModelLoadFailure,
            Self::NoSegmentationResult => ErrorCode::NoSegmentationResult,
            Self::NoSubjectDetected => ErrorCode::NoSubjectDetected,
            Self::CanvasUnavailable(_) => ErrorCode::CanvasContextUnavailable,
            Self::Encode(_) => ErrorCode::EncodeFailure,
            Self::Segmentation(_) => ErrorCode::SegmentationError,
            Self::InvalidDimensions { .. } => ErrorCode::InvalidDimensions,
            Self::InvalidConfig(_) => ErrorCode::InvalidConfig,
            Self::ModelDisposed => ErrorCode::ModelDisposed,
            Self::Cancelled => ErrorCode::Cancelled,
        }
    }

    pub fn as_error_info(&self) -> ErrorInfo {
        ErrorInfo {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    pub variant: Option<Variant>,
    pub resolution_budget: Option<u32>,
    pub refinement: Option<RefinementConfig>,
    pub label_priority: Option<Vec<String>>,
    pub emit_mask_png: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPipeline {
    pub variant: Variant,
    pub resolution_budget: u32,
    pub refinement: RefinementConfig,
    pub label_priority: LabelPriority,
    pub emit_mask_png: bool,
}

/// Device-derived default: constrained devices get the fast variant at the
/// reduced budget, low-power devices the fast variant, everything else quality.
pub fn select_variant(device: &dyn DeviceCapability) -> (Variant, u32) {
    if device.is_low_memory() {
        (Variant::Fast, CONSTRAINED_RESOLUTION_BUDGET)
    } else if device.is_low_power() {
        (Variant::Fast, FAST_RESOLUTION_BUDGET)
    } else {
        (Variant::Quality, QUALITY_RESOLUTION_BUDGET)
    }
}

pub fn resolve_pipeline_config(
    overrides: &PipelineConfig,
    device: &dyn DeviceCapability,
) -> Result<ResolvedPipeline, CoreError> {
    let (device_variant, device_budget) = select_variant(device);
    let variant = overrides
        .variant
        .or_else(|| overrides.refinement.as_ref().map(|r| r.variant))
        .unwrap_or(device_variant);
    let refinement = match &overrides.refinement {
        Some(refinement) if refinement.variant != variant => {
            return Err(CoreError::InvalidConfig(format!(
                "variant '{}' conflicts with refinement variant '{}'",
                variant.label(),
                refinement.variant.label()
            )));
        }
        Some(refinement) => refinement.clone(),
        None => RefinementConfig::for_variant(variant),
    };
    refinement.validate()?;

    let resolution_budget = match overrides.resolution_budget {
        Some(0) => return Err(CoreError::InvalidConfig("resolutionBudget must be positive".to_string())),
        Some(budget) => budget,
        None if variant == device_variant => device_budget,
        None => variant.resolution_budget(),
    };
    let label_priority = match &overrides.label_priority {
        Some(labels) => LabelPriority::new(labels),
        None => LabelPriority::default(),
    };

    Ok(ResolvedPipeline {
        variant,
        resolution_budget,
        refinement,
        label_priority,
        emit_mask_png: overrides.emit_mask_png,
    })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTimings {
    pub model_load_ms: u64,
    pub resize_ms: u64,
    pub inference_ms: u64,
    pub refine_ms: u64,
    pub composite_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineMetadata {
    pub variant: Variant,
    pub backend: String,
    pub fallback_used: bool,
    pub selected_label: String,
    pub source_width: u32,
    pub source_height: u32,
    pub width: u32,
    pub height: u32,
    pub timings: StageTimings,
}

#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub raster: RasterBuffer,
    pub encoded: Vec<u8>,
    pub mask_png: Option<Vec<u8>>,
    pub metadata: PipelineMetadata,
}
