use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use cutout_core::{
    resolve_pipeline_config, CancellationToken, CoreError, DeviceCapability, ModelLoader, PipelineConfig, PipelineMetadata,
    PipelineResult, ProgressReporter, ProgressStage, RasterBuffer, RefinePass, ResolvedPipeline, SegmentationAdapter,
    StageTimings, TelemetryEvent, TelemetryEventType, TelemetrySink, Variant,
};
use cutout_refine::MaskRefiner;

pub const DEFAULT_SCRATCH_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStatus {
    Unloaded,
    Loading,
    Ready,
    Disposed,
}

#[derive(Clone)]
pub struct LoadedModel {
    pub adapter: Arc<dyn SegmentationAdapter>,
    pub backend: String,
    pub fallback_used: bool,
}

impl fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModel")
            .field("backend", &self.backend)
            .field("fallback_used", &self.fallback_used)
            .finish_non_exhaustive()
    }
}

enum Phase {
    Unloaded,
    Loading,
    Ready(LoadedModel),
    Disposed,
}

struct ModelState {
    phase: Phase,
    epoch: u64,
    last_failure: Option<(u64, String)>,
}

impl ModelState {
    fn status(&self) -> ModelStatus {
        match self.phase {
            Phase::Unloaded => ModelStatus::Unloaded,
            Phase::Loading => ModelStatus::Loading,
            Phase::Ready(_) => ModelStatus::Ready,
            Phase::Disposed => ModelStatus::Disposed,
        }
    }
}

/// Shared owner of the segmentation model.
///
/// `load()` walks the backend fallback chain at most once per attempt;
/// callers arriving while a load is in flight block until it settles and
/// share its outcome. Once `Ready`, the adapter is handed out by reference
/// count, so `dispose()` never pulls it out from under a running request.
pub struct ModelService {
    loaders: Vec<Box<dyn ModelLoader>>,
    state: Mutex<ModelState>,
    settled: Condvar,
    load_attempts: AtomicUsize,
    telemetry: Option<Arc<dyn TelemetrySink>>,
}

impl ModelService {
    pub fn new(loaders: Vec<Box<dyn ModelLoader>>) -> Self {
        Self {
            loaders,
            state: Mutex::new(ModelState {
                phase: Phase::Unloaded,
                epoch: 0,
                last_failure: None,
            }),
            settled: Condvar::new(),
            load_attempts: AtomicUsize::new(0),
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    pub fn status(&self) -> ModelStatus {
        self.lock().status()
    }

    pub fn is_ready(&self) -> bool {
        self.status() == ModelStatus::Ready
    }

    /// Number of times the fallback chain has actually been walked.
    pub fn load_attempts(&self) -> usize {
        self.load_attempts.load(Ordering::SeqCst)
    }

    pub fn load(&self) -> Result<LoadedModel, CoreError> {
        let mut state = self.lock();
        loop {
            if let Phase::Ready(model) = &state.phase {
                return Ok(model.clone());
            }
            match state.status() {
                ModelStatus::Disposed => return Err(CoreError::ModelDisposed),
                ModelStatus::Loading => {
                    let epoch = state.epoch;
                    state = self
                        .settled
                        .wait_while(state, |s| matches!(s.phase, Phase::Loading))
                        .unwrap_or_else(PoisonError::into_inner);
                    if let Some((failed_epoch, message)) = &state.last_failure {
                        if *failed_epoch == epoch {
                            return Err(CoreError::ModelLoad(message.clone()));
                        }
                    }
                }
                _ => break,
            }
        }
        state.epoch += 1;
        state.phase = Phase::Loading;
        let mut in_flight = InFlightLoad {
            service: self,
            epoch: state.epoch,
            outcome: None,
        };
        drop(state);

        let result = self.run_fallback_chain();
        in_flight.outcome = Some(result.as_ref().map(Clone::clone).map_err(ToString::to_string));
        drop(in_flight);
        result
    }

    /// Moves `Ready` to `Disposed`. Returns false in any other state.
    pub fn dispose(&self) -> bool {
        let mut state = self.lock();
        if let Phase::Ready(model) = &state.phase {
            tracing::info!(backend = %model.backend, "disposing segmentation model");
            state.phase = Phase::Disposed;
            true
        } else {
            false
        }
    }

    fn lock(&self) -> MutexGuard<'_, ModelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_fallback_chain(&self) -> Result<LoadedModel, CoreError> {
        self.load_attempts.fetch_add(1, Ordering::SeqCst);
        let start = Instant::now();
        self.emit(TelemetryEventType::LoadStart, None, None, None);

        let mut errors = Vec::new();
        for (index, loader) in self.loaders.iter().enumerate() {
            let backend = loader.label().to_string();
            tracing::debug!(backend = %backend, attempt = index + 1, "loading segmentation model");
            match loader.load() {
                Ok(adapter) => {
                    let elapsed = elapsed_ms(start);
                    tracing::info!(backend = %backend, fallback = index > 0, elapsed_ms = elapsed, "segmentation model ready");
                    let detail = (!errors.is_empty()).then(|| format!("fallback after: {}", errors.join(" | ")));
                    self.emit(TelemetryEventType::LoadSuccess, Some(backend.clone()), Some(elapsed), detail);
                    return Ok(LoadedModel {
                        adapter,
                        backend,
                        fallback_used: index > 0,
                    });
                }
                Err(err) => {
                    tracing::warn!(backend = %backend, error = %err, "model backend failed to load");
                    errors.push(format!("{}: {}", backend, err));
                }
            }
        }

        let err = if errors.is_empty() {
            CoreError::ModelLoad("no model backends configured".to_string())
        } else {
            CoreError::ModelLoad(format!("all backends failed: {}", errors.join(" | ")))
        };
        self.emit(
            TelemetryEventType::LoadError,
            None,
            Some(elapsed_ms(start)),
            Some(err.to_string()),
        );
        Err(err)
    }

    fn emit(&self, event_type: TelemetryEventType, backend: Option<String>, duration_ms: Option<u64>, detail: Option<String>) {
        if let Some(sink) = &self.telemetry {
            sink.emit(TelemetryEvent {
                event_type,
                variant: None,
                backend,
                duration_ms,
                detail,
            });
        }
    }
}

/// Settles the `Loading` phase when dropped, including when a loader panics.
struct InFlightLoad<'a> {
    service: &'a ModelService,
    epoch: u64,
    outcome: Option<Result<LoadedModel, String>>,
}

impl Drop for InFlightLoad<'_> {
    fn drop(&mut self) {
        let mut state = self.service.lock();
        match self.outcome.take() {
            Some(Ok(model)) => state.phase = Phase::Ready(model),
            Some(Err(message)) => {
                state.phase = Phase::Unloaded;
                state.last_failure = Some((self.epoch, message));
            }
            None => {
                state.phase = Phase::Unloaded;
                state.last_failure = Some((self.epoch, "model load aborted".to_string()));
            }
        }
        self.service.settled.notify_all();
    }
}

/// Pool of reusable `f32` scratch buffers. At most `capacity` idle buffers
/// are retained; when none is idle a fresh one is allocated, so load alone
/// never fails a request. A lease returns its buffer to the pool when dropped.
#[derive(Debug)]
pub struct ScratchPool {
    capacity: usize,
    idle: Mutex<Vec<Vec<f32>>>,
    leased: AtomicUsize,
}

impl ScratchPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            idle: Mutex::new(Vec::new()),
            leased: AtomicUsize::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn leased(&self) -> usize {
        self.leased.load(Ordering::SeqCst)
    }

    pub fn idle(&self) -> usize {
        self.idle_buffers().len()
    }

    /// Hands out a zeroed buffer of `len` values. Fails only when the
    /// allocation itself cannot be satisfied.
    pub fn acquire(self: &Arc<Self>, len: usize) -> Result<ScratchLease, CoreError> {
        let recycled = self.idle_buffers().pop();
        let mut buffer = match recycled {
            Some(buffer) => buffer,
            None => {
                tracing::trace!(leased = self.leased(), "scratch pool empty, allocating");
                Vec::new()
            }
        };
        self.leased.fetch_add(1, Ordering::SeqCst);
        let mut lease = ScratchLease {
            buffer: Vec::new(),
            pool: Arc::clone(self),
        };
        buffer.clear();
        buffer
            .try_reserve(len)
            .map_err(|e| CoreError::CanvasUnavailable(format!("could not allocate {} scratch values: {}", len, e)))?;
        buffer.resize(len, 0.0);
        lease.buffer = buffer;
        Ok(lease)
    }

    fn release(&self, buffer: Vec<f32>) {
        {
            let mut idle = self.idle_buffers();
            if idle.len() < self.capacity {
                idle.push(buffer);
            }
        }
        self.leased.fetch_sub(1, Ordering::SeqCst);
    }

    fn idle_buffers(&self) -> MutexGuard<'_, Vec<Vec<f32>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub struct ScratchLease {
    buffer: Vec<f32>,
    pool: Arc<ScratchPool>,
}

impl Deref for ScratchLease {
    type Target = Vec<f32>;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl DerefMut for ScratchLease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

impl Drop for ScratchLease {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buffer));
    }
}

#[derive(Clone, Copy, Default)]
pub struct PipelineRequest<'a> {
    pub config: Option<&'a PipelineConfig>,
    pub progress: Option<&'a dyn ProgressReporter>,
    pub cancel: Option<&'a CancellationToken>,
}

enum Input<'a> {
    Encoded(&'a [u8]),
    Raster(&'a RasterBuffer),
}

pub struct PipelineOrchestrator {
    model: Arc<ModelService>,
    device: Arc<dyn DeviceCapability>,
    scratch: Arc<ScratchPool>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
}

impl PipelineOrchestrator {
    pub fn new(model: Arc<ModelService>, device: Arc<dyn DeviceCapability>) -> Self {
        Self {
            model,
            device,
            scratch: ScratchPool::new(DEFAULT_SCRATCH_CAPACITY),
            telemetry: None,
        }
    }

    pub fn with_scratch_capacity(mut self, capacity: usize) -> Self {
        self.scratch = ScratchPool::new(capacity);
        self
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    pub fn model(&self) -> &Arc<ModelService> {
        &self.model
    }

    pub fn scratch_pool(&self) -> &Arc<ScratchPool> {
        &self.scratch
    }

    /// Decodes `image`, cuts out the subject and returns the PNG bytes.
    pub fn remove_background(
        &self,
        image: &[u8],
        config: Option<&PipelineConfig>,
        on_progress: Option<&dyn ProgressReporter>,
    ) -> Result<Vec<u8>, CoreError> {
        let result = self.run(
            image,
            PipelineRequest {
                config,
                progress: on_progress,
                cancel: None,
            },
        )?;
        Ok(result.encoded)
    }

    pub fn run(&self, image: &[u8], request: PipelineRequest<'_>) -> Result<PipelineResult, CoreError> {
        self.execute(Input::Encoded(image), request)
    }

    /// Same as [`run`](Self::run) for an already decoded raster, which is
    /// only read.
    pub fn run_raster(&self, raster: &RasterBuffer, request: PipelineRequest<'_>) -> Result<PipelineResult, CoreError> {
        self.execute(Input::Raster(raster), request)
    }

    fn execute(&self, input: Input<'_>, request: PipelineRequest<'_>) -> Result<PipelineResult, CoreError> {
        let start = Instant::now();
        let defaults = PipelineConfig::default();
        let resolved = resolve_pipeline_config(request.config.unwrap_or(&defaults), self.device.as_ref())?;
        let _span = tracing::info_span!("remove_background", variant = resolved.variant.label()).entered();
        self.emit(TelemetryEventType::PipelineStart, resolved.variant, None, None, None);

        let outcome = self.run_stages(input, &resolved, &request, start);
        match &outcome {
            Ok(result) => {
                let meta = &result.metadata;
                tracing::info!(
                    backend = %meta.backend,
                    width = meta.width,
                    height = meta.height,
                    total_ms = meta.timings.total_ms,
                    "cutout complete"
                );
                self.emit(
                    TelemetryEventType::PipelineSuccess,
                    resolved.variant,
                    Some(meta.backend.clone()),
                    Some(meta.timings.total_ms),
                    Some(format!("label={},fallback={}", meta.selected_label, meta.fallback_used)),
                );
            }
            Err(err) => {
                tracing::warn!(error = %err, "cutout failed");
                self.emit(
                    TelemetryEventType::PipelineError,
                    resolved.variant,
                    None,
                    Some(elapsed_ms(start)),
                    Some(err.to_string()),
                );
            }
        }
        outcome
    }

    fn run_stages(
        &self,
        input: Input<'_>,
        resolved: &ResolvedPipeline,
        request: &PipelineRequest<'_>,
        start: Instant,
    ) -> Result<PipelineResult, CoreError> {
        let report = |stage: ProgressStage| {
            if let Some(progress) = request.progress {
                progress.report(stage, stage.percent());
            }
        };
        let checkpoint = |stage: ProgressStage| -> Result<(), CoreError> {
            if let Some(cancel) = request.cancel {
                cancel.check()?;
            }
            report(stage);
            Ok(())
        };
        let mut timings = StageTimings::default();

        checkpoint(ProgressStage::ModelLoad)?;
        let stage_start = Instant::now();
        let model = self.model.load()?;
        timings.model_load_ms = elapsed_ms(stage_start);

        checkpoint(ProgressStage::Resize)?;
        let stage_start = Instant::now();
        let decoded;
        let source = match input {
            Input::Encoded(bytes) => {
                decoded = cutout_image::decode(bytes)?;
                &decoded
            }
            Input::Raster(raster) => raster,
        };
        let (source_width, source_height) = source.dimensions();
        let raster = cutout_image::resize_to_budget(source, resolved.resolution_budget)?;
        timings.resize_ms = elapsed_ms(stage_start);

        checkpoint(ProgressStage::Inference)?;
        let stage_start = Instant::now();
        let candidates = {
            let _span = tracing::debug_span!("segment", backend = %model.backend).entered();
            model.adapter.segment(&raster)?
        };
        let selected = resolved.label_priority.select(candidates)?;
        tracing::debug!(
            label = %selected.label,
            matched_priority = selected.matched_priority,
            mask = ?selected.mask.dimensions(),
            "selected segmentation mask"
        );
        timings.inference_ms = elapsed_ms(stage_start);

        checkpoint(ProgressStage::MaskProcessing)?;
        let stage_start = Instant::now();
        let refiner = MaskRefiner::new(resolved.refinement.clone())?;
        let (width, height) = raster.dimensions();
        let mut mask = cutout_image::resample_mask(&selected.mask, width, height)?;
        {
            let mut swap = self.scratch.acquire(mask.len())?;
            let mut blur = self.scratch.acquire(mask.len())?;
            refiner.refine_with(&mut mask, &mut swap, &mut blur, |pass| {
                if pass == RefinePass::Feather {
                    report(ProgressStage::Feathering);
                }
            })?;
        }
        timings.refine_ms = elapsed_ms(stage_start);

        checkpoint(ProgressStage::Compositing)?;
        let stage_start = Instant::now();
        let (cutout, encoded) = cutout_image::composite(&raster, &mask)?;
        let mask_png = if resolved.emit_mask_png {
            Some(cutout_image::encode_mask_png(&mask)?)
        } else {
            None
        };
        timings.composite_ms = elapsed_ms(stage_start);
        timings.total_ms = elapsed_ms(start);
        report(ProgressStage::Complete);

        Ok(PipelineResult {
            raster: cutout,
            encoded,
            mask_png,
            metadata: PipelineMetadata {
                variant: resolved.variant,
                backend: model.backend,
                fallback_used: model.fallback_used,
                selected_label: selected.label,
                source_width,
                source_height,
                width,
                height,
                timings,
            },
        })
    }

    fn emit(
        &self,
        event_type: TelemetryEventType,
        variant: Variant,
        backend: Option<String>,
        duration_ms: Option<u64>,
        detail: Option<String>,
    ) {
        if let Some(sink) = &self.telemetry {
            sink.emit(TelemetryEvent {
                event_type,
                variant: Some(variant),
                backend,
                duration_ms,
                detail,
            });
        }
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}
