use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use anyhow::Result;
use cutout_core::{CoreError, Mask, ModelLoader, RasterBuffer, SegmentCandidate, SegmentationAdapter};
use cutout_model_registry::{resolve_model_file, resolve_model_paths, KnownModel, ModelDescriptor, ModelPaths, OnnxVariant, RegistryError};
use image::imageops::FilterType;
use ndarray::{Array4, ArrayViewD};
use ort::{inputs, session::Session, value::Tensor};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderChoice {
    Cpu,
    DirectML,
    Cuda,
    CoreML,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionProvider {
    Auto,
    Cpu,
}

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub model_dir: Option<PathBuf>,
    pub onnx_variant: OnnxVariant,
    pub execution_provider: ExecutionProvider,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            model_dir: None,
            onnx_variant: OnnxVariant::Fp32,
            execution_provider: ExecutionProvider::Auto,
        }
    }
}

/// Backend chain tried in order by the model service: accelerated providers
/// for the primary model, then the primary on CPU, then the alternate on CPU.
pub fn fallback_chain(options: &RuntimeOptions) -> Result<Vec<Box<dyn ModelLoader>>, RegistryError> {
    let paths = resolve_model_paths(options.model_dir.as_deref())?;
    let mut loaders: Vec<Box<dyn ModelLoader>> = Vec::new();
    for provider in candidate_providers(options.execution_provider) {
        loaders.push(Box::new(OrtModelLoader::new(
            KnownModel::Rmbg14,
            &paths,
            options.onnx_variant,
            provider,
        )));
    }
    loaders.push(Box::new(OrtModelLoader::new(
        KnownModel::U2net,
        &paths,
        options.onnx_variant,
        ProviderChoice::Cpu,
    )));
    Ok(loaders)
}

pub struct OrtModelLoader {
    model: KnownModel,
    paths: ModelPaths,
    onnx_variant: OnnxVariant,
    provider: ProviderChoice,
    label: String,
}

impl OrtModelLoader {
    pub fn new(model: KnownModel, paths: &ModelPaths, onnx_variant: OnnxVariant, provider: ProviderChoice) -> Self {
        Self {
            model,
            paths: paths.clone(),
            onnx_variant,
            provider,
            label: format!("{}/{}", model.short_name(), provider_label(provider)),
        }
    }
}

impl ModelLoader for OrtModelLoader {
    fn label(&self) -> &str {
        &self.label
    }

    fn load(&self) -> Result<Arc<dyn SegmentationAdapter>, CoreError> {
        let model_file = resolve_model_file(&self.paths, self.model, self.onnx_variant)
            .map_err(|e| CoreError::ModelLoad(e.to_string()))?;
        let start = Instant::now();
        let session = build_session_for_provider(&model_file, self.provider)
            .map_err(|e| CoreError::ModelLoad(format!("{}: {:#}", model_file.display(), e)))?;
        tracing::debug!(
            model = %self.model,
            provider = provider_label(self.provider),
            file = %model_file.display(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "onnx session created"
        );
        Ok(Arc::new(OrtSegmenter {
            session: Mutex::new(session),
            descriptor: self.model.descriptor(),
        }))
    }
}

/// Salient-object network wrapped as a single-candidate segmenter.
pub struct OrtSegmenter {
    session: Mutex<Session>,
    descriptor: ModelDescriptor,
}

impl SegmentationAdapter for OrtSegmenter {
    fn segment(&self, raster: &RasterBuffer) -> Result<Vec<SegmentCandidate>, CoreError> {
        let input = preprocess(raster, &self.descriptor);
        let tensor = Tensor::from_array(input).map_err(segmentation_error)?;
        let mut session = lock_recovering(&self.session);
        let outputs = session.run(inputs![tensor]).map_err(segmentation_error)?;
        if outputs.len() == 0 {
            return Err(CoreError::NoSegmentationResult);
        }
        let view = outputs[0].try_extract_array::<f32>().map_err(segmentation_error)?;
        let mask = mask_from_output(view)?;
        Ok(vec![SegmentCandidate::new(self.descriptor.output_label, mask)])
    }
}

/// A panic in another inference leaves the session itself intact.
fn lock_recovering<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn segmentation_error(err: impl std::fmt::Display) -> CoreError {
    CoreError::Segmentation(err.to_string())
}

/// NCHW float input at the model's square input size.
pub fn preprocess(raster: &RasterBuffer, descriptor: &ModelDescriptor) -> Array4<f32> {
    let size = descriptor.input_size;
    let rgb = cutout_image::to_rgb_image(raster);
    let resized = image::imageops::resize(&rgb, size, size, FilterType::Triangle);
    Array4::from_shape_fn((1, 3, size as usize, size as usize), |(_, c, y, x)| {
        descriptor.normalize(c, resized.get_pixel(x as u32, y as u32)[c])
    })
}

/// Converts the first output plane into a mask, min–max normalised to [0, 1].
pub fn mask_from_output(view: ArrayViewD<'_, f32>) -> Result<Mask, CoreError> {
    let shape = view.shape().to_vec();
    let (mask_h, mask_w) = match shape.len() {
        4 => (shape[2], shape[3]),
        3 => (shape[1], shape[2]),
        2 => (shape[0], shape[1]),
        _ => {
            return Err(CoreError::Segmentation(format!(
                "unsupported output dimensions: {:?}",
                shape
            )))
        }
    };
    let plane = mask_h * mask_w;
    let mut values: Vec<f32> = view.iter().take(plane).copied().collect();
    if values.len() != plane {
        return Err(CoreError::Segmentation(format!("output shorter than {}x{}", mask_w, mask_h)));
    }
    normalize_output(&mut values);
    Mask::from_values(mask_w as u32, mask_h as u32, values)
}

pub fn normalize_output(values: &mut [f32]) {
    let (min_v, max_v) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    if min_v > max_v {
        values.iter_mut().for_each(|v| *v = 0.0);
        return;
    }
    let range = (max_v - min_v).max(1e-6);
    for v in values.iter_mut() {
        *v = if v.is_finite() {
            ((*v - min_v) / range).clamp(0.0, 1.0)
        } else {
            0.0
        };
    }
}

pub fn candidate_providers(execution_provider: ExecutionProvider) -> Vec<ProviderChoice> {
    let mut out = Vec::new();
    if execution_provider == ExecutionProvider::Auto {
        out.extend(gpu_candidates());
    }
    out.push(ProviderChoice::Cpu);
    dedup_providers(out)
}

fn gpu_candidates() -> Vec<ProviderChoice> {
    let mut providers = Vec::new();
    #[cfg(target_os = "windows")]
    {
        if cuda_likely_available() {
            providers.push(ProviderChoice::Cuda);
        }
        providers.push(ProviderChoice::DirectML);
    }
    #[cfg(target_os = "linux")]
    {
        if cuda_likely_available() {
            providers.push(ProviderChoice::Cuda);
        }
    }
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        providers.push(ProviderChoice::CoreML);
    }
    providers
}

#[cfg(any(target_os = "windows", target_os = "linux"))]
fn cuda_likely_available() -> bool {
    #[cfg(target_os = "windows")]
    {
        let system32 = std::env::var("WINDIR")
            .ok()
            .map(|d| PathBuf::from(d).join("System32").join("nvcuda.dll"));
        if system32.is_some_and(|p| p.exists()) {
            return true;
        }
        std::env::var_os("PATH")
            .map(|path| std::env::split_paths(&path).any(|dir| dir.join("nvcuda.dll").exists()))
            .unwrap_or(false)
    }
    #[cfg(target_os = "linux")]
    {
        [
            "/usr/lib/x86_64-linux-gnu/libcuda.so.1",
            "/usr/lib64/libcuda.so.1",
            "/usr/lib/wsl/lib/libcuda.so.1",
        ]
        .iter()
        .any(|p| Path::new(p).exists())
    }
}

fn dedup_providers(list: Vec<ProviderChoice>) -> Vec<ProviderChoice> {
    let mut out = Vec::new();
    for provider in list {
        if !out.contains(&provider) {
            out.push(provider);
        }
    }
    out
}

pub fn provider_label(provider: ProviderChoice) -> &'static str {
    match provider {
        ProviderChoice::Cpu => "cpu",
        ProviderChoice::DirectML => "directml",
        ProviderChoice::Cuda => "cuda",
        ProviderChoice::CoreML => "coreml",
    }
}

fn build_session_for_provider(model_file: &Path, provider: ProviderChoice) -> Result<Session> {
    match provider {
        ProviderChoice::Cpu => Session::builder()?.commit_from_file(model_file).map_err(Into::into),
        ProviderChoice::DirectML => {
            #[cfg(feature = "directml")]
            {
                Session::builder()?
                    .with_execution_providers([ort::ep::DirectML::default().build()])?
                    .commit_from_file(model_file)
                    .map_err(Into::into)
            }
            #[cfg(not(feature = "directml"))]
            {
                Err(anyhow!("directml feature not enabled"))
            }
        }
        ProviderChoice::Cuda => {
            #[cfg(feature = "cuda")]
            {
                Session::builder()?
                    .with_execution_providers([ort::ep::CUDA::default().build()])?
                    .commit_from_file(model_file)
                    .map_err(Into::into)
            }
            #[cfg(not(feature = "cuda"))]
            {
                Err(anyhow!("cuda feature not enabled"))
            }
        }
        ProviderChoice::CoreML => {
            #[cfg(feature = "coreml")]
            {
                Session::builder()?
                    .with_execution_providers([ort::ep::CoreML::default().build()])?
                    .commit_from_file(model_file)
                    .map_err(Into::into)
            }
            #[cfg(not(feature = "coreml"))]
            {
                Err(anyhow!("coreml feature not enabled"))
            }
        }
    }
}

/// Points `ORT_DYLIB_PATH` at a bundled ONNX Runtime library when one sits
/// next to the executable or on `PATH`. An existing value is left alone.
pub fn set_ort_dylib_path_if_available() {
    if std::env::var("ORT_DYLIB_PATH").is_ok() {
        return;
    }
    let lib_name = if cfg!(target_os = "windows") {
        "onnxruntime.dll"
    } else if cfg!(target_os = "macos") || cfg!(target_os = "ios") {
        "libonnxruntime.dylib"
    } else {
        "libonnxruntime.so"
    };
    let next_to_exe = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(lib_name)))
        .filter(|candidate| candidate.exists());
    if let Some(candidate) = next_to_exe {
        tracing::debug!(path = %candidate.display(), "using onnxruntime next to executable");
        std::env::set_var("ORT_DYLIB_PATH", candidate);
        return;
    }
    if let Some(path) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path) {
            if cfg!(target_os = "windows") && dir.to_string_lossy().to_ascii_lowercase().contains("windows\\system32") {
                continue;
            }
            let candidate = dir.join(lib_name);
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "using onnxruntime from PATH");
                std::env::set_var("ORT_DYLIB_PATH", candidate);
                break;
            }
        }
    }
}
