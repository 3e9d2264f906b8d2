use std::fmt::{Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use walkdir::WalkDir;

pub const MODEL_DIR_ENV: &str = "CUTOUT_MODEL_DIR";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KnownModel {
    Rmbg14,
    U2net,
}

impl KnownModel {
    pub fn model_id(self) -> &'static str {
        match self {
            Self::Rmbg14 => "briaai/RMBG-1.4",
            Self::U2net => "xuebinqin/U-2-Net",
        }
    }

    pub fn cache_key(self) -> &'static str {
        match self {
            Self::Rmbg14 => "briaai__RMBG-1.4",
            Self::U2net => "xuebinqin__U-2-Net",
        }
    }

    pub fn short_name(self) -> &'static str {
        match self {
            Self::Rmbg14 => "rmbg-1.4",
            Self::U2net => "u2net",
        }
    }

    pub fn all() -> [KnownModel; 2] {
        [KnownModel::Rmbg14, KnownModel::U2net]
    }

    /// Input geometry and normalisation the network was trained with.
    pub fn descriptor(self) -> ModelDescriptor {
        match self {
            Self::Rmbg14 => ModelDescriptor {
                model: self,
                input_size: 1024,
                mean: [0.5, 0.5, 0.5],
                std: [1.0, 1.0, 1.0],
                output_label: "foreground",
            },
            Self::U2net => ModelDescriptor {
                model: self,
                input_size: 320,
                mean: [0.485, 0.456, 0.406],
                std: [0.229, 0.224, 0.225],
                output_label: "foreground",
            },
        }
    }
}

impl Display for KnownModel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.model_id())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    pub model: KnownModel,
    pub input_size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub output_label: &'static str,
}

impl ModelDescriptor {
    /// Maps an 8-bit channel value into the network's input range.
    pub fn normalize(&self, channel: usize, value: u8) -> f32 {
        (value as f32 / 255.0 - self.mean[channel]) / self.std[channel]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnnxVariant {
    Fp16,
    Fp32,
    Quantized,
    Auto,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("could not determine a default model directory")]
    NoDefaultModelDir,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no .onnx file for {model} in {}", .dir.display())]
    ModelNotFound { model: KnownModel, dir: PathBuf },
}

#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub root: PathBuf,
    pub models_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledModel {
    pub model: KnownModel,
    pub model_id: &'static str,
    pub file: PathBuf,
    pub size: u64,
}

pub fn default_model_dir() -> Result<PathBuf, RegistryError> {
    if let Some(dir) = std::env::var_os(MODEL_DIR_ENV).filter(|d| !d.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    let home = dirs::home_dir().ok_or(RegistryError::NoDefaultModelDir)?;
    Ok(home.join(".cutout").join("models"))
}

pub fn resolve_model_paths(model_dir: Option<&Path>) -> Result<ModelPaths, RegistryError> {
    let root = if let Some(dir) = model_dir {
        dir.to_path_buf()
    } else {
        default_model_dir()?
    };

    Ok(ModelPaths {
        models_dir: root.join("models"),
        root,
    })
}

pub fn model_dir(paths: &ModelPaths, model: KnownModel) -> PathBuf {
    paths.models_dir.join(model.cache_key())
}

pub fn resolve_model_file(paths: &ModelPaths, model: KnownModel, variant: OnnxVariant) -> Result<PathBuf, RegistryError> {
    let dir = model_dir(paths, model);
    find_preferred_onnx_file(&dir, variant).ok_or(RegistryError::ModelNotFound { model, dir })
}

pub fn list_installed(paths: &ModelPaths, variant: OnnxVariant) -> Result<Vec<InstalledModel>, RegistryError> {
    let mut out = Vec::new();
    for model in KnownModel::all() {
        let Some(file) = find_preferred_onnx_file(&model_dir(paths, model), variant) else {
            continue;
        };
        let size = fs::metadata(&file)?.len();
        out.push(InstalledModel {
            model,
            model_id: model.model_id(),
            file,
            size,
        });
    }
    Ok(out)
}

fn is_quantized(lower: &str) -> bool {
    lower.contains("quantized") || lower.contains("q8") || lower.contains("int8")
}

fn variant_rank(lower: &str, variant: OnnxVariant) -> u8 {
    let fp16 = lower.contains("fp16");
    let quantized = is_quantized(lower);
    let full = !fp16 && !quantized;
    match variant {
        OnnxVariant::Fp32 => match (full, fp16) {
            (true, _) => 0,
            (_, true) => 1,
            _ => 2,
        },
        OnnxVariant::Quantized => match (quantized, fp16) {
            (true, _) => 0,
            (_, true) => 1,
            _ => 2,
        },
        OnnxVariant::Fp16 | OnnxVariant::Auto => match (fp16, full) {
            (true, _) => 0,
            (_, true) => 1,
            _ => 2,
        },
    }
}

/// Walks `base_dir` for `.onnx` files and returns the one best matching
/// `variant`. Ties are broken by path so the choice is stable.
pub fn find_preferred_onnx_file(base_dir: &Path, variant: OnnxVariant) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = WalkDir::new(base_dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().map(|e| e == "onnx").unwrap_or(false))
        .collect();
    candidates.sort_by_cached_key(|p| {
        let name = p
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        (variant_rank(&name, variant), p.clone())
    });
    candidates.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, b"onnx").expect("write");
    }

    #[test]
    fn ranking_follows_requested_variant() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(&dir.path().join("onnx/model.onnx"));
        touch(&dir.path().join("onnx/model_fp16.onnx"));
        touch(&dir.path().join("onnx/model_quantized.onnx"));
        touch(&dir.path().join("README.md"));

        let pick = |variant| {
            find_preferred_onnx_file(dir.path(), variant)
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .expect("an onnx file")
        };
        assert_eq!(pick(OnnxVariant::Fp32), "model.onnx");
        assert_eq!(pick(OnnxVariant::Fp16), "model_fp16.onnx");
        assert_eq!(pick(OnnxVariant::Auto), "model_fp16.onnx");
        assert_eq!(pick(OnnxVariant::Quantized), "model_quantized.onnx");
    }

    #[test]
    fn missing_model_is_reported_with_its_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = resolve_model_paths(Some(dir.path())).expect("paths");
        let err = resolve_model_file(&paths, KnownModel::U2net, OnnxVariant::Auto).expect_err("nothing installed");
        assert!(matches!(err, RegistryError::ModelNotFound { model: KnownModel::U2net, .. }));
        assert!(err.to_string().contains("xuebinqin__U-2-Net"));
    }

    #[test]
    fn lists_only_installed_models() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = resolve_model_paths(Some(dir.path())).expect("paths");
        touch(&model_dir(&paths, KnownModel::Rmbg14).join("model.onnx"));

        let installed = list_installed(&paths, OnnxVariant::Fp32).expect("list");
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].model, KnownModel::Rmbg14);
        assert_eq!(installed[0].size, 4);
    }

    #[test]
    fn descriptor_normalisation_matches_training_stats() {
        let rmbg = KnownModel::Rmbg14.descriptor();
        assert!((rmbg.normalize(0, 255) - 0.5).abs() < 1e-6);
        assert!((rmbg.normalize(1, 0) + 0.5).abs() < 1e-6);

        let u2net = KnownModel::U2net.descriptor();
        let expected = (128.0 / 255.0 - 0.456) / 0.224;
        assert!((u2net.normalize(1, 128) - expected).abs() < 1e-6);
    }
}
