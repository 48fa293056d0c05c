//! # Wally Banks ONNX
//!
//! Frozen image backbones running on ONNX Runtime, exposed through
//! [`wally_banks::FeatureExtractor`].
//!
//! Each supported network is one [`Backbone`] variant. The ONNX file is
//! expected to be the backbone exported with its classification head replaced
//! by an identity, so the single output is the penultimate feature vector.
//!
//! ```rust,ignore
//! use wally_banks_onnx::{Backbone, OnnxExtractor};
//!
//! let extractor = OnnxExtractor::builder("models/mobilenet_v2_features.onnx", Backbone::MobileNetV2)
//!     .with_threads(4)
//!     .build()?;
//! assert_eq!(extractor.backbone().embedding_dim(), 1280);
//! ```
//!
//! ## Hardware Acceleration
//!
//! - `cuda` - NVIDIA CUDA (Linux/Windows)
//! - `coreml` - Apple Silicon (macOS)
//!
//! With [`ExecutionProvider::Auto`] the first compiled-in provider that
//! initialises is used, falling back to CPU.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, Once};

use anyhow::{Context, Result};
use ndarray::{Array1, ArrayView4};
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::Session;
use ort::value::Tensor;
use wally_banks::FeatureExtractor;

#[cfg(feature = "coreml")]
use ort::execution_providers::CoreMLExecutionProvider;
#[cfg(feature = "cuda")]
use ort::execution_providers::CUDAExecutionProvider;

// =============================================================================
// ONNX Runtime initialization (internal)
// =============================================================================

static ORT_INIT: Once = Once::new();

/// Point `ORT_DYLIB_PATH` at an installed ONNX Runtime unless it is already set.
fn init_ort_runtime() {
    ORT_INIT.call_once(|| {
        if std::env::var("ORT_DYLIB_PATH").is_ok() {
            return;
        }

        if let Some(lib_path) = find_onnxruntime_library() {
            tracing::debug!(path = %lib_path, "onnxruntime.found");
            std::env::set_var("ORT_DYLIB_PATH", &lib_path);
        }
    });
}

/// Find the ONNX Runtime library in common installation locations.
fn find_onnxruntime_library() -> Option<String> {
    let mut search_patterns = vec![
        "/usr/local/lib/libonnxruntime.so*".to_string(),
        "/usr/lib/libonnxruntime.so*".to_string(),
        "/usr/lib/x86_64-linux-gnu/libonnxruntime.so*".to_string(),
        "/opt/homebrew/lib/libonnxruntime*.dylib".to_string(),
        ".venv/lib/python*/site-packages/onnxruntime/capi/libonnxruntime.so*".to_string(),
    ];

    if let Ok(home) = std::env::var("HOME") {
        search_patterns.extend([
            format!(
                "{}/.venv/lib/python*/site-packages/onnxruntime/capi/libonnxruntime.so*",
                home
            ),
            format!(
                "{}/.local/lib/python*/site-packages/onnxruntime/capi/libonnxruntime.so*",
                home
            ),
            format!("{}/miniconda3/lib/libonnxruntime.so*", home),
        ]);
    }

    for pattern in search_patterns {
        if let Ok(paths) = glob::glob(&pattern) {
            for path in paths.flatten() {
                if path.is_file() {
                    return Some(path.to_string_lossy().to_string());
                }
            }
        }
    }

    None
}

// =============================================================================
// Execution Provider Configuration
// =============================================================================

/// Hardware acceleration provider for ONNX Runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionProvider {
    /// Use the first compiled-in accelerator that initialises, else CPU
    #[default]
    Auto,
    /// CPU execution only
    Cpu,
    /// CUDA execution (requires the `cuda` feature)
    Cuda,
    /// CoreML execution (requires the `coreml` feature)
    CoreML,
}

impl ExecutionProvider {
    /// Cargo feature that has to be enabled for this provider, if any.
    pub fn required_feature(self) -> Option<&'static str> {
        match self {
            ExecutionProvider::Auto | ExecutionProvider::Cpu => None,
            ExecutionProvider::Cuda => Some("cuda"),
            ExecutionProvider::CoreML => Some("coreml"),
        }
    }

    /// Whether this build can use the provider at all.
    pub fn is_compiled(self) -> bool {
        match self {
            ExecutionProvider::Auto | ExecutionProvider::Cpu => true,
            ExecutionProvider::Cuda => cfg!(feature = "cuda"),
            ExecutionProvider::CoreML => cfg!(feature = "coreml"),
        }
    }

    fn ensure_compiled(self) -> Result<()> {
        match self.required_feature() {
            Some(feature) if !self.is_compiled() => anyhow::bail!(
                "{:?} support not compiled. Enable the '{}' feature.",
                self,
                feature
            ),
            _ => Ok(()),
        }
    }

    /// Register the provider on `builder`.
    ///
    /// `Auto` tries each compiled-in accelerator and silently keeps CPU when
    /// none registers; an explicit accelerator that fails is an error.
    fn register(self, builder: SessionBuilder) -> Result<SessionBuilder> {
        self.ensure_compiled()?;

        match self {
            ExecutionProvider::Cpu => Ok(builder),
            ExecutionProvider::Auto => {
                for provider in [ExecutionProvider::Cuda, ExecutionProvider::CoreML] {
                    if provider.is_compiled() {
                        if let Ok(b) = provider.register_accelerator(builder.clone()) {
                            tracing::debug!(provider = ?provider, "execution_provider.selected");
                            return Ok(b);
                        }
                    }
                }
                Ok(builder)
            }
            accelerator => accelerator
                .register_accelerator(builder)
                .with_context(|| format!("Failed to configure {:?} execution provider", self)),
        }
    }

    fn register_accelerator(self, builder: SessionBuilder) -> Result<SessionBuilder> {
        match self {
            #[cfg(feature = "cuda")]
            ExecutionProvider::Cuda => {
                Ok(builder.with_execution_providers([CUDAExecutionProvider::default().build()])?)
            }
            #[cfg(feature = "coreml")]
            ExecutionProvider::CoreML => Ok(builder
                .with_execution_providers([CoreMLExecutionProvider::default().build()])?),
            _ => Ok(builder),
        }
    }
}

// =============================================================================
// Backbones
// =============================================================================

/// Supported feature-extraction backbones.
///
/// The embedding dimension is the width of the penultimate layer, i.e. what the
/// network outputs once its classifier is swapped for an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Backbone {
    /// MobileNetV2, 1280 features
    #[default]
    MobileNetV2,
    /// MobileNetV3-Small, 576 features
    MobileNetV3Small,
    /// MobileNetV3-Large, 960 features
    MobileNetV3Large,
    /// EfficientNet-B0, 1280 features
    EfficientNetB0,
}

impl Backbone {
    pub const ALL: [Backbone; 4] = [
        Backbone::MobileNetV2,
        Backbone::MobileNetV3Small,
        Backbone::MobileNetV3Large,
        Backbone::EfficientNetB0,
    ];

    pub fn embedding_dim(&self) -> usize {
        match self {
            Backbone::MobileNetV2 => 1280,
            Backbone::MobileNetV3Small => 576,
            Backbone::MobileNetV3Large => 960,
            Backbone::EfficientNetB0 => 1280,
        }
    }

    /// Stable name used on the command line and in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Backbone::MobileNetV2 => "mobilenet-v2",
            Backbone::MobileNetV3Small => "mobilenet-v3-small",
            Backbone::MobileNetV3Large => "mobilenet-v3-large",
            Backbone::EfficientNetB0 => "efficientnet-b0",
        }
    }

    /// Conventional file name of the headless export.
    pub fn default_model_file(&self) -> String {
        format!("{}_features.onnx", self.name().replace('-', "_"))
    }
}

impl fmt::Display for Backbone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Backbone {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Backbone::ALL
            .into_iter()
            .find(|b| b.name() == s)
            .ok_or_else(|| {
                let names: Vec<&str> = Backbone::ALL.iter().map(|b| b.name()).collect();
                anyhow::anyhow!("unknown backbone '{}', expected one of: {}", s, names.join(", "))
            })
    }
}

// =============================================================================
// Extractor
// =============================================================================

/// A loaded backbone session, ready for single-image inference.
///
/// The session is created once in [`OnnxExtractorBuilder::build`] and only
/// read from afterwards.
pub struct OnnxExtractor {
    session: Mutex<Session>,
    backbone: Backbone,
    input_name: String,
    output_name: String,
}

/// Builder for [`OnnxExtractor`].
pub struct OnnxExtractorBuilder {
    model_path: PathBuf,
    backbone: Backbone,
    threads: usize,
    execution_provider: ExecutionProvider,
    input_name: Option<String>,
    output_name: Option<String>,
}

impl OnnxExtractorBuilder {
    pub fn new<P: AsRef<Path>>(model_path: P, backbone: Backbone) -> Self {
        let threads = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(4);
        Self {
            model_path: model_path.as_ref().to_path_buf(),
            backbone,
            threads,
            execution_provider: ExecutionProvider::Auto,
            input_name: None,
            output_name: None,
        }
    }

    /// Set the number of intra-op threads.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Set the hardware acceleration provider.
    pub fn with_execution_provider(mut self, provider: ExecutionProvider) -> Self {
        self.execution_provider = provider;
        self
    }

    /// Name of the image input. Defaults to the model's first input.
    pub fn with_input_name(mut self, name: impl Into<String>) -> Self {
        self.input_name = Some(name.into());
        self
    }

    /// Name of the feature output. Defaults to the model's first output.
    pub fn with_output_name(mut self, name: impl Into<String>) -> Self {
        self.output_name = Some(name.into());
        self
    }

    pub fn build(self) -> Result<OnnxExtractor> {
        self.execution_provider.ensure_compiled()?;
        if !self.model_path.is_file() {
            anyhow::bail!(
                "Backbone model not found at {:?} (expected a {} export such as {})",
                self.model_path,
                self.backbone,
                self.backbone.default_model_file()
            );
        }

        init_ort_runtime();

        let builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(self.threads)?;
        let builder = self.execution_provider.register(builder)?;

        let session = builder
            .commit_from_file(&self.model_path)
            .context("Failed to load ONNX model")?;

        let inputs: Vec<String> = session.inputs.iter().map(|i| i.name.clone()).collect();
        let outputs: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        let input_name = resolve_tensor_name("input", self.input_name, &inputs)?;
        let output_name = resolve_tensor_name("output", self.output_name, &outputs)?;

        tracing::info!(
            backbone = %self.backbone,
            model = %self.model_path.display(),
            input = %input_name,
            output = %output_name,
            embedding_dim = self.backbone.embedding_dim(),
            "backbone.loaded"
        );

        Ok(OnnxExtractor {
            session: Mutex::new(session),
            backbone: self.backbone,
            input_name,
            output_name,
        })
    }
}

/// Pick the requested tensor name, or the model's first one, and make sure the
/// model actually declares it.
fn resolve_tensor_name(
    kind: &str,
    requested: Option<String>,
    declared: &[String],
) -> Result<String> {
    match requested {
        Some(name) if declared.contains(&name) => Ok(name),
        Some(name) => anyhow::bail!(
            "ONNX model has no {} named '{}' (declared: {})",
            kind,
            name,
            declared.join(", ")
        ),
        None => declared
            .first()
            .cloned()
            .with_context(|| format!("ONNX model declares no {}s", kind)),
    }
}

impl OnnxExtractor {
    /// Load a backbone with default settings.
    pub fn new<P: AsRef<Path>>(model_path: P, backbone: Backbone) -> Result<Self> {
        OnnxExtractorBuilder::new(model_path, backbone).build()
    }

    /// Create a builder for advanced configuration.
    pub fn builder<P: AsRef<Path>>(model_path: P, backbone: Backbone) -> OnnxExtractorBuilder {
        OnnxExtractorBuilder::new(model_path, backbone)
    }

    pub fn backbone(&self) -> Backbone {
        self.backbone
    }

    /// Run one forward pass and flatten the output to a feature vector.
    pub fn embed(&self, input: ArrayView4<f32>) -> Result<Array1<f32>> {
        let (n, c, h, w) = input.dim();
        if n != 1 || c != 3 {
            anyhow::bail!("expected a [1, 3, H, W] input, got [{}, {}, {}, {}]", n, c, h, w);
        }

        let data: Vec<f32> = input.iter().copied().collect();
        let tensor = Tensor::from_array(([n, c, h, w], data))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow::anyhow!("ONNX session lock poisoned"))?;
        let outputs = session.run(ort::inputs![self.input_name.as_str() => tensor])?;

        // Checked against the model's declared outputs in `build`
        let (_shape, values) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .context("Failed to extract output tensor")?;

        let expected = self.backbone.embedding_dim();
        if values.len() != expected {
            anyhow::bail!(
                "{} output '{}' has {} values, expected {}",
                self.backbone,
                self.output_name,
                values.len(),
                expected
            );
        }

        Ok(Array1::from_vec(values.to_vec()))
    }
}

impl FeatureExtractor for OnnxExtractor {
    fn embedding_dim(&self) -> usize {
        self.backbone.embedding_dim()
    }

    fn forward(&self, input: ArrayView4<f32>) -> wally_banks::Result<Array1<f32>> {
        self.embed(input)
            .map_err(|e| wally_banks::Error::Extraction(format!("{:#}", e)))
    }
}
