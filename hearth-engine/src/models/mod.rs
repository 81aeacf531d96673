pub mod llama;
pub mod sampling;
pub mod tokenizer;
pub mod weights;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::request::{FinishReason, InferenceRequest};

// ── Traits ────────────────────────────────────────────────────────────────

/// A loaded text generation model.
///
/// `generate` blocks for the whole generation and is not reentrant: the
/// wrapped runtime must never see two calls at once. The Inference
/// Serializer is the only caller.
pub trait TextGenerator: Send {
    fn generate(
        &mut self,
        prompt: &str,
        params: &GenerationParams,
        control: &GenerationControl,
    ) -> Result<GenerationOutput>;
}

// ── Generation types ──────────────────────────────────────────────────────

#[derive(Debug)]
pub struct GenerationOutput {
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub max_tokens: usize,
    pub temperature: f64,
    pub top_p: Option<f64>,
    pub top_k: Option<usize>,
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
    pub stop_sequences: Vec<String>,
    pub seed: Option<u64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.7,
            top_p: None,
            top_k: None,
            repeat_penalty: 1.1,
            repeat_last_n: 64,
            stop_sequences: vec![],
            seed: None,
        }
    }
}

impl GenerationParams {
    /// Check the parameters against the loaded model's context window.
    pub fn validate(&self, context_length: usize) -> Result<(), String> {
        if self.max_tokens == 0 {
            return Err("max_tokens must be > 0".into());
        }
        if self.max_tokens > context_length {
            return Err(format!(
                "max_tokens ({}) exceeds the context length ({context_length})",
                self.max_tokens
            ));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err("temperature must be a finite value >= 0".into());
        }
        if let Some(p) = self.top_p {
            if !(p > 0.0 && p <= 1.0) {
                return Err("top_p must be in (0, 1]".into());
            }
        }
        if self.top_k == Some(0) {
            return Err("top_k must be > 0".into());
        }
        if !self.repeat_penalty.is_finite() || self.repeat_penalty <= 0.0 {
            return Err("repeat_penalty must be > 0".into());
        }
        if self.stop_sequences.iter().any(|s| s.is_empty()) {
            return Err("stop sequences must not be empty".into());
        }
        Ok(())
    }
}

/// Cooperative interruption for a running generation. Checked between token
/// steps; a single step is never preempted.
#[derive(Debug, Clone)]
pub struct GenerationControl {
    deadline: Instant,
    cancel: CancellationToken,
}

impl GenerationControl {
    pub fn new(deadline: Instant, cancel: CancellationToken) -> Self {
        Self { deadline, cancel }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// The reason generation should stop now, if any.
    pub fn interruption(&self) -> Option<FinishReason> {
        if self.cancel.is_cancelled() {
            Some(FinishReason::Cancelled)
        } else if Instant::now() >= self.deadline {
            Some(FinishReason::Timeout)
        } else {
            None
        }
    }
}

/// Byte offset of the earliest stop sequence in `text`, if any occurs.
pub fn stop_position(text: &str, stop_sequences: &[String]) -> Option<usize> {
    stop_sequences
        .iter()
        .filter(|seq| !seq.is_empty())
        .filter_map(|seq| text.find(seq.as_str()))
        .min()
}

// ── Model configuration ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModelParams {
    pub context_length: usize,
    pub threads: usize,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            context_length: 2048,
            threads: 4,
        }
    }
}

/// Everything needed to load the model.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub path: PathBuf,
    /// Local tokenizer path or HuggingFace repo id. Defaults to a
    /// `tokenizer.json` next to the model file.
    pub tokenizer: Option<String>,
    pub name: String,
    pub params: ModelParams,
    pub device: String,
    pub device_id: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub path: PathBuf,
    pub params: ModelParams,
}

// ── Model handle ─────────────────────────────────────────────────────────

/// The single loaded model of the process.
///
/// Constructed once at startup and moved into the Inference Serializer,
/// which owns it until shutdown. Immutable once loaded.
pub struct ModelHandle {
    info: ModelInfo,
    generator: Box<dyn TextGenerator>,
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle").field("info", &self.info).finish()
    }
}

impl ModelHandle {
    /// Load the GGUF model described by `spec`. Blocking; large allocation.
    pub fn load(spec: &ModelSpec) -> Result<Self, EngineError> {
        let started = Instant::now();
        let model_path = weights::resolve_model_path(&spec.path)
            .map_err(|e| EngineError::Load(format!("{e:#}")))?;
        let tokenizer_path = weights::resolve_tokenizer(spec.tokenizer.as_deref(), &model_path)
            .map_err(|e| EngineError::Load(format!("{e:#}")))?;

        configure_threads(spec.params.threads);
        let device = select_device(&spec.device, spec.device_id)
            .map_err(|e| EngineError::Load(format!("{e:#}")))?;
        tracing::info!(device = ?device, "Compute device selected");

        let generator =
            llama::LlamaGenerator::load(&model_path, &tokenizer_path, &device, spec.params)
                .map_err(|e| EngineError::Load(format!("{e:#}")))?;

        tracing::info!(
            model = %spec.name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Model loaded"
        );

        Ok(Self::from_generator(
            ModelInfo {
                name: spec.name.clone(),
                path: model_path,
                params: spec.params,
            },
            Box::new(generator),
        ))
    }

    /// Wrap an already constructed generator.
    pub fn from_generator(info: ModelInfo, generator: Box<dyn TextGenerator>) -> Self {
        Self { info, generator }
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    /// Run one generation. Must only be called from the serializer's worker.
    pub fn generate(
        &mut self,
        request: &InferenceRequest,
        control: &GenerationControl,
    ) -> Result<GenerationOutput, EngineError> {
        request
            .params
            .validate(self.info.params.context_length)
            .map_err(EngineError::Inference)?;

        self.generator
            .generate(&request.prompt, &request.params, control)
            .map_err(|e| EngineError::Inference(format!("{e:#}")))
    }
}

// ── Runtime setup ────────────────────────────────────────────────────────

/// Size the global rayon pool used by candle's CPU kernels.
fn configure_threads(threads: usize) {
    let result = rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .thread_name(|i| format!("hearth-compute-{i}"))
        .build_global();
    if let Err(e) = result {
        tracing::warn!(error = %e, "Compute thread pool already initialised, keeping it");
    }
}

fn select_device(name: &str, ordinal: usize) -> Result<candle_core::Device> {
    let _ = ordinal;
    let device = match name {
        #[cfg(feature = "cuda")]
        "cuda" => candle_core::Device::new_cuda(ordinal)?,
        #[cfg(feature = "metal")]
        "metal" => candle_core::Device::new_metal(ordinal)?,
        "cpu" => candle_core::Device::Cpu,
        other => {
            tracing::warn!("Unknown device '{}', falling back to CPU", other);
            candle_core::Device::Cpu
        }
    };
    Ok(device)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    // ── GenerationParams::validate ───────────────────────────────────────

    #[test]
    fn defaults_are_valid() {
        assert!(GenerationParams::default().validate(2048).is_ok());
    }

    #[test]
    fn rejects_zero_and_oversized_max_tokens() {
        let mut params = GenerationParams {
            max_tokens: 0,
            ..Default::default()
        };
        assert!(params.validate(2048).is_err());
        params.max_tokens = 4096;
        assert!(params.validate(2048).unwrap_err().contains("context length"));
    }

    #[test]
    fn rejects_negative_temperature() {
        let params = GenerationParams {
            temperature: -0.1,
            ..Default::default()
        };
        assert!(params.validate(2048).is_err());
    }

    #[test]
    fn rejects_top_p_out_of_range() {
        for p in [0.0, 1.5, f64::NAN] {
            let params = GenerationParams {
                top_p: Some(p),
                ..Default::default()
            };
            assert!(params.validate(2048).is_err(), "top_p={p}");
        }
    }

    #[test]
    fn rejects_empty_stop_sequence() {
        let params = GenerationParams {
            stop_sequences: vec![String::new()],
            ..Default::default()
        };
        assert!(params.validate(2048).is_err());
    }

    // ── stop_position ────────────────────────────────────────────────────

    #[test]
    fn stop_position_picks_earliest() {
        let stops = vec!["Human:".to_string(), "</s>".to_string()];
        assert_eq!(stop_position("abc</s> Human:", &stops), Some(3));
        assert_eq!(stop_position("no stops here", &stops), None);
    }

    // ── GenerationControl ────────────────────────────────────────────────

    #[test]
    fn control_reports_cancel_before_deadline() {
        let token = CancellationToken::new();
        let control = GenerationControl::new(Instant::now() + Duration::from_secs(60), token.clone());
        assert_eq!(control.interruption(), None);
        token.cancel();
        assert_eq!(control.interruption(), Some(FinishReason::Cancelled));
    }

    #[test]
    fn control_reports_elapsed_deadline() {
        let control = GenerationControl::new(Instant::now(), CancellationToken::new());
        assert_eq!(control.interruption(), Some(FinishReason::Timeout));
    }

    // ── ModelHandle ──────────────────────────────────────────────────────

    struct Echo;

    impl TextGenerator for Echo {
        fn generate(
            &mut self,
            prompt: &str,
            _params: &GenerationParams,
            _control: &GenerationControl,
        ) -> Result<GenerationOutput> {
            Ok(GenerationOutput {
                text: prompt.to_uppercase(),
                prompt_tokens: 1,
                completion_tokens: 1,
                finish_reason: FinishReason::Stop,
            })
        }
    }

    fn echo_handle() -> ModelHandle {
        ModelHandle::from_generator(
            ModelInfo {
                name: "echo".into(),
                path: PathBuf::from("echo.gguf"),
                params: ModelParams::default(),
            },
            Box::new(Echo),
        )
    }

    #[test]
    fn handle_runs_generator() {
        let mut handle = echo_handle();
        let control = GenerationControl::new(Instant::now() + Duration::from_secs(5), CancellationToken::new());
        let out = handle.generate(&InferenceRequest::new("hi"), &control).unwrap();
        assert_eq!(out.text, "HI");
    }

    #[test]
    fn handle_rejects_malformed_params_as_inference_error() {
        let mut handle = echo_handle();
        let control = GenerationControl::new(Instant::now() + Duration::from_secs(5), CancellationToken::new());
        let request = InferenceRequest::new("hi").with_params(GenerationParams {
            max_tokens: 0,
            ..Default::default()
        });
        let err = handle.generate(&request, &control).unwrap_err();
        assert!(matches!(err, EngineError::Inference(_)));
    }

    #[test]
    fn load_missing_file_is_load_error() {
        let spec = ModelSpec {
            path: PathBuf::from("/definitely/not/here/model.gguf"),
            tokenizer: None,
            name: "missing".into(),
            params: ModelParams::default(),
            device: "cpu".into(),
            device_id: 0,
        };
        let err = ModelHandle::load(&spec).unwrap_err();
        assert!(matches!(err, EngineError::Load(_)));
    }
}
