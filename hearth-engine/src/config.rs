use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use hearth_resilience::HealthPolicy;

use crate::gate::GateConfig;
use crate::models::{GenerationParams, ModelParams, ModelSpec};

#[derive(Parser, Debug, Clone)]
#[command(name = "hearth-engine", about = "Single-model GGUF inference service over HTTP")]
pub struct CliArgs {
    /// Path to the quantized GGUF weights file
    #[arg(
        long,
        default_value = "/app/models/deepseek-coder-1.3b-instruct.Q4_K_M.gguf",
        env = "HEARTH_MODEL_PATH"
    )]
    pub model_path: PathBuf,

    /// Tokenizer source (path to tokenizer.json, a directory, or a HuggingFace
    /// repo ID). Defaults to tokenizer.json next to the model file.
    #[arg(long, env = "HEARTH_TOKENIZER")]
    pub tokenizer: Option<String>,

    /// Model name reported in responses. Defaults to the model file stem.
    #[arg(long, env = "HEARTH_MODEL_NAME")]
    pub model_name: Option<String>,

    /// Device: "cpu", "cuda", "metal"
    #[arg(long, default_value = "cpu", env = "HEARTH_DEVICE")]
    pub device: String,

    /// CUDA/Metal device ordinal
    #[arg(long, default_value = "0")]
    pub device_id: usize,

    /// Context window in tokens
    #[arg(long, default_value = "2048", env = "HEARTH_CONTEXT_LENGTH")]
    pub context_length: usize,

    /// CPU threads used for inference
    #[arg(long, default_value = "4", env = "HEARTH_THREADS")]
    pub threads: usize,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0", env = "HEARTH_HOST")]
    pub host: String,

    /// Port to listen on
    #[arg(long, default_value = "8000", env = "PORT")]
    pub port: u16,

    /// Requests allowed to wait for the inference slot
    #[arg(long, default_value = "8", env = "HEARTH_QUEUE_CAPACITY")]
    pub queue_capacity: usize,

    /// Default per-request timeout in seconds
    #[arg(long, default_value = "120", env = "HEARTH_REQUEST_TIMEOUT")]
    pub request_timeout: u64,

    /// Upper bound in seconds for a caller-supplied timeout
    #[arg(long, default_value = "300", env = "HEARTH_MAX_REQUEST_TIMEOUT")]
    pub max_request_timeout: u64,

    /// Rolling window in seconds over which rejections are measured
    #[arg(long, default_value = "30", env = "HEARTH_OVERLOAD_WINDOW")]
    pub overload_window: u64,

    /// Rejection ratio above which the window counts as overloaded
    #[arg(long, default_value = "0.5", env = "HEARTH_OVERLOAD_REJECT_RATIO")]
    pub overload_reject_ratio: f64,

    /// Admission decisions needed in the window before it can count as overloaded
    #[arg(long, default_value = "5", env = "HEARTH_OVERLOAD_MIN_SAMPLES")]
    pub overload_min_samples: usize,

    /// Seconds between load re-evaluations when no traffic arrives
    #[arg(long, default_value = "5", env = "HEARTH_OVERLOAD_EVAL_INTERVAL")]
    pub overload_eval_interval: u64,

    /// Consecutive overload/underload signals needed to change state
    #[arg(long, default_value = "3", env = "HEARTH_OVERLOAD_HYSTERESIS")]
    pub overload_hysteresis: u32,

    /// Consecutive inference errors that mark the service unhealthy
    #[arg(long, default_value = "5", env = "HEARTH_FAILURE_THRESHOLD")]
    pub failure_threshold: u32,

    /// Temperature for generation
    #[arg(long, default_value = "0.7")]
    pub temperature: f64,

    /// Top-p (nucleus sampling)
    #[arg(long)]
    pub top_p: Option<f64>,

    /// Top-k sampling
    #[arg(long)]
    pub top_k: Option<usize>,

    /// Maximum tokens to generate
    #[arg(long, default_value = "1024")]
    pub max_tokens: usize,

    /// Repeat penalty
    #[arg(long, default_value = "1.1")]
    pub repeat_penalty: f32,

    /// Keep serving an unhealthy health endpoint after a failed model load
    /// instead of exiting
    #[arg(long, env = "HEARTH_STAY_UP_ON_LOAD_FAILURE")]
    pub stay_up_on_load_failure: bool,

    /// Seconds to wait for open requests after a shutdown signal
    #[arg(long, default_value = "30", env = "HEARTH_SHUTDOWN_GRACE")]
    pub shutdown_grace: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "HEARTH_LOG_LEVEL")]
    pub log_level: String,
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub model: ModelSpec,
    pub gate: GateConfig,
    pub health: HealthPolicy,
    pub overload_eval_interval: Duration,
    pub default_generation: GenerationParams,
    pub stay_up_on_load_failure: bool,
    pub shutdown_grace: Duration,
}

impl ServiceConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl TryFrom<CliArgs> for ServiceConfig {
    type Error = String;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.host.is_empty() {
            return Err("host must not be empty".into());
        }
        if args.port == 0 {
            return Err("port must be > 0".into());
        }
        if args.queue_capacity == 0 {
            return Err("queue capacity must be > 0".into());
        }
        if args.context_length == 0 {
            return Err("context length must be > 0".into());
        }
        if args.threads == 0 {
            return Err("threads must be > 0".into());
        }
        if args.max_request_timeout < args.request_timeout {
            return Err("max request timeout must be >= the default request timeout".into());
        }
        if !(0.0..=1.0).contains(&args.overload_reject_ratio) {
            return Err("overload reject ratio must be in [0, 1]".into());
        }
        if args.overload_window == 0 || args.overload_eval_interval == 0 {
            return Err("overload window and evaluation interval must be > 0".into());
        }
        if args.overload_hysteresis == 0 || args.failure_threshold == 0 {
            return Err("overload hysteresis and failure threshold must be > 0".into());
        }

        let default_generation = GenerationParams {
            max_tokens: args.max_tokens,
            temperature: args.temperature,
            top_p: args.top_p,
            top_k: args.top_k,
            repeat_penalty: args.repeat_penalty,
            ..GenerationParams::default()
        };
        default_generation
            .validate(args.context_length)
            .map_err(|e| format!("default generation parameters: {e}"))?;

        let name = args.model_name.clone().unwrap_or_else(|| {
            args.model_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "model".to_string())
        });

        Ok(Self {
            host: args.host,
            port: args.port,
            model: ModelSpec {
                path: args.model_path,
                tokenizer: args.tokenizer,
                name,
                params: ModelParams {
                    context_length: args.context_length,
                    threads: args.threads,
                },
                device: args.device,
                device_id: args.device_id,
            },
            gate: GateConfig {
                queue_capacity: args.queue_capacity,
                default_timeout: Duration::from_secs(args.request_timeout),
                max_timeout: Duration::from_secs(args.max_request_timeout),
                overload_window: Duration::from_secs(args.overload_window),
                overload_reject_ratio: args.overload_reject_ratio,
                overload_min_samples: args.overload_min_samples,
            },
            health: HealthPolicy {
                overload_hysteresis: args.overload_hysteresis,
                failure_threshold: args.failure_threshold,
            },
            overload_eval_interval: Duration::from_secs(args.overload_eval_interval),
            default_generation,
            stay_up_on_load_failure: args.stay_up_on_load_failure,
            shutdown_grace: Duration::from_secs(args.shutdown_grace),
        })
    }
}
