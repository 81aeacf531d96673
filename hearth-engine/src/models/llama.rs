use std::path::Path;

use anyhow::{bail, Context, Result};
use candle_core::quantized::gguf_file;
use candle_core::{Device, Tensor};
use candle_transformers::models::quantized_llama::ModelWeights;
use tokenizers::Tokenizer;

use super::sampling::{self, Sampler};
use super::tokenizer::IncrementalDecoder;
use super::{
    stop_position, GenerationControl, GenerationOutput, GenerationParams, ModelParams,
    TextGenerator,
};
use crate::request::FinishReason;

const EOS_CANDIDATES: [&str; 4] = ["</s>", "<|EOT|>", "<|eot_id|>", "<|end_of_text|>"];

/// Llama-family text generation over quantized GGUF weights via Candle.
pub struct LlamaGenerator {
    model: ModelWeights,
    tokenizer: Tokenizer,
    device: Device,
    eos_token_id: Option<u32>,
    context_length: usize,
}

impl LlamaGenerator {
    /// Load weights and tokenizer from local files.
    pub fn load(
        model_path: &Path,
        tokenizer_path: &Path,
        device: &Device,
        params: ModelParams,
    ) -> Result<Self> {
        tracing::info!(path = %model_path.display(), "Loading GGUF model");

        let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(|e| {
            anyhow::anyhow!(
                "Failed to load tokenizer from {}: {}",
                tokenizer_path.display(),
                e
            )
        })?;

        let mut file = std::fs::File::open(model_path)
            .with_context(|| format!("Failed to open {}", model_path.display()))?;
        let content = gguf_file::Content::read(&mut file)
            .with_context(|| format!("Corrupt or unsupported GGUF file {}", model_path.display()))?;

        let trained_context = content
            .metadata
            .get("llama.context_length")
            .and_then(|v| v.to_u32().ok())
            .map(|n| n as usize);
        if let Some(trained) = trained_context {
            if params.context_length > trained {
                tracing::warn!(
                    configured = params.context_length,
                    trained,
                    "Configured context length exceeds the model's trained context"
                );
            }
        }

        let model = ModelWeights::from_gguf(content, &mut file, device)
            .context("Failed to materialise model weights")?;

        let eos_token_id = EOS_CANDIDATES
            .iter()
            .find_map(|token| tokenizer.token_to_id(token));
        if eos_token_id.is_none() {
            tracing::warn!("No EOS token found in tokenizer; relying on stop sequences");
        }

        Ok(Self {
            model,
            tokenizer,
            device: device.clone(),
            eos_token_id,
            context_length: params.context_length,
        })
    }

    fn encode(&self, prompt: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow::anyhow!("Tokenizer encode error: {}", e))?;
        Ok(encoding.get_ids().to_vec())
    }
}

impl TextGenerator for LlamaGenerator {
    fn generate(
        &mut self,
        prompt: &str,
        params: &GenerationParams,
        control: &GenerationControl,
    ) -> Result<GenerationOutput> {
        let prompt_tokens = self.encode(prompt)?;
        if prompt_tokens.is_empty() {
            bail!("Prompt encodes to zero tokens");
        }
        if prompt_tokens.len() >= self.context_length {
            bail!(
                "Prompt is {} tokens; the context window is {}",
                prompt_tokens.len(),
                self.context_length
            );
        }
        let budget = params
            .max_tokens
            .min(self.context_length - prompt_tokens.len());

        tracing::debug!(prompt_tokens = prompt_tokens.len(), budget, "Starting generation");

        let mut sampler = Sampler::new(params);
        let mut decoder = IncrementalDecoder::new(&self.tokenizer);
        let mut history = prompt_tokens.clone();
        let mut input = prompt_tokens.clone();
        let mut position = 0usize;
        let mut generated = 0usize;
        let mut text = String::new();
        let mut finish = FinishReason::MaxTokens;

        while generated < budget {
            if let Some(reason) = control.interruption() {
                finish = reason;
                break;
            }

            // Position 0 starts a fresh sequence and discards the previous KV cache.
            let tensor = Tensor::new(input.as_slice(), &self.device)?.unsqueeze(0)?;
            let logits = self.model.forward(&tensor, position)?.squeeze(0)?;
            position += input.len();

            let window = history.len().saturating_sub(params.repeat_last_n);
            let logits =
                sampling::apply_repeat_penalty(&logits, params.repeat_penalty, &history[window..])?;

            let next = sampler.sample(&logits)?;
            generated += 1;

            if Some(next) == self.eos_token_id {
                finish = FinishReason::Stop;
                break;
            }
            history.push(next);

            if let Some(delta) = decoder.push(next)? {
                text.push_str(&delta);
                if let Some(cut) = stop_position(&text, &params.stop_sequences) {
                    text.truncate(cut);
                    finish = FinishReason::Stop;
                    break;
                }
            }
            input = vec![next];
        }

        if finish != FinishReason::Stop {
            if let Some(rest) = decoder.finish()? {
                text.push_str(&rest);
            }
            if let Some(cut) = stop_position(&text, &params.stop_sequences) {
                text.truncate(cut);
                finish = FinishReason::Stop;
            }
        }

        tracing::debug!(
            prompt_tokens = prompt_tokens.len(),
            completion_tokens = generated,
            finish_reason = finish.as_str(),
            "Generation complete"
        );

        Ok(GenerationOutput {
            text: text.trim().to_string(),
            prompt_tokens: prompt_tokens.len() as u64,
            completion_tokens: generated as u64,
            finish_reason: finish,
        })
    }
}
