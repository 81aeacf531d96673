use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::GenerationParams;

/// Token selection for one generation.
///
/// Greedy when temperature is zero, otherwise temperature-scaled sampling
/// restricted by top-k then top-p. A seed makes sampling reproducible.
pub struct Sampler {
    temperature: f64,
    top_k: Option<usize>,
    top_p: Option<f64>,
    rng: StdRng,
}

impl Sampler {
    pub fn new(params: &GenerationParams) -> Self {
        let rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            temperature: params.temperature,
            top_k: params.top_k,
            top_p: params.top_p,
            rng,
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }

    /// Pick the next token from a 1-D logits tensor.
    pub fn sample(&mut self, logits: &Tensor) -> Result<u32> {
        let logits: Vec<f32> = logits
            .to_dtype(DType::F32)?
            .to_device(&Device::Cpu)?
            .to_vec1()?;
        self.sample_slice(&logits)
    }

    fn sample_slice(&mut self, logits: &[f32]) -> Result<u32> {
        if logits.is_empty() {
            bail!("Cannot sample from empty logits");
        }
        if self.is_greedy() {
            return Ok(argmax(logits));
        }

        let mut candidates = probabilities(logits, self.temperature as f32);
        if let Some(k) = self.top_k {
            candidates.truncate(k.max(1));
        }
        if let Some(p) = self.top_p {
            nucleus(&mut candidates, p as f32);
        }

        let total: f32 = candidates.iter().map(|(_, prob)| prob).sum();
        let mut target = self.rng.random::<f32>() * total;
        for &(token, prob) in &candidates {
            if target < prob {
                return Ok(token);
            }
            target -= prob;
        }
        Ok(candidates.last().map(|(token, _)| *token).unwrap_or(0))
    }
}

/// Penalise tokens seen in `recent`: positive logits are divided by the
/// penalty, negative ones multiplied.
pub fn apply_repeat_penalty(logits: &Tensor, penalty: f32, recent: &[u32]) -> Result<Tensor> {
    if recent.is_empty() || (penalty - 1.0).abs() < f32::EPSILON {
        return Ok(logits.clone());
    }
    let mut values: Vec<f32> = logits
        .to_dtype(DType::F32)?
        .to_device(&Device::Cpu)?
        .to_vec1()?;
    penalise(&mut values, penalty, recent);
    Ok(Tensor::from_vec(values, logits.shape(), logits.device())?)
}

// ── Internal helpers ──────────────────────────────────────────────────────

fn penalise(values: &mut [f32], penalty: f32, recent: &[u32]) {
    let mut seen = recent.to_vec();
    seen.sort_unstable();
    seen.dedup();
    for token in seen {
        if let Some(v) = values.get_mut(token as usize) {
            *v = if *v > 0.0 { *v / penalty } else { *v * penalty };
        }
    }
}

fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .fold((0usize, f32::NEG_INFINITY), |best, (i, &v)| {
            if v > best.1 { (i, v) } else { best }
        })
        .0 as u32
}

/// Softmax at the given temperature, sorted by descending probability.
fn probabilities(logits: &[f32], temperature: f32) -> Vec<(u32, f32)> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<(u32, f32)> = logits
        .iter()
        .enumerate()
        .map(|(i, &l)| (i as u32, ((l - max) / temperature).exp()))
        .collect();
    let sum: f32 = probs.iter().map(|(_, p)| p).sum::<f32>().max(f32::EPSILON);
    for (_, p) in probs.iter_mut() {
        *p /= sum;
    }
    probs.sort_by(|a, b| b.1.total_cmp(&a.1));
    probs
}

/// Keep the smallest prefix of `sorted` whose mass reaches `p`.
fn nucleus(sorted: &mut Vec<(u32, f32)>, p: f32) {
    let total: f32 = sorted.iter().map(|(_, prob)| prob).sum();
    let mut mass = 0.0f32;
    let mut keep = sorted.len();
    for (i, (_, prob)) in sorted.iter().enumerate() {
        mass += prob / total.max(f32::EPSILON);
        if mass >= p {
            keep = i + 1;
            break;
        }
    }
    sorted.truncate(keep.max(1));
}

// ── Tests ────────────────────────────────────────────────────────────────
