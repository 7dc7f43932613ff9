use std::cmp::Ordering;

use candle_core::{DType, IndexOp, Tensor};
use rand::{distributions::WeightedIndex, prelude::Distribution, Rng};

use crate::{
    batch::Batch,
    config::LossConfig,
    data::TextTokenizer,
    distributed::{all_gather_tensor, ProcessContext},
    policy::CausalLm,
    TrainingError,
};

/// Sampling used for evaluation previews.
#[derive(Debug, Clone, Copy)]
pub struct SamplingSettings {
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 50,
            top_p: 1.0,
        }
    }
}

/// Generates one completion per local prompt in `batch` and returns the
/// decoded completions of every worker, ordered by rank.
///
/// Every worker must call this with the same number of rows. Preference
/// objectives would also need reference samples and are not supported.
pub fn batch_samples(
    policy: &dyn CausalLm,
    batch: &Batch,
    loss: &LossConfig,
    tokenizer: &TextTokenizer,
    max_length: usize,
    ctx: &mut ProcessContext,
) -> Result<Vec<String>, TrainingError> {
    if loss.is_preference() {
        return Err(TrainingError::not_implemented(format!(
            "sampling for loss {}",
            loss.name
        )));
    }
    let settings = SamplingSettings::default();
    let prompt_ids = batch.tokens("prompt_input_ids")?.to_vec2::<i64>()?;
    let prompt_mask = batch.tokens("prompt_attention_mask")?.to_vec2::<i64>()?;

    let pad_id = i64::from(tokenizer.pad_id());
    let mut padded = Vec::with_capacity(prompt_ids.len() * max_length);
    for (ids, mask) in prompt_ids.iter().zip(&prompt_mask) {
        let prompt: Vec<i64> = ids
            .iter()
            .zip(mask)
            .filter(|(_, keep)| **keep != 0)
            .map(|(id, _)| *id)
            .collect();
        let mut sequence = generate(
            policy,
            prompt,
            max_length,
            i64::from(tokenizer.eos_id()),
            &settings,
            ctx.rng(),
        )?;
        sequence.resize(max_length, pad_id);
        padded.extend(sequence);
    }

    let rows = prompt_ids.len();
    let local = Tensor::from_vec(padded, (rows, max_length), policy.device())?;
    let gathered = all_gather_tensor(ctx, &local)?.to_vec2::<i64>()?;

    gathered
        .into_iter()
        .map(|row| {
            let ids: Vec<u32> = row.into_iter().map(|id| id.max(0) as u32).collect();
            tokenizer.decode(&ids, true)
        })
        .collect()
}

/// Extends `prompt` until EOS or `max_length` tokens.
fn generate<R: Rng + ?Sized>(
    policy: &dyn CausalLm,
    mut context: Vec<i64>,
    max_length: usize,
    eos_id: i64,
    settings: &SamplingSettings,
    rng: &mut R,
) -> Result<Vec<i64>, TrainingError> {
    context.truncate(max_length);
    while !context.is_empty() && context.len() < max_length {
        let input = Tensor::from_slice(&context, (1, context.len()), policy.device())?;
        let logits = policy.forward(&input, None)?.detach();
        let scores = logits
            .i((0, context.len() - 1))?
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?;
        let Some(next) = sample_next_token(&scores, settings, rng) else {
            break;
        };
        let next = i64::from(next);
        context.push(next);
        if next == eos_id {
            break;
        }
    }
    Ok(context)
}

fn sample_next_token<R: Rng + ?Sized>(
    logits: &[f32],
    settings: &SamplingSettings,
    rng: &mut R,
) -> Option<u32> {
    if logits.is_empty() {
        return None;
    }

    let inv_temp = 1.0 / settings.temperature.max(1e-4);
    let adjusted: Vec<f32> = logits.iter().map(|logit| logit * inv_temp).collect();

    let max_val = adjusted.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = adjusted
        .iter()
        .map(|logit| (logit - max_val).exp())
        .collect();

    if !probs.iter().all(|p| p.is_finite()) {
        return None;
    }

    if settings.top_k > 0 && settings.top_k < probs.len() {
        let mut indices: Vec<usize> = (0..probs.len()).collect();
        indices
            .sort_unstable_by(|&a, &b| probs[b].partial_cmp(&probs[a]).unwrap_or(Ordering::Equal));
        for &idx in indices.iter().skip(settings.top_k) {
            probs[idx] = 0.0;
        }
    }

    if settings.top_p > 0.0 && settings.top_p < 1.0 {
        let mut pairs: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
        pairs.sort_unstable_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        let mut cumulative = 0.0f32;
        let mut keep = vec![false; probs.len()];
        for (idx, prob) in pairs {
            cumulative += prob;
            keep[idx] = true;
            if cumulative >= settings.top_p {
                break;
            }
        }
        for (prob, keep) in probs.iter_mut().zip(keep) {
            if !keep {
                *prob = 0.0;
            }
        }
    }

    let sum: f32 = probs.iter().sum();
    if !sum.is_finite() || sum <= 0.0 {
        return adjusted
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(Ordering::Equal))
            .map(|(idx, _)| idx as u32);
    }

    let dist = WeightedIndex::new(&probs).ok()?;
    Some(dist.sample(rng) as u32)
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    #[test]
    fn top_k_restricts_candidates() {
        let mut rng = StdRng::seed_from_u64(7);
        let settings = SamplingSettings {
            temperature: 1.0,
            top_k: 2,
            top_p: 1.0,
        };
        let logits = [0.0, 5.0, 4.9, -3.0, 1.0];
        for _ in 0..200 {
            let token = sample_next_token(&logits, &settings, &mut rng).unwrap();
            assert!(token == 1 || token == 2, "sampled {token}");
        }
    }

    #[test]
    fn empty_logits_yield_nothing() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(sample_next_token(&[], &SamplingSettings::default(), &mut rng).is_none());
    }

    #[test]
    fn same_seed_samples_identically() {
        let logits: Vec<f32> = (0..60).map(|i| (i % 7) as f32 * 0.2).collect();
        let draw = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..20)
                .map(|_| sample_next_token(&logits, &SamplingSettings::default(), &mut rng).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(3), draw(3));
    }
}
