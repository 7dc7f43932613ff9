use std::fmt;

use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::{
    batch::{Batch, IGNORE_INDEX},
    config::LossConfig,
    distributed::{all_gather_tensor, ProcessContext},
    metrics::MetricMap,
    policy::CausalLm,
    TrainingError,
};

/// Which namespace metrics are reported under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Eval,
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Split::Train => f.write_str("train"),
            Split::Eval => f.write_str("eval"),
        }
    }
}

/// Differentiable batch loss plus per-example metrics.
#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: Tensor,
    pub metrics: MetricMap,
}

/// Log-probability of `labels` under `logits`, one scalar per row.
///
/// `logits` is `(batch, seq, vocab)` and `labels` is `(batch, seq)`; the logit
/// at position `i` scores the label at `i + 1`. Positions labelled
/// [`IGNORE_INDEX`] are excluded. With `average_log_prob` the sum is divided by
/// the number of real positions, and a row without any is an error.
pub fn batch_logps(
    logits: &Tensor,
    labels: &Tensor,
    average_log_prob: bool,
) -> Result<Tensor, TrainingError> {
    masked_logps(logits, labels, average_log_prob, 0)
}

pub(crate) fn masked_logps(
    logits: &Tensor,
    labels: &Tensor,
    average_log_prob: bool,
    placeholder: i64,
) -> Result<Tensor, TrainingError> {
    let (batch, seq, vocab) = logits.dims3()?;
    if labels.dims() != [batch, seq] {
        return Err(TrainingError::runtime(format!(
            "labels shape {:?} does not match logits batch/sequence ({batch}, {seq})",
            labels.dims()
        )));
    }
    if seq < 2 {
        return Err(TrainingError::runtime(
            "log-probabilities need sequences of at least two positions",
        ));
    }
    if placeholder < 0 || placeholder as usize >= vocab {
        return Err(TrainingError::runtime(format!(
            "placeholder label {placeholder} outside vocabulary of {vocab}"
        )));
    }

    let labels = labels
        .to_device(logits.device())?
        .to_dtype(DType::I64)?
        .narrow(1, 1, seq - 1)?
        .contiguous()?;
    let logits = logits
        .narrow(1, 0, seq - 1)?
        .to_dtype(DType::F32)?
        .contiguous()?;

    let mask = labels.ne(IGNORE_INDEX)?;
    let fill = Tensor::full(placeholder, labels.dims(), labels.device())?;
    let safe_labels = mask.where_cond(&labels, &fill)?;

    let log_probs = ops::log_softmax(&logits, D::Minus1)?;
    let per_token = log_probs
        .gather(&safe_labels.unsqueeze(2)?.contiguous()?, 2)?
        .squeeze(2)?;

    let mask = mask.to_dtype(DType::F32)?;
    let summed = (per_token * &mask)?.sum(1)?;
    if !average_log_prob {
        return Ok(summed);
    }

    let counts = mask.sum(1)?;
    if let Some(row) = counts.to_vec1::<f32>()?.iter().position(|c| *c == 0.0) {
        return Err(TrainingError::runtime(format!(
            "row {row} has no unmasked label positions; cannot average its log-probability"
        )));
    }
    Ok(summed.div(&counts)?)
}

/// Loss and metrics for `batch` under the configured objective.
///
/// Only `sft` is implemented; any other name fails with `NotImplemented`.
pub fn batch_metrics(
    policy: &dyn CausalLm,
    batch: &Batch,
    loss: &LossConfig,
    ctx: &ProcessContext,
    split: Split,
) -> Result<LossOutput, TrainingError> {
    match loss.name.as_str() {
        "sft" => sft_metrics(policy, batch, &loss.aux_categories, ctx, split),
        other => Err(TrainingError::not_implemented(format!(
            "loss {other} not implemented"
        ))),
    }
}

fn category_logits(
    policy: &dyn CausalLm,
    batch: &Batch,
    category: &str,
) -> Result<Tensor, TrainingError> {
    let input_ids = batch.tokens(&format!("{category}_input_ids"))?;
    let attention_mask = batch.tokens(&format!("{category}_attention_mask"))?;
    Ok(policy
        .forward(input_ids, Some(attention_mask))?
        .to_dtype(DType::F32)?)
}

/// Per-example loss is the negated summed log-probability of the chosen response.
fn sft_metrics(
    policy: &dyn CausalLm,
    batch: &Batch,
    aux_categories: &[String],
    ctx: &ProcessContext,
    split: Split,
) -> Result<LossOutput, TrainingError> {
    let mut metrics = MetricMap::new();

    let chosen_logits = category_logits(policy, batch, "chosen")?;
    let chosen_logps = batch_logps(&chosen_logits, batch.tokens("chosen_labels")?, false)?;
    let losses = chosen_logps.neg()?;

    // Monitoring only: detached, local to this worker.
    for category in aux_categories {
        let logits = category_logits(policy, batch, category)?.detach();
        let logps = batch_logps(&logits, batch.tokens(&format!("{category}_labels"))?, false)?;
        metrics.extend_values(
            format!("logps_{split}/{category}"),
            logps.to_vec1::<f32>()?.into_iter().map(f64::from),
        );
    }

    let gathered_logps = all_gather_tensor(ctx, &chosen_logps.detach())?;
    metrics.extend_values(
        format!("logps_{split}/chosen"),
        gathered_logps.to_vec1::<f32>()?.into_iter().map(f64::from),
    );

    let gathered_losses = all_gather_tensor(ctx, &losses.detach())?;
    metrics.extend_values(
        format!("loss/{split}"),
        gathered_losses.to_vec1::<f32>()?.into_iter().map(f64::from),
    );

    Ok(LossOutput {
        loss: losses.mean(0)?,
        metrics,
    })
}
