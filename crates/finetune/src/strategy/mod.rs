//! How the policy is laid out across workers: parameter gather and release,
//! gradient reduction, clipping and checkpoint save.

pub mod fsdp;
pub mod tensor_parallel;

use std::{collections::BTreeMap, path::Path};

use candle_core::{backprop::GradStore, DType, Tensor, Var};

pub use fsdp::{ActivationCheckpointing, FsdpStrategy, ShardPlan, ShardUnit};
pub use tensor_parallel::{RowShard, TensorParallelPlan, TensorParallelStrategy};

use crate::{
    checkpoint::{self, Envelope},
    distributed::ProcessContext,
    optimizer::TrainerOptimizer,
    policy::CausalLm,
    rank0_warn,
    scheduler::LRScheduler,
    TrainingError,
};

/// State a strategy needs to write a checkpoint.
pub struct SaveContext<'a> {
    pub policy: &'a dyn CausalLm,
    pub optimizer: &'a TrainerOptimizer,
    pub scheduler: &'a dyn LRScheduler,
    pub ctx: &'a ProcessContext,
    pub example_counter: usize,
}

pub trait ShardingStrategy: Send {
    fn name(&self) -> &'static str;

    /// Parameters updated by this worker's optimizer.
    fn optimizer_parameters(
        &self,
        policy: &dyn CausalLm,
        _ctx: &ProcessContext,
    ) -> Vec<(String, Var)> {
        policy.parameters()
    }

    /// Combines per-worker gradients after accumulation and before clipping.
    fn reduce_gradients(
        &self,
        _policy: &dyn CausalLm,
        _grads: &mut GradStore,
        _ctx: &ProcessContext,
    ) -> Result<(), TrainingError> {
        Ok(())
    }

    /// Clips gradients in place to `max_norm` and returns the norm before clipping.
    fn clip_gradients(
        &self,
        policy: &dyn CausalLm,
        grads: &mut GradStore,
        max_norm: f64,
        _ctx: &ProcessContext,
    ) -> Result<f64, TrainingError> {
        clip_local(&policy.parameters(), grads, max_norm)
    }

    fn activation_checkpointing(&self) -> ActivationCheckpointing {
        ActivationCheckpointing::Disabled
    }

    /// Materializes the full policy on this worker ahead of forward passes.
    fn gather_parameters(
        &self,
        _policy: &dyn CausalLm,
        _ctx: &ProcessContext,
    ) -> Result<(), TrainingError> {
        Ok(())
    }

    /// Drops the parameter data this worker does not own. The policy holds only
    /// this worker's shard until the next [`ShardingStrategy::gather_parameters`].
    fn release_parameters(
        &self,
        _policy: &dyn CausalLm,
        _ctx: &ProcessContext,
    ) -> Result<(), TrainingError> {
        Ok(())
    }

    fn save(
        &self,
        save: SaveContext<'_>,
        output_dir: &Path,
        metrics: &BTreeMap<String, f64>,
    ) -> Result<(), TrainingError>;
}

/// Every worker holds the whole policy; only the coordinator writes checkpoints.
#[derive(Debug, Default)]
pub struct BasicStrategy;

impl BasicStrategy {
    pub fn new(ctx: &ProcessContext) -> Self {
        rank0_warn!(
            ctx,
            world_size = ctx.world_size(),
            "BasicTrainer does not synchronize gradients; workers train independent replicas"
        );
        Self
    }
}

impl ShardingStrategy for BasicStrategy {
    fn name(&self) -> &'static str {
        "BasicTrainer"
    }

    fn save(
        &self,
        save: SaveContext<'_>,
        output_dir: &Path,
        metrics: &BTreeMap<String, f64>,
    ) -> Result<(), TrainingError> {
        if !save.ctx.is_coordinator() {
            return Ok(());
        }
        checkpoint::ensure_dir(output_dir)?;
        let tensors = save
            .policy
            .parameters()
            .into_iter()
            .map(|(name, var)| Ok((name, var.as_tensor().to_device(&candle_core::Device::Cpu)?)))
            .collect::<Result<Vec<_>, TrainingError>>()?;
        checkpoint::write_policy(
            &output_dir.join(checkpoint::POLICY_FILENAME),
            save.example_counter,
            &tensors,
            metrics,
        )?;
        checkpoint::write_envelope(
            &output_dir.join(checkpoint::OPTIMIZER_FILENAME),
            &Envelope {
                step_idx: save.example_counter,
                state: save.optimizer.state()?,
                metrics: metrics.clone(),
            },
        )?;
        checkpoint::write_envelope(
            &output_dir.join(checkpoint::SCHEDULER_FILENAME),
            &Envelope {
                step_idx: save.example_counter,
                state: save.scheduler.state(),
                metrics: metrics.clone(),
            },
        )?;
        Ok(())
    }
}

/// Sum of squared gradient entries over `params`.
pub(crate) fn squared_norm(
    params: &[(String, Var)],
    grads: &GradStore,
) -> Result<f64, TrainingError> {
    let mut sum_squares = 0.0f64;
    for (_, var) in params {
        if let Some(grad) = grads.get(var.as_tensor()) {
            sum_squares += grad
                .to_dtype(DType::F32)?
                .sqr()?
                .sum_all()?
                .to_vec0::<f32>()? as f64;
        }
    }
    Ok(sum_squares)
}

/// Scales the gradients of `params` by `max_norm / total_norm` when the norm exceeds `max_norm`.
pub(crate) fn scale_to_norm(
    params: &[(String, Var)],
    grads: &mut GradStore,
    total_norm: f64,
    max_norm: f64,
) -> Result<(), TrainingError> {
    if total_norm <= max_norm {
        return Ok(());
    }
    let clip_coef = max_norm / (total_norm + 1e-6);
    for (_, var) in params {
        if let Some(grad) = grads.remove(var.as_tensor()) {
            grads.insert(var.as_tensor(), (grad * clip_coef)?);
        }
    }
    Ok(())
}

pub(crate) fn clip_local(
    params: &[(String, Var)],
    grads: &mut GradStore,
    max_norm: f64,
) -> Result<f64, TrainingError> {
    let total_norm = squared_norm(params, grads)?.sqrt();
    scale_to_norm(params, grads, total_norm, max_norm)?;
    Ok(total_norm)
}

/// Replaces each gradient with its mean over all workers.
///
/// Gradients travel as one flattened vector; with `reduce_dtype` each value is
/// first rounded to that precision. Parameters without a gradient contribute zeros.
pub(crate) fn average_gradients(
    params: &[(String, Var)],
    grads: &mut GradStore,
    ctx: &ProcessContext,
    reduce_dtype: Option<DType>,
) -> Result<(), TrainingError> {
    let world = ctx.world_size();
    if world == 1 {
        return Ok(());
    }

    let mut flat = Vec::new();
    for (_, var) in params {
        let tensor = var.as_tensor();
        let grad = match grads.get(tensor) {
            Some(grad) => grad.clone(),
            None => tensor.zeros_like()?,
        };
        let grad = match reduce_dtype {
            Some(dtype) => grad.to_dtype(dtype)?,
            None => grad,
        };
        flat.extend(grad.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?);
    }

    let summed = ctx.all_reduce_sum_f32(flat)?;
    let scale = 1.0 / world as f64;
    let mut offset = 0;
    for (_, var) in params {
        let tensor = var.as_tensor();
        let numel = tensor.elem_count();
        let values = summed[offset..offset + numel].to_vec();
        offset += numel;
        let averaged = Tensor::from_vec(values, tensor.dims(), tensor.device())?
            .affine(scale, 0.0)?
            .to_dtype(tensor.dtype())?;
        grads.insert(tensor, averaged);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::thread;

    use candle_core::Device;

    use super::*;
    use crate::distributed::LocalGroup;

    fn grads_for(var: &Var, grad: &[f32]) -> GradStore {
        let loss = (var.as_tensor() * Tensor::new(grad, &Device::Cpu).unwrap())
            .unwrap()
            .sum_all()
            .unwrap();
        loss.backward().unwrap()
    }

    #[test]
    fn clip_returns_pre_clip_norm_and_rescales() {
        let var = Var::new(&[0.0f32, 0.0], &Device::Cpu).unwrap();
        let params = vec![("w".to_string(), var.clone())];
        let mut grads = grads_for(&var, &[3.0, 4.0]);

        let norm = clip_local(&params, &mut grads, 1.0).unwrap();
        assert!((norm - 5.0).abs() < 1e-6);

        let clipped = grads.get(var.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert!((clipped[0] - 0.6).abs() < 1e-4);
        assert!((clipped[1] - 0.8).abs() < 1e-4);
    }

    #[test]
    fn clip_leaves_small_gradients_alone() {
        let var = Var::new(&[0.0f32, 0.0], &Device::Cpu).unwrap();
        let params = vec![("w".to_string(), var.clone())];
        let mut grads = grads_for(&var, &[0.3, 0.4]);

        let norm = clip_local(&params, &mut grads, 10.0).unwrap();
        assert!((norm - 0.5).abs() < 1e-6);
        let grad = grads.get(var.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(grad, vec![0.3, 0.4]);
    }

    #[test]
    fn gradients_average_across_workers() {
        let groups = LocalGroup::create(2).unwrap();
        let results: Vec<Vec<f32>> = thread::scope(|scope| {
            let handles: Vec<_> = groups
                .into_iter()
                .map(|group| {
                    scope.spawn(move || {
                        let ctx = ProcessContext::new(std::sync::Arc::new(group), 0);
                        let var = Var::new(&[0.0f32, 0.0], &Device::Cpu).unwrap();
                        let params = vec![("w".to_string(), var.clone())];
                        let scale = (ctx.rank() + 1) as f32;
                        let mut grads = grads_for(&var, &[scale, 2.0 * scale]);
                        average_gradients(&params, &mut grads, &ctx, None).unwrap();
                        grads.get(var.as_tensor()).unwrap().to_vec1::<f32>().unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(results[0], vec![1.5, 3.0]);
        assert_eq!(results[0], results[1]);
    }
}
