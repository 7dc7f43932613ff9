use std::{collections::BTreeMap, path::Path};

use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};

use super::{average_gradients, scale_to_norm, squared_norm, SaveContext, ShardingStrategy};
use crate::{
    checkpoint, distributed::ProcessContext, policy::CausalLm, rank0_info, TrainingError,
};

/// Rows `[rank * rows_per_rank, (rank + 1) * rows_per_rank)` of a matrix belong to `rank`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowShard {
    pub name: String,
    pub rows: usize,
    pub rows_per_rank: usize,
}

impl RowShard {
    pub fn start(&self, rank: usize) -> usize {
        rank * self.rows_per_rank
    }
}

/// Matrices whose row count divides evenly are split by rows; everything else is replicated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorParallelPlan {
    shards: Vec<RowShard>,
    replicated: Vec<String>,
}

impl TensorParallelPlan {
    pub fn build(parameters: &[(String, Var)], world_size: usize) -> Result<Self, TrainingError> {
        if world_size == 0 {
            return Err(TrainingError::initialization("world size must be positive"));
        }
        let mut shards = Vec::new();
        let mut replicated = Vec::new();
        for (name, var) in parameters {
            match var.as_tensor().dims() {
                &[rows, _] if rows % world_size == 0 => shards.push(RowShard {
                    name: name.clone(),
                    rows,
                    rows_per_rank: rows / world_size,
                }),
                _ => replicated.push(name.clone()),
            }
        }
        Ok(Self { shards, replicated })
    }

    pub fn shards(&self) -> &[RowShard] {
        &self.shards
    }

    pub fn replicated(&self) -> &[String] {
        &self.replicated
    }

    fn is_sharded(&self, name: &str) -> bool {
        self.shards.iter().any(|shard| shard.name == name)
    }
}

/// Splits the policy's weight matrices by rows across workers.
///
/// Each worker owns one row block per sharded matrix as its own variable, and
/// only that block is updated by its optimizer. Between steps the policy's
/// matrices hold the owned rows and zeros elsewhere; forward passes first
/// gather every block. The reference model, when present, stays replicated.
#[derive(Debug)]
pub struct TensorParallelStrategy {
    plan: TensorParallelPlan,
    rank: usize,
    /// Owned row block for each entry of `plan.shards`, in the same order.
    local_rows: Vec<Var>,
}

impl TensorParallelStrategy {
    pub fn new(
        policy: &dyn CausalLm,
        reference: Option<&dyn CausalLm>,
        ctx: &ProcessContext,
    ) -> Result<Self, TrainingError> {
        let plan = TensorParallelPlan::build(&policy.parameters(), ctx.world_size())?;
        let params: BTreeMap<String, Var> = policy.parameters().into_iter().collect();
        let rank = ctx.rank();
        let local_rows = plan
            .shards
            .iter()
            .map(|shard| -> Result<Var, TrainingError> {
                let rows = lookup(&params, &shard.name)?.as_tensor().narrow(
                    0,
                    shard.start(rank),
                    shard.rows_per_rank,
                )?;
                Ok(Var::from_tensor(&rows)?)
            })
            .collect::<Result<Vec<_>, TrainingError>>()?;
        rank0_info!(
            ctx,
            sharded = plan.shards().len(),
            replicated = plan.replicated().len(),
            "sharding policy for tensor parallelism"
        );
        if reference.is_some() {
            rank0_info!(ctx, "reference model is replicated, not sharded");
        }
        Ok(Self {
            plan,
            rank,
            local_rows,
        })
    }

    /// This worker's row blocks, named `<parameter>.rows.<rank>`.
    pub fn local_shards(&self) -> Vec<(String, Var)> {
        self.plan
            .shards
            .iter()
            .zip(&self.local_rows)
            .map(|(shard, var)| (format!("{}.rows.{}", shard.name, self.rank), var.clone()))
            .collect()
    }

    /// Reassembles every sharded matrix from the row blocks held by each worker.
    fn gather_rows(
        &self,
        ctx: &ProcessContext,
        device: &Device,
    ) -> Result<Vec<(String, Tensor)>, TrainingError> {
        let mut payload = Vec::new();
        for local in &self.local_rows {
            payload.extend(
                local
                    .as_tensor()
                    .to_dtype(DType::F32)?
                    .flatten_all()?
                    .to_vec1::<f32>()?,
            );
        }
        let gathered = ctx.all_gather_f32(payload)?;

        let mut offsets = vec![0usize; gathered.len()];
        let mut tensors = Vec::with_capacity(self.plan.shards.len());
        for (shard, local) in self.plan.shards.iter().zip(&self.local_rows) {
            let cols = local.as_tensor().dims()[1];
            let block = shard.rows_per_rank * cols;
            let mut values = Vec::with_capacity(shard.rows * cols);
            for (contribution, offset) in gathered.iter().zip(offsets.iter_mut()) {
                let end = *offset + block;
                let rows = contribution.get(*offset..end).ok_or_else(|| {
                    TrainingError::distributed(format!(
                        "row shard of {} is shorter than expected",
                        shard.name
                    ))
                })?;
                values.extend_from_slice(rows);
                *offset = end;
            }
            let full = Tensor::from_vec(values, (shard.rows, cols), device)?
                .to_dtype(local.as_tensor().dtype())?;
            tensors.push((shard.name.clone(), full));
        }
        Ok(tensors)
    }

    /// Runs `f` over the complete, unsharded policy parameters copied to host memory.
    fn with_unsharded_view<T>(
        &self,
        policy: &dyn CausalLm,
        ctx: &ProcessContext,
        f: impl FnOnce(&[(String, Tensor)]) -> Result<T, TrainingError>,
    ) -> Result<T, TrainingError> {
        let params: BTreeMap<String, Var> = policy.parameters().into_iter().collect();
        let mut assembled: BTreeMap<String, Tensor> =
            self.gather_rows(ctx, &Device::Cpu)?.into_iter().collect();
        for name in &self.plan.replicated {
            let tensor = lookup(&params, name)?.as_tensor().to_device(&Device::Cpu)?;
            assembled.insert(name.clone(), tensor);
        }
        let view = policy
            .parameters()
            .into_iter()
            .map(|(name, _)| {
                let tensor = assembled.remove(&name).ok_or_else(|| {
                    TrainingError::runtime(format!("unsharded view is missing {name}"))
                })?;
                Ok((name, tensor))
            })
            .collect::<Result<Vec<_>, TrainingError>>()?;
        f(&view)
    }

    fn replicated_parameters(&self, policy: &dyn CausalLm) -> Vec<(String, Var)> {
        policy
            .parameters()
            .into_iter()
            .filter(|(name, _)| !self.plan.is_sharded(name))
            .collect()
    }
}

fn lookup<'a>(params: &'a BTreeMap<String, Var>, name: &str) -> Result<&'a Var, TrainingError> {
    params
        .get(name)
        .ok_or_else(|| TrainingError::runtime(format!("unknown parameter {name}")))
}

impl ShardingStrategy for TensorParallelStrategy {
    fn name(&self) -> &'static str {
        "TensorParallelTrainer"
    }

    /// Replicated parameters plus this worker's row blocks.
    fn optimizer_parameters(
        &self,
        policy: &dyn CausalLm,
        _ctx: &ProcessContext,
    ) -> Vec<(String, Var)> {
        let mut parameters = self.replicated_parameters(policy);
        parameters.extend(self.local_shards());
        parameters
    }

    fn gather_parameters(
        &self,
        policy: &dyn CausalLm,
        ctx: &ProcessContext,
    ) -> Result<(), TrainingError> {
        let params: BTreeMap<String, Var> = policy.parameters().into_iter().collect();
        for (name, tensor) in self.gather_rows(ctx, policy.device())? {
            lookup(&params, &name)?.set(&tensor)?;
        }
        Ok(())
    }

    /// Leaves the owned rows in each sharded matrix and zeroes the rest.
    fn release_parameters(
        &self,
        policy: &dyn CausalLm,
        _ctx: &ProcessContext,
    ) -> Result<(), TrainingError> {
        let params: BTreeMap<String, Var> = policy.parameters().into_iter().collect();
        for (shard, local) in self.plan.shards.iter().zip(&self.local_rows) {
            let full = lookup(&params, &shard.name)?;
            let local = local.as_tensor();
            let cols = local.dims()[1];
            let before = shard.start(self.rank);
            let after = shard.rows - before - shard.rows_per_rank;

            let mut parts = Vec::with_capacity(3);
            if before > 0 {
                parts.push(Tensor::zeros((before, cols), local.dtype(), local.device())?);
            }
            parts.push(local.clone());
            if after > 0 {
                parts.push(Tensor::zeros((after, cols), local.dtype(), local.device())?);
            }
            full.set(&Tensor::cat(&parts, 0)?)?;
        }
        Ok(())
    }

    /// Averages gradients, then hands each worker the gradient rows of the blocks it owns.
    fn reduce_gradients(
        &self,
        policy: &dyn CausalLm,
        grads: &mut GradStore,
        ctx: &ProcessContext,
    ) -> Result<(), TrainingError> {
        let params = policy.parameters();
        average_gradients(&params, grads, ctx, None)?;
        let params: BTreeMap<String, Var> = params.into_iter().collect();
        for (shard, local) in self.plan.shards.iter().zip(&self.local_rows) {
            let full = lookup(&params, &shard.name)?;
            if let Some(grad) = grads.remove(full.as_tensor()) {
                let owned = grad
                    .narrow(0, shard.start(self.rank), shard.rows_per_rank)?
                    .contiguous()?;
                grads.insert(local.as_tensor(), owned);
            }
        }
        Ok(())
    }

    /// Replicated gradients count once; row-block norms are summed over workers.
    fn clip_gradients(
        &self,
        policy: &dyn CausalLm,
        grads: &mut GradStore,
        max_norm: f64,
        ctx: &ProcessContext,
    ) -> Result<f64, TrainingError> {
        let replicated = self.replicated_parameters(policy);
        let local = self.local_shards();
        let sharded = ctx.all_reduce_sum_f32(vec![squared_norm(&local, grads)? as f32])?;
        let total_norm = (squared_norm(&replicated, grads)? + sharded[0] as f64)
            .max(0.0)
            .sqrt();
        scale_to_norm(&replicated, grads, total_norm, max_norm)?;
        scale_to_norm(&local, grads, total_norm, max_norm)?;
        Ok(total_norm)
    }

    /// Writes the policy weights only; optimizer and scheduler state are not saved.
    fn save(
        &self,
        save: SaveContext<'_>,
        output_dir: &Path,
        metrics: &BTreeMap<String, f64>,
    ) -> Result<(), TrainingError> {
        let ctx = save.ctx;
        self.with_unsharded_view(save.policy, ctx, |tensors| {
            if ctx.is_coordinator() {
                checkpoint::ensure_dir(output_dir)?;
                checkpoint::write_policy(
                    &output_dir.join(checkpoint::POLICY_FILENAME),
                    save.example_counter,
                    tensors,
                    metrics,
                )?;
            }
            Ok(())
        })?;
        ctx.barrier()
    }
}
