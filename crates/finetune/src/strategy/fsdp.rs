use std::{
    collections::{BTreeMap, HashSet},
    path::Path,
};

use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};
use model::ModuleInfo;

use super::{average_gradients, scale_to_norm, squared_norm, SaveContext, ShardingStrategy};
use crate::{
    checkpoint::{self, Envelope},
    config::TrainingConfig,
    distributed::ProcessContext,
    optimizer::OptimizerState,
    policy::CausalLm,
    rank0_info, rank0_warn, TrainingError,
};

const ROOT_UNIT: &str = "root";

/// Whether blocks recompute activations during backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationCheckpointing {
    Disabled,
    Enabled,
    /// Requested but the policy cannot recompute its blocks; training continues without it.
    Unavailable,
}

/// A group of parameters owned and updated by a single worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardUnit {
    pub name: String,
    pub parameters: Vec<String>,
    pub owner: usize,
}

/// Assignment of the policy's parameters to owning workers, one unit per block
/// of the configured type plus a root unit for everything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPlan {
    units: Vec<ShardUnit>,
}

impl ShardPlan {
    pub fn build(
        modules: &[ModuleInfo],
        parameter_names: &[String],
        block_name: &str,
        world_size: usize,
    ) -> Result<Self, TrainingError> {
        if world_size == 0 {
            return Err(TrainingError::initialization("world size must be positive"));
        }
        let mut units = Vec::new();
        let mut claimed = HashSet::new();
        for module in modules.iter().filter(|m| m.type_name == block_name) {
            for name in &module.parameters {
                if !claimed.insert(name.clone()) {
                    return Err(TrainingError::initialization(format!(
                        "parameter {name} belongs to more than one {block_name}"
                    )));
                }
            }
            units.push(ShardUnit {
                name: module.path.clone(),
                parameters: module.parameters.clone(),
                owner: units.len() % world_size,
            });
        }
        if units.is_empty() {
            return Err(TrainingError::initialization(format!(
                "could not find block class {block_name} in model"
            )));
        }

        let root: Vec<String> = parameter_names
            .iter()
            .filter(|name| !claimed.contains(*name))
            .cloned()
            .collect();
        if !root.is_empty() {
            units.push(ShardUnit {
                name: ROOT_UNIT.to_string(),
                parameters: root,
                owner: units.len() % world_size,
            });
        }
        Ok(Self { units })
    }

    pub fn units(&self) -> &[ShardUnit] {
        &self.units
    }

    pub fn owned_by(&self, rank: usize) -> HashSet<&str> {
        self.units
            .iter()
            .filter(|unit| unit.owner == rank)
            .flat_map(|unit| unit.parameters.iter().map(String::as_str))
            .collect()
    }
}

/// Fully sharded data parallel. Between steps each worker keeps only the
/// units it owns; the full policy is gathered from the owners for forward
/// passes, gradients are averaged, and each unit is updated by its owner.
#[derive(Debug)]
pub struct FsdpStrategy {
    plan: ShardPlan,
    reference_plan: Option<ShardPlan>,
    mixed_precision: Option<DType>,
    activation_checkpointing: ActivationCheckpointing,
}

impl FsdpStrategy {
    pub fn new(
        policy: &mut dyn CausalLm,
        reference: Option<&mut dyn CausalLm>,
        config: &TrainingConfig,
        ctx: &ProcessContext,
    ) -> Result<Self, TrainingError> {
        let block_name = config.model.block_name.as_deref().ok_or_else(|| {
            TrainingError::initialization("must specify model.block_name for FSDPTrainer")
        })?;
        let mixed_precision = config.model.mixed_precision_dtype()?;

        let plan = shard(policy, block_name, mixed_precision, ctx)?;
        rank0_info!(
            ctx,
            units = plan.units().len(),
            block = block_name,
            ?mixed_precision,
            "sharding policy"
        );

        let reference_plan = match reference {
            Some(reference) if config.loss.is_preference() => {
                rank0_info!(ctx, "sharding reference model");
                Some(shard(reference, block_name, mixed_precision, ctx)?)
            }
            _ => None,
        };

        let activation_checkpointing = if !config.activation_checkpointing {
            ActivationCheckpointing::Disabled
        } else if policy.supports_activation_recompute(block_name) {
            policy.enable_activation_recompute(block_name)?;
            rank0_info!(ctx, block = block_name, "applied activation checkpointing");
            ActivationCheckpointing::Enabled
        } else {
            rank0_warn!(
                ctx,
                block = block_name,
                "activation checkpointing is not available for this policy; continuing without it"
            );
            ActivationCheckpointing::Unavailable
        };

        tracing::info!(rank = ctx.rank(), "loaded model on rank");
        ctx.barrier()?;

        Ok(Self {
            plan,
            reference_plan,
            mixed_precision,
            activation_checkpointing,
        })
    }

    pub fn reference_is_sharded(&self) -> bool {
        self.reference_plan.is_some()
    }

    /// Full parameter values assembled from each unit's owner; `None` off the coordinator.
    fn gather_full_state(
        &self,
        policy: &dyn CausalLm,
        ctx: &ProcessContext,
    ) -> Result<Option<Vec<(String, Tensor)>>, TrainingError> {
        let params: BTreeMap<String, Var> = policy.parameters().into_iter().collect();
        let mut gathered = BTreeMap::new();
        for unit in self.plan.units() {
            let tensors = broadcast_unit(unit, &params, ctx, &Device::Cpu)?;
            if ctx.is_coordinator() {
                gathered.extend(tensors);
            }
        }
        if !ctx.is_coordinator() {
            return Ok(None);
        }
        let ordered = policy
            .parameters()
            .into_iter()
            .map(|(name, _)| {
                let tensor = gathered.remove(&name).ok_or_else(|| {
                    TrainingError::runtime(format!("no shard holds parameter {name}"))
                })?;
                Ok((name, tensor))
            })
            .collect::<Result<Vec<_>, TrainingError>>()?;
        Ok(Some(ordered))
    }
}

fn shard(
    model: &mut dyn CausalLm,
    block_name: &str,
    mixed_precision: Option<DType>,
    ctx: &ProcessContext,
) -> Result<ShardPlan, TrainingError> {
    let names: Vec<String> = model.parameters().into_iter().map(|(name, _)| name).collect();
    let plan = ShardPlan::build(&model.modules(), &names, block_name, ctx.world_size())?;
    model.set_compute_dtype(mixed_precision)?;
    Ok(plan)
}

/// Sends the owner's values of `unit` to every worker and returns them as tensors on `device`.
fn broadcast_unit(
    unit: &ShardUnit,
    params: &BTreeMap<String, Var>,
    ctx: &ProcessContext,
    device: &Device,
) -> Result<Vec<(String, Tensor)>, TrainingError> {
    let vars = unit
        .parameters
        .iter()
        .map(|name| {
            params
                .get(name)
                .map(|var| (name, var))
                .ok_or_else(|| TrainingError::runtime(format!("unknown parameter {name}")))
        })
        .collect::<Result<Vec<_>, TrainingError>>()?;

    let mut payload = Vec::new();
    if ctx.rank() == unit.owner {
        for (_, var) in &vars {
            payload.extend(
                var.as_tensor()
                    .to_dtype(DType::F32)?
                    .flatten_all()?
                    .to_vec1::<f32>()?,
            );
        }
    }
    let mut gathered = ctx.all_gather_f32(payload)?;
    let values = std::mem::take(&mut gathered[unit.owner]);

    let expected: usize = vars.iter().map(|(_, var)| var.as_tensor().elem_count()).sum();
    if values.len() != expected {
        return Err(TrainingError::distributed(format!(
            "unit {} sent {} values, expected {expected}",
            unit.name,
            values.len()
        )));
    }

    let mut offset = 0;
    let mut tensors = Vec::with_capacity(vars.len());
    for (name, var) in vars {
        let tensor = var.as_tensor();
        let numel = tensor.elem_count();
        let value = Tensor::from_vec(values[offset..offset + numel].to_vec(), tensor.dims(), device)?
            .to_dtype(tensor.dtype())?;
        offset += numel;
        tensors.push((name.clone(), value));
    }
    Ok(tensors)
}

impl ShardingStrategy for FsdpStrategy {
    fn name(&self) -> &'static str {
        "FSDPTrainer"
    }

    fn optimizer_parameters(
        &self,
        policy: &dyn CausalLm,
        ctx: &ProcessContext,
    ) -> Vec<(String, Var)> {
        let owned = self.plan.owned_by(ctx.rank());
        policy
            .parameters()
            .into_iter()
            .filter(|(name, _)| owned.contains(name.as_str()))
            .collect()
    }

    fn reduce_gradients(
        &self,
        policy: &dyn CausalLm,
        grads: &mut GradStore,
        ctx: &ProcessContext,
    ) -> Result<(), TrainingError> {
        average_gradients(&policy.parameters(), grads, ctx, self.mixed_precision)
    }

    /// Norm over every worker's owned gradients, so all workers clip by the same global factor.
    fn clip_gradients(
        &self,
        policy: &dyn CausalLm,
        grads: &mut GradStore,
        max_norm: f64,
        ctx: &ProcessContext,
    ) -> Result<f64, TrainingError> {
        let owned = self.plan.owned_by(ctx.rank());
        let params: Vec<(String, Var)> = policy
            .parameters()
            .into_iter()
            .filter(|(name, _)| owned.contains(name.as_str()))
            .collect();
        let partial = squared_norm(&params, grads)?;
        let total = ctx.all_reduce_sum_f32(vec![partial as f32])?;
        let total_norm = (total[0] as f64).max(0.0).sqrt();
        scale_to_norm(&params, grads, total_norm, max_norm)?;
        Ok(total_norm)
    }

    fn activation_checkpointing(&self) -> ActivationCheckpointing {
        self.activation_checkpointing
    }

    fn gather_parameters(
        &self,
        policy: &dyn CausalLm,
        ctx: &ProcessContext,
    ) -> Result<(), TrainingError> {
        if ctx.world_size() == 1 {
            return Ok(());
        }
        let params: BTreeMap<String, Var> = policy.parameters().into_iter().collect();
        for unit in self.plan.units() {
            let tensors = broadcast_unit(unit, &params, ctx, policy.device())?;
            if ctx.rank() == unit.owner {
                continue;
            }
            for (name, tensor) in tensors {
                if let Some(var) = params.get(&name) {
                    var.set(&tensor)?;
                }
            }
        }
        Ok(())
    }

    /// Zeroes every unit owned by another worker.
    fn release_parameters(
        &self,
        policy: &dyn CausalLm,
        ctx: &ProcessContext,
    ) -> Result<(), TrainingError> {
        let params: BTreeMap<String, Var> = policy.parameters().into_iter().collect();
        for unit in self.plan.units().iter().filter(|unit| unit.owner != ctx.rank()) {
            for name in &unit.parameters {
                if let Some(var) = params.get(name) {
                    var.set(&var.as_tensor().zeros_like()?)?;
                }
            }
        }
        Ok(())
    }

    fn save(
        &self,
        save: SaveContext<'_>,
        output_dir: &Path,
        metrics: &BTreeMap<String, f64>,
    ) -> Result<(), TrainingError> {
        let ctx = save.ctx;
        if ctx.is_coordinator() {
            checkpoint::ensure_dir(output_dir)?;
        }

        if let Some(tensors) = self.gather_full_state(save.policy, ctx)? {
            checkpoint::write_policy(
                &output_dir.join(checkpoint::POLICY_FILENAME),
                save.example_counter,
                &tensors,
                metrics,
            )?;
        }
        ctx.barrier()?;

        let local_state = serde_json::to_vec(&save.optimizer.state()?)?;
        if let Some(parts) = ctx.gather_bytes_to_root(local_state)? {
            let parts = parts
                .iter()
                .map(|bytes| serde_json::from_slice::<OptimizerState>(bytes))
                .collect::<Result<Vec<_>, _>>()?;
            let order: Vec<String> = save
                .policy
                .parameters()
                .into_iter()
                .map(|(name, _)| name)
                .collect();
            checkpoint::write_envelope(
                &output_dir.join(checkpoint::OPTIMIZER_FILENAME),
                &Envelope {
                    step_idx: save.example_counter,
                    state: OptimizerState::merge(parts, &order)?,
                    metrics: metrics.clone(),
                },
            )?;
        }
        ctx.barrier()?;

        if ctx.is_coordinator() {
            checkpoint::write_envelope(
                &output_dir.join(checkpoint::SCHEDULER_FILENAME),
                &Envelope {
                    step_idx: save.example_counter,
                    state: save.scheduler.state(),
                    metrics: metrics.clone(),
                },
            )?;
        }
        ctx.barrier()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use model::{Model, ModelConfig};

    use super::*;

    fn tiny_model() -> Model {
        Model::new(ModelConfig {
            vocab_size: 11,
            hidden_dim: 8,
            n_layers: 3,
            n_heads: 2,
            max_positions: 16,
            ff_ratio: 2.0,
            dtype: DType::F32,
            device: Device::Cpu,
            dropout_p: None,
            seed: 1,
        })
        .unwrap()
    }

    fn plan_for(model: &Model, block: &str, world: usize) -> Result<ShardPlan, TrainingError> {
        let names: Vec<String> = model.parameters().into_iter().map(|(n, _)| n).collect();
        ShardPlan::build(&model.modules(), &names, block, world)
    }

    #[test]
    fn one_unit_per_block_plus_root() {
        let model = tiny_model();
        let plan = plan_for(&model, "DecoderBlock", 2).unwrap();
        let names: Vec<_> = plan.units().iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["blocks.0", "blocks.1", "blocks.2", "root"]);
        let owners: Vec<_> = plan.units().iter().map(|u| u.owner).collect();
        assert_eq!(owners, vec![0, 1, 0, 1]);

        let root = &plan.units()[3].parameters;
        assert!(root.contains(&"embed.weight".to_string()));
        assert!(root.contains(&"lm_head.weight".to_string()));
    }

    #[test]
    fn ownership_partitions_every_parameter() {
        let model = tiny_model();
        let plan = plan_for(&model, "DecoderBlock", 3).unwrap();
        let total: usize = (0..3).map(|rank| plan.owned_by(rank).len()).sum();
        assert_eq!(total, model.parameters().len());
    }

    fn fsdp_config(loss: &str, activation_checkpointing: bool) -> TrainingConfig {
        let mut config: TrainingConfig = serde_json::from_value(serde_json::json!({
            "datasets": ["data"],
            "n_epochs": 1,
            "trainer": "FSDPTrainer",
            "loss": { "name": loss },
            "model": { "block_name": "DecoderBlock" },
        }))
        .unwrap();
        config.activation_checkpointing = activation_checkpointing;
        config
    }

    /// Wraps the reference model and reports block recomputation as supported.
    struct Recomputing {
        inner: Model,
        enabled: Option<String>,
    }

    impl CausalLm for Recomputing {
        fn forward(
            &self,
            input_ids: &Tensor,
            mask: Option<&Tensor>,
        ) -> Result<Tensor, TrainingError> {
            CausalLm::forward(&self.inner, input_ids, mask)
        }

        fn parameters(&self) -> Vec<(String, Var)> {
            CausalLm::parameters(&self.inner)
        }

        fn modules(&self) -> Vec<model::ModuleInfo> {
            CausalLm::modules(&self.inner)
        }

        fn device(&self) -> &Device {
            CausalLm::device(&self.inner)
        }

        fn set_training(&self, training: bool) {
            CausalLm::set_training(&self.inner, training)
        }

        fn is_training(&self) -> bool {
            CausalLm::is_training(&self.inner)
        }

        fn set_compute_dtype(&mut self, dtype: Option<DType>) -> Result<(), TrainingError> {
            CausalLm::set_compute_dtype(&mut self.inner, dtype)
        }

        fn supports_activation_recompute(&self, block_type: &str) -> bool {
            block_type == "DecoderBlock"
        }

        fn enable_activation_recompute(&mut self, block_type: &str) -> Result<(), TrainingError> {
            self.enabled = Some(block_type.to_string());
            Ok(())
        }
    }

    #[test]
    fn reference_is_sharded_only_for_preference_losses() {
        let ctx = ProcessContext::solo(0);

        let mut policy = tiny_model();
        let mut reference = tiny_model();
        let sft = FsdpStrategy::new(
            &mut policy,
            Some(&mut reference),
            &fsdp_config("sft", false),
            &ctx,
        )
        .unwrap();
        assert!(!sft.reference_is_sharded());

        let mut policy = tiny_model();
        let mut reference = tiny_model();
        let dpo = FsdpStrategy::new(
            &mut policy,
            Some(&mut reference),
            &fsdp_config("dpo", false),
            &ctx,
        )
        .unwrap();
        assert!(dpo.reference_is_sharded());

        let mut policy = tiny_model();
        let without =
            FsdpStrategy::new(&mut policy, None, &fsdp_config("dpo", false), &ctx).unwrap();
        assert!(!without.reference_is_sharded());
    }

    #[test]
    fn activation_checkpointing_depends_on_policy_support() {
        let ctx = ProcessContext::solo(0);

        let mut plain = tiny_model();
        let strategy =
            FsdpStrategy::new(&mut plain, None, &fsdp_config("sft", true), &ctx).unwrap();
        assert_eq!(
            strategy.activation_checkpointing(),
            ActivationCheckpointing::Unavailable
        );

        let mut recomputing = Recomputing {
            inner: tiny_model(),
            enabled: None,
        };
        let strategy =
            FsdpStrategy::new(&mut recomputing, None, &fsdp_config("sft", true), &ctx).unwrap();
        assert_eq!(
            strategy.activation_checkpointing(),
            ActivationCheckpointing::Enabled
        );
        assert_eq!(recomputing.enabled.as_deref(), Some("DecoderBlock"));

        let mut recomputing = Recomputing {
            inner: tiny_model(),
            enabled: None,
        };
        let strategy =
            FsdpStrategy::new(&mut recomputing, None, &fsdp_config("sft", false), &ctx).unwrap();
        assert_eq!(
            strategy.activation_checkpointing(),
            ActivationCheckpointing::Disabled
        );
        assert!(recomputing.enabled.is_none());
    }

    #[test]
    fn unknown_block_type_is_rejected() {
        let model = tiny_model();
        let err = plan_for(&model, "GPT2Block", 2).unwrap_err();
        assert!(matches!(err, TrainingError::Initialization(_)));
    }
}
