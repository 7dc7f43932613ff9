use candle_core::{DType, Device, Tensor, Var};
use model::{Model, ModuleInfo};

use crate::TrainingError;

/// What the trainer needs from a causal language model.
pub trait CausalLm: Send {
    /// Logits shaped `(batch, seq, vocab)` for `input_ids` shaped `(batch, seq)`.
    fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
    ) -> Result<Tensor, TrainingError>;

    /// Trainable parameters in a stable order.
    fn parameters(&self) -> Vec<(String, Var)>;

    fn modules(&self) -> Vec<ModuleInfo>;

    fn device(&self) -> &Device;

    /// Toggles train-only behaviour such as dropout.
    fn set_training(&self, training: bool);

    fn is_training(&self) -> bool;

    /// Casts activations to `dtype` during forward; `None` restores the parameter dtype.
    fn set_compute_dtype(&mut self, dtype: Option<DType>) -> Result<(), TrainingError>;

    /// Whether blocks of type `block_type` can recompute activations in backward.
    fn supports_activation_recompute(&self, _block_type: &str) -> bool {
        false
    }

    fn enable_activation_recompute(&mut self, block_type: &str) -> Result<(), TrainingError> {
        Err(TrainingError::not_implemented(format!(
            "activation recomputation for {block_type}"
        )))
    }
}

impl CausalLm for Model {
    fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
    ) -> Result<Tensor, TrainingError> {
        Ok(Model::forward(self, input_ids, attention_mask)?)
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        Model::parameters(self)
    }

    fn modules(&self) -> Vec<ModuleInfo> {
        Model::modules(self)
    }

    fn device(&self) -> &Device {
        Model::device(self)
    }

    fn set_training(&self, training: bool) {
        Model::set_training(self, training)
    }

    fn is_training(&self) -> bool {
        Model::is_training(self)
    }

    fn set_compute_dtype(&mut self, dtype: Option<DType>) -> Result<(), TrainingError> {
        Ok(Model::set_compute_dtype(self, dtype)?)
    }
}
