use candle_core::{DType, Device, Error, Result};

/// High-level configuration for assembling the decoder-only policy model.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub hidden_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub max_positions: usize,
    pub ff_ratio: f32,
    pub dtype: DType,
    pub device: Device,
    pub dropout_p: Option<f32>,
    /// Seed for parameter initialisation; identical seeds yield identical weights.
    pub seed: u64,
}

impl ModelConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_dim / self.n_heads.max(1)
    }

    pub fn ff_dim(&self) -> usize {
        ((self.hidden_dim as f32) * self.ff_ratio).round() as usize
    }

    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(Error::Msg("vocab_size must be greater than zero".into()));
        }
        if self.hidden_dim == 0 {
            return Err(Error::Msg("hidden_dim must be greater than zero".into()));
        }
        if self.n_layers == 0 {
            return Err(Error::Msg("n_layers must be greater than zero".into()));
        }
        if self.n_heads == 0 {
            return Err(Error::Msg("n_heads must be greater than zero".into()));
        }
        if self.hidden_dim % self.n_heads != 0 {
            return Err(Error::Msg(format!(
                "hidden_dim ({}) must be divisible by n_heads ({})",
                self.hidden_dim, self.n_heads
            )));
        }
        if self.max_positions == 0 {
            return Err(Error::Msg("max_positions must be greater than zero".into()));
        }
        if self.ff_ratio <= 0.0 || self.ff_dim() == 0 {
            return Err(Error::Msg("ff_ratio must be positive".into()));
        }
        if !self.dtype.is_float() {
            return Err(Error::Msg(format!(
                "parameter dtype must be floating point (got {:?})",
                self.dtype
            )));
        }
        if let Some(p) = self.dropout_p {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::Msg("dropout_p must be in [0, 1)".into()));
            }
        }
        Ok(())
    }
}
