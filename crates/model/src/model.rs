use std::sync::atomic::{AtomicBool, Ordering};

use candle_core::{DType, Device, Error, Result, Tensor, Var};
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    block::{cast, init_matrix, ones_vector, project, rms_norm, DecoderBlock},
    config::ModelConfig,
};

const MASKED_SCORE: f32 = -1e9;

/// Named module of the model, used to resolve wrapping units by type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub path: String,
    pub type_name: &'static str,
    pub parameters: Vec<String>,
}

/// Decoder-only causal language model.
pub struct Model {
    config: ModelConfig,
    embed: Var,
    positions: Var,
    blocks: Vec<DecoderBlock>,
    final_norm: Var,
    lm_head: Var,
    compute_dtype: Option<DType>,
    training: AtomicBool,
}

impl Model {
    /// Builds the model with weights drawn from `config.seed`.
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let dtype = config.dtype;
        let device = config.device.clone();

        let embed = init_matrix(&mut rng, config.vocab_size, config.hidden_dim, dtype, &device)?;
        let positions = init_matrix(
            &mut rng,
            config.max_positions,
            config.hidden_dim,
            dtype,
            &device,
        )?;

        let mut blocks = Vec::with_capacity(config.n_layers);
        for layer in 0..config.n_layers {
            blocks.push(DecoderBlock::new(layer, &config, &mut rng)?);
        }

        let final_norm = ones_vector(config.hidden_dim, dtype, &device)?;
        let lm_head = init_matrix(&mut rng, config.vocab_size, config.hidden_dim, dtype, &device)?;

        Ok(Self {
            config,
            embed,
            positions,
            blocks,
            final_norm,
            lm_head,
            compute_dtype: None,
            training: AtomicBool::new(true),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.config.device
    }

    pub fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    /// Dtype used for activations; parameters keep their storage dtype.
    pub fn compute_dtype(&self) -> DType {
        self.compute_dtype.unwrap_or(self.config.dtype)
    }

    pub fn set_compute_dtype(&mut self, dtype: Option<DType>) -> Result<()> {
        if let Some(dtype) = dtype {
            if !dtype.is_float() {
                return Err(Error::Msg(format!(
                    "compute dtype must be floating point (got {:?})",
                    dtype
                )));
            }
        }
        self.compute_dtype = dtype;
        Ok(())
    }

    /// Parameters in a stable order, named by their module path.
    pub fn parameters(&self) -> Vec<(String, Var)> {
        let mut params = vec![
            ("embed.weight".to_string(), self.embed.clone()),
            ("pos.weight".to_string(), self.positions.clone()),
        ];
        for block in &self.blocks {
            params.extend(block.parameters());
        }
        params.push(("final_norm.weight".to_string(), self.final_norm.clone()));
        params.push(("lm_head.weight".to_string(), self.lm_head.clone()));
        params
    }

    pub fn modules(&self) -> Vec<ModuleInfo> {
        let mut modules = vec![
            ModuleInfo {
                path: "embed".into(),
                type_name: "Embedding",
                parameters: vec!["embed.weight".into()],
            },
            ModuleInfo {
                path: "pos".into(),
                type_name: "Embedding",
                parameters: vec!["pos.weight".into()],
            },
        ];
        for block in &self.blocks {
            modules.push(ModuleInfo {
                path: block.prefix().to_string(),
                type_name: DecoderBlock::TYPE_NAME,
                parameters: block.parameters().into_iter().map(|(name, _)| name).collect(),
            });
        }
        modules.push(ModuleInfo {
            path: "final_norm".into(),
            type_name: "RmsNorm",
            parameters: vec!["final_norm.weight".into()],
        });
        modules.push(ModuleInfo {
            path: "lm_head".into(),
            type_name: "Linear",
            parameters: vec!["lm_head.weight".into()],
        });
        modules
    }

    /// Produces logits shaped `(batch, seq, vocab_size)`.
    ///
    /// `attention_mask` marks real tokens with 1 and padding with 0; padded keys are
    /// excluded from attention.
    pub fn forward(&self, input_ids: &Tensor, attention_mask: Option<&Tensor>) -> Result<Tensor> {
        let (batch, seq) = input_ids.dims2()?;
        if seq == 0 {
            return Err(Error::Msg("sequence length must be non-zero".into()));
        }
        if seq > self.config.max_positions {
            return Err(Error::Msg(format!(
                "sequence length {} exceeds max_positions {}",
                seq, self.config.max_positions
            )));
        }
        let dtype = self.compute_dtype();
        let training = self.is_training();
        let device = &self.config.device;

        let ids = input_ids.to_device(device)?.flatten_all()?;
        let tokens = cast(&self.embed.as_tensor().index_select(&ids, 0)?, dtype)?
            .reshape((batch, seq, self.config.hidden_dim))?;
        let pos = cast(&self.positions.as_tensor().narrow(0, 0, seq)?, dtype)?;
        let mut hidden = tokens.broadcast_add(&pos)?;

        let bias = attention_bias(batch, seq, attention_mask, device)?;
        for block in &self.blocks {
            hidden = block.forward(&hidden, &bias, dtype, training)?;
        }

        let normed = rms_norm(&hidden, &self.final_norm, dtype)?;
        project(&normed, &self.lm_head, dtype)
    }
}

/// Additive mask: causal, padded keys removed, the diagonal always visible.
fn attention_bias(
    batch: usize,
    seq: usize,
    attention_mask: Option<&Tensor>,
    device: &Device,
) -> Result<Tensor> {
    let keys: Vec<Vec<f32>> = match attention_mask {
        Some(mask) => {
            let dims = mask.dims();
            if dims != [batch, seq] {
                return Err(Error::Msg(format!(
                    "attention mask expected [{batch}, {seq}] got {:?}",
                    dims
                )));
            }
            mask.to_dtype(DType::F32)?.to_vec2::<f32>()?
        }
        None => vec![vec![1.0; seq]; batch],
    };

    let mut data = Vec::with_capacity(batch * seq * seq);
    for row in &keys {
        for query in 0..seq {
            for key in 0..seq {
                let visible = key == query || (key < query && row[key] > 0.0);
                data.push(if visible { 0.0 } else { MASKED_SCORE });
            }
        }
    }
    Tensor::from_vec(data, (batch, 1, seq, seq), device)
}
