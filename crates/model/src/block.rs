use std::fmt;

use candle_core::{DType, Device, Result, Tensor, Var, D};
use rand::{rngs::StdRng, Rng};

use crate::config::ModelConfig;

const RMS_EPS: f64 = 1e-6;

/// Xavier-uniform initialised matrix stored as a trainable variable.
pub(crate) fn init_matrix(
    rng: &mut StdRng,
    rows: usize,
    cols: usize,
    dtype: DType,
    device: &Device,
) -> Result<Var> {
    let bound = (6.0 / (rows + cols) as f64).sqrt() as f32;
    let data: Vec<f32> = (0..rows * cols)
        .map(|_| rng.gen_range(-bound..bound))
        .collect();
    let tensor = Tensor::from_vec(data, (rows, cols), device)?.to_dtype(dtype)?;
    Var::from_tensor(&tensor)
}

pub(crate) fn ones_vector(len: usize, dtype: DType, device: &Device) -> Result<Var> {
    Var::from_tensor(&Tensor::ones(len, dtype, device)?)
}

/// Casts a parameter into the active compute dtype, leaving it untouched when equal.
pub(crate) fn cast(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}

/// Batched matrix product. The CPU backend has no half-precision gemm, so there
/// the product is taken in f32 and cast back to the operands' dtype.
pub(crate) fn matmul(lhs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
    let dtype = lhs.dtype();
    if lhs.device().is_cpu() && matches!(dtype, DType::BF16 | DType::F16) {
        return lhs
            .to_dtype(DType::F32)?
            .broadcast_matmul(&rhs.to_dtype(DType::F32)?)?
            .to_dtype(dtype);
    }
    lhs.broadcast_matmul(rhs)
}

/// Projection `x @ w^T` for `x` shaped `[batch, seq, in]` and `w` shaped `[out, in]`.
pub(crate) fn project(xs: &Tensor, weight: &Var, dtype: DType) -> Result<Tensor> {
    let w = cast(weight.as_tensor(), dtype)?;
    matmul(xs, &w.t()?)
}

/// Root-mean-square normalisation, computed in f32 and cast back to `dtype`.
pub(crate) fn rms_norm(xs: &Tensor, weight: &Var, dtype: DType) -> Result<Tensor> {
    let xs32 = xs.to_dtype(DType::F32)?;
    let mean_sq = xs32.sqr()?.mean_keepdim(D::Minus1)?;
    let normed = xs32.broadcast_div(&(mean_sq + RMS_EPS)?.sqrt()?)?;
    normed
        .to_dtype(dtype)?
        .broadcast_mul(&cast(weight.as_tensor(), dtype)?)
}

/// Pre-norm decoder block: causal self-attention followed by a SiLU MLP, each residual.
pub struct DecoderBlock {
    prefix: String,
    hidden_dim: usize,
    heads: usize,
    head_dim: usize,
    dropout_p: Option<f32>,
    attn_norm: Var,
    qkv: Var,
    out: Var,
    mlp_norm: Var,
    up: Var,
    down: Var,
}

impl fmt::Debug for DecoderBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderBlock")
            .field("prefix", &self.prefix)
            .field("hidden_dim", &self.hidden_dim)
            .field("heads", &self.heads)
            .field("head_dim", &self.head_dim)
            .finish()
    }
}

impl DecoderBlock {
    pub const TYPE_NAME: &'static str = "DecoderBlock";

    pub fn new(index: usize, config: &ModelConfig, rng: &mut StdRng) -> Result<Self> {
        let hidden = config.hidden_dim;
        let ff = config.ff_dim();
        let dtype = config.dtype;
        let device = &config.device;
        Ok(Self {
            prefix: format!("blocks.{index}"),
            hidden_dim: hidden,
            heads: config.n_heads,
            head_dim: config.head_dim(),
            dropout_p: config.dropout_p,
            attn_norm: ones_vector(hidden, dtype, device)?,
            qkv: init_matrix(rng, 3 * hidden, hidden, dtype, device)?,
            out: init_matrix(rng, hidden, hidden, dtype, device)?,
            mlp_norm: ones_vector(hidden, dtype, device)?,
            up: init_matrix(rng, ff, hidden, dtype, device)?,
            down: init_matrix(rng, hidden, ff, dtype, device)?,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn parameters(&self) -> Vec<(String, Var)> {
        let p = &self.prefix;
        vec![
            (format!("{p}.attn_norm.weight"), self.attn_norm.clone()),
            (format!("{p}.attn.qkv.weight"), self.qkv.clone()),
            (format!("{p}.attn.out.weight"), self.out.clone()),
            (format!("{p}.mlp_norm.weight"), self.mlp_norm.clone()),
            (format!("{p}.mlp.up.weight"), self.up.clone()),
            (format!("{p}.mlp.down.weight"), self.down.clone()),
        ]
    }

    fn split_heads(&self, xs: &Tensor, batch: usize, seq: usize) -> Result<Tensor> {
        xs.reshape((batch, seq, self.heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn attention(&self, xs: &Tensor, bias: &Tensor, dtype: DType) -> Result<Tensor> {
        let (batch, seq, _) = xs.dims3()?;
        let qkv = project(xs, &self.qkv, dtype)?;
        let q = self.split_heads(&qkv.narrow(2, 0, self.hidden_dim)?, batch, seq)?;
        let k = self.split_heads(
            &qkv.narrow(2, self.hidden_dim, self.hidden_dim)?,
            batch,
            seq,
        )?;
        let v = self.split_heads(
            &qkv.narrow(2, 2 * self.hidden_dim, self.hidden_dim)?,
            batch,
            seq,
        )?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = matmul(&q, &k.t()?.contiguous()?)?
            .affine(scale, 0.0)?
            .broadcast_add(&cast(bias, dtype)?)?;
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;
        let context = matmul(&probs, &v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq, self.hidden_dim))?;
        project(&context, &self.out, dtype)
    }

    fn dropout(&self, xs: Tensor, training: bool) -> Result<Tensor> {
        match self.dropout_p {
            Some(p) if training && p > 0.0 => candle_nn::ops::dropout(&xs, p),
            _ => Ok(xs),
        }
    }

    /// Forward pass; `bias` is the additive attention mask shaped `[batch, 1, seq, seq]`.
    pub fn forward(
        &self,
        hidden: &Tensor,
        bias: &Tensor,
        dtype: DType,
        training: bool,
    ) -> Result<Tensor> {
        let normed = rms_norm(hidden, &self.attn_norm, dtype)?;
        let attn = self.dropout(self.attention(&normed, bias, dtype)?, training)?;
        let hidden = (hidden + attn)?;

        let normed = rms_norm(&hidden, &self.mlp_norm, dtype)?;
        let up = candle_nn::ops::silu(&project(&normed, &self.up, dtype)?)?;
        let mlp = self.dropout(project(&up, &self.down, dtype)?, training)?;
        hidden + mlp
    }
}
