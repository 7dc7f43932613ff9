use std::{
    fs,
    path::{Path, PathBuf},
};

use candle_core::DType;
use serde::{Deserialize, Serialize};

pub use crate::error::TrainingError;

/// Auxiliary response categories scored for monitoring alongside `chosen`.
pub const DEFAULT_AUX_CATEGORIES: [&str; 5] =
    ["rejected", "random", "paraphrase", "variant", "nonresponse"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_exp_name")]
    pub exp_name: String,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub trainer: TrainerKind,
    #[serde(default)]
    pub loss: LossConfig,
    pub datasets: Vec<PathBuf>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_eval_batch_size")]
    pub eval_batch_size: usize,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default = "default_max_prompt_length")]
    pub max_prompt_length: usize,
    #[serde(default)]
    pub n_epochs: Option<usize>,
    #[serde(default)]
    pub n_examples: Option<usize>,
    #[serde(default = "default_n_eval_examples")]
    pub n_eval_examples: Option<usize>,
    #[serde(default = "default_eval_every")]
    pub eval_every: usize,
    #[serde(default = "default_true")]
    pub do_first_eval: bool,
    #[serde(default = "default_true")]
    pub sample_during_eval: bool,
    #[serde(default = "default_n_eval_model_samples")]
    pub n_eval_model_samples: usize,
    #[serde(default = "default_gradient_accumulation_steps")]
    pub gradient_accumulation_steps: usize,
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: f64,
    #[serde(default)]
    pub optimizer: OptimizerKind,
    #[serde(default = "default_lr")]
    pub lr: f64,
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: usize,
    #[serde(default = "default_minimum_log_interval_secs")]
    pub minimum_log_interval_secs: f64,
    #[serde(default)]
    pub activation_checkpointing: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default, alias = "wandb")]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub local_dirs: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub name_or_path: Option<PathBuf>,
    #[serde(default)]
    pub tokenizer_name_or_path: Option<PathBuf>,
    /// Module type used as the sharding unit by the fully sharded trainer.
    #[serde(default)]
    pub block_name: Option<String>,
    #[serde(default)]
    pub fsdp_policy_mp: Option<String>,
    #[serde(default = "default_policy_dtype")]
    pub policy_dtype: String,
    /// `policy.pt` envelope to warm-start the policy from.
    #[serde(default)]
    pub archive: Option<PathBuf>,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,
    #[serde(default = "default_ff_ratio")]
    pub ff_ratio: f32,
    #[serde(default)]
    pub dropout: Option<f32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name_or_path: None,
            tokenizer_name_or_path: None,
            block_name: None,
            fsdp_policy_mp: None,
            policy_dtype: default_policy_dtype(),
            archive: None,
            hidden_size: default_hidden_size(),
            num_layers: default_num_layers(),
            num_heads: default_num_heads(),
            ff_ratio: default_ff_ratio(),
            dropout: None,
        }
    }
}

impl ModelConfig {
    /// Tokenizer file, falling back to `name_or_path` and to `tokenizer.json` inside a directory.
    pub fn tokenizer_path(&self) -> Option<PathBuf> {
        let base = self
            .tokenizer_name_or_path
            .as_ref()
            .or(self.name_or_path.as_ref())?;
        if base.is_dir() {
            Some(base.join("tokenizer.json"))
        } else {
            Some(base.clone())
        }
    }

    pub fn parameter_dtype(&self) -> Result<DType, TrainingError> {
        parse_dtype(&self.policy_dtype)
    }

    pub fn mixed_precision_dtype(&self) -> Result<Option<DType>, TrainingError> {
        self.fsdp_policy_mp.as_deref().map(parse_dtype).transpose()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainerKind {
    #[default]
    BasicTrainer,
    #[serde(rename = "FSDPTrainer")]
    FsdpTrainer,
    TensorParallelTrainer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossConfig {
    #[serde(default = "default_loss_name")]
    pub name: String,
    #[serde(default = "default_beta")]
    pub beta: f64,
    #[serde(default = "default_aux_categories")]
    pub aux_categories: Vec<String>,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            name: default_loss_name(),
            beta: default_beta(),
            aux_categories: default_aux_categories(),
        }
    }
}

impl LossConfig {
    /// Preference objectives need a frozen reference model.
    pub fn is_preference(&self) -> bool {
        matches!(self.name.as_str(), "dpo" | "ipo")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerKind {
    AdamW,
    Adam,
    #[serde(rename = "SGD")]
    Sgd,
    #[default]
    #[serde(rename = "RMSprop")]
    RmsProp,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackingConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Defaults to `<run_dir>/tensorboard` when unset.
    #[serde(default)]
    pub tensorboard_dir: Option<PathBuf>,
    #[serde(default = "default_flush_every")]
    pub flush_every_n: usize,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)
                .map_err(|err| TrainingError::ConfigFormat(err.to_string()))?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;
        config.normalize();

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.datasets.is_empty() {
            errors.push("datasets must not be empty".to_string());
        }

        if self.batch_size == 0 {
            errors.push("batch_size must be greater than 0".to_string());
        }

        if self.eval_batch_size == 0 {
            errors.push("eval_batch_size must be greater than 0".to_string());
        }

        if self.gradient_accumulation_steps == 0 {
            errors.push("gradient_accumulation_steps must be greater than 0".to_string());
        }

        if self.eval_every == 0 {
            errors.push("eval_every must be greater than 0".to_string());
        }

        if self.max_length < 2 {
            errors.push("max_length must be at least 2".to_string());
        }

        if self.max_prompt_length > self.max_length {
            errors.push("max_prompt_length must not exceed max_length".to_string());
        }

        match (self.n_epochs, self.n_examples) {
            (None, None) => {
                errors.push("one of n_epochs or n_examples must be set".to_string());
            }
            (Some(0), _) => errors.push("n_epochs must be greater than 0".to_string()),
            (_, Some(0)) => errors.push("n_examples must be greater than 0".to_string()),
            _ => {}
        }

        if let Some(0) = self.n_eval_examples {
            errors.push("n_eval_examples must be greater than 0".to_string());
        }

        if self.sample_during_eval && self.n_eval_model_samples == 0 {
            errors.push("n_eval_model_samples must be greater than 0".to_string());
        }

        if self.lr <= 0.0 {
            errors.push("lr must be greater than 0".to_string());
        }

        if self.max_grad_norm <= 0.0 {
            errors.push("max_grad_norm must be greater than 0".to_string());
        }

        if self.minimum_log_interval_secs < 0.0 {
            errors.push("minimum_log_interval_secs must be >= 0".to_string());
        }

        if let Err(err) = self.model.parameter_dtype() {
            errors.push(format!("model.policy_dtype: {err}"));
        }

        if let Err(err) = self.model.mixed_precision_dtype() {
            errors.push(format!("model.fsdp_policy_mp: {err}"));
        }

        if self.trainer == TrainerKind::FsdpTrainer && self.model.block_name.is_none() {
            errors.push(
                "must specify model.block_name (e.g. DecoderBlock) for FSDPTrainer".to_string(),
            );
        }

        if let Some(p) = self.model.dropout {
            if !(0.0..1.0).contains(&p) {
                errors.push(format!("model.dropout must be in [0, 1) (got {})", p));
            }
        }

        if self.loss.name.trim().is_empty() {
            errors.push("loss.name must not be empty".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    /// Rounds `eval_every` down to a multiple of `batch_size` so the cadence check can fire.
    pub fn normalize(&mut self) {
        if self.batch_size == 0 || self.eval_every % self.batch_size == 0 {
            return;
        }
        let adjusted = (self.eval_every - self.eval_every % self.batch_size).max(self.batch_size);
        tracing::warn!(
            eval_every = self.eval_every,
            batch_size = self.batch_size,
            adjusted,
            "eval_every is not a multiple of batch_size; adjusting"
        );
        self.eval_every = adjusted;
    }

    /// `<local_dirs[0]>/<exp_name>`, or `runs/<exp_name>` when no local dir is configured.
    pub fn run_dir(&self) -> PathBuf {
        let base = self
            .local_dirs
            .first()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("runs"));
        base.join(&self.exp_name)
    }

    fn apply_base_path(&mut self, base: &Path) {
        for dataset in &mut self.datasets {
            absolutize_in_place(dataset, base);
        }
        for dir in &mut self.local_dirs {
            absolutize_in_place(dir, base);
        }
        for path in [
            &mut self.model.name_or_path,
            &mut self.model.tokenizer_name_or_path,
            &mut self.model.archive,
            &mut self.tracking.tensorboard_dir,
        ]
        .into_iter()
        .flatten()
        {
            absolutize_in_place(path, base);
        }
    }
}

pub fn parse_dtype(name: &str) -> Result<DType, TrainingError> {
    match name.to_ascii_lowercase().as_str() {
        "float32" | "fp32" | "f32" => Ok(DType::F32),
        "bfloat16" | "bf16" => Ok(DType::BF16),
        "float16" | "fp16" | "f16" => Ok(DType::F16),
        other => Err(TrainingError::validation(vec![format!(
            "unsupported dtype '{}'",
            other
        )])),
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_exp_name() -> String {
    "sft".to_string()
}

fn default_batch_size() -> usize {
    64
}

fn default_eval_batch_size() -> usize {
    16
}

fn default_max_length() -> usize {
    512
}

fn default_max_prompt_length() -> usize {
    256
}

fn default_n_eval_examples() -> Option<usize> {
    Some(256)
}

fn default_eval_every() -> usize {
    20_000
}

fn default_true() -> bool {
    true
}

fn default_n_eval_model_samples() -> usize {
    16
}

fn default_gradient_accumulation_steps() -> usize {
    1
}

fn default_max_grad_norm() -> f64 {
    10.0
}

fn default_lr() -> f64 {
    5e-7
}

fn default_warmup_steps() -> usize {
    150
}

fn default_minimum_log_interval_secs() -> f64 {
    1.0
}

fn default_policy_dtype() -> String {
    "float32".to_string()
}

fn default_hidden_size() -> usize {
    64
}

fn default_num_layers() -> usize {
    2
}

fn default_num_heads() -> usize {
    4
}

fn default_ff_ratio() -> f32 {
    4.0
}

fn default_loss_name() -> String {
    "sft".to_string()
}

fn default_beta() -> f64 {
    0.1
}

fn default_aux_categories() -> Vec<String> {
    DEFAULT_AUX_CATEGORIES.iter().map(|s| s.to_string()).collect()
}

fn default_flush_every() -> usize {
    1
}
