use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    thread,
};

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};
use clap::Parser;
use finetune::{
    CausalLm, LocalGroup, ProcessContext, TextTokenizer, Trainer, TrainingConfig, TrainingError,
};
use model::{Model, ModelConfig};
use serde_json::{Map, Number, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() {
    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Supervised fine-tuning CLI", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to training config file"
    )]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(
        long,
        default_value_t = 1,
        env = "WORLD_SIZE",
        help = "Number of in-process workers"
    )]
    world_size: usize,

    #[arg(
        long,
        value_name = "PATH",
        help = "Run directory (defaults to <local_dirs[0]>/<exp_name>)"
    )]
    run_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

fn run() -> Result<(), TrainingError> {
    init_tracing();
    let args = Args::parse();

    let mut config = TrainingConfig::from_path(&args.config)?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
        config.validate()?;
        config.normalize();
    }
    if args.world_size == 0 {
        return Err(TrainingError::validation(vec![
            "world size must be greater than 0".to_string(),
        ]));
    }

    let run_dir = args.run_dir.unwrap_or_else(|| config.run_dir());
    fs::create_dir_all(&run_dir)?;
    fs::write(run_dir.join("config.json"), serde_json::to_vec_pretty(&config)?)?;
    tracing::info!(path = %run_dir.display(), "run directory");

    let device = select_device();
    if args.world_size == 1 {
        return worker(ProcessContext::solo(config.seed), &config, &run_dir, &device);
    }

    let groups = LocalGroup::create(args.world_size)?;
    tracing::info!(world_size = args.world_size, "starting workers");
    let results: Vec<Result<(), TrainingError>> = thread::scope(|scope| {
        let handles: Vec<_> = groups
            .into_iter()
            .map(|group| {
                let config = &config;
                let run_dir = &run_dir;
                let device = &device;
                scope.spawn(move || {
                    let ctx = ProcessContext::new(Arc::new(group), config.seed);
                    worker(ctx, config, run_dir, device)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(TrainingError::runtime("worker thread panicked")))
            })
            .collect()
    });
    results.into_iter().collect()
}

/// One worker: build the policy, train, write `LATEST`, leave the group.
fn worker(
    ctx: ProcessContext,
    config: &TrainingConfig,
    run_dir: &Path,
    device: &Device,
) -> Result<(), TrainingError> {
    let tokenizer_path = config.model.tokenizer_path().ok_or_else(|| {
        TrainingError::initialization("model.tokenizer_name_or_path must be set")
    })?;
    let vocab_size = TextTokenizer::from_file(&tokenizer_path)?.vocab_size();

    tracing::info!(rank = ctx.rank(), "building policy");
    let policy = build_model(config, vocab_size, device)?;
    let reference: Option<Box<dyn CausalLm>> = if config.loss.is_preference() {
        tracing::info!(rank = ctx.rank(), "building reference model");
        Some(Box::new(build_model(config, vocab_size, device)?))
    } else {
        None
    };

    let mut trainer = Trainer::new(
        Box::new(policy),
        config.clone(),
        ctx,
        run_dir.to_path_buf(),
        reference,
    )?;
    trainer.train()?;
    trainer.save(None, None)?;
    trainer.finalize()
}

fn build_model(
    config: &TrainingConfig,
    vocab_size: usize,
    device: &Device,
) -> Result<Model, TrainingError> {
    let model_config = ModelConfig {
        vocab_size,
        hidden_dim: config.model.hidden_size,
        n_layers: config.model.num_layers,
        n_heads: config.model.num_heads,
        max_positions: config.max_length,
        ff_ratio: config.model.ff_ratio,
        dtype: config.model.parameter_dtype()?,
        device: device.clone(),
        dropout_p: config.model.dropout,
        seed: config.seed,
    };
    Ok(Model::new(model_config)?)
}

fn select_device() -> Device {
    if metal_is_available() {
        match Device::new_metal(0) {
            Ok(device) => {
                tracing::info!("using Metal GPU #0");
                return device;
            }
            Err(err) => tracing::warn!("failed to initialize metal device, using CPU: {err}"),
        }
    } else if cuda_is_available() {
        match Device::cuda_if_available(0) {
            Ok(device) => {
                tracing::info!("using CUDA GPU #0");
                return device;
            }
            Err(err) => tracing::warn!("cuda initialization failed, using CPU: {err}"),
        }
    }
    tracing::info!("no GPU backend available; using CPU");
    Device::Cpu
}

fn apply_overrides(
    config: TrainingConfig,
    overrides: &[OverrideArg],
) -> Result<TrainingConfig, TrainingError> {
    let mut value = serde_json::to_value(config).map_err(|err| {
        TrainingError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;

    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        let mut segments: Vec<&str> = override_arg.path.split('.').collect();
        // `wandb` is accepted as an alias of the tracking section.
        if segments.first() == Some(&"wandb") {
            segments[0] = "tracking";
        }
        assign_at_path(&mut value, &segments, new_value)?;
    }

    serde_json::from_value(value).map_err(|err| {
        TrainingError::ConfigFormat(format!(
            "failed to deserialize config after overrides: {err}"
        ))
    })
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

fn assign_at_path(
    target: &mut Value,
    segments: &[&str],
    new_value: Value,
) -> Result<(), TrainingError> {
    let Some((first, rest)) = segments.split_first() else {
        *target = new_value;
        return Ok(());
    };
    if first.is_empty() {
        return Err(TrainingError::runtime("override path has an empty segment"));
    }
    if target.is_null() {
        *target = Value::Object(Map::new());
    }
    let map = target.as_object_mut().ok_or_else(|| {
        TrainingError::runtime(format!(
            "override path segment '{first}' points into a non-object value"
        ))
    })?;
    let entry = map.entry(first.to_string()).or_insert(Value::Null);
    assign_at_path(entry, rest, new_value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_values_are_typed() {
        assert_eq!(parse_override_value("true"), Value::Bool(true));
        assert_eq!(parse_override_value("12"), Value::from(12));
        assert_eq!(parse_override_value("0.5"), Value::from(0.5));
        assert_eq!(parse_override_value("FSDPTrainer"), Value::from("FSDPTrainer"));
        assert_eq!(parse_override_value("[1, 2]"), serde_json::json!([1, 2]));
    }

    #[test]
    fn nested_paths_create_objects() {
        let mut value = serde_json::json!({ "model": { "hidden_size": 64 } });
        assign_at_path(&mut value, &["model", "block_name"], Value::from("DecoderBlock"))
            .unwrap();
        assign_at_path(&mut value, &["wandb", "enabled"], Value::Bool(true)).unwrap();
        assert_eq!(value["model"]["block_name"], "DecoderBlock");
        assert_eq!(value["model"]["hidden_size"], 64);
        assert_eq!(value["wandb"]["enabled"], true);
    }

    #[test]
    fn scalar_parents_are_rejected() {
        let mut value = serde_json::json!({ "lr": 0.1 });
        assert!(assign_at_path(&mut value, &["lr", "inner"], Value::Null).is_err());
    }

    #[test]
    fn override_arg_requires_key() {
        assert!("=3".parse::<OverrideArg>().is_err());
        let arg: OverrideArg = "batch_size = 8".parse().unwrap();
        assert_eq!(arg.path, "batch_size");
        assert_eq!(arg.value, "8");
    }
}
