#![allow(dead_code)]

use std::{fs, path::Path};

use anyhow::Result;
use candle_core::{DType, Device};
use finetune::{TextTokenizer, TrainingConfig};
use model::{Model, ModelConfig};
use serde_json::{json, Map, Value};

const WORDS: [&str; 14] = [
    "what", "is", "the", "sky", "color", "blue", "green", "red", "maybe", "dunno", "it", "a",
    "question", "nice",
];

/// Word-level tokenizer over a small vocabulary with `<unk>` = 0 and `<eos>` = 1.
pub fn write_tokenizer(dir: &Path) -> Result<()> {
    let mut vocab = Map::new();
    vocab.insert("<unk>".into(), 0.into());
    vocab.insert("<eos>".into(), 1.into());
    for (i, word) in WORDS.iter().enumerate() {
        vocab.insert((*word).into(), (i + 2).into());
    }
    let special = |id: u32, content: &str| {
        json!({
            "id": id, "content": content, "single_word": false, "lstrip": false,
            "rstrip": false, "normalized": false, "special": true
        })
    };
    let tokenizer = json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [special(0, "<unk>"), special(1, "<eos>")],
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "<unk>" }
    });
    fs::create_dir_all(dir)?;
    fs::write(dir.join("tokenizer.json"), serde_json::to_vec(&tokenizer)?)?;
    Ok(())
}

pub fn write_dataset(dir: &Path, train_rows: usize, test_rows: usize) -> Result<()> {
    fs::create_dir_all(dir)?;
    for (split, rows) in [("train", train_rows), ("test", test_rows)] {
        let mut out = String::new();
        for i in 0..rows {
            let record = json!({
                "prompt": if i % 3 == 0 { "what is the sky color" } else { "what color is it" },
                "chosen": if i % 2 == 0 { "blue" } else { "it is blue" },
                "rejected": "green",
                "random": format!("{} {}", WORDS[i % WORDS.len()], WORDS[(i + 5) % WORDS.len()]),
                "paraphrase": "the sky is blue",
                "variant": "red",
                "nonresponse": "dunno",
            });
            out.push_str(&record.to_string());
            out.push('\n');
        }
        fs::write(dir.join(format!("{split}.jsonl")), out)?;
    }
    Ok(())
}

/// Tokenizer and dataset under `root`, plus a config pointing at them with `extra` merged on top.
pub fn setup(root: &Path, extra: Value) -> Result<TrainingConfig> {
    let tokenizer_dir = root.join("tokenizer");
    write_tokenizer(&tokenizer_dir)?;
    let data_dir = root.join("data");
    write_dataset(&data_dir, 12, 8)?;

    let mut config = json!({
        "exp_name": "test-run",
        "seed": 3,
        "datasets": [data_dir],
        "model": {
            "tokenizer_name_or_path": tokenizer_dir,
            "hidden_size": 16,
            "num_layers": 2,
            "num_heads": 2,
            "ff_ratio": 2.0
        },
        "batch_size": 4,
        "eval_batch_size": 4,
        "max_length": 12,
        "max_prompt_length": 6,
        "n_examples": 16,
        "n_eval_examples": 8,
        "eval_every": 8,
        "n_eval_model_samples": 4,
        "optimizer": "AdamW",
        "lr": 1e-3,
        "warmup_steps": 2,
        "minimum_log_interval_secs": 0.0,
        "local_dirs": [root.join("runs")]
    });
    merge(&mut config, extra);
    let mut config: TrainingConfig = serde_json::from_value(config)?;
    config.validate()?;
    config.normalize();
    Ok(config)
}

fn merge(base: &mut Value, extra: Value) {
    match (base, extra) {
        (Value::Object(base), Value::Object(extra)) => {
            for (key, value) in extra {
                merge(base.entry(key).or_insert(Value::Null), value);
            }
        }
        (slot, value) => *slot = value,
    }
}

pub fn build_policy(config: &TrainingConfig) -> Result<Model> {
    let tokenizer_path = config
        .model
        .tokenizer_path()
        .ok_or_else(|| anyhow::anyhow!("tokenizer path not configured"))?;
    let vocab_size = TextTokenizer::from_file(&tokenizer_path)?.vocab_size();
    Ok(Model::new(ModelConfig {
        vocab_size,
        hidden_dim: config.model.hidden_size,
        n_layers: config.model.num_layers,
        n_heads: config.model.num_heads,
        max_positions: config.max_length,
        ff_ratio: config.model.ff_ratio,
        dtype: DType::F32,
        device: Device::Cpu,
        dropout_p: None,
        seed: config.seed,
    })?)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
