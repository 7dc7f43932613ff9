//! Preference-format datasets: one JSON object per line with a `prompt`, a
//! `chosen` response and any number of auxiliary responses.

mod tokenizer;

use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde_json::{Map, Value};

pub use tokenizer::TextTokenizer;

use crate::{
    batch::{Batch, BatchField, IGNORE_INDEX},
    TrainingError,
};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

pub type BatchIter = Box<dyn Iterator<Item = Result<Batch>> + Send>;

/// Parameters of one pass over the datasets.
#[derive(Debug, Clone)]
pub struct BatchIteratorRequest {
    pub names: Vec<PathBuf>,
    pub split: String,
    pub shuffle: bool,
    pub max_length: usize,
    pub max_prompt_length: usize,
    /// Response fields tokenized besides `chosen`.
    pub categories: Vec<String>,
    pub n_epochs: Option<usize>,
    pub n_examples: Option<usize>,
    pub batch_size: usize,
    pub silent: bool,
    pub seed: u64,
}

pub trait BatchSource: Send + Sync {
    fn get_batch_iterator(
        &self,
        request: &BatchIteratorRequest,
        tokenizer: &TextTokenizer,
    ) -> Result<BatchIter>;
}

/// Reads `<dataset>/<split>.jsonl` for every dataset directory in the request.
#[derive(Debug, Default, Clone)]
pub struct JsonlPreferenceSource;

impl BatchSource for JsonlPreferenceSource {
    fn get_batch_iterator(
        &self,
        request: &BatchIteratorRequest,
        tokenizer: &TextTokenizer,
    ) -> Result<BatchIter> {
        if request.batch_size == 0 {
            return Err(TrainingError::initialization("batch_size must be greater than 0"));
        }
        if request.n_epochs.is_none() && request.n_examples.is_none() {
            return Err(TrainingError::initialization(
                "one of n_epochs or n_examples must be set",
            ));
        }

        let mut elements = Vec::new();
        for dataset in &request.names {
            let path = dataset.join(format!("{}.jsonl", request.split));
            let records = read_records(&path)?;
            if !request.silent {
                tracing::info!(
                    dataset = %dataset.display(),
                    split = %request.split,
                    records = records.len(),
                    "loaded dataset split"
                );
            }
            for (line, record) in records {
                let element = TokenizedElement::build(&record, request, tokenizer)
                    .map_err(|err| {
                        TrainingError::runtime(format!("{}:{line}: {err}", path.display()))
                    })?;
                elements.push(element);
            }
        }

        Ok(Box::new(PreferenceBatches {
            elements,
            categories: std::iter::once("chosen".to_string())
                .chain(request.categories.iter().cloned())
                .collect(),
            max_length: request.max_length,
            max_prompt_length: request.max_prompt_length,
            pad_id: i64::from(tokenizer.pad_id()),
            shuffle: request.shuffle,
            batch_size: request.batch_size,
            n_epochs: request.n_epochs,
            n_examples: request.n_examples,
            seed: request.seed,
            epoch: 0,
            order: Vec::new(),
            cursor: 0,
            examples_yielded: 0,
            epoch_yielded: false,
            done: false,
        }))
    }
}

fn read_records(path: &Path) -> Result<Vec<(usize, Map<String, Value>)>> {
    let file = File::open(path).map_err(|err| {
        TrainingError::initialization(format!("failed to open dataset {}: {err}", path.display()))
    })?;
    let mut records = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(&line)?;
        match value {
            Value::Object(map) => records.push((index + 1, map)),
            _ => {
                return Err(TrainingError::runtime(format!(
                    "{}:{}: expected a JSON object",
                    path.display(),
                    index + 1
                )))
            }
        }
    }
    Ok(records)
}

/// Token ids of one example, before padding.
#[derive(Debug, Clone)]
struct TokenizedElement {
    prompt: String,
    chosen: String,
    prompt_ids: Vec<u32>,
    /// `(category, prompt + response ids)` with the prompt length shared by all.
    responses: Vec<(String, Vec<u32>)>,
}

impl TokenizedElement {
    fn build(
        record: &Map<String, Value>,
        request: &BatchIteratorRequest,
        tokenizer: &TextTokenizer,
    ) -> Result<Self> {
        let prompt = text_field(record, "prompt")?;
        let chosen = text_field(record, "chosen")?;

        let mut prompt_ids = tokenizer.encode(&prompt)?;
        if prompt_ids.len() > request.max_prompt_length {
            prompt_ids.drain(..prompt_ids.len() - request.max_prompt_length);
        }
        let response_budget = request.max_length.saturating_sub(prompt_ids.len());

        let mut responses = Vec::with_capacity(request.categories.len() + 1);
        for category in std::iter::once("chosen").chain(request.categories.iter().map(String::as_str))
        {
            let text = if category == "chosen" {
                chosen.clone()
            } else {
                text_field(record, category)?
            };
            let mut ids = tokenizer.encode(&text)?;
            ids.push(tokenizer.eos_id());
            ids.truncate(response_budget);
            let mut sequence = prompt_ids.clone();
            sequence.extend(ids);
            responses.push((category.to_string(), sequence));
        }

        Ok(Self {
            prompt,
            chosen,
            prompt_ids,
            responses,
        })
    }
}

fn text_field(record: &Map<String, Value>, name: &str) -> Result<String> {
    match record.get(name) {
        Some(Value::String(text)) => Ok(text.clone()),
        Some(_) => Err(TrainingError::runtime(format!("field '{name}' is not a string"))),
        None => Err(TrainingError::runtime(format!("missing field '{name}'"))),
    }
}

struct PreferenceBatches {
    elements: Vec<TokenizedElement>,
    categories: Vec<String>,
    max_length: usize,
    max_prompt_length: usize,
    pad_id: i64,
    shuffle: bool,
    batch_size: usize,
    n_epochs: Option<usize>,
    n_examples: Option<usize>,
    seed: u64,
    epoch: usize,
    order: Vec<usize>,
    cursor: usize,
    examples_yielded: usize,
    epoch_yielded: bool,
    done: bool,
}

impl PreferenceBatches {
    fn start_epoch(&mut self) -> bool {
        if let Some(n_epochs) = self.n_epochs {
            if self.n_examples.is_none() && self.epoch >= n_epochs {
                return false;
            }
        }
        self.order = (0..self.elements.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch as u64));
            self.order.shuffle(&mut rng);
        }
        self.cursor = 0;
        self.epoch += 1;
        self.epoch_yielded = false;
        true
    }

    fn next_indices(&mut self) -> Option<Vec<usize>> {
        loop {
            if let Some(limit) = self.n_examples {
                if self.examples_yielded + self.batch_size > limit {
                    return None;
                }
            }
            if self.cursor + self.batch_size <= self.order.len() {
                let indices = self.order[self.cursor..self.cursor + self.batch_size].to_vec();
                self.cursor += self.batch_size;
                self.examples_yielded += self.batch_size;
                self.epoch_yielded = true;
                return Some(indices);
            }
            // An epoch that produced nothing would repeat forever.
            if self.epoch > 0 && !self.epoch_yielded {
                return None;
            }
            if !self.start_epoch() {
                return None;
            }
        }
    }

    fn collate(&self, indices: &[usize]) -> Result<Batch> {
        let rows = indices.len();
        let device = Device::Cpu;
        let mut batch = Batch::new();

        for (slot, category) in self.categories.iter().enumerate() {
            let mut input_ids = Vec::with_capacity(rows * self.max_length);
            let mut attention = Vec::with_capacity(rows * self.max_length);
            let mut labels = Vec::with_capacity(rows * self.max_length);
            for &index in indices {
                let element = &self.elements[index];
                let (_, sequence) = &element.responses[slot];
                let prompt_len = element.prompt_ids.len();
                for position in 0..self.max_length {
                    match sequence.get(position) {
                        Some(&token) => {
                            input_ids.push(i64::from(token));
                            attention.push(1i64);
                            labels.push(if position < prompt_len {
                                IGNORE_INDEX
                            } else {
                                i64::from(token)
                            });
                        }
                        None => {
                            input_ids.push(self.pad_id);
                            attention.push(0);
                            labels.push(IGNORE_INDEX);
                        }
                    }
                }
            }
            let shape = (rows, self.max_length);
            batch.insert(
                format!("{category}_input_ids"),
                BatchField::Tokens(Tensor::from_vec(input_ids, shape, &device)?),
            );
            batch.insert(
                format!("{category}_attention_mask"),
                BatchField::Tokens(Tensor::from_vec(attention, shape, &device)?),
            );
            batch.insert(
                format!("{category}_labels"),
                BatchField::Tokens(Tensor::from_vec(labels, shape, &device)?),
            );
        }

        let mut prompt_ids = Vec::with_capacity(rows * self.max_prompt_length);
        let mut prompt_mask = Vec::with_capacity(rows * self.max_prompt_length);
        for &index in indices {
            let ids = &self.elements[index].prompt_ids;
            let padding = self.max_prompt_length - ids.len();
            prompt_ids.extend(std::iter::repeat(self.pad_id).take(padding));
            prompt_mask.extend(std::iter::repeat(0i64).take(padding));
            prompt_ids.extend(ids.iter().map(|&id| i64::from(id)));
            prompt_mask.extend(std::iter::repeat(1i64).take(ids.len()));
        }
        let shape = (rows, self.max_prompt_length);
        batch.insert(
            "prompt_input_ids",
            BatchField::Tokens(Tensor::from_vec(prompt_ids, shape, &device)?),
        );
        batch.insert(
            "prompt_attention_mask",
            BatchField::Tokens(Tensor::from_vec(prompt_mask, shape, &device)?),
        );

        batch.insert(
            "prompt",
            BatchField::Text(indices.iter().map(|&i| self.elements[i].prompt.clone()).collect()),
        );
        batch.insert(
            "chosen_response_only",
            BatchField::Text(indices.iter().map(|&i| self.elements[i].chosen.clone()).collect()),
        );
        Ok(batch)
    }
}

impl Iterator for PreferenceBatches {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_indices() {
            Some(indices) => Some(self.collate(&indices)),
            None => {
                self.done = true;
                None
            }
        }
    }
}
