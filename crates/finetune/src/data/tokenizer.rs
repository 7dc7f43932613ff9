use std::{path::Path, sync::Arc};

use tokenizers::Tokenizer;

use crate::TrainingError;

const EOS_CANDIDATES: [&str; 4] = ["</s>", "<|endoftext|>", "<eos>", "[SEP]"];

/// Shared tokenizer with resolved end-of-sequence and padding ids.
#[derive(Clone)]
pub struct TextTokenizer {
    inner: Arc<Tokenizer>,
    eos_id: u32,
    pad_id: u32,
}

impl TextTokenizer {
    pub fn from_file(path: &Path) -> Result<Self, TrainingError> {
        let tokenizer = Tokenizer::from_file(path).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to load tokenizer {}: {err}",
                path.display()
            ))
        })?;
        Self::new(tokenizer)
    }

    /// Pads with the configured padding id, or with EOS when none is configured.
    pub fn new(tokenizer: Tokenizer) -> Result<Self, TrainingError> {
        let eos_id = EOS_CANDIDATES
            .iter()
            .find_map(|token| tokenizer.token_to_id(token))
            .ok_or_else(|| {
                TrainingError::initialization(format!(
                    "tokenizer defines none of the end-of-sequence tokens {:?}",
                    EOS_CANDIDATES
                ))
            })?;
        let pad_id = tokenizer
            .get_padding()
            .map(|params| params.pad_id)
            .unwrap_or(eos_id);
        Ok(Self {
            inner: Arc::new(tokenizer),
            eos_id,
            pad_id,
        })
    }

    pub fn eos_id(&self) -> u32 {
        self.eos_id
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    /// Token ids without added special tokens.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>, TrainingError> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|err| TrainingError::runtime(format!("tokenization failed: {err}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, TrainingError> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|err| TrainingError::runtime(format!("detokenization failed: {err}")))
    }
}
