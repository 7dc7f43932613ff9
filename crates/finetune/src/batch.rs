use std::collections::BTreeMap;

use candle_core::{Device, Tensor};

use crate::TrainingError;

/// Label value marking positions excluded from the log-probability.
pub const IGNORE_INDEX: i64 = -100;

/// One named column of a batch.
#[derive(Debug, Clone)]
pub enum BatchField {
    /// `[rows, seq]` integer tensor: input ids, attention masks or labels.
    Tokens(Tensor),
    /// Untokenized text, one entry per row.
    Text(Vec<String>),
}

impl BatchField {
    pub fn rows(&self) -> Result<usize, TrainingError> {
        match self {
            BatchField::Tokens(tensor) => Ok(tensor.dims().first().copied().unwrap_or(0)),
            BatchField::Text(values) => Ok(values.len()),
        }
    }

    fn narrow(&self, start: usize, len: usize) -> Result<BatchField, TrainingError> {
        match self {
            BatchField::Tokens(tensor) => Ok(BatchField::Tokens(tensor.narrow(0, start, len)?)),
            BatchField::Text(values) => {
                Ok(BatchField::Text(values[start..start + len].to_vec()))
            }
        }
    }
}

/// Tokenized, padded examples keyed by field name (`chosen_input_ids`, `prompt`, ...).
///
/// Batches are never mutated after creation; slicing produces a new batch.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    fields: BTreeMap<String, BatchField>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, field: BatchField) {
        self.fields.insert(name.into(), field);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn field(&self, name: &str) -> Result<&BatchField, TrainingError> {
        self.fields
            .get(name)
            .ok_or_else(|| TrainingError::runtime(format!("batch is missing field '{name}'")))
    }

    pub fn tokens(&self, name: &str) -> Result<&Tensor, TrainingError> {
        match self.field(name)? {
            BatchField::Tokens(tensor) => Ok(tensor),
            BatchField::Text(_) => Err(TrainingError::runtime(format!(
                "batch field '{name}' holds text, expected tokens"
            ))),
        }
    }

    pub fn text(&self, name: &str) -> Result<&[String], TrainingError> {
        match self.field(name)? {
            BatchField::Text(values) => Ok(values),
            BatchField::Tokens(_) => Err(TrainingError::runtime(format!(
                "batch field '{name}' holds tokens, expected text"
            ))),
        }
    }

    /// Row count shared by every field.
    pub fn len(&self) -> Result<usize, TrainingError> {
        let mut rows = None;
        for (name, field) in &self.fields {
            let field_rows = field.rows()?;
            match rows {
                None => rows = Some(field_rows),
                Some(expected) if expected != field_rows => {
                    return Err(TrainingError::runtime(format!(
                        "batch field '{name}' has {field_rows} rows, expected {expected}"
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(rows.unwrap_or(0))
    }

    pub fn is_empty(&self) -> Result<bool, TrainingError> {
        Ok(self.len()? == 0)
    }

    /// Rows `[index * chunk, (index + 1) * chunk)` with `chunk = len / parts`.
    ///
    /// Pure: the same `(index, parts)` always yields the same rows, and the
    /// slices for `0..parts` are disjoint, equally sized and order preserving.
    /// Trailing rows beyond `parts * chunk` belong to no slice.
    pub fn slice(&self, index: usize, parts: usize) -> Result<Batch, TrainingError> {
        if parts == 0 {
            return Err(TrainingError::runtime("cannot slice a batch into zero parts"));
        }
        if index >= parts {
            return Err(TrainingError::runtime(format!(
                "slice index {index} out of range for {parts} parts"
            )));
        }
        let chunk = self.len()? / parts;
        let start = index * chunk;
        let mut fields = BTreeMap::new();
        for (name, field) in &self.fields {
            fields.insert(name.clone(), field.narrow(start, chunk)?);
        }
        Ok(Batch { fields })
    }

    pub fn to_device(&self, device: &Device) -> Result<Batch, TrainingError> {
        let mut fields = BTreeMap::new();
        for (name, field) in &self.fields {
            let moved = match field {
                BatchField::Tokens(tensor) => BatchField::Tokens(tensor.to_device(device)?),
                BatchField::Text(values) => BatchField::Text(values.clone()),
            };
            fields.insert(name.clone(), moved);
        }
        Ok(Batch { fields })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered_batch(rows: usize) -> Batch {
        let ids: Vec<i64> = (0..rows as i64 * 2).collect();
        let mut batch = Batch::new();
        batch.insert(
            "chosen_input_ids",
            BatchField::Tokens(Tensor::from_vec(ids, (rows, 2), &Device::Cpu).unwrap()),
        );
        batch.insert(
            "prompt",
            BatchField::Text((0..rows).map(|i| format!("prompt {i}")).collect()),
        );
        batch
    }

    fn first_column(batch: &Batch) -> Vec<i64> {
        batch
            .tokens("chosen_input_ids")
            .unwrap()
            .to_vec2::<i64>()
            .unwrap()
            .into_iter()
            .map(|row| row[0] / 2)
            .collect()
    }

    #[test]
    fn slicing_is_pure() {
        let batch = numbered_batch(8);
        let first = batch.slice(1, 4).unwrap();
        let again = batch.slice(1, 4).unwrap();

        assert_eq!(first_column(&first), vec![2, 3]);
        assert_eq!(first_column(&first), first_column(&again));
        assert_eq!(first_column(&batch), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn accumulation_then_rank_slices_partition_the_batch() {
        let batch = numbered_batch(32);
        let accumulation_steps = 2;
        let world_size = 4;

        let mut seen = Vec::new();
        for micro in 0..accumulation_steps {
            let global = batch.slice(micro, accumulation_steps).unwrap();
            for rank in 0..world_size {
                let local = global.slice(rank, world_size).unwrap();
                assert_eq!(local.len().unwrap(), 4);
                assert_eq!(local.text("prompt").unwrap().len(), 4);
                seen.extend(first_column(&local));
            }
        }
        assert_eq!(seen, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn slice_rejects_out_of_range_index() {
        let batch = numbered_batch(4);
        assert!(batch.slice(2, 2).is_err());
        assert!(batch.slice(0, 0).is_err());
    }

    #[test]
    fn mismatched_rows_are_reported() {
        let mut batch = numbered_batch(4);
        batch.insert("prompt", BatchField::Text(vec!["only one".into()]));
        assert!(batch.len().is_err());
    }
}
