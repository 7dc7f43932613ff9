use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

/// Checkpoints are written every this many evaluation intervals.
pub const CHECKPOINT_EVAL_MULTIPLE: usize = 20;

/// Per-example values keyed by metric name (`loss/train`, `logps_eval/chosen`, ...).
///
/// Values are only appended; [`MetricMap::mean`] reduces without touching them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricMap {
    values: BTreeMap<String, Vec<f64>>,
}

impl MetricMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: f64) {
        self.values.entry(name.into()).or_default().push(value);
    }

    pub fn extend_values<I>(&mut self, name: impl Into<String>, values: I)
    where
        I: IntoIterator<Item = f64>,
    {
        self.values.entry(name.into()).or_default().extend(values);
    }

    pub fn merge(&mut self, other: MetricMap) {
        for (name, values) in other.values {
            self.values.entry(name).or_default().extend(values);
        }
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.values.get(name).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Mean per metric; metrics without values are omitted.
    pub fn mean(&self) -> BTreeMap<String, f64> {
        self.values
            .iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(name, values)| {
                let mean = values.iter().sum::<f64>() / values.len() as f64;
                (name.clone(), mean)
            })
            .collect()
    }
}

/// `name=value` pairs in key order, for log lines.
pub fn format_metrics(metrics: &BTreeMap<String, f64>) -> String {
    metrics
        .iter()
        .map(|(name, value)| format!("{name}={value:.5}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Evaluation runs whenever `example_counter` is a multiple of `eval_every`; at
/// zero only when `do_first_eval` is set. A zero interval never triggers.
pub fn should_evaluate(example_counter: usize, eval_every: usize, do_first_eval: bool) -> bool {
    if eval_every == 0 {
        return false;
    }
    example_counter % eval_every == 0 && (example_counter > 0 || do_first_eval)
}

/// Checkpoints follow evaluation every [`CHECKPOINT_EVAL_MULTIPLE`] intervals, never at zero.
pub fn should_checkpoint(example_counter: usize, eval_every: usize) -> bool {
    let interval = eval_every.saturating_mul(CHECKPOINT_EVAL_MULTIPLE);
    interval > 0 && example_counter > 0 && example_counter % interval == 0
}

/// Number of eval batches to sample from, and whether the sample count fell short
/// of one batch (callers warn and use the first batch).
pub fn sample_batch_count(n_eval_model_samples: usize, eval_batch_size: usize) -> (usize, bool) {
    if eval_batch_size == 0 || n_eval_model_samples < eval_batch_size {
        (1, true)
    } else {
        (n_eval_model_samples / eval_batch_size, false)
    }
}

/// Drops log emissions that arrive within `interval` of the previous one.
#[derive(Debug, Clone)]
pub struct LogThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl LogThrottle {
    pub fn new(interval_secs: f64) -> Self {
        Self {
            interval: Duration::from_secs_f64(interval_secs.max(0.0)),
            last: None,
        }
    }

    /// True for the first call and whenever strictly more than the interval elapsed;
    /// a `true` result records `now` as the last emission.
    pub fn should_log(&mut self, now: Instant) -> bool {
        let due = match self.last {
            None => true,
            Some(last) => now.saturating_duration_since(last) > self.interval,
        };
        if due {
            self.last = Some(now);
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_eval_requires_flag() {
        assert!(should_evaluate(0, 64, true));
        assert!(!should_evaluate(0, 64, false));
        assert!(!should_evaluate(32, 64, false));
        assert!(should_evaluate(64, 64, false));
        assert!(should_evaluate(128, 64, true));
    }

    #[test]
    fn zero_interval_never_evaluates_or_checkpoints() {
        assert!(!should_evaluate(0, 0, true));
        assert!(!should_evaluate(10, 0, true));
        assert!(!should_checkpoint(10, 0));
    }

    #[test]
    fn checkpoints_every_twenty_intervals() {
        assert!(!should_checkpoint(0, 8));
        assert!(!should_checkpoint(8, 8));
        assert!(!should_checkpoint(152, 8));
        assert!(should_checkpoint(160, 8));
        assert!(should_checkpoint(320, 8));
    }

    #[test]
    fn small_sample_count_falls_back_to_first_batch() {
        assert_eq!(sample_batch_count(10, 16), (1, true));
    }

    #[test]
    fn sample_count_divides_into_batches() {
        assert_eq!(sample_batch_count(64, 16), (4, false));
        assert_eq!(sample_batch_count(70, 16), (4, false));
    }

    #[test]
    fn mean_does_not_consume_values() {
        let mut metrics = MetricMap::new();
        metrics.extend_values("loss/train", [1.0, 2.0, 3.0]);
        metrics.push("grad_norm", 0.5);

        let mean = metrics.mean();
        assert_eq!(mean["loss/train"], 2.0);
        assert_eq!(mean["grad_norm"], 0.5);
        assert_eq!(metrics.get("loss/train"), Some(&[1.0, 2.0, 3.0][..]));
    }

    #[test]
    fn merge_appends_per_name() {
        let mut a = MetricMap::new();
        a.push("loss/eval", 1.0);
        let mut b = MetricMap::new();
        b.push("loss/eval", 3.0);
        b.push("logps_eval/chosen", -2.0);
        a.merge(b);
        assert_eq!(a.get("loss/eval"), Some(&[1.0, 3.0][..]));
        assert_eq!(a.names().count(), 2);
    }

    #[test]
    fn throttle_skips_until_interval_elapses() {
        let mut throttle = LogThrottle::new(10.0);
        let start = Instant::now();
        assert!(throttle.should_log(start));
        assert!(!throttle.should_log(start + Duration::from_secs(5)));
        assert!(!throttle.should_log(start + Duration::from_secs(10)));
        assert!(throttle.should_log(start + Duration::from_secs(11)));
        assert!(!throttle.should_log(start + Duration::from_secs(12)));
    }
}
