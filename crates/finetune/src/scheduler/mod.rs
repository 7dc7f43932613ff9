use serde::{Deserialize, Serialize};

use crate::TrainingError;

pub trait LRScheduler: Send {
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
    fn state(&self) -> SchedulerState;
    fn load_state(&mut self, state: SchedulerState) -> Result<(), TrainingError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub step: usize,
    pub base_lr: f64,
    pub last_lr: f64,
}

/// Linear warmup to the base rate, constant afterwards.
///
/// The rate at step `s` is `base_lr * min(1, (s + 1) / (warmup_steps + 1))`,
/// and the first rate is in effect before any call to `step`.
#[derive(Debug, Clone)]
pub struct WarmupScheduler {
    base_lr: f64,
    warmup_steps: usize,
    step: usize,
    current_lr: f64,
}

impl WarmupScheduler {
    pub fn new(base_lr: f64, warmup_steps: usize) -> Result<Self, TrainingError> {
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        Ok(Self {
            base_lr,
            warmup_steps,
            step: 0,
            current_lr: base_lr * warmup_factor(0, warmup_steps),
        })
    }
}

impl LRScheduler for WarmupScheduler {
    fn step(&mut self) -> f64 {
        self.step = self.step.saturating_add(1);
        self.current_lr = self.base_lr * warmup_factor(self.step, self.warmup_steps);
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }

    fn state(&self) -> SchedulerState {
        SchedulerState {
            step: self.step,
            base_lr: self.base_lr,
            last_lr: self.current_lr,
        }
    }

    fn load_state(&mut self, state: SchedulerState) -> Result<(), TrainingError> {
        if state.base_lr <= 0.0 {
            return Err(TrainingError::runtime(
                "scheduler state has a non-positive base learning rate",
            ));
        }
        self.base_lr = state.base_lr;
        self.step = state.step;
        self.current_lr = self.base_lr * warmup_factor(self.step, self.warmup_steps);
        Ok(())
    }
}

fn warmup_factor(step: usize, warmup_steps: usize) -> f64 {
    ((step + 1) as f64 / (warmup_steps + 1) as f64).min(1.0)
}
