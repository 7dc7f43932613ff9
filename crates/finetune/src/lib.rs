pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distributed;
pub mod error;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod policy;
pub mod sampling;
pub mod scheduler;
pub mod strategy;
pub mod trainer;

pub use batch::{Batch, BatchField, IGNORE_INDEX};
pub use config::{LossConfig, OptimizerKind, TrainerKind, TrainingConfig, TrainingError};
pub use data::{BatchIteratorRequest, BatchSource, JsonlPreferenceSource, TextTokenizer};
pub use distributed::{Collective, LocalGroup, ProcessContext, SoloGroup};
pub use loss::{batch_logps, batch_metrics, LossOutput, Split};
pub use metrics::MetricMap;
pub use optimizer::{OptimizerConfig, OptimizerState, TrainerOptimizer};
pub use policy::CausalLm;
pub use scheduler::{LRScheduler, SchedulerState, WarmupScheduler};
pub use strategy::{ActivationCheckpointing, ShardingStrategy};
pub use trainer::{Trainer, TrainerPhase};
