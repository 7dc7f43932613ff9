//! Process group plumbing: the collective seam, in-process groups and the
//! per-worker context passed explicitly to every component that needs rank
//! information.

pub mod exchange;
pub mod local;

use std::sync::Arc;

use rand::{rngs::StdRng, SeedableRng};

pub use exchange::all_gather_tensor;
pub use local::{LocalGroup, SoloGroup};

use crate::TrainingError;

/// One worker's contribution to a collective.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    F32(Vec<f32>),
    I64(Vec<i64>),
    Bytes(Vec<u8>),
}

impl Payload {
    fn kind(&self) -> &'static str {
        match self {
            Payload::F32(_) => "f32",
            Payload::I64(_) => "i64",
            Payload::Bytes(_) => "bytes",
        }
    }
}

/// Collective operations shared by every worker of a group.
///
/// Every worker must issue the same sequence of calls; a worker that skips one
/// leaves the others blocked.
pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;
    /// Returns every worker's payload ordered by ascending rank.
    fn all_gather(&self, payload: Payload) -> Result<Vec<Payload>, TrainingError>;
    fn barrier(&self) -> Result<(), TrainingError>;
    /// Tears down this worker's membership; no collective may follow.
    fn finalize(&self) -> Result<(), TrainingError> {
        self.barrier()
    }
}

/// Rank, world size, collective handle and seeded randomness for one worker.
pub struct ProcessContext {
    group: Arc<dyn Collective>,
    seed: u64,
    rng: StdRng,
}

impl ProcessContext {
    pub fn new(group: Arc<dyn Collective>, seed: u64) -> Self {
        Self {
            group,
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Single-worker context backed by [`SoloGroup`].
    pub fn solo(seed: u64) -> Self {
        Self::new(Arc::new(SoloGroup), seed)
    }

    pub fn rank(&self) -> usize {
        self.group.rank()
    }

    pub fn world_size(&self) -> usize {
        self.group.world_size()
    }

    pub fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    pub fn barrier(&self) -> Result<(), TrainingError> {
        self.group.barrier()
    }

    pub fn all_gather_f32(&self, values: Vec<f32>) -> Result<Vec<Vec<f32>>, TrainingError> {
        self.group
            .all_gather(Payload::F32(values))?
            .into_iter()
            .map(|payload| match payload {
                Payload::F32(values) => Ok(values),
                other => Err(mismatch("f32", &other)),
            })
            .collect()
    }

    pub fn all_gather_i64(&self, values: Vec<i64>) -> Result<Vec<Vec<i64>>, TrainingError> {
        self.group
            .all_gather(Payload::I64(values))?
            .into_iter()
            .map(|payload| match payload {
                Payload::I64(values) => Ok(values),
                other => Err(mismatch("i64", &other)),
            })
            .collect()
    }

    pub fn all_gather_bytes(&self, bytes: Vec<u8>) -> Result<Vec<Vec<u8>>, TrainingError> {
        self.group
            .all_gather(Payload::Bytes(bytes))?
            .into_iter()
            .map(|payload| match payload {
                Payload::Bytes(bytes) => Ok(bytes),
                other => Err(mismatch("bytes", &other)),
            })
            .collect()
    }

    /// Element-wise sum over all workers.
    pub fn all_reduce_sum_f32(&self, values: Vec<f32>) -> Result<Vec<f32>, TrainingError> {
        let len = values.len();
        let gathered = self.all_gather_f32(values)?;
        let mut total = vec![0.0f32; len];
        for (rank, contribution) in gathered.iter().enumerate() {
            if contribution.len() != len {
                return Err(TrainingError::distributed(format!(
                    "all-reduce length mismatch: rank {} sent {} values, expected {}",
                    rank,
                    contribution.len(),
                    len
                )));
            }
            for (acc, value) in total.iter_mut().zip(contribution) {
                *acc += value;
            }
        }
        Ok(total)
    }

    /// Every worker participates; only the coordinator receives the gathered payloads.
    pub fn gather_bytes_to_root(
        &self,
        bytes: Vec<u8>,
    ) -> Result<Option<Vec<Vec<u8>>>, TrainingError> {
        let gathered = self.all_gather_bytes(bytes)?;
        Ok(self.is_coordinator().then_some(gathered))
    }

    /// Ends group membership. Consumes the context so no collective can follow.
    pub fn finalize(self) -> Result<(), TrainingError> {
        self.group.finalize()
    }
}

fn mismatch(expected: &str, got: &Payload) -> TrainingError {
    TrainingError::distributed(format!(
        "collective payload mismatch: expected {expected}, received {}",
        got.kind()
    ))
}

/// `tracing::info!` emitted by the coordinating worker only.
#[macro_export]
macro_rules! rank0_info {
    ($ctx:expr, $($arg:tt)+) => {
        if $ctx.is_coordinator() {
            tracing::info!($($arg)+);
        }
    };
}

/// `tracing::warn!` emitted by the coordinating worker only.
#[macro_export]
macro_rules! rank0_warn {
    ($ctx:expr, $($arg:tt)+) => {
        if $ctx.is_coordinator() {
            tracing::warn!($($arg)+);
        }
    };
}
