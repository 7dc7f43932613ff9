use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Barrier,
};

use parking_lot::Mutex;

use super::{Collective, Payload};
use crate::TrainingError;

/// Group of one: gathers return the caller's payload, barriers return immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoloGroup;

impl Collective for SoloGroup {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_gather(&self, payload: Payload) -> Result<Vec<Payload>, TrainingError> {
        Ok(vec![payload])
    }

    fn barrier(&self) -> Result<(), TrainingError> {
        Ok(())
    }

    fn finalize(&self) -> Result<(), TrainingError> {
        Ok(())
    }
}

struct SharedState {
    world_size: usize,
    barrier: Barrier,
    slots: Mutex<Vec<Option<Payload>>>,
}

/// In-process worker group; each member is driven by its own thread.
pub struct LocalGroup {
    rank: usize,
    shared: Arc<SharedState>,
    finalized: AtomicBool,
}

impl LocalGroup {
    /// Creates `world_size` members ordered by rank.
    pub fn create(world_size: usize) -> Result<Vec<LocalGroup>, TrainingError> {
        if world_size == 0 {
            return Err(TrainingError::initialization(
                "process group requires at least one worker",
            ));
        }
        let shared = Arc::new(SharedState {
            world_size,
            barrier: Barrier::new(world_size),
            slots: Mutex::new(vec![None; world_size]),
        });
        Ok((0..world_size)
            .map(|rank| LocalGroup {
                rank,
                shared: Arc::clone(&shared),
                finalized: AtomicBool::new(false),
            })
            .collect())
    }

    fn ensure_open(&self) -> Result<(), TrainingError> {
        if self.finalized.load(Ordering::Acquire) {
            return Err(TrainingError::distributed(format!(
                "rank {} used the process group after finalize",
                self.rank
            )));
        }
        Ok(())
    }
}

impl Collective for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn all_gather(&self, payload: Payload) -> Result<Vec<Payload>, TrainingError> {
        self.ensure_open()?;
        self.shared.slots.lock()[self.rank] = Some(payload);
        self.shared.barrier.wait();
        let gathered: Option<Vec<Payload>> = self.shared.slots.lock().iter().cloned().collect();
        // Nobody may overwrite a slot until every worker has read the round.
        self.shared.barrier.wait();
        gathered.ok_or_else(|| {
            TrainingError::distributed(format!("rank {} observed an empty gather slot", self.rank))
        })
    }

    fn barrier(&self) -> Result<(), TrainingError> {
        self.ensure_open()?;
        self.shared.barrier.wait();
        Ok(())
    }

    fn finalize(&self) -> Result<(), TrainingError> {
        self.barrier()?;
        self.finalized.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::distributed::ProcessContext;

    #[test]
    fn gather_orders_by_rank() {
        let members = LocalGroup::create(3).unwrap();
        let handles: Vec<_> = members
            .into_iter()
            .map(|member| {
                thread::spawn(move || {
                    let ctx = ProcessContext::new(Arc::new(member), 0);
                    let rank = ctx.rank() as f32;
                    let first = ctx.all_gather_f32(vec![rank, rank * 10.0]).unwrap();
                    let second = ctx.all_gather_i64(vec![ctx.rank() as i64]).unwrap();
                    ctx.finalize().unwrap();
                    (first, second)
                })
            })
            .collect();

        for handle in handles {
            let (first, second) = handle.join().unwrap();
            assert_eq!(
                first,
                vec![vec![0.0, 0.0], vec![1.0, 10.0], vec![2.0, 20.0]]
            );
            assert_eq!(second, vec![vec![0], vec![1], vec![2]]);
        }
    }

    #[test]
    fn all_reduce_sums_contributions() {
        let members = LocalGroup::create(2).unwrap();
        let handles: Vec<_> = members
            .into_iter()
            .map(|member| {
                thread::spawn(move || {
                    let ctx = ProcessContext::new(Arc::new(member), 0);
                    let base = ctx.rank() as f32 + 1.0;
                    ctx.all_reduce_sum_f32(vec![base, base * 2.0]).unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), vec![3.0, 6.0]);
        }
    }

    #[test]
    fn root_gather_only_reaches_coordinator() {
        let members = LocalGroup::create(2).unwrap();
        let handles: Vec<_> = members
            .into_iter()
            .map(|member| {
                thread::spawn(move || {
                    let ctx = ProcessContext::new(Arc::new(member), 0);
                    let gathered = ctx.gather_bytes_to_root(vec![ctx.rank() as u8]).unwrap();
                    (ctx.rank(), gathered)
                })
            })
            .collect();
        for handle in handles {
            match handle.join().unwrap() {
                (0, gathered) => assert_eq!(gathered, Some(vec![vec![0u8], vec![1u8]])),
                (_, gathered) => assert!(gathered.is_none()),
            }
        }
    }

    #[test]
    fn finalized_member_rejects_collectives() {
        let member = LocalGroup::create(1).unwrap().remove(0);
        member.finalize().unwrap();
        assert!(member.barrier().is_err());
    }
}
