//! Batch scheduler backends.
//!
//! Each backend writes a job script, submits it, polls its state and can
//! cancel it. Scheduler commands can be swapped for fake executables through
//! `HPC_REGRESS_FAKE_*` environment variables (`QSUB`, `QSTAT`, `QDEL`,
//! `SBATCH`, `SQUEUE`, `SACCT`, `SCANCEL`).

pub mod batch_interface;
pub mod common;
pub mod local_interface;
pub mod pbs_interface;
pub mod slurm_interface;

pub use batch_interface::BatchInterface;
pub use common::{JobInfo, JobRequest, JobStatus};
pub use local_interface::LocalInterface;
pub use pbs_interface::PbsInterface;
pub use slurm_interface::SlurmInterface;

use anyhow::Result;
use std::sync::Arc;

use crate::config::SchedulerKind;

/// Factory function to create a batch interface for a scheduler kind
pub fn create_batch_interface(kind: SchedulerKind) -> Result<Arc<dyn BatchInterface>> {
    match kind {
        SchedulerKind::Pbs => Ok(Arc::new(PbsInterface::new()?)),
        SchedulerKind::Slurm => Ok(Arc::new(SlurmInterface::new()?)),
        SchedulerKind::Local => Ok(Arc::new(LocalInterface::new())),
    }
}
