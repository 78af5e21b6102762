//! hpc-regress: declarative regression checks for HPC applications.
//!
//! Checks are described in suite files, resolved against a site
//! configuration (systems, partitions, programming environments), built and
//! run through the site's batch scheduler, and judged by sanity and
//! performance rules over their captured output.

pub mod batch;
pub mod checks;
pub mod commands;
pub mod config;
pub mod errors;
pub mod logging;
pub mod pipeline;
pub mod report;
pub mod time_utils;
pub mod validate;

pub use errors::{FailureKind, PipelineError};
