//! Workload sources: finite, deterministically generated or trace-file-
//! ingested request streams. `generate` runs exactly once per source and
//! returns the complete ordered sequence — this is a batch generator, not
//! a live stream, matching the simulator's non-real-time nature.

mod distribution;
mod trace;

pub use distribution::{ClampedGaussian, DistributionSource};
pub use trace::TraceFileSource;

use sim_types::Request;
use thiserror::Error;

pub trait WorkloadSource {
    /// Produces the full ordered request stream, sorted by arrival tick
    /// (ties broken by generation order). Called at most once.
    fn generate(&mut self) -> Vec<Request>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkloadError {
    #[error("failed to read trace file: {0}")]
    Io(String),
    #[error("malformed trace file: {0}")]
    MalformedTrace(String),
}
