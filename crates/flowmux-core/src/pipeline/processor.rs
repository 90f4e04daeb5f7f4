//! Processor trait.

use crate::error::Result;
use crate::message::Batch;

/// A single step in a pipeline's processor chain.
///
/// A processor reads one batch and emits any number of batches: none to
/// filter the transaction out entirely, one to map it, several to split it.
/// Returning an error keeps the input batch flowing with per-message error
/// flags set; the engine never drops data because a processor failed.
///
/// Implementations are expected to return promptly; a processor invocation
/// is the longest CPU-bound section the engine schedules.
pub trait Processor: Send + Sync {
    /// Process one batch.
    fn process(&self, batch: &Batch) -> Result<Vec<Batch>>;
}
