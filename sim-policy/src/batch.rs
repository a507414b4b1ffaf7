use sim_queue::RunningBatch;
use sim_types::{Request, RequestId};

use crate::errors::PolicyError;

/// Governs batch assembly: how many prefill tokens to admit per step, how
/// many requests may co-batch, and which running request yields its slot
/// under KV pressure. The instance step engine owns mechanics (actual KV
/// allocation, unwinding); these policies only choose parameters.
pub trait BatchFormation {
    /// Chunk size of `req`'s remaining prefill tokens to attempt this
    /// step, capped by `max_chunk` (the engine's per-step token budget).
    fn prefill_chunk_size(&self, req: &Request, max_chunk: usize) -> usize;

    /// Whether a new request may join the running batch this step, given
    /// its current occupancy against `max_batch_size`.
    fn admit_into_batch(&self, current_batch_size: usize, max_batch_size: usize) -> bool;

    /// Picks the running request to preempt when KV allocation for a new
    /// or resumed request fails. `None` means no eligible victim (the
    /// caller then drops the incoming request as unservable instead).
    fn select_preemption_victim(&self, running: &RunningBatch) -> Option<RequestId>;
}

/// Always takes the full chunk, admits up to the batch limit, and
/// preempts whichever running request has made the least decode
/// progress (cheapest to restart), ties broken by request id.
pub struct DefaultBatchFormation;

impl BatchFormation for DefaultBatchFormation {
    fn prefill_chunk_size(&self, req: &Request, max_chunk: usize) -> usize {
        (req.input_tokens.len() - req.prefill_progress).min(max_chunk)
    }

    fn admit_into_batch(&self, current_batch_size: usize, max_batch_size: usize) -> bool {
        current_batch_size < max_batch_size
    }

    fn select_preemption_victim(&self, running: &RunningBatch) -> Option<RequestId> {
        running
            .iter()
            .min_by(|a, b| {
                a.decode_progress
                    .cmp(&b.decode_progress)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|r| r.id.clone())
    }
}

/// Shrinks prefill chunks once the batch is more than half full, leaving
/// headroom for decode steps of already-running requests, and preempts by
/// `req.priority` rather than by decode progress — the "lowest-priority
/// running request" variant named alongside the tail/progress-based
/// default. `PriorityPolicy`'s convention is "lower value = more urgent",
/// so the least-important (most preemptable) running request is the one
/// with the *highest* numeric priority, not the lowest.
pub struct SloAwareBatchFormation {
    protected_classes: Vec<String>,
}

impl SloAwareBatchFormation {
    pub fn new(protected_classes: Vec<String>) -> Self {
        Self { protected_classes }
    }

    fn least_important<'a>(
        &self,
        candidates: impl Iterator<Item = &'a Request>,
    ) -> Option<RequestId> {
        candidates
            .max_by(|a, b| {
                a.priority
                    .partial_cmp(&b.priority)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|r| r.id.clone())
    }
}

impl BatchFormation for SloAwareBatchFormation {
    fn prefill_chunk_size(&self, req: &Request, max_chunk: usize) -> usize {
        let remaining = req.input_tokens.len() - req.prefill_progress;
        remaining.min(max_chunk)
    }

    fn admit_into_batch(&self, current_batch_size: usize, max_batch_size: usize) -> bool {
        current_batch_size < max_batch_size
    }

    fn select_preemption_victim(&self, running: &RunningBatch) -> Option<RequestId> {
        let unprotected = running.iter().filter(|r| !self.protected_classes.contains(&r.slo_class.0));
        self.least_important(unprotected).or_else(|| self.least_important(running.iter()))
    }
}

pub const BATCH_FORMATION_NAMES: &[&str] = &["default", "slo_aware"];

pub fn batch_formation_from_name(
    name: &str,
    protected_classes: Vec<String>,
) -> Result<Box<dyn BatchFormation>, PolicyError> {
    match name {
        "default" => Ok(Box::new(DefaultBatchFormation)),
        "slo_aware" => Ok(Box::new(SloAwareBatchFormation::new(protected_classes))),
        other => Err(PolicyError::UnknownBatchFormation {
            requested: other.to_string(),
            valid: BATCH_FORMATION_NAMES,
        }),
    }
}
