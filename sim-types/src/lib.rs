//! Core value types shared by every simulator crate: the clock, request
//! identity, and the request entity threaded through the whole pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Simulation time, in microseconds since the run started at zero.
pub type Tick = u64;

/// Monotonic dispatch sequence id used to break (tick, class) ties.
///
/// A plain counter, not an atomic: the whole engine is single-threaded by
/// design (see the concurrency model), so there is never contention.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Seq(pub u64);

#[derive(Default)]
pub struct SequenceCounter(u64);

impl SequenceCounter {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn next(&mut self) -> Seq {
        let s = self.0;
        self.0 += 1;
        Seq(s)
    }
}

/// The cluster's single source of truth for "now". Only the cluster event
/// engine may advance it; everything else only reads it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Clock(Tick);

impl Clock {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn now(&self) -> Tick {
        self.0
    }

    /// Advances the clock. Panics on any attempt to move it backwards,
    /// which would indicate a dispatch-ordering bug.
    pub fn advance_to(&mut self, t: Tick) {
        assert!(
            t >= self.0,
            "clock must not move backwards: now={} target={}",
            self.0,
            t
        );
        self.0 = t;
    }
}

/// Globally unique request identity. A newtype over `String` (not `Uuid`)
/// because the trace-file workload source must be able to carry arbitrary
/// identity strings straight from a CSV column.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Opaque SLO class tag. Defaults to `"default"`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SloClass(pub String);

impl Default for SloClass {
    fn default() -> Self {
        Self("default".to_string())
    }
}

impl fmt::Display for SloClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for one KV block within an instance's pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u32);

/// Deterministic 16-byte content hash of a hierarchical prefix chunk.
///
/// Truncated from a SHA-256 digest; block `k`'s hash folds in block
/// `k - 1`'s hash so that hashing the first `k` tokens of a prompt yields
/// hashes identical to the first `k` hashes obtained from hashing the full
/// prompt (prefix-stability, INV tested in `sim-kv`).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockHash(pub [u8; 16]);

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash(")?;
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

/// Where a request currently sits in its lifecycle. `Preempted` is not a
/// resting state: a preempted request returns to `Queued` within the same
/// step, so only the transient event is observed, never the state (the
/// instance still increments `preemption_count` on the request for
/// metrics purposes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Queued,
    Running,
    Completed,
}

/// Disjoint terminal classification used for end-of-run conservation
/// accounting: every injected request is in exactly one of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinalOutcome {
    Completed,
    StillQueued,
    StillRunning,
    DroppedUnservable,
    RejectedAtAdmission,
}

/// The request entity: value-with-identity, threaded through admission,
/// routing, and the per-instance step engine.
#[derive(Clone, Debug)]
pub struct Request {
    pub id: RequestId,
    pub arrival_tick: Tick,
    pub input_tokens: Vec<u32>,
    pub output_tokens: Vec<u32>,
    pub slo_class: SloClass,
    pub session_tag: String,
    pub tenant_tag: String,

    /// Set by priority policies; read by scheduling policies.
    pub priority: f64,
    pub state: LifecycleState,

    /// Tokens of `input_tokens` ingested so far (chunked prefill progress).
    pub prefill_progress: usize,
    /// Decode tokens emitted so far.
    pub decode_progress: usize,

    /// KV blocks currently held by this request at its instance.
    pub kv_blocks: Vec<BlockId>,
    /// Hierarchical prefix hashes for `input_tokens`, computed once at
    /// enqueue time and reused for every allocation attempt.
    pub prefix_hashes: Vec<BlockHash>,
    /// Number of leading input tokens whose blocks were already resident
    /// (cache hits) at the moment this request's prefix was allocated.
    /// Used to split a prefill chunk into cached vs. cache-miss tokens
    /// for the latency model.
    pub cached_prefix_tokens: usize,

    pub queued_tick: Option<Tick>,
    pub ttft_tick: Option<Tick>,
    pub completion_tick: Option<Tick>,
    pub preemption_count: u32,

    /// Per-request queueing-side latency (the α model's `request_overhead`,
    /// zero for models that don't define one), fixed at first admission
    /// into a running batch and folded into both `ttft_tick` and
    /// `completion_tick` once finalized. Never consumes batch step time:
    /// it is additive to this request's own ticks only, so it never
    /// blocks other co-batched requests.
    pub queueing_overhead: Tick,
}

impl Request {
    pub fn new(
        id: RequestId,
        arrival_tick: Tick,
        input_tokens: Vec<u32>,
        output_tokens: Vec<u32>,
    ) -> Self {
        Self {
            id,
            arrival_tick,
            input_tokens,
            output_tokens,
            slo_class: SloClass::default(),
            session_tag: String::new(),
            tenant_tag: String::new(),
            priority: 0.0,
            state: LifecycleState::Queued,
            prefill_progress: 0,
            decode_progress: 0,
            kv_blocks: Vec::new(),
            prefix_hashes: Vec::new(),
            cached_prefix_tokens: 0,
            queued_tick: None,
            ttft_tick: None,
            completion_tick: None,
            preemption_count: 0,
            queueing_overhead: 0,
        }
    }

    pub fn decode_budget(&self) -> usize {
        self.output_tokens.len()
    }

    pub fn prefill_done(&self) -> bool {
        self.prefill_progress >= self.input_tokens.len()
    }

    pub fn decode_done(&self) -> bool {
        self.decode_progress >= self.decode_budget()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_rejects_backwards_motion() {
        let mut c = Clock::new();
        c.advance_to(10);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut c2 = c;
            c2.advance_to(5);
        }));
        assert!(result.is_err());
    }

    #[test]
    fn sequence_counter_is_monotone() {
        let mut sc = SequenceCounter::new();
        let a = sc.next();
        let b = sc.next();
        assert!(a < b);
    }

    #[test]
    fn request_tracks_progress() {
        let r = Request::new(RequestId::from("r1"), 0, vec![1, 2, 3], vec![9, 9]);
        assert_eq!(r.decode_budget(), 2);
        assert!(!r.prefill_done());
        assert!(!r.decode_done());
    }
}
