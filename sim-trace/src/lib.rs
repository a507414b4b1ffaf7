//! The optional decision trace: per-request admission and routing
//! records, gated by the configured `TraceLevel` so a `None` run pays
//! nothing beyond the `match` on every call site.

use sim_config::TraceLevel;
use sim_policy::Scorer;
use sim_snapshot::RoutingSnapshot;
use sim_types::{Request, RequestId, Tick};

#[derive(Clone, Debug, PartialEq)]
pub struct AdmissionRecord {
    pub clock: Tick,
    pub request_id: RequestId,
    pub admitted: bool,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CounterfactualCandidate {
    pub instance_id: String,
    pub score: f64,
    pub snapshot: RoutingSnapshot,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RoutingRecord {
    pub clock: Tick,
    pub request_id: RequestId,
    pub chosen_instance: String,
    /// Best-first, capped at the configured `k`. Empty unless the trace
    /// level is `DecisionsWithCounterfactuals`.
    pub candidates: Vec<CounterfactualCandidate>,
    pub regret: f64,
}

/// Accumulates admission and routing records for one run. Cheap to
/// construct and drop when `level` is `None`; every `record_*` call is a
/// no-op in that mode.
#[derive(Default)]
pub struct DecisionTrace {
    level: TraceLevelMirror,
    pub admissions: Vec<AdmissionRecord>,
    pub routings: Vec<RoutingRecord>,
}

/// Local copy of `sim_config::TraceLevel`'s shape, since `TraceLevel`
/// itself isn't `Copy` and storing the original would pull `serde`'s
/// deserialize machinery into every read of `self.level`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum TraceLevelMirror {
    #[default]
    None,
    Decisions,
    DecisionsWithCounterfactuals {
        k: usize,
    },
}

impl From<&TraceLevel> for TraceLevelMirror {
    fn from(level: &TraceLevel) -> Self {
        match level {
            TraceLevel::None => TraceLevelMirror::None,
            TraceLevel::Decisions => TraceLevelMirror::Decisions,
            TraceLevel::DecisionsWithCounterfactuals { k } => {
                TraceLevelMirror::DecisionsWithCounterfactuals { k: *k }
            }
        }
    }
}

impl DecisionTrace {
    pub fn new(level: &TraceLevel) -> Self {
        Self {
            level: level.into(),
            admissions: Vec::new(),
            routings: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.level != TraceLevelMirror::None
    }

    pub fn record_admission(&mut self, clock: Tick, request_id: RequestId, admitted: bool, reason: impl Into<String>) {
        if self.level == TraceLevelMirror::None {
            return;
        }
        self.admissions.push(AdmissionRecord {
            clock,
            request_id,
            admitted,
            reason: reason.into(),
        });
    }

    /// Records a routing decision. `scorer` is the scorer actually
    /// configured for the run, or `None` when the active routing policy
    /// does not use one (e.g. round-robin) — in that case counterfactual
    /// scoring falls back to negative effective load, so "lower load
    /// scores better" still produces a sensible candidate ranking and
    /// regret figure instead of silently skipping the computation.
    pub fn record_routing(
        &mut self,
        clock: Tick,
        req: &Request,
        chosen_instance: &str,
        snapshots: &[RoutingSnapshot],
        scorer: Option<&dyn Scorer>,
    ) {
        let request_id = req.id.clone();
        match self.level {
            TraceLevelMirror::None => {}
            TraceLevelMirror::Decisions => {
                self.routings.push(RoutingRecord {
                    clock,
                    request_id,
                    chosen_instance: chosen_instance.to_string(),
                    candidates: Vec::new(),
                    regret: 0.0,
                });
            }
            TraceLevelMirror::DecisionsWithCounterfactuals { k } => {
                let (candidates, regret) = counterfactuals(req, chosen_instance, snapshots, scorer, k);
                self.routings.push(RoutingRecord {
                    clock,
                    request_id,
                    chosen_instance: chosen_instance.to_string(),
                    candidates,
                    regret,
                });
            }
        }
    }
}

fn score_of(req: &Request, snapshot: &RoutingSnapshot, scorer: Option<&dyn Scorer>) -> f64 {
    match scorer {
        Some(s) => s.score(req, snapshot),
        None => -snapshot.effective_load(),
    }
}

/// Ranks every candidate snapshot best-first and computes regret as the
/// gap between the best available score and the chosen instance's score,
/// clamped to zero (a chosen instance that was itself the best has no
/// regret, never a negative one).
fn counterfactuals(
    req: &Request,
    chosen_instance: &str,
    snapshots: &[RoutingSnapshot],
    scorer: Option<&dyn Scorer>,
    k: usize,
) -> (Vec<CounterfactualCandidate>, f64) {
    let mut scored: Vec<CounterfactualCandidate> = snapshots
        .iter()
        .map(|snap| CounterfactualCandidate {
            instance_id: snap.id.clone(),
            score: score_of(req, snap, scorer),
            snapshot: snap.clone(),
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.instance_id.cmp(&b.instance_id))
    });

    let best_score = scored.first().map(|c| c.score).unwrap_or(0.0);
    let chosen_score = scored
        .iter()
        .find(|c| c.instance_id == chosen_instance)
        .map(|c| c.score)
        .unwrap_or(best_score);
    let regret = (best_score - chosen_score).max(0.0);

    scored.truncate(k);
    (scored, regret)
}
