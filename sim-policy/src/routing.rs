use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use sim_kv::EvictionObserver;
use sim_snapshot::RoutingSnapshot;
use sim_types::{BlockHash, Request, Tick};

use crate::errors::PolicyError;
use crate::scorer::{scorer_from_name, Scorer};

/// Everything a routing decision hands back to the cluster engine:
/// the chosen instance (`None` means no instance is eligible, treated as
/// a routing failure and the request is dropped unservable), the
/// per-instance scores the policy computed along the way (empty when the
/// policy doesn't score, e.g. round-robin), an optional priority hint
/// written into `req.priority` before injection when non-zero (an
/// initial-step ordering hint only; the instance's own `PriorityPolicy`
/// recomputes from the next step onward), and a short reason string for
/// logging.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RouteDecision {
    pub target_id: Option<String>,
    pub scores: BTreeMap<String, f64>,
    pub priority_hint: f64,
    pub reason: String,
}

impl RouteDecision {
    fn none(reason: impl Into<String>) -> Self {
        Self {
            target_id: None,
            scores: BTreeMap::new(),
            priority_hint: 0.0,
            reason: reason.into(),
        }
    }
}

pub trait RoutingPolicy {
    /// Picks an instance id from `snapshots` for `req`, along with the
    /// scores considered, a priority hint, and a reason. See
    /// `RouteDecision`.
    fn route(&self, req: &Request, snapshots: &[RoutingSnapshot], now: Tick) -> RouteDecision;
}

/// Cycles through `snapshots` in the order given, independent of load.
pub struct RoundRobin {
    cursor: Cell<usize>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self { cursor: Cell::new(0) }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingPolicy for RoundRobin {
    fn route(&self, _req: &Request, snapshots: &[RoutingSnapshot], _now: Tick) -> RouteDecision {
        if snapshots.is_empty() {
            return RouteDecision::none("no instances available");
        }
        let i = self.cursor.get() % snapshots.len();
        self.cursor.set(i + 1);
        RouteDecision {
            target_id: Some(snapshots[i].id.clone()),
            scores: BTreeMap::new(),
            priority_hint: 0.0,
            reason: "round_robin".to_string(),
        }
    }
}

/// Picks the instance with the lowest effective load, ties broken by id.
pub struct LeastLoaded;

impl RoutingPolicy for LeastLoaded {
    fn route(&self, _req: &Request, snapshots: &[RoutingSnapshot], _now: Tick) -> RouteDecision {
        let scores: BTreeMap<String, f64> = snapshots
            .iter()
            .map(|s| (s.id.clone(), -s.effective_load()))
            .collect();
        let target_id = snapshots
            .iter()
            .min_by(|a, b| {
                a.effective_load()
                    .partial_cmp(&b.effective_load())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|s| s.id.clone());
        RouteDecision {
            target_id,
            scores,
            priority_hint: 0.0,
            reason: "least_loaded".to_string(),
        }
    }
}

/// Picks the instance with the highest `Scorer` output, ties broken by id.
pub struct WeightedScoring {
    scorer: Box<dyn Scorer>,
}

impl WeightedScoring {
    pub fn new(scorer: Box<dyn Scorer>) -> Self {
        Self { scorer }
    }
}

impl RoutingPolicy for WeightedScoring {
    fn route(&self, req: &Request, snapshots: &[RoutingSnapshot], _now: Tick) -> RouteDecision {
        let scores: BTreeMap<String, f64> = snapshots
            .iter()
            .map(|s| (s.id.clone(), self.scorer.score(req, s)))
            .collect();
        let target_id = scores
            .iter()
            .max_by(|(ida, sa), (idb, sb)| {
                sa.partial_cmp(sb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| ida.cmp(idb))
            })
            .map(|(id, _)| id.clone());
        RouteDecision {
            target_id,
            scores,
            priority_hint: 0.0,
            reason: "weighted_scoring".to_string(),
        }
    }
}

/// Tracks, per prefix-hash, which instances are believed to hold a
/// resident KV block for it. Populated two ways: optimistically by
/// `observe_routed` at routing time (before allocation is confirmed) and
/// precisely by `observe_allocated` once the instance's KV cache
/// actually allocates the block; corrected by `observe_evicted` when a
/// block is reclaimed. `observe_routed` entries are superseded, never
/// removed, by the precise calls — both use the same increment/decrement
/// counter so a route that never allocates (e.g. admission-rejected
/// downstream) does not permanently pin a phantom hit.
#[derive(Default)]
pub struct PrefixAffinityIndex {
    counts: RefCell<BTreeMap<BlockHash, BTreeMap<String, u32>>>,
}

impl PrefixAffinityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe_routed(&self, instance_id: &str, hashes: &[BlockHash]) {
        let mut counts = self.counts.borrow_mut();
        for h in hashes {
            *counts.entry(*h).or_default().entry(instance_id.to_string()).or_insert(0) += 1;
        }
    }

    pub fn observe_allocated(&self, instance_id: &str, hash: BlockHash) {
        let mut counts = self.counts.borrow_mut();
        *counts.entry(hash).or_default().entry(instance_id.to_string()).or_insert(0) += 1;
    }

    pub fn observe_evicted(&self, instance_id: &str, hash: BlockHash) {
        let mut counts = self.counts.borrow_mut();
        if let Some(per_instance) = counts.get_mut(&hash) {
            if let Some(c) = per_instance.get_mut(instance_id) {
                *c = c.saturating_sub(1);
                if *c == 0 {
                    per_instance.remove(instance_id);
                }
            }
            if per_instance.is_empty() {
                counts.remove(&hash);
            }
        }
    }

    /// Number of `req`'s prefix hashes believed resident at `instance_id`.
    pub fn affinity_hits(&self, instance_id: &str, hashes: &[BlockHash]) -> u32 {
        let counts = self.counts.borrow();
        hashes
            .iter()
            .filter(|h| counts.get(h).map(|m| m.contains_key(instance_id)).unwrap_or(false))
            .count() as u32
    }
}

/// The corrective half of the eviction-observer back-edge (§4.5/§9): each
/// instance's `KvCache` is subscribed to the same shared index so that an
/// actual GPU or CPU-tier eviction clears a stale affinity hit, independent
/// of whether the optimistic `observe_routed` path is enabled.
impl EvictionObserver for PrefixAffinityIndex {
    fn on_evict(&self, instance_id: &str, hash: BlockHash) {
        self.observe_evicted(instance_id, hash);
    }
}

/// Routes to the instance with the most prefix-hash affinity hits,
/// falling back to least-loaded among the remainder when no instance has
/// any hit.
///
/// Two consistency modes, per §9's "precise KV routing" design note:
/// `precise = false` (the default) updates the index optimistically at
/// routing time, corrected later by eviction callbacks; `precise = true`
/// disables the optimistic update entirely and relies solely on the
/// eviction-observer back-edge, trading staleness for strict accuracy.
pub struct PrefixAffinity {
    index: Rc<PrefixAffinityIndex>,
    precise: bool,
}

impl PrefixAffinity {
    pub fn new() -> Self {
        Self {
            index: Rc::new(PrefixAffinityIndex::new()),
            precise: false,
        }
    }

    /// Shares `index` with the caller so it can be subscribed as an
    /// `EvictionObserver` on every instance's `KvCache`.
    pub fn with_index(index: Rc<PrefixAffinityIndex>, precise: bool) -> Self {
        Self { index, precise }
    }

    pub fn index(&self) -> Rc<PrefixAffinityIndex> {
        self.index.clone()
    }
}

impl Default for PrefixAffinity {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingPolicy for PrefixAffinity {
    fn route(&self, req: &Request, snapshots: &[RoutingSnapshot], _now: Tick) -> RouteDecision {
        if snapshots.is_empty() {
            return RouteDecision::none("no instances available");
        }
        let scores: BTreeMap<String, f64> = snapshots
            .iter()
            .map(|s| (s.id.clone(), self.index.affinity_hits(&s.id, &req.prefix_hashes) as f64))
            .collect();

        let best = snapshots
            .iter()
            .map(|s| (s, self.index.affinity_hits(&s.id, &req.prefix_hashes)))
            .max_by(|(a, ha), (b, hb)| ha.cmp(hb).then_with(|| a.id.cmp(&b.id)));

        let (chosen, reason) = match best {
            Some((s, hits)) if hits > 0 => (Some(s.id.clone()), "prefix_affinity_hit"),
            _ => (
                snapshots
                    .iter()
                    .min_by(|a, b| {
                        a.effective_load()
                            .partial_cmp(&b.effective_load())
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| a.id.cmp(&b.id))
                    })
                    .map(|s| s.id.clone()),
                "prefix_affinity_fallback_least_loaded",
            ),
        };

        if let Some(chosen) = &chosen {
            if !self.precise {
                self.index.observe_routed(chosen, &req.prefix_hashes);
            }
        }

        RouteDecision {
            target_id: chosen,
            scores,
            priority_hint: 0.0,
            reason: reason.to_string(),
        }
    }
}

pub const ROUTING_POLICY_NAMES: &[&str] =
    &["round_robin", "least_loaded", "weighted_scoring", "prefix_affinity"];

pub fn routing_policy_from_name(
    name: &str,
    scorer_name: &str,
) -> Result<Box<dyn RoutingPolicy>, PolicyError> {
    match name {
        "round_robin" => Ok(Box::new(RoundRobin::new())),
        "least_loaded" => Ok(Box::new(LeastLoaded)),
        "weighted_scoring" => Ok(Box::new(WeightedScoring::new(scorer_from_name(scorer_name)?))),
        "prefix_affinity" => Ok(Box::new(PrefixAffinity::new())),
        other => Err(PolicyError::UnknownRouting {
            requested: other.to_string(),
            valid: ROUTING_POLICY_NAMES,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim_types::RequestId;

    fn snap(id: &str, load: usize) -> RoutingSnapshot {
        RoutingSnapshot {
            id: id.to_string(),
            queue_depth: load,
            batch_size: 0,
            kv_utilization: 0.0,
            free_kv_blocks: 0,
            cache_hit_rate: 0.0,
            in_flight: 0,
        }
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let p = RoundRobin::new();
        let snaps = vec![snap("a", 0), snap("b", 0), snap("c", 0)];
        let req = Request::new(RequestId::from("r"), 0, vec![1], vec![1]);
        let picks: Vec<_> = (0..4).map(|_| p.route(&req, &snaps, 0).target_id.unwrap()).collect();
        assert_eq!(picks, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn least_loaded_picks_minimum() {
        let p = LeastLoaded;
        let snaps = vec![snap("a", 5), snap("b", 1)];
        let req = Request::new(RequestId::from("r"), 0, vec![1], vec![1]);
        assert_eq!(p.route(&req, &snaps, 0).target_id.unwrap(), "b");
    }

    #[test]
    fn prefix_affinity_prefers_hit_then_falls_back_to_load() {
        let p = PrefixAffinity::new();
        let h = BlockHash([7u8; 16]);
        p.index().observe_allocated("b", h);

        let mut req = Request::new(RequestId::from("r"), 0, vec![1], vec![1]);
        req.prefix_hashes = vec![h];

        let snaps = vec![snap("a", 0), snap("b", 10)];
        assert_eq!(p.route(&req, &snaps, 0).target_id.unwrap(), "b");
    }

    #[test]
    fn route_decision_carries_priority_hint_and_scores() {
        let p = LeastLoaded;
        let snaps = vec![snap("a", 5), snap("b", 1)];
        let req = Request::new(RequestId::from("r"), 0, vec![1], vec![1]);
        let decision = p.route(&req, &snaps, 0);
        assert_eq!(decision.target_id.as_deref(), Some("b"));
        assert_eq!(decision.priority_hint, 0.0);
        assert_eq!(decision.scores.len(), 2);
    }

    #[test]
    fn affinity_index_eviction_clears_hit() {
        let idx = PrefixAffinityIndex::new();
        let h = BlockHash([1u8; 16]);
        idx.observe_allocated("a", h);
        assert_eq!(idx.affinity_hits("a", &[h]), 1);
        idx.observe_evicted("a", h);
        assert_eq!(idx.affinity_hits("a", &[h]), 0);
    }
}
