use sim_snapshot::RoutingSnapshot;
use sim_types::Request;

use crate::errors::PolicyError;

/// Scores one instance for one request. Higher is more preferred;
/// `WeightedScoring` routing (see `routing.rs`) picks the maximum,
/// ties broken by instance id.
pub trait Scorer {
    fn score(&self, req: &Request, snapshot: &RoutingSnapshot) -> f64;
}

/// Prefers the least loaded instance.
pub struct LoadScorer;

impl Scorer for LoadScorer {
    fn score(&self, _req: &Request, snapshot: &RoutingSnapshot) -> f64 {
        -snapshot.effective_load()
    }
}

/// Prefers the instance with the most free KV headroom.
pub struct KvUtilizationScorer;

impl Scorer for KvUtilizationScorer {
    fn score(&self, _req: &Request, snapshot: &RoutingSnapshot) -> f64 {
        -snapshot.kv_utilization
    }
}

/// Prefers the instance with the highest recent cache hit rate, as a
/// cheap proxy for prefix locality when no affinity index is wired in.
pub struct CacheHitRateScorer;

impl Scorer for CacheHitRateScorer {
    fn score(&self, _req: &Request, snapshot: &RoutingSnapshot) -> f64 {
        snapshot.cache_hit_rate
    }
}

/// Weighted sum of component scorers.
pub struct CompositeScorer {
    components: Vec<(Box<dyn Scorer>, f64)>,
}

impl CompositeScorer {
    pub fn new(components: Vec<(Box<dyn Scorer>, f64)>) -> Self {
        Self { components }
    }
}

impl Scorer for CompositeScorer {
    fn score(&self, req: &Request, snapshot: &RoutingSnapshot) -> f64 {
        self.components
            .iter()
            .map(|(s, w)| w * s.score(req, snapshot))
            .sum()
    }
}

pub const SCORER_NAMES: &[&str] = &["load", "kv_utilization", "cache_hit_rate", "load_and_kv"];

pub fn scorer_from_name(name: &str) -> Result<Box<dyn Scorer>, PolicyError> {
    match name {
        "load" => Ok(Box::new(LoadScorer)),
        "kv_utilization" => Ok(Box::new(KvUtilizationScorer)),
        "cache_hit_rate" => Ok(Box::new(CacheHitRateScorer)),
        "load_and_kv" => Ok(Box::new(CompositeScorer::new(vec![
            (Box::new(LoadScorer), 0.5),
            (Box::new(KvUtilizationScorer), 0.5),
        ]))),
        other => Err(PolicyError::UnknownScorer {
            requested: other.to_string(),
            valid: SCORER_NAMES,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim_types::RequestId;

    fn snap(id: &str, load: usize, kv: f64) -> RoutingSnapshot {
        RoutingSnapshot {
            id: id.to_string(),
            queue_depth: load,
            batch_size: 0,
            kv_utilization: kv,
            free_kv_blocks: 0,
            cache_hit_rate: 0.0,
            in_flight: 0,
        }
    }

    #[test]
    fn load_scorer_prefers_least_loaded() {
        let scorer = LoadScorer;
        let req = Request::new(RequestId::from("r"), 0, vec![1], vec![1]);
        let light = scorer.score(&req, &snap("a", 1, 0.0));
        let heavy = scorer.score(&req, &snap("b", 10, 0.0));
        assert!(light > heavy);
    }

    #[test]
    fn composite_scorer_blends_components() {
        let scorer = CompositeScorer::new(vec![
            (Box::new(LoadScorer), 1.0),
            (Box::new(KvUtilizationScorer), 1.0),
        ]);
        let req = Request::new(RequestId::from("r"), 0, vec![1], vec![1]);
        let s = scorer.score(&req, &snap("a", 2, 0.5));
        assert_eq!(s, -2.0 + -0.5);
    }
}
