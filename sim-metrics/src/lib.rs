//! Per-instance and cluster-wide result accumulation, plus the scalar
//! fitness function used to rank runs against each other.
//!
//! Nothing here runs during the event loop: `sim-instance` and
//! `sim-engine` only ever produce `Request` values with their lifecycle
//! ticks stamped; this crate turns a finished run's requests into the
//! numbers an operator (or a search loop) actually cares about.

use std::collections::{BTreeMap, HashSet};

use sim_types::{Request, Tick};
use thiserror::Error;

/// Results accumulated for one instance at the end of a run.
///
/// `ttft`/`itl`/`e2e` samples are in ticks (microseconds). `itl_samples`
/// is reconstructed from each completed request's mean inter-token
/// latency, `(e2e - ttft) / (decode_count - 1)`, repeated once per
/// decode step — the instance step engine does not stamp a clock sample
/// per individual decode token, only the request's final ticks, so this
/// is the coarsest representation consistent with the identity
/// `mean_itl * (decode_count - 1) == e2e - ttft`.
#[derive(Clone, Debug, Default)]
pub struct PerInstanceMetrics {
    pub instance_id: String,
    pub completed: u64,
    pub completed_ids: Vec<sim_types::RequestId>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub ttft_sum: f64,
    pub ttft_samples: Vec<f64>,
    pub itl_sum: f64,
    pub itl_samples: Vec<f64>,
    pub e2e_samples: Vec<f64>,
    pub peak_kv_blocks: usize,
    pub preemption_count: u64,
    pub kv_allocation_failures: u64,
    pub dropped_unservable: u64,
    pub cache_hit_rate: f64,
    pub thrash_rate: f64,
    pub still_queued: usize,
    pub still_running: usize,
}

impl PerInstanceMetrics {
    #[allow(clippy::too_many_arguments)]
    pub fn from_completed(
        instance_id: impl Into<String>,
        completed: &[Request],
        still_queued: usize,
        still_running: usize,
        peak_kv_blocks: usize,
        preemption_count: u64,
        kv_allocation_failures: u64,
        dropped_unservable: u64,
        cache_hit_rate: f64,
        thrash_rate: f64,
    ) -> Self {
        let mut m = PerInstanceMetrics {
            instance_id: instance_id.into(),
            still_queued,
            still_running,
            peak_kv_blocks,
            preemption_count,
            kv_allocation_failures,
            dropped_unservable,
            cache_hit_rate,
            thrash_rate,
            ..Default::default()
        };

        for req in completed {
            let ttft_tick = req
                .ttft_tick
                .expect("a completed request must have recorded TTFT");
            let completion_tick = req
                .completion_tick
                .expect("a completed request must have recorded a completion tick");
            let ttft = (ttft_tick - req.arrival_tick) as f64;
            let e2e = (completion_tick - req.arrival_tick) as f64;

            m.ttft_sum += ttft;
            m.ttft_samples.push(ttft);
            m.e2e_samples.push(e2e);

            let decode_count = req.decode_progress;
            if decode_count >= 2 {
                let mean_itl = (e2e - ttft) / (decode_count - 1) as f64;
                for _ in 0..(decode_count - 1) {
                    m.itl_sum += mean_itl;
                    m.itl_samples.push(mean_itl);
                }
            }

            m.total_input_tokens += req.input_tokens.len() as u64;
            m.total_output_tokens += req.output_tokens.len() as u64;
            m.completed_ids.push(req.id.clone());
        }
        m.completed = completed.len() as u64;
        m
    }

    pub fn mean_ttft(&self) -> f64 {
        mean(&self.ttft_samples)
    }

    pub fn mean_itl(&self) -> f64 {
        mean(&self.itl_samples)
    }

    pub fn mean_e2e(&self) -> f64 {
        mean(&self.e2e_samples)
    }
}

fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    }
}

/// Cluster-wide aggregation of every instance's `PerInstanceMetrics`.
///
/// Aggregation rules, matched field by field: counters sum, the
/// simulation end time takes the max observed instance activity, rate-
/// like fields (`cache_hit_rate`, `thrash_rate`) take the arithmetic
/// mean across instances, and distribution samples concatenate rather
/// than collapse to a scalar, so downstream percentile computation can
/// still see the full population.
#[derive(Clone, Debug, Default)]
pub struct ClusterMetrics {
    pub sim_ended_time: Tick,
    pub completed: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub ttft_samples: Vec<f64>,
    pub itl_samples: Vec<f64>,
    pub e2e_samples: Vec<f64>,
    pub peak_kv_blocks: usize,
    pub preemption_count: u64,
    pub kv_allocation_failures: u64,
    pub dropped_unservable: u64,
    pub cache_hit_rate: f64,
    pub thrash_rate: f64,
    pub still_queued: usize,
    pub still_running: usize,
}

impl ClusterMetrics {
    /// Merges per-instance metrics keyed by instance id, so iteration
    /// order is always the sorted instance-id order rather than whatever
    /// order the caller happened to populate the map in.
    pub fn aggregate(per_instance: &BTreeMap<String, PerInstanceMetrics>, sim_ended_time: Tick) -> Self {
        let mut cluster = ClusterMetrics {
            sim_ended_time,
            ..Default::default()
        };
        if per_instance.is_empty() {
            return cluster;
        }

        let mut seen_ids = HashSet::new();
        let mut rate_sum = 0.0;
        let mut thrash_sum = 0.0;

        for m in per_instance.values() {
            for id in &m.completed_ids {
                if !seen_ids.insert(id.clone()) {
                    tracing::warn!(
                        request_id = %id,
                        "request id completed on more than one instance; merging anyway"
                    );
                }
            }

            cluster.completed += m.completed;
            cluster.total_input_tokens += m.total_input_tokens;
            cluster.total_output_tokens += m.total_output_tokens;
            cluster.ttft_samples.extend_from_slice(&m.ttft_samples);
            cluster.itl_samples.extend_from_slice(&m.itl_samples);
            cluster.e2e_samples.extend_from_slice(&m.e2e_samples);
            cluster.peak_kv_blocks = cluster.peak_kv_blocks.max(m.peak_kv_blocks);
            cluster.preemption_count += m.preemption_count;
            cluster.kv_allocation_failures += m.kv_allocation_failures;
            cluster.dropped_unservable += m.dropped_unservable;
            cluster.still_queued += m.still_queued;
            cluster.still_running += m.still_running;
            rate_sum += m.cache_hit_rate;
            thrash_sum += m.thrash_rate;
        }

        let n = per_instance.len() as f64;
        cluster.cache_hit_rate = rate_sum / n;
        cluster.thrash_rate = thrash_sum / n;
        cluster
    }

    pub fn mean_ttft(&self) -> f64 {
        mean(&self.ttft_samples)
    }

    pub fn mean_itl(&self) -> f64 {
        mean(&self.itl_samples)
    }

    pub fn mean_e2e(&self) -> f64 {
        mean(&self.e2e_samples)
    }

    pub fn throughput_per_sec(&self) -> f64 {
        if self.sim_ended_time == 0 {
            0.0
        } else {
            self.completed as f64 / (self.sim_ended_time as f64 / 1_000_000.0)
        }
    }
}

/// Reference values a fitness computation normalizes against. Larger
/// `throughput_ref`/`latency_ref` flatten the corresponding term's
/// sensitivity to absolute scale, so two runs of very different
/// workload sizes remain comparable.
#[derive(Clone, Copy, Debug)]
pub struct FitnessRefs {
    pub throughput_ref: f64,
    pub latency_ref: f64,
}

const METRIC_NAMES: &[&str] = &["cache_hit_rate", "e2e_mean", "itl_mean", "throughput", "ttft_mean"];

#[derive(Debug, Error, PartialEq)]
pub enum FitnessError {
    #[error("unknown fitness metric {requested:?}, valid metrics are {valid:?}")]
    UnknownMetric {
        requested: String,
        valid: &'static [&'static str],
    },
}

/// A weighted linear combination of normalized metric terms.
///
/// Throughput-like metrics (higher is better) normalize as
/// `x / (x + ref)`, which saturates towards 1 as `x` grows past `ref`.
/// Latency-like metrics (lower is better) normalize as
/// `1 / (1 + x / ref)`, which saturates towards 1 as `x` shrinks towards
/// zero. Both land in `[0, 1)` so weights are comparable across metrics
/// of very different natural units.
pub fn fitness(
    weights: &BTreeMap<String, f64>,
    metrics: &ClusterMetrics,
    refs: FitnessRefs,
) -> Result<f64, FitnessError> {
    let mut total = 0.0;
    for (name, weight) in weights {
        let normalized = match name.as_str() {
            "throughput" => throughput_term(metrics.throughput_per_sec(), refs.throughput_ref),
            "ttft_mean" => latency_term(metrics.mean_ttft(), refs.latency_ref),
            "itl_mean" => latency_term(metrics.mean_itl(), refs.latency_ref),
            "e2e_mean" => latency_term(metrics.mean_e2e(), refs.latency_ref),
            "cache_hit_rate" => metrics.cache_hit_rate,
            _ => {
                return Err(FitnessError::UnknownMetric {
                    requested: name.clone(),
                    valid: METRIC_NAMES,
                })
            }
        };
        total += weight * normalized;
    }
    Ok(total)
}

fn throughput_term(x: f64, reference: f64) -> f64 {
    x / (x + reference)
}

fn latency_term(x: f64, reference: f64) -> f64 {
    1.0 / (1.0 + x / reference)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim_types::RequestId;

    fn completed_request(id: &str, arrival: Tick, ttft: Tick, completion: Tick, decode: usize) -> Request {
        let mut r = Request::new(RequestId::from(id), arrival, vec![1, 2, 3], vec![0; decode]);
        r.decode_progress = decode;
        r.ttft_tick = Some(ttft);
        r.completion_tick = Some(completion);
        r
    }

    #[test]
    fn itl_identity_holds_for_completed_requests() {
        let reqs = vec![completed_request("r1", 0, 100, 1100, 5)];
        let m = PerInstanceMetrics::from_completed("i0", &reqs, 0, 0, 10, 0, 0, 0, 1.0, 0.0);
        let ttft = 100.0;
        let e2e = 1100.0;
        let lhs = m.mean_itl() * (5 - 1) as f64;
        assert!((lhs - (e2e - ttft)).abs() < 1.0);
    }

    #[test]
    fn single_decode_token_produces_no_itl_samples() {
        let reqs = vec![completed_request("r1", 0, 100, 200, 1)];
        let m = PerInstanceMetrics::from_completed("i0", &reqs, 0, 0, 10, 0, 0, 0, 1.0, 0.0);
        assert!(m.itl_samples.is_empty());
    }

    #[test]
    fn cluster_aggregation_sums_counters_and_means_rates() {
        let mut per_instance = BTreeMap::new();
        per_instance.insert(
            "i0".to_string(),
            PerInstanceMetrics::from_completed(
                "i0",
                &[completed_request("r1", 0, 100, 1100, 5)],
                1,
                2,
                50,
                3,
                1,
                0,
                0.8,
                0.1,
            ),
        );
        per_instance.insert(
            "i1".to_string(),
            PerInstanceMetrics::from_completed(
                "i1",
                &[completed_request("r2", 0, 200, 1200, 3)],
                0,
                1,
                70,
                1,
                0,
                1,
                0.6,
                0.3,
            ),
        );

        let cluster = ClusterMetrics::aggregate(&per_instance, 5_000_000);
        assert_eq!(cluster.completed, 2);
        assert_eq!(cluster.still_queued, 1);
        assert_eq!(cluster.still_running, 3);
        assert_eq!(cluster.preemption_count, 4);
        assert_eq!(cluster.peak_kv_blocks, 70);
        assert!((cluster.cache_hit_rate - 0.7).abs() < 1e-9);
        assert_eq!(cluster.ttft_samples.len(), 2);
    }

    #[test]
    fn duplicate_request_id_across_instances_still_merges() {
        let mut per_instance = BTreeMap::new();
        per_instance.insert(
            "i0".to_string(),
            PerInstanceMetrics::from_completed("i0", &[completed_request("dup", 0, 100, 200, 2)], 0, 0, 1, 0, 0, 0, 1.0, 0.0),
        );
        per_instance.insert(
            "i1".to_string(),
            PerInstanceMetrics::from_completed("i1", &[completed_request("dup", 0, 100, 200, 2)], 0, 0, 1, 0, 0, 0, 1.0, 0.0),
        );
        let cluster = ClusterMetrics::aggregate(&per_instance, 1_000_000);
        assert_eq!(cluster.completed, 2);
    }

    #[test]
    fn fitness_rejects_unknown_metric() {
        let mut weights = BTreeMap::new();
        weights.insert("not_a_metric".to_string(), 1.0);
        let metrics = ClusterMetrics::default();
        let refs = FitnessRefs { throughput_ref: 10.0, latency_ref: 1000.0 };
        let err = fitness(&weights, &metrics, refs).unwrap_err();
        assert!(matches!(err, FitnessError::UnknownMetric { .. }));
    }

    #[test]
    fn fitness_combines_weighted_terms() {
        let mut weights = BTreeMap::new();
        weights.insert("throughput".to_string(), 0.5);
        weights.insert("ttft_mean".to_string(), 0.5);
        let mut metrics = ClusterMetrics::default();
        metrics.completed = 10;
        metrics.sim_ended_time = 1_000_000;
        metrics.ttft_samples = vec![1000.0, 1000.0];
        let refs = FitnessRefs { throughput_ref: 10.0, latency_ref: 1000.0 };
        let score = fitness(&weights, &metrics, refs).unwrap();
        assert!(score > 0.0 && score < 1.0);
    }
}
