//! Top-level orchestrator: wires a `SimConfig` and a workload source into
//! a `ClusterEngine` run and turns the result into per-instance and
//! cluster-wide metrics. This is the only crate that owns construction of
//! concrete policies/latency models from config name strings; everything
//! below it only deals in trait objects.

use std::collections::BTreeMap;

use sim_config::{ConfigError, LatencyConfig, SimConfig};
use sim_engine::{ClusterEngine, ConservationTally};
use sim_instance::{BatchLimits, Instance};
use sim_kv::KvCache;
use sim_latency::{AlphaBetaModel, LatencyModel, RooflineModel};
use sim_metrics::{ClusterMetrics, FitnessRefs, PerInstanceMetrics};
use sim_policy::{
    admission_policy_from_name, batch_formation_from_name, priority_policy_from_name,
    routing_policy_from_name, scorer_from_name, AdmissionPolicyParams, GateMode, PolicyError,
    PrefixAffinity, PrefixAffinityIndex, PriorityPolicyParams, RoutingPolicy,
};
use sim_snapshot::FreshnessConfig;
use sim_trace::DecisionTrace;
use sim_workload::WorkloadSource;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

/// Everything a completed run produces: per-instance and cluster-wide
/// metrics, the conservation tally, and the optional decision trace.
pub struct SimulationOutput {
    pub per_instance: BTreeMap<String, PerInstanceMetrics>,
    pub cluster: ClusterMetrics,
    pub tally: ConservationTally,
    pub trace: DecisionTrace,
}

impl SimulationOutput {
    pub fn fitness(&self, weights: &BTreeMap<String, f64>, refs: FitnessRefs) -> Result<f64, sim_metrics::FitnessError> {
        sim_metrics::fitness(weights, &self.cluster, refs)
    }
}

/// A validated, not-yet-run simulation: a config plus the workload that
/// will seed it.
pub struct Simulation {
    config: SimConfig,
    workload: Box<dyn WorkloadSource>,
}

impl Simulation {
    /// Validates `config` and constructs a `Simulation`. Beyond
    /// `SimConfig::validate`'s structural checks, this also enforces the
    /// two conditions documented as programmer-error panics rather than
    /// `Result`s: a zero request rate would let a distribution-mode
    /// workload source generate arrivals forever, and a zero
    /// `max_running_reqs` can never admit a single request, so an
    /// instance built from it could never make progress.
    pub fn new(config: SimConfig, workload: Box<dyn WorkloadSource>) -> Result<Self, SimulationError> {
        config.validate()?;
        assert!(
            config.request_rate > 0.0,
            "SimConfig::request_rate must be positive; a zero rate never terminates"
        );
        assert!(
            config.batch_limits.max_running_reqs > 0,
            "SimConfig::batch_limits.max_running_reqs must be positive; a zero-size batch can never admit a request"
        );
        Ok(Self { config, workload })
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Runs the simulation to completion (or horizon cutoff). Consumes
    /// `self`: a `Simulation` is single-shot, matching `ClusterEngine`'s
    /// own single-shot `run`.
    pub fn run(mut self) -> Result<SimulationOutput, SimulationError> {
        let requests = self.workload.generate();
        let mut instances = self.build_instances()?;

        let admission = admission_policy_from_name(
            &self.config.policies.admission,
            &default_admission_params(),
        )?;

        // `prefix_affinity` is the one routing policy with a cross-layer
        // data path (§4.5/§9): its index must be shared with every
        // instance's `KvCache` as an eviction observer so actual GPU/CPU
        // evictions correct the router's optimistic view. The generic
        // `routing_policy_from_name` factory can't express that sharing
        // (it returns an opaque `Box<dyn RoutingPolicy>`), so this one
        // name is special-cased here instead.
        let routing: Box<dyn RoutingPolicy> = if self.config.policies.routing == "prefix_affinity" {
            let index = std::rc::Rc::new(PrefixAffinityIndex::new());
            for inst in instances.iter_mut() {
                inst.subscribe_eviction(index.clone());
            }
            Box::new(PrefixAffinity::with_index(index, false))
        } else {
            routing_policy_from_name(&self.config.policies.routing, &self.config.policies.scorer)?
        };
        let trace_scorer = scorer_from_name(&self.config.policies.scorer)?;

        let trace = DecisionTrace::new(&self.config.trace_level);
        let freshness = FreshnessConfig::default();

        let engine = ClusterEngine::new(
            instances,
            requests,
            admission,
            routing,
            Some(trace_scorer),
            freshness,
            self.config.admission_latency,
            self.config.routing_latency,
            self.config.horizon,
            self.config.kv_cache.block_size_tokens,
            trace,
        );

        let outcome = engine.run();

        let mut per_instance = BTreeMap::new();
        for (id, completed) in &outcome.completed_by_instance {
            let metrics = PerInstanceMetrics::from_completed(
                id.clone(),
                completed,
                *outcome.still_queued_by_instance.get(id).unwrap_or(&0),
                *outcome.still_running_by_instance.get(id).unwrap_or(&0),
                *outcome.peak_kv_blocks.get(id).unwrap_or(&0),
                *outcome.preemption_count.get(id).unwrap_or(&0),
                *outcome.kv_allocation_failures.get(id).unwrap_or(&0),
                *outcome.dropped_unservable_by_instance.get(id).unwrap_or(&0),
                *outcome.cache_hit_rate_by_instance.get(id).unwrap_or(&0.0),
                *outcome.thrash_rate_by_instance.get(id).unwrap_or(&0.0),
            );
            per_instance.insert(id.clone(), metrics);
        }

        let cluster = ClusterMetrics::aggregate(&per_instance, outcome.sim_ended_time);

        if cluster.completed == 0 {
            tracing::warn!("run completed with zero successful requests");
        }
        if cluster.completed == 0 && outcome.tally.rejected_at_admission == outcome.tally.injected && outcome.tally.injected > 0 {
            tracing::warn!("every injected request was rejected at admission");
        }

        Ok(SimulationOutput {
            per_instance,
            cluster,
            tally: outcome.tally,
            trace: outcome.trace,
        })
    }

    fn build_instances(&self) -> Result<Vec<Instance>, SimulationError> {
        let mut instances = Vec::with_capacity(self.config.num_instances);
        for i in 0..self.config.num_instances {
            let id = format!("instance-{i}");
            let kv = KvCache::new(
                id.clone(),
                self.config.kv_cache.total_blocks,
                self.config.kv_cache.block_size_tokens,
                self.config.kv_cache.cpu_blocks,
                self.config.kv_cache.offload_threshold,
                self.config.kv_cache.offload_base_latency,
                self.config.kv_cache.offload_bandwidth,
            );
            let latency = build_latency_model(&self.config.latency);
            let scheduling = sim_policy::scheduling_policy_from_name(&self.config.policies.scheduling)?;
            let priority = priority_policy_from_name(&self.config.policies.priority, &default_priority_params())?;
            let batch_formation = batch_formation_from_name(&self.config.policies.batch_formation, Vec::new())?;
            let limits = BatchLimits {
                max_running_reqs: self.config.batch_limits.max_running_reqs,
                max_scheduled_tokens: self.config.batch_limits.max_scheduled_tokens,
                chunked_prefill_threshold: self.config.batch_limits.long_prefill_token_threshold,
            };
            instances.push(Instance::new(id, kv, latency, scheduling, priority, batch_formation, limits));
        }
        Ok(instances)
    }
}

fn build_latency_model(cfg: &LatencyConfig) -> Box<dyn LatencyModel> {
    match cfg {
        LatencyConfig::AlphaBeta { alpha, beta } => Box::new(AlphaBetaModel { alpha: *alpha, beta: *beta }),
        LatencyConfig::Roofline {
            num_layers,
            per_layer_overhead_us,
            compute_flops_per_token,
            memory_bytes_per_token,
            peak_flops_per_us,
            peak_bandwidth_bytes_per_us,
            composition,
        } => Box::new(RooflineModel {
            num_layers: *num_layers,
            per_layer_overhead_us: *per_layer_overhead_us,
            compute_flops_per_token: *compute_flops_per_token,
            memory_bytes_per_token: *memory_bytes_per_token,
            peak_flops_per_us: *peak_flops_per_us,
            peak_bandwidth_bytes_per_us: *peak_bandwidth_bytes_per_us,
            composition: *composition,
        }),
    }
}

/// `SimConfig`'s policy selection carries only name strings: a named
/// policy that takes extra tunables (token bucket capacity/rate, SLO
/// thresholds, priority tiers) gets a maximally permissive default rather
/// than a config knob, so picking it by name alone is never surprising.
fn default_admission_params() -> AdmissionPolicyParams {
    AdmissionPolicyParams {
        token_bucket_capacity: 1_000_000.0,
        token_bucket_rate_per_sec: 1_000_000.0,
        slo_gated_threshold: f64::MAX,
        slo_gated_mode: GateMode::Any,
    }
}

fn default_priority_params() -> PriorityPolicyParams {
    PriorityPolicyParams {
        default_tier: 0.0,
        age_threshold_ticks: 0,
        ramp_per_tick: 0.0,
        gap_per_queued_request: 0.0,
    }
}
