//! Property-style checks for the simulator's cross-cutting guarantees:
//! conservation, clock monotonicity, KV conservation, causality,
//! determinism, the inter-token-latency identity, and work-conservation.
//! Each runs against a handful of small generated workloads rather than a
//! single fixed scenario, since these are meant to hold for any valid
//! input.

use sim_config::{BatchLimitsConfig, KvCacheConfig, LatencyConfig, PolicySelection, SimConfig, TraceLevel};
use sim_workload::{ClampedGaussian, DistributionSource};
use sim::Simulation;

fn config(num_instances: usize, seed: u64, total_blocks: usize) -> SimConfig {
    SimConfig {
        kv_cache: KvCacheConfig {
            total_blocks,
            block_size_tokens: 16,
            cpu_blocks: 4,
            offload_threshold: 0.8,
            offload_base_latency: 50,
            offload_bandwidth: 4,
        },
        batch_limits: BatchLimitsConfig {
            max_running_reqs: 8,
            max_scheduled_tokens: 512,
            long_prefill_token_threshold: 64,
        },
        latency: LatencyConfig::AlphaBeta {
            alpha: [50.0, 1.0, 2.0],
            beta: [100.0, 2.0, 5.0],
        },
        policies: PolicySelection {
            admission: "always_admit".to_string(),
            routing: "least_loaded".to_string(),
            scorer: "load".to_string(),
            scheduling: "fcfs".to_string(),
            priority: "constant".to_string(),
            batch_formation: "default".to_string(),
        },
        admission_latency: 50,
        routing_latency: 50,
        horizon: 50_000_000,
        seed,
        num_instances,
        trace_level: TraceLevel::None,
        request_rate: 20.0,
    }
}

fn workload(seed: u64, count: usize) -> Box<DistributionSource> {
    Box::new(DistributionSource::new(
        seed,
        20.0,
        count,
        ClampedGaussian { mean: 40.0, stddev: 15.0, min: 5, max: 120 },
        ClampedGaussian { mean: 20.0, stddev: 8.0, min: 2, max: 60 },
    ))
}

/// Every injected request lands in exactly one disjoint bucket.
#[test]
fn conservation_holds_across_several_seeds_and_sizes() {
    for (seed, n_instances, total_blocks, count) in [(1u64, 1usize, 40usize, 30usize), (2, 3, 16, 60), (3, 2, 8, 80)] {
        let cfg = config(n_instances, seed, total_blocks);
        let output = Simulation::new(cfg, workload(seed, count)).unwrap().run().unwrap();
        assert!(
            output.tally.balances(),
            "seed {seed}: {:?} does not balance to injected={}",
            output.tally,
            count
        );
        assert_eq!(output.tally.injected, count as u64);
    }
}

/// The reported simulation end time is at least as large as any
/// completed request's own end-to-end latency sample (the clock itself
/// panics on backward motion; this checks the externally observable
/// consequence of that guarantee).
#[test]
fn sim_ended_time_dominates_every_completion_tick() {
    let cfg = config(2, 5, 64);
    let output = Simulation::new(cfg, workload(5, 40)).unwrap().run().unwrap();

    for m in output.per_instance.values() {
        for sample in &m.e2e_samples {
            assert!(*sample as u64 <= output.cluster.sim_ended_time || output.cluster.sim_ended_time == 0);
        }
    }
}

/// KV conservation (allocated + free == total) is checked at the
/// `sim-kv` unit level; here we confirm a full run never reports more
/// peak-allocated blocks than the instance's total pool.
#[test]
fn peak_kv_blocks_never_exceeds_total_blocks() {
    let total_blocks = 16;
    let cfg = config(1, 9, total_blocks);
    let output = Simulation::new(cfg, workload(9, 50)).unwrap().run().unwrap();

    for m in output.per_instance.values() {
        assert!(m.peak_kv_blocks <= total_blocks);
    }
}

/// Causality: TTFT is never negative and E2E is never smaller than TTFT,
/// for every completed request.
#[test]
fn causality_ttft_nonnegative_and_e2e_at_least_ttft() {
    let cfg = config(2, 11, 48);
    let output = Simulation::new(cfg, workload(11, 60)).unwrap().run().unwrap();

    for m in output.per_instance.values() {
        assert_eq!(m.ttft_samples.len(), m.e2e_samples.len());
        for (ttft, e2e) in m.ttft_samples.iter().zip(&m.e2e_samples) {
            assert!(*ttft >= 0.0);
            assert!(*e2e >= *ttft);
        }
    }
}

/// Determinism: identical (seed, config, workload) produces identical
/// metrics, down to the concatenated sample vectors.
#[test]
fn identical_inputs_produce_identical_metrics() {
    let run = || {
        let cfg = config(3, 77, 32);
        Simulation::new(cfg, workload(77, 70)).unwrap().run().unwrap()
    };
    let a = run();
    let b = run();

    assert_eq!(a.cluster.completed, b.cluster.completed);
    assert_eq!(a.cluster.ttft_samples, b.cluster.ttft_samples);
    assert_eq!(a.cluster.itl_samples, b.cluster.itl_samples);
    assert_eq!(a.cluster.e2e_samples, b.cluster.e2e_samples);
    assert_eq!(a.tally, b.tally);
}

/// The inter-token-latency identity: summed ITL samples equal the
/// summed (E2E - TTFT) across the whole cluster.
#[test]
fn cluster_itl_sum_matches_e2e_minus_ttft_sum() {
    let cfg = config(2, 13, 48);
    let output = Simulation::new(cfg, workload(13, 60)).unwrap().run().unwrap();

    let itl_sum: f64 = output.cluster.itl_samples.iter().sum();
    let e2e_minus_ttft_sum: f64 = output
        .cluster
        .e2e_samples
        .iter()
        .zip(&output.cluster.ttft_samples)
        .map(|(e2e, ttft)| e2e - ttft)
        .sum();

    assert!(
        (itl_sum - e2e_minus_ttft_sum).abs() < output.cluster.completed.max(1) as f64,
        "itl_sum={itl_sum} e2e_minus_ttft_sum={e2e_minus_ttft_sum}"
    );
}

/// Work-conservation is exercised directly against the per-instance step
/// engine in `sim-instance`; here we confirm a full run under load never
/// leaves an instance with work but no further progress (every injected
/// request ends up completed, still queued, or still running, never
/// silently stuck).
#[test]
fn no_instance_is_left_with_unprocessed_work_at_run_end() {
    let cfg = config(1, 21, 64);
    let output = Simulation::new(cfg, workload(21, 40)).unwrap().run().unwrap();

    assert_eq!(
        output.tally.completed + output.tally.still_queued + output.tally.still_running,
        output.tally.injected - output.tally.dropped_unservable - output.tally.rejected_at_admission
    );
}
