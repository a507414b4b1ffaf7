//! The cluster event engine: the shared-clock control plane that
//! interleaves cluster-level events (arrival, admission, routing) with
//! each instance's own local event stream under a single dispatch loop.
//! This crate owns the clock, the cluster event heap, the
//! admission/routing policies, and the pending-requests bookkeeping; it
//! exclusively owns every `Instance` it was constructed with.

mod events;

use std::collections::BTreeMap;

use sim_instance::{DispatchOutcome, Instance};
use sim_kv::compute_prefix_hashes;
use sim_policy::{AdmissionPolicy, RoutingPolicy, Scorer};
use sim_snapshot::{FreshnessConfig, RoutingSnapshot, SnapshotProvider};
use sim_trace::DecisionTrace;
use sim_types::{LifecycleState, Request, SequenceCounter, Tick};

use events::{ClusterEvent, ClusterEventClass, ClusterHeapEntry};

/// End-of-run classification tallies. `balances()` checks the
/// conservation identity: `completed + still_queued + still_running +
/// dropped_unservable + rejected_at_admission == injected`.
///
/// A request that never made it out of the cluster control plane before
/// the horizon cut dispatch (still sitting as an `Arrival`,
/// `AdmissionDecision`, or `RoutingDecision` event) is counted under
/// `still_queued`: it is still in `LifecycleState::Queued`, the same
/// state a request sitting in an instance's wait queue is in, and no
/// finer distinction is drawn for cluster-side-pending requests.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConservationTally {
    pub injected: u64,
    pub completed: u64,
    pub still_queued: u64,
    pub still_running: u64,
    pub dropped_unservable: u64,
    pub rejected_at_admission: u64,
}

impl ConservationTally {
    pub fn balances(&self) -> bool {
        self.completed
            + self.still_queued
            + self.still_running
            + self.dropped_unservable
            + self.rejected_at_admission
            == self.injected
    }
}

/// Everything produced by one `ClusterEngine::run()` call: per-instance
/// completed requests (raw, for `sim-metrics` to turn into distributions),
/// the conservation tally, and the decision trace (empty unless enabled).
pub struct RunOutcome {
    pub completed_by_instance: BTreeMap<String, Vec<Request>>,
    pub peak_kv_blocks: BTreeMap<String, usize>,
    pub preemption_count: BTreeMap<String, u64>,
    pub kv_allocation_failures: BTreeMap<String, u64>,
    pub dropped_unservable_by_instance: BTreeMap<String, u64>,
    pub still_queued_by_instance: BTreeMap<String, usize>,
    pub still_running_by_instance: BTreeMap<String, usize>,
    pub cache_hit_rate_by_instance: BTreeMap<String, f64>,
    pub thrash_rate_by_instance: BTreeMap<String, f64>,
    pub tally: ConservationTally,
    pub trace: DecisionTrace,
    pub sim_ended_time: Tick,
}

pub struct ClusterEngine {
    clock: sim_types::Clock,
    seq: SequenceCounter,
    heap: std::collections::BinaryHeap<ClusterHeapEntry>,
    instances: BTreeMap<String, Instance>,
    admission: Box<dyn AdmissionPolicy>,
    routing: Box<dyn RoutingPolicy>,
    trace_scorer: Option<Box<dyn Scorer>>,
    snapshot_provider: SnapshotProvider,
    pending: BTreeMap<String, usize>,
    admission_latency: Tick,
    routing_latency: Tick,
    horizon: Tick,
    block_size_tokens: usize,
    injected: u64,
    rejected_at_admission: u64,
    dropped_unservable_at_routing: u64,
    trace: DecisionTrace,
    ran: bool,
}

impl ClusterEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instances: Vec<Instance>,
        requests: Vec<Request>,
        admission: Box<dyn AdmissionPolicy>,
        routing: Box<dyn RoutingPolicy>,
        trace_scorer: Option<Box<dyn Scorer>>,
        freshness: FreshnessConfig,
        admission_latency: Tick,
        routing_latency: Tick,
        horizon: Tick,
        block_size_tokens: usize,
        trace: DecisionTrace,
    ) -> Self {
        assert!(
            !instances.is_empty(),
            "ClusterEngine::new requires at least one instance"
        );

        let mut seq = SequenceCounter::new();
        let mut heap = std::collections::BinaryHeap::new();
        let injected = requests.len() as u64;
        for req in requests {
            let tick = req.arrival_tick;
            heap.push(ClusterHeapEntry {
                tick,
                class: ClusterEventClass::Arrival,
                seq: seq.next(),
                event: ClusterEvent::Arrival(req),
            });
        }

        let mut pending = BTreeMap::new();
        let mut by_id = BTreeMap::new();
        for inst in instances {
            pending.insert(inst.id().to_string(), 0usize);
            by_id.insert(inst.id().to_string(), inst);
        }

        Self {
            clock: sim_types::Clock::new(),
            seq,
            heap,
            instances: by_id,
            admission,
            routing,
            trace_scorer,
            snapshot_provider: SnapshotProvider::new(freshness),
            pending,
            admission_latency,
            routing_latency,
            horizon,
            block_size_tokens,
            injected,
            rejected_at_admission: 0,
            dropped_unservable_at_routing: 0,
            trace,
            ran: false,
        }
    }

    /// Runs dispatch to completion (or until the horizon is crossed).
    /// Calling this a second time on the same engine is a programmer
    /// error: the event heap and every instance have already been
    /// consumed, so the result would silently be empty.
    pub fn run(mut self) -> RunOutcome {
        assert!(!self.ran, "ClusterEngine::run must be called at most once");
        self.ran = true;

        let mut completed_by_instance: BTreeMap<String, Vec<Request>> = self
            .instances
            .keys()
            .map(|id| (id.clone(), Vec::new()))
            .collect();

        loop {
            let cluster_time = self.heap.peek().map(|e| e.tick);
            let inst_min = self.min_instance_event();
            let inst_time = inst_min.as_ref().map(|(t, _)| *t);

            let next_tick = match (cluster_time, inst_time) {
                (None, None) => break,
                (Some(c), None) => c,
                (None, Some(i)) => i,
                (Some(c), Some(i)) => c.min(i),
            };
            if next_tick > self.horizon {
                break;
            }

            let dispatch_cluster = match (cluster_time, inst_time) {
                (Some(c), Some(i)) => c <= i,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => unreachable!(),
            };

            if dispatch_cluster {
                self.dispatch_cluster_event();
            } else {
                let (tick, instance_id) = inst_min.expect("instance dispatch requires a next event");
                self.clock.advance_to(tick);
                self.dispatch_instance_event(&instance_id, &mut completed_by_instance);
            }
        }

        self.finalize(completed_by_instance)
    }

    fn min_instance_event(&self) -> Option<(Tick, String)> {
        self.instances
            .iter()
            .filter_map(|(id, inst)| inst.next_event_time().map(|t| (t, id.clone())))
            .min_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
    }

    fn build_snapshots(&mut self, now: Tick) -> Vec<RoutingSnapshot> {
        let mut snapshots = Vec::with_capacity(self.instances.len());
        for (id, inst) in self.instances.iter() {
            let in_flight = *self.pending.get(id).unwrap_or(&0);
            snapshots.push(self.snapshot_provider.snapshot(inst, in_flight, now));
        }
        snapshots
    }

    fn dispatch_cluster_event(&mut self) {
        let entry = self.heap.pop().expect("dispatch_cluster_event requires a cluster event");
        self.clock.advance_to(entry.tick);
        let now = entry.tick;
        tracing::trace!(tick = now, class = ?entry.class, "dispatching cluster event");

        match entry.event {
            ClusterEvent::Arrival(req) => {
                let seq = self.seq.next();
                self.heap.push(ClusterHeapEntry {
                    tick: now + self.admission_latency,
                    class: ClusterEventClass::AdmissionDecision,
                    seq,
                    event: ClusterEvent::AdmissionDecision(req),
                });
            }
            ClusterEvent::AdmissionDecision(req) => {
                let snapshots = self.build_snapshots(now);
                let (admitted, reason) = self.admission.admit(&req, now, &snapshots);
                self.trace.record_admission(now, req.id.clone(), admitted, reason.clone());

                if admitted {
                    let seq = self.seq.next();
                    self.heap.push(ClusterHeapEntry {
                        tick: now + self.routing_latency,
                        class: ClusterEventClass::RoutingDecision,
                        seq,
                        event: ClusterEvent::RoutingDecision(req),
                    });
                } else {
                    self.rejected_at_admission += 1;
                    tracing::debug!(request_id = %req.id, reason, "request rejected at admission");
                }
            }
            ClusterEvent::RoutingDecision(mut req) => {
                let snapshots = self.build_snapshots(now);
                let decision = self.routing.route(&req, &snapshots, now);
                self.trace.record_routing(
                    now,
                    &req,
                    decision.target_id.as_deref().unwrap_or("<none>"),
                    &snapshots,
                    self.trace_scorer.as_deref(),
                );
                tracing::trace!(
                    request_id = %req.id,
                    reason = %decision.reason,
                    priority_hint = decision.priority_hint,
                    "routing decision"
                );

                match decision.target_id {
                    Some(target_id) if self.instances.contains_key(&target_id) => {
                        req.prefix_hashes = compute_prefix_hashes(&req.input_tokens, self.block_size_tokens);
                        // §4.1: the priority hint is an initial-step ordering
                        // hint only; a zero hint means "no opinion" and
                        // leaves the request's existing priority untouched,
                        // since every `PriorityPolicy` recomputes it on the
                        // request's first step anyway.
                        if decision.priority_hint != 0.0 {
                            req.priority = decision.priority_hint;
                        }
                        *self.pending.entry(target_id.clone()).or_insert(0) += 1;
                        let inst = self
                            .instances
                            .get_mut(&target_id)
                            .expect("checked contains_key above");
                        inst.push_online_arrival(req, now, &mut self.seq);
                    }
                    Some(unknown_id) => {
                        tracing::warn!(
                            request_id = %req.id,
                            target = %unknown_id,
                            "routing policy returned an unknown instance id; dropping as unservable"
                        );
                        self.dropped_unservable_at_routing += 1;
                    }
                    None => {
                        tracing::warn!(
                            request_id = %req.id,
                            "no eligible routing target; dropping as unservable"
                        );
                        self.dropped_unservable_at_routing += 1;
                    }
                }
            }
        }
    }

    fn dispatch_instance_event(
        &mut self,
        instance_id: &str,
        completed_by_instance: &mut BTreeMap<String, Vec<Request>>,
    ) {
        let inst = self
            .instances
            .get_mut(instance_id)
            .expect("dispatch_instance_event requires a known instance id");

        match inst.dispatch_next(&mut self.seq) {
            DispatchOutcome::Queued => {
                if let Some(count) = self.pending.get_mut(instance_id) {
                    *count = count.saturating_sub(1);
                }
            }
            DispatchOutcome::Stepped(report) => {
                if let Some(bucket) = completed_by_instance.get_mut(instance_id) {
                    bucket.extend(report.completed);
                }
            }
            DispatchOutcome::Arrived | DispatchOutcome::Idle => {}
        }
    }

    fn finalize(mut self, completed_by_instance: BTreeMap<String, Vec<Request>>) -> RunOutcome {
        let mut still_queued_by_instance = BTreeMap::new();
        let mut still_running_by_instance = BTreeMap::new();
        let mut peak_kv_blocks = BTreeMap::new();
        let mut preemption_count = BTreeMap::new();
        let mut kv_allocation_failures = BTreeMap::new();
        let mut dropped_unservable_by_instance = BTreeMap::new();
        let mut cache_hit_rate_by_instance = BTreeMap::new();
        let mut thrash_rate_by_instance = BTreeMap::new();

        let mut still_queued_total: u64 = 0;
        let mut still_running_total: u64 = 0;
        let mut dropped_unservable_total: u64 = self.dropped_unservable_at_routing;

        for (id, inst) in self.instances.iter() {
            let wq = inst.wait_queue_len();
            let rb = inst.running_len();
            still_queued_by_instance.insert(id.clone(), wq);
            still_running_by_instance.insert(id.clone(), rb);
            still_queued_total += wq as u64;
            still_running_total += rb as u64;

            peak_kv_blocks.insert(id.clone(), inst.peak_kv_watermark());
            preemption_count.insert(id.clone(), inst.preemption_total());
            kv_allocation_failures.insert(id.clone(), inst.dropped_unservable_total());
            dropped_unservable_by_instance.insert(id.clone(), inst.dropped_unservable_total());
            dropped_unservable_total += inst.dropped_unservable_total();

            cache_hit_rate_by_instance.insert(id.clone(), inst.kv().cache_hit_rate());
            let reload = inst.kv().reload_count();
            let thrash = inst.kv().thrash_count();
            let rate = if reload == 0 { 0.0 } else { thrash as f64 / reload as f64 };
            thrash_rate_by_instance.insert(id.clone(), rate);
        }

        // Any request still sitting in the cluster control plane (never
        // routed before the horizon cut dispatch) is still `Queued`.
        for entry in self.heap.drain() {
            match entry.event {
                ClusterEvent::Arrival(req)
                | ClusterEvent::AdmissionDecision(req)
                | ClusterEvent::RoutingDecision(req) => {
                    debug_assert_eq!(req.state, LifecycleState::Queued);
                    still_queued_total += 1;
                }
            }
        }

        let completed_total: u64 = completed_by_instance.values().map(|v| v.len() as u64).sum();

        let tally = ConservationTally {
            injected: self.injected,
            completed: completed_total,
            still_queued: still_queued_total,
            still_running: still_running_total,
            dropped_unservable: dropped_unservable_total,
            rejected_at_admission: self.rejected_at_admission,
        };

        let sim_ended_time = self.clock.now();

        RunOutcome {
            completed_by_instance,
            peak_kv_blocks,
            preemption_count,
            kv_allocation_failures,
            dropped_unservable_by_instance,
            still_queued_by_instance,
            still_running_by_instance,
            cache_hit_rate_by_instance,
            thrash_rate_by_instance,
            tally,
            trace: self.trace,
            sim_ended_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim_instance::BatchLimits;
    use sim_kv::KvCache;
    use sim_latency::AlphaBetaModel;
    use sim_policy::{ConstantPriority, DefaultBatchFormation, Fcfs, LeastLoaded, RoundRobin};
    use sim_policy::{AlwaysAdmit, TokenBucket};
    use sim_snapshot::FreshnessConfig;
    use sim_trace::DecisionTrace;
    use sim_config::TraceLevel;
    use sim_types::RequestId;

    fn make_instance(id: &str) -> Instance {
        Instance::new(
            id,
            KvCache::new(id, 132_139, 16, 0, 1.1, 0, 1),
            Box::new(AlphaBetaModel {
                alpha: [1601.0, 3.51, 1805.54],
                beta: [6910.42, 17.67, 2.84],
            }),
            Box::new(Fcfs),
            Box::new(ConstantPriority),
            Box::new(DefaultBatchFormation),
            BatchLimits {
                max_running_reqs: 256,
                max_scheduled_tokens: 2048,
                chunked_prefill_threshold: 2048,
            },
        )
    }

    fn make_requests(n: usize) -> Vec<Request> {
        (0..n)
            .map(|i| {
                Request::new(
                    RequestId::from(format!("r{i}")),
                    (i as u64) * 100_000,
                    vec![0u32; 50],
                    vec![0u32; 20],
                )
            })
            .collect()
    }

    #[test]
    fn round_robin_splits_evenly_across_three_instances() {
        let instances = vec![make_instance("i0"), make_instance("i1"), make_instance("i2")];
        let requests = make_requests(9);
        let engine = ClusterEngine::new(
            instances,
            requests,
            Box::new(AlwaysAdmit),
            Box::new(RoundRobin::new()),
            None,
            FreshnessConfig::default(),
            0,
            0,
            1_000_000_000,
            16,
            DecisionTrace::new(&TraceLevel::None),
        );
        let outcome = engine.run();
        let mut counts: Vec<usize> = outcome.completed_by_instance.values().map(|v| v.len()).collect();
        counts.sort();
        assert_eq!(counts, vec![3, 3, 3]);
        assert!(outcome.tally.balances());
    }

    #[test]
    fn round_robin_uneven_split_matches_s4() {
        let instances = vec![make_instance("i0"), make_instance("i1"), make_instance("i2")];
        let requests = make_requests(10);
        let engine = ClusterEngine::new(
            instances,
            requests,
            Box::new(AlwaysAdmit),
            Box::new(RoundRobin::new()),
            None,
            FreshnessConfig::default(),
            0,
            0,
            1_000_000_000,
            16,
            DecisionTrace::new(&TraceLevel::None),
        );
        let outcome = engine.run();
        let mut counts: Vec<usize> = outcome.completed_by_instance.values().map(|v| v.len()).collect();
        counts.sort();
        assert_eq!(counts, vec![3, 3, 4]);
    }

    #[test]
    fn conservation_holds_with_token_bucket_rejections() {
        let instances = vec![make_instance("i0")];
        let requests = make_requests(10);
        let engine = ClusterEngine::new(
            instances,
            requests,
            Box::new(TokenBucket::new(2.0, 1e-6)),
            Box::new(LeastLoaded),
            None,
            FreshnessConfig::default(),
            100,
            100,
            1_000_000_000,
            16,
            DecisionTrace::new(&TraceLevel::None),
        );
        let outcome = engine.run();
        assert!(outcome.tally.balances());
        assert!(outcome.tally.rejected_at_admission >= 1);
    }

    #[test]
    #[should_panic(expected = "at most once")]
    fn run_is_single_shot() {
        let instances = vec![make_instance("i0")];
        let requests = make_requests(1);
        let engine = ClusterEngine::new(
            instances,
            requests,
            Box::new(AlwaysAdmit),
            Box::new(LeastLoaded),
            None,
            FreshnessConfig::default(),
            0,
            0,
            1_000_000_000,
            16,
            DecisionTrace::new(&TraceLevel::None),
        );
        // `run` consumes `self`, so double-invocation cannot be expressed
        // directly; this test instead documents and exercises the guard
        // path through a manual second call on a reconstructed engine
        // sharing the `ran` flag semantics.
        let mut engine = engine;
        engine.ran = true;
        engine.run();
    }
}
