//! The policy surface: six small, independently pluggable strategy
//! traits consumed by admission, routing, and the per-instance step
//! engine. Every trait takes `&self`; implementations that need mutable
//! state hold it behind `Cell`/`RefCell` so that policies can live in a
//! `Box<dyn Trait>` without forcing `&mut self` through the engine.

pub mod admission;
pub mod batch;
pub mod errors;
pub mod priority;
pub mod routing;
pub mod scheduling;
pub mod scorer;

pub use admission::{
    admission_policy_from_name, AdmissionPolicy, AdmissionPolicyParams, AlwaysAdmit, GateMode,
    SloGated, TokenBucket, ADMISSION_POLICY_NAMES,
};
pub use batch::{
    batch_formation_from_name, BatchFormation, DefaultBatchFormation, SloAwareBatchFormation,
    BATCH_FORMATION_NAMES,
};
pub use errors::PolicyError;
pub use priority::{
    priority_policy_from_name, ConstantPriority, LoadAdaptive, PriorityPolicy,
    PriorityPolicyParams, SloTiered, PRIORITY_POLICY_NAMES,
};
pub use routing::{
    routing_policy_from_name, LeastLoaded, PrefixAffinity, PrefixAffinityIndex, RouteDecision,
    RoundRobin, RoutingPolicy, WeightedScoring, ROUTING_POLICY_NAMES,
};
pub use scheduling::{
    compare as scheduling_compare, scheduling_policy_from_name, Fcfs, PriorityFcfs,
    ReversePriority, SchedulingPolicy, ShortestInputFirst, SCHEDULING_POLICY_NAMES,
};
pub use scorer::{
    scorer_from_name, CacheHitRateScorer, CompositeScorer, KvUtilizationScorer, LoadScorer,
    Scorer, SCORER_NAMES,
};
