use std::cmp::Ordering;

use sim_types::{Request, Tick};

use crate::errors::PolicyError;

/// Produces the ordering key for one request within an instance's wait
/// queue. Lower keys run first. Ties are never the policy's concern: the
/// `compare` helper below always resolves them by arrival tick then by
/// request id, so every implementation here is free to return coarse or
/// even constant keys.
pub trait SchedulingPolicy {
    fn order_key(&self, req: &Request, now: Tick) -> f64;
}

/// Total comparator used by the instance step engine to sort a wait
/// queue: `order_key` first, then arrival tick, then request id — so two
/// policies that both return a constant key still produce the same FCFS
/// tie-broken order as `Fcfs` itself.
pub fn compare(policy: &dyn SchedulingPolicy, a: &Request, b: &Request, now: Tick) -> Ordering {
    let ka = policy.order_key(a, now);
    let kb = policy.order_key(b, now);
    ka.partial_cmp(&kb)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.arrival_tick.cmp(&b.arrival_tick))
        .then_with(|| a.id.cmp(&b.id))
}

pub struct Fcfs;

impl SchedulingPolicy for Fcfs {
    fn order_key(&self, _req: &Request, _now: Tick) -> f64 {
        0.0
    }
}

/// Lower numeric `priority` runs first (matches `PriorityPolicy`'s
/// "lower value = more urgent" convention), otherwise behaves like `Fcfs`.
pub struct PriorityFcfs;

impl SchedulingPolicy for PriorityFcfs {
    fn order_key(&self, req: &Request, _now: Tick) -> f64 {
        req.priority
    }
}

pub struct ShortestInputFirst;

impl SchedulingPolicy for ShortestInputFirst {
    fn order_key(&self, req: &Request, _now: Tick) -> f64 {
        (req.input_tokens.len() - req.prefill_progress) as f64
    }
}

/// The diagnostic inverse of `PriorityFcfs`: highest `priority` runs first.
pub struct ReversePriority;

impl SchedulingPolicy for ReversePriority {
    fn order_key(&self, req: &Request, _now: Tick) -> f64 {
        -req.priority
    }
}

pub const SCHEDULING_POLICY_NAMES: &[&str] =
    &["fcfs", "priority_fcfs", "shortest_input_first", "reverse_priority"];

pub fn scheduling_policy_from_name(name: &str) -> Result<Box<dyn SchedulingPolicy>, PolicyError> {
    match name {
        "fcfs" => Ok(Box::new(Fcfs)),
        "priority_fcfs" => Ok(Box::new(PriorityFcfs)),
        "shortest_input_first" => Ok(Box::new(ShortestInputFirst)),
        "reverse_priority" => Ok(Box::new(ReversePriority)),
        other => Err(PolicyError::UnknownScheduling {
            requested: other.to_string(),
            valid: SCHEDULING_POLICY_NAMES,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim_types::RequestId;

    fn req(id: &str, arrival: u64, priority: f64) -> Request {
        let mut r = Request::new(RequestId::from(id), arrival, vec![1, 2, 3], vec![1]);
        r.priority = priority;
        r
    }

    #[test]
    fn fcfs_ties_break_on_arrival_then_id() {
        let p = Fcfs;
        let a = req("b", 5, 0.0);
        let b = req("a", 5, 0.0);
        let c = req("z", 1, 0.0);
        let mut v = vec![a.clone(), b.clone(), c.clone()];
        v.sort_by(|x, y| compare(&p, x, y, 0));
        let ids: Vec<_> = v.iter().map(|r| r.id.0.clone()).collect();
        assert_eq!(ids, vec!["z", "a", "b"]);
    }

    #[test]
    fn priority_fcfs_orders_lowest_priority_first() {
        let p = PriorityFcfs;
        let high = req("x", 0, 5.0);
        let low = req("y", 1, 1.0);
        assert_eq!(compare(&p, &low, &high, 0), Ordering::Less);
    }

    #[test]
    fn reverse_priority_orders_highest_priority_first() {
        let p = ReversePriority;
        let high = req("x", 0, 5.0);
        let low = req("y", 1, 1.0);
        assert_eq!(compare(&p, &high, &low, 0), Ordering::Less);
    }
}
