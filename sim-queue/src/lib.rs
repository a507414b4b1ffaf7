//! The wait queue and running batch: the two containers a per-instance
//! step cycle moves requests between.

use std::collections::{BTreeMap, VecDeque};

use sim_types::{Request, RequestId};

/// Ordered sequence of `Queued` requests local to one instance. Ordering
/// is policy-defined (`SchedulingPolicy::order`); `push_front` is
/// reserved for preemption, which must return a request to the head of
/// its original arrival cohort rather than the tail.
#[derive(Default)]
pub struct WaitQueue {
    items: VecDeque<Request>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, req: Request) {
        self.items.push_back(req);
    }

    /// Preemption re-entry: the request keeps its progress and returns to
    /// the front, bypassing the normal enqueue path.
    pub fn push_front(&mut self, req: Request) {
        self.items.push_front(req);
    }

    pub fn pop_front(&mut self) -> Option<Request> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Request> {
        self.items.iter()
    }

    pub fn drain(&mut self) -> std::collections::vec_deque::Drain<'_, Request> {
        self.items.drain(..)
    }

    /// Stably reorders the queue by `key`, ties broken by input order
    /// (Rust's sort is stable, so callers only need to supply a primary
    /// key; arrival-then-id tiebreaks should already be folded into it
    /// by the caller if the key alone does not disambiguate).
    pub fn reorder_by_key<K: Ord, F: FnMut(&Request) -> K>(&mut self, mut key_fn: F) {
        let mut v: Vec<Request> = self.items.drain(..).collect();
        v.sort_by_key(|r| key_fn(r));
        self.items = v.into();
    }

    /// Stably reorders the queue with an arbitrary comparator.
    pub fn reorder_by<F: FnMut(&Request, &Request) -> std::cmp::Ordering>(&mut self, mut cmp: F) {
        let mut v: Vec<Request> = self.items.drain(..).collect();
        v.sort_by(|a, b| cmp(a, b));
        self.items = v.into();
    }
}

/// The unordered set of `Running` requests co-batched on an instance.
/// Backed by a `BTreeMap` keyed on request id so that any iteration used
/// in a deterministic computation (batch assembly, metrics accumulation)
/// naturally follows sorted-key order.
#[derive(Default)]
pub struct RunningBatch {
    items: BTreeMap<RequestId, Request>,
}

impl RunningBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, req: Request) {
        self.items.insert(req.id.clone(), req);
    }

    pub fn remove(&mut self, id: &RequestId) -> Option<Request> {
        self.items.remove(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Request> {
        self.items.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Request> {
        self.items.values_mut()
    }

    pub fn ids_sorted(&self) -> Vec<RequestId> {
        self.items.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim_types::RequestId;

    fn req(id: &str, arrival: u64) -> Request {
        Request::new(RequestId::from(id), arrival, vec![1], vec![1])
    }

    #[test]
    fn preemption_reenters_at_head() {
        let mut q = WaitQueue::new();
        q.push_back(req("a", 0));
        q.push_back(req("b", 1));
        q.push_front(req("preempted", 2));
        let first = q.pop_front().unwrap();
        assert_eq!(first.id, RequestId::from("preempted"));
    }

    #[test]
    fn reorder_is_stable_on_equal_keys() {
        let mut q = WaitQueue::new();
        q.push_back(req("a", 5));
        q.push_back(req("b", 5));
        q.push_back(req("c", 1));
        q.reorder_by_key(|r| r.arrival_tick);
        let ids: Vec<_> = q.iter().map(|r| r.id.0.clone()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn running_batch_iterates_in_sorted_id_order() {
        let mut b = RunningBatch::new();
        b.insert(req("zzz", 0));
        b.insert(req("aaa", 0));
        let ids: Vec<_> = b.iter().map(|r| r.id.0.clone()).collect();
        assert_eq!(ids, vec!["aaa", "zzz"]);
    }
}
