use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

use sim_snapshot::RoutingSnapshot;
use sim_types::{Request, Tick};

use crate::errors::PolicyError;

pub trait AdmissionPolicy {
    fn admit(&self, req: &Request, now: Tick, snapshots: &[RoutingSnapshot]) -> (bool, String);
}

pub struct AlwaysAdmit;

impl AdmissionPolicy for AlwaysAdmit {
    fn admit(&self, _req: &Request, _now: Tick, _snapshots: &[RoutingSnapshot]) -> (bool, String) {
        (true, "always_admit".to_string())
    }
}

/// Cost = number of input tokens; refill = `rate_per_sec` tokens/elapsed
/// second, capped at `capacity`.
pub struct TokenBucket {
    capacity: f64,
    rate_per_sec: f64,
    tokens: RefCell<f64>,
    last_refill: Cell<Tick>,
}

impl TokenBucket {
    pub fn new(capacity: f64, rate_per_sec: f64) -> Self {
        Self {
            capacity,
            rate_per_sec,
            tokens: RefCell::new(capacity),
            last_refill: Cell::new(0),
        }
    }
}

impl AdmissionPolicy for TokenBucket {
    fn admit(&self, req: &Request, now: Tick, _snapshots: &[RoutingSnapshot]) -> (bool, String) {
        let elapsed = now.saturating_sub(self.last_refill.get());
        self.last_refill.set(now);
        let refill = self.rate_per_sec * (elapsed as f64 / 1_000_000.0);

        let mut tokens = self.tokens.borrow_mut();
        *tokens = (*tokens + refill).min(self.capacity);

        let cost = req.input_tokens.len() as f64;
        if *tokens >= cost {
            *tokens -= cost;
            (true, "admitted".to_string())
        } else {
            (false, "token_bucket_exhausted".to_string())
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateMode {
    Any,
    All,
}

/// Rejects when any/all instance snapshots' effective load exceeds a
/// per-SLO-class threshold (falling back to `default_threshold` for
/// classes with no entry).
pub struct SloGated {
    thresholds: BTreeMap<String, f64>,
    default_threshold: f64,
    mode: GateMode,
}

impl SloGated {
    pub fn new(default_threshold: f64, mode: GateMode) -> Self {
        Self {
            thresholds: BTreeMap::new(),
            default_threshold,
            mode,
        }
    }

    pub fn with_class_threshold(mut self, class: impl Into<String>, threshold: f64) -> Self {
        self.thresholds.insert(class.into(), threshold);
        self
    }
}

impl AdmissionPolicy for SloGated {
    fn admit(&self, req: &Request, _now: Tick, snapshots: &[RoutingSnapshot]) -> (bool, String) {
        let threshold = self
            .thresholds
            .get(&req.slo_class.0)
            .copied()
            .unwrap_or(self.default_threshold);

        let mut loads = snapshots.iter().map(|s| s.effective_load());
        let triggered = match self.mode {
            GateMode::Any => loads.any(|l| l > threshold),
            GateMode::All => !snapshots.is_empty() && loads.all(|l| l > threshold),
        };

        if triggered {
            (false, "slo_gated".to_string())
        } else {
            (true, "admitted".to_string())
        }
    }
}

pub const ADMISSION_POLICY_NAMES: &[&str] = &["always_admit", "token_bucket", "slo_gated"];

pub struct AdmissionPolicyParams {
    pub token_bucket_capacity: f64,
    pub token_bucket_rate_per_sec: f64,
    pub slo_gated_threshold: f64,
    pub slo_gated_mode: GateMode,
}

pub fn admission_policy_from_name(
    name: &str,
    params: &AdmissionPolicyParams,
) -> Result<Box<dyn AdmissionPolicy>, PolicyError> {
    match name {
        "always_admit" => Ok(Box::new(AlwaysAdmit)),
        "token_bucket" => Ok(Box::new(TokenBucket::new(
            params.token_bucket_capacity,
            params.token_bucket_rate_per_sec,
        ))),
        "slo_gated" => Ok(Box::new(SloGated::new(
            params.slo_gated_threshold,
            params.slo_gated_mode,
        ))),
        other => Err(PolicyError::UnknownAdmission {
            requested: other.to_string(),
            valid: ADMISSION_POLICY_NAMES,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim_types::RequestId;

    fn req(input_len: usize) -> Request {
        Request::new(RequestId::from("r"), 0, vec![0; input_len], vec![0; 5])
    }

    #[test]
    fn token_bucket_rejects_under_burst() {
        // Capacity 2, refill rate effectively zero: ten requests with
        // cost 10 each must produce at least one rejection.
        let bucket = TokenBucket::new(2.0, 1e-6);
        let mut admitted = 0;
        let mut rejected = 0;
        let mut now = 0u64;
        for _ in 0..10 {
            let r = req(10);
            let (ok, _) = bucket.admit(&r, now, &[]);
            if ok {
                admitted += 1;
            } else {
                rejected += 1;
            }
            now += 200_000; // 5 req/s
        }
        assert!(rejected >= 1);
        assert_eq!(admitted + rejected, 10);
    }

    #[test]
    fn always_admit_never_rejects() {
        let p = AlwaysAdmit;
        let r = req(5);
        assert!(p.admit(&r, 0, &[]).0);
    }
}
