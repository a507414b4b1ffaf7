//! The routing snapshot provider: the sole legitimate path from instance
//! state to routing policies, with per-field freshness tiers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sim_types::Tick;

/// Implemented by whatever type owns per-instance live state (the
/// per-instance step engine), so this crate never needs to depend on it.
pub trait InstanceObservable {
    fn instance_id(&self) -> &str;
    fn queue_depth(&self) -> usize;
    fn batch_size(&self) -> usize;
    fn kv_utilization(&self) -> f64;
    fn free_kv_blocks(&self) -> usize;
    fn cache_hit_rate(&self) -> f64;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FreshnessMode {
    /// Re-read live state on every access.
    Immediate,
    /// Cached for `interval` ticks since the last refresh.
    Periodic { interval: Tick },
    /// Updated only by an explicit `refresh_all` call.
    OnDemand,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FreshnessConfig {
    pub queue_depth: FreshnessMode,
    pub batch_size: FreshnessMode,
    pub kv_utilization: FreshnessMode,
    pub free_kv_blocks: FreshnessMode,
    pub cache_hit_rate: FreshnessMode,
    pub in_flight: FreshnessMode,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            queue_depth: FreshnessMode::Immediate,
            batch_size: FreshnessMode::Immediate,
            in_flight: FreshnessMode::Immediate,
            kv_utilization: FreshnessMode::Periodic { interval: 100 },
            free_kv_blocks: FreshnessMode::Periodic { interval: 100 },
            cache_hit_rate: FreshnessMode::Periodic { interval: 100 },
        }
    }
}

#[derive(Clone, Copy, Default)]
struct Cached<T: Copy> {
    value: T,
    as_of: Tick,
}

#[derive(Default)]
struct PerInstanceCache {
    queue_depth: Option<Cached<usize>>,
    batch_size: Option<Cached<usize>>,
    kv_utilization: Option<Cached<f64>>,
    free_kv_blocks: Option<Cached<usize>>,
    cache_hit_rate: Option<Cached<f64>>,
    in_flight: Option<Cached<usize>>,
}

/// An immutable value copy of one instance's observable state at a given
/// tick. Once produced, later mutation of the instance must never
/// retroactively change a snapshot already handed out (value semantics:
/// trivially true here since `RoutingSnapshot` owns everything it holds).
#[derive(Clone, Debug, PartialEq)]
pub struct RoutingSnapshot {
    pub id: String,
    pub queue_depth: usize,
    pub batch_size: usize,
    pub kv_utilization: f64,
    pub free_kv_blocks: usize,
    pub cache_hit_rate: f64,
    pub in_flight: usize,
}

impl RoutingSnapshot {
    pub fn effective_load(&self) -> f64 {
        (self.queue_depth + self.batch_size + self.in_flight) as f64
    }
}

pub struct SnapshotProvider {
    config: FreshnessConfig,
    caches: HashMap<String, PerInstanceCache>,
}

impl SnapshotProvider {
    pub fn new(config: FreshnessConfig) -> Self {
        Self {
            config,
            caches: HashMap::new(),
        }
    }

    fn resolve<T: Copy>(
        mode: FreshnessMode,
        cached: &mut Option<Cached<T>>,
        now: Tick,
        live: impl FnOnce() -> T,
    ) -> T {
        match mode {
            FreshnessMode::Immediate => {
                let v = live();
                *cached = Some(Cached { value: v, as_of: now });
                v
            }
            FreshnessMode::Periodic { interval } => match cached {
                Some(c) if now.saturating_sub(c.as_of) < interval => c.value,
                _ => {
                    let v = live();
                    *cached = Some(Cached { value: v, as_of: now });
                    v
                }
            },
            FreshnessMode::OnDemand => match cached {
                Some(c) => c.value,
                None => {
                    let v = live();
                    *cached = Some(Cached { value: v, as_of: now });
                    v
                }
            },
        }
    }

    /// Produces a snapshot for one instance, respecting each field's
    /// configured freshness tier. `in_flight` is supplied by the caller
    /// (the cluster engine owns that counter, not the instance).
    pub fn snapshot(
        &mut self,
        instance: &dyn InstanceObservable,
        in_flight: usize,
        now: Tick,
    ) -> RoutingSnapshot {
        let id = instance.instance_id().to_string();
        let entry = self.caches.entry(id.clone()).or_default();

        let queue_depth = Self::resolve(self.config.queue_depth, &mut entry.queue_depth, now, || {
            instance.queue_depth()
        });
        let batch_size = Self::resolve(self.config.batch_size, &mut entry.batch_size, now, || {
            instance.batch_size()
        });
        let kv_utilization = Self::resolve(self.config.kv_utilization, &mut entry.kv_utilization, now, || {
            instance.kv_utilization()
        });
        let free_kv_blocks = Self::resolve(self.config.free_kv_blocks, &mut entry.free_kv_blocks, now, || {
            instance.free_kv_blocks()
        });
        let cache_hit_rate = Self::resolve(self.config.cache_hit_rate, &mut entry.cache_hit_rate, now, || {
            instance.cache_hit_rate()
        });
        let in_flight_resolved = Self::resolve(self.config.in_flight, &mut entry.in_flight, now, || in_flight);

        RoutingSnapshot {
            id,
            queue_depth,
            batch_size,
            kv_utilization,
            free_kv_blocks,
            cache_hit_rate,
            in_flight: in_flight_resolved,
        }
    }

    /// Forces every `OnDemand` (and stale `Periodic`) field to re-read
    /// live state for every instance listed.
    pub fn refresh_all(&mut self, instances: &[&dyn InstanceObservable], in_flight: &HashMap<String, usize>, now: Tick) {
        for instance in instances {
            let id = instance.instance_id().to_string();
            let flight = *in_flight.get(&id).unwrap_or(&0);
            let entry = self.caches.entry(id).or_default();
            entry.queue_depth = Some(Cached { value: instance.queue_depth(), as_of: now });
            entry.batch_size = Some(Cached { value: instance.batch_size(), as_of: now });
            entry.kv_utilization = Some(Cached { value: instance.kv_utilization(), as_of: now });
            entry.free_kv_blocks = Some(Cached { value: instance.free_kv_blocks(), as_of: now });
            entry.cache_hit_rate = Some(Cached { value: instance.cache_hit_rate(), as_of: now });
            entry.in_flight = Some(Cached { value: flight, as_of: now });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct FakeInstance {
        id: String,
        queue_depth: Cell<usize>,
    }

    impl InstanceObservable for FakeInstance {
        fn instance_id(&self) -> &str {
            &self.id
        }
        fn queue_depth(&self) -> usize {
            self.queue_depth.get()
        }
        fn batch_size(&self) -> usize {
            0
        }
        fn kv_utilization(&self) -> f64 {
            0.0
        }
        fn free_kv_blocks(&self) -> usize {
            0
        }
        fn cache_hit_rate(&self) -> f64 {
            0.0
        }
    }

    #[test]
    fn immediate_snapshot_does_not_retroactively_mutate() {
        let inst = FakeInstance {
            id: "i0".into(),
            queue_depth: Cell::new(1),
        };
        let mut provider = SnapshotProvider::new(FreshnessConfig::default());
        let snap = provider.snapshot(&inst, 0, 0);
        assert_eq!(snap.queue_depth, 1);

        inst.queue_depth.set(99);

        // The earlier snapshot value is untouched even though the
        // instance's live state changed afterward.
        assert_eq!(snap.queue_depth, 1);
    }

    #[test]
    fn periodic_field_is_cached_within_interval() {
        let inst = FakeInstance {
            id: "i0".into(),
            queue_depth: Cell::new(1),
        };
        let mut config = FreshnessConfig::default();
        config.queue_depth = FreshnessMode::Periodic { interval: 100 };
        let mut provider = SnapshotProvider::new(config);

        let first = provider.snapshot(&inst, 0, 0);
        inst.queue_depth.set(42);
        let second = provider.snapshot(&inst, 0, 50);
        assert_eq!(first.queue_depth, second.queue_depth);

        let third = provider.snapshot(&inst, 0, 200);
        assert_eq!(third.queue_depth, 42);
    }
}
