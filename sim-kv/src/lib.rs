//! Block-structured KV cache: a free-list-backed block pool with a
//! prefix-hash index, reference counting, LRU eviction, and an optional
//! CPU offload tier.

use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use sha2::{Digest, Sha256};
use sim_types::{BlockHash, BlockId, Tick};
use thiserror::Error;

/// Computes the hierarchical, prefix-stable block hashes for a token
/// sequence: block `k`'s hash folds in block `k - 1`'s hash, so hashing
/// the first `k` blocks of a longer sequence yields the same `k` hashes
/// as hashing just those first `k` blocks' tokens.
pub fn compute_prefix_hashes(tokens: &[u32], block_size: usize) -> Vec<BlockHash> {
    assert!(block_size > 0, "block_size must be positive");
    let mut hashes = Vec::with_capacity(tokens.len().div_ceil(block_size));
    let mut chain: Option<[u8; 32]> = None;
    let mut i = 0;
    while i < tokens.len() {
        let end = (i + block_size).min(tokens.len());
        let mut hasher = Sha256::new();
        if let Some(prev) = chain {
            hasher.update(prev);
        }
        for t in &tokens[i..end] {
            hasher.update(t.to_le_bytes());
        }
        let digest = hasher.finalize();
        let mut full = [0u8; 32];
        full.copy_from_slice(&digest);
        chain = Some(full);
        let mut short = [0u8; 16];
        short.copy_from_slice(&full[..16]);
        hashes.push(BlockHash(short));
        i = end;
    }
    hashes
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KvError {
    #[error("no free or evictable block available for allocation")]
    AllocationExhausted,
}

/// Notified whenever a hash is evicted from the cache (GPU eviction or
/// CPU-tier eviction), so that router-side prefix indices stay correct.
pub trait EvictionObserver {
    fn on_evict(&self, instance_id: &str, hash: BlockHash);
}

#[derive(Debug)]
struct Block {
    hash: Option<BlockHash>,
    ref_count: u32,
    last_touch: Tick,
}

struct CpuEntry {
    offloaded_at: Tick,
}

/// A single instance's KV cache: a fixed pool of GPU blocks plus an
/// optional CPU tier reached only through eviction.
pub struct KvCache {
    instance_id: String,
    block_size: usize,
    total_blocks: usize,

    blocks: Vec<Block>,
    free_list: VecDeque<BlockId>,
    hash_index: HashMap<BlockHash, BlockId>,
    allocated_count: usize,

    cpu_capacity: usize,
    cpu_blocks: HashMap<BlockHash, CpuEntry>,
    offload_threshold: f64,
    offload_base_latency: Tick,
    offload_bandwidth: u64,
    thrash_window: Tick,
    thrash_count: u64,
    offload_count: u64,
    reload_count: u64,

    hits: u64,
    hit_lookups: u64,

    observers: Vec<Rc<dyn EvictionObserver>>,
}

/// Outcome of a successful `allocate` call.
pub struct AllocateOutcome {
    pub block_ids: Vec<BlockId>,
    pub cache_hits: usize,
    /// Extra tick cost for reloading blocks from the CPU tier, to be
    /// folded into the step that triggered this allocation.
    pub reload_ticks: Tick,
}

impl KvCache {
    pub fn new(
        instance_id: impl Into<String>,
        total_blocks: usize,
        block_size: usize,
        cpu_capacity: usize,
        offload_threshold: f64,
        offload_base_latency: Tick,
        offload_bandwidth: u64,
    ) -> Self {
        let blocks = (0..total_blocks)
            .map(|_| Block {
                hash: None,
                ref_count: 0,
                last_touch: 0,
            })
            .collect();
        let free_list = (0..total_blocks).map(|i| BlockId(i as u32)).collect();
        Self {
            instance_id: instance_id.into(),
            block_size,
            total_blocks,
            blocks,
            free_list,
            hash_index: HashMap::new(),
            allocated_count: 0,
            cpu_capacity,
            cpu_blocks: HashMap::new(),
            offload_threshold,
            offload_base_latency,
            offload_bandwidth: offload_bandwidth.max(1),
            thrash_window: 1000,
            thrash_count: 0,
            offload_count: 0,
            reload_count: 0,
            hits: 0,
            hit_lookups: 0,
            observers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, observer: Rc<dyn EvictionObserver>) {
        self.observers.push(observer);
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    pub fn free_blocks(&self) -> usize {
        self.total_blocks - self.allocated_count
    }

    pub fn allocated_blocks(&self) -> usize {
        self.allocated_count
    }

    pub fn utilization(&self) -> f64 {
        self.allocated_count as f64 / self.total_blocks as f64
    }

    pub fn cache_hit_rate(&self) -> f64 {
        if self.hit_lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.hit_lookups as f64
        }
    }

    pub fn thrash_count(&self) -> u64 {
        self.thrash_count
    }

    /// Blocks needed to hold `prefix_hashes`, after accounting for any
    /// prefix already cached at this instance (GPU or CPU tier).
    pub fn blocks_needed(&self, prefix_hashes: &[BlockHash]) -> usize {
        prefix_hashes
            .iter()
            .filter(|h| !self.hash_index.contains_key(h) && !self.cpu_blocks.contains_key(h))
            .count()
    }

    /// Allocates blocks for the ordered prefix hash chain, transactionally:
    /// on any failure, every partial allocation made during this call is
    /// unwound before returning `Err`.
    pub fn allocate(
        &mut self,
        prefix_hashes: &[BlockHash],
        now: Tick,
    ) -> Result<AllocateOutcome, KvError> {
        let mut acquired: Vec<BlockId> = Vec::with_capacity(prefix_hashes.len());
        let mut cache_hits = 0usize;
        let mut reload_ticks: Tick = 0;

        for hash in prefix_hashes {
            if let Some(&id) = self.hash_index.get(hash) {
                self.touch_hit(id, now);
                acquired.push(id);
                cache_hits += 1;
                continue;
            }

            match self.pop_free_for(*hash, now) {
                Ok(id) => {
                    if let Some(entry) = self.cpu_blocks.remove(hash) {
                        self.reload_count += 1;
                        reload_ticks += self.offload_base_latency
                            + (self.block_size as u64).div_ceil(self.offload_bandwidth);
                        if now.saturating_sub(entry.offloaded_at) < self.thrash_window {
                            self.thrash_count += 1;
                        }
                    }
                    acquired.push(id);
                }
                Err(e) => {
                    self.unwind(&acquired, now);
                    return Err(e);
                }
            }
        }

        self.hit_lookups += prefix_hashes.len() as u64;
        self.hits += cache_hits as u64;
        Ok(AllocateOutcome {
            block_ids: acquired,
            cache_hits,
            reload_ticks,
        })
    }

    /// Allocates one block not tied to any prefix hash, for decode-time
    /// KV growth past a block boundary. Never inserted into the hash
    /// index, so it can never become a future cache hit or a prefix
    /// eviction-observer notification target.
    pub fn allocate_anonymous(&mut self, now: Tick) -> Result<BlockId, KvError> {
        self.pop_free_for_anonymous(now)
    }

    fn pop_free_for_anonymous(&mut self, now: Tick) -> Result<BlockId, KvError> {
        let id = self
            .free_list
            .pop_front()
            .ok_or(KvError::AllocationExhausted)?;
        let block = &mut self.blocks[id.0 as usize];
        if let Some(old_hash) = block.hash.take() {
            self.hash_index.remove(&old_hash);
            self.notify_evict(old_hash);
        }
        block.ref_count = 1;
        block.last_touch = now;
        self.allocated_count += 1;
        Ok(id)
    }

    fn touch_hit(&mut self, id: BlockId, now: Tick) {
        let block = &mut self.blocks[id.0 as usize];
        if block.ref_count == 0 {
            self.free_list.retain(|&b| b != id);
            self.allocated_count += 1;
        }
        block.ref_count += 1;
        block.last_touch = now;
    }

    /// Pops a free block and binds it to `hash`. A popped block that
    /// still carries a hash from a previous tenant is being evicted here,
    /// not beforehand: this is the same code path as "evict-for-allocation",
    /// since a cached-but-unreferenced block sits in the free list until
    /// something needs its slot.
    fn pop_free_for(&mut self, hash: BlockHash, now: Tick) -> Result<BlockId, KvError> {
        let id = self
            .free_list
            .pop_front()
            .ok_or(KvError::AllocationExhausted)?;
        let block = &mut self.blocks[id.0 as usize];
        if let Some(old_hash) = block.hash.take() {
            self.hash_index.remove(&old_hash);
            self.notify_evict(old_hash);
        }
        block.hash = Some(hash);
        block.ref_count = 1;
        block.last_touch = now;
        self.hash_index.insert(hash, id);
        self.allocated_count += 1;
        Ok(id)
    }

    fn unwind(&mut self, acquired: &[BlockId], now: Tick) {
        for &id in acquired {
            self.release_one(id, now);
        }
    }

    /// Releases held blocks. Reference counts hitting zero return the
    /// block to the free list with its hash intact (future cache hits
    /// remain possible) rather than clearing it outright.
    pub fn release(&mut self, ids: &[BlockId], now: Tick) {
        for &id in ids {
            self.release_one(id, now);
        }
        // A single release can free many blocks at once (e.g. an entire
        // preempted request's holdings), so bringing utilization back
        // under the threshold can take more than one migrated block;
        // `offload_one` itself is a no-op once the CPU tier is full or
        // there's nothing left in the free list with content.
        while self.cpu_blocks.len() < self.cpu_capacity && self.utilization() > self.offload_threshold {
            let before = self.cpu_blocks.len();
            self.offload_one(now);
            if self.cpu_blocks.len() == before {
                break;
            }
        }
    }

    fn release_one(&mut self, id: BlockId, now: Tick) {
        let block = &mut self.blocks[id.0 as usize];
        assert!(block.ref_count > 0, "release of a block with zero refcount");
        block.ref_count -= 1;
        if block.ref_count == 0 {
            block.last_touch = now;
            self.free_list.push_back(id);
            self.allocated_count -= 1;
        }
    }

    /// Migrates one free, content-holding GPU block to the CPU tier,
    /// oldest-first, converting its GPU slot back to genuinely empty.
    fn offload_one(&mut self, now: Tick) {
        if self.cpu_blocks.len() >= self.cpu_capacity {
            return;
        }
        let Some(pos) = self
            .free_list
            .iter()
            .position(|&id| self.blocks[id.0 as usize].hash.is_some())
        else {
            return;
        };
        let id = self.free_list.remove(pos).unwrap();
        let block = &mut self.blocks[id.0 as usize];
        let Some(hash) = block.hash.take() else {
            return;
        };
        self.hash_index.remove(&hash);
        self.cpu_blocks.insert(hash, CpuEntry { offloaded_at: now });
        self.offload_count += 1;
        self.free_list.push_front(id);
    }

    fn notify_evict(&self, hash: BlockHash) {
        for obs in &self.observers {
            obs.on_evict(&self.instance_id, hash);
        }
    }

    pub fn offload_count(&self) -> u64 {
        self.offload_count
    }

    pub fn reload_count(&self) -> u64 {
        self.reload_count
    }
}
