//! Phase 1-4 of the per-instance step cycle.

use sim_latency::BatchComposition;
use sim_policy::scheduling_compare;
use sim_types::{Request, RequestId, Tick};

use crate::Instance;

/// Result of running exactly one `StepEvent`.
#[derive(Default)]
pub struct StepReport {
    pub step_time: Tick,
    pub completed: Vec<Request>,
    pub completed_ids: Vec<RequestId>,
    pub ttft_recorded: Vec<RequestId>,
    pub preemptions: u32,
    pub dropped_unservable: Vec<Request>,
    pub work_remains: bool,
}

pub(crate) fn run_step(inst: &mut Instance, now: Tick) -> StepReport {
    let mut report = StepReport::default();

    // Phase 1: priority & ordering.
    {
        let priority = &inst.priority;
        // WaitQueue exposes no iter_mut; reorder needs priorities set
        // first, so drain, mutate, and rebuild. `local_queue_depth` is
        // read before any item is popped back off, so every request in
        // this cohort sees the same depth for this step.
        let local_queue_depth = inst.wait_queue.len();
        let mut items: Vec<Request> = inst.wait_queue.drain().collect();
        for r in items.iter_mut() {
            r.priority = priority.assign(r, now, local_queue_depth);
        }
        for r in items {
            inst.wait_queue.push_back(r);
        }
    }
    {
        let scheduling = &inst.scheduling;
        inst.wait_queue
            .reorder_by(|a, b| scheduling_compare(scheduling.as_ref(), a, b, now));
    }

    // Phase 2(a): continuing requests.
    let block_size = inst.kv.block_size();
    let mut prefill_tokens: u64 = 0;
    let mut cache_miss_prefill_tokens: u64 = 0;
    let mut decode_tokens: u64 = 0;
    let mut any_preemption = false;
    let mut reload_ticks_total: Tick = 0;

    let running_ids = inst.running.ids_sorted();
    for id in running_ids {
        // The request may have been removed already this step (e.g. as a
        // preemption victim chosen while processing an earlier id).
        let Some(mut req) = inst.running.remove(&id) else {
            continue;
        };

        if !req.prefill_done() {
            let chunk = inst
                .batch_formation
                .prefill_chunk_size(&req, inst.limits.chunked_prefill_threshold);
            let start = req.prefill_progress;
            let end = (start + chunk).min(req.input_tokens.len());
            let miss_start = start.max(req.cached_prefix_tokens);
            let miss_tokens = end.saturating_sub(miss_start);

            req.prefill_progress = end;
            prefill_tokens += (end - start) as u64;
            cache_miss_prefill_tokens += miss_tokens as u64;

            if req.prefill_done() && req.ttft_tick.is_none() {
                req.ttft_tick = Some(now);
                report.ttft_recorded.push(req.id.clone());
            }
        } else if !req.decode_done() {
            let before_len = req.input_tokens.len() + req.decode_progress;
            let after_len = before_len + 1;
            let needs_new_block = before_len == 0 || (after_len - 1) / block_size > (before_len - 1) / block_size;

            if needs_new_block {
                match inst.kv.allocate_anonymous(now) {
                    Ok(block_id) => req.kv_blocks.push(block_id),
                    Err(_) => {
                        // `req` was already removed from `inst.running` at the
                        // top of this loop iteration, so it can't select itself.
                        let victim_id = inst.batch_formation.select_preemption_victim(&inst.running);
                        match victim_id {
                            Some(vid) => {
                                if let Some(victim) = inst.running.remove(&vid) {
                                    inst.kv.release(&victim.kv_blocks, now);
                                    let mut victim = victim;
                                    victim.preemption_count += 1;
                                    victim.kv_blocks.clear();
                                    inst.wait_queue.push_front(victim);
                                    inst.preemption_total += 1;
                                    report.preemptions += 1;
                                    any_preemption = true;
                                }
                                match inst.kv.allocate_anonymous(now) {
                                    Ok(block_id) => req.kv_blocks.push(block_id),
                                    Err(_) => {
                                        inst.kv.release(&req.kv_blocks, now);
                                        req.kv_blocks.clear();
                                        report.dropped_unservable.push(req);
                                        continue;
                                    }
                                }
                            }
                            None => {
                                inst.kv.release(&req.kv_blocks, now);
                                req.kv_blocks.clear();
                                report.dropped_unservable.push(req);
                                continue;
                            }
                        }
                    }
                }
            }

            req.decode_progress += 1;
            decode_tokens += 1;
        }

        if req.prefill_done() && req.decode_done() {
            inst.kv.release(&req.kv_blocks, now);
            req.kv_blocks.clear();
            req.state = sim_types::LifecycleState::Completed;
            report.completed_ids.push(req.id.clone());
            report.completed.push(req);
        } else {
            inst.running.insert(req);
        }
    }

    // Phase 2(b): new requests, only if no preemption occurred this step.
    if !any_preemption {
        loop {
            if inst.running.len() >= inst.limits.max_running_reqs {
                break;
            }
            let Some(req) = inst.wait_queue.pop_front() else {
                break;
            };

            let chunk = inst
                .batch_formation
                .prefill_chunk_size(&req, inst.limits.chunked_prefill_threshold);
            if prefill_tokens + decode_tokens + chunk as u64 > inst.limits.max_scheduled_tokens {
                inst.wait_queue.push_front(req);
                break;
            }

            // A request whose prefix alone needs more blocks than the
            // cache could ever hold can never be served, even on a
            // completely empty instance. Left at the queue head it would
            // block every other request forever, so it is dropped here
            // instead of bouncing back to `push_front`.
            if inst.kv.blocks_needed(&req.prefix_hashes) > inst.kv.total_blocks() {
                report.dropped_unservable.push(req);
                continue;
            }

            match inst.kv.allocate(&req.prefix_hashes, now) {
                Ok(outcome) => {
                    let mut req = req;
                    req.kv_blocks = outcome.block_ids;
                    req.cached_prefix_tokens =
                        (outcome.cache_hits * block_size).min(req.input_tokens.len());
                    reload_ticks_total += outcome.reload_ticks;
                    req.state = sim_types::LifecycleState::Running;
                    req.queueing_overhead = inst
                        .latency
                        .request_overhead(req.input_tokens.len(), req.output_tokens.len());

                    let start = req.prefill_progress;
                    let end = (start + chunk).min(req.input_tokens.len());
                    let miss_start = start.max(req.cached_prefix_tokens);
                    let miss_tokens = end.saturating_sub(miss_start);
                    req.prefill_progress = end;
                    prefill_tokens += (end - start) as u64;
                    cache_miss_prefill_tokens += miss_tokens as u64;

                    if req.prefill_done() && req.ttft_tick.is_none() {
                        req.ttft_tick = Some(now);
                        report.ttft_recorded.push(req.id.clone());
                    }

                    if req.prefill_done() && req.decode_done() {
                        inst.kv.release(&req.kv_blocks, now);
                        req.kv_blocks.clear();
                        req.state = sim_types::LifecycleState::Completed;
                        report.completed_ids.push(req.id.clone());
                        report.completed.push(req);
                    } else {
                        inst.running.insert(req);
                    }
                }
                Err(_) => {
                    inst.wait_queue.push_front(req);
                    break;
                }
            }
        }
    }

    // Phase 3: latency.
    let composition = BatchComposition {
        prefill_tokens,
        cache_miss_prefill_tokens,
        decode_tokens,
    };
    report.step_time = inst.latency.step_time(&composition) + reload_ticks_total;

    for req in report.completed.iter_mut() {
        if req.ttft_tick == Some(now) {
            req.ttft_tick = Some(now + report.step_time + req.queueing_overhead);
        }
        req.completion_tick = Some(now + report.step_time + req.queueing_overhead);
    }
    for id in &report.ttft_recorded {
        if let Some(req) = inst.running.iter_mut().find(|r| &r.id == id) {
            if req.ttft_tick == Some(now) {
                req.ttft_tick = Some(now + report.step_time + req.queueing_overhead);
            }
        }
    }

    inst.peak_kv_watermark = inst.peak_kv_watermark.max(inst.kv.allocated_blocks());
    report.work_remains = !inst.wait_queue.is_empty() || !inst.running.is_empty();

    report
}
