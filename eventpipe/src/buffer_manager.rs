//! Buffer allocation, stealing and timestamp-ordered draining for one
//! session, across all of its writing threads (§4.3, C3).

use crate::buffer::{Buffer, RawEventRecord};
use crate::config::PipelineConfig;
use crate::metrics::Metrics;
use crate::thread_state::{BufferCell, ThreadState};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Oldest-first list of every buffer ever allocated for one
/// (session, thread) pair that has not yet been fully drained and
/// dropped.
struct BufferList {
    owner_thread_id: u64,
    cells: Vec<Arc<BufferCell>>,
}

/// One event as it comes out of a drain, with its owning thread
/// attached (the serializer and sequence-point bookkeeping need it).
pub struct DrainedEvent {
    pub os_thread_id: u64,
    pub record: RawEventRecord,
}

pub struct BufferManager {
    budget_bytes: usize,
    allocated_bytes: Mutex<usize>,
    lists: Mutex<HashMap<u64, BufferList>>,
    pending_drain: Mutex<Vec<DrainedEvent>>,
    metrics: Arc<Metrics>,
}

impl BufferManager {
    pub fn new(budget_bytes: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            budget_bytes,
            allocated_bytes: Mutex::new(0),
            lists: Mutex::new(HashMap::new()),
            pending_drain: Mutex::new(Vec::new()),
            metrics,
        }
    }

    /// Slow-path allocation (§4.9 step 2). Tries a fresh buffer
    /// first; on budget exhaustion, steals the globally-oldest
    /// stealable buffer and retries once. Returns `None` if the
    /// event must be dropped.
    pub fn allocate_for_thread(
        &self,
        thread: &ThreadState,
        session_index: usize,
        requested_size: usize,
        config: &PipelineConfig,
        now: i64,
    ) -> Option<Arc<BufferCell>> {
        if let Some(cell) = self.try_fresh_allocation(thread, session_index, requested_size, config, now) {
            return Some(cell);
        }
        if self.steal_oldest(now) {
            return self.try_fresh_allocation(thread, session_index, requested_size, config, now);
        }
        None
    }

    fn try_fresh_allocation(
        &self,
        thread: &ThreadState,
        session_index: usize,
        requested_size: usize,
        config: &PipelineConfig,
        now: i64,
    ) -> Option<Arc<BufferCell>> {
        let growth_step = thread.growth_step(session_index, config.default_growth_step_bytes);
        let size = requested_size.max(growth_step);
        let mut allocated = self.allocated_bytes.lock().unwrap();
        if *allocated + size > self.budget_bytes {
            return None;
        }
        *allocated += size;
        drop(allocated);

        let cell = BufferCell::new(thread.os_thread_id, Buffer::new(size, now));
        let mut lists = self.lists.lock().unwrap();
        lists
            .entry(thread.os_thread_id)
            .or_insert_with(|| BufferList {
                owner_thread_id: thread.os_thread_id,
                cells: Vec::new(),
            })
            .cells
            .push(cell.clone());
        drop(lists);

        thread.advance_growth_step(session_index, growth_step * 2, config.max_growth_step_bytes);
        self.metrics.inc_buffers_allocated();
        Some(cell)
    }

    /// Finds the stealable buffer (Writable, uncontended) with the
    /// smallest `created_at` across every thread's list, drains its
    /// already-written records into `pending`, frees its capacity,
    /// and removes it from its list. Returns whether a victim was
    /// found.
    fn steal_oldest(&self, _now: i64) -> bool {
        let mut lists = self.lists.lock().unwrap();
        let mut best: Option<(u64, usize, i64)> = None; // (owner, index, created_at)
        for list in lists.values() {
            for (idx, cell) in list.cells.iter().enumerate() {
                let guard = match cell.buffer.try_lock() {
                    Some(g) => g,
                    None => continue,
                };
                if guard.state() != crate::buffer::BufferState::Writable {
                    continue;
                }
                let created_at = guard.created_at;
                drop(guard);
                if best.map(|(_, _, best_ts)| created_at < best_ts).unwrap_or(true) {
                    best = Some((list.owner_thread_id, idx, created_at));
                }
            }
        }
        let Some((owner, idx, _)) = best else {
            return false;
        };
        let list = lists.get_mut(&owner).unwrap();
        let cell = list.cells.remove(idx);
        let mut guard = cell.buffer.lock();
        guard.mark_read_only();
        let freed = guard.capacity_bytes();
        let mut stolen = Vec::new();
        while let Some(record) = guard.pop_front() {
            stolen.push(record);
        }
        drop(guard);
        drop(lists);

        *self.allocated_bytes.lock().unwrap() -= freed;
        let mut pending = self.pending_drain.lock().unwrap();
        for record in stolen {
            pending.push(DrainedEvent {
                os_thread_id: owner,
                record,
            });
        }
        self.metrics.inc_buffers_stolen();
        true
    }

    /// Marks every thread's current tail buffer read-only (best
    /// effort: skips any buffer whose owning thread is mid-write),
    /// then merge-sorts every list plus any previously-stolen pending
    /// records by timestamp, draining everything at or before
    /// `stop_timestamp`. The caller (`Session`) derives the sequence
    /// point from `ThreadState` directly, since sequence counters
    /// live there, not here (§4.3, §4.5).
    pub fn write_all_buffers_to_file(&self, stop_timestamp: i64) -> Vec<DrainedEvent> {
        let mut lists = self.lists.lock().unwrap();
        for list in lists.values() {
            if let Some(tail) = list.cells.last() {
                if let Some(mut guard) = tail.buffer.try_lock() {
                    if guard.state() == crate::buffer::BufferState::Writable {
                        guard.mark_read_only();
                    }
                }
            }
        }

        let mut out = Vec::new();
        let mut pending = self.pending_drain.lock().unwrap();
        out.append(&mut pending);
        drop(pending);

        loop {
            let mut best: Option<(u64, usize, i64)> = None;
            for (owner, list) in lists.iter() {
                for (idx, cell) in list.cells.iter().enumerate() {
                    if let Some(guard) = cell.buffer.try_lock() {
                        if let Some(ts) = guard.peek_timestamp() {
                            if ts <= stop_timestamp
                                && best.map(|(_, _, best_ts)| ts < best_ts).unwrap_or(true)
                            {
                                best = Some((*owner, idx, ts));
                            }
                        }
                    }
                }
            }
            let Some((owner, idx, _)) = best else { break };
            let list = lists.get_mut(&owner).unwrap();
            let cell = &list.cells[idx];
            let mut guard = cell.buffer.lock();
            if let Some(record) = guard.pop_front() {
                drop(guard);
                out.push(DrainedEvent {
                    os_thread_id: owner,
                    record,
                });
            }
        }

        // Reclaim fully-drained, read-only buffers.
        let mut reclaimed = 0usize;
        for list in lists.values_mut() {
            let mut i = 0;
            while i < list.cells.len() {
                let drained = {
                    let guard = list.cells[i].buffer.lock();
                    guard.state() == crate::buffer::BufferState::ReadOnly && guard.is_fully_drained()
                };
                if drained {
                    reclaimed += list.cells[i].buffer.lock().capacity_bytes();
                    list.cells.remove(i);
                } else {
                    i += 1;
                }
            }
        }
        if reclaimed > 0 {
            *self.allocated_bytes.lock().unwrap() -= reclaimed;
        }

        out.sort_by_key(|e| e.record.timestamp);
        out
    }

    pub fn allocated_bytes(&self) -> usize {
        *self.allocated_bytes.lock().unwrap()
    }

    /// Streaming variant of drain (§4.3 `GetNextEvent`): pops the
    /// single globally-oldest unread record across every list, with no
    /// `stopTimestamp` cap. Unlike a full drain this never marks a
    /// tail buffer read-only and never reclaims capacity — it is meant
    /// to be called repeatedly by a polling streaming thread between
    /// full drains, not as a substitute for one.
    pub fn get_next_event(&self) -> Option<DrainedEvent> {
        let mut pending = self.pending_drain.lock().unwrap();
        if !pending.is_empty() {
            return Some(pending.remove(0));
        }
        drop(pending);

        let lists = self.lists.lock().unwrap();
        let mut best: Option<(u64, usize, i64)> = None;
        for (owner, list) in lists.iter() {
            for (idx, cell) in list.cells.iter().enumerate() {
                if let Some(guard) = cell.buffer.try_lock() {
                    if let Some(ts) = guard.peek_timestamp() {
                        if best.map(|(_, _, best_ts)| ts < best_ts).unwrap_or(true) {
                            best = Some((*owner, idx, ts));
                        }
                    }
                }
            }
        }
        let (owner, idx, _) = best?;
        let cell = &lists.get(&owner).unwrap().cells[idx];
        let mut guard = cell.buffer.lock();
        let record = guard.pop_front()?;
        Some(DrainedEvent {
            os_thread_id: owner,
            record,
        })
    }
}
