//! Per-thread bookkeeping (§4.8, C2) and the registry that lets the
//! suspend-write protocol (§5) see every thread that has ever written
//! an event.

use crate::buffer::Buffer;
use eventpipe_wire::{ActivityId, MAX_SESSIONS};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Sentinel `write_in_progress` value meaning "not currently writing
/// to any session".
pub const IDLE: u32 = u32::MAX;

/// A buffer plus the identity of the thread allowed to write it.
/// Guarded by its own spin lock so a drain can `try_lock` it without
/// blocking the owning thread's hot path under normal operation.
pub struct BufferCell {
    pub owner_thread_id: u64,
    pub buffer: spin::Mutex<Buffer>,
}

impl BufferCell {
    pub fn new(owner_thread_id: u64, buffer: Buffer) -> Arc<Self> {
        Arc::new(Self {
            owner_thread_id,
            buffer: spin::Mutex::new(buffer),
        })
    }
}

/// Bookkeeping for one (thread, session) pair.
struct ThreadSessionSlot {
    current: spin::Mutex<Option<Arc<BufferCell>>>,
    sequence: AtomicU32,
    growth_step_bytes: AtomicU32,
}

impl Default for ThreadSessionSlot {
    fn default() -> Self {
        Self {
            current: spin::Mutex::new(None),
            sequence: AtomicU32::new(0),
            growth_step_bytes: AtomicU32::new(0),
        }
    }
}

/// Per-thread state lazily created on first event write (§4.8).
pub struct ThreadState {
    pub os_thread_id: u64,
    slots: Vec<ThreadSessionSlot>,
    write_in_progress: AtomicU32,
    /// "CurrentThread.ActivityId" (§4.9): the ambient correlation id a
    /// caller that passes `None` to `WriteEvent` inherits. Set by the
    /// embedding runtime, not by this crate.
    activity_id: spin::Mutex<ActivityId>,
}

impl ThreadState {
    fn new(os_thread_id: u64) -> Self {
        Self {
            os_thread_id,
            slots: (0..MAX_SESSIONS).map(|_| ThreadSessionSlot::default()).collect(),
            write_in_progress: AtomicU32::new(IDLE),
            activity_id: spin::Mutex::new(ActivityId::NIL),
        }
    }

    pub fn current_activity_id(&self) -> ActivityId {
        *self.activity_id.lock()
    }

    pub fn set_current_activity_id(&self, id: ActivityId) {
        *self.activity_id.lock() = id;
    }

    /// Publishes "I am about to write to session `index`" with
    /// release semantics, or clears it back to idle when `index` is
    /// `None`. `SuspendWriteEvent` spins on this value (§5).
    pub fn publish_write_in_progress(&self, index: Option<usize>) {
        let value = index.map(|i| i as u32).unwrap_or(IDLE);
        self.write_in_progress.store(value, Ordering::Release);
    }

    pub fn write_in_progress(&self) -> u32 {
        self.write_in_progress.load(Ordering::Acquire)
    }

    pub fn current_buffer(&self, session_index: usize) -> Option<Arc<BufferCell>> {
        self.slots[session_index].current.lock().clone()
    }

    pub fn install_buffer(&self, session_index: usize, cell: Arc<BufferCell>) {
        *self.slots[session_index].current.lock() = Some(cell);
    }

    pub fn clear_buffer(&self, session_index: usize) {
        *self.slots[session_index].current.lock() = None;
    }

    pub fn next_sequence(&self, session_index: usize) -> u32 {
        self.slots[session_index].sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn current_sequence(&self, session_index: usize) -> u32 {
        self.slots[session_index].sequence.load(Ordering::Relaxed)
    }

    pub fn growth_step(&self, session_index: usize, default_step: usize) -> usize {
        let current = self.slots[session_index].growth_step_bytes.load(Ordering::Relaxed);
        if current == 0 {
            default_step
        } else {
            current as usize
        }
    }

    pub fn advance_growth_step(&self, session_index: usize, next: usize, max_step: usize) {
        let clamped = next.min(max_step) as u32;
        self.slots[session_index]
            .growth_step_bytes
            .store(clamped, Ordering::Relaxed);
    }
}

/// Global registry of every thread that has written at least one
/// event, so the suspend-write protocol can enumerate them all.
pub struct ThreadRegistry {
    states: Mutex<Vec<Weak<ThreadState>>>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(Vec::new()),
        }
    }

    fn register(&self, state: &Arc<ThreadState>) {
        let mut states = self.states.lock().unwrap();
        states.retain(|w| w.strong_count() > 0);
        states.push(Arc::downgrade(state));
    }

    /// Live thread states at this instant. Dead threads are dropped
    /// from the registry opportunistically (this crate has no
    /// thread-exit hook on stable Rust; see `DESIGN.md`).
    pub fn live_states(&self) -> Vec<Arc<ThreadState>> {
        let mut states = self.states.lock().unwrap();
        states.retain(|w| w.strong_count() > 0);
        states.iter().filter_map(|w| w.upgrade()).collect()
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn current_os_thread_id() -> u64 {
    // std's ThreadId has no stable numeric representation; hash it to
    // a u64 that is stable for the process lifetime, which is all the
    // wire format and sequence points need.
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish()
}

thread_local! {
    static THREAD_STATE: std::cell::RefCell<Option<Arc<ThreadState>>> = const { std::cell::RefCell::new(None) };
}

/// Returns this thread's `ThreadState`, creating and registering it
/// on first call.
pub fn ensure_thread_state(registry: &ThreadRegistry) -> Arc<ThreadState> {
    THREAD_STATE.with(|cell| {
        let mut slot = cell.borrow_mut();
        if let Some(state) = slot.as_ref() {
            return state.clone();
        }
        let state = Arc::new(ThreadState::new(current_os_thread_id()));
        registry.register(&state);
        *slot = Some(state.clone());
        state
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_increase_monotonically() {
        let ts = ThreadState::new(1);
        assert_eq!(ts.next_sequence(0), 1);
        assert_eq!(ts.next_sequence(0), 2);
        assert_eq!(ts.next_sequence(1), 1);
        assert_eq!(ts.current_sequence(0), 2);
    }

    #[test]
    fn write_in_progress_publishes_and_clears() {
        let ts = ThreadState::new(1);
        assert_eq!(ts.write_in_progress(), IDLE);
        ts.publish_write_in_progress(Some(3));
        assert_eq!(ts.write_in_progress(), 3);
        ts.publish_write_in_progress(None);
        assert_eq!(ts.write_in_progress(), IDLE);
    }

    #[test]
    fn registry_sees_thread_local_state() {
        let registry = ThreadRegistry::new();
        let state = ensure_thread_state(&registry);
        let same = ensure_thread_state(&registry);
        assert!(Arc::ptr_eq(&state, &same));
        assert_eq!(registry.live_states().len(), 1);
    }

    #[test]
    fn growth_step_defaults_then_advances() {
        let ts = ThreadState::new(1);
        assert_eq!(ts.growth_step(0, 4096), 4096);
        ts.advance_growth_step(0, 8192, 1024 * 1024);
        assert_eq!(ts.growth_step(0, 4096), 8192);
        ts.advance_growth_step(0, 4 * 1024 * 1024, 1024 * 1024);
        assert_eq!(ts.growth_step(0, 4096), 1024 * 1024);
    }
}
