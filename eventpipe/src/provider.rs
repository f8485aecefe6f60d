//! Providers and events (§3, §4.7, C4).

use eventpipe_wire::MAX_SESSIONS;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// `LogAlways`: an event at this level is enabled regardless of the
/// session's requested level.
pub const LEVEL_LOG_ALWAYS: u8 = 0;
pub const LEVEL_VERBOSE: u8 = 5;

#[derive(Copy, Clone, Debug, Default)]
struct SessionFilter {
    keywords: u64,
    level: u8,
    enabled: bool,
}

/// One event definition, owned by its `Provider`.
pub struct EventDef {
    pub id: u32,
    pub version: u32,
    pub level: u8,
    pub keywords: u64,
    pub need_stack: bool,
    pub metadata_blob: Vec<u8>,
    enabled_any: AtomicBool,
}

impl EventDef {
    pub fn new(id: u32, version: u32, level: u8, keywords: u64, need_stack: bool) -> Self {
        Self {
            id,
            version,
            level,
            keywords,
            need_stack,
            metadata_blob: Vec::new(),
            enabled_any: AtomicBool::new(false),
        }
    }

    pub fn with_metadata(mut self, blob: Vec<u8>) -> Self {
        self.metadata_blob = blob;
        self
    }

    /// The hot-path guard: true iff some currently-enabled session
    /// would admit this event.
    pub fn is_enabled(&self) -> bool {
        self.enabled_any.load(Ordering::Relaxed)
    }

    fn admits(&self, filter: &SessionFilter) -> bool {
        filter.enabled
            && (self.keywords == 0 || self.keywords & filter.keywords != 0)
            && (self.level == LEVEL_LOG_ALWAYS || filter.level >= self.level)
    }
}

/// A named namespace of events (§3, §4.7).
pub struct Provider {
    pub name: String,
    events: RwLock<Vec<Arc<EventDef>>>,
    session_enabled_mask: AtomicU64,
    filters: RwLock<[SessionFilter; MAX_SESSIONS]>,
    deferred_delete: AtomicBool,
    #[allow(clippy::type_complexity)]
    callback: RwLock<Option<Arc<dyn Fn(&CallbackData) + Send + Sync>>>,
}

impl Provider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: RwLock::new(Vec::new()),
            session_enabled_mask: AtomicU64::new(0),
            filters: RwLock::new([SessionFilter::default(); MAX_SESSIONS]),
            deferred_delete: AtomicBool::new(false),
            callback: RwLock::new(None),
        }
    }

    pub fn set_callback<F>(&self, f: F)
    where
        F: Fn(&CallbackData) + Send + Sync + 'static,
    {
        *self.callback.write().unwrap() = Some(Arc::new(f));
    }

    pub fn add_event(&self, event: EventDef) -> Arc<EventDef> {
        let event = Arc::new(event);
        self.events.write().unwrap().push(event.clone());
        self.refresh_event(&event);
        event
    }

    pub fn events(&self) -> Vec<Arc<EventDef>> {
        self.events.read().unwrap().clone()
    }

    pub fn is_enabled_in_session(&self, session_index: usize) -> bool {
        self.session_enabled_mask.load(Ordering::Acquire) & (1 << session_index) != 0
    }

    /// Applies a session's provider-config: sets keywords/level for
    /// `session_index`, marks the mask bit, and refreshes every
    /// event's cached enabled state. Returns the `CallbackData` the
    /// caller should queue for post-unlock dispatch (§4.1, §4.2).
    pub fn set_configuration(
        &self,
        session_index: usize,
        session_id: u64,
        keywords: u64,
        level: u8,
    ) -> CallbackData {
        {
            let mut filters = self.filters.write().unwrap();
            filters[session_index] = SessionFilter {
                keywords,
                level,
                enabled: true,
            };
        }
        self.session_enabled_mask
            .fetch_or(1 << session_index, Ordering::Release);
        self.refresh_all_events();
        CallbackData {
            provider_name: self.name.clone(),
            is_enabled: true,
            keywords,
            level,
            session_id,
        }
    }

    pub fn clear_configuration(&self, session_index: usize, session_id: u64) -> CallbackData {
        {
            let mut filters = self.filters.write().unwrap();
            filters[session_index] = SessionFilter::default();
        }
        self.session_enabled_mask
            .fetch_and(!(1 << session_index), Ordering::Release);
        self.refresh_all_events();
        CallbackData {
            provider_name: self.name.clone(),
            is_enabled: false,
            keywords: 0,
            level: 0,
            session_id,
        }
    }

    pub fn refresh_all_events(&self) {
        for event in self.events.read().unwrap().iter() {
            self.refresh_event(event);
        }
    }

    fn refresh_event(&self, event: &EventDef) {
        let filters = self.filters.read().unwrap();
        let enabled = filters.iter().any(|f| event.admits(f));
        event.enabled_any.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled_for(&self, event: &EventDef, session_index: usize) -> bool {
        let filters = self.filters.read().unwrap();
        event.admits(&filters[session_index])
    }

    pub fn mark_deferred_delete(&self) {
        self.deferred_delete.store(true, Ordering::Relaxed);
    }

    pub fn is_deferred_delete(&self) -> bool {
        self.deferred_delete.load(Ordering::Relaxed)
    }

    pub fn invoke_callback(&self, data: &CallbackData) {
        let callback = self.callback.read().unwrap().clone();
        if let Some(cb) = callback {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(data)));
            if result.is_err() {
                log::warn!("provider '{}' callback panicked, ignoring", self.name);
            }
        }
    }
}

/// Queued record produced by `Configuration::enable`/`disable`,
/// dispatched to the provider's callback after the config lock is
/// released (§4.1, §4.2).
#[derive(Debug, Clone)]
pub struct CallbackData {
    pub provider_name: String,
    pub is_enabled: bool,
    pub keywords: u64,
    pub level: u8,
    pub session_id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_enabled_by_matching_keyword_and_level() {
        let provider = Provider::new("P");
        let event = provider.add_event(EventDef::new(1, 0, 3, 0x1, false));
        assert!(!event.is_enabled());
        provider.set_configuration(0, 1, 0xFFFF, 5);
        assert!(event.is_enabled());
        assert!(provider.is_enabled_for(&event, 0));
    }

    #[test]
    fn event_disabled_when_keyword_mismatch() {
        let provider = Provider::new("P");
        let event = provider.add_event(EventDef::new(1, 0, 3, 0x2, false));
        provider.set_configuration(0, 1, 0x1, 5);
        assert!(!event.is_enabled());
    }

    #[test]
    fn log_always_ignores_session_level() {
        let provider = Provider::new("P");
        let event = provider.add_event(EventDef::new(1, 0, LEVEL_LOG_ALWAYS, 0, false));
        provider.set_configuration(0, 1, 0, 0);
        assert!(event.is_enabled());
    }

    #[test]
    fn clearing_configuration_disables_event() {
        let provider = Provider::new("P");
        let event = provider.add_event(EventDef::new(1, 0, 1, 0, false));
        provider.set_configuration(0, 1, 0, 5);
        assert!(event.is_enabled());
        provider.clear_configuration(0, 1);
        assert!(!event.is_enabled());
    }

    #[test]
    fn callback_panic_is_swallowed() {
        let provider = Provider::new("P");
        provider.set_callback(|_data| panic!("boom"));
        let data = CallbackData {
            provider_name: "P".into(),
            is_enabled: true,
            keywords: 0,
            level: 0,
            session_id: 1,
        };
        provider.invoke_callback(&data);
    }
}
