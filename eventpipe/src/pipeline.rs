//! Top-level facade (§4.1, C9): `Initialize`/`FinishInitialize`,
//! `Enable`/`StartStreaming`/`Disable`, and the hot-path `WriteEvent`
//! dispatcher that fans a single call out across every enabled
//! session.

use crate::buffer_manager::DrainedEvent;
use crate::clock::{Clock, SystemClock};
use crate::config::{EnvEnablement, PipelineConfig};
use crate::configuration::{Configuration, ProviderConfig};
use crate::error::{PipelineError, Result};
use crate::metrics::Metrics;
use crate::provider::{EventDef, Provider};
use crate::session::{NullRundownEnumerator, RundownEnumerator, Session, SessionMode};
use crate::stack::{NullStackWalker, StackWalker};
use crate::stream_writer::{file_sink, StreamWriter};
use crate::thread_state::{ensure_thread_state, ThreadRegistry};
use eventpipe_wire::{ActivityId, FormatVersion, MAX_SESSIONS};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// §4.10: `NotInitialized -> Initialized -> ShuttingDown`. Monotone,
/// terminal.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineState {
    NotInitialized = 0,
    Initialized = 1,
    ShuttingDown = 2,
}

impl From<u8> for PipelineState {
    fn from(v: u8) -> Self {
        match v {
            1 => PipelineState::Initialized,
            2 => PipelineState::ShuttingDown,
            _ => PipelineState::NotInitialized,
        }
    }
}

/// Everything `Pipeline::enable` needs to construct a `Session`.
/// `sink: None` is one of the "invalid args" cases in §4.11 (the
/// caller asked for a session with nowhere to write).
pub struct EnableRequest {
    pub sink: Option<Box<dyn StreamWriter>>,
    pub mode: SessionMode,
    pub circular_buffer_mb: usize,
    pub format: FormatVersion,
    pub rundown_requested: bool,
    pub providers: Vec<ProviderConfig>,
}

impl EnableRequest {
    fn validate(&self) -> Result<()> {
        if self.sink.is_none() {
            return Err(PipelineError::InvalidProviderConfig(
                "session requires an output sink",
            ));
        }
        if self.circular_buffer_mb == 0 {
            return Err(PipelineError::InvalidProviderConfig(
                "circular buffer size must be non-zero",
            ));
        }
        if self.providers.is_empty() {
            return Err(PipelineError::InvalidProviderConfig(
                "session requires at least one provider",
            ));
        }
        for p in &self.providers {
            p.validate()?;
        }
        Ok(())
    }
}

struct SessionSlot {
    session: Option<Arc<Session>>,
}

/// The pipeline singleton (§4.1, C9). Owns the session table
/// exclusively; everything else (providers, buffers, sinks) is owned
/// further down the tree per §3's ownership summary.
pub struct Pipeline {
    state: AtomicU8,
    config_lock: Mutex<()>,
    sessions: RwLock<Vec<SessionSlot>>,
    /// Release/acquire-guarded mirror of slot occupancy (§4.1
    /// invariant, §5 suspend protocol). The session table itself is
    /// only ever mutated under `config_lock`; this mask is what the
    /// hot path actually reads.
    allow_write_mask: AtomicU64,
    configuration: Configuration,
    thread_registry: Arc<ThreadRegistry>,
    clock: Arc<dyn Clock>,
    stack_walker: Arc<dyn StackWalker>,
    rundown_enumerator: Arc<dyn RundownEnumerator>,
    metrics: Arc<Metrics>,
    config: Arc<PipelineConfig>,
    /// True once the embedding runtime has reached the point where it
    /// is safe to spawn OS threads (§4.1 `FinishInitialize`).
    threads_startable: Mutex<bool>,
    deferred_streaming: Mutex<Vec<u64>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::with_collaborators(
            Arc::new(SystemClock::new()),
            Arc::new(NullStackWalker),
            Arc::new(NullRundownEnumerator),
        )
    }

    pub fn with_collaborators(
        clock: Arc<dyn Clock>,
        stack_walker: Arc<dyn StackWalker>,
        rundown_enumerator: Arc<dyn RundownEnumerator>,
    ) -> Self {
        let max_sessions = PipelineConfig::load().max_sessions.min(MAX_SESSIONS);
        Self {
            state: AtomicU8::new(PipelineState::NotInitialized as u8),
            config_lock: Mutex::new(()),
            sessions: RwLock::new((0..max_sessions).map(|_| SessionSlot { session: None }).collect()),
            allow_write_mask: AtomicU64::new(0),
            configuration: Configuration::new(),
            thread_registry: Arc::new(ThreadRegistry::new()),
            clock,
            stack_walker,
            rundown_enumerator,
            metrics: Arc::new(Metrics::new()),
            config: Arc::new(PipelineConfig::load()),
            threads_startable: Mutex::new(false),
            deferred_streaming: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> PipelineState {
        PipelineState::from(self.state.load(Ordering::Acquire))
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Once-only (§4.1). Also applies the environment-driven
    /// auto-enablement opt-in (§6.3) if present; a malformed opt-in is
    /// logged and otherwise ignored, never fails `initialize`.
    pub fn initialize(self: &Arc<Self>) -> Result<()> {
        if self
            .state
            .compare_exchange(
                PipelineState::NotInitialized as u8,
                PipelineState::Initialized as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(PipelineError::AlreadyInitialized);
        }
        if let Some(env) = EnvEnablement::from_env() {
            match file_sink(&env.output_path) {
                Ok(sink) => {
                    let providers = env
                        .providers
                        .iter()
                        .map(|p| ProviderConfig {
                            name: p.name.clone(),
                            keywords: p.keywords,
                            level: p.level,
                        })
                        .collect();
                    let req = EnableRequest {
                        sink: Some(Box::new(sink)),
                        mode: SessionMode::File { flush_interval: None },
                        circular_buffer_mb: 1,
                        format: FormatVersion::V4HeaderCompressed,
                        rundown_requested: false,
                        providers,
                    };
                    match self.enable_checked(req) {
                        Ok(id) => log::info!("environment-driven session {id} enabled"),
                        Err(e) => log::warn!("environment-driven session rejected: {e}"),
                    }
                }
                Err(e) => log::warn!(
                    "environment-driven session: failed to open '{}': {e}",
                    env.output_path
                ),
            }
        }
        Ok(())
    }

    /// The point in runtime start-up after which OS threads may be
    /// spawned safely (§4.1 ADDED). Drains `StartStreaming` requests
    /// that arrived too early.
    pub fn finish_initialize(&self) {
        *self.threads_startable.lock().unwrap() = true;
        let pending = std::mem::take(&mut *self.deferred_streaming.lock().unwrap());
        for id in pending {
            if let Some(session) = self.find_session(id) {
                session.start_background_thread();
            }
        }
    }

    fn require_initialized(&self) -> Result<()> {
        if self.state() != PipelineState::Initialized {
            return Err(PipelineError::NotInitialized);
        }
        Ok(())
    }

    fn find_session(&self, session_id: u64) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap()
            .iter()
            .find_map(|slot| slot.session.as_ref().filter(|s| s.id == session_id).cloned())
    }

    fn active_session_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap()
            .iter()
            .filter(|s| s.session.is_some())
            .count()
    }

    /// Typed `Enable` (§4.1, §7 Rust rendering). The public
    /// zero-on-failure adapter is [`Pipeline::enable`].
    pub fn enable_checked(self: &Arc<Self>, req: EnableRequest) -> Result<u64> {
        self.require_initialized()?;
        req.validate()?;
        let sink = req.sink.expect("validated above");

        let _guard = self.config_lock.lock().unwrap();
        let index = {
            let sessions = self.sessions.read().unwrap();
            sessions
                .iter()
                .position(|s| s.session.is_none())
                .ok_or(PipelineError::SessionTableFull(sessions.len()))?
        };
        let session_id = 1u64 << index;
        let auto_start_flush = matches!(&req.mode, SessionMode::File { flush_interval: Some(_) });

        let session = Session::new(
            session_id,
            index,
            req.format,
            req.circular_buffer_mb * 1024 * 1024,
            req.providers.clone(),
            req.rundown_requested,
            sink,
            req.mode,
            self.thread_registry.clone(),
            self.clock.clone(),
            self.stack_walker.clone(),
            self.metrics.clone(),
            self.config.clone(),
        );

        self.sessions.write().unwrap()[index].session = Some(session.clone());
        // Release-store *after* the slot is populated (§4.1 invariant).
        self.allow_write_mask.fetch_or(1u64 << index, Ordering::Release);
        session.publish();

        let callbacks = self.configuration.enable(index, session_id, &req.providers);
        drop(_guard);
        for cb in callbacks {
            if let Some(provider) = self.configuration.get_provider(&cb.provider_name) {
                provider.invoke_callback(&cb);
            }
        }

        if auto_start_flush {
            session.start_background_thread();
        }

        Ok(session_id)
    }

    /// Legacy zero-on-failure convention (§4.11 table): every
    /// precondition failure `Enable` can hit collapses to `id = 0`.
    pub fn enable(self: &Arc<Self>, req: EnableRequest) -> u64 {
        match self.enable_checked(req) {
            Ok(id) => id,
            Err(e) => {
                log::warn!("enable rejected: {e}");
                0
            }
        }
    }

    /// `StartStreaming` (§4.1). Deferred into a queue if the runtime
    /// has not yet reached `FinishInitialize`.
    pub fn start_streaming(&self, session_id: u64) -> Result<()> {
        self.require_initialized()?;
        let Some(session) = self.find_session(session_id) else {
            return Err(PipelineError::UnknownSession);
        };
        if *self.threads_startable.lock().unwrap() {
            session.start_background_thread();
        } else {
            self.deferred_streaming.lock().unwrap().push(session_id);
        }
        Ok(())
    }

    /// Hot path (§4.9). Never returns an error: a disabled event, an
    /// uninitialized pipeline, and a dropped write are all silent.
    pub fn write_event(
        &self,
        provider_name: &str,
        event: &Arc<EventDef>,
        payload: &[u8],
        activity_id: Option<ActivityId>,
        related_activity_id: Option<ActivityId>,
    ) {
        if self.state() != PipelineState::Initialized {
            return;
        }
        if !event.is_enabled() {
            return;
        }
        let Some(provider) = self.configuration.get_provider(provider_name) else {
            return;
        };
        let thread = ensure_thread_state(&self.thread_registry);
        let activity_id = activity_id.unwrap_or_else(|| thread.current_activity_id());
        let related_activity_id = related_activity_id.unwrap_or(ActivityId::NIL);

        let mask = self.allow_write_mask.load(Ordering::Acquire);
        let slot_count = self.sessions.read().unwrap().len();
        for i in 0..slot_count {
            if mask & (1u64 << i) == 0 {
                continue;
            }
            // Per-session admission (§3 Event invariant, §8 property 8):
            // the aggregate `event.is_enabled()` check above only tells
            // us *some* session wants this event, not that *this* one
            // does, so every session's own keyword/level filter must be
            // consulted before it sees the record.
            if !provider.is_enabled_for(event, i) {
                continue;
            }
            thread.publish_write_in_progress(Some(i));
            let session = self.sessions.read().unwrap()[i].session.clone();
            if let Some(session) = session {
                session.write_event(
                    &thread,
                    provider_name,
                    event,
                    payload,
                    activity_id,
                    related_activity_id,
                    None,
                );
            }
            thread.publish_write_in_progress(None);
        }
    }

    /// `GetNextEvent` (§4.1, §4.3).
    pub fn get_next_event(&self, session_id: u64) -> Option<DrainedEvent> {
        self.find_session(session_id)?.get_next_event()
    }

    /// Symmetric teardown (§5): `SuspendWriteEvent` -> final drain ->
    /// optional rundown -> final sequence point -> free buffers ->
    /// free session. Idempotent on an unknown id.
    pub fn disable(&self, session_id: u64) {
        let _guard = self.config_lock.lock().unwrap();
        let Some(index) = self
            .sessions
            .read()
            .unwrap()
            .iter()
            .position(|s| s.session.as_ref().is_some_and(|s| s.id == session_id))
        else {
            return;
        };
        let session = self.sessions.read().unwrap()[index].session.clone().unwrap();

        if self.state() == PipelineState::ShuttingDown {
            // §4.11: skip drain and teardown to avoid touching invalid TLS.
            self.allow_write_mask.fetch_and(!(1u64 << index), Ordering::Release);
            self.sessions.write().unwrap()[index].session = None;
            return;
        }

        self.suspend_write_event(index);

        let stop_timestamp = self.clock.now_qpc();
        session.drain(stop_timestamp);

        session.stop_background_thread();

        if session.rundown_requested() {
            session.enter_rundown_optional();
            let thread = ensure_thread_state(&self.thread_registry);
            session.execute_rundown(&thread, self.rundown_enumerator.as_ref());
            session.drain(self.clock.now_qpc());
        }

        session.finish_end_of_stream();

        let callbacks = self.configuration.disable(index, session_id);
        self.sessions.write().unwrap()[index].session = None;
        drop(_guard);

        for cb in callbacks {
            if let Some(provider) = self.configuration.get_provider(&cb.provider_name) {
                provider.invoke_callback(&cb);
            }
        }
        self.configuration.delete_deferred_providers(self.active_session_count());
    }

    /// The cross-thread handshake of §5: clears the allow-write bit
    /// with release semantics, then spins on every live thread's
    /// `write_in_progress` until none are mid-write to `index`.
    fn suspend_write_event(&self, index: usize) {
        self.allow_write_mask.fetch_and(!(1u64 << index), Ordering::Release);
        for thread in self.thread_registry.live_states() {
            while thread.write_in_progress() == index as u32 {
                std::hint::spin_loop();
            }
        }
    }

    /// Begins graceful shutdown (§4.10): subsequent `disable` calls
    /// skip drain/teardown rather than risk touching torn-down TLS.
    pub fn shutdown(&self) {
        self.state
            .store(PipelineState::ShuttingDown as u8, Ordering::Release);
    }

    pub fn register_provider(&self, provider: Provider) -> Result<Arc<Provider>> {
        self.configuration.register_provider(provider)
    }

    pub fn unregister_provider(&self, name: &str) {
        self.configuration
            .unregister_provider(name, self.active_session_count());
    }

    pub fn get_provider(&self, name: &str) -> Option<Arc<Provider>> {
        self.configuration.get_provider(name)
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::provider::EventDef;
    use crate::stream_writer::MemoryStreamWriter;

    fn new_pipeline() -> Arc<Pipeline> {
        Arc::new(Pipeline::with_collaborators(
            ManualClock::new(100),
            Arc::new(NullStackWalker),
            Arc::new(NullRundownEnumerator),
        ))
    }

    fn enable_req(providers: Vec<ProviderConfig>) -> EnableRequest {
        EnableRequest {
            sink: Some(Box::new(MemoryStreamWriter::new())),
            mode: SessionMode::File { flush_interval: None },
            circular_buffer_mb: 1,
            format: FormatVersion::V4HeaderCompressed,
            rundown_requested: false,
            providers,
        }
    }

    #[test]
    fn double_initialize_fails() {
        let pipeline = new_pipeline();
        pipeline.initialize().unwrap();
        assert!(matches!(
            pipeline.initialize(),
            Err(PipelineError::AlreadyInitialized)
        ));
    }

    #[test]
    fn operations_before_initialize_fail() {
        let pipeline = new_pipeline();
        let req = enable_req(vec![ProviderConfig {
            name: "P".into(),
            keywords: 0xFFFF,
            level: 5,
        }]);
        assert!(matches!(
            pipeline.enable_checked(req),
            Err(PipelineError::NotInitialized)
        ));
    }

    #[test]
    fn enable_with_zero_providers_returns_zero_id() {
        let pipeline = new_pipeline();
        pipeline.initialize().unwrap();
        assert_eq!(pipeline.enable(enable_req(vec![])), 0);
    }

    #[test]
    fn scenario_a_single_event_file_sink() {
        let pipeline = new_pipeline();
        pipeline.initialize().unwrap();
        let provider = pipeline
            .register_provider(Provider::new("P"))
            .unwrap();
        let event = provider.add_event(EventDef::new(1, 0, 3, 0x1, false));

        let id = pipeline.enable(enable_req(vec![ProviderConfig {
            name: "P".into(),
            keywords: 0xFFFF,
            level: 5,
        }]));
        assert_ne!(id, 0);
        assert!(event.is_enabled());

        pipeline.write_event(
            "P",
            &event,
            &[0, 1, 2, 3, 4, 5, 6, 7],
            None,
            None,
        );
        pipeline.disable(id);
        // Disabling again is a no-op.
        pipeline.disable(id);
    }

    #[test]
    fn disable_unknown_id_is_noop() {
        let pipeline = new_pipeline();
        pipeline.initialize().unwrap();
        pipeline.disable(999);
    }

    #[test]
    fn scenario_b_disabled_provider_is_silent() {
        let pipeline = new_pipeline();
        pipeline.initialize().unwrap();
        let p = pipeline.register_provider(Provider::new("P")).unwrap();
        pipeline.register_provider(Provider::new("Q")).unwrap();
        let event = p.add_event(EventDef::new(1, 0, 1, 0, false));

        let id = pipeline.enable(enable_req(vec![ProviderConfig {
            name: "Q".into(),
            keywords: 0,
            level: 5,
        }]));
        assert!(!event.is_enabled());
        pipeline.write_event("P", &event, &[1, 2, 3], None, None);
        assert_eq!(pipeline.metrics().events_written(), 0);
        pipeline.disable(id);
    }

    #[test]
    fn scenario_f_concurrent_disable_during_write_is_safe() {
        // A writer thread loops `write_event` while the main thread
        // calls `disable`; the suspend-write handshake (§5) must let
        // both finish without deadlocking or panicking (§8 scenario F).
        use std::sync::atomic::AtomicBool;
        use std::time::Duration;

        let pipeline = Arc::new(Pipeline::new());
        pipeline.initialize().unwrap();
        let provider = pipeline.register_provider(Provider::new("P")).unwrap();
        let event = provider.add_event(EventDef::new(1, 0, 3, 0x1, false));
        let id = pipeline.enable(enable_req(vec![ProviderConfig {
            name: "P".into(),
            keywords: 0xFFFF,
            level: 5,
        }]));
        assert_ne!(id, 0);

        let stop = Arc::new(AtomicBool::new(false));
        let (writer_pipeline, writer_event, writer_stop) =
            (pipeline.clone(), event.clone(), stop.clone());
        let writer = std::thread::spawn(move || {
            while !writer_stop.load(Ordering::Relaxed) {
                writer_pipeline.write_event("P", &writer_event, &[1, 2, 3], None, None);
            }
        });

        std::thread::sleep(Duration::from_millis(5));
        pipeline.disable(id);
        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();

        // Torn-down id is now unknown; disabling again is a no-op.
        pipeline.disable(id);
    }

    #[test]
    fn session_table_full_returns_zero() {
        let pipeline = new_pipeline();
        pipeline.initialize().unwrap();
        pipeline
            .register_provider(Provider::new("P"))
            .unwrap();
        let cfg = vec![ProviderConfig {
            name: "P".into(),
            keywords: 0xFFFF,
            level: 5,
        }];
        let mut ids = Vec::new();
        loop {
            let id = pipeline.enable(enable_req(cfg.clone()));
            if id == 0 {
                break;
            }
            ids.push(id);
        }
        assert!(!ids.is_empty());
        for id in ids {
            pipeline.disable(id);
        }
    }
}
