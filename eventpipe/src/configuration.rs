//! Provider registry and per-session enablement (§4.2, C5).

use crate::error::{PipelineError, Result};
use crate::provider::{CallbackData, Provider};
use eventpipe_wire::MAX_SESSIONS;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// One entry of a session's requested provider list (§6.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub name: String,
    pub keywords: u64,
    pub level: u8,
}

impl ProviderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::InvalidProviderConfig(
                "provider name must not be empty",
            ));
        }
        if self.level > 5 {
            return Err(PipelineError::InvalidProviderConfig(
                "level must be in 0..=5",
            ));
        }
        Ok(())
    }
}

pub struct Configuration {
    providers: RwLock<HashMap<String, Arc<Provider>>>,
    // Indexed by session slot; holds the provider list a session was
    // enabled with, so a provider registered *after* the session was
    // already running still gets configured immediately.
    session_configs: RwLock<[Option<Vec<ProviderConfig>>; MAX_SESSIONS]>,
}

impl Configuration {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            session_configs: RwLock::new(std::array::from_fn(|_| None)),
        }
    }

    pub fn register_provider(&self, provider: Provider) -> Result<Arc<Provider>> {
        let name = provider.name.clone();
        let provider = Arc::new(provider);
        {
            let mut providers = self.providers.write().unwrap();
            if providers.contains_key(&name) {
                return Err(PipelineError::AlreadyRegistered(name));
            }
            providers.insert(name.clone(), provider.clone());
        }
        // Apply any already-active session configs that name this
        // provider (it may have registered after Enable ran).
        let session_configs = self.session_configs.read().unwrap();
        for (index, configs) in session_configs.iter().enumerate() {
            if let Some(configs) = configs {
                if let Some(cfg) = configs.iter().find(|c| c.name == name) {
                    let data = provider.set_configuration(index, 1u64 << index, cfg.keywords, cfg.level);
                    provider.invoke_callback(&data);
                }
            }
        }
        Ok(provider)
    }

    pub fn get_provider(&self, name: &str) -> Option<Arc<Provider>> {
        self.providers.read().unwrap().get(name).cloned()
    }

    pub fn unregister_provider(&self, name: &str, active_session_count: usize) {
        let providers = self.providers.read().unwrap();
        if let Some(provider) = providers.get(name) {
            if active_session_count > 0 {
                provider.mark_deferred_delete();
                return;
            }
        }
        drop(providers);
        self.providers.write().unwrap().remove(name);
    }

    pub fn delete_deferred_providers(&self, active_session_count: usize) {
        if active_session_count > 0 {
            return;
        }
        self.providers
            .write()
            .unwrap()
            .retain(|_, p| !p.is_deferred_delete());
    }

    /// Applies `configs` to every registered provider they name,
    /// records the list for late-registering providers, and returns
    /// the callback records to dispatch after the caller releases the
    /// config lock (§4.1).
    pub fn enable(
        &self,
        session_index: usize,
        session_id: u64,
        configs: &[ProviderConfig],
    ) -> Vec<CallbackData> {
        self.session_configs.write().unwrap()[session_index] = Some(configs.to_vec());
        let providers = self.providers.read().unwrap();
        let mut callbacks = Vec::new();
        for cfg in configs {
            if let Some(provider) = providers.get(&cfg.name) {
                callbacks.push(provider.set_configuration(
                    session_index,
                    session_id,
                    cfg.keywords,
                    cfg.level,
                ));
            }
        }
        callbacks
    }

    pub fn disable(&self, session_index: usize, session_id: u64) -> Vec<CallbackData> {
        self.session_configs.write().unwrap()[session_index] = None;
        let providers = self.providers.read().unwrap();
        providers
            .values()
            .filter(|p| p.is_enabled_in_session(session_index))
            .map(|p| p.clear_configuration(session_index, session_id))
            .collect()
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::EventDef;

    #[test]
    fn enable_configures_matching_provider_only() {
        let config = Configuration::new();
        let p = config.register_provider(Provider::new("P")).unwrap();
        let q = config.register_provider(Provider::new("Q")).unwrap();
        let pe = p.add_event(EventDef::new(1, 0, 1, 0, false));
        let qe = q.add_event(EventDef::new(1, 0, 1, 0, false));

        let callbacks = config.enable(
            0,
            1,
            &[ProviderConfig {
                name: "P".into(),
                keywords: 0xFFFF,
                level: 5,
            }],
        );
        assert_eq!(callbacks.len(), 1);
        assert!(pe.is_enabled());
        assert!(!qe.is_enabled());
    }

    #[test]
    fn late_registration_picks_up_active_session_config() {
        let config = Configuration::new();
        config.enable(
            0,
            1,
            &[ProviderConfig {
                name: "Late".into(),
                keywords: 0,
                level: 5,
            }],
        );
        let provider = config.register_provider(Provider::new("Late")).unwrap();
        let event = provider.add_event(EventDef::new(1, 0, 1, 0, false));
        assert!(event.is_enabled());
    }

    #[test]
    fn disable_clears_all_providers_for_session() {
        let config = Configuration::new();
        let p = config.register_provider(Provider::new("P")).unwrap();
        let event = p.add_event(EventDef::new(1, 0, 1, 0, false));
        config.enable(
            0,
            1,
            &[ProviderConfig {
                name: "P".into(),
                keywords: 0,
                level: 5,
            }],
        );
        assert!(event.is_enabled());
        config.disable(0, 1);
        assert!(!event.is_enabled());
    }

    #[test]
    fn unregister_defers_while_sessions_active() {
        let config = Configuration::new();
        let p = config.register_provider(Provider::new("P")).unwrap();
        config.unregister_provider("P", 1);
        assert!(p.is_deferred_delete());
        assert!(config.get_provider("P").is_some());
        config.delete_deferred_providers(0);
        assert!(config.get_provider("P").is_none());
    }

    #[test]
    fn duplicate_registration_rejected() {
        let config = Configuration::new();
        config.register_provider(Provider::new("P")).unwrap();
        let err = config.register_provider(Provider::new("P")).unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyRegistered(_)));
    }
}
