//! Configuration: environment layering plus the typed runtime config.
//!
//! Sources merge with priority **process env > project `.env` > XDG
//! `config.toml`** ([`load_and_apply`] applies the losers into the process
//! environment so every consumer reads one surface). [`RuntimeConfig`] is
//! the typed view the runtime is constructed from: provider credentials,
//! signaling endpoint, sandbox budget, checkpoint ring size, and file-size
//! caps. Credentials never appear in logs; [`RuntimeConfig::summary`]
//! redacts them.

mod dotenv;
mod xdg_toml;

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("read xdg config: {0}")]
    XdgRead(std::io::Error),
    #[error("parse xdg toml: {0}")]
    XdgParse(#[from] toml::de::Error),
    #[error("read .env: {0}")]
    DotenvRead(std::io::Error),
}

/// Loads `.env` and XDG `config.toml` and sets environment variables for
/// keys not already present, so existing env always wins.
///
/// * `app_name`: XDG path component, `~/.config/<app_name>/config.toml`.
/// * `override_dir`: look for `.env` here instead of the current directory.
pub fn load_and_apply(app_name: &str, override_dir: Option<&Path>) -> Result<(), LoadError> {
    let xdg_map = xdg_toml::load_env_map(app_name)?;
    let dotenv_map = dotenv::load_env_map(override_dir).map_err(LoadError::DotenvRead)?;

    let mut keys: std::collections::HashSet<String> = xdg_map.keys().cloned().collect();
    keys.extend(dotenv_map.keys().cloned());

    for key in keys {
        if std::env::var(&key).is_ok() {
            continue; // existing env wins
        }
        if let Some(value) = dotenv_map.get(&key).or_else(|| xdg_map.get(&key)) {
            std::env::set_var(&key, value);
        }
    }
    Ok(())
}

/// One provider's credentials and endpoint override.
#[derive(Clone, Debug)]
pub struct ProviderCredential {
    pub name: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

/// The typed configuration surface the runtime is built from.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub providers: Vec<ProviderCredential>,
    /// Swarm signaling server, e.g. `ws://127.0.0.1:9120/ws`.
    pub signaling_url: String,
    /// Room id scoping peer visibility.
    pub room: String,
    pub sandbox_program: String,
    pub sandbox_args: Vec<String>,
    pub sandbox_timeout_ms: u64,
    pub checkpoint_ring_size: usize,
    pub code_size_cap: usize,
    pub document_size_cap: usize,
    /// Durable VFS database; `None` keeps everything in memory.
    pub vfs_db_path: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            signaling_url: "ws://127.0.0.1:9120/ws".to_string(),
            room: "default".to_string(),
            sandbox_program: "reploid-worker".to_string(),
            sandbox_args: Vec::new(),
            sandbox_timeout_ms: 5_000,
            checkpoint_ring_size: 10,
            code_size_cap: 1024 * 1024,
            document_size_cap: 5 * 1024 * 1024,
            vfs_db_path: None,
        }
    }
}

/// (provider name, key env var, base-url env var)
const PROVIDER_ENV: &[(&str, &str, &str)] = &[
    ("openai", "OPENAI_API_KEY", "OPENAI_BASE_URL"),
    ("anthropic", "ANTHROPIC_API_KEY", "ANTHROPIC_BASE_URL"),
    ("gemini", "GEMINI_API_KEY", "GEMINI_BASE_URL"),
    ("groq", "GROQ_API_KEY", "GROQ_BASE_URL"),
    ("huggingface", "HF_TOKEN", "HF_BASE_URL"),
    ("ollama", "", "OLLAMA_BASE_URL"),
    ("vllm", "", "VLLM_BASE_URL"),
    ("local", "", "LOCAL_LLM_BASE_URL"),
];

impl RuntimeConfig {
    /// Reads the config from the process environment (call
    /// [`load_and_apply`] first to fold in `.env` and XDG sources).
    ///
    /// Keyless providers (ollama, vllm, local) are always configured; keyed
    /// providers only when their key is present.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        for (name, key_var, url_var) in PROVIDER_ENV {
            let api_key = if key_var.is_empty() {
                None
            } else {
                match std::env::var(key_var) {
                    Ok(key) if !key.is_empty() => Some(key),
                    _ => continue, // keyed provider without a key: skip
                }
            };
            config.providers.push(ProviderCredential {
                name: name.to_string(),
                api_key,
                base_url: std::env::var(url_var).ok().filter(|u| !u.is_empty()),
            });
        }

        if let Ok(url) = std::env::var("REPLOID_SIGNALING_URL") {
            config.signaling_url = url;
        }
        if let Ok(room) = std::env::var("REPLOID_ROOM") {
            config.room = room;
        }
        if let Ok(program) = std::env::var("REPLOID_SANDBOX_PROGRAM") {
            config.sandbox_program = program;
        }
        if let Ok(ms) = std::env::var("REPLOID_SANDBOX_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse() {
                config.sandbox_timeout_ms = ms;
            }
        }
        if let Ok(n) = std::env::var("REPLOID_CHECKPOINT_RING") {
            if let Ok(n) = n.parse() {
                config.checkpoint_ring_size = n;
            }
        }
        if let Ok(path) = std::env::var("REPLOID_VFS_DB") {
            if !path.is_empty() {
                config.vfs_db_path = Some(PathBuf::from(path));
            }
        }
        config
    }

    pub fn sandbox_timeout(&self) -> Duration {
        Duration::from_millis(self.sandbox_timeout_ms)
    }

    /// A loggable summary: everything except credentials.
    pub fn summary(&self) -> String {
        let providers: Vec<String> = self
            .providers
            .iter()
            .map(|p| {
                format!(
                    "{}({})",
                    p.name,
                    if p.api_key.is_some() { "keyed" } else { "open" }
                )
            })
            .collect();
        format!(
            "providers=[{}] signaling={} room={} sandbox={}ms ring={} durable={}",
            providers.join(","),
            self.signaling_url,
            self.room,
            self.sandbox_timeout_ms,
            self.checkpoint_ring_size,
            self.vfs_db_path.is_some(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn restore_var(key: &str, prev: Option<String>) {
        match prev {
            Some(v) => env::set_var(key, v),
            None => env::remove_var(key),
        }
    }

    #[test]
    fn existing_env_wins_over_dotenv() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "CFG_TEST_PRIO=from_dotenv\n").unwrap();
        env::set_var("CFG_TEST_PRIO", "from_env");
        load_and_apply("reploid-test-none", Some(dir.path())).unwrap();
        assert_eq!(env::var("CFG_TEST_PRIO").as_deref(), Ok("from_env"));
        env::remove_var("CFG_TEST_PRIO");
    }

    #[test]
    fn dotenv_fills_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "CFG_TEST_FILL=from_dotenv\n").unwrap();
        env::remove_var("CFG_TEST_FILL");
        load_and_apply("reploid-test-none", Some(dir.path())).unwrap();
        assert_eq!(env::var("CFG_TEST_FILL").as_deref(), Ok("from_dotenv"));
        env::remove_var("CFG_TEST_FILL");
    }

    #[test]
    fn from_env_skips_keyed_providers_without_keys() {
        let prev = env::var("OPENAI_API_KEY").ok();
        env::remove_var("OPENAI_API_KEY");
        let config = RuntimeConfig::from_env();
        assert!(config.providers.iter().all(|p| p.name != "openai"));
        // Keyless providers are always present.
        assert!(config.providers.iter().any(|p| p.name == "ollama"));
        restore_var("OPENAI_API_KEY", prev);
    }

    #[test]
    fn summary_never_contains_keys() {
        let config = RuntimeConfig {
            providers: vec![ProviderCredential {
                name: "openai".to_string(),
                api_key: Some("sk-supersecretvalue1234".to_string()),
                base_url: None,
            }],
            ..Default::default()
        };
        let summary = config.summary();
        assert!(!summary.contains("supersecret"));
        assert!(summary.contains("openai(keyed)"));
    }
}
