//! Configuration management for ai-harness
//!
//! Credentials come from the environment only. Everything else can also be given a
//! default in ~/.config/ai-harness/config.json. Environment variables are read here and
//! nowhere else; the resolved [`Config`] is passed down explicitly.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const GEMINI_API_KEY_VAR: &str = "GEMINI_API_KEY";
pub const OPENAI_API_KEY_VAR: &str = "OPENAI_API_KEY";
pub const OPENROUTER_API_KEY_VAR: &str = "OPENROUTER_API_KEY";
pub const MODEL_VAR: &str = "AI_HARNESS_MODEL";
pub const TIMEOUT_VAR: &str = "AI_HARNESS_TIMEOUT_SECS";
pub const MATCHERS_DIR_VAR: &str = "AI_HARNESS_MATCHERS_DIR";

/// Ceiling for one diagnosis request.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MATCHERS_DIR: &str = "../package-suggestions/matchers";

/// API keys for the diagnosis backends. Empty values count as unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub gemini_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub openrouter_api_key: Option<String>,
}

impl Credentials {
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str| lookup(key).and_then(non_empty);
        Self {
            gemini_api_key: read(GEMINI_API_KEY_VAR),
            openai_api_key: read(OPENAI_API_KEY_VAR),
            openrouter_api_key: read(OPENROUTER_API_KEY_VAR),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.gemini_api_key.is_none()
            && self.openai_api_key.is_none()
            && self.openrouter_api_key.is_none()
    }
}

/// Optional defaults persisted on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub model: Option<String>,
    pub timeout_secs: Option<u64>,
    pub matchers_dir: Option<PathBuf>,
    pub prefix_output: Option<bool>,
    /// Program that receives `<manager> <package>` for package remedies.
    pub install_command: Option<String>,
}

impl Settings {
    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("ai-harness"))
    }

    /// Get the config file path
    pub fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load settings from the default location, or return defaults
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load settings from `path`. A missing file gives defaults; a corrupt one is moved
    /// aside so the user can inspect it, and defaults are used.
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str(&content) {
            Ok(settings) => settings,
            Err(err) => {
                preserve_corrupt_config(path, &content);
                warn!(
                    path = %path.display(),
                    "config file was corrupted ({}); a backup was saved and defaults were loaded",
                    err
                );
                Self::default()
            }
        }
    }
}

/// Everything the pipeline needs, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub credentials: Credentials,
    pub model: Option<String>,
    pub timeout: Duration,
    pub matchers_dir: PathBuf,
    pub prefix_output: bool,
    pub install_command: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            credentials: Credentials::default(),
            model: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            matchers_dir: PathBuf::from(DEFAULT_MATCHERS_DIR),
            prefix_output: true,
            install_command: None,
        }
    }
}

impl Config {
    /// Settings file overlaid with the process environment.
    pub fn from_env() -> Self {
        Self::resolve(Settings::load(), |key| std::env::var(key).ok())
    }

    /// Environment (via `lookup`) takes precedence over `settings`, which take
    /// precedence over built-in defaults.
    pub fn resolve(settings: Settings, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let timeout_secs = match lookup(TIMEOUT_VAR).and_then(non_empty) {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => Some(secs),
                _ => {
                    warn!(
                        "ignoring {}={:?}: expected a positive number of seconds",
                        TIMEOUT_VAR, raw
                    );
                    settings.timeout_secs
                }
            },
            None => settings.timeout_secs,
        }
        .filter(|secs| *secs > 0);

        Self {
            credentials: Credentials::from_lookup(&lookup),
            model: lookup(MODEL_VAR).and_then(non_empty).or(settings.model),
            timeout: timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            matchers_dir: lookup(MATCHERS_DIR_VAR)
                .and_then(non_empty)
                .map(PathBuf::from)
                .or(settings.matchers_dir)
                .unwrap_or(defaults.matchers_dir),
            prefix_output: settings.prefix_output.unwrap_or(defaults.prefix_output),
            install_command: settings.install_command.and_then(non_empty),
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}
