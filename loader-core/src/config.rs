//! Boot configuration read from the environment.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub const ENV_DELAY_INJECTION: &str = "RELOADED_DELAY_INJECTION";
pub const ENV_HOOK_TARGETS: &str = "RELOADED_HOOK_TARGETS";
pub const ENV_LOG_DIR: &str = "RELOADED_LOG_DIR";
pub const ENV_LOG_KEEP: &str = "RELOADED_LOG_KEEP";
pub const ENV_MOD_LIBRARIES: &str = "RELOADED_MOD_LIBRARIES";

const DEFAULT_LOG_KEEP: usize = 10;

/// When mod loading waits for the host's first import call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelayPolicy {
    /// Only when a DRM wrapper is detected.
    #[default]
    Auto,
    Always,
    Never,
}

impl DelayPolicy {
    pub fn should_delay(&self, drm_detected: bool) -> bool {
        match self {
            DelayPolicy::Auto => drm_detected,
            DelayPolicy::Always => true,
            DelayPolicy::Never => false,
        }
    }
}

impl FromStr for DelayPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "always" | "on" | "true" | "1" => Ok(Self::Always),
            "never" | "off" | "false" | "0" => Ok(Self::Never),
            other => Err(format!(
                "unknown delay injection policy '{}' (expected auto, always or never)",
                other
            )),
        }
    }
}

impl fmt::Display for DelayPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DelayPolicy::Auto => "auto",
            DelayPolicy::Always => "always",
            DelayPolicy::Never => "never",
        };
        f.write_str(name)
    }
}

/// Boot configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootConfig {
    pub delay_injection: DelayPolicy,

    /// Replaces the bundled hook descriptor list.
    pub hook_targets: Option<PathBuf>,

    /// `None` means [`crate::logging::default_log_dir`].
    pub log_dir: Option<PathBuf>,

    /// Loader logs kept by rotation.
    pub log_keep: usize,

    /// Libraries loaded as mods, in order.
    pub mod_libraries: Vec<PathBuf>,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            delay_injection: DelayPolicy::Auto,
            hook_targets: None,
            log_dir: None,
            log_keep: DEFAULT_LOG_KEEP,
            mod_libraries: Vec::new(),
        }
    }
}

impl BootConfig {
    /// Read from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    /// Log directory named by the environment, resolved on its own so the
    /// logger can be installed before anything else is parsed.
    pub fn log_dir_from_env() -> PathBuf {
        Self::log_dir_from_lookup(env_lookup)
    }

    pub fn log_dir_from_lookup<F>(lookup: F) -> PathBuf
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            log_dir: non_blank(&lookup, ENV_LOG_DIR).map(PathBuf::from),
            ..Self::default()
        }
        .log_dir()
    }

    /// Read through `lookup`. Invalid values are logged and replaced by defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let value = |key: &str| non_blank(&lookup, key);

        if let Some(raw) = value(ENV_DELAY_INJECTION) {
            match raw.parse() {
                Ok(policy) => config.delay_injection = policy,
                Err(e) => log::warn!("{}: {}", ENV_DELAY_INJECTION, e),
            }
        }

        config.hook_targets = value(ENV_HOOK_TARGETS).map(PathBuf::from);
        config.log_dir = value(ENV_LOG_DIR).map(PathBuf::from);

        if let Some(raw) = value(ENV_LOG_KEEP) {
            match raw.trim().parse::<usize>() {
                Ok(keep) if keep > 0 => config.log_keep = keep,
                _ => log::warn!("{}: expected a positive number, got '{}'", ENV_LOG_KEEP, raw),
            }
        }

        if let Some(raw) = value(ENV_MOD_LIBRARIES) {
            config.mod_libraries = std::env::split_paths(&raw)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
        }

        config
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(crate::logging::default_log_dir)
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var_os(key).map(|v| v.to_string_lossy().into_owned())
}

fn non_blank<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).filter(|v| !v.trim().is_empty())
}
