//! Host configuration.
//!
//! Values come from, in increasing precedence: built-in defaults, an optional
//! TOML file, environment variables and command line flags.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::compat::{default_debug_check, CompatibilityPolicy};

/// Default values.
pub mod defaults {
    /// Application name, used for per-user directories.
    pub const APP_NAME: &str = "modhost";
    /// Namespace of plugin cache keys.
    pub const SETTINGS_NAMESPACE: &str = "modhost";
    /// The plugin the host cannot run without.
    pub const CORE_PLUGIN: &str = "Core";
    /// Settings database file name.
    pub const SETTINGS_FILE: &str = "settings.redb";
    /// Plugin directory relative to the executable's directory.
    pub const INSTALL_PLUGIN_DIR: &str = "../lib/modhost/plugins";
}

/// Environment variable names.
pub mod env_vars {
    /// Extra plugin paths, separated like `PATH`.
    pub const PLUGIN_PATH: &str = "MODHOST_PLUGIN_PATH";
    pub const SETTINGS_PATH: &str = "MODHOST_SETTINGS_PATH";
    pub const CORE_PLUGIN: &str = "MODHOST_CORE_PLUGIN";
    pub const LOG_JSON: &str = "MODHOST_LOG_JSON";
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Host configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub app_name: String,
    /// Version used for the per-user plugin directory.
    pub app_version: String,
    pub settings_namespace: String,
    pub core_plugin: String,
    /// Searched after the install and user plugin directories.
    pub plugin_paths: Vec<PathBuf>,
    pub disabled_plugins: Vec<String>,
    /// Settings database. `None` means the per-user default.
    pub settings_path: Option<PathBuf>,
    /// Build keys accepted besides the host's own.
    pub legacy_build_keys: Vec<String>,
    /// Reject debug plugins in release hosts and the other way round.
    pub check_debug_mode: bool,
    /// Passed to every plugin's `initialize`.
    pub plugin_arguments: Vec<String>,
    /// Also search the install-relative plugin directory.
    pub use_install_dir: bool,
    /// Also search the per-user plugin directory.
    pub use_user_dir: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            app_name: defaults::APP_NAME.to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            settings_namespace: defaults::SETTINGS_NAMESPACE.to_string(),
            core_plugin: defaults::CORE_PLUGIN.to_string(),
            plugin_paths: Vec::new(),
            disabled_plugins: Vec::new(),
            settings_path: None,
            legacy_build_keys: Vec::new(),
            check_debug_mode: default_debug_check(),
            plugin_arguments: Vec::new(),
            use_install_dir: true,
            use_user_dir: true,
        }
    }
}

impl HostConfig {
    /// Read a TOML file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Defaults, then `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply the `MODHOST_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_vars(|name| std::env::var_os(name));
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<std::ffi::OsString>) {
        if let Some(paths) = var(env_vars::PLUGIN_PATH) {
            self.plugin_paths
                .extend(std::env::split_paths(&paths).filter(|p| !p.as_os_str().is_empty()));
        }
        if let Some(path) = var(env_vars::SETTINGS_PATH) {
            if !path.is_empty() {
                self.settings_path = Some(PathBuf::from(path));
            }
        }
        if let Some(name) = var(env_vars::CORE_PLUGIN) {
            if let Some(name) = name.to_str().filter(|n| !n.is_empty()) {
                self.core_plugin = name.to_string();
            }
        }
    }

    /// `<exe dir>/../lib/modhost/plugins`.
    pub fn install_plugin_dir(&self) -> Option<PathBuf> {
        let exe = std::env::current_exe().ok()?;
        let dir = exe.parent()?.join(defaults::INSTALL_PLUGIN_DIR);
        Some(dir.canonicalize().unwrap_or(dir))
    }

    /// `<user data dir>/<app>/plugins/<version>`.
    pub fn user_plugin_dir(&self) -> Option<PathBuf> {
        dirs::data_dir().map(|dir| {
            dir.join(&self.app_name)
                .join("plugins")
                .join(&self.app_version)
        })
    }

    /// Install directory, user directory, then the configured paths.
    pub fn search_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if self.use_install_dir {
            paths.extend(self.install_plugin_dir());
        }
        if self.use_user_dir {
            paths.extend(self.user_plugin_dir());
        }
        for path in &self.plugin_paths {
            if !paths.contains(path) {
                paths.push(path.clone());
            }
        }
        paths
    }

    /// Settings database path, falling back to the per-user config dir.
    pub fn resolved_settings_path(&self) -> Option<PathBuf> {
        self.settings_path.clone().or_else(|| {
            dirs::config_dir().map(|dir| dir.join(&self.app_name).join(defaults::SETTINGS_FILE))
        })
    }

    pub fn compatibility_policy(&self) -> CompatibilityPolicy {
        CompatibilityPolicy {
            legacy_build_keys: self.legacy_build_keys.clone(),
            check_debug_mode: self.check_debug_mode,
        }
    }
}
