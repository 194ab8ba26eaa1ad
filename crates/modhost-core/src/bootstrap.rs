//! Host start-up: configure, load plugins, require the core plugin, run.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::cache::{MemorySettings, RedbSettings, SettingsStore};
use crate::config::HostConfig;
use crate::manager::PluginManager;
use crate::runtime::PluginRuntime;

/// Start-up stages, strictly in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BootstrapStage {
    Configure,
    EnumerateAndLoad,
    LocateCore,
    Run,
}

/// Fatal start-up failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BootstrapError {
    #[error("Could not find the {name} plugin in {}", display_paths(.searched_paths))]
    MandatoryModuleMissing {
        name: String,
        searched_paths: Vec<PathBuf>,
    },

    #[error("The {name} plugin is disabled")]
    CoreDisabled { name: String },

    #[error("The {name} plugin failed to load: {reason}")]
    CoreFailed { name: String, reason: String },
}

impl BootstrapError {
    /// Console message shown before the host exits.
    pub fn diagnostic(&self) -> String {
        match self {
            BootstrapError::MandatoryModuleMissing {
                name,
                searched_paths,
            } => {
                let mut text = format!("Could not find the {name} plugin.\nSearched paths:\n");
                if searched_paths.is_empty() {
                    text.push_str("  (none)\n");
                }
                for path in searched_paths {
                    text.push_str(&format!("  {}\n", path.display()));
                }
                text
            }
            BootstrapError::CoreDisabled { name } => format!(
                "The {name} plugin is disabled.\nRemove it from the disabled plugins to start.\n"
            ),
            BootstrapError::CoreFailed { name, reason } => {
                format!("The {name} plugin could not be loaded:\n  {reason}\n")
            }
        }
    }

    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        1
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Drives start-up.
pub struct HostBootstrap {
    config: HostConfig,
    runtime: Option<Arc<PluginRuntime>>,
    stage: BootstrapStage,
}

impl HostBootstrap {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            runtime: None,
            stage: BootstrapStage::Configure,
        }
    }

    /// Use `runtime` instead of one built from the configuration.
    pub fn with_runtime(mut self, runtime: Arc<PluginRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn stage(&self) -> BootstrapStage {
        self.stage
    }

    /// Run every stage. On success the host is in the Run stage.
    pub fn start(mut self) -> Result<BootstrappedHost, BootstrapError> {
        // Configure
        let search_paths = self.config.search_paths();
        let runtime = match self.runtime.take() {
            Some(runtime) => runtime,
            None => self.build_runtime(),
        };
        let mut manager = PluginManager::new(runtime.clone());
        manager.set_plugin_paths(search_paths.clone());
        manager.set_disabled_plugins(self.config.disabled_plugins.iter().cloned());
        manager.set_arguments(self.config.plugin_arguments.clone());

        self.advance(BootstrapStage::EnumerateAndLoad);
        manager.discover();
        manager.load_plugins();
        for spec in manager.plugins().iter().filter(|s| s.has_error()) {
            warn!(
                plugin = %spec.name(),
                path = %spec.location().display(),
                error = spec.error_string().unwrap_or_default(),
                "Plugin not loaded"
            );
        }

        self.advance(BootstrapStage::LocateCore);
        let core = &self.config.core_plugin;
        let failure = match manager.plugin_by_name(core) {
            None => Some(BootstrapError::MandatoryModuleMissing {
                name: core.clone(),
                searched_paths: search_paths.clone(),
            }),
            Some(spec) if !spec.is_enabled() => Some(BootstrapError::CoreDisabled {
                name: core.clone(),
            }),
            Some(spec) if spec.has_error() => Some(BootstrapError::CoreFailed {
                name: core.clone(),
                reason: spec.error_string().unwrap_or_default().to_string(),
            }),
            Some(_) => None,
        };
        if let Some(e) = failure {
            error!(error = %e, "Host start-up failed");
            manager.shutdown();
            return Err(e);
        }

        self.advance(BootstrapStage::Run);
        Ok(BootstrappedHost {
            manager,
            runtime,
            search_paths,
            shut_down: false,
        })
    }

    fn advance(&mut self, stage: BootstrapStage) {
        info!(from = ?self.stage, to = ?stage, "Bootstrap stage");
        self.stage = stage;
    }

    fn build_runtime(&self) -> Arc<PluginRuntime> {
        let store: Arc<dyn SettingsStore> = match self.config.resolved_settings_path() {
            Some(path) => match RedbSettings::open(&path) {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Settings unavailable, plugin cache kept in memory");
                    Arc::new(MemorySettings::new())
                }
            },
            None => Arc::new(MemorySettings::new()),
        };
        PluginRuntime::builder()
            .policy(self.config.compatibility_policy())
            .settings(store, self.config.settings_namespace.clone())
            .build()
    }
}

/// A started host. Plugins shut down on [`shutdown`](Self::shutdown) or drop.
pub struct BootstrappedHost {
    manager: PluginManager,
    runtime: Arc<PluginRuntime>,
    search_paths: Vec<PathBuf>,
    shut_down: bool,
}

impl BootstrappedHost {
    pub fn manager(&self) -> &PluginManager {
        &self.manager
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Stop every plugin and unmap every library. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        info!("Shutting down plugins");
        self.manager.shutdown();
        self.runtime.shutdown();
    }
}

impl Drop for BootstrappedHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}
