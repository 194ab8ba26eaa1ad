//! The Core plugin.
//!
//! Every host refuses to start without a plugin named `Core`. Other plugins
//! declare a dependency on it to be initialized after it.
//!
//! Recognized plugin arguments:
//! - `-safe-mode`: other plugins should stay passive
//! - `-settings-scope <name>`: scope name handed to dependents

use modhost_sdk::prelude::*;

/// Lifecycle position of the Core plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stage {
    #[default]
    Created,
    Initialized,
    Running,
    ShuttingDown,
}

#[derive(Debug, Default)]
pub struct CorePlugin {
    stage: Stage,
    safe_mode: bool,
    settings_scope: Option<String>,
}

impl CorePlugin {
    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn safe_mode(&self) -> bool {
        self.safe_mode
    }

    pub fn settings_scope(&self) -> Option<&str> {
        self.settings_scope.as_deref()
    }

    fn parse_arguments(&mut self, arguments: &[String]) -> PluginResult<()> {
        let mut iter = arguments.iter();
        while let Some(argument) = iter.next() {
            match argument.as_str() {
                "-safe-mode" => self.safe_mode = true,
                "-settings-scope" => {
                    let scope = iter.next().filter(|s| !s.starts_with('-')).ok_or_else(|| {
                        PluginError::InvalidArguments("-settings-scope needs a value".to_string())
                    })?;
                    self.settings_scope = Some(scope.clone());
                }
                // Meant for other plugins.
                _ => {}
            }
        }
        Ok(())
    }
}

impl Plugin for CorePlugin {
    fn name(&self) -> &str {
        "Core"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn initialize(&mut self, arguments: &[String]) -> PluginResult<()> {
        if self.stage != Stage::Created {
            return Err(PluginError::InitializationFailed(
                "Core is already initialized".to_string(),
            ));
        }
        self.parse_arguments(arguments)?;
        self.stage = Stage::Initialized;
        Ok(())
    }

    fn extensions_initialized(&mut self) {
        self.stage = Stage::Running;
    }

    fn about_to_shutdown(&mut self) {
        self.stage = Stage::ShuttingDown;
    }
}

export_plugin!(CorePlugin::default());
