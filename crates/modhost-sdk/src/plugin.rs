//! The plugin lifecycle trait.

use crate::error::PluginResult;

/// Whether a dependency must be present for the plugin to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    /// The plugin fails to start without it
    Required,
    /// Used when present, ignored otherwise
    Optional,
}

/// A dependency of one plugin on another, by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDependency {
    /// Name reported by the other plugin's [`Plugin::name`]
    pub name: String,
    /// Semver requirement on the other plugin's version, e.g. `^0.1`
    pub version: String,
    /// Required or optional
    pub kind: DependencyKind,
}

impl PluginDependency {
    /// A required dependency.
    pub fn required(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            kind: DependencyKind::Required,
        }
    }

    /// An optional dependency.
    pub fn optional(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            kind: DependencyKind::Optional,
        }
    }

    /// Parse the version requirement.
    pub fn version_req(&self) -> Result<semver::VersionReq, semver::Error> {
        if self.version.trim().is_empty() {
            return Ok(semver::VersionReq::STAR);
        }
        semver::VersionReq::parse(&self.version)
    }
}

/// Root object of a plugin.
///
/// The host calls the methods in this order: [`initialize`](Plugin::initialize)
/// on every plugin in dependency order, then
/// [`extensions_initialized`](Plugin::extensions_initialized) in reverse order,
/// and finally [`about_to_shutdown`](Plugin::about_to_shutdown) in reverse order
/// when the host quits.
pub trait Plugin: Send {
    /// Unique plugin name.
    fn name(&self) -> &str;

    /// Plugin version (semver).
    fn version(&self) -> &str {
        "0.0.0"
    }

    /// Other plugins that must be initialized first.
    fn dependencies(&self) -> Vec<PluginDependency> {
        Vec::new()
    }

    /// Set the plugin up. `arguments` are the host's plugin arguments.
    fn initialize(&mut self, arguments: &[String]) -> PluginResult<()>;

    /// Called once every plugin depending on this one is initialized.
    fn extensions_initialized(&mut self) {}

    /// Called before the plugin is unloaded.
    fn about_to_shutdown(&mut self) {}
}
