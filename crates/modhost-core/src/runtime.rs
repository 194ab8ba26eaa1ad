//! The plugin runtime service shared by all loaders.

use std::sync::Arc;

use crate::cache::{PluginCache, SettingsStore};
use crate::compat::{CompatibilityChecker, CompatibilityPolicy, HostAbi};
use crate::descriptor::PluginVerifier;
use crate::handle::LibraryRegistry;
use crate::platform::{DynamicLinker, NameCandidates, SystemLinker};

/// Library registry plus verifier. Constructed once per process and passed
/// to every [`PluginLoader`](crate::PluginLoader) by `Arc`.
pub struct PluginRuntime {
    libraries: LibraryRegistry,
    verifier: PluginVerifier,
}

impl PluginRuntime {
    pub fn builder() -> PluginRuntimeBuilder {
        PluginRuntimeBuilder::default()
    }

    /// System linker, platform name table, default policy, no cache.
    pub fn system() -> Arc<Self> {
        Self::builder().build()
    }

    pub fn libraries(&self) -> &LibraryRegistry {
        &self.libraries
    }

    pub fn verifier(&self) -> &PluginVerifier {
        &self.verifier
    }

    /// Destroy all plugin instances and unmap all libraries.
    pub fn shutdown(&self) {
        self.libraries.drain();
    }
}

/// Builder for [`PluginRuntime`].
pub struct PluginRuntimeBuilder {
    linker: Arc<dyn DynamicLinker>,
    names: NameCandidates,
    host: HostAbi,
    policy: CompatibilityPolicy,
    settings: Option<(Arc<dyn SettingsStore>, String)>,
}

impl Default for PluginRuntimeBuilder {
    fn default() -> Self {
        Self {
            linker: Arc::new(SystemLinker::new()),
            names: NameCandidates::platform_default(),
            host: HostAbi::current(),
            policy: CompatibilityPolicy::default(),
            settings: None,
        }
    }
}

impl PluginRuntimeBuilder {
    pub fn linker(mut self, linker: Arc<dyn DynamicLinker>) -> Self {
        self.linker = linker;
        self
    }

    pub fn names(mut self, names: NameCandidates) -> Self {
        self.names = names;
        self
    }

    pub fn host(mut self, host: HostAbi) -> Self {
        self.host = host;
        self
    }

    pub fn policy(mut self, policy: CompatibilityPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Cache verdicts in `store` under `namespace`.
    pub fn settings(mut self, store: Arc<dyn SettingsStore>, namespace: impl Into<String>) -> Self {
        self.settings = Some((store, namespace.into()));
        self
    }

    pub fn build(self) -> Arc<PluginRuntime> {
        let cache = self
            .settings
            .map(|(store, namespace)| PluginCache::new(store, namespace, self.host.clone()));
        let checker = CompatibilityChecker::new(self.host, self.policy);
        Arc::new(PluginRuntime {
            libraries: LibraryRegistry::new(self.linker, self.names),
            verifier: PluginVerifier::new(checker, cache),
        })
    }
}
