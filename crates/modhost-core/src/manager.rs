//! The host's plugin registry: discovery, dependency resolution and the
//! initialize/shutdown sequence.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use modhost_sdk::{DependencyKind, PluginDependency};
use semver::Version;
use tracing::{debug, info, warn};

use crate::error::LoaderError;
use crate::loader::{PluginInstance, PluginLoader};
use crate::platform::is_native_library;
use crate::runtime::PluginRuntime;

/// Lifecycle state of a plugin specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SpecState {
    /// Discovered and verified, not loaded.
    Read,
    /// Library mapped and root object created.
    Loaded,
    /// Dependencies found.
    Resolved,
    /// `initialize` succeeded.
    Initialized,
    /// `extensions_initialized` was delivered.
    Running,
    /// `about_to_shutdown` was delivered.
    Stopped,
    /// Root object destroyed.
    Deleted,
}

/// One discovered plugin.
pub struct PluginSpec {
    name: String,
    version: String,
    location: PathBuf,
    state: SpecState,
    enabled: bool,
    error: Option<String>,
    dependencies: Vec<PluginDependency>,
    /// Specs chosen for the required dependencies.
    providers: Vec<usize>,
    loader: PluginLoader,
    instance: Option<PluginInstance>,
}

impl PluginSpec {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// The library file.
    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn state(&self) -> SpecState {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error_string(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn dependencies(&self) -> &[PluginDependency] {
        &self.dependencies
    }

    pub fn instance(&self) -> Option<&PluginInstance> {
        self.instance.as_ref()
    }

    fn set_error(&mut self, error: impl Into<String>) {
        let error = error.into();
        warn!(plugin = %self.name, error = %error, "Plugin failed");
        self.error = Some(error);
    }

    fn is_usable(&self) -> bool {
        self.enabled && self.error.is_none()
    }
}

impl std::fmt::Debug for PluginSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginSpec")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("location", &self.location)
            .field("state", &self.state)
            .field("enabled", &self.enabled)
            .field("error", &self.error)
            .finish()
    }
}

/// Plugin registry of the host.
pub struct PluginManager {
    runtime: Arc<PluginRuntime>,
    plugin_paths: Vec<PathBuf>,
    disabled: HashSet<String>,
    arguments: Vec<String>,
    specs: Vec<PluginSpec>,
    load_queue: Vec<usize>,
}

impl PluginManager {
    pub fn new(runtime: Arc<PluginRuntime>) -> Self {
        Self {
            runtime,
            plugin_paths: Vec::new(),
            disabled: HashSet::new(),
            arguments: Vec::new(),
            specs: Vec::new(),
            load_queue: Vec::new(),
        }
    }

    pub fn runtime(&self) -> &Arc<PluginRuntime> {
        &self.runtime
    }

    pub fn set_plugin_paths(&mut self, paths: Vec<PathBuf>) {
        self.plugin_paths = paths;
    }

    pub fn plugin_paths(&self) -> &[PathBuf] {
        &self.plugin_paths
    }

    /// Plugins that must not be loaded, by name.
    pub fn set_disabled_plugins<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.disabled = names.into_iter().map(Into::into).collect();
    }

    /// Arguments handed to every plugin's `initialize`.
    pub fn set_arguments(&mut self, arguments: Vec<String>) {
        self.arguments = arguments;
    }

    /// Walk the plugin paths and record every verified library.
    ///
    /// Files without a verification record are skipped. Rejected plugins are
    /// kept with their error so they can be reported.
    pub fn discover(&mut self) -> usize {
        let mut seen: HashSet<PathBuf> =
            self.specs.iter().map(|s| s.location.clone()).collect();
        let mut files = Vec::new();
        for dir in &self.plugin_paths {
            if !dir.is_dir() {
                debug!(path = %dir.display(), "Plugin path does not exist");
                continue;
            }
            collect_libraries(dir, &mut files);
        }

        let before = self.specs.len();
        for file in files {
            let Ok(canonical) = file.canonicalize() else {
                continue;
            };
            if !seen.insert(canonical.clone()) {
                continue;
            }

            let mut loader = PluginLoader::new(self.runtime.clone());
            let error = match loader
                .set_file_name(&canonical)
                .and_then(|_| loader.query_descriptor())
            {
                Ok(_) => None,
                Err(e) if e.is_not_a_plugin() => {
                    debug!(path = %canonical.display(), "Skipping file without verification record");
                    continue;
                }
                Err(e) => Some(e.to_string()),
            };

            let mut spec = PluginSpec {
                name: name_from_file(&canonical),
                version: String::new(),
                location: canonical,
                state: SpecState::Read,
                enabled: true,
                error: None,
                dependencies: Vec::new(),
                providers: Vec::new(),
                loader,
                instance: None,
            };
            if let Some(error) = error {
                spec.set_error(error);
            }
            debug!(plugin = %spec.name, path = %spec.location.display(), "Discovered plugin");
            self.specs.push(spec);
        }

        let found = self.specs.len() - before;
        info!(count = found, "Plugin discovery finished");
        found
    }

    /// Load, resolve and initialize every enabled plugin.
    ///
    /// A failing plugin is marked with its error, as are the plugins that
    /// require it; the pass always continues.
    pub fn load_plugins(&mut self) {
        self.load_libraries();
        self.resolve_dependencies();
        self.load_queue = self.compute_load_queue();

        let queue = self.load_queue.clone();
        for &index in &queue {
            self.initialize_plugin(index);
        }
        for &index in queue.iter().rev() {
            let spec = &mut self.specs[index];
            if spec.state != SpecState::Initialized {
                continue;
            }
            if let Some(instance) = &spec.instance {
                instance.with(|plugin| plugin.extensions_initialized());
            }
            spec.state = SpecState::Running;
            info!(plugin = %spec.name, version = %spec.version, "Plugin running");
        }
    }

    /// `about_to_shutdown` in reverse load order, then destroy and unload.
    pub fn shutdown(&mut self) {
        let queue = std::mem::take(&mut self.load_queue);
        for &index in queue.iter().rev() {
            let spec = &mut self.specs[index];
            if matches!(spec.state, SpecState::Initialized | SpecState::Running) {
                if let Some(instance) = &spec.instance {
                    instance.with(|plugin| plugin.about_to_shutdown());
                }
                spec.state = SpecState::Stopped;
            }
        }

        let mut order: Vec<usize> = queue.iter().rev().copied().collect();
        for index in 0..self.specs.len() {
            if !order.contains(&index) {
                order.push(index);
            }
        }
        for index in order {
            let spec = &mut self.specs[index];
            spec.instance = None;
            if spec.loader.is_loaded() {
                match spec.loader.unload() {
                    Ok(_) => {}
                    Err(LoaderError::NotLoaded { .. }) => {}
                    Err(e) => warn!(plugin = %spec.name, error = %e, "Unload failed"),
                }
            }
            if spec.state >= SpecState::Loaded {
                spec.state = SpecState::Deleted;
            }
        }
        debug!("Plugin shutdown finished");
    }

    pub fn plugins(&self) -> &[PluginSpec] {
        &self.specs
    }

    /// The spec named `name`. A running copy wins over a rejected duplicate.
    pub fn plugin_by_name(&self, name: &str) -> Option<&PluginSpec> {
        self.specs
            .iter()
            .filter(|s| s.name == name)
            .min_by_key(|s| (s.state != SpecState::Running, s.has_error()))
    }

    pub fn has_errors(&self) -> bool {
        self.specs.iter().any(|s| s.has_error())
    }

    /// Names in initialization order.
    pub fn load_order(&self) -> Vec<&str> {
        self.load_queue
            .iter()
            .map(|&i| self.specs[i].name.as_str())
            .collect()
    }

    fn load_libraries(&mut self) {
        let mut names: HashMap<String, usize> = HashMap::new();
        for index in 0..self.specs.len() {
            let spec = &mut self.specs[index];
            if spec.state != SpecState::Read || spec.has_error() {
                continue;
            }
            if self.disabled.contains(&spec.name) {
                spec.enabled = false;
                info!(plugin = %spec.name, "Plugin disabled");
                continue;
            }

            let instance = match spec.loader.instance() {
                Ok(instance) => instance,
                Err(e) => {
                    spec.set_error(e.to_string());
                    continue;
                }
            };
            let Some((name, version, dependencies)) = instance.with(|plugin| {
                (
                    plugin.name().to_string(),
                    plugin.version().to_string(),
                    plugin.dependencies(),
                )
            }) else {
                spec.set_error("plugin instance is gone");
                continue;
            };
            spec.name = name;
            spec.version = version;
            spec.dependencies = dependencies;
            spec.instance = Some(instance);
            spec.state = SpecState::Loaded;

            if self.disabled.contains(&spec.name) {
                spec.enabled = false;
                spec.instance = None;
                if let Err(e) = spec.loader.unload() {
                    warn!(plugin = %spec.name, error = %e, "Unload of disabled plugin failed");
                }
                info!(plugin = %spec.name, "Plugin disabled");
                continue;
            }

            if let Some(&first) = names.get(&spec.name) {
                let other = self.specs[first].location.display().to_string();
                let spec = &mut self.specs[index];
                spec.set_error(format!("Plugin \"{}\" is already loaded from {other}", spec.name));
                continue;
            }
            names.insert(self.specs[index].name.clone(), index);
        }
    }

    /// The loaded spec satisfying `dependency`. A copy without an error wins
    /// over a rejected duplicate of the same name.
    fn find_provider(&self, dependency: &PluginDependency) -> Result<usize, String> {
        let Some(index) = self
            .specs
            .iter()
            .enumerate()
            .filter(|(_, s)| s.name == dependency.name && s.state >= SpecState::Loaded && s.enabled)
            .min_by_key(|(_, s)| s.has_error())
            .map(|(index, _)| index)
        else {
            return Err(format!(
                "Could not resolve dependency '{}({})'",
                dependency.name, dependency.version
            ));
        };
        let provider = &self.specs[index];
        let matches = match (dependency.version_req(), Version::parse(&provider.version)) {
            (Ok(req), Ok(version)) => req.matches(&version),
            _ => false,
        };
        if !matches {
            return Err(format!(
                "Dependency '{}' requires version {}, found {}",
                dependency.name, dependency.version, provider.version
            ));
        }
        Ok(index)
    }

    fn resolve_dependencies(&mut self) {
        for index in 0..self.specs.len() {
            let spec = &self.specs[index];
            if spec.state != SpecState::Loaded || !spec.is_usable() {
                continue;
            }
            let mut error = None;
            let mut providers = Vec::new();
            for dependency in &spec.dependencies {
                match self.find_provider(dependency) {
                    Ok(provider) if dependency.kind == DependencyKind::Required => {
                        providers.push(provider)
                    }
                    Ok(_) => {}
                    Err(e) if dependency.kind == DependencyKind::Required => {
                        error = Some(e);
                        break;
                    }
                    Err(e) => {
                        debug!(plugin = %spec.name, reason = %e, "Optional dependency unavailable")
                    }
                }
            }
            let spec = &mut self.specs[index];
            match error {
                Some(e) => spec.set_error(e),
                None => {
                    spec.providers = providers;
                    spec.state = SpecState::Resolved;
                }
            }
        }
        self.propagate_dependency_errors();
    }

    /// Mark plugins whose required dependencies failed, until nothing changes.
    fn propagate_dependency_errors(&mut self) {
        loop {
            let mut failed = Vec::new();
            for (index, spec) in self.specs.iter().enumerate() {
                if !spec.is_usable() || spec.state < SpecState::Loaded {
                    continue;
                }
                if let Some(provider) = self.failed_provider(spec) {
                    failed.push((index, provider.to_string()));
                }
            }
            if failed.is_empty() {
                return;
            }
            for (index, dependency) in failed {
                self.specs[index].set_error(format!(
                    "Cannot load plugin because dependency failed to load: {dependency}"
                ));
            }
        }
    }

    /// Depth-first order with dependencies first. Members of a cycle get an
    /// error and are left out.
    fn compute_load_queue(&mut self) -> Vec<usize> {
        let mut queue = Vec::new();
        let mut visited = HashSet::new();
        let mut cycles = Vec::new();
        for index in 0..self.specs.len() {
            let mut stack = Vec::new();
            self.visit(index, &mut stack, &mut visited, &mut queue, &mut cycles);
        }
        for cycle in &cycles {
            let names: Vec<&str> = cycle.iter().map(|&i| self.specs[i].name.as_str()).collect();
            let message = format!("Circular dependency detected: {}", names.join(" -> "));
            for &index in cycle {
                if !self.specs[index].has_error() {
                    self.specs[index].set_error(message.clone());
                }
            }
        }
        if !cycles.is_empty() {
            self.propagate_dependency_errors();
        }
        queue.retain(|&i| self.specs[i].is_usable());
        queue
    }

    fn visit(
        &self,
        index: usize,
        stack: &mut Vec<usize>,
        visited: &mut HashSet<usize>,
        queue: &mut Vec<usize>,
        cycles: &mut Vec<Vec<usize>>,
    ) {
        let spec = &self.specs[index];
        if spec.state != SpecState::Resolved || !spec.is_usable() || visited.contains(&index) {
            return;
        }
        if let Some(position) = stack.iter().position(|&i| i == index) {
            cycles.push(stack[position..].to_vec());
            return;
        }

        stack.push(index);
        for dependency in &spec.dependencies {
            if let Ok(provider) = self.find_provider(dependency) {
                self.visit(provider, stack, visited, queue, cycles);
            }
        }
        stack.pop();
        if visited.insert(index) {
            queue.push(index);
        }
    }

    /// Name of the first provider of `spec` that has failed.
    fn failed_provider(&self, spec: &PluginSpec) -> Option<&str> {
        spec.providers
            .iter()
            .map(|&provider| &self.specs[provider])
            .find(|provider| provider.has_error())
            .map(|provider| provider.name.as_str())
    }

    fn initialize_plugin(&mut self, index: usize) {
        let broken_dependency = self
            .failed_provider(&self.specs[index])
            .map(str::to_string);

        let arguments = self.arguments.clone();
        let spec = &mut self.specs[index];
        if let Some(dependency) = broken_dependency {
            spec.set_error(format!(
                "Cannot load plugin because dependency failed to load: {dependency}"
            ));
            return;
        }
        let Some(instance) = &spec.instance else {
            spec.set_error("plugin instance is gone");
            return;
        };
        match instance.with(|plugin| plugin.initialize(&arguments)) {
            Some(Ok(())) => {
                spec.state = SpecState::Initialized;
                debug!(plugin = %spec.name, "Plugin initialized");
            }
            Some(Err(e)) => spec.set_error(format!("Plugin initialization failed: {e}")),
            None => spec.set_error("plugin instance is gone"),
        }
    }
}

impl Drop for PluginManager {
    fn drop(&mut self) {
        if !self.load_queue.is_empty() {
            self.shutdown();
        }
    }
}

fn collect_libraries(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
    paths.sort();
    for path in paths {
        if path.is_dir() {
            collect_libraries(&path, out);
        } else if is_native_library(&path) {
            out.push(path);
        }
    }
}

/// `libTextEditor.so.1` names the plugin `TextEditor` until its instance
/// reports the real name. `lib` only counts as a prefix when a new word
/// starts after it, so `library.dylib` stays `library`.
fn name_from_file(path: &Path) -> String {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = file_name.split('.').next().unwrap_or_default();
    match stem.strip_prefix("lib") {
        Some(rest) if rest.starts_with(['_', '-']) && rest.len() > 1 => rest[1..].to_string(),
        Some(rest) if rest.starts_with(|c: char| c.is_ascii_uppercase() || c.is_ascii_digit()) => {
            rest.to_string()
        }
        _ => stem.to_string(),
    }
}
