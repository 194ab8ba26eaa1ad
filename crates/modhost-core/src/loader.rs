//! The public loader façade.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use modhost_sdk::Plugin;
use tracing::debug;

use crate::descriptor::PluginDescriptor;
use crate::error::{LoaderError, Result};
use crate::handle::LibraryHandle;
use crate::platform::LoadHints;
use crate::runtime::PluginRuntime;

/// Loads one plugin file.
///
/// Loaders pointing at the same file share one [`LibraryHandle`]; each loader
/// remembers whether it loaded the library itself, and only such a loader may
/// unload it again.
pub struct PluginLoader {
    runtime: Arc<PluginRuntime>,
    file_name: Option<PathBuf>,
    hints: LoadHints,
    handle: Option<Arc<LibraryHandle>>,
    did_load: bool,
    error: Option<String>,
}

impl PluginLoader {
    pub fn new(runtime: Arc<PluginRuntime>) -> Self {
        Self {
            runtime,
            file_name: None,
            hints: LoadHints::empty(),
            handle: None,
            did_load: false,
            error: None,
        }
    }

    /// A loader for `path`.
    ///
    /// A path that cannot be resolved is kept in [`error_string`](Self::error_string),
    /// and the first `load` fails with `NotFound`. Use
    /// [`set_file_name`](Self::set_file_name) to get the error directly.
    pub fn with_file_name(runtime: Arc<PluginRuntime>, path: impl AsRef<Path>) -> Self {
        let mut loader = Self::new(runtime);
        if let Err(e) = loader.set_file_name(path) {
            debug!(error = %e, "Loader created for an unresolvable path");
        }
        loader
    }

    /// Point the loader at `path`, releasing the previous handle.
    pub fn set_file_name(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.release_handle();
        self.did_load = false;
        self.error = None;

        match path.canonicalize() {
            Ok(canonical) => {
                let handle = self
                    .runtime
                    .libraries()
                    .find_or_create(&canonical, None, self.hints);
                self.file_name = Some(canonical);
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.file_name = Some(path.to_path_buf());
                Err(self.fail(LoaderError::NotFound {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                }))
            }
        }
    }

    /// Canonical file name, or the name as given when it does not exist.
    pub fn file_name(&self) -> Option<&Path> {
        self.file_name.as_deref()
    }

    pub fn load_hints(&self) -> LoadHints {
        self.hints
    }

    /// Hints apply to the next OS mapping of the shared handle.
    pub fn set_load_hints(&mut self, hints: LoadHints) {
        self.hints = hints;
        if let Some(handle) = &self.handle {
            handle.set_load_hints(hints);
        }
    }

    /// Verify, check compatibility, map and resolve the entry point.
    ///
    /// Does nothing if this loader already loaded the library.
    pub fn load(&mut self) -> Result<()> {
        if self.did_load {
            return Ok(());
        }
        let handle = self.require_handle()?;

        if let Err(e) = self.runtime.verifier().verify(&handle) {
            return Err(self.fail(e));
        }
        if let Err(e) = handle.load_plugin() {
            return Err(self.fail(e));
        }

        debug!(path = %handle.path().display(), "Plugin loaded");
        self.did_load = true;
        self.error = None;
        Ok(())
    }

    /// Unload, if this loader was the one that loaded.
    ///
    /// Returns whether the library ends up unmapped.
    pub fn unload(&mut self) -> Result<bool> {
        if !self.did_load {
            let path = self.file_name.clone().unwrap_or_default();
            return Err(self.fail(LoaderError::NotLoaded { path }));
        }
        let Some(handle) = self.handle.clone() else {
            self.did_load = false;
            return Ok(true);
        };
        match handle.unload() {
            Ok(unmapped) => {
                self.did_load = false;
                Ok(unmapped)
            }
            // Still mapped; this loader keeps its load and may retry.
            Err(e @ LoaderError::OsUnload { .. }) => Err(self.fail(e)),
            Err(e) => {
                self.did_load = false;
                Err(self.fail(e))
            }
        }
    }

    /// Load and return the plugin root object.
    pub fn instance(&mut self) -> Result<PluginInstance> {
        self.load()?;
        let handle = self.require_handle()?;
        if let Err(e) = handle.instance() {
            return Err(self.fail(e));
        }
        Ok(PluginInstance { handle })
    }

    /// Whether the library is mapped with its entry point resolved.
    pub fn is_loaded(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|h| h.is_mapped() && h.has_entry_point())
    }

    /// Last error, or `"Unknown error"`.
    pub fn error_string(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "Unknown error".to_string())
    }

    /// Verification and compatibility verdict, without loading.
    pub fn query_descriptor(&mut self) -> Result<PluginDescriptor> {
        let handle = self.require_handle()?;
        self.runtime
            .verifier()
            .verify(&handle)
            .map_err(|e| self.fail(e))
    }

    pub fn handle(&self) -> Option<&Arc<LibraryHandle>> {
        self.handle.as_ref()
    }

    fn require_handle(&mut self) -> Result<Arc<LibraryHandle>> {
        match &self.handle {
            Some(handle) => Ok(handle.clone()),
            None => {
                let path = self.file_name.clone().unwrap_or_default();
                Err(self.fail(LoaderError::NotFound {
                    path,
                    reason: "no such file".to_string(),
                }))
            }
        }
    }

    fn fail(&mut self, error: LoaderError) -> LoaderError {
        self.error = Some(error.to_string());
        error
    }

    fn release_handle(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.runtime.libraries().release(handle);
        }
    }
}

impl Drop for PluginLoader {
    fn drop(&mut self) {
        self.release_handle();
    }
}

impl std::fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginLoader")
            .field("file_name", &self.file_name)
            .field("did_load", &self.did_load)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// A plugin root object, owned by its library handle.
///
/// The object is destroyed when the handle unloads; calls made afterwards
/// return `None`.
#[derive(Clone)]
pub struct PluginInstance {
    handle: Arc<LibraryHandle>,
}

impl PluginInstance {
    /// Run `f` against the plugin object.
    pub fn with<R>(&self, f: impl FnOnce(&mut dyn Plugin) -> R) -> Option<R> {
        self.handle.with_instance(f)
    }

    pub fn is_alive(&self) -> bool {
        self.handle.has_instance()
    }

    pub fn name(&self) -> Option<String> {
        self.with(|plugin| plugin.name().to_string())
    }

    pub fn path(&self) -> &Path {
        self.handle.path()
    }
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("path", &self.handle.path())
            .finish()
    }
}
