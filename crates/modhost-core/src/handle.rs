//! Shared library handles and the process-wide handle registry.
//!
//! There is at most one [`LibraryHandle`] per canonical path. Two counters
//! govern its life:
//!
//! - the reference count decides when the handle leaves the registry. Every
//!   `find_or_create` takes a reference, every `release` gives one back, and a
//!   live OS mapping holds one of its own until the unmap succeeds.
//! - the unload guard counts successful `load` calls. Only the `unload` that
//!   brings it to zero destroys the plugin instance and unmaps the library.
//!   If the OS refuses the unmap, the library stays mapped and that caller
//!   keeps its guard.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use modhost_sdk::abi::{DestroyFn, InstanceFn, PluginObject, DESTROY_SYMBOL, INSTANCE_SYMBOL};
use modhost_sdk::Plugin;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::descriptor::{PluginDescriptor, PluginState};
use crate::error::{LoaderError, Result};
use crate::platform::{DynamicLinker, LoadHints, MappedLibrary, NameCandidates, SymbolAddress};

/// Registry of live library handles, keyed by canonical path.
pub struct LibraryRegistry {
    shared: Arc<RegistryShared>,
}

struct RegistryShared {
    handles: Mutex<HashMap<PathBuf, Arc<LibraryHandle>>>,
    next_sequence: AtomicU64,
    linker: Arc<dyn DynamicLinker>,
    names: Arc<NameCandidates>,
}

impl LibraryRegistry {
    pub fn new(linker: Arc<dyn DynamicLinker>, names: NameCandidates) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                handles: Mutex::new(HashMap::new()),
                next_sequence: AtomicU64::new(0),
                linker,
                names: Arc::new(names),
            }),
        }
    }

    /// Look up the handle for `path`, creating it on first use.
    ///
    /// The caller owns one reference and must give it back with
    /// [`release`](Self::release).
    pub fn find_or_create(
        &self,
        path: &Path,
        version: Option<&str>,
        hints: LoadHints,
    ) -> Arc<LibraryHandle> {
        let mut handles = self.shared.handles.lock();
        if let Some(handle) = handles.get(path) {
            handle.ref_count.fetch_add(1, Ordering::AcqRel);
            handle.merge_hints(hints);
            return handle.clone();
        }

        let handle = Arc::new(LibraryHandle {
            path: path.to_path_buf(),
            version: version.map(str::to_string),
            sequence: self.shared.next_sequence.fetch_add(1, Ordering::Relaxed),
            ref_count: AtomicUsize::new(1),
            unload_count: AtomicUsize::new(0),
            hints: AtomicU32::new(hints.bits()),
            state: Mutex::new(HandleState::default()),
            instance: Mutex::new(None),
            descriptor: Mutex::new(PluginDescriptor::default()),
            linker: self.shared.linker.clone(),
            names: self.shared.names.clone(),
            registry: Arc::downgrade(&self.shared),
        });
        debug!(path = %path.display(), "Created library handle");
        handles.insert(path.to_path_buf(), handle.clone());
        handle
    }

    /// Give back a reference taken by [`find_or_create`](Self::find_or_create).
    pub fn release(&self, handle: Arc<LibraryHandle>) {
        self.shared.release(&handle);
    }

    /// Number of handles currently registered.
    pub fn len(&self) -> usize {
        self.shared.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered handle for `path`, without taking a reference.
    pub fn get(&self, path: &Path) -> Option<Arc<LibraryHandle>> {
        self.shared.handles.lock().get(path).cloned()
    }

    /// Destroy every instance and unmap every library, newest first.
    ///
    /// Handles still referenced by loaders stay registered, unmapped.
    pub fn drain(&self) {
        let mut handles: Vec<Arc<LibraryHandle>> =
            self.shared.handles.lock().values().cloned().collect();
        handles.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        for handle in handles {
            if handle.is_mapped() {
                debug!(path = %handle.path.display(), "Draining library handle");
                if let Err(e) = handle.force_unload() {
                    warn!(path = %handle.path.display(), error = %e, "Unmap during drain failed");
                }
            }
        }
    }
}

impl Drop for LibraryRegistry {
    fn drop(&mut self) {
        self.drain();
    }
}

impl RegistryShared {
    fn release(&self, handle: &LibraryHandle) {
        let mut handles = self.handles.lock();
        if handle.ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            let registered = handles
                .get(&handle.path)
                .is_some_and(|h| std::ptr::eq(Arc::as_ptr(h), handle));
            if registered {
                handles.remove(&handle.path);
                debug!(path = %handle.path.display(), "Removed library handle");
            }
        }
    }
}

#[derive(Default)]
struct HandleState {
    library: Option<Box<dyn MappedLibrary>>,
    resolved_path: Option<PathBuf>,
    instance_fn: Option<SymbolAddress>,
    error: Option<String>,
}

struct InstancePtr(NonNull<PluginObject>);

// The object is only touched under the handle's instance lock.
unsafe impl Send for InstancePtr {}

/// One OS shared library mapping, shared by every loader of the same file.
pub struct LibraryHandle {
    path: PathBuf,
    version: Option<String>,
    sequence: u64,
    ref_count: AtomicUsize,
    unload_count: AtomicUsize,
    hints: AtomicU32,
    state: Mutex<HandleState>,
    instance: Mutex<Option<InstancePtr>>,
    descriptor: Mutex<PluginDescriptor>,
    linker: Arc<dyn DynamicLinker>,
    names: Arc<NameCandidates>,
    registry: Weak<RegistryShared>,
}

impl LibraryHandle {
    /// Canonical path the handle is registered under.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Creation order within the registry.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn unload_count(&self) -> usize {
        self.unload_count.load(Ordering::Acquire)
    }

    pub fn load_hints(&self) -> LoadHints {
        LoadHints::from_bits_truncate(self.hints.load(Ordering::Acquire))
    }

    pub fn set_load_hints(&self, hints: LoadHints) {
        self.hints.store(hints.bits(), Ordering::Release);
    }

    fn merge_hints(&self, hints: LoadHints) {
        self.hints.fetch_or(hints.bits(), Ordering::AcqRel);
    }

    pub fn is_mapped(&self) -> bool {
        self.state.lock().library.is_some()
    }

    /// Whether the plugin entry point has been resolved.
    pub fn has_entry_point(&self) -> bool {
        self.state.lock().instance_fn.is_some()
    }

    /// The file the OS loader actually mapped.
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.state.lock().resolved_path.clone()
    }

    /// Last error recorded by this handle.
    pub fn error_string(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    /// The cached verification verdict.
    pub fn descriptor(&self) -> PluginDescriptor {
        self.descriptor.lock().clone()
    }

    /// Store a verdict. The first final verdict wins; later ones are ignored.
    pub fn set_descriptor(&self, descriptor: PluginDescriptor) -> PluginDescriptor {
        let mut current = self.descriptor.lock();
        if current.state == PluginState::MightBeAPlugin {
            *current = descriptor;
        }
        current.clone()
    }

    /// Map the library.
    ///
    /// Idempotent: when already mapped only the unload guard goes up.
    pub fn load(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.load_locked(&mut state)
    }

    fn load_locked(&self, state: &mut HandleState) -> Result<()> {
        if state.library.is_some() {
            self.unload_count.fetch_add(1, Ordering::AcqRel);
            return Ok(());
        }

        match self.map_library() {
            Ok((library, resolved)) => {
                info!(path = %resolved.display(), "Mapped library");
                state.library = Some(library);
                state.resolved_path = Some(resolved);
                state.error = None;
                self.unload_count.fetch_add(1, Ordering::AcqRel);
                // The mapping's own reference.
                self.ref_count.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            Err(e) => {
                state.error = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn map_library(&self) -> Result<(Box<dyn MappedLibrary>, PathBuf)> {
        let hints = self.load_hints();
        let candidates = if self.descriptor.lock().state == PluginState::IsAPlugin {
            vec![self.path.clone()]
        } else {
            self.names.candidates(&self.path, self.version.as_deref())
        };

        let mut last_error = None;
        for candidate in candidates {
            if candidate.is_absolute() && !candidate.exists() {
                continue;
            }
            match self.linker.open(&candidate, hints) {
                Ok(library) => return Ok((library, candidate)),
                Err(message) => {
                    debug!(path = %candidate.display(), error = %message, "Load attempt failed");
                    let stop = candidate.is_absolute();
                    last_error = Some(message);
                    if stop {
                        break;
                    }
                }
            }
        }

        Err(LoaderError::OsLoad {
            path: self.path.clone(),
            message: last_error.unwrap_or_else(|| "file not found".to_string()),
        })
    }

    /// Drop one unload guard; unmap when it reaches zero.
    ///
    /// Returns whether the library ends up unmapped.
    pub fn unload(&self) -> Result<bool> {
        let mut state = self.state.lock();
        self.unload_locked(&mut state)
    }

    fn unload_locked(&self, state: &mut HandleState) -> Result<bool> {
        if state.library.is_none() {
            let err = LoaderError::NotLoaded {
                path: self.path.clone(),
            };
            state.error = Some(err.to_string());
            return Err(err);
        }

        let remaining = self
            .unload_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .map(|previous| previous.saturating_sub(1))
            .unwrap_or(0);
        if remaining > 0 {
            return Ok(false);
        }

        self.teardown(state)
    }

    /// Unmap regardless of outstanding unload guards.
    fn force_unload(&self) -> Result<bool> {
        let mut state = self.state.lock();
        if state.library.is_none() {
            return Ok(true);
        }
        self.unload_count.store(0, Ordering::Release);
        self.teardown(&mut state)
    }

    fn teardown(&self, state: &mut HandleState) -> Result<bool> {
        self.destroy_instance(state);

        let Some(library) = state.library.as_mut() else {
            return Ok(true);
        };
        if let Err(message) = library.close() {
            self.unload_count.fetch_add(1, Ordering::AcqRel);
            let err = LoaderError::OsUnload {
                path: self.path.clone(),
                message,
            };
            warn!(path = %self.path.display(), error = %err, "Library stays mapped");
            state.error = Some(err.to_string());
            return Err(err);
        }

        state.library = None;
        state.instance_fn = None;
        state.error = None;
        // The mapping's own reference.
        if let Some(registry) = self.registry.upgrade() {
            registry.release(self);
        } else {
            self.ref_count.fetch_sub(1, Ordering::AcqRel);
        }
        debug!(path = %self.path.display(), "Unmapped library");
        Ok(true)
    }

    fn destroy_instance(&self, state: &HandleState) {
        let Some(InstancePtr(ptr)) = self.instance.lock().take() else {
            return;
        };
        let destroy = state
            .library
            .as_ref()
            .and_then(|library| library.symbol(DESTROY_SYMBOL).ok());
        match destroy {
            Some(address) => {
                // Safety: the symbol has the exported destroy signature and the
                // library is still mapped.
                unsafe {
                    let destroy: DestroyFn = address.to_fn();
                    destroy(ptr.as_ptr());
                }
            }
            None => {
                // Safety: host and plugin share allocator and layout, which the
                // build key check guarantees.
                drop(unsafe { Box::from_raw(ptr.as_ptr()) });
            }
        }
        debug!(path = %self.path.display(), "Destroyed plugin instance");
    }

    /// Look up a symbol in the mapped library.
    pub fn resolve(&self, symbol: &str) -> Option<SymbolAddress> {
        let mut state = self.state.lock();
        Self::resolve_locked(&self.path, &mut state, symbol).ok()
    }

    fn resolve_locked(
        path: &Path,
        state: &mut HandleState,
        symbol: &str,
    ) -> Result<SymbolAddress> {
        let Some(library) = state.library.as_ref() else {
            return Err(LoaderError::NotLoaded {
                path: path.to_path_buf(),
            });
        };
        match library.symbol(symbol) {
            Ok(address) => {
                state.error = None;
                Ok(address)
            }
            Err(message) => {
                let err = LoaderError::SymbolResolution {
                    symbol: symbol.to_string(),
                    path: path.to_path_buf(),
                    message,
                };
                state.error = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Map the library and resolve the plugin entry point.
    ///
    /// Idempotent like [`load`](Self::load). A missing entry point undoes the
    /// mapping taken by this call.
    pub fn load_plugin(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.instance_fn.is_some() {
            self.unload_count.fetch_add(1, Ordering::AcqRel);
            return Ok(());
        }

        self.load_locked(&mut state)?;
        match Self::resolve_locked(&self.path, &mut state, INSTANCE_SYMBOL) {
            Ok(address) => {
                state.instance_fn = Some(address);
                Ok(())
            }
            Err(e) => {
                if let Err(undo) = self.unload_locked(&mut state) {
                    warn!(path = %self.path.display(), error = %undo, "Undoing mapping failed");
                }
                state.error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Create the plugin root object on first call; later calls reuse it.
    pub fn instance(&self) -> Result<()> {
        let state = self.state.lock();
        let Some(entry) = state.instance_fn else {
            return Err(LoaderError::NotLoaded {
                path: self.path.clone(),
            });
        };

        let mut instance = self.instance.lock();
        if instance.is_some() {
            return Ok(());
        }

        // Safety: the entry point has the exported instance signature and the
        // library stays mapped while the state lock is held.
        let raw = unsafe {
            let create: InstanceFn = entry.to_fn();
            create()
        };
        match NonNull::new(raw) {
            Some(ptr) => {
                *instance = Some(InstancePtr(ptr));
                Ok(())
            }
            None => Err(LoaderError::NullInstance {
                path: self.path.clone(),
            }),
        }
    }

    pub fn has_instance(&self) -> bool {
        self.instance.lock().is_some()
    }

    /// Run `f` against the plugin root object, if one exists.
    pub fn with_instance<R>(&self, f: impl FnOnce(&mut dyn Plugin) -> R) -> Option<R> {
        let mut instance = self.instance.lock();
        instance.as_mut().map(|InstancePtr(ptr)| {
            // Safety: the pointer stays valid until destroy_instance takes it
            // out under this lock.
            let object: &mut PluginObject = unsafe { ptr.as_mut() };
            f(&mut **object)
        })
    }
}

impl std::fmt::Debug for LibraryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibraryHandle")
            .field("path", &self.path)
            .field("sequence", &self.sequence)
            .field("ref_count", &self.ref_count())
            .field("unload_count", &self.unload_count())
            .finish_non_exhaustive()
    }
}
