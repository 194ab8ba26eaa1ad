use std::ffi::c_void;
use std::path::Path;

use libloading::Library;

use super::{DynamicLinker, LoadHints, MappedLibrary, SymbolAddress};

/// The OS loader, through `libloading`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLinker;

impl SystemLinker {
    pub fn new() -> Self {
        Self
    }
}

impl DynamicLinker for SystemLinker {
    fn open(&self, path: &Path, hints: LoadHints) -> Result<Box<dyn MappedLibrary>, String> {
        let library = open_library(path, hints).map_err(|e| e.to_string())?;
        Ok(Box::new(SystemLibrary {
            library: Some(library),
            keep_mapped: hints.contains(LoadHints::PREVENT_UNLOAD),
        }))
    }
}

#[cfg(unix)]
fn open_library(path: &Path, hints: LoadHints) -> Result<Library, libloading::Error> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_LAZY, RTLD_LOCAL, RTLD_NOW};

    let mut flags = if hints.contains(LoadHints::RESOLVE_ALL_SYMBOLS) {
        RTLD_NOW
    } else {
        RTLD_LAZY
    };
    flags |= if hints.contains(LoadHints::EXPORT_EXTERNAL_SYMBOLS) {
        RTLD_GLOBAL
    } else {
        RTLD_LOCAL
    };
    #[cfg(any(target_os = "linux", target_os = "android", target_vendor = "apple"))]
    {
        if hints.contains(LoadHints::PREVENT_UNLOAD) {
            flags |= libc::RTLD_NODELETE;
        }
    }
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    {
        if hints.contains(LoadHints::DEEP_BIND) {
            flags |= libc::RTLD_DEEPBIND;
        }
    }

    // Safety: running library initialisers is inherent to loading a plugin.
    unsafe { UnixLibrary::open(Some(path), flags) }.map(Into::into)
}

#[cfg(not(unix))]
fn open_library(path: &Path, _hints: LoadHints) -> Result<Library, libloading::Error> {
    // Safety: running library initialisers is inherent to loading a plugin.
    unsafe { Library::new(path) }
}

/// Hand `library` to the OS unloader. On failure the library comes back
/// still mapped.
#[cfg(unix)]
fn close_library(library: Library) -> Result<(), (Option<Library>, String)> {
    use libloading::os::unix::Library as UnixLibrary;

    let raw = UnixLibrary::from(library).into_raw();
    // Safety: `raw` came from dlopen and is closed at most once.
    if unsafe { libc::dlclose(raw) } == 0 {
        return Ok(());
    }
    // Safety: dlerror returns null or a NUL-terminated thread-local message.
    let message = unsafe {
        let text = libc::dlerror();
        if text.is_null() {
            "dlclose failed".to_string()
        } else {
            std::ffi::CStr::from_ptr(text).to_string_lossy().into_owned()
        }
    };
    // Safety: the refused dlclose left the handle valid.
    let library = unsafe { UnixLibrary::from_raw(raw) };
    Err((Some(library.into()), message))
}

/// libloading consumes the library even when FreeLibrary fails.
#[cfg(not(unix))]
fn close_library(library: Library) -> Result<(), (Option<Library>, String)> {
    library.close().map_err(|e| (None, e.to_string()))
}

struct SystemLibrary {
    library: Option<Library>,
    keep_mapped: bool,
}

impl MappedLibrary for SystemLibrary {
    fn symbol(&self, name: &str) -> Result<SymbolAddress, String> {
        let Some(library) = self.library.as_ref() else {
            return Err(format!("cannot resolve {name}: library is closed"));
        };
        // Safety: the address is handed out untyped; callers cast it.
        let address = unsafe { library.get::<*mut c_void>(name.as_bytes()) }
            .map_err(|e| e.to_string())?;
        SymbolAddress::new(*address).ok_or_else(|| format!("symbol {name} resolved to null"))
    }

    fn close(&mut self) -> Result<(), String> {
        let Some(library) = self.library.take() else {
            return Ok(());
        };
        if self.keep_mapped && cfg!(windows) {
            std::mem::forget(library);
            return Ok(());
        }
        close_library(library).map_err(|(library, message)| {
            self.library = library;
            message
        })
    }
}
