//! OS dynamic linker abstraction.
//!
//! Everything above this module is platform independent. The compiled-in
//! [`SystemLinker`] maps libraries through the OS loader; tests substitute a
//! counting mock.

mod system;

use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

pub use system::SystemLinker;

bitflags::bitflags! {
    /// Hints forwarded to the OS loader.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LoadHints: u32 {
        /// Resolve all symbols at load time instead of lazily.
        const RESOLVE_ALL_SYMBOLS = 0x01;
        /// Make the library's symbols available to libraries loaded later.
        const EXPORT_EXTERNAL_SYMBOLS = 0x02;
        /// Keep the library mapped after the last unload.
        const PREVENT_UNLOAD = 0x08;
        /// Prefer the library's own symbols over global ones.
        const DEEP_BIND = 0x10;
    }
}

/// Maps shared libraries into the process.
pub trait DynamicLinker: Send + Sync {
    /// Map `path`. The error is the OS loader's own message.
    fn open(&self, path: &Path, hints: LoadHints) -> Result<Box<dyn MappedLibrary>, String>;
}

/// One live OS mapping.
pub trait MappedLibrary: Send {
    /// Look up an exported symbol.
    fn symbol(&self, name: &str) -> Result<SymbolAddress, String>;

    /// Unmap. When the OS refuses, the library stays mapped and usable and
    /// `close` may be called again.
    fn close(&mut self) -> Result<(), String>;
}

/// Address of a resolved symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolAddress(NonNull<c_void>);

// The address is only dereferenced while the owning library stays mapped.
unsafe impl Send for SymbolAddress {}
unsafe impl Sync for SymbolAddress {}

impl SymbolAddress {
    pub fn new(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }

    /// Reinterpret the address as a function pointer.
    ///
    /// # Safety
    /// `F` must be a function pointer type matching the symbol's real
    /// signature, and the library must stay mapped while the result is used.
    pub unsafe fn to_fn<F: Copy>(self) -> F {
        debug_assert_eq!(
            std::mem::size_of::<F>(),
            std::mem::size_of::<*mut c_void>()
        );
        unsafe { std::mem::transmute_copy::<*mut c_void, F>(&self.0.as_ptr()) }
    }
}

/// File name prefixes and suffixes tried when the exact name fails.
///
/// A suffix may contain `{version}`, replaced by the handle's version
/// suffix. Suffixes with the placeholder are skipped for unversioned handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameCandidates {
    pub prefixes: Vec<String>,
    pub suffixes: Vec<String>,
}

impl NameCandidates {
    pub fn new<P, S>(prefixes: P, suffixes: S) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
        S: IntoIterator,
        S::Item: Into<String>,
    {
        Self {
            prefixes: prefixes.into_iter().map(Into::into).collect(),
            suffixes: suffixes.into_iter().map(Into::into).collect(),
        }
    }

    /// The table for the build target.
    pub fn platform_default() -> Self {
        if cfg!(windows) {
            Self::new([""], ["", ".dll"])
        } else if cfg!(target_vendor = "apple") {
            Self::new(
                ["", "lib"],
                ["", ".{version}.dylib", ".dylib", ".bundle", ".so"],
            )
        } else {
            Self::new(["", "lib"], ["", ".so.{version}", ".so"])
        }
    }

    /// Names to try for `path`, in order. The exact name comes first.
    pub fn candidates(&self, path: &Path, version: Option<&str>) -> Vec<PathBuf> {
        let mut names = vec![path.to_path_buf()];
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            return names;
        };

        for prefix in &self.prefixes {
            if !prefix.is_empty() && file_name.starts_with(prefix.as_str()) {
                continue;
            }
            for suffix in &self.suffixes {
                if prefix.is_empty() && suffix.is_empty() {
                    continue;
                }
                let suffix = if suffix.contains("{version}") {
                    match version {
                        Some(v) if !v.is_empty() => suffix.replace("{version}", v),
                        _ => continue,
                    }
                } else {
                    suffix.clone()
                };
                if !suffix.is_empty() && file_name.ends_with(suffix.as_str()) {
                    continue;
                }
                let candidate = path.with_file_name(format!("{prefix}{file_name}{suffix}"));
                if !names.contains(&candidate) {
                    names.push(candidate);
                }
            }
        }
        names
    }
}

impl Default for NameCandidates {
    fn default() -> Self {
        Self::platform_default()
    }
}

/// Whether `path` looks like a native shared library of any platform.
pub fn is_native_library(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let extension = path.extension().and_then(|e| e.to_str());
    matches!(extension, Some("so" | "dylib" | "dll" | "bundle")) || name.contains(".so.")
}
