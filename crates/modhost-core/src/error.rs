//! Error types for plugin loading.
//!
//! Every failure is returned as a [`LoaderError`] and also recorded as the
//! "last error" string of the handle or loader that detected it, so callers
//! holding only a loader can still render a diagnostic later.

use std::path::PathBuf;

use crate::version::PackedVersion;

/// Result type for loader operations.
pub type Result<T> = std::result::Result<T, LoaderError>;

/// Plugin loading errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoaderError {
    /// The file does not exist or cannot be opened.
    #[error("The shared library was not found: {path} ({reason})")]
    NotFound { path: PathBuf, reason: String },

    /// No verification record, or a malformed one.
    #[error("The file '{path}' is not a valid plugin: {reason}")]
    VerificationMismatch { path: PathBuf, reason: String },

    /// The plugin targets a newer or different runtime series.
    #[error(
        "The plugin '{path}' uses an incompatible runtime library. (plugin {plugin}, host {host})"
    )]
    IncompatibleVersion {
        path: PathBuf,
        plugin: PackedVersion,
        host: PackedVersion,
    },

    /// The plugin was built with a different toolchain configuration.
    #[error(
        "The plugin '{path}' uses an incompatible runtime library. Expected build key \"{expected}\", got \"{found}\""
    )]
    IncompatibleBuildKey {
        path: PathBuf,
        expected: String,
        found: String,
    },

    /// Debug plugin in a release host or the other way round.
    #[error(
        "The plugin '{path}' uses an incompatible runtime library. (Cannot mix debug and release libraries: plugin debug={plugin_debug}, host debug={host_debug})"
    )]
    IncompatibleDebugMode {
        path: PathBuf,
        plugin_debug: bool,
        host_debug: bool,
    },

    /// The OS loader refused the library.
    #[error("Cannot load library {path}: ({message})")]
    OsLoad { path: PathBuf, message: String },

    /// The OS refused to unmap the library.
    #[error("Cannot unload library {path}: ({message})")]
    OsUnload { path: PathBuf, message: String },

    /// A symbol could not be resolved.
    #[error("Cannot resolve symbol \"{symbol}\" in {path}: ({message})")]
    SymbolResolution {
        symbol: String,
        path: PathBuf,
        message: String,
    },

    /// Unload requested by a loader that never loaded.
    #[error("The plugin was not loaded: {path}")]
    NotLoaded { path: PathBuf },

    /// The entry point returned no object.
    #[error("The plugin entry point of {path} returned no instance")]
    NullInstance { path: PathBuf },
}

impl LoaderError {
    /// Whether this is one of the compatibility rejections.
    pub fn is_incompatible(&self) -> bool {
        matches!(
            self,
            LoaderError::IncompatibleVersion { .. }
                | LoaderError::IncompatibleBuildKey { .. }
                | LoaderError::IncompatibleDebugMode { .. }
        )
    }

    /// Whether the file simply is not a plugin (no usable verification record).
    pub fn is_not_a_plugin(&self) -> bool {
        matches!(self, LoaderError::VerificationMismatch { .. })
    }
}
