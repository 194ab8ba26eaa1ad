//! modhost plugin engine.
//!
//! Finds native plugins on disk, checks the verification record embedded in
//! each binary against the host's own build before any plugin code runs,
//! maps accepted libraries through reference-counted shared handles and
//! drives the plugin lifecycle.
//!
//! ```text
//! HostBootstrap ─▶ PluginManager ─▶ PluginLoader ─▶ PluginVerifier ─▶ scanner / PluginCache
//!                                        │                        └─▶ CompatibilityChecker
//!                                        └─▶ LibraryHandle ─▶ DynamicLinker
//! ```

pub mod bootstrap;
pub mod cache;
pub mod compat;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod handle;
pub mod loader;
pub mod manager;
pub mod platform;
pub mod record;
pub mod runtime;
pub mod scanner;
pub mod version;

pub use bootstrap::{BootstrapError, BootstrapStage, BootstrappedHost, HostBootstrap};
pub use cache::{
    CachedVerdict, MemorySettings, PluginCache, RedbSettings, SettingsError, SettingsStore,
};
pub use compat::{CompatibilityChecker, CompatibilityPolicy, HostAbi};
pub use config::{ConfigError, HostConfig};
pub use descriptor::{PluginDescriptor, PluginState, PluginVerifier};
pub use error::{LoaderError, Result};
pub use handle::{LibraryHandle, LibraryRegistry};
pub use loader::{PluginInstance, PluginLoader};
pub use manager::{PluginManager, PluginSpec, SpecState};
pub use platform::{DynamicLinker, LoadHints, MappedLibrary, NameCandidates, SymbolAddress, SystemLinker};
pub use record::{RecordError, VerificationRecord};
pub use runtime::{PluginRuntime, PluginRuntimeBuilder};
pub use version::PackedVersion;
