//! Host/plugin compatibility rules.

use std::path::Path;

use modhost_sdk::{BUILD_KEY, DEBUG_BUILD, SDK_VERSION};

use crate::error::{LoaderError, Result};
use crate::record::VerificationRecord;
use crate::version::PackedVersion;

/// The host side of the comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAbi {
    pub version: PackedVersion,
    pub build_key: String,
    pub debug: bool,
}

impl HostAbi {
    pub fn new(version: PackedVersion, build_key: impl Into<String>, debug: bool) -> Self {
        Self {
            version,
            build_key: build_key.into(),
            debug,
        }
    }

    /// The ABI this host was compiled with.
    pub fn current() -> Self {
        Self::new(
            PackedVersion::parse(SDK_VERSION).unwrap_or_default(),
            BUILD_KEY,
            DEBUG_BUILD,
        )
    }

    /// The record a plugin built alongside this host carries.
    pub fn record(&self) -> VerificationRecord {
        VerificationRecord::new(self.version, self.debug, self.build_key.clone())
    }
}

/// Tunable parts of the rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompatibilityPolicy {
    /// Build keys accepted besides the host's own.
    pub legacy_build_keys: Vec<String>,
    /// Whether debug and release builds may not be mixed.
    pub check_debug_mode: bool,
}

impl Default for CompatibilityPolicy {
    fn default() -> Self {
        Self {
            legacy_build_keys: Vec::new(),
            check_debug_mode: default_debug_check(),
        }
    }
}

/// Only MSVC targets link debug and release runtimes separately.
pub const fn default_debug_check() -> bool {
    cfg!(all(windows, target_env = "msvc"))
}

/// Accepts or rejects verification records.
#[derive(Debug, Clone)]
pub struct CompatibilityChecker {
    host: HostAbi,
    policy: CompatibilityPolicy,
}

impl CompatibilityChecker {
    pub fn new(host: HostAbi, policy: CompatibilityPolicy) -> Self {
        Self { host, policy }
    }

    pub fn host(&self) -> &HostAbi {
        &self.host
    }

    pub fn policy(&self) -> &CompatibilityPolicy {
        &self.policy
    }

    /// Check `record` of the plugin at `path` against the host.
    pub fn check(&self, path: &Path, record: &VerificationRecord) -> Result<()> {
        // Patch levels are ABI compatible within a minor series.
        if !record.version.same_minor_series(self.host.version) {
            return Err(LoaderError::IncompatibleVersion {
                path: path.to_path_buf(),
                plugin: record.version,
                host: self.host.version,
            });
        }

        if record.build_key != self.host.build_key
            && !self
                .policy
                .legacy_build_keys
                .iter()
                .any(|key| *key == record.build_key)
        {
            return Err(LoaderError::IncompatibleBuildKey {
                path: path.to_path_buf(),
                expected: self.host.build_key.clone(),
                found: record.build_key.clone(),
            });
        }

        if self.policy.check_debug_mode && record.debug != self.host.debug {
            return Err(LoaderError::IncompatibleDebugMode {
                path: path.to_path_buf(),
                plugin_debug: record.debug,
                host_debug: self.host.debug,
            });
        }

        Ok(())
    }
}

impl Default for CompatibilityChecker {
    fn default() -> Self {
        Self::new(HostAbi::current(), CompatibilityPolicy::default())
    }
}
