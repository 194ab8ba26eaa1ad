//! Per-handle verification verdicts.

use std::path::Path;

use tracing::{debug, warn};

use crate::cache::{self, CachedVerdict, PluginCache};
use crate::compat::CompatibilityChecker;
use crate::error::{LoaderError, Result};
use crate::handle::LibraryHandle;
use crate::record::VerificationRecord;
use crate::scanner;

/// Verification verdict of a library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PluginState {
    /// Not evaluated yet.
    #[default]
    MightBeAPlugin,
    IsAPlugin,
    IsNotAPlugin,
}

/// What verification found out about a library.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginDescriptor {
    pub state: PluginState,
    /// The parsed record, when the file had one.
    pub record: Option<VerificationRecord>,
    /// File modification time the verdict was computed for.
    pub last_modified: Option<String>,
    /// Why the library was rejected.
    pub error: Option<LoaderError>,
}

impl PluginDescriptor {
    fn accepted(record: VerificationRecord, last_modified: Option<String>) -> Self {
        Self {
            state: PluginState::IsAPlugin,
            record: Some(record),
            last_modified,
            error: None,
        }
    }

    fn rejected(
        record: Option<VerificationRecord>,
        last_modified: Option<String>,
        error: LoaderError,
    ) -> Self {
        Self {
            state: PluginState::IsNotAPlugin,
            record,
            last_modified,
            error: Some(error),
        }
    }

    pub fn is_plugin(&self) -> bool {
        self.state == PluginState::IsAPlugin
    }

    /// The verdict as a result.
    pub fn to_result(&self, path: &Path) -> Result<()> {
        match self.state {
            PluginState::IsAPlugin => Ok(()),
            _ => Err(self.error.clone().unwrap_or_else(|| LoaderError::VerificationMismatch {
                path: path.to_path_buf(),
                reason: "not verified".to_string(),
            })),
        }
    }
}

/// Computes verdicts: record lookup (symbol, cache or file scan), then the
/// compatibility rules.
pub struct PluginVerifier {
    cache: Option<PluginCache>,
    checker: CompatibilityChecker,
}

impl PluginVerifier {
    pub fn new(checker: CompatibilityChecker, cache: Option<PluginCache>) -> Self {
        Self { cache, checker }
    }

    pub fn checker(&self) -> &CompatibilityChecker {
        &self.checker
    }

    pub fn cache(&self) -> Option<&PluginCache> {
        self.cache.as_ref()
    }

    /// Verdict for `handle`, computed once per handle.
    pub fn verify(&self, handle: &LibraryHandle) -> Result<PluginDescriptor> {
        let current = handle.descriptor();
        if current.state != PluginState::MightBeAPlugin {
            current.to_result(handle.path())?;
            return Ok(current);
        }

        let descriptor = self.evaluate(handle)?;
        let descriptor = handle.set_descriptor(descriptor);
        descriptor.to_result(handle.path())?;
        Ok(descriptor)
    }

    /// Verdict for the file at `path` without a handle or any OS load.
    pub fn verify_file(&self, path: &Path) -> Result<PluginDescriptor> {
        let descriptor = self.evaluate_file(path)?;
        descriptor.to_result(path)?;
        Ok(descriptor)
    }

    fn evaluate(&self, handle: &LibraryHandle) -> Result<PluginDescriptor> {
        if !handle.is_mapped() {
            return self.evaluate_file(handle.path());
        }

        let last_modified = cache::last_modified(handle.path()).ok();
        match scanner::query_symbol(handle) {
            Ok(record) => Ok(self.judge(handle.path(), record, last_modified)),
            Err(e) => Ok(PluginDescriptor::rejected(None, last_modified, e)),
        }
    }

    fn evaluate_file(&self, path: &Path) -> Result<PluginDescriptor> {
        let last_modified = cache::last_modified(path).map_err(|e| LoaderError::NotFound {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        if let Some(cache) = &self.cache {
            match cache.lookup(path, &last_modified) {
                Ok(Some(CachedVerdict::Plugin(record))) => {
                    debug!(path = %path.display(), "Plugin cache hit");
                    return Ok(self.judge(path, record, Some(last_modified)));
                }
                Ok(Some(CachedVerdict::NotAPlugin)) => {
                    debug!(path = %path.display(), "Plugin cache hit, not a plugin");
                    return Ok(PluginDescriptor::rejected(
                        None,
                        Some(last_modified),
                        LoaderError::VerificationMismatch {
                            path: path.to_path_buf(),
                            reason: "no verification record".to_string(),
                        },
                    ));
                }
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Plugin cache lookup failed"),
            }
        }

        match scanner::scan_file(path) {
            Ok(record) => {
                self.remember(path, &last_modified, CachedVerdict::Plugin(record.clone()));
                Ok(self.judge(path, record, Some(last_modified)))
            }
            Err(e) if e.is_not_a_plugin() => {
                self.remember(path, &last_modified, CachedVerdict::NotAPlugin);
                Ok(PluginDescriptor::rejected(None, Some(last_modified), e))
            }
            Err(e) => Err(e),
        }
    }

    fn judge(
        &self,
        path: &Path,
        record: VerificationRecord,
        last_modified: Option<String>,
    ) -> PluginDescriptor {
        match self.checker.check(path, &record) {
            Ok(()) => PluginDescriptor::accepted(record, last_modified),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Rejected plugin");
                PluginDescriptor::rejected(Some(record), last_modified, e)
            }
        }
    }

    fn remember(&self, path: &Path, last_modified: &str, verdict: CachedVerdict) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.store(path, last_modified, &verdict) {
                warn!(path = %path.display(), error = %e, "Plugin cache update failed");
            }
        }
    }
}
