//! Persisted plugin verification cache.
//!
//! Entries live in a plain string key-value store under
//! `"<namespace> Plugin Cache <major>.<minor>.<debug>/<absolute path>"` and hold
//! `[versionHex, debugInt, buildKey, lastModified]` as a JSON array. Files
//! without a record are cached too, with version `0`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use crate::compat::HostAbi;
use crate::record::VerificationRecord;
use crate::version::PackedVersion;

const SETTINGS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("settings");

/// Settings store errors.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<redb::DatabaseError> for SettingsError {
    fn from(e: redb::DatabaseError) -> Self {
        SettingsError::Storage(e.to_string())
    }
}

impl From<redb::TransactionError> for SettingsError {
    fn from(e: redb::TransactionError) -> Self {
        SettingsError::Storage(e.to_string())
    }
}

impl From<redb::TableError> for SettingsError {
    fn from(e: redb::TableError) -> Self {
        SettingsError::Storage(e.to_string())
    }
}

impl From<redb::StorageError> for SettingsError {
    fn from(e: redb::StorageError) -> Self {
        SettingsError::Storage(e.to_string())
    }
}

impl From<redb::CommitError> for SettingsError {
    fn from(e: redb::CommitError) -> Self {
        SettingsError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for SettingsError {
    fn from(e: serde_json::Error) -> Self {
        SettingsError::Serialization(e.to_string())
    }
}

/// String key-value settings.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, SettingsError>;
    fn set(&self, key: &str, value: &str) -> Result<(), SettingsError>;
    fn remove(&self, key: &str) -> Result<bool, SettingsError>;
}

/// Settings kept in memory only.
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Result<Option<String>, SettingsError> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, SettingsError> {
        Ok(self.values.lock().remove(key).is_some())
    }
}

/// Settings in a redb database file.
pub struct RedbSettings {
    db: Database,
}

impl RedbSettings {
    /// Open or create the database at `path`, creating parent directories.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database::create(path)?;
        let store = Self { db };
        store.ensure_tables()?;
        Ok(store)
    }

    fn ensure_tables(&self) -> Result<(), SettingsError> {
        let write_txn = self.db.begin_write()?;
        {
            let _ = write_txn.open_table(SETTINGS_TABLE)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

impl SettingsStore for RedbSettings {
    fn get(&self, key: &str) -> Result<Option<String>, SettingsError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SETTINGS_TABLE)?;
        let value = table.get(key)?.map(|v| v.value().to_string());
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SETTINGS_TABLE)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, SettingsError> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(SETTINGS_TABLE)?;
            let removed = table.remove(key)?;
            removed.is_some()
        };
        write_txn.commit()?;
        Ok(existed)
    }
}

/// A cached verification verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedVerdict {
    Plugin(VerificationRecord),
    NotAPlugin,
}

/// Verification verdicts keyed by path and modification time.
pub struct PluginCache {
    store: Arc<dyn SettingsStore>,
    namespace: String,
    host: HostAbi,
}

impl PluginCache {
    pub fn new(store: Arc<dyn SettingsStore>, namespace: impl Into<String>, host: HostAbi) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            host,
        }
    }

    /// Settings key of the entry for `path`.
    pub fn key(&self, path: &Path) -> String {
        format!(
            "{} Plugin Cache {}.{}.{}/{}",
            self.namespace,
            self.host.version.major(),
            self.host.version.minor(),
            self.host.debug,
            path.display()
        )
    }

    /// Cached verdict for `path`, if its timestamp still matches.
    pub fn lookup(
        &self,
        path: &Path,
        last_modified: &str,
    ) -> Result<Option<CachedVerdict>, SettingsError> {
        let key = self.key(path);
        let Some(raw) = self.store.get(&key)? else {
            return Ok(None);
        };
        let fields: Vec<String> = serde_json::from_str(&raw)?;
        let [version, debug, build_key, stamp] = fields.as_slice() else {
            return Err(SettingsError::Serialization(format!(
                "expected 4 fields in {key}, found {}",
                fields.len()
            )));
        };
        if stamp != last_modified {
            debug!(path = %path.display(), "Plugin cache entry is stale");
            return Ok(None);
        }

        let version = PackedVersion::from_hex(version)
            .ok_or_else(|| SettingsError::Serialization(format!("bad version {version}")))?;
        if version.raw() == 0 {
            return Ok(Some(CachedVerdict::NotAPlugin));
        }
        Ok(Some(CachedVerdict::Plugin(VerificationRecord::new(
            version,
            debug == "1",
            build_key.clone(),
        ))))
    }

    /// Remember `verdict` for `path`.
    pub fn store(
        &self,
        path: &Path,
        last_modified: &str,
        verdict: &CachedVerdict,
    ) -> Result<(), SettingsError> {
        let fields = match verdict {
            CachedVerdict::Plugin(record) => [
                record.version.to_hex(),
                if record.debug { "1" } else { "0" }.to_string(),
                record.build_key.clone(),
                last_modified.to_string(),
            ],
            CachedVerdict::NotAPlugin => [
                "0".to_string(),
                "0".to_string(),
                String::new(),
                last_modified.to_string(),
            ],
        };
        let raw = serde_json::to_string(&fields)?;
        self.store.set(&self.key(path), &raw)
    }

    pub fn forget(&self, path: &Path) -> Result<bool, SettingsError> {
        self.store.remove(&self.key(path))
    }
}

/// ISO-8601 form of a file modification time.
pub fn format_timestamp(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Modification time of `path` in cache form.
pub fn last_modified(path: &Path) -> std::io::Result<String> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(format_timestamp(modified))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(store: Arc<dyn SettingsStore>) -> PluginCache {
        PluginCache::new(
            store,
            "modhost",
            HostAbi::new(PackedVersion::new(5, 6, 0), "key", false),
        )
    }

    #[test]
    fn test_key_layout() {
        let cache = cache(Arc::new(MemorySettings::new()));
        assert_eq!(
            cache.key(Path::new("/opt/plugins/libtext.so")),
            "modhost Plugin Cache 5.6.false//opt/plugins/libtext.so"
        );
    }

    #[test]
    fn test_value_layout() {
        let store = Arc::new(MemorySettings::new());
        let cache = cache(store.clone());
        let path = Path::new("/p/libx.so");
        let record = VerificationRecord::new(PackedVersion::new(5, 6, 3), true, "key");
        cache
            .store(path, "2024-01-01T00:00:00Z", &CachedVerdict::Plugin(record))
            .unwrap();

        let raw = store.get(&cache.key(path)).unwrap().unwrap();
        assert_eq!(raw, r#"["50603","1","key","2024-01-01T00:00:00Z"]"#);
    }

    #[test]
    fn test_lookup_respects_timestamp() {
        let cache = cache(Arc::new(MemorySettings::new()));
        let path = Path::new("/p/libx.so");
        let record = VerificationRecord::new(PackedVersion::new(5, 6, 0), false, "key");
        cache
            .store(path, "t1", &CachedVerdict::Plugin(record.clone()))
            .unwrap();

        assert_eq!(
            cache.lookup(path, "t1").unwrap(),
            Some(CachedVerdict::Plugin(record))
        );
        assert_eq!(cache.lookup(path, "t2").unwrap(), None);
        assert_eq!(cache.lookup(Path::new("/p/other.so"), "t1").unwrap(), None);
    }

    #[test]
    fn test_not_a_plugin_round_trips_as_version_zero() {
        let cache = cache(Arc::new(MemorySettings::new()));
        let path = Path::new("/p/notes.so");
        cache.store(path, "t1", &CachedVerdict::NotAPlugin).unwrap();
        assert_eq!(
            cache.lookup(path, "t1").unwrap(),
            Some(CachedVerdict::NotAPlugin)
        );
        assert!(cache.forget(path).unwrap());
        assert_eq!(cache.lookup(path, "t1").unwrap(), None);
    }

    #[test]
    fn test_corrupt_entry_is_an_error() {
        let store = Arc::new(MemorySettings::new());
        let cache = cache(store.clone());
        let path = Path::new("/p/libx.so");
        store.set(&cache.key(path), "[\"1\"]").unwrap();
        assert!(cache.lookup(path, "t1").is_err());
    }

    #[test]
    fn test_redb_settings_persist() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("settings.redb");
        {
            let store = RedbSettings::open(&db_path).unwrap();
            store.set("a", "1").unwrap();
            assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
        }
        let store = RedbSettings::open(&db_path).unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
        assert!(store.remove("a").unwrap());
        assert!(!store.remove("a").unwrap());
        assert_eq!(store.get("missing").unwrap(), None);
    }

    #[test]
    fn test_timestamp_format() {
        let stamp = format_timestamp(SystemTime::UNIX_EPOCH);
        assert_eq!(stamp, "1970-01-01T00:00:00.000000000Z");
    }
}
