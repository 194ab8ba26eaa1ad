//! Fixture plugins and fixture library files.
//!
//! The fixture plugins are real `Plugin` implementations behind real
//! `extern "C"` entry points, so the engine exercises the same calls it makes
//! into a mapped library. Their lifecycle calls are appended to a global
//! event log; tests reading it hold the [`serial`] guard.

use std::ffi::c_void;
use std::os::raw::c_char;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use modhost_core::{
    HostAbi, MemorySettings, NameCandidates, PluginRuntime, SymbolAddress, VerificationRecord,
};
use modhost_sdk::abi::{
    verification_data_ptr, InstanceFn, PluginObject, DESTROY_SYMBOL, INSTANCE_SYMBOL,
    QUERY_VERIFICATION_SYMBOL,
};
use modhost_sdk::prelude::*;
use parking_lot::{Mutex, MutexGuard};

use crate::mock_linker::MockLinker;
use crate::test_utils::TestDir;

static EVENTS: Mutex<Vec<String>> = Mutex::new(Vec::new());
static SERIAL: Mutex<()> = Mutex::new(());

/// Serialize tests that share the event log.
pub fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock()
}

/// Lifecycle events so far, e.g. `"initialize:Core"`.
pub fn events() -> Vec<String> {
    EVENTS.lock().clone()
}

pub fn reset_events() {
    EVENTS.lock().clear();
}

fn record_event(event: &str, plugin: &str) {
    EVENTS.lock().push(format!("{event}:{plugin}"));
}

/// The fixture plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fixture {
    /// "Core" 0.1.0, no dependencies.
    Core,
    /// "Editor" 0.1.0, requires Core ^0.1.
    Editor,
    /// "Welcome" 0.1.0, requires Editor, optionally Missing.
    Welcome,
    /// "Broken" 0.1.0, initialize fails.
    Broken,
    /// "Orphan" 0.1.0, requires Missing.
    Orphan,
    /// "CycleA" requires CycleB.
    CycleA,
    /// "CycleB" requires CycleA.
    CycleB,
    /// "Future" requires Core ^2.
    Future,
}

struct FixtureSpec {
    name: &'static str,
    version: &'static str,
    dependencies: &'static [(&'static str, &'static str, DependencyKind)],
    fail_initialize: bool,
}

static FIXTURES: [FixtureSpec; 8] = [
    FixtureSpec {
        name: "Core",
        version: "0.1.0",
        dependencies: &[],
        fail_initialize: false,
    },
    FixtureSpec {
        name: "Editor",
        version: "0.1.0",
        dependencies: &[("Core", "^0.1", DependencyKind::Required)],
        fail_initialize: false,
    },
    FixtureSpec {
        name: "Welcome",
        version: "0.1.0",
        dependencies: &[
            ("Editor", "^0.1", DependencyKind::Required),
            ("Missing", "", DependencyKind::Optional),
        ],
        fail_initialize: false,
    },
    FixtureSpec {
        name: "Broken",
        version: "0.1.0",
        dependencies: &[],
        fail_initialize: true,
    },
    FixtureSpec {
        name: "Orphan",
        version: "0.1.0",
        dependencies: &[("Missing", "", DependencyKind::Required)],
        fail_initialize: false,
    },
    FixtureSpec {
        name: "CycleA",
        version: "0.1.0",
        dependencies: &[("CycleB", "", DependencyKind::Required)],
        fail_initialize: false,
    },
    FixtureSpec {
        name: "CycleB",
        version: "0.1.0",
        dependencies: &[("CycleA", "", DependencyKind::Required)],
        fail_initialize: false,
    },
    FixtureSpec {
        name: "Future",
        version: "0.1.0",
        dependencies: &[("Core", "^2", DependencyKind::Required)],
        fail_initialize: false,
    },
];

impl Fixture {
    fn spec(self) -> &'static FixtureSpec {
        &FIXTURES[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.spec().name
    }

    /// File name the fixture is written under.
    pub fn file_name(self) -> String {
        format!("lib{}.so", self.name().to_lowercase())
    }

    fn instance_fn(self) -> InstanceFn {
        match self {
            Fixture::Core => create::<{ Fixture::Core as usize }>,
            Fixture::Editor => create::<{ Fixture::Editor as usize }>,
            Fixture::Welcome => create::<{ Fixture::Welcome as usize }>,
            Fixture::Broken => create::<{ Fixture::Broken as usize }>,
            Fixture::Orphan => create::<{ Fixture::Orphan as usize }>,
            Fixture::CycleA => create::<{ Fixture::CycleA as usize }>,
            Fixture::CycleB => create::<{ Fixture::CycleB as usize }>,
            Fixture::Future => create::<{ Fixture::Future as usize }>,
        }
    }

    /// The symbols a library built from this fixture exports.
    pub fn symbols(self) -> Vec<(&'static str, SymbolAddress)> {
        let instance = self.instance_fn() as *mut c_void;
        let query = query_verification_data as *mut c_void;
        let destroy_ptr = destroy as *mut c_void;
        [
            (QUERY_VERIFICATION_SYMBOL, query),
            (INSTANCE_SYMBOL, instance),
            (DESTROY_SYMBOL, destroy_ptr),
        ]
        .into_iter()
        .filter_map(|(name, ptr)| SymbolAddress::new(ptr).map(|a| (name, a)))
        .collect()
    }

    /// Like [`symbols`](Self::symbols), without the instance entry point.
    pub fn symbols_without_entry_point(self) -> Vec<(&'static str, SymbolAddress)> {
        self.symbols()
            .into_iter()
            .filter(|(name, _)| *name != INSTANCE_SYMBOL)
            .collect()
    }
}

struct FixturePlugin {
    spec: &'static FixtureSpec,
}

impl Plugin for FixturePlugin {
    fn name(&self) -> &str {
        self.spec.name
    }

    fn version(&self) -> &str {
        self.spec.version
    }

    fn dependencies(&self) -> Vec<PluginDependency> {
        self.spec
            .dependencies
            .iter()
            .map(|&(name, version, kind)| match kind {
                DependencyKind::Required => PluginDependency::required(name, version),
                DependencyKind::Optional => PluginDependency::optional(name, version),
            })
            .collect()
    }

    fn initialize(&mut self, _arguments: &[String]) -> PluginResult<()> {
        record_event("initialize", self.spec.name);
        if self.spec.fail_initialize {
            return Err(PluginError::InitializationFailed(format!(
                "{} refuses to start",
                self.spec.name
            )));
        }
        Ok(())
    }

    fn extensions_initialized(&mut self) {
        record_event("extensions_initialized", self.spec.name);
    }

    fn about_to_shutdown(&mut self) {
        record_event("about_to_shutdown", self.spec.name);
    }
}

impl Drop for FixturePlugin {
    fn drop(&mut self) {
        record_event("destroy", self.spec.name);
    }
}

#[allow(improper_ctypes_definitions)]
extern "C" fn create<const INDEX: usize>() -> *mut PluginObject {
    let plugin: PluginObject = Box::new(FixturePlugin {
        spec: &FIXTURES[INDEX],
    });
    Box::into_raw(Box::new(plugin))
}

extern "C" fn query_verification_data() -> *const c_char {
    verification_data_ptr()
}

#[allow(improper_ctypes_definitions)]
unsafe extern "C" fn destroy(instance: *mut PluginObject) {
    if !instance.is_null() {
        drop(unsafe { Box::from_raw(instance) });
    }
}

/// Write a fake library image carrying `record` between filler bytes.
pub fn write_plugin_file(dir: &Path, file_name: &str, record: &VerificationRecord) -> PathBuf {
    let mut image = b"\x7fELF\x02\x01\x01\0".to_vec();
    image.extend(std::iter::repeat(0u8).take(2040));
    image.extend_from_slice(record.encode().as_bytes());
    image.push(0);
    image.extend(std::iter::repeat(0xccu8).take(512));
    write_file(dir, file_name, &image)
}

/// Write a fake library image without any record.
pub fn write_plain_file(dir: &Path, file_name: &str) -> PathBuf {
    let mut image = b"\x7fELF\x02\x01\x01\0".to_vec();
    image.extend(std::iter::repeat(0x5au8).take(4096));
    write_file(dir, file_name, &image)
}

fn write_file(dir: &Path, file_name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(file_name);
    if let Err(e) = std::fs::write(&path, data) {
        panic!("cannot write fixture {}: {e}", path.display());
    }
    path.canonicalize().unwrap_or(path)
}

/// A plugin directory backed by a [`MockLinker`].
pub struct FixtureDir {
    dir: TestDir,
    linker: MockLinker,
}

impl FixtureDir {
    pub fn new(name: &str) -> Self {
        Self {
            dir: TestDir::new(name),
            linker: MockLinker::new(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn linker(&self) -> &MockLinker {
        &self.linker
    }

    /// Write `fixture` with the host's own record and register its library.
    pub fn add(&self, fixture: Fixture) -> PathBuf {
        let path = write_plugin_file(self.path(), &fixture.file_name(), &HostAbi::current().record());
        self.linker.install(&path, fixture.symbols());
        path
    }

    /// Write a file with `record`, registered with `fixture`'s symbols.
    pub fn add_with_record(
        &self,
        file_name: &str,
        fixture: Fixture,
        record: &VerificationRecord,
    ) -> PathBuf {
        let path = write_plugin_file(self.path(), file_name, record);
        self.linker.install(&path, fixture.symbols());
        path
    }

    /// A runtime on the mock linker with an in-memory plugin cache.
    pub fn runtime(&self) -> Arc<PluginRuntime> {
        PluginRuntime::builder()
            .linker(Arc::new(self.linker.clone()))
            .names(NameCandidates::new(["", "lib"], ["", ".so"]))
            .settings(Arc::new(MemorySettings::new()), "modhost-test")
            .build()
    }
}
