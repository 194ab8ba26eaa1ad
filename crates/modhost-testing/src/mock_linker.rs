//! A dynamic linker that maps nothing and counts everything.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use modhost_core::{DynamicLinker, LoadHints, MappedLibrary, SymbolAddress};
use parking_lot::Mutex;
use tracing::trace;

#[derive(Default)]
struct LinkerState {
    libraries: HashMap<PathBuf, HashMap<String, SymbolAddress>>,
    open_failures: HashMap<PathBuf, String>,
    close_failures: HashMap<PathBuf, String>,
    attempts: Vec<PathBuf>,
    opens: HashMap<PathBuf, usize>,
    closes: HashMap<PathBuf, usize>,
    last_hints: Option<LoadHints>,
}

/// Mock of the OS loader.
///
/// Libraries are registered by path together with their exported symbols.
/// Opening anything else fails like a missing file would.
#[derive(Clone, Default)]
pub struct MockLinker {
    state: Arc<Mutex<LinkerState>>,
}

impl MockLinker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a library at `path` exporting `symbols`.
    pub fn install<I, S>(&self, path: impl AsRef<Path>, symbols: I)
    where
        I: IntoIterator<Item = (S, SymbolAddress)>,
        S: Into<String>,
    {
        let symbols = symbols.into_iter().map(|(n, a)| (n.into(), a)).collect();
        self.state.lock().libraries.insert(key(path.as_ref()), symbols);
    }

    /// Make every open of `path` fail with `message`.
    pub fn fail_open(&self, path: impl AsRef<Path>, message: impl Into<String>) {
        self.state
            .lock()
            .open_failures
            .insert(key(path.as_ref()), message.into());
    }

    /// Make every close of `path` fail with `message`, until
    /// [`allow_close`](Self::allow_close).
    pub fn fail_close(&self, path: impl AsRef<Path>, message: impl Into<String>) {
        self.state
            .lock()
            .close_failures
            .insert(key(path.as_ref()), message.into());
    }

    pub fn allow_close(&self, path: impl AsRef<Path>) {
        self.state.lock().close_failures.remove(&key(path.as_ref()));
    }

    /// Every path `open` was called with, in order.
    pub fn attempts(&self) -> Vec<PathBuf> {
        self.state.lock().attempts.clone()
    }

    /// Successful opens of `path`.
    pub fn opens(&self, path: impl AsRef<Path>) -> usize {
        let state = self.state.lock();
        state.opens.get(&key(path.as_ref())).copied().unwrap_or(0)
    }

    /// Closes of `path`.
    pub fn closes(&self, path: impl AsRef<Path>) -> usize {
        let state = self.state.lock();
        state.closes.get(&key(path.as_ref())).copied().unwrap_or(0)
    }

    pub fn total_opens(&self) -> usize {
        self.state.lock().opens.values().sum()
    }

    pub fn total_closes(&self) -> usize {
        self.state.lock().closes.values().sum()
    }

    /// Opens not yet matched by a close.
    pub fn live_mappings(&self) -> usize {
        self.total_opens() - self.total_closes()
    }

    pub fn last_hints(&self) -> Option<LoadHints> {
        self.state.lock().last_hints
    }
}

impl DynamicLinker for MockLinker {
    fn open(&self, path: &Path, hints: LoadHints) -> Result<Box<dyn MappedLibrary>, String> {
        let path = key(path);
        let mut state = self.state.lock();
        state.attempts.push(path.clone());
        state.last_hints = Some(hints);

        if let Some(message) = state.open_failures.get(&path) {
            return Err(message.clone());
        }
        let Some(symbols) = state.libraries.get(&path).cloned() else {
            return Err(format!(
                "{}: cannot open shared object file: No such file or directory",
                path.display()
            ));
        };
        *state.opens.entry(path.clone()).or_insert(0) += 1;
        trace!(path = %path.display(), ?hints, "Mock library opened");
        Ok(Box::new(MockLibrary {
            path,
            symbols,
            state: self.state.clone(),
        }))
    }
}

/// One mock mapping.
pub struct MockLibrary {
    path: PathBuf,
    symbols: HashMap<String, SymbolAddress>,
    state: Arc<Mutex<LinkerState>>,
}

impl MappedLibrary for MockLibrary {
    fn symbol(&self, name: &str) -> Result<SymbolAddress, String> {
        self.symbols
            .get(name)
            .copied()
            .ok_or_else(|| format!("{}: undefined symbol: {name}", self.path.display()))
    }

    /// Counts only successful closes; a refused one leaves the mapping live.
    fn close(&mut self) -> Result<(), String> {
        let mut state = self.state.lock();
        if let Some(message) = state.close_failures.get(&self.path) {
            return Err(message.clone());
        }
        *state.closes.entry(self.path.clone()).or_insert(0) += 1;
        Ok(())
    }
}

fn key(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(value: usize) -> SymbolAddress {
        SymbolAddress::new(value as *mut std::ffi::c_void).unwrap()
    }

    #[test]
    fn test_open_registered_library() {
        let linker = MockLinker::new();
        linker.install("/mock/libx.so", [("x_symbol", address(0x1000))]);

        let mut library = linker
            .open(Path::new("/mock/libx.so"), LoadHints::RESOLVE_ALL_SYMBOLS)
            .unwrap();
        assert_eq!(library.symbol("x_symbol").unwrap(), address(0x1000));
        assert!(library.symbol("other").unwrap_err().contains("undefined symbol"));
        assert_eq!(linker.opens("/mock/libx.so"), 1);
        assert_eq!(linker.last_hints(), Some(LoadHints::RESOLVE_ALL_SYMBOLS));

        library.close().unwrap();
        assert_eq!(linker.closes("/mock/libx.so"), 1);
        assert_eq!(linker.live_mappings(), 0);
    }

    #[test]
    fn test_unknown_library_fails_and_is_recorded() {
        let linker = MockLinker::new();
        let err = linker
            .open(Path::new("/mock/missing.so"), LoadHints::empty())
            .err()
            .unwrap();
        assert!(err.contains("No such file"));
        assert_eq!(linker.attempts(), vec![PathBuf::from("/mock/missing.so")]);
        assert_eq!(linker.total_opens(), 0);
    }

    #[test]
    fn test_injected_failures() {
        let linker = MockLinker::new();
        linker.install("/mock/liby.so", Vec::<(String, SymbolAddress)>::new());
        linker.fail_close("/mock/liby.so", "busy");
        let mut library = linker.open(Path::new("/mock/liby.so"), LoadHints::empty()).unwrap();
        assert_eq!(library.close().unwrap_err(), "busy");
        assert_eq!(linker.live_mappings(), 1);
        linker.allow_close("/mock/liby.so");
        library.close().unwrap();
        assert_eq!(linker.live_mappings(), 0);

        linker.fail_open("/mock/liby.so", "bad ELF header");
        let err = linker.open(Path::new("/mock/liby.so"), LoadHints::empty()).err().unwrap();
        assert_eq!(err, "bad ELF header");
    }
}
