//! In-memory [`Loader`] used by the unit tests.

use std::{
    collections::HashMap,
    num::NonZeroUsize,
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use crate::loader::{LoadError, Loader};

/// Serves libraries from a table keyed by file name instead of the disk.
#[derive(Debug, Default)]
pub(crate) struct MockLoader {
    libraries: HashMap<String, HashMap<String, usize>>,
    next_id: AtomicUsize,
    closed: Arc<Mutex<Vec<String>>>,
    panic_on_load: Option<String>,
    fail_close: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct MockHandle {
    pub(crate) id: usize,
    pub(crate) file: String,
}

impl MockLoader {
    pub(crate) fn with_library(mut self, file: &str, symbols: &[(&str, usize)]) -> Self {
        let symbols = symbols
            .iter()
            .map(|(name, address)| ((*name).to_string(), *address))
            .collect();
        self.libraries.insert(file.to_string(), symbols);
        self
    }

    /// Panics while loading `file`, as a misbehaving loader would.
    pub(crate) fn panicking_on_load(mut self, file: &str) -> Self {
        self.panic_on_load = Some(file.to_string());
        self
    }

    /// Reports a failure when closing handles of `file`.
    pub(crate) fn failing_close(mut self, file: &str) -> Self {
        self.fail_close = Some(file.to_string());
        self
    }

    /// File names of every handle closed so far, in order.
    pub(crate) fn closed(&self) -> Vec<String> {
        self.closed.lock().unwrap().clone()
    }

    /// Shared view of the close log that outlives the loader itself.
    pub(crate) fn closed_log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.closed)
    }

    pub(crate) fn open(&self, file: &str) -> MockHandle {
        self.load(Path::new(file)).unwrap()
    }
}

impl Loader for MockLoader {
    type Handle = MockHandle;

    fn load(&self, path: &Path) -> Result<MockHandle, LoadError> {
        let file = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| LoadError::InvalidPath(path.display().to_string()))?;
        if !self.libraries.contains_key(file) {
            return Err(LoadError::LibraryLoad(format!("{file}: no such library")));
        }
        if self.panic_on_load.as_deref() == Some(file) {
            panic!("{file}: loader crashed");
        }
        Ok(MockHandle {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            file: file.to_string(),
        })
    }

    fn resolve(&self, handle: &MockHandle, symbol: &str) -> Result<NonZeroUsize, LoadError> {
        self.libraries
            .get(&handle.file)
            .and_then(|symbols| symbols.get(symbol))
            .and_then(|address| NonZeroUsize::new(*address))
            .ok_or_else(|| LoadError::SymbolNotFound {
                symbol: symbol.to_string(),
                reason: format!("undefined symbol in {}", handle.file),
            })
    }

    fn unload(&self, handle: MockHandle) -> Result<(), LoadError> {
        if self.fail_close.as_deref() == Some(handle.file.as_str()) {
            return Err(LoadError::LibraryClose(format!("{}: close failed", handle.file)));
        }
        self.closed.lock().unwrap().push(handle.file);
        Ok(())
    }
}
