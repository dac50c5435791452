//! In-process loader serving real function addresses for tests.

use std::{
    collections::HashMap,
    fs,
    num::NonZeroUsize,
    path::Path,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

use hotlink_core::{LoadError, Loader, PathResolver, ReloadPolicy};
use tempfile::TempDir;

use crate::Linker;

pub(crate) type IntFn = unsafe extern "C" fn(i32) -> i32;

pub(crate) extern "C" fn square_v1(x: i32) -> i32 {
    x * x
}

pub(crate) extern "C" fn square_v2(x: i32) -> i32 {
    x * x + 1
}

pub(crate) extern "C" fn cube_v1(x: i32) -> i32 {
    x * x * x
}

pub(crate) extern "C" fn square_fallback(_x: i32) -> i32 {
    -1
}

/// Loader whose libraries are symbol tables keyed by file name.
#[derive(Debug, Default)]
pub(crate) struct TableLoader {
    libraries: HashMap<String, HashMap<String, usize>>,
    pub(crate) loads: AtomicUsize,
    closed: Mutex<Vec<String>>,
}

#[derive(Debug)]
pub(crate) struct TableHandle {
    file: String,
}

impl TableLoader {
    pub(crate) fn with_library(mut self, file: &str, symbols: &[(&str, usize)]) -> Self {
        let table = symbols
            .iter()
            .map(|(name, address)| ((*name).to_string(), *address))
            .collect();
        self.libraries.insert(file.to_string(), table);
        self
    }

    pub(crate) fn closed(&self) -> Vec<String> {
        self.closed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Loader for TableLoader {
    type Handle = TableHandle;

    fn load(&self, path: &Path) -> Result<TableHandle, LoadError> {
        let file = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| LoadError::InvalidPath(path.display().to_string()))?;
        if !self.libraries.contains_key(file) {
            return Err(LoadError::LibraryLoad(format!("{file}: not a library")));
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(TableHandle {
            file: file.to_string(),
        })
    }

    fn resolve(&self, handle: &TableHandle, symbol: &str) -> Result<NonZeroUsize, LoadError> {
        self.libraries
            .get(&handle.file)
            .and_then(|table| table.get(symbol))
            .and_then(|address| NonZeroUsize::new(*address))
            .ok_or_else(|| LoadError::SymbolNotFound {
                symbol: symbol.to_string(),
                reason: format!("not exported by {}", handle.file),
            })
    }

    fn unload(&self, handle: TableHandle) -> Result<(), LoadError> {
        self.closed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle.file);
        Ok(())
    }
}

/// A linker over `mathlib` (square, cube) and `mathlib_v2` (square) whose
/// files live in a private temp dir.
pub(crate) struct Fixture {
    pub(crate) linker: Arc<Linker<TableLoader>>,
    _dir: TempDir,
}

impl Fixture {
    pub(crate) fn new(policy: ReloadPolicy) -> Self {
        let dir = TempDir::new().unwrap();
        let v1 = PathResolver::to_fully_qualified_name("mathlib");
        let v2 = PathResolver::to_fully_qualified_name("mathlib_v2");
        fs::write(dir.path().join(&v1), b"").unwrap();
        fs::write(dir.path().join(&v2), b"").unwrap();

        let loader = TableLoader::default()
            .with_library(
                &v1,
                &[("square", square_v1 as usize), ("cube", cube_v1 as usize)],
            )
            .with_library(&v2, &[("square", square_v2 as usize)]);
        let resolver = PathResolver::new()
            .with_working_dir(dir.path())
            .with_system_dir(None);

        Self {
            linker: Arc::new(Linker::with_loader(loader, resolver, policy)),
            _dir: dir,
        }
    }
}
