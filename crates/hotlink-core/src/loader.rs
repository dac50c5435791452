//! Native library loading capability.
//!
//! The registry never talks to the operating system directly. Everything it
//! needs from the platform loader is expressed by the [`Loader`] trait: open a
//! library, look up a symbol address in it, and close it again.
//! [`NativeLoader`] is the `libloading`-backed implementation used outside of
//! tests.

use std::{ffi::c_void, num::NonZeroUsize, path::Path};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Errors that can occur when talking to the platform loader.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// Failed to load the dynamic library.
    #[error("failed to load library: {0}")]
    LibraryLoad(String),

    /// Invalid path.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// The symbol is not exported by the library, or resolved to null.
    #[error("symbol `{symbol}` not found: {reason}")]
    SymbolNotFound { symbol: String, reason: String },

    /// The platform loader refused to close the library.
    #[error("failed to close library: {0}")]
    LibraryClose(String),
}

/// Platform loader capability consumed by the registry.
///
/// Implementations must be shareable across threads: the registry calls into
/// the loader while holding its own lock, from whichever thread happens to
/// trigger a load, resolution or unload.
pub trait Loader: Send + Sync {
    /// Opaque token representing one loaded library.
    type Handle: Send + Sync;

    /// Opens the library at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::LibraryLoad`] if the platform loader rejects the
    /// file, or [`LoadError::InvalidPath`] if the path cannot be used.
    fn load(&self, path: &Path) -> Result<Self::Handle, LoadError>;

    /// Looks up the address of `symbol` in an opened library.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::SymbolNotFound`] if the symbol is missing or
    /// resolves to a null address.
    fn resolve(&self, handle: &Self::Handle, symbol: &str) -> Result<NonZeroUsize, LoadError>;

    /// Closes a library previously returned by [`Loader::load`].
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::LibraryClose`] if the platform loader reports a
    /// failure while closing.
    fn unload(&self, handle: Self::Handle) -> Result<(), LoadError>;
}

/// When the platform loader binds undefined symbols of a library.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Binding {
    /// Resolve symbols on first use (`RTLD_LAZY`).
    #[default]
    Lazy,
    /// Resolve every symbol while opening (`RTLD_NOW`).
    Now,
}

/// [`Loader`] backed by the operating system's dynamic loader.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeLoader {
    binding: Binding,
}

impl NativeLoader {
    #[must_use]
    pub fn new(binding: Binding) -> Self {
        Self { binding }
    }

    #[must_use]
    pub fn binding(&self) -> Binding {
        self.binding
    }
}

impl Loader for NativeLoader {
    type Handle = libloading::Library;

    fn load(&self, path: &Path) -> Result<Self::Handle, LoadError> {
        let path_str = path
            .to_str()
            .ok_or_else(|| LoadError::InvalidPath(path.display().to_string()))?;

        info!(path = %path_str, binding = ?self.binding, "Loading native library");

        // SAFETY: opening a library runs its initializers. Callers of the
        // registry opt into that by naming the library.
        let library = unsafe { open(path, self.binding) }
            .map_err(|e| LoadError::LibraryLoad(e.to_string()))?;

        debug!(path = %path_str, "Library loaded successfully");
        Ok(library)
    }

    fn resolve(&self, handle: &Self::Handle, symbol: &str) -> Result<NonZeroUsize, LoadError> {
        // SAFETY: the symbol is only read as an address here, never called.
        let address = unsafe { handle.get::<*mut c_void>(symbol.as_bytes()) }
            .map(|sym| (*sym).addr())
            .map_err(|e| LoadError::SymbolNotFound {
                symbol: symbol.to_string(),
                reason: e.to_string(),
            })?;

        NonZeroUsize::new(address).ok_or_else(|| LoadError::SymbolNotFound {
            symbol: symbol.to_string(),
            reason: "symbol resolved to a null address".to_string(),
        })
    }

    fn unload(&self, handle: Self::Handle) -> Result<(), LoadError> {
        handle
            .close()
            .map_err(|e| LoadError::LibraryClose(e.to_string()))
    }
}

/// # Safety
///
/// Runs the library's initialization routines.
#[cfg(unix)]
unsafe fn open(path: &Path, binding: Binding) -> Result<libloading::Library, libloading::Error> {
    use libloading::os::unix::{Library, RTLD_LAZY, RTLD_LOCAL, RTLD_NOW};

    let flags = match binding {
        Binding::Lazy => RTLD_LAZY,
        Binding::Now => RTLD_NOW,
    };
    unsafe { Library::open(Some(path), flags | RTLD_LOCAL) }.map(Into::into)
}

/// # Safety
///
/// Runs the library's initialization routines.
#[cfg(not(unix))]
unsafe fn open(path: &Path, _binding: Binding) -> Result<libloading::Library, libloading::Error> {
    unsafe { libloading::Library::new(path) }
}
