use crate::loader::LoadError;

/// Errors that can occur during registry operations.
///
/// Every condition that would otherwise be a hard failure of the linker
/// surfaces here, so the embedding application decides whether to abort,
/// retry or fall back.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// No file for the library was found on any search path.
    #[error("library not found on any search path: {0}")]
    LibraryNotFound(String),

    /// The library is not resident in the registry.
    #[error("unknown library: {0}")]
    UnknownLibrary(String),

    /// The library has no loaded handle to resolve symbols against.
    #[error("library not loaded: {0}")]
    LibraryNotLoaded(String),

    /// The symbol could not be resolved in the library.
    #[error("symbol `{symbol}` not found in library {library}")]
    SymbolNotFound {
        library: String,
        symbol: String,
        #[source]
        source: LoadError,
    },

    /// A cached descriptor was invalidated by an unload and has no
    /// replacement.
    #[error("descriptor for `{symbol}` in library {library} has been invalidated")]
    StaleDescriptor { library: String, symbol: String },

    /// A strict reload found symbols the replacement library does not export.
    #[error("cannot reload {old} as {new}: missing symbols {}", missing.join(", "))]
    ReloadIncomplete {
        old: String,
        new: String,
        missing: Vec<String>,
    },

    /// A library cannot be reloaded under its own name.
    #[error("cannot reload {0} into itself")]
    ReloadIntoSelf(String),

    /// The platform loader failed.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// The registry lock was poisoned by a panicking thread.
    #[error("registry lock poisoned")]
    LockPoisoned,
}
