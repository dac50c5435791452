//! Resolution facade: lazy load-or-fetch of function descriptors.

use std::{path::PathBuf, sync::Arc};

use hotlink_core::{
    CacheManager, ConfigError, FunctionDescriptor, LinkerConfig, Loader, NativeLoader,
    PathResolver, RegistryError, ReloadPolicy,
};
use tracing::{debug, instrument};

use crate::function::Function;

/// Entry point used by call sites to obtain live function descriptors.
///
/// A `Linker` owns one [`CacheManager`] and the [`PathResolver`] used to find
/// library files. Libraries are loaded the first time one of their functions
/// is resolved, and every later resolution of the same pair returns the same
/// descriptor.
///
/// Share it across threads behind an [`Arc`]; all operations take `&self`.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use hotlink::Linker;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let linker = Arc::new(Linker::new());
/// linker.add_search_path("./plugins");
///
/// // SAFETY: `square` in every build of mathlib is `extern "C" fn(i32) -> i32`.
/// let mut square =
///     unsafe { linker.function::<unsafe extern "C" fn(i32) -> i32>("mathlib", "square") };
/// assert_eq!(unsafe { (*square.get()?)(5) }, 25);
///
/// // Swap in the new build; `square` follows it on the next call.
/// linker.reload_library("mathlib", "mathlib_v2")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Linker<L: Loader = NativeLoader> {
    cache: CacheManager<L>,
    resolver: PathResolver,
}

impl Linker<NativeLoader> {
    /// Creates a linker with the default configuration.
    pub fn new() -> Self {
        Self::from_config(&LinkerConfig::default())
    }

    pub fn from_config(config: &LinkerConfig) -> Self {
        Self::with_loader(
            NativeLoader::new(config.binding),
            config.path_resolver(),
            config.reload_policy,
        )
    }

    /// Creates a linker from the resolved `hotlink.toml`, if any.
    ///
    /// # Errors
    ///
    /// Returns `Err(ConfigError)` if a config file was found but could not
    /// be read or parsed.
    pub fn from_environment() -> Result<Self, ConfigError> {
        let config = LinkerConfig::load_or_default()?;
        Ok(Self::from_config(&config))
    }
}

impl Default for Linker<NativeLoader> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: Loader> Linker<L> {
    pub fn with_loader(loader: L, resolver: PathResolver, policy: ReloadPolicy) -> Self {
        Self {
            cache: CacheManager::with_policy(loader, policy),
            resolver,
        }
    }

    pub fn cache(&self) -> &CacheManager<L> {
        &self.cache
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    /// Adds a directory to the library search paths.
    ///
    /// Returns `false` and changes nothing if `path` is not a directory.
    pub fn add_search_path(&self, path: impl AsRef<std::path::Path>) -> bool {
        self.resolver.add_search_path(path)
    }

    /// Returns the live descriptor for `func` in `lib`, loading and
    /// resolving on first use.
    ///
    /// A library retired by a reload is transparently replaced by the
    /// library that superseded it. A library known to the registry but
    /// without a handle, or unloaded while this call runs, is loaded again.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::LibraryNotFound`] if no file exists for `lib`
    /// - [`RegistryError::Load`] if the platform loader rejects the file
    /// - [`RegistryError::SymbolNotFound`] if `func` is not exported
    #[instrument(skip(self))]
    pub fn resolve(&self, lib: &str, func: &str) -> Result<Arc<FunctionDescriptor>, RegistryError> {
        let lib = self.cache.get_new_name(lib);

        let descriptor = self.cache.function_descriptor(&lib, func);
        if descriptor.is_valid() {
            debug!(library = %lib, "Descriptor cache hit");
            return Ok(descriptor);
        }

        match self.cache.resolve_function(&lib, func) {
            Err(RegistryError::LibraryNotLoaded(_)) => {
                // Unloading or reloading may have retired `lib` since the
                // alias lookup above.
                let lib = self.cache.get_new_name(&lib);
                let handle = self.open(&lib)?;
                self.cache.resolve_function_with(&lib, func, handle)
            }
            resolved => resolved,
        }
    }

    /// Binds a typed call site to `func` in `lib`.
    ///
    /// # Safety
    ///
    /// `F` must be a function pointer type matching the signature and ABI of
    /// `func` in every version of `lib` that may be reloaded in. See
    /// [`Function::new`].
    pub unsafe fn function<F: Copy>(
        self: &Arc<Self>,
        lib: impl Into<String>,
        func: impl Into<String>,
    ) -> Function<F, L> {
        // SAFETY: forwarded from the caller.
        unsafe { Function::new(Arc::clone(self), lib, func) }
    }

    /// Loads `lib` unless it is already resident.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::LibraryNotFound`] or [`RegistryError::Load`]
    /// if the library cannot be located or opened.
    #[instrument(skip(self))]
    pub fn preload_library(&self, lib: &str) -> Result<(), RegistryError> {
        let lib = self.cache.get_new_name(lib);
        if self.cache.library_handle(&lib).is_some() {
            return Ok(());
        }

        let handle = self.open(&lib)?;
        self.cache.register_library(&lib, handle)?;
        Ok(())
    }

    /// Resolves `func` in the already loaded `lib` unless it is resolved.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::LibraryNotLoaded`] if `lib` has not been
    /// loaded, or [`RegistryError::SymbolNotFound`] if `func` is not
    /// exported.
    #[instrument(skip(self))]
    pub fn preload_function(&self, lib: &str, func: &str) -> Result<(), RegistryError> {
        let lib = self.cache.get_new_name(lib);
        self.cache.resolve_function(&lib, func)?;
        Ok(())
    }

    /// Unloads `lib`; every descriptor resolved from it reads as invalid.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownLibrary`] if `lib` is not resident.
    pub fn unload_library(&self, lib: &str) -> Result<(), RegistryError> {
        self.cache.unload_library(lib)
    }

    /// Hot-swaps `old_lib` for `new_lib`.
    ///
    /// # Errors
    ///
    /// See [`CacheManager::reload_library`]; a missing file for `new_lib`
    /// yields [`RegistryError::LibraryNotFound`].
    pub fn reload_library(&self, old_lib: &str, new_lib: &str) -> Result<(), RegistryError> {
        self.cache
            .reload_library(old_lib, new_lib, |name| self.locate(name))
    }

    /// `true` if `lib` was retired by a reload.
    pub fn is_out_of_date(&self, lib: &str) -> bool {
        self.cache.is_out_of_date(lib)
    }

    /// The library currently standing in for `lib`.
    pub fn canonical_name(&self, lib: &str) -> String {
        self.cache.get_new_name(lib)
    }

    /// Unloads every resident library.
    ///
    /// # Errors
    ///
    /// Returns the first error raised while closing a library.
    pub fn shutdown(&self) -> Result<(), RegistryError> {
        self.cache.shutdown()
    }

    fn locate(&self, lib: &str) -> Result<PathBuf, RegistryError> {
        self.resolver
            .find_path(lib)
            .ok_or_else(|| RegistryError::LibraryNotFound(lib.to_string()))
    }

    fn open(&self, lib: &str) -> Result<L::Handle, RegistryError> {
        let path = self.locate(lib)?;
        Ok(self.cache.loader().load(&path)?)
    }
}
