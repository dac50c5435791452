//! Registry of loaded libraries and resolved function descriptors.
//!
//! # Architecture
//!
//! [`CacheManager`] owns every library handle for as long as the library is
//! resident, together with the [`FunctionDescriptor`]s resolved from it and
//! an alias table recording which library replaced a retired one.
//!
//! # Thread Safety
//!
//! One reader/writer lock covers both the library map and the alias table:
//! lookups take it shared, anything that changes the shape of the registry
//! takes it exclusively. Descriptors track their own pinned calls, so the hot
//! path (read an address, call through it) never touches the registry lock.
//!
//! Unload, reload and shutdown remove entries under the lock and retire them
//! after releasing it. Waiting for pinned calls into a retiring library
//! therefore never holds up lookups, including lookups made from inside
//! those calls.
//!
//! A poisoned registry lock is recovered by lookups and reported as
//! [`RegistryError::LockPoisoned`] by mutations.
//!
//! # Hot Reload
//!
//! [`CacheManager::reload_library`] opens the replacement, re-resolves every
//! symbol already resolved under the old name, unloads the old library and
//! records `old -> new` in the alias table. Descriptors handed out under the
//! old name read as invalid afterwards; callers re-resolve under
//! [`CacheManager::get_new_name`].

use std::{
    collections::HashMap,
    fmt,
    num::NonZeroUsize,
    path::PathBuf,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{
    descriptor::FunctionDescriptor,
    error::RegistryError,
    loader::Loader,
};

/// What a reload does with symbols the replacement library lacks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReloadPolicy {
    /// Drop the missing symbols; their old descriptors read as invalid.
    #[default]
    Lenient,
    /// Fail the reload and leave the registry untouched.
    Strict,
}

struct LibraryCache<H> {
    /// `None` when functions were registered before any handle.
    handle: Option<Arc<H>>,
    functions: HashMap<String, Arc<FunctionDescriptor>>,
}

impl<H> LibraryCache<H> {
    fn new(handle: Option<Arc<H>>) -> Self {
        Self {
            handle,
            functions: HashMap::new(),
        }
    }
}

struct State<H> {
    libraries: HashMap<String, LibraryCache<H>>,
    /// Retired library name -> the name that replaced it.
    aliases: HashMap<String, String>,
}

impl<H> Default for State<H> {
    fn default() -> Self {
        Self {
            libraries: HashMap::new(),
            aliases: HashMap::new(),
        }
    }
}

/// Thread-safe registry of loaded libraries and their resolved functions.
///
/// Dropping the manager unloads every library still resident.
pub struct CacheManager<L: Loader> {
    loader: L,
    policy: ReloadPolicy,
    state: RwLock<State<L::Handle>>,
}

impl<L: Loader> fmt::Debug for CacheManager<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("policy", &self.policy)
            .field("libraries", &self.libraries())
            .finish_non_exhaustive()
    }
}

impl<L: Loader> CacheManager<L> {
    /// Creates an empty registry with the lenient reload policy.
    pub fn new(loader: L) -> Self {
        Self::with_policy(loader, ReloadPolicy::default())
    }

    pub fn with_policy(loader: L, policy: ReloadPolicy) -> Self {
        Self {
            loader,
            policy,
            state: RwLock::new(State::default()),
        }
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    pub fn reload_policy(&self) -> ReloadPolicy {
        self.policy
    }

    // Every mutation leaves the maps consistent before calling out to the
    // loader, so a panic there cannot leave a half-built entry behind.
    fn read(&self) -> RwLockReadGuard<'_, State<L::Handle>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State<L::Handle>>, RegistryError> {
        self.state.write().map_err(|_| RegistryError::LockPoisoned)
    }

    /// Stores `handle` under `name` unless the library already has one.
    ///
    /// The first handle registered for a name wins. A later handle for the
    /// same name is closed and `Ok(false)` is returned.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::LockPoisoned`] if the registry lock is
    /// poisoned, or [`RegistryError::Load`] if closing a duplicate handle
    /// fails.
    #[instrument(skip(self, handle))]
    pub fn register_library(&self, name: &str, handle: L::Handle) -> Result<bool, RegistryError> {
        let mut state = self.write()?;
        let entry = state
            .libraries
            .entry(name.to_string())
            .or_insert_with(|| LibraryCache::new(None));

        if entry.handle.is_some() {
            drop(state);
            debug!("Library already registered, closing duplicate handle");
            self.loader.unload(handle)?;
            return Ok(false);
        }

        entry.handle = Some(Arc::new(handle));
        info!("Library registered");
        Ok(true)
    }

    /// Writes `address` into the descriptor for `(lib, func)`.
    ///
    /// An existing descriptor is updated in place, so everyone already
    /// holding it observes the new address. The library entry is created if
    /// it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::LockPoisoned`] if the registry lock is
    /// poisoned.
    #[instrument(skip(self, address), fields(address = address.get()))]
    pub fn register_function(
        &self,
        lib: &str,
        func: &str,
        address: NonZeroUsize,
    ) -> Result<Arc<FunctionDescriptor>, RegistryError> {
        let mut state = self.write()?;
        let entry = state
            .libraries
            .entry(lib.to_string())
            .or_insert_with(|| LibraryCache::new(None));

        let descriptor = if let Some(descriptor) = entry.functions.get(func) {
            descriptor.store(address);
            Arc::clone(descriptor)
        } else {
            let descriptor = Arc::new(FunctionDescriptor::new(address));
            entry
                .functions
                .insert(func.to_string(), Arc::clone(&descriptor));
            descriptor
        };

        debug!("Function registered");
        Ok(descriptor)
    }

    pub fn contains_library(&self, name: &str) -> bool {
        self.read().libraries.contains_key(name)
    }

    pub fn contains_function(&self, lib: &str, func: &str) -> bool {
        self.read()
            .libraries
            .get(lib)
            .is_some_and(|entry| entry.functions.contains_key(func))
    }

    /// Returns the live descriptor for `(lib, func)`.
    ///
    /// Never fails: an unknown pair yields a fresh, detached descriptor that
    /// reads as invalid. Validity is for the caller to check.
    pub fn function_descriptor(&self, lib: &str, func: &str) -> Arc<FunctionDescriptor> {
        self.read()
            .libraries
            .get(lib)
            .and_then(|entry| entry.functions.get(func).cloned())
            .unwrap_or_default()
    }

    /// Returns the handle stored for `name`, or `None` if there is none.
    pub fn library_handle(&self, name: &str) -> Option<Arc<L::Handle>> {
        self.read().libraries.get(name)?.handle.clone()
    }

    /// Looks `symbol` up in the stored handle of `lib` without registering
    /// it.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::LibraryNotLoaded`] if `lib` has no handle, or
    /// [`RegistryError::SymbolNotFound`] if the loader cannot resolve the
    /// symbol.
    pub fn resolve_symbol(&self, lib: &str, symbol: &str) -> Result<NonZeroUsize, RegistryError> {
        let handle = self
            .library_handle(lib)
            .ok_or_else(|| RegistryError::LibraryNotLoaded(lib.to_string()))?;

        self.loader
            .resolve(&handle, symbol)
            .map_err(|source| RegistryError::SymbolNotFound {
                library: lib.to_string(),
                symbol: symbol.to_string(),
                source,
            })
    }

    /// Returns the descriptor for `(lib, func)`, resolving and registering it
    /// first if needed.
    ///
    /// Lookup and registration happen under one hold of the registry lock,
    /// so a concurrent unload cannot slip in between them.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::LibraryNotLoaded`] if `lib` has no handle,
    /// [`RegistryError::SymbolNotFound`] if the loader cannot resolve the
    /// symbol, or [`RegistryError::LockPoisoned`].
    #[instrument(skip(self))]
    pub fn resolve_function(
        &self,
        lib: &str,
        func: &str,
    ) -> Result<Arc<FunctionDescriptor>, RegistryError> {
        let mut state = self.write()?;
        let entry = state
            .libraries
            .get_mut(lib)
            .ok_or_else(|| RegistryError::LibraryNotLoaded(lib.to_string()))?;
        self.resolve_in(lib, entry, func)
    }

    /// Like [`resolve_function`](Self::resolve_function), but registers
    /// `handle` for `lib` first when the library has none.
    ///
    /// A handle that loses the race against another registration is closed.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::SymbolNotFound`] if the loader cannot resolve
    /// the symbol, or [`RegistryError::LockPoisoned`].
    #[instrument(skip(self, handle))]
    pub fn resolve_function_with(
        &self,
        lib: &str,
        func: &str,
        handle: L::Handle,
    ) -> Result<Arc<FunctionDescriptor>, RegistryError> {
        let mut state = self.write()?;
        let entry = state
            .libraries
            .entry(lib.to_string())
            .or_insert_with(|| LibraryCache::new(None));
        let duplicate = if entry.handle.is_some() {
            Some(handle)
        } else {
            entry.handle = Some(Arc::new(handle));
            info!("Library registered");
            None
        };
        let resolved = self.resolve_in(lib, entry, func);
        drop(state);

        if let Some(duplicate) = duplicate {
            debug!("Library already registered, closing duplicate handle");
            if let Err(err) = self.loader.unload(duplicate) {
                warn!(error = %err, "Failed to close duplicate library handle");
            }
        }
        resolved
    }

    fn resolve_in(
        &self,
        lib: &str,
        entry: &mut LibraryCache<L::Handle>,
        func: &str,
    ) -> Result<Arc<FunctionDescriptor>, RegistryError> {
        if let Some(descriptor) = entry.functions.get(func) {
            return Ok(Arc::clone(descriptor));
        }
        let handle = entry
            .handle
            .as_ref()
            .ok_or_else(|| RegistryError::LibraryNotLoaded(lib.to_string()))?;
        let address =
            self.loader
                .resolve(handle, func)
                .map_err(|source| RegistryError::SymbolNotFound {
                    library: lib.to_string(),
                    symbol: func.to_string(),
                    source,
                })?;

        let descriptor = Arc::new(FunctionDescriptor::new(address));
        entry
            .functions
            .insert(func.to_string(), Arc::clone(&descriptor));
        debug!(address = address.get(), "Function resolved");
        Ok(descriptor)
    }

    /// Invalidates every descriptor of `name`, closes its handle and forgets
    /// the library together with any alias keyed by it.
    ///
    /// The library is forgotten at once; invalidation then waits for calls
    /// still pinned into it, without holding the registry lock.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownLibrary`] if `name` is not resident,
    /// or [`RegistryError::Load`] if the loader fails to close the handle.
    /// The library is forgotten even when closing fails.
    #[instrument(skip(self))]
    pub fn unload_library(&self, name: &str) -> Result<(), RegistryError> {
        let entry = {
            let mut state = self.write()?;
            let entry = state
                .libraries
                .remove(name)
                .ok_or_else(|| RegistryError::UnknownLibrary(name.to_string()))?;
            state.aliases.remove(name);
            entry
        };

        self.retire(name, entry)
    }

    /// Replaces library `old` with library `new`.
    ///
    /// `locate` maps `new` to a file and is only consulted when `new` is not
    /// resident already. Every symbol resolved under `old` is resolved again
    /// in `new`; what happens to symbols `new` lacks depends on the
    /// [`ReloadPolicy`]. Afterwards `old` is unloaded and aliased to `new`.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::ReloadIntoSelf`] if `old == new`
    /// - [`RegistryError::UnknownLibrary`] if `old` is not resident
    /// - whatever `locate` returns, or [`RegistryError::Load`] if `new`
    ///   cannot be opened
    /// - [`RegistryError::ReloadIncomplete`] under [`ReloadPolicy::Strict`]
    ///   when symbols are missing; nothing is changed in that case
    #[instrument(skip(self, locate))]
    pub fn reload_library(
        &self,
        old: &str,
        new: &str,
        locate: impl FnOnce(&str) -> Result<PathBuf, RegistryError>,
    ) -> Result<(), RegistryError> {
        if old == new {
            return Err(RegistryError::ReloadIntoSelf(old.to_string()));
        }

        let mut state = self.write()?;
        let names: Vec<String> = state
            .libraries
            .get(old)
            .ok_or_else(|| RegistryError::UnknownLibrary(old.to_string()))?
            .functions
            .keys()
            .cloned()
            .collect();

        let resident = state
            .libraries
            .get(new)
            .and_then(|entry| entry.handle.clone());
        let (handle, fresh) = match resident {
            Some(handle) => (handle, false),
            None => {
                let path = locate(new)?;
                (Arc::new(self.loader.load(&path)?), true)
            }
        };

        let mut resolved = Vec::with_capacity(names.len());
        let mut missing = Vec::new();
        for name in names {
            match self.loader.resolve(&handle, &name) {
                Ok(address) => resolved.push((name, address)),
                Err(err) => {
                    warn!(symbol = %name, error = %err, "Symbol missing from replacement library");
                    missing.push(name);
                }
            }
        }

        if self.policy == ReloadPolicy::Strict && !missing.is_empty() {
            drop(state);
            if fresh
                && let Ok(handle) = Arc::try_unwrap(handle)
                && let Err(err) = self.loader.unload(handle)
            {
                warn!(library = %new, error = %err, "Failed to close rejected replacement library");
            }
            missing.sort();
            return Err(RegistryError::ReloadIncomplete {
                old: old.to_string(),
                new: new.to_string(),
                missing,
            });
        }

        let entry = state
            .libraries
            .entry(new.to_string())
            .or_insert_with(|| LibraryCache::new(None));
        if entry.handle.is_none() {
            entry.handle = Some(handle);
        }
        for (name, address) in resolved {
            if let Some(descriptor) = entry.functions.get(&name) {
                descriptor.store(address);
            } else {
                entry
                    .functions
                    .insert(name, Arc::new(FunctionDescriptor::new(address)));
            }
        }

        state.aliases.remove(new);
        state.aliases.insert(old.to_string(), new.to_string());
        info!(dropped = missing.len(), "Library reloaded");

        let retired = state
            .libraries
            .remove(old)
            .ok_or_else(|| RegistryError::UnknownLibrary(old.to_string()))?;
        drop(state);

        self.retire(old, retired)
    }

    /// `true` iff `name` was retired by a reload.
    pub fn is_out_of_date(&self, name: &str) -> bool {
        self.read().aliases.contains_key(name)
    }

    /// Follows the alias table from `name` to the library currently
    /// standing in for it.
    ///
    /// Aliases are chased to a fixed point, so a library reloaded several
    /// times still maps to its latest replacement. Returns `name` unchanged
    /// if it is not aliased.
    pub fn get_new_name(&self, name: &str) -> String {
        canonical_name(&self.read().aliases, name).to_string()
    }

    /// Names of all resident libraries, sorted.
    pub fn libraries(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().libraries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of the functions resolved for `lib`, sorted.
    pub fn functions(&self, lib: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .read()
            .libraries
            .get(lib)
            .map(|entry| entry.functions.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Unloads every resident library and clears the alias table.
    ///
    /// # Errors
    ///
    /// Returns the first error raised while closing a handle; the remaining
    /// libraries are still unloaded.
    #[instrument(skip(self))]
    pub fn shutdown(&self) -> Result<(), RegistryError> {
        let libraries: Vec<_> = {
            let mut state = self.write()?;
            state.aliases.clear();
            state.libraries.drain().collect()
        };

        let mut first_error = None;
        for (name, entry) in libraries {
            if let Err(err) = self.retire(&name, entry) {
                warn!(library = %name, error = %err, "Failed to unload library");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Invalidates the descriptors of a removed entry and closes its handle.
    ///
    /// Called without the registry lock, since invalidation waits for pinned
    /// calls.
    fn retire(&self, name: &str, entry: LibraryCache<L::Handle>) -> Result<(), RegistryError> {
        for descriptor in entry.functions.values() {
            descriptor.invalidate();
        }

        let Some(handle) = entry.handle else {
            return Ok(());
        };
        match Arc::try_unwrap(handle) {
            Ok(handle) => {
                self.loader.unload(handle)?;
                info!(library = %name, "Library unloaded");
            }
            Err(_shared) => {
                warn!(
                    library = %name,
                    "Library handle still borrowed, closing it with its last reference"
                );
            }
        }
        Ok(())
    }
}

impl<L: Loader> Drop for CacheManager<L> {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "Failed to unload every library on drop");
        }
    }
}

fn canonical_name<'a>(aliases: &'a HashMap<String, String>, name: &'a str) -> &'a str {
    let mut current = name;
    // Bounded by the table size so a cycle cannot spin forever.
    for _ in 0..aliases.len() {
        match aliases.get(current) {
            Some(next) => current = next,
            None => break,
        }
    }
    current
}
