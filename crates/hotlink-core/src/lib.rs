//! Core types for hot-reloadable dynamic linking.
//!
//! This crate keeps track of dynamically loaded native libraries and the
//! function addresses resolved from them, and lets a running process swap a
//! library for a new version without invalidating the call sites that cache
//! its functions.
//!
//! # Key Components
//!
//! - **Loading**: the [`Loader`] capability, with [`NativeLoader`] on top of
//!   the platform's dynamic loader
//! - **Descriptors**: [`FunctionDescriptor`], the shared cell every call site
//!   reads its function address from
//! - **Registry**: [`CacheManager`], owner of all handles, descriptors and the
//!   alias table used by hot reload
//! - **Paths**: [`PathResolver`], mapping logical names to library files
//! - **Configuration**: [`LinkerConfig`], read from `hotlink.toml`
//!
//! # Thread Safety
//!
//! Every type here is `Send + Sync`. The registry serializes structural
//! changes behind one reader/writer lock while descriptors track their own
//! pinned calls, so calling a cached function never contends with lookups,
//! and retiring a library never holds the registry lock while it waits.

mod cache;
mod config;
mod descriptor;
mod error;
mod loader;
mod path;

#[cfg(test)]
pub(crate) mod testing;

/// Library registry and hot-reload protocol.
pub use cache::{CacheManager, ReloadPolicy};

/// Configuration discovery and parsing.
pub use config::{ConfigError, LinkerConfig};

/// Resolved function addresses.
pub use descriptor::{FunctionDescriptor, PinnedAddress};

/// Registry-level failures.
pub use error::RegistryError;

/// Platform loader capability.
pub use loader::{Binding, LoadError, Loader, NativeLoader};

/// Library file lookup.
pub use path::PathResolver;
