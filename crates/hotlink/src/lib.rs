//! # Hotlink
//!
//! Hot-reloadable dynamic linking for native libraries.
//!
//! Libraries are opened lazily the first time one of their functions is
//! resolved. Call sites keep a shared descriptor instead of a raw pointer, so
//! a library can be swapped for a new build at runtime and every call site
//! picks up the replacement on its next call.
//!
//! ## Resolving Functions
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hotlink::Linker;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let linker = Arc::new(Linker::from_environment()?);
//!
//! // SAFETY: `render` is `extern "C" fn(u32) -> u32` in every build.
//! let mut render =
//!     unsafe { linker.function::<unsafe extern "C" fn(u32) -> u32>("renderer", "render") };
//! let frame = unsafe { (*render.get()?)(1) };
//! # let _ = frame;
//! # Ok(())
//! # }
//! ```
//!
//! ## Hot Reload
//!
//! [`Linker::reload_library`] loads the replacement, resolves every function
//! the old library had handed out, and retires the old library. Descriptors
//! of the old library read as invalid from then on; a [`Function`] notices
//! this and re-resolves through the alias from the old name to the new one.
//!
//! With [`ReloadPolicy::Strict`] a replacement that lacks any of those
//! functions is rejected and the old library stays in service.
//!
//! ## Configuration
//!
//! [`Linker::from_environment`] reads `hotlink.toml`; see [`LinkerConfig`]
//! for the keys and the lookup order.

mod function;
mod linker;

#[cfg(test)]
pub(crate) mod testing;

pub use function::{Call, Function};
pub use hotlink_core::{
    Binding, CacheManager, ConfigError, FunctionDescriptor, LinkerConfig, LoadError, Loader,
    NativeLoader, PathResolver, PinnedAddress, RegistryError, ReloadPolicy,
};
pub use linker::Linker;
