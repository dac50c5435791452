//! Typed call sites that survive hot reloads.

use std::{fmt, mem, num::NonZeroUsize, ops::Deref, sync::Arc};

use hotlink_core::{FunctionDescriptor, Loader, NativeLoader, PinnedAddress, RegistryError};
use tracing::debug;

use crate::linker::Linker;

/// Lookups retried when the pinned library starts retiring underneath.
const PIN_ATTEMPTS: usize = 4;

/// A cached, typed handle to one function in one library.
///
/// `F` is the function pointer type, e.g. `unsafe extern "C" fn(i32) -> i32`.
/// The descriptor is resolved on the first [`Function::get`] and cached. When
/// the library is reloaded the cached descriptor goes invalid, and the next
/// `get` follows the alias to the replacement and re-resolves there.
///
/// In checked mode (the default) every call is pinned: the library cannot be
/// unloaded or reloaded until the returned [`Call`] is dropped. Unchecked mode
/// skips the pin and the validity check and is only sound if no reload or
/// unload can overlap the call.
pub struct Function<F, L: Loader = NativeLoader> {
    linker: Arc<Linker<L>>,
    library: String,
    symbol: String,
    descriptor: Option<Arc<FunctionDescriptor>>,
    fallback: Option<F>,
    checked: bool,
}

impl<F: Copy, L: Loader> Function<F, L> {
    /// Binds `symbol` in `library` without resolving it.
    ///
    /// # Safety
    ///
    /// `F` must be a function pointer type whose signature and ABI match
    /// `symbol` in `library` and in every library that may replace it through
    /// a reload. Calling through a mismatched type is undefined behavior.
    pub unsafe fn new(
        linker: Arc<Linker<L>>,
        library: impl Into<String>,
        symbol: impl Into<String>,
    ) -> Self {
        const {
            assert!(
                mem::size_of::<F>() == mem::size_of::<usize>(),
                "F must be a function pointer type"
            );
        }

        Self {
            linker,
            library: library.into(),
            symbol: symbol.into(),
            descriptor: None,
            fallback: None,
            checked: true,
        }
    }

    /// Calls `fallback` instead of failing when the symbol is unavailable.
    #[must_use]
    pub fn with_fallback(mut self, fallback: F) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn set_fallback(&mut self, fallback: Option<F>) {
        self.fallback = fallback;
    }

    pub fn set_checked(&mut self, checked: bool) {
        self.checked = checked;
    }

    pub fn is_checked(&self) -> bool {
        self.checked
    }

    /// The library this call site currently resolves against.
    ///
    /// Updated to the replacement's name once a reload has been followed.
    pub fn library(&self) -> &str {
        &self.library
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Returns the function ready to call.
    ///
    /// In checked mode the returned [`Call`] pins the library until dropped.
    /// A library that starts retiring between the lookup and the pin is
    /// looked up again, so the call lands in its replacement.
    ///
    /// # Errors
    ///
    /// Returns the resolution error if the function cannot be resolved and no
    /// fallback is set.
    pub fn get(&mut self) -> Result<Call<F>, RegistryError> {
        if !self.checked {
            return self.get_unchecked();
        }

        for _ in 0..PIN_ATTEMPTS {
            if let Err(err) = self.refresh() {
                return self.fallback_or(err);
            }
            if let Some(pinned) = self.descriptor.as_ref().and_then(FunctionDescriptor::pin) {
                // SAFETY: `F` was vouched for in `Function::new`.
                let function = unsafe { to_function::<F>(pinned.get()) };
                return Ok(Call {
                    function,
                    fallback: false,
                    pin: Some(pinned),
                });
            }
            debug!(
                library = %self.library,
                symbol = %self.symbol,
                "Library retiring, looking the function up again"
            );
            self.descriptor = None;
        }
        self.fallback_or(self.stale())
    }

    fn get_unchecked(&mut self) -> Result<Call<F>, RegistryError> {
        if let Err(err) = self.refresh() {
            return self.fallback_or(err);
        }
        match self
            .descriptor
            .as_deref()
            .and_then(|descriptor| NonZeroUsize::new(descriptor.raw()))
        {
            Some(address) => Ok(Call {
                // SAFETY: `F` was vouched for in `Function::new`.
                function: unsafe { to_function::<F>(address) },
                fallback: false,
                pin: None,
            }),
            None => self.fallback_or(self.stale()),
        }
    }

    /// The resolved function without a pin, or `None` if it cannot be
    /// resolved.
    ///
    /// The pointer dangles once the library is unloaded.
    pub fn raw_pointer(&mut self) -> Option<F> {
        self.refresh().ok()?;
        let address = NonZeroUsize::new(self.descriptor.as_ref()?.raw())?;
        // SAFETY: `F` was vouched for in `Function::new`.
        Some(unsafe { to_function::<F>(address) })
    }

    fn refresh(&mut self) -> Result<(), RegistryError> {
        let current = self.descriptor.as_ref().is_some_and(|descriptor| {
            if self.checked {
                descriptor.is_valid()
            } else {
                descriptor.raw() != 0
            }
        });
        if current {
            return Ok(());
        }

        if self.linker.is_out_of_date(&self.library) {
            let replacement = self.linker.canonical_name(&self.library);
            debug!(
                from = %self.library,
                to = %replacement,
                symbol = %self.symbol,
                "Following reloaded library"
            );
            self.library = replacement;
        }
        self.descriptor = Some(self.linker.resolve(&self.library, &self.symbol)?);
        Ok(())
    }

    fn fallback_or(&self, err: RegistryError) -> Result<Call<F>, RegistryError> {
        match self.fallback {
            Some(function) => {
                debug!(
                    library = %self.library,
                    symbol = %self.symbol,
                    error = %err,
                    "Using fallback"
                );
                Ok(Call {
                    function,
                    fallback: true,
                    pin: None,
                })
            }
            None => Err(err),
        }
    }

    fn stale(&self) -> RegistryError {
        RegistryError::StaleDescriptor {
            library: self.library.clone(),
            symbol: self.symbol.clone(),
        }
    }
}

impl<F, L: Loader> fmt::Debug for Function<F, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("library", &self.library)
            .field("symbol", &self.symbol)
            .field("resolved", &self.descriptor.as_deref().map(FunctionDescriptor::raw))
            .field("has_fallback", &self.fallback.is_some())
            .field("checked", &self.checked)
            .finish_non_exhaustive()
    }
}

/// A callable function, pinned for as long as it lives in checked mode.
#[must_use]
pub struct Call<F> {
    function: F,
    fallback: bool,
    pin: Option<PinnedAddress>,
}

impl<F> Call<F> {
    /// `true` if this is the fallback rather than the library's function.
    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    /// `true` if the library stays loaded until this call is dropped.
    pub fn is_pinned(&self) -> bool {
        self.pin.is_some()
    }
}

impl<F> Deref for Call<F> {
    type Target = F;

    fn deref(&self) -> &F {
        &self.function
    }
}

impl<F> fmt::Debug for Call<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("fallback", &self.fallback)
            .field("pinned", &self.is_pinned())
            .finish_non_exhaustive()
    }
}

/// # Safety
///
/// `F` must be a function pointer type valid for `address`.
unsafe fn to_function<F: Copy>(address: NonZeroUsize) -> F {
    // SAFETY: `F` is pointer sized (checked in `Function::new`) and the caller
    // guarantees it is a function pointer type for this address.
    unsafe { mem::transmute_copy::<usize, F>(&address.get()) }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            mpsc,
        },
        thread,
        time::Duration,
    };

    use hotlink_core::ReloadPolicy;

    use super::*;
    use crate::testing::{Fixture, IntFn, TableLoader, square_fallback, square_v1, square_v2};

    fn bind(linker: &Arc<Linker<TableLoader>>, symbol: &str) -> Function<IntFn, TableLoader> {
        // SAFETY: every symbol served by the fixture is `extern "C" fn(i32) -> i32`.
        unsafe { linker.function("mathlib", symbol) }
    }

    fn square(fixture: &Fixture) -> Function<IntFn, TableLoader> {
        bind(&fixture.linker, "square")
    }

    #[test]
    fn test_get_calls_through_to_library() {
        // Arrange
        let fixture = Fixture::new(ReloadPolicy::Lenient);
        let mut square = square(&fixture);

        // Act
        let call = square.get().unwrap();
        let result = unsafe { (*call)(4) };

        // Assert
        assert_eq!(result, 16);
        assert!(!call.is_fallback());
    }

    #[test]
    fn test_get_follows_reload() {
        // Arrange
        let fixture = Fixture::new(ReloadPolicy::Lenient);
        let mut square = square(&fixture);
        assert_eq!(unsafe { (*square.get().unwrap())(4) }, 16);

        // Act
        fixture
            .linker
            .reload_library("mathlib", "mathlib_v2")
            .unwrap();
        let result = unsafe { (*square.get().unwrap())(4) };

        // Assert
        assert_eq!(result, 17);
        assert_eq!(square.library(), "mathlib_v2");
    }

    #[test]
    fn test_get_follows_chained_reloads() {
        // Arrange
        let fixture = Fixture::new(ReloadPolicy::Lenient);
        let mut square = square(&fixture);
        square.get().unwrap();

        // Act
        fixture
            .linker
            .reload_library("mathlib", "mathlib_v2")
            .unwrap();
        fixture
            .linker
            .reload_library("mathlib_v2", "mathlib")
            .unwrap();
        let result = unsafe { (*square.get().unwrap())(4) };

        // Assert
        assert_eq!(result, 16);
        assert_eq!(square.library(), "mathlib");
    }

    #[test]
    fn test_missing_symbol_uses_fallback() {
        // Arrange
        let fixture = Fixture::new(ReloadPolicy::Lenient);
        // SAFETY: the fallback matches the declared signature.
        let mut sqrt: Function<IntFn, _> =
            unsafe { fixture.linker.function("mathlib", "sqrt") };
        sqrt.set_fallback(Some(square_fallback as IntFn));

        // Act
        let call = sqrt.get().unwrap();

        // Assert
        assert!(call.is_fallback());
        assert_eq!(unsafe { (*call)(9) }, -1);
    }

    #[test]
    fn test_missing_symbol_without_fallback_is_an_error() {
        let fixture = Fixture::new(ReloadPolicy::Lenient);
        let mut sqrt: Function<IntFn, _> =
            unsafe { fixture.linker.function("mathlib", "sqrt") };

        let err = sqrt.get().unwrap_err();

        assert!(matches!(err, RegistryError::SymbolNotFound { .. }));
    }

    #[test]
    fn test_fallback_is_ignored_while_library_function_resolves() {
        let fixture = Fixture::new(ReloadPolicy::Lenient);
        let mut square = square(&fixture).with_fallback(square_fallback as IntFn);

        let call = square.get().unwrap();

        assert!(!call.is_fallback());
        assert_eq!(unsafe { (*call)(3) }, 9);
    }

    #[test]
    fn test_unchecked_mode_calls_without_pin() {
        let fixture = Fixture::new(ReloadPolicy::Lenient);
        let mut square = square(&fixture);
        square.set_checked(false);

        let call = square.get().unwrap();

        assert!(!call.is_pinned());
        assert_eq!(unsafe { (*call)(5) }, 25);
    }

    #[test]
    fn test_raw_pointer_returns_resolved_function() {
        let fixture = Fixture::new(ReloadPolicy::Lenient);
        let mut square = square(&fixture);

        let pointer = square.raw_pointer().unwrap();

        assert_eq!(pointer as usize, square_v1 as usize);
        assert_eq!(unsafe { pointer(6) }, 36);
    }

    #[test]
    fn test_raw_pointer_is_none_for_missing_library() {
        let fixture = Fixture::new(ReloadPolicy::Lenient);
        let mut missing: Function<IntFn, _> =
            unsafe { fixture.linker.function("nolib", "square") };

        assert!(missing.raw_pointer().is_none());
    }

    #[test]
    fn test_get_after_unload_loads_library_again() {
        let fixture = Fixture::new(ReloadPolicy::Lenient);
        let mut square = square(&fixture);
        square.get().unwrap();

        fixture.linker.unload_library("mathlib").unwrap();
        let result = unsafe { (*square.get().unwrap())(2) };

        assert_eq!(result, 4);
        assert_eq!(fixture.linker.cache().loader().loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_pinned_call_blocks_unload_until_dropped() {
        // Arrange
        let fixture = Fixture::new(ReloadPolicy::Lenient);
        let mut square = square(&fixture);
        let unloaded = AtomicBool::new(false);

        thread::scope(|scope| {
            let call = square.get().unwrap();
            assert!(call.is_pinned());

            // Act
            let unloader = scope.spawn(|| {
                fixture.linker.unload_library("mathlib").unwrap();
                unloaded.store(true, Ordering::SeqCst);
            });
            thread::sleep(Duration::from_millis(50));

            // Assert
            assert!(!unloaded.load(Ordering::SeqCst));
            assert_eq!(unsafe { (*call)(7) }, 49);
            drop(call);
            unloader.join().unwrap();
            assert!(unloaded.load(Ordering::SeqCst));
        });
    }

    #[test]
    fn test_pinned_call_can_resolve_while_its_library_unloads() {
        // Arrange
        let fixture = Fixture::new(ReloadPolicy::Lenient);
        let linker = Arc::clone(&fixture.linker);
        let (pinned_tx, pinned_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let caller = {
            let linker = Arc::clone(&linker);
            thread::spawn(move || {
                let mut square = bind(&linker, "square");
                let mut cube = bind(&linker, "cube");
                let mut again = bind(&linker, "square");

                let outer = square.get().unwrap();
                pinned_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(100));

                let nested_cube = unsafe { (*cube.get().unwrap())(3) };
                let nested_square = unsafe { (*again.get().unwrap())(5) };
                let result = unsafe { (*outer)(4) };
                drop(outer);
                done_tx.send((result, nested_cube, nested_square)).unwrap();
            })
        };
        pinned_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Act
        let unloader = {
            let linker = Arc::clone(&linker);
            thread::spawn(move || linker.unload_library("mathlib"))
        };
        let (lookup_tx, lookup_rx) = mpsc::channel();
        {
            let linker = Arc::clone(&linker);
            thread::spawn(move || {
                let found = linker.resolve("mathlib_v2", "square").map(|d| d.raw());
                lookup_tx.send(found).unwrap();
            });
        }

        // Assert
        let unrelated = lookup_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("lookup of another library waited on a pinned call");
        assert_eq!(unrelated.unwrap(), square_v2 as usize);
        let (result, nested_cube, nested_square) = done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("nested call waited on its own pin");
        assert_eq!((result, nested_cube, nested_square), (16, 27, 25));
        caller.join().unwrap();
        unloader.join().unwrap().unwrap();
        assert!(
            fixture
                .linker
                .cache()
                .loader()
                .closed()
                .contains(&"libmathlib.so".to_string())
        );
    }

    #[test]
    fn test_callers_see_old_or_new_build_across_reloads() {
        // Arrange
        let fixture = Fixture::new(ReloadPolicy::Lenient);
        let linker = Arc::clone(&fixture.linker);
        let (done_tx, done_rx) = mpsc::channel();

        // Act
        thread::spawn(move || {
            thread::scope(|scope| {
                for _ in 0..4 {
                    scope.spawn(|| {
                        let mut square = bind(&linker, "square");
                        for _ in 0..500 {
                            let call = square.get().unwrap();
                            let result = unsafe { (*call)(4) };
                            assert!(result == 16 || result == 17, "unexpected result {result}");
                        }
                    });
                }
                scope.spawn(|| {
                    for round in 0..20 {
                        let (old, new) = if round % 2 == 0 {
                            ("mathlib", "mathlib_v2")
                        } else {
                            ("mathlib_v2", "mathlib")
                        };
                        linker.reload_library(old, new).unwrap();
                        thread::sleep(Duration::from_millis(1));
                    }
                });
            });
            done_tx.send(()).unwrap();
        });

        // Assert
        done_rx
            .recv_timeout(Duration::from_secs(20))
            .expect("callers and reloader did not finish");
        assert_eq!(fixture.linker.canonical_name("mathlib_v2"), "mathlib");
    }

    #[test]
    fn test_debug_output_names_the_binding() {
        let fixture = Fixture::new(ReloadPolicy::Lenient);
        let square = square(&fixture);

        let debug = format!("{square:?}");

        assert!(debug.contains("mathlib"));
        assert!(debug.contains("square"));
    }
}
