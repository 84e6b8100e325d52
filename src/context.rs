//! Per-thread tile capability context
//!
//! Tile registers are a thread-private resource. A [`TileContext`] is the
//! owned handle that says "this thread may use the tile unit": it requests the
//! OS capability, installs a tile configuration and releases the tile state
//! when it goes out of scope, whichever way the scope is left.
//!
//! ```text
//! Uninitialized --request_capability--> CapabilityGranted --configure--> Active
//!                                                                          |  ^
//!                                                            configure ----+--+
//!                                                                          |
//!                                              release / drop -------> Released
//! ```
//!
//! # Example
//!
//! ```
//! use tilemm::{ContextState, TileContext, TileGeometry, TilePalette};
//! use tilemm::backends::reference::ReferenceTiles;
//!
//! let mut ctx = TileContext::acquire(ReferenceTiles::new()).unwrap();
//! assert_eq!(ctx.state(), ContextState::CapabilityGranted);
//!
//! ctx.configure(&TilePalette::uniform(TileGeometry::new(16, 64))).unwrap();
//! assert_eq!(ctx.state(), ContextState::Active);
//!
//! ctx.release();
//! assert_eq!(ctx.state(), ContextState::Released);
//! ```

use std::cell::Cell;
use std::marker::PhantomData;

use crate::backends::TileOps;
use crate::{Backend, Result, TileError, TileLimits, TilePalette};

thread_local! {
    static LIVE_CONTEXT: Cell<bool> = const { Cell::new(false) };
}

/// Lifecycle state of a [`TileContext`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Capability not yet requested
    Uninitialized,
    /// OS permission granted, no tile configuration installed
    CapabilityGranted,
    /// Tiles configured; loads, accumulates and stores are allowed
    Active,
    /// Tile state released (terminal)
    Released,
}

/// Owned handle to the calling thread's tile unit
///
/// At most one context holding the capability may be live per thread; the
/// handle is `!Send` so it never leaves the thread that acquired it.
pub struct TileContext<B: TileOps> {
    ops: B,
    state: ContextState,
    palette: Option<TilePalette>,
    limits: TileLimits,
    registered: bool,
    _thread_bound: PhantomData<*const ()>,
}

impl<B: TileOps> TileContext<B> {
    /// Wraps `ops` without touching the OS or the hardware
    pub fn new(ops: B) -> Self {
        Self::with_limits(ops, TileLimits::default())
    }

    /// Like [`TileContext::new`] with a custom tile storage budget
    pub fn with_limits(ops: B, limits: TileLimits) -> Self {
        TileContext {
            ops,
            state: ContextState::Uninitialized,
            palette: None,
            limits,
            registered: false,
            _thread_bound: PhantomData,
        }
    }

    /// Creates a context and requests the tile capability in one step
    ///
    /// # Errors
    ///
    /// `CapabilityDenied` if the OS refuses; `ContractViolation` if another
    /// context is already live on this thread.
    pub fn acquire(ops: B) -> Result<Self> {
        let mut ctx = Self::new(ops);
        ctx.request_capability()?;
        Ok(ctx)
    }

    /// Asks the OS for permission to use tile data on this thread
    ///
    /// A denial is final for this context: it stays `Uninitialized` and every
    /// later tile operation fails.
    pub fn request_capability(&mut self) -> Result<()> {
        if self.state != ContextState::Uninitialized {
            return Err(TileError::ContractViolation(format!(
                "capability requested in state {:?}",
                self.state
            )));
        }
        if LIVE_CONTEXT.with(Cell::get) {
            return Err(TileError::ContractViolation(
                "a tile context is already live on this thread".to_string(),
            ));
        }
        self.ops.request_permission()?;
        LIVE_CONTEXT.with(|live| live.set(true));
        self.registered = true;
        self.state = ContextState::CapabilityGranted;
        #[cfg(feature = "tracing")]
        tracing::debug!(backend = ?self.ops.backend(), "tile capability granted");
        Ok(())
    }

    /// Installs `palette` as the thread's tile configuration
    ///
    /// Re-configuring an active context is allowed, but every accumulator is
    /// cleared: nothing loaded under the previous palette survives.
    ///
    /// # Errors
    ///
    /// `ResourceLimit` if the palette exceeds the tile budget (the state is
    /// left unchanged); `ContractViolation` if the capability was not granted
    /// or the context was released.
    pub fn configure(&mut self, palette: &TilePalette) -> Result<()> {
        match self.state {
            ContextState::CapabilityGranted | ContextState::Active => {}
            state => {
                return Err(TileError::ContractViolation(format!(
                    "configure in state {state:?}"
                )))
            }
        }
        palette.validate(&self.limits)?;
        self.ops.configure(palette)?;
        self.palette = Some(*palette);
        self.state = ContextState::Active;
        #[cfg(feature = "tracing")]
        tracing::debug!(
            slots = palette.configured().count(),
            bytes = palette.total_footprint(),
            "tile palette configured"
        );
        Ok(())
    }

    /// Releases the tile state; the context cannot be used afterwards
    ///
    /// Calling this more than once is harmless. Dropping the context calls it.
    pub fn release(&mut self) {
        match self.state {
            ContextState::CapabilityGranted | ContextState::Active => {
                self.ops.release();
                #[cfg(feature = "tracing")]
                tracing::debug!(backend = ?self.ops.backend(), "tile state released");
            }
            ContextState::Uninitialized | ContextState::Released => {}
        }
        if self.registered {
            LIVE_CONTEXT.with(|live| live.set(false));
            self.registered = false;
        }
        self.palette = None;
        self.state = ContextState::Released;
    }

    /// Current lifecycle state
    pub fn state(&self) -> ContextState {
        self.state
    }

    /// The active palette, if the context is configured
    pub fn palette(&self) -> Option<&TilePalette> {
        self.palette.as_ref()
    }

    /// The tile storage budget palettes are checked against
    pub fn limits(&self) -> &TileLimits {
        &self.limits
    }

    /// Backend behind this context
    pub fn backend(&self) -> Backend {
        self.ops.backend()
    }

    /// Read-only access to the backend (for inspection in tests and tools)
    pub fn ops(&self) -> &B {
        &self.ops
    }

    /// The backend, available only while the context is `Active`
    pub(crate) fn active_ops(&mut self) -> Result<&mut B> {
        if self.state != ContextState::Active {
            return Err(TileError::ContractViolation(format!(
                "tile operation in state {:?}",
                self.state
            )));
        }
        Ok(&mut self.ops)
    }
}

impl<B: TileOps> Drop for TileContext<B> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<B: TileOps> std::fmt::Debug for TileContext<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileContext")
            .field("backend", &self.ops.backend())
            .field("state", &self.state)
            .field("palette", &self.palette)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::reference::ReferenceTiles;
    use crate::TileGeometry;

    fn full_palette() -> TilePalette {
        TilePalette::uniform(TileGeometry::new(16, 64))
    }

    #[test]
    fn test_lifecycle() {
        let mut ctx = TileContext::new(ReferenceTiles::new());
        assert_eq!(ctx.state(), ContextState::Uninitialized);
        ctx.request_capability().unwrap();
        assert_eq!(ctx.state(), ContextState::CapabilityGranted);
        ctx.configure(&full_palette()).unwrap();
        assert_eq!(ctx.state(), ContextState::Active);
        assert!(ctx.active_ops().is_ok());
        ctx.release();
        assert_eq!(ctx.state(), ContextState::Released);
        assert_eq!(ctx.ops().counts().releases, 1);
        // Idempotent.
        ctx.release();
        assert_eq!(ctx.ops().counts().releases, 1);
    }

    #[test]
    fn test_ops_outside_active_rejected() {
        let mut ctx = TileContext::acquire(ReferenceTiles::new()).unwrap();
        assert!(matches!(
            ctx.active_ops(),
            Err(TileError::ContractViolation(_))
        ));
        ctx.configure(&full_palette()).unwrap();
        ctx.release();
        assert!(ctx.active_ops().is_err());
        assert!(ctx.configure(&full_palette()).is_err());
    }

    #[test]
    fn test_capability_denied_is_fatal() {
        let result = TileContext::acquire(ReferenceTiles::denying());
        assert!(matches!(result, Err(TileError::CapabilityDenied { .. })));

        let mut ctx = TileContext::new(ReferenceTiles::denying());
        assert!(ctx.request_capability().is_err());
        assert!(ctx.configure(&full_palette()).is_err());
        assert!(ctx.active_ops().is_err());
        // A denied context does not occupy the thread.
        assert!(TileContext::acquire(ReferenceTiles::new()).is_ok());
    }

    #[test]
    fn test_one_live_context_per_thread() {
        let first = TileContext::acquire(ReferenceTiles::new()).unwrap();
        let second = TileContext::acquire(ReferenceTiles::new());
        assert!(matches!(second, Err(TileError::ContractViolation(_))));
        drop(first);
        assert!(TileContext::acquire(ReferenceTiles::new()).is_ok());
    }

    #[test]
    fn test_contexts_on_different_threads() {
        let _here = TileContext::acquire(ReferenceTiles::new()).unwrap();
        let handle = std::thread::spawn(|| TileContext::acquire(ReferenceTiles::new()).is_ok());
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_oversized_palette_rejected_before_hardware() {
        let mut ctx = TileContext::acquire(ReferenceTiles::new()).unwrap();
        let palette = TilePalette::uniform(TileGeometry::new(32, 64));
        assert!(matches!(
            ctx.configure(&palette),
            Err(TileError::ResourceLimit(_))
        ));
        assert_eq!(ctx.state(), ContextState::CapabilityGranted);
        assert_eq!(ctx.ops().counts().configures, 0);
    }

    #[test]
    fn test_custom_limits() {
        let limits = TileLimits::new().with_max_total_bytes(4096);
        let mut ctx = TileContext::with_limits(ReferenceTiles::new(), limits);
        ctx.request_capability().unwrap();
        assert!(ctx.configure(&full_palette()).is_err());
    }

    #[test]
    fn test_reconfigure_stays_active() {
        let mut ctx = TileContext::acquire(ReferenceTiles::new()).unwrap();
        ctx.configure(&full_palette()).unwrap();
        let smaller = TilePalette::uniform(TileGeometry::new(8, 32));
        ctx.configure(&smaller).unwrap();
        assert_eq!(ctx.palette(), Some(&smaller));
        assert_eq!(ctx.state(), ContextState::Active);
        assert_eq!(ctx.ops().counts().configures, 2);
    }

    #[test]
    fn test_release_on_early_return() {
        fn fails_midway() -> Result<()> {
            let mut ctx = TileContext::acquire(ReferenceTiles::new())?;
            ctx.configure(&full_palette())?;
            Err(TileError::InvalidInput("bail out".to_string()))
        }
        assert!(fails_midway().is_err());
        // The dropped context released the thread.
        assert!(TileContext::acquire(ReferenceTiles::new()).is_ok());
    }
}
