//! tilemm: int8 matrix-tile kernels for tile accelerators (x86 AMX)
//!
//! **tilemm** drives a matrix-tile unit that computes signed 8-bit
//! dot-product-accumulate over small register tiles into 32-bit accumulators,
//! and measures how fast blocked matrix-multiplication kernels run on it.
//!
//! 1. **Tile context** - per-thread permission request, tile configuration and release
//! 2. **Engine** - load → accumulate → store over P×Q accumulator blocks and T reduction steps
//! 3. **Harness** - single and multi-threaded timed runs with throughput reports
//!
//! # Design Principles
//!
//! - **One seam for the hardware**: every tile instruction goes through [`backends::TileOps`]
//! - **Reference model everywhere**: the software backend runs the same kernels on any CPU
//! - **Scoped tile state**: a [`TileContext`] is acquired per thread and released on drop
//! - **Contracts before instructions**: geometry, stride and state are checked before any tile op
//!
//! # Quick Start
//!
//! ```rust
//! use tilemm::{MatrixBuffer, TileContext, TiledMatmul};
//! use tilemm::backends::reference::ReferenceTiles;
//!
//! let plan = TiledMatmul::single(16, 16, 64).unwrap();
//! let mut ctx = TileContext::acquire(ReferenceTiles::new()).unwrap();
//! plan.prepare(&mut ctx).unwrap();
//!
//! let a = MatrixBuffer::<i8>::filled(16, 64, 2);
//! let b = MatrixBuffer::<i8>::filled(16, 64, 2); // 64×16 B in packed form
//! let mut c = MatrixBuffer::<i32>::new(16, 16);
//!
//! plan.multiply_single(&mut ctx, &a, &b, &mut c).unwrap();
//! assert!(c.as_slice().iter().all(|&v| v == 256));
//! ```

pub mod backends;
pub mod bench;
pub mod buffer;
pub mod context;
pub mod engine;
pub mod error;
pub mod layout;
pub mod palette;

pub use bench::{BenchConfig, BenchReport, ThreadReport};
pub use buffer::{MatrixBuffer, TileElement};
pub use context::{ContextState, TileContext};
pub use engine::{AccumulatorPolicy, BlockLayout, TileShape, TileTraffic, TiledMatmul};
pub use error::{Result, TileError};
pub use palette::{TileGeometry, TileLimits, TilePalette, TileSlot};

/// Backend execution target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Software reference model of the tile unit (portable)
    Reference,
    /// x86 AMX (AMX-TILE + AMX-INT8) on Linux
    Amx,
    /// Auto-select best available
    Auto,
}

impl Backend {
    /// Select the best available backend for the current platform
    ///
    /// This is a convenience wrapper around `select_best_available_backend()`
    pub fn select_best() -> Self {
        select_best_available_backend()
    }

    /// Resolve `Auto` to a concrete backend, leaving explicit choices untouched
    pub fn resolve(self) -> Self {
        match self {
            Backend::Auto => select_best_available_backend(),
            other => other,
        }
    }
}

/// Whether the CPU reports AMX-TILE and AMX-INT8
#[cfg(target_arch = "x86_64")]
pub fn amx_int8_detected() -> bool {
    use std::arch::x86_64::{__cpuid, __cpuid_count};

    // SAFETY: CPUID is available on every x86_64 processor.
    let max_leaf = unsafe { __cpuid(0) }.eax;
    if max_leaf < 7 {
        return false;
    }
    // SAFETY: leaf 7 is supported (checked above).
    let leaf7 = unsafe { __cpuid_count(7, 0) };
    let amx_tile = leaf7.edx & (1 << 24) != 0;
    let amx_int8 = leaf7.edx & (1 << 25) != 0;
    amx_tile && amx_int8
}

/// Whether the CPU reports AMX-TILE and AMX-INT8
#[cfg(not(target_arch = "x86_64"))]
pub fn amx_int8_detected() -> bool {
    false
}

/// Select the best available backend for the current platform
///
/// **x86_64 Linux**: AMX when CPUID reports AMX-TILE and AMX-INT8, else Reference.
///
/// **Other platforms**: Reference
///
/// Detection only looks at the CPU. The OS may still refuse tile data
/// permission, which surfaces as `TileError::CapabilityDenied` when a
/// [`TileContext`] is acquired.
///
/// # Examples
///
/// ```
/// use tilemm::select_best_available_backend;
///
/// let backend = select_best_available_backend();
/// println!("Using backend: {:?}", backend);
/// ```
pub fn select_best_available_backend() -> Backend {
    #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
    {
        if amx_int8_detected() {
            return Backend::Amx;
        }
    }

    Backend::Reference
}
