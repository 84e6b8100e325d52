//! Backend implementations of the tile unit
//!
//! Every tile instruction the engine issues goes through the [`TileOps`] trait.
//!
//! # Safety
//!
//! All `unsafe` code is isolated within the AMX backend. The trait itself is
//! safe: implementations check slice bounds and slot geometry before touching
//! the hardware, so a caller can never make a tile load or store run past the
//! end of a buffer.
//!
//! # Backends
//!
//! - `reference`: Software model of the tile unit (portable, checks every contract)
//! - `amx`: x86_64 Linux AMX-TILE / AMX-INT8 via inline assembly

pub mod reference;

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
pub mod amx;

use crate::{Backend, Result, TileError, TilePalette, TileSlot};

/// The tile unit as seen by the engine
///
/// Implementations hold per-thread tile state. The methods mirror the
/// platform primitives: permission request, configuration, load,
/// dot-product-accumulate, store and release.
///
/// # Contract
///
/// - `load`/`store` receive the full byte extent of the buffer bound to the
///   slot and its real row stride; the buffer must be exactly
///   `rows × stride` bytes for the slot's configured `rows`
/// - `dot_product_accumulate(dst, a, b)` requires distinct, configured slots
///   with `dst.rows == a.rows`, `dst.colsb == b.colsb`, `a.colsb == 4 × b.rows`
/// - nothing but `request_permission` and `configure` is valid before a
///   successful `configure`
pub trait TileOps {
    /// Which backend this is
    fn backend(&self) -> Backend;

    /// Ask the OS for permission to use tile data on the calling thread
    fn request_permission(&mut self) -> Result<()>;

    /// Install `palette` as the active tile configuration
    ///
    /// All tile contents are zeroed; accumulator values do not survive.
    fn configure(&mut self, palette: &TilePalette) -> Result<()>;

    /// Load `rows × colsb` bytes from `src` (row stride `stride`) into `slot`
    fn load(&mut self, slot: TileSlot, src: &[u8], stride: usize) -> Result<()>;

    /// `dst[i][j] += Σ_g Σ_q a[i][4g+q] · b[g][4j+q]` over signed bytes
    fn dot_product_accumulate(&mut self, dst: TileSlot, a: TileSlot, b: TileSlot) -> Result<()>;

    /// Store `slot` into `dst` with row stride `stride`
    fn store(&mut self, slot: TileSlot, dst: &mut [u8], stride: usize) -> Result<()>;

    /// Release all tile state held by the calling thread
    fn release(&mut self);
}

impl<T: TileOps + ?Sized> TileOps for Box<T> {
    fn backend(&self) -> Backend {
        (**self).backend()
    }

    fn request_permission(&mut self) -> Result<()> {
        (**self).request_permission()
    }

    fn configure(&mut self, palette: &TilePalette) -> Result<()> {
        (**self).configure(palette)
    }

    fn load(&mut self, slot: TileSlot, src: &[u8], stride: usize) -> Result<()> {
        (**self).load(slot, src, stride)
    }

    fn dot_product_accumulate(&mut self, dst: TileSlot, a: TileSlot, b: TileSlot) -> Result<()> {
        (**self).dot_product_accumulate(dst, a, b)
    }

    fn store(&mut self, slot: TileSlot, dst: &mut [u8], stride: usize) -> Result<()> {
        (**self).store(slot, dst, stride)
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// Create the tile ops for `backend` (`Auto` picks the best available)
///
/// # Errors
///
/// Returns `UnsupportedBackend` when AMX is requested on a platform that
/// cannot provide it.
pub fn create(backend: Backend) -> Result<Box<dyn TileOps>> {
    match backend.resolve() {
        Backend::Reference => Ok(Box::new(reference::ReferenceTiles::new())),
        Backend::Amx => create_amx(),
        Backend::Auto => Err(TileError::UnsupportedBackend(Backend::Auto)),
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
fn create_amx() -> Result<Box<dyn TileOps>> {
    if !crate::amx_int8_detected() {
        return Err(TileError::UnsupportedBackend(Backend::Amx));
    }
    Ok(Box::new(amx::AmxTiles::new()))
}

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
fn create_amx() -> Result<Box<dyn TileOps>> {
    Err(TileError::UnsupportedBackend(Backend::Amx))
}

/// Checks a load/store buffer against the geometry bound to its slot
///
/// Shared by both backends: the buffer must span exactly `rows` rows of
/// `stride` bytes and each row must hold at least `colsb` bytes.
pub(crate) fn check_extent(
    palette: &TilePalette,
    slot: TileSlot,
    len: usize,
    stride: usize,
) -> Result<usize> {
    let geometry = palette.require(slot)?;
    let rows = usize::from(geometry.rows);
    let colsb = usize::from(geometry.colsb);
    if stride < colsb {
        return Err(TileError::ContractViolation(format!(
            "stride {stride} is narrower than {slot} rows of {colsb} bytes"
        )));
    }
    if len != rows * stride {
        return Err(TileError::ContractViolation(format!(
            "buffer of {len} bytes does not match {rows} rows at stride {stride} for {slot}"
        )));
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TileGeometry;

    #[test]
    fn test_create_reference() {
        let ops = create(Backend::Reference).unwrap();
        assert_eq!(ops.backend(), Backend::Reference);
    }

    #[test]
    fn test_create_auto_resolves() {
        let ops = create(Backend::Auto).unwrap();
        assert_ne!(ops.backend(), Backend::Auto);
    }

    #[test]
    fn test_create_amx_without_hardware() {
        if crate::amx_int8_detected() {
            return;
        }
        assert!(matches!(
            create(Backend::Amx),
            Err(TileError::UnsupportedBackend(Backend::Amx))
        ));
    }

    #[test]
    fn test_check_extent() {
        let slot = TileSlot::new(0).unwrap();
        let palette = TilePalette::new().with_slot(slot, TileGeometry::new(16, 64));
        assert_eq!(check_extent(&palette, slot, 1024, 64).unwrap(), 16);
        // Stride narrower than a tile row.
        assert!(check_extent(&palette, slot, 512, 32).is_err());
        // Stride wider than the buffer's real rows.
        assert!(check_extent(&palette, slot, 1024, 128).is_err());
        // Slot not configured.
        let other = TileSlot::new(1).unwrap();
        assert!(check_extent(&palette, other, 1024, 64).is_err());
    }
}
