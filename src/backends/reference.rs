//! Software reference model of the tile unit
//!
//! This is the portable baseline implementation that works on all platforms.
//! It keeps eight 1 KB tile registers in plain arrays and applies the same
//! dot-product-accumulate semantics as the hardware.
//!
//! Unlike the hardware, it rejects every contract violation it can see:
//! operations before configuration or after release, loads and stores whose
//! stride does not match the buffer, inert slots and mismatched dot-product
//! geometry. That makes it the oracle for engine tests.

use super::{check_extent, TileOps};
use crate::palette::MAX_TILE_SLOTS;
use crate::{Backend, Result, TileError, TileLimits, TilePalette, TileSlot};

const TILE_BYTES: usize = 1024;

/// Counters of issued tile operations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpCounts {
    /// Successful `configure` calls
    pub configures: usize,
    /// Successful loads
    pub loads: usize,
    /// Successful dot-product-accumulates
    pub dot_products: usize,
    /// Successful stores
    pub stores: usize,
    /// `release` calls
    pub releases: usize,
}

/// Reference backend (portable, no tile hardware)
#[derive(Debug, Clone)]
pub struct ReferenceTiles {
    grant_permission: bool,
    permitted: bool,
    palette: Option<TilePalette>,
    tiles: [[u8; TILE_BYTES]; MAX_TILE_SLOTS],
    counts: OpCounts,
}

impl Default for ReferenceTiles {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceTiles {
    /// A model whose permission request succeeds
    pub fn new() -> Self {
        ReferenceTiles {
            grant_permission: true,
            permitted: false,
            palette: None,
            tiles: [[0; TILE_BYTES]; MAX_TILE_SLOTS],
            counts: OpCounts::default(),
        }
    }

    /// A model whose permission request is refused, as on a kernel without
    /// tile data support
    pub fn denying() -> Self {
        ReferenceTiles {
            grant_permission: false,
            ..Self::new()
        }
    }

    /// Operations issued so far
    pub fn counts(&self) -> OpCounts {
        self.counts
    }

    /// Raw bytes of one tile register
    pub fn tile_bytes(&self, slot: TileSlot) -> &[u8] {
        &self.tiles[slot.index()]
    }

    fn active_palette(&self) -> Result<TilePalette> {
        if !self.permitted {
            return Err(TileError::ContractViolation(
                "tile data permission has not been granted".to_string(),
            ));
        }
        self.palette.ok_or_else(|| {
            TileError::ContractViolation("no tile configuration is active".to_string())
        })
    }

    fn read_i32(tile: &[u8; TILE_BYTES], offset: usize) -> i32 {
        i32::from_ne_bytes([
            tile[offset],
            tile[offset + 1],
            tile[offset + 2],
            tile[offset + 3],
        ])
    }
}

impl TileOps for ReferenceTiles {
    fn backend(&self) -> Backend {
        Backend::Reference
    }

    fn request_permission(&mut self) -> Result<()> {
        if !self.grant_permission {
            // EPERM, what the kernel reports when the feature is not permitted
            return Err(TileError::CapabilityDenied { errno: 1 });
        }
        self.permitted = true;
        Ok(())
    }

    fn configure(&mut self, palette: &TilePalette) -> Result<()> {
        palette.validate(&TileLimits::default())?;
        if !self.permitted {
            return Err(TileError::ContractViolation(
                "configure before tile data permission was granted".to_string(),
            ));
        }
        self.palette = Some(*palette);
        self.tiles = [[0; TILE_BYTES]; MAX_TILE_SLOTS];
        self.counts.configures += 1;
        Ok(())
    }

    fn load(&mut self, slot: TileSlot, src: &[u8], stride: usize) -> Result<()> {
        let palette = self.active_palette()?;
        let rows = check_extent(&palette, slot, src.len(), stride)?;
        let colsb = usize::from(palette.require(slot)?.colsb);

        let tile = &mut self.tiles[slot.index()];
        for r in 0..rows {
            tile[r * colsb..(r + 1) * colsb].copy_from_slice(&src[r * stride..r * stride + colsb]);
        }
        self.counts.loads += 1;
        Ok(())
    }

    fn dot_product_accumulate(&mut self, dst: TileSlot, a: TileSlot, b: TileSlot) -> Result<()> {
        let palette = self.active_palette()?;
        palette.check_dot_product(dst, a, b)?;
        let gd = palette.require(dst)?;
        let ga = palette.require(a)?;
        let gb = palette.require(b)?;

        let m = usize::from(gd.rows);
        let n = usize::from(gd.colsb) / 4;
        let groups = usize::from(gb.rows);
        let a_colsb = usize::from(ga.colsb);
        let b_colsb = usize::from(gb.colsb);

        let ta = self.tiles[a.index()];
        let tb = self.tiles[b.index()];
        let td = &mut self.tiles[dst.index()];

        for i in 0..m {
            for j in 0..n {
                let offset = i * n * 4 + j * 4;
                let mut acc = Self::read_i32(td, offset);
                for g in 0..groups {
                    for q in 0..4 {
                        let x = ta[i * a_colsb + 4 * g + q] as i8;
                        let y = tb[g * b_colsb + 4 * j + q] as i8;
                        acc = acc.wrapping_add(i32::from(x) * i32::from(y));
                    }
                }
                td[offset..offset + 4].copy_from_slice(&acc.to_ne_bytes());
            }
        }
        self.counts.dot_products += 1;
        Ok(())
    }

    fn store(&mut self, slot: TileSlot, dst: &mut [u8], stride: usize) -> Result<()> {
        let palette = self.active_palette()?;
        let rows = check_extent(&palette, slot, dst.len(), stride)?;
        let colsb = usize::from(palette.require(slot)?.colsb);

        let tile = &self.tiles[slot.index()];
        for r in 0..rows {
            dst[r * stride..r * stride + colsb].copy_from_slice(&tile[r * colsb..(r + 1) * colsb]);
        }
        self.counts.stores += 1;
        Ok(())
    }

    fn release(&mut self) {
        self.palette = None;
        self.tiles = [[0; TILE_BYTES]; MAX_TILE_SLOTS];
        self.counts.releases += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MatrixBuffer, TileGeometry};

    fn slot(i: usize) -> TileSlot {
        TileSlot::new(i).unwrap()
    }

    /// Slots 0/1 inputs, slot 2 accumulator, all 16×64 B
    fn configured() -> ReferenceTiles {
        let mut tiles = ReferenceTiles::new();
        tiles.request_permission().unwrap();
        let palette = TilePalette::new()
            .with_slot(slot(0), TileGeometry::new(16, 64))
            .with_slot(slot(1), TileGeometry::new(16, 64))
            .with_slot(slot(2), TileGeometry::new(16, 64));
        tiles.configure(&palette).unwrap();
        tiles
    }

    #[test]
    fn test_constant_fill_dot_product() {
        let mut tiles = configured();
        let a = MatrixBuffer::<i8>::filled(16, 64, 2);
        let b = MatrixBuffer::<i8>::filled(16, 64, 2);
        let mut c = MatrixBuffer::<i32>::new(16, 16);

        tiles.load(slot(0), a.as_bytes(), a.stride()).unwrap();
        tiles.load(slot(1), b.as_bytes(), b.stride()).unwrap();
        tiles.load(slot(2), c.as_bytes(), c.stride()).unwrap();
        tiles.dot_product_accumulate(slot(2), slot(0), slot(1)).unwrap();
        let stride = c.stride();
        tiles.store(slot(2), c.as_bytes_mut(), stride).unwrap();

        assert!(c.as_slice().iter().all(|&v| v == 256));
        assert_eq!(
            tiles.counts(),
            OpCounts {
                configures: 1,
                loads: 3,
                dot_products: 1,
                stores: 1,
                releases: 0
            }
        );
    }

    #[test]
    fn test_signed_bytes() {
        let mut tiles = ReferenceTiles::new();
        tiles.request_permission().unwrap();
        // 1×4 A, 1×4 packed B (K=4, N=1), 1×1 accumulator.
        let palette = TilePalette::new()
            .with_slot(slot(0), TileGeometry::new(1, 4))
            .with_slot(slot(1), TileGeometry::new(1, 4))
            .with_slot(slot(2), TileGeometry::new(1, 4));
        tiles.configure(&palette).unwrap();

        let a = MatrixBuffer::from_vec(1, 4, vec![-128i8, 127, -1, 3]).unwrap();
        let b = MatrixBuffer::from_vec(1, 4, vec![-128i8, -128, 5, 7]).unwrap();
        let mut c = MatrixBuffer::from_vec(1, 1, vec![10i32]).unwrap();

        tiles.load(slot(0), a.as_bytes(), 4).unwrap();
        tiles.load(slot(1), b.as_bytes(), 4).unwrap();
        tiles.load(slot(2), c.as_bytes(), 4).unwrap();
        tiles.dot_product_accumulate(slot(2), slot(0), slot(1)).unwrap();
        tiles.store(slot(2), c.as_bytes_mut(), 4).unwrap();

        let expected = 10 + (-128 * -128) + (127 * -128) - 5 + 3 * 7;
        assert_eq!(c.get(0, 0), Some(&expected));
    }

    #[test]
    fn test_wrong_stride_is_flagged() {
        let mut tiles = configured();
        let a = MatrixBuffer::<i8>::filled(16, 64, 1);
        let err = tiles.load(slot(0), a.as_bytes(), 32).unwrap_err();
        assert!(matches!(err, TileError::ContractViolation(_)));
        let err = tiles.load(slot(0), a.as_bytes(), 128).unwrap_err();
        assert!(matches!(err, TileError::ContractViolation(_)));

        let mut c = MatrixBuffer::<i32>::new(16, 16);
        let err = tiles.store(slot(2), c.as_bytes_mut(), 16).unwrap_err();
        assert!(matches!(err, TileError::ContractViolation(_)));
        assert_eq!(tiles.counts().loads, 0);
        assert_eq!(tiles.counts().stores, 0);
    }

    #[test]
    fn test_ops_before_permission_rejected() {
        let mut tiles = ReferenceTiles::new();
        let palette = TilePalette::uniform(TileGeometry::new(16, 64));
        assert!(matches!(
            tiles.configure(&palette),
            Err(TileError::ContractViolation(_))
        ));
    }

    #[test]
    fn test_ops_before_configure_rejected() {
        let mut tiles = ReferenceTiles::new();
        tiles.request_permission().unwrap();
        let a = MatrixBuffer::<i8>::filled(16, 64, 1);
        assert!(tiles.load(slot(0), a.as_bytes(), 64).is_err());
        assert!(tiles
            .dot_product_accumulate(slot(2), slot(0), slot(1))
            .is_err());
    }

    #[test]
    fn test_ops_after_release_rejected() {
        let mut tiles = configured();
        tiles.release();
        let a = MatrixBuffer::<i8>::filled(16, 64, 1);
        assert!(tiles.load(slot(0), a.as_bytes(), 64).is_err());
        assert_eq!(tiles.counts().releases, 1);
    }

    #[test]
    fn test_inert_slot_rejected() {
        let mut tiles = configured();
        let a = MatrixBuffer::<i8>::filled(16, 64, 1);
        assert!(tiles.load(slot(5), a.as_bytes(), 64).is_err());
    }

    #[test]
    fn test_reconfigure_clears_accumulators() {
        let mut tiles = configured();
        let c = MatrixBuffer::<i32>::filled(16, 16, 9);
        tiles.load(slot(2), c.as_bytes(), c.stride()).unwrap();
        assert!(tiles.tile_bytes(slot(2)).iter().any(|&b| b != 0));

        let palette = TilePalette::uniform(TileGeometry::new(16, 64));
        tiles.configure(&palette).unwrap();
        assert!(tiles.tile_bytes(slot(2)).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_oversized_palette_rejected_at_configure() {
        let mut tiles = ReferenceTiles::new();
        tiles.request_permission().unwrap();
        let palette = TilePalette::new().with_slot(slot(0), TileGeometry::new(32, 64));
        assert!(matches!(
            tiles.configure(&palette),
            Err(TileError::ResourceLimit(_))
        ));
        assert_eq!(tiles.counts().configures, 0);

        // Nothing was installed, so the slot stays unusable.
        let a = MatrixBuffer::<i8>::filled(32, 64, 1);
        assert!(matches!(
            tiles.load(slot(0), a.as_bytes(), 64),
            Err(TileError::ContractViolation(_))
        ));
    }

    #[test]
    fn test_denying_model() {
        let mut tiles = ReferenceTiles::denying();
        assert_eq!(
            tiles.request_permission(),
            Err(TileError::CapabilityDenied { errno: 1 })
        );
    }
}
