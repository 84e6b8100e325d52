//! Tile geometry, palettes and the tile storage budget
//!
//! A [`TilePalette`] maps each of the eight tile slots to an optional
//! [`TileGeometry`]. Validation against [`TileLimits`] happens before the
//! palette ever reaches the hardware, so an oversized request is rejected at
//! configuration time rather than at the first load.
//!
//! # Example
//!
//! ```
//! use tilemm::{TileGeometry, TileLimits, TilePalette, TileSlot};
//!
//! let palette = TilePalette::new()
//!     .with_slot(TileSlot::new(0).unwrap(), TileGeometry::new(16, 64))
//!     .with_slot(TileSlot::new(1).unwrap(), TileGeometry::new(16, 64));
//! assert!(palette.validate(&TileLimits::default()).is_ok());
//!
//! let too_tall = TilePalette::new().with_slot(TileSlot::new(0).unwrap(), TileGeometry::new(17, 64));
//! assert!(too_tall.validate(&TileLimits::default()).is_err());
//! ```

use std::fmt;

use crate::{Result, TileError};

/// Number of architectural tile slots
pub const MAX_TILE_SLOTS: usize = 8;

/// Palette id with 8 KB of tile data spread over 8 slots
pub const PALETTE_ID: u8 = 1;

/// Index of a tile register (0..8)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TileSlot(u8);

impl TileSlot {
    /// Creates a slot handle
    ///
    /// # Errors
    ///
    /// Returns `ResourceLimit` if `index >= 8`
    pub fn new(index: usize) -> Result<Self> {
        if index >= MAX_TILE_SLOTS {
            return Err(TileError::ResourceLimit(format!(
                "tile slot {index} does not exist (slots 0..{MAX_TILE_SLOTS})"
            )));
        }
        Ok(TileSlot(index as u8))
    }

    /// Slot for an index the caller has already bounded by the slot count
    pub(crate) fn nth(index: usize) -> Self {
        debug_assert!(index < MAX_TILE_SLOTS);
        TileSlot((index % MAX_TILE_SLOTS) as u8)
    }

    /// The slot index
    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    /// Iterator over all architectural slots
    pub fn all() -> impl Iterator<Item = TileSlot> {
        (0..MAX_TILE_SLOTS as u8).map(TileSlot)
    }
}

impl fmt::Display for TileSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tmm{}", self.0)
    }
}

/// Shape of one configured tile
///
/// `colsb` is the row width in bytes. For an `i8` operand that is the element
/// count; for an `i32` accumulator it is four times the element count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileGeometry {
    /// Row count
    pub rows: u8,
    /// Bytes per row
    pub colsb: u16,
}

impl TileGeometry {
    /// Creates a geometry (unchecked; see [`TileGeometry::validate`])
    pub const fn new(rows: u8, colsb: u16) -> Self {
        TileGeometry { rows, colsb }
    }

    /// Geometry of a `rows × cols` i8 operand tile
    pub fn for_i8(rows: usize, cols: usize) -> Result<Self> {
        Self::from_dims(rows, cols)
    }

    /// Geometry of a `rows × cols` i32 accumulator tile
    pub fn for_i32(rows: usize, cols: usize) -> Result<Self> {
        Self::from_dims(rows, cols * 4)
    }

    fn from_dims(rows: usize, colsb: usize) -> Result<Self> {
        let rows = u8::try_from(rows)
            .map_err(|_| TileError::ResourceLimit(format!("tile rows {rows} out of range")))?;
        let colsb = u16::try_from(colsb)
            .map_err(|_| TileError::ResourceLimit(format!("tile colsb {colsb} out of range")))?;
        Ok(TileGeometry { rows, colsb })
    }

    /// Bytes of tile storage this geometry occupies
    pub fn footprint(&self) -> usize {
        usize::from(self.rows) * usize::from(self.colsb)
    }

    /// Checks the geometry against per-slot limits
    ///
    /// # Errors
    ///
    /// Returns `ResourceLimit` for zero or oversized dimensions, a `colsb`
    /// that is not a multiple of 4, or a footprint above `max_slot_bytes`.
    pub fn validate(&self, limits: &TileLimits) -> Result<()> {
        if self.rows == 0 || self.colsb == 0 {
            return Err(TileError::ResourceLimit(format!(
                "tile geometry {}x{}B has a zero dimension",
                self.rows, self.colsb
            )));
        }
        if usize::from(self.rows) > limits.max_rows {
            return Err(TileError::ResourceLimit(format!(
                "tile rows {} exceed maximum {}",
                self.rows, limits.max_rows
            )));
        }
        if usize::from(self.colsb) > limits.max_colsb {
            return Err(TileError::ResourceLimit(format!(
                "tile colsb {} exceeds maximum {}",
                self.colsb, limits.max_colsb
            )));
        }
        // The accumulate primitive consumes 4-byte groups.
        if self.colsb % 4 != 0 {
            return Err(TileError::ResourceLimit(format!(
                "tile colsb {} is not a multiple of 4",
                self.colsb
            )));
        }
        if self.footprint() > limits.max_slot_bytes {
            return Err(TileError::ResourceLimit(format!(
                "tile footprint {} bytes exceeds per-slot budget {}",
                self.footprint(),
                limits.max_slot_bytes
            )));
        }
        Ok(())
    }
}

impl fmt::Display for TileGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}B", self.rows, self.colsb)
    }
}

/// Tile storage budget
///
/// Defaults describe palette 1: eight slots of at most 16 rows × 64 bytes
/// (1 KB each, 8 KB total).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileLimits {
    /// Usable slot count
    pub slot_count: usize,
    /// Maximum rows per tile
    pub max_rows: usize,
    /// Maximum bytes per tile row
    pub max_colsb: usize,
    /// Maximum bytes per tile
    pub max_slot_bytes: usize,
    /// Maximum bytes across all configured tiles
    pub max_total_bytes: usize,
}

impl Default for TileLimits {
    fn default() -> Self {
        Self {
            slot_count: MAX_TILE_SLOTS,
            max_rows: 16,
            max_colsb: 64,
            max_slot_bytes: 1024,
            max_total_bytes: 8192,
        }
    }
}

impl TileLimits {
    /// Create limits with palette 1 defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the usable slot count (clamped to the 8 architectural slots)
    pub fn with_slot_count(mut self, slots: usize) -> Self {
        self.slot_count = slots.min(MAX_TILE_SLOTS);
        self
    }

    /// Set the per-tile row limit
    pub fn with_max_rows(mut self, rows: usize) -> Self {
        self.max_rows = rows;
        self
    }

    /// Set the per-row byte limit
    pub fn with_max_colsb(mut self, colsb: usize) -> Self {
        self.max_colsb = colsb;
        self
    }

    /// Set the per-tile byte budget
    pub fn with_max_slot_bytes(mut self, bytes: usize) -> Self {
        self.max_slot_bytes = bytes;
        self
    }

    /// Set the total tile storage budget
    pub fn with_max_total_bytes(mut self, bytes: usize) -> Self {
        self.max_total_bytes = bytes;
        self
    }

    /// Read palette 1 limits from CPUID leaf 0x1D, falling back to defaults
    ///
    /// # Example
    ///
    /// ```
    /// use tilemm::TileLimits;
    ///
    /// let limits = TileLimits::detect();
    /// assert!(limits.max_total_bytes >= limits.max_slot_bytes);
    /// ```
    pub fn detect() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            if crate::amx_int8_detected() {
                if let Some(limits) = Self::from_cpuid() {
                    return limits;
                }
            }
        }
        Self::default()
    }

    #[cfg(target_arch = "x86_64")]
    fn from_cpuid() -> Option<Self> {
        use std::arch::x86_64::{__cpuid, __cpuid_count};

        // SAFETY: CPUID is available on every x86_64 processor.
        let max_leaf = unsafe { __cpuid(0) }.eax;
        if max_leaf < 0x1D {
            return None;
        }
        // SAFETY: leaf 0x1D is supported (checked above).
        let palette0 = unsafe { __cpuid_count(0x1D, 0) };
        if palette0.eax < u32::from(PALETTE_ID) {
            return None;
        }
        // SAFETY: leaf 0x1D subleaf 1 describes palette 1.
        let info = unsafe { __cpuid_count(0x1D, u32::from(PALETTE_ID)) };
        let total = (info.eax & 0xffff) as usize;
        let per_tile = (info.eax >> 16) as usize;
        let per_row = (info.ebx & 0xffff) as usize;
        let names = (info.ebx >> 16) as usize;
        let rows = (info.ecx & 0xffff) as usize;
        if total == 0 || per_tile == 0 || per_row == 0 || names == 0 || rows == 0 {
            return None;
        }
        Some(Self {
            slot_count: names.min(MAX_TILE_SLOTS),
            max_rows: rows,
            max_colsb: per_row,
            max_slot_bytes: per_tile,
            max_total_bytes: total,
        })
    }
}

/// Per-slot geometry for one tile configuration
///
/// Slots left unset are inert: they cannot be loaded, accumulated into or
/// stored until a later configuration gives them a geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TilePalette {
    slots: [Option<TileGeometry>; MAX_TILE_SLOTS],
}

impl TilePalette {
    /// Creates a palette with no configured slots
    pub fn new() -> Self {
        Self::default()
    }

    /// Palette with every slot set to `geometry`
    pub fn uniform(geometry: TileGeometry) -> Self {
        TilePalette {
            slots: [Some(geometry); MAX_TILE_SLOTS],
        }
    }

    /// Builder: set the geometry of `slot`
    pub fn with_slot(mut self, slot: TileSlot, geometry: TileGeometry) -> Self {
        self.set(slot, geometry);
        self
    }

    /// Set the geometry of `slot`
    pub fn set(&mut self, slot: TileSlot, geometry: TileGeometry) {
        self.slots[slot.index()] = Some(geometry);
    }

    /// Geometry of `slot`, if configured
    pub fn geometry(&self, slot: TileSlot) -> Option<TileGeometry> {
        self.slots[slot.index()]
    }

    /// Geometry of `slot`, or a contract violation if it is inert
    pub fn require(&self, slot: TileSlot) -> Result<TileGeometry> {
        self.geometry(slot).ok_or_else(|| {
            TileError::ContractViolation(format!("{slot} is not configured in the active palette"))
        })
    }

    /// Configured slots in index order
    pub fn configured(&self) -> impl Iterator<Item = (TileSlot, TileGeometry)> + '_ {
        TileSlot::all()
            .filter_map(move |slot| self.geometry(slot).map(|g| (slot, g)))
    }

    /// Total bytes of tile storage across configured slots
    pub fn total_footprint(&self) -> usize {
        self.configured().map(|(_, g)| g.footprint()).sum()
    }

    /// Checks every configured slot and the total budget
    ///
    /// # Errors
    ///
    /// Returns `ResourceLimit` if a slot beyond `limits.slot_count` is used,
    /// if any geometry violates the per-slot limits, or if the total
    /// footprint exceeds `limits.max_total_bytes`.
    pub fn validate(&self, limits: &TileLimits) -> Result<()> {
        for (slot, geometry) in self.configured() {
            if slot.index() >= limits.slot_count {
                return Err(TileError::ResourceLimit(format!(
                    "{slot} is beyond the {} usable slots",
                    limits.slot_count
                )));
            }
            geometry.validate(limits)?;
        }
        let total = self.total_footprint();
        if total > limits.max_total_bytes {
            return Err(TileError::ResourceLimit(format!(
                "total tile footprint {total} bytes exceeds budget {}",
                limits.max_total_bytes
            )));
        }
        Ok(())
    }

    /// Checks that `dst += a · b` is well formed for this palette
    ///
    /// The destination has `M` rows of `N` i32 values, `a` is `M × K` bytes
    /// and `b` is the packed `K/4 × 4N` operand.
    pub fn check_dot_product(&self, dst: TileSlot, a: TileSlot, b: TileSlot) -> Result<()> {
        if dst == a || dst == b || a == b {
            return Err(TileError::ContractViolation(format!(
                "dot-product slots must be distinct (dst {dst}, a {a}, b {b})"
            )));
        }
        let gd = self.require(dst)?;
        let ga = self.require(a)?;
        let gb = self.require(b)?;
        if gd.rows != ga.rows {
            return Err(TileError::ContractViolation(format!(
                "accumulator {dst} has {} rows but input {a} has {}",
                gd.rows, ga.rows
            )));
        }
        if gd.colsb != gb.colsb {
            return Err(TileError::ContractViolation(format!(
                "accumulator {dst} is {}B wide but input {b} is {}B",
                gd.colsb, gb.colsb
            )));
        }
        if usize::from(ga.colsb) != 4 * usize::from(gb.rows) {
            return Err(TileError::ContractViolation(format!(
                "input {a} reduces over {} bytes but {b} supplies {} rows of 4-byte groups",
                ga.colsb, gb.rows
            )));
        }
        Ok(())
    }

    /// The 64-byte `ldtilecfg` image of this palette
    ///
    /// Layout: palette id, start row, 14 reserved bytes, 16 little-endian
    /// `u16` colsb entries, 16 `u8` row counts.
    pub fn to_config_bytes(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[0] = PALETTE_ID;
        for (slot, geometry) in self.configured() {
            let i = slot.index();
            bytes[16 + 2 * i..18 + 2 * i].copy_from_slice(&geometry.colsb.to_le_bytes());
            bytes[48 + i] = geometry.rows;
        }
        bytes
    }
}
