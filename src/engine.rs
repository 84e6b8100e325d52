//! Blocked int8 tile matrix multiplication
//!
//! One parameterized kernel covers every variant: an output of P×Q accumulator
//! blocks, each block `m × n` i32 values, reduced over T steps of `k` bytes.
//! The single-tile multiply is the P = Q = T = 1 case.
//!
//! # Slot assignment
//!
//! ```text
//! slots 0 .. P            A row-block inputs    (m × k bytes)
//! slots P .. P+Q          B column-block inputs (k/4 × 4n bytes, packed)
//! slots P+Q .. P+Q+P·Q    C accumulators        (m × 4n bytes), row-major over (i, j)
//! ```
//!
//! With eight slots that allows 1×1 up to 1×3, 3×1 and 2×2 blocking.
//!
//! # Accumulation order
//!
//! With [`AccumulatorPolicy::Resident`] the accumulators are loaded once, stay
//! in their slots for all T reduction steps and are stored once at the end:
//!
//! ```text
//! load C[i][j] -> acc(i,j)                 for all i, j
//! for t in 0..T:
//!     load A[i][t] -> a(i)                 for all i
//!     load B[j][t] -> b(j)                 for all j
//!     acc(i,j) += a(i) · b(j)              for all i, j
//! store acc(i,j) -> C[i][j]                for all i, j
//! ```
//!
//! # Example
//!
//! ```
//! use tilemm::{MatrixBuffer, TileContext, TiledMatmul};
//! use tilemm::backends::reference::ReferenceTiles;
//!
//! // 2×2 blocks, 3 reduction steps: C is 32×32, K = 192
//! let plan = TiledMatmul::blocked(2, 2, 3).unwrap();
//! let mut ctx = TileContext::acquire(ReferenceTiles::new()).unwrap();
//! plan.prepare(&mut ctx).unwrap();
//!
//! let a: Vec<Vec<MatrixBuffer<i8>>> = (0..2)
//!     .map(|_| (0..3).map(|_| MatrixBuffer::filled(16, 64, 1)).collect())
//!     .collect();
//! let b = a.clone();
//! let mut c = vec![MatrixBuffer::<i32>::new(16, 16); 4];
//!
//! plan.multiply(&mut ctx, &a, &b, &mut c).unwrap();
//! assert!(c.iter().all(|block| block.as_slice().iter().all(|&v| v == 192)));
//! ```

use std::fmt;
use std::slice;

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::backends::TileOps;
use crate::palette::MAX_TILE_SLOTS;
use crate::{
    MatrixBuffer, Result, TileContext, TileError, TileGeometry, TileLimits, TilePalette, TileSlot,
};

/// Per-block tile dimensions
///
/// `m` output rows, `n` output i32 columns, `k` reduction bytes per step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileShape {
    /// Rows of A and C per block
    pub m: usize,
    /// Columns of B and C per block
    pub n: usize,
    /// Reduction depth per step
    pub k: usize,
}

impl TileShape {
    /// Largest palette 1 shape: 16×16 outputs, 64-deep reduction steps
    pub const FULL: TileShape = TileShape {
        m: 16,
        n: 16,
        k: 64,
    };

    /// Creates a shape whose three tiles fit the palette 1 limits
    ///
    /// # Errors
    ///
    /// `ResourceLimit` if `m > 16`, `4n > 64`, `k > 64`, `k` is not a multiple
    /// of 4, or any dimension is zero.
    pub fn new(m: usize, n: usize, k: usize) -> Result<Self> {
        let shape = TileShape { m, n, k };
        shape.geometries()?;
        Ok(shape)
    }

    /// The A, B and C tile geometries, each checked against palette 1 limits
    ///
    /// # Errors
    ///
    /// `ResourceLimit` under the same conditions as [`TileShape::new`]; a
    /// shape built as a struct literal is checked here.
    pub fn geometries(&self) -> Result<[TileGeometry; 3]> {
        if self.k % 4 != 0 {
            return Err(TileError::ResourceLimit(format!(
                "reduction depth {} is not a multiple of 4",
                self.k
            )));
        }
        let limits = TileLimits::default();
        let geometries = [self.a_geometry()?, self.b_geometry()?, self.c_geometry()?];
        for geometry in &geometries {
            geometry.validate(&limits)?;
        }
        Ok(geometries)
    }

    /// Geometry of an A tile (`m × k` bytes)
    pub fn a_geometry(&self) -> Result<TileGeometry> {
        TileGeometry::for_i8(self.m, self.k)
    }

    /// Geometry of a packed B tile (`k/4 × 4n` bytes)
    pub fn b_geometry(&self) -> Result<TileGeometry> {
        TileGeometry::for_i8(self.k / 4, self.n * 4)
    }

    /// Geometry of a C accumulator tile (`m × n` i32)
    pub fn c_geometry(&self) -> Result<TileGeometry> {
        TileGeometry::for_i32(self.m, self.n)
    }
}

/// How the output and the reduction are split into tiles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    /// P: accumulator block rows (one A tile each)
    pub row_blocks: usize,
    /// Q: accumulator block columns (one B tile each)
    pub col_blocks: usize,
    /// T: reduction steps
    pub steps: usize,
}

impl BlockLayout {
    /// A P×Q layout over T reduction steps
    pub fn new(row_blocks: usize, col_blocks: usize, steps: usize) -> Self {
        BlockLayout {
            row_blocks,
            col_blocks,
            steps,
        }
    }

    /// Number of accumulator blocks (P·Q)
    pub fn accumulators(&self) -> usize {
        self.row_blocks * self.col_blocks
    }

    /// Tile slots the layout occupies (P + Q + P·Q)
    pub fn slots_needed(&self) -> usize {
        self.row_blocks + self.col_blocks + self.accumulators()
    }
}

/// When accumulator tiles travel between memory and the tile unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccumulatorPolicy {
    /// Load once, accumulate across every reduction step, store once
    #[default]
    Resident,
    /// Load and store every accumulator around every reduction step
    StoreEachStep,
}

/// Tile operations issued by one call of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileTraffic {
    /// Tile loads
    pub loads: usize,
    /// Tile stores
    pub stores: usize,
    /// Dot-product-accumulates
    pub dot_products: usize,
}

impl fmt::Display for TileTraffic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} loads, {} stores, {} dot-products",
            self.loads, self.stores, self.dot_products
        )
    }
}

/// A blocked tile matrix-multiply plan
///
/// The plan fixes the tile shape, the block layout and the accumulator
/// policy; [`TiledMatmul::palette`] is the configuration a context needs
/// before [`TiledMatmul::multiply`] may run on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TiledMatmul {
    shape: TileShape,
    layout: BlockLayout,
    policy: AccumulatorPolicy,
    /// A, B and C geometries, validated on construction
    geometries: [TileGeometry; 3],
}

impl TiledMatmul {
    /// Creates a plan
    ///
    /// # Errors
    ///
    /// `InvalidInput` for a zero block count or zero steps; `ResourceLimit`
    /// if P + Q + P·Q exceeds the eight tile slots or a tile of `shape` does
    /// not fit the palette 1 limits.
    pub fn new(shape: TileShape, layout: BlockLayout) -> Result<Self> {
        let geometries = shape.geometries()?;
        if layout.row_blocks == 0 || layout.col_blocks == 0 {
            return Err(TileError::InvalidInput(format!(
                "block layout {}x{} has no accumulator blocks",
                layout.row_blocks, layout.col_blocks
            )));
        }
        if layout.steps == 0 {
            return Err(TileError::InvalidInput(
                "a plan needs at least one reduction step".to_string(),
            ));
        }
        if layout.slots_needed() > MAX_TILE_SLOTS {
            return Err(TileError::ResourceLimit(format!(
                "{}x{} blocking needs {} tile slots, only {MAX_TILE_SLOTS} exist",
                layout.row_blocks,
                layout.col_blocks,
                layout.slots_needed()
            )));
        }
        Ok(TiledMatmul {
            shape,
            layout,
            policy: AccumulatorPolicy::default(),
            geometries,
        })
    }

    /// Single-tile plan: `C (m×n) += A (m×k) · B (k×n)`
    pub fn single(m: usize, n: usize, k: usize) -> Result<Self> {
        Self::new(TileShape::new(m, n, k)?, BlockLayout::new(1, 1, 1))
    }

    /// P×Q-blocked plan with full 16×16×64 tiles over `steps` reduction steps
    pub fn blocked(row_blocks: usize, col_blocks: usize, steps: usize) -> Result<Self> {
        Self::new(
            TileShape::FULL,
            BlockLayout::new(row_blocks, col_blocks, steps),
        )
    }

    /// Builder: choose the accumulator policy
    pub fn with_policy(mut self, policy: AccumulatorPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Per-block tile shape
    pub fn shape(&self) -> TileShape {
        self.shape
    }

    /// Block layout
    pub fn layout(&self) -> BlockLayout {
        self.layout
    }

    /// Accumulator policy
    pub fn policy(&self) -> AccumulatorPolicy {
        self.policy
    }

    /// Slot holding A row-block `i`
    pub fn a_slot(&self, i: usize) -> TileSlot {
        debug_assert!(i < self.layout.row_blocks);
        TileSlot::nth(i)
    }

    /// Slot holding B column-block `j`
    pub fn b_slot(&self, j: usize) -> TileSlot {
        debug_assert!(j < self.layout.col_blocks);
        TileSlot::nth(self.layout.row_blocks + j)
    }

    /// Slot holding accumulator block (`i`, `j`)
    pub fn c_slot(&self, i: usize, j: usize) -> TileSlot {
        debug_assert!(i < self.layout.row_blocks && j < self.layout.col_blocks);
        let base = self.layout.row_blocks + self.layout.col_blocks;
        TileSlot::nth(base + i * self.layout.col_blocks + j)
    }

    /// The tile configuration this plan runs under
    ///
    /// Slots the plan does not use stay unconfigured.
    pub fn palette(&self) -> TilePalette {
        let mut palette = TilePalette::new();
        let [ga, gb, gc] = self.geometries;
        for i in 0..self.layout.row_blocks {
            palette.set(self.a_slot(i), ga);
        }
        for j in 0..self.layout.col_blocks {
            palette.set(self.b_slot(j), gb);
        }
        for i in 0..self.layout.row_blocks {
            for j in 0..self.layout.col_blocks {
                palette.set(self.c_slot(i, j), gc);
            }
        }
        palette
    }

    /// Configures `ctx` with this plan's palette
    pub fn prepare<B: TileOps>(&self, ctx: &mut TileContext<B>) -> Result<()> {
        ctx.configure(&self.palette())
    }

    /// Logical output size (M, N) = (P·m, Q·n)
    pub fn output_dims(&self) -> (usize, usize) {
        (
            self.layout.row_blocks * self.shape.m,
            self.layout.col_blocks * self.shape.n,
        )
    }

    /// Logical reduction length K = T·k
    pub fn reduction_len(&self) -> usize {
        self.layout.steps * self.shape.k
    }

    /// Integer operations per call: 2·M·K·N
    pub fn ops_per_call(&self) -> u64 {
        let (m, n) = self.output_dims();
        2 * m as u64 * self.reduction_len() as u64 * n as u64
    }

    /// Loads, stores and dot-products issued per call under the plan's policy
    ///
    /// # Example
    ///
    /// ```
    /// use tilemm::{AccumulatorPolicy, TiledMatmul};
    ///
    /// let plan = TiledMatmul::blocked(2, 2, 16).unwrap();
    /// assert_eq!(plan.tile_traffic().stores, 4);
    ///
    /// let naive = plan.with_policy(AccumulatorPolicy::StoreEachStep);
    /// assert_eq!(naive.tile_traffic().stores, 64);
    /// ```
    pub fn tile_traffic(&self) -> TileTraffic {
        let BlockLayout {
            row_blocks: p,
            col_blocks: q,
            steps: t,
        } = self.layout;
        let inputs = t * (p + q);
        let dot_products = t * p * q;
        match self.policy {
            AccumulatorPolicy::Resident => TileTraffic {
                loads: p * q + inputs,
                stores: p * q,
                dot_products,
            },
            AccumulatorPolicy::StoreEachStep => TileTraffic {
                loads: t * p * q + inputs,
                stores: t * p * q,
                dot_products,
            },
        }
    }

    /// Single-tile multiply-accumulate: `C += A · B`
    ///
    /// `a` is `m × k`, `b` the packed `k/4 × 4n` operand, `c` is `m × n`.
    /// Accumulating, not idempotent: calling twice adds the product twice.
    ///
    /// # Errors
    ///
    /// `ContractViolation` if the plan is not a 1×1, one-step plan, or on any
    /// condition [`TiledMatmul::multiply`] rejects.
    pub fn multiply_single<B: TileOps>(
        &self,
        ctx: &mut TileContext<B>,
        a: &MatrixBuffer<i8>,
        b: &MatrixBuffer<i8>,
        c: &mut MatrixBuffer<i32>,
    ) -> Result<()> {
        if self.layout != BlockLayout::new(1, 1, 1) {
            return Err(TileError::ContractViolation(format!(
                "single-tile multiply on a {}x{}x{} plan",
                self.layout.row_blocks, self.layout.col_blocks, self.layout.steps
            )));
        }
        self.multiply(
            ctx,
            &[slice::from_ref(a)],
            &[slice::from_ref(b)],
            slice::from_mut(c),
        )
    }

    /// Blocked multiply-accumulate: `C[i][j] += Σ_t A[i][t] · B[j][t]`
    ///
    /// `a_blocks[i][t]` is the `m × k` A tile of block row `i` at step `t`,
    /// `b_blocks[j][t]` the packed `k/4 × 4n` B tile of block column `j`,
    /// and `c_blocks[i * Q + j]` the `m × n` accumulator block.
    ///
    /// # Errors
    ///
    /// `ContractViolation`, before any tile is touched, when the context is not
    /// active with this plan's palette, when block or step counts disagree
    /// with the plan, or when a buffer's dimensions differ from its slot's
    /// geometry. Backend errors are propagated as-is.
    ///
    /// A contract error is a caller bug. `C` is left exactly as passed in, so
    /// dropping the returned `Result` silently loses the whole update and the
    /// result must always be checked.
    #[cfg_attr(feature = "tracing", instrument(skip_all, fields(
        blocks = %format!("{}x{}", self.layout.row_blocks, self.layout.col_blocks),
        steps = self.layout.steps,
    )))]
    pub fn multiply<B, S>(
        &self,
        ctx: &mut TileContext<B>,
        a_blocks: &[S],
        b_blocks: &[S],
        c_blocks: &mut [MatrixBuffer<i32>],
    ) -> Result<()>
    where
        B: TileOps,
        S: AsRef<[MatrixBuffer<i8>]>,
    {
        self.check_context(ctx)?;
        self.check_operands(a_blocks, b_blocks, c_blocks)?;
        let ops = ctx.active_ops()?;

        match self.policy {
            AccumulatorPolicy::Resident => self.run_resident(ops, a_blocks, b_blocks, c_blocks),
            AccumulatorPolicy::StoreEachStep => {
                self.run_store_each_step(ops, a_blocks, b_blocks, c_blocks)
            }
        }
    }

    fn run_resident<B, S>(
        &self,
        ops: &mut B,
        a_blocks: &[S],
        b_blocks: &[S],
        c_blocks: &mut [MatrixBuffer<i32>],
    ) -> Result<()>
    where
        B: TileOps,
        S: AsRef<[MatrixBuffer<i8>]>,
    {
        let q = self.layout.col_blocks;

        for (idx, c) in c_blocks.iter().enumerate() {
            ops.load(self.c_slot(idx / q, idx % q), c.as_bytes(), c.stride())?;
        }

        for t in 0..self.layout.steps {
            self.load_inputs(ops, a_blocks, b_blocks, t)?;
            for idx in 0..c_blocks.len() {
                let (i, j) = (idx / q, idx % q);
                ops.dot_product_accumulate(self.c_slot(i, j), self.a_slot(i), self.b_slot(j))?;
            }
        }

        for (idx, c) in c_blocks.iter_mut().enumerate() {
            let stride = c.stride();
            ops.store(self.c_slot(idx / q, idx % q), c.as_bytes_mut(), stride)?;
        }
        Ok(())
    }

    fn run_store_each_step<B, S>(
        &self,
        ops: &mut B,
        a_blocks: &[S],
        b_blocks: &[S],
        c_blocks: &mut [MatrixBuffer<i32>],
    ) -> Result<()>
    where
        B: TileOps,
        S: AsRef<[MatrixBuffer<i8>]>,
    {
        let q = self.layout.col_blocks;

        for t in 0..self.layout.steps {
            self.load_inputs(ops, a_blocks, b_blocks, t)?;
            for (idx, c) in c_blocks.iter_mut().enumerate() {
                let (i, j) = (idx / q, idx % q);
                let slot = self.c_slot(i, j);
                let stride = c.stride();
                ops.load(slot, c.as_bytes(), stride)?;
                ops.dot_product_accumulate(slot, self.a_slot(i), self.b_slot(j))?;
                ops.store(slot, c.as_bytes_mut(), stride)?;
            }
        }
        Ok(())
    }

    fn load_inputs<B, S>(&self, ops: &mut B, a_blocks: &[S], b_blocks: &[S], t: usize) -> Result<()>
    where
        B: TileOps,
        S: AsRef<[MatrixBuffer<i8>]>,
    {
        for (i, steps) in a_blocks.iter().enumerate() {
            let a = &steps.as_ref()[t];
            ops.load(self.a_slot(i), a.as_bytes(), a.stride())?;
        }
        for (j, steps) in b_blocks.iter().enumerate() {
            let b = &steps.as_ref()[t];
            ops.load(self.b_slot(j), b.as_bytes(), b.stride())?;
        }
        Ok(())
    }

    fn check_context<B: TileOps>(&self, ctx: &TileContext<B>) -> Result<()> {
        if ctx.palette() != Some(&self.palette()) {
            return Err(TileError::ContractViolation(format!(
                "context ({:?}) is not configured with this plan's palette",
                ctx.state()
            )));
        }
        Ok(())
    }

    fn check_operands<S>(
        &self,
        a_blocks: &[S],
        b_blocks: &[S],
        c_blocks: &[MatrixBuffer<i32>],
    ) -> Result<()>
    where
        S: AsRef<[MatrixBuffer<i8>]>,
    {
        let BlockLayout {
            row_blocks: p,
            col_blocks: q,
            steps: t,
        } = self.layout;
        let TileShape { m, n, k } = self.shape;

        if a_blocks.len() != p || b_blocks.len() != q || c_blocks.len() != p * q {
            return Err(TileError::ContractViolation(format!(
                "expected {p} A blocks, {q} B blocks and {} C blocks, got {}, {} and {}",
                p * q,
                a_blocks.len(),
                b_blocks.len(),
                c_blocks.len()
            )));
        }

        for (name, blocks, dims) in [("A", a_blocks, (m, k)), ("B", b_blocks, (k / 4, 4 * n))] {
            for (idx, steps) in blocks.iter().enumerate() {
                let steps = steps.as_ref();
                if steps.len() != t {
                    return Err(TileError::ContractViolation(format!(
                        "{name} block {idx} has {} reduction steps, plan has {t}",
                        steps.len()
                    )));
                }
                let mismatch = steps.iter().enumerate().find(|(_, b)| b.shape() != dims);
                if let Some((step, tile)) = mismatch {
                    return Err(TileError::ContractViolation(format!(
                        "{name} block {idx} step {step} is {}x{}, slot geometry needs {}x{}",
                        tile.rows(),
                        tile.cols(),
                        dims.0,
                        dims.1
                    )));
                }
            }
        }

        if let Some((idx, c)) = c_blocks
            .iter()
            .enumerate()
            .find(|(_, c)| c.shape() != (m, n))
        {
            return Err(TileError::ContractViolation(format!(
                "C block {idx} is {}x{}, accumulator tiles are {m}x{n}",
                c.rows(),
                c.cols()
            )));
        }
        Ok(())
    }
}
