//! Operand layout: VNNI packing, block splitting and the scalar oracle
//!
//! The tile dot-product reads B in a packed form where each group of four
//! consecutive reduction indices of one column sits next to each other:
//!
//! ```text
//! plain B (K × N)              packed B (K/4 × 4N)
//! b[0][0] b[0][1] ...          b[0][0] b[1][0] b[2][0] b[3][0] b[0][1] b[1][1] ...
//! b[1][0] b[1][1] ...    ->    b[4][0] b[5][0] b[6][0] b[7][0] b[4][1] b[5][1] ...
//! ...                          ...
//! ```
//!
//! `packed[k / 4][4 * j + k % 4] = b[k][j]`.
//!
//! The split helpers cut logical matrices into the per-block, per-step tiles
//! [`TiledMatmul::multiply`](crate::TiledMatmul::multiply) consumes, and
//! [`join_blocks`] glues accumulator blocks back into one matrix.

use crate::{MatrixBuffer, Result, TileElement, TileError, TiledMatmul};

/// Packs a plain `K × N` B operand into the `K/4 × 4N` tile layout
///
/// # Errors
///
/// `InvalidInput` if `K` is not a multiple of 4.
///
/// # Example
///
/// ```
/// use tilemm::MatrixBuffer;
/// use tilemm::layout::pack_vnni;
///
/// let b = MatrixBuffer::from_vec(4, 2, vec![1i8, 2, 3, 4, 5, 6, 7, 8]).unwrap();
/// let packed = pack_vnni(&b).unwrap();
/// assert_eq!(packed.shape(), (1, 8));
/// assert_eq!(packed.as_slice(), &[1, 3, 5, 7, 2, 4, 6, 8]);
/// ```
pub fn pack_vnni(b: &MatrixBuffer<i8>) -> Result<MatrixBuffer<i8>> {
    let (k, n) = b.shape();
    if k % 4 != 0 {
        return Err(TileError::InvalidInput(format!(
            "cannot pack B with {k} rows; the reduction length must be a multiple of 4"
        )));
    }
    let mut packed = MatrixBuffer::new(k / 4, 4 * n);
    let src = b.as_slice();
    let dst = packed.as_mut_slice();
    for (kk, row) in src.chunks_exact(n.max(1)).enumerate().take(k) {
        for (j, &value) in row.iter().enumerate() {
            dst[(kk / 4) * 4 * n + 4 * j + kk % 4] = value;
        }
    }
    Ok(packed)
}

/// Copies the `rows × cols` window at (`row0`, `col0`) out of `src`
fn window<T: TileElement>(
    src: &MatrixBuffer<T>,
    row0: usize,
    col0: usize,
    rows: usize,
    cols: usize,
) -> MatrixBuffer<T> {
    let stride = src.cols();
    let data = src.as_slice();
    let mut out = MatrixBuffer::new(rows, cols);
    for (r, dst) in out.as_mut_slice().chunks_exact_mut(cols.max(1)).enumerate() {
        let start = (row0 + r) * stride + col0;
        dst.copy_from_slice(&data[start..start + cols]);
    }
    out
}

fn expect_shape<T: TileElement>(
    name: &str,
    matrix: &MatrixBuffer<T>,
    expected: (usize, usize),
) -> Result<()> {
    if matrix.shape() != expected {
        return Err(TileError::InvalidInput(format!(
            "{name} is {}x{}, the plan needs {}x{}",
            matrix.rows(),
            matrix.cols(),
            expected.0,
            expected.1
        )));
    }
    Ok(())
}

/// Splits a logical `M × K` A into `a[i][t]` tiles of `m × k`
pub fn split_a(plan: &TiledMatmul, a: &MatrixBuffer<i8>) -> Result<Vec<Vec<MatrixBuffer<i8>>>> {
    let shape = plan.shape();
    let layout = plan.layout();
    expect_shape("A", a, (plan.output_dims().0, plan.reduction_len()))?;
    Ok((0..layout.row_blocks)
        .map(|i| {
            (0..layout.steps)
                .map(|t| window(a, i * shape.m, t * shape.k, shape.m, shape.k))
                .collect()
        })
        .collect())
}

/// Splits a plain logical `K × N` B into packed `b[j][t]` tiles of `k/4 × 4n`
pub fn split_b(plan: &TiledMatmul, b: &MatrixBuffer<i8>) -> Result<Vec<Vec<MatrixBuffer<i8>>>> {
    let shape = plan.shape();
    let layout = plan.layout();
    expect_shape("B", b, (plan.reduction_len(), plan.output_dims().1))?;
    (0..layout.col_blocks)
        .map(|j| {
            (0..layout.steps)
                .map(|t| {
                    pack_vnni(&window(b, t * shape.k, j * shape.n, shape.k, shape.n))
                })
                .collect()
        })
        .collect()
}

/// Splits a logical `M × N` C into accumulator blocks, row-major over (i, j)
pub fn split_c(plan: &TiledMatmul, c: &MatrixBuffer<i32>) -> Result<Vec<MatrixBuffer<i32>>> {
    let shape = plan.shape();
    let layout = plan.layout();
    expect_shape("C", c, plan.output_dims())?;
    let mut blocks = Vec::with_capacity(layout.accumulators());
    for i in 0..layout.row_blocks {
        for j in 0..layout.col_blocks {
            blocks.push(window(c, i * shape.m, j * shape.n, shape.m, shape.n));
        }
    }
    Ok(blocks)
}

/// Reassembles accumulator blocks (row-major over (i, j)) into `M × N`
pub fn join_blocks(plan: &TiledMatmul, blocks: &[MatrixBuffer<i32>]) -> Result<MatrixBuffer<i32>> {
    let shape = plan.shape();
    let layout = plan.layout();
    if blocks.len() != layout.accumulators() {
        return Err(TileError::InvalidInput(format!(
            "{} accumulator blocks for a {}x{} layout",
            blocks.len(),
            layout.row_blocks,
            layout.col_blocks
        )));
    }
    let (rows, cols) = plan.output_dims();
    let mut out = MatrixBuffer::new(rows, cols);
    for (idx, block) in blocks.iter().enumerate() {
        expect_shape("accumulator block", block, (shape.m, shape.n))?;
        let (i, j) = (idx / layout.col_blocks, idx % layout.col_blocks);
        let dst = out.as_mut_slice();
        for (r, src_row) in block.as_slice().chunks_exact(shape.n).enumerate() {
            let start = (i * shape.m + r) * cols + j * shape.n;
            dst[start..start + shape.n].copy_from_slice(src_row);
        }
    }
    Ok(out)
}

/// Scalar oracle: plain `A (M × K) · B (K × N)` with wrapping i32 sums
///
/// Both operands are in plain row-major layout.
pub fn reference_matmul(a: &MatrixBuffer<i8>, b: &MatrixBuffer<i8>) -> Result<MatrixBuffer<i32>> {
    let (m, k) = a.shape();
    let (kb, n) = b.shape();
    if k != kb {
        return Err(TileError::InvalidInput(format!(
            "inner dimensions differ: A is {m}x{k}, B is {kb}x{n}"
        )));
    }
    let mut c = MatrixBuffer::new(m, n);
    let (a, b) = (a.as_slice(), b.as_slice());
    let out = c.as_mut_slice();
    for i in 0..m {
        for j in 0..n {
            out[i * n + j] = (0..k).fold(0i32, |acc, kk| {
                acc.wrapping_add(i32::from(a[i * k + kk]) * i32::from(b[kk * n + j]))
            });
        }
    }
    Ok(c)
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use crate::backends::reference::ReferenceTiles;
    use crate::{AccumulatorPolicy, TileContext};
    use proptest::prelude::*;

    fn matrix(rows: usize, cols: usize) -> impl Strategy<Value = MatrixBuffer<i8>> {
        prop::collection::vec(any::<i8>(), rows * cols)
            .prop_map(move |data| MatrixBuffer::from_vec(rows, cols, data).unwrap())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn blocked_multiply_matches_oracle(
            (p, q) in prop_oneof![
                Just((1usize, 1usize)),
                Just((1, 3)),
                Just((3, 1)),
                Just((2, 2)),
            ],
            steps in 1usize..4,
            seed_a in any::<u64>(),
            seed_b in any::<u64>(),
            resident in any::<bool>(),
        ) {
            let policy = if resident {
                AccumulatorPolicy::Resident
            } else {
                AccumulatorPolicy::StoreEachStep
            };
            let plan = TiledMatmul::blocked(p, q, steps)
                .unwrap()
                .with_policy(policy);
            let (m, n) = plan.output_dims();
            let k = plan.reduction_len();
            let a = pseudo_random(m, k, seed_a);
            let b = pseudo_random(k, n, seed_b);

            let a_blocks = split_a(&plan, &a).unwrap();
            let b_blocks = split_b(&plan, &b).unwrap();
            let mut c_blocks = split_c(&plan, &MatrixBuffer::new(m, n)).unwrap();

            let mut ctx = TileContext::acquire(ReferenceTiles::new()).unwrap();
            plan.prepare(&mut ctx).unwrap();
            plan.multiply(&mut ctx, &a_blocks, &b_blocks, &mut c_blocks)
                .unwrap();

            prop_assert_eq!(
                join_blocks(&plan, &c_blocks).unwrap(),
                reference_matmul(&a, &b).unwrap()
            );
        }

        #[test]
        fn single_tile_matches_oracle(a in matrix(8, 32), b in matrix(32, 8)) {
            let plan = TiledMatmul::single(8, 8, 32).unwrap();
            let mut ctx = TileContext::acquire(ReferenceTiles::new()).unwrap();
            plan.prepare(&mut ctx).unwrap();
            let mut c = MatrixBuffer::new(8, 8);
            plan.multiply_single(&mut ctx, &a, &pack_vnni(&b).unwrap(), &mut c)
                .unwrap();
            prop_assert_eq!(c, reference_matmul(&a, &b).unwrap());
        }

        #[test]
        fn join_inverts_split(values in prop::collection::vec(any::<i32>(), 32 * 32)) {
            let plan = TiledMatmul::blocked(2, 2, 1).unwrap();
            let c = MatrixBuffer::from_vec(32, 32, values).unwrap();
            let blocks = split_c(&plan, &c).unwrap();
            prop_assert_eq!(join_blocks(&plan, &blocks).unwrap(), c);
        }
    }

    /// Cheap deterministic fill; full-size matrices are too large for vec strategies
    fn pseudo_random(rows: usize, cols: usize, seed: u64) -> MatrixBuffer<i8> {
        let mut state = seed | 1;
        let data = (0..rows * cols)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 56) as u8 as i8
            })
            .collect();
        MatrixBuffer::from_vec(rows, cols, data).unwrap()
    }
}
