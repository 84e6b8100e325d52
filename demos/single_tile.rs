//! Single-tile walk-through
//!
//! Multiplies constant-filled tiles once at the smallest practical geometry
//! (8 rows × 32 bytes) and once at the full palette 1 geometry (16 × 64),
//! printing every buffer.
//!
//! Run with: cargo run --example single_tile

use tilemm::backends;
use tilemm::layout::pack_vnni;
use tilemm::{Backend, MatrixBuffer, Result, TileContext, TiledMatmul};

fn multiply_and_print(
    ctx: &mut TileContext<Box<dyn backends::TileOps>>,
    rows: usize,
    cols: usize,
    depth: usize,
) -> Result<()> {
    let plan = TiledMatmul::single(rows, cols, depth)?;
    plan.prepare(ctx)?;

    let a = MatrixBuffer::<i8>::filled(rows, depth, 2);
    let b = MatrixBuffer::<i8>::filled(depth, cols, 2);
    let mut c = MatrixBuffer::<i32>::new(rows, cols);

    println!("── {rows}×{depth} · {depth}×{cols} ──");
    println!("A:\n{a}");
    println!("B:\n{b}");
    plan.multiply_single(ctx, &a, &pack_vnni(&b)?, &mut c)?;
    println!("C:\n{c}");
    Ok(())
}

fn main() -> Result<()> {
    let backend = Backend::Auto.resolve();
    println!("Backend: {backend:?}\n");

    let mut ctx = TileContext::acquire(backends::create(backend)?)?;
    multiply_and_print(&mut ctx, 8, 8, 32)?;
    multiply_and_print(&mut ctx, 16, 16, 64)?;
    ctx.release();
    Ok(())
}
