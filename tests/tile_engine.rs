//! End-to-end tests of the tile engine on the reference model
//!
//! Logical matrices are split with the layout helpers, multiplied through a
//! tile context and compared against the scalar oracle.

use proptest::prelude::*;
use tilemm::backends::reference::ReferenceTiles;
use tilemm::layout::{join_blocks, pack_vnni, reference_matmul, split_a, split_b, split_c};
use tilemm::{
    AccumulatorPolicy, ContextState, MatrixBuffer, TileContext, TileError, TileGeometry,
    TilePalette, TileSlot, TiledMatmul,
};

const PROPTEST_CASES: u32 = 16;

fn context_for(plan: &TiledMatmul) -> TileContext<ReferenceTiles> {
    let mut ctx = TileContext::acquire(ReferenceTiles::new()).unwrap();
    plan.prepare(&mut ctx).unwrap();
    ctx
}

/// `rows × cols` i8 ramp, `x * mul % modulo` reinterpreted as signed
fn wrapping_ramp(rows: usize, cols: usize, mul: usize, modulo: usize) -> MatrixBuffer<i8> {
    let data = (0..rows * cols)
        .map(|x| ((x * mul) % modulo) as u8 as i8)
        .collect();
    MatrixBuffer::from_vec(rows, cols, data).unwrap()
}

fn matrix(rows: usize, cols: usize) -> impl Strategy<Value = MatrixBuffer<i8>> {
    prop::collection::vec(any::<i8>(), rows * cols)
        .prop_map(move |data| MatrixBuffer::from_vec(rows, cols, data).unwrap())
}

// ============================================================================
// BLOCKED == UNBLOCKED
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(PROPTEST_CASES))]

    /// 1×1 over T steps equals T single-tile calls and the oracle over K = 64·T
    #[test]
    fn multi_step_equals_repeated_single_tile(
        steps in 1usize..4,
        a in matrix(16, 192),
        b in matrix(192, 16),
    ) {
        let k = 64 * steps;
        let a_rows = (0..16)
            .flat_map(|r| a.row(r).unwrap()[..k].to_vec())
            .collect();
        let a = MatrixBuffer::from_vec(16, k, a_rows).unwrap();
        let b = MatrixBuffer::from_vec(k, 16, b.as_slice()[..k * 16].to_vec())
            .unwrap();

        let blocked = TiledMatmul::blocked(1, 1, steps).unwrap();
        let mut c_blocked = split_c(&blocked, &MatrixBuffer::new(16, 16)).unwrap();
        {
            let mut ctx = context_for(&blocked);
            let a_blocks = split_a(&blocked, &a).unwrap();
            let b_blocks = split_b(&blocked, &b).unwrap();
            blocked
                .multiply(&mut ctx, &a_blocks, &b_blocks, &mut c_blocked)
                .unwrap();
        }

        let single = TiledMatmul::single(16, 16, 64).unwrap();
        let mut ctx = context_for(&single);
        let a_steps = split_a(&blocked, &a).unwrap().remove(0);
        let b_steps = split_b(&blocked, &b).unwrap().remove(0);
        let mut c_single = MatrixBuffer::new(16, 16);
        for (a_t, b_t) in a_steps.iter().zip(&b_steps) {
            single.multiply_single(&mut ctx, a_t, b_t, &mut c_single).unwrap();
        }

        prop_assert_eq!(&c_blocked[0], &c_single);
        prop_assert_eq!(c_single, reference_matmul(&a, &b).unwrap());
    }
}

#[test]
fn test_every_valid_layout_matches_oracle() {
    let layouts = [(1, 1), (1, 2), (2, 1), (1, 3), (3, 1), (2, 2)];
    for (p, q) in layouts {
        for policy in [
            AccumulatorPolicy::Resident,
            AccumulatorPolicy::StoreEachStep,
        ] {
            let plan = TiledMatmul::blocked(p, q, 2)
                .unwrap()
                .with_policy(policy);
            let (m, n) = plan.output_dims();
            let k = plan.reduction_len();
            let a = wrapping_ramp(m, k, 31, 255);
            let b = wrapping_ramp(k, n, 17, 253);
            let seed = MatrixBuffer::from_vec(m, n, (0..(m * n) as i32).collect())
                .unwrap();

            let mut c = split_c(&plan, &seed).unwrap();
            let mut ctx = context_for(&plan);
            let a_blocks = split_a(&plan, &a).unwrap();
            let b_blocks = split_b(&plan, &b).unwrap();
            plan.multiply(&mut ctx, &a_blocks, &b_blocks, &mut c)
                .unwrap();

            let mut expected = reference_matmul(&a, &b).unwrap();
            for (out, init) in expected.as_mut_slice().iter_mut().zip(seed.as_slice()) {
                *out = out.wrapping_add(*init);
            }
            assert_eq!(
                join_blocks(&plan, &c).unwrap(),
                expected,
                "{p}x{q} {policy:?}"
            );
        }
    }
}

#[test]
fn test_extreme_values_wrap_like_hardware() {
    let plan = TiledMatmul::single(16, 16, 64).unwrap();
    let mut ctx = context_for(&plan);
    let a = MatrixBuffer::<i8>::filled(16, 64, -128);
    let b_plain = MatrixBuffer::<i8>::filled(64, 16, -128);
    let mut c = MatrixBuffer::<i32>::filled(16, 16, i32::MAX);

    plan.multiply_single(&mut ctx, &a, &pack_vnni(&b_plain).unwrap(), &mut c)
        .unwrap();
    let expected = i32::MAX.wrapping_add(64 * 128 * 128);
    assert!(c.as_slice().iter().all(|&v| v == expected));
}

// ============================================================================
// CONTRACTS
// ============================================================================

#[test]
fn test_geometry_boundaries_rejected_at_configure() {
    let slot = TileSlot::new(0).unwrap();
    let mut ctx = TileContext::acquire(ReferenceTiles::new()).unwrap();
    for geometry in [
        TileGeometry::new(17, 64),
        TileGeometry::new(16, 68),
        TileGeometry::new(16, 30),
        TileGeometry::new(0, 64),
    ] {
        let palette = TilePalette::new().with_slot(slot, geometry);
        assert!(matches!(
            ctx.configure(&palette),
            Err(TileError::ResourceLimit(_))
        ));
    }
    assert_eq!(ctx.state(), ContextState::CapabilityGranted);
    assert_eq!(ctx.ops().counts().configures, 0);
}

#[test]
fn test_reconfigure_between_plans() {
    let small = TiledMatmul::single(8, 8, 32).unwrap();
    let full = TiledMatmul::blocked(2, 2, 1).unwrap();
    let mut ctx = context_for(&small);

    let ones = MatrixBuffer::filled(8, 32, 1);
    let mut c = MatrixBuffer::new(8, 8);
    small
        .multiply_single(&mut ctx, &ones, &ones, &mut c)
        .unwrap();
    assert_eq!(c.get(7, 7), Some(&32));

    full.prepare(&mut ctx).unwrap();
    // The small plan no longer matches the active palette.
    assert!(small
        .multiply_single(&mut ctx, &ones, &ones, &mut c)
        .is_err());
    assert_eq!(c.get(7, 7), Some(&32));
}

#[test]
fn test_denied_capability_stops_everything() {
    let plan = TiledMatmul::single(16, 16, 64).unwrap();
    let mut ctx = TileContext::new(ReferenceTiles::denying());
    assert_eq!(
        ctx.request_capability(),
        Err(TileError::CapabilityDenied { errno: 1 })
    );
    assert!(plan.prepare(&mut ctx).is_err());

    let ones = MatrixBuffer::filled(16, 64, 1);
    let mut c = MatrixBuffer::new(16, 16);
    let result = plan.multiply_single(&mut ctx, &ones, &ones, &mut c);
    assert!(matches!(result, Err(TileError::ContractViolation(_))));
    assert_eq!(ctx.ops().counts().loads, 0);
}

#[test]
fn test_context_released_on_panic() {
    let outcome = std::panic::catch_unwind(|| {
        let plan = TiledMatmul::single(16, 16, 64).unwrap();
        let _ctx = context_for(&plan);
        panic!("worker failed");
    });
    assert!(outcome.is_err());
    assert!(TileContext::acquire(ReferenceTiles::new()).is_ok());
}
