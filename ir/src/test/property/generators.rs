//! Strategies for affine schedules over small box domains.

use proptest::prelude::*;

use crate::aff::{AffExpr, Iter, QuasiAff};

/// Two-dimensional box domain `i in [0, ni)`, `j in [0, nj)` with `nj > 1`.
pub fn box_2d() -> impl Strategy<Value = [Iter; 2]> {
    (1i64..=48, 2i64..=48).prop_map(|(ni, nj)| [Iter::new("i", ni), Iter::new("j", nj)])
}

/// Row-major fusion `nj * i + j` of a 2-D domain.
pub fn fused_member(domain: &[Iter; 2]) -> QuasiAff {
    QuasiAff::new(AffExpr::term("i", domain[1].extent) + AffExpr::var("j"))
}

/// A domain together with a point inside it.
pub fn box_2d_with_point() -> impl Strategy<Value = ([Iter; 2], i64, i64)> {
    box_2d().prop_flat_map(|dom| {
        let (ni, nj) = (dom[0].extent, dom[1].extent);
        (Just(dom), 0..ni, 0..nj)
    })
}

pub fn tile_size() -> impl Strategy<Value = i64> {
    1i64..=64
}
