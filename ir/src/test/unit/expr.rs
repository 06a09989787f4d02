//! Expression simplification and interval tests.

use test_case::test_case;

use crate::aff::Interval;
use crate::expr::{BinOp, Expr};

fn x() -> Expr {
    Expr::var("x")
}

fn y() -> Expr {
    Expr::var("y")
}

// =========================================================================
// Linear canonicalisation
// =========================================================================

#[test]
fn test_simplify_collects_terms() {
    let e = x() * 2 + y() + x() * 3 - y();
    assert_eq!(e.simplify(), x() * 5);
}

#[test]
fn test_simplify_constant_fold() {
    assert_eq!((Expr::int(6) * 7 - 2).simplify(), Expr::Int(40));
}

#[test]
fn test_simplify_keeps_products_of_variables() {
    let e = x() * y();
    assert_eq!(e.simplify(), e);
}

// =========================================================================
// Floor division and modulo
// =========================================================================

#[test]
fn test_floor_div_of_multiple() {
    let e = (x() * 8 + 16).floor_div(8);
    assert_eq!(e.simplify(), x() + 2);
}

#[test]
fn test_floor_div_nested() {
    let e = x().floor_div(4).floor_div(8);
    assert_eq!(e.simplify(), x().floor_div(32));
}

#[test]
fn test_floor_div_by_one() {
    assert_eq!(x().floor_div(1).simplify(), x());
}

#[test]
fn test_floor_mod_drops_multiples() {
    let e = (x() * 32 + y() + 64).floor_mod(32);
    assert_eq!(e.simplify(), y().floor_mod(32));
}

#[test]
fn test_floor_mod_of_multiple_is_zero() {
    assert_eq!((x() * 4 + 8).floor_mod(4).simplify(), Expr::Int(0));
}

#[test_case(BinOp::FloorDiv, -7, 2, -4)]
#[test_case(BinOp::FloorMod, -7, 2, 1)]
#[test_case(BinOp::FloorDiv, 7, -2, -4)]
#[test_case(BinOp::FloorMod, 7, -2, -1)]
#[test_case(BinOp::Min, 3, -3, -3)]
#[test_case(BinOp::Le, 3, 3, 1)]
fn test_constant_fold(op: BinOp, a: i64, b: i64, expected: i64) {
    assert_eq!(Expr::binary(op, Expr::Int(a), Expr::Int(b)).simplify(), Expr::Int(expected));
}

// =========================================================================
// Comparisons and conjunctions
// =========================================================================

#[test]
fn test_comparison_by_difference() {
    assert_eq!((x() + 3).lt(x() + 5).simplify(), Expr::Int(1));
    assert_eq!((x() + 5).le(x() + 3).simplify(), Expr::Int(0));
    assert_eq!((x() * 2).eq_to(x() + x()).simplify(), Expr::Int(1));
}

#[test]
fn test_and_with_constants() {
    assert_eq!(Expr::Int(1).and(x().lt(4)).simplify(), x().lt(4));
    assert_eq!(x().lt(4).and(Expr::Int(0)).simplify(), Expr::Int(0));
}

#[test]
fn test_all_of_nothing() {
    assert_eq!(Expr::all(Vec::<Expr>::new()), None);
}

// =========================================================================
// Traversal and bounds
// =========================================================================

#[test]
fn test_free_vars_first_occurrence_order() {
    let e = x() + y() * x();
    assert_eq!(e.free_vars(), vec!["x".to_string(), "y".to_string()]);
}

#[test]
fn test_substitute_inside_loads() {
    let e = Expr::load("A", vec![x() + 1]);
    let out = e.substitute(&|n| (n == "x").then(|| y() * 2));
    assert_eq!(out, Expr::load("A", vec![y() * 2 + 1]));
}

#[test]
fn test_bounds_linear() {
    let bounds = |n: &str| match n {
        "x" => Some(Interval::new(0, 7)),
        "y" => Some(Interval::new(0, 3)),
        _ => None,
    };
    assert_eq!((x() * 4 + y()).bounds(&bounds), Some(Interval::new(0, 31)));
    assert_eq!((x() * 4 + y()).floor_div(8).bounds(&bounds), Some(Interval::new(0, 3)));
    assert_eq!(x().floor_mod(4).bounds(&bounds), Some(Interval::new(0, 3)));
    assert_eq!((x() + Expr::var("z")).bounds(&bounds), None);
}

#[test]
fn test_display() {
    assert_eq!(x().floor_div(4).to_string(), "floordiv(x, 4)");
    assert_eq!(Expr::load("A", vec![x(), Expr::Int(0)]).to_string(), "A[x, 0]");
    assert_eq!((x() + 1).lt(y()).to_string(), "((x + 1) < y)");
}
