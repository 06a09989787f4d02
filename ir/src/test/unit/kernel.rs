//! Kernel construction and reduction detection tests.

use test_case::test_case;

use polygpu_dtype::ScalarDType;

use crate::aff::{AffExpr, Iter};
use crate::error::Error;
use crate::expr::{BinOp, Expr};
use crate::kernel::{Access, Kernel, ReduceOp, Statement, Tensor};
use crate::test::fixtures;

#[test_case(BinOp::Add, ReduceOp::Sum)]
#[test_case(BinOp::Mul, ReduceOp::Prod)]
#[test_case(BinOp::Max, ReduceOp::Max)]
#[test_case(BinOp::Min, ReduceOp::Min)]
#[test_case(BinOp::Sub, ReduceOp::Unsupported)]
fn test_reduce_op_detection(op: BinOp, expected: ReduceOp) {
    let (kernel, _) = fixtures::row_reduce_with(16, 32, op);
    let found: Vec<_> = kernel.reductions().map(|(s, op)| (s.name.clone(), op)).collect();
    assert_eq!(found, vec![("S1".to_string(), expected)]);
}

#[test]
fn test_reduction_axes() {
    let (kernel, _) = fixtures::row_reduce(16, 32);
    let s1 = kernel.statement("S1").unwrap();
    assert_eq!(s1.reduction_axes().iter().map(|it| it.name.as_str()).collect::<Vec<_>>(), vec!["k"]);
    assert!(kernel.statement("S0").unwrap().reduction_axes().is_empty());
}

#[test]
fn test_reduction_needs_non_unit_axis() {
    let (kernel, _) = fixtures::row_reduce(16, 1);
    assert_eq!(kernel.reductions().count(), 0);
}

#[test]
fn test_elementwise_has_no_reduction() {
    let (kernel, _) = fixtures::elementwise_add(8, 8);
    assert_eq!(kernel.reductions().count(), 0);
}

#[test]
fn test_reads_are_deduplicated() {
    let value = Expr::load("A", vec![Expr::var("i")]) * Expr::load("A", vec![Expr::var("i")]);
    let stmt = Statement::new("S0", vec![Iter::new("i", 4)], Access::new("B", [AffExpr::var("i")]), value).unwrap();
    assert_eq!(stmt.reads().len(), 1);
    assert_eq!(stmt.accesses().count(), 2);
}

#[test]
fn test_non_affine_access() {
    let value = Expr::load("A", vec![Expr::var("i") * Expr::var("i")]);
    let err = Statement::new("S0", vec![Iter::new("i", 4)], Access::new("B", [AffExpr::var("i")]), value).unwrap_err();
    assert_eq!(err, Error::NonAffineAccess { stmt: "S0".into(), tensor: "A".into() });
}

#[test]
fn test_kernel_rejects_unknown_tensor() {
    let stmt = Statement::new("S0", vec![Iter::new("i", 4)], Access::new("B", [AffExpr::var("i")]), Expr::int(0)).unwrap();
    let err = Kernel::builder().name("k").tensors(vec![]).statements(vec![stmt]).build().unwrap_err();
    assert_eq!(err, Error::UnknownTensor { name: "B".into() });
}

#[test]
fn test_kernel_rejects_rank_mismatch() {
    let stmt = Statement::new("S0", vec![Iter::new("i", 4)], Access::new("B", [AffExpr::var("i")]), Expr::int(0)).unwrap();
    let err = Kernel::builder()
        .name("k")
        .tensors(vec![Tensor::new("B", &[4, 4], ScalarDType::Float32)])
        .statements(vec![stmt])
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::AccessRank { got: 1, rank: 2, .. }));
}

#[test]
fn test_kernel_rejects_unknown_bind() {
    let (kernel, _) = fixtures::stencil(8);
    let err = Kernel::builder()
        .name("k")
        .tensors(kernel.tensors.values().cloned().collect())
        .statements(kernel.statements.clone())
        .binds(vec!["Z".to_string()])
        .build()
        .unwrap_err();
    assert_eq!(err, Error::UnknownTensor { name: "Z".into() });
}

#[test]
fn test_read_only_tensors() {
    let (kernel, _) = fixtures::row_reduce(16, 32);
    assert_eq!(kernel.read_only_tensors(["S0", "S1"]).into_iter().collect::<Vec<_>>(), vec!["A".to_string()]);
    let (kernel, _) = fixtures::fused_reduce(16, 32);
    assert_eq!(kernel.read_only_tensors(["S2"]).into_iter().collect::<Vec<_>>(), vec!["B".to_string()]);
}
