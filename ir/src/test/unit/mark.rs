//! Mark naming and parsing tests.

use test_case::test_case;

use crate::error::Error;
use crate::kernel::ReduceOp;
use crate::mark::{Mark, ReduceMark};

fn reduce(op: ReduceOp, stmt: &str, id: usize) -> ReduceMark {
    ReduceMark { op, stmt: stmt.to_string(), id }
}

#[test_case(Mark::Block, "block_marker")]
#[test_case(Mark::Thread, "thread_marker")]
#[test_case(Mark::Warp, "warp_marker")]
#[test_case(Mark::PromoteGlobalToSharedAb, "promote_global_to_shared_ab")]
#[test_case(Mark::Reduce(reduce(ReduceOp::Sum, "S1", 0)), "reduce_marker_SumOp_S1_0")]
#[test_case(Mark::ReduceArea(reduce(ReduceOp::Max, "S_2", 3)), "reduce_area_MaxOp_S_2_3")]
#[test_case(Mark::Atomic(ReduceOp::Sum), "atomic_SumOp")]
#[test_case(Mark::Unroll(8), "unroll_8")]
fn test_mark_name_and_parse(mark: Mark, name: &str) {
    assert_eq!(mark.name(), name);
    assert_eq!(name.parse::<Mark>().unwrap(), mark);
}

#[test_case("reduce_marker_SumOp" ; "missing statement and id")]
#[test_case("reduce_marker_FooOp_S1_0" ; "unknown operator")]
#[test_case("reduce_area_SumOp_S1_x" ; "non-numeric id")]
#[test_case("reduce_marker_SumOp__0" ; "empty statement")]
#[test_case("atomic_Plus" ; "unknown atomic operator")]
#[test_case("unroll_many" ; "non-numeric unroll")]
fn test_malformed_mark(name: &str) {
    assert_eq!(name.parse::<Mark>(), Err(Error::MalformedMark { name: name.to_string() }));
}

#[test]
fn test_custom_mark() {
    assert_eq!("fuse_here".parse::<Mark>().unwrap(), Mark::Custom("fuse_here".into()));
}

#[test]
fn test_reduce_suffix_shared_by_init_and_update() {
    let mark = reduce(ReduceOp::Prod, "S4", 1);
    assert_eq!(mark.suffix(), "ProdOp_S4_1");
    assert_eq!(Mark::Reduce(mark.clone()).name()["reduce_marker_".len()..], Mark::ReduceArea(mark).name()["reduce_area_".len()..]);
}

#[test]
fn test_thread_level_marks() {
    assert!(Mark::Thread.is_thread_level());
    assert!(Mark::Warp.is_thread_level());
    assert!(!Mark::Block.is_thread_level());
}
