//! Schedule tree to AST tests on hand-built trees.

use polygpu_ir::aff::QuasiAff;
use polygpu_ir::mapping::MappingCfg;
use polygpu_ir::test::fixtures;
use polygpu_ir::tree::{Band, BandMember, Context, Extension, Node, NodeKind, Promotion, ScheduleTree};
use polygpu_ir::{Expr, Kernel, Mark, ScopInfo, Stmt, UserConfig};

use crate::ast::AstNode;
use crate::ast_build::build_ast;
use crate::gpu_emitter::GpuEmitter;
use crate::node_info::NodeInfoRepo;
use crate::test::helpers::{loaded, mapping_filter};

fn single(stmt: &str, iter: &str, coincident: bool) -> Band {
    Band::new([BandMember::new(coincident).with(stmt, QuasiAff::var(iter))], true)
}

fn build(kernel: Kernel, tree: &ScheduleTree) -> (AstNode, NodeInfoRepo) {
    let mut info = ScopInfo::new(kernel, UserConfig::default());
    build_ast(tree, &mut info).unwrap()
}

/// `Mark(Thread) -> Filter(t0) -> Band[i]` over `stencil(n)`.
fn thread_mapped(n: i64, extent: i64) -> (Kernel, Node) {
    let (kernel, _) = fixtures::stencil(n);
    let band = Node::band(single("S0", "i", true), Node::leaf());
    (kernel, Node::mark(Mark::Thread, mapping_filter("threads", &[("t0", extent, 0)], band)))
}

// ============================================================================
// LOOPS
// ============================================================================

#[test]
fn test_serial_band_is_a_loop() {
    let (kernel, _) = fixtures::stencil(8);
    let tree = ScheduleTree::new(["S0"], Node::band(single("S0", "i", false), Node::leaf()));
    let (ast, repo) = build(kernel, &tree);

    assert_eq!(ast, AstNode::for_loop("c0", Expr::int(0), Expr::var("c0").le(7), 1, AstNode::user("__node_0")));
    let info = repo.get("__node_0").unwrap();
    assert_eq!(info.stmt, "S0");
    assert_eq!(info.domain.as_slice(), ["i"]);
    assert_eq!(info.iterator_map["i"], Expr::var("c0"));
    assert!(info.synthetic.is_none());
}

#[test]
fn test_single_point_member_has_no_loop() {
    let (kernel, _) = fixtures::stencil(8);
    let band = Band::new(
        [BandMember::new(true).with("S0", QuasiAff::constant(3)), BandMember::new(false).with("S0", QuasiAff::var("i"))],
        true,
    );
    let tree = ScheduleTree::new(["S0"], Node::band(band, Node::leaf()));
    let (ast, repo) = build(kernel, &tree);

    assert_eq!(ast, AstNode::for_loop("c1", Expr::int(0), Expr::var("c1").le(7), 1, AstNode::user("__node_0")));
    assert_eq!(repo.get("__node_0").unwrap().build.dims, vec![Expr::int(3), Expr::var("c1")]);
}

#[test]
fn test_sequence_numbers_users_in_order() {
    let (kernel, tree) = fixtures::row_reduce(4, 8);
    let (ast, repo) = build(kernel, &tree);

    assert_eq!(ast.annotations(), vec!["__node_0", "__node_1"]);
    assert_eq!(repo.get("__node_0").unwrap().stmt, "S0");
    assert_eq!(repo.get("__node_1").unwrap().stmt, "S1");
    assert_eq!(ast.loops().len(), 3);
}

// ============================================================================
// MAPPED MEMBERS
// ============================================================================

#[test]
fn test_mapped_member_guarded_when_id_exceeds_range() {
    let (kernel, child) = thread_mapped(10, 16);
    let (ast, repo) = build(kernel, &ScheduleTree::new(["S0"], child));

    let expected = AstNode::mark(Mark::Thread, AstNode::guard(Expr::var("t0").lt(10), AstNode::user("__node_0")));
    assert_eq!(ast, expected);
    assert_eq!(repo.get("__node_0").unwrap().iterator_map["i"], Expr::var("t0"));
}

#[test]
fn test_mapped_member_strided_when_range_exceeds_id() {
    let (kernel, child) = thread_mapped(10, 4);
    let (ast, repo) = build(kernel, &ScheduleTree::new(["S0"], child));

    let body = AstNode::for_loop("c0", Expr::var("t0"), Expr::var("c0").le(9), 4, AstNode::user("__node_0"));
    assert_eq!(ast, AstNode::mark(Mark::Thread, body));
    assert_eq!(repo.get("__node_0").unwrap().iterator_map["i"], Expr::var("c0"));
}

#[test]
fn test_context_bound_removes_guard() {
    let (kernel, child) = thread_mapped(10, 16);
    let context = Context { bounds: vec![("t0".into(), 10)] };
    let tree = ScheduleTree::new(["S0"], Node::new(NodeKind::Context(context), vec![child]));
    let (ast, _) = build(kernel, &tree);

    assert_eq!(ast, AstNode::mark(Mark::Thread, AstNode::user("__node_0")));
}

/// A band split after mapping: the binding past the first band's end lands
/// on the band below it.
#[test]
fn test_bindings_carry_over_split_band() {
    let (kernel, _) = fixtures::transpose(8);
    let inner = Node::band(single("S0", "i", true), Node::band(single("S0", "j", true), Node::leaf()));
    let child = Node::mark(Mark::Block, mapping_filter("blocks", &[("b1", 8, 0), ("b0", 8, 1)], inner));
    let (ast, repo) = build(kernel, &ScheduleTree::new(["S0"], child));

    assert_eq!(ast, AstNode::mark(Mark::Block, AstNode::user("__node_0")));
    let info = repo.get("__node_0").unwrap();
    assert_eq!(info.iterator_map["i"], Expr::var("b1"));
    assert_eq!(info.iterator_map["j"], Expr::var("b0"));
}

// ============================================================================
// PROMOTIONS
// ============================================================================

#[test]
fn test_promotion_offsets_over_mapped_ids() {
    let (kernel, _) = fixtures::stencil(64);
    let promotion = Promotion { tensor: "A".into(), promoted: "A_shared".into(), offsets: vec![Expr::var("c0")], extents: vec![2] };
    let extension = Node::new(NodeKind::Extension(Extension { stmts: Vec::new(), promotions: vec![promotion] }), vec![Node::leaf()]);
    let band = Node::band(single("S0", "i", true), extension);
    let tree = ScheduleTree::new(["S0"], Node::mark(Mark::Thread, mapping_filter("threads", &[("t0", 64, 0)], band)));

    let config = UserConfig::builder().thread_cfg(MappingCfg::threads(&[64]).unwrap()).build();
    let mut info = ScopInfo::new(kernel, config);
    let (ast, repo) = build_ast(&tree, &mut info).unwrap();

    let node_info = repo.get("__node_0").unwrap();
    assert_eq!(node_info.build.promotion("A").unwrap().offsets, vec![Expr::var("t0")]);
    assert!(node_info.build.promotion("B").is_none());

    // Both reads of A land in the buffer, relative to the thread's offset.
    let stmt = GpuEmitter::new(&info, &repo).emit(&ast).unwrap();
    let Stmt::Attr { key, body, .. } = &stmt else { panic!("expected launch attribute, got {stmt}") };
    assert_eq!(key, "thread_extent");
    let Stmt::Provide { tensor, value, .. } = body.as_ref() else { panic!("expected store, got {body}") };
    assert_eq!(tensor, "B");
    let mut loads = loaded(value);
    loads.sort();
    assert_eq!(loads, vec![("A_shared".into(), vec![Expr::int(0)]), ("A_shared".into(), vec![Expr::int(1)])]);
}
