//! Emission tests on hand-built ASTs.

use polygpu_dtype::{MemType, ScalarDType};
use polygpu_ir::mapping::{CfgKind, MappingCfg, CONV_H_W};
use polygpu_ir::test::fixtures;
use polygpu_ir::tree::{Promotion, SyntheticKind};
use polygpu_ir::{BufferDefInfo, Expr, ForKind, Mark, ReduceMark, ReduceOp, ScopInfo, Stmt, UserConfig};
use strum::IntoEnumIterator;
use test_case::test_case;

use crate::ast::AstNode;
use crate::error::Error;
use crate::gpu_emitter::{GpuAxis, GpuEmitter};
use crate::node_info::{NodeInfo, NodeInfoRepo};
use crate::test::helpers::{attrs, calls, eval, loaded, node, provides, provides_to, repo, synthetic};

fn stencil_info(config: UserConfig) -> ScopInfo {
    let (kernel, _) = fixtures::stencil(16);
    ScopInfo::new(kernel, config)
}

fn emit(info: &ScopInfo, repo: &NodeInfoRepo, ast: &AstNode) -> Stmt {
    GpuEmitter::new(info, repo).emit(ast).unwrap()
}

/// `B[i] = A[i] + A[i + 1]` at `i`.
fn s0(i: Expr) -> NodeInfo {
    node("S0", &[("i", i)])
}

fn store_index(stmt: &Stmt) -> &Expr {
    match stmt {
        Stmt::Provide { indices, .. } => &indices[0],
        other => panic!("expected store, got {other}"),
    }
}

#[test]
fn test_axis_names() {
    let names: Vec<String> = GpuAxis::iter().map(|a| a.to_string()).collect();
    assert_eq!(names, ["blockIdx.x", "blockIdx.y", "blockIdx.z", "threadIdx.x", "threadIdx.y", "threadIdx.z"]);
    assert_eq!("threadIdx.y".parse::<GpuAxis>().unwrap(), GpuAxis::ThreadY);
    assert!(GpuAxis::BlockZ.is_block());
    assert!(!GpuAxis::ThreadX.is_block());
}

// ============================================================================
// LOOPS
// ============================================================================

#[test]
fn test_strided_loop_normalized() {
    let info = stencil_info(UserConfig::default());
    let repo = repo([("u", s0(Expr::var("c0")))]);
    let ast = AstNode::for_loop("c0", Expr::int(2), Expr::var("c0").le(10), 3, AstNode::user("u"));

    let Stmt::For { var, min, extent, kind, body } = emit(&info, &repo, &ast) else { panic!("expected loop") };
    assert_eq!(var, "c0");
    assert_eq!(min, Expr::int(0));
    assert_eq!(extent, Expr::int(3));
    assert_eq!(kind, ForKind::Serial);
    let visited: Vec<_> = (0..3).map(|c| eval(store_index(&body), &[("c0", c)])).collect();
    assert_eq!(visited, vec![Some(2), Some(5), Some(8)]);
}

#[test]
fn test_unit_stride_loop_keeps_init() {
    let info = stencil_info(UserConfig::default());
    let repo = repo([("u", s0(Expr::var("c0")))]);
    let ast = AstNode::for_loop("c0", Expr::int(4), Expr::var("c0").lt(12), 1, AstNode::user("u"));

    let Stmt::For { min, extent, body, .. } = emit(&info, &repo, &ast) else { panic!("expected loop") };
    assert_eq!((min, extent), (Expr::int(4), Expr::int(8)));
    assert_eq!(store_index(&body), &Expr::var("c0"));
}

#[test]
fn test_zero_stride_rejected() {
    let info = stencil_info(UserConfig::default());
    let repo = repo([("u", s0(Expr::var("c0")))]);
    let ast = AstNode::for_loop("c0", Expr::int(0), Expr::var("c0").lt(8), 0, AstNode::user("u"));

    let err = GpuEmitter::new(&info, &repo).emit(&ast).unwrap_err();
    assert_eq!(err, Error::ZeroStride { iterator: "c0".into() });
}

#[test]
fn test_unsupported_loop_condition_rejected() {
    let info = stencil_info(UserConfig::default());
    let repo = repo([("u", s0(Expr::var("c0")))]);
    let ast = AstNode::for_loop("c0", Expr::int(0), Expr::var("c0").eq_to(8), 1, AstNode::user("u"));

    let err = GpuEmitter::new(&info, &repo).emit(&ast).unwrap_err();
    assert!(matches!(err, Error::LoopCondition { ref iterator, .. } if iterator == "c0"));
}

#[test_case(4, ForKind::Unrolled ; "within limit")]
#[test_case(8, ForKind::Serial ; "beyond limit")]
fn test_unroll_mark(extent: i64, expected: ForKind) {
    let info = stencil_info(UserConfig::default());
    let repo = repo([("u", s0(Expr::var("c0")))]);
    let ast = AstNode::for_loop("c0", Expr::int(0), Expr::var("c0").lt(extent), 1, AstNode::user("u"));

    let Stmt::For { kind, .. } = emit(&info, &repo, &AstNode::mark(Mark::Unroll(4), ast.clone())) else { panic!("expected loop") };
    assert_eq!(kind, expected);
    // Outside the mark every loop stays serial.
    let Stmt::For { kind, .. } = emit(&info, &repo, &ast) else { panic!("expected loop") };
    assert_eq!(kind, ForKind::Serial);
}

#[test]
fn test_missing_node_info() {
    let info = stencil_info(UserConfig::default());
    let err = GpuEmitter::new(&info, &NodeInfoRepo::new()).emit(&AstNode::user("__node_9")).unwrap_err();
    assert_eq!(err, Error::MissingNodeInfo { annotation: "__node_9".into() });
}

// ============================================================================
// CONDITIONALS
// ============================================================================

#[test]
fn test_conditions_fold() {
    let info = stencil_info(UserConfig::builder().thread_cfg(MappingCfg::threads(&[16]).unwrap()).build());
    let repo = repo([("u", s0(Expr::int(1))), ("v", s0(Expr::int(2)))]);

    let always = AstNode::If { cond: None, then_node: Box::new(AstNode::user("u")), else_node: None };
    assert!(matches!(emit(&info, &repo, &always), Stmt::Provide { .. }));

    let taken = AstNode::guard(Expr::int(0).lt(1), AstNode::user("u"));
    assert!(matches!(emit(&info, &repo, &taken), Stmt::Provide { .. }));

    let dead = AstNode::guard(Expr::int(3).lt(1), AstNode::user("u"));
    assert_eq!(emit(&info, &repo, &dead), Stmt::NoOp);

    let otherwise = AstNode::If {
        cond: Some(Expr::int(3).lt(1)),
        then_node: Box::new(AstNode::user("u")),
        else_node: Some(Box::new(AstNode::user("v"))),
    };
    assert_eq!(store_index(&emit(&info, &repo, &otherwise)), &Expr::int(2));

    let runtime = AstNode::guard(Expr::var("t0").lt(10), AstNode::user("u"));
    let stmt = emit(&info, &repo, &runtime);
    let Stmt::Attr { node, body, .. } = &stmt else { panic!("expected launch attribute") };
    assert_eq!(node, "threadIdx.x");
    let Stmt::IfThenElse { cond, .. } = body.as_ref() else { panic!("expected conditional") };
    assert_eq!(cond, &GpuAxis::ThreadX.var().lt(10));
}

// ============================================================================
// PROMOTED BUFFERS
// ============================================================================

/// Realize, copy-in, barrier and one statement, the realize carrying `promotions`.
fn copy_block(promotions: Vec<Promotion>) -> (NodeInfoRepo, AstNode) {
    let mut realize = synthetic("realize_A_shared_0", SyntheticKind::Realize { tensor: "A_shared".into() }, &[]);
    realize.build.promotions = promotions;
    let read = SyntheticKind::Read { tensor: "A".into(), promoted: "A_shared".into(), offsets: vec![Expr::int(4)] };
    let read = synthetic("read_A_shared_1", read, &[("a0", Expr::int(3))]);
    let sync = synthetic("sync_2", SyntheticKind::Sync, &[]);
    let repo = repo([("r", realize), ("c", read), ("s", sync), ("u", s0(Expr::int(0)))]);
    let ast = AstNode::block(["r", "c", "s", "u"].map(AstNode::user));
    (repo, ast)
}

#[test]
fn test_realize_wraps_following_siblings() {
    let mut info = stencil_info(UserConfig::default());
    let mut def = BufferDefInfo::new("A", MemType::Shared, ScalarDType::Float32);
    def.sizes = vec![17];
    info.analysis.buffer_defs.push(def);
    let (repo, ast) = copy_block(Vec::new());

    let stmt = emit(&info, &repo, &ast);
    let Stmt::Attr { node, key, value, body } = &stmt else { panic!("expected realize scope, got {stmt}") };
    assert_eq!((node.as_str(), key.as_str(), value), ("A_shared", "realize_scope", &Expr::str("shared")));
    let Stmt::Realize { tensor, bounds, body } = body.as_ref() else { panic!("expected realize") };
    assert_eq!(tensor, "A_shared");
    assert_eq!(bounds, &vec![(Expr::int(0), Expr::int(17))]);
    let Stmt::Block(stmts) = body.as_ref() else { panic!("expected block") };
    assert_eq!(stmts.len(), 3);

    // Copy-in, barrier, then the statement.
    assert_eq!(attrs(&stmts[0], "gm_read_flag").len(), 1);
    assert_eq!(provides(&stmts[0]), vec![&Stmt::provide("A_shared", vec![Expr::int(3)], Expr::load("A", vec![Expr::int(7)]))]);
    assert_eq!(calls(&stmts[1], "tvm_storage_sync"), vec![&[Expr::str("shared")][..]]);
    assert_eq!(provides_to(&stmts[2], "B").len(), 1);
}

#[test]
fn test_realize_falls_back_to_promotion_extents() {
    let info = stencil_info(UserConfig::default());
    let promotion = Promotion { tensor: "A".into(), promoted: "A_shared".into(), offsets: vec![Expr::int(0)], extents: vec![5] };
    let (repo, ast) = copy_block(vec![promotion]);

    let stmt = emit(&info, &repo, &ast);
    assert!(matches!(&stmt, Stmt::Attr { value, .. } if *value == Expr::str("shared")));
    let realizes = stmt.collect(|s| matches!(s, Stmt::Realize { .. }));
    assert!(matches!(realizes[0], Stmt::Realize { bounds, .. } if *bounds == vec![(Expr::int(0), Expr::int(5))]));
}

#[test]
fn test_realize_without_description_fails() {
    let info = stencil_info(UserConfig::default());
    let (repo, ast) = copy_block(Vec::new());
    let err = GpuEmitter::new(&info, &repo).emit(&ast).unwrap_err();
    assert_eq!(err, Error::UnknownBuffer { name: "A_shared".into() });
}

#[test]
fn test_promoted_accesses_redirected() {
    let info = stencil_info(UserConfig::default());
    let mut user = s0(Expr::int(6));
    user.build.promotions.push(Promotion { tensor: "A".into(), promoted: "A_shared".into(), offsets: vec![Expr::int(4)], extents: vec![8] });
    user.build.promotions.push(Promotion { tensor: "B".into(), promoted: "B_shared".into(), offsets: vec![Expr::int(6)], extents: vec![1] });
    let repo = repo([("u", user)]);

    let stmt = emit(&info, &repo, &AstNode::user("u"));
    let Stmt::Provide { tensor, indices, value } = &stmt else { panic!("expected store, got {stmt}") };
    assert_eq!(tensor, "B_shared");
    assert_eq!(indices, &vec![Expr::int(0)]);
    let mut loads = loaded(value);
    loads.sort();
    assert_eq!(loads, vec![("A_shared".into(), vec![Expr::int(2)]), ("A_shared".into(), vec![Expr::int(3)])]);
}

#[test]
fn test_temporary_not_written_back() {
    let (kernel, _) = fixtures::fused_reduce(16, 64);
    let info = ScopInfo::new(kernel, UserConfig::default());
    let write = |tensor: &str| SyntheticKind::Write { tensor: tensor.into(), promoted: format!("{tensor}_shared"), offsets: vec![Expr::int(0)] };
    let repo = repo([
        ("b", synthetic("write_B_shared_3", write("B"), &[("a0", Expr::int(2))])),
        ("c", synthetic("write_C_shared_4", write("C"), &[("a0", Expr::int(2))])),
    ]);

    let stmt = emit(&info, &repo, &AstNode::block([AstNode::user("b"), AstNode::user("c")]));
    assert!(provides_to(&stmt, "B").is_empty());
    assert_eq!(provides(&stmt), vec![&Stmt::provide("C", vec![Expr::int(2)], Expr::load("C_shared", vec![Expr::int(2)]))]);

    // B is scratch: realized in global memory around the body.
    let Stmt::Attr { node, key, value, body } = &stmt else { panic!("expected realize scope, got {stmt}") };
    assert_eq!((node.as_str(), key.as_str(), value), ("B", "realize_scope", &Expr::str("")));
    assert!(matches!(body.as_ref(), Stmt::Realize { tensor, .. } if tensor == "B"));
}

// ============================================================================
// ATOMICS AND REDUCTIONS
// ============================================================================

#[test]
fn test_atomic_store() {
    let info = stencil_info(UserConfig::default());
    let repo = repo([("u", s0(Expr::int(5)))]);

    let stmt = emit(&info, &repo, &AstNode::mark(Mark::Atomic(ReduceOp::Sum), AstNode::user("u")));
    assert!(provides(&stmt).is_empty());
    let args = calls(&stmt, "atomic_add");
    assert_eq!(args.len(), 1);
    assert_eq!(args[0][0], Expr::call("tvm_address_of", vec![Expr::load("B", vec![Expr::int(5)])]));
}

#[test]
fn test_reduce_calls_use_promoted_buffer() {
    let (kernel, _) = fixtures::row_reduce(16, 1024);
    let info = ScopInfo::new(kernel, UserConfig::default());
    let mark = ReduceMark { op: ReduceOp::Sum, stmt: "S1".into(), id: 0 };
    let mut update = synthetic("reduce_update_SumOp_S1_0", SyntheticKind::ReduceUpdate(mark.clone()), &[]);
    update.build.promotions.push(Promotion { tensor: "B".into(), promoted: "B_shared".into(), offsets: vec![Expr::int(0)], extents: vec![1] });
    let repo = repo([("i", synthetic("reduce_init_SumOp_S1_0", SyntheticKind::ReduceInit(mark), &[])), ("u", update)]);

    let stmt = emit(&info, &repo, &AstNode::block([AstNode::user("i"), AstNode::user("u")]));
    assert_eq!(calls(&stmt, "reduce_init"), vec![&[Expr::str("SumOp"), Expr::str("B")][..]]);
    assert_eq!(calls(&stmt, "reduce_update"), vec![&[Expr::str("SumOp"), Expr::str("B_shared"), Expr::str("B")][..]]);
}

// ============================================================================
// HARDWARE IDS
// ============================================================================

#[test]
fn test_one_dim_threads() {
    let config = UserConfig::builder().one_dim_thread(true).thread_cfg(MappingCfg::threads(&[16, 4]).unwrap()).build();
    let info = stencil_info(config);
    let repo = repo([("u", s0(Expr::var("t1") * 16 + Expr::var("t0")))]);

    let mut emitter = GpuEmitter::new(&info, &repo);
    let stmt = emitter.emit(&AstNode::user("u")).unwrap();
    assert_eq!(emitter.launch_extents(), vec![(GpuAxis::ThreadX, 64)]);

    let Stmt::Attr { node, key, value, body } = &stmt else { panic!("expected launch attribute") };
    assert_eq!((node.as_str(), key.as_str(), value), ("threadIdx.x", "thread_extent", &Expr::int(64)));
    let Stmt::Attr { key, value, .. } = body.as_ref() else { panic!("expected origin attribute") };
    assert_eq!((key.as_str(), value), ("origin_thread_dim_x", &Expr::int(16)));

    let index = store_index(provides(&stmt)[0]).clone();
    for t in [0, 5, 17, 63] {
        assert_eq!(eval(&index, &[("threadIdx.x", t)]), Some(t));
    }
}

#[test]
fn test_unbound_id_reads_zero() {
    let info = stencil_info(UserConfig::default());
    let repo = repo([("u", s0(Expr::var("b2") + 3))]);

    let mut emitter = GpuEmitter::new(&info, &repo);
    let stmt = emitter.emit(&AstNode::user("u")).unwrap();
    assert_eq!(store_index(&stmt), &Expr::int(3));
    assert!(emitter.launch_extents().is_empty());
}

#[test]
fn test_conv_h_w_shares_block_y() {
    let config = UserConfig::builder().block_cfg(MappingCfg::blocks(&[16, 8]).unwrap()).build();
    let mut info = stencil_info(config);
    let cfg = MappingCfg::new(CfgKind::ReplaceBlocks, CONV_H_W, &[4, 2]).unwrap();
    let (h, w) = (cfg.axis_id(0), cfg.axis_id(1));
    info.analysis.replace_cfgs.insert(CONV_H_W.into(), cfg);
    let repo = repo([("h", s0(Expr::var(h))), ("w", s0(Expr::var(w)))]);

    let mut emitter = GpuEmitter::new(&info, &repo);
    let stmt = emitter.emit(&AstNode::block([AstNode::user("h"), AstNode::user("w")])).unwrap();
    assert_eq!(emitter.launch_extents(), vec![(GpuAxis::BlockY, 8)]);

    let stores = provides(&stmt);
    for y in 0..8 {
        assert_eq!(eval(store_index(stores[0]), &[("blockIdx.y", y)]), Some(y % 4));
        assert_eq!(eval(store_index(stores[1]), &[("blockIdx.y", y)]), Some(y / 4));
    }
}

#[test]
fn test_launch_attrs_blocks_outermost() {
    let config = UserConfig::builder()
        .block_cfg(MappingCfg::blocks(&[32]).unwrap())
        .thread_cfg(MappingCfg::threads(&[8, 2]).unwrap())
        .build();
    let info = stencil_info(config);
    let repo = repo([("u", s0(Expr::var("b0") * 16 + Expr::var("t1") * 8 + Expr::var("t0")))]);

    let mut emitter = GpuEmitter::new(&info, &repo);
    let stmt = emitter.emit(&AstNode::user("u")).unwrap();
    let launch = emitter.launch_extents();
    assert_eq!(launch, vec![(GpuAxis::BlockX, 32), (GpuAxis::ThreadX, 8), (GpuAxis::ThreadY, 2)]);

    let order: Vec<String> = attrs(&stmt, "thread_extent")
        .into_iter()
        .filter_map(|s| match s {
            Stmt::Attr { node, .. } => Some(node.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(order, ["blockIdx.x", "threadIdx.x", "threadIdx.y"]);
}

#[test]
fn test_kernel_without_users_is_empty() {
    let info = stencil_info(UserConfig::default());
    assert_eq!(emit(&info, &NodeInfoRepo::new(), &AstNode::block([])), Stmt::NoOp);
}
