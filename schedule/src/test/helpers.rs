//! Test utilities: driver-like pass runs and tree queries.

use polygpu_dtype::ScalarDType;
use polygpu_ir::mapping::Mapping;
use polygpu_ir::tree::{Band, BandMember, Node, NodeKind, ScheduleTree, SyntheticKind};
use polygpu_ir::{Access, AffExpr, Expr, Iter, Kernel, Mark, QuasiAff, ScopInfo, Statement, Tensor, UserConfig};

use crate::pass_mgr::{PassMgr, PassOutcome};

/// ScopInfo with the kernel flags the driver sets before scheduling.
pub fn scop_info(kernel: Kernel, config: UserConfig) -> ScopInfo {
    let mut info = ScopInfo::new(kernel, config);
    info.analysis.is_matmul = info.kernel.matmul.is_some();
    if info.analysis.is_matmul || info.kernel.conv {
        info.analysis.use_reduce_lib = false;
    }
    info
}

/// Runs the GPU pass list once; a restart request fails the test.
pub fn schedule(kernel: Kernel, tree: &ScheduleTree, config: UserConfig) -> (ScheduleTree, ScopInfo) {
    let mut info = scop_info(kernel, config);
    match PassMgr::gpu().run(tree, &mut info).expect("passes") {
        PassOutcome::Done(tree) => (tree, info),
        PassOutcome::Restart => panic!("unexpected restart"),
    }
}

pub fn count_marks(tree: &ScheduleTree, pred: impl Fn(&Mark) -> bool) -> usize {
    tree.find(|n| n.as_mark().is_some_and(&pred)).len()
}

/// Recorded mappings under marks matching `pred`.
pub fn mappings(info: &ScopInfo, pred: impl Fn(&Mark) -> bool) -> Vec<&Mapping> {
    info.analysis.mappings.iter().filter(|(m, _)| pred(m)).map(|(_, mapping)| mapping).collect()
}

/// Names of the extension statements of `kind` anywhere in the tree.
pub fn synthetic_names(tree: &ScheduleTree, kind: impl Fn(&SyntheticKind) -> bool) -> Vec<String> {
    tree.find(|n| matches!(n.kind, NodeKind::Extension(_)))
        .iter()
        .filter_map(|p| match &tree.node(p).ok()?.kind {
            NodeKind::Extension(ext) => Some(ext.stmts.iter().filter(|s| kind(&s.kind)).map(|s| s.name.clone()).collect::<Vec<_>>()),
            _ => None,
        })
        .flatten()
        .collect()
}

/// `Z[i] = sum of T[i + shift]` over every `(T, shifts)` pair, scheduled as
/// one coincident member over `i`. Each `T` is padded to hold its largest shift.
pub fn shifted_reads(n: i64, reads: &[(&str, Vec<i64>)]) -> (Kernel, ScheduleTree) {
    let i = AffExpr::var("i");
    let mut tensors = vec![Tensor::new("Z", &[n], ScalarDType::Float32)];
    let mut terms = Vec::new();
    for (tensor, shifts) in reads {
        let reach = shifts.iter().copied().max().unwrap_or(0);
        tensors.push(Tensor::new(*tensor, &[n + reach], ScalarDType::Float32));
        terms.extend(shifts.iter().map(|shift| Access::new(*tensor, [i.clone() + *shift]).to_expr()));
    }
    let value = terms.into_iter().reduce(|a, b| a + b).expect("at least one read");
    let stmt = Statement::new("S0", vec![Iter::new("i", n)], Access::new("Z", [i]), value).expect("shifted reads statement");
    let binds: Vec<String> = tensors.iter().map(|t| t.name.clone()).collect();
    let kernel = Kernel::builder()
        .name("shifted_reads")
        .tensors(tensors)
        .statements(vec![stmt])
        .binds(binds)
        .build()
        .expect("shifted reads kernel");
    let band = Band::new([BandMember::new(true).with("S0", QuasiAff::var("i"))], true);
    (kernel, ScheduleTree::new(["S0"], Node::band(band, Node::leaf())))
}
