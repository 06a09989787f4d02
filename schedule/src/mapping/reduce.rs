//! Mapping of bands carrying a library reduction.
//!
//! The reduction axis is mapped onto threads together with the parallel
//! members, and the mapped subtree is surrounded by the reduction
//! library's init and update statements:
//!
//! ```text
//! Mark(ReduceArea)
//!   Extension{init, update}
//!     Sequence
//!       Filter{init}
//!       Filter{stmts} -> Mark(Thread) -> Filter(Mapping) -> Band
//!       Filter{update}
//! ```

use polygpu_ir::scop_info::{AtomicInfo, ReduceDirection};
use polygpu_ir::tree::{Extension, NodeKind, ScheduleTree, SyntheticKind, SyntheticStmt};
use polygpu_ir::{Mark, ReduceMark, ScopInfo};
use tracing::debug;

use super::{final_mapping_number, insert_unroll, map_block_helper, map_inner_dims, need_atomic_add};
use crate::error::Result;
use crate::tree_util::{child_path, scalar_filter, wrap_extension};

pub fn map(tree: &ScheduleTree, path: &[usize], info: &mut ScopInfo) -> Result<ScheduleTree> {
    let thread_cfg = info.thread_cfg()?.clone();
    let block_cfg = info.block_cfg()?.clone();
    let mark_path = child_path(path, 0);
    let Some(Mark::Reduce(reduce)) = tree.node(&mark_path)?.as_mark().cloned() else {
        return super::map_generic(tree, path, info);
    };
    let direction = info
        .analysis
        .reduce_infos
        .get(&reduce.stmt)
        .map_or(ReduceDirection::X, |r| r.direction);

    // Threads: the point band lost its reduce mark and gains the reduction axis.
    let mut tree = tree.delete(&mark_path)?;
    let point = mark_path;
    let mut n = tree.band(&point)?.n_coincident() + 1;
    if info.analysis.use_reduce_lib && n < thread_cfg.bound() {
        n = thread_cfg.bound();
    }
    let (mapped, thread_path, n) = final_mapping_number(&tree, &point, n, thread_cfg.bound(), info.config.stitch_fusion)?;
    tree = map_inner_dims(&mapped, &thread_path, &thread_cfg, n, Mark::Thread, direction == ReduceDirection::Y, info)?;
    tree = insert_unroll(&tree, &thread_path, info)?;
    tree = insert_reduce_extension(&tree, &thread_path, &reduce)?;

    // Blocks.
    let band = tree.band(path)?;
    let n_coincident = band.n_coincident();
    let n_block_map = if info.config.enable_atomic_add {
        block_cfg.bound().min(band.n_member())
    } else {
        block_cfg.bound().min(n_coincident)
    };
    if need_atomic_add(info, band, direction, n_block_map, &block_cfg)
        && let Some(r) = info.analysis.reduce_infos.get(&reduce.stmt)
    {
        let atomic = AtomicInfo { tensor_name: r.tensor.clone(), op: r.op };
        debug!(tensor = atomic.tensor_name, op = %atomic.op, "reduction needs atomic add");
        info.analysis.record_atomic(atomic);
    }
    map_block_helper(&tree, path, &block_cfg, n_block_map, info)
}

pub fn init_name(reduce: &ReduceMark) -> String {
    format!("reduce_init_{}", reduce.suffix())
}

pub fn update_name(reduce: &ReduceMark) -> String {
    format!("reduce_update_{}", reduce.suffix())
}

/// Wraps the thread-mapped node at `path` with the init/update statements
/// of `reduce` under a `ReduceArea` mark.
fn insert_reduce_extension(tree: &ScheduleTree, path: &[usize], reduce: &ReduceMark) -> Result<ScheduleTree> {
    let init = SyntheticStmt::scalar(init_name(reduce), SyntheticKind::ReduceInit(reduce.clone()));
    let update = SyntheticStmt::scalar(update_name(reduce), SyntheticKind::ReduceUpdate(reduce.clone()));
    let before = vec![scalar_filter(&init)];
    let after = vec![scalar_filter(&update)];
    let ext = Extension { stmts: vec![init, update], promotions: Vec::new() };
    let tree = wrap_extension(tree, path, ext, before, after)?;
    Ok(tree.insert_above(path, NodeKind::Mark(Mark::ReduceArea(reduce.clone())))?)
}
