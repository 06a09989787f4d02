//! Batch matmul mapping: the point band is distributed over warps and the
//! operands are promoted at dedicated marks above it.

use polygpu_ir::mapping::{CfgKind, MappingCfg, WARP_COMPUTE};
use polygpu_ir::tree::{NodeKind, ScheduleTree};
use polygpu_ir::{Mark, ScopInfo};

use super::{final_mapping_number, map_block_helper, map_inner_dims};
use crate::error::Result;
use crate::tree_util::{child_path, skip_marks};

pub const WARP_SIZE: i64 = 32;

/// Warp layout: the user's, or every warp of the thread config along `x`.
pub fn warp_cfg(info: &ScopInfo) -> Result<MappingCfg> {
    let extents = match &info.config.warp_cfg {
        Some(extents) => extents.clone(),
        None => vec![(info.thread_cfg()?.total() / WARP_SIZE).max(1)],
    };
    Ok(MappingCfg::new(CfgKind::ReplaceThreads, WARP_COMPUTE, &extents)?)
}

pub fn map(tree: &ScheduleTree, path: &[usize], info: &mut ScopInfo) -> Result<ScheduleTree> {
    let block_cfg = info.block_cfg()?.clone();
    let warps = warp_cfg(info)?;
    info.analysis.replace_cfgs.insert(warps.name.clone(), warps.clone());

    let point = skip_marks(tree, &child_path(path, 0));
    let mut tree = tree.clone();
    if tree.node(&point)?.is_band() {
        let n = tree.band(&point)?.n_coincident();
        if n > 0 {
            let (split, warp_path, n) = final_mapping_number(&tree, &point, n, warps.bound(), info.config.stitch_fusion)?;
            tree = map_inner_dims(&split, &warp_path, &warps, n, Mark::Warp, true, info)?;
        }
        let top = child_path(path, 0);
        tree = tree
            .insert_above(&top, NodeKind::Mark(Mark::PromoteGlobalToSharedAb))?
            .insert_above(&top, NodeKind::Mark(Mark::PromoteGlobalToSharedC))?;
    }

    let n_block_map = block_cfg.bound().min(tree.band(path)?.n_coincident());
    map_block_helper(&tree, path, &block_cfg, n_block_map, info)
}
