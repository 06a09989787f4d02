//! Convolution mapping over an `(N, H, W, O, ...)` tile band.
//!
//! `N` goes to block `z`, `H` and `W` share block `y` and `O` takes block
//! `x`, each through its own replacement config so the emitter can rebuild
//! the ids from the three hardware block indices.

use polygpu_ir::mapping::{CfgKind, MappingCfg, CONV_H_W, CONV_N, CONV_O};
use polygpu_ir::tree::ScheduleTree;
use polygpu_ir::{Mark, ScopInfo};
use snafu::ensure;
use tracing::debug;

use super::{map_block_helper, map_thread_helper};
use crate::error::*;
use crate::tile::member_range;
use crate::tree_util::{child_path, skip_marks, split_band};

pub fn map(tree: &ScheduleTree, path: &[usize], info: &mut ScopInfo) -> Result<ScheduleTree> {
    let thread_cfg = info.thread_cfg()?.clone();
    let block_cfg = info.block_cfg()?.clone();
    let members = tree.band(path)?.n_member();
    ensure!(members >= 4, ConvBandSnafu { members });

    let point = skip_marks(tree, &child_path(path, 0));
    let mut tree = tree.clone();
    if tree.node(&point)?.is_band() {
        (tree, _) = map_thread_helper(&tree, &point, &thread_cfg, Mark::Thread, info)?;
    }

    let (block_x, block_y, block_z) = (block_cfg.extent(0), block_cfg.extent(1), block_cfg.extent(2));

    // N
    let conv_n = MappingCfg::new(CfgKind::ReplaceBlocks, CONV_N, &[block_z])?;
    tree = split_band(&tree, path, 1)?;
    tree = map_block_helper(&tree, path, &conv_n, 1, info)?;

    // H, W
    let hw_path = child_path(&child_path(&child_path(path, 0), 0), 0);
    let extent_h = member_range(&info.kernel, tree.band(&hw_path)?, 0)?.size();
    let bind_h = extent_h.min(block_y).max(1);
    let conv_h_w = MappingCfg::new(CfgKind::ReplaceBlocks, CONV_H_W, &[(block_y / bind_h).max(1), bind_h])?;
    tree = split_band(&tree, &hw_path, 2)?;
    tree = map_block_helper(&tree, &hw_path, &conv_h_w, 2, info)?;

    // O
    let o_path = child_path(&child_path(&child_path(&hw_path, 0), 0), 0);
    let conv_o = MappingCfg::new(CfgKind::ReplaceBlocks, CONV_O, &[block_x])?;
    tree = map_block_helper(&tree, &o_path, &conv_o, 1, info)?;

    debug!(%conv_n, %conv_h_w, %conv_o, "convolution blocks mapped");
    for cfg in [conv_n, conv_h_w, conv_o] {
        info.analysis.replace_cfgs.insert(cfg.name.clone(), cfg);
    }
    Ok(tree)
}
