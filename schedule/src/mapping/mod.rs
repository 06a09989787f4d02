//! Block, thread and warp mapping of the outer bands.
//!
//! Every outermost band has been tiled; blocks map the tile band and threads
//! (or warps) the point band. The strategy is picked per kernel:
//!
//! - generic: leading coincident members, innermost to `x`
//! - [`reduce`]: library reductions with init/update extensions and atomic detection
//! - [`matmul`]: point band mapped on warps
//! - [`conv`]: `N`, `(H, W)` and `O` mapped on separate replacement configs
//!
//! Mapped members sit below a mark and a mapping filter:
//!
//! ```text
//! Mark(Block|Thread|Warp)
//!   Filter(Mapping)
//!     Band
//! ```

pub mod conv;
pub mod matmul;
pub mod reduce;

use polygpu_ir::mapping::{AxisBinding, Mapping, MappingCfg};
use polygpu_ir::scop_info::ReduceDirection;
use polygpu_ir::tree::{Band, Filter, NodeKind, Path, ScheduleTree};
use polygpu_ir::{Mark, ScopInfo};
use tracing::{debug, warn};

use crate::error::Result;
use crate::pass_mgr::SchedulePass;
use crate::tree_util::{child_path, outermost_bands, skip_marks, split_band};

#[derive(Debug, Default)]
pub struct MappingOuterBand;

impl SchedulePass for MappingOuterBand {
    fn name(&self) -> &'static str {
        "mapping_outer_band"
    }

    #[tracing::instrument(skip_all)]
    fn run(&mut self, tree: &ScheduleTree, info: &mut ScopInfo) -> Result<ScheduleTree> {
        let mut tree = tree.clone();
        for path in outermost_bands(&tree).into_iter().rev() {
            let point = child_path(&path, 0);
            let reduce_mark = tree.node(&point)?.as_mark().is_some_and(|m| matches!(m, Mark::Reduce(_)));

            tree = if info.kernel.conv {
                conv::map(&tree, &path, info)?
            } else if info.analysis.is_matmul {
                matmul::map(&tree, &path, info)?
            } else if reduce_mark && info.analysis.use_reduce_lib {
                reduce::map(&tree, &path, info)?
            } else {
                map_generic(&tree, &path, info)?
            };
        }
        Ok(tree)
    }
}

fn map_generic(tree: &ScheduleTree, path: &[usize], info: &mut ScopInfo) -> Result<ScheduleTree> {
    let thread_cfg = info.thread_cfg()?.clone();
    let block_cfg = info.block_cfg()?.clone();

    let point = skip_marks(tree, &child_path(path, 0));
    let mut tree = tree.clone();
    if tree.node(&point)?.is_band() {
        (tree, _) = map_thread_helper(&tree, &point, &thread_cfg, Mark::Thread, info)?;
    }
    let n_block_map = block_cfg.bound().min(tree.band(path)?.n_coincident());
    map_block_helper(&tree, path, &block_cfg, n_block_map, info)
}

/// Maps the leading coincident members of the band at `path` onto `cfg`.
///
/// Returns the tree and the path of the inserted mark, or `None` when no
/// member could be mapped.
pub fn map_thread_helper(
    tree: &ScheduleTree,
    path: &[usize],
    cfg: &MappingCfg,
    mark: Mark,
    info: &mut ScopInfo,
) -> Result<(ScheduleTree, Option<Path>)> {
    let n = tree.band(path)?.n_coincident();
    if n < 1 {
        return Ok((tree.clone(), None));
    }
    let (tree, path, n) = final_mapping_number(tree, path, n, cfg.bound(), info.config.stitch_fusion)?;
    let tree = map_inner_dims(&tree, &path, cfg, n, mark, false, info)?;
    let tree = insert_unroll(&tree, &path, info)?;
    Ok((tree, Some(path)))
}

/// Splits the band at `path` so exactly the members that will be mapped
/// stay together: members beyond the config bound go to an outer serial
/// band, members past `n` to an inner serial band.
///
/// Returns the tree, the path of the band to map and the member count.
pub fn final_mapping_number(
    tree: &ScheduleTree,
    path: &[usize],
    n: usize,
    bound: usize,
    stitch_fusion: bool,
) -> Result<(ScheduleTree, Path, usize)> {
    let mut tree = tree.clone();
    let mut path = Path::from_slice(path);
    let mut n = n;
    if bound == 0 {
        return Ok((tree, path, 0));
    }
    if n > bound {
        debug!(serial = n - bound, "leading members left serial");
        tree = split_band(&tree, &path, n - bound)?;
        path.push(0);
        n = bound;
    }
    let members = tree.band(&path)?.n_member();
    if n < members && !stitch_fusion {
        tree = split_band(&tree, &path, n)?;
    } else {
        n = members.min(bound);
    }
    Ok((tree, path, n))
}

/// Binds the `n` members of the band at `path` to the axes of `cfg`, the
/// innermost member to `x` (or the outermost when `reverse`), and records
/// the mapping.
pub fn map_inner_dims(
    tree: &ScheduleTree,
    path: &[usize],
    cfg: &MappingCfg,
    n: usize,
    mark: Mark,
    reverse: bool,
    info: &mut ScopInfo,
) -> Result<ScheduleTree> {
    let bindings = (0..n)
        .map(|axis| AxisBinding {
            axis: cfg.axis_id(axis),
            extent: cfg.extent(axis),
            member: if reverse { axis } else { n - 1 - axis },
        })
        .collect();
    insert_mapping(tree, path, Mapping { cfg: cfg.name.clone(), bindings }, mark, info)
}

/// Maps the outermost `n_block_map` members of the band at `path` onto
/// `cfg`, innermost to `x`. A non-permutable band is left alone.
pub fn map_block_helper(
    tree: &ScheduleTree,
    path: &[usize],
    cfg: &MappingCfg,
    n_block_map: usize,
    info: &mut ScopInfo,
) -> Result<ScheduleTree> {
    let band = tree.band(path)?;
    if !band.permutable {
        warn!(path = ?path, "band is not permutable, blocks left unmapped");
        return Ok(tree.clone());
    }
    let n = n_block_map.min(band.n_member()).min(cfg.bound());
    if n == 0 {
        return Ok(tree.clone());
    }
    let bindings = (0..n)
        .map(|axis| AxisBinding { axis: cfg.axis_id(axis), extent: cfg.extent(axis), member: n - 1 - axis })
        .collect();
    insert_mapping(tree, path, Mapping { cfg: cfg.name.clone(), bindings }, Mark::Block, info)
}

fn insert_mapping(tree: &ScheduleTree, path: &[usize], mapping: Mapping, mark: Mark, info: &mut ScopInfo) -> Result<ScheduleTree> {
    debug!(%mark, cfg = mapping.cfg, axes = ?mapping.axes().collect::<Vec<_>>(), "mapping band");
    let tree = tree
        .insert_above(path, NodeKind::Filter(Filter::Mapping(mapping.clone())))?
        .insert_above(path, NodeKind::Mark(mark.clone()))?;
    info.analysis.record_mapping(mark, mapping);
    Ok(tree)
}

/// Adds an unroll mark below a band mapped at `mark_path`.
fn insert_unroll(tree: &ScheduleTree, mark_path: &[usize], info: &ScopInfo) -> Result<ScheduleTree> {
    if info.config.max_unroll_loop == 1 {
        return Ok(tree.clone());
    }
    let below = child_path(&child_path(&child_path(mark_path, 0), 0), 0);
    Ok(tree.insert_above(&below, NodeKind::Mark(Mark::Unroll(info.config.max_unroll_loop)))?)
}

/// Whether blocks mapping a reduction axis force the result through atomics.
///
/// Block axes are walked from the one bound to the first non-coincident
/// member outwards, in config order `bound - j - 1`; any extent above 1
/// splits the reduction across blocks. A single coincident member reduced
/// along x is an all-reduce and every block axis counts.
pub fn need_atomic_add(
    info: &ScopInfo,
    band: &Band,
    direction: ReduceDirection,
    n_block_map: usize,
    block_cfg: &MappingCfg,
) -> bool {
    if !info.analysis.use_reduce_lib || !info.config.enable_atomic_add {
        return false;
    }
    let mut start = band.n_coincident();
    if band.n_member() == 1 && direction == ReduceDirection::X && start == 1 {
        start = 0;
    }
    if n_block_map < start {
        return false;
    }
    let bound = block_cfg.bound();
    (start..bound).any(|j| block_cfg.extent(bound - j - 1) > 1)
}
