//! Outer-band tiling and derivation of block/thread configs.
//!
//! Each outermost band is tiled once: blocks later map the tile band and
//! threads the point band. A reduction mark sitting on the band moves down
//! to the point band, which is where the reduction is mapped.

use polygpu_ir::aff::Interval;
use polygpu_ir::mapping::{CfgKind, MappingCfg, BLOCKS_CFG, THREADS_CFG};
use polygpu_ir::tree::{Band, Path, ScheduleTree};
use polygpu_ir::{Kernel, Mark, ScopInfo};
use tracing::debug;

use crate::dependence::with_recomputed_coincidence;
use crate::error::Result;
use crate::pass_mgr::SchedulePass;
use crate::tree_util::{child_path, outermost_bands, replace_band, tile_band};

/// Threads per block when the thread config is derived.
pub const MAX_THREADS: i64 = 256;
const MAX_GRID_X: i64 = (1 << 31) - 1;
const MAX_GRID_YZ: i64 = 65535;

#[derive(Debug, Default)]
pub struct TileOuterBand;

impl SchedulePass for TileOuterBand {
    fn name(&self) -> &'static str {
        "tile_outer_band"
    }

    #[tracing::instrument(skip_all, fields(relax = info.analysis.relax_coincidence))]
    fn run(&mut self, tree: &ScheduleTree, info: &mut ScopInfo) -> Result<ScheduleTree> {
        let mut tree = tree.clone();
        let bands = outermost_bands(&tree);

        for path in &bands {
            let reduce = under_reduce_mark(&tree, path);
            let band = tree.band(path)?;
            if info.analysis.relax_coincidence {
                let band = with_recomputed_coincidence(&info.kernel, band)?;
                tree = replace_band(&tree, path, band)?;
            } else if band.n_member() > 0 && band.n_coincident() == 0 && !reduce {
                debug!(path = ?path, "outer band has no parallel member");
                info.analysis.need_restart = true;
                return Ok(tree);
            }
        }

        derive_configs(&tree, &bands, info)?;

        for path in bands.iter().rev() {
            let reduce = under_reduce_mark(&tree, path);
            let band = tree.band(path)?;
            let sizes = match &info.config.tile_sizes {
                Some(sizes) => sizes.clone(),
                None => derived_tile_sizes(band, mappable_members(band, reduce && info.analysis.use_reduce_lib), thread_extents(info)),
            };
            debug!(path = ?path, ?sizes, "tiling outer band");
            tree = tile_at(&tree, path, &sizes)?;
        }
        Ok(tree)
    }
}

fn under_reduce_mark(tree: &ScheduleTree, path: &[usize]) -> bool {
    path.split_last()
        .and_then(|(_, parent)| tree.node(parent).ok())
        .and_then(|n| n.as_mark())
        .is_some_and(|m| matches!(m, Mark::Reduce(_)))
}

/// Tiles the band at `path`, keeping a reduction mark directly above the point band.
fn tile_at(tree: &ScheduleTree, path: &[usize], sizes: &[i64]) -> Result<ScheduleTree> {
    if !under_reduce_mark(tree, path) {
        return tile_band(tree, path, sizes);
    }
    let Some((_, mark_path)) = path.split_last() else {
        return tile_band(tree, path, sizes);
    };
    let mark = tree.node(mark_path)?.kind.clone();
    let tiled = tile_band(&tree.delete(mark_path)?, mark_path, sizes)?;
    Ok(tiled.insert_above(&child_path(mark_path, 0), mark)?)
}

/// Leading members threads may map: the coincident ones, plus the reduction
/// axis of a band reduced through the library.
fn mappable_members(band: &Band, library_reduce: bool) -> usize {
    let n = band.n_coincident();
    if library_reduce { (n + 1).min(band.n_member()) } else { n }
}

fn thread_extents(info: &ScopInfo) -> Vec<i64> {
    if info.analysis.is_matmul
        && let Some(warps) = &info.config.warp_cfg
    {
        return warps.clone();
    }
    info.config.thread_cfg.as_ref().map(|c| c.extents().to_vec()).unwrap_or_default()
}

/// The `k`-th innermost mappable member gets the `k`-th thread extent, all
/// other members 1.
pub fn derived_tile_sizes(band: &Band, mappable: usize, threads: Vec<i64>) -> Vec<i64> {
    let mut sizes = vec![1; band.n_member()];
    for (member, extent) in (0..mappable).rev().zip(threads) {
        sizes[member] = extent;
    }
    sizes
}

/// Hull of the member's range over the statements it schedules.
pub fn member_range(kernel: &Kernel, band: &Band, member: usize) -> Result<Interval> {
    let mut out: Option<Interval> = None;
    for (stmt, q) in &band.members[member].schedule {
        let domain = &kernel.statement(stmt)?.domain;
        if let Some(r) = q.range(domain) {
            out = Some(out.map_or(r, |o| o.hull(&r)));
        }
    }
    Ok(out.unwrap_or(Interval::point(0)))
}

fn needs_derivation(cfg: &Option<MappingCfg>) -> bool {
    cfg.as_ref().is_none_or(|c| c.total() == 1)
}

/// Fills in block and thread configs the user left out (or the restart reset)
/// from the widest outer band.
fn derive_configs(tree: &ScheduleTree, bands: &[Path], info: &mut ScopInfo) -> Result<()> {
    let (derive_threads, derive_blocks) = (needs_derivation(&info.config.thread_cfg), needs_derivation(&info.config.block_cfg));
    if !derive_threads && !derive_blocks {
        return Ok(());
    }
    let Some(path) = bands.iter().rev().max_by_key(|p| tree.band(p).map_or(0, Band::n_member)) else {
        return Ok(());
    };
    let band = tree.band(path)?;
    let reduce = under_reduce_mark(tree, path) && info.analysis.use_reduce_lib;
    let ranges: Vec<i64> = (0..band.n_member()).map(|m| member_range(&info.kernel, band, m).map(|r| r.size())).collect::<Result<_>>()?;

    if derive_threads {
        let mut budget = MAX_THREADS;
        let mut extents = Vec::new();
        for member in (0..mappable_members(band, reduce)).rev().take(3) {
            if budget <= 1 {
                break;
            }
            let extent = ranges[member].clamp(1, budget);
            budget /= extent;
            extents.push(extent);
        }
        if extents.is_empty() {
            extents.push(1);
        }
        info.config.thread_cfg = Some(MappingCfg::new(CfgKind::Threads, THREADS_CFG, &extents)?);
    }

    if derive_blocks {
        let sizes = match &info.config.tile_sizes {
            Some(sizes) => sizes.clone(),
            None => derived_tile_sizes(band, mappable_members(band, reduce), thread_extents(info)),
        };
        let tiles: Vec<i64> = ranges
            .iter()
            .enumerate()
            .map(|(m, r)| {
                let size = sizes.get(m).copied().unwrap_or(1).max(1);
                (r + size - 1) / size
            })
            .collect();
        let extents: Vec<i64> = if info.kernel.conv && tiles.len() >= 4 {
            vec![tiles[3], tiles[1] * tiles[2], tiles[0]]
        } else {
            tiles.iter().take(band.n_coincident().min(3)).rev().copied().collect()
        };
        let extents: Vec<i64> = extents
            .into_iter()
            .enumerate()
            .map(|(axis, e)| e.clamp(1, if axis == 0 { MAX_GRID_X } else { MAX_GRID_YZ }))
            .collect();
        let extents = if extents.is_empty() { vec![1] } else { extents };
        info.config.block_cfg = Some(MappingCfg::new(CfgKind::Blocks, BLOCKS_CFG, &extents)?);
    }

    debug!(
        threads = %info.config.thread_cfg.as_ref().map(ToString::to_string).unwrap_or_default(),
        blocks = %info.config.block_cfg.as_ref().map(ToString::to_string).unwrap_or_default(),
        "derived mapping configs"
    );
    Ok(())
}
