//! Promotion of tensor footprints into shared memory.
//!
//! At every node starting at the promotion depth, the footprint of each
//! candidate tensor is measured and, when worthwhile and within budget,
//! copied into a `<tensor>_shared` buffer around the subtree:
//!
//! ```text
//! Extension{realize, reads, syncs, writes; promotions}
//!   Sequence
//!     Filter{realize_A_shared_0}
//!     Filter{read_A_shared_1} -> Band[cc0, cc1]
//!     Filter{sync_2}
//!     Filter{<active statements>} -> <original subtree>
//!     Filter{sync_3}
//!     Filter{write_B_shared_4} -> Band[cc0]
//! ```
//!
//! Copy bands are then mapped onto threads and a context node records the
//! block and thread extents.

use std::collections::BTreeSet;

use polygpu_dtype::MemType;
use polygpu_ir::aff::{Interval, Iter, QuasiAff};
use polygpu_ir::config::ADVANCED_SHARED_MEMORY_SIZE;
use polygpu_ir::mapping::{CfgKind, MappingCfg, PROMOTE_PREFIX};
use polygpu_ir::scop_info::BufferDefInfo;
use polygpu_ir::tree::{
    Context, Extension, Filter, Node, NodeKind, Path, Promotion, ScheduleTree, SyntheticKind, SyntheticStmt,
};
use polygpu_ir::{Band, BandMember, Mark, ReduceOp, ScopInfo, TensorFootprintCluster};
use tracing::{debug, info};

use crate::error::Result;
use crate::footprint::{footprint, is_coalesced};
use crate::mapping::{final_mapping_number, map_inner_dims, map_thread_helper};
use crate::pass_mgr::SchedulePass;
use crate::tree_util::{child_path, find_marks, outer_band, scalar_filter, split_at_depth, tile_band, wrap_extension};

/// Innermost extent padded to in bank-conflict mode.
const BANK_CONFLICT_WIDTH: i64 = 33;
const BANKS: i64 = 32;
/// Extra innermost elements of a promoted matmul accumulator.
pub const MATMUL_C_PAD: i64 = 8;

#[derive(Debug, Default)]
pub struct SharedMemoryManager {
    remaining: usize,
    bank_conflict: bool,
    next_stmt: usize,
}

impl SchedulePass for SharedMemoryManager {
    fn name(&self) -> &'static str {
        "shared_memory_manager"
    }

    #[tracing::instrument(skip_all, fields(depth = ?info.config.shared_depth))]
    fn run(&mut self, tree: &ScheduleTree, info: &mut ScopInfo) -> Result<ScheduleTree> {
        if !info.config.use_shared_memory {
            return Ok(tree.clone());
        }
        self.bank_conflict = info.config.bank_conflict || info.kernel.transpose;
        self.remaining = if info.analysis.is_matmul { ADVANCED_SHARED_MEMORY_SIZE } else { info.config.shared_memory_size };

        let tree = if info.analysis.is_matmul { self.promote_matmul(tree, info)? } else { self.promote_at_depth(tree, info)? };
        let tree = map_copies_to_threads(&tree, info)?;
        insert_context(&tree, info)
    }
}

impl SharedMemoryManager {
    /// Bytes left for further promotions.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    fn promote_at_depth(&mut self, tree: &ScheduleTree, info: &mut ScopInfo) -> Result<ScheduleTree> {
        let (depth, use_config) = promotion_depth(tree, info)?;
        debug!(depth, use_config, "promotion depth");

        let (mut tree, points) = split_at_depth(tree, depth)?;
        for point in points.iter().rev() {
            if !use_config && tree.has_ancestor_mark(point, Mark::is_thread_level) {
                debug!(point = ?point, "promotion point below threads");
                continue;
            }
            let candidates = candidates(info, &tree.active_statements(point));
            tree = self.promote_at(&tree, point, candidates, info)?;
        }
        Ok(tree)
    }

    /// Matmul operands are promoted at their dedicated marks, `A` and `B`
    /// first, the accumulator only when configured.
    fn promote_matmul(&mut self, tree: &ScheduleTree, info: &mut ScopInfo) -> Result<ScheduleTree> {
        let Some(matmul) = info.kernel.matmul.clone() else {
            return Ok(tree.clone());
        };
        let mut tree = tree.clone();
        for mark in find_marks(&tree, |m| matches!(m, Mark::PromoteGlobalToSharedAb)).into_iter().rev() {
            let point = child_path(&mark, 0);
            let mut set = candidates(info, &tree.active_statements(&point));
            set.remove(&matmul.c);
            tree = self.promote_at(&tree, &point, set, info)?;
        }
        if info.config.shared_tensors.contains(&matmul.c) {
            // The accumulator gets a budget of its own.
            self.remaining = ADVANCED_SHARED_MEMORY_SIZE;
            for mark in find_marks(&tree, |m| matches!(m, Mark::PromoteGlobalToSharedC)).into_iter().rev() {
                let point = child_path(&mark, 0);
                tree = self.promote_at(&tree, &point, BTreeSet::from([matmul.c.clone()]), info)?;
            }
        }
        Ok(tree)
    }

    /// First-fit promotion of `candidates` at `point`, in name order.
    fn promote_at(&mut self, tree: &ScheduleTree, point: &[usize], candidates: BTreeSet<String>, info: &mut ScopInfo) -> Result<ScheduleTree> {
        let reduce_tensors = info.analysis.reduce_tensors();
        let mut accepted = Vec::new();

        for tensor in candidates {
            let Some(cluster) = footprint(tree, point, &info.kernel, &tensor)? else {
                continue;
            };
            if cluster.extents.is_empty() {
                return Err(polygpu_ir::error::ScalarPromotionSnafu { tensor }.build().into());
            }
            if !cluster.is_valid() {
                debug!(tensor, "invalid footprint");
                continue;
            }

            let mut extents = cluster.extents.clone();
            if info.analysis.is_matmul
                && info.kernel.matmul.as_ref().is_some_and(|m| m.c == tensor)
                && let Some(last) = extents.last_mut()
            {
                *last += MATMUL_C_PAD;
            }
            let sizes = padded_sizes(&extents, self.bank_conflict, info.config.shared_vector_align);
            let bytes = sizes.iter().product::<i64>().max(0) as usize * info.bytes(&tensor)?;
            let reduce = info.analysis.use_reduce_lib && (reduce_tensors.contains(&tensor) || info.analysis.atomic_op(&tensor).is_some());
            let coalesced = is_coalesced(tree, &info.kernel, &tensor)?;
            let worthwhile = reduce || cluster.reused || !coalesced || info.analysis.is_matmul || info.kernel.transpose;
            if !worthwhile {
                debug!(tensor, "promotion brings nothing");
                continue;
            }
            if bytes >= self.remaining {
                debug!(tensor, bytes, remaining = self.remaining, "footprint exceeds shared memory budget");
                continue;
            }
            self.remaining -= bytes;
            debug!(tensor, ?sizes, bytes, remaining = self.remaining, reused = cluster.reused, coalesced, "promoted to shared memory");
            record_promotion(info, &cluster, &sizes)?;
            accepted.push((cluster, sizes, info.analysis.atomic_op(&tensor)));
        }

        if accepted.is_empty() {
            return Ok(tree.clone());
        }
        self.insert_copies(tree, point, accepted)
    }

    fn next_name(&mut self, prefix: &str) -> String {
        let name = format!("{prefix}_{}", self.next_stmt);
        self.next_stmt += 1;
        name
    }

    fn insert_copies(&mut self, tree: &ScheduleTree, point: &[usize], accepted: Vec<(TensorFootprintCluster, Vec<i64>, Option<ReduceOp>)>) -> Result<ScheduleTree> {
        let mut ext = Extension::default();
        let (mut realizes, mut reads, mut writes) = (Vec::new(), Vec::new(), Vec::new());

        for (cluster, sizes, atomic) in accepted {
            let promoted = MemType::Shared.promoted_name(&cluster.tensor);
            let realize = SyntheticStmt::scalar(self.next_name(&format!("realize_{promoted}")), SyntheticKind::Realize { tensor: promoted.clone() });
            realizes.push(scalar_filter(&realize));
            ext.stmts.push(realize);

            let domain: Vec<Iter> = cluster.extents.iter().enumerate().map(|(k, e)| Iter::new(format!("cc{k}"), *e)).collect();
            // Atomic outputs accumulate partial results from zero.
            if cluster.read && atomic.is_none() {
                let kind = SyntheticKind::Read { tensor: cluster.tensor.clone(), promoted: promoted.clone(), offsets: cluster.offsets.clone() };
                let stmt = SyntheticStmt { name: self.next_name(&format!("read_{promoted}")), kind, domain: domain.iter().cloned().collect() };
                reads.push(copy_node(&stmt));
                ext.stmts.push(stmt);
            }
            if cluster.written {
                let kind = SyntheticKind::Write { tensor: cluster.tensor.clone(), promoted: promoted.clone(), offsets: cluster.offsets.clone() };
                let stmt = SyntheticStmt { name: self.next_name(&format!("write_{promoted}")), kind, domain: domain.into() };
                writes.push(copy_node(&stmt));
                ext.stmts.push(stmt);
            }
            ext.promotions.push(Promotion { tensor: cluster.tensor, promoted, offsets: cluster.offsets, extents: sizes });
        }

        let mut before = realizes;
        if !reads.is_empty() {
            before.extend(reads);
            let sync = SyntheticStmt::scalar(self.next_name("sync"), SyntheticKind::Sync);
            before.push(scalar_filter(&sync));
            ext.stmts.push(sync);
        }
        let mut after = Vec::new();
        if !writes.is_empty() {
            let sync = SyntheticStmt::scalar(self.next_name("sync"), SyntheticKind::Sync);
            after.push(scalar_filter(&sync));
            ext.stmts.push(sync);
            after.extend(writes);
        }
        wrap_extension(tree, point, ext, before, after)
    }
}

/// Schedule depth of the promotion points and whether the user chose it.
///
/// By default promotion happens one dimension below the block-mapped ones,
/// within the outer band.
pub fn promotion_depth(tree: &ScheduleTree, info: &ScopInfo) -> Result<(usize, bool)> {
    if let Some(depth) = info.config.shared_depth {
        return Ok((depth, true));
    }
    let members = match outer_band(tree) {
        Some(path) => tree.band(&path)?.n_member(),
        None => 0,
    };
    Ok(((info.block_cfg()?.bound() + 1).min(members), false))
}

/// Read-only tensors of `active`, configured tensors, outputs of active
/// library reductions (atomic ones included) and the matmul operands.
///
/// A reduction output is only a candidate where its reduction statement
/// runs; its initialization writes the global tensor directly.
pub fn candidates(info: &ScopInfo, active: &BTreeSet<String>) -> BTreeSet<String> {
    let mut set = info.kernel.read_only_tensors(active.iter().map(String::as_str));
    set.extend(info.config.shared_tensors.iter().filter(|t| info.kernel.tensors.contains_key(*t)).cloned());
    if info.analysis.use_reduce_lib {
        let reductions = info.analysis.reduce_infos.values().filter(|r| active.contains(&r.stmt));
        set.extend(reductions.map(|r| r.tensor.clone()));
    }
    if let Some(matmul) = &info.kernel.matmul {
        set.extend([matmul.a.clone(), matmul.b.clone()]);
    }
    set
}

/// Buffer shape for a footprint: an even innermost extent is padded to an
/// odd one (straight to 33 below 32 in bank-conflict mode), then rounded up
/// to the vector alignment.
pub fn padded_sizes(extents: &[i64], bank_conflict: bool, vector_align: usize) -> Vec<i64> {
    let mut sizes = extents.to_vec();
    if let Some(last) = sizes.last_mut() {
        if *last % 2 == 0 {
            *last = if bank_conflict && *last < BANKS { BANK_CONFLICT_WIDTH } else { *last + 1 };
        }
        let align = vector_align as i64;
        if align > 1 {
            *last = (*last + align - 1) / align * align;
        }
    }
    sizes
}

fn record_promotion(info: &mut ScopInfo, cluster: &TensorFootprintCluster, sizes: &[i64]) -> Result<()> {
    let dtype = info.kernel.tensor(&cluster.tensor)?.dtype;
    let analysis = &mut info.analysis;
    match analysis.buffer_defs.iter_mut().find(|b| b.tensor_id == cluster.tensor) {
        Some(def) => {
            def.sizes = def.sizes.iter().zip(sizes).map(|(a, b)| *a.max(b)).collect();
        }
        None => {
            let mut def = BufferDefInfo::new(&cluster.tensor, MemType::Shared, dtype);
            def.sizes = sizes.to_vec();
            def.footprints_cluster = Some(cluster.clone());
            def.find_buffer = true;
            analysis.promoted_binds.push((def.tensor_id.clone(), def.dst_tensor_id.clone()));
            analysis.buffer_defs.push(def);
        }
    }
    analysis.active_buffer_footprints.push((cluster.tensor.clone(), cluster.clone()));
    analysis.shared_tensor_bits.insert(cluster.tensor.clone(), dtype.bits());
    Ok(())
}

fn copy_node(stmt: &SyntheticStmt) -> Node {
    let members = stmt.domain.iter().map(|it| BandMember::new(true).with(stmt.name.clone(), QuasiAff::var(it.name.clone())));
    Node::filter([stmt.name.clone()], Node::band(Band::new(members, true), Node::leaf()))
}

// ============================================================================
// COPY MAPPING
// ============================================================================

/// Maps every copy band onto threads, innermost member to `x`.
fn map_copies_to_threads(tree: &ScheduleTree, info: &mut ScopInfo) -> Result<ScheduleTree> {
    let copies: Vec<(Path, SyntheticStmt)> = tree
        .find(|n| matches!(n.kind, NodeKind::Filter(Filter::Statements(_))) && n.child(0).is_some_and(Node::is_band))
        .into_iter()
        .filter_map(|path| {
            let NodeKind::Filter(Filter::Statements(stmts)) = &tree.node(&path).ok()?.kind else { return None };
            let mut names = stmts.iter();
            let (Some(name), None) = (names.next(), names.next()) else { return None };
            let stmt = tree.synthetic_statements(&path).remove(name)?;
            matches!(stmt.kind, SyntheticKind::Read { .. } | SyntheticKind::Write { .. }).then_some((path, stmt))
        })
        .collect();

    let mut tree = tree.clone();
    for (filter, stmt) in copies.into_iter().rev() {
        let (tensor, write) = match &stmt.kind {
            SyntheticKind::Read { tensor, .. } => (tensor.clone(), false),
            SyntheticKind::Write { tensor, .. } => (tensor.clone(), true),
            _ => continue,
        };
        let mut band_path = child_path(&filter, 0);
        if write && info.analysis.is_matmul {
            tree = tree.insert_above(&band_path, NodeKind::Mark(Mark::PromoteSharedToGlobal))?;
            band_path.push(0);
        }

        let vector = vector_width(info, &tensor, &stmt)?;
        let mark = if info.config.one_dim_thread || vector > 1 {
            if vector > 1 {
                let mut sizes = vec![1; stmt.domain.len()];
                if let Some(last) = sizes.last_mut() {
                    *last = vector;
                }
                tree = tile_band(&tree, &band_path, &sizes)?;
                tree = tree.insert_above(&child_path(&band_path, 0), NodeKind::Mark(Mark::PromoteVectorization))?;
                debug!(tensor, vector, "vectorized copy");
            }
            let cfg = promote_cfg(tree.band(&band_path)?, &stmt, &tensor, info)?;
            info.analysis.replace_cfgs.insert(cfg.name.clone(), cfg.clone());
            let n = tree.band(&band_path)?.n_member();
            let (split, path, n) = final_mapping_number(&tree, &band_path, n, cfg.bound(), false)?;
            tree = map_inner_dims(&split, &path, &cfg, n, Mark::Thread, false, info)?;
            Some(path)
        } else {
            let thread_cfg = info.thread_cfg()?.clone();
            let (mapped, mark) = map_thread_helper(&tree, &band_path, &thread_cfg, Mark::Thread, info)?;
            tree = mapped;
            mark
        };

        if write
            && let Some(op) = info.analysis.atomic_op(&tensor)
            && let Some(mark) = mark
        {
            let band = child_path(&child_path(&mark, 0), 0);
            tree = tree.insert_above(&band, NodeKind::Mark(Mark::Atomic(op)))?;
            info!(tensor, %op, "copy-out is atomic");
        }
    }
    Ok(tree)
}

/// Elements per vectorized copy load; 1 when vectorization does not apply.
fn vector_width(info: &ScopInfo, tensor: &str, stmt: &SyntheticStmt) -> Result<i64> {
    let bits = info.kernel.tensor(tensor)?.dtype.bits();
    if info.config.vector_load_bits == 0 || bits == 0 {
        return Ok(1);
    }
    let width = (info.config.vector_load_bits / bits) as i64;
    let last = stmt.domain.last().map_or(1, |it| it.extent);
    Ok(if width > 1 && last % width == 0 { width } else { 1 })
}

/// `promote_<tensor>` config spreading the total thread count over the copy
/// band, innermost member first.
///
/// The last mapped member, or the first one whose range covers what is left,
/// takes all remaining threads, so the extents always multiply to the thread
/// total and the decoded ids stay within their axes.
fn promote_cfg(band: &Band, stmt: &SyntheticStmt, tensor: &str, info: &ScopInfo) -> Result<MappingCfg> {
    let mut remaining = info.thread_cfg()?.total();
    let members: Vec<&BandMember> = band.members.iter().rev().take(3).collect();
    let mut extents = Vec::with_capacity(members.len());
    for (i, member) in members.iter().enumerate() {
        let range = member.get(&stmt.name).and_then(|q| q.range(&stmt.domain)).map_or(1, |r: Interval| r.size()).max(1);
        if range >= remaining || i + 1 == members.len() {
            extents.push(remaining);
            break;
        }
        remaining /= range;
        extents.push(range);
    }
    if extents.is_empty() {
        extents.push(remaining);
    }
    Ok(MappingCfg::new(CfgKind::ReplaceThreads, format!("{PROMOTE_PREFIX}{tensor}"), &extents)?)
}

/// Context node bounding every block and thread id.
fn insert_context(tree: &ScheduleTree, info: &ScopInfo) -> Result<ScheduleTree> {
    let mut bounds = Vec::new();
    for cfg in [info.block_cfg()?, info.thread_cfg()?] {
        bounds.extend((0..cfg.bound()).map(|i| (cfg.axis_id(i), cfg.extent(i))));
    }
    Ok(tree.insert_above(&[0], NodeKind::Context(Context { bounds }))?)
}
