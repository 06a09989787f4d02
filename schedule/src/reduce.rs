//! Reduction detection and isolation.
//!
//! Every supported reduction statement is moved into a filter of its own,
//! between the statements it depends on and the statements depending on it,
//! and its band is marked with a [`Mark::Reduce`]. Sibling bands that only
//! lost parallelism because of the fused reduction are then rescheduled.

use std::collections::BTreeSet;

use polygpu_ir::scop_info::{ReduceDirection, ReduceInfo};
use polygpu_ir::tree::{Filter, Node, NodeKind, Path, ScheduleTree};
use polygpu_ir::{Kernel, Mark, ReduceMark, ScopInfo, Statement};
use tracing::debug;

use crate::dependence::with_recomputed_coincidence;
use crate::error::Result;
use crate::pass_mgr::SchedulePass;
use crate::tree_util::{child_path, outermost_bands, project, replace_band, skip_marks};

#[derive(Debug, Default)]
pub struct AnalyzeReduce;

impl SchedulePass for AnalyzeReduce {
    fn name(&self) -> &'static str {
        "analyze_reduce"
    }

    #[tracing::instrument(skip_all)]
    fn run(&mut self, tree: &ScheduleTree, info: &mut ScopInfo) -> Result<ScheduleTree> {
        if !info.analysis.use_reduce_lib {
            return Ok(tree.clone());
        }

        let reductions: Vec<_> = info
            .kernel
            .reductions()
            .filter(|(_, op)| op.is_supported())
            .map(|(stmt, op)| (stmt.name.clone(), op, stmt.write.tensor.clone(), direction(stmt)))
            .collect();

        let mut tree = tree.clone();
        for (stmt, op, tensor, direction) in reductions {
            let Some((isolated, band)) = isolate(&tree, &info.kernel, &stmt)? else {
                debug!(stmt, "reduction left in place");
                continue;
            };
            let mark = ReduceMark { op, stmt: stmt.clone(), id: info.ctx.next_reduce_id() };
            tree = isolated.insert_above(&band, NodeKind::Mark(Mark::Reduce(mark.clone())))?;
            debug!(stmt, mark = %Mark::Reduce(mark.clone()), ?direction, "reduction isolated");
            info.analysis.reduce_infos.insert(stmt.clone(), ReduceInfo { stmt, op, tensor, direction, mark: Some(mark) });

            if band.len() >= 2
                && let Some(rescheduled) = reschedule_siblings(&tree, &info.kernel, &band[..band.len() - 2])?
            {
                tree = rescheduled;
            }
        }
        Ok(tree)
    }
}

/// X when the reduction runs along the innermost iterator.
pub fn direction(stmt: &Statement) -> ReduceDirection {
    let last = stmt.domain.last().map(|it| it.name.as_str());
    match stmt.reduction_axes().last() {
        Some(axis) if Some(axis.name.as_str()) == last => ReduceDirection::X,
        _ => ReduceDirection::Y,
    }
}

/// Moves `stmt` out of its outermost band into a filter of its own. Returns
/// the rewritten tree and the path of the band now scheduling only `stmt`.
fn isolate(tree: &ScheduleTree, kernel: &Kernel, stmt: &str) -> Result<Option<(ScheduleTree, Path)>> {
    let Some(path) = outermost_bands(tree).into_iter().find(|p| tree.band(p).is_ok_and(|b| b.statements().contains(stmt)))
    else {
        return Ok(None);
    };
    let band = tree.band(&path)?;
    if !band.permutable {
        debug!(stmt, "band is not permutable");
        return Ok(None);
    }
    let members: BTreeSet<String> = band.statements().into_iter().map(str::to_string).collect();
    if members.len() == 1 {
        return Ok(Some((tree.clone(), path)));
    }

    // Everything reachable from the reduction runs after it.
    let mut after: BTreeSet<String> = BTreeSet::new();
    loop {
        let grown = kernel.dependences.iter().filter(|d| {
            (d.source == stmt || after.contains(&d.source)) && d.sink != stmt && members.contains(&d.sink) && !after.contains(&d.sink)
        });
        let grown: Vec<String> = grown.map(|d| d.sink.clone()).collect();
        if grown.is_empty() {
            break;
        }
        after.extend(grown);
    }
    if kernel.dependences.iter().any(|d| d.sink == stmt && after.contains(&d.source)) {
        debug!(stmt, "cyclic dependence through the reduction");
        return Ok(None);
    }
    let before: BTreeSet<String> = members.iter().filter(|s| *s != stmt && !after.contains(*s)).cloned().collect();

    let node = tree.node(&path)?;
    let mut children = Vec::new();
    let mut reduce_idx = 0;
    for group in [before, BTreeSet::from([stmt.to_string()]), after] {
        if group.is_empty() {
            continue;
        }
        if group.contains(stmt) {
            reduce_idx = children.len();
        }
        if let Some(projected) = project(node, &group) {
            children.push(Node::filter(group, projected));
        }
    }
    let tree = tree.replace(&path, Node::sequence(children))?;
    let mut band = child_path(&path, reduce_idx);
    band.push(0);
    Ok(Some((tree, band)))
}

/// Marks bands of non-reduction siblings fully coincident when their own
/// dependences allow it. `None` leaves the tree as it was.
fn reschedule_siblings(tree: &ScheduleTree, kernel: &Kernel, seq: &[usize]) -> Result<Option<ScheduleTree>> {
    let node = tree.node(seq)?;
    if !matches!(node.kind, NodeKind::Sequence) {
        return Ok(None);
    }

    let mut out: Option<ScheduleTree> = None;
    for idx in 0..node.children.len() {
        let filter = child_path(seq, idx);
        let cur = out.as_ref().unwrap_or(tree);
        if !matches!(cur.node(&filter)?.kind, NodeKind::Filter(Filter::Statements(_))) {
            continue;
        }
        let first = child_path(&filter, 0);
        if cur.node(&first)?.as_mark().is_some_and(|m| matches!(m, Mark::Reduce(_))) {
            continue;
        }
        let band_path = skip_marks(cur, &first);
        let Ok(band) = cur.band(&band_path) else { continue };
        if band.n_coincident() == band.n_member() {
            continue;
        }
        let rescheduled = with_recomputed_coincidence(kernel, band)?;
        if rescheduled.n_coincident() == rescheduled.n_member() {
            debug!(filter = ?filter, "sibling rescheduled as fully parallel");
            out = Some(replace_band(cur, &band_path, rescheduled)?);
        }
    }
    Ok(out)
}
