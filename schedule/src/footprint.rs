//! Tensor footprints below a schedule node and access coalescing.
//!
//! With the outer schedule dimensions fixed, every statement iterator spans
//! a box ([`prefix_ranges`]); an affine access maps that box to a box of
//! tensor elements. The boxes of all accesses to one tensor are merged into
//! a [`TensorFootprintCluster`] whose offsets are expressions over the outer
//! dimensions `c<k>`.

use std::collections::{BTreeMap, BTreeSet};

use polygpu_ir::aff::{prefix_ranges, Interval};
use polygpu_ir::mapping::{AxisId, Mapping};
use polygpu_ir::tree::{Filter, NodeKind, ScheduleTree};
use polygpu_ir::{Access, Expr, Kernel, TensorFootprintCluster};
use tracing::trace;

use crate::error::Result;
use crate::tree_util::{child_path, find_marks, local_schedule};

/// Largest box whose points are enumerated to decide injectivity.
const ENUMERATION_LIMIT: i64 = 4096;

/// Iterator box: offset over the outer dimensions and extent, per iterator.
type Ranges = BTreeMap<String, (Expr, i64)>;

#[derive(Debug, Clone, PartialEq)]
struct AccessBox {
    offsets: Vec<Expr>,
    extents: Vec<i64>,
}

/// Footprint of `tensor` over the statements active at `path`; `None` when
/// none of them touches it.
pub fn footprint(tree: &ScheduleTree, path: &[usize], kernel: &Kernel, tensor: &str) -> Result<Option<TensorFootprintCluster>> {
    let shape = &kernel.tensor(tensor)?.shape;
    let mut merged: Option<AccessBox> = None;
    let mut boxes = Vec::new();
    let mut cluster = TensorFootprintCluster {
        tensor: tensor.to_string(),
        offsets: Vec::new(),
        extents: Vec::new(),
        accesses: Vec::new(),
        reused: false,
        read: false,
        written: false,
    };

    for name in tree.active_statements(path) {
        let Ok(stmt) = kernel.statement(&name) else { continue };
        let dims = local_schedule(tree, path, &name);
        let ranges = prefix_ranges(&stmt.domain, &dims);

        for access in stmt.reads().iter().filter(|a| a.tensor == tensor) {
            cluster.read = true;
            add_access(&mut cluster, &mut boxes, &name, access, &ranges);
        }
        if stmt.write.tensor == tensor {
            cluster.written = true;
            add_access(&mut cluster, &mut boxes, &name, &stmt.write, &ranges);
        }
    }
    if cluster.accesses.is_empty() {
        return Ok(None);
    }

    for b in &boxes {
        merged = Some(match merged {
            None => b.clone(),
            Some(m) => union(&m, b, shape),
        });
    }
    if let Some(m) = merged {
        cluster.offsets = m.offsets;
        cluster.extents = m.extents.iter().zip(shape.iter()).map(|(e, s)| (*e).min(*s)).collect();
    }
    cluster.reused = cluster.reused || boxes_overlap(&boxes);
    trace!(tensor, extents = ?cluster.extents, reused = cluster.reused, "footprint");
    Ok(Some(cluster))
}

fn add_access(cluster: &mut TensorFootprintCluster, boxes: &mut Vec<AccessBox>, stmt: &str, access: &Access, ranges: &Ranges) {
    let pair = (stmt.to_string(), access.clone());
    if cluster.accesses.contains(&pair) {
        return;
    }
    cluster.reused = cluster.reused || !is_injective(access, ranges);
    boxes.push(access_box(access, ranges));
    cluster.accesses.push(pair);
}

/// Elements of the tensor `access` reaches over the iterator box.
fn access_box(access: &Access, ranges: &Ranges) -> AccessBox {
    let mut offsets = Vec::with_capacity(access.indices.len());
    let mut extents = Vec::with_capacity(access.indices.len());
    for index in &access.indices {
        let mut offset = Expr::Int(index.constant_term());
        let mut span = Interval::point(0);
        for (name, coeff) in index.terms() {
            let (base, extent) = ranges.get(name).cloned().unwrap_or((Expr::Int(0), 1));
            offset = offset + base * coeff;
            let reach = coeff * (extent - 1);
            span.lo += reach.min(0);
            span.hi += reach.max(0);
        }
        offsets.push((offset + span.lo).simplify());
        extents.push(span.size());
    }
    AccessBox { offsets, extents }
}

/// Smallest box containing both; a dimension whose offsets differ by a
/// non-constant amount spans the whole tensor.
fn union(a: &AccessBox, b: &AccessBox, shape: &[i64]) -> AccessBox {
    let mut out = AccessBox { offsets: Vec::new(), extents: Vec::new() };
    for dim in 0..a.offsets.len() {
        let diff = (b.offsets[dim].clone() - a.offsets[dim].clone()).simplify();
        match diff.as_int() {
            Some(d) => {
                let lo = d.min(0);
                let hi = (a.extents[dim] - 1).max(d + b.extents[dim] - 1);
                out.offsets.push((a.offsets[dim].clone() + lo).simplify());
                out.extents.push(hi - lo + 1);
            }
            None => {
                out.offsets.push(Expr::Int(0));
                out.extents.push(shape.get(dim).copied().unwrap_or(1));
            }
        }
    }
    out
}

fn boxes_overlap(boxes: &[AccessBox]) -> bool {
    let overlap = |a: &AccessBox, b: &AccessBox| {
        a.offsets.iter().zip(&b.offsets).zip(a.extents.iter().zip(&b.extents)).all(|((oa, ob), (ea, eb))| {
            match (ob.clone() - oa.clone()).simplify().as_int() {
                Some(d) => d < *ea && -d < *eb,
                None => false,
            }
        })
    };
    boxes.iter().enumerate().any(|(i, a)| boxes[i + 1..].iter().any(|b| overlap(a, b)))
}

/// Whether distinct points of the iterator box reach distinct elements.
fn is_injective(access: &Access, ranges: &Ranges) -> bool {
    let free: Vec<(&str, i64)> = ranges.iter().filter(|(_, (_, e))| *e > 1).map(|(n, (_, e))| (n.as_str(), *e)).collect();
    if free.is_empty() {
        return true;
    }
    let matrix: Vec<Vec<i64>> = access.indices.iter().map(|idx| free.iter().map(|(n, _)| idx.coeff(n)).collect()).collect();

    let points = free.iter().try_fold(1i64, |acc, (_, e)| acc.checked_mul(*e).filter(|p| *p <= ENUMERATION_LIMIT));
    match points {
        Some(_) => enumerate_injective(&matrix, &free),
        None => rank(&matrix) == free.len(),
    }
}

fn enumerate_injective(matrix: &[Vec<i64>], free: &[(&str, i64)]) -> bool {
    let mut seen = BTreeSet::new();
    let mut point = vec![0i64; free.len()];
    loop {
        let image: Vec<i64> = matrix.iter().map(|row| row.iter().zip(&point).map(|(c, x)| c * x).sum()).collect();
        if !seen.insert(image) {
            return false;
        }
        // Odometer step.
        let mut k = 0;
        loop {
            if k == point.len() {
                return true;
            }
            point[k] += 1;
            if point[k] < free[k].1 {
                break;
            }
            point[k] = 0;
            k += 1;
        }
    }
}

/// Rank by fraction-free elimination.
fn rank(matrix: &[Vec<i64>]) -> usize {
    let mut rows: Vec<Vec<i128>> = matrix.iter().map(|r| r.iter().map(|v| i128::from(*v)).collect()).collect();
    let cols = rows.first().map_or(0, Vec::len);
    let mut rank = 0;
    for col in 0..cols {
        let Some(pivot) = (rank..rows.len()).find(|&r| rows[r][col] != 0) else { continue };
        rows.swap(rank, pivot);
        for r in 0..rows.len() {
            if r != rank && rows[r][col] != 0 {
                let (p, f) = (rows[rank][col], rows[r][col]);
                for c in 0..cols {
                    rows[r][c] = rows[r][c] * p - rows[rank][c] * f;
                }
            }
        }
        rank += 1;
    }
    rank
}

/// Whether consecutive threads along `x` touch consecutive elements of
/// `tensor` in every thread-mapped subtree.
///
/// Only the innermost tensor dimension is compared: a step of one element
/// there is coalesced whatever the outer dimensions do between rows.
pub fn is_coalesced(tree: &ScheduleTree, kernel: &Kernel, tensor: &str) -> Result<bool> {
    for mark in find_marks(tree, polygpu_ir::Mark::is_thread_level) {
        let filter = child_path(&mark, 0);
        let NodeKind::Filter(Filter::Mapping(mapping)) = &tree.node(&filter)?.kind else { continue };
        let band_path = child_path(&filter, 0);
        let Ok(band) = tree.band(&band_path) else { continue };
        let Some(member) = innermost_mapped(mapping) else { continue };
        let Some(member) = band.members.get(member) else { continue };

        for name in tree.active_statements(&band_path) {
            let Ok(stmt) = kernel.statement(&name) else { continue };
            let Some(q) = member.get(&name) else { continue };
            if q.is_constant() {
                continue;
            }
            for access in stmt.accesses().filter(|a| a.tensor == tensor) {
                let Some((iter, step)) = q.unit_step(&stmt.domain) else {
                    return Ok(false);
                };
                let delta: Vec<i64> = access.indices.iter().map(|idx| idx.coeff(&iter) * step).collect();
                let Some((last, outer)) = delta.split_last() else { continue };
                if *last != 1 || outer.iter().any(|d| *d != 0) {
                    trace!(tensor, stmt = name, ?delta, "non-coalesced access");
                    return Ok(false);
                }
            }
        }
    }
    Ok(true)
}

/// Member bound to axis 0.
fn innermost_mapped(mapping: &Mapping) -> Option<usize> {
    mapping.bindings.iter().find(|b| AxisId::parse(&b.axis).is_some_and(|id| id.index() == 0)).map(|b| b.member)
}
