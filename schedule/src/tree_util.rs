//! Queries and structural edits over the schedule tree shared by the passes.

use std::collections::BTreeSet;
use std::sync::Arc;

use polygpu_ir::aff::QuasiAff;
use polygpu_ir::tree::{Band, Extension, Filter, Node, NodeKind, Path, ScheduleTree, SyntheticStmt};
use polygpu_ir::{Expr, Mark};

use crate::error::Result;

/// Name of the loop iterator of schedule dimension `depth`.
pub fn dim_var(depth: usize) -> String {
    format!("c{depth}")
}

/// Paths of the bands with no band ancestor, pre-order.
pub fn outermost_bands(tree: &ScheduleTree) -> Vec<Path> {
    tree.find(Node::is_band)
        .into_iter()
        .filter(|path| !tree.ancestors(path).iter().any(|n| n.is_band()))
        .collect()
}

/// First band in pre-order.
pub fn outer_band(tree: &ScheduleTree) -> Option<Path> {
    tree.find(Node::is_band).into_iter().next()
}

/// Paths of mark nodes matching `pred`, pre-order.
pub fn find_marks(tree: &ScheduleTree, pred: impl Fn(&Mark) -> bool) -> Vec<Path> {
    tree.find(|n| n.as_mark().is_some_and(&pred))
}

/// Follows single-child mark nodes down from `path`.
pub fn skip_marks(tree: &ScheduleTree, path: &[usize]) -> Path {
    let mut path = Path::from_slice(path);
    while tree.node(&path).is_ok_and(|n| n.as_mark().is_some() && n.children.len() == 1) {
        path.push(0);
    }
    path
}

pub fn child_path(path: &[usize], idx: usize) -> Path {
    let mut out = Path::from_slice(path);
    out.push(idx);
    out
}

/// Splits the band at `path` after `pos` members; the inner band ends up at `path + [0]`.
pub fn split_band(tree: &ScheduleTree, path: &[usize], pos: usize) -> Result<ScheduleTree> {
    let node = tree.node(path)?;
    let (outer, inner) = tree.band(path)?.split(pos)?;
    let inner = Node { kind: NodeKind::Band(inner), children: node.children.clone() };
    Ok(tree.replace(path, Node::band(outer, inner))?)
}

/// Tiles the band at `path`; the point band ends up at `path + [0]`.
pub fn tile_band(tree: &ScheduleTree, path: &[usize], sizes: &[i64]) -> Result<ScheduleTree> {
    let node = tree.node(path)?;
    let (tile, point) = tree.band(path)?.tile(sizes)?;
    let point = Node { kind: NodeKind::Band(point), children: node.children.clone() };
    Ok(tree.replace(path, Node::band(tile, point))?)
}

/// Splits every band straddling schedule depth `depth` so that a node starts
/// exactly at that depth, and returns the paths of those nodes.
///
/// Depth 0 inserts an empty band below the root so the whole tree hangs
/// below a single point.
pub fn split_at_depth(tree: &ScheduleTree, depth: usize) -> Result<(ScheduleTree, Vec<Path>)> {
    if depth == 0 {
        let tree = tree.insert_above(&[0], NodeKind::Band(Band::new([], true)))?;
        return Ok((tree, vec![Path::from_slice(&[0, 0])]));
    }

    let targets: Vec<(Path, usize, usize)> = tree
        .find(Node::is_band)
        .into_iter()
        .filter_map(|path| {
            let start = tree.schedule_depth(&path);
            let members = tree.band(&path).ok()?.n_member();
            (start < depth && depth <= start + members).then_some((path, start, members))
        })
        .collect();

    let mut tree = tree.clone();
    let mut points = Vec::with_capacity(targets.len());
    // Later paths first so earlier ones stay valid.
    for (path, start, members) in targets.into_iter().rev() {
        if depth < start + members {
            tree = split_band(&tree, &path, depth - start)?;
        }
        points.push(child_path(&path, 0));
    }
    points.reverse();
    Ok((tree, points))
}

/// Member schedules of `stmt` above `path`, paired with the value of their
/// schedule dimension (`c<k>`). Depths not scheduling `stmt` are skipped.
pub fn local_schedule(tree: &ScheduleTree, path: &[usize], stmt: &str) -> Vec<(QuasiAff, Expr)> {
    tree.prefix_schedule(path, stmt)
        .into_iter()
        .enumerate()
        .filter_map(|(depth, q)| q.map(|q| (q, Expr::var(dim_var(depth)))))
        .collect()
}

/// Restriction of the subtree `node` to `stmts`; `None` when nothing remains.
pub fn project(node: &Node, stmts: &BTreeSet<String>) -> Option<Node> {
    let project_child = |node: &Node| node.child(0).and_then(|c| project(c, stmts));
    match &node.kind {
        NodeKind::Leaf => Some(Node::leaf()),
        NodeKind::Band(band) => {
            let members: Vec<_> = band
                .members
                .iter()
                .map(|m| {
                    let mut m = m.clone();
                    m.schedule.retain(|s, _| stmts.contains(s));
                    m
                })
                .collect();
            let child = project_child(node)?;
            if members.iter().all(|m| m.schedule.is_empty()) {
                return Some(child);
            }
            Some(Node::band(Band::new(members, band.permutable), child))
        }
        NodeKind::Filter(Filter::Statements(own)) => {
            let kept: BTreeSet<String> = own.intersection(stmts).cloned().collect();
            if kept.is_empty() {
                return None;
            }
            Some(Node::filter(kept, project_child(node)?))
        }
        NodeKind::Sequence | NodeKind::Set => {
            let mut children: Vec<Node> = node.children.iter().filter_map(|c| project(c, stmts)).collect();
            match children.len() {
                0 => None,
                // A lone filter covering every projected statement is redundant.
                1 if matches!(&children[0].kind, NodeKind::Filter(Filter::Statements(s)) if s == stmts) => {
                    children.remove(0).child(0).cloned()
                }
                _ => Some(Node::new(node.kind.clone(), children)),
            }
        }
        _ => Some(project_child(node)?.wrap(node.kind.clone())),
    }
}

/// Filter running one scalar synthetic statement.
pub fn scalar_filter(stmt: &SyntheticStmt) -> Node {
    Node::filter([stmt.name.clone()], Node::leaf())
}

/// Places the node at `path` in a sequence between `before` and `after`,
/// under an extension introducing `ext`.
pub fn wrap_extension(tree: &ScheduleTree, path: &[usize], ext: Extension, before: Vec<Node>, after: Vec<Node>) -> Result<ScheduleTree> {
    let node = tree.node(path)?.clone();
    let active = tree.active_statements(path);

    let mut children = before;
    children.push(Node::filter(active, node));
    children.extend(after);
    Ok(tree.replace(path, Node::sequence(children).wrap(NodeKind::Extension(ext)))?)
}

/// Inserts `kind` above the node at `path` and returns the tree plus the
/// path of the original node.
pub fn insert_above(tree: &ScheduleTree, path: &[usize], kind: NodeKind) -> Result<(ScheduleTree, Path)> {
    Ok((tree.insert_above(path, kind)?, child_path(path, 0)))
}

/// Replaces the band at `path` keeping its children.
pub fn replace_band(tree: &ScheduleTree, path: &[usize], band: Band) -> Result<ScheduleTree> {
    let children: Vec<Arc<Node>> = tree.node(path)?.children.clone();
    Ok(tree.replace(path, Node { kind: NodeKind::Band(band), children })?)
}
