//! Persistent schedule tree.
//!
//! Nodes are shared through `Arc`; every edit rebuilds only the spine from
//! the root to the edited node and returns a new [`ScheduleTree`]. A failed
//! edit leaves the original tree untouched.
//!
//! Nodes are addressed by [`Path`]s, the child indices from the root.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use smallvec::SmallVec;
use snafu::{OptionExt, ensure};

use crate::aff::{Iter, QuasiAff};
use crate::error::*;
use crate::expr::Expr;
use crate::mapping::Mapping;
use crate::mark::{Mark, ReduceMark};

pub type Path = SmallVec<[usize; 8]>;

// ============================================================================
// BANDS
// ============================================================================

/// One schedule dimension: a quasi-affine schedule per statement.
#[derive(Debug, Clone, PartialEq)]
pub struct BandMember {
    pub schedule: BTreeMap<String, QuasiAff>,
    pub coincident: bool,
}

impl BandMember {
    pub fn new(coincident: bool) -> Self {
        Self { schedule: BTreeMap::new(), coincident }
    }

    pub fn with(mut self, stmt: impl Into<String>, schedule: QuasiAff) -> Self {
        self.schedule.insert(stmt.into(), schedule);
        self
    }

    pub fn get(&self, stmt: &str) -> Option<&QuasiAff> {
        self.schedule.get(stmt)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Band {
    pub members: SmallVec<[BandMember; 4]>,
    pub permutable: bool,
}

impl Band {
    pub fn new(members: impl IntoIterator<Item = BandMember>, permutable: bool) -> Self {
        Self { members: members.into_iter().collect(), permutable }
    }

    pub fn n_member(&self) -> usize {
        self.members.len()
    }

    /// Number of leading coincident members.
    pub fn n_coincident(&self) -> usize {
        self.members.iter().take_while(|m| m.coincident).count()
    }

    pub fn statements(&self) -> BTreeSet<&str> {
        self.members.iter().flat_map(|m| m.schedule.keys().map(String::as_str)).collect()
    }

    /// Splits into the first `pos` members and the rest.
    pub fn split(&self, pos: usize) -> Result<(Band, Band)> {
        ensure!(pos > 0 && pos < self.n_member(), SplitOutOfRangeSnafu { pos, members: self.n_member() });
        let outer = Band::new(self.members[..pos].iter().cloned(), self.permutable);
        let inner = Band::new(self.members[pos..].iter().cloned(), self.permutable);
        Ok((outer, inner))
    }

    /// Tiles every member; returns the tile band and the point band.
    pub fn tile(&self, sizes: &[i64]) -> Result<(Band, Band)> {
        let mut outer = Band::new([], self.permutable);
        let mut inner = Band::new([], self.permutable);
        for (idx, member) in self.members.iter().enumerate() {
            let size = sizes.get(idx).copied().unwrap_or(1);
            let mut tile = BandMember::new(member.coincident);
            let mut point = BandMember::new(member.coincident);
            for (stmt, q) in &member.schedule {
                let (o, i) = q.tile(idx, size)?;
                tile.schedule.insert(stmt.clone(), o);
                point.schedule.insert(stmt.clone(), i);
            }
            outer.members.push(tile);
            inner.members.push(point);
        }
        Ok((outer, inner))
    }

    pub fn reversed_members(&self) -> impl Iterator<Item = (usize, &BandMember)> {
        self.members.iter().enumerate().rev()
    }
}

// ============================================================================
// EXTENSIONS
// ============================================================================

/// Statement injected by an extension node.
#[derive(Debug, Clone, PartialEq)]
pub enum SyntheticKind {
    /// Copy `tensor[offsets + i] -> promoted[i]` over the statement domain.
    Read { tensor: String, promoted: String, offsets: Vec<Expr> },
    /// Copy `promoted[i] -> tensor[offsets + i]` over the statement domain.
    Write { tensor: String, promoted: String, offsets: Vec<Expr> },
    Sync,
    /// Opens the scope of a promoted buffer for the siblings that follow.
    Realize { tensor: String },
    ReduceInit(ReduceMark),
    ReduceUpdate(ReduceMark),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticStmt {
    pub name: String,
    pub kind: SyntheticKind,
    pub domain: SmallVec<[Iter; 4]>,
}

impl SyntheticStmt {
    pub fn scalar(name: impl Into<String>, kind: SyntheticKind) -> Self {
        Self { name: name.into(), kind, domain: SmallVec::new() }
    }
}

/// Accesses to `tensor` below the extension are redirected to `promoted`,
/// shifted by `offsets` (expressions over outer schedule dimensions).
#[derive(Debug, Clone, PartialEq)]
pub struct Promotion {
    pub tensor: String,
    pub promoted: String,
    pub offsets: Vec<Expr>,
    pub extents: Vec<i64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extension {
    pub stmts: Vec<SyntheticStmt>,
    pub promotions: Vec<Promotion>,
}

// ============================================================================
// NODES
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Statements(BTreeSet<String>),
    /// Binds the dimensions below to GPU axes.
    Mapping(Mapping),
}

/// Parameter bounds: each id lies in `[0, extent)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Context {
    pub bounds: Vec<(String, i64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Domain(BTreeSet<String>),
    Band(Band),
    Filter(Filter),
    Sequence,
    Set,
    Mark(Mark),
    Extension(Extension),
    Context(Context),
    Leaf,
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Domain(_) => "domain",
            Self::Band(_) => "band",
            Self::Filter(_) => "filter",
            Self::Sequence => "sequence",
            Self::Set => "set",
            Self::Mark(_) => "mark",
            Self::Extension(_) => "extension",
            Self::Context(_) => "context",
            Self::Leaf => "leaf",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    pub children: Vec<Arc<Node>>,
}

impl Node {
    pub fn new(kind: NodeKind, children: Vec<Node>) -> Self {
        Self { kind, children: children.into_iter().map(Arc::new).collect() }
    }

    pub fn leaf() -> Self {
        Self::new(NodeKind::Leaf, vec![])
    }

    pub fn band(band: Band, child: Node) -> Self {
        Self::new(NodeKind::Band(band), vec![child])
    }

    pub fn mark(mark: Mark, child: Node) -> Self {
        Self::new(NodeKind::Mark(mark), vec![child])
    }

    pub fn filter<S: Into<String>>(stmts: impl IntoIterator<Item = S>, child: Node) -> Self {
        let stmts = stmts.into_iter().map(Into::into).collect();
        Self::new(NodeKind::Filter(Filter::Statements(stmts)), vec![child])
    }

    pub fn sequence(children: Vec<Node>) -> Self {
        Self::new(NodeKind::Sequence, children)
    }

    pub fn set(children: Vec<Node>) -> Self {
        Self::new(NodeKind::Set, children)
    }

    pub fn child(&self, idx: usize) -> Option<&Node> {
        self.children.get(idx).map(Arc::as_ref)
    }

    pub fn as_band(&self) -> Option<&Band> {
        match &self.kind {
            NodeKind::Band(band) => Some(band),
            _ => None,
        }
    }

    pub fn as_mark(&self) -> Option<&Mark> {
        match &self.kind {
            NodeKind::Mark(mark) => Some(mark),
            _ => None,
        }
    }

    pub fn is_band(&self) -> bool {
        matches!(self.kind, NodeKind::Band(_))
    }

    /// Node with the same kind and new children.
    pub fn with_children(&self, children: Vec<Arc<Node>>) -> Node {
        Node { kind: self.kind.clone(), children }
    }

    /// Wraps this node under a new single-child node.
    pub fn wrap(self, kind: NodeKind) -> Node {
        Node::new(kind, vec![self])
    }

    fn map_bottom_up(&self, f: &mut impl FnMut(Node) -> Result<Node>) -> Result<Node> {
        let children = self.children.iter().map(|c| c.map_bottom_up(f).map(Arc::new)).collect::<Result<Vec<_>>>()?;
        f(self.with_children(children))
    }

    fn map_top_down(&self, f: &mut impl FnMut(Node) -> Result<Node>) -> Result<Node> {
        let node = f(self.clone())?;
        let children = node.children.iter().map(|c| c.map_top_down(f).map(Arc::new)).collect::<Result<Vec<_>>>()?;
        Ok(node.with_children(children))
    }
}

// ============================================================================
// TREE
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleTree {
    root: Arc<Node>,
}

impl ScheduleTree {
    /// Tree rooted at a domain node over `stmts`.
    pub fn new<S: Into<String>>(stmts: impl IntoIterator<Item = S>, child: Node) -> Self {
        let domain = stmts.into_iter().map(Into::into).collect();
        Self { root: Arc::new(Node::new(NodeKind::Domain(domain), vec![child])) }
    }

    pub fn from_root(root: Node) -> Self {
        Self { root: Arc::new(root) }
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn statements(&self) -> BTreeSet<String> {
        match &self.root.kind {
            NodeKind::Domain(stmts) => stmts.clone(),
            _ => BTreeSet::new(),
        }
    }

    pub fn node(&self, path: &[usize]) -> Result<&Node> {
        path.iter()
            .try_fold(self.root.as_ref(), |node, &idx| node.child(idx))
            .context(InvalidPathSnafu { path: Path::from_slice(path) })
    }

    pub fn band(&self, path: &[usize]) -> Result<&Band> {
        let node = self.node(path)?;
        node.as_band().context(UnexpectedNodeSnafu { expected: "band", found: node.kind.name(), path: Path::from_slice(path) })
    }

    /// Replaces the node at `path`.
    pub fn replace(&self, path: &[usize], node: Node) -> Result<ScheduleTree> {
        fn rebuild(cur: &Node, path: &[usize], node: Node, full: &[usize]) -> Result<Node> {
            let Some((&idx, rest)) = path.split_first() else {
                return Ok(node);
            };
            let child = cur.child(idx).context(InvalidPathSnafu { path: Path::from_slice(full) })?;
            let mut children = cur.children.clone();
            children[idx] = Arc::new(rebuild(child, rest, node, full)?);
            Ok(cur.with_children(children))
        }
        Ok(Self { root: Arc::new(rebuild(&self.root, path, node, path)?) })
    }

    /// Inserts a single-child node of `kind` above the node at `path`.
    pub fn insert_above(&self, path: &[usize], kind: NodeKind) -> Result<ScheduleTree> {
        let node = self.node(path)?.clone();
        self.replace(path, node.wrap(kind))
    }

    /// Removes the single-child node at `path`, splicing its child in its place.
    pub fn delete(&self, path: &[usize]) -> Result<ScheduleTree> {
        let node = self.node(path)?;
        ensure!(
            node.children.len() == 1,
            UnexpectedNodeSnafu { expected: "single-child", found: node.kind.name(), path: Path::from_slice(path) }
        );
        self.replace(path, node.children[0].as_ref().clone())
    }

    /// Node paths in pre-order.
    pub fn paths(&self) -> Vec<Path> {
        fn walk(node: &Node, path: &mut Path, out: &mut Vec<Path>) {
            out.push(path.clone());
            for (idx, child) in node.children.iter().enumerate() {
                path.push(idx);
                walk(child, path, out);
                path.pop();
            }
        }
        let mut out = Vec::new();
        walk(&self.root, &mut Path::new(), &mut out);
        out
    }

    /// Paths of nodes matching `pred`, pre-order.
    pub fn find(&self, pred: impl Fn(&Node) -> bool) -> Vec<Path> {
        self.paths().into_iter().filter(|p| self.node(p).is_ok_and(&pred)).collect()
    }

    pub fn map_descendant_bottom_up(&self, mut f: impl FnMut(Node) -> Result<Node>) -> Result<ScheduleTree> {
        Ok(Self { root: Arc::new(self.root.map_bottom_up(&mut f)?) })
    }

    pub fn map_descendant_top_down(&self, mut f: impl FnMut(Node) -> Result<Node>) -> Result<ScheduleTree> {
        Ok(Self { root: Arc::new(self.root.map_top_down(&mut f)?) })
    }

    /// Nodes on the way from the root to `path`, excluding the node itself.
    pub fn ancestors(&self, path: &[usize]) -> Vec<&Node> {
        (0..path.len()).filter_map(|len| self.node(&path[..len]).ok()).collect()
    }

    /// Number of band members strictly above `path`.
    pub fn schedule_depth(&self, path: &[usize]) -> usize {
        self.ancestors(path).iter().filter_map(|n| n.as_band()).map(Band::n_member).sum()
    }

    /// Statement instances reaching `path`: the domain plus extension
    /// statements, restricted by every statement filter on the way.
    pub fn active_statements(&self, path: &[usize]) -> BTreeSet<String> {
        let mut active = BTreeSet::new();
        for node in self.ancestors(path).into_iter().chain(self.node(path).ok()) {
            match &node.kind {
                NodeKind::Domain(stmts) => active.extend(stmts.iter().cloned()),
                NodeKind::Extension(ext) => active.extend(ext.stmts.iter().map(|s| s.name.clone())),
                NodeKind::Filter(Filter::Statements(stmts)) => active.retain(|s| stmts.contains(s)),
                _ => {}
            }
        }
        active
    }

    /// Member schedules of `stmt` at every schedule depth above `path`.
    pub fn prefix_schedule(&self, path: &[usize], stmt: &str) -> Vec<Option<QuasiAff>> {
        self.ancestors(path)
            .iter()
            .filter_map(|n| n.as_band())
            .flat_map(|band| band.members.iter().map(|m| m.get(stmt).cloned()))
            .collect()
    }

    /// Synthetic statements introduced above `path`, by name.
    pub fn synthetic_statements(&self, path: &[usize]) -> BTreeMap<String, SyntheticStmt> {
        let mut out = BTreeMap::new();
        for node in self.ancestors(path) {
            if let NodeKind::Extension(ext) = &node.kind {
                out.extend(ext.stmts.iter().map(|s| (s.name.clone(), s.clone())));
            }
        }
        out
    }

    pub fn has_ancestor_mark(&self, path: &[usize], pred: impl Fn(&Mark) -> bool) -> bool {
        self.ancestors(path).iter().filter_map(|n| n.as_mark()).any(pred)
    }
}
