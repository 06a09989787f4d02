//! Schedule tree to polyhedral AST.
//!
//! Every band member becomes one schedule dimension. Unmapped members turn
//! into unit-stride loops (or a constant when their range is a single
//! point); members bound by a mapping filter above become the bound GPU id
//! when the id covers the whole range, and an id-strided loop otherwise.
//! Leaves become user nodes, one per active statement, whose iterators are
//! recovered by inverting the statement's prefix schedule against the
//! dimension values.
//!
//! ```text
//! Mark(Thread)
//!   Filter(Mapping t0 -> member 0)      // t0 in [0, 256)
//!     Band[i -> 0..100]                 // if (t0 < 100) { S0(i = t0) }
//! ```

use std::collections::{BTreeMap, BTreeSet};

use polygpu_ir::aff::{Interval, Iter, QuasiAff, invert};
use polygpu_ir::mapping::AxisBinding;
use polygpu_ir::tree::{Band, Filter, NodeKind, Promotion, ScheduleTree, SyntheticKind, SyntheticStmt};
use polygpu_ir::{CompileContext, Expr, Kernel, ScopInfo};
use polygpu_schedule::tree_util::{child_path, dim_var};
use tracing::{debug, trace};

use crate::ast::AstNode;
use crate::error::Result;
use crate::node_info::{BuildContext, NodeInfo, NodeInfoRepo};

/// Builds the AST of `tree` and the node info of every user node in it.
#[tracing::instrument(skip_all, fields(kernel = %info.kernel.name))]
pub fn build_ast(tree: &ScheduleTree, info: &mut ScopInfo) -> Result<(AstNode, NodeInfoRepo)> {
    let ScopInfo { kernel, ctx, .. } = info;
    let mut builder = AstBuilder { tree, kernel, ctx, repo: NodeInfoRepo::new() };
    let ast = builder.visit(&[], Scope::default())?.unwrap_or_else(|| AstNode::block([]));
    debug!(users = builder.repo.len(), "ast built");
    Ok((ast, builder.repo))
}

// ============================================================================
// SCOPE
// ============================================================================

/// Mapping filter whose bindings have not reached their band yet.
#[derive(Debug, Clone)]
struct Pending {
    bindings: Vec<AxisBinding>,
    stmts: BTreeSet<String>,
}

/// What is known on the way down to a node.
#[derive(Debug, Clone, Default)]
struct Scope {
    /// Value of every schedule dimension above.
    dims: Vec<Expr>,
    /// Ranges of loop iterators and GPU ids.
    bounds: BTreeMap<String, Interval>,
    promotions: Vec<Promotion>,
    pending: Vec<Pending>,
}

impl Scope {
    fn lookup(&self) -> impl Fn(&str) -> Option<Interval> + '_ {
        |name| self.bounds.get(name).copied()
    }
}

/// Bindings of the mapping filters above that apply to `band`.
///
/// A band split after the filter was placed holds only part of the mapped
/// members; the bindings past its end carry on to the next band below.
fn take_bindings(pending: &mut Vec<Pending>, band: &Band) -> Vec<AxisBinding> {
    let stmts = band.statements();
    let n = band.n_member();
    let mut out = Vec::new();
    for p in pending.iter_mut() {
        if n == 0 || !p.stmts.iter().any(|s| stmts.contains(s.as_str())) {
            continue;
        }
        let (here, rest): (Vec<_>, Vec<_>) = p.bindings.drain(..).partition(|b| b.member < n);
        out.extend(here);
        p.bindings = rest.into_iter().map(|b| AxisBinding { member: b.member - n, ..b }).collect();
    }
    pending.retain(|p| !p.bindings.is_empty());
    out
}

/// Rewrites `c<k>` into the value of dimension `k`.
fn over_dims(expr: &Expr, dims: &[Expr]) -> Expr {
    expr.substitute(&|name| {
        let depth = name.strip_prefix('c')?.parse::<usize>().ok()?;
        dims.get(depth).cloned()
    })
    .simplify()
}

fn synthetic_over_dims(kind: &SyntheticKind, dims: &[Expr]) -> SyntheticKind {
    let shift = |offsets: &[Expr]| offsets.iter().map(|o| over_dims(o, dims)).collect();
    match kind {
        SyntheticKind::Read { tensor, promoted, offsets } => {
            SyntheticKind::Read { tensor: tensor.clone(), promoted: promoted.clone(), offsets: shift(offsets) }
        }
        SyntheticKind::Write { tensor, promoted, offsets } => {
            SyntheticKind::Write { tensor: tensor.clone(), promoted: promoted.clone(), offsets: shift(offsets) }
        }
        other => other.clone(),
    }
}

/// Conditions keeping the value of `it` inside its domain, where the known
/// bounds do not already prove it.
fn domain_conds(it: &Iter, values: &BTreeMap<String, Expr>, scope: &Scope) -> Vec<Expr> {
    let Some(value) = values.get(&it.name) else {
        return Vec::new();
    };
    let range = value.bounds(&scope.lookup());
    let mut conds = Vec::new();
    if range.is_none_or(|r| r.lo < it.lo) {
        conds.push(Expr::int(it.lo).le(value.clone()));
    }
    if range.is_none_or(|r| r.hi > it.hi()) {
        conds.push(value.clone().lt(it.lo + it.extent));
    }
    conds
}

/// Loop or guard introduced by one band member, applied innermost first.
enum Wrap {
    Loop { var: String, init: Expr, hi: i64, inc: i64 },
    Guard(Expr),
}

impl Wrap {
    fn apply(self, body: AstNode) -> AstNode {
        match self {
            Self::Loop { var, init, hi, inc } => {
                let cond = Expr::var(var.clone()).le(hi);
                AstNode::for_loop(var, init, cond, inc, body)
            }
            Self::Guard(cond) => AstNode::guard(cond, body),
        }
    }
}

// ============================================================================
// BUILDER
// ============================================================================

struct AstBuilder<'a> {
    tree: &'a ScheduleTree,
    kernel: &'a Kernel,
    ctx: &'a mut CompileContext,
    repo: NodeInfoRepo,
}

impl AstBuilder<'_> {
    fn visit(&mut self, path: &[usize], mut scope: Scope) -> Result<Option<AstNode>> {
        let tree = self.tree;
        let node = tree.node(path)?;
        match &node.kind {
            NodeKind::Domain(_) | NodeKind::Filter(Filter::Statements(_)) => self.visit_child(path, scope),
            NodeKind::Context(context) => {
                for (id, extent) in &context.bounds {
                    scope.bounds.insert(id.clone(), Interval::new(0, extent - 1));
                }
                self.visit_child(path, scope)
            }
            NodeKind::Extension(ext) => {
                for p in &ext.promotions {
                    let offsets = p.offsets.iter().map(|o| over_dims(o, &scope.dims)).collect();
                    scope.promotions.push(Promotion { offsets, ..p.clone() });
                }
                self.visit_child(path, scope)
            }
            NodeKind::Filter(Filter::Mapping(mapping)) => {
                let stmts = tree.active_statements(&child_path(path, 0));
                scope.pending.push(Pending { bindings: mapping.bindings.to_vec(), stmts });
                self.visit_child(path, scope)
            }
            NodeKind::Sequence | NodeKind::Set => {
                let mut children = Vec::new();
                for idx in 0..node.children.len() {
                    if let Some(child) = self.visit(&child_path(path, idx), scope.clone())? {
                        children.push(child);
                    }
                }
                Ok((!children.is_empty()).then(|| AstNode::block(children)))
            }
            NodeKind::Mark(mark) => Ok(self.visit_child(path, scope)?.map(|child| AstNode::mark(mark.clone(), child))),
            NodeKind::Band(band) => self.visit_band(path, band, scope),
            NodeKind::Leaf => self.visit_leaf(path, &scope),
        }
    }

    fn visit_child(&mut self, path: &[usize], scope: Scope) -> Result<Option<AstNode>> {
        if self.tree.node(path)?.children.is_empty() {
            return Ok(None);
        }
        self.visit(&child_path(path, 0), scope)
    }

    fn visit_band(&mut self, path: &[usize], band: &Band, mut scope: Scope) -> Result<Option<AstNode>> {
        let active = self.tree.active_statements(path);
        let synthetic = self.tree.synthetic_statements(path);
        let bindings = take_bindings(&mut scope.pending, band);

        let mut wraps = Vec::new();
        for (idx, member) in band.members.iter().enumerate() {
            let depth = scope.dims.len();
            let mut range: Option<Interval> = None;
            for (stmt, q) in member.schedule.iter().filter(|(s, _)| active.contains(*s)) {
                let domain = self.domain(stmt, &synthetic)?;
                if let Some(r) = q.range(&domain) {
                    range = Some(range.map_or(r, |o| o.hull(&r)));
                }
            }
            let Some(range) = range else {
                scope.dims.push(Expr::int(0));
                continue;
            };

            match bindings.iter().find(|b| b.member == idx) {
                Some(b) if range.size() <= b.extent => {
                    let id = Expr::var(b.axis.clone());
                    let known_hi = scope.bounds.get(&b.axis).map_or(b.extent - 1, |i| i.hi);
                    if known_hi > range.size() - 1 {
                        wraps.push(Wrap::Guard(id.clone().lt(range.size())));
                    }
                    scope.bounds.insert(b.axis.clone(), Interval::new(0, range.size() - 1));
                    scope.dims.push((id + range.lo).simplify());
                }
                Some(b) => {
                    let var = dim_var(depth);
                    trace!(axis = b.axis, extent = b.extent, size = range.size(), "strided mapped loop");
                    let init = (Expr::var(b.axis.clone()) + range.lo).simplify();
                    wraps.push(Wrap::Loop { var: var.clone(), init, hi: range.hi, inc: b.extent });
                    scope.bounds.insert(var.clone(), range);
                    scope.dims.push(Expr::var(var));
                }
                None if range.size() == 1 => scope.dims.push(Expr::int(range.lo)),
                None => {
                    let var = dim_var(depth);
                    wraps.push(Wrap::Loop { var: var.clone(), init: Expr::int(range.lo), hi: range.hi, inc: 1 });
                    scope.bounds.insert(var.clone(), range);
                    scope.dims.push(Expr::var(var));
                }
            }
        }

        let Some(body) = self.visit_child(path, scope)? else {
            return Ok(None);
        };
        Ok(Some(wraps.into_iter().rev().fold(body, |body, wrap| wrap.apply(body))))
    }

    fn visit_leaf(&mut self, path: &[usize], scope: &Scope) -> Result<Option<AstNode>> {
        let active = self.tree.active_statements(path);
        let synthetic = self.tree.synthetic_statements(path);
        let mut users = Vec::with_capacity(active.len());
        for stmt in &active {
            users.push(self.user(path, stmt, &synthetic, scope)?);
        }
        Ok((!users.is_empty()).then(|| AstNode::block(users)))
    }

    fn user(&mut self, path: &[usize], stmt: &str, synthetic: &BTreeMap<String, SyntheticStmt>, scope: &Scope) -> Result<AstNode> {
        let domain = self.domain(stmt, synthetic)?;
        let dims: Vec<(QuasiAff, Expr)> = self
            .tree
            .prefix_schedule(path, stmt)
            .into_iter()
            .zip(&scope.dims)
            .filter_map(|(q, value)| q.map(|q| (q, value.clone())))
            .collect();
        let iterator_map = invert(stmt, &domain, &dims)?;
        let conds: Vec<Expr> = domain.iter().flat_map(|it| domain_conds(it, &iterator_map, scope)).collect();

        let annotation = self.ctx.next_ast_node_id();
        trace!(annotation, stmt, guards = conds.len(), "user node");
        let info = NodeInfo {
            stmt: stmt.to_string(),
            synthetic: synthetic.get(stmt).map(|s| synthetic_over_dims(&s.kind, &scope.dims)),
            domain: domain.iter().map(|it| it.name.clone()).collect(),
            iterator_map,
            build: BuildContext { dims: scope.dims.clone(), promotions: scope.promotions.clone() },
        };
        self.repo.insert(annotation.clone(), info)?;

        let user = AstNode::user(annotation);
        Ok(match Expr::all(conds) {
            Some(cond) => AstNode::guard(cond, user),
            None => user,
        })
    }

    fn domain(&self, stmt: &str, synthetic: &BTreeMap<String, SyntheticStmt>) -> Result<Vec<Iter>> {
        if let Some(s) = synthetic.get(stmt) {
            return Ok(s.domain.to_vec());
        }
        Ok(self.kernel.statement(stmt)?.domain.to_vec())
    }
}
