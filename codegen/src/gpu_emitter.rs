//! AST to host statement tree.
//!
//! The emitter walks the AST produced by [`crate::build_ast`] and rewrites
//! every user node into stores or intrinsic calls, with statement iterators
//! replaced by their AST values and mapped ids replaced by hardware block
//! and thread indices. Loops are normalized to unit stride, promoted
//! buffers get realize scopes, and the whole body is wrapped in one
//! `thread_extent` attribute per hardware axis it uses.

use std::collections::{BTreeMap, BTreeSet};

use polygpu_dtype::MemType;
use polygpu_ir::mapping::{AxisId, CONV_H_W, CONV_N, CONV_O, MappingCfg, WARP_COMPUTE};
use polygpu_ir::tree::SyntheticKind;
use polygpu_ir::{BinOp, Expr, ForKind, Mark, ReduceMark, ReduceOp, ScopInfo, Stmt};
use polygpu_schedule::mapping::matmul::WARP_SIZE;
use snafu::ensure;
use tracing::{debug, trace, warn};

use crate::ast::{AstFor, AstNode};
use crate::error::*;
use crate::node_info::{NodeInfo, NodeInfoRepo};

const THREAD_EXTENT: &str = "thread_extent";
const REALIZE_SCOPE: &str = "realize_scope";
const ORIGIN_THREAD_DIM_X: &str = "origin_thread_dim_x";
const GM_READ_FLAG: &str = "gm_read_flag";
const SHARED_MEM_PROMOTED_COMPLETE: &str = "shared_mem_promoted_complete";

/// Hardware index the emitted code reads its position from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(strum::Display, strum::EnumString, strum::EnumIter)]
pub enum GpuAxis {
    #[strum(serialize = "blockIdx.x")]
    BlockX,
    #[strum(serialize = "blockIdx.y")]
    BlockY,
    #[strum(serialize = "blockIdx.z")]
    BlockZ,
    #[strum(serialize = "threadIdx.x")]
    ThreadX,
    #[strum(serialize = "threadIdx.y")]
    ThreadY,
    #[strum(serialize = "threadIdx.z")]
    ThreadZ,
}

impl GpuAxis {
    pub const BLOCKS: [GpuAxis; 3] = [Self::BlockX, Self::BlockY, Self::BlockZ];
    pub const THREADS: [GpuAxis; 3] = [Self::ThreadX, Self::ThreadY, Self::ThreadZ];

    pub fn is_block(&self) -> bool {
        Self::BLOCKS.contains(self)
    }

    pub fn var(&self) -> Expr {
        Expr::var(self.to_string())
    }
}

/// Intrinsic performing `op` atomically on global memory.
fn atomic_intrinsic(op: ReduceOp) -> Option<&'static str> {
    match op {
        ReduceOp::Sum => Some("atomic_add"),
        ReduceOp::Max => Some("atomic_max"),
        ReduceOp::Min => Some("atomic_min"),
        ReduceOp::Prod => Some("atomic_mul"),
        ReduceOp::And => Some("atomic_and"),
        ReduceOp::Or => Some("atomic_or"),
        ReduceOp::Unsupported => None,
    }
}

/// `axis`-th digit of `linear` in the mixed radix of `cfg`, `x` fastest.
fn radix_digit(linear: Expr, cfg: &MappingCfg, axis: usize) -> Expr {
    let stride: i64 = (0..axis).map(|j| cfg.extent(j)).product();
    let quotient = if stride > 1 { linear.floor_div(stride) } else { linear };
    if axis + 1 < cfg.bound() { quotient.floor_mod(cfg.extent(axis)) } else { quotient }
}

// ============================================================================
// EMITTER
// ============================================================================

pub struct GpuEmitter<'a> {
    info: &'a ScopInfo,
    repo: &'a NodeInfoRepo,
    /// Loop iterator -> value, for loops rewritten to unit stride.
    iter_env: BTreeMap<String, Expr>,
    /// Mapped id -> expression over hardware indices.
    id_env: BTreeMap<String, Expr>,
    extents: BTreeMap<GpuAxis, i64>,
    used: BTreeSet<GpuAxis>,
    atomic: Option<ReduceOp>,
    unroll: Option<usize>,
}

impl<'a> GpuEmitter<'a> {
    pub fn new(info: &'a ScopInfo, repo: &'a NodeInfoRepo) -> Self {
        let mut emitter = Self {
            info,
            repo,
            iter_env: BTreeMap::new(),
            id_env: BTreeMap::new(),
            extents: BTreeMap::new(),
            used: BTreeSet::new(),
            atomic: None,
            unroll: None,
        };
        emitter.bind_ids();
        emitter
    }

    /// Emits `ast` as one kernel body.
    #[tracing::instrument(skip_all, fields(kernel = %self.info.kernel.name))]
    pub fn emit(&mut self, ast: &AstNode) -> Result<Stmt> {
        let body = self.emit_node(ast)?;
        let body = self.realize_temporaries(body);
        Ok(self.launch_attrs(body))
    }

    /// Hardware axes the emitted code reads, with their launch extents.
    pub fn launch_extents(&self) -> Vec<(GpuAxis, i64)> {
        self.used.iter().map(|axis| (*axis, self.extents.get(axis).copied().unwrap_or(1))).collect()
    }

    fn bind_ids(&mut self) {
        let config = &self.info.config;
        let one_dim = config.one_dim_thread;

        if let Some(cfg) = &config.block_cfg {
            for (i, axis) in GpuAxis::BLOCKS.into_iter().enumerate() {
                self.extents.insert(axis, cfg.extent(i));
                self.id_env.insert(cfg.axis_id(i), axis.var());
            }
        }

        let mut linear = GpuAxis::ThreadX.var();
        if let Some(cfg) = &config.thread_cfg {
            for (i, axis) in GpuAxis::THREADS.into_iter().enumerate() {
                let (id, extent) = match (one_dim, i) {
                    (true, 0) => (radix_digit(GpuAxis::ThreadX.var(), cfg, 0), cfg.total()),
                    (true, _) => (radix_digit(GpuAxis::ThreadX.var(), cfg, i), 1),
                    (false, _) => (axis.var(), cfg.extent(i)),
                };
                self.extents.insert(axis, extent);
                self.id_env.insert(cfg.axis_id(i), id);
            }
            if !one_dim {
                let mut stride = 1;
                for (i, axis) in GpuAxis::THREADS.into_iter().enumerate().take(cfg.bound()).skip(1) {
                    stride *= cfg.extent(i - 1);
                    linear = linear + axis.var() * stride;
                }
            }
        }

        for cfg in self.info.analysis.replace_cfgs.values() {
            for i in 0..cfg.bound() {
                let id = match (cfg.kind.is_block_level(), cfg.name.as_str()) {
                    (true, CONV_H_W) if i == 0 => GpuAxis::BlockY.var().floor_mod(cfg.extent(0)),
                    (true, CONV_H_W) => GpuAxis::BlockY.var().floor_div(cfg.extent(0)),
                    (true, CONV_N) => GpuAxis::BlockZ.var(),
                    (true, CONV_O) => GpuAxis::BlockX.var(),
                    (true, _) => GpuAxis::BLOCKS[i].var(),
                    (false, WARP_COMPUTE) if i == 0 => linear.clone().floor_div(WARP_SIZE).floor_mod(cfg.extent(0)),
                    (false, WARP_COMPUTE) => linear.clone().floor_div(WARP_SIZE).floor_div(cfg.extent(0)),
                    (false, _) => radix_digit(linear.clone(), cfg, i),
                };
                self.id_env.insert(cfg.axis_id(i), id.simplify());
            }
        }
        trace!(ids = ?self.id_env.keys().collect::<Vec<_>>(), "hardware ids bound");
    }

    /// Rewrites AST iterators and mapped ids into hardware terms.
    fn resolve(&mut self, expr: &Expr) -> Expr {
        let expr = expr.substitute_map(&self.iter_env).substitute_map(&self.id_env).simplify();
        let mut unresolved = Vec::new();
        let used = &mut self.used;
        expr.visit(&mut |e| {
            if let Expr::Var(name) = e {
                match name.parse::<GpuAxis>() {
                    Ok(axis) => {
                        used.insert(axis);
                    }
                    Err(_) if AxisId::parse(name).is_some() && !unresolved.contains(name) => unresolved.push(name.clone()),
                    Err(_) => {}
                }
            }
        });
        if unresolved.is_empty() {
            return expr;
        }
        warn!(ids = ?unresolved, "ids without a hardware axis, using 0");
        expr.substitute(&|name| unresolved.iter().any(|u| u == name).then(|| Expr::int(0))).simplify()
    }

    // ========================================================================
    // AST NODES
    // ========================================================================

    fn emit_node(&mut self, node: &AstNode) -> Result<Stmt> {
        match node {
            AstNode::For(l) => self.emit_for(l),
            AstNode::If { cond, then_node, else_node } => {
                let Some(cond) = cond else {
                    return self.emit_node(then_node);
                };
                let cond = self.resolve(cond);
                match cond.as_int() {
                    Some(0) => else_node.as_ref().map_or(Ok(Stmt::NoOp), |e| self.emit_node(e)),
                    Some(_) => self.emit_node(then_node),
                    None => {
                        let then_case = Box::new(self.emit_node(then_node)?);
                        let else_case = else_node.as_ref().map(|e| self.emit_node(e)).transpose()?.map(Box::new);
                        Ok(Stmt::IfThenElse { cond, then_case, else_case })
                    }
                }
            }
            AstNode::Block(nodes) => self.emit_block(nodes),
            AstNode::Mark { mark, node } => self.emit_mark(mark, node),
            AstNode::User { annotation } => {
                let repo = self.repo;
                self.emit_user(repo.get(annotation)?)
            }
        }
    }

    /// Normalizes `for (i = init; i <(=) bound; i += inc)` to a unit-stride
    /// loop starting at 0 (or at `init` when `inc` is already 1).
    fn emit_for(&mut self, l: &AstFor) -> Result<Stmt> {
        ensure!(l.inc != 0, ZeroStrideSnafu { iterator: l.iterator.clone() });
        let bound = match &l.cond {
            Expr::Binary { op: BinOp::Lt, lhs, rhs } if lhs.as_var() == Some(l.iterator.as_str()) => (**rhs).clone(),
            Expr::Binary { op: BinOp::Le, lhs, rhs } if lhs.as_var() == Some(l.iterator.as_str()) => (**rhs).clone() + 1,
            cond => return LoopConditionSnafu { iterator: l.iterator.clone(), cond: cond.to_string() }.fail(),
        };
        let init = self.resolve(&l.init);
        let bound = self.resolve(&bound);

        let saved = self.iter_env.remove(&l.iterator);
        let (min, extent) = if l.inc == 1 {
            (init.clone(), (bound - init).simplify())
        } else {
            let stride = l.inc;
            self.iter_env.insert(l.iterator.clone(), (Expr::var(l.iterator.clone()) * stride + init.clone()).simplify());
            (Expr::int(0), (bound - init + (stride - 1)).floor_div(stride).simplify())
        };
        let body = self.emit_node(&l.body);
        match saved {
            Some(value) => self.iter_env.insert(l.iterator.clone(), value),
            None => self.iter_env.remove(&l.iterator),
        };
        let body = body?;

        if body == Stmt::NoOp {
            return Ok(Stmt::NoOp);
        }
        let kind = match (self.unroll, extent.as_int()) {
            (Some(max), Some(n)) if n >= 0 && n as usize <= max => ForKind::Unrolled,
            _ => ForKind::Serial,
        };
        Ok(Stmt::For { var: l.iterator.clone(), min, extent, kind, body: Box::new(body) })
    }

    /// Emits `nodes` back to front so a realize user can wrap the siblings
    /// that follow it.
    fn emit_block(&mut self, nodes: &[AstNode]) -> Result<Stmt> {
        let repo = self.repo;
        let mut suffix: Vec<Stmt> = Vec::new();
        for node in nodes.iter().rev() {
            if let AstNode::User { annotation } = node {
                let info = repo.get(annotation)?;
                if let Some(SyntheticKind::Realize { tensor }) = &info.synthetic {
                    let body = Stmt::block(suffix.drain(..).rev());
                    suffix.push(self.realize_promoted(tensor, info, body)?);
                    continue;
                }
            }
            suffix.push(self.emit_node(node)?);
        }
        Ok(Stmt::block(suffix.into_iter().rev()))
    }

    fn emit_mark(&mut self, mark: &Mark, node: &AstNode) -> Result<Stmt> {
        match mark {
            Mark::Atomic(op) => {
                let saved = self.atomic.replace(*op);
                let body = self.emit_node(node);
                self.atomic = saved;
                body
            }
            Mark::Unroll(max) => {
                let saved = self.unroll.replace(*max);
                let body = self.emit_node(node);
                self.unroll = saved;
                body
            }
            Mark::PromoteGlobalToSharedAb => {
                let body = self.emit_node(node)?;
                Ok(Stmt::attr("", SHARED_MEM_PROMOTED_COMPLETE, Expr::str(SHARED_MEM_PROMOTED_COMPLETE), body))
            }
            Mark::PromoteVectorization
            | Mark::PromoteRegisterToGlobal
            | Mark::PromoteRegisterToShared
            | Mark::PromoteSharedToGlobal => {
                let body = self.emit_node(node)?;
                Ok(Stmt::attr("", mark.name(), Expr::str(mark.name()), body))
            }
            _ => self.emit_node(node),
        }
    }

    // ========================================================================
    // USER NODES
    // ========================================================================

    fn emit_user(&mut self, info: &NodeInfo) -> Result<Stmt> {
        let env: BTreeMap<String, Expr> = info.iterator_map.iter().map(|(k, v)| (k.clone(), self.resolve(v))).collect();
        let point: Vec<Expr> = info.domain.iter().filter_map(|it| env.get(it).cloned()).collect();

        match &info.synthetic {
            None => self.emit_statement(info, &env),
            Some(SyntheticKind::Read { tensor, promoted, offsets }) => {
                let src = self.shifted(offsets, &point);
                let copy = Stmt::provide(promoted.clone(), point, Expr::load(tensor.clone(), src));
                Ok(Stmt::attr("", GM_READ_FLAG, Expr::str(GM_READ_FLAG), copy))
            }
            Some(SyntheticKind::Write { tensor, promoted, offsets }) => {
                if !self.info.kernel.binds.contains(tensor) {
                    debug!(tensor, "temporary not written back");
                    return Ok(Stmt::NoOp);
                }
                let dst = self.shifted(offsets, &point);
                Ok(self.store(tensor, dst, Expr::load(promoted.clone(), point)))
            }
            Some(SyntheticKind::Sync) => Ok(Stmt::Evaluate(Expr::call("tvm_storage_sync", vec![Expr::str(MemType::Shared.scope())]))),
            Some(SyntheticKind::Realize { tensor }) => self.realize_promoted(tensor, info, Stmt::NoOp),
            Some(SyntheticKind::ReduceInit(mark)) => {
                let buffer = self.reduce_buffer(mark, info);
                Ok(Stmt::Evaluate(Expr::call("reduce_init", vec![Expr::str(mark.op.to_string()), Expr::str(buffer)])))
            }
            Some(SyntheticKind::ReduceUpdate(mark)) => {
                let tensor = self.reduce_tensor(mark);
                let buffer = self.reduce_buffer(mark, info);
                let args = vec![Expr::str(mark.op.to_string()), Expr::str(buffer), Expr::str(tensor)];
                Ok(Stmt::Evaluate(Expr::call("reduce_update", args)))
            }
        }
    }

    /// Kernel statement with promoted accesses redirected to their buffers.
    fn emit_statement(&mut self, info: &NodeInfo, env: &BTreeMap<String, Expr>) -> Result<Stmt> {
        let scop = self.info;
        let stmt = scop.kernel.statement(&info.stmt)?;
        let promotions: Vec<_> = info
            .build
            .promotions
            .iter()
            .map(|p| (p.tensor.clone(), p.promoted.clone(), p.offsets.iter().map(|o| self.resolve(o)).collect::<Vec<_>>()))
            .collect();
        let redirect = |tensor: &str, indices: &[Expr]| -> Option<(String, Vec<Expr>)> {
            let (_, promoted, offsets) = promotions.iter().rev().find(|(t, _, _)| t == tensor)?;
            let shifted = indices.iter().zip(offsets).map(|(i, o)| (i.clone() - o.clone()).simplify()).collect();
            Some((promoted.clone(), shifted))
        };

        let value = stmt.value.substitute_map(env).transform(&mut |e| match e {
            Expr::Load { tensor, indices } => redirect(tensor, indices).map(|(t, i)| Expr::load(t, i)),
            _ => None,
        });
        let indices: Vec<Expr> = stmt.write.indices.iter().map(|a| a.to_expr().substitute_map(env).simplify()).collect();
        let (tensor, indices) = redirect(&stmt.write.tensor, &indices).unwrap_or((stmt.write.tensor.clone(), indices));
        Ok(self.store(&tensor, indices, value.simplify()))
    }

    /// Store to `tensor`, atomic under an atomic mark.
    fn store(&self, tensor: &str, indices: Vec<Expr>, value: Expr) -> Stmt {
        match self.atomic.and_then(atomic_intrinsic) {
            Some(name) => {
                let address = Expr::call("tvm_address_of", vec![Expr::load(tensor, indices)]);
                Stmt::Evaluate(Expr::call(name, vec![address, value]))
            }
            None => Stmt::provide(tensor, indices, value),
        }
    }

    fn shifted(&mut self, offsets: &[Expr], point: &[Expr]) -> Vec<Expr> {
        offsets.iter().zip(point).map(|(o, p)| (self.resolve(o) + p.clone()).simplify()).collect()
    }

    fn reduce_tensor(&self, mark: &ReduceMark) -> String {
        match self.info.analysis.reduce_infos.get(&mark.stmt) {
            Some(r) => r.tensor.clone(),
            None => self.info.kernel.statement(&mark.stmt).map_or_else(|_| mark.stmt.clone(), |s| s.write.tensor.clone()),
        }
    }

    /// Buffer the reduction accumulates into: the promoted copy when there is one.
    fn reduce_buffer(&self, mark: &ReduceMark, info: &NodeInfo) -> String {
        let tensor = self.reduce_tensor(mark);
        info.build.promotion(&tensor).map_or(tensor, |p| p.promoted.clone())
    }

    // ========================================================================
    // SCOPES
    // ========================================================================

    fn realize_promoted(&self, promoted: &str, info: &NodeInfo, body: Stmt) -> Result<Stmt> {
        let def = self.info.analysis.buffer_defs.iter().find(|b| b.dst_tensor_id == promoted);
        let (scope, sizes) = match def {
            Some(def) => (def.dst_mem.scope(), def.sizes.clone()),
            None => {
                let promotion = info.build.promotions.iter().rev().find(|p| p.promoted == promoted);
                let promotion = promotion.ok_or_else(|| UnknownBufferSnafu { name: promoted }.build())?;
                (MemType::Shared.scope(), promotion.extents.clone())
            }
        };
        trace!(promoted, scope, ?sizes, "realize");
        let bounds = sizes.iter().map(|s| (Expr::int(0), Expr::int(*s))).collect();
        let realize = Stmt::Realize { tensor: promoted.to_string(), bounds, body: Box::new(body) };
        Ok(Stmt::attr(promoted, REALIZE_SCOPE, Expr::str(scope), realize))
    }

    /// Global scratch tensors: neither bound outside nor promoted.
    fn realize_temporaries(&self, body: Stmt) -> Stmt {
        let kernel = &self.info.kernel;
        kernel
            .tensors
            .values()
            .rev()
            .filter(|t| !kernel.binds.contains(&t.name))
            .filter(|t| !MemType::is_promoted_name(&t.name) && self.info.analysis.buffer_def(&t.name).is_none())
            .fold(body, |body, t| {
                let bounds = t.shape.iter().map(|s| (Expr::int(0), Expr::int(*s))).collect();
                let realize = Stmt::Realize { tensor: t.name.clone(), bounds, body: Box::new(body) };
                Stmt::attr(t.name.clone(), REALIZE_SCOPE, Expr::str(MemType::Global.scope()), realize)
            })
    }

    /// One `thread_extent` attribute per axis used, blocks outermost.
    fn launch_attrs(&self, body: Stmt) -> Stmt {
        let mut body = body;
        if self.info.config.one_dim_thread
            && let Some(cfg) = &self.info.config.thread_cfg
        {
            body = Stmt::attr("", ORIGIN_THREAD_DIM_X, Expr::int(cfg.extent(0)), body);
        }
        self.launch_extents()
            .into_iter()
            .rev()
            .fold(body, |body, (axis, extent)| Stmt::attr(axis.to_string(), THREAD_EXTENT, Expr::int(extent), body))
    }
}
