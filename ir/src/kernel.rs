//! Kernel description consumed by the scheduler: tensors, statements over
//! box domains, uniform dependences and the external buffer bindings.

use std::collections::{BTreeMap, BTreeSet};

use bon::bon;
use polygpu_dtype::ScalarDType;
use smallvec::SmallVec;
use snafu::{OptionExt, ensure};

use crate::aff::{AffExpr, Iter};
use crate::error::*;
use crate::expr::{BinOp, Expr};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tensor {
    pub name: String,
    pub shape: SmallVec<[i64; 4]>,
    pub dtype: ScalarDType,
}

impl Tensor {
    pub fn new(name: impl Into<String>, shape: &[i64], dtype: ScalarDType) -> Self {
        Self { name: name.into(), shape: shape.into(), dtype }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn bytes(&self) -> usize {
        self.dtype.bytes()
    }
}

/// Affine access `tensor[indices]` in the iterators of one statement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Access {
    pub tensor: String,
    pub indices: SmallVec<[AffExpr; 4]>,
}

impl Access {
    pub fn new(tensor: impl Into<String>, indices: impl IntoIterator<Item = AffExpr>) -> Self {
        Self { tensor: tensor.into(), indices: indices.into_iter().collect() }
    }

    pub fn to_expr(&self) -> Expr {
        Expr::load(self.tensor.clone(), self.indices.iter().map(AffExpr::to_expr).collect())
    }
}

/// Accumulation operator of a reduction statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(strum::Display, strum::EnumString, strum::EnumIter)]
pub enum ReduceOp {
    #[strum(serialize = "SumOp")]
    Sum,
    #[strum(serialize = "MaxOp")]
    Max,
    #[strum(serialize = "MinOp")]
    Min,
    #[strum(serialize = "ProdOp")]
    Prod,
    #[strum(serialize = "AndOp")]
    And,
    #[strum(serialize = "OrOp")]
    Or,
    #[strum(serialize = "UnsupportedOp")]
    Unsupported,
}

impl ReduceOp {
    fn from_bin_op(op: BinOp) -> Self {
        match op {
            BinOp::Add => Self::Sum,
            BinOp::Max => Self::Max,
            BinOp::Min => Self::Min,
            BinOp::Mul => Self::Prod,
            BinOp::And => Self::And,
            BinOp::Or => Self::Or,
            _ => Self::Unsupported,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Unsupported)
    }
}

/// `write = value` executed for every point of `domain`.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub name: String,
    pub domain: SmallVec<[Iter; 4]>,
    pub write: Access,
    pub value: Expr,
    reads: Vec<Access>,
}

impl Statement {
    /// Builds a statement; every load in `value` must be affine in the domain iterators.
    pub fn new(name: impl Into<String>, domain: Vec<Iter>, write: Access, value: Expr) -> Result<Self> {
        let name = name.into();
        let mut reads = Vec::new();
        let mut bad = None;
        value.visit(&mut |e| {
            if let Expr::Load { tensor, indices } = e {
                match indices.iter().map(AffExpr::try_from_expr).collect::<Option<SmallVec<_>>>() {
                    Some(indices) => {
                        let access = Access { tensor: tensor.clone(), indices };
                        if !reads.contains(&access) {
                            reads.push(access);
                        }
                    }
                    None => bad = Some(tensor.clone()),
                }
            }
        });
        if let Some(tensor) = bad {
            return NonAffineAccessSnafu { stmt: name, tensor }.fail();
        }
        Ok(Self { name, domain: domain.into(), write, value, reads })
    }

    pub fn reads(&self) -> &[Access] {
        &self.reads
    }

    pub fn accesses(&self) -> impl Iterator<Item = &Access> {
        self.reads.iter().chain(std::iter::once(&self.write))
    }

    pub fn iter(&self, name: &str) -> Option<&Iter> {
        self.domain.iter().find(|it| it.name == name)
    }

    /// Iterators the written element does not depend on.
    pub fn reduction_axes(&self) -> Vec<&Iter> {
        self.domain
            .iter()
            .filter(|it| it.extent > 1 && self.write.indices.iter().all(|idx| idx.coeff(&it.name) == 0))
            .collect()
    }

    /// Accumulation operator when the statement is `w = w op expr` over a reduction axis.
    pub fn reduce_op(&self) -> Option<ReduceOp> {
        let Expr::Binary { op, lhs, rhs } = &self.value else {
            return None;
        };
        let target = self.write.to_expr().simplify();
        let accumulates = [lhs, rhs].iter().any(|side| side.simplify() == target);
        (accumulates && !self.reduction_axes().is_empty()).then(|| ReduceOp::from_bin_op(*op))
    }
}

/// Uniform dependence: sink instance `x + distance` depends on source instance `x`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependence {
    pub source: String,
    pub sink: String,
    pub distance: SmallVec<[i64; 4]>,
    /// Ordering-only dependence, ignored when recomputing parallelism.
    pub forced: bool,
}

impl Dependence {
    pub fn new(source: impl Into<String>, sink: impl Into<String>, distance: &[i64]) -> Self {
        Self { source: source.into(), sink: sink.into(), distance: distance.into(), forced: false }
    }

    pub fn forced(mut self) -> Self {
        self.forced = true;
        self
    }
}

/// Operands of a hardware-matmul-eligible kernel `C += A * B`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatmulInfo {
    pub a: String,
    pub b: String,
    pub c: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Kernel {
    pub name: String,
    pub tensors: BTreeMap<String, Tensor>,
    pub statements: Vec<Statement>,
    pub dependences: Vec<Dependence>,
    /// Tensors bound to external buffers; never renamed, never realized here.
    pub binds: BTreeSet<String>,
    pub matmul: Option<MatmulInfo>,
    pub conv: bool,
    pub transpose: bool,
}

#[bon]
impl Kernel {
    /// Validates that every access names a known tensor with a matching rank.
    #[builder]
    pub fn new(
        #[builder(into)] name: String,
        tensors: Vec<Tensor>,
        statements: Vec<Statement>,
        #[builder(default)] dependences: Vec<Dependence>,
        #[builder(default)] binds: Vec<String>,
        matmul: Option<MatmulInfo>,
        #[builder(default)] conv: bool,
        #[builder(default)] transpose: bool,
    ) -> Result<Self> {
        let tensors: BTreeMap<_, _> = tensors.into_iter().map(|t| (t.name.clone(), t)).collect();
        for stmt in &statements {
            for access in stmt.accesses() {
                let tensor = tensors.get(&access.tensor).context(UnknownTensorSnafu { name: access.tensor.clone() })?;
                ensure!(
                    tensor.rank() == access.indices.len(),
                    AccessRankSnafu {
                        stmt: stmt.name.clone(),
                        tensor: tensor.name.clone(),
                        got: access.indices.len(),
                        rank: tensor.rank()
                    }
                );
            }
        }
        for dep in &dependences {
            for name in [&dep.source, &dep.sink] {
                ensure!(statements.iter().any(|s| &s.name == name), UnknownStatementSnafu { name: name.clone() });
            }
        }
        for name in binds.iter().chain(matmul.iter().flat_map(|m| [&m.a, &m.b, &m.c])) {
            ensure!(tensors.contains_key(name), UnknownTensorSnafu { name: name.clone() });
        }
        Ok(Self { name, tensors, statements, dependences, binds: binds.into_iter().collect(), matmul, conv, transpose })
    }
}

impl Kernel {
    pub fn statement(&self, name: &str) -> Result<&Statement> {
        self.statements.iter().find(|s| s.name == name).context(UnknownStatementSnafu { name })
    }

    pub fn tensor(&self, name: &str) -> Result<&Tensor> {
        self.tensors.get(name).context(UnknownTensorSnafu { name })
    }

    /// Reduction statements with their operator, in statement order.
    pub fn reductions(&self) -> impl Iterator<Item = (&Statement, ReduceOp)> {
        self.statements.iter().filter_map(|s| s.reduce_op().map(|op| (s, op)))
    }

    /// Tensors read by `stmts` and never written by them.
    pub fn read_only_tensors<'a>(&'a self, stmts: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
        let stmts: BTreeSet<&str> = stmts.into_iter().collect();
        let active = self.statements.iter().filter(|s| stmts.contains(s.name.as_str()));
        let (mut reads, mut writes) = (BTreeSet::new(), BTreeSet::new());
        for stmt in active {
            reads.extend(stmt.reads().iter().map(|a| a.tensor.clone()));
            writes.insert(stmt.write.tensor.clone());
        }
        reads.difference(&writes).cloned().collect()
    }
}
