//! Host statement tree produced by the GPU emitter.
//!
//! The vocabulary is that of a conventional loop IR: provides (stores),
//! evaluated calls, loops, conditionals, realize scopes and attributes.

use std::fmt;

use itertools::Itertools;

use crate::expr::Expr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForKind {
    Serial,
    Unrolled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Provide { tensor: String, indices: Vec<Expr>, value: Expr },
    Evaluate(Expr),
    For { var: String, min: Expr, extent: Expr, kind: ForKind, body: Box<Stmt> },
    IfThenElse { cond: Expr, then_case: Box<Stmt>, else_case: Option<Box<Stmt>> },
    Block(Vec<Stmt>),
    /// Scope of a buffer with `(min, extent)` bounds per dimension.
    Realize { tensor: String, bounds: Vec<(Expr, Expr)>, body: Box<Stmt> },
    Attr { node: String, key: String, value: Expr, body: Box<Stmt> },
    NoOp,
}

impl Stmt {
    pub fn provide(tensor: impl Into<String>, indices: Vec<Expr>, value: Expr) -> Self {
        Self::Provide { tensor: tensor.into(), indices, value }
    }

    pub fn attr(node: impl Into<String>, key: impl Into<String>, value: Expr, body: Stmt) -> Self {
        Self::Attr { node: node.into(), key: key.into(), value, body: Box::new(body) }
    }

    pub fn if_then(cond: Expr, then_case: Stmt) -> Self {
        Self::IfThenElse { cond, then_case: Box::new(then_case), else_case: None }
    }

    /// Sequence of `stmts`, flattening nested blocks and dropping no-ops.
    pub fn block(stmts: impl IntoIterator<Item = Stmt>) -> Self {
        let mut flat: Vec<Stmt> = Vec::new();
        for stmt in stmts {
            match stmt {
                Self::NoOp => {}
                Self::Block(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Self::NoOp,
            1 => flat.remove(0),
            _ => Self::Block(flat),
        }
    }

    pub fn visit(&self, f: &mut impl FnMut(&Stmt)) {
        f(self);
        match self {
            Self::For { body, .. } | Self::Realize { body, .. } | Self::Attr { body, .. } => body.visit(f),
            Self::IfThenElse { then_case, else_case, .. } => {
                then_case.visit(f);
                if let Some(e) = else_case {
                    e.visit(f);
                }
            }
            Self::Block(stmts) => stmts.iter().for_each(|s| s.visit(f)),
            _ => {}
        }
    }

    /// All nodes matching `pred`, pre-order.
    pub fn collect(&self, pred: impl Fn(&Stmt) -> bool) -> Vec<&Stmt> {
        fn walk<'a>(s: &'a Stmt, pred: &impl Fn(&Stmt) -> bool, out: &mut Vec<&'a Stmt>) {
            if pred(s) {
                out.push(s);
            }
            match s {
                Stmt::For { body, .. } | Stmt::Realize { body, .. } | Stmt::Attr { body, .. } => walk(body, pred, out),
                Stmt::IfThenElse { then_case, else_case, .. } => {
                    walk(then_case, pred, out);
                    if let Some(e) = else_case {
                        walk(e, pred, out);
                    }
                }
                Stmt::Block(stmts) => stmts.iter().for_each(|c| walk(c, pred, out)),
                _ => {}
            }
        }
        let mut out = Vec::new();
        walk(self, &pred, &mut out);
        out
    }

    fn write_indented(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        let pad = "  ".repeat(indent);
        match self {
            Self::Provide { tensor, indices, value } => writeln!(f, "{pad}{tensor}[{}] = {value}", indices.iter().join(", ")),
            Self::Evaluate(e) => writeln!(f, "{pad}{e}"),
            Self::For { var, min, extent, kind, body } => {
                let kw = if *kind == ForKind::Unrolled { "unrolled " } else { "" };
                writeln!(f, "{pad}{kw}for ({var}, {min}, {extent}) {{")?;
                body.write_indented(f, indent + 1)?;
                writeln!(f, "{pad}}}")
            }
            Self::IfThenElse { cond, then_case, else_case } => {
                writeln!(f, "{pad}if ({cond}) {{")?;
                then_case.write_indented(f, indent + 1)?;
                if let Some(e) = else_case {
                    writeln!(f, "{pad}}} else {{")?;
                    e.write_indented(f, indent + 1)?;
                }
                writeln!(f, "{pad}}}")
            }
            Self::Block(stmts) => stmts.iter().try_for_each(|s| s.write_indented(f, indent)),
            Self::Realize { tensor, bounds, body } => {
                let bounds = bounds.iter().map(|(m, e)| format!("[{m}, {e}]")).join(", ");
                writeln!(f, "{pad}realize {tensor}({bounds}) {{")?;
                body.write_indented(f, indent + 1)?;
                writeln!(f, "{pad}}}")
            }
            Self::Attr { node, key, value, body } => {
                writeln!(f, "{pad}// attr [{node}] {key} = {value}")?;
                body.write_indented(f, indent)
            }
            Self::NoOp => Ok(()),
        }
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, 0)
    }
}
