//! Polyhedral AST built from the final schedule tree.
//!
//! The AST keeps the shape of a generated loop nest: loops carry an init
//! expression, a comparison against their iterator and a constant increment;
//! statements are opaque [`AstNode::User`] nodes whose meaning is looked up
//! by annotation in a [`crate::NodeInfoRepo`].

use std::fmt;

use polygpu_ir::{Expr, Mark};

#[derive(Debug, Clone, PartialEq)]
pub struct AstFor {
    pub iterator: String,
    pub init: Expr,
    /// `iterator < bound` or `iterator <= bound`.
    pub cond: Expr,
    pub inc: i64,
    pub body: Box<AstNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AstNode {
    For(AstFor),
    /// A missing condition always holds.
    If { cond: Option<Expr>, then_node: Box<AstNode>, else_node: Option<Box<AstNode>> },
    Block(Vec<AstNode>),
    Mark { mark: Mark, node: Box<AstNode> },
    User { annotation: String },
}

impl AstNode {
    pub fn for_loop(iterator: impl Into<String>, init: Expr, cond: Expr, inc: i64, body: AstNode) -> Self {
        Self::For(AstFor { iterator: iterator.into(), init, cond, inc, body: Box::new(body) })
    }

    pub fn guard(cond: Expr, then_node: AstNode) -> Self {
        Self::If { cond: Some(cond), then_node: Box::new(then_node), else_node: None }
    }

    pub fn mark(mark: Mark, node: AstNode) -> Self {
        Self::Mark { mark, node: Box::new(node) }
    }

    pub fn user(annotation: impl Into<String>) -> Self {
        Self::User { annotation: annotation.into() }
    }

    /// Sequence of `nodes`, flattening nested blocks.
    pub fn block(nodes: impl IntoIterator<Item = AstNode>) -> Self {
        let mut flat = Vec::new();
        for node in nodes {
            match node {
                Self::Block(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            1 => flat.remove(0),
            _ => Self::Block(flat),
        }
    }

    /// Annotations of the user nodes, in program order.
    pub fn annotations(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.walk(&mut |node| {
            if let Self::User { annotation } = node {
                out.push(annotation.as_str());
            }
        });
        out
    }

    pub fn loops(&self) -> Vec<&AstFor> {
        let mut out = Vec::new();
        self.walk(&mut |node| {
            if let Self::For(f) = node {
                out.push(f);
            }
        });
        out
    }

    fn walk<'a>(&'a self, f: &mut impl FnMut(&'a AstNode)) {
        f(self);
        match self {
            Self::For(l) => l.body.walk(f),
            Self::If { then_node, else_node, .. } => {
                then_node.walk(f);
                if let Some(e) = else_node {
                    e.walk(f);
                }
            }
            Self::Block(nodes) => nodes.iter().for_each(|n| n.walk(f)),
            Self::Mark { node, .. } => node.walk(f),
            Self::User { .. } => {}
        }
    }

    fn write_indented(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        let pad = "  ".repeat(indent);
        match self {
            Self::For(l) => {
                writeln!(f, "{pad}for ({} = {}; {}; {} += {}) {{", l.iterator, l.init, l.cond, l.iterator, l.inc)?;
                l.body.write_indented(f, indent + 1)?;
                writeln!(f, "{pad}}}")
            }
            Self::If { cond, then_node, else_node } => {
                match cond {
                    Some(c) => writeln!(f, "{pad}if ({c}) {{")?,
                    None => writeln!(f, "{pad}if (1) {{")?,
                }
                then_node.write_indented(f, indent + 1)?;
                if let Some(e) = else_node {
                    writeln!(f, "{pad}}} else {{")?;
                    e.write_indented(f, indent + 1)?;
                }
                writeln!(f, "{pad}}}")
            }
            Self::Block(nodes) => nodes.iter().try_for_each(|n| n.write_indented(f, indent)),
            Self::Mark { mark, node } => {
                writeln!(f, "{pad}// {mark}")?;
                node.write_indented(f, indent)
            }
            Self::User { annotation } => writeln!(f, "{pad}{annotation}();"),
        }
    }
}

impl fmt::Display for AstNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, 0)
    }
}
