//! What the AST builder knew at each user node.

use std::collections::BTreeMap;

use polygpu_ir::tree::{Promotion, SyntheticKind};
use polygpu_ir::Expr;
use smallvec::SmallVec;
use snafu::{OptionExt, ensure};

use crate::error::*;

/// Build state around one user node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildContext {
    /// Value of schedule dimension `k` at index `k`, over AST iterators and GPU ids.
    pub dims: Vec<Expr>,
    /// Enclosing promotion scopes, outermost first, offsets already over the dims.
    pub promotions: Vec<Promotion>,
}

impl BuildContext {
    /// Innermost promotion of `tensor`, if any.
    pub fn promotion(&self, tensor: &str) -> Option<&Promotion> {
        self.promotions.iter().rev().find(|p| p.tensor == tensor)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub stmt: String,
    /// Extension statement kind; copy offsets are over the dims like the promotions.
    pub synthetic: Option<SyntheticKind>,
    /// Iterator names in domain order.
    pub domain: SmallVec<[String; 4]>,
    /// Statement iterator -> value.
    pub iterator_map: BTreeMap<String, Expr>,
    pub build: BuildContext,
}

/// Annotation id -> node info. Entries are write-once.
#[derive(Debug, Clone, Default)]
pub struct NodeInfoRepo {
    infos: BTreeMap<String, NodeInfo>,
}

impl NodeInfoRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, annotation: String, info: NodeInfo) -> Result<()> {
        ensure!(!self.infos.contains_key(&annotation), DuplicateNodeInfoSnafu { annotation });
        self.infos.insert(annotation, info);
        Ok(())
    }

    pub fn get(&self, annotation: &str) -> Result<&NodeInfo> {
        self.infos.get(annotation).context(MissingNodeInfoSnafu { annotation })
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &NodeInfo)> {
        self.infos.iter().map(|(k, v)| (k.as_str(), v))
    }
}
