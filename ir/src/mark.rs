//! Typed schedule-tree marks.
//!
//! Marks carry pass-to-pass metadata through the tree. Every mark has a
//! canonical name; names are parsed back with [`str::parse`], which rejects
//! known prefixes with a malformed payload.

use std::fmt;
use std::str::FromStr;

use crate::error::*;
use crate::kernel::ReduceOp;

const REDUCE_MARKER: &str = "reduce_marker_";
const REDUCE_AREA: &str = "reduce_area_";
const ATOMIC_MARKER: &str = "atomic_";
const UNROLL_MARKER: &str = "unroll_";

/// Identity of one isolated reduction: operator, statement and reduction id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReduceMark {
    pub op: ReduceOp,
    pub stmt: String,
    pub id: usize,
}

impl ReduceMark {
    /// `<op>_<stmt>_<id>`, the key shared by the init and update statements.
    pub fn suffix(&self) -> String {
        format!("{}_{}_{}", self.op, self.stmt, self.id)
    }

    fn parse(name: &str, payload: &str) -> Result<Self> {
        let malformed = || MalformedMarkSnafu { name }.build();
        let (op, rest) = payload.split_once('_').ok_or_else(malformed)?;
        let (stmt, id) = rest.rsplit_once('_').ok_or_else(malformed)?;
        let op = op.parse::<ReduceOp>().map_err(|_| malformed())?;
        let id = id.parse::<usize>().map_err(|_| malformed())?;
        if stmt.is_empty() {
            return Err(malformed());
        }
        Ok(Self { op, stmt: stmt.to_string(), id })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Mark {
    Block,
    Thread,
    Warp,
    Reduce(ReduceMark),
    ReduceArea(ReduceMark),
    PromoteGlobalToSharedAb,
    PromoteGlobalToSharedC,
    PromoteSharedToGlobal,
    PromoteVectorization,
    PromoteRegisterToGlobal,
    PromoteRegisterToShared,
    /// Stores below accumulate atomically with the given operator.
    Atomic(ReduceOp),
    /// Constant-extent loops below with at most `max` iterations are unrolled.
    Unroll(usize),
    Custom(String),
}

impl Mark {
    pub fn name(&self) -> String {
        match self {
            Self::Block => "block_marker".into(),
            Self::Thread => "thread_marker".into(),
            Self::Warp => "warp_marker".into(),
            Self::Reduce(r) => format!("{REDUCE_MARKER}{}", r.suffix()),
            Self::ReduceArea(r) => format!("{REDUCE_AREA}{}", r.suffix()),
            Self::PromoteGlobalToSharedAb => "promote_global_to_shared_ab".into(),
            Self::PromoteGlobalToSharedC => "promote_global_to_shared_c".into(),
            Self::PromoteSharedToGlobal => "promote_shared_to_global".into(),
            Self::PromoteVectorization => "promote_vectorization".into(),
            Self::PromoteRegisterToGlobal => "promote_register_to_global".into(),
            Self::PromoteRegisterToShared => "promote_register_to_shared".into(),
            Self::Atomic(op) => format!("{ATOMIC_MARKER}{op}"),
            Self::Unroll(max) => format!("{UNROLL_MARKER}{max}"),
            Self::Custom(name) => name.clone(),
        }
    }

    /// Marks that bound a thread-level mapping.
    pub fn is_thread_level(&self) -> bool {
        matches!(self, Self::Thread | Self::Warp)
    }
}

impl fmt::Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for Mark {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        let unit = [
            Self::Block,
            Self::Thread,
            Self::Warp,
            Self::PromoteGlobalToSharedAb,
            Self::PromoteGlobalToSharedC,
            Self::PromoteSharedToGlobal,
            Self::PromoteVectorization,
            Self::PromoteRegisterToGlobal,
            Self::PromoteRegisterToShared,
        ];
        if let Some(mark) = unit.into_iter().find(|m| m.name() == name) {
            return Ok(mark);
        }

        if let Some(payload) = name.strip_prefix(REDUCE_MARKER) {
            return ReduceMark::parse(name, payload).map(Self::Reduce);
        }
        if let Some(payload) = name.strip_prefix(REDUCE_AREA) {
            return ReduceMark::parse(name, payload).map(Self::ReduceArea);
        }
        if let Some(payload) = name.strip_prefix(ATOMIC_MARKER) {
            return payload.parse().map(Self::Atomic).map_err(|_| MalformedMarkSnafu { name }.build());
        }
        if let Some(payload) = name.strip_prefix(UNROLL_MARKER) {
            return payload.parse().map(Self::Unroll).map_err(|_| MalformedMarkSnafu { name }.build());
        }
        Ok(Self::Custom(name.to_string()))
    }
}
