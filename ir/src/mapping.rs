//! GPU mapping configurations and recorded mappings.

use std::fmt;

use itertools::Itertools;
use smallvec::SmallVec;
use snafu::ensure;

use crate::error::*;

pub const BLOCKS_CFG: &str = "blocks";
pub const THREADS_CFG: &str = "threads";
pub const WARP_COMPUTE: &str = "warp_compute";
pub const CONV_N: &str = "conv_n";
pub const CONV_H_W: &str = "conv_h_w";
pub const CONV_O: &str = "conv_o";
pub const PROMOTE_PREFIX: &str = "promote_";
const REPLACE_PREFIX: &str = "replace_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CfgKind {
    Blocks,
    Threads,
    ReplaceBlocks,
    ReplaceThreads,
}

impl CfgKind {
    pub fn is_block_level(&self) -> bool {
        matches!(self, Self::Blocks | Self::ReplaceBlocks)
    }

    fn axis_letter(&self) -> char {
        if self.is_block_level() { 'b' } else { 't' }
    }
}

/// Ordered per-axis extents for up to three dimensions; axis 0 is x.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingCfg {
    pub kind: CfgKind,
    pub name: String,
    extents: SmallVec<[i64; 3]>,
}

impl MappingCfg {
    pub fn new(kind: CfgKind, name: impl Into<String>, extents: &[i64]) -> Result<Self> {
        let name = name.into();
        ensure!(extents.len() <= 3, TooManyAxesSnafu { cfg: name.clone(), count: extents.len() });
        for (axis, &extent) in extents.iter().enumerate() {
            ensure!(extent >= 1, NonPositiveExtentSnafu { cfg: name.clone(), axis, extent });
        }
        Ok(Self { kind, name, extents: extents.into() })
    }

    pub fn blocks(extents: &[i64]) -> Result<Self> {
        Self::new(CfgKind::Blocks, BLOCKS_CFG, extents)
    }

    pub fn threads(extents: &[i64]) -> Result<Self> {
        Self::new(CfgKind::Threads, THREADS_CFG, extents)
    }

    /// Parses whitespace-separated extents, x first.
    pub fn parse(kind: CfgKind, name: impl Into<String>, input: &str) -> Result<Self> {
        let extents = input
            .split_whitespace()
            .map(|s| s.parse::<i64>())
            .collect::<std::result::Result<SmallVec<[i64; 3]>, _>>()
            .map_err(|_| ParseMappingCfgSnafu { input }.build())?;
        Self::new(kind, name, &extents)
    }

    pub fn bound(&self) -> usize {
        self.extents.len()
    }

    /// Extent of axis `i`; axes beyond the bound have extent 1.
    pub fn extent(&self, i: usize) -> i64 {
        self.extents.get(i).copied().unwrap_or(1)
    }

    pub fn extents(&self) -> &[i64] {
        &self.extents
    }

    pub fn total(&self) -> i64 {
        self.extents.iter().product()
    }

    /// Identifier bound to axis `i` in schedule expressions.
    pub fn axis_id(&self, i: usize) -> String {
        match self.kind {
            CfgKind::Blocks | CfgKind::Threads => format!("{}{i}", self.kind.axis_letter()),
            CfgKind::ReplaceBlocks | CfgKind::ReplaceThreads => {
                format!("{REPLACE_PREFIX}{}_{}{i}", self.name, self.kind.axis_letter())
            }
        }
    }

    /// Sets every extent to 1.
    pub fn reset(&mut self) {
        self.extents.iter_mut().for_each(|e| *e = 1);
    }
}

impl fmt::Display for MappingCfg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.extents.iter().join(" "))
    }
}

/// Decoded mapped-axis identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AxisId {
    Block(usize),
    Thread(usize),
    Replace { cfg: String, block_level: bool, index: usize },
}

impl AxisId {
    pub fn parse(id: &str) -> Option<Self> {
        if let Some(rest) = id.strip_prefix(REPLACE_PREFIX) {
            let (cfg, axis) = rest.rsplit_once('_')?;
            let (letter, index) = axis.split_at_checked(1)?;
            let index = index.parse().ok()?;
            return match letter {
                "b" => Some(Self::Replace { cfg: cfg.to_string(), block_level: true, index }),
                "t" => Some(Self::Replace { cfg: cfg.to_string(), block_level: false, index }),
                _ => None,
            };
        }
        let (letter, index) = id.split_at_checked(1)?;
        let index = index.parse().ok()?;
        match letter {
            "b" if index < 3 => Some(Self::Block(index)),
            "t" if index < 3 => Some(Self::Thread(index)),
            _ => None,
        }
    }

    /// Position of the axis within its config; 0 is x.
    pub fn index(&self) -> usize {
        match self {
            Self::Block(index) | Self::Thread(index) | Self::Replace { index, .. } => *index,
        }
    }
}

/// One schedule dimension bound to a GPU axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisBinding {
    pub axis: String,
    pub extent: i64,
    /// Schedule depth of the bound member, relative to the mapping filter.
    pub member: usize,
}

/// Axis-to-dimension correspondence recorded by a mapping filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub cfg: String,
    pub bindings: SmallVec<[AxisBinding; 3]>,
}

impl Mapping {
    pub fn binding_for(&self, member: usize) -> Option<&AxisBinding> {
        self.bindings.iter().find(|b| b.member == member)
    }

    pub fn axes(&self) -> impl Iterator<Item = &str> {
        self.bindings.iter().map(|b| b.axis.as_str())
    }
}
