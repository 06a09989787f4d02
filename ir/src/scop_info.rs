//! Per-kernel compilation state shared by the scheduling passes and the emitter.

use std::collections::{BTreeMap, BTreeSet};

use polygpu_dtype::{MemType, ScalarDType};
use snafu::OptionExt;

use crate::config::UserConfig;
use crate::context::CompileContext;
use crate::error::*;
use crate::expr::Expr;
use crate::kernel::{Access, Kernel, ReduceOp};
use crate::mapping::{Mapping, MappingCfg};
use crate::mark::{Mark, ReduceMark};

/// Bounding box of a tensor's accesses below one schedule node.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorFootprintCluster {
    pub tensor: String,
    /// Lower corner per tensor dimension, over outer schedule dimensions.
    pub offsets: Vec<Expr>,
    pub extents: Vec<i64>,
    /// `(statement, access)` pairs the box covers.
    pub accesses: Vec<(String, Access)>,
    /// Some element is touched by more than one instance below the node.
    pub reused: bool,
    pub read: bool,
    pub written: bool,
}

impl TensorFootprintCluster {
    pub fn is_valid(&self) -> bool {
        !self.accesses.is_empty() && self.extents.iter().all(|e| *e >= 1)
    }

    pub fn elements(&self) -> i64 {
        self.extents.iter().product()
    }
}

/// Promotion record of one tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferDefInfo {
    pub tensor_id: String,
    pub dst_tensor_id: String,
    pub src_mem: MemType,
    pub dst_mem: MemType,
    pub data_stream: Vec<(String, MemType)>,
    pub footprints_cluster: Option<TensorFootprintCluster>,
    /// Buffer shape after bank-conflict and alignment padding.
    pub sizes: Vec<i64>,
    pub dtype: ScalarDType,
    pub find_buffer: bool,
}

impl BufferDefInfo {
    pub fn new(tensor: &str, dst_mem: MemType, dtype: ScalarDType) -> Self {
        let dst = dst_mem.promoted_name(tensor);
        Self {
            tensor_id: tensor.to_string(),
            dst_tensor_id: dst.clone(),
            src_mem: MemType::Global,
            dst_mem,
            data_stream: vec![(tensor.to_string(), MemType::Global), (dst, dst_mem)],
            footprints_cluster: None,
            sizes: Vec::new(),
            dtype,
            find_buffer: false,
        }
    }

    pub fn bytes(&self) -> usize {
        self.sizes.iter().product::<i64>().max(0) as usize * self.dtype.bytes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceDirection {
    /// Reduction over the innermost iterator (rows, or everything).
    X,
    /// Reduction over an outer iterator (columns).
    Y,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReduceInfo {
    pub stmt: String,
    pub op: ReduceOp,
    pub tensor: String,
    pub direction: ReduceDirection,
    pub mark: Option<ReduceMark>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomicInfo {
    pub tensor_name: String,
    pub op: ReduceOp,
}

/// Results accumulated by the passes, consumed by later passes and the emitter.
#[derive(Debug, Clone, Default)]
pub struct AnalysisResult {
    pub buffer_defs: Vec<BufferDefInfo>,
    pub reduce_infos: BTreeMap<String, ReduceInfo>,
    pub atomic_tensors: Vec<AtomicInfo>,
    /// `(mark, mapping)` for every mapping filter inserted, in insertion order.
    pub mappings: Vec<(Mark, Mapping)>,
    pub replace_cfgs: BTreeMap<String, MappingCfg>,
    pub active_buffer_footprints: Vec<(String, TensorFootprintCluster)>,
    pub shared_tensor_bits: BTreeMap<String, usize>,
    /// `(original tensor, promoted buffer)`.
    pub promoted_binds: Vec<(String, String)>,
    pub use_reduce_lib: bool,
    pub is_reduce: bool,
    pub is_matmul: bool,
    pub is_tensor_core: bool,
    pub need_restart: bool,
    pub relax_coincidence: bool,
}

impl AnalysisResult {
    pub fn record_mapping(&mut self, mark: Mark, mapping: Mapping) {
        self.mappings.push((mark, mapping));
    }

    pub fn record_atomic(&mut self, info: AtomicInfo) {
        if !self.atomic_tensors.contains(&info) {
            self.atomic_tensors.push(info);
        }
    }

    pub fn atomic_op(&self, tensor: &str) -> Option<ReduceOp> {
        self.atomic_tensors.iter().find(|a| a.tensor_name == tensor).map(|a| a.op)
    }

    pub fn reduce_tensors(&self) -> BTreeSet<String> {
        self.reduce_infos.values().map(|r| r.tensor.clone()).collect()
    }

    pub fn reduce_direction(&self) -> Option<ReduceDirection> {
        self.reduce_infos.values().next().map(|r| r.direction)
    }

    pub fn buffer_def(&self, tensor: &str) -> Option<&BufferDefInfo> {
        self.buffer_defs.iter().find(|b| b.tensor_id == tensor)
    }

    pub fn replace_cfg(&self, name: &str) -> Result<&MappingCfg> {
        self.replace_cfgs.get(name).context(UnknownReplaceCfgSnafu { name })
    }
}

/// Everything known about one kernel during its compilation.
#[derive(Debug, Clone)]
pub struct ScopInfo {
    pub kernel: Kernel,
    pub config: UserConfig,
    pub analysis: AnalysisResult,
    pub ctx: CompileContext,
}

impl ScopInfo {
    pub fn new(kernel: Kernel, config: UserConfig) -> Self {
        let analysis = AnalysisResult { use_reduce_lib: config.use_reduce_lib, ..Default::default() };
        Self { kernel, config, analysis, ctx: CompileContext::new() }
    }

    pub fn block_cfg(&self) -> Result<&MappingCfg> {
        self.config.block_cfg.as_ref().context(MissingMappingCfgSnafu { kind: "block" })
    }

    pub fn thread_cfg(&self) -> Result<&MappingCfg> {
        self.config.thread_cfg.as_ref().context(MissingMappingCfgSnafu { kind: "thread" })
    }

    /// Bytes per element of `tensor`.
    pub fn bytes(&self, tensor: &str) -> Result<usize> {
        Ok(self.kernel.tensor(tensor)?.bytes())
    }
}
