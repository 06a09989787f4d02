//! Per-kernel driver.
//!
//! [`Scop::transform`] sets the kernel flags, runs the GPU pass list and
//! reruns it once with relaxed coincidence when a pass asks for a restart.
//! [`Scop::gen_stmt`] builds the AST of the final tree and emits it.

use itertools::Itertools;
use polygpu_ir::mapping::MappingCfg;
use polygpu_ir::tree::ScheduleTree;
use polygpu_ir::{AnalysisResult, Kernel, ScopInfo, Stmt, UserConfig};
use polygpu_schedule::{PassMgr, PassOutcome};
use tracing::{debug, info, trace};

use crate::ast_build::build_ast;
use crate::error::*;
use crate::gpu_emitter::{GpuAxis, GpuEmitter};

/// Emitted kernel body with what the caller needs to launch it.
#[derive(Debug, Clone, PartialEq)]
pub struct Lowered {
    pub stmt: Stmt,
    /// `(original tensor, promoted buffer)` pairs.
    pub bindings: Vec<(String, String)>,
    /// Launch extent of every hardware axis the body reads.
    pub launch: Vec<(GpuAxis, i64)>,
}

#[derive(Debug, Clone)]
pub struct Scop {
    info: ScopInfo,
}

impl Scop {
    pub fn new(kernel: Kernel, config: UserConfig) -> Self {
        Self { info: ScopInfo::new(kernel, config) }
    }

    pub fn info(&self) -> &ScopInfo {
        &self.info
    }

    pub fn into_info(self) -> ScopInfo {
        self.info
    }

    /// Runs scheduling and code generation on `tree`.
    pub fn compile(&mut self, tree: &ScheduleTree) -> Result<Lowered> {
        let scheduled = self.transform(tree)?;
        self.gen_stmt(&scheduled)
    }

    /// Schedules `tree` for the GPU.
    ///
    /// A restart request reruns every pass from `tree` with the analysis
    /// cleared and coincidence relaxed; under auto-tiling the block and
    /// thread configs are reset so the rerun derives them again. A second
    /// restart request is an error.
    #[tracing::instrument(skip_all, fields(kernel = %self.info.kernel.name))]
    pub fn transform(&mut self, tree: &ScheduleTree) -> Result<ScheduleTree> {
        self.set_kernel_flags();
        let auto_tiling = self.info.config.auto_tiling();
        let analysis = self.info.analysis.clone();

        if let PassOutcome::Done(scheduled) = PassMgr::gpu().run(tree, &mut self.info)? {
            return Ok(scheduled);
        }

        info!(auto_tiling, "rescheduling with relaxed coincidence");
        self.info.analysis = AnalysisResult { relax_coincidence: true, ..analysis };
        if auto_tiling {
            let config = &mut self.info.config;
            [&mut config.block_cfg, &mut config.thread_cfg].into_iter().flatten().for_each(MappingCfg::reset);
        }
        match PassMgr::gpu().run(tree, &mut self.info)? {
            PassOutcome::Done(scheduled) => Ok(scheduled),
            PassOutcome::Restart => RestartExhaustedSnafu { kernel: self.info.kernel.name.clone() }.fail(),
        }
    }

    /// Builds and emits the statement tree of a scheduled `tree`.
    pub fn gen_stmt(&mut self, tree: &ScheduleTree) -> Result<Lowered> {
        let (ast, repo) = build_ast(tree, &mut self.info)?;
        trace!(%ast, "polyhedral ast");

        let mut emitter = GpuEmitter::new(&self.info, &repo);
        let stmt = emitter.emit(&ast)?;
        let launch = emitter.launch_extents();
        let extents = launch.iter().map(|(axis, extent)| format!("{axis}={extent}")).join(" ");
        debug!(launch = %extents, buffers = self.info.analysis.promoted_binds.len(), "kernel emitted");
        Ok(Lowered { stmt, bindings: self.info.analysis.promoted_binds.clone(), launch })
    }

    /// Reduction, matmul and tensor-core flags read by the passes.
    pub(crate) fn set_kernel_flags(&mut self) {
        let kernel = &self.info.kernel;
        let config = &self.info.config;
        let analysis = &mut self.info.analysis;

        let ops: Vec<_> = kernel.reductions().map(|(_, op)| op).collect();
        let has_reduce = !ops.is_empty();
        let matmul = kernel.matmul.is_some();

        analysis.is_matmul = has_reduce && matmul;
        analysis.is_tensor_core = has_reduce && matmul && config.enable_tensor_core;
        analysis.use_reduce_lib = config.use_reduce_lib && !matmul && !kernel.conv;
        if analysis.use_reduce_lib
            && let Some(op) = ops.iter().find(|op| !op.is_supported())
        {
            info!(%op, "reduction operator not supported by the library, reducing in place");
            analysis.use_reduce_lib = false;
        }
        analysis.is_reduce = has_reduce && analysis.use_reduce_lib;
        debug!(
            is_reduce = analysis.is_reduce,
            is_matmul = analysis.is_matmul,
            is_tensor_core = analysis.is_tensor_core,
            use_reduce_lib = analysis.use_reduce_lib,
            "kernel flags"
        );
    }
}
