//! Ordered list of schedule passes run over one kernel.

use polygpu_ir::ScopInfo;
use polygpu_ir::tree::ScheduleTree;
use snafu::ResultExt;
use tracing::{debug, info};

use crate::error::*;
use crate::mapping::MappingOuterBand;
use crate::reduce::AnalyzeReduce;
use crate::shared_memory::SharedMemoryManager;
use crate::tile::TileOuterBand;

pub trait SchedulePass {
    fn name(&self) -> &'static str;

    /// Rewrites `tree`; on error the caller keeps the tree it passed in.
    fn run(&mut self, tree: &ScheduleTree, info: &mut ScopInfo) -> Result<ScheduleTree>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome {
    Done(ScheduleTree),
    /// A pass asked for the whole pipeline to rerun with relaxed coincidence.
    Restart,
}

pub struct PassMgr {
    passes: Vec<Box<dyn SchedulePass>>,
}

impl PassMgr {
    pub fn new(passes: Vec<Box<dyn SchedulePass>>) -> Self {
        Self { passes }
    }

    /// Reduce detection, outer-band tiling, block/thread mapping and shared memory promotion.
    pub fn gpu() -> Self {
        Self::new(vec![
            Box::new(AnalyzeReduce),
            Box::new(TileOuterBand),
            Box::new(MappingOuterBand),
            Box::new(SharedMemoryManager::default()),
        ])
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    #[tracing::instrument(skip_all, fields(kernel = %info.kernel.name))]
    pub fn run(&mut self, tree: &ScheduleTree, info: &mut ScopInfo) -> Result<PassOutcome> {
        let mut tree = tree.clone();
        for pass in &mut self.passes {
            let name = pass.name();
            tree = pass.run(&tree, info).context(PassSnafu { pass: name })?;
            debug!(pass = name, "pass finished");
            if info.analysis.need_restart {
                info!(pass = name, "restart requested");
                return Ok(PassOutcome::Restart);
            }
        }
        Ok(PassOutcome::Done(tree))
    }
}
