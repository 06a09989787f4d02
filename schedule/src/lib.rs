//! GPU scheduling passes over the polyhedral schedule tree.
//!
//! The passes run in order through a [`PassMgr`]: reductions are isolated,
//! outer bands tiled, tile and point bands mapped onto blocks and threads,
//! and footprints promoted into shared memory.
//!
//! # Module Organization
//!
//! - [`reduce`] - Reduction detection, isolation and sibling rescheduling
//! - [`tile`] - Outer-band tiling and block/thread config derivation
//! - [`mapping`] - Generic, reduction, matmul and convolution mapping strategies
//! - [`footprint`] - Access boxes, reuse and coalescing analysis
//! - [`shared_memory`] - Shared memory promotion and copy mapping
//! - [`dependence`] - Coincidence recomputation from uniform dependences
//! - [`tree_util`] - Schedule tree queries and structural edits

pub mod dependence;
pub mod error;
pub mod footprint;
pub mod mapping;
pub mod pass_mgr;
pub mod reduce;
pub mod shared_memory;
pub mod tile;
pub mod tree_util;


pub use error::{Error, Result};
pub use mapping::MappingOuterBand;
pub use pass_mgr::{PassMgr, PassOutcome, SchedulePass};
pub use reduce::AnalyzeReduce;
pub use shared_memory::SharedMemoryManager;
pub use tile::TileOuterBand;
