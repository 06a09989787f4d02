//! Polyhedral IR for the polygpu GPU back-end.
//!
//! # Module Organization
//!
//! - [`aff`] - Box domains, affine and quasi-affine expressions, schedule inversion
//! - [`expr`] / [`stmt`] - Host statement-tree IR produced by the emitter
//! - [`kernel`] - Tensors, statements and dependences of one kernel
//! - [`tree`] - Persistent schedule tree
//! - [`mark`] - Typed schedule-tree marks
//! - [`mapping`] - Block/thread/replacement mapping configs
//! - [`config`] - User options
//! - [`scop_info`] - Per-kernel analysis state shared across passes

pub mod aff;
pub mod config;
pub mod context;
pub mod error;
pub mod expr;
pub mod kernel;
pub mod mapping;
pub mod mark;
pub mod scop_info;
pub mod stmt;
pub mod tree;


pub use aff::{AffExpr, Interval, Iter, QuasiAff};
pub use config::UserConfig;
pub use context::CompileContext;
pub use error::{Error, Result};
pub use expr::{BinOp, Expr};
pub use kernel::{Access, Dependence, Kernel, MatmulInfo, ReduceOp, Statement, Tensor};
pub use mapping::{AxisBinding, AxisId, CfgKind, Mapping, MappingCfg};
pub use mark::{Mark, ReduceMark};
pub use scop_info::{AnalysisResult, BufferDefInfo, ScopInfo, TensorFootprintCluster};
pub use stmt::{ForKind, Stmt};
pub use tree::{Band, BandMember, Node, NodeKind, Path, ScheduleTree};
