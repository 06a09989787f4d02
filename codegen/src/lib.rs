//! Lowering of scheduled polyhedral kernels to the host statement IR.
//!
//! The [`Scop`] driver runs the GPU scheduling passes, builds a polyhedral
//! AST from the final schedule tree and hands it to the GPU emitter, which
//! produces a [`polygpu_ir::Stmt`] with realize scopes and thread-extent
//! attributes.
//!
//! # Module Organization
//!
//! - [`ast`] - Loop/conditional/mark/user AST nodes
//! - [`node_info`] - Per-user-node iterator maps and build contexts
//! - [`ast_build`] - Schedule tree to AST
//! - [`gpu_emitter`] - AST to statement tree
//! - [`scop`] - Pass driver with the coincidence restart

pub mod ast;
pub mod ast_build;
pub mod error;
pub mod gpu_emitter;
pub mod node_info;
pub mod scop;

#[cfg(test)]
pub mod test;

pub use ast::AstNode;
pub use ast_build::build_ast;
pub use error::{Error, Result};
pub use gpu_emitter::{GpuAxis, GpuEmitter};
pub use node_info::{NodeInfo, NodeInfoRepo};
pub use scop::{Lowered, Scop};
