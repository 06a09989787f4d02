//! AST construction, emission and driver tests.

pub mod property;
