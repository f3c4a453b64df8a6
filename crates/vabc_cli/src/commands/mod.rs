//! CLI command implementations.

pub mod apply;
pub mod dump;
