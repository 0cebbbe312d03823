//! `pagemark` crate (library surface).
//!
//! The primary entrypoint for end users is the `pagemark` binary. This library module
//! exists so embedders can reach the core types and the in-process implementation
//! without depending on internal crate layout.

pub use pagemark_core as core;
pub use pagemark_local as local;
