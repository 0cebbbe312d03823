//! Public facade crate for `pagemark`.
//!
//! This crate contains no document or transport logic.
//! It re-exports the context-agnostic types/traits from `pagemark-core`.

pub use pagemark_core::*;
