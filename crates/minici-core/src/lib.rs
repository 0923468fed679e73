//! Core domain types for the minici build service.
//!
//! This crate contains:
//! - Resource identifiers
//! - Project and build task types
//! - The error taxonomy shared by every other crate

pub mod build;
pub mod error;
pub mod id;

pub use build::{BuildStatus, BuildTask, BuildTaskSummary, Project};
pub use error::{Error, Result};
pub use id::ResourceId;
