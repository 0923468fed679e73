//! Repository traits and implementations.

pub mod build;
pub mod memory;
pub mod project;

pub use build::{BuildRepo, BuildTransition, PgBuildRepo};
pub use memory::MemoryStore;
pub use project::{NewProject, PgProjectRepo, ProjectRepo};
