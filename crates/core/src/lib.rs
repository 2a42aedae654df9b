//! `jobtrack-core`: domain primitives for tracking remote batch jobs.
//!
//! This crate contains **pure domain** types (no runtime or transport concerns).

pub mod descriptor;
pub mod error;
pub mod id;
pub mod status;

pub use descriptor::JobDescriptor;
pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use status::TaskStatus;
