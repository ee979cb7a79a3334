//! `sitesafe-core`: identifiers shared by the job queue and its callers.
//!
//! This crate is free of infrastructure concerns: no database, no runtime.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, OrganizationId};
