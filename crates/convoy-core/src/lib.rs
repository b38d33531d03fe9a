//! Core domain types and traits for Convoy.
//!
//! This crate contains:
//! - The resource graph of provisioning units and their output references
//! - Pipeline, stage and action definitions with their validation rules
//! - The artifact channel that hands payloads from stage to stage
//! - Collaborator traits for providers, source control, builders and deployers

pub mod artifact;
pub mod builder;
pub mod deployer;
pub mod error;
pub mod id;
pub mod pipeline;
pub mod provider;
pub mod repository;
pub mod stack;

pub use error::{Error, Result};
pub use id::RunId;
