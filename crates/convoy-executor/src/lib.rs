//! Build and source backends for Convoy.
//!
//! - Docker builder: runs build commands in a container against a checkout
//! - Git source: shallow-clones the configured branch

pub mod docker;
pub mod git;

pub use docker::DockerBuilder;
pub use git::GitSource;
