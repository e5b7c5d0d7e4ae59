//! Berth domain models.
//!
//! All persisted models carry a monotonic counter which the store uses as an optimistic
//! concurrency guard. Every successful write bumps it by exactly one.

mod application;
mod data_source;
mod node;

pub use application::{validate_version, Application};
pub use data_source::{validate_name, DataSource, DataSourceKind, DataSourceSpec, DEFAULT_INSTANCES, MAX_INSTANCES};
pub use node::{validate_host, Command, DataSourceNode, NodeRole, NodeUpdate};
