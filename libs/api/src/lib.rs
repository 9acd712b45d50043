//! # nestplane-api
//!
//! The declarative `Cluster` resource and the notifications the controller
//! consumes about it.
//!
//! ## Ownership
//!
//! - The notification source is authoritative for `metadata` and `spec`
//! - `status` is written only by the actor that owns the resource
//! - Every write carries the `resource_version` it was based on
//!
//! ## Lifecycle
//!
//! ```text
//! None -> Creating -> Running
//!   |        |          |
//!   +--------+----------+--> Failed (only deletion is accepted afterwards)
//! ```

mod error;
mod event;
mod labels;
mod types;
mod version;

pub use error::ApiError;
pub use event::{WatchEvent, WatchEventType};
pub use labels::{labels_for_cluster, selector_matches, Labels, CLUSTER_LABEL, COMPONENT_LABEL};
pub use types::*;
pub use version::{ReleaseCatalog, ReleaseVersion, SemanticVersion};
