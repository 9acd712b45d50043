//! # nestplane-id
//!
//! Typed identifiers for the nestplane controller.
//!
//! Names (cluster name, namespace) are user-controlled and are what the
//! controller keys its registry on. IDs are system-generated and stable: a
//! cluster keeps its `ClusterUid` for its whole life, so a delete followed by
//! a re-create under the same name is distinguishable.
//!
//! ## ID Format
//!
//! `{prefix}_{ulid}`, for example:
//! - `cls_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `act_01HV4Z3MXNKPQR9HSTZ7WCLD4E`

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
