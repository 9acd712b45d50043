//! nestplane operator library
//!
//! Reconciles declarative cluster resources into running nested control
//! planes. Each resource gets an actor that provisions a datastore, a
//! network endpoint, credentials and control-plane workloads, then keeps
//! reporting status.
//!
//! ## Architecture
//!
//! ```text
//! watch events ──▶ Dispatcher ──spawn / enqueue / delete──▶ ClusterActor(name)
//!                                                             │
//!                      provisioners, object applier ◀─────────┤
//!                      StatusPersister ◀──────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - `actors`: actor framework, cluster actor, dispatcher
//! - `provision`, `objects`, `workload`: external collaborators
//! - `store`, `status`: resource access and optimistic status writes
//! - `memory`: in-memory collaborators

pub mod actors;
pub mod config;
pub mod context;
pub mod error;
pub mod memory;
pub mod objects;
pub mod provision;
pub mod stats;
pub mod status;
pub mod store;
pub mod workload;

pub use actors::{ClusterHandle, Dispatcher};
pub use config::Config;
pub use context::{ActorSettings, ClusterContext};
pub use error::{ClusterError, ControllerError, CreateStep};
