//! Actor framework and the controller's actors.
//!
//! ## Design Principles
//!
//! - **One actor per resource**: each cluster actor owns the held snapshot,
//!   observed status and side effects of a single cluster resource
//! - **Owned snapshots**: the dispatcher hands actors copies, never shared
//!   references
//! - **Bounded queues**: enqueueing waits when an actor's queue is full, and
//!   gives up once the actor is stopped
//! - **Crash isolation**: a failed actor stops alone; its siblings and the
//!   dispatcher keep running
//!
//! ## Actor Types
//!
//! - `ClusterActor`: drives one cluster through create, run and failure
//! - `Dispatcher`: owns the registry and translates notifications

mod cluster;
mod dispatcher;
mod framework;

pub use cluster::{teardown, ClusterActor, ClusterEvent, ClusterHandle, TeardownReport};
pub use dispatcher::{Dispatcher, SLOW_EVENT_THRESHOLD};
pub use framework::{
    spawn_actor, spawn_actor_with_stop, Actor, ActorContext, ActorError, ActorHandle, ActorState,
    Mailbox, Message, StopListener, StopSignal,
};
