//! ID types used by the controller.

use crate::define_id;

define_id!(
    /// Stable unique identity of a cluster resource, assigned at creation.
    ClusterUid,
    "cls"
);

define_id!(
    /// Identity of one actor incarnation; a re-created cluster gets a new one.
    ActorId,
    "act"
);
