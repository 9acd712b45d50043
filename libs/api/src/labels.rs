//! Label sets identifying the objects that belong to one cluster.
//!
//! Every object the controller creates for a cluster carries these labels, so
//! the set can be enumerated and torn down without separate bookkeeping.

use std::collections::BTreeMap;

/// Object labels.
pub type Labels = BTreeMap<String, String>;

/// Label key carrying the owning cluster's name.
pub const CLUSTER_LABEL: &str = "nestplane_cluster";

/// Label key carrying the control-plane component name.
pub const COMPONENT_LABEL: &str = "component";

/// The label set shared by all objects owned by `cluster_name`.
pub fn labels_for_cluster(cluster_name: &str) -> Labels {
    Labels::from([
        ("app".to_string(), "nestplane".to_string()),
        ("tier".to_string(), "control-plane".to_string()),
        (CLUSTER_LABEL.to_string(), cluster_name.to_string()),
    ])
}

/// Equality-based selector: every selector pair must be present in `labels`.
pub fn selector_matches(selector: &Labels, labels: &Labels) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
}
