//! Integration tests for a single cluster actor driven through its handle.

use std::sync::Arc;
use std::time::Duration;

use nestplane_api::{ClusterPhase, ClusterResource, ReleaseCatalog, SemanticVersion, CLUSTER_LABEL};
use nestplane_operator::actors::ActorError;
use nestplane_operator::context::ClusterContext;
use nestplane_operator::memory::MemoryBackend;
use nestplane_operator::store::ClusterStore;
use nestplane_operator::{ActorSettings, ClusterHandle};
use nestplane_reconcile::PollPolicy;

const WAIT: Duration = Duration::from_secs(5);

fn fast_settings() -> ActorSettings {
    ActorSettings {
        reconcile_interval: Duration::from_millis(20),
        poll: PollPolicy::new(Duration::from_millis(5), Duration::from_millis(500)),
        status_retry_interval: Duration::from_millis(5),
        ..ActorSettings::default()
    }
}

fn context(backend: &MemoryBackend, settings: ActorSettings) -> Arc<ClusterContext> {
    backend.context(settings, ReleaseCatalog::default())
}

async fn settle(handle: &ClusterHandle) -> Option<ClusterPhase> {
    handle
        .wait_for_phase(
            |p| matches!(p, ClusterPhase::Running | ClusterPhase::Failed),
            WAIT,
        )
        .await
}

#[tokio::test]
async fn test_create_provisions_every_piece() {
    let backend = MemoryBackend::new();
    backend.endpoints.set_unassigned_polls(2);
    let stored = backend
        .store
        .insert(ClusterResource::new("db1", "team-a").with_version("stable"))
        .await;

    let handle = ClusterHandle::spawn(stored, context(&backend, fast_settings()));
    assert_eq!(settle(&handle).await, Some(ClusterPhase::Running));

    assert!(backend.datastores.contains("team-a", "db1-etcd").await);
    let endpoint = backend
        .endpoints
        .spec("team-a", "db1-kube-apiserver")
        .await
        .unwrap();
    assert_eq!(endpoint.ports.len(), 1);
    assert_eq!(endpoint.ports[0].port, 443);

    let requests = backend.credentials.requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].hostname, "db1.team-a.example.com");
    assert_eq!(requests[0].version, SemanticVersion::new(1, 9, 11));

    let route = backend.objects.route("team-a", "ingress-db1").await.unwrap();
    assert_eq!(route.host, "db1.team-a.example.com");
    assert_eq!(route.service_name, "db1-kube-apiserver");

    for workload in backend.objects.workloads("team-a").await {
        assert_eq!(workload.replicas, 1);
        assert!(!workload.template.host_network);
        assert_eq!(workload.labels.get(CLUSTER_LABEL).map(String::as_str), Some("db1"));
    }
}

#[tokio::test]
async fn test_second_cluster_reuses_namespace_credentials() {
    let backend = MemoryBackend::new();
    let ctx = context(&backend, fast_settings());

    let first = backend
        .store
        .insert(ClusterResource::new("db1", "team-a").with_version("v1.9.11"))
        .await;
    let second = backend
        .store
        .insert(ClusterResource::new("db2", "team-a").with_version("v1.9.11"))
        .await;
    let first = ClusterHandle::spawn(first, ctx.clone());
    assert_eq!(settle(&first).await, Some(ClusterPhase::Running));
    let second = ClusterHandle::spawn(second, ctx);
    assert_eq!(settle(&second).await, Some(ClusterPhase::Running));

    assert_eq!(backend.credentials.provision_calls(), 2);
    assert_eq!(backend.credentials.generated(), 1);
    assert_eq!(backend.objects.workloads("team-a").await.len(), 6);
}

#[tokio::test]
async fn test_running_resource_is_resumed_without_provisioning() {
    let backend = MemoryBackend::new();
    let mut resource = ClusterResource::new("db1", "team-a").with_version("v1.9.11");
    resource.status.set_phase(ClusterPhase::Running);
    let stored = backend.store.insert(resource).await;

    let handle = ClusterHandle::spawn(stored, context(&backend, fast_settings()));

    assert_eq!(settle(&handle).await, Some(ClusterPhase::Running));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(handle.is_running());
    assert_eq!(backend.provisioning_calls(), 0);
}

#[tokio::test]
async fn test_interrupted_create_fails_the_cluster() {
    let backend = MemoryBackend::new();
    let mut resource = ClusterResource::new("db1", "team-a").with_version("v1.9.11");
    resource.status.set_phase(ClusterPhase::Creating);
    let stored = backend.store.insert(resource).await;

    let mut handle = ClusterHandle::spawn(stored, context(&backend, fast_settings()));

    assert_eq!(settle(&handle).await, Some(ClusterPhase::Failed));
    tokio::time::timeout(WAIT, handle.join()).await.unwrap();
    let latest = backend.store.get("team-a", "db1").await.unwrap();
    assert_eq!(latest.status.phase, ClusterPhase::Failed);
    assert!(latest.status.reason.is_some());
    assert_eq!(backend.provisioning_calls(), 0);
    assert_eq!(backend.stats.snapshot().clusters_failed, 1);
}

#[tokio::test]
async fn test_datastore_timeout_fails_the_cluster() {
    let backend = MemoryBackend::new();
    backend.datastores.set_never_ready(true);
    let settings = ActorSettings {
        poll: PollPolicy::new(Duration::from_millis(5), Duration::from_millis(40)),
        ..fast_settings()
    };
    let stored = backend
        .store
        .insert(ClusterResource::new("db1", "team-a").with_version("v1.9.11"))
        .await;

    let handle = ClusterHandle::spawn(stored, context(&backend, settings));

    assert_eq!(settle(&handle).await, Some(ClusterPhase::Failed));
    assert_eq!(backend.endpoints.ensure_calls(), 0);
    let latest = backend.store.get("team-a", "db1").await.unwrap();
    assert_eq!(latest.status.phase, ClusterPhase::Failed);
}

#[tokio::test]
async fn test_paused_cluster_is_left_alone() {
    let backend = MemoryBackend::new();
    let stored = backend
        .store
        .insert(ClusterResource::new("db1", "team-a").with_version("v1.9.11"))
        .await;
    let handle = ClusterHandle::spawn(stored, context(&backend, fast_settings()));
    assert_eq!(settle(&handle).await, Some(ClusterPhase::Running));

    let paused = backend
        .store
        .modify("team-a", "db1", |r| r.spec.paused = true)
        .await
        .unwrap();
    handle.update(paused).await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    let writes = backend.store.update_calls();
    let ticks = backend.stats.snapshot().reconcile_ticks;

    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(backend.stats.snapshot().reconcile_ticks > ticks);
    assert_eq!(backend.store.update_calls(), writes);
    assert!(handle.is_running());
}

#[tokio::test]
async fn test_double_stop_is_harmless() {
    let backend = MemoryBackend::new();
    let stored = backend
        .store
        .insert(ClusterResource::new("db1", "team-a").with_version("v1.9.11"))
        .await;
    let mut handle = ClusterHandle::spawn(stored.clone(), context(&backend, fast_settings()));
    assert_eq!(settle(&handle).await, Some(ClusterPhase::Running));

    assert!(handle.stop());
    assert!(!handle.stop());
    tokio::time::timeout(WAIT, handle.join()).await.unwrap();
    assert!(!handle.is_running());

    let err = handle.update(stored).await.unwrap_err();
    assert!(matches!(err, ActorError::ActorStopped));
}

#[tokio::test]
async fn test_full_queue_blocks_until_stop() {
    let backend = MemoryBackend::new();
    backend.datastores.set_never_ready(true);
    let settings = ActorSettings {
        poll: PollPolicy::new(Duration::from_millis(5), Duration::from_secs(30)),
        event_queue_capacity: 1,
        ..fast_settings()
    };
    let stored = backend
        .store
        .insert(ClusterResource::new("db1", "team-a").with_version("v1.9.11"))
        .await;
    let handle = Arc::new(ClusterHandle::spawn(stored.clone(), context(&backend, settings)));

    // the actor is stuck in setup, so the first event fills the queue
    handle.update(stored.clone()).await.unwrap();
    assert_eq!(handle.queued(), 1);

    let blocked = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.update(stored).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished());

    handle.stop();
    let result = tokio::time::timeout(WAIT, blocked).await.unwrap().unwrap();
    assert!(matches!(result, Err(ActorError::ActorStopped)));
    handle.abort();
}

#[tokio::test]
async fn test_delete_reports_what_was_removed() {
    let backend = MemoryBackend::new();
    let stored = backend
        .store
        .insert(ClusterResource::new("db1", "team-a").with_version("v1.9.11"))
        .await;
    let mut handle = ClusterHandle::spawn(stored, context(&backend, fast_settings()));
    assert_eq!(settle(&handle).await, Some(ClusterPhase::Running));

    let report = handle.delete().await;

    assert!(report.is_clean());
    assert_eq!(report.workloads_deleted, 3);
    assert!(report.datastore_deleted);
    tokio::time::timeout(WAIT, handle.join()).await.unwrap();
    // endpoint and route are left in place
    assert!(backend.objects.route("team-a", "ingress-db1").await.is_some());
    assert!(backend.endpoints.spec("team-a", "db1-kube-apiserver").await.is_some());
}
