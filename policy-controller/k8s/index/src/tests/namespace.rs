use super::*;
use crate::namespace::Error;
use netpol_controller_core::{
    memory::MemoryStore, Acl, AclLoggingLevels, AddressSetFactory, AddressSetRow, Severity, Store,
    StoreError,
};
use netpol_controller_k8s_api::annotations;
use std::time::Duration;
use tokio::{sync::Semaphore, task, time};

/// Wraps a `MemoryStore` so that address set destruction waits for a permit.
struct GatedDestroy {
    inner: Arc<MemoryStore>,
    permits: Semaphore,
}

#[async_trait::async_trait]
impl Store for GatedDestroy {
    async fn ensure_address_set(&self, row: AddressSetRow) -> Result<(), StoreError> {
        self.inner.ensure_address_set(row).await
    }

    async fn add_addresses(&self, name: &str, addresses: &[IpAddr]) -> Result<(), StoreError> {
        self.inner.add_addresses(name, addresses).await
    }

    async fn remove_addresses(&self, name: &str, addresses: &[IpAddr]) -> Result<(), StoreError> {
        self.inner.remove_addresses(name, addresses).await
    }

    async fn destroy_address_set(&self, name: &str) -> Result<(), StoreError> {
        let _permit = self.permits.acquire().await.unwrap();
        self.inner.destroy_address_set(name).await
    }

    async fn list_address_sets(&self, owner_type: &str) -> Result<Vec<AddressSetRow>, StoreError> {
        self.inner.list_address_sets(owner_type).await
    }

    async fn ensure_acls(&self, acls: &[Acl]) -> Result<(), StoreError> {
        self.inner.ensure_acls(acls).await
    }

    async fn list_acls(&self) -> Result<Vec<Acl>, StoreError> {
        self.inner.list_acls().await
    }

    async fn attach(&self, point: &str, acl_ids: &[String]) -> Result<(), StoreError> {
        self.inner.attach(point, acl_ids).await
    }

    async fn detach(&self, point: &str, acl_ids: &[String]) -> Result<(), StoreError> {
        self.inner.detach(point, acl_ids).await
    }
}

#[tokio::test]
async fn ensure_seeds_address_set_with_pod_ips() {
    let _trace = init_tracing();
    let test = TestConfig::default();
    test.lookups.add_pod(mk_pod("namespace1", "pod-0", "10.128.0.5"));
    test.lookups.add_pod({
        let mut pod = mk_pod("namespace1", "pod-1", "10.0.0.1");
        pod.spec.as_mut().unwrap().host_network = Some(true);
        pod
    });
    test.lookups.add_pod({
        let mut pod = mk_pod("namespace1", "pod-2", "10.128.0.6");
        pod.status.as_mut().unwrap().phase = Some("Succeeded".to_string());
        pod
    });
    test.lookups.add_pod(mk_pod("namespace2", "pod-0", "10.128.0.7"));

    // The namespace object is unknown, so configuration is deferred.
    let state = test
        .controller
        .namespaces()
        .ensure_locked("namespace1", None)
        .await
        .expect("ensure must succeed");
    assert_eq!(state.address_set().hash_names(), (NAMESPACE1_V4, ""));
    assert_eq!(state.acl_logging(), AclLoggingLevels::default());
    assert_eq!(test.lookups.fetches.load(Ordering::SeqCst), 1);
    drop(state);

    let row = test.store.address_set(NAMESPACE1_V4).unwrap();
    assert_eq!(row.addresses, Some(ip("10.128.0.5")).into_iter().collect());
}

#[tokio::test]
async fn ensure_configures_from_cache_then_api() {
    let test = TestConfig::with(|c| c.acl_logging_enabled = true);
    test.lookups.cache(mk_namespace(
        "ns-0",
        &[(annotations::ACL_LOGGING, r#"{"allow": "info", "deny": "alert"}"#)],
    ));
    test.lookups.serve(mk_namespace(
        "ns-1",
        &[(annotations::ACL_LOGGING, r#"{"deny": "warning"}"#)],
    ));

    let ns0 = test
        .controller
        .namespaces()
        .ensure_locked("ns-0", None)
        .await
        .unwrap();
    assert_eq!(
        ns0.acl_logging(),
        AclLoggingLevels {
            allow: Some(Severity::Info),
            deny: Some(Severity::Alert),
        }
    );
    assert_eq!(test.lookups.fetches.load(Ordering::SeqCst), 0);
    drop(ns0);

    let ns1 = test
        .controller
        .namespaces()
        .ensure_locked("ns-1", None)
        .await
        .unwrap();
    assert_eq!(
        ns1.acl_logging(),
        AclLoggingLevels {
            allow: None,
            deny: Some(Severity::Warning),
        }
    );
    assert_eq!(test.lookups.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn read_guards_are_shared() {
    let test = TestConfig::with(|c| c.acl_logging_enabled = true);
    let ns = mk_namespace(
        "ns-0",
        &[(annotations::ACL_LOGGING, r#"{"allow": "notice"}"#)],
    );

    let manager = test.controller.namespaces();
    let first = manager.ensure_locked_read("ns-0", Some(&ns)).await.unwrap();
    assert_eq!(first.acl_logging().allow, Some(Severity::Notice));

    let second = manager
        .get_locked_read("ns-0")
        .await
        .expect("namespace must exist");
    assert_eq!(second.address_set().hash_names(), first.address_set().hash_names());
    assert_eq!(
        test.controller.namespace_acl_logging("ns-0").await.allow,
        Some(Severity::Notice)
    );
    assert_eq!(
        test.controller.namespace_acl_logging("unknown").await,
        AclLoggingLevels::default()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_ensures_create_state_once() {
    let test = TestConfig::default();
    test.lookups.add_pod(mk_pod("ns-0", "pod-0", "10.128.0.5"));

    let tasks = (0..16)
        .map(|i| {
            let controller = test.controller.clone();
            task::spawn(async move {
                if i % 2 == 0 {
                    controller
                        .namespaces()
                        .ensure_locked("ns-0", None)
                        .await
                        .map(|_| ())
                } else {
                    controller
                        .namespaces()
                        .ensure_locked_read("ns-0", None)
                        .await
                        .map(|_| ())
                }
            })
        })
        .collect::<Vec<_>>();
    for task in tasks {
        task.await.unwrap().expect("ensure must succeed");
    }

    // The cluster is IPv4-only, so creating the namespace's address set writes exactly one row.
    assert_eq!(test.store.calls("ensure_address_set"), 1);
    assert_eq!(test.store.address_sets().len(), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn ensure_fails_if_namespace_is_removed_while_waiting() {
    let _trace = init_tracing();
    let test = TestConfig::default();
    drop(
        test.controller
            .namespaces()
            .ensure_locked("ns-0", None)
            .await
            .unwrap(),
    );

    // Hold the namespace so that both the deletion and the ensure queue up behind it.
    let held = test.controller.namespaces().get_locked("ns-0").await.unwrap();

    let deleting = task::spawn({
        let controller = test.controller.clone();
        async move {
            controller
                .namespaces()
                .delete_locked("ns-0")
                .await
                .map(|state| state.is_some())
        }
    });
    for _ in 0..4 {
        task::yield_now().await;
    }

    let ensuring = task::spawn({
        let controller = test.controller.clone();
        async move {
            controller
                .namespaces()
                .ensure_locked("ns-0", None)
                .await
                .map(|_| ())
        }
    });
    for _ in 0..4 {
        task::yield_now().await;
    }

    drop(held);
    assert!(deleting.await.unwrap().expect("delete must succeed"));
    match ensuring.await.unwrap() {
        Err(Error::RemovedDuringEnsure(ns)) => assert_eq!(ns, "ns-0"),
        res => panic!("unexpected result: {res:?}"),
    }
    assert!(test.store.address_sets().is_empty());

    // The next ensure starts over with fresh state.
    drop(
        test.controller
            .namespaces()
            .ensure_locked("ns-0", None)
            .await
            .unwrap(),
    );
    assert_eq!(test.store.address_sets().len(), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn ensure_reads_namespace_after_locking() {
    let test = TestConfig::with(|c| c.acl_logging_enabled = true);
    test.lookups.cache(mk_namespace("ns-0", &[]));
    drop(
        test.controller
            .namespaces()
            .ensure_locked("ns-0", None)
            .await
            .unwrap(),
    );

    let mut held = test.controller.namespaces().get_locked("ns-0").await.unwrap();
    let exclusive = task::spawn({
        let controller = test.controller.clone();
        async move {
            controller
                .namespaces()
                .ensure_locked("ns-0", None)
                .await
                .map(|state| state.acl_logging())
        }
    });
    let shared = task::spawn({
        let controller = test.controller.clone();
        async move {
            controller
                .namespaces()
                .ensure_locked_read("ns-0", None)
                .await
                .map(|state| state.acl_logging())
        }
    });
    for _ in 0..4 {
        task::yield_now().await;
    }

    // The namespace is annotated while both ensures wait on the lock. Neither may overwrite the
    // new levels with the object it would have seen before locking.
    let annotated = mk_namespace("ns-0", &[(annotations::ACL_LOGGING, r#"{"deny": "alert"}"#)]);
    test.lookups.cache(annotated.clone());
    test.controller
        .namespaces()
        .configure(&mut held, &annotated)
        .await
        .unwrap();
    drop(held);

    for levels in [exclusive.await.unwrap(), shared.await.unwrap()] {
        assert_eq!(levels.unwrap().deny, Some(Severity::Alert));
    }
    assert_eq!(
        test.controller.namespace_acl_logging("ns-0").await.deny,
        Some(Severity::Alert)
    );
}

#[tokio::test(flavor = "current_thread")]
async fn delete_does_not_block_other_namespaces() {
    let store = Arc::new(MemoryStore::default());
    let gated = Arc::new(GatedDestroy {
        inner: store.clone(),
        permits: Semaphore::new(0),
    });
    let lookups = Arc::new(TestLookups::default());
    let controller = Arc::new(Controller::new(
        mk_cluster(&["10.128.0.0/14"]),
        gated.clone(),
        lookups.clone(),
        lookups,
    ));
    drop(controller.namespaces().ensure_locked("ns-0", None).await.unwrap());

    let deleting = task::spawn({
        let controller = controller.clone();
        async move { controller.delete_namespace("ns-0").await }
    });
    for _ in 0..4 {
        task::yield_now().await;
    }
    assert!(!deleting.is_finished());

    // The deletion is stuck in the store; other namespaces remain available.
    let ns1 = time::timeout(
        Duration::from_secs(5),
        controller.namespaces().ensure_locked("ns-1", None),
    )
    .await
    .expect("ensure must not wait on the deletion")
    .unwrap();
    drop(ns1);
    assert_eq!(store.address_sets().len(), 2);

    gated.permits.add_permits(1);
    deleting.await.unwrap().expect("delete must succeed");
    assert!(controller.namespaces().get_locked("ns-0").await.is_none());
    assert_eq!(store.address_sets().len(), 1);
}

#[tokio::test]
async fn get_does_not_create() {
    let test = TestConfig::default();
    assert!(test.controller.namespaces().get_locked("ns-0").await.is_none());
    assert!(test
        .controller
        .namespaces()
        .get_locked_read("ns-0")
        .await
        .is_none());
    assert!(test.store.address_sets().is_empty());
}

#[tokio::test]
async fn failed_delete_keeps_state() {
    let test = TestConfig::default();
    drop(
        test.controller
            .namespaces()
            .ensure_locked("ns-0", None)
            .await
            .unwrap(),
    );

    test.store.fail_next("destroy_address_set");
    test.controller
        .delete_namespace("ns-0")
        .await
        .expect_err("delete must fail");
    assert!(test.controller.namespaces().get_locked("ns-0").await.is_some());

    test.controller.delete_namespace("ns-0").await.unwrap();
    assert!(test.controller.namespaces().get_locked("ns-0").await.is_none());
    assert!(test.store.address_sets().is_empty());

    // Deleting an unknown namespace is not an error.
    test.controller.delete_namespace("ns-0").await.unwrap();
}

#[tokio::test]
async fn failed_create_inserts_nothing() {
    let test = TestConfig::default();
    test.store.fail_next("ensure_address_set");
    match test
        .controller
        .namespaces()
        .ensure_locked("ns-0", None)
        .await
    {
        Err(Error::CreateAddressSet { ns, .. }) => assert_eq!(ns, "ns-0"),
        res => panic!("unexpected result: {:?}", res.map(|_| ())),
    }
    assert!(test.controller.namespaces().get_locked("ns-0").await.is_none());
}

#[tokio::test]
async fn sync_removes_orphaned_address_sets() {
    let test = TestConfig::default();
    for ns in ["ns-0", "ns-1"] {
        drop(
            test.controller
                .namespaces()
                .ensure_locked(ns, None)
                .await
                .unwrap(),
        );
    }
    assert_eq!(test.store.address_sets().len(), 2);

    let observed = vec![mk_namespace("ns-1", &[])];
    test.controller.sync_namespaces(&observed).await.unwrap();
    let (ns1, _) = AddressSetFactory::new(test.store.clone(), true, false)
        .hash_names(&test.controller.namespaces().address_set_ids("ns-1"));
    let rows = test.store.address_sets();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].name, ns1);

    // The vanished namespace's state is gone too, so it is rebuilt if the namespace reappears.
    assert!(test.controller.namespaces().get_locked("ns-0").await.is_none());

    // Re-running the sync is harmless.
    test.controller.sync_namespaces(&observed).await.unwrap();
    assert_eq!(test.store.address_sets().len(), 1);

    test.controller
        .add_pod(&mk_pod("ns-0", "pod-0", "10.128.0.5"))
        .await
        .expect("pod must be added to a recreated address set");
    let (ns0, _) = AddressSetFactory::new(test.store.clone(), true, false)
        .hash_names(&test.controller.namespaces().address_set_ids("ns-0"));
    let row = test.store.address_set(&ns0).expect("address set must be recreated");
    assert_eq!(row.addresses, Some(ip("10.128.0.5")).into_iter().collect());
}

#[tokio::test]
async fn multicast_follows_annotation() {
    let test = TestConfig::with(|c| c.multicast_support = true);
    let enabled = mk_namespace("ns-0", &[(annotations::MULTICAST_ENABLED, "true")]);

    test.controller.add_namespace(&enabled).await.unwrap();
    assert_eq!(test.store.attached("mcast_ns-0").len(), 2);
    assert!(
        test.controller
            .namespaces()
            .get_locked_read("ns-0")
            .await
            .unwrap()
            .multicast_enabled()
    );

    test.controller
        .update_namespace(&mk_namespace("ns-0", &[]))
        .await
        .unwrap();
    assert!(test.store.attached("mcast_ns-0").is_empty());

    // A failed enable leaves the flag unset so that the next update retries.
    test.store.fail_next("attach");
    test.controller
        .update_namespace(&enabled)
        .await
        .expect_err("enable must fail");
    assert!(
        !test
            .controller
            .namespaces()
            .get_locked_read("ns-0")
            .await
            .unwrap()
            .multicast_enabled()
    );
    test.controller.update_namespace(&enabled).await.unwrap();
    assert_eq!(test.store.attached("mcast_ns-0").len(), 2);

    // Startup sync detaches the policies of namespaces that no longer declare multicast.
    test.controller
        .sync_namespaces(&[mk_namespace("ns-0", &[])])
        .await
        .unwrap();
    assert!(test.store.attached("mcast_ns-0").is_empty());
}

#[tokio::test]
async fn multicast_ignored_without_support() {
    let test = TestConfig::default();
    test.controller
        .add_namespace(&mk_namespace(
            "ns-0",
            &[(annotations::MULTICAST_ENABLED, "true")],
        ))
        .await
        .unwrap();
    assert!(test.store.attached("mcast_ns-0").is_empty());
}

#[tokio::test]
async fn external_gateways_are_parsed() {
    let test = TestConfig::default();
    test.controller
        .add_namespace(&mk_namespace(
            "ns-0",
            &[
                (annotations::ROUTING_EXTERNAL_GWS, "192.0.2.1, 192.0.2.2,bogus"),
                (annotations::BFD_ENABLED, ""),
            ],
        ))
        .await
        .unwrap();

    let state = test
        .controller
        .namespaces()
        .get_locked_read("ns-0")
        .await
        .unwrap();
    let gws = state.external_gateways();
    assert_eq!(
        gws.gateways.iter().copied().collect::<Vec<_>>(),
        vec![ip("192.0.2.1"), ip("192.0.2.2")]
    );
    assert!(gws.bfd_enabled);
}
