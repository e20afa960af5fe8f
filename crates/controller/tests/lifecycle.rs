#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nslife_controller::{AdapterRegistry, Controller, ControllerConfig};
use nslife_core::fanout::join_bounded;
use nslife_core::prelude::*;
use nslife_core::wait::poll_until;
use nslife_queue::Backoff;
use nslife_store::{pods, service_accounts, services, KindFault, MemoryAdapter, MemoryStore, MemoryStoreConfig, DEFAULT_SERVICE_ACCOUNT};

fn config() -> ControllerConfig {
    ControllerConfig {
        workers: 10,
        adapter_concurrency: 4,
        resync: Duration::from_millis(100),
        backoff: Backoff::exact(Duration::from_millis(1), Duration::from_millis(20)),
        stuck_after_retries: 10,
        stuck_after: Duration::from_secs(300),
        list_page_size: 7,
        report_interval: Duration::from_millis(10),
    }
}

fn registry(store: &Arc<MemoryStore>) -> AdapterRegistry {
    AdapterRegistry::builder()
        .register(MemoryAdapter::new(store.clone(), pods()))
        .unwrap()
        .register(MemoryAdapter::new(store.clone(), services()))
        .unwrap()
        .register(MemoryAdapter::new(store.clone(), service_accounts()))
        .unwrap()
        .build()
}

async fn wait_gone(store: &Arc<MemoryStore>, name: &str, timeout: Duration) {
    let s = store.clone();
    let name = name.to_string();
    poll_until(Duration::from_millis(10), timeout, || {
        let s = s.clone();
        let name = name.clone();
        async move {
            match s.get_namespace(&name).await {
                Err(e) if e.is_not_found() => Ok(true),
                Ok(_) => Ok(false),
                Err(e) => Err(e),
            }
        }
    })
    .await
    .expect("namespace removed");
}

#[tokio::test]
async fn empty_namespace_is_removed() {
    let store = MemoryStore::new(MemoryStoreConfig::default());
    store.create_namespace("empty").await.unwrap();
    let ctl = Controller::new(store.clone(), registry(&store), config());
    let handle = ctl.start();

    let ns = ctl.tracker().request_deletion("empty").await.unwrap();
    assert_eq!(ns.phase, Phase::Terminating);
    wait_gone(&store, "empty", Duration::from_secs(5)).await;
    handle.shutdown_and_wait().await.unwrap();
}

#[tokio::test]
async fn pods_with_grace_period_are_removed_before_the_namespace() {
    let store = MemoryStore::new(MemoryStoreConfig { provision_service_account: Some(Duration::from_millis(20)) });
    store.create_namespace("nsdeletetest").await.unwrap();
    let ctl = Controller::new(store.clone(), registry(&store), config());
    let handle = ctl.start();

    let s = store.clone();
    poll_until(Duration::from_millis(5), Duration::from_secs(5), || {
        let s = s.clone();
        async move { Ok::<_, StoreError>(s.get_item(&service_accounts(), "nsdeletetest", DEFAULT_SERVICE_ACCOUNT).is_ok()) }
    })
    .await
    .expect("default service account provisioned");

    let grace = Duration::from_millis(300);
    store.create_item_with_grace(&pods(), "nsdeletetest", "test-pod", grace).unwrap();
    ctl.tracker().request_deletion("nsdeletetest").await.unwrap();

    // Deleting the namespace forbids new items right away.
    let late = store.create_item(&pods(), "nsdeletetest", "late-pod").unwrap_err();
    assert!(matches!(late, StoreError::Forbidden(_)));

    wait_gone(&store, "nsdeletetest", Duration::from_secs(60) + grace).await;
    assert!(store.get_item(&pods(), "nsdeletetest", "test-pod").unwrap_err().is_not_found());
    assert_eq!(store.count_in_namespace("nsdeletetest"), 0);
    handle.shutdown_and_wait().await.unwrap();
}

#[tokio::test]
async fn services_are_removed() {
    let store = MemoryStore::new(MemoryStoreConfig::default());
    store.create_namespace("nsdeletetest").await.unwrap();
    store.create_item(&services(), "nsdeletetest", "test-service").unwrap();
    let ctl = Controller::new(store.clone(), registry(&store), config());
    let handle = ctl.start();

    ctl.tracker().request_deletion("nsdeletetest").await.unwrap();
    wait_gone(&store, "nsdeletetest", Duration::from_secs(60)).await;
    assert!(store.get_item(&services(), "nsdeletetest", "test-service").unwrap_err().is_not_found());
    handle.shutdown_and_wait().await.unwrap();
}

#[tokio::test]
async fn deleting_a_missing_namespace_is_not_found() {
    let store = MemoryStore::new(MemoryStoreConfig::default());
    let ctl = Controller::new(store.clone(), registry(&store), config());
    let err = ctl.tracker().request_deletion("ghost").await.unwrap_err();
    assert!(err.is_not_found());
    assert!(ctl.queue().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_deletion_requests_transition_once() {
    let store = MemoryStore::new(MemoryStoreConfig::default());
    store.create_namespace("dup").await.unwrap();
    store.create_item(&pods(), "dup", "p").unwrap();
    store.inject_conflicts(2);
    let ctl = Controller::new(store.clone(), registry(&store), config());

    let tracker = ctl.tracker();
    let results = join_bounded(8, (0..8).map(|_| {
        let t = tracker.clone();
        async move { t.request_deletion("dup").await }
    }))
    .await
    .expect("every request succeeds");
    assert!(results.iter().all(|ns| ns.is_terminating()));
    let deletion_ts: HashSet<_> = results.iter().map(|ns| ns.deletion_ts).collect();
    assert_eq!(deletion_ts.len(), 1, "deletion timestamp is set exactly once");
    let stored = store.get_namespace("dup").await.unwrap();
    assert_eq!(stored.finalizers.as_slice(), ["v1/Pod".to_string(), "v1/Service".to_string(), "v1/ServiceAccount".to_string()]);
    assert_eq!(ctl.queue().len(), 1);

    let handle = ctl.start();
    wait_gone(&store, "dup", Duration::from_secs(5)).await;
    let status = ctl.status();
    poll_until(Duration::from_millis(5), Duration::from_secs(2), || {
        let done = status.current().completed;
        async move { Ok::<_, StoreError>(done >= 1) }
    })
    .await
    .unwrap();
    assert_eq!(status.current().completed, 1);
    handle.shutdown_and_wait().await.unwrap();
}

#[tokio::test]
async fn failing_kind_does_not_block_other_kinds_and_is_reported_stuck() {
    let store = MemoryStore::new(MemoryStoreConfig::default());
    store.create_namespace("wedged").await.unwrap();
    store.create_item(&pods(), "wedged", "p1").unwrap();
    store.create_item(&pods(), "wedged", "p2").unwrap();
    store.create_item(&services(), "wedged", "s1").unwrap();
    store.set_fault(&services(), KindFault { fail_list: true, ..Default::default() });

    let cfg = ControllerConfig { stuck_after_retries: 3, ..config() };
    let ctl = Controller::new(store.clone(), registry(&store), cfg);
    let handle = ctl.start();
    ctl.tracker().request_deletion("wedged").await.unwrap();

    let status = ctl.status();
    poll_until(Duration::from_millis(5), Duration::from_secs(5), || {
        let stuck = status.current().get("wedged").map(|c| c.stuck).unwrap_or(false);
        async move { Ok::<_, StoreError>(stuck) }
    })
    .await
    .expect("cascade reported stuck");

    let report = status.current();
    let wedged = report.get("wedged").unwrap();
    assert_eq!(wedged.pending_kinds, vec!["v1/Service"]);
    assert!(wedged.last_error.as_deref().unwrap_or("").contains("injected fault"));
    assert_eq!(report.stuck, 1);
    assert!(store.list_in_namespace(&pods(), "wedged").unwrap().is_empty());
    assert_eq!(store.get_namespace("wedged").await.unwrap().finalizers.as_slice(), ["v1/Service".to_string()]);

    store.clear_faults();
    wait_gone(&store, "wedged", Duration::from_secs(5)).await;
    poll_until(Duration::from_millis(5), Duration::from_secs(2), || {
        let cleared = status.current().get("wedged").is_none();
        async move { Ok::<_, StoreError>(cleared) }
    })
    .await
    .expect("finished cascade leaves the report");
    handle.shutdown_and_wait().await.unwrap();
}

#[tokio::test]
async fn terminating_namespaces_resume_after_restart() {
    let store = MemoryStore::new(MemoryStoreConfig::default());
    store.create_namespace("resume").await.unwrap();
    store.create_item(&pods(), "resume", "p").unwrap();
    {
        // First process marks the namespace and exits before draining it.
        let first = Controller::new(store.clone(), registry(&store), config());
        first.tracker().request_deletion("resume").await.unwrap();
    }
    assert!(store.get_namespace("resume").await.unwrap().is_terminating());
    assert_eq!(store.count_in_namespace("resume"), 1);

    let second = Controller::new(store.clone(), registry(&store), config());
    let handle = second.start();
    wait_gone(&store, "resume", Duration::from_secs(5)).await;
    assert_eq!(store.count_in_namespace("resume"), 0);
    handle.shutdown_and_wait().await.unwrap();
}

/// Pod adapter that records overlapping list calls for the same namespace and
/// fails every third call.
struct Exclusive {
    inner: MemoryAdapter,
    active: Mutex<HashSet<String>>,
    calls: AtomicUsize,
    overlaps: AtomicUsize,
}

#[async_trait::async_trait]
impl DeletionAdapter for Exclusive {
    fn kind(&self) -> &ResourceKind { self.inner.kind() }

    async fn list_page(&self, namespace: &str, continue_token: Option<&str>, limit: usize) -> StoreResult<ListPage> {
        if !self.active.lock().unwrap().insert(namespace.to_string()) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
        let res = self.inner.list_page(namespace, continue_token, limit).await;
        self.active.lock().unwrap().remove(namespace);
        if self.calls.fetch_add(1, Ordering::SeqCst) % 3 == 2 {
            return Err(StoreError::Transient("flaky list".into()));
        }
        res
    }

    async fn delete(&self, namespace: &str, name: &str) -> StoreResult<()> { self.inner.delete(namespace, name).await }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn at_most_one_cascade_per_namespace() {
    let store = MemoryStore::new(MemoryStoreConfig::default());
    let ex = Arc::new(Exclusive {
        inner: MemoryAdapter::new(store.clone(), pods()),
        active: Mutex::new(HashSet::new()),
        calls: AtomicUsize::new(0),
        overlaps: AtomicUsize::new(0),
    });
    let reg = AdapterRegistry::builder().register_arc(ex.clone()).unwrap().build();
    let names: Vec<String> = (0..20).map(|i| format!("excl-{}", i)).collect();
    for n in &names {
        store.create_namespace(n).await.unwrap();
        for p in 0..3 {
            store.create_item(&pods(), n, &format!("p{}", p)).unwrap();
        }
    }

    let ctl = Controller::new(store.clone(), reg, config());
    let handle = ctl.start();
    let tracker = ctl.tracker();
    // Every namespace is requested twice while workers are already running.
    join_bounded(10, names.iter().chain(names.iter()).map(|n| {
        let t = tracker.clone();
        let n = n.clone();
        async move { t.request_deletion(&n).await }
    }))
    .await
    .expect("deletion requests");

    for n in &names {
        wait_gone(&store, n, Duration::from_secs(10)).await;
    }
    assert_eq!(ex.overlaps.load(Ordering::SeqCst), 0);
    assert!(ex.calls.load(Ordering::SeqCst) >= names.len());
    handle.shutdown_and_wait().await.unwrap();
}

/// Pod adapter that tracks how many namespaces are being listed at once.
struct Overlap {
    inner: MemoryAdapter,
    active: Mutex<HashSet<String>>,
    peak: AtomicUsize,
}

#[async_trait::async_trait]
impl DeletionAdapter for Overlap {
    fn kind(&self) -> &ResourceKind { self.inner.kind() }

    async fn list_page(&self, namespace: &str, continue_token: Option<&str>, limit: usize) -> StoreResult<ListPage> {
        {
            let mut active = self.active.lock().unwrap();
            active.insert(namespace.to_string());
            self.peak.fetch_max(active.len(), Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        let res = self.inner.list_page(namespace, continue_token, limit).await;
        self.active.lock().unwrap().remove(namespace);
        res
    }

    async fn delete(&self, namespace: &str, name: &str) -> StoreResult<()> { self.inner.delete(namespace, name).await }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn draining_cascades_never_exceed_the_worker_count() {
    let store = MemoryStore::new(MemoryStoreConfig::default());
    let overlap = Arc::new(Overlap { inner: MemoryAdapter::new(store.clone(), pods()), active: Mutex::new(HashSet::new()), peak: AtomicUsize::new(0) });
    let reg = AdapterRegistry::builder().register_arc(overlap.clone()).unwrap().build();
    let names: Vec<String> = (0..12).map(|i| format!("bound-{}", i)).collect();
    for n in &names {
        store.create_namespace(n).await.unwrap();
        store.create_item(&pods(), n, "p").unwrap();
    }

    let ctl = Controller::new(store.clone(), reg, ControllerConfig { workers: 2, ..config() });
    let handle = ctl.start();
    let tracker = ctl.tracker();
    join_bounded(12, names.iter().map(|n| {
        let t = tracker.clone();
        let n = n.clone();
        async move { t.request_deletion(&n).await }
    }))
    .await
    .expect("deletion requests");

    for n in &names {
        wait_gone(&store, n, Duration::from_secs(10)).await;
    }
    let peak = overlap.peak.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "{} namespaces drained at once", peak);
    handle.shutdown_and_wait().await.unwrap();
}

/// Pod adapter that fails every call for one namespace.
struct FailIn {
    inner: MemoryAdapter,
    namespace: &'static str,
}

impl FailIn {
    fn check(&self, namespace: &str) -> StoreResult<()> {
        if namespace == self.namespace {
            return Err(StoreError::Transient(format!("pods in {} unavailable", namespace)));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl DeletionAdapter for FailIn {
    fn kind(&self) -> &ResourceKind { self.inner.kind() }

    async fn list_page(&self, namespace: &str, continue_token: Option<&str>, limit: usize) -> StoreResult<ListPage> {
        self.check(namespace)?;
        self.inner.list_page(namespace, continue_token, limit).await
    }

    async fn delete(&self, namespace: &str, name: &str) -> StoreResult<()> {
        self.check(namespace)?;
        self.inner.delete(namespace, name).await
    }
}

#[tokio::test]
async fn wedged_namespace_does_not_hold_up_others() {
    let store = MemoryStore::new(MemoryStoreConfig::default());
    let reg = AdapterRegistry::builder()
        .register(FailIn { inner: MemoryAdapter::new(store.clone(), pods()), namespace: "wedged" })
        .unwrap()
        .register(MemoryAdapter::new(store.clone(), services()))
        .unwrap()
        .build();
    for n in ["wedged", "healthy"] {
        store.create_namespace(n).await.unwrap();
        store.create_item(&pods(), n, "p").unwrap();
        store.create_item(&services(), n, "s").unwrap();
    }

    let ctl = Controller::new(store.clone(), reg, ControllerConfig { stuck_after_retries: 3, ..config() });
    let handle = ctl.start();
    ctl.tracker().request_deletion("wedged").await.unwrap();
    ctl.tracker().request_deletion("healthy").await.unwrap();

    wait_gone(&store, "healthy", Duration::from_secs(5)).await;
    assert_eq!(store.count_in_namespace("healthy"), 0);

    let status = ctl.status();
    poll_until(Duration::from_millis(5), Duration::from_secs(5), || {
        let stuck = status.current().get("wedged").map(|c| c.stuck).unwrap_or(false);
        async move { Ok::<_, StoreError>(stuck) }
    })
    .await
    .expect("wedged cascade reported stuck");

    let wedged = store.get_namespace("wedged").await.unwrap();
    assert!(wedged.is_terminating());
    assert_eq!(wedged.finalizers.as_slice(), ["v1/Pod".to_string()]);
    assert_eq!(store.list_in_namespace(&pods(), "wedged").unwrap().len(), 1);
    assert!(store.list_in_namespace(&services(), "wedged").unwrap().is_empty());
    assert_eq!(status.current().stuck_namespaces().collect::<Vec<_>>(), vec!["wedged"]);
    handle.shutdown_and_wait().await.unwrap();
}
