//! Status report: a snapshot of every cascade in flight, swapped atomically
//! and announced through an epoch counter.

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::watch;

use crate::cascade::Stage;

#[derive(Debug, Clone, Serialize)]
pub struct CascadeStatus {
    pub namespace: String,
    pub stage: Stage,
    pub pending_kinds: Vec<String>,
    pub passes: u32,
    /// Failed passes since the last one that made progress.
    pub retries: u32,
    pub deleted: u64,
    pub elapsed_ms: u64,
    pub last_error: Option<String>,
    pub stuck: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CascadeReport {
    pub epoch: u64,
    /// Sorted by namespace name.
    pub cascades: Vec<CascadeStatus>,
    pub stuck: usize,
    pub completed: u64,
    pub failed_passes: u64,
}

impl CascadeReport {
    pub fn get(&self, namespace: &str) -> Option<&CascadeStatus> { self.cascades.iter().find(|c| c.namespace == namespace) }

    pub fn stuck_namespaces(&self) -> impl Iterator<Item = &str> { self.cascades.iter().filter(|c| c.stuck).map(|c| c.namespace.as_str()) }
}

/// Read side of the report.
#[derive(Clone)]
pub struct StatusHandle {
    snap: Arc<ArcSwap<CascadeReport>>,
    epoch_rx: watch::Receiver<u64>,
}

impl StatusHandle {
    pub fn current(&self) -> Arc<CascadeReport> { self.snap.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }
}

pub(crate) struct ReportPublisher {
    snap: Arc<ArcSwap<CascadeReport>>,
    epoch_tx: watch::Sender<u64>,
    epoch: u64,
}

impl ReportPublisher {
    pub(crate) fn new() -> (Self, StatusHandle) {
        let snap = Arc::new(ArcSwap::from_pointee(CascadeReport::default()));
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        (Self { snap: snap.clone(), epoch_tx, epoch: 0 }, StatusHandle { snap, epoch_rx })
    }

    pub(crate) fn publish(&mut self, mut report: CascadeReport) {
        self.epoch = self.epoch.saturating_add(1);
        report.epoch = self.epoch;
        report.cascades.sort_by(|a, b| a.namespace.cmp(&b.namespace));
        self.snap.store(Arc::new(report));
        let _ = self.epoch_tx.send(self.epoch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(ns: &str, stuck: bool) -> CascadeStatus {
        CascadeStatus {
            namespace: ns.into(),
            stage: Stage::Draining,
            pending_kinds: vec!["v1/Pod".into()],
            passes: 3,
            retries: 2,
            deleted: 0,
            elapsed_ms: 10,
            last_error: None,
            stuck,
        }
    }

    #[tokio::test]
    async fn publish_swaps_snapshot_and_bumps_epoch() {
        let (mut publisher, handle) = ReportPublisher::new();
        let mut rx = handle.subscribe_epoch();
        assert_eq!(handle.current().epoch, 0);

        publisher.publish(CascadeReport { cascades: vec![status("b", true), status("a", false)], stuck: 1, ..Default::default() });
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
        let r = handle.current();
        assert_eq!(r.epoch, 1);
        assert_eq!(r.cascades[0].namespace, "a");
        assert_eq!(r.stuck_namespaces().collect::<Vec<_>>(), vec!["b"]);
        assert!(r.get("b").is_some());

        let v = serde_json::to_value(&*r).unwrap();
        assert_eq!(v["cascades"][1]["stage"], "Draining");
    }
}
