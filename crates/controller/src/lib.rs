//! nslife controller: tracks namespace phases and drains terminating
//! namespaces through the registered deletion adapters.
//!
//! Wiring: the [`PhaseTracker`] watches namespaces and queues every
//! terminating one; the [`CascadePool`] workers pull keys off the shared
//! [`WorkQueue`] and run drain passes until the namespace is removed.

#![forbid(unsafe_code)]

use std::sync::Arc;

use nslife_core::NamespaceStore;
use nslife_queue::WorkQueue;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub mod cascade;
pub mod config;
pub mod error;
pub mod pool;
pub mod registry;
pub mod report;
pub mod tracker;

pub use cascade::{CascadeProgress, Cascader, PassOutcome, Stage};
pub use config::ControllerConfig;
pub use error::{ControllerError, Result};
pub use pool::CascadePool;
pub use registry::{AdapterRegistry, RegistryBuilder};
pub use report::{CascadeReport, CascadeStatus, StatusHandle};
pub use tracker::{mark_terminating, PhaseTracker};

pub struct Controller {
    tracker: Arc<PhaseTracker>,
    pool: Arc<CascadePool>,
    queue: Arc<WorkQueue>,
    status: StatusHandle,
    config: ControllerConfig,
    adapters: usize,
}

impl Controller {
    pub fn new(store: Arc<dyn NamespaceStore>, registry: AdapterRegistry, config: ControllerConfig) -> Self {
        let adapters = registry.len();
        let queue = Arc::new(WorkQueue::new(config.backoff.clone()));
        let tracker = Arc::new(PhaseTracker::new(store.clone(), queue.clone(), registry.finalizers(), config.resync));
        let cascader = Cascader::new(store, registry, config.adapter_concurrency, config.list_page_size);
        let (pool, status) = CascadePool::new(cascader, queue.clone(), config.clone());
        Self { tracker, pool: Arc::new(pool), queue, status, config, adapters }
    }

    /// Entry point for deletion requests; usable before and after `start`.
    pub fn tracker(&self) -> Arc<PhaseTracker> { self.tracker.clone() }

    pub fn status(&self) -> StatusHandle { self.status.clone() }

    pub fn queue(&self) -> Arc<WorkQueue> { self.queue.clone() }

    /// Spawn the tracker, the workers and the report ticker.
    pub fn start(&self) -> ControllerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks: Vec<(&'static str, JoinHandle<Result<()>>)> = Vec::with_capacity(self.config.workers + 2);

        let tracker = self.tracker.clone();
        let rx = shutdown_rx.clone();
        tasks.push(("tracker", tokio::spawn(async move { tracker.run(rx).await })));

        for id in 0..self.config.workers.max(1) {
            let pool = self.pool.clone();
            let rx = shutdown_rx.clone();
            tasks.push(("worker", tokio::spawn(async move { pool.run_worker(id, rx).await })));
        }

        let pool = self.pool.clone();
        tasks.push((
            "reporter",
            tokio::spawn(async move {
                pool.run_reporter(shutdown_rx).await;
                Ok(())
            }),
        ));

        info!(workers = self.config.workers, adapters = self.adapters, "controller started");
        ControllerHandle { shutdown_tx, queue: self.queue.clone(), tasks }
    }
}

pub struct ControllerHandle {
    shutdown_tx: watch::Sender<bool>,
    queue: Arc<WorkQueue>,
    tasks: Vec<(&'static str, JoinHandle<Result<()>>)>,
}

impl ControllerHandle {
    /// Stop taking new work. Passes already running finish first.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.queue.shut_down();
    }

    /// Wait for every task to exit. Returns the first task failure.
    pub async fn wait(self) -> Result<()> {
        let mut first = None;
        for (name, task) in self.tasks {
            let res = match task.await {
                Ok(r) => r,
                Err(e) => Err(ControllerError::Task(format!("{}: {}", name, e))),
            };
            if let Err(e) = res {
                warn!(task = name, error = %e, "controller task failed");
                first.get_or_insert(e);
            }
        }
        info!("controller stopped");
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn shutdown_and_wait(self) -> Result<()> {
        self.shutdown();
        self.wait().await
    }
}
