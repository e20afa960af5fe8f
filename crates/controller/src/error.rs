use nslife_core::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("adapter for kind {0} registered twice")]
    DuplicateAdapter(String),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    /// The work queue stopped while the controller was still meant to run.
    #[error("work queue closed unexpectedly")]
    QueueClosed,
    #[error("controller task failed: {0}")]
    Task(String),
}

pub type Result<T, E = ControllerError> = std::result::Result<T, E>;
