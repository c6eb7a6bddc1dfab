use orc_types::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] orc_store::StoreError),
    #[error(transparent)]
    Queue(#[from] orc_queue::QueueError),
    #[error(transparent)]
    Compile(#[from] orc_compiler::CompileError),
    #[error(transparent)]
    Condition(#[from] crate::condition::ConditionError),
    #[error("run {run_id} is not in a state that accepts this operation: {reason}")]
    InvalidState { run_id: String, reason: String },
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::Store(e) => e.kind(),
            SchedulerError::Queue(_) => ErrorKind::Transient,
            SchedulerError::Compile(_) => ErrorKind::Validation,
            SchedulerError::Condition(_) => ErrorKind::Validation,
            SchedulerError::InvalidState { .. } => ErrorKind::Conflict,
        }
    }
}
