use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum RaftError {
    /// This node is not the leader; submissions must go elsewhere.
    #[error("not the leader")]
    NotLeader,

    /// Leadership was lost while a submission was in flight. The entry
    /// may or may not have been committed.
    #[error("leadership lost")]
    LeadershipLost,

    #[error("apply failed: {0}")]
    Apply(String),
}

pub type RaftResult<T> = Result<T, RaftError>;
