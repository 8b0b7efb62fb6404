use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommandError {
    /// The bytes do not decode to a well-formed command. Applying a
    /// corrupt command is fatal; the log never contains one unless
    /// storage is damaged.
    #[error("corrupt command: {0}")]
    Corrupt(String),
}

impl CommandError {
    pub(super) fn corrupt(detail: impl Into<String>) -> Self {
        CommandError::Corrupt(detail.into())
    }
}

pub type CommandResult<T> = Result<T, CommandError>;
