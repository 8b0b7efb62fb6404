use thiserror::Error;

use super::state::TxnState;
use crate::engine::EngineError;

#[derive(Debug, Error)]
pub enum TxnError {
    /// A state transition the machine does not allow. Callers treat
    /// this as a programming bug, not a runtime condition.
    #[error("illegal transaction state transition: {from} -> {to}")]
    IllegalTransition { from: TxnState, to: TxnState },

    #[error("engine: {0}")]
    Engine(#[from] EngineError),
}

pub type TxnResult<T> = Result<T, TxnError>;
