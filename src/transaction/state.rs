//! Transaction lifecycle states.

use std::fmt;

/// State of a replicated write transaction.
///
/// `Doomed` and `Stale` are terminal. Ending a transaction is not a
/// state: an ended transaction is simply removed from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Registered, no frames written yet.
    Pending,
    /// One or more non-commit frame batches written.
    Writing,
    /// A commit frame batch was written.
    Written,
    /// Rolled back.
    Undone,
    /// Hit a fatal error; unusable.
    Doomed,
    /// Abandoned by a deposed leader; a connection left in this state
    /// ignores trailing hook calls.
    Stale,
}

impl TxnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TxnState::Doomed | TxnState::Stale)
    }

    /// Whether the machine allows moving from `self` to `to`.
    ///
    /// `Stale` is reachable from any non-terminal state, but only on
    /// leader transactions.
    pub(super) fn allows(self, to: TxnState, is_leader: bool) -> bool {
        if to == TxnState::Stale {
            return is_leader && !self.is_terminal();
        }
        match self {
            TxnState::Pending => matches!(
                to,
                TxnState::Writing | TxnState::Written | TxnState::Undone
            ),
            TxnState::Writing => matches!(
                to,
                TxnState::Writing | TxnState::Written | TxnState::Undone | TxnState::Doomed
            ),
            TxnState::Written | TxnState::Undone => to == TxnState::Doomed,
            TxnState::Doomed | TxnState::Stale => false,
        }
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxnState::Pending => "pending",
            TxnState::Writing => "writing",
            TxnState::Written => "written",
            TxnState::Undone => "undone",
            TxnState::Doomed => "doomed",
            TxnState::Stale => "stale",
        };
        f.write_str(name)
    }
}
