//! Transfer Attempt State Machine
//!
//! ```text
//! INIT → VALIDATING → LOCKING → MUTATING → RECORDING → COMMITTED
//!   ↓         ↓           ↓          ↓           ↓
//!   └─────────┴───────────┴──── ABORTED ─────────┘
//! ```
//!
//! Phases live only for the duration of one `transfer` call; nothing here is
//! persisted.

use std::fmt;

use tracing::debug;

use super::error::LedgerError;

/// Phase of a single transfer attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferPhase {
    Init,
    /// Request checks and idempotency reservation
    Validating,
    /// Reading (and for pessimistic, locking) both accounts
    Locking,
    /// Debit and credit being applied
    Mutating,
    /// Transfer record being finalized
    Recording,
    /// Terminal: transaction committed
    Committed,
    /// Terminal: transaction rolled back
    Aborted,
}

impl TransferPhase {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferPhase::Committed | TransferPhase::Aborted)
    }

    /// Legal forward transitions; ABORTED is reachable from every
    /// non-terminal phase.
    pub fn can_transition_to(&self, next: TransferPhase) -> bool {
        use TransferPhase::*;
        match (self, next) {
            (from, Aborted) => !from.is_terminal(),
            (Init, Validating)
            | (Validating, Locking)
            | (Locking, Mutating)
            | (Mutating, Recording)
            | (Recording, Committed) => true,
            // An idempotent replay commits straight after validation
            (Validating, Committed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferPhase::Init => "INIT",
            TransferPhase::Validating => "VALIDATING",
            TransferPhase::Locking => "LOCKING",
            TransferPhase::Mutating => "MUTATING",
            TransferPhase::Recording => "RECORDING",
            TransferPhase::Committed => "COMMITTED",
            TransferPhase::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for TransferPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Tracks the phase of one transfer attempt, keyed by its reference
#[derive(Debug, Clone)]
pub struct TransferAttempt {
    reference: String,
    phase: TransferPhase,
}

impl TransferAttempt {
    pub fn new(reference: &str) -> Self {
        Self {
            reference: reference.to_string(),
            phase: TransferPhase::Init,
        }
    }

    pub fn phase(&self) -> TransferPhase {
        self.phase
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn advance(&mut self, next: TransferPhase) -> Result<(), LedgerError> {
        if !self.phase.can_transition_to(next) {
            return Err(LedgerError::TransactionAborted(format!(
                "invalid transfer phase transition {} -> {} for {}",
                self.phase, next, self.reference
            )));
        }
        debug!(reference = %self.reference, from = %self.phase, to = %next, "Transfer phase");
        self.phase = next;
        Ok(())
    }

    /// Move to ABORTED; a no-op once terminal
    pub fn abort(&mut self) -> TransferPhase {
        let failed_in = self.phase;
        if !self.phase.is_terminal() {
            self.phase = TransferPhase::Aborted;
        }
        failed_in
    }
}
