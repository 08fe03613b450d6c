//! Error types for nonce sequencing and dispatch

use crate::ledger::LedgerError;

use thiserror::Error;

/// Main error type for the sequencer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SequencerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Address has no raw bytes")]
    NilAddress,

    #[error("No ledger client configured")]
    NilLedgerClient,

    #[error(
        "Nonce gap for {address}: ledger nonce {ledger_nonce} is below lowest outstanding nonce {lowest_nonce}"
    )]
    NonceGap {
        address: String,
        ledger_nonce: u64,
        lowest_nonce: u64,
    },

    #[error("Transaction with nonce {nonce} is already pending for {address}")]
    DuplicateNonce { address: String, nonce: u64 },

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Transaction with nonce {nonce} rejected: {reason}")]
    Rejected { nonce: u64, reason: String },

    #[error("{operation} cancelled, outcome unknown")]
    Cancelled { operation: String },

    #[error("Dispatcher is closed")]
    Closed,

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SequencerError {
    pub(crate) fn cancelled(operation: impl Into<String>) -> Self {
        SequencerError::Cancelled {
            operation: operation.into(),
        }
    }

    /// Check if the same call may succeed when repeated
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SequencerError::Ledger(LedgerError::Transport(_))
                | SequencerError::Ledger(LedgerError::Timeout { .. })
        )
    }

    /// Check if the transaction may or may not have reached the ledger.
    ///
    /// Callers seeing one of these must consult the ledger nonce before
    /// resubmitting, otherwise the same payload can land twice.
    pub fn requires_reconciliation(&self) -> bool {
        match self {
            SequencerError::Cancelled { .. } => true,
            SequencerError::Ledger(LedgerError::Rejected(_)) => false,
            SequencerError::Ledger(_) => true,
            _ => false,
        }
    }
}

/// Result type for sequencer operations
pub type SequencerResult<T> = Result<T, SequencerError>;
