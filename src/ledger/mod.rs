//! Remote ledger collaborator
//!
//! The sequencer only needs four things from the network:
//! - the next expected nonce of an account
//! - the minimum gas price accepted by the network
//! - single and bulk transaction submission

pub mod memory;

pub use memory::InMemoryLedger;

use crate::error::{SequencerError, SequencerResult};
use crate::types::{Address, TransactionRecord};

use async_trait::async_trait;
use std::future::Future;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Failures of the ledger transport itself
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("rejected by node: {0}")]
    Rejected(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Per-transaction result of a submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    /// Accepted by the node, with the transaction identifier
    Accepted(String),
    /// Refused by the node, with its reason
    Rejected(String),
}

impl SubmissionOutcome {
    pub fn into_result(self, nonce: u64) -> SequencerResult<String> {
        match self {
            SubmissionOutcome::Accepted(id) => Ok(id),
            SubmissionOutcome::Rejected(reason) => Err(SequencerError::Rejected { nonce, reason }),
        }
    }
}

/// Read and write access to account state on the network
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccountLedgerClient: Send + Sync {
    /// Next nonce the ledger expects from `address`
    async fn get_account_nonce(&self, address: &Address) -> LedgerResult<u64>;

    async fn get_network_minimum_gas_price(&self) -> LedgerResult<u64>;

    async fn send_transaction(&self, tx: &TransactionRecord) -> LedgerResult<String>;

    /// Partial success is allowed; outcomes are index-aligned with `txs`
    async fn send_transactions(
        &self,
        txs: &[TransactionRecord],
    ) -> LedgerResult<Vec<SubmissionOutcome>>;
}

/// Race a ledger call against a cancellation token
pub(crate) async fn with_cancel<T, F>(
    cancel: &CancellationToken,
    operation: &str,
    call: F,
) -> SequencerResult<T>
where
    F: Future<Output = LedgerResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SequencerError::cancelled(operation)),
        result = call => result.map_err(SequencerError::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_cancel_prefers_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = with_cancel(&cancel, "get account", async { Ok::<_, LedgerError>(5) }).await;
        assert_eq!(result, Err(SequencerError::cancelled("get account")));
    }

    #[tokio::test]
    async fn test_with_cancel_maps_ledger_errors() {
        let cancel = CancellationToken::new();
        let result: SequencerResult<u64> = with_cancel(&cancel, "get account", async {
            Err(LedgerError::Transport("connection refused".into()))
        })
        .await;

        assert!(matches!(
            result,
            Err(SequencerError::Ledger(LedgerError::Transport(_)))
        ));
    }

    #[test]
    fn test_outcome_into_result() {
        assert_eq!(
            SubmissionOutcome::Accepted("abc".into()).into_result(1),
            Ok("abc".to_string())
        );
        assert_eq!(
            SubmissionOutcome::Rejected("nonce too low".into()).into_result(1),
            Err(SequencerError::Rejected {
                nonce: 1,
                reason: "nonce too low".into()
            })
        );
    }
}
