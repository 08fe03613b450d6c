//! Per-account nonce sequencing and batched dispatch for nonce-ordered ledgers
//!
//! Each sending account gets an [`AddressSequencer`] that hands out gap-free
//! nonces ahead of the ledger, detects gaps, and decides when a transaction
//! may replace another at the same nonce. The [`DispatchCoordinator`] batches
//! signed transactions per account and submits them in nonce order.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod tx;
pub mod types;

pub use dispatch::{DispatchCoordinator, DispatchPhase, ReconciliationSupervisor};
pub use error::{SequencerError, SequencerResult};
pub use ledger::{AccountLedgerClient, InMemoryLedger, LedgerError, SubmissionOutcome};
pub use tx::{AddressSequencer, GasPricePolicy, SequencerRegistry};
pub use types::{Address, TransactionDraft, TransactionRecord, TransactionSigner};
