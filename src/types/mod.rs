//! Value types shared by the sequencer, the dispatcher and ledger clients

mod address;
mod transaction;

pub use address::Address;
pub use transaction::{TransactionDraft, TransactionRecord, TransactionSigner};
