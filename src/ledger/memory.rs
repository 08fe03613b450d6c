//! Deterministic in-process ledger used by tests and the simulator

use super::{AccountLedgerClient, LedgerError, LedgerResult, SubmissionOutcome};
use crate::types::{Address, TransactionRecord};

use async_trait::async_trait;
use sha3::{Digest, Keccak256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Default)]
struct LedgerBook {
    nonces: HashMap<Address, u64>,
    /// Latest submission per account and nonce
    mempool: HashMap<Address, BTreeMap<u64, TransactionRecord>>,
    /// Every accepted submission in arrival order
    history: Vec<TransactionRecord>,
    min_gas_price: u64,
    unavailable: bool,
    rejection: Option<String>,
    send_delay: Option<Duration>,
}

/// Ledger that keeps account nonces in memory.
///
/// Accepted transactions wait in a mempool until `execute_pending` moves the
/// account nonce over every contiguous submitted nonce.
#[derive(Default)]
pub struct InMemoryLedger {
    book: Mutex<LedgerBook>,
    nonce_queries: AtomicUsize,
    gas_price_queries: AtomicUsize,
    single_sends: AtomicUsize,
    bulk_sends: AtomicUsize,
}

impl InMemoryLedger {
    pub fn new(min_gas_price: u64) -> Self {
        Self {
            book: Mutex::new(LedgerBook {
                min_gas_price,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub async fn set_nonce(&self, address: &Address, nonce: u64) {
        self.book.lock().await.nonces.insert(address.clone(), nonce);
    }

    pub async fn nonce_of(&self, address: &Address) -> u64 {
        self.book
            .lock()
            .await
            .nonces
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    pub async fn set_min_gas_price(&self, min_gas_price: u64) {
        self.book.lock().await.min_gas_price = min_gas_price;
    }

    /// Fail every call with a transport error while set
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.book.lock().await.unavailable = unavailable;
    }

    /// Reject every submission with `reason` while set
    pub async fn set_rejection(&self, reason: Option<String>) {
        self.book.lock().await.rejection = reason;
    }

    /// Delay applied to each transaction of a submission
    pub async fn set_send_delay(&self, delay: Option<Duration>) {
        self.book.lock().await.send_delay = delay;
    }

    /// Accepted submissions in arrival order
    pub async fn submitted(&self) -> Vec<TransactionRecord> {
        self.book.lock().await.history.clone()
    }

    /// Advance account nonces over contiguous pending transactions.
    ///
    /// Returns the number of transactions executed.
    pub async fn execute_pending(&self) -> usize {
        let mut book = self.book.lock().await;
        let LedgerBook {
            nonces, mempool, ..
        } = &mut *book;

        let mut executed = 0;
        for (address, pending) in mempool.iter_mut() {
            let nonce = nonces.entry(address.clone()).or_insert(0);
            while pending.remove(&*nonce).is_some() {
                *nonce += 1;
                executed += 1;
            }
            // anything left below the account nonce can never execute
            let current = *nonce;
            pending.retain(|n, _| *n >= current);
        }

        executed
    }

    pub fn nonce_queries(&self) -> usize {
        self.nonce_queries.load(Ordering::SeqCst)
    }

    pub fn gas_price_queries(&self) -> usize {
        self.gas_price_queries.load(Ordering::SeqCst)
    }

    pub fn single_sends(&self) -> usize {
        self.single_sends.load(Ordering::SeqCst)
    }

    pub fn bulk_sends(&self) -> usize {
        self.bulk_sends.load(Ordering::SeqCst)
    }

    async fn submit(&self, tx: &TransactionRecord) -> LedgerResult<SubmissionOutcome> {
        let delay = {
            let book = self.book.lock().await;
            if book.unavailable {
                return Err(LedgerError::Transport("ledger unavailable".to_string()));
            }
            book.send_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut book = self.book.lock().await;
        if let Some(reason) = &book.rejection {
            return Ok(SubmissionOutcome::Rejected(reason.clone()));
        }

        let account_nonce = book.nonces.get(tx.sender()).copied().unwrap_or(0);
        if tx.nonce() < account_nonce {
            return Ok(SubmissionOutcome::Rejected(format!(
                "nonce too low: {} < {}",
                tx.nonce(),
                account_nonce
            )));
        }

        let id = transaction_id(tx)?;
        book.mempool
            .entry(tx.sender().clone())
            .or_default()
            .insert(tx.nonce(), tx.clone());
        book.history.push(tx.clone());

        debug!("Ledger accepted {} nonce {} as {}", tx.sender(), tx.nonce(), id);
        Ok(SubmissionOutcome::Accepted(id))
    }

    async fn ensure_available(&self) -> LedgerResult<()> {
        if self.book.lock().await.unavailable {
            return Err(LedgerError::Transport("ledger unavailable".to_string()));
        }
        Ok(())
    }
}

/// Hex keccak-256 over the serialized record, signature included
fn transaction_id(tx: &TransactionRecord) -> LedgerResult<String> {
    let encoded =
        serde_json::to_vec(tx).map_err(|e| LedgerError::InvalidResponse(e.to_string()))?;
    Ok(hex::encode(Keccak256::digest(&encoded)))
}

#[async_trait]
impl AccountLedgerClient for InMemoryLedger {
    async fn get_account_nonce(&self, address: &Address) -> LedgerResult<u64> {
        self.nonce_queries.fetch_add(1, Ordering::SeqCst);
        self.ensure_available().await?;
        Ok(self.nonce_of(address).await)
    }

    async fn get_network_minimum_gas_price(&self) -> LedgerResult<u64> {
        self.gas_price_queries.fetch_add(1, Ordering::SeqCst);
        let book = self.book.lock().await;
        if book.unavailable {
            return Err(LedgerError::Transport("ledger unavailable".to_string()));
        }
        Ok(book.min_gas_price)
    }

    async fn send_transaction(&self, tx: &TransactionRecord) -> LedgerResult<String> {
        self.single_sends.fetch_add(1, Ordering::SeqCst);
        match self.submit(tx).await? {
            SubmissionOutcome::Accepted(id) => Ok(id),
            SubmissionOutcome::Rejected(reason) => Err(LedgerError::Rejected(reason)),
        }
    }

    async fn send_transactions(
        &self,
        txs: &[TransactionRecord],
    ) -> LedgerResult<Vec<SubmissionOutcome>> {
        self.bulk_sends.fetch_add(1, Ordering::SeqCst);
        let mut outcomes = Vec::with_capacity(txs.len());
        for tx in txs {
            outcomes.push(self.submit(tx).await?);
        }
        Ok(outcomes)
    }
}
