//! Nonce sequencing for a single account
//!
//! Handles:
//! - Local nonce tracking ahead of the ledger
//! - Nonce gap detection against the lowest outstanding nonce
//! - Replace-if-higher-fee for colliding nonces
//! - Reconciliation of outstanding transactions with the ledger

use super::gas::GasPricePolicy;
use crate::error::{SequencerError, SequencerResult};
use crate::ledger::{with_cancel, AccountLedgerClient};
use crate::metrics;
use crate::types::{Address, TransactionDraft, TransactionRecord};

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A nonce this sequencer still considers in flight
#[derive(Debug, Clone)]
struct Outstanding {
    /// Latest record produced by assignment
    assigned: TransactionRecord,
    /// Record last handed to dispatch, if any
    sent: Option<TransactionRecord>,
}

impl Outstanding {
    fn assigned(record: TransactionRecord) -> Self {
        Self {
            assigned: record,
            sent: None,
        }
    }

    /// The record holding the nonce: the higher priced of the two
    fn occupant(&self) -> &TransactionRecord {
        match &self.sent {
            Some(sent) if sent.gas_price() >= self.assigned.gas_price() => sent,
            _ => &self.assigned,
        }
    }
}

/// Sequencing state of one address
#[derive(Debug, Clone, Default)]
struct SequencerState {
    /// Last nonce handed out
    computed_nonce: u64,
    /// False until bootstrapped from the ledger, and again after a reset
    computed_nonce_set: bool,
    /// Smallest nonce still considered outstanding, never above `computed_nonce`
    lowest_nonce: u64,
    /// Current gas price floor for new transactions
    gas_price: u64,
    /// Nonce at which the floor was last escalated
    nonce_watermark: u64,
    /// Transactions assigned or sent here and not yet seen by the ledger
    outstanding: BTreeMap<u64, Outstanding>,
}

impl SequencerState {
    fn next_nonce(&self, ledger_nonce: u64) -> u64 {
        if !self.computed_nonce_set {
            return ledger_nonce;
        }
        self.computed_nonce.saturating_add(1).max(ledger_nonce)
    }
}

/// Point-in-time view of a sequencer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencerSnapshot {
    pub computed_nonce: u64,
    pub computed_nonce_set: bool,
    pub lowest_nonce: u64,
    pub gas_price: u64,
    pub nonce_watermark: u64,
    pub outstanding: Vec<u64>,
    /// Outstanding nonces that were handed to dispatch
    pub sent: Vec<u64>,
}

/// Hands out nonces for one address.
///
/// The next nonce is `max(last assigned + 1, ledger nonce)`, which keeps
/// concurrent callers from reusing a nonce the ledger has not observed yet.
/// Every assigned transaction is kept until reconciliation shows the ledger
/// has moved past it, so stuck ones can be resent.
pub struct AddressSequencer {
    address: Address,
    client: Arc<dyn AccountLedgerClient>,
    policy: GasPricePolicy,
    state: Mutex<SequencerState>,
}

impl AddressSequencer {
    /// Create a sequencer; nothing is fetched until the first assignment
    pub fn new(
        client: Arc<dyn AccountLedgerClient>,
        address: Address,
        policy: GasPricePolicy,
    ) -> SequencerResult<Self> {
        if address.is_empty() {
            return Err(SequencerError::NilAddress);
        }

        Ok(Self {
            address,
            client,
            policy,
            state: Mutex::new(SequencerState::default()),
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Assign a nonce and gas price to `draft`.
    ///
    /// A draft carrying the nonce of an outstanding transaction replaces it
    /// when priced higher. Otherwise the next nonce is computed against the
    /// ledger. State is only touched once every ledger call has returned, so
    /// a cancelled assignment leaves nothing behind.
    pub async fn assign_nonce_and_gas_price(
        &self,
        cancel: &CancellationToken,
        draft: TransactionDraft,
    ) -> SequencerResult<TransactionRecord> {
        if let Some(nonce) = draft.nonce {
            let mut state = self.state.lock().await;
            if let Some(record) = self.replace_outstanding(&mut state, nonce, &draft)? {
                return Ok(record);
            }
        }

        let ledger_nonce = self.fetch_ledger_nonce(cancel).await?;
        let fresh_floor = self.refresh_floor(cancel, ledger_nonce, 1).await?;

        let mut state = self.state.lock().await;
        self.check_gap(&state, ledger_nonce)?;

        let floor = fresh_floor.unwrap_or(state.gas_price);
        self.commit_next(&mut state, ledger_nonce, floor, draft)
    }

    /// Assign nonces and gas prices to a batch of drafts, in order.
    ///
    /// The ledger nonce is read once and the floor refreshed at most once for
    /// the whole batch. Either every draft is assigned or none is.
    pub async fn assign_nonces_and_gas_price(
        &self,
        cancel: &CancellationToken,
        drafts: Vec<TransactionDraft>,
    ) -> SequencerResult<Vec<TransactionRecord>> {
        if drafts.is_empty() {
            return Ok(Vec::new());
        }

        let ledger_nonce = self.fetch_ledger_nonce(cancel).await?;
        let fresh_floor = self
            .refresh_floor(cancel, ledger_nonce, drafts.len() as u64)
            .await?;

        let mut state = self.state.lock().await;
        self.check_gap(&state, ledger_nonce)?;

        let mut staged = state.clone();
        if let Some(floor) = fresh_floor {
            staged.gas_price = floor;
        }
        let floor = staged.gas_price;

        let mut records = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let replaced = match draft.nonce {
                Some(nonce) => self.replace_outstanding(&mut staged, nonce, &draft)?,
                None => None,
            };
            let record = match replaced {
                Some(record) => record,
                None => self.commit_next(&mut staged, ledger_nonce, floor, draft)?,
            };
            records.push(record);
        }

        *state = staged;
        Ok(records)
    }

    async fn fetch_ledger_nonce(&self, cancel: &CancellationToken) -> SequencerResult<u64> {
        with_cancel(
            cancel,
            "get account nonce",
            self.client.get_account_nonce(&self.address),
        )
        .await
    }

    /// Fetch a new floor if any of the next `count` nonces calls for it
    async fn refresh_floor(
        &self,
        cancel: &CancellationToken,
        ledger_nonce: u64,
        count: u64,
    ) -> SequencerResult<Option<u64>> {
        let refresh = {
            let state = self.state.lock().await;
            let next = state.next_nonce(ledger_nonce);
            (0..count).any(|offset| {
                self.policy.should_refresh(
                    next.saturating_add(offset),
                    state.nonce_watermark,
                    state.gas_price,
                )
            })
        };

        if !refresh {
            return Ok(None);
        }
        self.fetch_gas_floor(cancel).await.map(Some)
    }

    fn check_gap(&self, state: &SequencerState, ledger_nonce: u64) -> SequencerResult<()> {
        if ledger_nonce >= state.lowest_nonce {
            return Ok(());
        }

        metrics::record_nonce_assignment("gap");
        warn!(
            "Nonce gap detected for {}: ledger at {}, lowest outstanding {}",
            self.address, ledger_nonce, state.lowest_nonce
        );
        Err(SequencerError::NonceGap {
            address: self.address.to_string(),
            ledger_nonce,
            lowest_nonce: state.lowest_nonce,
        })
    }

    /// Take the next nonce for `draft` and record it as outstanding
    fn commit_next(
        &self,
        state: &mut SequencerState,
        ledger_nonce: u64,
        floor: u64,
        draft: TransactionDraft,
    ) -> SequencerResult<TransactionRecord> {
        let nonce = state.next_nonce(ledger_nonce);
        if let Some(existing) = state.outstanding.get(&nonce) {
            check_replacement(&self.address, existing.occupant(), draft.gas_price, floor)?;
        }

        state.computed_nonce = nonce;
        state.computed_nonce_set = true;
        state.gas_price = floor;

        let gas_price = floor.max(draft.gas_price);
        let record = TransactionRecord::new(self.address.clone(), nonce, gas_price, draft);
        match state.outstanding.entry(nonce) {
            Entry::Occupied(mut entry) => entry.get_mut().assigned = record.clone(),
            Entry::Vacant(entry) => {
                entry.insert(Outstanding::assigned(record.clone()));
            }
        }

        debug!(
            "Allocated nonce {} for {} at gas price {}",
            nonce, self.address, gas_price
        );
        metrics::record_nonce_assignment("assigned");

        Ok(record)
    }

    /// Replace the outstanding transaction at `nonce`, if there is one
    fn replace_outstanding(
        &self,
        state: &mut SequencerState,
        nonce: u64,
        draft: &TransactionDraft,
    ) -> SequencerResult<Option<TransactionRecord>> {
        let floor = state.gas_price;
        let Some(existing) = state.outstanding.get_mut(&nonce) else {
            return Ok(None);
        };
        check_replacement(&self.address, existing.occupant(), draft.gas_price, floor)?;

        let gas_price = floor.max(draft.gas_price);
        let record = TransactionRecord::new(self.address.clone(), nonce, gas_price, draft.clone());
        existing.assigned = record.clone();

        info!(
            "Replacing transaction {} of {} at gas price {}",
            nonce, self.address, gas_price
        );
        metrics::record_nonce_assignment("replaced");

        Ok(Some(record))
    }

    /// Network minimum gas price; a failed fetch yields 0 so the next
    /// assignment tries again
    async fn fetch_gas_floor(&self, cancel: &CancellationToken) -> SequencerResult<u64> {
        match with_cancel(
            cancel,
            "get network minimum gas price",
            self.client.get_network_minimum_gas_price(),
        )
        .await
        {
            Ok(price) => Ok(price),
            Err(e @ SequencerError::Cancelled { .. }) => Err(e),
            Err(e) => {
                warn!("Failed to refresh gas price floor for {}: {}", self.address, e);
                Ok(0)
            }
        }
    }

    /// Retire transactions the ledger has moved past and return the rest,
    /// in nonce order.
    ///
    /// Calling it again without new assignments changes nothing.
    pub async fn reconcile_with_ledger(
        &self,
        cancel: &CancellationToken,
    ) -> SequencerResult<Vec<TransactionRecord>> {
        let pending = self.reconcile(cancel).await?;
        Ok(pending.iter().map(|o| o.occupant().clone()).collect())
    }

    /// Reconcile like [`AddressSequencer::reconcile_with_ledger`], returning
    /// only the pending transactions that were handed to dispatch, in the
    /// form they were sent. Assigned but unsent ones stay tracked.
    pub async fn reconcile_for_resend(
        &self,
        cancel: &CancellationToken,
    ) -> SequencerResult<Vec<TransactionRecord>> {
        let pending = self.reconcile(cancel).await?;
        Ok(pending.into_iter().filter_map(|o| o.sent).collect())
    }

    async fn reconcile(&self, cancel: &CancellationToken) -> SequencerResult<Vec<Outstanding>> {
        let ledger_nonce = self.fetch_ledger_nonce(cancel).await?;

        let mut state = self.state.lock().await;

        if ledger_nonce == state.computed_nonce {
            state.outstanding.clear();
            state.lowest_nonce = state.computed_nonce;
            metrics::record_reconciliation("settled");
            return Ok(Vec::new());
        }

        let pending = match ledger_nonce.checked_add(1) {
            Some(first_pending) => state.outstanding.split_off(&first_pending),
            None => BTreeMap::new(),
        };
        let confirmed = std::mem::replace(&mut state.outstanding, pending);

        // nonces sent from elsewhere may sit above anything computed here
        let lowest = match state.outstanding.keys().next() {
            Some(nonce) => *nonce,
            None => ledger_nonce,
        };
        state.lowest_nonce = lowest.min(state.computed_nonce);

        if !confirmed.is_empty() {
            debug!(
                "Retired {} transactions of {} at ledger nonce {}",
                confirmed.len(),
                self.address,
                ledger_nonce
            );
        }

        let pending: Vec<_> = state.outstanding.values().cloned().collect();
        metrics::record_reconciliation(if pending.is_empty() { "settled" } else { "pending" });

        Ok(pending)
    }

    /// Forget the local counter; the next assignment bootstraps from the ledger
    pub async fn reset(&self) {
        self.state.lock().await.computed_nonce_set = false;
        info!("Nonce of {} will be refetched from the ledger", self.address);
    }

    /// Drop every outstanding transaction and raise the gas price floor so
    /// that replacements outbid whatever is stuck in the network.
    pub async fn raise_gas_price_floor(&self) {
        let mut state = self.state.lock().await;
        state.outstanding.clear();
        state.computed_nonce_set = false;
        state.lowest_nonce = 0;
        state.gas_price = self.policy.escalate(state.gas_price);
        state.nonce_watermark = state.computed_nonce;

        info!(
            "Dropped outstanding transactions of {}, gas price floor now {}",
            self.address, state.gas_price
        );
    }

    /// Remember the record as handed to dispatch, typically the signed form
    /// of an assigned draft. A higher priced sent record at the same nonce is
    /// kept.
    pub async fn track_sent(&self, record: &TransactionRecord) {
        let mut state = self.state.lock().await;
        match state.outstanding.entry(record.nonce()) {
            Entry::Vacant(entry) => {
                entry.insert(Outstanding {
                    assigned: record.clone(),
                    sent: Some(record.clone()),
                });
            }
            Entry::Occupied(mut entry) => {
                let outstanding = entry.get_mut();
                let keep_existing = outstanding
                    .sent
                    .as_ref()
                    .map_or(false, |sent| sent.gas_price() > record.gas_price());
                if keep_existing {
                    debug!(
                        "Keeping higher priced transaction {} of {}",
                        record.nonce(),
                        self.address
                    );
                    return;
                }
                outstanding.sent = Some(record.clone());
            }
        }
    }

    /// Transaction holding `nonce`, if any
    pub async fn outstanding(&self, nonce: u64) -> Option<TransactionRecord> {
        self.state
            .lock()
            .await
            .outstanding
            .get(&nonce)
            .map(|o| o.occupant().clone())
    }

    pub async fn snapshot(&self) -> SequencerSnapshot {
        let state = self.state.lock().await;
        SequencerSnapshot {
            computed_nonce: state.computed_nonce,
            computed_nonce_set: state.computed_nonce_set,
            lowest_nonce: state.lowest_nonce,
            gas_price: state.gas_price,
            nonce_watermark: state.nonce_watermark,
            outstanding: state.outstanding.keys().copied().collect(),
            sent: state
                .outstanding
                .iter()
                .filter(|(_, o)| o.sent.is_some())
                .map(|(nonce, _)| *nonce)
                .collect(),
        }
    }
}

/// A new transaction may take an occupied nonce only when it pays strictly
/// more, or the same while the occupant sits below the current floor.
fn check_replacement(
    address: &Address,
    existing: &TransactionRecord,
    gas_price: u64,
    floor: u64,
) -> SequencerResult<()> {
    if existing.gas_price() < gas_price {
        return Ok(());
    }
    if existing.gas_price() == gas_price && existing.gas_price() < floor {
        return Ok(());
    }

    metrics::record_nonce_assignment("duplicate");
    warn!(
        "Transaction {} of {} already pending at gas price {}",
        existing.nonce(),
        address,
        existing.gas_price()
    );
    Err(SequencerError::DuplicateNonce {
        address: address.to_string(),
        nonce: existing.nonce(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{InMemoryLedger, LedgerError, MockAccountLedgerClient};

    const MIN_GAS_PRICE: u64 = 1_000_000_000;

    fn address(seed: u8) -> Address {
        Address::from_bytes("test", vec![seed; 32]).unwrap()
    }

    fn draft() -> TransactionDraft {
        TransactionDraft::new("test1receiver", "5000000000000000000").with_gas_limit(50_000)
    }

    async fn sequencer_at(nonce: u64) -> (Arc<InMemoryLedger>, AddressSequencer) {
        let ledger = Arc::new(InMemoryLedger::new(MIN_GAS_PRICE));
        ledger.set_nonce(&address(1), nonce).await;
        let sequencer =
            AddressSequencer::new(ledger.clone(), address(1), GasPricePolicy::default()).unwrap();
        (ledger, sequencer)
    }

    async fn assign_n(sequencer: &AddressSequencer, n: usize) -> Vec<u64> {
        let cancel = CancellationToken::new();
        let mut nonces = Vec::new();
        for _ in 0..n {
            let record = sequencer
                .assign_nonce_and_gas_price(&cancel, draft())
                .await
                .unwrap();
            nonces.push(record.nonce());
        }
        nonces
    }

    #[test]
    fn test_rejects_nil_address() {
        let ledger = Arc::new(InMemoryLedger::new(1));
        let empty = Address::from_bytes("test", Vec::new()).unwrap();
        assert!(matches!(
            AddressSequencer::new(ledger, empty, GasPricePolicy::default()),
            Err(SequencerError::NilAddress)
        ));
    }

    #[tokio::test]
    async fn test_sequential_nonces_are_gap_free() {
        let (_, sequencer) = sequencer_at(10).await;

        assert_eq!(assign_n(&sequencer, 5).await, vec![10, 11, 12, 13, 14]);

        let snapshot = sequencer.snapshot().await;
        assert_eq!(snapshot.computed_nonce, 14);
        assert!(snapshot.computed_nonce_set);
        assert_eq!(snapshot.gas_price, MIN_GAS_PRICE);
        assert_eq!(snapshot.outstanding, vec![10, 11, 12, 13, 14]);
    }

    #[tokio::test]
    async fn test_follows_ledger_when_it_moves_ahead() {
        let (ledger, sequencer) = sequencer_at(3).await;
        assert_eq!(assign_n(&sequencer, 2).await, vec![3, 4]);

        ledger.set_nonce(&address(1), 9).await;
        assert_eq!(assign_n(&sequencer, 2).await, vec![9, 10]);
    }

    #[tokio::test]
    async fn test_reconcile_keeps_pending_and_returns_them() {
        let (ledger, sequencer) = sequencer_at(10).await;
        assign_n(&sequencer, 5).await;

        ledger.set_nonce(&address(1), 12).await;
        let cancel = CancellationToken::new();
        let pending = sequencer.reconcile_with_ledger(&cancel).await.unwrap();

        let resend: Vec<u64> = pending.iter().map(|r| r.nonce()).collect();
        assert_eq!(resend, vec![13, 14]);

        let snapshot = sequencer.snapshot().await;
        assert_eq!(snapshot.outstanding, vec![13, 14]);
        assert_eq!(snapshot.lowest_nonce, 13);
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let (ledger, sequencer) = sequencer_at(10).await;
        assign_n(&sequencer, 5).await;
        ledger.set_nonce(&address(1), 11).await;

        let cancel = CancellationToken::new();
        let first = sequencer.reconcile_with_ledger(&cancel).await.unwrap();
        let after_first = sequencer.snapshot().await;
        let second = sequencer.reconcile_with_ledger(&cancel).await.unwrap();
        let after_second = sequencer.snapshot().await;

        assert_eq!(first, second);
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn test_reconcile_settles_when_ledger_matches() {
        let (ledger, sequencer) = sequencer_at(0).await;
        assign_n(&sequencer, 3).await;
        ledger.set_nonce(&address(1), 2).await;

        let cancel = CancellationToken::new();
        assert!(sequencer.reconcile_with_ledger(&cancel).await.unwrap().is_empty());

        let snapshot = sequencer.snapshot().await;
        assert!(snapshot.outstanding.is_empty());
        assert_eq!(snapshot.lowest_nonce, 2);
    }

    #[tokio::test]
    async fn test_duplicate_nonce_needs_higher_gas_price() {
        let (_, sequencer) = sequencer_at(0).await;
        let cancel = CancellationToken::new();
        assign_n(&sequencer, 2).await;

        let same_price = draft().with_nonce(1).with_gas_price(MIN_GAS_PRICE);
        assert_eq!(
            sequencer
                .assign_nonce_and_gas_price(&cancel, same_price)
                .await,
            Err(SequencerError::DuplicateNonce {
                address: address(1).to_string(),
                nonce: 1
            })
        );

        let lower_price = draft().with_nonce(1).with_gas_price(1);
        assert!(sequencer
            .assign_nonce_and_gas_price(&cancel, lower_price)
            .await
            .is_err());

        let higher_price = draft().with_nonce(1).with_gas_price(MIN_GAS_PRICE + 1);
        let replaced = sequencer
            .assign_nonce_and_gas_price(&cancel, higher_price)
            .await
            .unwrap();
        assert_eq!(replaced.nonce(), 1);
        assert_eq!(replaced.gas_price(), MIN_GAS_PRICE + 1);
        assert_eq!(sequencer.outstanding(1).await, Some(replaced));

        // the counter did not move
        assert_eq!(sequencer.snapshot().await.computed_nonce, 1);
    }

    #[tokio::test]
    async fn test_equal_price_replaces_when_below_floor() {
        let ledger = Arc::new(InMemoryLedger::new(10));
        let sequencer =
            AddressSequencer::new(ledger.clone(), address(1), GasPricePolicy::new(1, 1)).unwrap();
        let cancel = CancellationToken::new();

        let first = sequencer
            .assign_nonce_and_gas_price(&cancel, draft())
            .await
            .unwrap();
        assert_eq!(first.gas_price(), 10);

        // the next assignment refreshes the floor to 20
        ledger.set_min_gas_price(20).await;
        sequencer
            .assign_nonce_and_gas_price(&cancel, draft())
            .await
            .unwrap();

        let replacement = sequencer
            .assign_nonce_and_gas_price(&cancel, draft().with_nonce(0).with_gas_price(10))
            .await
            .unwrap();
        assert_eq!(replacement.nonce(), 0);
        assert_eq!(replacement.gas_price(), 20);
    }

    #[tokio::test]
    async fn test_explicit_nonce_without_occupant_is_assigned_normally() {
        let (_, sequencer) = sequencer_at(7).await;
        let cancel = CancellationToken::new();

        let record = sequencer
            .assign_nonce_and_gas_price(&cancel, draft().with_nonce(100))
            .await
            .unwrap();
        assert_eq!(record.nonce(), 7);
    }

    #[tokio::test]
    async fn test_gap_leaves_state_unchanged() {
        let (ledger, sequencer) = sequencer_at(10).await;
        assign_n(&sequencer, 5).await;
        ledger.set_nonce(&address(1), 12).await;

        let cancel = CancellationToken::new();
        sequencer.reconcile_with_ledger(&cancel).await.unwrap();
        let before = sequencer.snapshot().await;

        ledger.set_nonce(&address(1), 11).await;
        let result = sequencer.assign_nonce_and_gas_price(&cancel, draft()).await;
        assert_eq!(
            result,
            Err(SequencerError::NonceGap {
                address: address(1).to_string(),
                ledger_nonce: 11,
                lowest_nonce: 13,
            })
        );
        assert_eq!(sequencer.snapshot().await, before);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_assignments_are_unique() {
        let (_, sequencer) = sequencer_at(10).await;
        let sequencer = Arc::new(sequencer);

        let handles: Vec<_> = (0..64)
            .map(|_| {
                let sequencer = sequencer.clone();
                tokio::spawn(async move {
                    let cancel = CancellationToken::new();
                    sequencer
                        .assign_nonce_and_gas_price(&cancel, draft())
                        .await
                        .unwrap()
                        .nonce()
                })
            })
            .collect();

        let mut nonces = Vec::new();
        for handle in handles {
            nonces.push(handle.await.unwrap());
        }
        nonces.sort_unstable();

        assert_eq!(nonces, (10..74).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_cancelled_assignment_does_not_mutate() {
        let (ledger, sequencer) = sequencer_at(10).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = sequencer.assign_nonce_and_gas_price(&cancel, draft()).await;
        assert!(matches!(result, Err(SequencerError::Cancelled { .. })));
        assert!(!sequencer.snapshot().await.computed_nonce_set);
        assert_eq!(ledger.gas_price_queries(), 0);
    }

    #[tokio::test]
    async fn test_gas_price_is_fetched_lazily() {
        let mut mock = MockAccountLedgerClient::new();
        // away from the watermark so only the unknown floor triggers a fetch
        mock.expect_get_account_nonce().returning(|_| Ok(5));
        mock.expect_get_network_minimum_gas_price()
            .times(1)
            .returning(|| Ok(1_000));

        let sequencer =
            AddressSequencer::new(Arc::new(mock), address(2), GasPricePolicy::default()).unwrap();
        let cancel = CancellationToken::new();

        let mut prices = Vec::new();
        for gas_price in [0, 500, 2_000] {
            let record = sequencer
                .assign_nonce_and_gas_price(&cancel, draft().with_gas_price(gas_price))
                .await
                .unwrap();
            prices.push(record.gas_price());
        }

        assert_eq!(prices, vec![1_000, 1_000, 2_000]);
    }

    #[tokio::test]
    async fn test_failed_gas_refresh_falls_back_to_draft_price() {
        let mut mock = MockAccountLedgerClient::new();
        mock.expect_get_account_nonce().returning(|_| Ok(4));
        mock.expect_get_network_minimum_gas_price()
            .returning(|| Err(LedgerError::Transport("connection refused".into())));

        let sequencer =
            AddressSequencer::new(Arc::new(mock), address(3), GasPricePolicy::default()).unwrap();
        let cancel = CancellationToken::new();

        let record = sequencer
            .assign_nonce_and_gas_price(&cancel, draft().with_gas_price(77))
            .await
            .unwrap();
        assert_eq!(record.nonce(), 4);
        assert_eq!(record.gas_price(), 77);
        assert_eq!(sequencer.snapshot().await.gas_price, 0);
    }

    #[tokio::test]
    async fn test_reset_refetches_and_collides_with_stuck_transaction() {
        let (_, sequencer) = sequencer_at(10).await;
        let cancel = CancellationToken::new();
        assign_n(&sequencer, 3).await;

        sequencer.reset().await;
        assert!(!sequencer.snapshot().await.computed_nonce_set);

        // the ledger still expects 10, which is occupied at the same price
        let same_price = sequencer.assign_nonce_and_gas_price(&cancel, draft()).await;
        assert!(matches!(
            same_price,
            Err(SequencerError::DuplicateNonce { nonce: 10, .. })
        ));

        let outbid = sequencer
            .assign_nonce_and_gas_price(&cancel, draft().with_gas_price(MIN_GAS_PRICE * 2))
            .await
            .unwrap();
        assert_eq!(outbid.nonce(), 10);
        assert_eq!(sequencer.outstanding(10).await, Some(outbid));
    }

    #[tokio::test]
    async fn test_raise_gas_price_floor() {
        let (_, sequencer) = sequencer_at(10).await;
        let cancel = CancellationToken::new();
        assign_n(&sequencer, 3).await;

        sequencer.raise_gas_price_floor().await;
        let snapshot = sequencer.snapshot().await;
        assert!(snapshot.outstanding.is_empty());
        assert!(!snapshot.computed_nonce_set);
        assert_eq!(snapshot.gas_price, MIN_GAS_PRICE + 1);
        assert_eq!(snapshot.nonce_watermark, 12);

        // restarts at the ledger nonce with the escalated floor
        let record = sequencer
            .assign_nonce_and_gas_price(&cancel, draft())
            .await
            .unwrap();
        assert_eq!(record.nonce(), 10);
        assert_eq!(record.gas_price(), MIN_GAS_PRICE + 1);
    }

    #[tokio::test]
    async fn test_track_sent_keeps_higher_price() {
        let (_, sequencer) = sequencer_at(0).await;
        let cancel = CancellationToken::new();
        let assigned = sequencer
            .assign_nonce_and_gas_price(&cancel, draft().with_gas_price(MIN_GAS_PRICE * 3))
            .await
            .unwrap();

        let cheaper = TransactionRecord::new(address(1), 0, MIN_GAS_PRICE, draft());
        sequencer.track_sent(&cheaper).await;
        assert_eq!(sequencer.outstanding(0).await, Some(assigned.clone()));

        let pricier = TransactionRecord::new(address(1), 0, MIN_GAS_PRICE * 4, draft());
        sequencer.track_sent(&pricier).await;
        assert_eq!(sequencer.outstanding(0).await, Some(pricier.clone()));

        sequencer.track_sent(&cheaper).await;
        assert_eq!(sequencer.outstanding(0).await, Some(pricier));
    }

    #[tokio::test]
    async fn test_resend_set_holds_only_sent_transactions() {
        let (_, sequencer) = sequencer_at(0).await;
        let cancel = CancellationToken::new();
        let assigned = sequencer
            .assign_nonces_and_gas_price(&cancel, vec![draft(), draft(), draft()])
            .await
            .unwrap();
        sequencer.track_sent(&assigned[1]).await;

        let resend = sequencer.reconcile_for_resend(&cancel).await.unwrap();
        assert_eq!(resend, vec![assigned[1].clone()]);

        // nonce 2 was never sent but is still tracked
        let snapshot = sequencer.snapshot().await;
        assert_eq!(snapshot.outstanding, vec![1, 2]);
        assert_eq!(snapshot.sent, vec![1]);
        assert_eq!(sequencer.outstanding(2).await, Some(assigned[2].clone()));
    }

    #[tokio::test]
    async fn test_foreign_nonce_keeps_lowest_at_or_below_computed() {
        let (_, sequencer) = sequencer_at(50).await;
        let cancel = CancellationToken::new();

        let foreign = TransactionRecord::new(address(1), 55, MIN_GAS_PRICE, draft());
        sequencer.track_sent(&foreign).await;

        let pending = sequencer.reconcile_with_ledger(&cancel).await.unwrap();
        assert_eq!(pending, vec![foreign]);
        let snapshot = sequencer.snapshot().await;
        assert!(snapshot.lowest_nonce <= snapshot.computed_nonce);

        let record = sequencer
            .assign_nonce_and_gas_price(&cancel, draft())
            .await
            .unwrap();
        assert_eq!(record.nonce(), 50);
        let snapshot = sequencer.snapshot().await;
        assert!(snapshot.lowest_nonce <= snapshot.computed_nonce);
    }

    #[tokio::test]
    async fn test_batch_assignment_reads_ledger_once() {
        let mut mock = MockAccountLedgerClient::new();
        mock.expect_get_account_nonce().times(1).returning(|_| Ok(7));
        mock.expect_get_network_minimum_gas_price()
            .times(1)
            .returning(|| Ok(1_000));

        let sequencer =
            AddressSequencer::new(Arc::new(mock), address(4), GasPricePolicy::default()).unwrap();
        let cancel = CancellationToken::new();

        let records = sequencer
            .assign_nonces_and_gas_price(&cancel, vec![draft(); 4])
            .await
            .unwrap();

        let nonces: Vec<u64> = records.iter().map(|r| r.nonce()).collect();
        assert_eq!(nonces, vec![7, 8, 9, 10]);
        assert!(records.iter().all(|r| r.gas_price() == 1_000));
        assert_eq!(sequencer.snapshot().await.computed_nonce, 10);
    }

    #[tokio::test]
    async fn test_batch_assignment_is_all_or_nothing() {
        let (_, sequencer) = sequencer_at(0).await;
        let cancel = CancellationToken::new();
        assign_n(&sequencer, 2).await;
        let before = sequencer.snapshot().await;

        let batch = vec![draft(), draft().with_nonce(1).with_gas_price(MIN_GAS_PRICE)];
        let result = sequencer.assign_nonces_and_gas_price(&cancel, batch).await;
        assert!(matches!(
            result,
            Err(SequencerError::DuplicateNonce { nonce: 1, .. })
        ));
        assert_eq!(sequencer.snapshot().await, before);

        assert!(sequencer
            .assign_nonces_and_gas_price(&cancel, Vec::new())
            .await
            .unwrap()
            .is_empty());
        assert_eq!(assign_n(&sequencer, 1).await, vec![2]);
    }
}
