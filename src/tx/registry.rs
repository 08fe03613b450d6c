//! One sequencer per address, created on first use

use super::gas::GasPricePolicy;
use super::nonce::AddressSequencer;
use crate::error::SequencerResult;
use crate::ledger::AccountLedgerClient;
use crate::metrics;
use crate::types::Address;

use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Maps addresses to their sequencers.
///
/// The map lock is only held while looking up or inserting an entry, so
/// sequencers of unrelated addresses never wait on each other.
pub struct SequencerRegistry {
    client: Arc<dyn AccountLedgerClient>,
    policy: GasPricePolicy,
    sequencers: DashMap<Address, Arc<AddressSequencer>>,
}

impl SequencerRegistry {
    pub fn new(client: Arc<dyn AccountLedgerClient>, policy: GasPricePolicy) -> Self {
        Self {
            client,
            policy,
            sequencers: DashMap::new(),
        }
    }

    /// Sequencer for `address`, created the first time it is asked for
    pub fn get_or_create(&self, address: &Address) -> SequencerResult<Arc<AddressSequencer>> {
        if let Some(sequencer) = self.sequencers.get(address) {
            return Ok(sequencer.clone());
        }

        let entry = self
            .sequencers
            .entry(address.clone())
            .or_try_insert_with(|| {
                debug!("Creating sequencer for {}", address);
                AddressSequencer::new(self.client.clone(), address.clone(), self.policy)
                    .map(Arc::new)
            })?;
        let sequencer = entry.value().clone();
        drop(entry);

        metrics::record_active_sequencers(self.sequencers.len());
        Ok(sequencer)
    }

    /// Sequencer for `address` if one was created already
    pub fn get(&self, address: &Address) -> Option<Arc<AddressSequencer>> {
        self.sequencers.get(address).map(|s| s.clone())
    }

    /// Addresses with a sequencer
    pub fn addresses(&self) -> Vec<Address> {
        self.sequencers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sequencers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequencers.is_empty()
    }
}
