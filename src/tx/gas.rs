//! Gas price floor policy: when to refresh from the network, how far to escalate

use crate::config::GasConfig;

/// Decides when an address sequencer refetches the network minimum gas price
/// and by how much the floor moves when outstanding transactions are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasPricePolicy {
    /// Units added to the floor on every escalation
    escalation_step: u64,
    /// Extra refresh cadence in nonces past the watermark (0 disables it)
    refresh_every: u64,
}

impl GasPricePolicy {
    pub fn new(escalation_step: u64, refresh_every: u64) -> Self {
        Self {
            escalation_step: escalation_step.max(1),
            refresh_every,
        }
    }

    pub fn from_config(config: &GasConfig) -> Self {
        Self::new(config.escalation_step, config.refresh_every)
    }

    /// Whether the floor must be refetched before assigning `nonce`.
    ///
    /// Refreshes lazily: when no floor is known, on the first nonce after the
    /// last escalation watermark, and optionally every `refresh_every` nonces
    /// past it.
    pub fn should_refresh(&self, nonce: u64, watermark: u64, current_floor: u64) -> bool {
        if current_floor == 0 || nonce == watermark.saturating_add(1) {
            return true;
        }

        if self.refresh_every == 0 || nonce <= watermark {
            return false;
        }

        (nonce - watermark - 1) % self.refresh_every == 0
    }

    /// Floor to use after outstanding transactions were dropped
    pub fn escalate(&self, floor: u64) -> u64 {
        floor.saturating_add(self.escalation_step)
    }

    pub fn escalation_step(&self) -> u64 {
        self.escalation_step
    }
}

impl Default for GasPricePolicy {
    fn default() -> Self {
        Self::new(1, 0)
    }
}
