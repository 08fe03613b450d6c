//! Nonce sequencing with gas price floor management

mod gas;
mod nonce;
mod registry;

pub use gas::GasPricePolicy;
pub use nonce::{AddressSequencer, SequencerSnapshot};
pub use registry::SequencerRegistry;
