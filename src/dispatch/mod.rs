//! Batched transaction dispatch
//!
//! This module provides:
//! - A pending queue keyed by sender and nonce, flushed on a timer
//! - Graceful shutdown that resolves every waiting caller
//! - A supervisor that periodically reconciles senders with the ledger

mod coordinator;
mod queue;
mod supervisor;

pub use coordinator::{DispatchCoordinator, DispatchCoordinatorBuilder};
pub use queue::DispatchPhase;
pub use supervisor::ReconciliationSupervisor;
