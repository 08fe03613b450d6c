//! Pending queue shared by callers and the flush loop

use crate::error::{SequencerError, SequencerResult};
use crate::metrics;
use crate::types::{Address, TransactionRecord};

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tokio::sync::oneshot;

/// Lifecycle of a dispatcher: `Running -> Draining -> Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPhase {
    /// Accepting and flushing transactions
    Running,
    /// Close requested, no new transactions accepted
    Draining,
    /// Every queued transaction has been resolved
    Closed,
}

impl fmt::Display for DispatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DispatchPhase::Running => "running",
            DispatchPhase::Draining => "draining",
            DispatchPhase::Closed => "closed",
        };
        f.write_str(name)
    }
}

pub(crate) type DispatchReceiver = oneshot::Receiver<SequencerResult<String>>;

/// A queued transaction and the caller waiting on it
pub(crate) struct QueuedTransaction {
    pub(crate) record: TransactionRecord,
    responder: oneshot::Sender<SequencerResult<String>>,
}

impl QueuedTransaction {
    /// Hand the result to the waiting caller, if it is still there
    pub(crate) fn resolve(self, result: SequencerResult<String>) {
        metrics::record_dispatch(&result);
        let _ = self.responder.send(result);
    }
}

pub(crate) struct PendingQueue {
    phase: DispatchPhase,
    by_address: HashMap<Address, BTreeMap<u64, QueuedTransaction>>,
    len: usize,
}

impl PendingQueue {
    pub(crate) fn new() -> Self {
        Self {
            phase: DispatchPhase::Running,
            by_address: HashMap::new(),
            len: 0,
        }
    }

    pub(crate) fn phase(&self) -> DispatchPhase {
        self.phase
    }

    pub(crate) fn set_phase(&mut self, phase: DispatchPhase) {
        self.phase = phase;
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Queue `record` for the next flush.
    ///
    /// Fails without queueing when the dispatcher is not running or the
    /// sender already has an unflushed transaction at the same nonce.
    pub(crate) fn enqueue(&mut self, record: TransactionRecord) -> SequencerResult<DispatchReceiver> {
        if self.phase != DispatchPhase::Running {
            return Err(SequencerError::Closed);
        }
        if self.is_queued(&record) {
            return Err(SequencerError::DuplicateNonce {
                address: record.sender().to_string(),
                nonce: record.nonce(),
            });
        }

        Ok(self.insert(record))
    }

    /// Queue a resend of `record`.
    ///
    /// Returns `None` when the sender already has an unflushed transaction at
    /// that nonce; the queued one is newer and goes out instead.
    pub(crate) fn enqueue_resend(
        &mut self,
        record: TransactionRecord,
    ) -> SequencerResult<Option<DispatchReceiver>> {
        if self.phase != DispatchPhase::Running {
            return Err(SequencerError::Closed);
        }
        if self.is_queued(&record) {
            return Ok(None);
        }

        Ok(Some(self.insert(record)))
    }

    fn is_queued(&self, record: &TransactionRecord) -> bool {
        self.by_address
            .get(record.sender())
            .map_or(false, |batch| batch.contains_key(&record.nonce()))
    }

    fn insert(&mut self, record: TransactionRecord) -> DispatchReceiver {
        let (responder, receiver) = oneshot::channel();
        self.by_address
            .entry(record.sender().clone())
            .or_default()
            .insert(record.nonce(), QueuedTransaction { record, responder });
        self.len += 1;
        receiver
    }

    /// Take everything queued: one batch per sender, each in nonce order
    pub(crate) fn drain(&mut self) -> Vec<Vec<QueuedTransaction>> {
        self.len = 0;
        std::mem::take(&mut self.by_address)
            .into_values()
            .map(|batch| batch.into_values().collect())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionDraft;

    fn record(seed: u8, nonce: u64) -> TransactionRecord {
        let sender = Address::from_bytes("test", vec![seed; 32]).unwrap();
        TransactionRecord::new(sender, nonce, 1, TransactionDraft::new("r", "1"))
    }

    #[test]
    fn test_drain_groups_by_sender_in_nonce_order() {
        let mut queue = PendingQueue::new();
        for nonce in [5, 3, 4] {
            queue.enqueue(record(1, nonce)).unwrap();
        }
        queue.enqueue(record(2, 0)).unwrap();
        assert_eq!(queue.len(), 4);

        let mut batches: Vec<Vec<u64>> = queue
            .drain()
            .into_iter()
            .map(|batch| batch.iter().map(|q| q.record.nonce()).collect())
            .collect();
        batches.sort();

        assert_eq!(batches, vec![vec![0], vec![3, 4, 5]]);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_rejects_unflushed_duplicate() {
        let mut queue = PendingQueue::new();
        queue.enqueue(record(1, 7)).unwrap();

        assert!(matches!(
            queue.enqueue(record(1, 7)),
            Err(SequencerError::DuplicateNonce { nonce: 7, .. })
        ));
        // another sender may use the same nonce
        assert!(queue.enqueue(record(2, 7)).is_ok());

        // after a flush the nonce is free again
        queue.drain();
        assert!(queue.enqueue(record(1, 7)).is_ok());
    }

    #[test]
    fn test_resend_defers_to_queued_transaction() {
        let mut queue = PendingQueue::new();
        queue.enqueue(record(1, 3)).unwrap();

        assert!(queue.enqueue_resend(record(1, 3)).unwrap().is_none());
        assert!(queue.enqueue_resend(record(1, 2)).unwrap().is_some());
        assert_eq!(queue.len(), 2);

        let nonces: Vec<u64> = queue
            .drain()
            .into_iter()
            .flatten()
            .map(|q| q.record.nonce())
            .collect();
        assert_eq!(nonces, vec![2, 3]);

        queue.set_phase(DispatchPhase::Closed);
        assert!(matches!(
            queue.enqueue_resend(record(1, 2)),
            Err(SequencerError::Closed)
        ));
    }

    #[test]
    fn test_refuses_when_not_running() {
        let mut queue = PendingQueue::new();
        queue.set_phase(DispatchPhase::Draining);
        assert!(matches!(
            queue.enqueue(record(1, 0)),
            Err(SequencerError::Closed)
        ));
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_resolve_reaches_receiver() {
        let mut queue = PendingQueue::new();
        let receiver = queue.enqueue(record(1, 0)).unwrap();

        for queued in queue.drain().into_iter().flatten() {
            queued.resolve(Ok("id-0".to_string()));
        }
        assert_eq!(receiver.await.unwrap(), Ok("id-0".to_string()));
    }
}
