//! Dispatch coordinator: nonce assignment front door and batched submission
//!
//! Callers enqueue signed transactions and wait for their individual result.
//! A background loop flushes the queue on a fixed interval, submitting each
//! sender's batch in nonce order.

use super::queue::{DispatchPhase, DispatchReceiver, PendingQueue, QueuedTransaction};
use crate::config::DispatcherConfig;
use crate::error::{SequencerError, SequencerResult};
use crate::ledger::{AccountLedgerClient, LedgerError};
use crate::metrics;
use crate::tx::{GasPricePolicy, SequencerRegistry};
use crate::types::{Address, TransactionDraft, TransactionRecord};

use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Builder for [`DispatchCoordinator`]
#[derive(Default)]
pub struct DispatchCoordinatorBuilder {
    client: Option<Arc<dyn AccountLedgerClient>>,
    config: DispatcherConfig,
    gas_policy: GasPricePolicy,
}

impl DispatchCoordinatorBuilder {
    pub fn ledger_client(mut self, client: Arc<dyn AccountLedgerClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn dispatcher_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn gas_policy(mut self, gas_policy: GasPricePolicy) -> Self {
        self.gas_policy = gas_policy;
        self
    }

    /// Build the coordinator and start its flush loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> SequencerResult<DispatchCoordinator> {
        let client = self.client.ok_or(SequencerError::NilLedgerClient)?;
        if self.config.flush_interval_ms == 0 {
            return Err(SequencerError::Config(
                "flush interval must be positive".to_string(),
            ));
        }

        let shared = Arc::new(Shared {
            registry: Arc::new(SequencerRegistry::new(client.clone(), self.gas_policy)),
            client,
            queue: Mutex::new(PendingQueue::new()),
            shutdown: CancellationToken::new(),
            config: self.config,
        });

        let flush_task = tokio::spawn(flush_loop(shared.clone()));

        Ok(DispatchCoordinator {
            shared,
            flush_task: Mutex::new(Some(flush_task)),
        })
    }
}

/// State shared between the coordinator handle and its flush loop
struct Shared {
    /// Ledger used for every submission
    client: Arc<dyn AccountLedgerClient>,
    /// Per-address sequencers
    registry: Arc<SequencerRegistry>,
    /// Transactions waiting for the next flush
    queue: Mutex<PendingQueue>,
    /// Cancelled once on close
    shutdown: CancellationToken,
    config: DispatcherConfig,
}

/// Front door for nonce assignment and batched dispatch.
///
/// Dropping the coordinator stops the flush loop; callers still waiting get a
/// cancellation error. Use [`DispatchCoordinator::close`] for an orderly stop.
pub struct DispatchCoordinator {
    shared: Arc<Shared>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchCoordinator {
    pub fn builder() -> DispatchCoordinatorBuilder {
        DispatchCoordinatorBuilder::default()
    }

    /// Assign the next nonce and a gas price to `draft` for `address`
    pub async fn assign_nonce_and_gas_price(
        &self,
        cancel: &CancellationToken,
        address: &Address,
        draft: TransactionDraft,
    ) -> SequencerResult<TransactionRecord> {
        let sequencer = self.shared.registry.get_or_create(address)?;
        sequencer.assign_nonce_and_gas_price(cancel, draft).await
    }

    /// Assign nonces and gas prices to `drafts` for `address`, in order.
    ///
    /// The ledger is queried once for the whole batch; either every draft is
    /// assigned or none is.
    pub async fn assign_nonces_and_gas_price(
        &self,
        cancel: &CancellationToken,
        address: &Address,
        drafts: Vec<TransactionDraft>,
    ) -> SequencerResult<Vec<TransactionRecord>> {
        let sequencer = self.shared.registry.get_or_create(address)?;
        sequencer.assign_nonces_and_gas_price(cancel, drafts).await
    }

    /// Queue `txs` for the next flush and wait for their results.
    ///
    /// There is no batch-level error: the returned vector is index-aligned
    /// with `txs` and every entry is the outcome of that transaction alone.
    /// A transaction whose sender and nonce are already queued fails
    /// immediately with a duplicate error and does not affect the others.
    pub async fn send_transactions(
        &self,
        cancel: &CancellationToken,
        txs: Vec<TransactionRecord>,
    ) -> Vec<SequencerResult<String>> {
        let mut waiters: Vec<SequencerResult<DispatchReceiver>> = Vec::with_capacity(txs.len());
        let mut accepted = Vec::new();

        {
            let mut queue = self.shared.queue.lock().await;
            for tx in txs {
                if tx.sender().is_empty() {
                    waiters.push(Err(SequencerError::NilAddress));
                    continue;
                }
                match queue.enqueue(tx.clone()) {
                    Ok(receiver) => {
                        accepted.push(tx);
                        waiters.push(Ok(receiver));
                    }
                    Err(e) => {
                        debug!("Refusing transaction: {}", e);
                        waiters.push(Err(e));
                    }
                }
            }
            metrics::record_queue_depth(queue.len());
        }

        // Remember what went out so reconciliation can resend it
        for tx in &accepted {
            match self.shared.registry.get_or_create(tx.sender()) {
                Ok(sequencer) => sequencer.track_sent(tx).await,
                Err(e) => warn!("Cannot track transaction from {}: {}", tx.sender(), e),
            }
        }

        let mut results = Vec::with_capacity(waiters.len());
        for waiter in waiters {
            let result = match waiter {
                Ok(receiver) => wait_for_result(cancel, receiver).await,
                Err(e) => {
                    metrics::record_dispatch(&Err(e.clone()));
                    Err(e)
                }
            };
            results.push(result);
        }
        results
    }

    /// Reconcile the sequencer of `address` with the ledger and resend the
    /// transactions it still has outstanding.
    ///
    /// Only transactions that went through [`DispatchCoordinator::send_transactions`]
    /// are resent, and they go out with the next flush, in nonce order with
    /// anything else queued for the sender. The first per-transaction failure
    /// is returned once every resend has resolved.
    pub async fn reconcile_with_ledger(
        &self,
        cancel: &CancellationToken,
        address: &Address,
    ) -> SequencerResult<()> {
        let Some(sequencer) = self.shared.registry.get(address) else {
            debug!("No sequencer for {}, nothing to reconcile", address);
            return Ok(());
        };

        let pending = sequencer.reconcile_for_resend(cancel).await?;
        if pending.is_empty() {
            return Ok(());
        }

        let receivers = {
            let mut queue = self.shared.queue.lock().await;
            let mut receivers = Vec::with_capacity(pending.len());
            for record in pending {
                if let Some(receiver) = queue.enqueue_resend(record)? {
                    receivers.push(receiver);
                }
            }
            metrics::record_queue_depth(queue.len());
            receivers
        };
        metrics::record_resent(receivers.len());

        let resent = receivers.len();
        let mut failures = Vec::new();
        for receiver in receivers {
            if let Err(e) = wait_for_result(cancel, receiver).await {
                failures.push(e);
            }
        }

        let mut failures = failures.into_iter();
        match failures.next() {
            None => {
                info!("Resent {} transactions for {}", resent, address);
                Ok(())
            }
            Some(first) => {
                warn!(
                    "Resend for {} had {} failures, first: {}",
                    address,
                    1 + failures.count(),
                    first
                );
                Err(first)
            }
        }
    }

    /// Forget the locally computed nonce of `address`
    pub async fn reset(&self, address: &Address) -> SequencerResult<()> {
        self.shared.registry.get_or_create(address)?.reset().await;
        Ok(())
    }

    /// Drop outstanding transactions of `address` and escalate its gas floor
    pub async fn raise_gas_price_floor(&self, address: &Address) -> SequencerResult<()> {
        self.shared
            .registry
            .get_or_create(address)?
            .raise_gas_price_floor()
            .await;
        Ok(())
    }

    /// Stop accepting transactions and resolve every waiting caller.
    ///
    /// Transactions still queued, and batches whose submission is in flight,
    /// resolve with a cancellation error. Calling `close` again is a no-op.
    pub async fn close(&self) -> SequencerResult<()> {
        {
            let mut queue = self.shared.queue.lock().await;
            if queue.phase() != DispatchPhase::Running {
                return Ok(());
            }
            queue.set_phase(DispatchPhase::Draining);
        }

        info!("Closing dispatch coordinator");
        self.shared.shutdown.cancel();

        let joined = match self.flush_task.lock().await.take() {
            Some(handle) => handle
                .await
                .map_err(|e| SequencerError::Internal(format!("flush loop failed: {}", e))),
            None => Ok(()),
        };

        let stragglers = {
            let mut queue = self.shared.queue.lock().await;
            let batches = queue.drain();
            queue.set_phase(DispatchPhase::Closed);
            batches
        };
        for queued in stragglers.into_iter().flatten() {
            queued.resolve(Err(SequencerError::cancelled("send transaction")));
        }
        metrics::record_queue_depth(0);

        info!("Dispatch coordinator closed");
        joined
    }

    pub async fn phase(&self) -> DispatchPhase {
        self.shared.queue.lock().await.phase()
    }

    /// Transactions waiting for the next flush
    pub async fn queue_len(&self) -> usize {
        self.shared.queue.lock().await.len()
    }

    pub fn registry(&self) -> &Arc<SequencerRegistry> {
        &self.shared.registry
    }

    /// Token cancelled when the coordinator closes
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.child_token()
    }
}

impl Drop for DispatchCoordinator {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

async fn wait_for_result(
    cancel: &CancellationToken,
    receiver: DispatchReceiver,
) -> SequencerResult<String> {
    tokio::select! {
        biased;
        result = receiver => result
            .unwrap_or_else(|_| Err(SequencerError::cancelled("send transaction"))),
        _ = cancel.cancelled() => Err(SequencerError::cancelled("send transaction")),
    }
}

async fn flush_loop(shared: Arc<Shared>) {
    let period = shared.config.flush_interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("Dispatch flush loop started ({}ms)", period.as_millis());

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = ticker.tick() => shared.flush().await,
        }
    }

    info!("Dispatch flush loop stopped");
}

impl Shared {
    /// Submit everything queued, one concurrent batch per sender
    async fn flush(&self) {
        let batches = {
            let mut queue = self.queue.lock().await;
            queue.drain()
        };
        if batches.is_empty() {
            return;
        }
        metrics::record_queue_depth(0);

        let count: usize = batches.iter().map(Vec::len).sum();
        let started = std::time::Instant::now();

        join_all(batches.into_iter().map(|batch| self.flush_batch(batch))).await;

        metrics::record_flush_latency(started.elapsed().as_secs_f64());
        debug!("Flushed {} transactions in {:?}", count, started.elapsed());
    }

    async fn flush_batch(&self, batch: Vec<QueuedTransaction>) {
        let records: Vec<TransactionRecord> = batch.iter().map(|q| q.record.clone()).collect();

        let submission = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            results = self.submit(&records) => Some(results),
        };

        match submission {
            None => {
                for queued in batch {
                    queued.resolve(Err(SequencerError::cancelled("send transaction")));
                }
            }
            Some(Ok(results)) => {
                for (queued, result) in batch.into_iter().zip(results) {
                    queued.resolve(result);
                }
            }
            Some(Err(e)) => {
                error!(
                    "Submission of {} transactions from {} failed: {}",
                    records.len(),
                    records[0].sender(),
                    e
                );
                for queued in batch {
                    queued.resolve(Err(e.clone()));
                }
            }
        }
    }

    /// One ledger call for `records`, bounded by the send timeout.
    ///
    /// The returned results are index-aligned with `records`.
    async fn submit(
        &self,
        records: &[TransactionRecord],
    ) -> SequencerResult<Vec<SequencerResult<String>>> {
        let send_timeout = self.config.send_timeout();

        if let [record] = records {
            let sent = timeout(send_timeout, self.client.send_transaction(record))
                .await
                .map_err(|_| LedgerError::Timeout {
                    operation: "send transaction".to_string(),
                })?;
            let result = match sent {
                Ok(id) => Ok(id),
                Err(LedgerError::Rejected(reason)) => Err(SequencerError::Rejected {
                    nonce: record.nonce(),
                    reason,
                }),
                Err(e) => Err(e.into()),
            };
            return Ok(vec![result]);
        }

        let outcomes = timeout(send_timeout, self.client.send_transactions(records))
            .await
            .map_err(|_| LedgerError::Timeout {
                operation: "send transactions".to_string(),
            })??;

        if outcomes.len() != records.len() {
            warn!(
                "Ledger reported {} outcomes for {} transactions",
                outcomes.len(),
                records.len()
            );
        }

        let mut outcomes = outcomes.into_iter();
        let results = records
            .iter()
            .map(|record| match outcomes.next() {
                Some(outcome) => outcome.into_result(record.nonce()),
                None => Err(SequencerError::Ledger(LedgerError::InvalidResponse(format!(
                    "no outcome for nonce {}",
                    record.nonce()
                )))),
            })
            .collect();

        Ok(results)
    }
}
