//! tx-sequencer simulator
//!
//! Drives concurrent workers per account against an in-memory ledger, with a
//! block producer advancing account nonces, until interrupted.

use anyhow::Result;
use futures::future::join_all;
use sha3::{Digest, Keccak256};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tx_sequencer::config::{LoggingConfig, Settings};
use tx_sequencer::{
    metrics, Address, DispatchCoordinator, GasPricePolicy, InMemoryLedger,
    ReconciliationSupervisor, SequencerError, SequencerResult, TransactionDraft,
    TransactionSigner,
};

/// Keyed hash standing in for a real signature scheme
struct DemoSigner {
    key: Vec<u8>,
}

impl DemoSigner {
    fn new(seed: &str) -> Self {
        Self {
            key: Keccak256::digest(seed.as_bytes()).to_vec(),
        }
    }
}

impl TransactionSigner for DemoSigner {
    fn sign(&self, payload: &[u8]) -> SequencerResult<Vec<u8>> {
        let mut hasher = Keccak256::new();
        hasher.update(&self.key);
        hasher.update(payload);
        Ok(hasher.finalize().to_vec())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;

    // Initialize logging
    init_logging(&settings.logging);

    info!("Starting tx-sequencer simulator v{}", env!("CARGO_PKG_VERSION"));

    let simulation = settings.simulation.clone();
    let ledger = Arc::new(InMemoryLedger::new(simulation.min_gas_price));

    let coordinator = Arc::new(
        DispatchCoordinator::builder()
            .ledger_client(ledger.clone())
            .dispatcher_config(settings.dispatcher.clone())
            .gas_policy(GasPricePolicy::from_config(&settings.gas))
            .build()?,
    );
    info!("Dispatch coordinator initialized");

    let supervisor_handle = if settings.supervisor.enabled {
        let supervisor = ReconciliationSupervisor::new(
            coordinator.clone(),
            settings.supervisor.reconcile_interval(),
        );
        Some(supervisor.spawn())
    } else {
        None
    };

    // Block producer
    let block_handle = tokio::spawn({
        let ledger = ledger.clone();
        let interval = Duration::from_millis(simulation.block_interval_ms);
        async move {
            let mut height = 0u64;
            loop {
                tokio::time::sleep(interval).await;
                height += 1;
                let executed = ledger.execute_pending().await;
                info!("Block {}: executed {} transactions", height, executed);
            }
        }
    });

    // Workers
    let workers = CancellationToken::new();
    let mut worker_handles = Vec::new();
    for account in 0..simulation.accounts {
        let seed = format!("{}-account-{}", simulation.chain_id, account);
        let sender =
            Address::from_bytes(&simulation.hrp, Keccak256::digest(seed.as_bytes()).to_vec())?;
        let signer: Arc<dyn TransactionSigner> = Arc::new(DemoSigner::new(&seed));
        info!("Account {}: {}", account, sender);

        for worker in 0..simulation.workers_per_account {
            let worker = Worker {
                coordinator: coordinator.clone(),
                sender: sender.clone(),
                signer: signer.clone(),
                chain_id: simulation.chain_id.clone(),
                name: format!("{}/{}", account, worker),
            };
            let cancel = workers.child_token();
            worker_handles.push(tokio::spawn(async move { worker.run(cancel).await }));
        }
    }

    info!(
        "Simulator is running: {} accounts x {} workers",
        simulation.accounts, simulation.workers_per_account
    );

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    workers.cancel();
    if let Err(e) = coordinator.close().await {
        error!("Dispatch coordinator close error: {}", e);
    }

    let sent: u64 = join_all(worker_handles)
        .await
        .into_iter()
        .filter_map(|joined| joined.ok())
        .sum();
    if let Some(handle) = supervisor_handle {
        let _ = handle.await;
    }
    block_handle.abort();

    info!(
        "Simulator stopped: {} transactions accepted, {} submitted to the ledger",
        sent,
        ledger.submitted().await.len()
    );
    match metrics::render() {
        Ok(text) => debug!("Final metrics:\n{}", text),
        Err(e) => warn!("Failed to render metrics: {}", e),
    }

    Ok(())
}

/// One simulated client sending from a shared account
struct Worker {
    coordinator: Arc<DispatchCoordinator>,
    sender: Address,
    signer: Arc<dyn TransactionSigner>,
    chain_id: String,
    name: String,
}

impl Worker {
    /// Send until cancelled; returns the number of accepted transactions
    async fn run(self, cancel: CancellationToken) -> u64 {
        let mut accepted = 0;

        while !cancel.is_cancelled() {
            match self.send_one(&cancel).await {
                Ok(id) => {
                    accepted += 1;
                    debug!("Worker {} sent {}", self.name, id);
                }
                Err(SequencerError::Cancelled { .. }) | Err(SequencerError::Closed) => break,
                Err(e) => {
                    warn!("Worker {} failed: {}", self.name, e);
                    if e.requires_reconciliation() || matches!(e, SequencerError::NonceGap { .. }) {
                        if let Err(e) = self
                            .coordinator
                            .reconcile_with_ledger(&cancel, &self.sender)
                            .await
                        {
                            warn!("Worker {} could not reconcile: {}", self.name, e);
                        }
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                    }
                }
            }
        }

        accepted
    }

    async fn send_one(&self, cancel: &CancellationToken) -> SequencerResult<String> {
        let draft = TransactionDraft::new(self.sender.as_bech32(), "1")
            .with_chain_id(self.chain_id.clone())
            .with_gas_limit(50_000)
            .with_data(format!("worker {}", self.name).into_bytes());

        let record = self
            .coordinator
            .assign_nonce_and_gas_price(cancel, &self.sender, draft)
            .await?;
        let signed = record.sign(self.signer.as_ref())?;

        self.coordinator
            .send_transactions(cancel, vec![signed])
            .await
            .into_iter()
            .next()
            .unwrap_or_else(|| Err(SequencerError::Internal("missing dispatch result".to_string())))
    }
}

fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
