//! Settlement Engine: submits verified payments on-chain and tracks them to confirmation.
//!
//! Two paths populate and advance [`SettlementRecord`]s: `submit` (the synchronous path
//! `/settle` calls, spec.md §4.7.1) and the background worker (§4.7.2), which retries
//! stalled submissions, claims bond backstops past deadline, and promotes records through
//! the FCR lattice as the monitor's view advances. The worker's non-reentrant tick guard
//! and per-id serialized updates follow the teacher's instrumented-async-task style
//! (`#[instrument(skip_all, err)]` in `facilitator_local.rs`, cancellation via `sig_down.rs`).

use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::bond::{BondError, BondLedger};
use crate::chain::{ChainError, ChainRpc};
use crate::fcr::{FcrMonitor, Level};
use crate::types::{
    ConfirmationLevel, Phase, PaymentAuthorization, PaymentId, PaymentRequirements,
    SettlementStatus, TokenAmount, TransactionHash, UnixTimestamp,
};

#[derive(Debug, Clone)]
pub struct SettlementRecord {
    pub payment_id: PaymentId,
    pub payment: PaymentAuthorization,
    pub requirements: PaymentRequirements,
    pub status: SettlementStatus,
    pub transaction: Option<TransactionHash>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: UnixTimestamp,
    pub updated_at: UnixTimestamp,
    pub last_error: Option<String>,
    pub confirmed_height: Option<u64>,
    pub confirmation_level: ConfirmationLevel,
    pub bond_committed: bool,
    pub bond_deadline: Option<UnixTimestamp>,
}

#[derive(thiserror::Error, Debug)]
pub enum SettlementError {
    #[error("settlement {0} not found")]
    NotFound(PaymentId),
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("bond error: {0}")]
    Bond(#[from] BondError),
}

pub struct SettlementConfig {
    pub max_attempts: u32,
    pub bond_window_seconds: u64,
    pub retry_backoff: Duration,
}

/// Coordinates submission and ongoing tracking of settlements.
pub struct SettlementEngine {
    chain: Arc<dyn ChainRpc>,
    bond: Arc<dyn BondLedger>,
    fcr: Arc<FcrMonitor>,
    records: DashMap<PaymentId, Arc<Mutex<SettlementRecord>>>,
    config: SettlementConfig,
    worker_running: AtomicBool,
}

impl SettlementEngine {
    pub fn new(
        chain: Arc<dyn ChainRpc>,
        bond: Arc<dyn BondLedger>,
        fcr: Arc<FcrMonitor>,
        config: SettlementConfig,
    ) -> Self {
        SettlementEngine {
            chain,
            bond,
            fcr,
            records: DashMap::new(),
            config,
            worker_running: AtomicBool::new(false),
        }
    }

    /// The synchronous `/settle` path: commits a bond backstop for the provider, then
    /// submits the transfer, and records the settlement as `Submitted`. Bond commit runs
    /// first (spec.md §4.7.1) so a transfer never lands on-chain without a settlement
    /// record able to claim against the bond if it later stalls; if submission then fails,
    /// the bond commit is released rather than left dangling.
    #[instrument(skip_all, err, fields(payment_id = %payment.payment_id()))]
    pub async fn submit(
        &self,
        payment: PaymentAuthorization,
        requirements: PaymentRequirements,
        provider: crate::types::EvmAddress,
        now: UnixTimestamp,
    ) -> Result<SettlementRecord, SettlementError> {
        let payment_id = payment.payment_id();
        let deadline = UnixTimestamp(now.0 + self.config.bond_window_seconds);

        self.bond
            .commit_payment(payment_id, provider, payment.value, deadline)
            .await?;
        let tx = match self.chain.submit_transfer(payment.token, &payment).await {
            Ok(tx) => tx,
            Err(error) => {
                if let Err(release_error) = self.bond.release_payment(payment_id).await {
                    tracing::warn!(%release_error, payment_id = %payment_id, "failed to release bond after submit failure");
                }
                return Err(error.into());
            }
        };

        let record = SettlementRecord {
            payment_id,
            payment,
            requirements,
            status: SettlementStatus::Submitted,
            transaction: Some(tx),
            attempts: 1,
            max_attempts: self.config.max_attempts,
            created_at: now,
            updated_at: now,
            last_error: None,
            confirmed_height: None,
            confirmation_level: ConfirmationLevel::L0,
            bond_committed: true,
            bond_deadline: Some(deadline),
        };
        self.records
            .insert(payment_id, Arc::new(Mutex::new(record.clone())));
        Ok(record)
    }

    pub async fn get(&self, payment_id: PaymentId) -> Result<SettlementRecord, SettlementError> {
        let record = self
            .records
            .get(&payment_id)
            .ok_or(SettlementError::NotFound(payment_id))?;
        let record = record.value().lock().await;
        Ok(record.clone())
    }

    /// Runs the background worker until `cancellation` fires: every tick, advance the
    /// confirmation level of in-flight settlements and retry/claim those that have
    /// stalled. The `worker_running` flag makes overlapping invocations of this method
    /// a no-op rather than letting two tickers race on the same records.
    pub async fn run_worker(self: Arc<Self>, tick: Duration, cancellation: CancellationToken) {
        if self.worker_running.swap(true, Ordering::SeqCst) {
            tracing::warn!("settlement worker already running, ignoring duplicate start");
            return;
        }
        let mut interval = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    tracing::info!("settlement worker shutting down");
                    break;
                }
                _ = interval.tick() => {
                    self.tick_once().await;
                }
            }
        }
        self.worker_running.store(false, Ordering::SeqCst);
    }

    #[instrument(skip_all)]
    async fn tick_once(&self) {
        let ids: Vec<PaymentId> = self.records.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Err(error) = self.advance_one(id).await {
                tracing::warn!(payment_id = %id, %error, "failed to advance settlement");
            }
        }
    }

    async fn advance_one(&self, payment_id: PaymentId) -> Result<(), SettlementError> {
        let Some(record_lock) = self.records.get(&payment_id).map(|e| Arc::clone(e.value())) else {
            return Ok(());
        };
        let mut record = record_lock.lock().await;
        if matches!(record.status, SettlementStatus::Confirmed | SettlementStatus::Failed) {
            return Ok(());
        }

        if let Some(tx) = record.transaction {
            let receipt = self.chain.wait_for_receipt(tx).await;
            match receipt {
                Ok(outcome) if outcome.success => {
                    record.confirmed_height = Some(outcome.block_number);
                    let level = self.fcr.evaluate(outcome.block_number).await;
                    record.confirmation_level = match level {
                        Level::L0 => ConfirmationLevel::L0,
                        Level::L1 => ConfirmationLevel::L1,
                        Level::L2 => ConfirmationLevel::L2,
                        Level::L3 => ConfirmationLevel::L3,
                    };
                    if record.confirmation_level >= ConfirmationLevel::L2 && record.bond_committed {
                        self.bond.release_payment(payment_id).await?;
                        record.bond_committed = false;
                    }
                    if record.confirmation_level == ConfirmationLevel::L3 {
                        record.status = SettlementStatus::Confirmed;
                    }
                }
                Ok(_failed_receipt) => {
                    self.handle_stall(&mut record, payment_id).await?;
                }
                Err(error) => {
                    record.last_error = Some(error.to_string());
                }
            }
        }

        if let Some(deadline) = record.bond_deadline {
            if record.bond_committed && record.status != SettlementStatus::Confirmed {
                let now = UnixTimestamp::now();
                if now.0 >= deadline.0 {
                    self.bond.claim_payment(payment_id).await?;
                    record.bond_committed = false;
                    record.status = SettlementStatus::Failed;
                    record.last_error = Some("bond claimed after deadline".to_string());
                }
            }
        }

        record.updated_at = UnixTimestamp::now();
        Ok(())
    }

    async fn handle_stall(
        &self,
        record: &mut SettlementRecord,
        payment_id: PaymentId,
    ) -> Result<(), SettlementError> {
        if record.attempts >= record.max_attempts {
            record.status = SettlementStatus::Failed;
            record.last_error = Some("max attempts exceeded".to_string());
            if record.bond_committed {
                self.bond.claim_payment(payment_id).await?;
                record.bond_committed = false;
            }
            return Ok(());
        }
        record.status = SettlementStatus::Retrying;
        let tx = self
            .chain
            .submit_transfer(record.payment.token, &record.payment)
            .await?;
        record.transaction = Some(tx);
        record.attempts += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bond::stub::StubBondLedger;
    use crate::chain::stub::StubChainRpc;
    use crate::types::{EvmAddress, EvmSignature, Nonce};
    use alloy_primitives::{Address, B256, U256};
    use std::sync::atomic::Ordering as StdOrdering;

    fn sample_payment() -> (PaymentAuthorization, PaymentRequirements) {
        let token = EvmAddress(Address::repeat_byte(1));
        let from = EvmAddress(Address::repeat_byte(2));
        let to = EvmAddress(Address::repeat_byte(3));
        let payment = PaymentAuthorization {
            token,
            from,
            to,
            value: TokenAmount(U256::from(100u64)),
            valid_after: UnixTimestamp(0),
            valid_before: UnixTimestamp(u64::MAX),
            nonce: Nonce(B256::repeat_byte(4)),
            signature: EvmSignature([9u8; 65]),
        };
        let requirements = PaymentRequirements {
            pay_to: to,
            max_amount_required: TokenAmount(U256::from(100u64)),
            token_address: token,
            chain_id: 314159,
            resource: "r".to_string(),
            description: "d".to_string(),
        };
        (payment, requirements)
    }

    #[tokio::test]
    async fn submit_records_as_submitted_and_commits_bond() {
        let chain = Arc::new(StubChainRpc::default());
        let bond = Arc::new(StubBondLedger::default());
        let provider = EvmAddress(Address::repeat_byte(5));
        bond.set_available(provider, TokenAmount(U256::from(1000u64)));
        let fcr = Arc::new(FcrMonitor::new(Duration::from_secs(5)));
        let engine = SettlementEngine::new(
            chain.clone() as Arc<dyn ChainRpc>,
            bond.clone() as Arc<dyn crate::bond::BondLedger>,
            fcr,
            SettlementConfig {
                max_attempts: 3,
                bond_window_seconds: 3600,
                retry_backoff: Duration::from_secs(1),
            },
        );
        let (payment, requirements) = sample_payment();
        let record = engine
            .submit(payment.clone(), requirements, provider, UnixTimestamp::now())
            .await
            .expect("submit succeeds");
        assert_eq!(record.status, SettlementStatus::Submitted);
        assert_eq!(chain.submissions.lock().unwrap().len(), 1);
        assert_eq!(
            bond.exposure_of(provider).await.unwrap(),
            TokenAmount(U256::from(100u64))
        );
    }

    #[tokio::test]
    async fn worker_promotes_to_confirmed_once_l3() {
        let chain = Arc::new(StubChainRpc::default());
        chain.next_receipt_success.store(true, StdOrdering::SeqCst);
        let bond = Arc::new(StubBondLedger::default());
        let provider = EvmAddress(Address::repeat_byte(6));
        bond.set_available(provider, TokenAmount(U256::from(1000u64)));
        let fcr = Arc::new(FcrMonitor::new(Duration::from_secs(5)));
        let engine = Arc::new(SettlementEngine::new(
            chain.clone() as Arc<dyn ChainRpc>,
            bond.clone() as Arc<dyn crate::bond::BondLedger>,
            fcr.clone(),
            SettlementConfig {
                max_attempts: 3,
                bond_window_seconds: 3600,
                retry_backoff: Duration::from_secs(1),
            },
        ));
        let (payment, requirements) = sample_payment();
        let record = engine
            .submit(payment, requirements, provider, UnixTimestamp::now())
            .await
            .unwrap();

        // Prime the monitor so `evaluate` reports L3 for the confirmed height.
        struct AlwaysFinal;
        #[async_trait::async_trait]
        impl crate::fcr::ConsensusRpc for AlwaysFinal {
            async fn get_progress(&self) -> Result<crate::fcr::InstanceProgress, crate::fcr::FcrError> {
                Ok(crate::fcr::InstanceProgress {
                    instance: 1,
                    round: 0,
                    phase: Phase::Decide,
                })
            }
            async fn get_latest_certificate(
                &self,
            ) -> Result<crate::fcr::ConsensusCertificate, crate::fcr::FcrError> {
                Ok(crate::fcr::ConsensusCertificate {
                    instance: 1,
                    finalized_height: 1_000_000,
                })
            }
            async fn get_certificate(
                &self,
                instance: u64,
            ) -> Result<Option<crate::fcr::ConsensusCertificate>, crate::fcr::FcrError> {
                Ok(Some(crate::fcr::ConsensusCertificate {
                    instance,
                    finalized_height: 1_000_000,
                }))
            }
            async fn get_chain_head(&self) -> Result<u64, crate::fcr::FcrError> {
                Ok(1_000_000)
            }
        }
        fcr.poll_once(&AlwaysFinal).await.unwrap();

        engine.advance_one(record.payment_id).await.unwrap();
        let updated = engine.get(record.payment_id).await.unwrap();
        assert_eq!(updated.status, SettlementStatus::Confirmed);
        assert_eq!(updated.confirmation_level, ConfirmationLevel::L3);
        assert!(!updated.bond_committed);
    }
}
