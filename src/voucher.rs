//! Deferred Payment Voucher Store: off-chain aggregated micropayments between a fixed
//! buyer/seller pair, settled against an escrow contract as value deltas.
//!
//! A voucher's `value_aggregate` and `nonce` must both be monotonically non-decreasing
//! across vouchers accepted for the same `(buyer, seller)` pair (spec.md §4.8) — a buyer
//! re-signs a single running total rather than emitting a new authorization per
//! micropayment. Settlement calls the escrow contract's `collect`, which pays out only
//! the delta since the last settled voucher.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::instrument;

use crate::escrow::{BuyerAccount, EscrowContract, EscrowError};
use crate::signature::{self, SignatureError};
use crate::types::{EvmAddress, EvmSignature, PaymentId, TokenAmount, TransactionHash, UnixTimestamp};

#[derive(Debug, Clone)]
pub struct Voucher {
    pub buyer: EvmAddress,
    pub seller: EvmAddress,
    pub escrow: EvmAddress,
    pub value_aggregate: TokenAmount,
    pub nonce: u64,
    pub timestamp: UnixTimestamp,
    pub signature: EvmSignature,
}

impl Voucher {
    /// The channel id is stable across resubmissions: it's derived from the
    /// (buyer, seller) pair, not the mutable signature, so `voucher:{id}:{buyer}:{seller}`
    /// keeps addressing the same channel as the buyer re-signs a growing running total.
    /// This store only ever tracks one channel per pair (channel nonce 0) — see
    /// DESIGN.md for the channel-reopening open question.
    pub fn id(&self) -> PaymentId {
        PaymentId::from_channel(self.buyer, self.seller, 0)
    }
}

#[derive(Debug, Clone, Default)]
struct AccountState {
    last_accepted_value: TokenAmount,
    last_accepted_nonce: Option<u64>,
    settled_value: TokenAmount,
    settled_nonce: Option<u64>,
    settled_transaction: Option<TransactionHash>,
    vouchers: Vec<Voucher>,
}

#[derive(thiserror::Error, Debug)]
pub enum VoucherError {
    #[error("voucher signature invalid: {0}")]
    InvalidSignature(#[source] SignatureError),
    #[error("nonce {given} is not greater than the last accepted nonce {last}")]
    NonceNotMonotonic { given: u64, last: u64 },
    #[error("value_aggregate {given} is not greater than the last accepted value {last}")]
    ValueNotMonotonic { given: TokenAmount, last: TokenAmount },
    #[error("voucher {0} has expired its 7-day acceptance window")]
    Expired(PaymentId),
    #[error("no vouchers stored for buyer {0} / seller {1}")]
    NoAccount(EvmAddress, EvmAddress),
    #[error("voucher {0} not found")]
    NotFound(PaymentId),
    #[error("voucher {0} is already settled")]
    AlreadySettled(PaymentId),
    #[error("no escrow contract is configured for this facilitator")]
    EscrowNotConfigured,
    #[error("escrow contract call failed: {0}")]
    Escrow(#[from] EscrowError),
}

pub const VOUCHER_TTL_SECONDS: u64 = 7 * 24 * 3600;

/// Outcome of a successful on-chain settlement.
#[derive(Debug, Clone, Copy)]
pub struct SettlementOutcome {
    pub delta: TokenAmount,
    pub transaction: TransactionHash,
}

/// Tracks per-(buyer, seller) voucher state. Keyed like the risk engine — a `DashMap`
/// of per-pair `Mutex`es, so unrelated buyer/seller pairs never contend.
pub struct VoucherStore {
    accounts: DashMap<(EvmAddress, EvmAddress), Arc<Mutex<AccountState>>>,
    eip712_name: String,
    eip712_version: String,
    escrow: Option<Arc<dyn EscrowContract>>,
}

impl VoucherStore {
    pub fn new(eip712_name: String, eip712_version: String, escrow: Option<Arc<dyn EscrowContract>>) -> Self {
        VoucherStore {
            accounts: DashMap::new(),
            eip712_name,
            eip712_version,
            escrow,
        }
    }

    fn entry(&self, buyer: EvmAddress, seller: EvmAddress) -> Arc<Mutex<AccountState>> {
        let record = self
            .accounts
            .entry((buyer, seller))
            .or_insert_with(|| Arc::new(Mutex::new(AccountState::default())));
        Arc::clone(record.value())
    }

    /// Validates and stores a newly signed voucher, rejecting non-monotonic nonce/value
    /// and signatures that don't recover to `buyer`.
    #[instrument(skip_all, err, fields(buyer = %voucher.buyer, seller = %voucher.seller))]
    pub async fn store_voucher(
        &self,
        chain_id: u64,
        voucher: Voucher,
        now: UnixTimestamp,
    ) -> Result<(), VoucherError> {
        if now.saturating_sub(voucher.timestamp) > VOUCHER_TTL_SECONDS {
            return Err(VoucherError::Expired(voucher.id()));
        }
        let domain = signature::voucher_domain(
            &self.eip712_name,
            &self.eip712_version,
            chain_id,
            voucher.escrow.into(),
        );
        signature::recover_voucher_signer(
            voucher.buyer,
            voucher.seller,
            voucher.value_aggregate,
            voucher.timestamp,
            voucher.nonce,
            &voucher.signature,
            &domain,
        )
        .map_err(VoucherError::InvalidSignature)?;

        let account_lock = self.entry(voucher.buyer, voucher.seller);
        let mut account = account_lock.lock().await;

        if let Some(last_nonce) = account.last_accepted_nonce {
            if voucher.nonce <= last_nonce {
                return Err(VoucherError::NonceNotMonotonic {
                    given: voucher.nonce,
                    last: last_nonce,
                });
            }
        }
        if voucher.value_aggregate <= account.last_accepted_value && account.last_accepted_nonce.is_some() {
            return Err(VoucherError::ValueNotMonotonic {
                given: voucher.value_aggregate,
                last: account.last_accepted_value,
            });
        }

        account.last_accepted_nonce = Some(voucher.nonce);
        account.last_accepted_value = voucher.value_aggregate;
        account.vouchers.push(voucher);
        Ok(())
    }

    /// Settles the delta between the latest accepted voucher and the last settled one by
    /// calling the escrow contract's `collect`, then records the settling transaction and
    /// marks the voucher settled.
    ///
    /// `voucher_id` addresses the channel (it's the same for every voucher a buyer signs
    /// against a seller, per [`Voucher::id`]) rather than one specific voucher in the
    /// history, so settlement always pays out against the latest accepted voucher, not
    /// whichever one happens to match first.
    #[instrument(skip_all, err, fields(buyer = %buyer, seller = %seller))]
    pub async fn settle_voucher(
        &self,
        buyer: EvmAddress,
        seller: EvmAddress,
        voucher_id: PaymentId,
    ) -> Result<SettlementOutcome, VoucherError> {
        let escrow = self.escrow.as_ref().ok_or(VoucherError::EscrowNotConfigured)?;

        let account_lock = {
            let found = self.accounts.get(&(buyer, seller));
            match found {
                Some(entry) => Arc::clone(entry.value()),
                None => return Err(VoucherError::NoAccount(buyer, seller)),
            }
        };
        let mut account = account_lock.lock().await;
        let voucher = account
            .vouchers
            .last()
            .filter(|v| v.id() == voucher_id)
            .cloned()
            .ok_or(VoucherError::NotFound(voucher_id))?;

        if account.settled_nonce == Some(voucher.nonce) {
            return Err(VoucherError::AlreadySettled(voucher_id));
        }

        let transaction = escrow.collect(&voucher).await?;
        let delta = voucher.value_aggregate.saturating_sub(account.settled_value);
        account.settled_value = voucher.value_aggregate;
        account.settled_nonce = Some(voucher.nonce);
        account.settled_transaction = Some(transaction);
        Ok(SettlementOutcome { delta, transaction })
    }

    pub async fn collected_value(&self, buyer: EvmAddress, seller: EvmAddress) -> TokenAmount {
        let account_lock = self.entry(buyer, seller);
        let account = account_lock.lock().await;
        account.settled_value
    }

    pub async fn settled_nonce(&self, buyer: EvmAddress, seller: EvmAddress) -> Option<u64> {
        let account_lock = self.entry(buyer, seller);
        let account = account_lock.lock().await;
        account.settled_nonce
    }

    pub async fn vouchers_for_buyer(&self, buyer: EvmAddress) -> Vec<Voucher> {
        let mut result = Vec::new();
        for entry in self.accounts.iter() {
            if entry.key().0 == buyer {
                let account = entry.value().lock().await;
                result.extend(account.vouchers.iter().cloned());
            }
        }
        result
    }

    /// Reads the buyer's on-chain escrow balance/thaw state (spec.md §4.8's
    /// `getAccount` read-through), used by `GET /deferred/buyers/{addr}`.
    pub async fn buyer_account(&self, buyer: EvmAddress) -> Result<Option<BuyerAccount>, VoucherError> {
        let Some(escrow) = self.escrow.as_ref() else {
            return Ok(None);
        };
        Ok(Some(escrow.get_account(buyer).await?))
    }
}
