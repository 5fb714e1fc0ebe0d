//! Risk State Engine: per-wallet exposure tracking and tiered limits.
//!
//! Every payer wallet has a pending-exposure total (authorizations accepted but not yet
//! confirmed) and a rolling daily total, both checked against a limit table keyed by
//! [`Tier`]. `check_payment` and `reserve_credit` must be atomic with respect to each other
//! for a given wallet or two concurrent requests can both pass the check and together
//! blow the limit (TOCTOU) — so state is kept behind a `DashMap` of per-wallet `Mutex`es,
//! the same "shard the lock by key" shape as the teacher's `PendingNonceManager`
//! (`chain/eip155/pending_nonce_manager.rs`): a short-held dashmap lock to clone the
//! per-wallet `Arc<Mutex<_>>`, then the actual work happens under that narrower lock.

use alloy_primitives::U256;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::types::{EvmAddress, Tier, TokenAmount, UnixTimestamp};

/// A wallet graduates `UNKNOWN` -> `HISTORY_7D` at 7 days of age and `HISTORY_7D` ->
/// `HISTORY_30D` at 30 days, per the tier names themselves; `VERIFIED` is reachable only
/// through an explicit [`RiskState::set_tier_override`] (no on-chain signal implies it).
pub const HISTORY_7D_SECONDS: u64 = 7 * 24 * 3600;
pub const HISTORY_30D_SECONDS: u64 = 30 * 24 * 3600;

/// Per-tier daily caps, converted from spec's fixed `UNKNOWN=$5, HISTORY_7D=$50,
/// HISTORY_30D=$500, VERIFIED=$5000` schedule, scaled by the settled token's decimals
/// assuming a USD-pegged stablecoin (one whole token == $1).
#[derive(Debug, Clone, Copy)]
pub struct TierDailyCaps {
    pub unknown: TokenAmount,
    pub history_7d: TokenAmount,
    pub history_30d: TokenAmount,
    pub verified: TokenAmount,
}

impl TierDailyCaps {
    pub fn from_token_decimals(decimals: u8) -> Self {
        let scale = U256::from(10u64).pow(U256::from(decimals));
        TierDailyCaps {
            unknown: TokenAmount(U256::from(5u64) * scale),
            history_7d: TokenAmount(U256::from(50u64) * scale),
            history_30d: TokenAmount(U256::from(500u64) * scale),
            verified: TokenAmount(U256::from(5_000u64) * scale),
        }
    }

    pub fn for_tier(&self, tier: Tier) -> TokenAmount {
        match tier {
            Tier::Unknown => self.unknown,
            Tier::History7d => self.history_7d,
            Tier::History30d => self.history_30d,
            Tier::Verified => self.verified,
        }
    }
}

/// Limit table. `max_per_transaction` and `max_pending_per_wallet` are absolute; the
/// effective daily cap is `min(daily_limit_per_wallet, tier_daily_caps[tier])` (spec.md
/// §4.3) — the tier table bounds the daily cap only, never the per-tx or pending caps.
#[derive(Debug, Clone, Copy)]
pub struct LimitTable {
    pub max_per_transaction: TokenAmount,
    pub max_pending_per_wallet: TokenAmount,
    pub daily_limit_per_wallet: TokenAmount,
    pub tier_daily_caps: TierDailyCaps,
}

impl LimitTable {
    fn effective_daily_cap(&self, tier: Tier) -> TokenAmount {
        self.daily_limit_per_wallet.min(self.tier_daily_caps.for_tier(tier))
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RiskError {
    #[error("payment value {value} exceeds the single-payment limit {limit} for this wallet's tier")]
    ExceedsSinglePaymentLimit { value: TokenAmount, limit: TokenAmount },
    #[error("payment would push pending exposure to {projected}, over the limit {limit}")]
    ExceedsPendingLimit { projected: TokenAmount, limit: TokenAmount },
    #[error("payment would push today's total to {projected}, over the daily limit {limit}")]
    ExceedsDailyLimit { projected: TokenAmount, limit: TokenAmount },
}

#[derive(Debug, Clone, Default)]
struct WalletRecord {
    pending: TokenAmount,
    daily_total: TokenAmount,
    daily_epoch_day: u64,
    first_seen: Option<UnixTimestamp>,
    tier_override: Option<Tier>,
}

impl WalletRecord {
    fn daily_total_for(&self, today: u64) -> TokenAmount {
        if self.daily_epoch_day == today {
            self.daily_total
        } else {
            TokenAmount::ZERO
        }
    }

    fn tier(&self, now: UnixTimestamp) -> Tier {
        if let Some(tier) = self.tier_override {
            return tier;
        }
        match self.first_seen {
            Some(first_seen) if now.saturating_sub(first_seen) >= HISTORY_30D_SECONDS => Tier::History30d,
            Some(first_seen) if now.saturating_sub(first_seen) >= HISTORY_7D_SECONDS => Tier::History7d,
            _ => Tier::Unknown,
        }
    }
}

/// Tracks pending/daily exposure per payer wallet and enforces tier-based limits.
pub struct RiskState {
    wallets: DashMap<EvmAddress, Arc<Mutex<WalletRecord>>>,
    limits: LimitTable,
}

impl RiskState {
    pub fn new(limits: LimitTable) -> Self {
        RiskState {
            wallets: DashMap::new(),
            limits,
        }
    }

    fn entry(&self, wallet: EvmAddress) -> Arc<Mutex<WalletRecord>> {
        let record = self
            .wallets
            .entry(wallet)
            .or_insert_with(|| Arc::new(Mutex::new(WalletRecord::default())));
        Arc::clone(record.value())
    }

    /// Marks the wallet as seen as of `now` if this is its first appearance, without
    /// reserving any exposure. Called on every inbound request so age-based tiering
    /// has a clock to measure from.
    pub async fn observe_wallet(&self, wallet: EvmAddress, now: UnixTimestamp) {
        let record = self.entry(wallet);
        let mut record = record.lock().await;
        if record.first_seen.is_none() {
            record.first_seen = Some(now);
        }
    }

    /// Non-mutating check: would reserving `value` for `wallet` right now succeed?
    /// Does not reserve anything — callers needing atomicity across check+reserve
    /// must call [`RiskState::reserve_credit`] directly, which re-checks internally.
    pub async fn check_payment(
        &self,
        wallet: EvmAddress,
        value: TokenAmount,
        now: UnixTimestamp,
        today_epoch_day: u64,
    ) -> Result<(), RiskError> {
        let record = self.entry(wallet);
        let record = record.lock().await;
        self.check_locked(&record, value, now, today_epoch_day)
    }

    fn check_locked(
        &self,
        record: &WalletRecord,
        value: TokenAmount,
        now: UnixTimestamp,
        today_epoch_day: u64,
    ) -> Result<(), RiskError> {
        let tier = record.tier(now);

        if value > self.limits.max_per_transaction {
            return Err(RiskError::ExceedsSinglePaymentLimit {
                value,
                limit: self.limits.max_per_transaction,
            });
        }
        let projected_pending = record.pending.checked_add(value).unwrap_or(TokenAmount(U256::MAX));
        if projected_pending > self.limits.max_pending_per_wallet {
            return Err(RiskError::ExceedsPendingLimit {
                projected: projected_pending,
                limit: self.limits.max_pending_per_wallet,
            });
        }
        let effective_daily_cap = self.limits.effective_daily_cap(tier);
        let daily_so_far = record.daily_total_for(today_epoch_day);
        let projected_daily = daily_so_far.checked_add(value).unwrap_or(TokenAmount(U256::MAX));
        if projected_daily > effective_daily_cap {
            return Err(RiskError::ExceedsDailyLimit {
                projected: projected_daily,
                limit: effective_daily_cap,
            });
        }
        Ok(())
    }

    /// Atomically checks and reserves `value` of pending/daily exposure for `wallet`.
    /// This is the only path that should be used when a payment is about to be
    /// accepted for settlement — closes the TOCTOU window between check and reserve.
    pub async fn reserve_credit(
        &self,
        wallet: EvmAddress,
        value: TokenAmount,
        now: UnixTimestamp,
        today_epoch_day: u64,
    ) -> Result<(), RiskError> {
        let record_lock = self.entry(wallet);
        let mut record = record_lock.lock().await;
        self.check_locked(&record, value, now, today_epoch_day)?;
        record.pending = record.pending.checked_add(value).unwrap_or(record.pending);
        let daily_so_far = record.daily_total_for(today_epoch_day);
        record.daily_total = daily_so_far.checked_add(value).unwrap_or(daily_so_far);
        record.daily_epoch_day = today_epoch_day;
        if record.first_seen.is_none() {
            record.first_seen = Some(now);
        }
        Ok(())
    }

    /// Releases previously reserved pending exposure, e.g. on settlement failure or
    /// final expiry. Never goes negative; a double-release saturates at zero.
    pub async fn release_credit(&self, wallet: EvmAddress, value: TokenAmount) {
        let record_lock = self.entry(wallet);
        let mut record = record_lock.lock().await;
        record.pending = record.pending.saturating_sub(value);
    }

    /// Sets an explicit tier override for a wallet, bypassing age-based tiering.
    pub async fn set_tier_override(&self, wallet: EvmAddress, tier: Option<Tier>) {
        let record_lock = self.entry(wallet);
        let mut record = record_lock.lock().await;
        record.tier_override = tier;
    }

    pub async fn current_tier(&self, wallet: EvmAddress, now: UnixTimestamp) -> Tier {
        let record_lock = self.entry(wallet);
        let record = record_lock.lock().await;
        record.tier(now)
    }

    pub async fn pending_exposure(&self, wallet: EvmAddress) -> TokenAmount {
        let record_lock = self.entry(wallet);
        let record = record_lock.lock().await;
        record.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, U256};

    fn limits() -> LimitTable {
        LimitTable {
            max_per_transaction: TokenAmount(U256::from(500u64)),
            max_pending_per_wallet: TokenAmount(U256::from(1_000u64)),
            daily_limit_per_wallet: TokenAmount(U256::from(2_000_000u64)),
            tier_daily_caps: TierDailyCaps {
                unknown: TokenAmount(U256::from(2_000u64)),
                history_7d: TokenAmount(U256::from(20_000u64)),
                history_30d: TokenAmount(U256::from(200_000u64)),
                verified: TokenAmount(U256::from(2_000_000u64)),
            },
        }
    }

    fn wallet(byte: u8) -> EvmAddress {
        EvmAddress(Address::repeat_byte(byte))
    }

    #[tokio::test]
    async fn rejects_single_payment_over_tier_limit() {
        let state = RiskState::new(limits());
        let now = UnixTimestamp(1_000_000);
        let err = state
            .reserve_credit(wallet(1), TokenAmount(U256::from(600u64)), now, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, RiskError::ExceedsSinglePaymentLimit { .. }));
    }

    #[tokio::test]
    async fn concurrent_reserves_cannot_exceed_pending_limit() {
        let state = Arc::new(RiskState::new(limits()));
        let now = UnixTimestamp(1_000_000);
        let w = wallet(2);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let state = Arc::clone(&state);
            handles.push(tokio::spawn(async move {
                state
                    .reserve_credit(w, TokenAmount(U256::from(400u64)), now, 0)
                    .await
            }));
        }
        let mut ok_count = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                ok_count += 1;
            }
        }
        // Limit is 1000, each reservation is 400: at most 2 can succeed.
        assert_eq!(ok_count, 2);
        assert_eq!(
            state.pending_exposure(w).await,
            TokenAmount(U256::from(800u64))
        );
    }

    #[tokio::test]
    async fn release_credit_frees_pending_headroom() {
        let state = RiskState::new(limits());
        let now = UnixTimestamp(1_000_000);
        let w = wallet(3);
        state
            .reserve_credit(w, TokenAmount(U256::from(400u64)), now, 0)
            .await
            .unwrap();
        state.release_credit(w, TokenAmount(U256::from(400u64))).await;
        assert_eq!(state.pending_exposure(w).await, TokenAmount::ZERO);
    }

    #[tokio::test]
    async fn daily_cap_is_the_lesser_of_absolute_and_tier_caps() {
        // Generous per-tx/pending room so only the tiered daily cap (2_000 for UNKNOWN)
        // can reject, even though the absolute daily limit (2_000_000) would allow it.
        let generous = LimitTable {
            max_per_transaction: TokenAmount(U256::from(10_000u64)),
            max_pending_per_wallet: TokenAmount(U256::from(10_000u64)),
            daily_limit_per_wallet: TokenAmount(U256::from(2_000_000u64)),
            tier_daily_caps: TierDailyCaps {
                unknown: TokenAmount(U256::from(2_000u64)),
                history_7d: TokenAmount(U256::from(20_000u64)),
                history_30d: TokenAmount(U256::from(200_000u64)),
                verified: TokenAmount(U256::from(2_000_000u64)),
            },
        };
        let state = RiskState::new(generous);
        let now = UnixTimestamp(1_000_000);
        let w = wallet(7);
        let err = state
            .reserve_credit(w, TokenAmount(U256::from(2_500u64)), now, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, RiskError::ExceedsDailyLimit { .. }));
    }

    #[tokio::test]
    async fn tier_graduates_at_7_and_30_days() {
        let state = RiskState::new(limits());
        let first_seen = UnixTimestamp(0);
        state.observe_wallet(wallet(4), first_seen).await;
        assert_eq!(state.current_tier(wallet(4), UnixTimestamp(1)).await, Tier::Unknown);
        assert_eq!(
            state.current_tier(wallet(4), UnixTimestamp(HISTORY_7D_SECONDS)).await,
            Tier::History7d
        );
        assert_eq!(
            state.current_tier(wallet(4), UnixTimestamp(HISTORY_30D_SECONDS)).await,
            Tier::History30d
        );
    }

    #[tokio::test]
    async fn manual_override_bypasses_age() {
        let state = RiskState::new(limits());
        let w = wallet(8);
        state.set_tier_override(w, Some(Tier::Verified)).await;
        assert_eq!(state.current_tier(w, UnixTimestamp(1)).await, Tier::Verified);
    }
}
