//! Verification pipeline: the ordered gate chain a payment must clear before it is
//! accepted for settlement.
//!
//! Mirrors the gate-chaining style of `facilitator_local.rs::assert_valid_payment` (requirements
//! match → time window → domain → signature → balance → value), extended with the nonce-reuse
//! and risk-reservation gates this system's data model adds. Gates run in a fixed order and the
//! first failure short-circuits the rest, so a caller always gets the earliest applicable reason.

use std::sync::Arc;
use tracing::instrument;

use crate::chain::{ChainError, ChainRpc};
use crate::risk::{RiskError, RiskState};
use crate::signature::{self, SignatureError};
use crate::types::{EvmAddress, PaymentAuthorization, PaymentRequirements, Tier, UnixTimestamp};

#[derive(thiserror::Error, Debug)]
pub enum VerificationError {
    #[error("token mismatch: authorization names {authorization}, requirements name {requirements}")]
    TokenMismatch {
        authorization: EvmAddress,
        requirements: EvmAddress,
    },
    #[error("chain id mismatch: authorization targets {authorization}, requirements want {requirements}")]
    ChainMismatch { authorization: u64, requirements: u64 },
    #[error("recipient mismatch: authorization pays {authorization}, requirements want {requirements}")]
    RecipientMismatch {
        authorization: EvmAddress,
        requirements: EvmAddress,
    },
    #[error("authorized value {value} is below the required amount {required}")]
    InsufficientValue {
        value: crate::types::TokenAmount,
        required: crate::types::TokenAmount,
    },
    #[error("authorization window rejected: {0}")]
    InvalidTiming(#[source] SignatureError),
    #[error("authorization expires too soon: {0}")]
    ExpiresTooSoon(#[source] SignatureError),
    #[error("signature invalid: {0}")]
    InvalidSignature(#[source] SignatureError),
    #[error("authorization nonce has already been used on-chain")]
    NonceAlreadyUsed,
    #[error("payer balance is insufficient to cover the authorized value")]
    InsufficientBalance,
    #[error("risk limit rejected the payment: {0}")]
    RiskRejected(#[from] RiskError),
    #[error("chain rpc error: {0}")]
    Chain(#[from] ChainError),
}

pub struct VerificationConfig {
    pub eip712_name: String,
    pub eip712_version_override: Option<String>,
}

pub struct VerificationOutcome {
    pub payer: EvmAddress,
    pub tier: Tier,
}

/// Runs every gate except risk reservation. Used by `/verify`, which checks acceptability
/// without mutating wallet exposure (spec.md §4.4's distinction between verify and settle).
#[instrument(skip_all, err, fields(from = %authorization.from, to = %authorization.to))]
pub async fn verify_payment(
    chain: &Arc<dyn ChainRpc>,
    risk: &RiskState,
    config: &VerificationConfig,
    authorization: &PaymentAuthorization,
    requirements: &PaymentRequirements,
    now: UnixTimestamp,
    today_epoch_day: u64,
) -> Result<VerificationOutcome, VerificationError> {
    assert_requirements_match(authorization, requirements)?;

    let version = match &config.eip712_version_override {
        Some(v) => v.clone(),
        None => chain.token_eip712_version(authorization.token).await?,
    };
    let domain = signature::authorization_domain(
        &config.eip712_name,
        &version,
        requirements.chain_id,
        authorization.token.into(),
    );
    signature::recover_authorization_signer(authorization, &domain)
        .map_err(VerificationError::InvalidSignature)?;

    signature::within_window(authorization.valid_after, authorization.valid_before)
        .map_err(VerificationError::InvalidTiming)?;
    signature::ensure_expiry_headroom(authorization.valid_before)
        .map_err(VerificationError::ExpiresTooSoon)?;

    if chain
        .authorization_used(authorization.token, authorization.from, authorization.nonce)
        .await?
    {
        return Err(VerificationError::NonceAlreadyUsed);
    }

    let balance = chain.balance_of(authorization.token, authorization.from).await?;
    if balance < authorization.value {
        return Err(VerificationError::InsufficientBalance);
    }

    risk.check_payment(authorization.from, authorization.value, now, today_epoch_day)
        .await?;
    let tier = risk.current_tier(authorization.from, now).await;

    Ok(VerificationOutcome {
        payer: authorization.from,
        tier,
    })
}

/// Runs the full pipeline and, on success, reserves risk exposure atomically with the
/// final check — the path `/settle` uses, so the wallet's pending total only ever
/// reflects authorizations that were actually accepted for submission.
#[instrument(skip_all, err, fields(from = %authorization.from, to = %authorization.to))]
pub async fn verify_and_reserve(
    chain: &Arc<dyn ChainRpc>,
    risk: &RiskState,
    config: &VerificationConfig,
    authorization: &PaymentAuthorization,
    requirements: &PaymentRequirements,
    now: UnixTimestamp,
    today_epoch_day: u64,
) -> Result<VerificationOutcome, VerificationError> {
    assert_requirements_match(authorization, requirements)?;

    let version = match &config.eip712_version_override {
        Some(v) => v.clone(),
        None => chain.token_eip712_version(authorization.token).await?,
    };
    let domain = signature::authorization_domain(
        &config.eip712_name,
        &version,
        requirements.chain_id,
        authorization.token.into(),
    );
    signature::recover_authorization_signer(authorization, &domain)
        .map_err(VerificationError::InvalidSignature)?;

    signature::within_window(authorization.valid_after, authorization.valid_before)
        .map_err(VerificationError::InvalidTiming)?;
    signature::ensure_expiry_headroom(authorization.valid_before)
        .map_err(VerificationError::ExpiresTooSoon)?;

    if chain
        .authorization_used(authorization.token, authorization.from, authorization.nonce)
        .await?
    {
        return Err(VerificationError::NonceAlreadyUsed);
    }

    let balance = chain.balance_of(authorization.token, authorization.from).await?;
    if balance < authorization.value {
        return Err(VerificationError::InsufficientBalance);
    }

    risk.reserve_credit(authorization.from, authorization.value, now, today_epoch_day)
        .await?;
    let tier = risk.current_tier(authorization.from, now).await;

    Ok(VerificationOutcome {
        payer: authorization.from,
        tier,
    })
}

fn assert_requirements_match(
    authorization: &PaymentAuthorization,
    requirements: &PaymentRequirements,
) -> Result<(), VerificationError> {
    if authorization.token != requirements.token_address {
        return Err(VerificationError::TokenMismatch {
            authorization: authorization.token,
            requirements: requirements.token_address,
        });
    }
    if authorization.to != requirements.pay_to {
        return Err(VerificationError::RecipientMismatch {
            authorization: authorization.to,
            requirements: requirements.pay_to,
        });
    }
    if authorization.value < requirements.max_amount_required {
        return Err(VerificationError::InsufficientValue {
            value: authorization.value,
            required: requirements.max_amount_required,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::stub::StubChainRpc;
    use crate::risk::{LimitTable, TierDailyCaps};
    use crate::signature::authorization_domain;
    use crate::types::{EvmSignature, Nonce, TokenAmount};
    use alloy_primitives::{Address, B256, FixedBytes, U256, address};
    use alloy_signer::SignerSync;
    use alloy_signer_local::PrivateKeySigner;

    fn limits() -> LimitTable {
        LimitTable {
            max_per_transaction: TokenAmount(U256::from(1_000_000u64)),
            max_pending_per_wallet: TokenAmount(U256::from(1_000_000u64)),
            daily_limit_per_wallet: TokenAmount(U256::from(1_000_000u64)),
            tier_daily_caps: TierDailyCaps {
                unknown: TokenAmount(U256::from(1_000_000u64)),
                history_7d: TokenAmount(U256::from(1_000_000u64)),
                history_30d: TokenAmount(U256::from(1_000_000u64)),
                verified: TokenAmount(U256::from(1_000_000u64)),
            },
        }
    }

    fn authorized(signer: &PrivateKeySigner, token: Address, to: Address, value: u64, chain_id: u64) -> PaymentAuthorization {
        let domain = authorization_domain("FilPay", "1", chain_id, token);
        let typed = signature::TransferWithAuthorization {
            from: signer.address(),
            to,
            value: U256::from(value),
            validAfter: U256::from(0u64),
            validBefore: U256::from(u64::MAX),
            nonce: FixedBytes(B256::repeat_byte(9).0),
        };
        use alloy_sol_types::SolStruct;
        let digest = typed.eip712_signing_hash(&domain);
        let signature = signer.sign_hash_sync(&digest).expect("sign");
        PaymentAuthorization {
            token: EvmAddress(token),
            from: EvmAddress(signer.address()),
            to: EvmAddress(to),
            value: TokenAmount(U256::from(value)),
            valid_after: UnixTimestamp(0),
            valid_before: UnixTimestamp(u64::MAX),
            nonce: Nonce(B256::repeat_byte(9)),
            signature: EvmSignature(signature.as_bytes()),
        }
    }

    #[tokio::test]
    async fn happy_path_verifies() {
        let signer = PrivateKeySigner::random();
        let token = address!("0x3000000000000000000000000000000000000003");
        let to = address!("0x4000000000000000000000000000000000000004");
        let authorization = authorized(&signer, token, to, 1000, 314159);
        let requirements = PaymentRequirements {
            pay_to: EvmAddress(to),
            max_amount_required: TokenAmount(U256::from(1000u64)),
            token_address: EvmAddress(token),
            chain_id: 314159,
            resource: "resource://x".to_string(),
            description: "x".to_string(),
        };
        let stub = Arc::new(StubChainRpc::default());
        stub.set_balance(EvmAddress(token), EvmAddress(signer.address()), TokenAmount(U256::from(5000u64)));
        let chain: Arc<dyn ChainRpc> = stub;
        let risk = RiskState::new(limits());
        let config = VerificationConfig {
            eip712_name: "FilPay".to_string(),
            eip712_version_override: Some("1".to_string()),
        };
        let outcome = verify_payment(&chain, &risk, &config, &authorization, &requirements, UnixTimestamp(10), 0)
            .await
            .expect("verification should succeed");
        assert_eq!(outcome.payer, EvmAddress(signer.address()));
    }

    #[tokio::test]
    async fn rejects_used_nonce() {
        let signer = PrivateKeySigner::random();
        let token = address!("0x3000000000000000000000000000000000000003");
        let to = address!("0x4000000000000000000000000000000000000004");
        let authorization = authorized(&signer, token, to, 1000, 314159);
        let requirements = PaymentRequirements {
            pay_to: EvmAddress(to),
            max_amount_required: TokenAmount(U256::from(1000u64)),
            token_address: EvmAddress(token),
            chain_id: 314159,
            resource: "resource://x".to_string(),
            description: "x".to_string(),
        };
        let stub = Arc::new(StubChainRpc::default());
        stub.set_balance(EvmAddress(token), EvmAddress(signer.address()), TokenAmount(U256::from(5000u64)));
        stub.mark_used(EvmAddress(token), EvmAddress(signer.address()), authorization.nonce);
        let chain: Arc<dyn ChainRpc> = stub;
        let risk = RiskState::new(limits());
        let config = VerificationConfig {
            eip712_name: "FilPay".to_string(),
            eip712_version_override: Some("1".to_string()),
        };
        let result = verify_payment(&chain, &risk, &config, &authorization, &requirements, UnixTimestamp(10), 0).await;
        assert!(matches!(result, Err(VerificationError::NonceAlreadyUsed)));
    }

    #[tokio::test]
    async fn rejects_insufficient_balance() {
        let signer = PrivateKeySigner::random();
        let token = address!("0x3000000000000000000000000000000000000003");
        let to = address!("0x4000000000000000000000000000000000000004");
        let authorization = authorized(&signer, token, to, 1000, 314159);
        let requirements = PaymentRequirements {
            pay_to: EvmAddress(to),
            max_amount_required: TokenAmount(U256::from(1000u64)),
            token_address: EvmAddress(token),
            chain_id: 314159,
            resource: "resource://x".to_string(),
            description: "x".to_string(),
        };
        let stub = Arc::new(StubChainRpc::default());
        stub.set_balance(EvmAddress(token), EvmAddress(signer.address()), TokenAmount(U256::from(1u64)));
        let chain: Arc<dyn ChainRpc> = stub;
        let risk = RiskState::new(limits());
        let config = VerificationConfig {
            eip712_name: "FilPay".to_string(),
            eip712_version_override: Some("1".to_string()),
        };
        let result = verify_payment(&chain, &risk, &config, &authorization, &requirements, UnixTimestamp(10), 0).await;
        assert!(matches!(result, Err(VerificationError::InsufficientBalance)));
    }
}
