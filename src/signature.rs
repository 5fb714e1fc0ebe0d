//! EIP-712 digest construction and signature recovery.
//!
//! Two distinct typed-data structs are signed by counter-parties in this system: a
//! `TransferWithAuthorization` (the payer's on-chain payment intent, EIP-3009 shaped) and a
//! `PaymentVoucher` (the buyer's off-chain aggregated-value commitment). Both recover an
//! address the same way: build the struct, hash it against a domain, recover the prehash.

use alloy_primitives::{Address, FixedBytes, Signature};
use alloy_sol_types::{Eip712Domain, SolStruct, eip712_domain};
use std::time::{SystemTime, SystemTimeError};

use crate::types::{EvmAddress, EvmSignature, PaymentAuthorization, TokenAmount, UnixTimestamp};

/// Minimum headroom an authorization must still have before `validBefore` for the
/// facilitator to accept it, independent of whether it currently falls in-window.
/// Fixed per spec rather than configurable: a payment accepted with less runway than
/// this could expire mid-submission.
pub const EXPIRY_HEADROOM_SECONDS: u64 = 120;

#[derive(thiserror::Error, Debug)]
pub enum SignatureError {
    #[error("malformed signature: {0}")]
    Malformed(String),
    #[error("signer mismatch: recovered {recovered}, expected {expected}")]
    Mismatch { recovered: Address, expected: Address },
    #[error("cannot read system clock")]
    Clock(#[source] SystemTimeError),
    #[error("authorization not yet active: valid_after {valid_after} > now {now}")]
    NotYetActive { valid_after: u64, now: u64 },
    #[error("authorization expired: valid_before {valid_before} <= now {now}")]
    Expired { valid_before: u64, now: u64 },
    #[error("authorization expires too soon: valid_before {valid_before} is within {headroom}s of now {now}")]
    ExpiresTooSoon { valid_before: u64, now: u64, headroom: u64 },
}

alloy_sol_types::sol! {
    /// EIP-3009 authorization struct, matching the on-chain `transferWithAuthorization` ABI.
    struct TransferWithAuthorization {
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
    }

    /// Off-chain voucher struct signed by a buyer to aggregate deferred micropayments.
    struct PaymentVoucher {
        address buyer;
        address seller;
        uint256 valueAggregate;
        uint256 timestamp;
        uint256 nonce;
    }
}

/// Builds the EIP-712 domain separator for a payment authorization against `token`.
pub fn authorization_domain(name: &str, version: &str, chain_id: u64, token: Address) -> Eip712Domain {
    eip712_domain! {
        name: name.to_string(),
        version: version.to_string(),
        chain_id: chain_id,
        verifying_contract: token,
    }
}

/// Builds the EIP-712 domain separator for a voucher against an escrow contract.
pub fn voucher_domain(name: &str, version: &str, chain_id: u64, escrow: Address) -> Eip712Domain {
    eip712_domain! {
        name: name.to_string(),
        version: version.to_string(),
        chain_id: chain_id,
        verifying_contract: escrow,
    }
}

/// Recovers the signer of a `PaymentAuthorization` and checks it matches `from`.
///
/// Returns the recovered address on success (always equal to `authorization.from` when
/// `Ok`, but returned so callers don't have to re-destructure the authorization).
pub fn recover_authorization_signer(
    authorization: &PaymentAuthorization,
    domain: &Eip712Domain,
) -> Result<Address, SignatureError> {
    let signature = Signature::from_raw_array(&authorization.signature.0)
        .map_err(|e| SignatureError::Malformed(e.to_string()))?;
    let typed = TransferWithAuthorization {
        from: authorization.from.0,
        to: authorization.to.0,
        value: authorization.value.0,
        validAfter: alloy_primitives::U256::from(authorization.valid_after.0),
        validBefore: alloy_primitives::U256::from(authorization.valid_before.0),
        nonce: authorization.nonce.0,
    };
    let digest = typed.eip712_signing_hash(domain);
    let recovered = signature
        .recover_address_from_prehash(&digest)
        .map_err(|e| SignatureError::Malformed(e.to_string()))?;
    let expected: Address = authorization.from.into();
    if recovered != expected {
        return Err(SignatureError::Mismatch {
            recovered,
            expected,
        });
    }
    Ok(recovered)
}

/// Recovers the signer of a voucher signature and checks it matches `buyer`.
pub fn recover_voucher_signer(
    buyer: EvmAddress,
    seller: EvmAddress,
    value_aggregate: TokenAmount,
    timestamp: UnixTimestamp,
    nonce: u64,
    signature: &EvmSignature,
    domain: &Eip712Domain,
) -> Result<Address, SignatureError> {
    let signature = Signature::from_raw_array(&signature.0)
        .map_err(|e| SignatureError::Malformed(e.to_string()))?;
    let typed = PaymentVoucher {
        buyer: buyer.0,
        seller: seller.0,
        valueAggregate: value_aggregate.0,
        timestamp: alloy_primitives::U256::from(timestamp.0),
        nonce: alloy_primitives::U256::from(nonce),
    };
    let digest = typed.eip712_signing_hash(domain);
    let recovered = signature
        .recover_address_from_prehash(&digest)
        .map_err(|e| SignatureError::Malformed(e.to_string()))?;
    let expected: Address = buyer.into();
    if recovered != expected {
        return Err(SignatureError::Mismatch {
            recovered,
            expected,
        });
    }
    Ok(recovered)
}

/// Checks that `now` falls within `[valid_after, valid_before)`. Distinct from
/// [`ensure_expiry_headroom`]: this is the window-membership check, not the
/// runway-remaining check — a payment can be in-window and still fail the latter.
pub fn within_window(valid_after: UnixTimestamp, valid_before: UnixTimestamp) -> Result<(), SignatureError> {
    let now = current_timestamp()?;
    if valid_after.0 > now.0 {
        return Err(SignatureError::NotYetActive {
            valid_after: valid_after.0,
            now: now.0,
        });
    }
    if valid_before.0 <= now.0 {
        return Err(SignatureError::Expired {
            valid_before: valid_before.0,
            now: now.0,
        });
    }
    Ok(())
}

/// Checks that `validBefore` is still at least [`EXPIRY_HEADROOM_SECONDS`] away from
/// now, so a payment accepted here has enough runway to be submitted and confirmed
/// before it expires on-chain.
pub fn ensure_expiry_headroom(valid_before: UnixTimestamp) -> Result<(), SignatureError> {
    let now = current_timestamp()?;
    if expires_within(valid_before, EXPIRY_HEADROOM_SECONDS) {
        return Err(SignatureError::ExpiresTooSoon {
            valid_before: valid_before.0,
            now: now.0,
            headroom: EXPIRY_HEADROOM_SECONDS,
        });
    }
    Ok(())
}

/// Returns `true` if the authorization expires within `seconds` from now, used by the
/// risk engine to decide whether a pending payment still occupies exposure headroom.
pub fn expires_within(valid_before: UnixTimestamp, seconds: u64) -> bool {
    let now = UnixTimestamp::now();
    valid_before.saturating_sub(now) <= seconds
}

fn current_timestamp() -> Result<UnixTimestamp, SignatureError> {
    let secs = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_err(SignatureError::Clock)?
        .as_secs();
    Ok(UnixTimestamp(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EvmSignature, Nonce};
    use alloy_primitives::{B256, U256, address};
    use alloy_signer::SignerSync;
    use alloy_signer_local::PrivateKeySigner;

    fn sample_authorization(signer: &PrivateKeySigner, domain: &Eip712Domain) -> PaymentAuthorization {
        let from = signer.address();
        let to = address!("0x1000000000000000000000000000000000000001");
        let typed = TransferWithAuthorization {
            from,
            to,
            value: U256::from(1000u64),
            validAfter: U256::from(0u64),
            validBefore: U256::from(u64::MAX),
            nonce: FixedBytes(B256::repeat_byte(7).0),
        };
        let digest = typed.eip712_signing_hash(domain);
        let signature = signer.sign_hash_sync(&digest).expect("sign");
        PaymentAuthorization {
            token: EvmAddress(domain.verifying_contract.unwrap()),
            from: EvmAddress(from),
            to: EvmAddress(to),
            value: TokenAmount(U256::from(1000u64)),
            valid_after: UnixTimestamp(0),
            valid_before: UnixTimestamp(u64::MAX),
            nonce: Nonce(B256::repeat_byte(7)),
            signature: EvmSignature(signature.as_bytes()),
        }
    }

    #[test]
    fn recovers_matching_signer() {
        let signer = PrivateKeySigner::random();
        let token = address!("0x2000000000000000000000000000000000000002");
        let domain = authorization_domain("FilPay", "1", 314159, token);
        let authorization = sample_authorization(&signer, &domain);
        let recovered = recover_authorization_signer(&authorization, &domain).expect("recover");
        assert_eq!(recovered, signer.address());
    }

    #[test]
    fn rejects_wrong_domain() {
        let signer = PrivateKeySigner::random();
        let token = address!("0x2000000000000000000000000000000000000002");
        let domain = authorization_domain("FilPay", "1", 314159, token);
        let mut authorization = sample_authorization(&signer, &domain);
        let other_domain = authorization_domain("FilPay", "1", 314160, token);
        authorization.value = TokenAmount(U256::from(1000u64));
        let result = recover_authorization_signer(&authorization, &other_domain);
        assert!(result.is_err());
    }

    #[test]
    fn window_rejects_not_yet_active() {
        let future = UnixTimestamp::now().0 + 3600;
        let result = within_window(UnixTimestamp(future), UnixTimestamp(future + 3600));
        assert!(matches!(result, Err(SignatureError::NotYetActive { .. })));
    }

    #[test]
    fn window_rejects_expired() {
        let now = UnixTimestamp::now().0;
        let result = within_window(UnixTimestamp(0), UnixTimestamp(now));
        assert!(matches!(result, Err(SignatureError::Expired { .. })));
    }

    #[test]
    fn window_accepts_current() {
        let now = UnixTimestamp::now().0;
        let result = within_window(UnixTimestamp(0), UnixTimestamp(now + 3600));
        assert!(result.is_ok());
    }

    #[test]
    fn expiry_headroom_rejects_when_runway_below_threshold() {
        let now = UnixTimestamp::now().0;
        let result = ensure_expiry_headroom(UnixTimestamp(now + 3));
        assert!(matches!(result, Err(SignatureError::ExpiresTooSoon { .. })));
    }

    #[test]
    fn expiry_headroom_accepts_ample_runway() {
        let now = UnixTimestamp::now().0;
        let result = ensure_expiry_headroom(UnixTimestamp(now + 3600));
        assert!(result.is_ok());
    }
}
