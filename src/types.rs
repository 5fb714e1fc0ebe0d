//! Core domain types for the facilitator.
//!
//! Mirrors the shape of the EIP-3009 `transferWithAuthorization` payload used by x402-style
//! facilitators, generalized for a Filecoin-like EVM chain: unsigned 256-bit amounts
//! (serialized as decimal strings, never floats), 0x-prefixed hex addresses/nonces/signatures,
//! and a payment identity derived from the authorization's signature.

use alloy_primitives::{Address, B256, U256, keccak256};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;

/// Wrapper around `alloy::primitives::Address`, serialized as a 0x-hex string.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct EvmAddress(pub Address);

impl EvmAddress {
    /// Lower-case form, used as the canonical risk-ledger and persistence key.
    pub fn normalized(&self) -> String {
        format!("{:#x}", self.0)
    }
}

impl Display for EvmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Address> for EvmAddress {
    fn from(address: Address) -> Self {
        EvmAddress(address)
    }
}

impl From<EvmAddress> for Address {
    fn from(address: EvmAddress) -> Self {
        address.0
    }
}

impl Serialize for EvmAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:#x}", self.0))
    }
}

impl<'de> Deserialize<'de> for EvmAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let address = Address::from_str(&s).map_err(|e| DeError::custom(format!("{e}")))?;
        Ok(EvmAddress(address))
    }
}

/// A 256-bit unsigned token amount. Always carried as `U256`, never as `f64`, and
/// serialized as a decimal string so precision survives JSON round-trips.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct TokenAmount(pub U256);

impl TokenAmount {
    pub const ZERO: TokenAmount = TokenAmount(U256::ZERO);

    pub fn saturating_sub(self, rhs: TokenAmount) -> TokenAmount {
        TokenAmount(self.0.saturating_sub(rhs.0))
    }

    pub fn checked_add(self, rhs: TokenAmount) -> Option<TokenAmount> {
        self.0.checked_add(rhs.0).map(TokenAmount)
    }
}

impl From<U256> for TokenAmount {
    fn from(value: U256) -> Self {
        TokenAmount(value)
    }
}

impl From<TokenAmount> for U256 {
    fn from(value: TokenAmount) -> Self {
        value.0
    }
}

impl Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let value = U256::from_str(&s)
            .map_err(|_| DeError::custom("amount must be a non-negative decimal integer string"))?;
        Ok(TokenAmount(value))
    }
}

/// A Unix timestamp in seconds, serialized as a decimal string to avoid precision loss.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct UnixTimestamp(pub u64);

impl UnixTimestamp {
    pub fn now() -> Self {
        let secs = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        UnixTimestamp(secs)
    }

    pub fn saturating_sub(self, rhs: UnixTimestamp) -> u64 {
        self.0.saturating_sub(rhs.0)
    }
}

impl Display for UnixTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for UnixTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for UnixTimestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let ts = s
            .parse::<u64>()
            .map_err(|_| DeError::custom("timestamp must be a non-negative integer"))?;
        Ok(UnixTimestamp(ts))
    }
}

impl From<UnixTimestamp> for U256 {
    fn from(value: UnixTimestamp) -> Self {
        U256::from(value.0)
    }
}

/// A 32-byte opaque authorization nonce, 0x-prefixed hex, exactly 64 hex chars.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Nonce(pub B256);

impl Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Nonce {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}", self.0))
    }
}

impl<'de> Deserialize<'de> for Nonce {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        static NONCE_REGEX: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{64}$").expect("valid regex"));
        if !NONCE_REGEX.is_match(&s) {
            return Err(DeError::custom("nonce must be 0x-prefixed 32 bytes"));
        }
        let value = B256::from_str(&s).map_err(|e| DeError::custom(format!("{e}")))?;
        Ok(Nonce(value))
    }
}

/// A 65-byte ECDSA signature over an EIP-712 digest, 0x-prefixed hex, 130 hex chars.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EvmSignature(pub [u8; 65]);

impl Display for EvmSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl Serialize for EvmSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(self.0)))
    }
}

impl<'de> Deserialize<'de> for EvmSignature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        static SIG_REGEX: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{130}$").expect("valid regex"));
        if !SIG_REGEX.is_match(&s) {
            return Err(DeError::custom(
                "signature must be 0x-prefixed and 130 hex chars",
            ));
        }
        let bytes = hex::decode(&s[2..]).map_err(|e| DeError::custom(format!("{e}")))?;
        let array: [u8; 65] = bytes
            .try_into()
            .map_err(|_| DeError::custom("signature must be exactly 65 bytes"))?;
        Ok(EvmSignature(array))
    }
}

/// A 32-byte on-chain transaction handle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TransactionHash(pub B256);

impl Display for TransactionHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for TransactionHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}", self.0))
    }
}

impl<'de> Deserialize<'de> for TransactionHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let value = B256::from_str(&s).map_err(|e| DeError::custom(format!("{e}")))?;
        Ok(TransactionHash(value))
    }
}

/// Deterministic settlement primary key: `keccak256(signature)`.
///
/// Two authorizations collide only if their signatures are byte-identical, which in
/// practice means a resubmission of the same authorization, not two distinct payments.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PaymentId(pub B256);

impl Display for PaymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for PaymentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}", self.0))
    }
}

impl<'de> Deserialize<'de> for PaymentId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let value = B256::from_str(&s).map_err(|e| DeError::custom(format!("{e}")))?;
        Ok(PaymentId(value))
    }
}

impl PaymentId {
    pub fn from_signature(signature: &EvmSignature) -> PaymentId {
        PaymentId(keccak256(signature.0))
    }

    /// Stable identifier for a deferred-payment channel between `buyer` and `seller`,
    /// with `channel_nonce` distinguishing successive channels opened between the same
    /// pair (0 for the first). Unlike [`PaymentId::from_signature`], this id does not
    /// change when the channel's latest voucher is resubmitted with a fresh signature.
    pub fn from_channel(buyer: EvmAddress, seller: EvmAddress, channel_nonce: u64) -> PaymentId {
        let mut bytes = Vec::with_capacity(20 + 20 + 8);
        bytes.extend_from_slice(buyer.0.as_slice());
        bytes.extend_from_slice(seller.0.as_slice());
        bytes.extend_from_slice(&channel_nonce.to_be_bytes());
        PaymentId(keccak256(bytes))
    }
}

/// An off-chain-signed payer intent to transfer `value` of `token` from `from` to `to`
/// within `[valid_after, valid_before)`, keyed by a payer-scoped `nonce`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentAuthorization {
    pub token: EvmAddress,
    pub from: EvmAddress,
    pub to: EvmAddress,
    pub value: TokenAmount,
    pub valid_after: UnixTimestamp,
    pub valid_before: UnixTimestamp,
    pub nonce: Nonce,
    pub signature: EvmSignature,
}

impl PaymentAuthorization {
    pub fn payment_id(&self) -> PaymentId {
        PaymentId::from_signature(&self.signature)
    }
}

/// What the provider demands be paid for a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub pay_to: EvmAddress,
    pub max_amount_required: TokenAmount,
    pub token_address: EvmAddress,
    pub chain_id: u64,
    pub resource: String,
    pub description: String,
}

/// Request body shared by `/verify` and `/settle`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub payment: PaymentAuthorization,
    pub requirements: PaymentRequirements,
}

/// The four-level Fast Confirmation Rule lattice a settlement climbs through, plus
/// the bond-backstop level exposed only via the static `/fcr/levels` catalogue.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConfirmationLevel {
    L0,
    L1,
    L2,
    L3,
}

impl Display for ConfirmationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConfirmationLevel::L0 => "L0",
            ConfirmationLevel::L1 => "L1",
            ConfirmationLevel::L2 => "L2",
            ConfirmationLevel::L3 => "L3",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle of a settlement attempt, tracked by the settlement engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Pending,
    Submitted,
    Retrying,
    Confirmed,
    Failed,
}

/// A wallet's standing, used to look up the risk-tier daily cap. Derived from wallet age
/// (7/30-day thresholds) unless a manual override is set; `Verified` is reachable only
/// via override.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tier {
    #[serde(rename = "UNKNOWN")]
    Unknown,
    #[serde(rename = "HISTORY_7D")]
    History7d,
    #[serde(rename = "HISTORY_30D")]
    History30d,
    #[serde(rename = "VERIFIED")]
    Verified,
}

/// The consensus subprotocol's decision-round phases, in ascending safety order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    Quality,
    Converge,
    Prepare,
    Commit,
    Decide,
}

impl Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Quality => "QUALITY",
            Phase::Converge => "CONVERGE",
            Phase::Prepare => "PREPARE",
            Phase::Commit => "COMMIT",
            Phase::Decide => "DECIDE",
        };
        write!(f, "{s}")
    }
}
