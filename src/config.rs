//! Environment-driven configuration for the facilitator server.
//!
//! Loaded once at startup via `dotenvy` (`.env` support) plus `std::env`, following
//! `provider_cache.rs`'s `ENV_*` constant pattern generalized to a single chain: no JSON
//! config file, no `clap`. One `Config` assembles typed sub-configs from environment
//! variables, falling back to sensible defaults where spec.md §6 allows it.

use std::env;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::types::EvmAddress;

const ENV_PORT: &str = "PORT";
const ENV_HOST: &str = "HOST";
const ENV_CHAIN_RPC_URL: &str = "CHAIN_RPC_URL";
const ENV_CHAIN_ID: &str = "CHAIN_ID";
const ENV_TOKEN_ADDRESS: &str = "TOKEN_ADDRESS";
const ENV_TOKEN_NAME: &str = "TOKEN_NAME";
const ENV_TOKEN_VERSION: &str = "TOKEN_EIP712_VERSION";
const ENV_TOKEN_DECIMALS: &str = "TOKEN_DECIMALS";
const ENV_FACILITATOR_PRIVATE_KEY: &str = "FACILITATOR_PRIVATE_KEY";

const ENV_RISK_MAX_PER_TX: &str = "RISK_MAX_PER_TRANSACTION";
const ENV_RISK_MAX_PENDING: &str = "RISK_MAX_PENDING_PER_WALLET";
const ENV_RISK_DAILY_LIMIT: &str = "RISK_DAILY_LIMIT_PER_WALLET";

const ENV_SETTLEMENT_MAX_ATTEMPTS: &str = "SETTLEMENT_MAX_ATTEMPTS";
const ENV_SETTLEMENT_RETRY_DELAY_MS: &str = "SETTLEMENT_RETRY_DELAY_MS";
const ENV_SETTLEMENT_TIMEOUT_MS: &str = "SETTLEMENT_TIMEOUT_MS";

const ENV_FCR_ENABLED: &str = "FCR_ENABLED";
const ENV_FCR_POLL_INTERVAL_MS: &str = "FCR_POLL_INTERVAL_MS";
const ENV_FCR_MIN_TIME_IN_PREPARE_MS: &str = "FCR_MIN_TIME_IN_PREPARE_MS";

const ENV_BOND_CONTRACT_ADDRESS: &str = "BOND_CONTRACT_ADDRESS";
const ENV_BOND_ALERT_THRESHOLD_PERCENT: &str = "BOND_ALERT_THRESHOLD_PERCENT";
const ENV_BOND_WINDOW_SECONDS: &str = "BOND_WINDOW_SECONDS";

const ENV_ESCROW_CONTRACT_ADDRESS: &str = "ESCROW_CONTRACT_ADDRESS";

const ENV_PERSISTENCE_URL: &str = "PERSISTENCE_URL";
const ENV_PERSISTENCE_PREFIX: &str = "PERSISTENCE_PREFIX";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("env {0} not set")]
    Missing(&'static str),
    #[error("env {name} has invalid value: {detail}")]
    Invalid { name: &'static str, detail: String },
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn optional_parsed<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid { name, detail: raw }),
        Err(_) => Ok(default),
    }
}

fn required_parsed<T: FromStr>(name: &'static str) -> Result<T, ConfigError> {
    let raw = required(name)?;
    raw.parse().map_err(|_| ConfigError::Invalid { name, detail: raw })
}

fn optional_address(name: &'static str) -> Result<Option<EvmAddress>, ConfigError> {
    match env::var(name) {
        Ok(raw) => alloy_primitives::Address::from_str(&raw)
            .map(|a| Some(EvmAddress(a)))
            .map_err(|e| ConfigError::Invalid { name, detail: e.to_string() }),
        Err(_) => Ok(None),
    }
}

fn required_address(name: &'static str) -> Result<EvmAddress, ConfigError> {
    let raw = required(name)?;
    alloy_primitives::Address::from_str(&raw)
        .map(EvmAddress)
        .map_err(|e| ConfigError::Invalid { name, detail: e.to_string() })
}

#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub rpc_url: Url,
    pub chain_id: u64,
    pub token_address: EvmAddress,
    pub token_name: String,
    pub token_eip712_version: String,
    pub token_decimals: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct RiskConfig {
    pub max_per_transaction: alloy_primitives::U256,
    pub max_pending_per_wallet: alloy_primitives::U256,
    pub daily_limit_per_wallet: alloy_primitives::U256,
}

#[derive(Debug, Clone, Copy)]
pub struct SettlementConfig {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub rpc_timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct FcrConfig {
    pub enabled: bool,
    pub poll_interval: Duration,
    pub min_time_in_prepare: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct BondConfig {
    pub contract_address: EvmAddress,
    pub alert_threshold_percent: u8,
    pub window_seconds: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct EscrowConfig {
    pub enabled: bool,
    pub contract_address: Option<EvmAddress>,
}

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub url: Option<String>,
    pub prefix: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub host: IpAddr,
    pub chain: ChainConfig,
    pub risk: RiskConfig,
    pub settlement: SettlementConfig,
    pub fcr: FcrConfig,
    pub bond: BondConfig,
    pub escrow: EscrowConfig,
    pub persistence: PersistenceConfig,
}

impl Config {
    /// Loads configuration from the process environment, having already called
    /// `dotenvy::dotenv()` (the caller's responsibility, matching the teacher's `main.rs`).
    pub fn from_env() -> Result<Self, ConfigError> {
        let chain = ChainConfig {
            rpc_url: {
                let raw = required(ENV_CHAIN_RPC_URL)?;
                Url::parse(&raw).map_err(|e| ConfigError::Invalid {
                    name: ENV_CHAIN_RPC_URL,
                    detail: e.to_string(),
                })?
            },
            chain_id: required_parsed(ENV_CHAIN_ID)?,
            token_address: {
                let raw = required(ENV_TOKEN_ADDRESS)?;
                EvmAddress(alloy_primitives::Address::from_str(&raw).map_err(|e| {
                    ConfigError::Invalid { name: ENV_TOKEN_ADDRESS, detail: e.to_string() }
                })?)
            },
            token_name: env::var(ENV_TOKEN_NAME).unwrap_or_else(|_| "USD Coin".to_string()),
            token_eip712_version: env::var(ENV_TOKEN_VERSION).unwrap_or_else(|_| "2".to_string()),
            token_decimals: optional_parsed(ENV_TOKEN_DECIMALS, 6u8)?,
        };

        let risk = RiskConfig {
            max_per_transaction: required_parsed(ENV_RISK_MAX_PER_TX)?,
            max_pending_per_wallet: required_parsed(ENV_RISK_MAX_PENDING)?,
            daily_limit_per_wallet: required_parsed(ENV_RISK_DAILY_LIMIT)?,
        };

        let settlement = SettlementConfig {
            max_attempts: optional_parsed(ENV_SETTLEMENT_MAX_ATTEMPTS, 5u32)?,
            retry_delay: Duration::from_millis(optional_parsed(ENV_SETTLEMENT_RETRY_DELAY_MS, 5_000u64)?),
            rpc_timeout: Duration::from_millis(optional_parsed(ENV_SETTLEMENT_TIMEOUT_MS, 30_000u64)?),
        };

        let fcr = FcrConfig {
            enabled: optional_parsed(ENV_FCR_ENABLED, true)?,
            poll_interval: Duration::from_millis(optional_parsed(ENV_FCR_POLL_INTERVAL_MS, 2_000u64)?),
            min_time_in_prepare: Duration::from_millis(optional_parsed(ENV_FCR_MIN_TIME_IN_PREPARE_MS, 5_000u64)?),
        };

        let bond = BondConfig {
            contract_address: required_address(ENV_BOND_CONTRACT_ADDRESS)?,
            alert_threshold_percent: optional_parsed(ENV_BOND_ALERT_THRESHOLD_PERCENT, 80u8)?,
            window_seconds: optional_parsed(ENV_BOND_WINDOW_SECONDS, 600u64)?,
        };

        let escrow_contract_address = optional_address(ENV_ESCROW_CONTRACT_ADDRESS)?;
        let escrow = EscrowConfig {
            enabled: escrow_contract_address.is_some(),
            contract_address: escrow_contract_address,
        };

        let persistence = PersistenceConfig {
            url: env::var(ENV_PERSISTENCE_URL).ok(),
            prefix: env::var(ENV_PERSISTENCE_PREFIX).unwrap_or_else(|_| "fcr-facilitator".to_string()),
        };

        Ok(Config {
            port: optional_parsed(ENV_PORT, 8080u16)?,
            host: optional_parsed(ENV_HOST, IpAddr::from([0, 0, 0, 0]))?,
            chain,
            risk,
            settlement,
            fcr,
            bond,
            escrow,
            persistence,
        })
    }
}

/// Reads `FACILITATOR_PRIVATE_KEY` directly; kept separate from [`Config::from_env`] so
/// `wallet::wallet_from_env` remains the single source of truth for wallet construction.
pub fn facilitator_private_keys() -> Result<String, ConfigError> {
    required(ENV_FACILITATOR_PRIVATE_KEY)
}
