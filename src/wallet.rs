//! Facilitator signing key material, loaded from the environment.
//!
//! A single facilitator wallet submits every settlement transaction (spec.md §4.2). Multiple
//! comma-separated keys are accepted so the facilitator can rotate or round-robin submitters
//! without a restart-time config change, mirroring the teacher's `ProviderCache`/`SignerType`
//! multi-key support in `provider_cache.rs`.

use alloy_network::EthereumWallet;
use alloy_signer_local::PrivateKeySigner;
use std::env;
use std::str::FromStr;

const ENV_FACILITATOR_PRIVATE_KEY: &str = "FACILITATOR_PRIVATE_KEY";

#[derive(thiserror::Error, Debug)]
pub enum WalletError {
    #[error("env {ENV_FACILITATOR_PRIVATE_KEY} not set")]
    MissingKey,
    #[error("env {ENV_FACILITATOR_PRIVATE_KEY} did not contain any private keys")]
    EmptyKeyList,
    #[error("invalid private key: {0}")]
    InvalidKey(String),
}

/// Builds the facilitator's signing wallet from `FACILITATOR_PRIVATE_KEY`.
///
/// The first key becomes the wallet's default signer (the address that pays gas and
/// appears as `msg.sender` on settlement transactions); any additional keys are
/// registered as alternate signers.
pub fn wallet_from_env() -> Result<EthereumWallet, WalletError> {
    let raw_keys = env::var(ENV_FACILITATOR_PRIVATE_KEY).map_err(|_| WalletError::MissingKey)?;
    let keys: Vec<&str> = raw_keys
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .collect();
    let mut iter = keys.into_iter();
    let first_key = iter.next().ok_or(WalletError::EmptyKeyList)?;
    let first_signer =
        PrivateKeySigner::from_str(first_key).map_err(|e| WalletError::InvalidKey(e.to_string()))?;
    let mut wallet = EthereumWallet::from(first_signer);
    for key in iter {
        let signer =
            PrivateKeySigner::from_str(key).map_err(|e| WalletError::InvalidKey(e.to_string()))?;
        wallet.register_signer(signer);
    }
    Ok(wallet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_network::NetworkWallet;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn restore_env(key: &str, original: Option<String>) {
        if let Some(value) = original {
            // Safety: guarded by `ENV_LOCK`, so no concurrent environment mutation occurs.
            unsafe { env::set_var(key, value) };
        } else {
            // Safety: guarded by `ENV_LOCK`, so no concurrent environment mutation occurs.
            unsafe { env::remove_var(key) };
        }
    }

    #[test]
    fn supports_multiple_private_keys() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");
        let original = env::var(ENV_FACILITATOR_PRIVATE_KEY).ok();

        const KEY_1: &str = "0xcafe000000000000000000000000000000000000000000000000000000000001";
        const KEY_2: &str = "0xcafe000000000000000000000000000000000000000000000000000000000002";
        // Safety: guarded by `ENV_LOCK`, so no concurrent environment mutation occurs.
        unsafe { env::set_var(ENV_FACILITATOR_PRIVATE_KEY, format!("{KEY_1},{KEY_2}")) };

        let wallet = wallet_from_env().expect("wallet built from env");
        let expected_primary = PrivateKeySigner::from_str(KEY_1).expect("key1 parses").address();
        let expected_secondary = PrivateKeySigner::from_str(KEY_2).expect("key2 parses").address();

        assert_eq!(
            NetworkWallet::<alloy_network::Ethereum>::default_signer_address(&wallet),
            expected_primary
        );
        let signers: Vec<_> =
            NetworkWallet::<alloy_network::Ethereum>::signer_addresses(&wallet).collect();
        assert_eq!(signers.len(), 2);
        assert!(signers.contains(&expected_secondary));

        restore_env(ENV_FACILITATOR_PRIVATE_KEY, original);
    }

    #[test]
    fn rejects_missing_env() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");
        let original = env::var(ENV_FACILITATOR_PRIVATE_KEY).ok();
        // Safety: guarded by `ENV_LOCK`.
        unsafe { env::remove_var(ENV_FACILITATOR_PRIVATE_KEY) };
        assert!(matches!(wallet_from_env(), Err(WalletError::MissingKey)));
        restore_env(ENV_FACILITATOR_PRIVATE_KEY, original);
    }
}
