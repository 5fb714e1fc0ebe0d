//! Chain RPC Adapter: the facilitator's only door onto the EVM chain.
//!
//! Wraps an Alloy [`Provider`] with the handful of calls the rest of the system needs —
//! balance checks, authorization-state checks, submitting `transferWithAuthorization`, and
//! polling receipts/height/gas — behind a [`ChainRpc`] trait so the verification pipeline,
//! settlement engine, and tests can all run against a stub instead of a live RPC endpoint.
//! Contract interfaces are declared inline via `sol!`, the same approach the teacher uses in
//! `facilitator_local.rs` (there pointed at an external ABI JSON we don't have here).

use alloy_contract::Error as ContractError;
use alloy_network::{Ethereum, EthereumWallet};
use alloy_primitives::{Address, B256, U256};
use alloy_provider::{DynProvider, Provider, ProviderBuilder};
use alloy_sol_types::sol;
use async_trait::async_trait;
use std::future::IntoFuture;
use tracing::{Instrument, instrument};
use url::Url;

use crate::types::{EvmAddress, Nonce, PaymentAuthorization, TokenAmount, TransactionHash};

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    interface IERC3009Token {
        function balanceOf(address account) external view returns (uint256);
        function version() external view returns (string);
        function authorizationState(address authorizer, bytes32 nonce) external view returns (bool);
        function transferWithAuthorization(
            address from,
            address to,
            uint256 value,
            uint256 validAfter,
            uint256 validBefore,
            bytes32 nonce,
            bytes calldata signature
        ) external;
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ChainError {
    #[error("rpc call failed: {0}")]
    Rpc(#[from] ContractError),
    #[error("transport error: {0}")]
    Transport(#[from] alloy_transport::TransportError),
    #[error("receipt not found for transaction {0}")]
    ReceiptMissing(B256),
}

/// Outcome of waiting for a submitted settlement transaction to land in a block.
#[derive(Debug, Clone, Copy)]
pub struct ReceiptOutcome {
    pub success: bool,
    pub block_number: u64,
    pub transaction_hash: TransactionHash,
}

/// The subset of on-chain reads/writes the facilitator needs, abstracted so the
/// verification pipeline and settlement engine can be exercised against a stub chain.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn balance_of(&self, token: EvmAddress, owner: EvmAddress) -> Result<TokenAmount, ChainError>;

    async fn authorization_used(
        &self,
        token: EvmAddress,
        authorizer: EvmAddress,
        nonce: Nonce,
    ) -> Result<bool, ChainError>;

    async fn token_eip712_version(&self, token: EvmAddress) -> Result<String, ChainError>;

    async fn submit_transfer(
        &self,
        token: EvmAddress,
        authorization: &PaymentAuthorization,
    ) -> Result<TransactionHash, ChainError>;

    async fn wait_for_receipt(&self, tx: TransactionHash) -> Result<ReceiptOutcome, ChainError>;

    async fn current_height(&self) -> Result<u64, ChainError>;

    async fn current_gas_price(&self) -> Result<u128, ChainError>;
}

type InnerProvider = DynProvider<Ethereum>;

/// Alloy-backed [`ChainRpc`] for a single configured EVM endpoint.
#[derive(Clone)]
pub struct AlloyChainRpc {
    provider: InnerProvider,
    eip1559: bool,
}

impl AlloyChainRpc {
    pub fn connect(rpc_url: &Url, wallet: EthereumWallet, eip1559: bool) -> Self {
        let provider = ProviderBuilder::new().wallet(wallet).connect_http(rpc_url.clone()).erased();
        AlloyChainRpc { provider, eip1559 }
    }

    fn token(&self, token: EvmAddress) -> IERC3009Token::IERC3009TokenInstance<&InnerProvider> {
        IERC3009Token::new(token.into(), &self.provider)
    }
}

#[async_trait]
impl ChainRpc for AlloyChainRpc {
    #[instrument(skip_all, err, fields(token = %token, owner = %owner))]
    async fn balance_of(&self, token: EvmAddress, owner: EvmAddress) -> Result<TokenAmount, ChainError> {
        let balance: U256 = self
            .token(token)
            .balanceOf(owner.into())
            .call()
            .into_future()
            .instrument(tracing::info_span!("balanceOf", otel.kind = "client"))
            .await?;
        Ok(TokenAmount(balance))
    }

    #[instrument(skip_all, err, fields(token = %token, authorizer = %authorizer))]
    async fn authorization_used(
        &self,
        token: EvmAddress,
        authorizer: EvmAddress,
        nonce: Nonce,
    ) -> Result<bool, ChainError> {
        let used = self
            .token(token)
            .authorizationState(authorizer.into(), nonce.0)
            .call()
            .into_future()
            .instrument(tracing::info_span!("authorizationState", otel.kind = "client"))
            .await?;
        Ok(used)
    }

    #[instrument(skip_all, err, fields(token = %token))]
    async fn token_eip712_version(&self, token: EvmAddress) -> Result<String, ChainError> {
        let version = self
            .token(token)
            .version()
            .call()
            .into_future()
            .instrument(tracing::info_span!("version", otel.kind = "client"))
            .await?;
        Ok(version)
    }

    #[instrument(skip_all, err, fields(token = %token, from = %authorization.from, nonce = %authorization.nonce))]
    async fn submit_transfer(
        &self,
        token: EvmAddress,
        authorization: &PaymentAuthorization,
    ) -> Result<TransactionHash, ChainError> {
        let signature = alloy_primitives::Bytes::from(authorization.signature.0.to_vec());
        let call = self.token(token).transferWithAuthorization(
            authorization.from.into(),
            authorization.to.into(),
            authorization.value.0,
            U256::from(authorization.valid_after.0),
            U256::from(authorization.valid_before.0),
            authorization.nonce.0,
            signature,
        );
        let call = if self.eip1559 {
            call
        } else {
            let gas = self.provider.get_gas_price().await?;
            call.gas_price(gas)
        };
        let pending = call
            .send()
            .instrument(tracing::info_span!("transferWithAuthorization", otel.kind = "client"))
            .await?;
        Ok(TransactionHash(*pending.tx_hash()))
    }

    #[instrument(skip_all, err, fields(tx = %tx))]
    async fn wait_for_receipt(&self, tx: TransactionHash) -> Result<ReceiptOutcome, ChainError> {
        let pending = self
            .provider
            .watch_pending_transaction(alloy_provider::PendingTransactionConfig::new(tx.0))
            .await?;
        let tx_hash = pending.await?;
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await?
            .ok_or(ChainError::ReceiptMissing(tx_hash))?;
        Ok(ReceiptOutcome {
            success: receipt.status(),
            block_number: receipt.block_number.unwrap_or_default(),
            transaction_hash: TransactionHash(receipt.transaction_hash),
        })
    }

    async fn current_height(&self) -> Result<u64, ChainError> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn current_gas_price(&self) -> Result<u128, ChainError> {
        Ok(self.provider.get_gas_price().await?)
    }
}

/// In-memory stub used by unit tests for the verification pipeline, settlement engine,
/// and risk gate — no network access, deterministic outcomes.
#[cfg(test)]
pub mod stub {
    use super::*;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct StubChainRpc {
        pub balances: DashMap<(EvmAddress, EvmAddress), TokenAmount>,
        pub used_nonces: DashMap<(EvmAddress, Nonce), bool>,
        pub submissions: Mutex<Vec<PaymentAuthorization>>,
        pub height: AtomicU64,
        pub gas_price: AtomicU64,
        pub next_receipt_success: std::sync::atomic::AtomicBool,
    }

    impl StubChainRpc {
        pub fn set_balance(&self, token: EvmAddress, owner: EvmAddress, amount: TokenAmount) {
            self.balances.insert((token, owner), amount);
        }

        pub fn mark_used(&self, token: EvmAddress, authorizer: EvmAddress, nonce: Nonce) {
            let _ = token;
            self.used_nonces.insert((authorizer, nonce), true);
        }
    }

    #[async_trait]
    impl ChainRpc for StubChainRpc {
        async fn balance_of(&self, token: EvmAddress, owner: EvmAddress) -> Result<TokenAmount, ChainError> {
            Ok(self
                .balances
                .get(&(token, owner))
                .map(|v| *v)
                .unwrap_or(TokenAmount::ZERO))
        }

        async fn authorization_used(
            &self,
            _token: EvmAddress,
            authorizer: EvmAddress,
            nonce: Nonce,
        ) -> Result<bool, ChainError> {
            Ok(self
                .used_nonces
                .get(&(authorizer, nonce))
                .map(|v| *v)
                .unwrap_or(false))
        }

        async fn token_eip712_version(&self, _token: EvmAddress) -> Result<String, ChainError> {
            Ok("1".to_string())
        }

        async fn submit_transfer(
            &self,
            _token: EvmAddress,
            authorization: &PaymentAuthorization,
        ) -> Result<TransactionHash, ChainError> {
            self.submissions.lock().unwrap().push(authorization.clone());
            let mut bytes = [0u8; 32];
            bytes[..20].copy_from_slice(authorization.from.0.as_slice());
            Ok(TransactionHash(B256::from(bytes)))
        }

        async fn wait_for_receipt(&self, tx: TransactionHash) -> Result<ReceiptOutcome, ChainError> {
            Ok(ReceiptOutcome {
                success: self.next_receipt_success.load(Ordering::SeqCst),
                block_number: self.height.load(Ordering::SeqCst),
                transaction_hash: tx,
            })
        }

        async fn current_height(&self) -> Result<u64, ChainError> {
            Ok(self.height.load(Ordering::SeqCst))
        }

        async fn current_gas_price(&self) -> Result<u128, ChainError> {
            Ok(self.gas_price.load(Ordering::SeqCst) as u128)
        }
    }
}
