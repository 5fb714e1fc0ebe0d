//! Escrow Contract Adapter: the on-chain counterpart to the deferred-payment voucher
//! store — buyers deposit balance into it, optionally thaw some with a cooldown, and
//! sellers collect against it with a signed voucher (spec.md §4.8).
//!
//! Modeled on [`crate::bond`]'s adapter shape: a `sol!` ABI, one trait with a production
//! `Alloy*` implementation and a `#[cfg(test)]` stub, `send().get_receipt()` for the
//! mutating call and `call()` for the reads.

use alloy_contract::Error as ContractError;
use alloy_network::{Ethereum, EthereumWallet};
use alloy_primitives::U256;
use alloy_provider::{DynProvider, Provider, ProviderBuilder};
use alloy_sol_types::sol;
use async_trait::async_trait;
use std::future::IntoFuture;
use tracing::{Instrument, instrument};

use crate::types::{EvmAddress, EvmSignature, TokenAmount, UnixTimestamp};
use crate::voucher::Voucher;

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    interface IDeferredPaymentEscrow {
        struct Voucher {
            address buyer;
            address seller;
            uint256 valueAggregate;
            uint256 timestamp;
            uint256 nonce;
        }

        function collect(Voucher calldata voucher, bytes calldata signature) external;
        function getAccount(address buyer) external view returns (uint256 balance, uint256 thawingAmount, uint256 thawEndTime);
        function getSettledNonce(bytes32 id) external view returns (uint256);
        function getCollectedValue(bytes32 id) external view returns (uint256);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuyerAccount {
    pub balance: TokenAmount,
    pub thawing_amount: TokenAmount,
    pub thaw_end_time: UnixTimestamp,
}

#[derive(thiserror::Error, Debug)]
pub enum EscrowError {
    #[error("rpc call failed: {0}")]
    Rpc(#[from] ContractError),
    #[error("no escrow contract is configured")]
    NotConfigured,
}

/// On-chain operations against a deployed deferred-payment escrow contract.
#[async_trait]
pub trait EscrowContract: Send + Sync {
    /// Calls `collect(voucher, signature)`, paying the seller the delta since the last
    /// collected value and returning the settling transaction's hash.
    async fn collect(&self, voucher: &Voucher) -> Result<crate::types::TransactionHash, EscrowError>;

    async fn get_account(&self, buyer: EvmAddress) -> Result<BuyerAccount, EscrowError>;

    async fn get_settled_nonce(&self, id: crate::types::PaymentId) -> Result<Option<u64>, EscrowError>;

    async fn get_collected_value(&self, id: crate::types::PaymentId) -> Result<TokenAmount, EscrowError>;
}

type InnerProvider = DynProvider<Ethereum>;

/// Alloy-backed [`EscrowContract`] against a deployed `DeferredPaymentEscrow` contract.
#[derive(Clone)]
pub struct AlloyEscrowContract {
    provider: InnerProvider,
    contract: EvmAddress,
}

impl AlloyEscrowContract {
    pub fn connect(rpc_url: &url::Url, wallet: EthereumWallet, contract: EvmAddress) -> Self {
        let provider = ProviderBuilder::new().wallet(wallet).connect_http(rpc_url.clone()).erased();
        AlloyEscrowContract { provider, contract }
    }

    fn instance(&self) -> IDeferredPaymentEscrow::IDeferredPaymentEscrowInstance<&InnerProvider> {
        IDeferredPaymentEscrow::new(self.contract.into(), &self.provider)
    }
}

fn sig_bytes(signature: &EvmSignature) -> Vec<u8> {
    signature.0.to_vec()
}

#[async_trait]
impl EscrowContract for AlloyEscrowContract {
    #[instrument(skip_all, err, fields(buyer = %voucher.buyer, seller = %voucher.seller))]
    async fn collect(&self, voucher: &Voucher) -> Result<crate::types::TransactionHash, EscrowError> {
        let on_chain_voucher = IDeferredPaymentEscrow::Voucher {
            buyer: voucher.buyer.into(),
            seller: voucher.seller.into(),
            valueAggregate: voucher.value_aggregate.0,
            timestamp: U256::from(voucher.timestamp.0),
            nonce: U256::from(voucher.nonce),
        };
        let receipt = self
            .instance()
            .collect(on_chain_voucher, sig_bytes(&voucher.signature).into())
            .send()
            .instrument(tracing::info_span!("collect", otel.kind = "client"))
            .await?
            .get_receipt()
            .into_future()
            .await?;
        Ok(crate::types::TransactionHash(receipt.transaction_hash))
    }

    async fn get_account(&self, buyer: EvmAddress) -> Result<BuyerAccount, EscrowError> {
        let result = self.instance().getAccount(buyer.into()).call().into_future().await?;
        Ok(BuyerAccount {
            balance: TokenAmount(result.balance),
            thawing_amount: TokenAmount(result.thawingAmount),
            thaw_end_time: UnixTimestamp(result.thawEndTime.to::<u64>()),
        })
    }

    async fn get_settled_nonce(&self, id: crate::types::PaymentId) -> Result<Option<u64>, EscrowError> {
        let nonce = self.instance().getSettledNonce(id.0).call().into_future().await?;
        if nonce.is_zero() {
            return Ok(None);
        }
        Ok(Some(nonce.to::<u64>()))
    }

    async fn get_collected_value(&self, id: crate::types::PaymentId) -> Result<TokenAmount, EscrowError> {
        let value = self.instance().getCollectedValue(id.0).call().into_future().await?;
        Ok(TokenAmount(value))
    }
}


#[cfg(test)]
mod tests {
    use super::stub::StubEscrowContract;
    use super::*;
    use crate::types::EvmSignature;
    use alloy_primitives::{Address, U256};

    fn sample_voucher() -> Voucher {
        Voucher {
            buyer: EvmAddress(Address::repeat_byte(1)),
            seller: EvmAddress(Address::repeat_byte(2)),
            escrow: EvmAddress(Address::repeat_byte(3)),
            value_aggregate: TokenAmount(U256::from(500u64)),
            nonce: 3,
            timestamp: UnixTimestamp::now(),
            signature: EvmSignature([7u8; 65]),
        }
    }

    #[tokio::test]
    async fn collect_records_settlement() {
        let escrow = StubEscrowContract::default();
        let voucher = sample_voucher();
        let tx = escrow.collect(&voucher).await.unwrap();
        assert_ne!(tx.0, alloy_primitives::B256::ZERO);
        assert_eq!(escrow.get_settled_nonce(voucher.id()).await.unwrap(), Some(3));
        assert_eq!(
            escrow.get_collected_value(voucher.id()).await.unwrap(),
            TokenAmount(U256::from(500u64))
        );
    }

    #[tokio::test]
    async fn get_account_defaults_to_zero_for_unknown_buyer() {
        let escrow = StubEscrowContract::default();
        let account = escrow.get_account(EvmAddress(Address::repeat_byte(9))).await.unwrap();
        assert_eq!(account.balance, TokenAmount::ZERO);
    }
}
