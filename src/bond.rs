//! Bond Ledger Adapter: provider collateral that backstops settlements which stall
//! past the fast-confirmation window.
//!
//! The teacher has no bond concept, so this is modeled on its general on-chain contract
//! adapter shape (`facilitator_local.rs`'s `USDC::new(address, provider)` instantiation and
//! call-then-await pattern), generalized to a `BondLedger` contract. A commitment is
//! opened when a settlement is accepted, released once it reaches L2/L3, or claimed by
//! the provider if it misses its deadline without confirming (spec.md §4.5).

use alloy_contract::Error as ContractError;
use alloy_network::{Ethereum, EthereumWallet};
use alloy_primitives::{B256, U256};
use alloy_provider::{DynProvider, Provider, ProviderBuilder};
use alloy_sol_types::sol;
use async_trait::async_trait;
use std::future::IntoFuture;
use tracing::{Instrument, instrument};
use url::Url;

use crate::types::{EvmAddress, PaymentId, TokenAmount, UnixTimestamp};

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    interface IBondLedger {
        function commitPayment(bytes32 paymentId, address provider, uint256 amount, uint256 deadline) external;
        function releasePayment(bytes32 paymentId) external;
        function claimPayment(bytes32 paymentId) external;
        function exposureOf(address provider) external view returns (uint256);
        function availableBondOf(address provider) external view returns (uint256);
    }
}

#[derive(thiserror::Error, Debug)]
pub enum BondError {
    #[error("rpc call failed: {0}")]
    Rpc(#[from] ContractError),
    #[error("provider {0} has insufficient available bond for this commitment")]
    InsufficientCapacity(EvmAddress),
}

/// On-chain collateral operations, abstracted for testability (mirrors [`crate::chain::ChainRpc`]).
#[async_trait]
pub trait BondLedger: Send + Sync {
    async fn commit_payment(
        &self,
        payment_id: PaymentId,
        provider: EvmAddress,
        amount: TokenAmount,
        deadline: UnixTimestamp,
    ) -> Result<(), BondError>;

    async fn release_payment(&self, payment_id: PaymentId) -> Result<(), BondError>;

    async fn claim_payment(&self, payment_id: PaymentId) -> Result<(), BondError>;

    async fn exposure_of(&self, provider: EvmAddress) -> Result<TokenAmount, BondError>;

    async fn available_bond_of(&self, provider: EvmAddress) -> Result<TokenAmount, BondError>;

    /// Convenience check combining `exposure_of` and `available_bond_of`: would
    /// committing `amount` more for `provider` still leave it within its posted bond?
    async fn has_capacity(&self, provider: EvmAddress, amount: TokenAmount) -> Result<bool, BondError> {
        let exposure = self.exposure_of(provider).await?;
        let available = self.available_bond_of(provider).await?;
        let projected = exposure.checked_add(amount).unwrap_or(TokenAmount(U256::MAX));
        Ok(projected <= available)
    }
}

type InnerProvider = DynProvider<Ethereum>;

/// Alloy-backed [`BondLedger`] against a deployed `BondLedger` contract.
#[derive(Clone)]
pub struct AlloyBondLedger {
    provider: InnerProvider,
    contract: EvmAddress,
}

impl AlloyBondLedger {
    pub fn connect(rpc_url: &Url, wallet: EthereumWallet, contract: EvmAddress) -> Self {
        let provider = ProviderBuilder::new().wallet(wallet).connect_http(rpc_url.clone()).erased();
        AlloyBondLedger { provider, contract }
    }

    fn instance(&self) -> IBondLedger::IBondLedgerInstance<&InnerProvider> {
        IBondLedger::new(self.contract.into(), &self.provider)
    }
}

#[async_trait]
impl BondLedger for AlloyBondLedger {
    #[instrument(skip_all, err, fields(payment_id = %payment_id, provider = %provider))]
    async fn commit_payment(
        &self,
        payment_id: PaymentId,
        provider: EvmAddress,
        amount: TokenAmount,
        deadline: UnixTimestamp,
    ) -> Result<(), BondError> {
        self.instance()
            .commitPayment(payment_id.0, provider.into(), amount.0, U256::from(deadline.0))
            .send()
            .instrument(tracing::info_span!("commitPayment", otel.kind = "client"))
            .await?
            .get_receipt()
            .into_future()
            .await?;
        Ok(())
    }

    #[instrument(skip_all, err, fields(payment_id = %payment_id))]
    async fn release_payment(&self, payment_id: PaymentId) -> Result<(), BondError> {
        self.instance()
            .releasePayment(payment_id.0)
            .send()
            .instrument(tracing::info_span!("releasePayment", otel.kind = "client"))
            .await?
            .get_receipt()
            .into_future()
            .await?;
        Ok(())
    }

    #[instrument(skip_all, err, fields(payment_id = %payment_id))]
    async fn claim_payment(&self, payment_id: PaymentId) -> Result<(), BondError> {
        self.instance()
            .claimPayment(payment_id.0)
            .send()
            .instrument(tracing::info_span!("claimPayment", otel.kind = "client"))
            .await?
            .get_receipt()
            .into_future()
            .await?;
        Ok(())
    }

    async fn exposure_of(&self, provider: EvmAddress) -> Result<TokenAmount, BondError> {
        let exposure = self
            .instance()
            .exposureOf(provider.into())
            .call()
            .into_future()
            .await?;
        Ok(TokenAmount(exposure))
    }

    async fn available_bond_of(&self, provider: EvmAddress) -> Result<TokenAmount, BondError> {
        let available = self
            .instance()
            .availableBondOf(provider.into())
            .call()
            .into_future()
            .await?;
        Ok(TokenAmount(available))
    }
}


#[cfg(test)]
mod tests {
    use super::stub::StubBondLedger;
    use super::*;
    use alloy_primitives::{Address, U256};

    #[tokio::test]
    async fn commit_respects_available_capacity() {
        let ledger = StubBondLedger::default();
        let provider = EvmAddress(Address::repeat_byte(1));
        ledger.set_available(provider, TokenAmount(U256::from(1000u64)));
        let payment_id = PaymentId(alloy_primitives::B256::repeat_byte(2));
        ledger
            .commit_payment(payment_id, provider, TokenAmount(U256::from(900u64)), UnixTimestamp(100))
            .await
            .expect("first commit fits");
        let second_id = PaymentId(alloy_primitives::B256::repeat_byte(3));
        let result = ledger
            .commit_payment(second_id, provider, TokenAmount(U256::from(200u64)), UnixTimestamp(100))
            .await;
        assert!(matches!(result, Err(BondError::InsufficientCapacity(_))));
    }

    #[tokio::test]
    async fn release_frees_exposure() {
        let ledger = StubBondLedger::default();
        let provider = EvmAddress(Address::repeat_byte(4));
        ledger.set_available(provider, TokenAmount(U256::from(1000u64)));
        let payment_id = PaymentId(alloy_primitives::B256::repeat_byte(5));
        ledger
            .commit_payment(payment_id, provider, TokenAmount(U256::from(900u64)), UnixTimestamp(100))
            .await
            .unwrap();
        ledger.release_payment(payment_id).await.unwrap();
        assert_eq!(ledger.exposure_of(provider).await.unwrap(), TokenAmount::ZERO);
    }
}
