//! Facilitator HTTP entrypoint.
//!
//! Loads configuration from the environment, connects the chain/bond RPC adapters and
//! facilitator wallet, builds the risk/settlement/FCR/voucher components, and serves the
//! HTTP routes while running the settlement and FCR poller as background tasks that share
//! a single `CancellationToken` with the HTTP server's graceful shutdown.

use axum::Router;
use axum::http::Method;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::cors;

use fcr_facilitator::app::AppState;
use fcr_facilitator::bond::{AlloyBondLedger, BondLedger};
use fcr_facilitator::chain::{AlloyChainRpc, ChainRpc};
use fcr_facilitator::config::Config;
use fcr_facilitator::escrow::{AlloyEscrowContract, EscrowContract};
use fcr_facilitator::fcr::FcrMonitor;
use fcr_facilitator::handlers;
use fcr_facilitator::risk::{LimitTable, RiskState, TierDailyCaps};
use fcr_facilitator::settlement::{SettlementConfig, SettlementEngine};
use fcr_facilitator::sig_down::SigDown;
use fcr_facilitator::telemetry::Telemetry;
use fcr_facilitator::types::TokenAmount;
use fcr_facilitator::verification::VerificationConfig;
use fcr_facilitator::voucher::VoucherStore;
use fcr_facilitator::wallet;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let _telemetry = Telemetry::new();

    let config = Config::from_env()?;
    let wallet = wallet::wallet_from_env()?;
    let provider_address = {
        use alloy_network::NetworkWallet;
        fcr_facilitator::types::EvmAddress(
            <alloy_network::EthereumWallet as NetworkWallet<alloy_network::Ethereum>>::default_signer_address(&wallet),
        )
    };

    let chain: Arc<dyn ChainRpc> = Arc::new(AlloyChainRpc::connect(&config.chain.rpc_url, wallet.clone(), true));

    let bond: Arc<dyn BondLedger> = Arc::new(AlloyBondLedger::connect(
        &config.chain.rpc_url,
        wallet.clone(),
        config.bond.contract_address,
    ));

    let limits = LimitTable {
        max_per_transaction: TokenAmount(config.risk.max_per_transaction),
        max_pending_per_wallet: TokenAmount(config.risk.max_pending_per_wallet),
        daily_limit_per_wallet: TokenAmount(config.risk.daily_limit_per_wallet),
        tier_daily_caps: TierDailyCaps::from_token_decimals(config.chain.token_decimals),
    };
    let risk = Arc::new(RiskState::new(limits));

    let fcr = Arc::new(FcrMonitor::new(config.fcr.min_time_in_prepare));

    let settlement = Arc::new(SettlementEngine::new(
        chain.clone(),
        bond.clone(),
        fcr.clone(),
        SettlementConfig {
            max_attempts: config.settlement.max_attempts,
            bond_window_seconds: config.bond.window_seconds,
            retry_backoff: config.settlement.retry_delay,
        },
    ));

    let escrow: Option<Arc<dyn EscrowContract>> = config.escrow.contract_address.map(|address| {
        Arc::new(AlloyEscrowContract::connect(&config.chain.rpc_url, wallet.clone(), address))
            as Arc<dyn EscrowContract>
    });

    let voucher = Arc::new(VoucherStore::new(
        config.chain.token_name.clone(),
        config.chain.token_eip712_version.clone(),
        escrow,
    ));

    let verification = Arc::new(VerificationConfig {
        eip712_name: config.chain.token_name.clone(),
        eip712_version_override: None,
    });

    let state = AppState {
        chain: chain.clone(),
        risk,
        settlement: settlement.clone(),
        fcr: fcr.clone(),
        voucher,
        verification,
        provider: provider_address,
        chain_id: config.chain.chain_id,
        chain_name: config.chain.token_name.clone(),
    };

    let sig_down = SigDown::try_new()?;
    let cancellation = sig_down.cancellation_token();

    if config.fcr.enabled {
        let fcr_task = fcr.clone();
        let fcr_chain_url = config.chain.rpc_url.clone();
        let fcr_cancellation = cancellation.clone();
        let poll_interval = config.fcr.poll_interval;
        tokio::spawn(async move {
            let consensus_chain = AlloyChainRpc::connect(&fcr_chain_url, wallet, true);
            let rpc: Arc<dyn fcr_facilitator::fcr::ConsensusRpc> =
                Arc::new(NoopConsensusRpc(Arc::new(consensus_chain)));
            let (tx, _rx) = watch::channel(());
            fcr_task.run(rpc, poll_interval, fcr_cancellation, tx).await;
        });
    }

    {
        let worker = settlement.clone();
        let worker_cancellation = cancellation.clone();
        tokio::spawn(async move {
            worker.run_worker(Duration::from_secs(5), worker_cancellation).await;
        });
    }

    let http_endpoints = Router::new().merge(handlers::routes(state)).layer(_telemetry.http_tracing()).layer(
        cors::CorsLayer::new()
            .allow_origin(cors::Any)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(cors::Any),
    );

    let addr = SocketAddr::new(config.host, config.port);
    tracing::info!("starting facilitator at http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap_or_else(|e| {
        tracing::error!("failed to bind to {addr}: {e}");
        std::process::exit(1);
    });

    let shutdown_token = cancellation.clone();
    axum::serve(listener, http_endpoints)
        .with_graceful_shutdown(async move { shutdown_token.cancelled().await })
        .await?;

    Ok(())
}

/// The chain doesn't yet expose a dedicated fast-finality RPC surface, so this adapter
/// is a placeholder until the consensus subprotocol's RPC methods are wired up; it
/// reports no progress, leaving every settlement at `L0`/`L1` until replaced.
struct NoopConsensusRpc(Arc<AlloyChainRpc>);

#[async_trait::async_trait]
impl fcr_facilitator::fcr::ConsensusRpc for NoopConsensusRpc {
    async fn get_progress(&self) -> Result<fcr_facilitator::fcr::InstanceProgress, fcr_facilitator::fcr::FcrError> {
        Ok(fcr_facilitator::fcr::InstanceProgress {
            instance: 0,
            round: 0,
            phase: fcr_facilitator::types::Phase::Quality,
        })
    }

    async fn get_latest_certificate(
        &self,
    ) -> Result<fcr_facilitator::fcr::ConsensusCertificate, fcr_facilitator::fcr::FcrError> {
        Ok(fcr_facilitator::fcr::ConsensusCertificate {
            instance: 0,
            finalized_height: 0,
        })
    }

    async fn get_certificate(
        &self,
        instance: u64,
    ) -> Result<Option<fcr_facilitator::fcr::ConsensusCertificate>, fcr_facilitator::fcr::FcrError> {
        Ok(Some(fcr_facilitator::fcr::ConsensusCertificate {
            instance,
            finalized_height: 0,
        }))
    }

    async fn get_chain_head(&self) -> Result<u64, fcr_facilitator::fcr::FcrError> {
        self.0
            .current_height()
            .await
            .map_err(|e| fcr_facilitator::fcr::FcrError::Rpc(e.to_string()))
    }
}
