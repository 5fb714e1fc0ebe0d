//! Shared application state handed to every handler via axum's `State` extractor.
//!
//! One `AppState` per process, built once in `main.rs` and cloned cheaply (every field
//! is an `Arc`) into each request — the same shape as the teacher's `FacilitatorLocal`
//! being the single `State<A>` the old handler set closed over.

use std::sync::Arc;

use crate::chain::ChainRpc;
use crate::fcr::FcrMonitor;
use crate::risk::RiskState;
use crate::settlement::SettlementEngine;
use crate::types::EvmAddress;
use crate::verification::VerificationConfig;
use crate::voucher::VoucherStore;

#[derive(Clone)]
pub struct AppState {
    pub chain: Arc<dyn ChainRpc>,
    pub risk: Arc<RiskState>,
    pub settlement: Arc<SettlementEngine>,
    pub fcr: Arc<FcrMonitor>,
    pub voucher: Arc<VoucherStore>,
    pub verification: Arc<VerificationConfig>,
    pub provider: EvmAddress,
    pub chain_id: u64,
    pub chain_name: String,
}
