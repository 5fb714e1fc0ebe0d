//! Payment facilitator for EIP-3009 `transferWithAuthorization` transfers on a
//! fast-finality EVM chain.
//!
//! # Overview
//!
//! A facilitator verifies and settles payer-signed payment authorizations on behalf of a
//! provider, backstopping settlements that stall past the chain's consensus window with
//! posted bond collateral, and tracking every settlement's confirmation depth against the
//! chain's Fast Confirmation Rule (FCR) lattice (`L0`-`L3`). It also runs a deferred-payment
//! voucher store for buyer/seller pairs that want to batch many small payments into
//! occasional on-chain settlements.
//!
//! # Modules
//!
//! - [`types`] — core domain types (addresses, amounts, authorizations, vouchers' shared wire types).
//! - [`signature`] — EIP-712 digest construction and signature recovery.
//! - [`wallet`] — facilitator signing key material.
//! - [`chain`] — the EVM RPC adapter (`ChainRpc`).
//! - [`risk`] — per-wallet exposure tracking and tiered limits.
//! - [`verification`] — the ordered gate chain a payment must clear before settlement.
//! - [`bond`] — provider bond collateral adapter (`BondLedger`).
//! - [`escrow`] — deferred-payment escrow contract adapter (`EscrowContract`).
//! - [`fcr`] — the Fast Confirmation Rule monitor.
//! - [`settlement`] — submits and tracks settlements through to confirmation.
//! - [`voucher`] — the deferred payment voucher store.
//! - [`persistence`] — optional external key-value/lock backend.
//! - [`config`] — environment-driven configuration.
//! - [`app`] — shared `AppState` handed to HTTP handlers.
//! - [`handlers`] — HTTP endpoint handlers.
//! - [`telemetry`] — tracing/OpenTelemetry setup.
//! - [`sig_down`] — graceful shutdown signal handling.

pub mod app;
pub mod bond;
pub mod chain;
pub mod config;
pub mod escrow;
pub mod fcr;
pub mod handlers;
pub mod persistence;
pub mod risk;
pub mod settlement;
pub mod sig_down;
pub mod signature;
pub mod telemetry;
pub mod types;
pub mod verification;
pub mod voucher;
pub mod wallet;
