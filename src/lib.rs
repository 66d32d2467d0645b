//! Gasless stablecoin payment routing for a metered-API marketplace.
//!
//! End users sign off-chain spending authorizations ("permits") over
//! stablecoin contracts; the marketplace admin submits them on-chain, pulls
//! funds at per-call granularity, and routes value across chains through a
//! burn-and-mint transfer protocol when an agent's publisher wants payout on
//! a different chain. Consumers never pay gas; the admin pays gas and is
//! reimbursed out of the metered flow.
//!
//! # Components
//!
//! - [`network`] — Chain registry: networks, token deployments, protocol
//!   contract addresses, destination domains.
//! - [`chain`] — Per-chain RPC clients with the serialized admin write path.
//! - [`codec`] — EIP-712 encoding and signature recovery for both permit
//!   schemas.
//! - [`store`] — The persistent permit/payment/subscription store.
//! - [`validator`] — On-chain balance and allowance preflight checks.
//! - [`submitter`] — Brings chain state in sync with freshly signed permits.
//! - [`attestation`] — Long-poll client for the cross-chain attestation
//!   provider.
//! - [`transfer`] — Same-chain and burn-and-mint settlement state machine.
//! - [`selector`] — Chooses which permit funds a call.
//! - [`router`] — Per-request orchestration.
//! - [`handlers`] — The Axum HTTP surface.

pub mod attestation;
pub mod chain;
pub mod codec;
pub mod config;
pub mod contracts;
pub mod error;
pub mod handlers;
pub mod network;
pub mod router;
pub mod selector;
pub mod store;
pub mod submitter;
pub mod timestamp;
pub mod transfer;
pub mod types;
pub mod validator;
