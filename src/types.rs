//! Core entities owned by the permit store.
//!
//! Everything here is self-describing JSON: entities cross the HTTP surface
//! and land in the persistent store in the same camelCase shape. Amounts are
//! 256-bit integers in token base units (all supported stablecoins carry six
//! decimals); USD prices are fixed-point decimals.

use alloy_primitives::{Address, B256, U256};
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::codec::{SignatureRsv, TokenPermitSig};
use crate::network::TokenSymbol;

/// Decimals shared by every supported stablecoin.
pub const STABLECOIN_DECIMALS: u32 = 6;

/// Convert a USD fixed-point amount into 6-decimal token base units.
///
/// Returns `None` for negative amounts or amounts too precise to represent.
pub fn usd_to_units(usd: Decimal) -> Option<U256> {
    if usd.is_sign_negative() {
        return None;
    }
    let scaled = usd.checked_mul(Decimal::from(1_000_000u64))?;
    if scaled.fract() != Decimal::ZERO {
        return None;
    }
    scaled.to_u128().map(U256::from)
}

/// Convert 6-decimal token base units into a USD fixed-point amount.
pub fn units_to_usd(units: U256) -> Decimal {
    let raw = u128::try_from(units).unwrap_or(u128::MAX);
    Decimal::from_i128_with_scale(raw as i128, STABLECOIN_DECIMALS)
}

/// Random, collision-resistant entity id with a kind prefix.
pub fn new_id(prefix: &str) -> String {
    let bytes: [u8; 16] = rand::rng().random();
    format!("{prefix}_{}", hex::encode(bytes))
}

/// Lifecycle status of a permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermitStatus {
    Active,
    Expired,
    Revoked,
}

/// An off-chain spending authorization over a stablecoin, signed by the user
/// and submitted on-chain by the admin.
///
/// The `amount` is immutable after signing; a revocation is a new permit of
/// amount zero, never a mutation. At most one permit per
/// `(user, token, chain)` is active; newer permits supersede older ones,
/// which are retained for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permit {
    pub id: String,
    pub user_address: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub token: TokenSymbol,
    pub chain_id: u64,
    /// The admin account authorized to pull funds. Constant within a
    /// deployment.
    pub spender_address: Address,
    /// Token base units (6 decimals).
    pub amount: U256,
    /// AllowanceVault nonce for `(owner, token, spender)`. Must equal the
    /// on-chain nonce at submission time.
    pub nonce: u64,
    /// Unix seconds. Doubles as the vault allowance `expiration` and the
    /// signature `sigDeadline`.
    pub deadline: u64,
    /// Signature over the AllowanceVault typed-data domain.
    pub signature: SignatureRsv,
    /// Optional EIP-2612 signature authorizing the AllowanceVault to draw
    /// from the user's balance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_permit_sig: Option<TokenPermitSig>,
    pub status: PermitStatus,
    /// Milliseconds, local bookkeeping.
    pub created_at: u64,
    /// Milliseconds, local bookkeeping.
    pub expires_at: u64,
    pub max_calls: u64,
    pub calls_used: u64,
    /// USD fixed-point price the permit was sized against.
    pub cost_per_call: Decimal,
}

impl Permit {
    pub fn remaining_calls(&self) -> u64 {
        self.max_calls.saturating_sub(self.calls_used)
    }

    /// Remaining spendable value in USD.
    pub fn remaining_value(&self) -> Decimal {
        Decimal::from(self.remaining_calls()) * self.cost_per_call
    }

    /// Whether the permit can fund a call right now: active status, unexpired,
    /// and at least one call left.
    pub fn is_usable(&self, now_millis: u64) -> bool {
        self.status == PermitStatus::Active
            && self.expires_at > now_millis
            && self.remaining_calls() > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
}

/// A user's subscription to an agent, carrying the free-trial and paid-call
/// counters. Decrementing a free trial and incrementing paid calls are
/// mutually exclusive per call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: String,
    pub user_id: String,
    pub agent_id: String,
    pub status: SubscriptionStatus,
    pub free_trials_remaining: u32,
    pub free_trials_used: u32,
    pub total_paid_calls: u64,
    pub created_at: u64,
}

/// Where an agent's publisher wants to be paid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPreferences {
    pub payout_token: TokenSymbol,
    pub payout_chain_id: u64,
}

/// A published API agent. Read-only from the router's perspective.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub price_per_call_usd: Decimal,
    pub payment_preferences: PaymentPreferences,
    pub publisher_wallet_address: Address,
    pub api_endpoint: Url,
    pub publisher_api_key: String,
    pub free_trial_tries: u32,
}

impl Agent {
    /// Per-call price in token base units.
    pub fn price_units(&self) -> Option<U256> {
        usd_to_units(self.price_per_call_usd)
    }
}

/// A marketplace user, authenticated by an opaque bearer API key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub api_key: String,
    pub wallet_address: Address,
    pub is_approved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttestationStatus {
    Pending,
    Complete,
    Failed,
}

/// Durable record of a burn-and-mint transfer. Written after the burn and
/// before the attestation wait, so a crash mid-flight leaves a recoverable
/// row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossChainPayment {
    pub id: String,
    pub user_id: String,
    pub agent_id: String,
    pub source_chain_id: u64,
    pub target_chain_id: u64,
    pub amount: U256,
    pub token: TokenSymbol,
    /// keccak256 of the `MessageSent` log data from the burn receipt.
    pub message_hash: B256,
    pub source_transaction_hash: B256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_transaction_hash: Option<B256>,
    pub attestation_status: AttestationStatus,
    pub permit_id: String,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Completed,
    PendingAttestation,
    Failed,
}

/// Per-call payment receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: String,
    pub user_id: String,
    pub agent_id: String,
    pub amount: U256,
    pub token: TokenSymbol,
    pub chain_id: u64,
    pub transaction_hash: B256,
    pub status: PaymentStatus,
    /// Idempotency key: at most one payment exists per metered call.
    pub api_call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_hash: Option<B256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cross_chain_payment_id: Option<String>,
    pub created_at: u64,
}

/// Unconditional log row for every forwarded call, success or failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCallLog {
    pub id: String,
    pub user_id: String,
    pub agent_id: String,
    pub request_timestamp: u64,
    pub response_timestamp: u64,
    pub http_status: u16,
    pub response_time_ms: u64,
    pub is_free_trial: bool,
    pub charged_amount_usd: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
}

/// Canonical permit fixture shared by unit tests across modules.
#[cfg(test)]
pub(crate) fn test_permit() -> Permit {
    use std::str::FromStr;
    Permit {
        id: new_id("permit"),
        user_address: Address::repeat_byte(0xaa),
        agent_id: None,
        token: TokenSymbol::usdc(),
        chain_id: 84532,
        spender_address: Address::repeat_byte(0xad),
        amount: U256::from(10_000_000u64),
        nonce: 0,
        deadline: 1_900_000_000,
        signature: SignatureRsv {
            r: B256::repeat_byte(0x01),
            s: B256::repeat_byte(0x02),
            v: 27,
        },
        token_permit_sig: None,
        status: PermitStatus::Active,
        created_at: 0,
        expires_at: u64::MAX,
        max_calls: 100,
        calls_used: 0,
        cost_per_call: Decimal::from_str("0.10").unwrap(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn usd_units_round_trip() {
        let dime = Decimal::from_str("0.10").unwrap();
        assert_eq!(usd_to_units(dime), Some(U256::from(100_000u64)));
        assert_eq!(units_to_usd(U256::from(100_000u64)), dime.normalize());

        let ten = Decimal::from_str("10").unwrap();
        assert_eq!(usd_to_units(ten), Some(U256::from(10_000_000u64)));
    }

    #[test]
    fn usd_to_units_rejects_unrepresentable() {
        assert_eq!(usd_to_units(Decimal::from_str("-1").unwrap()), None);
        assert_eq!(usd_to_units(Decimal::from_str("0.0000001").unwrap()), None);
    }

    #[test]
    fn remaining_value_scales_with_usage() {
        let mut permit = test_permit();
        assert_eq!(permit.remaining_calls(), 100);
        assert_eq!(
            permit.remaining_value(),
            Decimal::from_str("10.00").unwrap()
        );
        permit.calls_used = 99;
        assert_eq!(permit.remaining_value(), Decimal::from_str("0.10").unwrap());
        permit.calls_used = 100;
        assert_eq!(permit.remaining_calls(), 0);
        assert!(!permit.is_usable(0));
    }

    #[test]
    fn ids_are_prefixed_and_distinct() {
        let a = new_id("permit");
        let b = new_id("permit");
        assert!(a.starts_with("permit_"));
        assert_ne!(a, b);
    }
}
