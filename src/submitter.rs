//! Brings on-chain allowance state in sync with a freshly signed permit.
//!
//! The submitter never reorders: a permit signed against anything but the
//! current on-chain vault nonce is rejected as stale before any gas is spent.
//! A stale rejection is also how idempotency falls out: if the nonce has
//! advanced, the permit was already consumed and the vault's current state is
//! authoritative.

use alloy_primitives::{Bytes, TxHash, U256};
use alloy_sol_types::SolCall;
use std::sync::Arc;
use tracing::instrument;

use crate::chain::{AdminCall, ChainClientError, ChainClients};
use crate::codec::{CodecError, u64_to_u48, u256_to_u160};
use crate::contracts::{IAllowanceVault, IERC20Permit};
use crate::network::{ALLOWANCE_VAULT_ADDRESS, ChainRegistry, RegistryError};
use crate::types::Permit;
use crate::validator::{ChainValidator, ValidationError};

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The permit's nonce no longer matches the chain. The permit was either
    /// superseded or already consumed; nothing was submitted.
    #[error("permit nonce {expected} is stale (on-chain nonce is {on_chain})")]
    PermitStale { expected: u64, on_chain: u64 },
    /// Spending gas on an approval the user cannot fund is wasted; checked
    /// before any submission.
    #[error("insufficient balance {balance} for permit amount {required}")]
    InsufficientBalance { balance: U256, required: U256 },
    /// The vault has no token-level approval and the permit carries no
    /// EIP-2612 signature to install one.
    #[error("token allowance to the vault is insufficient and no token permit signature was provided")]
    MissingTokenPermit,
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Chain(#[from] ChainClientError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Transactions produced by a successful submission.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    /// Set when an EIP-2612 token permit had to be installed first.
    pub token_permit_tx: Option<TxHash>,
    pub vault_permit_tx: TxHash,
}

/// The stale-nonce guard, kept separate so the predicate is testable without
/// a chain.
fn ensure_fresh_nonce(permit_nonce: u64, on_chain: u64) -> Result<(), SubmitError> {
    if permit_nonce == on_chain {
        Ok(())
    } else {
        Err(SubmitError::PermitStale {
            expected: permit_nonce,
            on_chain,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PermitSubmitter {
    clients: Arc<ChainClients>,
    registry: Arc<ChainRegistry>,
}

impl PermitSubmitter {
    pub fn new(clients: Arc<ChainClients>, registry: Arc<ChainRegistry>) -> Self {
        Self { clients, registry }
    }

    /// Submit a stored permit on-chain.
    ///
    /// Order of operations:
    /// 1. Stale-nonce guard against the vault's `(owner, token, spender)`
    ///    nonce.
    /// 2. Balance precheck.
    /// 3. Conditional EIP-2612 `permit` installing the token → vault
    ///    approval, awaited before proceeding.
    /// 4. AllowanceVault `permit` carrying the signed `PermitSingle`.
    #[instrument(skip_all, err, fields(permit = %permit.id, user = %permit.user_address, chain = permit.chain_id))]
    pub async fn submit(&self, permit: &Permit) -> Result<SubmitOutcome, SubmitError> {
        let deployment = self
            .registry
            .token_deployment(&permit.token, permit.chain_id)?;
        let client = self.clients.by_chain_id(permit.chain_id)?;
        let validator = ChainValidator::new(Arc::clone(client));
        let admin = permit.spender_address;

        let on_chain = validator
            .vault_nonce(permit.user_address, deployment.address, admin)
            .await?;
        ensure_fresh_nonce(permit.nonce, on_chain)?;

        let balance = validator
            .check_balance(deployment.address, permit.user_address, permit.amount)
            .await?;
        if !balance.sufficient() {
            return Err(SubmitError::InsufficientBalance {
                balance: balance.balance,
                required: balance.required,
            });
        }

        let token_allowance = validator
            .check_token_allowance(deployment.address, permit.user_address, permit.amount)
            .await?;
        let token_permit_tx = if token_allowance.sufficient() {
            None
        } else {
            let sig = permit
                .token_permit_sig
                .ok_or(SubmitError::MissingTokenPermit)?;
            let call = IERC20Permit::permitCall {
                owner: permit.user_address,
                spender: ALLOWANCE_VAULT_ADDRESS,
                value: U256::MAX,
                deadline: U256::from(sig.deadline),
                v: sig.rsv().v_normalized()?,
                r: sig.r,
                s: sig.s,
            };
            let receipt = client
                .send(AdminCall {
                    to: deployment.address,
                    calldata: call.abi_encode().into(),
                })
                .await?;
            tracing::info!(tx = %receipt.transaction_hash, "installed token permit");
            Some(receipt.transaction_hash)
        };

        let permit_single = IAllowanceVault::PermitSingle {
            details: IAllowanceVault::PermitDetails {
                token: deployment.address,
                amount: u256_to_u160(permit.amount)?,
                expiration: u64_to_u48(permit.deadline)?,
                nonce: u64_to_u48(permit.nonce)?,
            },
            spender: admin,
            sigDeadline: U256::from(permit.deadline),
        };
        let call = IAllowanceVault::permitCall {
            owner: permit.user_address,
            permitSingle: permit_single,
            signature: Bytes::from(permit.signature.as_bytes().to_vec()),
        };
        let receipt = client
            .send(AdminCall {
                to: ALLOWANCE_VAULT_ADDRESS,
                calldata: call.abi_encode().into(),
            })
            .await?;
        tracing::info!(tx = %receipt.transaction_hash, "submitted vault permit");

        Ok(SubmitOutcome {
            token_permit_tx,
            vault_permit_tx: receipt.transaction_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_nonce_passes() {
        assert!(ensure_fresh_nonce(3, 3).is_ok());
    }

    #[test]
    fn stale_or_future_nonce_is_rejected() {
        assert!(matches!(
            ensure_fresh_nonce(0, 1),
            Err(SubmitError::PermitStale { expected: 0, on_chain: 1 })
        ));
        // A nonce ahead of the chain is just as unusable as one behind it.
        assert!(matches!(
            ensure_fresh_nonce(2, 1),
            Err(SubmitError::PermitStale { expected: 2, on_chain: 1 })
        ));
    }
}
