//! On-chain preflight checks for a metered call.
//!
//! Three reads decide whether a permit can actually fund a transfer right
//! now: the user's token balance, the token-level allowance granted to the
//! AllowanceVault, and the vault-level allowance granted to the admin. Each
//! check returns a structured result; a negative answer is data, not an
//! error. Only unrecoverable RPC failures surface as [`ValidationError`].

use alloy_primitives::{Address, U256};
use std::sync::Arc;
use tracing::instrument;

use crate::chain::ChainClient;
use crate::codec::{u48_to_u64, u160_to_u256};
use crate::contracts::{IAllowanceVault, IERC20Permit};
use crate::network::ALLOWANCE_VAULT_ADDRESS;
use crate::timestamp::UnixTimestamp;

/// RPC-level failure while validating. Distinct from a negative check result.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error(transparent)]
    Contract(#[from] alloy_contract::Error),
}

/// Result of an ERC-20 `balanceOf` comparison.
#[derive(Debug, Clone, Copy)]
pub struct BalanceCheck {
    pub balance: U256,
    pub required: U256,
}

impl BalanceCheck {
    /// Inclusive: a balance exactly equal to the requirement passes.
    pub fn sufficient(&self) -> bool {
        self.balance >= self.required
    }
}

/// Result of the token → AllowanceVault allowance read.
///
/// An insufficient token allowance is recoverable when the permit carries an
/// EIP-2612 signature: the submitter can install the approval on demand.
#[derive(Debug, Clone, Copy)]
pub struct TokenAllowanceCheck {
    pub allowance: U256,
    pub required: U256,
}

impl TokenAllowanceCheck {
    pub fn sufficient(&self) -> bool {
        self.allowance >= self.required
    }
}

/// Result of the AllowanceVault → admin allowance read: the on-chain
/// `(amount, expiration, nonce)` triple for `(owner, token, spender)`.
#[derive(Debug, Clone, Copy)]
pub struct VaultAllowanceCheck {
    pub amount: U256,
    /// Unix seconds. Compared strictly: `expiration == now` is expired.
    pub expiration: u64,
    /// Current vault nonce; the next permit must be signed with exactly this
    /// value.
    pub nonce: u64,
    pub required: U256,
}

impl VaultAllowanceCheck {
    pub fn valid_at(&self, now: UnixTimestamp) -> bool {
        self.amount >= self.required && self.expiration > now.as_secs()
    }
}

/// Read-side validator bound to one chain client.
#[derive(Debug, Clone)]
pub struct ChainValidator {
    client: Arc<ChainClient>,
}

impl ChainValidator {
    pub fn new(client: Arc<ChainClient>) -> Self {
        Self { client }
    }

    #[instrument(skip_all, err, fields(token = %token, user = %user))]
    pub async fn check_balance(
        &self,
        token: Address,
        user: Address,
        required: U256,
    ) -> Result<BalanceCheck, ValidationError> {
        let contract = IERC20Permit::new(token, self.client.provider());
        let balance = contract.balanceOf(user).call().await?;
        Ok(BalanceCheck { balance, required })
    }

    #[instrument(skip_all, err, fields(token = %token, user = %user))]
    pub async fn check_token_allowance(
        &self,
        token: Address,
        user: Address,
        required: U256,
    ) -> Result<TokenAllowanceCheck, ValidationError> {
        let contract = IERC20Permit::new(token, self.client.provider());
        let allowance = contract
            .allowance(user, ALLOWANCE_VAULT_ADDRESS)
            .call()
            .await?;
        Ok(TokenAllowanceCheck { allowance, required })
    }

    #[instrument(skip_all, err, fields(token = %token, user = %user, spender = %spender))]
    pub async fn check_vault_allowance(
        &self,
        user: Address,
        token: Address,
        spender: Address,
        required: U256,
    ) -> Result<VaultAllowanceCheck, ValidationError> {
        let vault = IAllowanceVault::new(ALLOWANCE_VAULT_ADDRESS, self.client.provider());
        let result = vault.allowance(user, token, spender).call().await?;
        Ok(VaultAllowanceCheck {
            amount: u160_to_u256(result.amount),
            expiration: u48_to_u64(result.expiration),
            nonce: u48_to_u64(result.nonce),
            required,
        })
    }

    /// Current AllowanceVault nonce for `(owner, token, spender)`. Used by the
    /// submitter's stale-nonce guard.
    pub async fn vault_nonce(
        &self,
        user: Address,
        token: Address,
        spender: Address,
    ) -> Result<u64, ValidationError> {
        let check = self
            .check_vault_allowance(user, token, spender, U256::ZERO)
            .await?;
        Ok(check.nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balance_comparison_is_inclusive() {
        let exact = BalanceCheck {
            balance: U256::from(100_000u64),
            required: U256::from(100_000u64),
        };
        assert!(exact.sufficient());

        let short = BalanceCheck {
            balance: U256::from(99_999u64),
            required: U256::from(100_000u64),
        };
        assert!(!short.sufficient());
    }

    #[test]
    fn vault_expiration_is_strict() {
        let now = UnixTimestamp(1_000_000);
        let base = VaultAllowanceCheck {
            amount: U256::from(100_000u64),
            expiration: 1_000_000,
            nonce: 0,
            required: U256::from(100_000u64),
        };
        // expiration == now is already expired.
        assert!(!base.valid_at(now));
        let later = VaultAllowanceCheck {
            expiration: 1_000_001,
            ..base
        };
        assert!(later.valid_at(now));
        let short = VaultAllowanceCheck {
            required: U256::from(100_001u64),
            ..later
        };
        assert!(!short.valid_at(now));
    }
}
