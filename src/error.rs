//! Top-level failure taxonomy for the router surface.
//!
//! Component-level errors (store, validator, submitter, transfer engine)
//! convert into [`RouterError`] at the orchestration boundary; the HTTP layer
//! then maps each kind onto a status code. Locally recovered conditions (the
//! attestation provider's transient 404s) never reach this type.

use alloy_primitives::{TxHash, U256};
use axum::http::StatusCode;

use crate::attestation::AttestationError;
use crate::chain::ChainClientError;
use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::network::{RegistryError, TokenSymbol};
use crate::store::StoreError;
use crate::submitter::SubmitError;
use crate::transfer::TransferError;
use crate::validator::ValidationError;

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("an active subscription to this agent is required")]
    SubscriptionRequired,
    #[error("agent {0} not found")]
    AgentNotFound(String),
    #[error("permit {0} not found")]
    PermitNotFound(String),
    #[error("no valid permits cover this call")]
    NoValidPermits,
    #[error("remaining permit value does not cover the call price")]
    InsufficientPermitBalance,
    #[error("insufficient on-chain balance {balance} for required {required}")]
    InsufficientBalance { balance: U256, required: U256 },
    #[error("allowance to the admin is insufficient or expired")]
    InsufficientAllowance,
    #[error("token allowance to the vault is insufficient")]
    InsufficientVaultAllowance,
    #[error("unsupported route: {token} from chain {source_chain} to chain {target}")]
    UnsupportedRoute {
        token: TokenSymbol,
        source_chain: u64,
        target: u64,
    },
    #[error("permit nonce {expected} is stale (on-chain nonce is {on_chain})")]
    PermitStale { expected: u64, on_chain: u64 },
    #[error("attestation failed: {0}")]
    AttestationFailed(String),
    #[error("timed out waiting for receipt of transaction {0}")]
    ReceiptTimeout(TxHash),
    #[error("publisher call failed (downstream status {status:?})")]
    ApiCallFailed { status: Option<u16> },
    #[error("publisher call timed out")]
    PublisherTimeout,
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("request body is not valid JSON")]
    InvalidJson,
    #[error("rate limited")]
    RateLimited,
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl RouterError {
    /// Stable machine-readable code carried in error response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            RouterError::Unauthorized => "Unauthorized",
            RouterError::SubscriptionRequired => "SubscriptionRequired",
            RouterError::AgentNotFound(_) => "AgentNotFound",
            RouterError::PermitNotFound(_) => "PermitNotFound",
            RouterError::NoValidPermits => "NoValidPermits",
            RouterError::InsufficientPermitBalance => "InsufficientPermitBalance",
            RouterError::InsufficientBalance { .. } => "InsufficientBalance",
            RouterError::InsufficientAllowance => "InsufficientAllowance",
            RouterError::InsufficientVaultAllowance => "InsufficientPermit2Allowance",
            RouterError::UnsupportedRoute { .. } => "UnsupportedRoute",
            RouterError::PermitStale { .. } => "PermitStale",
            RouterError::AttestationFailed(_) => "AttestationFailed",
            RouterError::ReceiptTimeout(_) => "ReceiptTimeout",
            RouterError::ApiCallFailed { .. } => "ApiCallFailed",
            RouterError::PublisherTimeout => "ApiCallFailed",
            RouterError::InvalidParameters(_) => "InvalidParameters",
            RouterError::InvalidJson => "InvalidJson",
            RouterError::RateLimited => "RateLimited",
            RouterError::Configuration(_) => "ConfigurationError",
            RouterError::Internal(_) => "InternalError",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            RouterError::Unauthorized => StatusCode::UNAUTHORIZED,
            RouterError::SubscriptionRequired => StatusCode::FORBIDDEN,
            RouterError::AgentNotFound(_) | RouterError::PermitNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            RouterError::NoValidPermits
            | RouterError::InsufficientPermitBalance
            | RouterError::InsufficientBalance { .. }
            | RouterError::InsufficientAllowance
            | RouterError::InsufficientVaultAllowance => StatusCode::PAYMENT_REQUIRED,
            RouterError::UnsupportedRoute { .. }
            | RouterError::InvalidParameters(_)
            | RouterError::InvalidJson => StatusCode::BAD_REQUEST,
            RouterError::PermitStale { .. } => StatusCode::CONFLICT,
            RouterError::AttestationFailed(_)
            | RouterError::ReceiptTimeout(_)
            | RouterError::ApiCallFailed { .. } => StatusCode::BAD_GATEWAY,
            RouterError::PublisherTimeout => StatusCode::GATEWAY_TIMEOUT,
            RouterError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            RouterError::Configuration(_) | RouterError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<StoreError> for RouterError {
    fn from(e: StoreError) -> Self {
        RouterError::Internal(e.to_string())
    }
}

impl From<ValidationError> for RouterError {
    fn from(e: ValidationError) -> Self {
        RouterError::Internal(e.to_string())
    }
}

impl From<CodecError> for RouterError {
    fn from(e: CodecError) -> Self {
        RouterError::InvalidParameters(e.to_string())
    }
}

impl From<ConfigError> for RouterError {
    fn from(e: ConfigError) -> Self {
        RouterError::Configuration(e.to_string())
    }
}

impl From<RegistryError> for RouterError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::UnsupportedChain(_) | RegistryError::UnknownToken(_, _) => {
                RouterError::InvalidParameters(e.to_string())
            }
            RegistryError::MissingRpcUrl(_) => RouterError::Configuration(e.to_string()),
        }
    }
}

impl From<AttestationError> for RouterError {
    fn from(e: AttestationError) -> Self {
        RouterError::AttestationFailed(e.to_string())
    }
}

impl From<ChainClientError> for RouterError {
    fn from(e: ChainClientError) -> Self {
        match e {
            ChainClientError::ReceiptTimeout { transaction } => {
                RouterError::ReceiptTimeout(transaction)
            }
            other => RouterError::Internal(other.to_string()),
        }
    }
}

impl From<SubmitError> for RouterError {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::PermitStale { expected, on_chain } => {
                RouterError::PermitStale { expected, on_chain }
            }
            SubmitError::InsufficientBalance { balance, required } => {
                RouterError::InsufficientBalance { balance, required }
            }
            SubmitError::MissingTokenPermit => RouterError::InsufficientVaultAllowance,
            SubmitError::Registry(e) => e.into(),
            SubmitError::Validation(e) => e.into(),
            SubmitError::Chain(e) => e.into(),
            SubmitError::Codec(e) => e.into(),
        }
    }
}

impl From<TransferError> for RouterError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::UnsupportedRoute {
                token,
                source_chain,
                target,
            } => RouterError::UnsupportedRoute {
                token,
                source_chain,
                target,
            },
            TransferError::Attestation(e) => e.into(),
            TransferError::Chain(ChainClientError::ReceiptTimeout { transaction }) => {
                RouterError::ReceiptTimeout(transaction)
            }
            // A settlement write that reverted or failed to land after the
            // publisher already served the call: recorded, not refunded.
            TransferError::Chain(_) => RouterError::ApiCallFailed { status: None },
            TransferError::Registry(e) => e.into(),
            TransferError::Store(e) => e.into(),
            TransferError::Codec(e) => e.into(),
            TransferError::MissingMessageHash { .. } => RouterError::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_map_matches_the_contract() {
        assert_eq!(RouterError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            RouterError::SubscriptionRequired.status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            RouterError::InsufficientBalance {
                balance: U256::ZERO,
                required: U256::from(1u64)
            }
            .status_code(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            RouterError::PermitStale { expected: 0, on_chain: 1 }.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            RouterError::UnsupportedRoute {
                token: TokenSymbol::new("PYUSD"),
                source_chain: 1,
                target: 8453
            }
            .status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RouterError::ApiCallFailed { status: Some(500) }.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            RouterError::PublisherTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn transfer_failures_keep_their_taxonomy() {
        let stale: RouterError = SubmitError::PermitStale { expected: 0, on_chain: 2 }.into();
        assert_eq!(stale.code(), "PermitStale");

        let unsupported: RouterError = TransferError::UnsupportedRoute {
            token: TokenSymbol::new("PYUSD"),
            source_chain: 11155111,
            target: 84532,
        }
        .into();
        assert_eq!(unsupported.code(), "UnsupportedRoute");
    }
}
