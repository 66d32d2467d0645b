//! Settlement: same-chain pulls and the burn-and-mint cross-chain sequence.
//!
//! The route is decided up front from the permit's `(token, chain)` and the
//! agent's payout preferences, and the non-USDC gate fires before any
//! on-chain write. Same-chain settles with a single vault `transferFrom`.
//! Cross-chain drives the four-phase sequence
//! `pull → approve → burn → attest → redeem`, persisting the
//! [`CrossChainPayment`] between burn and attestation so a crash mid-flight
//! leaves a recoverable record:
//!
//! ```text
//! created → burning → awaiting-attestation → redeeming → complete
//!              ↓              ↓                  ↓
//!           failed         failed             failed
//! ```

use alloy_primitives::{Address, B256, LogData, TxHash, U256, keccak256};
use alloy_rpc_types_eth::TransactionReceipt;
use alloy_sol_types::SolCall;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::attestation::{Attestation, AttestationClient, AttestationError, AttestationQuery};
use crate::chain::{AdminCall, ChainClient, ChainClientError, ChainClients};
use crate::codec::{CodecError, u256_to_u160};
use crate::contracts::{
    IAllowanceVault, IERC20Permit, IMessageTransmitter, ITokenMessenger, MESSAGE_SENT_TOPIC,
};
use crate::network::{ALLOWANCE_VAULT_ADDRESS, ChainRegistry, Network, RegistryError, TokenSymbol};
use crate::store::{CrossChainPaymentPatch, Store, StoreError};
use crate::timestamp::now_millis;
use crate::types::{AttestationStatus, CrossChainPayment, new_id};

/// Finality the burn waits for before the attestation authority signs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferType {
    Fast,
    #[default]
    Standard,
}

impl TransferType {
    pub fn finality_threshold(&self) -> u32 {
        match self {
            TransferType::Fast => 1000,
            TransferType::Standard => 2000,
        }
    }
}

/// Fee ceiling the burn accepts: 0.5% of the transferred amount.
pub fn max_fee(amount: U256) -> U256 {
    amount * U256::from(5u64) / U256::from(1000u64)
}

/// Whether settlement must leave the source chain or token.
///
/// Strictly `chainId ≠ targetChainId ∨ token ≠ targetToken`; whether such a
/// route is *possible* is decided separately by [`plan_route`].
pub fn needs_cross_chain(
    token: &TokenSymbol,
    chain_id: u64,
    payout_token: &TokenSymbol,
    payout_chain_id: u64,
) -> bool {
    chain_id != payout_chain_id || token != payout_token
}

/// A settled-on route for one payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    SameChain { network: Network },
    CrossChain { source: Network, target: Network },
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// Only USDC can travel through the burn-and-mint protocol.
    #[error("unsupported route: {token} from chain {source_chain} to chain {target}")]
    UnsupportedRoute {
        token: TokenSymbol,
        source_chain: u64,
        target: u64,
    },
    #[error("burn transaction {transaction} carries no MessageSent event")]
    MissingMessageHash { transaction: TxHash },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Chain(#[from] ChainClientError),
    #[error(transparent)]
    Attestation(#[from] AttestationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Decide the route before touching the chain. The non-USDC gate lives here,
/// so an impossible route fails with zero on-chain writes.
pub fn plan_route(
    token: &TokenSymbol,
    source_chain_id: u64,
    payout_token: &TokenSymbol,
    payout_chain_id: u64,
) -> Result<Route, TransferError> {
    let source = Network::from_chain_id(source_chain_id)?;
    if !needs_cross_chain(token, source_chain_id, payout_token, payout_chain_id) {
        return Ok(Route::SameChain { network: source });
    }
    if !token.is_usdc() {
        return Err(TransferError::UnsupportedRoute {
            token: token.clone(),
            source_chain: source_chain_id,
            target: payout_chain_id,
        });
    }
    let target = Network::from_chain_id(payout_chain_id)?;
    Ok(Route::CrossChain { source, target })
}

/// Find the `MessageSent` event among a receipt's logs and hash its raw data.
pub fn extract_message_hash<'a>(mut logs: impl Iterator<Item = &'a LogData>) -> Option<B256> {
    logs.find(|data| data.topics().first() == Some(&MESSAGE_SENT_TOPIC))
        .map(|data| keccak256(&data.data))
}

fn message_sent_hash(receipt: &TransactionReceipt) -> Option<B256> {
    let logs = receipt.inner.as_receipt()?.logs.as_slice();
    extract_message_hash(logs.iter().map(|log| &log.inner.data))
}

/// Everything the engine needs to settle one metered call.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub user: Address,
    pub user_id: String,
    pub agent_id: String,
    pub publisher: Address,
    /// Token base units to move.
    pub amount: U256,
    pub token: TokenSymbol,
    pub source_chain_id: u64,
    pub payout_token: TokenSymbol,
    pub payout_chain_id: u64,
    pub permit_id: String,
    pub transfer_type: TransferType,
}

/// Terminal result of a successful settlement.
#[derive(Debug, Clone)]
pub enum TransferOutcome {
    SameChain {
        transaction_hash: TxHash,
    },
    CrossChain {
        payment_id: String,
        message_hash: B256,
        source_tx: TxHash,
        target_tx: TxHash,
    },
}

impl TransferOutcome {
    /// The transaction the payment record should reference: the transfer on
    /// the source chain.
    pub fn transaction_hash(&self) -> TxHash {
        match self {
            TransferOutcome::SameChain { transaction_hash } => *transaction_hash,
            TransferOutcome::CrossChain { source_tx, .. } => *source_tx,
        }
    }

    pub fn message_hash(&self) -> Option<B256> {
        match self {
            TransferOutcome::SameChain { .. } => None,
            TransferOutcome::CrossChain { message_hash, .. } => Some(*message_hash),
        }
    }

    pub fn cross_chain_payment_id(&self) -> Option<&str> {
        match self {
            TransferOutcome::SameChain { .. } => None,
            TransferOutcome::CrossChain { payment_id, .. } => Some(payment_id),
        }
    }
}

/// Executes transfers. Owns no accounting beyond the [`CrossChainPayment`]
/// lifecycle; permit and subscription counters move in the router, after the
/// engine reports terminal success.
#[derive(Clone)]
pub struct TransferEngine {
    clients: Arc<ChainClients>,
    registry: Arc<ChainRegistry>,
    store: Arc<dyn Store>,
    attestation: AttestationClient,
}

impl TransferEngine {
    pub fn new(
        clients: Arc<ChainClients>,
        registry: Arc<ChainRegistry>,
        store: Arc<dyn Store>,
        attestation: AttestationClient,
    ) -> Self {
        Self {
            clients,
            registry,
            store,
            attestation,
        }
    }

    /// Settle one payment, same-chain or cross-chain.
    #[instrument(skip_all, err, fields(permit = %request.permit_id, amount = %request.amount))]
    pub async fn execute(
        &self,
        request: &TransferRequest,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, TransferError> {
        let route = plan_route(
            &request.token,
            request.source_chain_id,
            &request.payout_token,
            request.payout_chain_id,
        )?;
        match route {
            Route::SameChain { network } => self.settle_same_chain(network, request).await,
            Route::CrossChain { source, target } => {
                self.settle_cross_chain(source, target, request, cancel).await
            }
        }
    }

    /// Single vault `transferFrom(user, publisher, amount)`.
    async fn settle_same_chain(
        &self,
        network: Network,
        request: &TransferRequest,
    ) -> Result<TransferOutcome, TransferError> {
        let deployment = self
            .registry
            .token_deployment(&request.token, request.source_chain_id)?;
        let client = self.clients.get(network)?;
        let receipt = self
            .vault_transfer_from(
                client,
                request.user,
                request.publisher,
                request.amount,
                deployment.address,
            )
            .await?;
        tracing::info!(tx = %receipt.transaction_hash, "same-chain settlement complete");
        Ok(TransferOutcome::SameChain {
            transaction_hash: receipt.transaction_hash,
        })
    }

    /// The four-phase burn-and-mint sequence with persistent state between
    /// burn and redemption.
    async fn settle_cross_chain(
        &self,
        source: Network,
        target: Network,
        request: &TransferRequest,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, TransferError> {
        let deployment = self
            .registry
            .token_deployment(&request.token, request.source_chain_id)?;
        let source_client = self.clients.get(source)?;
        // Resolve the target client before the first write; a missing target
        // chain must not strand pulled funds.
        let target_client = Arc::clone(self.clients.get(target)?);
        let admin = source_client.admin_address();

        // 1. Pull user funds to the admin on the source chain.
        let pull_receipt = self
            .vault_transfer_from(
                source_client,
                request.user,
                admin,
                request.amount,
                deployment.address,
            )
            .await?;
        tracing::debug!(tx = %pull_receipt.transaction_hash, "pulled funds to admin");

        // 2. Approve the burner to spend the admin's balance.
        let approve = IERC20Permit::approveCall {
            spender: source.token_messenger(),
            value: request.amount,
        };
        let approve_receipt = source_client
            .send(AdminCall {
                to: deployment.address,
                calldata: approve.abi_encode().into(),
            })
            .await?;
        tracing::debug!(tx = %approve_receipt.transaction_hash, "approved token messenger");

        // 3. Burn toward the destination domain.
        let burn = ITokenMessenger::depositForBurnCall {
            amount: request.amount,
            destinationDomain: target.destination_domain(),
            mintRecipient: B256::left_padding_from(request.publisher.as_slice()),
            burnToken: deployment.address,
            hookData: B256::ZERO,
            maxFee: max_fee(request.amount),
            finalityThreshold: request.transfer_type.finality_threshold(),
        };
        let burn_receipt = source_client
            .send(AdminCall {
                to: source.token_messenger(),
                calldata: burn.abi_encode().into(),
            })
            .await?;
        let source_tx = burn_receipt.transaction_hash;

        // 4. Extract the message hash and persist the in-flight record. From
        // here on the transfer is recoverable across a crash.
        let message_hash =
            message_sent_hash(&burn_receipt).ok_or(TransferError::MissingMessageHash {
                transaction: source_tx,
            })?;
        let payment = CrossChainPayment {
            id: new_id("ccp"),
            user_id: request.user_id.clone(),
            agent_id: request.agent_id.clone(),
            source_chain_id: request.source_chain_id,
            target_chain_id: request.payout_chain_id,
            amount: request.amount,
            token: request.token.clone(),
            message_hash,
            source_transaction_hash: source_tx,
            target_transaction_hash: None,
            attestation_status: AttestationStatus::Pending,
            permit_id: request.permit_id.clone(),
            created_at: now_millis(),
            completed_at: None,
            error_message: None,
        };
        let payment = self.store.create_cross_chain_payment(payment).await?;
        tracing::info!(payment = %payment.id, message_hash = %message_hash, tx = %source_tx, "burn complete, awaiting attestation");

        // 5. Wait for the attestation authority.
        let query = AttestationQuery::SourceTx {
            source_domain: source.destination_domain(),
            transaction_hash: source_tx,
        };
        let attestation = match self.attestation.wait(query, cancel).await {
            Ok(attestation) => attestation,
            Err(AttestationError::Cancelled) => {
                // Cancellation leaves the record pending for a reconciler.
                return Err(AttestationError::Cancelled.into());
            }
            Err(e) => {
                self.mark_failed(&payment.id, &e.to_string()).await;
                return Err(e.into());
            }
        };

        // 6. Redeem on the target chain.
        let redeem_receipt = match self
            .redeem(&target_client, target, &attestation)
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                self.mark_failed(&payment.id, &e.to_string()).await;
                return Err(e.into());
            }
        };
        let target_tx = redeem_receipt.transaction_hash;

        // 7. Finalize the record.
        self.store
            .update_cross_chain_payment(
                &payment.id,
                CrossChainPaymentPatch {
                    attestation_status: Some(AttestationStatus::Complete),
                    target_transaction_hash: Some(target_tx),
                    completed_at: Some(now_millis()),
                    error_message: None,
                },
            )
            .await?;
        tracing::info!(payment = %payment.id, tx = %target_tx, "cross-chain settlement complete");

        Ok(TransferOutcome::CrossChain {
            payment_id: payment.id,
            message_hash,
            source_tx,
            target_tx,
        })
    }

    async fn vault_transfer_from(
        &self,
        client: &Arc<ChainClient>,
        from: Address,
        to: Address,
        amount: U256,
        token: Address,
    ) -> Result<TransactionReceipt, TransferError> {
        let call = IAllowanceVault::transferFromCall {
            from,
            to,
            amount: u256_to_u160(amount)?,
            token,
        };
        let receipt = client
            .send(AdminCall {
                to: ALLOWANCE_VAULT_ADDRESS,
                calldata: call.abi_encode().into(),
            })
            .await?;
        Ok(receipt)
    }

    async fn redeem(
        &self,
        client: &Arc<ChainClient>,
        target: Network,
        attestation: &Attestation,
    ) -> Result<TransactionReceipt, ChainClientError> {
        let call = IMessageTransmitter::receiveMessageCall {
            message: attestation.message.clone(),
            attestation: attestation.attestation.clone(),
        };
        client
            .send(AdminCall {
                to: target.message_transmitter(),
                calldata: call.abi_encode().into(),
            })
            .await
    }

    /// Best-effort terminal failure mark; the original error wins over a
    /// store failure here.
    async fn mark_failed(&self, payment_id: &str, message: &str) {
        let patch = CrossChainPaymentPatch {
            attestation_status: Some(AttestationStatus::Failed),
            error_message: Some(message.to_string()),
            ..Default::default()
        };
        if let Err(e) = self.store.update_cross_chain_payment(payment_id, patch).await {
            tracing::error!(payment = %payment_id, error = %e, "failed to mark cross-chain payment failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Bytes;

    fn usdc() -> TokenSymbol {
        TokenSymbol::usdc()
    }

    fn pyusd() -> TokenSymbol {
        TokenSymbol::new("PYUSD")
    }

    #[test]
    fn cross_chain_predicate_is_strict() {
        // Same token, same chain: stays local.
        assert!(!needs_cross_chain(&usdc(), 84532, &usdc(), 84532));
        // Differing chain forces a route change even for the same token.
        assert!(needs_cross_chain(&usdc(), 11155111, &usdc(), 84532));
        // Differing token forces a route change even on the same chain.
        assert!(needs_cross_chain(&pyusd(), 1, &usdc(), 1));
    }

    #[test]
    fn same_chain_route_for_matching_preferences() {
        let route = plan_route(&usdc(), 84532, &usdc(), 84532).unwrap();
        assert_eq!(
            route,
            Route::SameChain {
                network: Network::BaseSepolia
            }
        );
    }

    #[test]
    fn cross_chain_route_for_usdc() {
        let route = plan_route(&usdc(), 11155111, &usdc(), 84532).unwrap();
        assert_eq!(
            route,
            Route::CrossChain {
                source: Network::EthereumSepolia,
                target: Network::BaseSepolia,
            }
        );
    }

    #[test]
    fn non_usdc_cross_chain_is_rejected_before_any_write() {
        let result = plan_route(&pyusd(), 11155111, &pyusd(), 84532);
        assert!(matches!(
            result,
            Err(TransferError::UnsupportedRoute { source_chain: 11155111, target: 84532, .. })
        ));
    }

    #[test]
    fn unsupported_chain_fails_route_planning() {
        assert!(matches!(
            plan_route(&usdc(), 42, &usdc(), 84532),
            Err(TransferError::Registry(RegistryError::UnsupportedChain(42)))
        ));
    }

    #[test]
    fn max_fee_is_half_a_percent() {
        assert_eq!(max_fee(U256::from(100_000u64)), U256::from(500u64));
        assert_eq!(max_fee(U256::from(1_000u64)), U256::from(5u64));
    }

    #[test]
    fn finality_thresholds() {
        assert_eq!(TransferType::Fast.finality_threshold(), 1000);
        assert_eq!(TransferType::Standard.finality_threshold(), 2000);
        assert_eq!(TransferType::default(), TransferType::Standard);
    }

    #[test]
    fn message_hash_is_keccak_of_event_data() {
        let payload = Bytes::from(vec![0x01, 0x02, 0x03, 0x04]);
        let matching = LogData::new_unchecked(vec![MESSAGE_SENT_TOPIC], payload.clone());
        let other = LogData::new_unchecked(vec![B256::repeat_byte(0x77)], Bytes::new());

        let logs = [other, matching];
        let hash = extract_message_hash(logs.iter()).unwrap();
        assert_eq!(hash, keccak256(&payload));
    }

    #[test]
    fn missing_message_sent_event_yields_none() {
        let other = LogData::new_unchecked(vec![B256::repeat_byte(0x77)], Bytes::new());
        let logs = [other];
        assert_eq!(extract_message_hash(logs.iter()), None);
    }
}
