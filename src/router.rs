//! Per-request orchestration: authenticate, pre-authorize, forward, settle.
//!
//! The router is the only component that composes the others. One metered
//! call flows through six steps: authenticate the API key, check the
//! subscription, pre-authorize (free trial or permit selection plus on-chain
//! validation), forward to the publisher, log the call unconditionally, and
//! settle billing only on publisher success. Free-trial and paid accounting
//! are mutually exclusive per call, and a permit's usage counter moves only
//! after terminal transfer success.

use alloy_primitives::{Address, TxHash, U256};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::chain::ChainClients;
use crate::codec::{SignatureRsv, TokenPermitSig, vault_permit_message};
use crate::error::RouterError;
use crate::network::{ChainRegistry, TokenSymbol};
use crate::selector::select_permit;
use crate::store::Store;
use crate::submitter::PermitSubmitter;
use crate::timestamp::{UnixTimestamp, now_millis};
use crate::transfer::{TransferEngine, TransferRequest, TransferType, plan_route};
use crate::types::{
    Agent, ApiCallLog, Payment, PaymentStatus, Permit, PermitStatus, Subscription,
    SubscriptionStatus, User, new_id, units_to_usd,
};
use crate::validator::ChainValidator;

/// Version string advertised to publishers in forwarded metadata.
pub const ROUTER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Inbound body of `POST /v1/router/{agentId}`.
#[derive(Debug, Clone, Deserialize)]
pub struct RouterRequest {
    pub method: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    FreeTrial,
    Paid,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Billing {
    pub call_type: CallType,
    pub cost_usd: Decimal,
    pub free_trials_remaining: u32,
    /// Remaining spendable USD value across the user's usable permits.
    pub balance_after_call: Decimal,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    pub request_id: String,
    pub agent_id: String,
    pub timestamp: u64,
}

/// Outbound body of a successful routed call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterResponse {
    pub success: bool,
    pub data: serde_json::Value,
    pub billing: Billing,
    pub metadata: ResponseMetadata,
}

/// Inbound body of `POST /permits`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePermitRequest {
    pub user_address: Address,
    #[serde(default)]
    pub agent_id: Option<String>,
    pub token: TokenSymbol,
    pub chain_id: u64,
    pub amount: U256,
    pub nonce: u64,
    pub deadline: u64,
    pub signature: SignatureRsv,
    #[serde(default)]
    pub token_permit_sig: Option<TokenPermitSig>,
    pub cost_per_call: Decimal,
}

/// Inbound body of `POST /permits/revoke`: a zero-amount permit over the same
/// `(user, token, chain, spender)` tuple.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokePermitRequest {
    pub user_address: Address,
    pub token: TokenSymbol,
    pub chain_id: u64,
    pub nonce: u64,
    pub deadline: u64,
    pub signature: SignatureRsv,
}

/// A stored permit plus the transactions its submission produced.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermitSubmission {
    pub permit: Permit,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_permit_tx: Option<TxHash>,
    pub vault_permit_tx: TxHash,
}

/// Health report for the service surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub version: &'static str,
    pub admin_address: Address,
    pub networks: Vec<String>,
}

/// How a pre-authorized call will be billed.
enum CallPlan {
    FreeTrial,
    Paid(PaidPlan),
}

struct PaidPlan {
    permit: Permit,
    cost_usd: Decimal,
    cost_units: U256,
}

/// Top-level per-request orchestrator.
#[derive(Clone)]
pub struct PaymentRouter {
    store: Arc<dyn Store>,
    registry: Arc<ChainRegistry>,
    clients: Arc<ChainClients>,
    engine: TransferEngine,
    submitter: PermitSubmitter,
    publisher_http: reqwest::Client,
    admin_address: Address,
    shutdown: CancellationToken,
}

impl PaymentRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ChainRegistry>,
        clients: Arc<ChainClients>,
        engine: TransferEngine,
        submitter: PermitSubmitter,
        admin_address: Address,
        publisher_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Result<Self, RouterError> {
        let publisher_http = reqwest::Client::builder()
            .timeout(publisher_timeout)
            .build()
            .map_err(|e| RouterError::Configuration(e.to_string()))?;
        Ok(Self {
            store,
            registry,
            clients,
            engine,
            submitter,
            publisher_http,
            admin_address,
            shutdown,
        })
    }

    pub fn health(&self) -> HealthResponse {
        HealthResponse {
            version: ROUTER_VERSION,
            admin_address: self.admin_address,
            networks: self.clients.networks().map(|n| n.to_string()).collect(),
        }
    }

    /// Route one metered API call end to end.
    #[instrument(skip_all, err, fields(agent = %agent_id))]
    pub async fn handle_call(
        &self,
        api_key: Option<&str>,
        agent_id: &str,
        request: RouterRequest,
    ) -> Result<RouterResponse, RouterError> {
        let user = self.authenticate(api_key).await?;
        let agent = self
            .store
            .agent(agent_id)
            .await?
            .ok_or_else(|| RouterError::AgentNotFound(agent_id.to_string()))?;
        let subscription = self
            .store
            .subscription(&user.id, &agent.id)
            .await?
            .filter(|s| s.status == SubscriptionStatus::Active)
            .ok_or(RouterError::SubscriptionRequired)?;

        let plan = self.pre_authorize(&user, &agent, &subscription).await?;

        let request_id = new_id("req");
        let api_call_id = new_id("call");
        let request_timestamp = now_millis();
        let forwarded = self.forward(&agent, &request).await;

        let planned_cost = match &plan {
            CallPlan::FreeTrial => Decimal::ZERO,
            CallPlan::Paid(paid) => paid.cost_usd,
        };
        self.log_call(
            &user,
            &agent,
            &api_call_id,
            &plan,
            planned_cost,
            request_timestamp,
            &forwarded,
        )
        .await?;
        let data = forwarded?;

        let billing = match plan {
            CallPlan::FreeTrial => {
                let updated = self
                    .store
                    .update_subscription_usage(&subscription.id, true)
                    .await?;
                Billing {
                    call_type: CallType::FreeTrial,
                    cost_usd: Decimal::ZERO,
                    free_trials_remaining: updated.free_trials_remaining,
                    balance_after_call: self.spendable_balance(&user).await?,
                }
            }
            CallPlan::Paid(paid) => {
                self.settle_paid(&user, &agent, &subscription, &paid, &api_call_id)
                    .await?;
                Billing {
                    call_type: CallType::Paid,
                    cost_usd: paid.cost_usd,
                    free_trials_remaining: subscription.free_trials_remaining,
                    balance_after_call: self.spendable_balance(&user).await?,
                }
            }
        };

        Ok(RouterResponse {
            success: true,
            data,
            billing,
            metadata: ResponseMetadata {
                request_id,
                agent_id: agent.id,
                timestamp: now_millis(),
            },
        })
    }

    async fn authenticate(&self, api_key: Option<&str>) -> Result<User, RouterError> {
        let api_key = api_key.ok_or(RouterError::Unauthorized)?;
        let user = self
            .store
            .user_by_api_key(api_key)
            .await?
            .ok_or(RouterError::Unauthorized)?;
        if !user.is_approved {
            return Err(RouterError::Unauthorized);
        }
        Ok(user)
    }

    /// Decide how the call will be paid for before anything leaves the
    /// process: free trials short-circuit all on-chain work; paid calls pick
    /// a permit and validate balance, allowance, and route.
    async fn pre_authorize(
        &self,
        user: &User,
        agent: &Agent,
        subscription: &Subscription,
    ) -> Result<CallPlan, RouterError> {
        if subscription.free_trials_remaining > 0 {
            return Ok(CallPlan::FreeTrial);
        }

        let cost_usd = agent.price_per_call_usd;
        let cost_units = agent
            .price_units()
            .ok_or_else(|| RouterError::Internal("agent price is not representable".to_string()))?;

        let permits = self.store.permits_by_user(user.wallet_address).await?;
        let now = now_millis();
        let any_usable = permits.iter().any(|p| p.is_usable(now));
        let permit = match select_permit(&permits, agent, cost_usd, now) {
            Some(permit) => permit.clone(),
            None if any_usable => return Err(RouterError::InsufficientPermitBalance),
            None => return Err(RouterError::NoValidPermits),
        };

        // An impossible route must fail before the publisher is called.
        plan_route(
            &permit.token,
            permit.chain_id,
            &agent.payment_preferences.payout_token,
            agent.payment_preferences.payout_chain_id,
        )?;

        let deployment = self
            .registry
            .token_deployment(&permit.token, permit.chain_id)?;
        let client = self.clients.by_chain_id(permit.chain_id)?;
        let validator = ChainValidator::new(Arc::clone(client));

        let balance = validator
            .check_balance(deployment.address, user.wallet_address, cost_units)
            .await?;
        if !balance.sufficient() {
            return Err(RouterError::InsufficientBalance {
                balance: balance.balance,
                required: balance.required,
            });
        }

        let allowance = validator
            .check_vault_allowance(
                user.wallet_address,
                deployment.address,
                permit.spender_address,
                cost_units,
            )
            .await?;
        if !allowance.valid_at(UnixTimestamp::now()) {
            return Err(RouterError::InsufficientAllowance);
        }

        Ok(CallPlan::Paid(PaidPlan {
            permit,
            cost_usd,
            cost_units,
        }))
    }

    /// POST the call to the publisher's endpoint. Returns the downstream JSON
    /// on 2xx; classifies timeouts and non-2xx into the error taxonomy.
    async fn forward(
        &self,
        agent: &Agent,
        request: &RouterRequest,
    ) -> Result<serde_json::Value, RouterError> {
        let body = serde_json::json!({
            "method": request.method,
            "parameters": request.parameters,
            "metadata": {
                "router_version": ROUTER_VERSION,
                "agent_id": agent.id,
            },
        });
        let response = self
            .publisher_http
            .post(agent.api_endpoint.clone())
            .bearer_auth(&agent.publisher_api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RouterError::PublisherTimeout
                } else {
                    tracing::warn!(error = %e, "publisher call failed");
                    RouterError::ApiCallFailed { status: None }
                }
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(RouterError::ApiCallFailed {
                status: Some(status.as_u16()),
            });
        }
        let data = response
            .json::<serde_json::Value>()
            .await
            .unwrap_or(serde_json::Value::Null);
        Ok(data)
    }

    /// The unconditional call log. Written whether or not the publisher call
    /// succeeded, before settlement starts.
    #[allow(clippy::too_many_arguments)]
    async fn log_call(
        &self,
        user: &User,
        agent: &Agent,
        api_call_id: &str,
        plan: &CallPlan,
        planned_cost: Decimal,
        request_timestamp: u64,
        forwarded: &Result<serde_json::Value, RouterError>,
    ) -> Result<(), RouterError> {
        let response_timestamp = now_millis();
        let (http_status, charged) = match forwarded {
            Ok(_) => (200u16, planned_cost),
            Err(RouterError::ApiCallFailed { status }) => (status.unwrap_or(0), Decimal::ZERO),
            Err(_) => (0, Decimal::ZERO),
        };
        let log = ApiCallLog {
            id: api_call_id.to_string(),
            user_id: user.id.clone(),
            agent_id: agent.id.clone(),
            request_timestamp,
            response_timestamp,
            http_status,
            response_time_ms: response_timestamp.saturating_sub(request_timestamp),
            is_free_trial: matches!(plan, CallPlan::FreeTrial),
            charged_amount_usd: charged,
            payment_id: None,
        };
        self.store.log_api_call(log).await?;
        Ok(())
    }

    /// Paid settlement: drive the transfer engine, then move the accounting
    /// counters only after terminal success.
    async fn settle_paid(
        &self,
        user: &User,
        agent: &Agent,
        subscription: &Subscription,
        paid: &PaidPlan,
        api_call_id: &str,
    ) -> Result<(), RouterError> {
        let transfer = TransferRequest {
            user: user.wallet_address,
            user_id: user.id.clone(),
            agent_id: agent.id.clone(),
            publisher: agent.publisher_wallet_address,
            amount: paid.cost_units,
            token: paid.permit.token.clone(),
            source_chain_id: paid.permit.chain_id,
            payout_token: agent.payment_preferences.payout_token.clone(),
            payout_chain_id: agent.payment_preferences.payout_chain_id,
            permit_id: paid.permit.id.clone(),
            transfer_type: TransferType::Standard,
        };
        let outcome = self
            .engine
            .execute(&transfer, &self.shutdown.child_token())
            .await?;

        self.store
            .update_permit_usage(&paid.permit.id, paid.permit.calls_used + 1)
            .await?;
        self.store
            .update_subscription_usage(&subscription.id, false)
            .await?;
        let payment = Payment {
            id: new_id("pay"),
            user_id: user.id.clone(),
            agent_id: agent.id.clone(),
            amount: paid.cost_units,
            token: paid.permit.token.clone(),
            chain_id: paid.permit.chain_id,
            transaction_hash: outcome.transaction_hash(),
            status: PaymentStatus::Completed,
            api_call_id: api_call_id.to_string(),
            message_hash: outcome.message_hash(),
            cross_chain_payment_id: outcome.cross_chain_payment_id().map(str::to_string),
            created_at: now_millis(),
        };
        self.store.create_payment(payment).await?;
        Ok(())
    }

    /// Remaining spendable USD across the user's usable permits.
    async fn spendable_balance(&self, user: &User) -> Result<Decimal, RouterError> {
        let permits = self.store.permits_by_user(user.wallet_address).await?;
        let now = now_millis();
        Ok(permits
            .iter()
            .filter(|p| p.is_usable(now))
            .map(|p| p.remaining_value())
            .sum())
    }

    /// Create, store, and submit a new permit.
    ///
    /// Signature validation is mandatory: the vault permit signature must
    /// recover to the stated user address before anything is stored. The
    /// permit is stored before submission, so a stale-nonce rejection leaves
    /// the record behind (it is filtered out at validation time).
    #[instrument(skip_all, err, fields(user = %request.user_address, chain = request.chain_id))]
    pub async fn create_permit(
        &self,
        request: CreatePermitRequest,
    ) -> Result<PermitSubmission, RouterError> {
        let deployment = self
            .registry
            .token_deployment(&request.token, request.chain_id)?;

        let message = vault_permit_message(
            request.chain_id,
            deployment.address,
            request.amount,
            request.nonce,
            request.deadline,
            self.admin_address,
        )?;
        message.verify_signer(&request.signature, request.user_address)?;

        if request.cost_per_call <= Decimal::ZERO {
            return Err(RouterError::InvalidParameters(
                "costPerCall must be positive".to_string(),
            ));
        }
        let amount_usd = units_to_usd(request.amount);
        let max_calls = (amount_usd / request.cost_per_call)
            .floor()
            .to_u64()
            .ok_or_else(|| {
                RouterError::InvalidParameters("maxCalls is not representable".to_string())
            })?;

        let now = now_millis();
        let permit = Permit {
            id: new_id("permit"),
            user_address: request.user_address,
            agent_id: request.agent_id,
            token: request.token,
            chain_id: request.chain_id,
            spender_address: self.admin_address,
            amount: request.amount,
            nonce: request.nonce,
            deadline: request.deadline,
            signature: request.signature,
            token_permit_sig: request.token_permit_sig,
            status: PermitStatus::Active,
            created_at: now,
            expires_at: request.deadline.saturating_mul(1000),
            max_calls,
            calls_used: 0,
            cost_per_call: request.cost_per_call,
        };
        let permit = self.store.create_permit(permit).await?;

        let outcome = self.submitter.submit(&permit).await?;
        Ok(PermitSubmission {
            permit,
            token_permit_tx: outcome.token_permit_tx,
            vault_permit_tx: outcome.vault_permit_tx,
        })
    }

    pub async fn list_permits(
        &self,
        user: Address,
        status: Option<PermitStatus>,
    ) -> Result<Vec<Permit>, RouterError> {
        let permits = self.store.permits_by_user(user).await?;
        Ok(match status {
            Some(status) => permits.into_iter().filter(|p| p.status == status).collect(),
            None => permits,
        })
    }

    pub async fn update_permit_status(
        &self,
        id: &str,
        status: PermitStatus,
    ) -> Result<Permit, RouterError> {
        if self.store.permit(id).await?.is_none() {
            return Err(RouterError::PermitNotFound(id.to_string()));
        }
        Ok(self.store.update_permit_status(id, status).await?)
    }

    /// Execute a revocation: a signed zero-amount vault permit. Supersedes
    /// any active permit for the tuple locally and zeroes the allowance
    /// on-chain.
    #[instrument(skip_all, err, fields(user = %request.user_address, chain = request.chain_id))]
    pub async fn revoke_permit(
        &self,
        request: RevokePermitRequest,
    ) -> Result<PermitSubmission, RouterError> {
        let deployment = self
            .registry
            .token_deployment(&request.token, request.chain_id)?;

        let message = vault_permit_message(
            request.chain_id,
            deployment.address,
            U256::ZERO,
            request.nonce,
            request.deadline,
            self.admin_address,
        )?;
        message.verify_signer(&request.signature, request.user_address)?;

        let now = now_millis();
        // The revocation permit authorizes nothing; it is stored as a revoked
        // tombstone while superseding the active permit for the tuple.
        let permit = Permit {
            id: new_id("permit"),
            user_address: request.user_address,
            agent_id: None,
            token: request.token,
            chain_id: request.chain_id,
            spender_address: self.admin_address,
            amount: U256::ZERO,
            nonce: request.nonce,
            deadline: request.deadline,
            signature: request.signature,
            token_permit_sig: None,
            status: PermitStatus::Revoked,
            created_at: now,
            expires_at: request.deadline.saturating_mul(1000),
            max_calls: 0,
            calls_used: 0,
            cost_per_call: Decimal::ZERO,
        };
        let permit = self.store.create_permit(permit).await?;

        let outcome = self.submitter.submit(&permit).await?;
        Ok(PermitSubmission {
            permit,
            token_permit_tx: outcome.token_permit_tx,
            vault_permit_tx: outcome.vault_permit_tx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::AttestationClient;
    use crate::network::TokenSymbol;
    use crate::store::MemoryStore;
    use crate::types::{PaymentPreferences, test_permit};
    use axum::http::StatusCode;
    use std::collections::HashMap;
    use std::str::FromStr;
    use url::Url;

    fn test_store_and_router() -> (Arc<MemoryStore>, PaymentRouter) {
        let store = Arc::new(MemoryStore::new());
        let dyn_store: Arc<dyn Store> = store.clone();
        let registry = Arc::new(ChainRegistry::new(HashMap::new()));
        let clients = Arc::new(ChainClients::default());
        let attestation = AttestationClient::new(
            Url::parse("https://iris-api-sandbox.circle.com").unwrap(),
            Duration::from_secs(1),
        )
        .unwrap();
        let engine = TransferEngine::new(
            Arc::clone(&clients),
            Arc::clone(&registry),
            Arc::clone(&dyn_store),
            attestation,
        );
        let submitter = PermitSubmitter::new(Arc::clone(&clients), Arc::clone(&registry));
        let router = PaymentRouter::new(
            dyn_store,
            registry,
            clients,
            engine,
            submitter,
            Address::repeat_byte(0xad),
            Duration::from_secs(2),
            CancellationToken::new(),
        )
        .unwrap();
        (store, router)
    }

    fn test_user(approved: bool) -> User {
        User {
            id: "user_1".to_string(),
            api_key: "sk_test_1".to_string(),
            wallet_address: Address::repeat_byte(0xaa),
            is_approved: approved,
        }
    }

    fn test_agent(endpoint: Url) -> Agent {
        Agent {
            id: "agent_1".to_string(),
            name: "echo".to_string(),
            price_per_call_usd: Decimal::from_str("0.10").unwrap(),
            payment_preferences: PaymentPreferences {
                payout_token: TokenSymbol::usdc(),
                payout_chain_id: 84532,
            },
            publisher_wallet_address: Address::repeat_byte(0xbb),
            api_endpoint: endpoint,
            publisher_api_key: "pk_publisher".to_string(),
            free_trial_tries: 3,
        }
    }

    fn test_subscription(free_trials: u32) -> Subscription {
        Subscription {
            id: "sub_1".to_string(),
            user_id: "user_1".to_string(),
            agent_id: "agent_1".to_string(),
            status: SubscriptionStatus::Active,
            free_trials_remaining: free_trials,
            free_trials_used: 0,
            total_paid_calls: 0,
            created_at: 0,
        }
    }

    fn call_request() -> RouterRequest {
        RouterRequest {
            method: "echo".to_string(),
            parameters: serde_json::json!({"text": "hi"}),
            metadata: None,
        }
    }

    fn unused_endpoint() -> Url {
        Url::parse("http://127.0.0.1:9/").unwrap()
    }

    async fn spawn_publisher(status: StatusCode, body: serde_json::Value) -> Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().route(
            "/",
            axum::routing::post(move || {
                let body = body.clone();
                async move { (status, axum::Json(body)) }
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Url::parse(&format!("http://{addr}/")).unwrap()
    }

    #[tokio::test]
    async fn rejects_missing_and_unknown_api_keys() {
        let (_store, router) = test_store_and_router();
        let result = router.handle_call(None, "agent_1", call_request()).await;
        assert!(matches!(result, Err(RouterError::Unauthorized)));

        let result = router
            .handle_call(Some("sk_unknown"), "agent_1", call_request())
            .await;
        assert!(matches!(result, Err(RouterError::Unauthorized)));
    }

    #[tokio::test]
    async fn rejects_unapproved_users() {
        let (store, router) = test_store_and_router();
        store.upsert_user(test_user(false)).await.unwrap();
        let result = router
            .handle_call(Some("sk_test_1"), "agent_1", call_request())
            .await;
        assert!(matches!(result, Err(RouterError::Unauthorized)));
    }

    #[tokio::test]
    async fn unknown_agent_is_not_found() {
        let (store, router) = test_store_and_router();
        store.upsert_user(test_user(true)).await.unwrap();
        let result = router
            .handle_call(Some("sk_test_1"), "agent_missing", call_request())
            .await;
        assert!(matches!(result, Err(RouterError::AgentNotFound(_))));
    }

    #[tokio::test]
    async fn subscription_is_required() {
        let (store, router) = test_store_and_router();
        store.upsert_user(test_user(true)).await.unwrap();
        store
            .upsert_agent(test_agent(unused_endpoint()))
            .await
            .unwrap();
        let result = router
            .handle_call(Some("sk_test_1"), "agent_1", call_request())
            .await;
        assert!(matches!(result, Err(RouterError::SubscriptionRequired)));

        let mut cancelled = test_subscription(3);
        cancelled.status = SubscriptionStatus::Cancelled;
        store.upsert_subscription(cancelled).await.unwrap();
        let result = router
            .handle_call(Some("sk_test_1"), "agent_1", call_request())
            .await;
        assert!(matches!(result, Err(RouterError::SubscriptionRequired)));
    }

    #[tokio::test]
    async fn free_trial_settles_without_chain_work() {
        let (store, router) = test_store_and_router();
        let endpoint = spawn_publisher(StatusCode::OK, serde_json::json!({"echo": "hi"})).await;
        store.upsert_user(test_user(true)).await.unwrap();
        store.upsert_agent(test_agent(endpoint)).await.unwrap();
        store
            .upsert_subscription(test_subscription(3))
            .await
            .unwrap();

        let response = router
            .handle_call(Some("sk_test_1"), "agent_1", call_request())
            .await
            .unwrap();

        assert!(response.success);
        assert_eq!(response.billing.call_type, CallType::FreeTrial);
        assert_eq!(response.billing.cost_usd, Decimal::ZERO);
        assert_eq!(response.billing.free_trials_remaining, 2);
        assert_eq!(response.data, serde_json::json!({"echo": "hi"}));

        let subscription = store
            .subscription("user_1", "agent_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(subscription.free_trials_remaining, 2);
        assert_eq!(subscription.free_trials_used, 1);
        assert_eq!(subscription.total_paid_calls, 0);
    }

    #[tokio::test]
    async fn publisher_failure_does_not_consume_a_trial() {
        let (store, router) = test_store_and_router();
        let endpoint =
            spawn_publisher(StatusCode::INTERNAL_SERVER_ERROR, serde_json::json!({})).await;
        store.upsert_user(test_user(true)).await.unwrap();
        store.upsert_agent(test_agent(endpoint)).await.unwrap();
        store
            .upsert_subscription(test_subscription(3))
            .await
            .unwrap();

        let result = router
            .handle_call(Some("sk_test_1"), "agent_1", call_request())
            .await;
        assert!(matches!(
            result,
            Err(RouterError::ApiCallFailed { status: Some(500) })
        ));

        let subscription = store
            .subscription("user_1", "agent_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(subscription.free_trials_remaining, 3);
        assert_eq!(subscription.free_trials_used, 0);
    }

    #[tokio::test]
    async fn paid_call_without_permits_is_rejected_before_forwarding() {
        let (store, router) = test_store_and_router();
        store.upsert_user(test_user(true)).await.unwrap();
        // Endpoint would refuse connections; pre-authorization must fail first.
        store
            .upsert_agent(test_agent(unused_endpoint()))
            .await
            .unwrap();
        store
            .upsert_subscription(test_subscription(0))
            .await
            .unwrap();

        let result = router
            .handle_call(Some("sk_test_1"), "agent_1", call_request())
            .await;
        assert!(matches!(result, Err(RouterError::NoValidPermits)));
    }

    #[tokio::test]
    async fn exhausted_permit_value_is_a_payment_error() {
        let (store, router) = test_store_and_router();
        store.upsert_user(test_user(true)).await.unwrap();
        store
            .upsert_agent(test_agent(unused_endpoint()))
            .await
            .unwrap();
        store
            .upsert_subscription(test_subscription(0))
            .await
            .unwrap();
        let mut permit = test_permit();
        permit.calls_used = permit.max_calls - 1;
        permit.cost_per_call = Decimal::from_str("0.05").unwrap(); // 0.05 left, price 0.10
        store.create_permit(permit).await.unwrap();

        let result = router
            .handle_call(Some("sk_test_1"), "agent_1", call_request())
            .await;
        assert!(matches!(result, Err(RouterError::InsufficientPermitBalance)));
    }
}
