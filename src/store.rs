//! Persistent state: permits, subscriptions, payments, and call logs.
//!
//! The [`Store`] trait is the ownership boundary: nothing outside it mutates
//! these entities. The in-process implementation backs the maps with
//! [`DashMap`]s (status and usage updates are atomic per record under the
//! map's entry lock) and can mirror itself into a JSON snapshot file, which
//! stands in for a real transactional KV without changing the interface.
//!
//! Billing durability is carried by idempotency rather than multi-row
//! transactions: a payment is keyed by its `api_call_id`, so a retried
//! settlement can never double-charge.

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::instrument;

use crate::types::{
    Agent, ApiCallLog, AttestationStatus, CrossChainPayment, Payment, Permit, PermitStatus,
    Subscription, User,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("permit {0} not found")]
    PermitNotFound(String),
    #[error("subscription {0} not found")]
    SubscriptionNotFound(String),
    #[error("cross-chain payment {0} not found")]
    CrossChainPaymentNotFound(String),
    #[error("usage counter may not decrease ({current} -> {requested})")]
    NonMonotonicUsage { current: u64, requested: u64 },
    #[error("usage {requested} exceeds permit maxCalls {max_calls}")]
    UsageExceedsMax { requested: u64, max_calls: u64 },
    #[error("no free trials remaining on subscription {0}")]
    NoFreeTrialsRemaining(String),
    #[error("failed to persist store snapshot: {0}")]
    Snapshot(String),
}

/// Partial update applied to a [`CrossChainPayment`] as it moves through the
/// settlement state machine.
#[derive(Debug, Clone, Default)]
pub struct CrossChainPaymentPatch {
    pub attestation_status: Option<AttestationStatus>,
    pub target_transaction_hash: Option<B256>,
    pub completed_at: Option<u64>,
    pub error_message: Option<String>,
}

/// The single shared writable resource of the router.
#[async_trait]
pub trait Store: Send + Sync {
    /// Persist a new permit, superseding any currently active permit for the
    /// same `(user, token, chain)`. Superseded permits are marked revoked and
    /// retained for audit.
    async fn create_permit(&self, permit: Permit) -> Result<Permit, StoreError>;
    async fn permit(&self, id: &str) -> Result<Option<Permit>, StoreError>;
    async fn permits_by_user(&self, user: Address) -> Result<Vec<Permit>, StoreError>;
    async fn update_permit_status(
        &self,
        id: &str,
        status: PermitStatus,
    ) -> Result<Permit, StoreError>;
    /// Set the permit's usage counter. Monotone: the new value may not be
    /// lower than the current one nor exceed `maxCalls`.
    async fn update_permit_usage(&self, id: &str, calls_used: u64) -> Result<Permit, StoreError>;

    async fn user_by_api_key(&self, api_key: &str) -> Result<Option<User>, StoreError>;
    async fn agent(&self, id: &str) -> Result<Option<Agent>, StoreError>;
    async fn subscription(
        &self,
        user_id: &str,
        agent_id: &str,
    ) -> Result<Option<Subscription>, StoreError>;
    /// Apply per-call subscription accounting. Exactly one of the free-trial
    /// counters or the paid-call counter moves, never both.
    async fn update_subscription_usage(
        &self,
        id: &str,
        was_free_trial: bool,
    ) -> Result<Subscription, StoreError>;

    /// Record a payment. Idempotent on `api_call_id`: a payment already
    /// recorded for the same call is returned unchanged.
    async fn create_payment(&self, payment: Payment) -> Result<Payment, StoreError>;
    async fn payment_by_api_call(&self, api_call_id: &str)
    -> Result<Option<Payment>, StoreError>;
    async fn create_cross_chain_payment(
        &self,
        payment: CrossChainPayment,
    ) -> Result<CrossChainPayment, StoreError>;
    async fn update_cross_chain_payment(
        &self,
        id: &str,
        patch: CrossChainPaymentPatch,
    ) -> Result<CrossChainPayment, StoreError>;
    async fn log_api_call(&self, log: ApiCallLog) -> Result<ApiCallLog, StoreError>;

    async fn upsert_user(&self, user: User) -> Result<(), StoreError>;
    async fn upsert_agent(&self, agent: Agent) -> Result<(), StoreError>;
    async fn upsert_subscription(&self, subscription: Subscription) -> Result<(), StoreError>;
}

/// Serialized shape of the whole store.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Snapshot {
    permits: Vec<Permit>,
    users: Vec<User>,
    agents: Vec<Agent>,
    subscriptions: Vec<Subscription>,
    payments: Vec<Payment>,
    cross_chain_payments: Vec<CrossChainPayment>,
    api_call_logs: Vec<ApiCallLog>,
}

/// Dashmap-backed store with optional JSON snapshot persistence.
#[derive(Debug, Default)]
pub struct MemoryStore {
    permits: DashMap<String, Permit>,
    permit_ids_by_user: DashMap<Address, Vec<String>>,
    users: DashMap<String, User>,
    agents: DashMap<String, Agent>,
    subscriptions: DashMap<String, Subscription>,
    payments: DashMap<String, Payment>,
    payment_ids_by_api_call: DashMap<String, String>,
    cross_chain_payments: DashMap<String, CrossChainPayment>,
    api_call_logs: DashMap<String, ApiCallLog>,
    snapshot_path: Option<PathBuf>,
    /// Guards the supersede-then-insert sequence in `create_permit`.
    creation_lock: Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store persisted at `path`, loading the existing snapshot if one
    /// is present.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut store = if path.exists() {
            let raw = std::fs::read(&path).map_err(|e| StoreError::Snapshot(e.to_string()))?;
            let snapshot: Snapshot =
                serde_json::from_slice(&raw).map_err(|e| StoreError::Snapshot(e.to_string()))?;
            Self::from_snapshot(snapshot)
        } else {
            Self::new()
        };
        store.snapshot_path = Some(path);
        Ok(store)
    }

    fn from_snapshot(snapshot: Snapshot) -> Self {
        let store = Self::new();
        for permit in snapshot.permits {
            store
                .permit_ids_by_user
                .entry(permit.user_address)
                .or_default()
                .push(permit.id.clone());
            store.permits.insert(permit.id.clone(), permit);
        }
        for user in snapshot.users {
            store.users.insert(user.id.clone(), user);
        }
        for agent in snapshot.agents {
            store.agents.insert(agent.id.clone(), agent);
        }
        for subscription in snapshot.subscriptions {
            store
                .subscriptions
                .insert(subscription.id.clone(), subscription);
        }
        for payment in snapshot.payments {
            store
                .payment_ids_by_api_call
                .insert(payment.api_call_id.clone(), payment.id.clone());
            store.payments.insert(payment.id.clone(), payment);
        }
        for payment in snapshot.cross_chain_payments {
            store.cross_chain_payments.insert(payment.id.clone(), payment);
        }
        for log in snapshot.api_call_logs {
            store.api_call_logs.insert(log.id.clone(), log);
        }
        store
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            permits: self.permits.iter().map(|e| e.value().clone()).collect(),
            users: self.users.iter().map(|e| e.value().clone()).collect(),
            agents: self.agents.iter().map(|e| e.value().clone()).collect(),
            subscriptions: self
                .subscriptions
                .iter()
                .map(|e| e.value().clone())
                .collect(),
            payments: self.payments.iter().map(|e| e.value().clone()).collect(),
            cross_chain_payments: self
                .cross_chain_payments
                .iter()
                .map(|e| e.value().clone())
                .collect(),
            api_call_logs: self.api_call_logs.iter().map(|e| e.value().clone()).collect(),
        }
    }

    /// Write the snapshot atomically (temp file then rename) when a path is
    /// configured.
    #[instrument(skip_all, err)]
    fn persist(&self) -> Result<(), StoreError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(&self.snapshot())
            .map_err(|e| StoreError::Snapshot(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes).map_err(|e| StoreError::Snapshot(e.to_string()))?;
        std::fs::rename(&tmp, path).map_err(|e| StoreError::Snapshot(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_permit(&self, permit: Permit) -> Result<Permit, StoreError> {
        let _guard = self.creation_lock.lock().await;
        // Supersede: at most one active permit per (user, token, chain).
        if let Some(ids) = self.permit_ids_by_user.get(&permit.user_address) {
            for id in ids.iter() {
                if let Some(mut existing) = self.permits.get_mut(id) {
                    if existing.status == PermitStatus::Active
                        && existing.token == permit.token
                        && existing.chain_id == permit.chain_id
                    {
                        existing.status = PermitStatus::Revoked;
                        tracing::info!(superseded = %existing.id, by = %permit.id, "permit superseded");
                    }
                }
            }
        }
        self.permit_ids_by_user
            .entry(permit.user_address)
            .or_default()
            .push(permit.id.clone());
        self.permits.insert(permit.id.clone(), permit.clone());
        self.persist()?;
        Ok(permit)
    }

    async fn permit(&self, id: &str) -> Result<Option<Permit>, StoreError> {
        Ok(self.permits.get(id).map(|e| e.value().clone()))
    }

    async fn permits_by_user(&self, user: Address) -> Result<Vec<Permit>, StoreError> {
        let ids = match self.permit_ids_by_user.get(&user) {
            Some(ids) => ids.clone(),
            None => return Ok(Vec::new()),
        };
        Ok(ids
            .iter()
            .filter_map(|id| self.permits.get(id).map(|e| e.value().clone()))
            .collect())
    }

    async fn update_permit_status(
        &self,
        id: &str,
        status: PermitStatus,
    ) -> Result<Permit, StoreError> {
        let updated = {
            let mut entry = self
                .permits
                .get_mut(id)
                .ok_or_else(|| StoreError::PermitNotFound(id.to_string()))?;
            entry.status = status;
            entry.clone()
        };
        self.persist()?;
        Ok(updated)
    }

    async fn update_permit_usage(&self, id: &str, calls_used: u64) -> Result<Permit, StoreError> {
        let updated = {
            let mut entry = self
                .permits
                .get_mut(id)
                .ok_or_else(|| StoreError::PermitNotFound(id.to_string()))?;
            if calls_used < entry.calls_used {
                return Err(StoreError::NonMonotonicUsage {
                    current: entry.calls_used,
                    requested: calls_used,
                });
            }
            if calls_used > entry.max_calls {
                return Err(StoreError::UsageExceedsMax {
                    requested: calls_used,
                    max_calls: entry.max_calls,
                });
            }
            entry.calls_used = calls_used;
            entry.clone()
        };
        self.persist()?;
        Ok(updated)
    }

    async fn user_by_api_key(&self, api_key: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .users
            .iter()
            .find(|e| e.value().api_key == api_key)
            .map(|e| e.value().clone()))
    }

    async fn agent(&self, id: &str) -> Result<Option<Agent>, StoreError> {
        Ok(self.agents.get(id).map(|e| e.value().clone()))
    }

    async fn subscription(
        &self,
        user_id: &str,
        agent_id: &str,
    ) -> Result<Option<Subscription>, StoreError> {
        Ok(self
            .subscriptions
            .iter()
            .find(|e| e.value().user_id == user_id && e.value().agent_id == agent_id)
            .map(|e| e.value().clone()))
    }

    async fn update_subscription_usage(
        &self,
        id: &str,
        was_free_trial: bool,
    ) -> Result<Subscription, StoreError> {
        let updated = {
            let mut entry = self
                .subscriptions
                .get_mut(id)
                .ok_or_else(|| StoreError::SubscriptionNotFound(id.to_string()))?;
            if was_free_trial {
                if entry.free_trials_remaining == 0 {
                    return Err(StoreError::NoFreeTrialsRemaining(id.to_string()));
                }
                entry.free_trials_remaining -= 1;
                entry.free_trials_used += 1;
            } else {
                entry.total_paid_calls += 1;
            }
            entry.clone()
        };
        self.persist()?;
        Ok(updated)
    }

    async fn create_payment(&self, payment: Payment) -> Result<Payment, StoreError> {
        // At-most-once per metered call.
        if let Some(existing_id) = self.payment_ids_by_api_call.get(&payment.api_call_id) {
            if let Some(existing) = self.payments.get(existing_id.value()) {
                return Ok(existing.value().clone());
            }
        }
        self.payment_ids_by_api_call
            .insert(payment.api_call_id.clone(), payment.id.clone());
        self.payments.insert(payment.id.clone(), payment.clone());
        self.persist()?;
        Ok(payment)
    }

    async fn payment_by_api_call(
        &self,
        api_call_id: &str,
    ) -> Result<Option<Payment>, StoreError> {
        Ok(self
            .payment_ids_by_api_call
            .get(api_call_id)
            .and_then(|id| self.payments.get(id.value()).map(|e| e.value().clone())))
    }

    async fn create_cross_chain_payment(
        &self,
        payment: CrossChainPayment,
    ) -> Result<CrossChainPayment, StoreError> {
        self.cross_chain_payments
            .insert(payment.id.clone(), payment.clone());
        self.persist()?;
        Ok(payment)
    }

    async fn update_cross_chain_payment(
        &self,
        id: &str,
        patch: CrossChainPaymentPatch,
    ) -> Result<CrossChainPayment, StoreError> {
        let updated = {
            let mut entry = self
                .cross_chain_payments
                .get_mut(id)
                .ok_or_else(|| StoreError::CrossChainPaymentNotFound(id.to_string()))?;
            if let Some(status) = patch.attestation_status {
                entry.attestation_status = status;
            }
            if let Some(tx) = patch.target_transaction_hash {
                entry.target_transaction_hash = Some(tx);
            }
            if let Some(at) = patch.completed_at {
                entry.completed_at = Some(at);
            }
            if let Some(message) = patch.error_message {
                entry.error_message = Some(message);
            }
            entry.clone()
        };
        self.persist()?;
        Ok(updated)
    }

    async fn log_api_call(&self, log: ApiCallLog) -> Result<ApiCallLog, StoreError> {
        self.api_call_logs.insert(log.id.clone(), log.clone());
        self.persist()?;
        Ok(log)
    }

    async fn upsert_user(&self, user: User) -> Result<(), StoreError> {
        self.users.insert(user.id.clone(), user);
        self.persist()
    }

    async fn upsert_agent(&self, agent: Agent) -> Result<(), StoreError> {
        self.agents.insert(agent.id.clone(), agent);
        self.persist()
    }

    async fn upsert_subscription(&self, subscription: Subscription) -> Result<(), StoreError> {
        self.subscriptions
            .insert(subscription.id.clone(), subscription);
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::TokenSymbol;
    use crate::types::test_permit;
    use crate::types::{PaymentStatus, SubscriptionStatus, new_id};
    use alloy_primitives::U256;
    use rust_decimal::Decimal;

    fn test_subscription(free_trials: u32) -> Subscription {
        Subscription {
            id: new_id("sub"),
            user_id: "user_1".to_string(),
            agent_id: "agent_1".to_string(),
            status: SubscriptionStatus::Active,
            free_trials_remaining: free_trials,
            free_trials_used: 0,
            total_paid_calls: 0,
            created_at: 0,
        }
    }

    fn test_payment(api_call_id: &str) -> Payment {
        Payment {
            id: new_id("pay"),
            user_id: "user_1".to_string(),
            agent_id: "agent_1".to_string(),
            amount: U256::from(100_000u64),
            token: TokenSymbol::usdc(),
            chain_id: 84532,
            transaction_hash: B256::repeat_byte(0x33),
            status: PaymentStatus::Completed,
            api_call_id: api_call_id.to_string(),
            message_hash: None,
            cross_chain_payment_id: None,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn usage_is_monotone_and_bounded() {
        let store = MemoryStore::new();
        let permit = store.create_permit(test_permit()).await.unwrap();

        let updated = store.update_permit_usage(&permit.id, 1).await.unwrap();
        assert_eq!(updated.calls_used, 1);
        let updated = store.update_permit_usage(&permit.id, 5).await.unwrap();
        assert_eq!(updated.calls_used, 5);

        let decrease = store.update_permit_usage(&permit.id, 4).await;
        assert!(matches!(
            decrease,
            Err(StoreError::NonMonotonicUsage { current: 5, requested: 4 })
        ));

        let over = store.update_permit_usage(&permit.id, 101).await;
        assert!(matches!(over, Err(StoreError::UsageExceedsMax { .. })));
    }

    #[tokio::test]
    async fn payments_are_at_most_once_per_api_call() {
        let store = MemoryStore::new();
        let first = store.create_payment(test_payment("call_1")).await.unwrap();
        let second = store.create_payment(test_payment("call_1")).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.payments.len(), 1);

        let other = store.create_payment(test_payment("call_2")).await.unwrap();
        assert_ne!(other.id, first.id);
    }

    #[tokio::test]
    async fn newer_permit_supersedes_active_sibling() {
        let store = MemoryStore::new();
        let first = store.create_permit(test_permit()).await.unwrap();
        let second = store.create_permit(test_permit()).await.unwrap();

        let first_after = store.permit(&first.id).await.unwrap().unwrap();
        assert_eq!(first_after.status, PermitStatus::Revoked);
        let second_after = store.permit(&second.id).await.unwrap().unwrap();
        assert_eq!(second_after.status, PermitStatus::Active);

        // Both retained for audit.
        let all = store.permits_by_user(first.user_address).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn different_chain_does_not_supersede() {
        let store = MemoryStore::new();
        let first = store.create_permit(test_permit()).await.unwrap();
        let mut other_chain = test_permit();
        other_chain.chain_id = 11155111;
        store.create_permit(other_chain).await.unwrap();

        let first_after = store.permit(&first.id).await.unwrap().unwrap();
        assert_eq!(first_after.status, PermitStatus::Active);
    }

    #[tokio::test]
    async fn subscription_usage_is_exclusive_per_call() {
        let store = MemoryStore::new();
        let subscription = test_subscription(3);
        store.upsert_subscription(subscription.clone()).await.unwrap();

        let after_trial = store
            .update_subscription_usage(&subscription.id, true)
            .await
            .unwrap();
        assert_eq!(after_trial.free_trials_remaining, 2);
        assert_eq!(after_trial.free_trials_used, 1);
        assert_eq!(after_trial.total_paid_calls, 0);

        let after_paid = store
            .update_subscription_usage(&subscription.id, false)
            .await
            .unwrap();
        assert_eq!(after_paid.free_trials_remaining, 2);
        assert_eq!(after_paid.free_trials_used, 1);
        assert_eq!(after_paid.total_paid_calls, 1);
    }

    #[tokio::test]
    async fn free_trial_cannot_go_negative() {
        let store = MemoryStore::new();
        let subscription = test_subscription(0);
        store.upsert_subscription(subscription.clone()).await.unwrap();
        let result = store.update_subscription_usage(&subscription.id, true).await;
        assert!(matches!(result, Err(StoreError::NoFreeTrialsRemaining(_))));
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let permit_id;
        {
            let store = MemoryStore::open(&path).unwrap();
            let permit = store.create_permit(test_permit()).await.unwrap();
            permit_id = permit.id.clone();
            store
                .upsert_subscription(test_subscription(2))
                .await
                .unwrap();
            store.create_payment(test_payment("call_1")).await.unwrap();
        }

        let reopened = MemoryStore::open(&path).unwrap();
        let permit = reopened.permit(&permit_id).await.unwrap().unwrap();
        assert_eq!(permit.cost_per_call, Decimal::new(10, 2));
        assert!(
            reopened
                .payment_by_api_call("call_1")
                .await
                .unwrap()
                .is_some()
        );
    }
}
