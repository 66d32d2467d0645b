//! Read/write access to a single chain, plus the per-chain client map.
//!
//! Reads go straight through the underlying provider and may run
//! concurrently. Admin-signed writes are serialized per chain: a single admin
//! account has one nonce, so every write on a chain acquires that chain's
//! write lock, submits, and awaits its receipt before the next write begins.
//! Writes on different chains proceed in parallel.

use alloy_network::{EthereumWallet, TransactionBuilder};
use alloy_primitives::{Address, Bytes, TxHash};
use alloy_provider::fillers::{
    BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller, WalletFiller,
};
use alloy_provider::{Identity, PendingTransactionError, Provider, ProviderBuilder, RootProvider};
use alloy_rpc_client::RpcClient;
use alloy_rpc_types_eth::{TransactionReceipt, TransactionRequest};
use alloy_signer::Signer;
use alloy_signer_local::PrivateKeySigner;
use alloy_transport::TransportError;
use alloy_transport_http::Http;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::instrument;
use url::Url;

use crate::network::{ChainRegistry, Network, RegistryError};

/// Filler stack for admin transactions: gas, blob gas, nonce, and chain id.
pub type AdminFiller =
    JoinFill<GasFiller, JoinFill<BlobGasFiller, JoinFill<NonceFiller, ChainIdFiller>>>;

/// The fully composed provider type: fillers plus the admin wallet over a
/// [`RootProvider`] for JSON-RPC transport.
pub type AdminProvider = FillProvider<
    JoinFill<JoinFill<Identity, AdminFiller>, WalletFiller<EthereumWallet>>,
    RootProvider,
>;

/// An admin-signed contract call: target address plus encoded calldata.
#[derive(Debug, Clone)]
pub struct AdminCall {
    pub to: Address,
    pub calldata: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum ChainClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    PendingTransaction(#[from] PendingTransactionError),
    #[error("timed out waiting for receipt of transaction {transaction}")]
    ReceiptTimeout { transaction: TxHash },
    #[error("transaction {transaction} reverted")]
    Reverted { transaction: TxHash },
}

impl ChainClientError {
    /// Whether the failure is a receipt-wait timeout (the transaction may
    /// still land; callers must not assume it was dropped).
    pub fn is_receipt_timeout(&self) -> bool {
        matches!(self, ChainClientError::ReceiptTimeout { .. })
    }
}

/// Client for one chain: shared read provider plus the serialized admin write
/// path. Immutable after construction.
#[derive(Debug)]
pub struct ChainClient {
    network: Network,
    admin_address: Address,
    inner: AdminProvider,
    write_lock: Mutex<()>,
    receipt_timeout: Duration,
}

impl ChainClient {
    pub fn connect(
        network: Network,
        rpc_url: &Url,
        signer: PrivateKeySigner,
        receipt_timeout: Duration,
    ) -> Self {
        let signer = signer.with_chain_id(Some(network.chain_id()));
        let admin_address = signer.address();
        let wallet = EthereumWallet::from(signer);
        let filler = JoinFill::new(
            GasFiller,
            JoinFill::new(
                BlobGasFiller::default(),
                JoinFill::new(NonceFiller::default(), ChainIdFiller::default()),
            ),
        );
        let client = RpcClient::new(Http::new(rpc_url.clone()), false);
        let inner: AdminProvider = ProviderBuilder::default()
            .filler(filler)
            .wallet(wallet)
            .connect_client(client);
        tracing::info!(chain = %network, admin = %admin_address, rpc = %rpc_url, "connected chain client");
        Self {
            network,
            admin_address,
            inner,
            write_lock: Mutex::new(()),
            receipt_timeout,
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn admin_address(&self) -> Address {
        self.admin_address
    }

    /// The underlying provider, for read-only contract calls.
    pub fn provider(&self) -> &AdminProvider {
        &self.inner
    }

    /// Fetch a receipt without waiting. `None` when the transaction is not
    /// yet mined (or unknown to the node).
    pub async fn receipt(
        &self,
        transaction: TxHash,
    ) -> Result<Option<TransactionReceipt>, ChainClientError> {
        Ok(self.inner.get_transaction_receipt(transaction).await?)
    }

    /// Submit an admin-signed write and wait for its receipt.
    ///
    /// Holds this chain's write lock for the full submit-and-confirm cycle,
    /// which keeps admin nonces strictly ordered. A reverted receipt is an
    /// error; the transaction hash is preserved so callers can surface it.
    #[instrument(skip_all, err, fields(chain = %self.network, to = %call.to))]
    pub async fn send(&self, call: AdminCall) -> Result<TransactionReceipt, ChainClientError> {
        let _guard = self.write_lock.lock().await;
        let request = TransactionRequest::default()
            .with_from(self.admin_address)
            .with_to(call.to)
            .with_input(call.calldata);
        let pending = self.inner.send_transaction(request).await?;
        let transaction = *pending.tx_hash();
        let receipt = tokio::time::timeout(self.receipt_timeout, pending.get_receipt())
            .await
            .map_err(|_| ChainClientError::ReceiptTimeout { transaction })?
            .map_err(ChainClientError::PendingTransaction)?;
        if receipt.status() {
            tracing::debug!(tx = %receipt.transaction_hash, "transaction confirmed");
            Ok(receipt)
        } else {
            Err(ChainClientError::Reverted {
                transaction: receipt.transaction_hash,
            })
        }
    }
}

/// All connected chain clients, keyed by network. Built once at startup.
#[derive(Debug, Clone, Default)]
pub struct ChainClients {
    clients: HashMap<Network, Arc<ChainClient>>,
}

impl ChainClients {
    /// Connect a client for every network the registry has an RPC endpoint
    /// for.
    pub fn connect(
        registry: &ChainRegistry,
        signer: &PrivateKeySigner,
        receipt_timeout: Duration,
    ) -> Result<Self, RegistryError> {
        let mut clients = HashMap::new();
        for network in registry.networks() {
            let rpc_url = registry.rpc_url(network)?;
            let client = ChainClient::connect(network, rpc_url, signer.clone(), receipt_timeout);
            clients.insert(network, Arc::new(client));
        }
        Ok(Self { clients })
    }

    pub fn get(&self, network: Network) -> Result<&Arc<ChainClient>, RegistryError> {
        self.clients
            .get(&network)
            .ok_or(RegistryError::MissingRpcUrl(network.chain_id()))
    }

    pub fn by_chain_id(&self, chain_id: u64) -> Result<&Arc<ChainClient>, RegistryError> {
        self.get(Network::from_chain_id(chain_id)?)
    }

    pub fn networks(&self) -> impl Iterator<Item = Network> + '_ {
        self.clients.keys().copied()
    }
}
