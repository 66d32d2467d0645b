//! Environment-driven configuration for the router server.
//!
//! Everything is sourced from the process environment (a `.env` file is
//! loaded at startup). The admin keypair is validated eagerly: the address
//! derived from `ADMIN_PKEY` must match `ADMIN_ADDRESS` or startup fails.

use alloy_primitives::{Address, B256};
use alloy_signer_local::PrivateKeySigner;
use std::collections::HashMap;

use crate::network::KNOWN_TOKENS;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::network::Network;

/// Default attestation provider (sandbox).
pub const DEFAULT_ATTESTATION_API_URL: &str = "https://iris-api-sandbox.circle.com";

/// Publisher HTTP forward timeout.
const DEFAULT_PUBLISHER_TIMEOUT_SECS: u64 = 13;
/// On-chain receipt wait bound.
const DEFAULT_RECEIPT_TIMEOUT_SECS: u64 = 120;
/// Total attestation polling budget.
const DEFAULT_ATTESTATION_TIMEOUT_SECS: u64 = 1200;

/// A validated EVM private key (32 bytes, accepted with or without a `0x`
/// prefix).
#[derive(Clone, Copy)]
pub struct EvmPrivateKey(B256);

impl EvmPrivateKey {
    pub fn signer(&self) -> Result<PrivateKeySigner, ConfigError> {
        PrivateKeySigner::from_bytes(&self.0)
            .map_err(|e| ConfigError::InvalidVar("ADMIN_PKEY", e.to_string()))
    }
}

impl FromStr for EvmPrivateKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        B256::from_str(s)
            .map(Self)
            .map_err(|e| format!("invalid private key: {e}"))
    }
}

impl std::fmt::Debug for EvmPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never leak key material through Debug output.
        write!(f, "EvmPrivateKey(…)")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {0}: {1}")]
    InvalidVar(&'static str, String),
    #[error("ADMIN_ADDRESS {configured} does not match address {derived} derived from ADMIN_PKEY")]
    AdminAddressMismatch { derived: Address, configured: Address },
    #[error("no RPC_URL_{{chainId}} variables set; at least one chain is required")]
    NoChainsConfigured,
}

/// Server configuration assembled from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub admin_key: EvmPrivateKey,
    pub admin_address: Address,
    pub attestation_api_url: Url,
    pub rpc_urls: HashMap<Network, Url>,
    /// Token address overrides, keyed by `(symbol, chain id)`. Sourced from
    /// `TOKEN_ADDRESS_{SYMBOL}_{chainId}` variables.
    pub token_overrides: HashMap<(String, u64), Address>,
    pub publisher_timeout: Duration,
    pub receipt_timeout: Duration,
    pub attestation_timeout: Duration,
    pub store_path: Option<PathBuf>,
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingVar(name))
}

fn parsed<T: FromStr>(name: &'static str, value: String) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidVar(name, e.to_string()))
}

fn optional_parsed<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => parsed(name, value),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load and validate configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host: IpAddr = optional_parsed("HOST", IpAddr::from([0, 0, 0, 0]))?;
        let port: u16 = optional_parsed("PORT", 8080)?;

        let admin_key: EvmPrivateKey = parsed("ADMIN_PKEY", required("ADMIN_PKEY")?)?;
        let configured_address: Address =
            parsed("ADMIN_ADDRESS", required("ADMIN_ADDRESS")?)?;
        let derived = admin_key.signer()?.address();
        if derived != configured_address {
            return Err(ConfigError::AdminAddressMismatch {
                derived,
                configured: configured_address,
            });
        }

        let attestation_api_url: Url = optional_parsed(
            "ATTESTATION_API_URL",
            Url::parse(DEFAULT_ATTESTATION_API_URL)
                .expect("default attestation URL is well-formed"),
        )?;

        let mut rpc_urls = HashMap::new();
        for network in Network::variants() {
            let var = format!("RPC_URL_{}", network.chain_id());
            if let Ok(value) = std::env::var(&var) {
                let url = Url::parse(&value)
                    .map_err(|e| ConfigError::InvalidVar("RPC_URL_{chainId}", e.to_string()))?;
                rpc_urls.insert(*network, url);
            }
        }
        if rpc_urls.is_empty() {
            return Err(ConfigError::NoChainsConfigured);
        }

        let mut token_overrides = HashMap::new();
        for deployment in KNOWN_TOKENS {
            let chain_id = deployment.network.chain_id();
            let var = format!("TOKEN_ADDRESS_{}_{}", deployment.symbol, chain_id);
            if let Ok(value) = std::env::var(&var) {
                let address = value.parse::<Address>().map_err(|e| {
                    ConfigError::InvalidVar("TOKEN_ADDRESS_{symbol}_{chainId}", e.to_string())
                })?;
                token_overrides.insert((deployment.symbol.to_string(), chain_id), address);
            }
        }

        let publisher_timeout = Duration::from_secs(optional_parsed(
            "PUBLISHER_TIMEOUT_SECS",
            DEFAULT_PUBLISHER_TIMEOUT_SECS,
        )?);
        let receipt_timeout = Duration::from_secs(optional_parsed(
            "RECEIPT_TIMEOUT_SECS",
            DEFAULT_RECEIPT_TIMEOUT_SECS,
        )?);
        let attestation_timeout = Duration::from_secs(optional_parsed(
            "ATTESTATION_TIMEOUT_SECS",
            DEFAULT_ATTESTATION_TIMEOUT_SECS,
        )?);

        let store_path = std::env::var("STORE_PATH").ok().map(PathBuf::from);

        Ok(Config {
            host,
            port,
            admin_key,
            admin_address: configured_address,
            attestation_api_url,
            rpc_urls,
            token_overrides,
            publisher_timeout,
            receipt_timeout,
            attestation_timeout,
            store_path,
        })
    }
}
