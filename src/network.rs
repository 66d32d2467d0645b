//! Network definitions, known token deployments, and the chain registry.
//!
//! This module is purely declarative: which chains the router serves, where the
//! supported stablecoins live on each of them, the burn-and-mint protocol
//! contract addresses, and the destination-domain ids the attestation protocol
//! assigns to each chain.

use alloy_primitives::{Address, address};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fmt::{Display, Formatter};
use url::Url;

/// Canonical batched-allowance contract ("AllowanceVault"). Deployed at the
/// same address on every supported chain.
pub const ALLOWANCE_VAULT_ADDRESS: Address = address!("0x000000000022D473030F116dDEE9F6B43aC78BA3");

/// Supported EVM networks.
#[derive(Debug, Hash, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Network {
    /// Ethereum mainnet (chain ID 1).
    #[serde(rename = "ethereum")]
    Ethereum,
    /// Ethereum Sepolia testnet (chain ID 11155111).
    #[serde(rename = "ethereum-sepolia")]
    EthereumSepolia,
    /// Base mainnet (chain ID 8453).
    #[serde(rename = "base")]
    Base,
    /// Base Sepolia testnet (chain ID 84532).
    #[serde(rename = "base-sepolia")]
    BaseSepolia,
}

impl Network {
    /// Numeric chain ID of the network.
    pub fn chain_id(&self) -> u64 {
        match self {
            Network::Ethereum => 1,
            Network::EthereumSepolia => 11155111,
            Network::Base => 8453,
            Network::BaseSepolia => 84532,
        }
    }

    /// Destination-domain id assigned by the attestation protocol.
    ///
    /// Domains are shared between a chain and its testnet (Ethereum = 0,
    /// Base = 6).
    pub fn destination_domain(&self) -> u32 {
        match self {
            Network::Ethereum | Network::EthereumSepolia => 0,
            Network::Base | Network::BaseSepolia => 6,
        }
    }

    /// TokenMessenger contract (burn side of the cross-chain transfer).
    pub fn token_messenger(&self) -> Address {
        match self {
            Network::Ethereum | Network::Base => {
                address!("0x28b5a0e9C621a5BadaA536219b3a228C8168cf5d")
            }
            Network::EthereumSepolia | Network::BaseSepolia => {
                address!("0x8FE6B999Dc680CcFDD5Bf7EB0974218be2542DAA")
            }
        }
    }

    /// MessageTransmitter contract (mint side of the cross-chain transfer).
    pub fn message_transmitter(&self) -> Address {
        match self {
            Network::Ethereum | Network::Base => {
                address!("0x81D40F21F12A8F0E3252Bccb954D722d4c464B64")
            }
            Network::EthereumSepolia | Network::BaseSepolia => {
                address!("0xE737e5cEBEEBa77EFE34D4aa090756590b1CE275")
            }
        }
    }

    /// All supported [`Network`] variants.
    pub fn variants() -> &'static [Network] {
        &[
            Network::Ethereum,
            Network::EthereumSepolia,
            Network::Base,
            Network::BaseSepolia,
        ]
    }

    /// Resolve a numeric chain id into a supported network.
    pub fn from_chain_id(chain_id: u64) -> Result<Network, RegistryError> {
        Network::variants()
            .iter()
            .copied()
            .find(|n| n.chain_id() == chain_id)
            .ok_or(RegistryError::UnsupportedChain(chain_id))
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Network::Ethereum => "ethereum",
            Network::EthereumSepolia => "ethereum-sepolia",
            Network::Base => "base",
            Network::BaseSepolia => "base-sepolia",
        };
        write!(f, "{}", s)
    }
}

/// A stablecoin symbol as carried in permits and agent payout preferences.
///
/// Symbols are normalized to uppercase on construction so `"usdc"` and
/// `"USDC"` compare equal. The set is open: unrecognized symbols simply fail
/// to resolve to a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TokenSymbol(String);

impl TokenSymbol {
    pub fn new(symbol: impl AsRef<str>) -> Self {
        Self(symbol.as_ref().to_uppercase())
    }

    pub fn usdc() -> Self {
        Self("USDC".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Only USDC can travel through the burn-and-mint protocol.
    pub fn is_usdc(&self) -> bool {
        self.0 == "USDC"
    }
}

impl<'de> Deserialize<'de> for TokenSymbol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(TokenSymbol::new(s))
    }
}

impl Display for TokenSymbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TokenSymbol {
    fn from(value: &str) -> Self {
        TokenSymbol::new(value)
    }
}

/// A known stablecoin deployment: its address on one network plus the EIP-712
/// domain parameters its `permit` implementation verifies against.
///
/// The `eip712_version` column is a hard invariant. Signing with the wrong
/// version produces signatures the token contract will never accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenDeployment {
    pub symbol: &'static str,
    pub network: Network,
    pub address: Address,
    pub decimals: u8,
    pub eip712_name: &'static str,
    pub eip712_version: &'static str,
}

/// Every token deployment the router knows about.
pub const KNOWN_TOKENS: &[TokenDeployment] = &[
    TokenDeployment {
        symbol: "USDC",
        network: Network::Ethereum,
        address: address!("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"),
        decimals: 6,
        eip712_name: "USD Coin",
        eip712_version: "1",
    },
    TokenDeployment {
        symbol: "USDC",
        network: Network::EthereumSepolia,
        address: address!("0x1c7D4B196Cb0C7B01d743Fbc6116a902379C7238"),
        decimals: 6,
        eip712_name: "USD Coin",
        eip712_version: "2",
    },
    TokenDeployment {
        symbol: "USDC",
        network: Network::Base,
        address: address!("0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"),
        decimals: 6,
        eip712_name: "USD Coin",
        eip712_version: "1",
    },
    TokenDeployment {
        symbol: "USDC",
        network: Network::BaseSepolia,
        address: address!("0x036CbD53842c5426634e7929541eC2318f3dCF7e"),
        decimals: 6,
        eip712_name: "USD Coin",
        eip712_version: "1",
    },
    TokenDeployment {
        symbol: "PYUSD",
        network: Network::Ethereum,
        address: address!("0x6c3ea9036406852006290770BEdFcAbA0e23A0e8"),
        decimals: 6,
        eip712_name: "PayPal USD",
        eip712_version: "1",
    },
    TokenDeployment {
        symbol: "PYUSD",
        network: Network::EthereumSepolia,
        address: address!("0xCaC524BcA292aaade2DF8A05cC58F0a65B1B3bB9"),
        decimals: 6,
        eip712_name: "PayPal USD",
        eip712_version: "1",
    },
];

/// Errors produced by registry lookups.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The chain id is outside the configured set.
    #[error("unsupported chain id {0}")]
    UnsupportedChain(u64),
    /// The token symbol has no known deployment on the chain.
    #[error("unknown token {0} on chain {1}")]
    UnknownToken(TokenSymbol, u64),
    /// The chain is supported but no RPC endpoint was configured for it.
    #[error("no RPC endpoint configured for chain {0}")]
    MissingRpcUrl(u64),
}

/// Static mapping of chain ids to RPC endpoints, token contracts, and
/// burn-and-mint protocol addresses. Immutable after construction.
#[derive(Debug, Clone)]
pub struct ChainRegistry {
    rpc_urls: HashMap<Network, Url>,
    /// Environment-supplied token address overrides, keyed by
    /// `(symbol, chain id)`. Used on testnets where tokens are redeployed.
    token_overrides: HashMap<(String, u64), Address>,
}

impl ChainRegistry {
    pub fn new(rpc_urls: HashMap<Network, Url>) -> Self {
        Self {
            rpc_urls,
            token_overrides: HashMap::new(),
        }
    }

    pub fn with_token_overrides(mut self, overrides: HashMap<(String, u64), Address>) -> Self {
        self.token_overrides = overrides;
        self
    }

    /// Networks the registry can actually reach (an RPC endpoint is known).
    pub fn networks(&self) -> impl Iterator<Item = Network> + '_ {
        self.rpc_urls.keys().copied()
    }

    pub fn rpc_url(&self, network: Network) -> Result<&Url, RegistryError> {
        self.rpc_urls
            .get(&network)
            .ok_or(RegistryError::MissingRpcUrl(network.chain_id()))
    }

    /// Resolve a token symbol on a chain to its deployment, or fail with
    /// [`RegistryError::UnknownToken`]. An environment override replaces the
    /// well-known contract address but keeps the EIP-712 domain parameters.
    pub fn token_deployment(
        &self,
        symbol: &TokenSymbol,
        chain_id: u64,
    ) -> Result<TokenDeployment, RegistryError> {
        let network = Network::from_chain_id(chain_id)?;
        let mut deployment = KNOWN_TOKENS
            .iter()
            .find(|d| d.symbol == symbol.as_str() && d.network == network)
            .copied()
            .ok_or_else(|| RegistryError::UnknownToken(symbol.clone(), chain_id))?;
        if let Some(address) = self
            .token_overrides
            .get(&(symbol.as_str().to_string(), chain_id))
        {
            deployment.address = *address;
        }
        Ok(deployment)
    }

    pub fn token_address(&self, symbol: &TokenSymbol, chain_id: u64) -> Option<Address> {
        self.token_deployment(symbol, chain_id).map(|d| d.address).ok()
    }

    /// Base-unit decimals for a supported stablecoin. All supported tokens
    /// carry six decimals.
    pub fn decimals(&self, symbol: &TokenSymbol, chain_id: u64) -> Result<u8, RegistryError> {
        self.token_deployment(symbol, chain_id).map(|d| d.decimals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_ids_round_trip() {
        for network in Network::variants() {
            assert_eq!(Network::from_chain_id(network.chain_id()).unwrap(), *network);
        }
        assert!(matches!(
            Network::from_chain_id(42),
            Err(RegistryError::UnsupportedChain(42))
        ));
    }

    #[test]
    fn destination_domains() {
        assert_eq!(Network::Ethereum.destination_domain(), 0);
        assert_eq!(Network::EthereumSepolia.destination_domain(), 0);
        assert_eq!(Network::Base.destination_domain(), 6);
        assert_eq!(Network::BaseSepolia.destination_domain(), 6);
    }

    #[test]
    fn eip712_versions_disambiguated() {
        let registry = ChainRegistry::new(HashMap::new());
        let usdc = TokenSymbol::usdc();
        let sepolia = registry.token_deployment(&usdc, 11155111).unwrap();
        assert_eq!(sepolia.eip712_version, "2");
        let base = registry.token_deployment(&usdc, 8453).unwrap();
        assert_eq!(base.eip712_version, "1");
        let pyusd = registry.token_deployment(&"pyusd".into(), 1).unwrap();
        assert_eq!(pyusd.eip712_name, "PayPal USD");
    }

    #[test]
    fn unknown_token_does_not_resolve() {
        let registry = ChainRegistry::new(HashMap::new());
        assert!(registry.token_address(&"DAI".into(), 8453).is_none());
        assert!(matches!(
            registry.token_deployment(&TokenSymbol::usdc(), 1234),
            Err(RegistryError::UnsupportedChain(1234))
        ));
    }

    #[test]
    fn token_override_replaces_address_only() {
        let override_address = Address::repeat_byte(0x42);
        let mut overrides = HashMap::new();
        overrides.insert(("USDC".to_string(), 84532u64), override_address);
        let registry = ChainRegistry::new(HashMap::new()).with_token_overrides(overrides);

        let deployment = registry.token_deployment(&TokenSymbol::usdc(), 84532).unwrap();
        assert_eq!(deployment.address, override_address);
        assert_eq!(deployment.eip712_name, "USD Coin");

        let untouched = registry.token_deployment(&TokenSymbol::usdc(), 8453).unwrap();
        assert_ne!(untouched.address, override_address);
    }

    #[test]
    fn symbols_normalize_case() {
        assert_eq!(TokenSymbol::new("usdc"), TokenSymbol::usdc());
        assert!(TokenSymbol::new("Usdc").is_usdc());
        assert!(!TokenSymbol::new("pyusd").is_usdc());
    }
}
