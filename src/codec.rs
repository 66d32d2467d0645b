//! EIP-712 typed-data encoding and signature recovery for both permit schemes.
//!
//! Two schemas flow through the router:
//!
//! - **Schema A**: the stablecoin's own EIP-2612 `Permit`, authorizing the
//!   AllowanceVault to draw from the user's balance. Its domain `name` and
//!   `version` vary per `(token, chain)` deployment and signing against the
//!   wrong pair yields unrecoverable signatures.
//! - **Schema B**: the AllowanceVault `PermitSingle`, granting the admin a
//!   bounded, expiring allowance keyed by `(owner, token, spender)`.
//!
//! Both are modeled as [`PermitMessage`] variants sharing one digest/recover
//! surface. Signatures are stored and transported as an `(r, s, v)` triple;
//! the on-chain concatenation order is `r ‖ s ‖ v`.

use alloy_primitives::aliases::{U48, U160};
use alloy_primitives::{Address, B256, Signature, U256};
use alloy_sol_types::{Eip712Domain, SolStruct, eip712_domain, sol};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize};

use crate::contracts::IAllowanceVault;
use crate::network::{ALLOWANCE_VAULT_ADDRESS, TokenDeployment};

sol! {
    /// EIP-2612 `Permit` message (Schema A). The struct name is load-bearing:
    /// it fixes the EIP-712 type hash the token contract verifies.
    #[derive(Debug)]
    struct Permit {
        address owner;
        address spender;
        uint256 value;
        uint256 nonce;
        uint256 deadline;
    }
}

/// Errors raised while encoding or recovering permit signatures.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("signature v must be 0, 1, 27, or 28 (got {0})")]
    InvalidV(u8),
    #[error("recovered signer {recovered} does not match expected {expected}")]
    SignerMismatch { recovered: Address, expected: Address },
    #[error("amount does not fit in uint160")]
    AmountOverflow,
    #[error("value does not fit in uint48")]
    Uint48Overflow,
}

/// A 65-byte ECDSA signature carried as its `(r, s, v)` components.
///
/// Accepted on the wire either as an `{r, s, v}` object or as a 0x-prefixed
/// 130-hex-char string in `r ‖ s ‖ v` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SignatureRsv {
    pub r: B256,
    pub s: B256,
    pub v: u8,
}

static SIG_HEX_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{130}$").expect("invalid signature regex"));

impl SignatureRsv {
    /// On-chain byte layout: `r ‖ s ‖ v`.
    pub fn as_bytes(&self) -> [u8; 65] {
        let mut out = [0u8; 65];
        out[..32].copy_from_slice(self.r.as_slice());
        out[32..64].copy_from_slice(self.s.as_slice());
        out[64] = self.v;
        out
    }

    /// Normalized `v` as the contracts expect it (27 or 28).
    pub fn v_normalized(&self) -> Result<u8, CodecError> {
        match self.v {
            0 | 27 => Ok(27),
            1 | 28 => Ok(28),
            other => Err(CodecError::InvalidV(other)),
        }
    }

    fn parity(&self) -> Result<bool, CodecError> {
        Ok(self.v_normalized()? == 28)
    }

    pub fn to_signature(&self) -> Result<Signature, CodecError> {
        Ok(Signature::new(
            U256::from_be_bytes(self.r.0),
            U256::from_be_bytes(self.s.0),
            self.parity()?,
        ))
    }

    pub fn from_signature(signature: &Signature) -> Self {
        Self {
            r: B256::from(signature.r()),
            s: B256::from(signature.s()),
            v: 27 + signature.v() as u8,
        }
    }

    fn from_hex_str(s: &str) -> Result<Self, String> {
        if !SIG_HEX_REGEX.is_match(s) {
            return Err("signature must be 0x-prefixed and 130 hex chars".to_string());
        }
        let bytes = hex::decode(s.trim_start_matches("0x"))
            .map_err(|e| format!("invalid signature hex: {e}"))?;
        Ok(Self {
            r: B256::from_slice(&bytes[..32]),
            s: B256::from_slice(&bytes[32..64]),
            v: bytes[64],
        })
    }
}

impl<'de> Deserialize<'de> for SignatureRsv {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Hex(String),
            Parts { r: B256, s: B256, v: u8 },
        }

        match Wire::deserialize(deserializer)? {
            Wire::Hex(s) => SignatureRsv::from_hex_str(&s).map_err(D::Error::custom),
            Wire::Parts { r, s, v } => Ok(SignatureRsv { r, s, v }),
        }
    }
}

/// An EIP-2612 signature bundled with the deadline it was signed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPermitSig {
    pub r: B256,
    pub s: B256,
    pub v: u8,
    pub deadline: u64,
}

impl TokenPermitSig {
    pub fn rsv(&self) -> SignatureRsv {
        SignatureRsv {
            r: self.r,
            s: self.s,
            v: self.v,
        }
    }
}

/// A typed-data message under one of the two permit schemas, paired with the
/// domain it must be verified against.
#[derive(Debug, Clone)]
pub enum PermitMessage {
    /// Schema A: stablecoin EIP-2612 `Permit`.
    Token {
        domain: Eip712Domain,
        message: Permit,
    },
    /// Schema B: AllowanceVault `PermitSingle`.
    Vault {
        domain: Eip712Domain,
        message: IAllowanceVault::PermitSingle,
    },
}

impl PermitMessage {
    /// The 32-byte EIP-712 signing digest.
    pub fn digest(&self) -> B256 {
        match self {
            PermitMessage::Token { domain, message } => message.eip712_signing_hash(domain),
            PermitMessage::Vault { domain, message } => message.eip712_signing_hash(domain),
        }
    }

    /// Recover the address that produced `signature` over this message.
    pub fn recover_signer(&self, signature: &SignatureRsv) -> Result<Address, CodecError> {
        signature
            .to_signature()?
            .recover_address_from_prehash(&self.digest())
            .map_err(|e| CodecError::InvalidSignature(e.to_string()))
    }

    /// Recover and require a specific signer.
    pub fn verify_signer(
        &self,
        signature: &SignatureRsv,
        expected: Address,
    ) -> Result<(), CodecError> {
        let recovered = self.recover_signer(signature)?;
        if recovered == expected {
            Ok(())
        } else {
            Err(CodecError::SignerMismatch {
                recovered,
                expected,
            })
        }
    }
}

/// EIP-712 domain of a stablecoin's own `permit` implementation.
pub fn token_permit_domain(deployment: &TokenDeployment) -> Eip712Domain {
    eip712_domain! {
        name: deployment.eip712_name,
        version: deployment.eip712_version,
        chain_id: deployment.network.chain_id(),
        verifying_contract: deployment.address,
    }
}

/// EIP-712 domain of the AllowanceVault. The verifying contract is the same
/// address on every chain; only `chainId` varies.
pub fn allowance_vault_domain(chain_id: u64) -> Eip712Domain {
    eip712_domain! {
        name: "Permit2",
        version: "1",
        chain_id: chain_id,
        verifying_contract: ALLOWANCE_VAULT_ADDRESS,
    }
}

/// Build a Schema A message authorizing the AllowanceVault to draw from
/// `owner`'s balance on the given token deployment.
pub fn token_permit_message(
    deployment: &TokenDeployment,
    owner: Address,
    value: U256,
    nonce: U256,
    deadline: u64,
) -> PermitMessage {
    PermitMessage::Token {
        domain: token_permit_domain(deployment),
        message: Permit {
            owner,
            spender: ALLOWANCE_VAULT_ADDRESS,
            value,
            nonce,
            deadline: U256::from(deadline),
        },
    }
}

/// Build a Schema B message granting `spender` (the admin) an allowance of
/// `amount` on `token`, expiring at `deadline`. The permit's deadline doubles
/// as both the allowance `expiration` and the signature `sigDeadline`.
pub fn vault_permit_message(
    chain_id: u64,
    token: Address,
    amount: U256,
    nonce: u64,
    deadline: u64,
    spender: Address,
) -> Result<PermitMessage, CodecError> {
    let message = IAllowanceVault::PermitSingle {
        details: IAllowanceVault::PermitDetails {
            token,
            amount: u256_to_u160(amount)?,
            expiration: u64_to_u48(deadline)?,
            nonce: u64_to_u48(nonce)?,
        },
        spender,
        sigDeadline: U256::from(deadline),
    };
    Ok(PermitMessage::Vault {
        domain: allowance_vault_domain(chain_id),
        message,
    })
}

/// Narrow a permit amount to the vault's `uint160` width.
pub fn u256_to_u160(value: U256) -> Result<U160, CodecError> {
    if value.bit_len() > 160 {
        return Err(CodecError::AmountOverflow);
    }
    Ok(U160::from_be_slice(&value.to_be_bytes::<32>()[12..]))
}

/// Widen a vault allowance amount back to `uint256`.
pub fn u160_to_u256(value: U160) -> U256 {
    U256::from_be_slice(&value.to_be_bytes::<20>())
}

/// Narrow a Unix-seconds value to the vault's `uint48` width.
pub fn u64_to_u48(value: u64) -> Result<U48, CodecError> {
    if value >= 1 << 48 {
        return Err(CodecError::Uint48Overflow);
    }
    Ok(U48::from_be_slice(&value.to_be_bytes()[2..]))
}

/// Widen a vault `uint48` field (nonce or expiration) to `u64`.
pub fn u48_to_u64(value: U48) -> u64 {
    let be = value.to_be_bytes::<6>();
    let mut out = [0u8; 8];
    out[2..].copy_from_slice(&be);
    u64::from_be_bytes(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{KNOWN_TOKENS, Network};
    use alloy_signer::SignerSync;
    use alloy_signer_local::PrivateKeySigner;

    fn test_signer() -> PrivateKeySigner {
        let key = B256::from_slice(&[0x42u8; 32]);
        PrivateKeySigner::from_bytes(&key).unwrap()
    }

    fn sign(message: &PermitMessage, signer: &PrivateKeySigner) -> SignatureRsv {
        let signature = signer.sign_hash_sync(&message.digest()).unwrap();
        SignatureRsv::from_signature(&signature)
    }

    #[test]
    fn token_permit_round_trips_for_every_known_deployment() {
        let signer = test_signer();
        for deployment in KNOWN_TOKENS {
            let message = token_permit_message(
                deployment,
                signer.address(),
                U256::from(10_000_000u64),
                U256::ZERO,
                1_900_000_000,
            );
            let signature = sign(&message, &signer);
            let recovered = message.recover_signer(&signature).unwrap();
            assert_eq!(recovered, signer.address(), "deployment {deployment:?}");
        }
    }

    #[test]
    fn vault_permit_round_trips_for_every_network() {
        let signer = test_signer();
        let token = Address::repeat_byte(0x11);
        let admin = Address::repeat_byte(0x22);
        for network in Network::variants() {
            let message = vault_permit_message(
                network.chain_id(),
                token,
                U256::from(10_000_000u64),
                0,
                1_900_000_000,
                admin,
            )
            .unwrap();
            let signature = sign(&message, &signer);
            let recovered = message.recover_signer(&signature).unwrap();
            assert_eq!(recovered, signer.address(), "network {network}");
        }
    }

    #[test]
    fn domain_version_changes_the_digest() {
        let signer = test_signer();
        let usdc_sepolia = KNOWN_TOKENS
            .iter()
            .find(|d| d.symbol == "USDC" && d.network == Network::EthereumSepolia)
            .unwrap();
        let mut wrong_version = *usdc_sepolia;
        wrong_version.eip712_version = "1";

        let args = (signer.address(), U256::from(1u64), U256::ZERO, 1_900_000_000);
        let right = token_permit_message(usdc_sepolia, args.0, args.1, args.2, args.3);
        let wrong = token_permit_message(&wrong_version, args.0, args.1, args.2, args.3);
        assert_ne!(right.digest(), wrong.digest());

        // A signature over the wrong-version digest recovers to some other
        // address against the true domain.
        let signature = sign(&wrong, &signer);
        assert!(right.verify_signer(&signature, signer.address()).is_err());
    }

    #[test]
    fn signature_byte_order_is_r_s_v() {
        let sig = SignatureRsv {
            r: B256::repeat_byte(0xaa),
            s: B256::repeat_byte(0xbb),
            v: 27,
        };
        let bytes = sig.as_bytes();
        assert_eq!(&bytes[..32], B256::repeat_byte(0xaa).as_slice());
        assert_eq!(&bytes[32..64], B256::repeat_byte(0xbb).as_slice());
        assert_eq!(bytes[64], 27);
    }

    #[test]
    fn signature_deserializes_from_hex_and_parts() {
        let sig = SignatureRsv {
            r: B256::repeat_byte(0x01),
            s: B256::repeat_byte(0x02),
            v: 28,
        };
        let hex_form = format!("\"0x{}\"", hex::encode(sig.as_bytes()));
        let from_hex: SignatureRsv = serde_json::from_str(&hex_form).unwrap();
        assert_eq!(from_hex, sig);

        let parts_form = serde_json::to_string(&sig).unwrap();
        let from_parts: SignatureRsv = serde_json::from_str(&parts_form).unwrap();
        assert_eq!(from_parts, sig);

        assert!(serde_json::from_str::<SignatureRsv>("\"0x1234\"").is_err());
    }

    #[test]
    fn v_parity_variants_accepted() {
        let base = SignatureRsv {
            r: B256::repeat_byte(0x01),
            s: B256::repeat_byte(0x02),
            v: 0,
        };
        assert_eq!(base.v_normalized().unwrap(), 27);
        assert_eq!(SignatureRsv { v: 28, ..base }.v_normalized().unwrap(), 28);
        assert!(SignatureRsv { v: 5, ..base }.v_normalized().is_err());
    }

    #[test]
    fn uint_width_conversions() {
        let amount = U256::from(123_456_789u64);
        let narrowed = u256_to_u160(amount).unwrap();
        assert_eq!(u160_to_u256(narrowed), amount);
        assert!(u256_to_u160(U256::MAX).is_err());

        let ts = 1_900_000_000u64;
        assert_eq!(u48_to_u64(u64_to_u48(ts).unwrap()), ts);
        assert!(u64_to_u48(1 << 48).is_err());
    }
}
