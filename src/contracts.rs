//! Solidity interfaces for the external contracts the router orchestrates.
//!
//! The router never deploys or owns contracts; it reads and writes four
//! externally deployed surfaces: the stablecoin ERC-20 (with EIP-2612
//! `permit`), the AllowanceVault (batched allowances keyed by
//! `(owner, token, spender)`), and the burn/mint pair of the cross-chain
//! transfer protocol.

use alloy_primitives::{B256, b256};
use alloy_sol_types::sol;

sol! {
    #[allow(missing_docs)]
    #[allow(clippy::too_many_arguments)]
    #[derive(Debug)]
    #[sol(rpc)]
    interface IERC20Permit {
        function balanceOf(address account) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
        function approve(address spender, uint256 value) external returns (bool);
        function transferFrom(address from, address to, uint256 value) external returns (bool);
        function permit(
            address owner,
            address spender,
            uint256 value,
            uint256 deadline,
            uint8 v,
            bytes32 r,
            bytes32 s
        ) external;
        function nonces(address owner) external view returns (uint256);
        function version() external view returns (string);
    }
}

sol! {
    #[allow(missing_docs)]
    #[allow(clippy::too_many_arguments)]
    #[derive(Debug)]
    #[sol(rpc)]
    interface IAllowanceVault {
        struct PermitDetails {
            address token;
            uint160 amount;
            uint48 expiration;
            uint48 nonce;
        }

        struct PermitSingle {
            PermitDetails details;
            address spender;
            uint256 sigDeadline;
        }

        function permit(address owner, PermitSingle calldata permitSingle, bytes calldata signature) external;
        function allowance(address owner, address token, address spender)
            external
            view
            returns (uint160 amount, uint48 expiration, uint48 nonce);
        function transferFrom(address from, address to, uint160 amount, address token) external;
    }
}

sol! {
    #[allow(missing_docs)]
    #[allow(clippy::too_many_arguments)]
    #[derive(Debug)]
    #[sol(rpc)]
    interface ITokenMessenger {
        function depositForBurn(
            uint256 amount,
            uint32 destinationDomain,
            bytes32 mintRecipient,
            address burnToken,
            bytes32 hookData,
            uint256 maxFee,
            uint32 finalityThreshold
        ) external;
    }
}

sol! {
    #[allow(missing_docs)]
    #[derive(Debug)]
    #[sol(rpc)]
    interface IMessageTransmitter {
        function receiveMessage(bytes calldata message, bytes calldata attestation) external returns (bool);
    }
}

sol! {
    /// Emitted by the MessageTransmitter on burn; its raw `data` keccak-hashes
    /// into the message hash the attestation provider is keyed by.
    #[derive(Debug)]
    event MessageSent(bytes message);
}

/// Topic 0 of [`MessageSent`]. Fixed by the protocol.
pub const MESSAGE_SENT_TOPIC: B256 =
    b256!("0x8c5261668696ce22758910d05bab8f186d6eb247ceac2af2e82c7dc17669b036");

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_sol_types::SolEvent;

    #[test]
    fn message_sent_topic_matches_signature_hash() {
        assert_eq!(MessageSent::SIGNATURE_HASH, MESSAGE_SENT_TOPIC);
    }
}
