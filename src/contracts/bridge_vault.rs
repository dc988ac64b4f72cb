//! Bridge vault contract ABI
//!
//! The same interface is deployed on both chains: the source chain emits
//! `Locked` and executes `release`, the destination chain emits `Burned` and
//! executes `mint`. `relayKey` is keccak256 of the idempotency key, which the
//! vault records in `processedKeys` so a repeated action reverts.

use alloy::sol;

sol! {
    #[sol(rpc)]
    contract BridgeVault {
        /// Mint wrapped tokens for a lock observed on the other chain
        function mint(bytes32 asset, address recipient, uint256 amount, bytes32 relayKey) external;

        /// Release locked tokens for a burn observed on the other chain
        function release(bytes32 asset, address recipient, uint256 amount, bytes32 relayKey) external;

        /// Whether an action for `relayKey` has already executed
        function processedKeys(bytes32 relayKey) external view returns (bool);

        event Locked(
            bytes32 indexed asset,
            address indexed sender,
            string recipient,
            uint256 amount
        );

        event Burned(
            bytes32 indexed asset,
            address indexed sender,
            string recipient,
            uint256 amount
        );

        event Relayed(
            bytes32 indexed relayKey,
            bytes32 indexed asset,
            address indexed recipient,
            uint256 amount
        );
    }
}
