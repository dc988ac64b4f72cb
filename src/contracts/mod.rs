pub mod bridge_vault;

pub use bridge_vault::BridgeVault;
