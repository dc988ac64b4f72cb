//! Action Executor
//!
//! Turns a claimed `BridgeEvent` into exactly one destination write: `mint`
//! for `SourceToDest`, `release` for `DestToSource`. Parameters are copied
//! from the event without transformation.

use std::time::Duration;
use tracing::debug;

use crate::chain::{ActionError, ActionRequest, ChainSet};
use crate::db::BridgeEvent;
use crate::types::ActionKind;

#[derive(Debug, Clone)]
pub struct ActionExecutor {
    chains: ChainSet,
    timeout: Duration,
}

impl ActionExecutor {
    pub fn new(chains: ChainSet, timeout: Duration) -> Self {
        Self { chains, timeout }
    }

    pub fn request_for(event: &BridgeEvent) -> ActionRequest {
        ActionRequest {
            asset: event.asset.clone(),
            amount: event.amount,
            recipient: event.recipient.clone(),
            idempotency_key: event.idempotency_key.clone(),
        }
    }

    /// Key of the chain the action for `event` runs on
    pub fn target_chain(&self, event: &BridgeEvent) -> &str {
        &self.chains.target(event.direction).key
    }

    /// Submit the action for `event`, bounded by the executor timeout.
    /// A timeout is reported as `Transient`.
    pub async fn execute(&self, event: &BridgeEvent) -> Result<String, ActionError> {
        let request = Self::request_for(event);
        let target = self.chains.target(event.direction);
        let action = event.direction.action();

        debug!(
            key = %request.idempotency_key,
            chain = %target.key,
            action = %action,
            amount = %request.amount,
            "Invoking action executor"
        );

        let call = async {
            match action {
                ActionKind::Mint => target.writer.submit_mint(&request).await,
                ActionKind::Release => target.writer.submit_release(&request).await,
            }
        };

        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ActionError::Transient(format!(
                "{} on {} timed out after {:?}",
                action, target.key, self.timeout
            ))),
        }
    }
}
