//! Bridge relayer core
//!
//! Watches `Locked` events on the source chain and `Burned` events on the
//! destination chain, and performs the matching `mint` or `release` exactly
//! once per on-chain event.

pub mod admin;
pub mod api;
pub mod chain;
pub mod config;
pub mod contracts;
pub mod db;
pub mod executor;
pub mod hash;
pub mod metrics;
pub mod observer;
pub mod reconcile;
pub mod relay;
pub mod retry;
pub mod types;
