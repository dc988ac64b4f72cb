//! Event Store
//!
//! The durable record of every observed `BridgeEvent`, the attempt ledger,
//! observer cursors, skipped logs and the audit trail. Every state change is
//! a compare-and-swap on `state`; the `Confirmed -> Submitting` claim is the
//! one write that makes concurrent workers safe.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::types::{Direction, EventState, IdempotencyKey};

pub mod memory;
pub mod models;
pub mod postgres;

pub use memory::MemoryEventStore;
pub use models::*;
pub use postgres::PgEventStore;

/// Create a database connection pool
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

/// Storage interface shared by every relay component
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert a new event in `Observed`, or collapse onto the existing row
    /// for the same idempotency key.
    async fn upsert_observed(&self, event: &NewBridgeEvent) -> Result<UpsertOutcome>;

    async fn get_event(&self, key: &IdempotencyKey) -> Result<Option<BridgeEvent>>;

    /// Events in `state`, oldest `updated_at` first
    async fn list_by_state(
        &self,
        state: EventState,
        direction: Option<Direction>,
        limit: i64,
    ) -> Result<Vec<BridgeEvent>>;

    /// `Confirmed` events whose `retry_after` has passed
    async fn list_claimable(
        &self,
        direction: Direction,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<BridgeEvent>>;

    /// Events in `state` not updated since `updated_before`
    async fn list_stale(
        &self,
        state: EventState,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<BridgeEvent>>;

    /// Apply `transition` if the row is still in `transition.from`.
    /// Returns the updated row, or `None` when the CAS lost.
    async fn transition(
        &self,
        key: &IdempotencyKey,
        transition: &Transition,
    ) -> Result<Option<BridgeEvent>>;

    /// Increment `attempt_count` on a `Submitting` row and record an
    /// in-flight attempt under the next ledger number. Returns `None` if the
    /// row is no longer `Submitting`.
    async fn begin_attempt(&self, key: &IdempotencyKey) -> Result<Option<AttemptTicket>>;

    async fn finish_attempt(
        &self,
        key: &IdempotencyKey,
        attempt_no: u32,
        outcome: AttemptOutcome,
        dest_tx_hash: Option<&str>,
        error: Option<&str>,
    ) -> Result<()>;

    /// Update the outcome of whichever attempt produced `dest_tx_hash`
    async fn update_attempt_by_tx(
        &self,
        key: &IdempotencyKey,
        dest_tx_hash: &str,
        outcome: AttemptOutcome,
    ) -> Result<()>;

    async fn list_attempts(&self, key: &IdempotencyKey) -> Result<Vec<RelayAttempt>>;

    /// Latest attempt whose action reached the destination
    async fn prior_success(&self, key: &IdempotencyKey) -> Result<Option<RelayAttempt>>;

    /// Move a non-discarded `DeadLettered` event back to `Confirmed` with a
    /// fresh retry budget. `audit` is written atomically with the change; if
    /// either write fails, neither happens.
    async fn requeue_dead_letter(
        &self,
        key: &IdempotencyKey,
        audit: &AuditEntry,
    ) -> Result<Option<BridgeEvent>>;

    /// Stamp `discarded_at` on a `DeadLettered` event, atomically with `audit`
    async fn discard_dead_letter(
        &self,
        key: &IdempotencyKey,
        audit: &AuditEntry,
    ) -> Result<Option<BridgeEvent>>;

    async fn get_cursor(&self, chain: &str) -> Result<Option<u64>>;

    async fn set_cursor(&self, chain: &str, block: u64) -> Result<()>;

    async fn record_skipped_log(&self, skipped: &SkippedLog) -> Result<()>;

    async fn list_skipped_logs(&self, chain: &str, limit: i64) -> Result<Vec<SkippedLog>>;

    async fn record_audit(&self, entry: &AuditEntry) -> Result<()>;

    async fn list_audit(&self, key: &IdempotencyKey) -> Result<Vec<AuditEntry>>;

    async fn count_by_state(&self) -> Result<StateCounts>;
}
