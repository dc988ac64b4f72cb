//! Postgres-backed `EventStore`

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::{eyre, Result, WrapErr};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use tracing::error;

use super::models::*;
use super::EventStore;
use crate::types::{Direction, EventState, IdempotencyKey, ParseError};

/// Column list shared by every query that returns a full event row.
/// `amount` is NUMERIC(78,0) and is read back as text.
const EVENT_COLUMNS: &str = "idempotency_key, direction, source_chain, source_tx_hash, \
     log_index, source_block_number, asset, amount::TEXT AS amount, sender, recipient, \
     state, attempt_count, last_error, failure_class, dest_tx_hash, retry_after, \
     observation_count, last_observed_at, discarded_at, created_at, updated_at";

const ATTEMPT_COLUMNS: &str =
    "idempotency_key, attempt_no, outcome, dest_tx_hash, error, started_at, finished_at";

#[derive(Debug, FromRow)]
struct EventRow {
    idempotency_key: String,
    direction: String,
    source_chain: String,
    source_tx_hash: String,
    log_index: i64,
    source_block_number: i64,
    asset: String,
    amount: String,
    sender: String,
    recipient: String,
    state: String,
    attempt_count: i32,
    last_error: Option<String>,
    failure_class: Option<String>,
    dest_tx_hash: Option<String>,
    retry_after: Option<DateTime<Utc>>,
    observation_count: i32,
    last_observed_at: DateTime<Utc>,
    discarded_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for BridgeEvent {
    type Error = ParseError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(BridgeEvent {
            idempotency_key: row.idempotency_key.parse()?,
            direction: row.direction.parse()?,
            source_chain: row.source_chain,
            source_tx_hash: row.source_tx_hash,
            log_index: row.log_index.max(0) as u64,
            source_block_number: row.source_block_number.max(0) as u64,
            asset: row.asset,
            amount: row.amount.parse()?,
            sender: row.sender,
            recipient: row.recipient,
            state: row.state.parse()?,
            attempt_count: row.attempt_count.max(0) as u32,
            last_error: row.last_error,
            failure_class: row.failure_class.map(|c| c.parse()).transpose()?,
            dest_tx_hash: row.dest_tx_hash,
            retry_after: row.retry_after,
            observation_count: row.observation_count.max(0) as u32,
            last_observed_at: row.last_observed_at,
            discarded_at: row.discarded_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct AttemptRow {
    idempotency_key: String,
    attempt_no: i32,
    outcome: String,
    dest_tx_hash: Option<String>,
    error: Option<String>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<AttemptRow> for RelayAttempt {
    type Error = ParseError;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        Ok(RelayAttempt {
            idempotency_key: row.idempotency_key.parse()?,
            attempt_no: row.attempt_no.max(0) as u32,
            outcome: row.outcome.parse()?,
            dest_tx_hash: row.dest_tx_hash,
            error: row.error,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct UpsertRow {
    inserted: bool,
    #[sqlx(flatten)]
    event: EventRow,
}

/// BIGINT columns are signed; refuse values that would wrap
fn to_bigint(value: u64, column: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| eyre!("{} {} is out of BIGINT range", column, value))
}

async fn insert_audit<'e, E>(executor: E, entry: &AuditEntry) -> Result<()>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"INSERT INTO audit_log (idempotency_key, action, actor, detail, created_at)
           VALUES ($1, $2, $3, $4, $5)"#,
    )
    .bind(entry.idempotency_key.as_str())
    .bind(&entry.action)
    .bind(&entry.actor)
    .bind(entry.detail.as_deref())
    .bind(entry.created_at)
    .execute(executor)
    .await
    .wrap_err("Failed to write audit entry")?;
    Ok(())
}

fn decode_events(rows: Vec<EventRow>) -> Result<Vec<BridgeEvent>> {
    rows.into_iter()
        .map(|row| BridgeEvent::try_from(row).wrap_err("Corrupt bridge_events row"))
        .collect()
}

fn decode_event(row: Option<EventRow>) -> Result<Option<BridgeEvent>> {
    row.map(|r| BridgeEvent::try_from(r).wrap_err("Corrupt bridge_events row"))
        .transpose()
}

/// `EventStore` over a shared `PgPool`
#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run a single-row `UPDATE ... RETURNING` and, when it matched, write
    /// `audit` in the same transaction
    async fn audited_update(
        &self,
        query: &str,
        key: &IdempotencyKey,
        audit: &AuditEntry,
        action: &str,
    ) -> Result<Option<BridgeEvent>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .wrap_err_with(|| format!("Failed to begin {} transaction", action))?;

        let row = sqlx::query_as::<_, EventRow>(query)
            .bind(key.as_str())
            .fetch_optional(&mut *tx)
            .await
            .wrap_err_with(|| format!("Failed to {}", action))?;

        if row.is_none() {
            tx.rollback()
                .await
                .wrap_err_with(|| format!("Failed to roll back {}", action))?;
            return Ok(None);
        }

        insert_audit(&mut *tx, audit).await?;
        tx.commit()
            .await
            .wrap_err_with(|| format!("Failed to commit {}", action))?;
        decode_event(row)
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn upsert_observed(&self, event: &NewBridgeEvent) -> Result<UpsertOutcome> {
        // A conflicting insert only bumps the observation counters; payload,
        // state and updated_at are never overwritten.
        let query = format!(
            r#"
            INSERT INTO bridge_events (idempotency_key, direction, source_chain, source_tx_hash,
                log_index, source_block_number, asset, amount, sender, recipient, state)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8::NUMERIC, $9, $10, 'observed')
            ON CONFLICT (idempotency_key) DO UPDATE SET
                observation_count = bridge_events.observation_count + 1,
                last_observed_at = NOW()
            RETURNING (xmax = 0) AS inserted, {EVENT_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, UpsertRow>(&query)
            .bind(event.idempotency_key.as_str())
            .bind(event.direction.as_str())
            .bind(&event.source_chain)
            .bind(&event.source_tx_hash)
            .bind(to_bigint(event.log_index, "log_index")?)
            .bind(to_bigint(event.source_block_number, "source_block_number")?)
            .bind(&event.asset)
            .bind(event.amount.to_string())
            .bind(&event.sender)
            .bind(&event.recipient)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                error!(key = %event.idempotency_key, "SQL error upserting bridge event: {:?}", e);
                e
            })
            .wrap_err("Failed to upsert bridge event")?;

        let inserted = row.inserted;
        let stored = BridgeEvent::try_from(row.event).wrap_err("Corrupt bridge_events row")?;
        Ok(if inserted {
            UpsertOutcome::Inserted(stored)
        } else if stored.same_payload(event) {
            UpsertOutcome::Duplicate(stored)
        } else {
            UpsertOutcome::Conflict(stored)
        })
    }

    async fn get_event(&self, key: &IdempotencyKey) -> Result<Option<BridgeEvent>> {
        let query = format!("SELECT {EVENT_COLUMNS} FROM bridge_events WHERE idempotency_key = $1");
        let row = sqlx::query_as::<_, EventRow>(&query)
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await
            .wrap_err("Failed to get bridge event")?;
        decode_event(row)
    }

    async fn list_by_state(
        &self,
        state: EventState,
        direction: Option<Direction>,
        limit: i64,
    ) -> Result<Vec<BridgeEvent>> {
        let query = format!(
            r#"SELECT {EVENT_COLUMNS} FROM bridge_events
               WHERE state = $1 AND ($2::VARCHAR IS NULL OR direction = $2)
               ORDER BY updated_at ASC, idempotency_key ASC
               LIMIT $3"#
        );
        let rows = sqlx::query_as::<_, EventRow>(&query)
            .bind(state.as_str())
            .bind(direction.map(|d| d.as_str()))
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .wrap_err_with(|| format!("Failed to list {} events", state))?;
        decode_events(rows)
    }

    async fn list_claimable(
        &self,
        direction: Direction,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<BridgeEvent>> {
        let query = format!(
            r#"SELECT {EVENT_COLUMNS} FROM bridge_events
               WHERE state = 'confirmed' AND direction = $1
                 AND (retry_after IS NULL OR retry_after <= $2)
               ORDER BY source_block_number ASC, log_index ASC
               LIMIT $3"#
        );
        let rows = sqlx::query_as::<_, EventRow>(&query)
            .bind(direction.as_str())
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .wrap_err("Failed to list claimable events")?;
        decode_events(rows)
    }

    async fn list_stale(
        &self,
        state: EventState,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<BridgeEvent>> {
        let query = format!(
            r#"SELECT {EVENT_COLUMNS} FROM bridge_events
               WHERE state = $1 AND updated_at <= $2
               ORDER BY updated_at ASC
               LIMIT $3"#
        );
        let rows = sqlx::query_as::<_, EventRow>(&query)
            .bind(state.as_str())
            .bind(updated_before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .wrap_err_with(|| format!("Failed to list stale {} events", state))?;
        decode_events(rows)
    }

    async fn transition(
        &self,
        key: &IdempotencyKey,
        transition: &Transition,
    ) -> Result<Option<BridgeEvent>> {
        if !transition.from.can_transition_to(transition.to) {
            return Err(eyre!(
                "Illegal transition {} -> {} for {}",
                transition.from,
                transition.to,
                key
            ));
        }

        let query = format!(
            r#"
            UPDATE bridge_events SET
                state = $3,
                last_error = CASE WHEN $4 THEN NULL ELSE COALESCE($5, last_error) END,
                dest_tx_hash = COALESCE($6, dest_tx_hash),
                retry_after = $7,
                failure_class = $8,
                updated_at = NOW()
            WHERE idempotency_key = $1 AND state = $2
            RETURNING {EVENT_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, EventRow>(&query)
            .bind(key.as_str())
            .bind(transition.from.as_str())
            .bind(transition.to.as_str())
            .bind(transition.clear_error)
            .bind(transition.last_error.as_deref())
            .bind(transition.dest_tx_hash.as_deref())
            .bind(transition.retry_after)
            .bind(transition.failure_class.map(|c| c.as_str()))
            .fetch_optional(&self.pool)
            .await
            .wrap_err_with(|| {
                format!(
                    "Failed to transition {} from {} to {}",
                    key, transition.from, transition.to
                )
            })?;
        decode_event(row)
    }

    async fn begin_attempt(&self, key: &IdempotencyKey) -> Result<Option<AttemptTicket>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .wrap_err("Failed to begin attempt transaction")?;

        let bumped = sqlx::query_as::<_, (i32,)>(
            r#"UPDATE bridge_events SET attempt_count = attempt_count + 1, updated_at = NOW()
               WHERE idempotency_key = $1 AND state = 'submitting'
               RETURNING attempt_count"#,
        )
        .bind(key.as_str())
        .fetch_optional(&mut *tx)
        .await
        .wrap_err("Failed to increment attempt count")?;

        let Some((attempt_count,)) = bumped else {
            tx.rollback().await.wrap_err("Failed to roll back attempt")?;
            return Ok(None);
        };

        // The event row is locked by the update above, so numbering is serial
        let (attempt_no,) = sqlx::query_as::<_, (i32,)>(
            r#"INSERT INTO relay_attempts (idempotency_key, attempt_no, outcome)
               SELECT $1, COALESCE(MAX(attempt_no), 0) + 1, 'in_flight'
               FROM relay_attempts WHERE idempotency_key = $1
               RETURNING attempt_no"#,
        )
        .bind(key.as_str())
        .fetch_one(&mut *tx)
        .await
        .wrap_err("Failed to record relay attempt")?;

        tx.commit().await.wrap_err("Failed to commit relay attempt")?;
        Ok(Some(AttemptTicket {
            attempt_no: attempt_no.max(0) as u32,
            attempt_count: attempt_count.max(0) as u32,
        }))
    }

    async fn finish_attempt(
        &self,
        key: &IdempotencyKey,
        attempt_no: u32,
        outcome: AttemptOutcome,
        dest_tx_hash: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"UPDATE relay_attempts
               SET outcome = $3, dest_tx_hash = COALESCE($4, dest_tx_hash), error = $5,
                   finished_at = NOW()
               WHERE idempotency_key = $1 AND attempt_no = $2"#,
        )
        .bind(key.as_str())
        .bind(attempt_no as i32)
        .bind(outcome.as_str())
        .bind(dest_tx_hash)
        .bind(error)
        .execute(&self.pool)
        .await
        .wrap_err("Failed to finish relay attempt")?;
        Ok(())
    }

    async fn update_attempt_by_tx(
        &self,
        key: &IdempotencyKey,
        dest_tx_hash: &str,
        outcome: AttemptOutcome,
    ) -> Result<()> {
        sqlx::query(
            r#"UPDATE relay_attempts SET outcome = $3, finished_at = NOW()
               WHERE idempotency_key = $1 AND dest_tx_hash = $2"#,
        )
        .bind(key.as_str())
        .bind(dest_tx_hash)
        .bind(outcome.as_str())
        .execute(&self.pool)
        .await
        .wrap_err("Failed to update relay attempt by tx hash")?;
        Ok(())
    }

    async fn list_attempts(&self, key: &IdempotencyKey) -> Result<Vec<RelayAttempt>> {
        let query = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM relay_attempts WHERE idempotency_key = $1 ORDER BY attempt_no ASC"
        );
        let rows = sqlx::query_as::<_, AttemptRow>(&query)
            .bind(key.as_str())
            .fetch_all(&self.pool)
            .await
            .wrap_err("Failed to list relay attempts")?;
        rows.into_iter()
            .map(|row| RelayAttempt::try_from(row).wrap_err("Corrupt relay_attempts row"))
            .collect()
    }

    async fn prior_success(&self, key: &IdempotencyKey) -> Result<Option<RelayAttempt>> {
        let query = format!(
            r#"SELECT {ATTEMPT_COLUMNS} FROM relay_attempts
               WHERE idempotency_key = $1
                 AND outcome IN ('submitted', 'already_processed', 'finalized')
               ORDER BY attempt_no DESC
               LIMIT 1"#
        );
        let row = sqlx::query_as::<_, AttemptRow>(&query)
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await
            .wrap_err("Failed to look up prior relay success")?;
        row.map(|r| RelayAttempt::try_from(r).wrap_err("Corrupt relay_attempts row"))
            .transpose()
    }

    async fn requeue_dead_letter(
        &self,
        key: &IdempotencyKey,
        audit: &AuditEntry,
    ) -> Result<Option<BridgeEvent>> {
        let query = format!(
            r#"
            UPDATE bridge_events SET
                state = 'confirmed',
                attempt_count = 0,
                last_error = NULL,
                failure_class = NULL,
                retry_after = NULL,
                updated_at = NOW()
            WHERE idempotency_key = $1 AND state = 'dead_lettered' AND discarded_at IS NULL
            RETURNING {EVENT_COLUMNS}
            "#
        );
        self.audited_update(&query, key, audit, "requeue dead-lettered event")
            .await
    }

    async fn discard_dead_letter(
        &self,
        key: &IdempotencyKey,
        audit: &AuditEntry,
    ) -> Result<Option<BridgeEvent>> {
        let query = format!(
            r#"
            UPDATE bridge_events SET discarded_at = NOW(), updated_at = NOW()
            WHERE idempotency_key = $1 AND state = 'dead_lettered' AND discarded_at IS NULL
            RETURNING {EVENT_COLUMNS}
            "#
        );
        self.audited_update(&query, key, audit, "discard dead-lettered event")
            .await
    }

    async fn get_cursor(&self, chain: &str) -> Result<Option<u64>> {
        let row: Option<(i64,)> =
            sqlx::query_as(r#"SELECT last_block FROM relay_cursors WHERE chain_key = $1"#)
                .bind(chain)
                .fetch_optional(&self.pool)
                .await
                .wrap_err("Failed to get relay cursor")?;
        Ok(row.map(|(block,)| block.max(0) as u64))
    }

    async fn set_cursor(&self, chain: &str, block: u64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO relay_cursors (chain_key, last_block, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (chain_key) DO UPDATE SET last_block = $2, updated_at = NOW()
            "#,
        )
        .bind(chain)
        .bind(to_bigint(block, "last_block")?)
        .execute(&self.pool)
        .await
        .wrap_err("Failed to update relay cursor")?;
        Ok(())
    }

    async fn record_skipped_log(&self, skipped: &SkippedLog) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO skipped_logs (chain_key, block_number, tx_hash, log_index, reason)
               VALUES ($1, $2, $3, $4, $5)"#,
        )
        .bind(&skipped.chain)
        .bind(to_bigint(skipped.block_number, "block_number")?)
        .bind(skipped.tx_hash.as_deref())
        .bind(
            skipped
                .log_index
                .map(|i| to_bigint(i, "log_index"))
                .transpose()?,
        )
        .bind(&skipped.reason)
        .execute(&self.pool)
        .await
        .wrap_err("Failed to record skipped log")?;
        Ok(())
    }

    async fn list_skipped_logs(&self, chain: &str, limit: i64) -> Result<Vec<SkippedLog>> {
        let rows: Vec<(String, i64, Option<String>, Option<i64>, String)> = sqlx::query_as(
            r#"SELECT chain_key, block_number, tx_hash, log_index, reason
               FROM skipped_logs WHERE chain_key = $1
               ORDER BY id ASC LIMIT $2"#,
        )
        .bind(chain)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .wrap_err("Failed to list skipped logs")?;

        Ok(rows
            .into_iter()
            .map(|(chain, block, tx_hash, log_index, reason)| SkippedLog {
                chain,
                block_number: block.max(0) as u64,
                tx_hash,
                log_index: log_index.map(|i| i.max(0) as u64),
                reason,
            })
            .collect())
    }

    async fn record_audit(&self, entry: &AuditEntry) -> Result<()> {
        insert_audit(&self.pool, entry).await
    }

    async fn list_audit(&self, key: &IdempotencyKey) -> Result<Vec<AuditEntry>> {
        let rows: Vec<(String, String, Option<String>, DateTime<Utc>)> = sqlx::query_as(
            r#"SELECT action, actor, detail, created_at FROM audit_log
               WHERE idempotency_key = $1 ORDER BY id ASC"#,
        )
        .bind(key.as_str())
        .fetch_all(&self.pool)
        .await
        .wrap_err("Failed to list audit entries")?;

        Ok(rows
            .into_iter()
            .map(|(action, actor, detail, created_at)| AuditEntry {
                idempotency_key: key.clone(),
                action,
                actor,
                detail,
                created_at,
            })
            .collect())
    }

    async fn count_by_state(&self) -> Result<StateCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as(r#"SELECT state, COUNT(*) FROM bridge_events GROUP BY state"#)
                .fetch_all(&self.pool)
                .await
                .wrap_err("Failed to count events by state")?;

        let (discarded,): (i64,) =
            sqlx::query_as(r#"SELECT COUNT(*) FROM bridge_events WHERE discarded_at IS NOT NULL"#)
                .fetch_one(&self.pool)
                .await
                .wrap_err("Failed to count discarded events")?;

        Ok(StateCounts {
            by_state: rows.into_iter().collect(),
            discarded,
        }
        .zero_filled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_bigint_refuses_wrapping_values() {
        assert_eq!(to_bigint(42, "last_block").unwrap(), 42);
        assert_eq!(to_bigint(i64::MAX as u64, "last_block").unwrap(), i64::MAX);
        let err = to_bigint(i64::MAX as u64 + 1, "last_block").unwrap_err();
        assert!(err.to_string().contains("last_block"));
        assert!(to_bigint(u64::MAX, "log_index").is_err());
    }
}
