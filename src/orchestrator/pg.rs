//! PostgreSQL-backed transaction store
//!
//! Rows keep hot columns (state, escalated, expires_at, updated_at) for the
//! CAS predicates and recovery scans, and the full record as a JSONB payload.
//! The payload is the record of truth; hot columns are patched back onto the
//! decoded record on load so a half-applied read can never be observed.
//!
//! Consumed hashes and stray deposits rely on `INSERT ... ON CONFLICT DO
//! NOTHING` for their insert-if-absent semantics.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;

use super::error::OrchestratorError;
use super::state::TxState;
use super::store::TransactionStore;
use super::types::{Compensation, DepositRecord, StrayDeposit, Transaction};
use crate::adapters::SettlementReceipt;
use crate::adapters::conversion::ConversionAttempt;
use crate::types::{ChainTxHash, TransactionId};
use crate::watcher::watch::{DepositWatch, MatchedTransfer, WatchState};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS transactions_tb (
    id          TEXT PRIMARY KEY,
    state       SMALLINT    NOT NULL,
    user_id     BIGINT      NOT NULL,
    escalated   BOOLEAN     NOT NULL DEFAULT FALSE,
    expires_at  TIMESTAMPTZ NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    payload     JSONB       NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_transactions_state ON transactions_tb (state);

CREATE TABLE IF NOT EXISTS consumed_hashes_tb (
    chain_tx_hash  TEXT PRIMARY KEY,
    transaction_id TEXT        NOT NULL,
    claimed_at     TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS deposit_watch_tb (
    transaction_id TEXT PRIMARY KEY,
    state          SMALLINT NOT NULL,
    payload        JSONB    NOT NULL
);

CREATE TABLE IF NOT EXISTS stray_deposits_tb (
    chain_tx_hash TEXT PRIMARY KEY,
    payload       JSONB       NOT NULL,
    recorded_at   TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS chain_cursor_tb (
    chain_id TEXT PRIMARY KEY,
    height   BIGINT NOT NULL
);
"#;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str) -> Result<Self, OrchestratorError> {
        let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), OrchestratorError> {
        for stmt in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn decode_tx(row: &PgRow) -> Result<Transaction, OrchestratorError> {
    let Json(mut tx): Json<Transaction> = row.try_get("payload")?;
    // Hot columns win over any stale copy inside the payload
    let state_id: i16 = row.try_get("state")?;
    if let Some(state) = TxState::from_id(state_id) {
        tx.state = state;
    }
    tx.escalated = row.try_get("escalated")?;
    tx.updated_at = row.try_get("updated_at")?;
    Ok(tx)
}

fn decode_watch(row: &PgRow) -> Result<DepositWatch, OrchestratorError> {
    let Json(mut watch): Json<DepositWatch> = row.try_get("payload")?;
    let state_id: i16 = row.try_get("state")?;
    if let Some(state) = WatchState::from_id(state_id) {
        watch.state = state;
    }
    Ok(watch)
}

#[async_trait]
impl TransactionStore for PgStore {
    async fn create_transaction(&self, tx: &Transaction) -> Result<(), OrchestratorError> {
        sqlx::query(
            "INSERT INTO transactions_tb (id, state, user_id, escalated, expires_at, updated_at, payload) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&tx.id)
        .bind(tx.state.id())
        .bind(tx.user_id as i64)
        .bind(tx.escalated)
        .bind(tx.expires_at)
        .bind(tx.updated_at)
        .bind(Json(tx))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_transaction(
        &self,
        id: &TransactionId,
    ) -> Result<Option<Transaction>, OrchestratorError> {
        let row = sqlx::query("SELECT state, escalated, updated_at, payload FROM transactions_tb WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_tx).transpose()
    }

    async fn update_state_if(
        &self,
        id: &TransactionId,
        expected: TxState,
        new: TxState,
    ) -> Result<bool, OrchestratorError> {
        let result = sqlx::query(
            "UPDATE transactions_tb \
             SET state = $3, payload = jsonb_set(payload, '{state}', $4), updated_at = now() \
             WHERE id = $1 AND state = $2",
        )
        .bind(id)
        .bind(expected.id())
        .bind(new.id())
        .bind(Json(new))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_transaction(id).await? {
            Some(_) => Ok(false),
            None => Err(OrchestratorError::NotFound(id.clone())),
        }
    }

    async fn update_state_with_error(
        &self,
        id: &TransactionId,
        expected: TxState,
        new: TxState,
        error: &str,
    ) -> Result<bool, OrchestratorError> {
        let result = sqlx::query(
            "UPDATE transactions_tb \
             SET state = $3, \
                 payload = jsonb_set(jsonb_set(payload, '{state}', $4), '{last_error}', $5), \
                 updated_at = now() \
             WHERE id = $1 AND state = $2",
        )
        .bind(id)
        .bind(expected.id())
        .bind(new.id())
        .bind(Json(new))
        .bind(Json(error))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_transaction(id).await? {
            Some(_) => Ok(false),
            None => Err(OrchestratorError::NotFound(id.clone())),
        }
    }

    async fn increment_retry(&self, id: &TransactionId) -> Result<(), OrchestratorError> {
        let result = sqlx::query(
            "UPDATE transactions_tb \
             SET payload = jsonb_set(payload, '{retry_count}', \
                 to_jsonb(COALESCE((payload->>'retry_count')::int, 0) + 1)), \
                 updated_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(id.clone()));
        }
        Ok(())
    }

    async fn set_deposit(
        &self,
        id: &TransactionId,
        deposit: &DepositRecord,
    ) -> Result<(), OrchestratorError> {
        let result = sqlx::query(
            "UPDATE transactions_tb \
             SET payload = jsonb_set(payload, '{deposit}', $2), updated_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(Json(deposit))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(id.clone()));
        }
        Ok(())
    }

    async fn append_conversion_attempts(
        &self,
        id: &TransactionId,
        attempts: &[ConversionAttempt],
    ) -> Result<(), OrchestratorError> {
        sqlx::query(
            "UPDATE transactions_tb \
             SET payload = jsonb_set(payload, '{conversion,attempts}', \
                 COALESCE(payload #> '{conversion,attempts}', '[]'::jsonb) || $2), \
                 updated_at = now() \
             WHERE id = $1 AND payload->'conversion' IS NOT NULL \
                          AND payload->'conversion' <> 'null'::jsonb",
        )
        .bind(id)
        .bind(Json(attempts))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_settlement_receipt(
        &self,
        id: &TransactionId,
        receipt: &SettlementReceipt,
    ) -> Result<(), OrchestratorError> {
        let result = sqlx::query(
            "UPDATE transactions_tb \
             SET payload = jsonb_set(payload, '{settlement_receipt}', $2), updated_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(Json(receipt))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(id.clone()));
        }
        Ok(())
    }

    async fn set_compensation_if_absent(
        &self,
        id: &TransactionId,
        compensation: &Compensation,
    ) -> Result<bool, OrchestratorError> {
        let result = sqlx::query(
            "UPDATE transactions_tb \
             SET payload = jsonb_set(payload, '{compensation}', $2), updated_at = now() \
             WHERE id = $1 AND payload->'compensation' = 'null'::jsonb",
        )
        .bind(id)
        .bind(Json(compensation))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_transaction(id).await? {
            Some(_) => Ok(false),
            None => Err(OrchestratorError::NotFound(id.clone())),
        }
    }

    async fn mark_escalated(&self, id: &TransactionId) -> Result<(), OrchestratorError> {
        let result = sqlx::query(
            "UPDATE transactions_tb \
             SET escalated = TRUE, \
                 payload = jsonb_set(payload, '{escalated}', 'true'::jsonb), \
                 updated_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(id.clone()));
        }
        Ok(())
    }

    async fn claim_deposit_hash(
        &self,
        hash: &ChainTxHash,
        id: &TransactionId,
    ) -> Result<bool, OrchestratorError> {
        let result = sqlx::query(
            "INSERT INTO consumed_hashes_tb (chain_tx_hash, transaction_id) \
             VALUES ($1, $2) ON CONFLICT (chain_tx_hash) DO NOTHING",
        )
        .bind(hash)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn is_hash_consumed(&self, hash: &ChainTxHash) -> Result<bool, OrchestratorError> {
        let row: (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM consumed_hashes_tb WHERE chain_tx_hash = $1)",
        )
        .bind(hash)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn put_watch(&self, watch: &DepositWatch) -> Result<(), OrchestratorError> {
        sqlx::query(
            "INSERT INTO deposit_watch_tb (transaction_id, state, payload) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (transaction_id) DO UPDATE SET state = $2, payload = $3",
        )
        .bind(&watch.transaction_id)
        .bind(watch.state.id())
        .bind(Json(watch))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_watch(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<Option<DepositWatch>, OrchestratorError> {
        let row = sqlx::query("SELECT state, payload FROM deposit_watch_tb WHERE transaction_id = $1")
            .bind(transaction_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_watch).transpose()
    }

    async fn active_watches(&self) -> Result<Vec<DepositWatch>, OrchestratorError> {
        let terminal: Vec<i16> = [WatchState::Consumed, WatchState::Expired]
            .iter()
            .map(|s| s.id())
            .collect();
        let rows = sqlx::query("SELECT state, payload FROM deposit_watch_tb WHERE state <> ALL($1)")
            .bind(&terminal)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode_watch).collect()
    }

    async fn update_watch_state_if(
        &self,
        transaction_id: &TransactionId,
        expected: WatchState,
        new: WatchState,
    ) -> Result<bool, OrchestratorError> {
        let result = sqlx::query(
            "UPDATE deposit_watch_tb \
             SET state = $3, payload = jsonb_set(payload, '{state}', $4) \
             WHERE transaction_id = $1 AND state = $2",
        )
        .bind(transaction_id)
        .bind(expected.id())
        .bind(new.id())
        .bind(Json(new))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_watch_match(
        &self,
        transaction_id: &TransactionId,
        matched: &MatchedTransfer,
    ) -> Result<bool, OrchestratorError> {
        let result = sqlx::query(
            "UPDATE deposit_watch_tb \
             SET state = $2, \
                 payload = jsonb_set(jsonb_set(payload, '{state}', $3), '{matched}', $4) \
             WHERE transaction_id = $1 AND state = $5",
        )
        .bind(transaction_id)
        .bind(WatchState::Matched.id())
        .bind(Json(WatchState::Matched))
        .bind(Json(matched))
        .bind(WatchState::Armed.id())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_stray(&self, stray: &StrayDeposit) -> Result<bool, OrchestratorError> {
        let result = sqlx::query(
            "INSERT INTO stray_deposits_tb (chain_tx_hash, payload) \
             VALUES ($1, $2) ON CONFLICT (chain_tx_hash) DO NOTHING",
        )
        .bind(&stray.chain_tx_hash)
        .bind(Json(stray))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn stray_deposits(&self) -> Result<Vec<StrayDeposit>, OrchestratorError> {
        let rows = sqlx::query("SELECT payload FROM stray_deposits_tb ORDER BY recorded_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let Json(stray): Json<StrayDeposit> = row.try_get("payload")?;
                Ok(stray)
            })
            .collect()
    }

    async fn cursor(&self, chain_id: &str) -> Result<Option<u64>, OrchestratorError> {
        let row = sqlx::query("SELECT height FROM chain_cursor_tb WHERE chain_id = $1")
            .bind(chain_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("height") as u64))
    }

    async fn set_cursor(&self, chain_id: &str, height: u64) -> Result<(), OrchestratorError> {
        sqlx::query(
            "INSERT INTO chain_cursor_tb (chain_id, height) VALUES ($1, $2) \
             ON CONFLICT (chain_id) DO UPDATE SET height = $2",
        )
        .bind(chain_id)
        .bind(height as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_stale(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, OrchestratorError> {
        let terminal: Vec<i16> = [TxState::Completed, TxState::Failed, TxState::Expired]
            .iter()
            .map(|s| s.id())
            .collect();
        let rows = sqlx::query(
            "SELECT state, escalated, updated_at, payload FROM transactions_tb \
             WHERE state <> ALL($1) AND escalated = FALSE AND updated_at < $2",
        )
        .bind(&terminal)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_tx).collect()
    }

    async fn find_deposit_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, OrchestratorError> {
        let rows = sqlx::query(
            "SELECT state, escalated, updated_at, payload FROM transactions_tb \
             WHERE state = $1 AND expires_at <= $2",
        )
        .bind(TxState::Initiated.id())
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_tx).collect()
    }
}
