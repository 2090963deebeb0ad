//! Postgres store (sqlx)

use async_trait::async_trait;
use bridge_common::TransactionStatus;
use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};

use super::models::{
    AttestationRow, BridgeRow, RejectedAttestationRow, TokenRow, TransactionRow, ValidatorRow,
};
use super::{
    AppendOutcome, PersistenceStore, StoreResult, TransactionPatch, TransitionGuard,
    ValidatorChange, ValidatorUpdate,
};
use crate::error::StoreError;
use crate::models::{
    Attestation, Bridge, BridgeTransaction, NewBridge, NewTransaction, NewValidator,
    RejectedAttestation, SupportedToken, Validator,
};

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
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

/// SQL SELECT columns for bridges (casting NUMERIC to TEXT)
const BRIDGE_SELECT: &str = r#"id, source_network, target_network, status, validator_threshold,
    fee::TEXT as fee, min_amount::TEXT as min_amount, max_amount::TEXT as max_amount,
    required_confirmations, created_at, updated_at"#;

const VALIDATOR_SELECT: &str = r#"id, bridge_id, address, public_key, status, reputation,
    last_heartbeat, created_at, updated_at"#;

const TOKEN_SELECT: &str = r#"bridge_id, symbol, source_token_address, target_token_address,
    source_decimals, target_decimals, enabled, created_at, updated_at"#;

/// SQL SELECT columns for bridge_transactions (casting NUMERIC to TEXT)
const TRANSACTION_SELECT: &str = r#"id, bridge_id, source_tx_hash, source_address,
    target_address, amount::TEXT as amount, token_symbol, target_amount::TEXT as target_amount,
    rescale_dust::TEXT as rescale_dust, status, confirmations, payload_hash, quorum_threshold,
    validator_roster, execution_attempt_id, execution_retries, target_tx_hash, error_message,
    refund_required, created_at, updated_at, status_changed_at, completed_at"#;

/// Map a sqlx error, keeping unique violations distinguishable
fn db_err(context: &str) -> impl Fn(sqlx::Error) -> StoreError + '_ {
    move |e| match &e {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            StoreError::UniqueViolation(format!("{}: {}", context, db.message()))
        }
        _ => StoreError::Backend(format!("{}: {}", context, e)),
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl PersistenceStore for PgStore {
    async fn insert_bridge(&self, bridge: &NewBridge) -> StoreResult<Bridge> {
        let query = format!(
            r#"INSERT INTO bridges (source_network, target_network, status, validator_threshold,
                fee, min_amount, max_amount, required_confirmations)
            VALUES ($1, $2, 'INACTIVE', $3, $4::NUMERIC, $5::NUMERIC, $6::NUMERIC, $7)
            RETURNING {}"#,
            BRIDGE_SELECT
        );
        let row = sqlx::query_as::<_, BridgeRow>(&query)
            .bind(bridge.source_network.to_u32() as i64)
            .bind(bridge.target_network.to_u32() as i64)
            .bind(bridge.validator_threshold)
            .bind(bridge.fee.to_string())
            .bind(bridge.min_amount.to_string())
            .bind(bridge.max_amount.to_string())
            .bind(bridge.required_confirmations)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("Failed to insert bridge"))?;
        row.try_into()
    }

    async fn get_bridge(&self, id: i64) -> StoreResult<Option<Bridge>> {
        let query = format!("SELECT {} FROM bridges WHERE id = $1", BRIDGE_SELECT);
        sqlx::query_as::<_, BridgeRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("Failed to get bridge"))?
            .map(Bridge::try_from)
            .transpose()
    }

    async fn list_bridges(&self) -> StoreResult<Vec<Bridge>> {
        let query = format!("SELECT {} FROM bridges ORDER BY id", BRIDGE_SELECT);
        sqlx::query_as::<_, BridgeRow>(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("Failed to list bridges"))?
            .into_iter()
            .map(Bridge::try_from)
            .collect()
    }

    async fn update_bridge(&self, bridge: &Bridge) -> StoreResult<Bridge> {
        let query = format!(
            r#"UPDATE bridges SET status = $2, validator_threshold = $3, fee = $4::NUMERIC,
                min_amount = $5::NUMERIC, max_amount = $6::NUMERIC, required_confirmations = $7,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {}"#,
            BRIDGE_SELECT
        );
        let row = sqlx::query_as::<_, BridgeRow>(&query)
            .bind(bridge.id)
            .bind(bridge.status.as_str())
            .bind(bridge.validator_threshold)
            .bind(bridge.fee.to_string())
            .bind(bridge.min_amount.to_string())
            .bind(bridge.max_amount.to_string())
            .bind(bridge.required_confirmations)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("Failed to update bridge"))?;
        row.try_into()
    }

    async fn insert_validator(&self, validator: &NewValidator) -> StoreResult<Validator> {
        let query = format!(
            r#"INSERT INTO validators (bridge_id, address, public_key, status, reputation)
            VALUES ($1, $2, $3, 'PENDING', $4)
            RETURNING {}"#,
            VALIDATOR_SELECT
        );
        let row = sqlx::query_as::<_, ValidatorRow>(&query)
            .bind(validator.bridge_id)
            .bind(&validator.address)
            .bind(&validator.public_key)
            .bind(validator.reputation)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("Failed to insert validator"))?;
        row.try_into()
    }

    async fn get_validator(&self, id: i64) -> StoreResult<Option<Validator>> {
        let query = format!("SELECT {} FROM validators WHERE id = $1", VALIDATOR_SELECT);
        sqlx::query_as::<_, ValidatorRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("Failed to get validator"))?
            .map(Validator::try_from)
            .transpose()
    }

    async fn list_validators(&self, bridge_id: i64) -> StoreResult<Vec<Validator>> {
        let query = format!(
            "SELECT {} FROM validators WHERE bridge_id = $1 ORDER BY id",
            VALIDATOR_SELECT
        );
        sqlx::query_as::<_, ValidatorRow>(&query)
            .bind(bridge_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("Failed to list validators"))?
            .into_iter()
            .map(Validator::try_from)
            .collect()
    }

    async fn list_all_validators(&self) -> StoreResult<Vec<Validator>> {
        let query = format!("SELECT {} FROM validators ORDER BY id", VALIDATOR_SELECT);
        sqlx::query_as::<_, ValidatorRow>(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("Failed to list validators"))?
            .into_iter()
            .map(Validator::try_from)
            .collect()
    }

    async fn update_validator(
        &self,
        id: i64,
        update: &ValidatorUpdate,
    ) -> StoreResult<Option<ValidatorChange>> {
        let context = "Failed to update validator";
        let mut db_tx = self.pool.begin().await.map_err(db_err(context))?;

        let query = format!("SELECT {} FROM validators WHERE id = $1 FOR UPDATE", VALIDATOR_SELECT);
        let Some(row) = sqlx::query_as::<_, ValidatorRow>(&query)
            .bind(id)
            .fetch_optional(&mut *db_tx)
            .await
            .map_err(db_err(context))?
        else {
            return Ok(None);
        };
        let previous = Validator::try_from(row)?;
        let mut next = previous.clone();
        // Dropping db_tx rolls back and releases the row lock
        if !update.apply(&mut next) {
            return Ok(None);
        }

        let query = format!(
            r#"UPDATE validators SET public_key = $2, status = $3, reputation = $4,
                last_heartbeat = $5, updated_at = NOW()
            WHERE id = $1
            RETURNING {}"#,
            VALIDATOR_SELECT
        );
        let row = sqlx::query_as::<_, ValidatorRow>(&query)
            .bind(id)
            .bind(&next.public_key)
            .bind(next.status.as_str())
            .bind(next.reputation)
            .bind(next.last_heartbeat)
            .fetch_one(&mut *db_tx)
            .await
            .map_err(db_err(context))?;
        db_tx.commit().await.map_err(db_err(context))?;

        Ok(Some(ValidatorChange {
            previous,
            validator: row.try_into()?,
        }))
    }

    async fn insert_token(&self, token: &SupportedToken) -> StoreResult<SupportedToken> {
        let query = format!(
            r#"INSERT INTO supported_tokens (bridge_id, symbol, source_token_address,
                target_token_address, source_decimals, target_decimals, enabled)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {}"#,
            TOKEN_SELECT
        );
        let row = sqlx::query_as::<_, TokenRow>(&query)
            .bind(token.bridge_id)
            .bind(&token.symbol)
            .bind(&token.source_token_address)
            .bind(&token.target_token_address)
            .bind(token.source_decimals as i16)
            .bind(token.target_decimals as i16)
            .bind(token.enabled)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("Failed to insert token"))?;
        row.try_into()
    }

    async fn get_token(&self, bridge_id: i64, symbol: &str) -> StoreResult<Option<SupportedToken>> {
        let query = format!(
            "SELECT {} FROM supported_tokens WHERE bridge_id = $1 AND symbol = $2",
            TOKEN_SELECT
        );
        sqlx::query_as::<_, TokenRow>(&query)
            .bind(bridge_id)
            .bind(symbol)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("Failed to get token"))?
            .map(SupportedToken::try_from)
            .transpose()
    }

    async fn list_tokens(&self, bridge_id: i64) -> StoreResult<Vec<SupportedToken>> {
        let query = format!(
            "SELECT {} FROM supported_tokens WHERE bridge_id = $1 ORDER BY symbol",
            TOKEN_SELECT
        );
        sqlx::query_as::<_, TokenRow>(&query)
            .bind(bridge_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("Failed to list tokens"))?
            .into_iter()
            .map(SupportedToken::try_from)
            .collect()
    }

    async fn update_token(&self, token: &SupportedToken) -> StoreResult<SupportedToken> {
        let query = format!(
            r#"UPDATE supported_tokens SET source_token_address = $3, target_token_address = $4,
                source_decimals = $5, target_decimals = $6, enabled = $7, updated_at = NOW()
            WHERE bridge_id = $1 AND symbol = $2
            RETURNING {}"#,
            TOKEN_SELECT
        );
        let row = sqlx::query_as::<_, TokenRow>(&query)
            .bind(token.bridge_id)
            .bind(&token.symbol)
            .bind(&token.source_token_address)
            .bind(&token.target_token_address)
            .bind(token.source_decimals as i16)
            .bind(token.target_decimals as i16)
            .bind(token.enabled)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("Failed to update token"))?;
        row.try_into()
    }

    async fn insert_transaction_if_absent(
        &self,
        tx: &NewTransaction,
    ) -> StoreResult<(BridgeTransaction, bool)> {
        let query = format!(
            r#"INSERT INTO bridge_transactions (bridge_id, source_tx_hash, source_address,
                target_address, amount, token_symbol, target_amount, rescale_dust, payload_hash)
            VALUES ($1, $2, $3, $4, $5::NUMERIC, $6, $7::NUMERIC, $8::NUMERIC, $9)
            ON CONFLICT (bridge_id, source_tx_hash) DO NOTHING
            RETURNING {}"#,
            TRANSACTION_SELECT
        );
        let inserted = sqlx::query_as::<_, TransactionRow>(&query)
            .bind(tx.bridge_id)
            .bind(&tx.source_tx_hash)
            .bind(&tx.source_address)
            .bind(&tx.target_address)
            .bind(tx.amount.to_string())
            .bind(&tx.token_symbol)
            .bind(tx.target_amount.to_string())
            .bind(tx.rescale_dust.to_string())
            .bind(&tx.payload_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("Failed to insert transaction"))?;

        if let Some(row) = inserted {
            return Ok((row.try_into()?, true));
        }

        let existing = self
            .find_transaction_by_source(tx.bridge_id, &tx.source_tx_hash)
            .await?
            .ok_or_else(|| {
                StoreError::Backend(format!(
                    "transaction {} conflicted but could not be read back",
                    tx.source_tx_hash
                ))
            })?;
        Ok((existing, false))
    }

    async fn get_transaction(&self, id: i64) -> StoreResult<Option<BridgeTransaction>> {
        let query = format!(
            "SELECT {} FROM bridge_transactions WHERE id = $1",
            TRANSACTION_SELECT
        );
        sqlx::query_as::<_, TransactionRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("Failed to get transaction"))?
            .map(BridgeTransaction::try_from)
            .transpose()
    }

    async fn find_transaction_by_source(
        &self,
        bridge_id: i64,
        source_tx_hash: &str,
    ) -> StoreResult<Option<BridgeTransaction>> {
        let query = format!(
            "SELECT {} FROM bridge_transactions WHERE bridge_id = $1 AND source_tx_hash = $2",
            TRANSACTION_SELECT
        );
        sqlx::query_as::<_, TransactionRow>(&query)
            .bind(bridge_id)
            .bind(source_tx_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("Failed to find transaction by source"))?
            .map(BridgeTransaction::try_from)
            .transpose()
    }

    async fn compare_and_set(
        &self,
        id: i64,
        guard: TransitionGuard,
        patch: &TransactionPatch,
    ) -> StoreResult<Option<BridgeTransaction>> {
        // SET expressions all see the pre-update row, so the CASE compares against the old status
        let query = format!(
            r#"UPDATE bridge_transactions SET
                status = COALESCE($4::VARCHAR, status),
                status_changed_at = CASE
                    WHEN $4::VARCHAR IS NOT NULL AND $4::VARCHAR <> status THEN NOW()
                    ELSE status_changed_at END,
                confirmations = COALESCE($5::BIGINT, confirmations),
                quorum_threshold = COALESCE($6::INTEGER, quorum_threshold),
                validator_roster = COALESCE($7::BIGINT[], validator_roster),
                execution_attempt_id = COALESCE($8::BIGINT, execution_attempt_id),
                execution_retries = COALESCE($9::INTEGER, execution_retries),
                target_tx_hash = COALESCE($10::VARCHAR, target_tx_hash),
                error_message = COALESCE($11::TEXT, error_message),
                completed_at = COALESCE($12::TIMESTAMPTZ, completed_at),
                refund_required = COALESCE($13::BOOLEAN, refund_required),
                updated_at = NOW()
            WHERE id = $1 AND status = $2 AND execution_attempt_id = $3
            RETURNING {}"#,
            TRANSACTION_SELECT
        );
        sqlx::query_as::<_, TransactionRow>(&query)
            .bind(id)
            .bind(guard.status.as_str())
            .bind(guard.execution_attempt_id)
            .bind(patch.status.map(|s| s.as_str()))
            .bind(patch.confirmations)
            .bind(patch.quorum_threshold)
            .bind(patch.validator_roster.clone())
            .bind(patch.execution_attempt_id)
            .bind(patch.execution_retries)
            .bind(patch.target_tx_hash.as_deref())
            .bind(patch.error_message.as_deref())
            .bind(patch.completed_at)
            .bind(patch.refund_required)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("Failed to compare-and-set transaction"))?
            .map(BridgeTransaction::try_from)
            .transpose()
    }

    async fn list_transactions_by_status(
        &self,
        statuses: &[TransactionStatus],
        limit: i64,
    ) -> StoreResult<Vec<BridgeTransaction>> {
        let query = format!(
            "SELECT {} FROM bridge_transactions WHERE status = ANY($1) ORDER BY created_at, id LIMIT $2",
            TRANSACTION_SELECT
        );
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        sqlx::query_as::<_, TransactionRow>(&query)
            .bind(statuses)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("Failed to list transactions by status"))?
            .into_iter()
            .map(BridgeTransaction::try_from)
            .collect()
    }

    async fn count_transactions_by_status(&self, status: TransactionStatus) -> StoreResult<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM bridge_transactions WHERE status = $1")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("Failed to count transactions"))
    }

    async fn append_attestation(&self, attestation: &Attestation) -> StoreResult<AppendOutcome> {
        // FOR SHARE makes a concurrent status UPDATE wait for this insert, or makes this
        // insert see the committed status
        let result = sqlx::query(
            r#"INSERT INTO attestations (transaction_id, validator_id, signature, created_at)
            SELECT $1, $2, $3, $4
            WHERE EXISTS (
                SELECT 1 FROM bridge_transactions
                WHERE id = $1 AND status = 'PENDING_VALIDATION'
                FOR SHARE
            )
            ON CONFLICT (transaction_id, validator_id) DO NOTHING"#,
        )
        .bind(attestation.transaction_id)
        .bind(attestation.validator_id)
        .bind(&attestation.signature)
        .bind(attestation.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err("Failed to append attestation"))?;
        if result.rows_affected() == 1 {
            return Ok(AppendOutcome::Appended);
        }

        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM attestations WHERE transaction_id = $1 AND validator_id = $2)",
        )
        .bind(attestation.transaction_id)
        .bind(attestation.validator_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("Failed to check attestation"))?;
        if exists {
            return Ok(AppendOutcome::Duplicate);
        }

        let status = sqlx::query_scalar::<_, String>("SELECT status FROM bridge_transactions WHERE id = $1")
            .bind(attestation.transaction_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("Failed to read transaction status"))?
            .ok_or_else(|| {
                StoreError::Backend(format!("transaction {} missing", attestation.transaction_id))
            })?;
        let status: TransactionStatus = status
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("transaction status: {}", e)))?;
        Ok(AppendOutcome::Closed(status))
    }

    async fn list_attestations(&self, transaction_id: i64) -> StoreResult<Vec<Attestation>> {
        let rows = sqlx::query_as::<_, AttestationRow>(
            r#"SELECT transaction_id, validator_id, signature, created_at
            FROM attestations WHERE transaction_id = $1 ORDER BY created_at, validator_id"#,
        )
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("Failed to list attestations"))?;

        Ok(rows.into_iter().map(Attestation::from).collect())
    }

    async fn count_attestations(&self, transaction_id: i64) -> StoreResult<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM attestations WHERE transaction_id = $1")
            .bind(transaction_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("Failed to count attestations"))
    }

    async fn record_rejected_attestation(
        &self,
        rejected: &RejectedAttestation,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO rejected_attestations (transaction_id, validator_id, signature, reason, created_at)
            VALUES ($1, $2, $3, $4, $5)"#,
        )
        .bind(rejected.transaction_id)
        .bind(rejected.validator_id)
        .bind(&rejected.signature)
        .bind(&rejected.reason)
        .bind(rejected.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err("Failed to record rejected attestation"))?;

        Ok(())
    }

    async fn list_rejected_attestations(
        &self,
        transaction_id: i64,
    ) -> StoreResult<Vec<RejectedAttestation>> {
        let rows = sqlx::query_as::<_, RejectedAttestationRow>(
            r#"SELECT transaction_id, validator_id, signature, reason, created_at
            FROM rejected_attestations WHERE transaction_id = $1 ORDER BY id"#,
        )
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("Failed to list rejected attestations"))?;

        Ok(rows.into_iter().map(RejectedAttestation::from).collect())
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_err("Database ping failed"))?;
        Ok(())
    }
}
