//! In-memory store
//!
//! Each table sits behind its own `tokio::sync::RwLock`. Operations that must be atomic
//! (insert-if-absent, compare-and-set, validator updates) hold the table's write lock for
//! the whole check-then-write. An attestation append also holds the transactions read lock,
//! so no compare-and-set can move the transaction while the append decides.

use async_trait::async_trait;
use bridge_common::{TransactionStatus, ValidatorStatus};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::RwLock;

use super::{
    AppendOutcome, PersistenceStore, StoreResult, TransactionPatch, TransitionGuard,
    ValidatorChange, ValidatorUpdate,
};
use crate::error::StoreError;
use crate::models::{
    Attestation, Bridge, BridgeTransaction, NewBridge, NewTransaction, NewValidator,
    RejectedAttestation, SupportedToken, Validator,
};

#[derive(Default)]
struct TransactionTable {
    rows: HashMap<i64, BridgeTransaction>,
    by_source: HashMap<(i64, String), i64>,
}

#[derive(Default)]
pub struct MemoryStore {
    next_id: AtomicI64,
    bridges: RwLock<HashMap<i64, Bridge>>,
    validators: RwLock<HashMap<i64, Validator>>,
    tokens: RwLock<HashMap<(i64, String), SupportedToken>>,
    transactions: RwLock<TransactionTable>,
    attestations: RwLock<HashMap<i64, Vec<Attestation>>>,
    rejected: RwLock<Vec<RejectedAttestation>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn insert_bridge(&self, bridge: &NewBridge) -> StoreResult<Bridge> {
        let now = Utc::now();
        let row = Bridge {
            id: self.next_id(),
            source_network: bridge.source_network,
            target_network: bridge.target_network,
            status: bridge_common::BridgeStatus::Inactive,
            validator_threshold: bridge.validator_threshold,
            fee: bridge.fee.clone(),
            min_amount: bridge.min_amount.clone(),
            max_amount: bridge.max_amount.clone(),
            required_confirmations: bridge.required_confirmations,
            created_at: now,
            updated_at: now,
        };
        self.bridges.write().await.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_bridge(&self, id: i64) -> StoreResult<Option<Bridge>> {
        Ok(self.bridges.read().await.get(&id).cloned())
    }

    async fn list_bridges(&self) -> StoreResult<Vec<Bridge>> {
        let mut rows: Vec<Bridge> = self.bridges.read().await.values().cloned().collect();
        rows.sort_by_key(|b| b.id);
        Ok(rows)
    }

    async fn update_bridge(&self, bridge: &Bridge) -> StoreResult<Bridge> {
        let mut bridges = self.bridges.write().await;
        let row = bridges
            .get_mut(&bridge.id)
            .ok_or_else(|| StoreError::Backend(format!("bridge {} missing", bridge.id)))?;
        *row = bridge.clone();
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn insert_validator(&self, validator: &NewValidator) -> StoreResult<Validator> {
        let mut validators = self.validators.write().await;
        if validators
            .values()
            .any(|v| v.bridge_id == validator.bridge_id && v.address == validator.address)
        {
            return Err(StoreError::UniqueViolation(format!(
                "validator {} on bridge {}",
                validator.address, validator.bridge_id
            )));
        }
        let now = Utc::now();
        let row = Validator {
            id: self.next_id(),
            bridge_id: validator.bridge_id,
            address: validator.address.clone(),
            public_key: validator.public_key.clone(),
            status: ValidatorStatus::Pending,
            reputation: validator.reputation,
            last_heartbeat: None,
            created_at: now,
            updated_at: now,
        };
        validators.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_validator(&self, id: i64) -> StoreResult<Option<Validator>> {
        Ok(self.validators.read().await.get(&id).cloned())
    }

    async fn list_validators(&self, bridge_id: i64) -> StoreResult<Vec<Validator>> {
        let mut rows: Vec<Validator> = self
            .validators
            .read()
            .await
            .values()
            .filter(|v| v.bridge_id == bridge_id)
            .cloned()
            .collect();
        rows.sort_by_key(|v| v.id);
        Ok(rows)
    }

    async fn list_all_validators(&self) -> StoreResult<Vec<Validator>> {
        let mut rows: Vec<Validator> = self.validators.read().await.values().cloned().collect();
        rows.sort_by_key(|v| v.id);
        Ok(rows)
    }

    async fn update_validator(
        &self,
        id: i64,
        update: &ValidatorUpdate,
    ) -> StoreResult<Option<ValidatorChange>> {
        let mut validators = self.validators.write().await;
        let Some(row) = validators.get_mut(&id) else {
            return Ok(None);
        };
        let previous = row.clone();
        if !update.apply(row) {
            return Ok(None);
        }
        row.updated_at = Utc::now();
        Ok(Some(ValidatorChange {
            previous,
            validator: row.clone(),
        }))
    }

    async fn insert_token(&self, token: &SupportedToken) -> StoreResult<SupportedToken> {
        let mut tokens = self.tokens.write().await;
        let key = (token.bridge_id, token.symbol.clone());
        if tokens.contains_key(&key) {
            return Err(StoreError::UniqueViolation(format!(
                "token {} on bridge {}",
                token.symbol, token.bridge_id
            )));
        }
        let now = Utc::now();
        let mut row = token.clone();
        row.created_at = now;
        row.updated_at = now;
        tokens.insert(key, row.clone());
        Ok(row)
    }

    async fn get_token(&self, bridge_id: i64, symbol: &str) -> StoreResult<Option<SupportedToken>> {
        Ok(self
            .tokens
            .read()
            .await
            .get(&(bridge_id, symbol.to_string()))
            .cloned())
    }

    async fn list_tokens(&self, bridge_id: i64) -> StoreResult<Vec<SupportedToken>> {
        let mut rows: Vec<SupportedToken> = self
            .tokens
            .read()
            .await
            .values()
            .filter(|t| t.bridge_id == bridge_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(rows)
    }

    async fn update_token(&self, token: &SupportedToken) -> StoreResult<SupportedToken> {
        let mut tokens = self.tokens.write().await;
        let row = tokens
            .get_mut(&(token.bridge_id, token.symbol.clone()))
            .ok_or_else(|| StoreError::Backend(format!("token {} missing", token.symbol)))?;
        *row = token.clone();
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn insert_transaction_if_absent(
        &self,
        tx: &NewTransaction,
    ) -> StoreResult<(BridgeTransaction, bool)> {
        let mut table = self.transactions.write().await;
        let key = (tx.bridge_id, tx.source_tx_hash.clone());
        if let Some(id) = table.by_source.get(&key) {
            let existing = table
                .rows
                .get(id)
                .cloned()
                .ok_or_else(|| StoreError::Corrupt(format!("dangling source index {}", id)))?;
            return Ok((existing, false));
        }

        let now = Utc::now();
        let row = BridgeTransaction {
            id: self.next_id(),
            bridge_id: tx.bridge_id,
            source_tx_hash: tx.source_tx_hash.clone(),
            source_address: tx.source_address.clone(),
            target_address: tx.target_address.clone(),
            amount: tx.amount.clone(),
            token_symbol: tx.token_symbol.clone(),
            target_amount: tx.target_amount.clone(),
            rescale_dust: tx.rescale_dust.clone(),
            status: TransactionStatus::Initiated,
            confirmations: 0,
            payload_hash: tx.payload_hash.clone(),
            quorum_threshold: None,
            validator_roster: Vec::new(),
            execution_attempt_id: 0,
            execution_retries: 0,
            target_tx_hash: None,
            error_message: None,
            refund_required: false,
            created_at: now,
            updated_at: now,
            status_changed_at: now,
            completed_at: None,
        };
        table.by_source.insert(key, row.id);
        table.rows.insert(row.id, row.clone());
        Ok((row, true))
    }

    async fn get_transaction(&self, id: i64) -> StoreResult<Option<BridgeTransaction>> {
        Ok(self.transactions.read().await.rows.get(&id).cloned())
    }

    async fn find_transaction_by_source(
        &self,
        bridge_id: i64,
        source_tx_hash: &str,
    ) -> StoreResult<Option<BridgeTransaction>> {
        let table = self.transactions.read().await;
        Ok(table
            .by_source
            .get(&(bridge_id, source_tx_hash.to_string()))
            .and_then(|id| table.rows.get(id))
            .cloned())
    }

    async fn compare_and_set(
        &self,
        id: i64,
        guard: TransitionGuard,
        patch: &TransactionPatch,
    ) -> StoreResult<Option<BridgeTransaction>> {
        let mut table = self.transactions.write().await;
        let Some(row) = table.rows.get_mut(&id) else {
            return Ok(None);
        };
        if row.status != guard.status || row.execution_attempt_id != guard.execution_attempt_id {
            return Ok(None);
        }
        patch.apply(row, Utc::now());
        Ok(Some(row.clone()))
    }

    async fn list_transactions_by_status(
        &self,
        statuses: &[TransactionStatus],
        limit: i64,
    ) -> StoreResult<Vec<BridgeTransaction>> {
        let table = self.transactions.read().await;
        let mut rows: Vec<BridgeTransaction> = table
            .rows
            .values()
            .filter(|tx| statuses.contains(&tx.status))
            .cloned()
            .collect();
        rows.sort_by_key(|tx| (tx.created_at, tx.id));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn count_transactions_by_status(&self, status: TransactionStatus) -> StoreResult<i64> {
        let table = self.transactions.read().await;
        Ok(table.rows.values().filter(|tx| tx.status == status).count() as i64)
    }

    async fn append_attestation(&self, attestation: &Attestation) -> StoreResult<AppendOutcome> {
        let table = self.transactions.read().await;
        let status = table
            .rows
            .get(&attestation.transaction_id)
            .map(|tx| tx.status)
            .ok_or_else(|| {
                StoreError::Backend(format!("transaction {} missing", attestation.transaction_id))
            })?;

        let mut attestations = self.attestations.write().await;
        let entries = attestations.entry(attestation.transaction_id).or_default();
        if entries
            .iter()
            .any(|a| a.validator_id == attestation.validator_id)
        {
            return Ok(AppendOutcome::Duplicate);
        }
        if status != TransactionStatus::PendingValidation {
            return Ok(AppendOutcome::Closed(status));
        }
        entries.push(attestation.clone());
        Ok(AppendOutcome::Appended)
    }

    async fn list_attestations(&self, transaction_id: i64) -> StoreResult<Vec<Attestation>> {
        Ok(self
            .attestations
            .read()
            .await
            .get(&transaction_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn count_attestations(&self, transaction_id: i64) -> StoreResult<i64> {
        Ok(self
            .attestations
            .read()
            .await
            .get(&transaction_id)
            .map(|a| a.len() as i64)
            .unwrap_or(0))
    }

    async fn record_rejected_attestation(
        &self,
        rejected: &RejectedAttestation,
    ) -> StoreResult<()> {
        self.rejected.write().await.push(rejected.clone());
        Ok(())
    }

    async fn list_rejected_attestations(
        &self,
        transaction_id: i64,
    ) -> StoreResult<Vec<RejectedAttestation>> {
        Ok(self
            .rejected
            .read()
            .await
            .iter()
            .filter(|r| r.transaction_id == transaction_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ValidatorGuard;
    use bigdecimal::BigDecimal;
    use std::sync::Arc;

    fn new_tx(hash: &str) -> NewTransaction {
        NewTransaction {
            bridge_id: 1,
            source_tx_hash: hash.to_string(),
            source_address: "0xa".to_string(),
            target_address: "0xb".to_string(),
            amount: BigDecimal::from(100),
            token_symbol: "USDC".to_string(),
            target_amount: BigDecimal::from(100),
            rescale_dust: BigDecimal::from(0),
            payload_hash: "0x00".to_string(),
        }
    }

    #[tokio::test]
    async fn test_insert_if_absent_dedups_on_source() {
        let store = MemoryStore::new();
        let (first, created) = store.insert_transaction_if_absent(&new_tx("0x1")).await.unwrap();
        assert!(created);
        let (second, created) = store.insert_transaction_if_absent(&new_tx("0x1")).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);

        let (other, created) = store.insert_transaction_if_absent(&new_tx("0x2")).await.unwrap();
        assert!(created);
        assert_ne!(other.id, first.id);
    }

    #[tokio::test]
    async fn test_compare_and_set_checks_guard() {
        let store = MemoryStore::new();
        let (tx, _) = store.insert_transaction_if_absent(&new_tx("0x1")).await.unwrap();
        let guard = TransitionGuard::for_transaction(&tx);
        let patch = TransactionPatch::status(TransactionStatus::PendingSourceConfirmation);

        let updated = store.compare_and_set(tx.id, guard, &patch).await.unwrap();
        assert_eq!(
            updated.map(|t| t.status),
            Some(TransactionStatus::PendingSourceConfirmation)
        );

        // Same stale guard loses
        let again = store.compare_and_set(tx.id, guard, &patch).await.unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_cas_has_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let (tx, _) = store.insert_transaction_if_absent(&new_tx("0x1")).await.unwrap();
        let guard = TransitionGuard::for_transaction(&tx);
        let id = tx.id;

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .compare_and_set(
                            id,
                            guard,
                            &TransactionPatch::status(TransactionStatus::Failed),
                        )
                        .await
                        .unwrap()
                        .is_some()
                })
            })
            .collect();

        let winners = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(winners, 1);
    }

    async fn pending_validation(store: &MemoryStore, hash: &str) -> BridgeTransaction {
        let (tx, _) = store.insert_transaction_if_absent(&new_tx(hash)).await.unwrap();
        store
            .compare_and_set(
                tx.id,
                TransitionGuard::for_transaction(&tx),
                &TransactionPatch::status(TransactionStatus::PendingValidation),
            )
            .await
            .unwrap()
            .unwrap()
    }

    fn attestation(transaction_id: i64, validator_id: i64) -> Attestation {
        Attestation {
            transaction_id,
            validator_id,
            signature: "0xsig".to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_append_attestation_is_idempotent() {
        let store = MemoryStore::new();
        let tx = pending_validation(&store, "0x1").await;
        let attestation = attestation(tx.id, 7);
        assert_eq!(
            store.append_attestation(&attestation).await.unwrap(),
            AppendOutcome::Appended
        );
        assert_eq!(
            store.append_attestation(&attestation).await.unwrap(),
            AppendOutcome::Duplicate
        );
        assert_eq!(store.count_attestations(tx.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_append_attestation_needs_pending_validation() {
        let store = MemoryStore::new();
        let tx = pending_validation(&store, "0x1").await;
        store
            .compare_and_set(
                tx.id,
                TransitionGuard::for_transaction(&tx),
                &TransactionPatch::status(TransactionStatus::Failed),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            store.append_attestation(&attestation(tx.id, 7)).await.unwrap(),
            AppendOutcome::Closed(TransactionStatus::Failed)
        );
        assert_eq!(store.count_attestations(tx.id).await.unwrap(), 0);
        assert!(store.append_attestation(&attestation(999, 7)).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reputation_deltas_all_apply() {
        let store = Arc::new(MemoryStore::new());
        let id = store
            .insert_validator(&NewValidator {
                bridge_id: 1,
                address: "0xval".to_string(),
                public_key: "02ab".to_string(),
                reputation: 50,
            })
            .await
            .unwrap()
            .id;

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .update_validator(
                            id,
                            &ValidatorUpdate::Reputation {
                                delta: -10,
                                min: 0,
                                max: 100,
                            },
                        )
                        .await
                        .unwrap()
                })
            })
            .collect();
        for result in futures::future::join_all(handles).await {
            assert!(result.unwrap().is_some());
        }
        assert_eq!(store.get_validator(id).await.unwrap().unwrap().reputation, 10);
    }

    #[tokio::test]
    async fn test_guarded_status_change_skips_moved_row() {
        let store = MemoryStore::new();
        let v = store
            .insert_validator(&NewValidator {
                bridge_id: 1,
                address: "0xval".to_string(),
                public_key: "02ab".to_string(),
                reputation: 50,
            })
            .await
            .unwrap();
        let snapshot = ValidatorGuard::for_validator(&v);
        store
            .update_validator(
                v.id,
                &ValidatorUpdate::Heartbeat {
                    at: Utc::now(),
                    promote_above: 20,
                },
            )
            .await
            .unwrap()
            .unwrap();

        let suspend = ValidatorUpdate::Status {
            status: ValidatorStatus::Suspended,
            expected: Some(snapshot),
        };
        assert!(store.update_validator(v.id, &suspend).await.unwrap().is_none());
        assert_eq!(
            store.get_validator(v.id).await.unwrap().unwrap().status,
            ValidatorStatus::Active
        );
        assert!(store.update_validator(999, &suspend).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_validator_address_unique_per_bridge() {
        let store = MemoryStore::new();
        let v = NewValidator {
            bridge_id: 1,
            address: "0xval".to_string(),
            public_key: "02ab".to_string(),
            reputation: 50,
        };
        store.insert_validator(&v).await.unwrap();
        assert!(matches!(
            store.insert_validator(&v).await,
            Err(StoreError::UniqueViolation(_))
        ));
        let other_bridge = NewValidator { bridge_id: 2, ..v };
        assert!(store.insert_validator(&other_bridge).await.is_ok());
    }
}
