//! Shared setup for the coordinator integration tests
//!
//! Everything runs against `MemoryStore`; nothing here needs a network or a database.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use bridge_common::{bytes32_from_hex, BridgeStatus, ChainId, TransactionStatus};
use tokio::sync::mpsc;

use coordinator::audit::MemoryAuditSink;
use coordinator::config::{CoordinatorSettings, ProcessorConfig, ValidatorPolicy};
use coordinator::db::{
    AppendOutcome, MemoryStore, PersistenceStore, StoreResult, TransactionPatch, TransitionGuard,
    ValidatorChange, ValidatorUpdate,
};
use coordinator::error::TransientError;
use coordinator::executor::TargetExecutor;
use coordinator::keys::{EcdsaVerifier, KeyManager};
use coordinator::models::{
    Attestation, Bridge, BridgeTransaction, Deposit, ExecutionRequest, NewBridge, NewToken,
    NewTransaction, NewValidator, RejectedAttestation, SubmitOutcome, SupportedToken, Validator,
};
use coordinator::processor::TransactionProcessor;
use coordinator::registry::BridgeRegistry;
use coordinator::retry::RetryConfig;
use coordinator::tokens::TokenRegistry;
use coordinator::transport::{LocalValidatorPool, SignedAttestation};
use coordinator::validators::ValidatorSet;
use coordinator::TransactionCoordinator;

/// How the fake relay answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    /// Executes synchronously
    Complete,
    /// Accepts, the result arrives later via a watcher report
    Accept,
    /// Refuses every request
    Reject,
    /// Unreachable
    Down,
}

/// Target executor that records every request it sees
pub struct FakeRelay {
    mode: Mutex<RelayMode>,
    requests: Mutex<Vec<ExecutionRequest>>,
}

impl FakeRelay {
    pub fn new(mode: RelayMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn set_mode(&self, mode: RelayMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn requests(&self) -> Vec<ExecutionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl TargetExecutor for FakeRelay {
    async fn submit(&self, request: &ExecutionRequest) -> Result<SubmitOutcome, TransientError> {
        self.requests.lock().unwrap().push(request.clone());
        match *self.mode.lock().unwrap() {
            RelayMode::Complete => Ok(SubmitOutcome::Completed {
                target_tx_hash: format!("0xtarget{}a{}", request.transaction_id, request.attempt_id),
            }),
            RelayMode::Accept => Ok(SubmitOutcome::Accepted),
            RelayMode::Reject => Ok(SubmitOutcome::Rejected {
                reason: "recipient blocked".into(),
            }),
            RelayMode::Down => Err(TransientError::Network("connection refused".into())),
        }
    }
}

/// `MemoryStore` whose validator reads return a stale row: the row is read, then the call
/// sleeps for `delay`. Widens the window between a read and the write that follows it.
pub struct SlowValidatorReads {
    inner: MemoryStore,
    delay: Duration,
}

impl SlowValidatorReads {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryStore::new(),
            delay,
        }
    }
}

#[async_trait]
impl PersistenceStore for SlowValidatorReads {
    async fn insert_bridge(&self, bridge: &NewBridge) -> StoreResult<Bridge> {
        self.inner.insert_bridge(bridge).await
    }
    async fn get_bridge(&self, id: i64) -> StoreResult<Option<Bridge>> {
        self.inner.get_bridge(id).await
    }
    async fn list_bridges(&self) -> StoreResult<Vec<Bridge>> {
        self.inner.list_bridges().await
    }
    async fn update_bridge(&self, bridge: &Bridge) -> StoreResult<Bridge> {
        self.inner.update_bridge(bridge).await
    }

    async fn insert_validator(&self, validator: &NewValidator) -> StoreResult<Validator> {
        self.inner.insert_validator(validator).await
    }
    async fn get_validator(&self, id: i64) -> StoreResult<Option<Validator>> {
        let row = self.inner.get_validator(id).await;
        tokio::time::sleep(self.delay).await;
        row
    }
    async fn list_validators(&self, bridge_id: i64) -> StoreResult<Vec<Validator>> {
        self.inner.list_validators(bridge_id).await
    }
    async fn list_all_validators(&self) -> StoreResult<Vec<Validator>> {
        let rows = self.inner.list_all_validators().await;
        tokio::time::sleep(self.delay).await;
        rows
    }
    async fn update_validator(
        &self,
        id: i64,
        update: &ValidatorUpdate,
    ) -> StoreResult<Option<ValidatorChange>> {
        self.inner.update_validator(id, update).await
    }

    async fn insert_token(&self, token: &SupportedToken) -> StoreResult<SupportedToken> {
        self.inner.insert_token(token).await
    }
    async fn get_token(&self, bridge_id: i64, symbol: &str) -> StoreResult<Option<SupportedToken>> {
        self.inner.get_token(bridge_id, symbol).await
    }
    async fn list_tokens(&self, bridge_id: i64) -> StoreResult<Vec<SupportedToken>> {
        self.inner.list_tokens(bridge_id).await
    }
    async fn update_token(&self, token: &SupportedToken) -> StoreResult<SupportedToken> {
        self.inner.update_token(token).await
    }

    async fn insert_transaction_if_absent(
        &self,
        tx: &NewTransaction,
    ) -> StoreResult<(BridgeTransaction, bool)> {
        self.inner.insert_transaction_if_absent(tx).await
    }
    async fn get_transaction(&self, id: i64) -> StoreResult<Option<BridgeTransaction>> {
        self.inner.get_transaction(id).await
    }
    async fn find_transaction_by_source(
        &self,
        bridge_id: i64,
        source_tx_hash: &str,
    ) -> StoreResult<Option<BridgeTransaction>> {
        self.inner.find_transaction_by_source(bridge_id, source_tx_hash).await
    }
    async fn compare_and_set(
        &self,
        id: i64,
        guard: TransitionGuard,
        patch: &TransactionPatch,
    ) -> StoreResult<Option<BridgeTransaction>> {
        self.inner.compare_and_set(id, guard, patch).await
    }
    async fn list_transactions_by_status(
        &self,
        statuses: &[TransactionStatus],
        limit: i64,
    ) -> StoreResult<Vec<BridgeTransaction>> {
        self.inner.list_transactions_by_status(statuses, limit).await
    }
    async fn count_transactions_by_status(&self, status: TransactionStatus) -> StoreResult<i64> {
        self.inner.count_transactions_by_status(status).await
    }

    async fn append_attestation(&self, attestation: &Attestation) -> StoreResult<AppendOutcome> {
        self.inner.append_attestation(attestation).await
    }
    async fn list_attestations(&self, transaction_id: i64) -> StoreResult<Vec<Attestation>> {
        self.inner.list_attestations(transaction_id).await
    }
    async fn count_attestations(&self, transaction_id: i64) -> StoreResult<i64> {
        self.inner.count_attestations(transaction_id).await
    }
    async fn record_rejected_attestation(&self, rejected: &RejectedAttestation) -> StoreResult<()> {
        self.inner.record_rejected_attestation(rejected).await
    }
    async fn list_rejected_attestations(
        &self,
        transaction_id: i64,
    ) -> StoreResult<Vec<RejectedAttestation>> {
        self.inner.list_rejected_attestations(transaction_id).await
    }
}

pub struct Options {
    pub threshold: i32,
    pub validators: usize,
    pub required_confirmations: i64,
    pub source_decimals: u8,
    pub target_decimals: u8,
    pub relay: RelayMode,
    /// Sign through a `LocalValidatorPool` instead of keeping keys in the harness
    pub local_pool: bool,
    /// Back the harness with [`SlowValidatorReads`]
    pub validator_read_delay: Option<Duration>,
    pub settings: CoordinatorSettings,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            threshold: 2,
            validators: 3,
            required_confirmations: 2,
            source_decimals: 6,
            target_decimals: 6,
            relay: RelayMode::Complete,
            local_pool: false,
            validator_read_delay: None,
            settings: CoordinatorSettings {
                retry: RetryConfig::immediate(2),
                ..Default::default()
            },
        }
    }
}

pub struct TestBridge {
    pub store: Arc<dyn PersistenceStore>,
    pub validators: Arc<ValidatorSet>,
    pub bridges: Arc<BridgeRegistry>,
    pub tokens: Arc<TokenRegistry>,
    pub coordinator: Arc<TransactionCoordinator>,
    pub audit: Arc<MemoryAuditSink>,
    pub relay: Arc<FakeRelay>,
    pub pool: Option<Arc<LocalValidatorPool>>,
    pub inbox: Option<mpsc::UnboundedReceiver<SignedAttestation>>,
    /// Signing keys by validator id (empty when `local_pool` is set)
    pub keys: Vec<(i64, KeyManager)>,
    pub validator_ids: Vec<i64>,
    pub bridge_id: i64,
}

pub async fn setup(options: Options) -> TestBridge {
    let store: Arc<dyn PersistenceStore> = match options.validator_read_delay {
        Some(delay) => Arc::new(SlowValidatorReads::new(delay)),
        None => Arc::new(MemoryStore::new()),
    };
    let validators = Arc::new(ValidatorSet::new(
        store.clone(),
        Arc::new(EcdsaVerifier),
        ValidatorPolicy::default(),
    ));
    let bridges = Arc::new(BridgeRegistry::new(store.clone(), validators.clone()));
    let tokens = Arc::new(TokenRegistry::new(store.clone()));

    let bridge = bridges
        .create(NewBridge {
            source_network: ChainId::from_u32(1),
            target_network: ChainId::from_u32(56),
            validator_threshold: options.threshold,
            fee: BigDecimal::from(0),
            min_amount: BigDecimal::from(1),
            max_amount: "1000000000000000000000000".parse().unwrap(),
            required_confirmations: options.required_confirmations,
        })
        .await
        .unwrap();
    tokens
        .add(
            bridge.id,
            NewToken {
                symbol: "USDC".into(),
                source_token_address: "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48".into(),
                target_token_address: "0x8ac76a51cc950d9822d68b83fe1ad97b32cd580d".into(),
                source_decimals: options.source_decimals,
                target_decimals: options.target_decimals,
                enabled: true,
            },
        )
        .await
        .unwrap();

    let (pool, inbox) = if options.local_pool {
        let (pool, inbox) = LocalValidatorPool::channel();
        (Some(Arc::new(pool)), Some(inbox))
    } else {
        (None, None)
    };

    let mut keys = Vec::new();
    let mut validator_ids = Vec::new();
    for i in 0..options.validators {
        let key = KeyManager::generate();
        let validator = validators
            .register(bridge.id, &format!("0xvalidator{}", i), &key.public_key_hex().unwrap())
            .await
            .unwrap();
        validators.heartbeat(validator.id).await.unwrap();
        validator_ids.push(validator.id);
        match &pool {
            Some(pool) => {
                pool.insert(validator.id, key).await.unwrap();
            }
            None => keys.push((validator.id, key)),
        }
    }
    bridges.set_status(bridge.id, BridgeStatus::Active).await.unwrap();

    let audit = Arc::new(MemoryAuditSink::new());
    let relay = Arc::new(FakeRelay::new(options.relay));
    let mut coordinator = TransactionCoordinator::new(
        store.clone(),
        bridges.clone(),
        validators.clone(),
        tokens.clone(),
        relay.clone(),
        options.settings,
    )
    .with_audit(audit.clone())
    .with_settlement(audit.clone());
    if let Some(pool) = &pool {
        coordinator = coordinator.with_transport(pool.clone());
    }

    TestBridge {
        store,
        validators,
        bridges,
        tokens,
        coordinator: Arc::new(coordinator),
        audit,
        relay,
        pool,
        inbox,
        keys,
        validator_ids,
        bridge_id: bridge.id,
    }
}

pub fn deposit(bridge_id: i64, source_tx_hash: &str, amount: u64) -> Deposit {
    Deposit {
        bridge_id,
        source_tx_hash: source_tx_hash.into(),
        source_address: "0x1111111111111111111111111111111111111111".into(),
        target_address: "0x2222222222222222222222222222222222222222".into(),
        amount: BigDecimal::from(amount),
        token_symbol: "USDC".into(),
        confirmations: 0,
    }
}

impl TestBridge {
    pub fn processor(&self) -> TransactionProcessor {
        TransactionProcessor::new(
            self.coordinator.clone(),
            self.bridges.clone(),
            self.validators.clone(),
            ProcessorConfig {
                poll_interval_ms: 10,
                batch_size: 50,
            },
        )
    }

    /// Report a deposit with enough confirmations to reach `SOURCE_CONFIRMED`
    pub async fn confirmed(&self, source_tx_hash: &str) -> BridgeTransaction {
        let mut d = deposit(self.bridge_id, source_tx_hash, 50_000_000);
        d.confirmations = 100;
        let tx = self.coordinator.report_deposit(&d).await.unwrap();
        assert_eq!(tx.status, TransactionStatus::SourceConfirmed);
        tx
    }

    pub async fn pending_validation(&self, source_tx_hash: &str) -> BridgeTransaction {
        let tx = self.confirmed(source_tx_hash).await;
        self.coordinator.request_validation(tx.id).await.unwrap()
    }

    pub fn key(&self, validator_id: i64) -> &KeyManager {
        &self
            .keys
            .iter()
            .find(|(id, _)| *id == validator_id)
            .expect("no key for validator")
            .1
    }

    pub fn sign(&self, tx: &BridgeTransaction, validator_id: i64) -> String {
        let hash = bytes32_from_hex(&tx.payload_hash).unwrap();
        self.key(validator_id).sign(&hash).unwrap()
    }

    /// Submit attestations from the first `n` validators with keys
    pub async fn attest(&self, tx: &BridgeTransaction, n: usize) -> BridgeTransaction {
        let mut last = tx.clone();
        for (id, _) in self.keys.iter().take(n) {
            last = self
                .coordinator
                .submit_attestation(tx.id, *id, &self.sign(tx, *id))
                .await
                .unwrap()
                .transaction;
        }
        last
    }

    pub async fn validated(&self, source_tx_hash: &str) -> BridgeTransaction {
        let tx = self.pending_validation(source_tx_hash).await;
        let threshold = tx.quorum_threshold.unwrap() as usize;
        let tx = self.attest(&tx, threshold).await;
        assert_eq!(tx.status, TransactionStatus::Validated);
        tx
    }

    /// Statuses entered by `tx_id`, in order
    pub fn status_trail(&self, tx_id: i64) -> Vec<TransactionStatus> {
        self.audit.events_for(tx_id).iter().map(|e| e.to).collect()
    }

    /// Poll the store until `tx_id` reaches `status`
    pub async fn wait_for_status(&self, tx_id: i64, status: TransactionStatus) -> BridgeTransaction {
        for _ in 0..200 {
            let tx = self.coordinator.get(tx_id).await.unwrap();
            if tx.status == status {
                return tx;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("transaction {} never reached {}", tx_id, status);
    }
}
