//! Bridge configuration registry
//!
//! Sole writer of bridge configuration. A bridge's status gates new deposits only;
//! transactions already in flight on a bridge in `MAINTENANCE` or `DEPRECATED` still run
//! to completion.

use bigdecimal::{BigDecimal, Zero};
use bridge_common::BridgeStatus;
use std::sync::Arc;
use tracing::info;

use crate::db::PersistenceStore;
use crate::error::{BridgeError, BridgeResult, ConfigError};
use crate::models::{Bridge, BridgeUpdate, NewBridge};
use crate::validators::ValidatorSet;

struct Limits<'a> {
    threshold: i32,
    fee: &'a BigDecimal,
    min_amount: &'a BigDecimal,
    max_amount: &'a BigDecimal,
    required_confirmations: i64,
}

fn validate_limits(limits: &Limits<'_>) -> Result<(), ConfigError> {
    if limits.threshold < 1 {
        return Err(ConfigError::InvalidBridge(
            "validator_threshold must be at least 1".into(),
        ));
    }
    if limits.required_confirmations < 1 {
        return Err(ConfigError::InvalidBridge(
            "required_confirmations must be at least 1".into(),
        ));
    }
    if *limits.fee < BigDecimal::zero() {
        return Err(ConfigError::InvalidBridge("fee must not be negative".into()));
    }
    if *limits.min_amount < BigDecimal::zero() {
        return Err(ConfigError::InvalidBridge(
            "min_amount must not be negative".into(),
        ));
    }
    if limits.min_amount > limits.max_amount {
        return Err(ConfigError::InvalidBridge(format!(
            "min_amount {} exceeds max_amount {}",
            limits.min_amount, limits.max_amount
        )));
    }
    Ok(())
}

pub struct BridgeRegistry {
    store: Arc<dyn PersistenceStore>,
    validators: Arc<ValidatorSet>,
}

impl BridgeRegistry {
    pub fn new(store: Arc<dyn PersistenceStore>, validators: Arc<ValidatorSet>) -> Self {
        Self { store, validators }
    }

    /// Create a bridge. New bridges start `INACTIVE` since no validator is active yet.
    pub async fn create(&self, bridge: NewBridge) -> BridgeResult<Bridge> {
        if bridge.source_network == bridge.target_network {
            return Err(ConfigError::InvalidBridge(
                "source and target networks must differ".into(),
            )
            .into());
        }
        validate_limits(&Limits {
            threshold: bridge.validator_threshold,
            fee: &bridge.fee,
            min_amount: &bridge.min_amount,
            max_amount: &bridge.max_amount,
            required_confirmations: bridge.required_confirmations,
        })?;

        let created = self.store.insert_bridge(&bridge).await?;
        info!(
            bridge_id = created.id,
            source = %created.source_network,
            target = %created.target_network,
            threshold = created.validator_threshold,
            "Bridge created"
        );
        Ok(created)
    }

    pub async fn get(&self, id: i64) -> BridgeResult<Bridge> {
        self.store
            .get_bridge(id)
            .await?
            .ok_or_else(|| BridgeError::not_found("bridge", id))
    }

    pub async fn list(&self) -> BridgeResult<Vec<Bridge>> {
        Ok(self.store.list_bridges().await?)
    }

    async fn eligible_count(&self, bridge_id: i64) -> BridgeResult<usize> {
        Ok(self.validators.list_active(bridge_id).await?.len())
    }

    async fn check_threshold(&self, bridge_id: i64, threshold: i32) -> BridgeResult<()> {
        let eligible = self.eligible_count(bridge_id).await?;
        if threshold as usize > eligible {
            return Err(ConfigError::ThresholdExceedsValidators {
                threshold,
                eligible,
            }
            .into());
        }
        Ok(())
    }

    /// Partial update. Raising the threshold above the eligible validator count is
    /// rejected; lowering it is always allowed.
    pub async fn update(&self, id: i64, update: BridgeUpdate) -> BridgeResult<Bridge> {
        let mut bridge = self.get(id).await?;
        if bridge.status == BridgeStatus::Deprecated {
            return Err(ConfigError::BridgeDeprecated { bridge_id: id }.into());
        }

        let threshold = update.validator_threshold.unwrap_or(bridge.validator_threshold);
        let fee = update.fee.unwrap_or_else(|| bridge.fee.clone());
        let min_amount = update.min_amount.unwrap_or_else(|| bridge.min_amount.clone());
        let max_amount = update.max_amount.unwrap_or_else(|| bridge.max_amount.clone());
        let required_confirmations = update
            .required_confirmations
            .unwrap_or(bridge.required_confirmations);

        validate_limits(&Limits {
            threshold,
            fee: &fee,
            min_amount: &min_amount,
            max_amount: &max_amount,
            required_confirmations,
        })?;
        if threshold > bridge.validator_threshold {
            self.check_threshold(id, threshold).await?;
        }

        let previous_threshold = bridge.validator_threshold;
        bridge.validator_threshold = threshold;
        bridge.fee = fee;
        bridge.min_amount = min_amount;
        bridge.max_amount = max_amount;
        bridge.required_confirmations = required_confirmations;

        let stored = self.store.update_bridge(&bridge).await?;
        info!(
            bridge_id = id,
            previous_threshold,
            threshold = stored.validator_threshold,
            required_confirmations = stored.required_confirmations,
            "Bridge configuration updated"
        );
        Ok(stored)
    }

    /// Change operational status. `DEPRECATED` is final; activation needs enough
    /// eligible validators to meet the threshold.
    pub async fn set_status(&self, id: i64, status: BridgeStatus) -> BridgeResult<Bridge> {
        let mut bridge = self.get(id).await?;
        if bridge.status == status {
            return Ok(bridge);
        }
        if bridge.status == BridgeStatus::Deprecated {
            return Err(ConfigError::BridgeDeprecated { bridge_id: id }.into());
        }
        if status == BridgeStatus::Active {
            self.check_threshold(id, bridge.validator_threshold).await?;
        }

        let previous = bridge.status;
        bridge.status = status;
        let stored = self.store.update_bridge(&bridge).await?;
        info!(bridge_id = id, from = %previous, to = %status, "Bridge status changed");
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidatorPolicy;
    use crate::db::MemoryStore;
    use crate::keys::{EcdsaVerifier, KeyManager};
    use bridge_common::ChainId;

    fn new_bridge(threshold: i32) -> NewBridge {
        NewBridge {
            source_network: ChainId::from_u32(1),
            target_network: ChainId::from_u32(137),
            validator_threshold: threshold,
            fee: BigDecimal::from(0),
            min_amount: BigDecimal::from(1),
            max_amount: BigDecimal::from(1_000_000_000),
            required_confirmations: 12,
        }
    }

    fn setup() -> (BridgeRegistry, Arc<ValidatorSet>) {
        let store: Arc<dyn PersistenceStore> = Arc::new(MemoryStore::new());
        let validators = Arc::new(ValidatorSet::new(
            store.clone(),
            Arc::new(EcdsaVerifier),
            ValidatorPolicy::default(),
        ));
        (BridgeRegistry::new(store, validators.clone()), validators)
    }

    async fn add_active_validators(validators: &ValidatorSet, bridge_id: i64, count: usize) {
        for i in 0..count {
            let key = KeyManager::generate().public_key_hex().unwrap();
            let v = validators
                .register(bridge_id, &format!("0xval{}", i), &key)
                .await
                .unwrap();
            validators.heartbeat(v.id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_create_validates_config() {
        let (registry, _) = setup();

        let mut same_network = new_bridge(1);
        same_network.target_network = same_network.source_network;
        assert!(registry.create(same_network).await.is_err());

        let mut inverted = new_bridge(1);
        inverted.min_amount = BigDecimal::from(10);
        inverted.max_amount = BigDecimal::from(5);
        assert!(registry.create(inverted).await.is_err());

        assert!(registry.create(new_bridge(0)).await.is_err());

        let mut negative_fee = new_bridge(1);
        negative_fee.fee = BigDecimal::from(-1);
        assert!(registry.create(negative_fee).await.is_err());

        let created = registry.create(new_bridge(1)).await.unwrap();
        assert_eq!(created.status, BridgeStatus::Inactive);
    }

    #[tokio::test]
    async fn test_activation_requires_enough_validators() {
        let (registry, validators) = setup();
        let bridge = registry.create(new_bridge(2)).await.unwrap();

        add_active_validators(&validators, bridge.id, 1).await;
        assert!(matches!(
            registry.set_status(bridge.id, BridgeStatus::Active).await,
            Err(BridgeError::Config(ConfigError::ThresholdExceedsValidators {
                threshold: 2,
                eligible: 1
            }))
        ));

        add_active_validators(&validators, bridge.id, 1).await;
        let active = registry.set_status(bridge.id, BridgeStatus::Active).await.unwrap();
        assert!(active.status.accepts_deposits());
    }

    #[tokio::test]
    async fn test_threshold_update_gated_by_eligible_count() {
        let (registry, validators) = setup();
        let bridge = registry.create(new_bridge(1)).await.unwrap();
        add_active_validators(&validators, bridge.id, 3).await;

        let raise = |t| BridgeUpdate {
            validator_threshold: Some(t),
            ..Default::default()
        };
        assert!(registry.update(bridge.id, raise(4)).await.is_err());
        assert_eq!(
            registry.update(bridge.id, raise(3)).await.unwrap().validator_threshold,
            3
        );
        assert_eq!(
            registry.update(bridge.id, raise(2)).await.unwrap().validator_threshold,
            2
        );
    }

    #[tokio::test]
    async fn test_deprecated_is_final() {
        let (registry, _) = setup();
        let bridge = registry.create(new_bridge(1)).await.unwrap();
        registry
            .set_status(bridge.id, BridgeStatus::Deprecated)
            .await
            .unwrap();

        assert!(matches!(
            registry.set_status(bridge.id, BridgeStatus::Active).await,
            Err(BridgeError::Config(ConfigError::BridgeDeprecated { .. }))
        ));
        assert!(registry
            .update(bridge.id, BridgeUpdate::default())
            .await
            .is_err());
    }
}
