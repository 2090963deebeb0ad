//! Per-bridge supported-token registry

use bridge_common::MAX_DECIMALS;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use crate::db::PersistenceStore;
use crate::error::{BridgeError, BridgeResult, ConfigError, IntegrityError, StoreError};
use crate::models::{NewToken, SupportedToken, TokenUpdate};

/// Symbols are stored upper-case
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_ascii_uppercase()
}

fn validate_symbol(symbol: &str) -> Result<(), ConfigError> {
    if symbol.is_empty() || symbol.len() > 32 {
        return Err(ConfigError::InvalidToken(format!(
            "symbol '{}' must be 1-32 characters",
            symbol
        )));
    }
    if !symbol
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
    {
        return Err(ConfigError::InvalidToken(format!(
            "symbol '{}' contains invalid characters",
            symbol
        )));
    }
    Ok(())
}

fn validate_token(token: &SupportedToken) -> Result<(), ConfigError> {
    validate_symbol(&token.symbol)?;
    if token.source_token_address.trim().is_empty() || token.target_token_address.trim().is_empty()
    {
        return Err(ConfigError::InvalidToken(
            "token addresses must not be empty".to_string(),
        ));
    }
    for decimals in [token.source_decimals, token.target_decimals] {
        if decimals > MAX_DECIMALS {
            return Err(ConfigError::InvalidToken(format!(
                "decimals {} exceeds {}",
                decimals, MAX_DECIMALS
            )));
        }
    }
    Ok(())
}

pub struct TokenRegistry {
    store: Arc<dyn PersistenceStore>,
}

impl TokenRegistry {
    pub fn new(store: Arc<dyn PersistenceStore>) -> Self {
        Self { store }
    }

    pub async fn add(&self, bridge_id: i64, token: NewToken) -> BridgeResult<SupportedToken> {
        if self.store.get_bridge(bridge_id).await?.is_none() {
            return Err(BridgeError::not_found("bridge", bridge_id));
        }

        let now = Utc::now();
        let record = SupportedToken {
            bridge_id,
            symbol: normalize_symbol(&token.symbol),
            source_token_address: token.source_token_address.trim().to_string(),
            target_token_address: token.target_token_address.trim().to_string(),
            source_decimals: token.source_decimals,
            target_decimals: token.target_decimals,
            enabled: token.enabled,
            created_at: now,
            updated_at: now,
        };
        validate_token(&record)?;

        let stored = self.store.insert_token(&record).await.map_err(|e| match e {
            StoreError::UniqueViolation(_) => BridgeError::Integrity(IntegrityError::AlreadyExists {
                entity: "token",
                key: format!("{}/{}", bridge_id, record.symbol),
            }),
            other => other.into(),
        })?;

        info!(
            bridge_id,
            symbol = %stored.symbol,
            source_decimals = stored.source_decimals,
            target_decimals = stored.target_decimals,
            "Token added"
        );
        Ok(stored)
    }

    pub async fn update(
        &self,
        bridge_id: i64,
        symbol: &str,
        update: TokenUpdate,
    ) -> BridgeResult<SupportedToken> {
        let mut token = self.get(bridge_id, symbol).await?;
        if let Some(address) = update.source_token_address {
            token.source_token_address = address.trim().to_string();
        }
        if let Some(address) = update.target_token_address {
            token.target_token_address = address.trim().to_string();
        }
        if let Some(decimals) = update.source_decimals {
            token.source_decimals = decimals;
        }
        if let Some(decimals) = update.target_decimals {
            token.target_decimals = decimals;
        }
        validate_token(&token)?;
        Ok(self.store.update_token(&token).await?)
    }

    pub async fn set_enabled(
        &self,
        bridge_id: i64,
        symbol: &str,
        enabled: bool,
    ) -> BridgeResult<SupportedToken> {
        let mut token = self.get(bridge_id, symbol).await?;
        if token.enabled == enabled {
            return Ok(token);
        }
        token.enabled = enabled;
        let stored = self.store.update_token(&token).await?;
        info!(bridge_id, symbol = %stored.symbol, enabled, "Token enablement changed");
        Ok(stored)
    }

    pub async fn get(&self, bridge_id: i64, symbol: &str) -> BridgeResult<SupportedToken> {
        let symbol = normalize_symbol(symbol);
        self.store
            .get_token(bridge_id, &symbol)
            .await?
            .ok_or_else(|| BridgeError::not_found("token", format!("{}/{}", bridge_id, symbol)))
    }

    pub async fn list(&self, bridge_id: i64) -> BridgeResult<Vec<SupportedToken>> {
        Ok(self.store.list_tokens(bridge_id).await?)
    }

    pub async fn is_enabled(&self, bridge_id: i64, symbol: &str) -> BridgeResult<bool> {
        let symbol = normalize_symbol(symbol);
        Ok(self
            .store
            .get_token(bridge_id, &symbol)
            .await?
            .map(|t| t.enabled)
            .unwrap_or(false))
    }

    /// `(source_decimals, target_decimals)`
    pub async fn decimals(&self, bridge_id: i64, symbol: &str) -> BridgeResult<(u8, u8)> {
        let token = self.get(bridge_id, symbol).await?;
        Ok((token.source_decimals, token.target_decimals))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::NewBridge;
    use bigdecimal::BigDecimal;
    use bridge_common::ChainId;

    async fn setup() -> (TokenRegistry, i64) {
        let store = Arc::new(MemoryStore::new());
        let bridge = store
            .insert_bridge(&NewBridge {
                source_network: ChainId::from_u32(1),
                target_network: ChainId::from_u32(56),
                validator_threshold: 1,
                fee: BigDecimal::from(0),
                min_amount: BigDecimal::from(1),
                max_amount: BigDecimal::from(1_000_000),
                required_confirmations: 1,
            })
            .await
            .unwrap();
        (TokenRegistry::new(store), bridge.id)
    }

    fn usdc() -> NewToken {
        NewToken {
            symbol: "usdc".to_string(),
            source_token_address: "0xA0b8".to_string(),
            target_token_address: "0x8AC7".to_string(),
            source_decimals: 6,
            target_decimals: 18,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_add_normalizes_symbol() {
        let (tokens, bridge_id) = setup().await;
        let token = tokens.add(bridge_id, usdc()).await.unwrap();
        assert_eq!(token.symbol, "USDC");
        assert!(tokens.is_enabled(bridge_id, "Usdc").await.unwrap());
        assert_eq!(tokens.decimals(bridge_id, "usdc").await.unwrap(), (6, 18));
    }

    #[tokio::test]
    async fn test_add_rejects_duplicates_and_bad_config() {
        let (tokens, bridge_id) = setup().await;
        tokens.add(bridge_id, usdc()).await.unwrap();
        assert!(matches!(
            tokens.add(bridge_id, usdc()).await,
            Err(BridgeError::Integrity(IntegrityError::AlreadyExists { .. }))
        ));

        let mut bad = usdc();
        bad.symbol = "DAI".into();
        bad.target_decimals = 40;
        assert!(matches!(
            tokens.add(bridge_id, bad).await,
            Err(BridgeError::Config(ConfigError::InvalidToken(_)))
        ));

        assert!(matches!(
            tokens.add(bridge_id + 100, usdc()).await,
            Err(BridgeError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_set_enabled_and_update() {
        let (tokens, bridge_id) = setup().await;
        tokens.add(bridge_id, usdc()).await.unwrap();

        tokens.set_enabled(bridge_id, "USDC", false).await.unwrap();
        assert!(!tokens.is_enabled(bridge_id, "USDC").await.unwrap());
        assert!(!tokens.is_enabled(bridge_id, "WETH").await.unwrap());

        let updated = tokens
            .update(
                bridge_id,
                "USDC",
                TokenUpdate {
                    target_decimals: Some(6),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.target_decimals, 6);
        assert_eq!(tokens.list(bridge_id).await.unwrap().len(), 1);
    }
}
