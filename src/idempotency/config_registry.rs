use crate::error::{AppError, Result};
use crate::idempotency::retry::RetryPolicy;
use crate::models::OperationConfig;
use crate::observability::get_metrics;
use crate::repositories::ConfigRepository;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Read-through cache of operation policies. Updates are administrative and
/// rare, so lookups take a shared lock and only misses touch the repository.
pub struct ConfigRegistry {
    repository: Arc<dyn ConfigRepository>,
    cache: RwLock<HashMap<(String, String), OperationConfig>>,
    retry: RetryPolicy,
}

impl ConfigRegistry {
    pub fn new(repository: Arc<dyn ConfigRepository>, retry: RetryPolicy) -> Self {
        Self {
            repository,
            cache: RwLock::new(HashMap::new()),
            retry,
        }
    }

    /// Warms the cache with every config the repository holds.
    pub async fn load(&self) -> Result<usize> {
        let configs = self
            .retry
            .run("load_configs", || self.repository.load_all())
            .await?;

        let mut cache = self.cache.write().await;
        for config in configs {
            cache.insert((config.service.clone(), config.operation.clone()), config);
        }
        get_metrics().set_registered_operations(cache.len());
        tracing::info!("Loaded {} idempotent operation configs", cache.len());

        Ok(cache.len())
    }

    /// Persists a policy and makes it visible to subsequent lookups.
    pub async fn register(&self, config: OperationConfig) -> Result<()> {
        config.validate()?;
        self.retry
            .run("upsert_config", || self.repository.upsert_config(&config))
            .await?;

        tracing::info!(
            service = %config.service,
            operation = %config.operation,
            lock_duration_ms = config.lock_duration_ms(),
            allow_save_on_expired = config.allow_save_on_expired,
            "Registered idempotent operation config"
        );

        let mut cache = self.cache.write().await;
        cache.insert((config.service.clone(), config.operation.clone()), config);
        get_metrics().set_registered_operations(cache.len());

        Ok(())
    }

    /// Looks up the policy; absence is `ConfigurationMissing`, never a default.
    pub async fn get(&self, service: &str, operation: &str) -> Result<OperationConfig> {
        let cache_key = (service.to_string(), operation.to_string());
        if let Some(config) = self.cache.read().await.get(&cache_key) {
            return Ok(config.clone());
        }

        let found = self
            .retry
            .run("find_config", || self.repository.find_config(service, operation))
            .await?;

        match found {
            Some(config) => {
                self.cache.write().await.insert(cache_key, config.clone());
                Ok(config)
            }
            None => {
                tracing::warn!(service, operation, "No idempotency configuration registered");
                Err(AppError::ConfigurationMissing {
                    service: service.to_string(),
                    operation: operation.to_string(),
                })
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }
}
