//! Provider Pool
//!
//! Ranked list of chain providers with per-provider circuit-breaker state.
//! Callers run closures through `with_healthy`; a failing provider is marked
//! degraded for a cooldown window and the call fails over to the next one.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::error::ProviderError;
use super::rpc::ChainProvider;

/// Circuit-breaker state per provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProviderHealth {
    Healthy,
    /// Out of rotation until the cooldown instant
    Degraded { until: tokio::time::Instant },
}

struct RankedProvider {
    provider: Arc<dyn ChainProvider>,
    health: Mutex<ProviderHealth>,
}

/// Ordered provider pool with failover
pub struct ProviderPool {
    providers: Vec<RankedProvider>,
    cooldown: Duration,
}

impl ProviderPool {
    pub fn new(providers: Vec<Arc<dyn ChainProvider>>, cooldown: Duration) -> Self {
        Self {
            providers: providers
                .into_iter()
                .map(|provider| RankedProvider {
                    provider,
                    health: Mutex::new(ProviderHealth::Healthy),
                })
                .collect(),
            cooldown,
        }
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Run `f` against the highest-priority healthy provider, failing over on
    /// error. Degraded providers re-enter rotation after the cooldown. Fails
    /// only when every provider has been tried.
    pub async fn with_healthy<T, F, Fut>(&self, f: F) -> Result<T, ProviderError>
    where
        F: Fn(Arc<dyn ChainProvider>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut tried = 0usize;

        for ranked in &self.providers {
            {
                let mut health = ranked.health.lock().await;
                if let ProviderHealth::Degraded { until } = *health {
                    if tokio::time::Instant::now() < until {
                        continue;
                    }
                    // Cooldown elapsed - give it another chance
                    *health = ProviderHealth::Healthy;
                }
            }

            tried += 1;
            match f(ranked.provider.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(
                        provider = %ranked.provider.name(),
                        code = e.code(),
                        error = %e,
                        "Provider call failed, marking degraded"
                    );
                    let mut health = ranked.health.lock().await;
                    *health = ProviderHealth::Degraded {
                        until: tokio::time::Instant::now() + self.cooldown,
                    };
                }
            }
        }

        debug!(tried, "Provider pool exhausted");
        Err(ProviderError::Exhausted(tried))
    }

    /// Names of providers currently in rotation (for health reporting)
    pub async fn healthy_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        let now = tokio::time::Instant::now();
        for ranked in &self.providers {
            let health = ranked.health.lock().await;
            match *health {
                ProviderHealth::Healthy => names.push(ranked.provider.name().to_string()),
                ProviderHealth::Degraded { until } if now >= until => {
                    names.push(ranked.provider.name().to_string())
                }
                _ => {}
            }
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::MockProvider;

    fn pool_of(providers: Vec<Arc<dyn ChainProvider>>) -> ProviderPool {
        ProviderPool::new(providers, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_uses_highest_priority_provider() {
        let primary = Arc::new(MockProvider::new("primary"));
        primary.set_latest_block(100);
        let fallback = Arc::new(MockProvider::new("fallback"));
        fallback.set_latest_block(999);

        let pool = pool_of(vec![primary, fallback]);
        let height = pool.with_healthy(|p| async move { p.latest_block().await }).await;
        assert_eq!(height.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_fails_over_in_rank_order() {
        let primary = Arc::new(MockProvider::new("primary"));
        primary.fail_next(10);
        let fallback = Arc::new(MockProvider::new("fallback"));
        fallback.set_latest_block(555);

        let pool = pool_of(vec![primary.clone(), fallback]);
        let height = pool
            .with_healthy(|p| async move { p.latest_block().await })
            .await
            .unwrap();
        assert_eq!(height, 555);

        // Primary now degraded - next call skips it entirely
        let names = pool.healthy_names().await;
        assert_eq!(names, vec!["fallback".to_string()]);
    }

    #[tokio::test]
    async fn test_exhausted_when_all_fail() {
        let a = Arc::new(MockProvider::new("a"));
        a.fail_next(10);
        let b = Arc::new(MockProvider::new("b"));
        b.fail_next(10);

        let pool = pool_of(vec![a, b]);
        let err = pool
            .with_healthy(|p| async move { p.latest_block().await })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Exhausted(2)));
    }

    #[tokio::test]
    async fn test_degraded_provider_reenters_after_cooldown() {
        let primary = Arc::new(MockProvider::new("primary"));
        primary.fail_next(1);
        primary.set_latest_block(42);
        let fallback = Arc::new(MockProvider::new("fallback"));
        fallback.set_latest_block(7);

        let pool = ProviderPool::new(
            vec![primary.clone(), fallback],
            Duration::from_millis(10),
        );

        // First call: primary fails once, fallback answers
        let h = pool
            .with_healthy(|p| async move { p.latest_block().await })
            .await
            .unwrap();
        assert_eq!(h, 7);

        tokio::time::sleep(Duration::from_millis(20)).await;

        // Cooldown elapsed: primary back at the top
        let h = pool
            .with_healthy(|p| async move { p.latest_block().await })
            .await
            .unwrap();
        assert_eq!(h, 42);
    }
}
