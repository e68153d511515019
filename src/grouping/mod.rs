//! Entity → group resolution.
//!
//! A [`GroupingStrategy`] knows how entities map to groups and how a group's
//! derived log is created and removed. Strategies are picked from a fixed
//! table by name at startup ([`build_strategy`]); there is no dynamic
//! discovery.
//!
//! [`GroupResolver`] sits in front of the strategy and caches resolutions
//! with a bounded TTL. Callers tolerate stale routing for up to one TTL
//! window unless they call [`GroupResolver::invalidate`] on a
//! membership-changed signal.

mod static_table;
mod uns_level;

pub use static_table::StaticGroupingStrategy;
pub use uns_level::UnsLevelGroupingStrategy;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;

use crate::config::RouterConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::retry;
use crate::types::UNAVAILABLE_GROUP;

/// How entities are assigned to groups.
#[async_trait]
pub trait GroupingStrategy: Send + Sync {
    /// Registered name of the strategy.
    fn name(&self) -> &'static str;

    /// Group of one entity, `None` if it has no membership.
    async fn group_for(&self, entity_id: &str) -> Result<Option<String>>;

    /// Every group that currently has members.
    async fn all_groups(&self) -> Result<Vec<String>>;

    /// Entities currently assigned to `group`.
    async fn assets_in_group(&self, group: &str) -> Result<Vec<String>>;

    /// Create the group's derived log. Must be idempotent.
    async fn create_derived_log(&self, group: &str) -> Result<()>;

    /// Remove the group's derived log and its backing topic.
    async fn remove_derived_log(&self, group: &str) -> Result<()>;

    /// `Err(reason)` when the strategy cannot currently serve lookups.
    async fn readiness(&self) -> std::result::Result<(), String>;
}

type StrategyFactory = fn(&RouterConfig) -> Result<Arc<dyn GroupingStrategy>>;

fn ksql_strategy(config: &RouterConfig) -> Result<Arc<dyn GroupingStrategy>> {
    Ok(Arc::new(UnsLevelGroupingStrategy::from_config(config)?))
}

fn static_strategy(config: &RouterConfig) -> Result<Arc<dyn GroupingStrategy>> {
    Ok(Arc::new(StaticGroupingStrategy::new(
        config.static_groups.clone(),
    )))
}

/// Registered grouping strategies.
pub const STRATEGIES: &[(&str, StrategyFactory)] =
    &[("ksql", ksql_strategy), ("static", static_strategy)];

/// Instantiate the strategy named by `config.grouping_strategy`.
pub fn build_strategy(config: &RouterConfig) -> Result<Arc<dyn GroupingStrategy>> {
    let name = config.grouping_strategy.to_lowercase();
    STRATEGIES
        .iter()
        .find(|(registered, _)| *registered == name)
        .map(|(_, factory)| factory(config))
        .unwrap_or_else(|| {
            let known: Vec<_> = STRATEGIES.iter().map(|(n, _)| *n).collect();
            Err(Error::Config(format!(
                "unknown grouping strategy '{}', expected one of {:?}",
                config.grouping_strategy, known
            )))
        })
}

/// Cached entity → group resolution.
pub struct GroupResolver {
    strategy: Arc<dyn GroupingStrategy>,
    cache: Cache<String, String>,
}

impl GroupResolver {
    pub fn new(strategy: Arc<dyn GroupingStrategy>, ttl: Duration, capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();
        Self { strategy, cache }
    }

    pub fn strategy(&self) -> &Arc<dyn GroupingStrategy> {
        &self.strategy
    }

    /// Group label of `entity_id`.
    ///
    /// Concurrent misses for the same entity share one metadata lookup.
    /// `NotFound` results are not cached.
    pub async fn resolve(&self, entity_id: &str) -> Result<String> {
        if entity_id.trim().is_empty() {
            return Err(Error::InvalidRequest("asset_uuid must not be empty".into()));
        }

        if let Some(group) = self.cache.get(entity_id).await {
            metrics::record_resolver_lookup(true);
            return Ok(group);
        }
        metrics::record_resolver_lookup(false);

        let strategy = self.strategy.clone();
        let entity = entity_id.to_string();
        self.cache
            .try_get_with(entity_id.to_string(), async move {
                let group = retry::with_policy("metadata_lookup", retry::metadata_policy(), || {
                    strategy.group_for(&entity)
                })
                .await?;

                match group {
                    Some(g) if !g.trim().is_empty() && g != UNAVAILABLE_GROUP => Ok(g),
                    _ => Err(Error::NotFound(format!("no group for asset '{entity}'"))),
                }
            })
            .await
            .map_err(|e: Arc<Error>| (*e).clone())
    }

    /// Drop the cached group of one entity.
    pub async fn invalidate(&self, entity_id: &str) {
        self.cache.invalidate(entity_id).await;
    }

    /// Drop every cached resolution.
    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    /// Every known group, retried at the metadata boundary.
    pub async fn all_groups(&self) -> Result<Vec<String>> {
        let mut groups = retry::with_policy("metadata_lookup", retry::metadata_policy(), || {
            self.strategy.all_groups()
        })
        .await?;
        groups.retain(|g| !g.trim().is_empty() && g != UNAVAILABLE_GROUP);
        groups.sort();
        groups.dedup();
        Ok(groups)
    }
}

impl std::fmt::Debug for GroupResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupResolver")
            .field("strategy", &self.strategy.name())
            .field("cached_entries", &self.cache.entry_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Strategy that counts lookups and can be switched unavailable.
    struct CountingStrategy {
        inner: StaticGroupingStrategy,
        lookups: AtomicU32,
        failures_left: AtomicU32,
    }

    impl CountingStrategy {
        fn new(pairs: &[(&str, &str)]) -> Self {
            let table: BTreeMap<String, String> = pairs
                .iter()
                .map(|(e, g)| (e.to_string(), g.to_string()))
                .collect();
            Self {
                inner: StaticGroupingStrategy::new(table),
                lookups: AtomicU32::new(0),
                failures_left: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl GroupingStrategy for CountingStrategy {
        fn name(&self) -> &'static str {
            "counting"
        }
        async fn group_for(&self, entity_id: &str) -> Result<Option<String>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Unavailable("metadata down".into()));
            }
            self.inner.group_for(entity_id).await
        }
        async fn all_groups(&self) -> Result<Vec<String>> {
            self.inner.all_groups().await
        }
        async fn assets_in_group(&self, group: &str) -> Result<Vec<String>> {
            self.inner.assets_in_group(group).await
        }
        async fn create_derived_log(&self, _group: &str) -> Result<()> {
            Ok(())
        }
        async fn remove_derived_log(&self, _group: &str) -> Result<()> {
            Ok(())
        }
        async fn readiness(&self) -> std::result::Result<(), String> {
            Ok(())
        }
    }

    fn resolver(strategy: Arc<CountingStrategy>, ttl: Duration) -> GroupResolver {
        GroupResolver::new(strategy, ttl, 1000)
    }

    #[tokio::test]
    async fn test_resolve_caches_within_ttl() {
        let strategy = Arc::new(CountingStrategy::new(&[("ASSET-42", "Weld")]));
        let resolver = resolver(strategy.clone(), Duration::from_secs(60));

        assert_eq!(resolver.resolve("ASSET-42").await.unwrap(), "Weld");
        assert_eq!(resolver.resolve("ASSET-42").await.unwrap(), "Weld");
        assert_eq!(strategy.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resolve_refreshes_after_ttl() {
        let strategy = Arc::new(CountingStrategy::new(&[("ASSET-42", "Weld")]));
        let resolver = resolver(strategy.clone(), Duration::from_millis(50));

        resolver.resolve("ASSET-42").await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        resolver.resolve("ASSET-42").await.unwrap();
        assert_eq!(strategy.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_lookup() {
        let strategy = Arc::new(CountingStrategy::new(&[("ASSET-42", "Weld")]));
        let resolver = Arc::new(resolver(strategy.clone(), Duration::from_secs(60)));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let resolver = resolver.clone();
                tokio::spawn(async move { resolver.resolve("ASSET-42").await })
            })
            .collect();
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), "Weld");
        }
        assert_eq!(strategy.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_entity_is_not_found() {
        let strategy = Arc::new(CountingStrategy::new(&[("ASSET-42", "Weld")]));
        let resolver = resolver(strategy, Duration::from_secs(60));

        let err = resolver.resolve("ghost").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unavailable_group_label_is_not_found() {
        let strategy = Arc::new(CountingStrategy::new(&[("A1", UNAVAILABLE_GROUP)]));
        let resolver = resolver(strategy, Duration::from_secs(60));
        assert!(matches!(
            resolver.resolve("A1").await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_transient_unavailability_is_retried() {
        let strategy = Arc::new(CountingStrategy::new(&[("ASSET-42", "Weld")]));
        strategy.failures_left.store(2, Ordering::SeqCst);
        let resolver = resolver(strategy.clone(), Duration::from_secs(60));

        assert_eq!(resolver.resolve("ASSET-42").await.unwrap(), "Weld");
        assert_eq!(strategy.lookups.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_persistent_unavailability_surfaces() {
        let strategy = Arc::new(CountingStrategy::new(&[("ASSET-42", "Weld")]));
        strategy.failures_left.store(100, Ordering::SeqCst);
        let resolver = resolver(strategy, Duration::from_secs(60));

        let err = resolver.resolve("ASSET-42").await.unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_invalidate_forces_lookup() {
        let strategy = Arc::new(CountingStrategy::new(&[("ASSET-42", "Weld")]));
        let resolver = resolver(strategy.clone(), Duration::from_secs(60));

        resolver.resolve("ASSET-42").await.unwrap();
        resolver.invalidate("ASSET-42").await;
        resolver.resolve("ASSET-42").await.unwrap();
        assert_eq!(strategy.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_entity_is_invalid() {
        let strategy = Arc::new(CountingStrategy::new(&[]));
        let resolver = resolver(strategy, Duration::from_secs(60));
        assert!(matches!(
            resolver.resolve("  ").await.unwrap_err(),
            Error::InvalidRequest(_)
        ));
    }

    #[test]
    fn test_build_strategy_rejects_unknown_name() {
        let config = RouterConfig {
            grouping_strategy: "astrology".to_string(),
            ..Default::default()
        };
        assert!(matches!(build_strategy(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_build_strategy_static() {
        let mut config = RouterConfig {
            grouping_strategy: "static".to_string(),
            ..Default::default()
        };
        config
            .static_groups
            .insert("ASSET-42".to_string(), "Weld".to_string());
        let strategy = build_strategy(&config).unwrap();
        assert_eq!(strategy.name(), "static");
    }
}
