//! Get-or-create for session hubs.

use std::sync::Arc;

use {
    mcphub_bus::PubSub,
    mcphub_mcp::ClientFactory,
    tracing::info,
};

use crate::{
    bridge::{self, BusEventSink},
    cache::HubCache,
    config_service::ServerConfigStore,
    error::{HubError, Result},
    hub::{HubOptions, HubService},
    registry::{CacheKeyRegistry, ScopeKey},
    trust::TrustPolicy,
};

/// Builds, caches and invalidates the hubs of every session.
pub struct HubProvider {
    store: Arc<dyn ServerConfigStore>,
    cache: Arc<HubCache>,
    registry: CacheKeyRegistry,
    bus: Arc<dyn PubSub>,
    factory: Arc<dyn ClientFactory>,
    trust: TrustPolicy,
    options: HubOptions,
}

impl HubProvider {
    pub fn new(
        store: Arc<dyn ServerConfigStore>,
        cache: Arc<HubCache>,
        bus: Arc<dyn PubSub>,
        factory: Arc<dyn ClientFactory>,
        trust: TrustPolicy,
        options: HubOptions,
    ) -> Self {
        Self {
            store,
            cache,
            registry: CacheKeyRegistry::new(),
            bus,
            factory,
            trust,
            options,
        }
    }

    pub fn store(&self) -> &Arc<dyn ServerConfigStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<HubCache> {
        &self.cache
    }

    pub fn registry(&self) -> &CacheKeyRegistry {
        &self.registry
    }

    /// The hub of `session_id`, built from the configs of `scope` on a miss.
    pub async fn get_hub(&self, scope: &ScopeKey, session_id: &str) -> Result<Arc<HubService>> {
        self.cache
            .get_or_create(session_id, || self.build(scope, session_id))
            .await
    }

    async fn build(&self, scope: &ScopeKey, session_id: &str) -> Result<Arc<HubService>> {
        // Registered before the configs are read, so a mutation landing
        // mid-build evicts what this build caches.
        self.registry.register(scope, session_id);
        let configs = match self.store.list(scope).await {
            Ok(configs) if !configs.is_empty() => configs,
            Ok(_) => {
                self.registry.forget_session(session_id);
                return Err(HubError::not_found(format!(
                    "MCP server configs for {scope}"
                )));
            },
            Err(e) => {
                self.registry.forget_session(session_id);
                return Err(e);
            },
        };
        let servers = configs.len();
        let hub = HubService::new(
            session_id,
            configs.into_iter().map(|stored| stored.config),
            Arc::clone(&self.factory),
            Arc::new(BusEventSink::new(Arc::clone(&self.bus))),
            self.trust.clone(),
            self.options.clone(),
        );
        bridge::attach(&hub, &self.bus).await?;
        info!(session = session_id, scope = %scope, servers, "built MCP hub");
        Ok(hub)
    }

    /// Dispose every hub built from `scope`. Returns how many were evicted.
    pub async fn invalidate(&self, scope: &ScopeKey) -> usize {
        let sessions = self.registry.take(scope);
        let mut evicted = 0;
        for session_id in &sessions {
            if self.cache.delete(session_id).await {
                evicted += 1;
            }
        }
        if evicted > 0 {
            info!(scope = %scope, evicted, "invalidated MCP hubs");
        }
        evicted
    }

    /// Dispose the hub of one session.
    pub async fn evict(&self, session_id: &str) -> bool {
        self.registry.forget_session(session_id);
        self.cache.delete(session_id).await
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            config_service::{MemoryConfigStore, ServerConfigService, StoredServerConfig},
            error::ErrorKind,
            testing::{Behavior, FakeFactory},
        },
        async_trait::async_trait,
        mcphub_bus::MemoryBus,
        mcphub_mcp::ServerConfig,
        std::{
            sync::atomic::{AtomicBool, Ordering},
            time::Duration,
        },
        tokio::sync::Notify,
        tokio_util::sync::CancellationToken,
        uuid::Uuid,
    };

    const TTL: Duration = Duration::from_secs(60);

    async fn provider(scopes: &[&ScopeKey]) -> (HubProvider, Arc<FakeFactory>) {
        let factory = FakeFactory::new(&[("fixture", Behavior::Echo)]);
        let store = Arc::new(MemoryConfigStore::new());
        for scope in scopes {
            store
                .insert(scope, ServerConfig::streamable_http("fixture", "http://fixture.test/mcp"))
                .await
                .unwrap();
        }
        let provider = HubProvider::new(
            store,
            HubCache::new(TTL),
            Arc::new(MemoryBus::new()),
            factory.clone(),
            TrustPolicy::default(),
            HubOptions::default(),
        );
        (provider, factory)
    }

    #[tokio::test]
    async fn hubs_are_cached_per_session() {
        let scope = ScopeKey::new("u1", "default");
        let (provider, _) = provider(&[&scope]).await;
        let a = provider.get_hub(&scope, "s1").await.unwrap();
        let b = provider.get_hub(&scope, "s1").await.unwrap();
        let c = provider.get_hub(&scope, "s2").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(provider.registry().sessions(&scope), ["s1", "s2"]);
    }

    #[tokio::test]
    async fn scope_without_servers_is_not_found() {
        let (provider, _) = provider(&[]).await;
        let scope = ScopeKey::new("u1", "empty");
        let Err(err) = provider.get_hub(&scope, "s1").await else {
            panic!("a scope without servers built a hub");
        };
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(provider.cache().is_empty().await);
        assert!(provider.registry().sessions(&scope).is_empty());
    }

    #[tokio::test]
    async fn eviction_leads_to_a_fresh_connection() {
        let scope = ScopeKey::new("u1", "default");
        let (provider, factory) = provider(&[&scope]).await;
        let cancel = CancellationToken::new();

        let first = provider.get_hub(&scope, "s1").await.unwrap();
        first.list_all_tools(&cancel).await.unwrap();
        assert!(provider.evict("s1").await);
        assert!(first.is_disposed());
        assert!(factory.client(0).disposed.load(Ordering::SeqCst));

        let second = provider.get_hub(&scope, "s1").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        second.list_all_tools(&cancel).await.unwrap();
        assert_eq!(factory.creations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_hubs_are_rebuilt() {
        let scope = ScopeKey::new("u1", "default");
        let (provider, _) = provider(&[&scope]).await;
        let first = provider.get_hub(&scope, "s1").await.unwrap();
        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        let second = provider.get_hub(&scope, "s1").await.unwrap();
        assert!(first.is_disposed());
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn invalidation_is_limited_to_its_scope() {
        let alpha = ScopeKey::new("u1", "alpha");
        let beta = ScopeKey::new("u1", "beta");
        let (provider, _) = provider(&[&alpha, &beta]).await;
        let a1 = provider.get_hub(&alpha, "s1").await.unwrap();
        let a2 = provider.get_hub(&alpha, "s2").await.unwrap();
        let b = provider.get_hub(&beta, "s3").await.unwrap();

        assert_eq!(provider.invalidate(&alpha).await, 2);
        assert!(a1.is_disposed() && a2.is_disposed());
        assert!(!b.is_disposed());
        assert!(provider.cache().contains("s3").await);
        assert_eq!(provider.invalidate(&alpha).await, 0);
    }

    /// A store whose next `list` holds its snapshot until a config is
    /// inserted.
    #[derive(Default)]
    struct SlowList {
        inner: MemoryConfigStore,
        hold: AtomicBool,
        inserted: Notify,
    }

    #[async_trait]
    impl ServerConfigStore for SlowList {
        async fn insert(
            &self,
            scope: &ScopeKey,
            config: ServerConfig,
        ) -> Result<StoredServerConfig> {
            let stored = self.inner.insert(scope, config).await?;
            self.inserted.notify_one();
            Ok(stored)
        }

        async fn update(
            &self,
            scope: &ScopeKey,
            id: Uuid,
            config: ServerConfig,
        ) -> Result<StoredServerConfig> {
            self.inner.update(scope, id, config).await
        }

        async fn list(&self, scope: &ScopeKey) -> Result<Vec<StoredServerConfig>> {
            let rows = self.inner.list(scope).await?;
            if self.hold.swap(false, Ordering::SeqCst) {
                self.inserted.notified().await;
            }
            Ok(rows)
        }

        async fn get(&self, scope: &ScopeKey, id: Uuid) -> Result<Option<StoredServerConfig>> {
            self.inner.get(scope, id).await
        }

        async fn soft_delete(&self, scope: &ScopeKey, id: Uuid) -> Result<bool> {
            self.inner.soft_delete(scope, id).await
        }
    }

    #[tokio::test]
    async fn mutation_during_a_build_evicts_the_stale_hub() {
        let scope = ScopeKey::new("u1", "default");
        let store = Arc::new(SlowList::default());
        store
            .inner
            .insert(&scope, ServerConfig::streamable_http("fixture", "http://fixture.test/mcp"))
            .await
            .unwrap();
        let provider = Arc::new(HubProvider::new(
            Arc::clone(&store) as Arc<dyn ServerConfigStore>,
            HubCache::new(TTL),
            Arc::new(MemoryBus::new()),
            FakeFactory::new(&[("fixture", Behavior::Echo), ("second", Behavior::Echo)]),
            TrustPolicy::default(),
            HubOptions::default(),
        ));
        let service = ServerConfigService::new(Arc::clone(&provider));

        store.hold.store(true, Ordering::SeqCst);
        let (stale, created) = tokio::join!(
            provider.get_hub(&scope, "s1"),
            service.create(&scope, ServerConfig::streamable_http("second", "http://second.test/mcp")),
        );
        let stale = stale.unwrap();
        created.unwrap();
        assert_eq!(stale.server_names().collect::<Vec<_>>(), ["fixture"]);
        assert!(stale.is_disposed());
        assert!(!provider.cache().contains("s1").await);

        let fresh = provider.get_hub(&scope, "s1").await.unwrap();
        assert_eq!(fresh.server_names().collect::<Vec<_>>(), ["fixture", "second"]);
        assert_eq!(provider.registry().sessions(&scope), ["s1"]);
    }
}
