//! Wires config into a running hub stack: bus, session cache, provider and
//! the seeded config store.

use std::{sync::Arc, time::Duration};

use {
    anyhow::{Context, Result},
    mcphub_bus::{MemoryBus, PubSub},
    mcphub_common::ShutdownHooks,
    mcphub_config::{BusBackend, McphubConfig},
    mcphub_hub::{
        HubCache, HubOptions, HubProvider, MemoryConfigStore, ScopeKey, ServerConfigService,
        TrustPolicy,
    },
    mcphub_mcp::{ClientOptions, DefaultClientFactory},
    tracing::{info, warn},
};

/// How long the shutdown walk may take before owners are abandoned.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

pub struct Runtime {
    pub bus: Arc<dyn PubSub>,
    pub provider: Arc<HubProvider>,
    pub configs: ServerConfigService,
    hooks: ShutdownHooks,
}

impl Runtime {
    pub async fn start(config: &McphubConfig) -> Result<Self> {
        let bus = connect_bus(config).await?;
        let cache = HubCache::new(config.cache.ttl());
        cache.start_sweeper(config.cache.sweep_interval());

        let hooks = ShutdownHooks::new();
        hooks.register(cache.clone());

        let factory = DefaultClientFactory::new(ClientOptions {
            connect_timeout: config.mcp.connect_timeout(),
            request_timeout: config.mcp.request_timeout(),
            client_name: config.mcp.client_name.clone(),
        });
        let provider = Arc::new(HubProvider::new(
            Arc::new(MemoryConfigStore::new()),
            cache,
            Arc::clone(&bus),
            Arc::new(factory),
            TrustPolicy::new(&config.trust.origins),
            HubOptions {
                round_trip_timeout: config.hub.round_trip_timeout(),
                retention: config.hub.retention,
            },
        ));
        let configs = ServerConfigService::new(Arc::clone(&provider));

        for seed in &config.servers {
            let scope = ScopeKey::new(&seed.user_id, &seed.scope);
            configs
                .create(&scope, seed.server.clone())
                .await
                .with_context(|| format!("seeding server '{}' for {scope}", seed.server.name))?;
        }
        info!(
            servers = config.servers.len(),
            bus = config.bus.backend.as_str(),
            "mcphub runtime ready"
        );

        Ok(Self {
            bus,
            provider,
            configs,
            hooks,
        })
    }

    /// Dispose every cached hub, closing their MCP sessions.
    pub async fn shutdown(&self) {
        if let Err(e) = self.hooks.run(SHUTDOWN_DEADLINE).await {
            warn!(error = %e, "shutdown did not finish cleanly");
        }
    }
}

async fn connect_bus(config: &McphubConfig) -> Result<Arc<dyn PubSub>> {
    match config.bus.backend {
        BusBackend::Memory => Ok(Arc::new(MemoryBus::new())),
        BusBackend::Redis => redis_bus(config).await,
    }
}

#[cfg(feature = "redis")]
async fn redis_bus(config: &McphubConfig) -> Result<Arc<dyn PubSub>> {
    let addresses = config
        .bus
        .parsed_addresses()
        .map_err(anyhow::Error::msg)?;
    let first = addresses
        .first()
        .context("the redis bus backend needs an address")?;
    if addresses.len() > 1 {
        info!(using = %first, configured = addresses.len(), "redis bus uses the first address");
    }
    let bus = mcphub_bus::RedisBus::connect(&first.to_string())
        .await
        .with_context(|| format!("connecting to redis at {first}"))?;
    Ok(Arc::new(bus))
}

#[cfg(not(feature = "redis"))]
async fn redis_bus(_config: &McphubConfig) -> Result<Arc<dyn PubSub>> {
    anyhow::bail!("this build has no redis bus; rebuild with `--features redis`")
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, mcphub_config::SeedServer, mcphub_mcp::ServerConfig};

    fn seed(user: &str, scope: &str, name: &str, url: &str) -> SeedServer {
        SeedServer {
            user_id: user.into(),
            scope: scope.into(),
            server: ServerConfig::streamable_http(name, url),
        }
    }

    #[tokio::test]
    async fn seeds_land_in_their_scope() {
        let mut config = McphubConfig::default();
        config.servers = vec![
            seed("u1", "default", "search", "https://search.example.com/mcp"),
            seed("u1", "default", "files", "https://files.example.com/mcp"),
            seed("u2", "default", "search", "https://search.example.com/mcp"),
        ];
        let runtime = Runtime::start(&config).await.unwrap();
        let listed = runtime
            .configs
            .list(&ScopeKey::new("u1", "default"))
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(
            runtime
                .configs
                .list(&ScopeKey::new("u2", "default"))
                .await
                .unwrap()
                .len(),
            1
        );
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_seeds_fail_startup() {
        let mut config = McphubConfig::default();
        config.servers = vec![
            seed("u1", "default", "search", "https://search.example.com/mcp"),
            seed("u1", "default", "other", "https://search.example.com/mcp"),
        ];
        let err = Runtime::start(&config).await.err().unwrap();
        assert!(format!("{err:#}").contains("duplicate"));
    }

    #[cfg(not(feature = "redis"))]
    #[tokio::test]
    async fn redis_backend_needs_the_feature() {
        let mut config = McphubConfig::default();
        config.bus.backend = BusBackend::Redis;
        config.bus.addresses = vec!["localhost".into()];
        assert!(Runtime::start(&config).await.is_err());
    }
}
