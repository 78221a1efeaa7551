//! Per-(user, scope) server configurations. Every mutation invalidates the
//! hubs built from the old set.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use {
    async_trait::async_trait,
    mcphub_mcp::{ServerConfig, TransportConfig},
    serde::{Deserialize, Serialize},
    tracing::info,
    uuid::Uuid,
};

use crate::{
    error::{HubError, Result},
    provider::HubProvider,
    registry::ScopeKey,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredServerConfig {
    pub id: Uuid,
    #[serde(flatten)]
    pub scope: ScopeKey,
    pub config: ServerConfig,
    #[serde(default)]
    pub deleted: bool,
}

/// Persistence for server configs. Deleted rows are kept but never listed.
#[async_trait]
pub trait ServerConfigStore: Send + Sync {
    /// Fails with `InvalidInput` when the name, URL or command is already
    /// used in the scope.
    async fn insert(&self, scope: &ScopeKey, config: ServerConfig) -> Result<StoredServerConfig>;

    async fn update(
        &self,
        scope: &ScopeKey,
        id: Uuid,
        config: ServerConfig,
    ) -> Result<StoredServerConfig>;

    /// Live configs of the scope, oldest first.
    async fn list(&self, scope: &ScopeKey) -> Result<Vec<StoredServerConfig>>;

    async fn get(&self, scope: &ScopeKey, id: Uuid) -> Result<Option<StoredServerConfig>>;

    /// Returns whether a live row was deleted.
    async fn soft_delete(&self, scope: &ScopeKey, id: Uuid) -> Result<bool>;
}

/// What makes two configs in one scope the same server.
fn conflict(existing: &ServerConfig, candidate: &ServerConfig) -> Option<String> {
    if existing.name == candidate.name {
        return Some(format!("name '{}'", candidate.name));
    }
    match (&existing.transport, &candidate.transport) {
        (TransportConfig::Stdio { command: a, .. }, TransportConfig::Stdio { command: b, .. })
            if a == b =>
        {
            Some(format!("command '{}'", b.join(" ")))
        },
        _ => match (existing.url(), candidate.url()) {
            (Some(a), Some(b)) if a == b => Some(format!("url '{b}'")),
            _ => None,
        },
    }
}

#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    rows: Mutex<HashMap<ScopeKey, Vec<StoredServerConfig>>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> MutexGuard<'_, HashMap<ScopeKey, Vec<StoredServerConfig>>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn check_unique(rows: &[StoredServerConfig], skip: Option<Uuid>, config: &ServerConfig) -> Result<()> {
    let clash = rows
        .iter()
        .filter(|row| !row.deleted && Some(row.id) != skip)
        .find_map(|row| conflict(&row.config, config));
    match clash {
        Some(what) => Err(HubError::invalid_input(format!(
            "duplicate MCP server config: {what} is already configured"
        ))),
        None => Ok(()),
    }
}

#[async_trait]
impl ServerConfigStore for MemoryConfigStore {
    async fn insert(&self, scope: &ScopeKey, config: ServerConfig) -> Result<StoredServerConfig> {
        let mut rows = self.rows();
        let scoped = rows.entry(scope.clone()).or_default();
        check_unique(scoped, None, &config)?;
        let stored = StoredServerConfig {
            id: Uuid::new_v4(),
            scope: scope.clone(),
            config,
            deleted: false,
        };
        scoped.push(stored.clone());
        Ok(stored)
    }

    async fn update(
        &self,
        scope: &ScopeKey,
        id: Uuid,
        config: ServerConfig,
    ) -> Result<StoredServerConfig> {
        let mut rows = self.rows();
        let scoped = rows
            .get_mut(scope)
            .filter(|rows| rows.iter().any(|row| row.id == id && !row.deleted))
            .ok_or_else(|| HubError::not_found(format!("MCP server config {id}")))?;
        check_unique(scoped, Some(id), &config)?;
        let row = scoped
            .iter_mut()
            .find(|row| row.id == id && !row.deleted)
            .ok_or_else(|| HubError::not_found(format!("MCP server config {id}")))?;
        row.config = config;
        Ok(row.clone())
    }

    async fn list(&self, scope: &ScopeKey) -> Result<Vec<StoredServerConfig>> {
        Ok(self
            .rows()
            .get(scope)
            .map(|rows| rows.iter().filter(|row| !row.deleted).cloned().collect())
            .unwrap_or_default())
    }

    async fn get(&self, scope: &ScopeKey, id: Uuid) -> Result<Option<StoredServerConfig>> {
        Ok(self.rows().get(scope).and_then(|rows| {
            rows.iter()
                .find(|row| row.id == id && !row.deleted)
                .cloned()
        }))
    }

    async fn soft_delete(&self, scope: &ScopeKey, id: Uuid) -> Result<bool> {
        let mut rows = self.rows();
        let row = rows
            .get_mut(scope)
            .and_then(|rows| rows.iter_mut().find(|row| row.id == id && !row.deleted));
        Ok(match row {
            Some(row) => {
                row.deleted = true;
                true
            },
            None => false,
        })
    }
}

fn validated(config: ServerConfig) -> Result<ServerConfig> {
    config
        .validate()
        .map_err(|e| HubError::invalid_input(e.to_string()))?;
    Ok(config)
}

/// Create, update, list, get and delete server configs for a scope.
pub struct ServerConfigService {
    provider: Arc<HubProvider>,
}

impl ServerConfigService {
    pub fn new(provider: Arc<HubProvider>) -> Self {
        Self { provider }
    }

    fn store(&self) -> &Arc<dyn ServerConfigStore> {
        self.provider.store()
    }

    pub async fn create(&self, scope: &ScopeKey, config: ServerConfig) -> Result<StoredServerConfig> {
        let stored = self.store().insert(scope, validated(config)?).await?;
        info!(scope = %scope, server = %stored.config.name, id = %stored.id, "server config created");
        self.provider.invalidate(scope).await;
        Ok(stored)
    }

    pub async fn update(
        &self,
        scope: &ScopeKey,
        id: Uuid,
        config: ServerConfig,
    ) -> Result<StoredServerConfig> {
        let stored = self.store().update(scope, id, validated(config)?).await?;
        info!(scope = %scope, server = %stored.config.name, id = %stored.id, "server config updated");
        self.provider.invalidate(scope).await;
        Ok(stored)
    }

    pub async fn list(&self, scope: &ScopeKey) -> Result<Vec<StoredServerConfig>> {
        self.store().list(scope).await
    }

    pub async fn get(&self, scope: &ScopeKey, id: Uuid) -> Result<StoredServerConfig> {
        self.store()
            .get(scope, id)
            .await?
            .ok_or_else(|| HubError::not_found(format!("MCP server config {id}")))
    }

    pub async fn delete(&self, scope: &ScopeKey, id: Uuid) -> Result<()> {
        if !self.store().soft_delete(scope, id).await? {
            return Err(HubError::not_found(format!("MCP server config {id}")));
        }
        info!(scope = %scope, id = %id, "server config deleted");
        self.provider.invalidate(scope).await;
        Ok(())
    }
}
