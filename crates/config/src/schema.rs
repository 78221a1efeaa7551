/// Config schema types: cache, hub, MCP client, bus, trust and seed servers.
use std::{fmt, time::Duration};

use {
    mcphub_mcp::ServerConfig,
    serde::{Deserialize, Serialize},
};

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct McphubConfig {
    pub cache: CacheConfig,
    pub hub: HubConfig,
    pub mcp: McpConfig,
    pub bus: BusConfig,
    pub trust: TrustConfig,
    /// Server configs loaded into the config store at startup.
    pub servers: Vec<SeedServer>,
}

/// Session cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Idle lifetime of a session's hub.
    pub ttl_ms: u64,
    /// How often expired hubs are swept.
    pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 300_000,
            sweep_interval_ms: 30_000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Bound on one sampling or elicitation round trip.
    pub round_trip_timeout_ms: u64,
    /// Finished tool calls kept per hub.
    pub retention: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            round_trip_timeout_ms: 60_000,
            retention: 256,
        }
    }
}

impl HubConfig {
    pub fn round_trip_timeout(&self) -> Duration {
        Duration::from_millis(self.round_trip_timeout_ms)
    }
}

/// MCP client settings shared by every connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Name announced in the `initialize` handshake.
    pub client_name: String,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            request_timeout_ms: 300_000,
            client_name: "mcphub".into(),
        }
    }
}

impl McpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    /// In-process broadcast; hub and driver share one process.
    #[default]
    Memory,
    /// Redis or Valkey pub/sub.
    Redis,
}

impl BusBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Redis => "redis",
        }
    }
}

impl std::str::FromStr for BusBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" | "valkey" => Ok(Self::Redis),
            other => Err(format!("unknown bus backend '{other}' (expected memory or redis)")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub backend: BusBackend,
    /// Broker addresses as `host[:port]`.
    pub addresses: Vec<String>,
}

impl BusConfig {
    /// Parsed addresses; the first bad one is reported.
    pub fn parsed_addresses(&self) -> Result<Vec<BusAddress>, String> {
        self.addresses.iter().map(|a| BusAddress::parse(a)).collect()
    }
}

/// A broker endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusAddress {
    pub host: String,
    pub port: u16,
}

impl BusAddress {
    pub const DEFAULT_PORT: u16 = 6379;

    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        let (host, port) = match raw.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| format!("bus address '{raw}' has an invalid port"))?;
                (host, port)
            },
            None => (raw, Self::DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(format!("bus address '{raw}' has no host"));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Origins whose servers may pass tool `annotations` and `_meta` through.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    pub origins: Vec<String>,
}

/// A server config owned by one (user, scope).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedServer {
    pub user_id: String,
    pub scope: String,
    #[serde(flatten)]
    pub server: ServerConfig,
}
