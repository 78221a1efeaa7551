//! Configuration loading, env substitution and overrides, and validation.
//!
//! Config files: `mcphub.toml` or `mcphub.json`, searched in `./` then the
//! user config directory (`~/.config/mcphub/` on Linux).
//!
//! Supports `${ENV_VAR}` substitution in all string values. `MCPHUB_*`
//! variables override the file afterwards.

pub mod env_subst;
pub mod error;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    error::{Error, Result},
    loader::{apply_env_overrides, config_dir, discover_and_load, find_config_file, load_config},
    schema::{
        BusAddress, BusBackend, BusConfig, CacheConfig, HubConfig, McpConfig, McphubConfig,
        SeedServer, TrustConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult},
};
