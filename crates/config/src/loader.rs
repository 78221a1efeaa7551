use std::path::{Path, PathBuf};

use {
    tracing::{debug, info},
    url::Url,
};

use crate::{
    env_subst::substitute_env,
    error::{Error, Result},
    schema::{BusBackend, McphubConfig},
    validate::{Severity, validate_config},
};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["mcphub.toml", "mcphub.json"];

/// Load config from the given path, then apply `MCPHUB_*` overrides and
/// validate the result.
pub fn load_config(path: &Path) -> Result<McphubConfig> {
    let raw = std::fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut config = parse_config(&substitute_env(&raw), path)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    check(&config)?;
    Ok(config)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./mcphub.{toml,json}` (project-local)
/// 2. `~/.config/mcphub/mcphub.{toml,json}` (user-global)
///
/// Without a file the defaults are used, still subject to `MCPHUB_*`
/// overrides. A file that fails to load is an error, not a silent fallback.
pub fn discover_and_load() -> Result<McphubConfig> {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        let config = load_config(&path)?;
        info!(path = %path.display(), servers = config.servers.len(), "config loaded");
        return Ok(config);
    }
    debug!("no config file found, using defaults");
    let mut config = McphubConfig::default();
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    check(&config)?;
    Ok(config)
}

/// Find the first config file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    let local = CONFIG_FILENAMES.iter().map(PathBuf::from);
    let global = config_dir()
        .into_iter()
        .flat_map(|dir| CONFIG_FILENAMES.iter().map(move |name| dir.join(name)));
    local.chain(global).find(|p| p.exists())
}

/// Returns the user-global config directory (`~/.config/mcphub/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "mcphub").map(|d| d.config_dir().to_path_buf())
}

fn parse_config(raw: &str, path: &Path) -> Result<McphubConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");
    let parse_error = |message: String| Error::Parse {
        path: path.to_path_buf(),
        message,
    };

    match ext {
        "toml" => toml::from_str(raw).map_err(|e| parse_error(e.to_string())),
        "json" => serde_json::from_str(raw).map_err(|e| parse_error(e.to_string())),
        _ => Err(Error::UnsupportedFormat {
            ext: ext.to_string(),
        }),
    }
}

/// Fails with every semantic error at once.
fn check(config: &McphubConfig) -> Result<()> {
    let problems: Vec<String> = validate_config(config)
        .into_iter()
        .filter(|d| d.severity == Severity::Error)
        .map(|d| d.to_string())
        .collect();
    if problems.is_empty() {
        Ok(())
    } else {
        Err(Error::Invalid { problems })
    }
}

/// Apply `MCPHUB_*` overrides from `lookup`. Empty values count as unset.
///
/// | Variable | Field |
/// |---|---|
/// | `MCPHUB_CACHE_TTL_MS` | `cache.ttl_ms` |
/// | `MCPHUB_ROUND_TRIP_TIMEOUT_MS` | `hub.round_trip_timeout_ms` |
/// | `MCPHUB_BUS_BACKEND` | `bus.backend` |
/// | `MCPHUB_BUS_ADDRESSES` | `bus.addresses` (JSON array) |
/// | `MCPHUB_TRUSTED_ORIGINS` | `trust.origins` (JSON array of URLs) |
///
/// Every malformed variable is reported, not just the first.
pub fn apply_env_overrides(
    config: &mut McphubConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
    let mut problems = Vec::new();

    for (name, field) in [
        ("MCPHUB_CACHE_TTL_MS", &mut config.cache.ttl_ms),
        (
            "MCPHUB_ROUND_TRIP_TIMEOUT_MS",
            &mut config.hub.round_trip_timeout_ms,
        ),
    ] {
        if let Some(raw) = get(name) {
            match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => *field = ms,
                _ => problems.push(format!("{name}: '{raw}' is not a positive number of milliseconds")),
            }
        }
    }

    if let Some(raw) = get("MCPHUB_BUS_BACKEND") {
        match raw.parse::<BusBackend>() {
            Ok(backend) => config.bus.backend = backend,
            Err(e) => problems.push(format!("MCPHUB_BUS_BACKEND: {e}")),
        }
    }

    if let Some(raw) = get("MCPHUB_BUS_ADDRESSES") {
        match serde_json::from_str::<Vec<String>>(&raw) {
            Ok(addresses) => config.bus.addresses = addresses,
            Err(e) => problems.push(format!("MCPHUB_BUS_ADDRESSES: expected a JSON array of strings: {e}")),
        }
    }

    if let Some(raw) = get("MCPHUB_TRUSTED_ORIGINS") {
        match serde_json::from_str::<Vec<String>>(&raw) {
            Ok(origins) => {
                let bad: Vec<String> = origins
                    .iter()
                    .filter(|o| Url::parse(o).is_err())
                    .cloned()
                    .collect();
                if bad.is_empty() {
                    config.trust.origins = origins;
                } else {
                    problems.extend(
                        bad.into_iter()
                            .map(|o| format!("MCPHUB_TRUSTED_ORIGINS: '{o}' is not a URL")),
                    );
                }
            },
            Err(e) => problems.push(format!("MCPHUB_TRUSTED_ORIGINS: expected a JSON array of URLs: {e}")),
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(Error::Invalid { problems })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, std::collections::HashMap};

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    fn write(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn toml_and_json_load_the_same_config() {
        let dir = tempfile::tempdir().unwrap();
        let toml = write(
            &dir,
            "mcphub.toml",
            "[cache]\nttl_ms = 1000\n\n[trust]\norigins = [\"https://tools.example.com\"]\n",
        );
        let json = write(
            &dir,
            "mcphub.json",
            r#"{"cache": {"ttl_ms": 1000}, "trust": {"origins": ["https://tools.example.com"]}}"#,
        );
        let from_toml = parse_config(&std::fs::read_to_string(&toml).unwrap(), &toml).unwrap();
        let from_json = parse_config(&std::fs::read_to_string(&json).unwrap(), &json).unwrap();
        assert_eq!(from_toml, from_json);
        assert_eq!(from_toml.cache.ttl_ms, 1000);
    }

    #[test]
    fn unsupported_extension() {
        let err = parse_config("", Path::new("mcphub.yaml")).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat { ext } if ext == "yaml"));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, Error::Read { .. }));
    }

    #[test]
    fn parse_errors_name_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "mcphub.toml", "[cache\n");
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
        assert!(err.to_string().contains("mcphub.toml"));
    }

    #[test]
    fn invalid_values_are_all_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "mcphub.toml",
            "[cache]\nttl_ms = 0\n\n[hub]\nretention = 0\n",
        );
        let Error::Invalid { problems } = load_config(&path).unwrap_err() else {
            panic!("expected Invalid");
        };
        assert_eq!(problems.len(), 2);
        assert!(problems[0].starts_with("cache.ttl_ms"));
    }

    #[test]
    fn overrides_replace_file_values() {
        let mut config = McphubConfig::default();
        apply_env_overrides(
            &mut config,
            env(&[
                ("MCPHUB_CACHE_TTL_MS", "1500"),
                ("MCPHUB_ROUND_TRIP_TIMEOUT_MS", "250"),
                ("MCPHUB_BUS_BACKEND", "valkey"),
                ("MCPHUB_BUS_ADDRESSES", r#"["bus-1:6380", "bus-2"]"#),
                ("MCPHUB_TRUSTED_ORIGINS", r#"["https://tools.example.com"]"#),
            ]),
        )
        .unwrap();
        assert_eq!(config.cache.ttl_ms, 1500);
        assert_eq!(config.hub.round_trip_timeout_ms, 250);
        assert_eq!(config.bus.backend, BusBackend::Redis);
        assert_eq!(config.bus.parsed_addresses().unwrap()[1].port, 6379);
        assert_eq!(config.trust.origins, ["https://tools.example.com"]);
    }

    #[test]
    fn empty_overrides_are_ignored() {
        let mut config = McphubConfig::default();
        apply_env_overrides(
            &mut config,
            env(&[("MCPHUB_CACHE_TTL_MS", ""), ("MCPHUB_BUS_BACKEND", "  ")]),
        )
        .unwrap();
        assert_eq!(config, McphubConfig::default());
    }

    #[test]
    fn every_bad_override_is_reported() {
        let mut config = McphubConfig::default();
        let err = apply_env_overrides(
            &mut config,
            env(&[
                ("MCPHUB_CACHE_TTL_MS", "soon"),
                ("MCPHUB_BUS_BACKEND", "kafka"),
                ("MCPHUB_BUS_ADDRESSES", "bus-1:6379"),
                ("MCPHUB_TRUSTED_ORIGINS", r#"["not a url"]"#),
            ]),
        )
        .unwrap_err();
        let Error::Invalid { problems } = err else {
            panic!("expected Invalid");
        };
        assert_eq!(problems.len(), 4);
        assert_eq!(config, McphubConfig::default());
    }
}
