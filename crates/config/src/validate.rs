//! Configuration validation engine.
//!
//! Detects unknown or misspelled fields in the raw TOML, then checks the
//! parsed config for values the hub cannot run with.

use std::{
    collections::{BTreeSet, HashMap},
    path::{Path, PathBuf},
};

use url::Url;

use crate::{
    env_subst::substitute_env,
    schema::{BusBackend, McphubConfig},
};

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Category: "syntax", "unknown-field", "type-error", "value", "server",
    /// "security", "file-ref"
    pub category: &'static str,
    /// Dotted path, e.g. "servers[0].url"
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// Result of validating a configuration file.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<PathBuf>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

// ── Schema tree for unknown-field detection ─────────────────────────────────

enum KnownKeys {
    Struct(HashMap<&'static str, KnownKeys>),
    Array(Box<KnownKeys>),
    /// Scalar or free-form map; stop recursion.
    Leaf,
}

fn leaves(keys: &[&'static str]) -> KnownKeys {
    KnownKeys::Struct(keys.iter().map(|k| (*k, KnownKeys::Leaf)).collect())
}

/// Mirrors every field in `schema.rs`.
fn build_schema_map() -> KnownKeys {
    use KnownKeys::{Array, Struct};

    let server = leaves(&[
        "user_id",
        "scope",
        "name",
        "transport",
        "command",
        "env",
        "url",
        "headers",
    ]);

    Struct(HashMap::from([
        ("cache", leaves(&["ttl_ms", "sweep_interval_ms"])),
        ("hub", leaves(&["round_trip_timeout_ms", "retention"])),
        (
            "mcp",
            leaves(&["connect_timeout_ms", "request_timeout_ms", "client_name"]),
        ),
        ("bus", leaves(&["backend", "addresses"])),
        ("trust", leaves(&["origins"])),
        ("servers", Array(Box::new(server))),
    ]))
}

// ── Levenshtein distance ────────────────────────────────────────────────────

fn levenshtein(a: &str, b: &str) -> usize {
    let b_len = b.chars().count();
    let mut prev: Vec<usize> = (0..=b_len).collect();
    let mut curr = vec![0; b_len + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.chars().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b_len]
}

/// Closest candidate within `max_distance` edits, if any.
fn suggest<'a>(needle: &str, candidates: &[&'a str], max_distance: usize) -> Option<&'a str> {
    candidates
        .iter()
        .map(|c| (*c, levenshtein(needle, c)))
        .filter(|(_, d)| *d > 0 && *d <= max_distance)
        .min_by_key(|(c, d)| (*d, *c))
        .map(|(c, _)| c)
}

// ── Core validation ─────────────────────────────────────────────────────────

/// Validate a config file at the given path, or discover the default config
/// file location if `path` is `None`.
#[must_use]
pub fn validate(path: Option<&Path>) -> ValidationResult {
    let config_path = path
        .map(Path::to_path_buf)
        .or_else(crate::loader::find_config_file);

    let Some(actual_path) = config_path else {
        return ValidationResult {
            diagnostics: vec![Diagnostic {
                severity: Severity::Info,
                category: "file-ref",
                path: String::new(),
                message: "no config file found; using defaults".into(),
            }],
            config_path: None,
        };
    };

    let mut result = match std::fs::read_to_string(&actual_path) {
        Ok(content) if actual_path.extension().is_some_and(|e| e == "json") => {
            validate_json_str(&substitute_env(&content))
        },
        Ok(content) => validate_toml_str(&substitute_env(&content)),
        Err(e) => ValidationResult {
            diagnostics: vec![Diagnostic {
                severity: Severity::Error,
                category: "syntax",
                path: String::new(),
                message: format!("failed to read config file: {e}"),
            }],
            config_path: None,
        },
    };
    result.config_path = Some(actual_path);
    result
}

/// Validate a TOML string without touching the file system.
#[must_use]
pub fn validate_toml_str(toml_str: &str) -> ValidationResult {
    let mut diagnostics = Vec::new();

    let toml_value: toml::Value = match toml::from_str(toml_str) {
        Ok(v) => v,
        Err(e) => {
            diagnostics.push(Diagnostic {
                severity: Severity::Error,
                category: "syntax",
                path: String::new(),
                message: format!("TOML syntax error: {e}"),
            });
            return ValidationResult {
                diagnostics,
                config_path: None,
            };
        },
    };

    check_unknown_fields(&toml_value, &build_schema_map(), "", &mut diagnostics);

    match toml::from_str::<McphubConfig>(toml_str) {
        Ok(config) => diagnostics.extend(validate_config(&config)),
        Err(e) => diagnostics.push(Diagnostic {
            severity: Severity::Error,
            category: "type-error",
            path: String::new(),
            message: format!("type error: {e}"),
        }),
    }

    ValidationResult {
        diagnostics,
        config_path: None,
    }
}

fn validate_json_str(json_str: &str) -> ValidationResult {
    let diagnostics = match serde_json::from_str::<McphubConfig>(json_str) {
        Ok(config) => validate_config(&config),
        Err(e) => vec![Diagnostic {
            severity: Severity::Error,
            category: "syntax",
            path: String::new(),
            message: format!("JSON error: {e}"),
        }],
    };
    ValidationResult {
        diagnostics,
        config_path: None,
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Walk the TOML value tree against the schema tree and flag unknown keys.
fn check_unknown_fields(
    value: &toml::Value,
    schema: &KnownKeys,
    prefix: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match (value, schema) {
        (toml::Value::Table(table), KnownKeys::Struct(fields)) => {
            let mut known_keys: Vec<&str> = fields.keys().copied().collect();
            known_keys.sort_unstable();
            for (key, child_value) in table {
                let path = join_path(prefix, key);
                if let Some(child_schema) = fields.get(key.as_str()) {
                    check_unknown_fields(child_value, child_schema, &path, diagnostics);
                    continue;
                }
                let message = match suggest(key, &known_keys, 3) {
                    Some(s) => format!("unknown field (did you mean \"{s}\"?)"),
                    None => "unknown field".to_string(),
                };
                diagnostics.push(Diagnostic {
                    severity: Severity::Error,
                    category: "unknown-field",
                    path,
                    message,
                });
            }
        },
        (toml::Value::Array(arr), KnownKeys::Array(item_schema)) => {
            for (i, item) in arr.iter().enumerate() {
                check_unknown_fields(item, item_schema, &format!("{prefix}[{i}]"), diagnostics);
            }
        },
        // Type mismatches surface when the config is deserialized.
        _ => {},
    }
}

/// Semantic checks on a parsed config.
#[must_use]
pub fn validate_config(config: &McphubConfig) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    let mut error = |category: &'static str, path: String, message: String| {
        diagnostics.push(Diagnostic {
            severity: Severity::Error,
            category,
            path,
            message,
        });
    };

    for (path, value) in [
        ("cache.ttl_ms", config.cache.ttl_ms),
        ("cache.sweep_interval_ms", config.cache.sweep_interval_ms),
        ("hub.round_trip_timeout_ms", config.hub.round_trip_timeout_ms),
        ("mcp.connect_timeout_ms", config.mcp.connect_timeout_ms),
        ("mcp.request_timeout_ms", config.mcp.request_timeout_ms),
    ] {
        if value == 0 {
            error("value", path.into(), "must be greater than zero".into());
        }
    }
    if config.hub.retention == 0 {
        error(
            "value",
            "hub.retention".into(),
            "must keep at least one finished tool call".into(),
        );
    }
    if config.mcp.client_name.trim().is_empty() {
        error("value", "mcp.client_name".into(), "must not be empty".into());
    }

    if config.bus.backend == BusBackend::Redis && config.bus.addresses.is_empty() {
        error(
            "value",
            "bus.addresses".into(),
            "the redis backend needs at least one address".into(),
        );
    }
    if let Err(e) = config.bus.parsed_addresses() {
        error("value", "bus.addresses".into(), e);
    }

    for (i, origin) in config.trust.origins.iter().enumerate() {
        match Url::parse(origin) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {},
            Ok(url) => error(
                "value",
                format!("trust.origins[{i}]"),
                format!("scheme '{}' is not http or https", url.scheme()),
            ),
            Err(e) => error(
                "value",
                format!("trust.origins[{i}]"),
                format!("'{origin}' is not a URL: {e}"),
            ),
        }
    }

    let mut seen = BTreeSet::new();
    for (i, seed) in config.servers.iter().enumerate() {
        let path = format!("servers[{i}]");
        if seed.user_id.trim().is_empty() {
            error("server", format!("{path}.user_id"), "must not be empty".into());
        }
        if seed.scope.trim().is_empty() {
            error("server", format!("{path}.scope"), "must not be empty".into());
        }
        for problem in seed.server.problems() {
            error("server", path.clone(), problem);
        }
        if !seen.insert((&seed.user_id, &seed.scope, &seed.server.name)) {
            error(
                "server",
                path.clone(),
                format!(
                    "server '{}' is configured twice for {}/{}",
                    seed.server.name, seed.user_id, seed.scope
                ),
            );
        }
    }

    for (i, seed) in config.servers.iter().enumerate() {
        if let Some(url) = seed.server.url()
            && url.starts_with("http://")
            && !is_loopback(url)
        {
            diagnostics.push(Diagnostic {
                severity: Severity::Warning,
                category: "security",
                path: format!("servers[{i}].url"),
                message: "plain http to a non-loopback host; headers are sent unencrypted".into(),
            });
        }
    }

    diagnostics
}

fn is_loopback(url: &str) -> bool {
    Url::parse(url).ok().is_some_and(|u| match u.host() {
        Some(url::Host::Domain(d)) => d == "localhost",
        Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
        Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    })
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    fn errors(result: &ValidationResult) -> Vec<String> {
        result
            .diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .map(ToString::to_string)
            .collect()
    }

    #[test]
    fn empty_config_is_valid() {
        let result = validate_toml_str("");
        assert!(!result.has_errors(), "{:?}", result.diagnostics);
    }

    #[test]
    fn misspelled_fields_get_a_suggestion() {
        let result = validate_toml_str("[cache]\nttl_sm = 10\n\n[hubb]\nretention = 3\n");
        let errors = errors(&result);
        assert!(errors.contains(&"cache.ttl_sm: unknown field (did you mean \"ttl_ms\"?)".into()));
        assert!(errors.contains(&"hubb: unknown field (did you mean \"hub\"?)".into()));
    }

    #[test]
    fn unknown_server_fields_are_indexed() {
        let result = validate_toml_str(
            r#"
[[servers]]
user_id = "u1"
scope = "default"
name = "search"
transport = "streamable_http"
url = "https://search.example.com/mcp"
header = { Authorization = "x" }
"#,
        );
        assert_eq!(errors(&result), [
            "servers[0].header: unknown field (did you mean \"headers\"?)"
        ]);
    }

    #[test]
    fn syntax_errors_stop_early() {
        let result = validate_toml_str("[cache\nttl_ms = 1");
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics[0].category, "syntax");
    }

    #[test]
    fn wrong_types_are_reported() {
        let result = validate_toml_str("[cache]\nttl_ms = \"soon\"\n");
        assert!(result.diagnostics.iter().any(|d| d.category == "type-error"));
    }

    #[rstest]
    #[case("[cache]\nttl_ms = 0", "cache.ttl_ms")]
    #[case("[hub]\nretention = 0", "hub.retention")]
    #[case("[mcp]\nclient_name = \" \"", "mcp.client_name")]
    #[case("[bus]\nbackend = \"redis\"", "bus.addresses")]
    #[case("[bus]\naddresses = [\"host:port\"]", "bus.addresses")]
    #[case("[trust]\norigins = [\"ftp://files.example.com\"]", "trust.origins[0]")]
    fn semantic_errors(#[case] toml: &str, #[case] path: &str) {
        let result = validate_toml_str(toml);
        assert!(
            result.diagnostics.iter().any(|d| d.path == path && d.severity == Severity::Error),
            "{:?}",
            result.diagnostics
        );
    }

    #[test]
    fn duplicate_and_malformed_seed_servers() {
        let result = validate_toml_str(
            r#"
[[servers]]
user_id = "u1"
scope = "default"
name = "files"
transport = "stdio"
command = ["npx", "server-filesystem"]

[[servers]]
user_id = "u1"
scope = "default"
name = "files"
transport = "stdio"
command = ["uvx", "other"]

[[servers]]
user_id = ""
scope = "default"
name = "bad_name"
transport = "sse"
url = "https://sse.example.com/events"
"#,
        );
        let errors = errors(&result);
        assert!(errors.iter().any(|e| e.starts_with("servers[1]: server 'files' is configured twice")));
        assert!(errors.contains(&"servers[2].user_id: must not be empty".into()));
        assert!(errors.iter().any(|e| e.starts_with("servers[2]: name 'bad_name'")));
    }

    #[rstest]
    #[case("http://mcp.example.com/mcp", true)]
    #[case("http://localhost:3000/mcp", false)]
    #[case("http://127.0.0.1:3000/mcp", false)]
    #[case("https://mcp.example.com/mcp", false)]
    fn plain_http_warns_off_loopback(#[case] url: &str, #[case] warns: bool) {
        let result = validate_toml_str(&format!(
            "[[servers]]\nuser_id = \"u1\"\nscope = \"s\"\nname = \"remote\"\ntransport = \"streamable_http\"\nurl = \"{url}\"\n"
        ));
        assert_eq!(result.count(Severity::Warning), usize::from(warns));
        assert!(!result.has_errors());
    }

    #[rstest]
    #[case("ttl_ms", "ttl_sm", 2)]
    #[case("hub", "hbu", 2)]
    #[case("", "abc", 3)]
    fn edit_distance(#[case] a: &str, #[case] b: &str, #[case] d: usize) {
        assert_eq!(levenshtein(a, b), d);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcphub.toml");
        let result = validate(Some(&path));
        assert!(result.has_errors());
        assert_eq!(result.config_path.as_deref(), Some(path.as_path()));
    }
}
