use std::collections::HashSet;

use {
    mcphub_mcp::{ServerConfig, types::McpToolDef},
    tracing::warn,
    url::Url,
};

/// Which server origins may pass tool `annotations` and `_meta` through.
/// Everything else, stdio servers included, has them stripped.
#[derive(Debug, Clone, Default)]
pub struct TrustPolicy {
    origins: HashSet<String>,
}

impl TrustPolicy {
    pub fn new<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let origins = origins
            .into_iter()
            .filter_map(|raw| {
                let raw = raw.as_ref();
                match Url::parse(raw) {
                    Ok(url) if url.origin().is_tuple() => Some(url.origin().ascii_serialization()),
                    _ => {
                        warn!(origin = %raw, "ignoring unparsable trusted origin");
                        None
                    },
                }
            })
            .collect();
        Self { origins }
    }

    pub fn is_trusted(&self, config: &ServerConfig) -> bool {
        config
            .origin()
            .is_some_and(|origin| self.origins.contains(&origin))
    }

    pub fn apply(&self, config: &ServerConfig, tool: &mut McpToolDef) {
        if !self.is_trusted(config) {
            tool.annotations = None;
            tool.meta = None;
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    fn tool() -> McpToolDef {
        serde_json::from_value(json!({
            "name": "echo",
            "inputSchema": {"type": "object"},
            "annotations": {"readOnlyHint": true},
            "_meta": {"ui": "card"}
        }))
        .unwrap()
    }

    #[test]
    fn trusted_origin_keeps_extras() {
        let policy = TrustPolicy::new(["https://tools.example.com/"]);
        let config = ServerConfig::streamable_http("remote", "https://tools.example.com/mcp");
        let mut t = tool();
        policy.apply(&config, &mut t);
        assert!(t.annotations.is_some());
        assert!(t.meta.is_some());
    }

    #[test]
    fn untrusted_and_stdio_are_stripped() {
        let policy = TrustPolicy::new(["https://tools.example.com", "not a url"]);
        for config in [
            ServerConfig::streamable_http("other", "https://evil.example.com/mcp"),
            ServerConfig::streamable_http("port", "https://tools.example.com:8443/mcp"),
            ServerConfig::stdio("local", vec!["cat".into()]),
        ] {
            let mut t = tool();
            policy.apply(&config, &mut t);
            assert!(t.annotations.is_none(), "{}", config.name);
            assert!(t.meta.is_none());
        }
    }
}
