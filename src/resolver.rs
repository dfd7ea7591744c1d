use std::collections::BTreeMap;

use crate::config::{Configuration, SecretBinding};

/// Value injected when a declared secret has no value in the secrets map.
pub const UNKNOWN_SECRET: &str = "<UNKNOWN>";

/// Just-in-time resolution of env, command and secrets for one server.
///
/// The resolver is a pure function of the configuration snapshot it was built
/// on: provisioner specs carry raw templates and resolution happens only at
/// the runtime boundary, so secret values never land in specs, pool keys or
/// labels.
#[derive(Debug, Clone, Default)]
pub struct ConfigResolver {
    config: BTreeMap<String, serde_json::Value>,
    secrets: BTreeMap<String, String>,
}

impl ConfigResolver {
    pub fn from_snapshot(configuration: &Configuration) -> Self {
        Self {
            config: configuration.config.clone(),
            secrets: configuration.secrets.clone(),
        }
    }

    pub fn resolve_secrets(
        &self,
        server: &str,
        bindings: &[SecretBinding],
    ) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for binding in bindings {
            let value = match self.secrets.get(&binding.name) {
                Some(v) => v.clone(),
                None => {
                    tracing::warn!(
                        target = "resolver",
                        server = %server,
                        secret = %binding.name,
                        "secret has no value; injecting placeholder"
                    );
                    UNKNOWN_SECRET.to_string()
                }
            };
            out.insert(binding.env.clone(), value);
        }
        out
    }

    pub fn resolve_env(
        &self,
        server: &str,
        env: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        env.iter()
            .map(|(k, v)| (k.clone(), self.expand(server, v)))
            .collect()
    }

    pub fn resolve_command(&self, server: &str, command: &[String]) -> Vec<String> {
        command.iter().map(|arg| self.expand(server, arg)).collect()
    }

    /// Whether a raw env value contains a template the cluster ConfigMap is
    /// expected to carry instead of the container spec.
    pub fn is_templated(value: &str) -> bool {
        extract_template(value).is_some()
    }

    /// Substitutes every `{{dotted.key}}` occurrence against the server's
    /// config map. Templates with a pipe are left untouched; unknown keys
    /// resolve to the empty string.
    fn expand(&self, server: &str, raw: &str) -> String {
        let mut out = String::with_capacity(raw.len());
        let mut rest = raw;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                out.push_str(&rest[start..]);
                return out;
            };
            let inner = &after[..end];
            if inner.contains('|') {
                // piped expressions are someone else's template language
                out.push_str(&rest[start..start + 2 + end + 2]);
            } else {
                out.push_str(&self.lookup(server, inner.trim()));
            }
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        out
    }

    fn lookup(&self, server: &str, dotted: &str) -> String {
        let mut current = match self.config.get(server) {
            Some(v) => v,
            None => {
                tracing::debug!(target = "resolver", server = %server, key = %dotted, "no config for server");
                return String::new();
            }
        };
        for segment in dotted.split('.') {
            match current.get(segment) {
                Some(next) => current = next,
                None => {
                    tracing::debug!(target = "resolver", server = %server, key = %dotted, "config key missing");
                    return String::new();
                }
            }
        }
        match current {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// First `{{...}}` template inside a raw value, trimmed, if any.
pub fn extract_template(value: &str) -> Option<&str> {
    let start = value.find("{{")?;
    let after = &value[start + 2..];
    let end = after.find("}}")?;
    Some(after[..end].trim())
}

/// Maps a template expression to a Secret/ConfigMap data key: any character
/// outside `[A-Za-z0-9._-]` becomes `___`. Deterministic and idempotent.
pub fn normalize_key(template: &str) -> String {
    let mut out = String::with_capacity(template.len());
    for c in template.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            out.push(c);
        } else {
            out.push_str("___");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecretBinding;

    fn resolver_with(config: serde_json::Value, secrets: &[(&str, &str)]) -> ConfigResolver {
        let mut configuration = Configuration::default();
        configuration.config.insert("srv".into(), config);
        for (k, v) in secrets {
            configuration.secrets.insert(k.to_string(), v.to_string());
        }
        ConfigResolver::from_snapshot(&configuration)
    }

    #[test]
    fn env_templates_expand_against_server_config() {
        let resolver = resolver_with(
            serde_json::json!({"dockerhub": {"username": "alice"}, "port": 8080}),
            &[],
        );
        let env = BTreeMap::from([
            ("USER".to_string(), "{{dockerhub.username}}".to_string()),
            ("PORT".to_string(), "p{{port}}".to_string()),
            ("PLAIN".to_string(), "as-is".to_string()),
        ]);
        let resolved = resolver.resolve_env("srv", &env);
        assert_eq!(resolved["USER"], "alice");
        assert_eq!(resolved["PORT"], "p8080");
        assert_eq!(resolved["PLAIN"], "as-is");
    }

    #[test]
    fn command_is_expanded_per_element() {
        let resolver = resolver_with(serde_json::json!({"path": "/data"}), &[]);
        let command = vec!["serve".to_string(), "--root={{path}}".to_string()];
        assert_eq!(
            resolver.resolve_command("srv", &command),
            vec!["serve".to_string(), "--root=/data".to_string()]
        );
    }

    #[test]
    fn piped_templates_are_left_untouched() {
        let resolver = resolver_with(serde_json::json!({"a": "x"}), &[]);
        let env = BTreeMap::from([(
            "V".to_string(),
            "{{a | volume-target}}".to_string(),
        )]);
        assert_eq!(resolver.resolve_env("srv", &env)["V"], "{{a | volume-target}}");
    }

    #[test]
    fn missing_config_key_resolves_empty() {
        let resolver = resolver_with(serde_json::json!({}), &[]);
        assert_eq!(resolver.resolve_command("srv", &["{{no.such}}".to_string()]), vec![String::new()]);
    }

    #[test]
    fn missing_secret_injects_placeholder() {
        let resolver = resolver_with(serde_json::json!({}), &[("api.key", "k")]);
        let bindings = vec![
            SecretBinding { name: "api.key".into(), env: "API_KEY".into() },
            SecretBinding { name: "other.key".into(), env: "OTHER".into() },
        ];
        let resolved = resolver.resolve_secrets("srv", &bindings);
        assert_eq!(resolved["API_KEY"], "k");
        assert_eq!(resolved["OTHER"], UNKNOWN_SECRET);
    }

    #[test]
    fn normalize_key_replaces_and_is_idempotent() {
        assert_eq!(normalize_key("dockerhub.username"), "dockerhub.username");
        assert_eq!(normalize_key("a/b c"), "a___b___c");
        let once = normalize_key("a/b c");
        assert_eq!(normalize_key(&once), once);
    }

    #[test]
    fn extract_template_finds_inner_expression() {
        assert_eq!(extract_template("{{ a.b }}"), Some("a.b"));
        assert_eq!(extract_template("plain"), None);
    }
}
