use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Result, anyhow};

use crate::config::ConfigProvider;

pub const FEATURE_CONFIGURED_CATALOGS: &str = "configured-catalogs";
pub const FEATURE_OAUTH_INTERCEPTOR: &str = "oauth-interceptor";
pub const FEATURE_KUBERNETES_PROVISIONING: &str = "kubernetes-provisioning";

pub const KNOWN_FEATURES: &[&str] = &[
    FEATURE_CONFIGURED_CATALOGS,
    FEATURE_OAUTH_INTERCEPTOR,
    FEATURE_KUBERNETES_PROVISIONING,
];

pub fn features_path(cp: &dyn ConfigProvider) -> PathBuf {
    cp.base_dir().join("features.json")
}

pub fn load_features_with(cp: &dyn ConfigProvider) -> BTreeMap<String, String> {
    let path = features_path(cp);
    if let Ok(content) = fs::read_to_string(&path)
        && let Ok(map) = serde_json::from_str::<BTreeMap<String, String>>(&content)
    {
        return map;
    }
    BTreeMap::new()
}

fn save_features_with(cp: &dyn ConfigProvider, map: &BTreeMap<String, String>) -> Result<()> {
    fs::create_dir_all(cp.base_dir())?;
    let content = serde_json::to_string_pretty(map)?;
    fs::write(features_path(cp), content)?;
    Ok(())
}

/// Accepts the literals `enabled`/`disabled` plus boolean-parseable strings.
pub fn parse_feature_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "enabled" | "true" | "1" => Some(true),
        "disabled" | "false" | "0" => Some(false),
        _ => None,
    }
}

pub fn is_feature_enabled_with(cp: &dyn ConfigProvider, name: &str) -> bool {
    load_features_with(cp)
        .get(name)
        .and_then(|v| parse_feature_value(v))
        .unwrap_or(false)
}

pub fn set_feature_with(cp: &dyn ConfigProvider, name: &str, enabled: bool) -> Result<()> {
    if !KNOWN_FEATURES.contains(&name) {
        return Err(anyhow!(
            "unknown feature {name:?}; known features: {}",
            KNOWN_FEATURES.join(", ")
        ));
    }
    let mut map = load_features_with(cp);
    map.insert(
        name.to_string(),
        if enabled { "enabled" } else { "disabled" }.to_string(),
    );
    save_features_with(cp, &map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct TempConfigProvider(PathBuf);

    impl TempConfigProvider {
        fn new() -> (tempfile::TempDir, Self) {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().to_path_buf();
            (dir, Self(path))
        }
    }

    impl ConfigProvider for TempConfigProvider {
        fn base_dir(&self) -> PathBuf {
            self.0.clone()
        }
    }

    #[test]
    fn enable_disable_round_trip() {
        let (_dir, cp) = TempConfigProvider::new();
        assert!(!is_feature_enabled_with(&cp, FEATURE_KUBERNETES_PROVISIONING));
        set_feature_with(&cp, FEATURE_KUBERNETES_PROVISIONING, true).unwrap();
        assert!(is_feature_enabled_with(&cp, FEATURE_KUBERNETES_PROVISIONING));
        set_feature_with(&cp, FEATURE_KUBERNETES_PROVISIONING, false).unwrap();
        assert!(!is_feature_enabled_with(&cp, FEATURE_KUBERNETES_PROVISIONING));
        let map = load_features_with(&cp);
        assert_eq!(map[FEATURE_KUBERNETES_PROVISIONING], "disabled");
    }

    #[test]
    fn unknown_feature_is_rejected() {
        let (_dir, cp) = TempConfigProvider::new();
        let err = set_feature_with(&cp, "warp-drive", true).unwrap_err();
        assert!(err.to_string().contains("unknown feature"));
    }

    #[test]
    fn boolean_literals_are_accepted() {
        assert_eq!(parse_feature_value("enabled"), Some(true));
        assert_eq!(parse_feature_value("TRUE"), Some(true));
        assert_eq!(parse_feature_value("1"), Some(true));
        assert_eq!(parse_feature_value("disabled"), Some(false));
        assert_eq!(parse_feature_value("false"), Some(false));
        assert_eq!(parse_feature_value("0"), Some(false));
        assert_eq!(parse_feature_value("maybe"), None);
    }

    #[test]
    fn hand_edited_boolean_value_reads_as_enabled() {
        let (_dir, cp) = TempConfigProvider::new();
        fs::create_dir_all(cp.base_dir()).unwrap();
        fs::write(
            features_path(&cp),
            r#"{"configured-catalogs":"true"}"#,
        )
        .unwrap();
        assert!(is_feature_enabled_with(&cp, FEATURE_CONFIGURED_CATALOGS));
    }
}
