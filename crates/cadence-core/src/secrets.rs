//! Secret parameters embedded in configuration values.
//!
//! A value may reference secrets as `{{SECRET:[config_id][key]}}`. The
//! scheduler resolves them through the `SecretResolver` port right before
//! handing a payload to an agent or a plugin.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

static SECRET_PARAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{SECRET:\[([^\]]+)\]\[([^\]]+)\]\}\}").expect("secret param pattern is valid")
});

/// One reference to a secret held by a secret config.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SecretParam {
    pub config_id: String,
    pub key: String,
}

impl SecretParam {
    pub fn new(config_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            config_id: config_id.into(),
            key: key.into(),
        }
    }

    /// All secret references in `input`, in order of appearance.
    pub fn parse_all(input: &str) -> Vec<SecretParam> {
        SECRET_PARAM
            .captures_iter(input)
            .map(|caps| SecretParam::new(&caps[1], &caps[2]))
            .collect()
    }

    pub fn placeholder(&self) -> String {
        format!("{{{{SECRET:[{}][{}]}}}}", self.config_id, self.key)
    }
}

/// The entity asking for secrets; secret configs restrict who may use them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum SecretUsage {
    PipelineGroup(String),
    ClusterProfile(String),
    ElasticProfile(String),
    ArtifactStore(String),
}

impl std::fmt::Display for SecretUsage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecretUsage::PipelineGroup(id) => write!(f, "pipeline group '{id}'"),
            SecretUsage::ClusterProfile(id) => write!(f, "cluster profile '{id}'"),
            SecretUsage::ElasticProfile(id) => write!(f, "elastic profile '{id}'"),
            SecretUsage::ArtifactStore(id) => write!(f, "artifact store '{id}'"),
        }
    }
}

/// A configuration value that may contain secret references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigValue(String);

impl ConfigValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn raw(&self) -> &str {
        &self.0
    }

    pub fn secret_params(&self) -> Vec<SecretParam> {
        SecretParam::parse_all(&self.0)
    }

    pub fn has_secret_params(&self) -> bool {
        SECRET_PARAM.is_match(&self.0)
    }

    /// Substitute resolved secrets. Returns the name of the first unresolved
    /// reference as an error.
    pub fn resolve(&self, resolved: &BTreeMap<SecretParam, String>) -> Result<String, SecretParam> {
        let mut output = self.0.clone();
        for param in self.secret_params() {
            let value = resolved.get(&param).ok_or_else(|| param.clone())?;
            output = output.replace(&param.placeholder(), value);
        }
        Ok(output)
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Collect every secret reference in a set of configuration values.
pub fn collect_params<'a>(values: impl IntoIterator<Item = &'a ConfigValue>) -> Vec<SecretParam> {
    let mut params: Vec<SecretParam> = values
        .into_iter()
        .flat_map(ConfigValue::secret_params)
        .collect();
    params.sort();
    params.dedup();
    params
}

/// Mask resolved secret values in console output.
pub fn mask(input: &str, resolved: &BTreeMap<SecretParam, String>) -> String {
    let mut output = input.to_string();
    for value in resolved.values() {
        if !value.is_empty() {
            output = output.replace(value.as_str(), "******");
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_secret_params() {
        let params = SecretParam::parse_all(
            "user={{SECRET:[vault][db_user]}} pass={{SECRET:[vault][db_pass]}}",
        );
        assert_eq!(
            params,
            vec![
                SecretParam::new("vault", "db_user"),
                SecretParam::new("vault", "db_pass"),
            ]
        );
        assert!(SecretParam::parse_all("plain value").is_empty());
    }

    #[test]
    fn test_resolve_config_value() {
        let value = ConfigValue::new("token={{SECRET:[vault][token]}}");
        let mut resolved = BTreeMap::new();
        resolved.insert(SecretParam::new("vault", "token"), "s3cr3t".to_string());

        assert_eq!(value.resolve(&resolved).unwrap(), "token=s3cr3t");
        assert_eq!(mask("echo s3cr3t", &resolved), "echo ******");
    }

    #[test]
    fn test_resolve_reports_missing_param() {
        let value = ConfigValue::new("{{SECRET:[vault][missing]}}");
        let err = value.resolve(&BTreeMap::new()).unwrap_err();
        assert_eq!(err, SecretParam::new("vault", "missing"));
    }

    #[test]
    fn test_collect_params_dedups() {
        let a = ConfigValue::new("{{SECRET:[v][k]}}");
        let b = ConfigValue::new("x {{SECRET:[v][k]}} y");
        assert_eq!(collect_params([&a, &b]), vec![SecretParam::new("v", "k")]);
    }
}
