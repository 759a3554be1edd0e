//! Elastic agent profiles.

use crate::secrets::{ConfigValue, SecretParam};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where elastic agents are created: one per plugin-managed cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterProfile {
    pub id: String,
    pub plugin_id: String,
    #[serde(default)]
    pub properties: BTreeMap<String, ConfigValue>,
}

impl ClusterProfile {
    pub fn new(id: impl Into<String>, plugin_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            plugin_id: plugin_id.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), ConfigValue::new(value));
        self
    }

    pub fn secret_params(&self) -> Vec<SecretParam> {
        crate::secrets::collect_params(self.properties.values())
    }
}

/// How an elastic agent for a job should look.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElasticProfile {
    pub id: String,
    pub plugin_id: String,
    pub cluster_profile_id: String,
    #[serde(default)]
    pub properties: BTreeMap<String, ConfigValue>,
}

impl ElasticProfile {
    pub fn new(
        id: impl Into<String>,
        plugin_id: impl Into<String>,
        cluster_profile_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            plugin_id: plugin_id.into(),
            cluster_profile_id: cluster_profile_id.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), ConfigValue::new(value));
        self
    }

    pub fn secret_params(&self) -> Vec<SecretParam> {
        crate::secrets::collect_params(self.properties.values())
    }
}

/// Plain key/value properties after secret substitution.
pub type ResolvedProperties = BTreeMap<String, String>;
