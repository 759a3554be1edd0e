//! Secret resolver backed by a fixed table.

use crate::lock;
use async_trait::async_trait;
use cadence_core::ports::SecretResolver;
use cadence_core::secrets::{SecretParam, SecretUsage};
use cadence_core::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

#[derive(Default)]
pub struct StaticSecretResolver {
    values: Mutex<BTreeMap<SecretParam, String>>,
    /// Secret configs that refuse every usage.
    forbidden: Mutex<BTreeSet<String>>,
}

impl StaticSecretResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, config_id: &str, key: &str, value: &str) {
        lock(&self.values).insert(SecretParam::new(config_id, key), value.to_string());
    }

    /// Make every lookup against `config_id` violate its rules.
    pub fn forbid(&self, config_id: &str) {
        lock(&self.forbidden).insert(config_id.to_string());
    }
}

#[async_trait]
impl SecretResolver for StaticSecretResolver {
    async fn resolve(
        &self,
        usage: &SecretUsage,
        params: &[SecretParam],
    ) -> Result<BTreeMap<SecretParam, String>> {
        let forbidden = lock(&self.forbidden).clone();
        if let Some(param) = params.iter().find(|p| forbidden.contains(&p.config_id)) {
            return Err(Error::RulesViolation(format!(
                "{usage} does not have permission to refer to secrets using secret config '{}'",
                param.config_id
            )));
        }

        let values = lock(&self.values);
        params
            .iter()
            .map(|param| {
                values
                    .get(param)
                    .map(|value| (param.clone(), value.clone()))
                    .ok_or_else(|| {
                        Error::SecretResolution(format!(
                            "secret '{}' of secret config '{}' could not be resolved for {usage}",
                            param.key, param.config_id
                        ))
                    })
            })
            .collect()
    }
}
