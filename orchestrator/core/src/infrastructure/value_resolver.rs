// Copyright (c) 2026 Helmsman Authors
// SPDX-License-Identifier: AGPL-3.0
//! Value resolution
//!
//! Turns a declarative [`ValueSource`] into a concrete string. Secrets,
//! configmaps, and service discovery are external collaborators; this module
//! defines the contract plus a seeded static implementation used by the
//! engine in dev/test setups.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::domain::value::{ValueError, ValueSource};

#[async_trait]
pub trait ValueResolver: Send + Sync {
    /// Resolve a value source within a namespace.
    ///
    /// Fails if the reference is unset, multiply-set, or the referenced
    /// object/key is absent.
    async fn resolve(&self, source: &ValueSource, namespace: &str) -> Result<String, ValueError>;
}

/// In-memory resolver backed by seeded maps.
#[derive(Default)]
pub struct StaticValueResolver {
    // Keyed by (namespace, object name, key).
    secrets: RwLock<HashMap<(String, String, String), String>>,
    config_maps: RwLock<HashMap<(String, String, String), String>>,
    // Keyed by (namespace, service name).
    services: RwLock<HashMap<(String, String), String>>,
    // Keyed by (namespace, query name, parameter name).
    query_parameters: RwLock<HashMap<(String, String, String), String>>,
}

impl StaticValueResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_secret(&self, namespace: &str, name: &str, key: &str, value: &str) {
        self.secrets.write().unwrap().insert(
            (namespace.to_string(), name.to_string(), key.to_string()),
            value.to_string(),
        );
    }

    pub fn seed_config_map(&self, namespace: &str, name: &str, key: &str, value: &str) {
        self.config_maps.write().unwrap().insert(
            (namespace.to_string(), name.to_string(), key.to_string()),
            value.to_string(),
        );
    }

    pub fn seed_service(&self, namespace: &str, name: &str, address: &str) {
        self.services
            .write()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()), address.to_string());
    }

    pub fn seed_query_parameter(&self, namespace: &str, query: &str, parameter: &str, value: &str) {
        self.query_parameters.write().unwrap().insert(
            (namespace.to_string(), query.to_string(), parameter.to_string()),
            value.to_string(),
        );
    }
}

#[async_trait]
impl ValueResolver for StaticValueResolver {
    async fn resolve(&self, source: &ValueSource, namespace: &str) -> Result<String, ValueError> {
        source.validate()?;

        if let Some(value) = &source.value {
            return Ok(value.clone());
        }
        // validate() guarantees exactly one reference below is set.
        let from = source.value_from.as_ref().ok_or(ValueError::Unset)?;

        if let Some(secret) = &from.secret_key_ref {
            let key = (namespace.to_string(), secret.name.clone(), secret.key.clone());
            return self.secrets.read().unwrap().get(&key).cloned().ok_or_else(|| {
                ValueError::NotFound {
                    kind: "secret".into(),
                    name: secret.name.clone(),
                    detail: format!("key '{}' absent", secret.key),
                }
            });
        }
        if let Some(config_map) = &from.config_map_key_ref {
            let key = (namespace.to_string(), config_map.name.clone(), config_map.key.clone());
            return self.config_maps.read().unwrap().get(&key).cloned().ok_or_else(|| {
                ValueError::NotFound {
                    kind: "configmap".into(),
                    name: config_map.name.clone(),
                    detail: format!("key '{}' absent", config_map.key),
                }
            });
        }
        if let Some(service) = &from.service_ref {
            let key = (namespace.to_string(), service.name.clone());
            let base = self.services.read().unwrap().get(&key).cloned().ok_or_else(|| {
                ValueError::NotFound {
                    kind: "service".into(),
                    name: service.name.clone(),
                    detail: "no such service".into(),
                }
            })?;
            let mut address = base;
            if let Some(port) = &service.port {
                address = format!("{}:{}", address, port);
            }
            if let Some(path) = &service.path {
                address = format!("{}{}", address, path);
            }
            return Ok(address);
        }
        if let Some(param) = &from.query_parameter_ref {
            let key = (
                namespace.to_string(),
                param.query_name.clone(),
                param.parameter.clone(),
            );
            return self.query_parameters.read().unwrap().get(&key).cloned().ok_or_else(|| {
                ValueError::NotFound {
                    kind: "query parameter".into(),
                    name: param.query_name.clone(),
                    detail: format!("parameter '{}' absent", param.parameter),
                }
            });
        }
        Err(ValueError::Unset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literal_resolves_to_itself() {
        let resolver = StaticValueResolver::new();
        let value = resolver
            .resolve(&ValueSource::literal("hello"), "default")
            .await
            .unwrap();
        assert_eq!(value, "hello");
    }

    #[tokio::test]
    async fn missing_secret_key_fails() {
        let resolver = StaticValueResolver::new();
        resolver.seed_secret("default", "creds", "token", "s3cr3t");

        let found = resolver
            .resolve(&ValueSource::secret("creds", "token"), "default")
            .await
            .unwrap();
        assert_eq!(found, "s3cr3t");

        let missing = resolver
            .resolve(&ValueSource::secret("creds", "other"), "default")
            .await;
        assert!(matches!(missing, Err(ValueError::NotFound { .. })));
    }

    #[tokio::test]
    async fn secrets_are_namespace_scoped() {
        let resolver = StaticValueResolver::new();
        resolver.seed_secret("team-a", "creds", "token", "a");
        let missing = resolver
            .resolve(&ValueSource::secret("creds", "token"), "team-b")
            .await;
        assert!(missing.is_err());
    }
}
