// Copyright (c) 2026 Helmsman Authors
// SPDX-License-Identifier: AGPL-3.0
//! Value sources
//!
//! A [`ValueSource`] is a declarative reference that resolves to a concrete
//! string at execution time: a literal, or exactly one of a secret key, a
//! configmap key, a service endpoint, or another query's parameter.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Declarative value references consumed by every component

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A literal value or a single indirect reference.
///
/// # Invariants
/// - Exactly one of `value` / `value_from` is set
/// - Within `value_from`, exactly one reference field is set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueSource {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_from: Option<ValueFromSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueFromSource {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<KeyRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_map_key_ref: Option<KeyRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_ref: Option<ServiceRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_parameter_ref: Option<QueryParameterRef>,
}

/// Reference to a key within a named secret or configmap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRef {
    pub name: String,
    pub key: String,
}

/// Reference to a named service endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRef {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Reference to a parameter declared on another query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryParameterRef {
    pub query_name: String,
    pub parameter: String,
}

#[derive(Debug, Error)]
pub enum ValueError {
    #[error("value source has no value or reference set")]
    Unset,
    #[error("value source sets more than one reference")]
    MultiplySet,
    #[error("referenced {kind} '{name}' not found: {detail}")]
    NotFound {
        kind: String,
        name: String,
        detail: String,
    },
}

impl ValueSource {
    /// A plain literal value.
    pub fn literal(value: impl Into<String>) -> Self {
        Self { value: Some(value.into()), value_from: None }
    }

    pub fn secret(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            value: None,
            value_from: Some(ValueFromSource {
                secret_key_ref: Some(KeyRef { name: name.into(), key: key.into() }),
                ..Default::default()
            }),
        }
    }

    /// Enforce the exactly-one invariant.
    pub fn validate(&self) -> Result<(), ValueError> {
        let mut set = usize::from(self.value.is_some());
        if let Some(from) = &self.value_from {
            set += usize::from(from.secret_key_ref.is_some());
            set += usize::from(from.config_map_key_ref.is_some());
            set += usize::from(from.service_ref.is_some());
            set += usize::from(from.query_parameter_ref.is_some());
        }
        match set {
            0 => Err(ValueError::Unset),
            1 => Ok(()),
            _ => Err(ValueError::MultiplySet),
        }
    }
}

/// A named parameter whose value is resolved at execution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: ValueSource,
}

impl Parameter {
    pub fn literal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: ValueSource::literal(value) }
    }
}
