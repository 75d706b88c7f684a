// Copyright (c) 2026 Helmsman Authors
// SPDX-License-Identifier: AGPL-3.0
//! Shared resource primitives
//!
//! Every record the control plane manages (Agent, Team, Model, Tool, Query,
//! Evaluation, Evaluator) carries the same metadata envelope: a namespaced
//! name, a label map, and a monotonically increasing resource version used
//! for optimistic concurrency.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Object metadata, typed references, label selectors

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

// ============================================================================
// Object Metadata
// ============================================================================

/// Metadata envelope shared by every managed record.
///
/// # Invariants
/// - `resource_version` increases by one on every successful update
/// - `uid` never changes for the lifetime of the object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Optimistic concurrency token; bumped by the store on each update.
    #[serde(default)]
    pub resource_version: u64,
    pub uid: Uuid,
    pub created_at: DateTime<Utc>,
}

impl ObjectMeta {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels: HashMap::new(),
            resource_version: 0,
            uid: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }

    pub fn with_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

// ============================================================================
// Typed References
// ============================================================================

/// Kind discriminator for every record the store manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Agent,
    Team,
    Model,
    Tool,
    Query,
    Evaluation,
    Evaluator,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceKind::Agent => "agent",
            ResourceKind::Team => "team",
            ResourceKind::Model => "model",
            ResourceKind::Tool => "tool",
            ResourceKind::Query => "query",
            ResourceKind::Evaluation => "evaluation",
            ResourceKind::Evaluator => "evaluator",
        };
        write!(f, "{}", s)
    }
}

/// A typed, named reference to an execution target (Agent/Team/Model/Tool).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetRef {
    #[serde(rename = "type")]
    pub kind: ResourceKind,
    pub name: String,
}

impl TargetRef {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self { kind, name: name.into() }
    }
}

impl std::fmt::Display for TargetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

// ============================================================================
// Label Selectors
// ============================================================================

/// Equality-based label selector.
///
/// A selector matches a label map when every `match_labels` entry is present
/// with an equal value. An empty selector matches nothing when used for
/// dynamic targeting (callers must treat it as "no selector").
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.match_labels.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty()
    }

    /// Predicate match over a label map.
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        if self.match_labels.is_empty() {
            return false;
        }
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|l| l == v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn selector_matches_subset() {
        let selector = LabelSelector::new().with_label("team", "alpha");
        assert!(selector.matches(&labels(&[("team", "alpha"), ("tier", "prod")])));
    }

    #[test]
    fn selector_rejects_wrong_value() {
        let selector = LabelSelector::new().with_label("team", "alpha");
        assert!(!selector.matches(&labels(&[("team", "beta")])));
        assert!(!selector.matches(&labels(&[])));
    }

    #[test]
    fn empty_selector_matches_nothing() {
        let selector = LabelSelector::new();
        assert!(!selector.matches(&labels(&[("team", "alpha")])));
    }

    #[test]
    fn resource_version_starts_at_zero() {
        let meta = ObjectMeta::new("q1", "default");
        assert_eq!(meta.resource_version, 0);
        assert_eq!(meta.namespace, "default");
    }
}
