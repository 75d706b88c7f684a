// Copyright (c) 2026 Helmsman Authors
// SPDX-License-Identifier: AGPL-3.0
//! Target resolution
//!
//! Expands a query into its concrete ordered set of execution targets:
//! explicit references first, then label-selector matches as a supplement,
//! deduplicated by kind+name. Read-only; no side effects.

use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

use crate::domain::query::Query;
use crate::domain::resource::{LabelSelector, ResourceKind, TargetRef};
use crate::infrastructure::store::ResourceStore;

pub struct TargetResolver {
    store: Arc<ResourceStore>,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no targets resolved for query '{0}'")]
    NoTargets(String),
    #[error("target {kind} '{name}' not found")]
    TargetNotFound { kind: ResourceKind, name: String },
    #[error("kind '{0}' is not a valid execution target")]
    InvalidTargetKind(ResourceKind),
}

impl TargetResolver {
    pub fn new(store: Arc<ResourceStore>) -> Self {
        Self { store }
    }

    /// Resolve the ordered target list for a query.
    ///
    /// Explicit targets take precedence; the selector only supplements them.
    pub fn resolve_targets(&self, query: &Query) -> Result<Vec<TargetRef>, ResolveError> {
        let namespace = &query.metadata.namespace;
        let mut resolved: Vec<TargetRef> = Vec::new();
        let mut seen: HashSet<TargetRef> = HashSet::new();

        for target in &query.spec.targets {
            if !self.target_exists(namespace, target)? {
                return Err(ResolveError::TargetNotFound {
                    kind: target.kind,
                    name: target.name.clone(),
                });
            }
            if seen.insert(target.clone()) {
                resolved.push(target.clone());
            }
        }

        if let Some(selector) = &query.spec.selector {
            for target in self.selector_matches(namespace, selector) {
                if seen.insert(target.clone()) {
                    resolved.push(target);
                }
            }
        }

        if resolved.is_empty() {
            return Err(ResolveError::NoTargets(query.metadata.name.clone()));
        }
        Ok(resolved)
    }

    fn target_exists(&self, namespace: &str, target: &TargetRef) -> Result<bool, ResolveError> {
        let exists = match target.kind {
            ResourceKind::Agent => self.store.agents().get(namespace, &target.name).is_some(),
            ResourceKind::Team => self.store.teams().get(namespace, &target.name).is_some(),
            ResourceKind::Model => self.store.models().get(namespace, &target.name).is_some(),
            ResourceKind::Tool => self.store.tools().get(namespace, &target.name).is_some(),
            other => return Err(ResolveError::InvalidTargetKind(other)),
        };
        Ok(exists)
    }

    /// Selector matches in stable order: agents, teams, models, tools,
    /// each name-sorted by the store.
    fn selector_matches(&self, namespace: &str, selector: &LabelSelector) -> Vec<TargetRef> {
        if selector.is_empty() {
            return Vec::new();
        }
        let mut matches = Vec::new();
        for agent in self.store.agents().list_matching(namespace, selector) {
            matches.push(TargetRef::new(ResourceKind::Agent, agent.metadata.name));
        }
        for team in self.store.teams().list_matching(namespace, selector) {
            matches.push(TargetRef::new(ResourceKind::Team, team.metadata.name));
        }
        for model in self.store.models().list_matching(namespace, selector) {
            matches.push(TargetRef::new(ResourceKind::Model, model.metadata.name));
        }
        for tool in self.store.tools().list_matching(namespace, selector) {
            matches.push(TargetRef::new(ResourceKind::Tool, tool.metadata.name));
        }
        matches
    }
}
