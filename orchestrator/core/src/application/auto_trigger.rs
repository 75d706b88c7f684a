// Copyright (c) 2026 Helmsman Authors
// SPDX-License-Identifier: AGPL-3.0
//! Evaluator auto-trigger
//!
//! Evaluators may declare a selector; queries whose labels match are
//! evaluated on completion without explicit wiring in the query spec.
//! Matching is read-only; the query orchestrator owns evaluation creation
//! and deduplicates against explicitly referenced evaluators.

use std::sync::Arc;
use tracing::debug;

use crate::domain::evaluator::Evaluator;
use crate::domain::query::Query;
use crate::domain::resource::ResourceKind;
use crate::infrastructure::store::ResourceStore;

pub struct EvaluatorAutoTrigger {
    store: Arc<ResourceStore>,
}

impl EvaluatorAutoTrigger {
    pub fn new(store: Arc<ResourceStore>) -> Self {
        Self { store }
    }

    /// Evaluators whose selector targets queries and matches this query's
    /// labels, in name order.
    pub fn matching_evaluators(&self, query: &Query) -> Vec<Evaluator> {
        let matched: Vec<Evaluator> = self
            .store
            .evaluators()
            .list(&query.metadata.namespace)
            .into_iter()
            .filter(|evaluator| {
                evaluator.spec.selector.as_ref().is_some_and(|selector| {
                    selector.resource_type == ResourceKind::Query
                        && selector.label_selector.matches(&query.metadata.labels)
                })
            })
            .collect();
        if !matched.is_empty() {
            debug!(
                query = %query.metadata.name,
                evaluators = matched.len(),
                "auto-trigger matched evaluators"
            );
        }
        matched
    }
}
