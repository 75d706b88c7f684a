// Copyright (c) 2026 Helmsman Authors
// SPDX-License-Identifier: AGPL-3.0
//! Evaluator resource: a scoring-service descriptor.
//!
//! An evaluator with a non-nil `selector` causes matching queries to be
//! auto-evaluated when they complete, without explicit user wiring.

use serde::{Deserialize, Serialize};

use crate::domain::resource::{LabelSelector, ObjectMeta, ResourceKind};
use crate::domain::value::{Parameter, ValueSource};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluator {
    pub metadata: ObjectMeta,
    pub spec: EvaluatorSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluatorSpec {
    /// Resolvable address of the scoring service.
    pub address: ValueSource,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    /// Auto-trigger match rule; absent means explicit references only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<EvaluatorMatchSelector>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorMatchSelector {
    /// Resource kind the selector applies to; queries are the only kind
    /// auto-triggered today.
    #[serde(default = "default_resource_type")]
    pub resource_type: ResourceKind,
    pub label_selector: LabelSelector,
}

fn default_resource_type() -> ResourceKind {
    ResourceKind::Query
}

impl EvaluatorMatchSelector {
    pub fn new(label_selector: LabelSelector) -> Self {
        Self { resource_type: ResourceKind::Query, label_selector }
    }
}
