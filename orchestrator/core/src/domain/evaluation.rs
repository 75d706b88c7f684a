// Copyright (c) 2026 Helmsman Authors
// SPDX-License-Identifier: AGPL-3.0
//! Evaluation aggregate
//!
//! One scoring unit. The `config` field is a discriminated union: exactly the
//! sub-config matching `type` may be populated, validated as a single
//! explicit invariant check rather than scattered nil-checks.
//!
//! # Invariants
//!
//! - Exactly one sub-config is set, and it matches `type`
//! - `batch_progress` is present iff `type = batch`
//! - `score` is a decimal string in `[0, 1]`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use crate::domain::query::TokenUsage;
use crate::domain::resource::{LabelSelector, ObjectMeta};
use crate::domain::value::Parameter;

// ============================================================================
// Aggregate Root: Evaluation
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub metadata: ObjectMeta,
    pub spec: EvaluationSpec,
    #[serde(default)]
    pub status: EvaluationStatus,
}

impl Evaluation {
    pub fn new(metadata: ObjectMeta, spec: EvaluationSpec) -> Self {
        Self { metadata, spec, status: EvaluationStatus::default() }
    }

    /// Passive TTL expiry; mirrors `Query::is_expired`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if !self.status.phase.is_terminal() {
            return false;
        }
        let (Some(ttl), Some(completed_at)) = (self.spec.ttl, self.status.completed_at) else {
            return false;
        };
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return false;
        };
        now >= completed_at + ttl
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluationSpec {
    #[serde(rename = "type", default)]
    pub eval_type: EvaluationType,
    #[serde(default)]
    pub config: EvaluationConfig,
    pub evaluator: EvaluatorRef,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub ttl: Option<Duration>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

/// Named evaluator plus call-time parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluatorRef {
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationType {
    Direct,
    Baseline,
    Query,
    Batch,
    Event,
}

impl Default for EvaluationType {
    fn default() -> Self {
        EvaluationType::Direct
    }
}

impl std::fmt::Display for EvaluationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EvaluationType::Direct => "direct",
            EvaluationType::Baseline => "baseline",
            EvaluationType::Query => "query",
            EvaluationType::Batch => "batch",
            EvaluationType::Event => "event",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Discriminated Config
// ============================================================================

/// Union of per-type sub-configs; see [`EvaluationConfig::validate`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct: Option<DirectConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<QueryConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<BaselineConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<EventConfig>,
}

impl EvaluationConfig {
    /// Enforce "exactly one populated, matching `type`".
    pub fn validate(&self, eval_type: EvaluationType) -> Result<(), EvaluationError> {
        let populated: Vec<&'static str> = [
            ("direct", self.direct.is_some()),
            ("query", self.query.is_some()),
            ("baseline", self.baseline.is_some()),
            ("batch", self.batch.is_some()),
            ("event", self.event.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, set)| set.then_some(name))
        .collect();

        let expected = match eval_type {
            EvaluationType::Direct => "direct",
            EvaluationType::Query => "query",
            EvaluationType::Baseline => "baseline",
            EvaluationType::Batch => "batch",
            EvaluationType::Event => "event",
        };

        // Baseline carries no extra config; an absent sub-config is fine.
        if populated.is_empty() {
            if eval_type == EvaluationType::Baseline {
                return Ok(());
            }
            return Err(EvaluationError::MissingConfig(eval_type));
        }
        if populated.len() > 1 || populated[0] != expected {
            return Err(EvaluationError::ConfigMismatch {
                eval_type,
                populated: populated.join(", "),
            });
        }
        if let Some(batch) = &self.batch {
            batch.validate()?;
        }
        if let Some(event) = &self.event {
            event.validate()?;
        }
        Ok(())
    }
}

/// Score `input` against `output` with no query lookup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectConfig {
    pub input: String,
    pub output: String,
}

/// Score the responses of an existing query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryConfig {
    pub query_ref: String,
    /// Restrict scoring to one response target, as `name` or `kind/name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_target: Option<String>,
}

/// Evaluator-defined comparison against a baseline corpus; no extra fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BaselineConfig {}

/// Fan-out configuration for batch evaluations.
///
/// Exactly one child source: explicit `items`, a `template` applied per
/// `query_selector` match, or the legacy `evaluations` list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default)]
    pub items: Vec<BatchItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<BatchTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_selector: Option<LabelSelector>,
    /// Legacy aggregation list of fully-specified child evaluations.
    #[serde(default)]
    pub evaluations: Vec<LegacyChildSpec>,
    /// Bound on concurrently running children.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// When false (default), the first child failure halts further scheduling.
    #[serde(default)]
    pub continue_on_failure: bool,
}

fn default_concurrency() -> usize {
    10
}

impl BatchConfig {
    pub fn validate(&self) -> Result<(), EvaluationError> {
        let sources = usize::from(!self.items.is_empty())
            + usize::from(self.template.is_some() || self.query_selector.is_some())
            + usize::from(!self.evaluations.is_empty());
        if sources != 1 {
            return Err(EvaluationError::InvalidBatchSource);
        }
        if self.template.is_some() != self.query_selector.is_some() {
            return Err(EvaluationError::InvalidBatchSource);
        }
        if self.concurrency == 0 {
            return Err(EvaluationError::ZeroConcurrency);
        }
        for legacy in &self.evaluations {
            if legacy.eval_type == EvaluationType::Batch {
                return Err(EvaluationError::NestedBatch);
            }
            legacy.config.validate(legacy.eval_type)?;
        }
        Ok(())
    }
}

/// One explicit input/output pair; becomes a direct-type child.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub input: String,
    pub output: String,
}

/// Template stamped out once per query matched by `query_selector`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchTemplate {
    /// Override the parent's evaluator for generated children.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluator: Option<EvaluatorRef>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

/// Legacy fully-specified child (pre-template batch shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyChildSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub eval_type: EvaluationType,
    #[serde(default)]
    pub config: EvaluationConfig,
}

/// Expression rules applied to session/tool-call events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventConfig {
    #[serde(default)]
    pub rules: Vec<EventRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_score_threshold: Option<f64>,
}

impl EventConfig {
    pub fn validate(&self) -> Result<(), EvaluationError> {
        if self.rules.is_empty() {
            return Err(EvaluationError::NoRules);
        }
        if self.rules.iter().any(|r| r.weight == 0) {
            return Err(EvaluationError::ZeroWeightRule);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRule {
    pub name: String,
    /// Check of the form `field == "value"`, `field != "value"`,
    /// `field contains "value"`, or `exists(field)`.
    pub expression: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationPhase {
    Pending,
    Running,
    Error,
    Done,
    Canceled,
}

impl Default for EvaluationPhase {
    fn default() -> Self {
        EvaluationPhase::Pending
    }
}

impl EvaluationPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EvaluationPhase::Done | EvaluationPhase::Error | EvaluationPhase::Canceled
        )
    }
}

impl std::fmt::Display for EvaluationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EvaluationPhase::Pending => "pending",
            EvaluationPhase::Running => "running",
            EvaluationPhase::Error => "error",
            EvaluationPhase::Done => "done",
            EvaluationPhase::Canceled => "canceled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluationStatus {
    #[serde(default)]
    pub phase: EvaluationPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Decimal string in `[0, 1]`, e.g. `"0.85"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passed: Option<bool>,
    #[serde(default)]
    pub token_usage: TokenUsage,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Present iff `type = batch`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_progress: Option<BatchProgress>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Live counters for a batch fan-out.
///
/// `completed + failed + running <= total` at all times; the sum equals
/// `total` once the parent is terminal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub running: usize,
    #[serde(default)]
    pub child_evaluations: Vec<ChildEvaluationStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildEvaluationStatus {
    pub name: String,
    pub phase: EvaluationPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Render a score as the canonical two-place decimal string.
pub fn format_score(score: f64) -> String {
    format!("{:.2}", score.clamp(0.0, 1.0))
}

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("evaluation of type '{eval_type}' has mismatched config ({populated} populated)")]
    ConfigMismatch {
        eval_type: EvaluationType,
        populated: String,
    },
    #[error("evaluation of type '{0}' has no matching config")]
    MissingConfig(EvaluationType),
    #[error("batch config must set exactly one of items, template+querySelector, or evaluations")]
    InvalidBatchSource,
    #[error("batch concurrency must be at least 1")]
    ZeroConcurrency,
    #[error("batch evaluations may not nest batch children")]
    NestedBatch,
    #[error("event evaluation declares no rules")]
    NoRules,
    #[error("event rule weight must be at least 1")]
    ZeroWeightRule,
}
