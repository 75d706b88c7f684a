// Copyright (c) 2026 Helmsman Authors
// SPDX-License-Identifier: AGPL-3.0
//! Query aggregate
//!
//! A Query is the unit of work the control plane executes: templated input
//! text, a set of execution targets (explicit and/or selector-matched), and
//! optional evaluation wiring. The orchestrator is the only writer of
//! `QueryStatus`.
//!
//! # Invariants
//!
//! - `phase` only advances forward, except into `Error`/`Canceled` which are
//!   reachable from any non-terminal state
//! - Terminal status is immutable: no component mutates `responses`,
//!   `evaluations`, or `phase` once the query is terminal

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use crate::domain::resource::{LabelSelector, ObjectMeta, TargetRef};
use crate::domain::value::Parameter;

// ============================================================================
// Aggregate Root: Query
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub metadata: ObjectMeta,
    pub spec: QuerySpec,
    #[serde(default)]
    pub status: QueryStatus,
}

impl Query {
    pub fn new(metadata: ObjectMeta, spec: QuerySpec) -> Self {
        Self { metadata, spec, status: QueryStatus::default() }
    }

    /// Whether a terminal query has outlived its TTL and may be collected.
    ///
    /// Passive expiry: eligibility, not a deletion guarantee.
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
pub struct QuerySpec {
    /// Input text; a template with named parameters.
    pub input: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    /// Explicit execution targets; take precedence over `selector`.
    #[serde(default)]
    pub targets: Vec<TargetRef>,
    /// Dynamic target membership; supplements explicit targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
    /// Conversation history store reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Explicitly referenced evaluators, by name.
    #[serde(default)]
    pub evaluators: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluator_selector: Option<LabelSelector>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub ttl: Option<Duration>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    /// Cooperative cancellation intent.
    #[serde(default)]
    pub cancel: bool,
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryPhase {
    Pending,
    Running,
    Evaluating,
    Done,
    Error,
    Canceled,
}

impl Default for QueryPhase {
    fn default() -> Self {
        QueryPhase::Pending
    }
}

impl QueryPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, QueryPhase::Done | QueryPhase::Error | QueryPhase::Canceled)
    }

    fn ordinal(self) -> u8 {
        match self {
            QueryPhase::Pending => 0,
            QueryPhase::Running => 1,
            QueryPhase::Evaluating => 2,
            QueryPhase::Done => 3,
            // Terminal sinks; never advanced out of.
            QueryPhase::Error | QueryPhase::Canceled => 4,
        }
    }

    /// Forward-only transition rule.
    pub fn can_transition_to(self, next: QueryPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        if matches!(next, QueryPhase::Error | QueryPhase::Canceled) {
            return true;
        }
        next.ordinal() > self.ordinal()
    }
}

impl std::fmt::Display for QueryPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QueryPhase::Pending => "pending",
            QueryPhase::Running => "running",
            QueryPhase::Evaluating => "evaluating",
            QueryPhase::Done => "done",
            QueryPhase::Error => "error",
            QueryPhase::Canceled => "canceled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryStatus {
    #[serde(default)]
    pub phase: QueryPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// One response per resolved target.
    #[serde(default)]
    pub responses: Vec<Response>,
    /// Evaluation outcomes referencing this query.
    #[serde(default)]
    pub evaluations: Vec<EvaluationSummary>,
    #[serde(default)]
    pub token_usage: TokenUsage,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl QueryStatus {
    /// Apply a phase transition, enforcing the forward-only rule.
    pub fn transition(&mut self, next: QueryPhase) -> Result<(), QueryError> {
        if self.phase == next {
            return Ok(());
        }
        if !self.phase.can_transition_to(next) {
            return Err(QueryError::InvalidTransition { from: self.phase, to: next });
        }
        self.phase = next;
        Ok(())
    }
}

/// Rendered output for one execution target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub target: TargetRef,
    pub content: String,
}

/// One evaluator's outcome, as surfaced on the query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationSummary {
    pub evaluator_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passed: Option<bool>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Token accounting summed across all model calls of a query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid query phase transition: {from} -> {to}")]
    InvalidTransition { from: QueryPhase, to: QueryPhase },
}
