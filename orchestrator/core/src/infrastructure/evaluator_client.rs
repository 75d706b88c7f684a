// Copyright (c) 2026 Helmsman Authors
// SPDX-License-Identifier: AGPL-3.0
// Evaluator Service Interface (Anti-Corruption Layer)
//
// Contract for external scoring services. The wire transport is outside
// this crate; the evaluation orchestrator resolves the evaluator's address
// through the value resolver and hands the request to this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::domain::evaluation::EvaluationType;
use crate::domain::query::{Response, TokenUsage};

#[async_trait]
pub trait EvaluatorClient: Send + Sync {
    async fn evaluate(&self, request: EvaluationRequest) -> Result<EvaluatorVerdict, EvaluatorClientError>;
}

/// One scoring request to an evaluator service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRequest {
    /// Evaluator name, for diagnostics.
    pub evaluator: String,
    /// Resolved service address.
    pub address: String,
    #[serde(rename = "type")]
    pub eval_type: EvaluationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Originating query, for query-type requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_name: Option<String>,
    #[serde(default)]
    pub responses: Vec<Response>,
    /// Resolved evaluator parameters.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Scoring outcome returned by an evaluator service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluatorVerdict {
    /// Score in `[0, 1]`.
    pub score: f64,
    pub passed: bool,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub token_usage: TokenUsage,
}

#[derive(Debug, Error)]
pub enum EvaluatorClientError {
    #[error("evaluator '{0}' is unreachable: {1}")]
    Unreachable(String, String),
    #[error("evaluator '{0}' rejected the request: {1}")]
    Rejected(String, String),
}
