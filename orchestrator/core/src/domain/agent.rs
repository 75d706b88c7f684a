// Copyright (c) 2026 Helmsman Authors
// SPDX-License-Identifier: AGPL-3.0
//! Agent aggregate
//!
//! An Agent is a single addressable actor: a prompt template plus either a
//! model reference or an external execution engine, with optional tools and
//! a structured output schema.
//!
//! # Invariants
//!
//! - Exactly one of `model_ref` / `execution_engine` drives execution

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::resource::ObjectMeta;
use crate::domain::value::Parameter;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub metadata: ObjectMeta,
    pub spec: AgentSpec,
    #[serde(default)]
    pub status: AgentStatus,
}

impl Agent {
    pub fn new(metadata: ObjectMeta, spec: AgentSpec) -> Result<Self, AgentError> {
        spec.validate()?;
        Ok(Self { metadata, spec, status: AgentStatus::default() })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSpec {
    /// System prompt; a template with named parameters.
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_ref: Option<String>,
    /// External execution engine reference; mutually exclusive with `model_ref`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_engine: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
}

impl AgentSpec {
    pub fn validate(&self) -> Result<(), AgentError> {
        match (&self.model_ref, &self.execution_engine) {
            (Some(_), Some(_)) => Err(AgentError::AmbiguousExecution),
            (None, None) => Err(AgentError::NoExecution),
            _ => Ok(()),
        }
    }
}

/// Readiness of an agent's referenced dependencies (model/tools).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentPhase {
    Pending,
    Ready,
    Error,
}

impl Default for AgentPhase {
    fn default() -> Self {
        AgentPhase::Pending
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentStatus {
    #[serde(default)]
    pub phase: AgentPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent sets both modelRef and executionEngine")]
    AmbiguousExecution,
    #[error("agent sets neither modelRef nor executionEngine")]
    NoExecution,
}
