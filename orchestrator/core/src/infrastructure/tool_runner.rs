// Copyright (c) 2026 Helmsman Authors
// SPDX-License-Identifier: AGPL-3.0
//! Tool invocation seam
//!
//! Queries may target a Tool directly. The invocation transport (HTTP, MCP,
//! in-process) is external; the orchestrator only depends on this trait.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::tool::Tool;

#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Invoke a tool with the rendered query input, returning its output.
    async fn invoke(&self, tool: &Tool, input: &str) -> Result<String, ToolRunnerError>;
}

#[derive(Debug, Error)]
pub enum ToolRunnerError {
    #[error("tool '{0}' invocation failed: {1}")]
    Invocation(String, String),
    #[error("no tool transport is configured")]
    Unconfigured,
}

/// Placeholder runner for deployments without a tool transport.
pub struct UnconfiguredToolRunner;

#[async_trait]
impl ToolRunner for UnconfiguredToolRunner {
    async fn invoke(&self, _tool: &Tool, _input: &str) -> Result<String, ToolRunnerError> {
        Err(ToolRunnerError::Unconfigured)
    }
}
