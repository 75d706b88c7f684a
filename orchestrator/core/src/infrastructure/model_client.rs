// Copyright (c) 2026 Helmsman Authors
// SPDX-License-Identifier: AGPL-3.0
// Model Invocation Interface (Anti-Corruption Layer)
//
// Domain-facing chat-completion contract. Provider adapters (HTTP clients
// for OpenAI-compatible backends etc.) live outside this crate; the engine
// only depends on this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::query::TokenUsage;

/// Chat-completion backend used by direct agent execution and the team
/// selector strategy.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Perform one chat completion. A successful response carries at least
    /// one choice.
    async fn chat_completion(&self, request: ChatRequest) -> Result<ChatResponse, ModelError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Model name as resolved from the target's spec.
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Tool names offered to the model.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Number of choices requested; defaults to 1.
    #[serde(default = "default_choice_count")]
    pub choice_count: u32,
}

fn default_choice_count() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    /// Speaker name for multi-party transcripts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into(), name: None }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into(), name: None }
    }

    pub fn assistant(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            name: Some(name.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: TokenUsage,
}

impl ChatResponse {
    /// First choice content; responses with zero choices are a provider bug.
    pub fn first_choice(&self) -> Result<&str, ModelError> {
        self.choices
            .first()
            .map(|c| c.content.as_str())
            .ok_or(ModelError::EmptyResponse)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    pub content: String,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model '{0}' is unavailable: {1}")]
    Unavailable(String, String),
    #[error("model invocation failed: {0}")]
    Invocation(String),
    #[error("model returned no choices")]
    EmptyResponse,
}
