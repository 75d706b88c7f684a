// Copyright (c) 2026 Helmsman Authors
// SPDX-License-Identifier: AGPL-3.0
//! Model resource: a named, addressable chat-completion backend.

use serde::{Deserialize, Serialize};

use crate::domain::resource::ObjectMeta;
use crate::domain::value::{Parameter, ValueSource};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub metadata: ObjectMeta,
    pub spec: ModelSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Provider identifier (e.g. "openai", "ollama").
    pub provider: String,
    /// Provider-side model name.
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<ValueSource>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}
