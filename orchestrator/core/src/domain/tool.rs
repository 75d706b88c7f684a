// Copyright (c) 2026 Helmsman Authors
// SPDX-License-Identifier: AGPL-3.0
//! Tool resource: a named capability an agent (or query) may invoke.

use serde::{Deserialize, Serialize};

use crate::domain::resource::ObjectMeta;
use crate::domain::value::ValueSource;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub metadata: ObjectMeta,
    pub spec: ToolSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolSpec {
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
    /// Invocation endpoint; transport is external to this crate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<ValueSource>,
}
