// Copyright (c) 2026 Helmsman Authors
// SPDX-License-Identifier: AGPL-3.0
//! Template rendering
//!
//! Handlebars-backed interpolation for prompt and input templates
//! (`{{name}}` placeholders). Non-strict: unknown variables render empty,
//! and an empty template renders to an empty string without error.

use anyhow::{Context, Result};
use handlebars::Handlebars;
use serde_json::Value;
use std::collections::HashMap;

pub struct TemplateEngine {
    registry: Handlebars<'static>,
}

impl TemplateEngine {
    pub fn new() -> Self {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(false);
        registry.register_escape_fn(handlebars::no_escape);
        Self { registry }
    }

    /// Render `template` with the given variables.
    pub fn render(&self, template: &str, vars: &HashMap<String, Value>) -> Result<String> {
        if template.is_empty() {
            return Ok(String::new());
        }
        self.registry
            .render_template(template, vars)
            .context("failed to render template")
    }

    /// Render with plain string variables.
    pub fn render_strings(&self, template: &str, vars: &HashMap<String, String>) -> Result<String> {
        let vars: HashMap<String, Value> = vars
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        self.render(template, &vars)
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}
