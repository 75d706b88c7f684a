// Copyright (c) 2026 Helmsman Authors
// SPDX-License-Identifier: AGPL-3.0
//! Session event source
//!
//! Event-type evaluations score rule expressions against the session and
//! tool-call events a query produced. The event log itself lives outside
//! this crate (message store); this is the read contract plus an in-memory
//! implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// One recorded session or tool-call event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionEvent {
    /// Event name, e.g. "tool_call", "message".
    pub name: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl SessionEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), attributes: HashMap::new() }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
pub trait SessionEventSource: Send + Sync {
    async fn list_events(&self, namespace: &str, session_id: &str) -> Vec<SessionEvent>;
}

/// In-memory event log keyed by (namespace, session id).
#[derive(Default)]
pub struct InMemorySessionEvents {
    events: RwLock<HashMap<(String, String), Vec<SessionEvent>>>,
}

impl InMemorySessionEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, namespace: &str, session_id: &str, event: SessionEvent) {
        self.events
            .write()
            .unwrap()
            .entry((namespace.to_string(), session_id.to_string()))
            .or_default()
            .push(event);
    }
}

#[async_trait]
impl SessionEventSource for InMemorySessionEvents {
    async fn list_events(&self, namespace: &str, session_id: &str) -> Vec<SessionEvent> {
        self.events
            .read()
            .unwrap()
            .get(&(namespace.to_string(), session_id.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}
