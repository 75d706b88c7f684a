// Copyright (c) 2026 Helmsman Authors
// SPDX-License-Identifier: AGPL-3.0
//! In-memory resource store
//!
//! Namespace-scoped CRUD plus label-selector queries over every managed
//! record kind, with a subscribe/notify channel that drives reconciliation.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Pluggable persistence; in-memory backend for dev/test
//!
//! Concurrent reconciliations of the same object are resolved by optimistic
//! concurrency: `update` is a check-and-set on `resource_version` and fails
//! with [`StoreError::Conflict`] on mismatch. There is no global lock.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::domain::agent::Agent;
use crate::domain::evaluation::Evaluation;
use crate::domain::evaluator::Evaluator;
use crate::domain::model::Model;
use crate::domain::query::Query;
use crate::domain::resource::{LabelSelector, ObjectMeta, ResourceKind};
use crate::domain::team::Team;
use crate::domain::tool::Tool;

/// A record the store can manage.
pub trait Resource: Clone + Send + Sync + 'static {
    const KIND: ResourceKind;

    fn metadata(&self) -> &ObjectMeta;
    fn metadata_mut(&mut self) -> &mut ObjectMeta;
}

macro_rules! impl_resource {
    ($ty:ident, $kind:expr) => {
        impl Resource for $ty {
            const KIND: ResourceKind = $kind;

            fn metadata(&self) -> &ObjectMeta {
                &self.metadata
            }

            fn metadata_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }
        }
    };
}

impl_resource!(Agent, ResourceKind::Agent);
impl_resource!(Team, ResourceKind::Team);
impl_resource!(Model, ResourceKind::Model);
impl_resource!(Tool, ResourceKind::Tool);
impl_resource!(Query, ResourceKind::Query);
impl_resource!(Evaluation, ResourceKind::Evaluation);
impl_resource!(Evaluator, ResourceKind::Evaluator);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: ResourceKind, name: String },
    #[error("{kind} '{name}' not found")]
    NotFound { kind: ResourceKind, name: String },
    #[error("conflict updating {kind} '{name}': resource version mismatch")]
    Conflict { kind: ResourceKind, name: String },
}

/// Change notification delivered to watch subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeNotice {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
    pub op: ChangeOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Applied,
    Deleted,
}

/// One keyed collection of records; shared notifier across collections.
pub struct Collection<T: Resource> {
    items: DashMap<(String, String), T>,
    notifier: broadcast::Sender<ChangeNotice>,
}

impl<T: Resource> Collection<T> {
    fn new(notifier: broadcast::Sender<ChangeNotice>) -> Self {
        Self { items: DashMap::new(), notifier }
    }

    fn key(namespace: &str, name: &str) -> (String, String) {
        (namespace.to_string(), name.to_string())
    }

    fn notify(&self, meta: &ObjectMeta, op: ChangeOp) {
        // Fire-and-forget; a full or subscriber-less channel never fails CRUD.
        let _ = self.notifier.send(ChangeNotice {
            kind: T::KIND,
            namespace: meta.namespace.clone(),
            name: meta.name.clone(),
            op,
        });
    }

    /// Insert a new record; its resource version starts at 1.
    pub fn create(&self, mut obj: T) -> Result<T, StoreError> {
        let key = Self::key(&obj.metadata().namespace, &obj.metadata().name);
        if self.items.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: T::KIND,
                name: obj.metadata().name.clone(),
            });
        }
        obj.metadata_mut().resource_version = 1;
        self.items.insert(key, obj.clone());
        self.notify(obj.metadata(), ChangeOp::Applied);
        Ok(obj)
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<T> {
        self.items.get(&Self::key(namespace, name)).map(|r| r.value().clone())
    }

    /// List every record in a namespace, ordered by name.
    pub fn list(&self, namespace: &str) -> Vec<T> {
        let mut records: Vec<T> = self
            .items
            .iter()
            .filter(|entry| entry.key().0 == namespace)
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| a.metadata().name.cmp(&b.metadata().name));
        records
    }

    /// Every record across all namespaces, ordered by namespace then name.
    pub fn list_all(&self) -> Vec<T> {
        let mut records: Vec<T> = self.items.iter().map(|entry| entry.value().clone()).collect();
        records.sort_by(|a, b| {
            (&a.metadata().namespace, &a.metadata().name)
                .cmp(&(&b.metadata().namespace, &b.metadata().name))
        });
        records
    }

    /// Label-selector query within a namespace, ordered by name.
    pub fn list_matching(&self, namespace: &str, selector: &LabelSelector) -> Vec<T> {
        self.list(namespace)
            .into_iter()
            .filter(|obj| selector.matches(&obj.metadata().labels))
            .collect()
    }

    /// Check-and-set update: fails with `Conflict` unless the caller holds
    /// the currently stored resource version.
    pub fn update(&self, mut obj: T) -> Result<T, StoreError> {
        let key = Self::key(&obj.metadata().namespace, &obj.metadata().name);
        let mut entry = self.items.get_mut(&key).ok_or_else(|| StoreError::NotFound {
            kind: T::KIND,
            name: obj.metadata().name.clone(),
        })?;
        if entry.metadata().resource_version != obj.metadata().resource_version {
            return Err(StoreError::Conflict {
                kind: T::KIND,
                name: obj.metadata().name.clone(),
            });
        }
        obj.metadata_mut().resource_version += 1;
        *entry.value_mut() = obj.clone();
        drop(entry);
        self.notify(obj.metadata(), ChangeOp::Applied);
        Ok(obj)
    }

    /// Idempotent delete; returns whether a record was removed.
    pub fn delete(&self, namespace: &str, name: &str) -> bool {
        match self.items.remove(&Self::key(namespace, name)) {
            Some((_, obj)) => {
                self.notify(obj.metadata(), ChangeOp::Deleted);
                true
            }
            None => false,
        }
    }
}

/// The full resource store: one collection per managed kind plus a shared
/// watch channel.
pub struct ResourceStore {
    agents: Collection<Agent>,
    teams: Collection<Team>,
    models: Collection<Model>,
    tools: Collection<Tool>,
    queries: Collection<Query>,
    evaluations: Collection<Evaluation>,
    evaluators: Collection<Evaluator>,
    notifier: broadcast::Sender<ChangeNotice>,
}

impl ResourceStore {
    pub fn new() -> Arc<Self> {
        let (notifier, _) = broadcast::channel(1024);
        Arc::new(Self {
            agents: Collection::new(notifier.clone()),
            teams: Collection::new(notifier.clone()),
            models: Collection::new(notifier.clone()),
            tools: Collection::new(notifier.clone()),
            queries: Collection::new(notifier.clone()),
            evaluations: Collection::new(notifier.clone()),
            evaluators: Collection::new(notifier.clone()),
            notifier,
        })
    }

    /// Subscribe to change notifications for reconciliation triggers.
    pub fn watch(&self) -> broadcast::Receiver<ChangeNotice> {
        self.notifier.subscribe()
    }

    pub fn agents(&self) -> &Collection<Agent> {
        &self.agents
    }

    pub fn teams(&self) -> &Collection<Team> {
        &self.teams
    }

    pub fn models(&self) -> &Collection<Model> {
        &self.models
    }

    pub fn tools(&self) -> &Collection<Tool> {
        &self.tools
    }

    pub fn queries(&self) -> &Collection<Query> {
        &self.queries
    }

    pub fn evaluations(&self) -> &Collection<Evaluation> {
        &self.evaluations
    }

    pub fn evaluators(&self) -> &Collection<Evaluator> {
        &self.evaluators
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::query::QuerySpec;

    fn query(name: &str) -> Query {
        Query::new(ObjectMeta::new(name, "default"), QuerySpec::default())
    }

    #[test]
    fn create_then_get_round_trips() {
        let store = ResourceStore::new();
        store.queries().create(query("q1")).unwrap();
        let fetched = store.queries().get("default", "q1").unwrap();
        assert_eq!(fetched.metadata.resource_version, 1);
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let store = ResourceStore::new();
        store.queries().create(query("q1")).unwrap();
        assert!(matches!(
            store.queries().create(query("q1")),
            Err(StoreError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn stale_update_conflicts() {
        let store = ResourceStore::new();
        let stale = store.queries().create(query("q1")).unwrap();
        let fresh = store.queries().update(stale.clone()).unwrap();
        assert_eq!(fresh.metadata.resource_version, 2);

        // Writing through the stale copy must fail the check-and-set.
        assert!(matches!(
            store.queries().update(stale),
            Err(StoreError::Conflict { .. })
        ));
    }

    #[test]
    fn list_is_namespace_scoped() {
        let store = ResourceStore::new();
        store.queries().create(query("q1")).unwrap();
        store
            .queries()
            .create(Query::new(ObjectMeta::new("q2", "other"), QuerySpec::default()))
            .unwrap();
        assert_eq!(store.queries().list("default").len(), 1);
        assert_eq!(store.queries().list("other").len(), 1);
        assert_eq!(store.queries().list_all().len(), 2);
    }

    #[tokio::test]
    async fn mutations_notify_watchers() {
        let store = ResourceStore::new();
        let mut watch = store.watch();
        store.queries().create(query("q1")).unwrap();
        let notice = watch.recv().await.unwrap();
        assert_eq!(notice.kind, ResourceKind::Query);
        assert_eq!(notice.name, "q1");
        assert_eq!(notice.op, ChangeOp::Applied);
    }
}
