// Copyright (c) 2026 Helmsman Authors
// SPDX-License-Identifier: AGPL-3.0
//! Reconciliation loop
//!
//! Subscribes to store change notifications and drives the query and
//! evaluation orchestrators plus agent readiness. At-least-once: every
//! status write re-notifies, so multi-step state machines advance one
//! observed state at a time until terminal. A periodic resync re-drives
//! every non-terminal object, covering missed notifications and deadlines
//! that pass without any new event.
//!
//! Failures are isolated per object: an unexpected internal error settles
//! that object to `error` with a generic message and never affects others.

use chrono::Utc;
use dashmap::DashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::application::evaluation_orchestrator::EvaluationOrchestrator;
use crate::application::query_orchestrator::{QueryOrchestrator, QUERY_LABEL};
use crate::domain::agent::AgentPhase;
use crate::domain::evaluation::EvaluationPhase;
use crate::domain::query::QueryPhase;
use crate::domain::resource::ResourceKind;
use crate::infrastructure::store::{ChangeNotice, ChangeOp, ResourceStore, StoreError};

const INTERNAL_ERROR_MESSAGE: &str = "internal orchestration error";

/// How often the loop re-drives non-terminal objects that produced no new
/// change notification. This is what enforces deadlines on objects whose
/// progress stalled, e.g. a query waiting on a stuck evaluation.
const RESYNC_INTERVAL: Duration = Duration::from_millis(100);

pub struct Reconciler {
    store: Arc<ResourceStore>,
    queries: Arc<QueryOrchestrator>,
    evaluations: Arc<EvaluationOrchestrator>,
    // Subscribed at construction so objects created before the dispatch loop
    // first polls are still delivered; taken exactly once by `run`.
    watch: Mutex<Option<broadcast::Receiver<ChangeNotice>>>,
    // Objects with a reconciliation in flight; a second notification for the
    // same object is dropped rather than racing it.
    in_flight: DashSet<(ResourceKind, String, String)>,
}

impl Reconciler {
    pub fn new(
        store: Arc<ResourceStore>,
        queries: Arc<QueryOrchestrator>,
        evaluations: Arc<EvaluationOrchestrator>,
    ) -> Arc<Self> {
        let watch = Mutex::new(Some(store.watch()));
        Arc::new(Self { store, queries, evaluations, watch, in_flight: DashSet::new() })
    }

    /// Run the dispatch loop until the store's watch channel closes.
    pub async fn run(self: Arc<Self>) {
        let Some(mut watch) = self.watch.lock().unwrap().take() else {
            warn!("reconciler dispatch loop is already running");
            return;
        };
        let mut resync = tokio::time::interval(RESYNC_INTERVAL);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("reconciler started");
        loop {
            tokio::select! {
                received = watch.recv() => match received {
                    Ok(notice) => self.clone().dispatch(notice),
                    Err(RecvError::Lagged(missed)) => {
                        // Dropped notifications are recovered by the resync
                        // tick and the next status write of each object.
                        warn!(missed, "reconciler lagged behind store notifications");
                    }
                    Err(RecvError::Closed) => {
                        info!("store watch channel closed; reconciler stopping");
                        return;
                    }
                },
                _ = resync.tick() => self.clone().resync(),
            }
        }
    }

    /// Re-dispatch every non-terminal query and evaluation.
    fn resync(self: Arc<Self>) {
        for query in self.store.queries().list_all() {
            if query.status.phase.is_terminal() {
                continue;
            }
            self.clone().dispatch(ChangeNotice {
                kind: ResourceKind::Query,
                namespace: query.metadata.namespace.clone(),
                name: query.metadata.name.clone(),
                op: ChangeOp::Applied,
            });
        }
        for evaluation in self.store.evaluations().list_all() {
            if evaluation.status.phase.is_terminal() {
                continue;
            }
            self.clone().dispatch(ChangeNotice {
                kind: ResourceKind::Evaluation,
                namespace: evaluation.metadata.namespace.clone(),
                name: evaluation.metadata.name.clone(),
                op: ChangeOp::Applied,
            });
        }
    }

    /// Handle one change notification, spawning the actual work.
    pub fn dispatch(self: Arc<Self>, notice: ChangeNotice) {
        if notice.op == ChangeOp::Deleted {
            return;
        }
        let key = (notice.kind, notice.namespace.clone(), notice.name.clone());
        if !self.in_flight.insert(key.clone()) {
            debug!(kind = %notice.kind, name = %notice.name, "reconciliation already in flight");
            return;
        }
        tokio::spawn(async move {
            self.step(&notice).await;
            self.in_flight.remove(&key);
        });
    }

    /// One reconciliation step for one object.
    pub async fn step(&self, notice: &ChangeNotice) {
        let namespace = &notice.namespace;
        let name = &notice.name;
        match notice.kind {
            ResourceKind::Query => {
                if let Err(err) = self.queries.reconcile(namespace, name).await {
                    error!(query = %name, error = %format!("{err:#}"), "query reconciliation failed");
                    self.settle_query_failure(namespace, name);
                }
            }
            ResourceKind::Evaluation => {
                let Some(evaluation) = self.store.evaluations().get(namespace, name) else {
                    return;
                };
                // Batch children are driven by their parent, but their
                // transitions still advance a waiting parent query.
                if !EvaluationOrchestrator::is_batch_child(&evaluation) {
                    if let Err(err) = self.evaluations.reconcile(namespace, name).await {
                        error!(
                            evaluation = %name,
                            error = %format!("{err:#}"),
                            "evaluation reconciliation failed"
                        );
                        self.settle_evaluation_failure(namespace, name);
                    }
                }
                if let Some(query) = evaluation.metadata.labels.get(QUERY_LABEL) {
                    if let Err(err) = self.queries.reconcile(namespace, query).await {
                        error!(query = %query, error = %format!("{err:#}"), "query reconciliation failed");
                        self.settle_query_failure(namespace, query);
                    }
                }
            }
            ResourceKind::Agent => self.reconcile_agent(namespace, name),
            // Models, tools, teams, and evaluators are passive records.
            _ => {}
        }
    }

    /// Compute agent readiness from its referenced model and tools.
    fn reconcile_agent(&self, namespace: &str, name: &str) {
        let Some(mut agent) = self.store.agents().get(namespace, name) else {
            return;
        };
        let (phase, message) = agent_readiness(&self.store, namespace, &agent);
        // Unchanged status is not rewritten; a rewrite would re-notify and
        // loop forever.
        if agent.status.phase == phase && agent.status.message == message {
            return;
        }
        agent.status.phase = phase;
        agent.status.message = message;
        if let Err(err) = self.store.agents().update(agent) {
            if !matches!(err, StoreError::Conflict { .. }) {
                warn!(agent = %name, error = %err, "failed to persist agent readiness");
            }
        }
    }

    fn settle_query_failure(&self, namespace: &str, name: &str) {
        loop {
            let Some(mut query) = self.store.queries().get(namespace, name) else {
                return;
            };
            if query.status.phase.is_terminal() {
                return;
            }
            if query.status.transition(QueryPhase::Error).is_err() {
                return;
            }
            query.status.message = Some(INTERNAL_ERROR_MESSAGE.to_string());
            query.status.completed_at = Some(Utc::now());
            match self.store.queries().update(query) {
                Ok(_) | Err(StoreError::NotFound { .. }) => return,
                Err(StoreError::Conflict { .. }) => continue,
                Err(err) => {
                    warn!(query = %name, error = %err, "failed to settle query failure");
                    return;
                }
            }
        }
    }

    fn settle_evaluation_failure(&self, namespace: &str, name: &str) {
        loop {
            let Some(mut evaluation) = self.store.evaluations().get(namespace, name) else {
                return;
            };
            if evaluation.status.phase.is_terminal() {
                return;
            }
            evaluation.status.phase = EvaluationPhase::Error;
            evaluation.status.message = Some(INTERNAL_ERROR_MESSAGE.to_string());
            evaluation.status.completed_at = Some(Utc::now());
            match self.store.evaluations().update(evaluation) {
                Ok(_) | Err(StoreError::NotFound { .. }) => return,
                Err(StoreError::Conflict { .. }) => continue,
                Err(err) => {
                    warn!(evaluation = %name, error = %err, "failed to settle evaluation failure");
                    return;
                }
            }
        }
    }
}

/// Readiness of an agent's referenced model and tools.
fn agent_readiness(
    store: &ResourceStore,
    namespace: &str,
    agent: &crate::domain::agent::Agent,
) -> (AgentPhase, Option<String>) {
    if let Err(err) = agent.spec.validate() {
        return (AgentPhase::Error, Some(err.to_string()));
    }
    if let Some(model) = agent
        .spec
        .model_ref
        .as_deref()
        .filter(|m| store.models().get(namespace, m).is_none())
    {
        return (AgentPhase::Pending, Some(format!("model '{}' not found", model)));
    }
    if let Some(tool) = agent
        .spec
        .tools
        .iter()
        .find(|t| store.tools().get(namespace, t).is_none())
    {
        return (AgentPhase::Pending, Some(format!("tool '{}' not found", tool)));
    }
    (AgentPhase::Ready, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::{Agent, AgentSpec};
    use crate::domain::model::{Model, ModelSpec};
    use crate::domain::resource::ObjectMeta;

    fn agent(name: &str, model_ref: &str, tools: Vec<String>) -> Agent {
        Agent::new(
            ObjectMeta::new(name, "default"),
            AgentSpec { model_ref: Some(model_ref.into()), tools, ..Default::default() },
        )
        .unwrap()
    }

    #[test]
    fn agent_becomes_ready_when_references_resolve() {
        let store = ResourceStore::new();
        store
            .models()
            .create(Model {
                metadata: ObjectMeta::new("gpt", "default"),
                spec: ModelSpec::default(),
            })
            .unwrap();
        let poet = agent("poet", "gpt", Vec::new());
        let (phase, message) = agent_readiness(&store, "default", &poet);
        assert_eq!(phase, AgentPhase::Ready);
        assert!(message.is_none());
    }

    #[test]
    fn agent_with_missing_model_stays_pending() {
        let store = ResourceStore::new();
        let poet = agent("poet", "ghost", Vec::new());
        let (phase, message) = agent_readiness(&store, "default", &poet);
        assert_eq!(phase, AgentPhase::Pending);
        assert_eq!(message.as_deref(), Some("model 'ghost' not found"));
    }

    #[test]
    fn agent_with_missing_tool_stays_pending() {
        let store = ResourceStore::new();
        store
            .models()
            .create(Model {
                metadata: ObjectMeta::new("gpt", "default"),
                spec: ModelSpec::default(),
            })
            .unwrap();
        let poet = agent("poet", "gpt", vec!["search".to_string()]);
        let (phase, message) = agent_readiness(&store, "default", &poet);
        assert_eq!(phase, AgentPhase::Pending);
        assert_eq!(message.as_deref(), Some("tool 'search' not found"));
    }
}
