// Copyright (c) 2026 Helmsman Authors
// SPDX-License-Identifier: AGPL-3.0
//! Evaluation orchestrator
//!
//! Executes one evaluation: `Execute(evaluation) -> {score, passed,
//! metadata}` dispatched by type. Direct/query/baseline evaluations call the
//! external evaluator service; event evaluations score rule expressions
//! against recorded session events locally; batch evaluations fan out into
//! child evaluations under a counting semaphore.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Scoring dispatch, batch fan-out, progress accounting
//!
//! Batch children are ordinary evaluation records labeled with their parent;
//! the parent drives them itself, so the reconciler must not dispatch
//! labeled children independently.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::application::query_orchestrator::QUERY_LABEL;
use crate::domain::evaluation::{
    format_score, BatchConfig, BatchProgress, ChildEvaluationStatus, DirectConfig, Evaluation,
    EvaluationConfig, EvaluationPhase, EvaluationSpec, EvaluationType, EventConfig, QueryConfig,
};
use crate::domain::events::OrchestrationEvent;
use crate::domain::query::{Response, TokenUsage};
use crate::domain::resource::ObjectMeta;
use crate::domain::value::Parameter;
use crate::infrastructure::evaluator_client::{
    EvaluationRequest, EvaluatorClient, EvaluatorVerdict,
};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::session_events::{SessionEvent, SessionEventSource};
use crate::infrastructure::store::{ResourceStore, StoreError};
use crate::infrastructure::value_resolver::ValueResolver;

/// Label linking a batch child back to its parent evaluation.
pub const PARENT_LABEL: &str = "helmsman.ai/parent-evaluation";

pub struct EvaluationOrchestrator {
    store: Arc<ResourceStore>,
    event_bus: Arc<EventBus>,
    evaluator_client: Arc<dyn EvaluatorClient>,
    value_resolver: Arc<dyn ValueResolver>,
    session_events: Arc<dyn SessionEventSource>,
}

impl EvaluationOrchestrator {
    pub fn new(
        store: Arc<ResourceStore>,
        event_bus: Arc<EventBus>,
        evaluator_client: Arc<dyn EvaluatorClient>,
        value_resolver: Arc<dyn ValueResolver>,
        session_events: Arc<dyn SessionEventSource>,
    ) -> Self {
        Self { store, event_bus, evaluator_client, value_resolver, session_events }
    }

    /// Whether this evaluation is a batch child driven by its parent.
    pub fn is_batch_child(evaluation: &Evaluation) -> bool {
        evaluation.metadata.labels.contains_key(PARENT_LABEL)
    }

    /// Advance an evaluation by one reconciliation step.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<()> {
        let Some(evaluation) = self.store.evaluations().get(namespace, name) else {
            debug!("evaluation no longer exists; nothing to reconcile");
            return Ok(());
        };
        if evaluation.status.phase.is_terminal() {
            return Ok(());
        }
        if self.timed_out(&evaluation) {
            let timeout = evaluation.spec.timeout.unwrap_or_default();
            return self.settle_error(
                evaluation,
                format!("evaluation timed out after {}", humantime::format_duration(timeout)),
            );
        }
        match evaluation.status.phase {
            EvaluationPhase::Pending => self.start(evaluation),
            EvaluationPhase::Running => match evaluation.spec.eval_type {
                EvaluationType::Batch => self.run_batch(evaluation).await,
                _ => self.run_single(evaluation).await,
            },
            _ => Ok(()),
        }
    }

    /// Config validation gate: an invalid spec never reaches `running`.
    fn start(&self, mut evaluation: Evaluation) -> Result<()> {
        if let Err(err) = evaluation.spec.config.validate(evaluation.spec.eval_type) {
            return self.settle_error(evaluation, err.to_string());
        }
        evaluation.status.started_at = Some(Utc::now());
        self.set_phase(&mut evaluation, EvaluationPhase::Running);
        self.persist(evaluation)
    }

    async fn run_single(&self, mut evaluation: Evaluation) -> Result<()> {
        match self.perform_within_deadline(&evaluation).await {
            Ok(verdict) => {
                apply_verdict(&mut evaluation, &verdict);
                self.settle(evaluation, EvaluationPhase::Done, None)
            }
            Err(err) => self.settle_error(evaluation, format!("{err:#}")),
        }
    }

    // ------------------------------------------------------------------
    // Single-evaluation scoring
    // ------------------------------------------------------------------

    /// Produce a verdict for a non-batch evaluation.
    async fn perform(&self, evaluation: &Evaluation) -> Result<EvaluatorVerdict> {
        let namespace = &evaluation.metadata.namespace;
        match evaluation.spec.eval_type {
            EvaluationType::Event => {
                let config = evaluation
                    .spec
                    .config
                    .event
                    .as_ref()
                    .ok_or_else(|| anyhow!("event evaluation has no event config"))?;
                let session_id = self.session_for(evaluation)?;
                let events = self.session_events.list_events(namespace, &session_id).await;
                Ok(score_event_rules(config, &events))
            }
            EvaluationType::Batch => Err(anyhow!("batch evaluations are driven by the fan-out engine")),
            _ => self.call_evaluator(evaluation).await,
        }
    }

    /// `perform`, bounded by the evaluation's remaining deadline so a hung
    /// evaluator call cannot outlive the configured timeout.
    async fn perform_within_deadline(&self, evaluation: &Evaluation) -> Result<EvaluatorVerdict> {
        let Some(budget) = remaining_budget(evaluation) else {
            return self.perform(evaluation).await;
        };
        match tokio::time::timeout(budget, self.perform(evaluation)).await {
            Ok(verdict) => verdict,
            Err(_) => Err(anyhow!(
                "evaluation timed out after {}",
                humantime::format_duration(evaluation.spec.timeout.unwrap_or_default())
            )),
        }
    }

    async fn call_evaluator(&self, evaluation: &Evaluation) -> Result<EvaluatorVerdict> {
        let namespace = &evaluation.metadata.namespace;
        let evaluator_name = &evaluation.spec.evaluator.name;
        let evaluator = self
            .store
            .evaluators()
            .get(namespace, evaluator_name)
            .ok_or_else(|| anyhow!("evaluator '{}' not found", evaluator_name))?;
        let address = self
            .value_resolver
            .resolve(&evaluator.spec.address, namespace)
            .await
            .with_context(|| format!("failed to resolve address of evaluator '{}'", evaluator_name))?;

        // Call-time parameters override the evaluator's declared defaults.
        let mut parameters = self
            .resolve_parameters(&evaluator.spec.parameters, namespace)
            .await?;
        parameters.extend(
            self.resolve_parameters(&evaluation.spec.evaluator.parameters, namespace)
                .await?,
        );

        let mut request = EvaluationRequest {
            evaluator: evaluator_name.clone(),
            address,
            eval_type: evaluation.spec.eval_type,
            input: None,
            output: None,
            query_name: None,
            responses: Vec::new(),
            parameters,
        };
        match evaluation.spec.eval_type {
            EvaluationType::Direct => {
                let direct = evaluation
                    .spec
                    .config
                    .direct
                    .as_ref()
                    .ok_or_else(|| anyhow!("direct evaluation has no direct config"))?;
                request.input = Some(direct.input.clone());
                request.output = Some(direct.output.clone());
            }
            EvaluationType::Query => {
                let config = evaluation
                    .spec
                    .config
                    .query
                    .as_ref()
                    .ok_or_else(|| anyhow!("query evaluation has no query config"))?;
                let query = self
                    .store
                    .queries()
                    .get(namespace, &config.query_ref)
                    .ok_or_else(|| anyhow!("referenced query '{}' not found", config.query_ref))?;
                request.input = Some(query.spec.input.clone());
                request.query_name = Some(query.metadata.name.clone());
                request.responses = filter_responses(&query.status.responses, config);
                if request.responses.is_empty() && !query.status.responses.is_empty() {
                    return Err(anyhow!(
                        "response target '{}' matched no responses of query '{}'",
                        config.response_target.as_deref().unwrap_or_default(),
                        config.query_ref
                    ));
                }
            }
            // Baseline carries no extra request fields.
            EvaluationType::Baseline => {}
            EvaluationType::Event | EvaluationType::Batch => unreachable!("dispatched above"),
        }

        let verdict = self
            .evaluator_client
            .evaluate(request)
            .await
            .with_context(|| format!("evaluator '{}' call failed", evaluator_name))?;
        Ok(verdict)
    }

    /// Session id for event evaluations: the labeled query's session when
    /// present, else an explicit session label on the evaluation itself.
    fn session_for(&self, evaluation: &Evaluation) -> Result<String> {
        if let Some(query_name) = evaluation.metadata.labels.get(QUERY_LABEL) {
            let query = self
                .store
                .queries()
                .get(&evaluation.metadata.namespace, query_name)
                .ok_or_else(|| anyhow!("labeled query '{}' not found", query_name))?;
            if let Some(session_id) = query.spec.session_id {
                return Ok(session_id);
            }
        }
        evaluation
            .metadata
            .labels
            .get("helmsman.ai/session")
            .cloned()
            .ok_or_else(|| anyhow!("event evaluation has no session to score"))
    }

    async fn resolve_parameters(
        &self,
        parameters: &[Parameter],
        namespace: &str,
    ) -> Result<HashMap<String, String>> {
        let mut resolved = HashMap::new();
        for parameter in parameters {
            let value = self
                .value_resolver
                .resolve(&parameter.value, namespace)
                .await
                .with_context(|| format!("failed to resolve parameter '{}'", parameter.name))?;
            resolved.insert(parameter.name.clone(), value);
        }
        Ok(resolved)
    }

    // ------------------------------------------------------------------
    // Batch fan-out
    // ------------------------------------------------------------------

    async fn run_batch(&self, parent: Evaluation) -> Result<()> {
        let config = parent
            .spec
            .config
            .batch
            .clone()
            .ok_or_else(|| anyhow!("batch evaluation has no batch config"))?;
        let children = self.build_children(&parent, &config)?;
        for child in &children {
            // Idempotent on re-reconciliation: existing children are kept.
            if self
                .store
                .evaluations()
                .get(&child.metadata.namespace, &child.metadata.name)
                .is_none()
            {
                self.store
                    .evaluations()
                    .create(child.clone())
                    .context("failed to create batch child")?;
            }
        }

        let namespace = parent.metadata.namespace.clone();
        let parent_name = parent.metadata.name.clone();
        {
            let mut parent = parent;
            parent.status.batch_progress = Some(BatchProgress {
                total: children.len(),
                ..Default::default()
            });
            self.persist(parent)?;
        }

        let semaphore = Arc::new(Semaphore::new(config.concurrency));
        let halted = AtomicBool::new(false);
        let runs = children.iter().map(|child| {
            self.drive_child(
                &namespace,
                &parent_name,
                child.metadata.name.clone(),
                semaphore.clone(),
                &halted,
                config.continue_on_failure,
            )
        });
        futures::future::join_all(runs).await;

        self.finalize_batch(&namespace, &parent_name, &config)
    }

    /// Materialize the child set from exactly one source.
    fn build_children(&self, parent: &Evaluation, config: &BatchConfig) -> Result<Vec<Evaluation>> {
        let namespace = &parent.metadata.namespace;
        let parent_name = &parent.metadata.name;
        let child_meta = |name: String| {
            ObjectMeta::new(name, namespace.clone()).with_label(PARENT_LABEL, parent_name.clone())
        };
        let mut children = Vec::new();

        if !config.items.is_empty() {
            for (index, item) in config.items.iter().enumerate() {
                let name = item
                    .name
                    .clone()
                    .map(|n| format!("{}-{}", parent_name, n))
                    .unwrap_or_else(|| format!("{}-item-{}", parent_name, index + 1));
                children.push(Evaluation::new(
                    child_meta(name),
                    EvaluationSpec {
                        eval_type: EvaluationType::Direct,
                        config: EvaluationConfig {
                            direct: Some(DirectConfig {
                                input: item.input.clone(),
                                output: item.output.clone(),
                            }),
                            ..Default::default()
                        },
                        evaluator: parent.spec.evaluator.clone(),
                        ttl: parent.spec.ttl,
                        timeout: parent.spec.timeout,
                    },
                ));
            }
        } else if let (Some(template), Some(selector)) = (&config.template, &config.query_selector) {
            let matched = self.store.queries().list_matching(namespace, selector);
            if matched.is_empty() {
                return Err(anyhow!("batch query selector matched no queries"));
            }
            for query in matched {
                children.push(Evaluation::new(
                    child_meta(format!("{}-{}", parent_name, query.metadata.name)),
                    EvaluationSpec {
                        eval_type: EvaluationType::Query,
                        config: EvaluationConfig {
                            query: Some(QueryConfig {
                                query_ref: query.metadata.name.clone(),
                                response_target: None,
                            }),
                            ..Default::default()
                        },
                        evaluator: template.evaluator.clone().unwrap_or_else(|| parent.spec.evaluator.clone()),
                        ttl: parent.spec.ttl,
                        timeout: template.timeout.or(parent.spec.timeout),
                    },
                ));
            }
        } else {
            for legacy in &config.evaluations {
                children.push(Evaluation::new(
                    child_meta(format!("{}-{}", parent_name, legacy.name)),
                    EvaluationSpec {
                        eval_type: legacy.eval_type,
                        config: legacy.config.clone(),
                        evaluator: parent.spec.evaluator.clone(),
                        ttl: parent.spec.ttl,
                        timeout: parent.spec.timeout,
                    },
                ));
            }
        }
        if children.is_empty() {
            return Err(anyhow!("batch evaluation produced no children"));
        }
        Ok(children)
    }

    /// Run one child under the concurrency bound, updating parent progress
    /// on every transition.
    async fn drive_child(
        &self,
        namespace: &str,
        parent_name: &str,
        child_name: String,
        semaphore: Arc<Semaphore>,
        halted: &AtomicBool,
        continue_on_failure: bool,
    ) {
        let Ok(_permit) = semaphore.acquire().await else {
            return;
        };
        let Some(mut child) = self.store.evaluations().get(namespace, &child_name) else {
            return;
        };
        if child.status.phase.is_terminal() {
            return;
        }

        if halted.load(Ordering::SeqCst) && !continue_on_failure {
            // Halted batch: never-started children settle canceled.
            child.status.message = Some("batch halted before this child was scheduled".into());
            self.transition_child(namespace, parent_name, child, EvaluationPhase::Canceled, |p, c| {
                p.failed += 1;
                upsert_child(p, c);
            });
            return;
        }

        child.status.started_at = Some(Utc::now());
        let child = match self.transition_child(
            namespace,
            parent_name,
            child,
            EvaluationPhase::Running,
            |p, c| {
                p.running += 1;
                upsert_child(p, c);
            },
        ) {
            Some(child) => child,
            None => return,
        };

        match self.perform_within_deadline(&child).await {
            Ok(verdict) => {
                let mut child = child;
                apply_verdict(&mut child, &verdict);
                self.transition_child(namespace, parent_name, child, EvaluationPhase::Done, |p, c| {
                    p.running = p.running.saturating_sub(1);
                    p.completed += 1;
                    upsert_child(p, c);
                });
            }
            Err(err) => {
                let mut child = child;
                child.status.message = Some(format!("{err:#}"));
                self.transition_child(namespace, parent_name, child, EvaluationPhase::Error, |p, c| {
                    p.running = p.running.saturating_sub(1);
                    p.failed += 1;
                    upsert_child(p, c);
                });
                if !continue_on_failure {
                    halted.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    /// Persist a child phase change, mirror it into the parent's progress,
    /// and emit the child-transition event. Returns the updated child.
    fn transition_child(
        &self,
        namespace: &str,
        parent_name: &str,
        mut child: Evaluation,
        phase: EvaluationPhase,
        apply: impl Fn(&mut BatchProgress, &ChildEvaluationStatus),
    ) -> Option<Evaluation> {
        self.set_phase(&mut child, phase);
        if phase.is_terminal() {
            stamp_completion(&mut child);
        }
        let child = match self.store.evaluations().update(child) {
            Ok(child) => child,
            Err(err) => {
                warn!(error = %err, "failed to persist batch child status");
                return None;
            }
        };
        let summary = ChildEvaluationStatus {
            name: child.metadata.name.clone(),
            phase,
            score: child.status.score.clone(),
            passed: child.status.passed,
            message: child.status.message.clone(),
        };
        self.update_progress(namespace, parent_name, |progress| apply(progress, &summary));
        self.event_bus.publish(OrchestrationEvent::BatchChildTransitioned {
            namespace: namespace.to_string(),
            parent: parent_name.to_string(),
            child: child.metadata.name.clone(),
            phase,
            at: Utc::now(),
        });
        Some(child)
    }

    /// Check-and-set loop over the parent's progress counters.
    fn update_progress(&self, namespace: &str, parent_name: &str, apply: impl Fn(&mut BatchProgress)) {
        loop {
            let Some(mut parent) = self.store.evaluations().get(namespace, parent_name) else {
                return;
            };
            if parent.status.phase.is_terminal() {
                return;
            }
            let progress = parent.status.batch_progress.get_or_insert_with(Default::default);
            apply(progress);
            match self.store.evaluations().update(parent) {
                Ok(_) => return,
                Err(StoreError::Conflict { .. }) => continue,
                Err(err) => {
                    warn!(parent = parent_name, error = %err, "failed to persist batch progress");
                    return;
                }
            }
        }
    }

    /// Parent terminal rule: `done` iff every child settled without error,
    /// or all children are terminal under `continue_on_failure`; `error`
    /// otherwise. Parent score is the mean of scored children.
    fn finalize_batch(&self, namespace: &str, parent_name: &str, config: &BatchConfig) -> Result<()> {
        let Some(mut parent) = self.store.evaluations().get(namespace, parent_name) else {
            return Ok(());
        };
        if parent.status.phase.is_terminal() {
            return Ok(());
        }
        let children: Vec<Evaluation> = self
            .store
            .evaluations()
            .list(namespace)
            .into_iter()
            .filter(|e| e.metadata.labels.get(PARENT_LABEL) == Some(&parent_name.to_string()))
            .collect();

        let failed = children
            .iter()
            .filter(|c| matches!(c.status.phase, EvaluationPhase::Error | EvaluationPhase::Canceled))
            .count();
        // Rebuild counters from the children so the terminal accounting is
        // exact even across re-reconciliation.
        parent.status.batch_progress = Some(BatchProgress {
            total: children.len(),
            completed: children.len() - failed,
            failed,
            running: 0,
            child_evaluations: children
                .iter()
                .map(|c| ChildEvaluationStatus {
                    name: c.metadata.name.clone(),
                    phase: c.status.phase,
                    score: c.status.score.clone(),
                    passed: c.status.passed,
                    message: c.status.message.clone(),
                })
                .collect(),
        });
        let mut scores = Vec::new();
        let mut usage = TokenUsage::default();
        for child in &children {
            if let Some(score) = child.status.score.as_deref().and_then(|s| s.parse::<f64>().ok()) {
                scores.push(score);
            }
            usage.add(child.status.token_usage);
        }
        if !scores.is_empty() {
            let mean = scores.iter().sum::<f64>() / scores.len() as f64;
            parent.status.score = Some(format_score(mean));
        }
        parent.status.passed = Some(failed == 0 && children.iter().all(|c| c.status.passed != Some(false)));
        parent.status.token_usage = usage;

        if failed > 0 && !config.continue_on_failure {
            return self.settle_error(
                parent,
                format!("{} of {} children failed", failed, children.len()),
            );
        }
        let message = (failed > 0)
            .then(|| format!("completed with {} of {} children failed", failed, children.len()));
        self.settle(parent, EvaluationPhase::Done, message)
    }

    // ------------------------------------------------------------------
    // Status plumbing
    // ------------------------------------------------------------------

    fn timed_out(&self, evaluation: &Evaluation) -> bool {
        let (Some(timeout), Some(started_at)) =
            (evaluation.spec.timeout, evaluation.status.started_at)
        else {
            return false;
        };
        let Ok(timeout) = chrono::Duration::from_std(timeout) else {
            return false;
        };
        Utc::now() >= started_at + timeout
    }

    fn set_phase(&self, evaluation: &mut Evaluation, phase: EvaluationPhase) {
        let from = evaluation.status.phase;
        evaluation.status.phase = phase;
        self.event_bus.publish(OrchestrationEvent::EvaluationPhaseChanged {
            namespace: evaluation.metadata.namespace.clone(),
            evaluation: evaluation.metadata.name.clone(),
            from,
            to: phase,
            at: Utc::now(),
        });
    }

    fn settle(
        &self,
        mut evaluation: Evaluation,
        phase: EvaluationPhase,
        message: Option<String>,
    ) -> Result<()> {
        self.set_phase(&mut evaluation, phase);
        if message.is_some() {
            evaluation.status.message = message;
        }
        stamp_completion(&mut evaluation);
        self.persist(evaluation)
    }

    fn settle_error(&self, mut evaluation: Evaluation, message: String) -> Result<()> {
        evaluation.status.message = Some(message);
        self.settle(evaluation, EvaluationPhase::Error, None)
    }

    fn persist(&self, evaluation: Evaluation) -> Result<()> {
        match self.store.evaluations().update(evaluation) {
            Ok(updated) => {
                info!(
                    evaluation = %updated.metadata.name,
                    phase = %updated.status.phase,
                    "persisted evaluation status"
                );
                Ok(())
            }
            Err(StoreError::Conflict { name, .. }) => {
                warn!(evaluation = %name, "evaluation status write conflicted; yielding");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Expire terminal evaluations past their TTL; batch parents cascade to
    /// their children.
    pub fn sweep_expired(&self, namespace: &str) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        for evaluation in self.store.evaluations().list(namespace) {
            if !evaluation.is_expired(now) {
                continue;
            }
            let name = evaluation.metadata.name;
            for child in self.store.evaluations().list(namespace) {
                if child.metadata.labels.get(PARENT_LABEL) == Some(&name) {
                    self.store.evaluations().delete(namespace, &child.metadata.name);
                }
            }
            if self.store.evaluations().delete(namespace, &name) {
                info!(evaluation = %name, "expired evaluation collected");
                removed += 1;
            }
        }
        removed
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Time left before the evaluation's deadline; `None` when no timeout is
/// set. An already-passed deadline yields a zero budget.
fn remaining_budget(evaluation: &Evaluation) -> Option<std::time::Duration> {
    let (Some(timeout), Some(started_at)) =
        (evaluation.spec.timeout, evaluation.status.started_at)
    else {
        return None;
    };
    let timeout = chrono::Duration::from_std(timeout).ok()?;
    Some(
        ((started_at + timeout) - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO),
    )
}

fn apply_verdict(evaluation: &mut Evaluation, verdict: &EvaluatorVerdict) {
    evaluation.status.score = Some(format_score(verdict.score));
    evaluation.status.passed = Some(verdict.passed);
    evaluation.status.metadata = verdict.metadata.clone();
    evaluation.status.token_usage.add(verdict.token_usage);
}

fn stamp_completion(evaluation: &mut Evaluation) {
    let now = Utc::now();
    evaluation.status.completed_at = Some(now);
    if let Some(started_at) = evaluation.status.started_at {
        evaluation.status.duration = (now - started_at).to_std().ok();
    }
}

fn upsert_child(progress: &mut BatchProgress, summary: &ChildEvaluationStatus) {
    match progress.child_evaluations.iter_mut().find(|c| c.name == summary.name) {
        Some(existing) => *existing = summary.clone(),
        None => progress.child_evaluations.push(summary.clone()),
    }
}

/// Keep the responses a query evaluation should score: all of them, or the
/// one matching `response_target` as `name` or `kind/name`.
fn filter_responses(responses: &[Response], config: &QueryConfig) -> Vec<Response> {
    match config.response_target.as_deref() {
        None | Some("") => responses.to_vec(),
        Some(target) => responses
            .iter()
            .filter(|r| {
                r.target.name == target || format!("{}/{}", r.target.kind, r.target.name) == target
            })
            .cloned()
            .collect(),
    }
}

// ============================================================================
// Event-rule scoring
// ============================================================================

/// Score rule expressions against recorded events: a rule passes when any
/// event satisfies its expression; the score is passed weight over total
/// weight.
fn score_event_rules(config: &EventConfig, events: &[SessionEvent]) -> EvaluatorVerdict {
    let mut passed_rules = 0u32;
    let mut failed_rules = 0u32;
    let mut weighted_score = 0u32;
    let mut total_weight = 0u32;

    for rule in &config.rules {
        total_weight += rule.weight;
        if events.iter().any(|event| expression_matches(&rule.expression, event)) {
            passed_rules += 1;
            weighted_score += rule.weight;
        } else {
            failed_rules += 1;
        }
    }

    let score = if total_weight == 0 {
        0.0
    } else {
        f64::from(weighted_score) / f64::from(total_weight)
    };
    let passed = match config.min_score_threshold {
        Some(threshold) => score >= threshold,
        None => failed_rules == 0,
    };

    let mut metadata = HashMap::new();
    metadata.insert("passed_rules".to_string(), passed_rules.to_string());
    metadata.insert("failed_rules".to_string(), failed_rules.to_string());
    metadata.insert("weighted_score".to_string(), weighted_score.to_string());
    metadata.insert("total_weight".to_string(), total_weight.to_string());

    EvaluatorVerdict { score, passed, metadata, token_usage: TokenUsage::default() }
}

/// Evaluate one rule expression against one event.
///
/// Supported forms: `exists(field)`, `field == "value"`, `field != "value"`,
/// `field contains "value"`. The field `name` addresses the event name;
/// anything else addresses an attribute. Malformed expressions match nothing.
fn expression_matches(expression: &str, event: &SessionEvent) -> bool {
    let expression = expression.trim();

    if let Some(inner) = expression
        .strip_prefix("exists(")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        let field = inner.trim();
        return field == "name" || event.attributes.contains_key(field);
    }

    for op in ["==", "!=", "contains"] {
        let Some((field, value)) = split_operator(expression, op) else {
            continue;
        };
        let Some(actual) = field_value(event, &field) else {
            return false;
        };
        return match op {
            "==" => actual == value,
            "!=" => actual != value,
            _ => actual.contains(&value),
        };
    }
    false
}

fn split_operator(expression: &str, op: &str) -> Option<(String, String)> {
    let (field, rest) = expression.split_once(op)?;
    let value = rest.trim().strip_prefix('"')?.strip_suffix('"')?;
    Some((field.trim().to_string(), value.to_string()))
}

fn field_value(event: &SessionEvent, field: &str) -> Option<String> {
    if field == "name" {
        return Some(event.name.clone());
    }
    event.attributes.get(field).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::evaluation::EventRule;

    fn event(name: &str, attrs: &[(&str, &str)]) -> SessionEvent {
        let mut event = SessionEvent::new(name);
        for (k, v) in attrs {
            event = event.with_attribute(*k, *v);
        }
        event
    }

    fn rule(expression: &str, weight: u32) -> EventRule {
        EventRule { name: expression.to_string(), expression: expression.to_string(), weight }
    }

    #[test]
    fn equality_expression_matches_event_name_and_attributes() {
        let e = event("tool_call", &[("tool", "search")]);
        assert!(expression_matches(r#"name == "tool_call""#, &e));
        assert!(expression_matches(r#"tool == "search""#, &e));
        assert!(!expression_matches(r#"tool == "calculator""#, &e));
    }

    #[test]
    fn inequality_and_contains_expressions() {
        let e = event("message", &[("content", "the final answer is 42")]);
        assert!(expression_matches(r#"name != "tool_call""#, &e));
        assert!(expression_matches(r#"content contains "answer""#, &e));
        assert!(!expression_matches(r#"content contains "question""#, &e));
    }

    #[test]
    fn exists_expression_checks_attribute_presence() {
        let e = event("tool_call", &[("tool", "search")]);
        assert!(expression_matches("exists(tool)", &e));
        assert!(!expression_matches("exists(result)", &e));
    }

    #[test]
    fn malformed_expressions_match_nothing() {
        let e = event("tool_call", &[]);
        assert!(!expression_matches("tool ==", &e));
        assert!(!expression_matches("gibberish", &e));
        assert!(!expression_matches(r#"tool == unquoted"#, &e));
    }

    #[test]
    fn weighted_scoring_against_threshold() {
        let config = EventConfig {
            rules: vec![rule(r#"name == "tool_call""#, 3), rule(r#"name == "handoff""#, 1)],
            min_score_threshold: Some(0.7),
        };
        let events = vec![event("tool_call", &[])];
        let verdict = score_event_rules(&config, &events);
        assert!((verdict.score - 0.75).abs() < f64::EPSILON);
        assert!(verdict.passed);
        assert_eq!(verdict.metadata["passed_rules"], "1");
        assert_eq!(verdict.metadata["failed_rules"], "1");
    }

    #[test]
    fn without_threshold_every_rule_must_pass() {
        let config = EventConfig {
            rules: vec![rule(r#"name == "tool_call""#, 1), rule(r#"name == "handoff""#, 1)],
            min_score_threshold: None,
        };
        let verdict = score_event_rules(&config, &[event("tool_call", &[])]);
        assert!(!verdict.passed);
        assert!((verdict.score - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn response_target_filter_accepts_kind_qualified_names() {
        use crate::domain::resource::{ResourceKind, TargetRef};
        let responses = vec![
            Response { target: TargetRef::new(ResourceKind::Agent, "poet"), content: "a".into() },
            Response { target: TargetRef::new(ResourceKind::Team, "crew"), content: "b".into() },
        ];
        let by_name = filter_responses(
            &responses,
            &QueryConfig { query_ref: "q".into(), response_target: Some("poet".into()) },
        );
        assert_eq!(by_name.len(), 1);
        let by_kind = filter_responses(
            &responses,
            &QueryConfig { query_ref: "q".into(), response_target: Some("team/crew".into()) },
        );
        assert_eq!(by_kind.len(), 1);
        assert_eq!(by_kind[0].content, "b");
    }
}
