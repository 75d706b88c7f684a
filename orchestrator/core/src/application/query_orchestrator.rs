// Copyright (c) 2026 Helmsman Authors
// SPDX-License-Identifier: AGPL-3.0
//! Query orchestrator
//!
//! Top-level reconciliation state machine for queries:
//! `pending -> running -> (evaluating)? -> done | error | canceled`.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Resolve targets, execute them (delegating team targets to
//!   the strategy engine), aggregate responses and token usage, wire up
//!   evaluations, persist status
//!
//! Reconciliation is at-least-once and idempotent per observed state: each
//! invocation advances the query by one phase and persists via the store's
//! check-and-set. A conflicting concurrent write loses cleanly; the winner's
//! change notification re-drives reconciliation.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::application::auto_trigger::EvaluatorAutoTrigger;
use crate::application::target_resolver::TargetResolver;
use crate::application::team_engine::{
    CancelSignal, MemberExecutor, MemberOutcome, TeamEngine, TeamMessage, TeamStop,
};
use crate::domain::agent::Agent;
use crate::domain::evaluation::{
    Evaluation, EvaluationConfig, EvaluationSpec, EvaluationType, EvaluatorRef, QueryConfig,
};
use crate::domain::events::OrchestrationEvent;
use crate::domain::query::{Query, QueryPhase, Response, TokenUsage};
use crate::domain::resource::{ObjectMeta, ResourceKind, TargetRef};
use crate::domain::team::{Team, TeamMember};
use crate::domain::value::Parameter;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::model_client::{ChatMessage, ChatRequest, ModelClient};
use crate::infrastructure::store::{ResourceStore, StoreError};
use crate::infrastructure::template::TemplateEngine;
use crate::infrastructure::tool_runner::ToolRunner;
use crate::infrastructure::value_resolver::ValueResolver;

/// Label linking a spawned evaluation back to its query.
pub const QUERY_LABEL: &str = "helmsman.ai/query";

/// Trailing token a member emits to signal explicit team termination.
const TERMINATE_TOKEN: &str = "TERMINATE";

/// Model name used for selector calls when no member declares one.
const DEFAULT_SELECTOR_MODEL: &str = "default";

pub struct QueryOrchestrator {
    store: Arc<ResourceStore>,
    event_bus: Arc<EventBus>,
    model_client: Arc<dyn ModelClient>,
    tool_runner: Arc<dyn ToolRunner>,
    value_resolver: Arc<dyn ValueResolver>,
    templates: Arc<TemplateEngine>,
    team_engine: Arc<TeamEngine>,
    target_resolver: TargetResolver,
    auto_trigger: EvaluatorAutoTrigger,
}

impl QueryOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<ResourceStore>,
        event_bus: Arc<EventBus>,
        model_client: Arc<dyn ModelClient>,
        tool_runner: Arc<dyn ToolRunner>,
        value_resolver: Arc<dyn ValueResolver>,
        templates: Arc<TemplateEngine>,
        team_engine: Arc<TeamEngine>,
    ) -> Self {
        Self {
            target_resolver: TargetResolver::new(store.clone()),
            auto_trigger: EvaluatorAutoTrigger::new(store.clone()),
            store,
            event_bus,
            model_client,
            tool_runner,
            value_resolver,
            templates,
            team_engine,
        }
    }

    /// Advance a query by one reconciliation step.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<()> {
        let Some(query) = self.store.queries().get(namespace, name) else {
            debug!("query no longer exists; nothing to reconcile");
            return Ok(());
        };
        if query.status.phase.is_terminal() {
            // Terminal immutability: cancel included, this is a no-op.
            return Ok(());
        }
        if query.spec.cancel {
            return self.cancel(query).await;
        }
        if self.timed_out(&query) {
            let message = timeout_message(&query);
            return self.settle(query, QueryPhase::Error, Some(message)).await;
        }
        match query.status.phase {
            QueryPhase::Pending => self.start(query).await,
            QueryPhase::Running => self.run(query).await,
            QueryPhase::Evaluating => self.check_evaluations(query).await,
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Phase steps
    // ------------------------------------------------------------------

    async fn start(&self, mut query: Query) -> Result<()> {
        query.status.started_at = Some(Utc::now());
        self.transition(&mut query, QueryPhase::Running, None)?;
        self.persist(query)
    }

    async fn run(&self, mut query: Query) -> Result<()> {
        let targets = match self.target_resolver.resolve_targets(&query) {
            Ok(targets) => targets,
            Err(err) => {
                return self
                    .settle(query, QueryPhase::Error, Some(err.to_string()))
                    .await;
            }
        };

        let params = match self.resolve_parameters(&query.spec.parameters, &query.metadata.namespace).await {
            Ok(params) => params,
            Err(err) => {
                return self
                    .settle(query, QueryPhase::Error, Some(err.to_string()))
                    .await;
            }
        };
        let input = match self.templates.render_strings(&query.spec.input, &params) {
            Ok(input) => input,
            Err(err) => {
                return self
                    .settle(query, QueryPhase::Error, Some(format!("{err:#}")))
                    .await;
            }
        };

        let cancel = StoreCancelSignal {
            store: self.store.clone(),
            namespace: query.metadata.namespace.clone(),
            name: query.metadata.name.clone(),
        };

        let mut responses: Vec<Response> = Vec::new();
        let mut usage = TokenUsage::default();
        for target in &targets {
            // Cooperative checks at every target boundary.
            if cancel.is_cancelled().await {
                return self.cancel(query).await;
            }
            if self.timed_out(&query) {
                query.status.responses = responses;
                query.status.token_usage = usage;
                let message = timeout_message(&query);
                return self.settle(query, QueryPhase::Error, Some(message)).await;
            }
            // The remaining deadline budget bounds the call itself, so a hung
            // downstream target cannot outlive the query's timeout.
            let executed = match remaining_budget(&query) {
                Some(budget) => {
                    match tokio::time::timeout(
                        budget,
                        self.execute_target(&query, target, &input, &params, &cancel),
                    )
                    .await
                    {
                        Ok(executed) => executed,
                        Err(_) => {
                            query.status.responses = responses;
                            query.status.token_usage = usage;
                            let message = timeout_message(&query);
                            return self.settle(query, QueryPhase::Error, Some(message)).await;
                        }
                    }
                }
                None => self.execute_target(&query, target, &input, &params, &cancel).await,
            };
            match executed {
                Ok((target_responses, target_usage)) => {
                    responses.extend(target_responses);
                    usage.add(target_usage);
                }
                Err(err) => {
                    // Partial responses are retained for diagnostics.
                    query.status.responses = responses;
                    query.status.token_usage = usage;
                    return self
                        .settle(query, QueryPhase::Error, Some(format!(
                            "target '{}' failed: {err:#}",
                            target
                        )))
                        .await;
                }
            }
        }

        query.status.responses = responses;
        query.status.token_usage = usage;

        let evaluators = match self.required_evaluators(&query) {
            Ok(evaluators) => evaluators,
            Err(err) => {
                return self
                    .settle(query, QueryPhase::Error, Some(err.to_string()))
                    .await;
            }
        };
        if evaluators.is_empty() {
            return self.settle(query, QueryPhase::Done, None).await;
        }
        self.create_evaluations(&query, &evaluators)?;
        self.transition(&mut query, QueryPhase::Evaluating, None)?;
        self.persist(query)
    }

    /// Waits for spawned evaluations; settles done once all are terminal.
    async fn check_evaluations(&self, mut query: Query) -> Result<()> {
        let evaluations = self.spawned_evaluations(&query);
        if evaluations.iter().any(|e| !e.status.phase.is_terminal()) {
            debug!(query = %query.metadata.name, "evaluations still in flight");
            return Ok(());
        }
        query.status.evaluations = evaluations
            .iter()
            .map(|e| crate::domain::query::EvaluationSummary {
                evaluator_name: e.spec.evaluator.name.clone(),
                score: e.status.score.clone(),
                passed: e.status.passed,
                metadata: e.status.metadata.clone(),
            })
            .collect();
        for evaluation in &evaluations {
            query.status.token_usage.add(evaluation.status.token_usage);
        }
        self.settle(query, QueryPhase::Done, None).await
    }

    /// Cooperative cancellation: discard partial output, settle canceled.
    /// Idempotent; canceling an already-canceled query is a no-op.
    async fn cancel(&self, query: Query) -> Result<()> {
        if query.status.phase.is_terminal() {
            return Ok(());
        }
        let mut query = query;
        query.status.responses.clear();
        self.settle(query, QueryPhase::Canceled, Some("canceled by request".into()))
            .await
    }

    // ------------------------------------------------------------------
    // Target execution
    // ------------------------------------------------------------------

    async fn execute_target(
        &self,
        query: &Query,
        target: &TargetRef,
        input: &str,
        params: &HashMap<String, String>,
        cancel: &StoreCancelSignal,
    ) -> Result<(Vec<Response>, TokenUsage)> {
        let namespace = &query.metadata.namespace;
        match target.kind {
            ResourceKind::Agent => {
                let outcome = self
                    .execute_agent_turn(namespace, &target.name, params, input, &[])
                    .await?;
                Ok((
                    vec![Response { target: target.clone(), content: outcome.content }],
                    outcome.usage,
                ))
            }
            ResourceKind::Model => {
                let model = self
                    .store
                    .models()
                    .get(namespace, &target.name)
                    .ok_or_else(|| anyhow!("model '{}' not found", target.name))?;
                let request = ChatRequest {
                    model: model.spec.model.clone(),
                    messages: vec![ChatMessage::user(input)],
                    tools: Vec::new(),
                    choice_count: 1,
                };
                let response = self.model_client.chat_completion(request).await?;
                let content = response.first_choice()?.to_string();
                Ok((
                    vec![Response { target: target.clone(), content }],
                    response.usage,
                ))
            }
            ResourceKind::Tool => {
                let tool = self
                    .store
                    .tools()
                    .get(namespace, &target.name)
                    .ok_or_else(|| anyhow!("tool '{}' not found", target.name))?;
                let content = self.tool_runner.invoke(&tool, input).await?;
                Ok((
                    vec![Response { target: target.clone(), content }],
                    TokenUsage::default(),
                ))
            }
            ResourceKind::Team => {
                let team = self
                    .store
                    .teams()
                    .get(namespace, &target.name)
                    .ok_or_else(|| anyhow!("team '{}' not found", target.name))?;
                self.execute_team(query, &team, input, params, cancel).await
            }
            other => Err(anyhow!("kind '{}' is not executable", other)),
        }
    }

    async fn execute_team(
        &self,
        query: &Query,
        team: &Team,
        input: &str,
        params: &HashMap<String, String>,
        cancel: &StoreCancelSignal,
    ) -> Result<(Vec<Response>, TokenUsage)> {
        let namespace = query.metadata.namespace.clone();
        let selector_model = self.selector_model_for(&namespace, team);
        let executor = QueryMemberExecutor {
            orchestrator: self,
            namespace: namespace.clone(),
            params: params.clone(),
            input: input.to_string(),
            cancel: cancel.clone(),
        };
        let seed = self.seed_history(query);
        let result = self
            .team_engine
            .run(team, &selector_model, &executor, cancel, seed)
            .await?;
        if result.stop == TeamStop::Canceled {
            // The caller re-checks the cancel flag at the next boundary.
            debug!(team = %team.metadata.name, "team run observed cancellation");
        }
        Ok((result.responses, result.usage))
    }

    /// Execute one agent turn: rendered system prompt, transcript as
    /// assistant messages, then the query input.
    async fn execute_agent_turn(
        &self,
        namespace: &str,
        agent_name: &str,
        params: &HashMap<String, String>,
        input: &str,
        history: &[TeamMessage],
    ) -> Result<MemberOutcome> {
        let agent = self
            .store
            .agents()
            .get(namespace, agent_name)
            .ok_or_else(|| anyhow!("agent '{}' not found", agent_name))?;
        agent.spec.validate()?;

        let mut merged = params.clone();
        let agent_params = self
            .resolve_parameters(&agent.spec.parameters, namespace)
            .await?;
        merged.extend(agent_params);
        let prompt = self
            .templates
            .render_strings(&agent.spec.prompt, &merged)
            .with_context(|| format!("failed to render prompt of agent '{}'", agent_name))?;

        let mut messages = vec![ChatMessage::system(prompt)];
        for entry in history {
            messages.push(ChatMessage::assistant(entry.member.clone(), entry.content.clone()));
        }
        messages.push(ChatMessage::user(input));

        let model = self.agent_model(&agent);
        let request = ChatRequest {
            model,
            messages,
            tools: agent.spec.tools.clone(),
            choice_count: 1,
        };
        let response = self.model_client.chat_completion(request).await?;
        let content = response.first_choice()?.to_string();
        let terminate = content.trim_end().ends_with(TERMINATE_TOKEN);
        Ok(MemberOutcome { content, usage: response.usage, terminate })
    }

    /// Resolve the model name driving an agent: its model reference, or the
    /// external execution engine behind the same invocation seam.
    fn agent_model(&self, agent: &Agent) -> String {
        agent
            .spec
            .model_ref
            .clone()
            .or_else(|| agent.spec.execution_engine.clone())
            .unwrap_or_else(|| DEFAULT_SELECTOR_MODEL.to_string())
    }

    /// Selector calls use the first agent member's model, else a default.
    fn selector_model_for(&self, namespace: &str, team: &Team) -> String {
        for member in &team.spec.members {
            if member.kind == ResourceKind::Agent {
                if let Some(agent) = self.store.agents().get(namespace, &member.name) {
                    if let Some(model) = agent.spec.model_ref {
                        return model;
                    }
                }
            }
        }
        DEFAULT_SELECTOR_MODEL.to_string()
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
    // Evaluation wiring
    // ------------------------------------------------------------------

    /// Union of explicit evaluator references, evaluator-selector matches,
    /// and auto-trigger matches, deduplicated by name.
    fn required_evaluators(&self, query: &Query) -> Result<Vec<EvaluatorRef>> {
        let namespace = &query.metadata.namespace;
        let mut names: Vec<String> = Vec::new();
        let mut refs: Vec<EvaluatorRef> = Vec::new();
        let mut push = |name: String, parameters: Vec<Parameter>| {
            if !names.contains(&name) {
                names.push(name.clone());
                refs.push(EvaluatorRef { name, parameters });
            }
        };

        for name in &query.spec.evaluators {
            let evaluator = self
                .store
                .evaluators()
                .get(namespace, name)
                .ok_or_else(|| anyhow!("evaluator '{}' not found", name))?;
            push(name.clone(), evaluator.spec.parameters);
        }
        if let Some(selector) = &query.spec.evaluator_selector {
            for evaluator in self.store.evaluators().list_matching(namespace, selector) {
                push(evaluator.metadata.name.clone(), evaluator.spec.parameters);
            }
        }
        for evaluator in self.auto_trigger.matching_evaluators(query) {
            push(evaluator.metadata.name.clone(), evaluator.spec.parameters);
        }
        Ok(refs)
    }

    /// Create one query-type evaluation per evaluator; already-existing
    /// children are left untouched so re-reconciliation stays idempotent.
    fn create_evaluations(&self, query: &Query, evaluators: &[EvaluatorRef]) -> Result<()> {
        for evaluator in evaluators {
            let name = format!("{}-{}", query.metadata.name, evaluator.name);
            if self
                .store
                .evaluations()
                .get(&query.metadata.namespace, &name)
                .is_some()
            {
                continue;
            }
            let metadata = ObjectMeta::new(name, query.metadata.namespace.clone())
                .with_label(QUERY_LABEL, query.metadata.name.clone());
            let spec = EvaluationSpec {
                eval_type: EvaluationType::Query,
                config: EvaluationConfig {
                    query: Some(QueryConfig {
                        query_ref: query.metadata.name.clone(),
                        response_target: None,
                    }),
                    ..Default::default()
                },
                evaluator: evaluator.clone(),
                ttl: query.spec.ttl,
                timeout: query.spec.timeout,
            };
            self.store
                .evaluations()
                .create(Evaluation::new(metadata, spec))
                .context("failed to create evaluation")?;
        }
        Ok(())
    }

    fn spawned_evaluations(&self, query: &Query) -> Vec<Evaluation> {
        self.store
            .evaluations()
            .list(&query.metadata.namespace)
            .into_iter()
            .filter(|e| {
                e.metadata.labels.get(QUERY_LABEL) == Some(&query.metadata.name)
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Status plumbing
    // ------------------------------------------------------------------

    fn timed_out(&self, query: &Query) -> bool {
        let (Some(timeout), Some(started_at)) = (query.spec.timeout, query.status.started_at)
        else {
            return false;
        };
        let Ok(timeout) = chrono::Duration::from_std(timeout) else {
            return false;
        };
        Utc::now() >= started_at + timeout
    }

    /// Seed transcript for a team run: the memory-referenced query's
    /// responses when set, else the completed queries of the same session in
    /// completion order.
    fn seed_history(&self, query: &Query) -> Vec<TeamMessage> {
        let namespace = &query.metadata.namespace;
        let mut transcripts: Vec<Query> = Vec::new();
        if let Some(memory) = &query.spec.memory {
            if let Some(prior) = self.store.queries().get(namespace, memory) {
                transcripts.push(prior);
            }
        } else if let Some(session) = query.spec.session_id.as_deref() {
            let mut prior: Vec<Query> = self
                .store
                .queries()
                .list(namespace)
                .into_iter()
                .filter(|q| q.metadata.name != query.metadata.name)
                .filter(|q| q.spec.session_id.as_deref() == Some(session))
                .filter(|q| q.status.phase == QueryPhase::Done)
                .collect();
            prior.sort_by_key(|q| q.status.completed_at);
            transcripts.extend(prior);
        }
        transcripts
            .iter()
            .flat_map(|q| &q.status.responses)
            .map(|r| TeamMessage { member: r.target.name.clone(), content: r.content.clone() })
            .collect()
    }

    fn transition(
        &self,
        query: &mut Query,
        phase: QueryPhase,
        message: Option<String>,
    ) -> Result<()> {
        let from = query.status.phase;
        query.status.transition(phase)?;
        query.status.message = message;
        if phase.is_terminal() {
            let now = Utc::now();
            query.status.completed_at = Some(now);
            if let Some(started_at) = query.status.started_at {
                query.status.duration = (now - started_at).to_std().ok();
            }
        }
        self.event_bus.publish(OrchestrationEvent::QueryPhaseChanged {
            namespace: query.metadata.namespace.clone(),
            query: query.metadata.name.clone(),
            from,
            to: phase,
            at: Utc::now(),
        });
        Ok(())
    }

    /// Transition and persist in one step.
    async fn settle(&self, mut query: Query, phase: QueryPhase, message: Option<String>) -> Result<()> {
        self.transition(&mut query, phase, message)?;
        self.persist(query)
    }

    fn persist(&self, query: Query) -> Result<()> {
        match self.store.queries().update(query) {
            Ok(updated) => {
                info!(
                    query = %updated.metadata.name,
                    phase = %updated.status.phase,
                    "persisted query status"
                );
                Ok(())
            }
            Err(StoreError::Conflict { name, .. }) => {
                // A concurrent reconciliation won the check-and-set; its
                // change notification re-drives this object.
                warn!(query = %name, "query status write conflicted; yielding");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Expire terminal queries past their TTL, cascading to the
    /// evaluations they spawned.
    pub fn sweep_expired(&self, namespace: &str) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        for query in self.store.queries().list(namespace) {
            if !query.is_expired(now) {
                continue;
            }
            for evaluation in self.spawned_evaluations(&query) {
                self.store
                    .evaluations()
                    .delete(namespace, &evaluation.metadata.name);
            }
            if self.store.queries().delete(namespace, &query.metadata.name) {
                info!(query = %query.metadata.name, "expired query collected");
                removed += 1;
            }
        }
        removed
    }
}

fn timeout_message(query: &Query) -> String {
    format!(
        "query timed out after {}",
        humantime::format_duration(query.spec.timeout.unwrap_or_default())
    )
}

/// Time left before the query's deadline; `None` when no timeout is set.
/// An already-passed deadline yields a zero budget.
fn remaining_budget(query: &Query) -> Option<std::time::Duration> {
    let (Some(timeout), Some(started_at)) = (query.spec.timeout, query.status.started_at) else {
        return None;
    };
    let timeout = chrono::Duration::from_std(timeout).ok()?;
    Some(
        ((started_at + timeout) - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO),
    )
}

// ============================================================================
// Seam implementations
// ============================================================================

/// Cancellation probe backed by the stored query spec.
#[derive(Clone)]
struct StoreCancelSignal {
    store: Arc<ResourceStore>,
    namespace: String,
    name: String,
}

#[async_trait]
impl CancelSignal for StoreCancelSignal {
    async fn is_cancelled(&self) -> bool {
        match self.store.queries().get(&self.namespace, &self.name) {
            Some(query) => query.spec.cancel || query.status.phase == QueryPhase::Canceled,
            // A deleted query has nothing left to execute for.
            None => true,
        }
    }
}

/// Member executor that runs agent members as single-shot chat turns and
/// recurses into nested teams.
struct QueryMemberExecutor<'a> {
    orchestrator: &'a QueryOrchestrator,
    namespace: String,
    params: HashMap<String, String>,
    input: String,
    cancel: StoreCancelSignal,
}

#[async_trait]
impl MemberExecutor for QueryMemberExecutor<'_> {
    async fn execute_member(
        &self,
        member: &TeamMember,
        history: &[TeamMessage],
    ) -> Result<MemberOutcome> {
        match member.kind {
            ResourceKind::Agent => {
                self.orchestrator
                    .execute_agent_turn(&self.namespace, &member.name, &self.params, &self.input, history)
                    .await
            }
            ResourceKind::Team => {
                let team = self
                    .orchestrator
                    .store
                    .teams()
                    .get(&self.namespace, &member.name)
                    .ok_or_else(|| anyhow!("nested team '{}' not found", member.name))?;
                let selector_model = self
                    .orchestrator
                    .selector_model_for(&self.namespace, &team);
                let result = self
                    .orchestrator
                    .team_engine
                    .run(&team, &selector_model, self, &self.cancel, history.to_vec())
                    .await?;
                let content = result
                    .messages
                    .last()
                    .map(|m| m.content.clone())
                    .unwrap_or_default();
                // A nested team's stop condition does not terminate the
                // enclosing run.
                Ok(MemberOutcome { content, usage: result.usage, terminate: false })
            }
            other => Err(anyhow!("kind '{}' cannot be a team member", other)),
        }
    }
}
