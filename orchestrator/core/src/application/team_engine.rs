// Copyright (c) 2026 Helmsman Authors
// SPDX-License-Identifier: AGPL-3.0
//! Team strategy engine
//!
//! Drives a multi-turn conversation among team members as a turn-based state
//! machine: `TurnStart -> MemberSelected -> MemberExecuted -> {TurnStart |
//! Terminated}`. Four strategies govern member order: sequential,
//! round-robin, graph, and an LLM-driven selector.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Turn loop over a [`MemberExecutor`] seam
//!
//! Member execution is delegated through [`MemberExecutor`] so the engine is
//! independent of how an individual agent (or nested team) actually runs.
//! Turns are strictly sequential within one run; a member execution failure
//! aborts the run, except the distinguished termination signal, which is a
//! normal successful stop.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::events::{OrchestrationEvent, SelectionReason};
use crate::domain::query::{Response, TokenUsage};
use crate::domain::resource::TargetRef;
use crate::domain::team::{Team, TeamError, TeamMember, TeamStrategy};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::model_client::{ChatMessage, ChatRequest, ModelClient};
use crate::infrastructure::template::TemplateEngine;

/// Built-in selector prompt, used when the team declares none.
pub const DEFAULT_SELECTOR_PROMPT: &str = "You are moderating a conversation between the following roles:\n\
{{Roles}}\n\n\
Participants: {{Participants}}\n\n\
Conversation so far:\n\
{{History}}";

const SELECTOR_INSTRUCTION: &str = "Read the conversation above. Select the next role from the \
participant list to speak. Answer with the role name only.";

// ============================================================================
// Seams
// ============================================================================

/// One member's turn output.
#[derive(Debug, Clone)]
pub struct MemberOutcome {
    pub content: String,
    pub usage: TokenUsage,
    /// Distinguished "stop the team run" signal; success, not failure.
    pub terminate: bool,
}

/// Executes a single member turn (agent call or nested team run).
#[async_trait]
pub trait MemberExecutor: Send + Sync {
    async fn execute_member(
        &self,
        member: &TeamMember,
        history: &[TeamMessage],
    ) -> Result<MemberOutcome>;
}

/// Cooperative cancellation probe, checked at turn boundaries.
#[async_trait]
pub trait CancelSignal: Send + Sync {
    async fn is_cancelled(&self) -> bool;
}

/// Signal that never cancels; for standalone runs and tests.
pub struct NeverCancelled;

#[async_trait]
impl CancelSignal for NeverCancelled {
    async fn is_cancelled(&self) -> bool {
        false
    }
}

// ============================================================================
// Run Result
// ============================================================================

/// One entry in the ordered team transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct TeamMessage {
    pub member: String,
    pub content: String,
}

/// How a team run ended. All variants are successful stops except that a
/// hard member error never produces a result at all.
#[derive(Debug, Clone, PartialEq)]
pub enum TeamStop {
    /// Strategy ran to its natural end.
    Completed,
    /// A member signaled explicit team termination.
    Terminated { member: String },
    /// `max_turns` was reached.
    TurnLimit,
    /// Cancellation observed at a turn boundary.
    Canceled,
}

#[derive(Debug, Clone)]
pub struct TeamRunResult {
    /// Chronological transcript of member turns.
    pub messages: Vec<TeamMessage>,
    /// Latest response per member, in first-execution order.
    pub responses: Vec<Response>,
    pub usage: TokenUsage,
    pub stop: TeamStop,
    pub turns: u32,
}

struct RunState {
    team: String,
    messages: Vec<TeamMessage>,
    responses: Vec<Response>,
    response_index: HashMap<String, usize>,
    usage: TokenUsage,
    turn: u32,
}

impl RunState {
    fn new(team: &Team, seed_history: Vec<TeamMessage>) -> Self {
        Self {
            team: team.metadata.name.clone(),
            messages: seed_history,
            responses: Vec::new(),
            response_index: HashMap::new(),
            usage: TokenUsage::default(),
            turn: 0,
        }
    }

    fn record(&mut self, member: &TeamMember, outcome: &MemberOutcome) {
        self.messages.push(TeamMessage {
            member: member.name.clone(),
            content: outcome.content.clone(),
        });
        match self.response_index.get(&member.name) {
            Some(&idx) => self.responses[idx].content = outcome.content.clone(),
            None => {
                self.response_index.insert(member.name.clone(), self.responses.len());
                self.responses.push(Response {
                    target: TargetRef::new(member.kind, member.name.clone()),
                    content: outcome.content.clone(),
                });
            }
        }
        self.usage.add(outcome.usage);
        self.turn += 1;
    }

    fn finish(self, stop: TeamStop) -> TeamRunResult {
        TeamRunResult {
            messages: self.messages,
            responses: self.responses,
            usage: self.usage,
            stop,
            turns: self.turn,
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct TeamEngine {
    event_bus: Arc<EventBus>,
    model_client: Arc<dyn ModelClient>,
    templates: Arc<TemplateEngine>,
}

impl TeamEngine {
    pub fn new(
        event_bus: Arc<EventBus>,
        model_client: Arc<dyn ModelClient>,
        templates: Arc<TemplateEngine>,
    ) -> Self {
        Self { event_bus, model_client, templates }
    }

    /// Run a team to completion under its declared strategy.
    ///
    /// `selector_model` is the resolved model used for LLM-driven selection;
    /// ignored by the other strategies. `seed_history` carries prior
    /// conversation turns (memory/session continuation).
    #[tracing::instrument(skip_all, fields(team = %team.metadata.name, strategy = ?team.spec.strategy))]
    pub async fn run(
        &self,
        team: &Team,
        selector_model: &str,
        executor: &dyn MemberExecutor,
        cancel: &dyn CancelSignal,
        seed_history: Vec<TeamMessage>,
    ) -> Result<TeamRunResult> {
        team.spec.validate()?;
        let mut state = RunState::new(team, seed_history);

        let stop = match team.spec.strategy {
            TeamStrategy::Sequential => {
                self.run_sequential(team, executor, cancel, &mut state).await?
            }
            TeamStrategy::RoundRobin => {
                self.run_round_robin(team, executor, cancel, &mut state).await?
            }
            TeamStrategy::Graph => self.run_graph(team, executor, cancel, &mut state).await?,
            TeamStrategy::Selector => {
                self.run_selector(team, selector_model, executor, cancel, &mut state)
                    .await?
            }
        };

        info!(team = %team.metadata.name, turns = state.turn, stop = ?stop, "team run finished");
        Ok(state.finish(stop))
    }

    async fn run_sequential(
        &self,
        team: &Team,
        executor: &dyn MemberExecutor,
        cancel: &dyn CancelSignal,
        state: &mut RunState,
    ) -> Result<TeamStop> {
        for member in &team.spec.members {
            if cancel.is_cancelled().await {
                return Ok(TeamStop::Canceled);
            }
            if self.turn_limit_reached(team, state) {
                return Ok(TeamStop::TurnLimit);
            }
            self.emit_turn_started(state);
            self.emit_member_selected(state, member, None);
            if let Some(stop) = self.execute_turn(executor, member, state).await? {
                return Ok(stop);
            }
        }
        Ok(TeamStop::Completed)
    }

    async fn run_round_robin(
        &self,
        team: &Team,
        executor: &dyn MemberExecutor,
        cancel: &dyn CancelSignal,
        state: &mut RunState,
    ) -> Result<TeamStop> {
        let members = &team.spec.members;
        if members.is_empty() {
            return Err(TeamError::NoMembers.into());
        }
        if team.spec.max_turns.is_none() {
            // Without a cap the loop only stops on an explicit signal.
            warn!(team = %state.team, "round-robin team has no max_turns");
        }
        loop {
            if cancel.is_cancelled().await {
                return Ok(TeamStop::Canceled);
            }
            if self.turn_limit_reached(team, state) {
                return Ok(TeamStop::TurnLimit);
            }
            let member = &members[state.turn as usize % members.len()];
            self.emit_turn_started(state);
            self.emit_member_selected(state, member, None);
            if let Some(stop) = self.execute_turn(executor, member, state).await? {
                return Ok(stop);
            }
        }
    }

    /// Graph execution: edges fire exactly once; a member runs only after
    /// every incoming edge has fired; roots are the in-degree-zero members
    /// in declared order.
    async fn run_graph(
        &self,
        team: &Team,
        executor: &dyn MemberExecutor,
        cancel: &dyn CancelSignal,
        state: &mut RunState,
    ) -> Result<TeamStop> {
        let members = &team.spec.members;
        let mut indegree: HashMap<&str, usize> =
            members.iter().map(|m| (m.name.as_str(), 0)).collect();
        let mut outgoing: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &team.spec.graph {
            *indegree.get_mut(edge.to.as_str()).ok_or_else(|| {
                anyhow!("graph edge references undeclared member '{}'", edge.to)
            })? += 1;
            outgoing.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
        }

        let mut frontier: VecDeque<&TeamMember> = members
            .iter()
            .filter(|m| indegree[m.name.as_str()] == 0)
            .collect();
        let mut executed: HashSet<&str> = HashSet::new();

        while let Some(member) = frontier.pop_front() {
            if cancel.is_cancelled().await {
                return Ok(TeamStop::Canceled);
            }
            if self.turn_limit_reached(team, state) {
                return Ok(TeamStop::TurnLimit);
            }
            if !executed.insert(member.name.as_str()) {
                continue;
            }
            self.emit_turn_started(state);
            self.emit_member_selected(state, member, None);
            if let Some(stop) = self.execute_turn(executor, member, state).await? {
                return Ok(stop);
            }
            // Fire each outgoing edge once; targets join the frontier when
            // their last incoming edge fires.
            if let Some(targets) = outgoing.get(member.name.as_str()) {
                for target in targets {
                    let remaining = indegree.get_mut(target).ok_or_else(|| {
                        anyhow!("graph edge references undeclared member '{}'", target)
                    })?;
                    *remaining -= 1;
                    if *remaining == 0 {
                        if let Some(next) = team.spec.member(target) {
                            frontier.push_back(next);
                        }
                    }
                }
            }
        }
        // Unfired edges in a cycle leave the frontier empty; normal stop.
        Ok(TeamStop::Completed)
    }

    async fn run_selector(
        &self,
        team: &Team,
        selector_model: &str,
        executor: &dyn MemberExecutor,
        cancel: &dyn CancelSignal,
        state: &mut RunState,
    ) -> Result<TeamStop> {
        let members = &team.spec.members;
        if members.is_empty() {
            return Err(TeamError::NoMembers.into());
        }
        let prompt_template = team
            .spec
            .selector_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SELECTOR_PROMPT);
        let mut previous: Option<String> = None;

        loop {
            if cancel.is_cancelled().await {
                return Ok(TeamStop::Canceled);
            }
            if self.turn_limit_reached(team, state) {
                return Ok(TeamStop::TurnLimit);
            }
            self.emit_turn_started(state);

            let previous_member = previous.clone();
            let (member, reason) = self
                .select_member(
                    team,
                    selector_model,
                    prompt_template,
                    previous_member.as_deref(),
                    state,
                )
                .await?;
            self.emit_member_selected(state, &member, Some(reason));
            previous = Some(member.name.clone());

            if let Some(stop) = self.execute_turn(executor, &member, state).await? {
                return Ok(stop);
            }
        }
    }

    /// Ask the selector model for the next member name.
    ///
    /// Exact match wins. On no match, fall back to the first declared member,
    /// unless that member just spoke and the team has more than one member,
    /// in which case the second declared member is chosen instead.
    async fn select_member(
        &self,
        team: &Team,
        selector_model: &str,
        prompt_template: &str,
        previous: Option<&str>,
        state: &mut RunState,
    ) -> Result<(TeamMember, SelectionReason)> {
        let members = &team.spec.members;
        let roles = members
            .iter()
            .map(|m| match &m.description {
                Some(d) => format!("{}: {}", m.name, d),
                None => m.name.clone(),
            })
            .collect::<Vec<_>>()
            .join(", ");
        let participants = members
            .iter()
            .map(|m| m.name.clone())
            .collect::<Vec<_>>()
            .join(", ");
        let history = state
            .messages
            .iter()
            .map(|m| format!("# {}:\n{}", m.member, m.content))
            .collect::<Vec<_>>()
            .join("\n");

        let mut vars = HashMap::new();
        vars.insert("Roles".to_string(), roles);
        vars.insert("Participants".to_string(), participants);
        vars.insert("History".to_string(), history);
        let rendered = self
            .templates
            .render_strings(prompt_template, &vars)
            .context("failed to render selector prompt")?;

        let request = ChatRequest {
            model: selector_model.to_string(),
            messages: vec![ChatMessage::system(rendered), ChatMessage::user(SELECTOR_INSTRUCTION)],
            tools: Vec::new(),
            choice_count: 1,
        };
        let response = self
            .model_client
            .chat_completion(request)
            .await
            .context("selector model call failed")?;
        state.usage.add(response.usage);
        let raw = response.first_choice()?.trim().to_string();

        if let Some(member) = members.iter().find(|m| m.name == raw) {
            return Ok((member.clone(), SelectionReason::ExactMatch));
        }
        debug!(team = %state.team, raw, "selector returned unknown member; falling back");
        let mut fallback = members[0].clone();
        if previous == Some(fallback.name.as_str()) && members.len() > 1 {
            // Anti-repetition guard: never fall back onto the member that
            // just spoke when an alternative exists.
            fallback = members[1].clone();
        }
        Ok((fallback, SelectionReason::FallbackNoMatch))
    }

    async fn execute_turn(
        &self,
        executor: &dyn MemberExecutor,
        member: &TeamMember,
        state: &mut RunState,
    ) -> Result<Option<TeamStop>> {
        let outcome = executor
            .execute_member(member, &state.messages)
            .await
            .with_context(|| format!("member '{}' execution failed", member.name))?;
        state.record(member, &outcome);
        if outcome.terminate {
            self.event_bus.publish(OrchestrationEvent::TeamTerminated {
                team: state.team.clone(),
                member: member.name.clone(),
                at: Utc::now(),
            });
            return Ok(Some(TeamStop::Terminated { member: member.name.clone() }));
        }
        Ok(None)
    }

    fn turn_limit_reached(&self, team: &Team, state: &RunState) -> bool {
        let Some(max_turns) = team.spec.max_turns else {
            return false;
        };
        if state.turn < max_turns {
            return false;
        }
        self.event_bus.publish(OrchestrationEvent::TeamTurnLimitReached {
            team: state.team.clone(),
            max_turns,
            at: Utc::now(),
        });
        true
    }

    fn emit_turn_started(&self, state: &RunState) {
        self.event_bus.publish(OrchestrationEvent::TeamTurnStarted {
            team: state.team.clone(),
            turn: state.turn,
            at: Utc::now(),
        });
    }

    fn emit_member_selected(
        &self,
        state: &RunState,
        member: &TeamMember,
        reason: Option<SelectionReason>,
    ) {
        self.event_bus.publish(OrchestrationEvent::TeamMemberSelected {
            team: state.team.clone(),
            turn: state.turn,
            member: member.name.clone(),
            reason,
            at: Utc::now(),
        });
    }
}
