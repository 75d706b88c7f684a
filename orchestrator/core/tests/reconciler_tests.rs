// Copyright (c) 2026 Helmsman Authors
// SPDX-License-Identifier: AGPL-3.0

//! Integration tests for the watch-driven reconciliation loop.
//!
//! These drive queries through the shipped `Reconciler` rather than calling
//! the orchestrators directly: delivery of pre-loop notifications, and the
//! deadline forcing `error` even when a downstream call never returns.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use helmsman_core::application::evaluation_orchestrator::EvaluationOrchestrator;
use helmsman_core::application::query_orchestrator::QueryOrchestrator;
use helmsman_core::application::reconciler::Reconciler;
use helmsman_core::application::team_engine::TeamEngine;
use helmsman_core::domain::agent::{Agent, AgentSpec};
use helmsman_core::domain::evaluator::{Evaluator, EvaluatorSpec};
use helmsman_core::domain::query::{Query, QueryPhase, QuerySpec, TokenUsage};
use helmsman_core::domain::resource::{ObjectMeta, ResourceKind, TargetRef};
use helmsman_core::domain::value::ValueSource;
use helmsman_core::infrastructure::evaluator_client::{
    EvaluationRequest, EvaluatorClient, EvaluatorClientError, EvaluatorVerdict,
};
use helmsman_core::infrastructure::event_bus::EventBus;
use helmsman_core::infrastructure::model_client::{
    ChatChoice, ChatRequest, ChatResponse, ModelClient, ModelError,
};
use helmsman_core::infrastructure::session_events::InMemorySessionEvents;
use helmsman_core::infrastructure::store::ResourceStore;
use helmsman_core::infrastructure::template::TemplateEngine;
use helmsman_core::infrastructure::tool_runner::UnconfiguredToolRunner;
use helmsman_core::infrastructure::value_resolver::StaticValueResolver;

/// Model stub that answers every chat completion with a fixed line.
struct FixedAnswerModel(&'static str);

#[async_trait]
impl ModelClient for FixedAnswerModel {
    async fn chat_completion(&self, _request: ChatRequest) -> Result<ChatResponse, ModelError> {
        Ok(ChatResponse {
            choices: vec![ChatChoice { content: self.0.to_string() }],
            usage: TokenUsage::default(),
        })
    }
}

/// Model stub whose calls never return.
struct HangingModel;

#[async_trait]
impl ModelClient for HangingModel {
    async fn chat_completion(&self, _request: ChatRequest) -> Result<ChatResponse, ModelError> {
        std::future::pending().await
    }
}

/// Evaluator stub whose calls never return.
struct HangingEvaluator;

#[async_trait]
impl EvaluatorClient for HangingEvaluator {
    async fn evaluate(
        &self,
        _request: EvaluationRequest,
    ) -> Result<EvaluatorVerdict, EvaluatorClientError> {
        std::future::pending().await
    }
}

struct Harness {
    store: Arc<ResourceStore>,
    reconciler: Arc<Reconciler>,
}

impl Harness {
    fn new(model: Arc<dyn ModelClient>, evaluator: Arc<dyn EvaluatorClient>) -> Self {
        let store = ResourceStore::new();
        let bus = Arc::new(EventBus::with_default_capacity());
        let templates = Arc::new(TemplateEngine::new());
        let team_engine = Arc::new(TeamEngine::new(bus.clone(), model.clone(), templates.clone()));
        let resolver = Arc::new(StaticValueResolver::new());
        let queries = Arc::new(QueryOrchestrator::new(
            store.clone(),
            bus.clone(),
            model,
            Arc::new(UnconfiguredToolRunner),
            resolver.clone(),
            templates,
            team_engine,
        ));
        let evaluations = Arc::new(EvaluationOrchestrator::new(
            store.clone(),
            bus,
            evaluator,
            resolver,
            Arc::new(InMemorySessionEvents::new()),
        ));
        let reconciler = Reconciler::new(store.clone(), queries, evaluations);
        Self { store, reconciler }
    }

    fn seed_agent(&self, name: &str) {
        self.store
            .agents()
            .create(
                Agent::new(
                    ObjectMeta::new(name, "default"),
                    AgentSpec { prompt: "Answer.".into(), model_ref: Some("gpt".into()), ..Default::default() },
                )
                .unwrap(),
            )
            .unwrap();
    }

    fn seed_evaluator(&self, name: &str) {
        self.store
            .evaluators()
            .create(Evaluator {
                metadata: ObjectMeta::new(name, "default"),
                spec: EvaluatorSpec {
                    address: ValueSource::literal("http://judge"),
                    ..Default::default()
                },
            })
            .unwrap();
    }

    fn create_query(&self, name: &str, spec: QuerySpec) {
        self.store
            .queries()
            .create(Query::new(ObjectMeta::new(name, "default"), spec))
            .unwrap();
    }

    async fn wait_for_phase(&self, name: &str, phase: QueryPhase) -> Query {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(query) = self.store.queries().get("default", name) {
                if query.status.phase == phase {
                    return query;
                }
            }
            if tokio::time::Instant::now() > deadline {
                let observed = self
                    .store
                    .queries()
                    .get("default", name)
                    .map(|q| q.status.phase.to_string())
                    .unwrap_or_else(|| "missing".into());
                panic!("query '{}' did not reach {} in time (observed {})", name, phase, observed);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn agent_target(name: &str) -> TargetRef {
    TargetRef::new(ResourceKind::Agent, name)
}

#[tokio::test]
async fn queries_created_before_the_loop_starts_are_still_reconciled() {
    let harness = Harness::new(Arc::new(FixedAnswerModel("42")), Arc::new(HangingEvaluator));
    harness.seed_agent("poet");
    // Created before run() polls for the first time; the change notification
    // must still be delivered.
    harness.create_query(
        "q",
        QuerySpec { input: "hello".into(), targets: vec![agent_target("poet")], ..Default::default() },
    );
    tokio::spawn(harness.reconciler.clone().run());

    let query = harness.wait_for_phase("q", QueryPhase::Done).await;
    assert_eq!(query.status.responses[0].content, "42");
}

#[tokio::test]
async fn deadline_forces_error_while_waiting_on_a_stuck_evaluation() {
    let harness = Harness::new(Arc::new(FixedAnswerModel("42")), Arc::new(HangingEvaluator));
    harness.seed_agent("poet");
    harness.seed_evaluator("accuracy");
    harness.create_query(
        "q",
        QuerySpec {
            input: "hello".into(),
            targets: vec![agent_target("poet")],
            evaluators: vec!["accuracy".into()],
            timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        },
    );
    tokio::spawn(harness.reconciler.clone().run());

    // The evaluator call hangs forever; the deadline must still settle the
    // query without waiting for it.
    let query = harness.wait_for_phase("q", QueryPhase::Error).await;
    assert!(query.status.message.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn deadline_cuts_a_hung_model_call() {
    let harness = Harness::new(Arc::new(HangingModel), Arc::new(HangingEvaluator));
    harness.seed_agent("poet");
    harness.create_query(
        "q",
        QuerySpec {
            input: "hello".into(),
            targets: vec![agent_target("poet")],
            timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        },
    );
    tokio::spawn(harness.reconciler.clone().run());

    let query = harness.wait_for_phase("q", QueryPhase::Error).await;
    assert!(query.status.message.as_deref().unwrap().contains("timed out"));
    assert!(query.status.responses.is_empty());
}
