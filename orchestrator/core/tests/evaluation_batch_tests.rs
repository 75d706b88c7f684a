// Copyright (c) 2026 Helmsman Authors
// SPDX-License-Identifier: AGPL-3.0

//! Integration tests for the evaluation orchestrator.
//!
//! Covers single-evaluation dispatch, event-rule scoring, and the batch
//! fan-out engine: semaphore-bounded concurrency, `continue_on_failure`
//! semantics, progress accounting, and the parent terminal phase rule.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use helmsman_core::application::evaluation_orchestrator::{EvaluationOrchestrator, PARENT_LABEL};
use helmsman_core::domain::evaluation::{
    BatchConfig, BatchItem, DirectConfig, Evaluation, EvaluationConfig, EvaluationPhase,
    EvaluationSpec, EvaluationType, EventConfig, EventRule, EvaluatorRef,
};
use helmsman_core::domain::resource::ObjectMeta;
use helmsman_core::domain::value::ValueSource;
use helmsman_core::domain::evaluator::{Evaluator, EvaluatorSpec};
use helmsman_core::infrastructure::evaluator_client::{
    EvaluationRequest, EvaluatorClient, EvaluatorClientError, EvaluatorVerdict,
};
use helmsman_core::infrastructure::event_bus::EventBus;
use helmsman_core::infrastructure::session_events::{InMemorySessionEvents, SessionEvent};
use helmsman_core::infrastructure::store::ResourceStore;
use helmsman_core::infrastructure::value_resolver::StaticValueResolver;

/// Evaluator stub: fails on inputs containing "fail", scores 0.8 otherwise,
/// and tracks the maximum number of concurrent in-flight calls.
struct TrackingEvaluator {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl TrackingEvaluator {
    fn new() -> Arc<Self> {
        Arc::new(Self { in_flight: AtomicUsize::new(0), max_in_flight: AtomicUsize::new(0) })
    }

    fn max_seen(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EvaluatorClient for TrackingEvaluator {
    async fn evaluate(
        &self,
        request: EvaluationRequest,
    ) -> Result<EvaluatorVerdict, EvaluatorClientError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if request.input.as_deref().is_some_and(|i| i.contains("fail")) {
            return Err(EvaluatorClientError::Rejected(
                request.evaluator,
                "scripted rejection".to_string(),
            ));
        }
        Ok(EvaluatorVerdict { score: 0.8, passed: true, ..Default::default() })
    }
}

struct Harness {
    store: Arc<ResourceStore>,
    orchestrator: EvaluationOrchestrator,
    evaluator_client: Arc<TrackingEvaluator>,
    session_events: Arc<InMemorySessionEvents>,
}

impl Harness {
    fn new() -> Self {
        let store = ResourceStore::new();
        let evaluator_client = TrackingEvaluator::new();
        let session_events = Arc::new(InMemorySessionEvents::new());
        let orchestrator = EvaluationOrchestrator::new(
            store.clone(),
            Arc::new(EventBus::with_default_capacity()),
            evaluator_client.clone(),
            Arc::new(StaticValueResolver::new()),
            session_events.clone(),
        );
        store
            .evaluators()
            .create(Evaluator {
                metadata: ObjectMeta::new("judge", "default"),
                spec: EvaluatorSpec {
                    address: ValueSource::literal("http://judge"),
                    ..Default::default()
                },
            })
            .unwrap();
        Self { store, orchestrator, evaluator_client, session_events }
    }

    fn create(&self, name: &str, spec: EvaluationSpec) {
        self.create_labeled(name, spec, &[]);
    }

    fn create_labeled(&self, name: &str, spec: EvaluationSpec, labels: &[(&str, &str)]) {
        let mut meta = ObjectMeta::new(name, "default");
        for (k, v) in labels {
            meta = meta.with_label(*k, *v);
        }
        self.store.evaluations().create(Evaluation::new(meta, spec)).unwrap();
    }

    async fn reconcile_to_terminal(&self, name: &str) {
        self.orchestrator.reconcile("default", name).await.unwrap();
        self.orchestrator.reconcile("default", name).await.unwrap();
    }

    fn evaluation(&self, name: &str) -> Evaluation {
        self.store.evaluations().get("default", name).unwrap()
    }
}

fn judge() -> EvaluatorRef {
    EvaluatorRef { name: "judge".into(), parameters: Vec::new() }
}

fn direct_spec(input: &str, output: &str) -> EvaluationSpec {
    EvaluationSpec {
        eval_type: EvaluationType::Direct,
        config: EvaluationConfig {
            direct: Some(DirectConfig { input: input.into(), output: output.into() }),
            ..Default::default()
        },
        evaluator: judge(),
        ttl: None,
        timeout: None,
    }
}

fn batch_spec(items: Vec<BatchItem>, concurrency: usize, continue_on_failure: bool) -> EvaluationSpec {
    EvaluationSpec {
        eval_type: EvaluationType::Batch,
        config: EvaluationConfig {
            batch: Some(BatchConfig {
                items,
                concurrency,
                continue_on_failure,
                ..Default::default()
            }),
            ..Default::default()
        },
        evaluator: judge(),
        ttl: None,
        timeout: None,
    }
}

fn items(inputs: &[&str]) -> Vec<BatchItem> {
    inputs
        .iter()
        .map(|i| BatchItem { name: None, input: i.to_string(), output: "expected".into() })
        .collect()
}

#[tokio::test]
async fn direct_evaluation_scores_and_settles_done() {
    let harness = Harness::new();
    harness.create("e", direct_spec("2+2", "4"));

    harness.reconcile_to_terminal("e").await;
    let evaluation = harness.evaluation("e");
    assert_eq!(evaluation.status.phase, EvaluationPhase::Done);
    assert_eq!(evaluation.status.score.as_deref(), Some("0.80"));
    assert_eq!(evaluation.status.passed, Some(true));
    assert!(evaluation.status.duration.is_some());
}

#[tokio::test]
async fn invalid_config_never_reaches_running() {
    let harness = Harness::new();
    let mut spec = direct_spec("a", "b");
    spec.config.event = Some(EventConfig {
        rules: vec![EventRule { name: "r".into(), expression: "exists(x)".into(), weight: 1 }],
        min_score_threshold: None,
    });
    harness.create("e", spec);

    harness.orchestrator.reconcile("default", "e").await.unwrap();
    let evaluation = harness.evaluation("e");
    assert_eq!(evaluation.status.phase, EvaluationPhase::Error);
    assert!(evaluation.status.started_at.is_none());
}

#[tokio::test]
async fn event_rules_score_session_events() {
    let harness = Harness::new();
    harness.session_events.record(
        "default",
        "s1",
        SessionEvent::new("tool_call").with_attribute("tool", "search"),
    );
    harness.create_labeled(
        "e",
        EvaluationSpec {
            eval_type: EvaluationType::Event,
            config: EvaluationConfig {
                event: Some(EventConfig {
                    rules: vec![
                        EventRule {
                            name: "used-search".into(),
                            expression: r#"tool == "search""#.into(),
                            weight: 3,
                        },
                        EventRule {
                            name: "handed-off".into(),
                            expression: r#"name == "handoff""#.into(),
                            weight: 1,
                        },
                    ],
                    min_score_threshold: Some(0.5),
                }),
                ..Default::default()
            },
            evaluator: judge(),
            ttl: None,
            timeout: None,
        },
        &[("helmsman.ai/session", "s1")],
    );

    harness.reconcile_to_terminal("e").await;
    let evaluation = harness.evaluation("e");
    assert_eq!(evaluation.status.phase, EvaluationPhase::Done);
    assert_eq!(evaluation.status.score.as_deref(), Some("0.75"));
    assert_eq!(evaluation.status.passed, Some(true));
    assert_eq!(evaluation.status.metadata.get("passed_rules").unwrap(), "1");
    assert_eq!(evaluation.status.metadata.get("failed_rules").unwrap(), "1");
}

#[tokio::test]
async fn batch_fans_out_and_aggregates() {
    let harness = Harness::new();
    harness.create("suite", batch_spec(items(&["a", "b", "c"]), 10, false));

    harness.reconcile_to_terminal("suite").await;
    let parent = harness.evaluation("suite");
    assert_eq!(parent.status.phase, EvaluationPhase::Done);
    assert_eq!(parent.status.score.as_deref(), Some("0.80"));
    assert_eq!(parent.status.passed, Some(true));

    let progress = parent.status.batch_progress.unwrap();
    assert_eq!(progress.total, 3);
    assert_eq!(progress.completed, 3);
    assert_eq!(progress.failed, 0);
    assert_eq!(progress.running, 0);
    assert_eq!(progress.child_evaluations.len(), 3);

    let child = harness.evaluation("suite-item-1");
    assert_eq!(child.metadata.labels.get(PARENT_LABEL).unwrap(), "suite");
    assert_eq!(child.status.phase, EvaluationPhase::Done);
}

#[tokio::test]
async fn batch_respects_the_concurrency_bound() {
    let harness = Harness::new();
    harness.create("suite", batch_spec(items(&["a", "b", "c", "d", "e"]), 2, true));

    harness.reconcile_to_terminal("suite").await;
    assert_eq!(harness.evaluation("suite").status.phase, EvaluationPhase::Done);
    assert!(harness.evaluator_client.max_seen() <= 2);
}

#[tokio::test]
async fn child_failure_halts_scheduling_and_errors_the_parent() {
    let harness = Harness::new();
    // Concurrency 1 makes the halt point deterministic: children run in
    // declared order and nothing past the failure is scheduled.
    harness.create("suite", batch_spec(items(&["a", "b", "fail-c", "d", "e"]), 1, false));

    harness.reconcile_to_terminal("suite").await;
    let parent = harness.evaluation("suite");
    assert_eq!(parent.status.phase, EvaluationPhase::Error);
    assert!(parent.status.message.as_deref().unwrap().contains("children failed"));

    let progress = parent.status.batch_progress.unwrap();
    assert_eq!(progress.total, 5);
    assert_eq!(progress.completed, 2);
    assert_eq!(progress.failed, 3);
    assert_eq!(progress.running, 0);

    assert_eq!(harness.evaluation("suite-item-1").status.phase, EvaluationPhase::Done);
    assert_eq!(harness.evaluation("suite-item-2").status.phase, EvaluationPhase::Done);
    assert_eq!(harness.evaluation("suite-item-3").status.phase, EvaluationPhase::Error);
    assert_eq!(harness.evaluation("suite-item-4").status.phase, EvaluationPhase::Canceled);
    assert_eq!(harness.evaluation("suite-item-5").status.phase, EvaluationPhase::Canceled);
}

#[tokio::test]
async fn continue_on_failure_settles_parent_done_with_failures_recorded() {
    let harness = Harness::new();
    harness.create("suite", batch_spec(items(&["a", "fail-b", "c"]), 10, true));

    harness.reconcile_to_terminal("suite").await;
    let parent = harness.evaluation("suite");
    assert_eq!(parent.status.phase, EvaluationPhase::Done);
    assert_eq!(parent.status.passed, Some(false));
    assert!(parent.status.message.as_deref().unwrap().contains("1 of 3"));

    let progress = parent.status.batch_progress.unwrap();
    assert_eq!(progress.completed, 2);
    assert_eq!(progress.failed, 1);
    assert_eq!(progress.completed + progress.failed + progress.running, progress.total);
}

#[tokio::test]
async fn expired_batch_parent_sweeps_its_children() {
    let harness = Harness::new();
    let mut spec = batch_spec(items(&["a", "b"]), 10, false);
    spec.ttl = Some(Duration::from_millis(1));
    harness.create("suite", spec);

    harness.reconcile_to_terminal("suite").await;
    assert_eq!(harness.evaluation("suite").status.phase, EvaluationPhase::Done);

    tokio::time::sleep(Duration::from_millis(10)).await;
    let removed = harness.orchestrator.sweep_expired("default");
    assert!(removed >= 1);
    assert!(harness.store.evaluations().get("default", "suite").is_none());
    assert!(harness.store.evaluations().get("default", "suite-item-1").is_none());
}
