// Copyright (c) 2026 Helmsman Authors
// SPDX-License-Identifier: AGPL-3.0
//! Orchestration trace events
//!
//! Structured, advisory events emitted through the event bus for
//! observability. Emission is fire-and-forget and must never affect
//! control-flow correctness.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::evaluation::EvaluationPhase;
use crate::domain::query::QueryPhase;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    QueryPhaseChanged {
        namespace: String,
        query: String,
        from: QueryPhase,
        to: QueryPhase,
        at: DateTime<Utc>,
    },
    TeamTurnStarted {
        team: String,
        turn: u32,
        at: DateTime<Utc>,
    },
    TeamMemberSelected {
        team: String,
        turn: u32,
        member: String,
        /// Selection-reason tag; absent for declared-order strategies.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<SelectionReason>,
        at: DateTime<Utc>,
    },
    TeamTurnLimitReached {
        team: String,
        max_turns: u32,
        at: DateTime<Utc>,
    },
    TeamTerminated {
        team: String,
        /// Member that signaled termination.
        member: String,
        at: DateTime<Utc>,
    },
    EvaluationPhaseChanged {
        namespace: String,
        evaluation: String,
        from: EvaluationPhase,
        to: EvaluationPhase,
        at: DateTime<Utc>,
    },
    BatchChildTransitioned {
        namespace: String,
        parent: String,
        child: String,
        phase: EvaluationPhase,
        at: DateTime<Utc>,
    },
}

/// Why the selector strategy picked a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionReason {
    ExactMatch,
    FallbackNoMatch,
}

impl std::fmt::Display for SelectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SelectionReason::ExactMatch => "exact_match",
            SelectionReason::FallbackNoMatch => "fallback_no_match",
        };
        write!(f, "{}", s)
    }
}
