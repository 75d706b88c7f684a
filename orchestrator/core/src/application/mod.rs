// Copyright (c) 2026 Helmsman Authors
// SPDX-License-Identifier: AGPL-3.0

pub mod auto_trigger;
pub mod evaluation_orchestrator;
pub mod query_orchestrator;
pub mod reconciler;
pub mod target_resolver;
pub mod team_engine;
