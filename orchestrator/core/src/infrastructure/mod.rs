// Copyright (c) 2026 Helmsman Authors
// SPDX-License-Identifier: AGPL-3.0

pub mod evaluator_client;
pub mod event_bus;
pub mod model_client;
pub mod session_events;
pub mod store;
pub mod template;
pub mod tool_runner;
pub mod value_resolver;
