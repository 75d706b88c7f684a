// Copyright (c) 2026 Helmsman Authors
// SPDX-License-Identifier: AGPL-3.0

pub mod agent;
pub mod evaluation;
pub mod evaluator;
pub mod events;
pub mod model;
pub mod query;
pub mod resource;
pub mod team;
pub mod tool;
pub mod value;
