// Copyright (c) 2026 Helmsman Authors
// SPDX-License-Identifier: AGPL-3.0
//! Helmsman core
//!
//! Query/team orchestration and evaluation engine for the Helmsman control
//! plane: declarative Agent/Team/Model/Tool/Query/Evaluation/Evaluator
//! records reconciled by state machines, with label-selector targeting,
//! team turn strategies, and batch evaluation fan-out.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Domain model, orchestration services, infrastructure seams

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
