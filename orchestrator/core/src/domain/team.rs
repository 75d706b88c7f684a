// Copyright (c) 2026 Helmsman Authors
// SPDX-License-Identifier: AGPL-3.0
//! Team aggregate
//!
//! A Team is a named collaboration unit: an ordered member list plus the
//! strategy that governs turn order among them. Teams are read-only during
//! query execution; the strategy engine never mutates them.
//!
//! # Invariants
//!
//! - `graph` is required and non-empty iff `strategy = Graph`
//! - Every graph edge references a declared member

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

use crate::domain::resource::{ObjectMeta, ResourceKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub metadata: ObjectMeta,
    pub spec: TeamSpec,
}

impl Team {
    /// Construct with invariant validation.
    pub fn new(metadata: ObjectMeta, spec: TeamSpec) -> Result<Self, TeamError> {
        spec.validate()?;
        Ok(Self { metadata, spec })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TeamSpec {
    /// Ordered member list; order is the declared turn order.
    #[serde(default)]
    pub members: Vec<TeamMember>,
    #[serde(default)]
    pub strategy: TeamStrategy,
    /// Turn cap; round-robin without a cap only stops on an explicit signal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    /// Custom prompt template for the selector strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector_prompt: Option<String>,
    /// Directed edges driving the graph strategy.
    #[serde(default)]
    pub graph: Vec<GraphEdge>,
}

impl TeamSpec {
    pub fn validate(&self) -> Result<(), TeamError> {
        let names: HashSet<&str> = self.members.iter().map(|m| m.name.as_str()).collect();
        if names.len() != self.members.len() {
            return Err(TeamError::DuplicateMember);
        }
        match self.strategy {
            TeamStrategy::Graph => {
                if self.graph.is_empty() {
                    return Err(TeamError::GraphRequired);
                }
            }
            _ => {
                if !self.graph.is_empty() {
                    return Err(TeamError::GraphNotAllowed);
                }
            }
        }
        for edge in &self.graph {
            for endpoint in [&edge.from, &edge.to] {
                if !names.contains(endpoint.as_str()) {
                    return Err(TeamError::UnknownEdgeMember(endpoint.clone()));
                }
            }
        }
        Ok(())
    }

    pub fn member(&self, name: &str) -> Option<&TeamMember> {
        self.members.iter().find(|m| m.name == name)
    }
}

/// A team member: an Agent, or a nested Team.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamMember {
    #[serde(rename = "type")]
    pub kind: ResourceKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TeamMember {
    pub fn agent(name: impl Into<String>) -> Self {
        Self { kind: ResourceKind::Agent, name: name.into(), description: None }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TeamStrategy {
    Sequential,
    RoundRobin,
    Graph,
    Selector,
}

impl Default for TeamStrategy {
    fn default() -> Self {
        TeamStrategy::Sequential
    }
}

/// A directed `from -> to` execution-order edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
}

impl GraphEdge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self { from: from.into(), to: to.into() }
    }
}

#[derive(Debug, Error)]
pub enum TeamError {
    #[error("team declares the same member more than once")]
    DuplicateMember,
    #[error("graph strategy requires a non-empty edge set")]
    GraphRequired,
    #[error("graph edges are only valid with the graph strategy")]
    GraphNotAllowed,
    #[error("graph edge references undeclared member '{0}'")]
    UnknownEdgeMember(String),
    #[error("team has no members")]
    NoMembers,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_member_spec(strategy: TeamStrategy) -> TeamSpec {
        TeamSpec {
            members: vec![TeamMember::agent("writer"), TeamMember::agent("critic")],
            strategy,
            ..Default::default()
        }
    }

    #[test]
    fn graph_strategy_requires_edges() {
        let spec = two_member_spec(TeamStrategy::Graph);
        assert!(matches!(spec.validate(), Err(TeamError::GraphRequired)));
    }

    #[test]
    fn edges_must_reference_declared_members() {
        let mut spec = two_member_spec(TeamStrategy::Graph);
        spec.graph = vec![GraphEdge::new("writer", "ghost")];
        assert!(matches!(spec.validate(), Err(TeamError::UnknownEdgeMember(name)) if name == "ghost"));
    }

    #[test]
    fn edges_forbidden_outside_graph_strategy() {
        let mut spec = two_member_spec(TeamStrategy::Sequential);
        spec.graph = vec![GraphEdge::new("writer", "critic")];
        assert!(matches!(spec.validate(), Err(TeamError::GraphNotAllowed)));
    }

    #[test]
    fn valid_graph_spec() {
        let mut spec = two_member_spec(TeamStrategy::Graph);
        spec.graph = vec![GraphEdge::new("writer", "critic")];
        assert!(spec.validate().is_ok());
    }
}
