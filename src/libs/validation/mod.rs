//! Pluggable validation pipeline for task mutations.
//!
//! Rules are independently addressable by name and executed in registration
//! order. The standard pipeline registers, in order: schema, hierarchy,
//! dependency, status, relationship. Registration happens once at startup;
//! `add_rule`/`remove_rule` exist for embedders but are gated by a
//! capability flag in the service configuration.
//!
//! ## Modes
//!
//! - **Strict**: any issue fails the pipeline.
//! - **Lenient**: non-structural issues (lengths, bag sizes) are collected
//!   as warnings; structural issues (hierarchy, cycles, transitions) still
//!   fail.
//!
//! Every issue carries `{kind, message, path, value, rule}` and the
//! aggregate report groups issue counts by rule.

pub mod dependency;
pub mod hierarchy;
pub mod relationship;
pub mod schema;
pub mod status;

use crate::libs::error::{CoreError, Result, ValidationIssue};
use crate::libs::task::Task;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Read-only view of the committed task graph used by the rules. The
/// services back it with the store plus secondary indexes; batch execution
/// layers pending in-batch entities on top.
pub trait ValidationView {
    /// Lookup by canonical path (match is case-insensitive) or minted id.
    fn get(&self, key: &str) -> Option<Task>;
    /// Ordered child paths of a parent.
    fn children_of(&self, parent_path: &str) -> Vec<String>;
    /// Paths of tasks whose dependencies reference `key`.
    fn dependents_of(&self, key: &str) -> Vec<String>;
}

/// Validation strictness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Strict,
    Lenient,
}

impl Mode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "strict" => Some(Mode::Strict),
            "lenient" => Some(Mode::Lenient),
            _ => None,
        }
    }
}

/// The task state being validated: `task` is the post-change state,
/// `previous` the committed state for updates (absent on create).
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub task: &'a Task,
    pub previous: Option<&'a Task>,
}

/// A single validation rule.
pub trait ValidationRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn validate(&self, view: &dyn ValidationView, candidate: &Candidate<'_>) -> Vec<ValidationIssue>;
}

/// Aggregate result of a pipeline run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Report {
    /// Issues that failed the run (all issues in strict mode, structural
    /// issues in lenient mode).
    pub issues: Vec<ValidationIssue>,
    /// Non-structural issues tolerated in lenient mode.
    pub warnings: Vec<ValidationIssue>,
    /// Issue counts grouped by producing rule.
    pub by_rule: BTreeMap<String, usize>,
}

impl Report {
    pub fn passed(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Ordered rule pipeline.
pub struct Pipeline {
    rules: Vec<Box<dyn ValidationRule>>,
    allow_mutation: bool,
}

impl Pipeline {
    /// The standard five-rule pipeline in canonical order.
    pub fn standard(allow_mutation: bool) -> Self {
        Self {
            rules: vec![
                Box::new(schema::SchemaRule),
                Box::new(hierarchy::HierarchyRule),
                Box::new(dependency::DependencyRule),
                Box::new(status::StatusRule),
                Box::new(relationship::RelationshipRule),
            ],
            allow_mutation,
        }
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Appends a rule. Fails unless runtime rule mutation was enabled in
    /// the service configuration.
    pub fn add_rule(&mut self, rule: Box<dyn ValidationRule>) -> Result<()> {
        if !self.allow_mutation {
            return Err(CoreError::Conflict {
                message: "runtime rule mutation is disabled".to_string(),
            });
        }
        if self.rules.iter().any(|r| r.name() == rule.name()) {
            return Err(CoreError::Conflict {
                message: format!("rule already registered: {}", rule.name()),
            });
        }
        self.rules.push(rule);
        Ok(())
    }

    /// Removes a rule by name. Fails unless runtime rule mutation was
    /// enabled in the service configuration.
    pub fn remove_rule(&mut self, name: &str) -> Result<()> {
        if !self.allow_mutation {
            return Err(CoreError::Conflict {
                message: "runtime rule mutation is disabled".to_string(),
            });
        }
        let before = self.rules.len();
        self.rules.retain(|r| r.name() != name);
        if self.rules.len() == before {
            return Err(CoreError::NotFound { key: name.to_string() });
        }
        Ok(())
    }

    /// Runs every rule in registration order and aggregates the outcome.
    pub fn run(&self, view: &dyn ValidationView, candidate: &Candidate<'_>, mode: Mode) -> Report {
        let mut report = Report::default();

        for rule in &self.rules {
            for issue in rule.validate(view, candidate) {
                *report.by_rule.entry(issue.rule.clone()).or_default() += 1;
                if mode == Mode::Strict || issue.structural {
                    report.issues.push(issue);
                } else {
                    report.warnings.push(issue);
                }
            }
        }

        report
    }

    /// Runs the pipeline and converts a failed report into a
    /// [`CoreError::Validation`].
    pub fn check(&self, view: &dyn ValidationView, candidate: &Candidate<'_>, mode: Mode) -> Result<Report> {
        let report = self.run(view, candidate, mode);
        if report.passed() {
            Ok(report)
        } else {
            Err(CoreError::Validation { issues: report.issues })
        }
    }
}

/// Empty view for validating roots in an empty store (tests, bootstrap).
pub struct EmptyView;

impl ValidationView for EmptyView {
    fn get(&self, _key: &str) -> Option<Task> {
        None
    }

    fn children_of(&self, _parent_path: &str) -> Vec<String> {
        Vec::new()
    }

    fn dependents_of(&self, _key: &str) -> Vec<String> {
        Vec::new()
    }
}
