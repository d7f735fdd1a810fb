//! Hierarchy validation: parent existence, depth, sibling name uniqueness.

use super::{Candidate, ValidationRule, ValidationView};
use crate::libs::error::ValidationIssue;
use crate::libs::task::{self, path};

pub struct HierarchyRule;

const RULE: &str = "hierarchy";

impl ValidationRule for HierarchyRule {
    fn name(&self) -> &'static str {
        RULE
    }

    fn validate(&self, view: &dyn ValidationView, candidate: &Candidate<'_>) -> Vec<ValidationIssue> {
        let task = candidate.task;
        let mut issues = Vec::new();

        // parent_path must agree with the path itself
        let derived_parent = path::parent(&task.path).map(|p| p.to_string());
        if task.parent_path != derived_parent {
            issues.push(
                ValidationIssue::new(
                    RULE,
                    "parent_mismatch",
                    format!("parentPath {:?} does not match path {:?}", task.parent_path, task.path),
                )
                .at(&task.path)
                .structural(),
            );
        }

        if path::depth(&task.path) > task::MAX_PATH_DEPTH {
            issues.push(
                ValidationIssue::new(RULE, "too_deep", format!("path deeper than {} levels", task::MAX_PATH_DEPTH))
                    .at(&task.path)
                    .structural(),
            );
        }

        if let Some(parent_path) = &task.parent_path {
            match view.get(parent_path) {
                None => {
                    issues.push(
                        ValidationIssue::new(RULE, "missing_parent", format!("parent does not exist: {parent_path}"))
                            .at(parent_path.clone())
                            .structural(),
                    );
                }
                Some(_) => {
                    // sibling name uniqueness (case-insensitive)
                    let name_key = task.name.to_ascii_lowercase();
                    for sibling_path in view.children_of(parent_path) {
                        if path::normalize(&sibling_path) == path::normalize(&task.path) {
                            continue;
                        }
                        if let Some(sibling) = view.get(&sibling_path) {
                            if sibling.name.to_ascii_lowercase() == name_key {
                                issues.push(
                                    ValidationIssue::new(RULE, "duplicate_name", format!("sibling with the same name: {sibling_path}"))
                                        .at(&task.path)
                                        .with_value(serde_json::json!(sibling_path))
                                        .structural(),
                                );
                            }
                        }
                    }
                }
            }
        }

        issues
    }
}
