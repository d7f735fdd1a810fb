//! Relationship validation: bidirectional parent/child consistency.
//!
//! Verifies that the hierarchy projection agrees with the directed
//! `parentPath` edges: every child listed under the candidate actually
//! claims the candidate as its parent, and the candidate's declared
//! `subtasks` sequence (when populated) is a permutation of the actual
//! children. Catches index drift before it is written back.

use super::{Candidate, ValidationRule, ValidationView};
use crate::libs::error::ValidationIssue;
use crate::libs::task::path;
use std::collections::BTreeSet;

pub struct RelationshipRule;

const RULE: &str = "relationship";

impl ValidationRule for RelationshipRule {
    fn name(&self) -> &'static str {
        RULE
    }

    fn validate(&self, view: &dyn ValidationView, candidate: &Candidate<'_>) -> Vec<ValidationIssue> {
        let task = candidate.task;
        let mut issues = Vec::new();

        let children = view.children_of(&task.path);

        for child_path in &children {
            match view.get(child_path) {
                Some(child) => {
                    let claimed = child.parent_path.as_deref().map(path::normalize);
                    if claimed != Some(path::normalize(&task.path)) {
                        issues.push(
                            ValidationIssue::new(
                                RULE,
                                "child_parent_mismatch",
                                format!("indexed child {child_path} does not claim {} as parent", task.path),
                            )
                            .at(child_path.clone())
                            .structural(),
                        );
                    }
                }
                None => {
                    issues.push(
                        ValidationIssue::new(RULE, "dangling_child", format!("indexed child does not exist: {child_path}"))
                            .at(child_path.clone())
                            .structural(),
                    );
                }
            }
        }

        // subtasks, when present on the candidate, must be a permutation of
        // the actual children
        if !task.subtasks.is_empty() {
            let declared: BTreeSet<String> = task.subtasks.iter().map(|p| path::normalize(p)).collect();
            let actual: BTreeSet<String> = children.iter().map(|p| path::normalize(p)).collect();
            if declared != actual {
                issues.push(
                    ValidationIssue::new(RULE, "subtasks_mismatch", "subtasks is not a permutation of actual children")
                        .at(&task.path)
                        .with_value(serde_json::json!({
                            "declared": task.subtasks,
                            "actual": children,
                        }))
                        .structural(),
                );
            }
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::task::{Task, TaskType};
    use crate::libs::validation::ValidationView;

    struct Graph {
        tasks: Vec<Task>,
        children: Vec<String>,
    }

    impl ValidationView for Graph {
        fn get(&self, key: &str) -> Option<Task> {
            self.tasks.iter().find(|t| path::normalize(&t.path) == path::normalize(key)).cloned()
        }

        fn children_of(&self, _parent_path: &str) -> Vec<String> {
            self.children.clone()
        }

        fn dependents_of(&self, _key: &str) -> Vec<String> {
            Vec::new()
        }
    }

    #[test]
    fn consistent_parent_child_passes() {
        let child = Task::draft("proj/a", "a", TaskType::Task);
        let view = Graph {
            tasks: vec![child],
            children: vec!["proj/a".to_string()],
        };
        let mut parent = Task::draft("proj", "proj", TaskType::Group);
        parent.subtasks = vec!["proj/a".to_string()];

        let issues = RelationshipRule.validate(&view, &Candidate { task: &parent, previous: None });
        assert!(issues.is_empty());
    }

    #[test]
    fn drifted_subtasks_flagged() {
        let child = Task::draft("proj/a", "a", TaskType::Task);
        let view = Graph {
            tasks: vec![child],
            children: vec!["proj/a".to_string()],
        };
        let mut parent = Task::draft("proj", "proj", TaskType::Group);
        parent.subtasks = vec!["proj/a".to_string(), "proj/ghost".to_string()];

        let issues = RelationshipRule.validate(&view, &Candidate { task: &parent, previous: None });
        assert!(issues.iter().any(|i| i.kind == "subtasks_mismatch"));
    }

    #[test]
    fn child_claiming_other_parent_flagged() {
        let mut child = Task::draft("proj/a", "a", TaskType::Task);
        child.parent_path = Some("other".to_string());
        let view = Graph {
            tasks: vec![child],
            children: vec!["proj/a".to_string()],
        };
        let parent = Task::draft("proj", "proj", TaskType::Group);

        let issues = RelationshipRule.validate(&view, &Candidate { task: &parent, previous: None });
        assert!(issues.iter().any(|i| i.kind == "child_parent_mismatch"));
    }
}
