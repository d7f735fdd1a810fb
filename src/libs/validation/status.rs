//! Status transition validation.
//!
//! Enforces the transition table, blocks COMPLETED while any dependency is
//! unfinished, and restricts reopening a COMPLETED task to the case where
//! no dependent has itself completed on top of it.

use super::{Candidate, ValidationRule, ValidationView};
use crate::libs::error::ValidationIssue;
use crate::libs::task::TaskStatus;

pub struct StatusRule;

const RULE: &str = "status";

impl ValidationRule for StatusRule {
    fn name(&self) -> &'static str {
        RULE
    }

    fn validate(&self, view: &dyn ValidationView, candidate: &Candidate<'_>) -> Vec<ValidationIssue> {
        let task = candidate.task;
        let mut issues = Vec::new();

        let from = match candidate.previous {
            Some(previous) => previous.status,
            // Creation: any non-terminal initial status is accepted.
            None => {
                if task.status == TaskStatus::Completed {
                    issues.extend(self.check_dependencies_completed(view, candidate));
                }
                return issues;
            }
        };
        let to = task.status;

        if from == to {
            return issues;
        }

        let reopen = from == TaskStatus::Completed && to == TaskStatus::Pending;
        if reopen {
            let completed_dependents: Vec<String> = view
                .dependents_of(&task.path)
                .into_iter()
                .filter(|d| view.get(d).map(|t| t.status == TaskStatus::Completed).unwrap_or(false))
                .collect();
            if !completed_dependents.is_empty() {
                issues.push(
                    ValidationIssue::new(
                        RULE,
                        "reopen_blocked",
                        format!("cannot reopen, completed dependents exist: {completed_dependents:?}"),
                    )
                    .at(&task.path)
                    .with_value(serde_json::json!(completed_dependents))
                    .structural(),
                );
            }
        } else if !from.can_transition_to(to) {
            issues.push(
                ValidationIssue::new(RULE, "invalid_transition", format!("invalid status transition: {from} -> {to}"))
                    .at(&task.path)
                    .with_value(serde_json::json!({ "from": from, "to": to }))
                    .structural(),
            );
        }

        if to == TaskStatus::Completed {
            issues.extend(self.check_dependencies_completed(view, candidate));
        }

        issues
    }
}

impl StatusRule {
    fn check_dependencies_completed(&self, view: &dyn ValidationView, candidate: &Candidate<'_>) -> Vec<ValidationIssue> {
        let task = candidate.task;
        let unmet: Vec<String> = task
            .dependencies
            .iter()
            .filter(|dep| view.get(dep).map(|t| t.status != TaskStatus::Completed).unwrap_or(true))
            .cloned()
            .collect();

        if unmet.is_empty() {
            Vec::new()
        } else {
            vec![
                ValidationIssue::new(RULE, "dependencies_not_met", format!("unfinished dependencies: {unmet:?}"))
                    .at(&task.path)
                    .with_value(serde_json::json!({ "unmet": unmet }))
                    .structural(),
            ]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::task::{path, Task, TaskType};
    use crate::libs::validation::ValidationView;

    struct Graph {
        tasks: Vec<Task>,
    }

    impl ValidationView for Graph {
        fn get(&self, key: &str) -> Option<Task> {
            self.tasks.iter().find(|t| path::normalize(&t.path) == path::normalize(key)).cloned()
        }

        fn children_of(&self, _parent_path: &str) -> Vec<String> {
            Vec::new()
        }

        fn dependents_of(&self, key: &str) -> Vec<String> {
            self.tasks
                .iter()
                .filter(|t| t.dependencies.iter().any(|d| path::normalize(d) == path::normalize(key)))
                .map(|t| t.path.clone())
                .collect()
        }
    }

    fn task_with_status(path: &str, status: TaskStatus) -> Task {
        let mut task = Task::draft(path, path, TaskType::Task);
        task.status = status;
        task
    }

    #[test]
    fn completion_blocked_by_pending_dependency() {
        let dep = task_with_status("a", TaskStatus::Pending);
        let view = Graph { tasks: vec![dep] };

        let previous = {
            let mut t = task_with_status("b", TaskStatus::InProgress);
            t.dependencies = vec!["a".to_string()];
            t
        };
        let mut next = previous.clone();
        next.status = TaskStatus::Completed;

        let issues = StatusRule.validate(
            &view,
            &Candidate {
                task: &next,
                previous: Some(&previous),
            },
        );
        assert!(issues.iter().any(|i| i.kind == "dependencies_not_met"));
    }

    #[test]
    fn invalid_jump_rejected() {
        let view = Graph { tasks: vec![] };
        let previous = task_with_status("t", TaskStatus::Pending);
        let mut next = previous.clone();
        next.status = TaskStatus::Completed;

        let issues = StatusRule.validate(
            &view,
            &Candidate {
                task: &next,
                previous: Some(&previous),
            },
        );
        assert!(issues.iter().any(|i| i.kind == "invalid_transition"));
    }

    #[test]
    fn reopen_allowed_without_completed_dependents() {
        let view = Graph { tasks: vec![] };
        let previous = task_with_status("t", TaskStatus::Completed);
        let mut next = previous.clone();
        next.status = TaskStatus::Pending;

        let issues = StatusRule.validate(
            &view,
            &Candidate {
                task: &next,
                previous: Some(&previous),
            },
        );
        assert!(issues.is_empty());
    }

    #[test]
    fn reopen_blocked_by_completed_dependent() {
        let mut dependent = task_with_status("consumer", TaskStatus::Completed);
        dependent.dependencies = vec!["t".to_string()];
        let view = Graph { tasks: vec![dependent] };

        let previous = task_with_status("t", TaskStatus::Completed);
        let mut next = previous.clone();
        next.status = TaskStatus::Pending;

        let issues = StatusRule.validate(
            &view,
            &Candidate {
                task: &next,
                previous: Some(&previous),
            },
        );
        assert!(issues.iter().any(|i| i.kind == "reopen_blocked"));
    }
}
