//! Dependency validation: referenced tasks exist, the dependency graph
//! stays acyclic, and the per-task dependency budget holds.
//!
//! Cycle detection is a depth-first walk with white/gray/black coloring
//! over the committed graph with the candidate's edge set substituted in.

use super::{Candidate, ValidationRule, ValidationView};
use crate::libs::error::ValidationIssue;
use crate::libs::task::{self, path};
use std::collections::HashMap;

pub struct DependencyRule;

const RULE: &str = "dependency";

#[derive(Clone, Copy, PartialEq)]
enum Color {
    Gray,
    Black,
}

impl ValidationRule for DependencyRule {
    fn name(&self) -> &'static str {
        RULE
    }

    fn validate(&self, view: &dyn ValidationView, candidate: &Candidate<'_>) -> Vec<ValidationIssue> {
        let task = candidate.task;
        let mut issues = Vec::new();

        if task.dependencies.len() > task::MAX_DEPENDENCIES {
            issues.push(
                ValidationIssue::new(RULE, "too_many_dependencies", format!("more than {} dependencies", task::MAX_DEPENDENCIES))
                    .at(&task.path)
                    .with_value(serde_json::json!(task.dependencies.len()))
                    .structural(),
            );
        }

        for dep in &task.dependencies {
            if path::normalize(dep) == path::normalize(&task.path) {
                issues.push(
                    ValidationIssue::new(RULE, "self_dependency", "task depends on itself")
                        .at(&task.path)
                        .structural(),
                );
                continue;
            }
            if view.get(dep).is_none() {
                issues.push(
                    ValidationIssue::new(RULE, "missing_dependency", format!("dependency does not exist: {dep}"))
                        .at(&task.path)
                        .with_value(serde_json::json!(dep))
                        .structural(),
                );
            }
        }

        if let Some(cycle) = find_cycle(view, task) {
            issues.push(
                ValidationIssue::new(RULE, "dependency_cycle", format!("dependency cycle: {}", cycle.join(" -> ")))
                    .at(&task.path)
                    .with_value(serde_json::json!(cycle))
                    .structural(),
            );
        }

        issues
    }
}

/// DFS over the graph rooted at the candidate. The candidate's own edges
/// replace whatever was committed for it, so an update that would close a
/// loop is caught before it lands. Returns the closed cycle
/// (`[a, b, a]`-shaped) when one exists.
fn find_cycle(view: &dyn ValidationView, candidate: &crate::libs::task::Task) -> Option<Vec<String>> {
    let root = path::normalize(&candidate.path);
    let mut colors: HashMap<String, Color> = HashMap::new();
    let mut stack: Vec<String> = Vec::new();

    fn edges_of(view: &dyn ValidationView, candidate: &crate::libs::task::Task, key: &str) -> Vec<String> {
        if key == path::normalize(&candidate.path) {
            return candidate.dependencies.iter().map(|d| path::normalize(d)).collect();
        }
        view.get(key).map(|t| t.dependencies.iter().map(|d| path::normalize(d)).collect()).unwrap_or_default()
    }

    fn visit(
        view: &dyn ValidationView,
        candidate: &crate::libs::task::Task,
        node: String,
        colors: &mut HashMap<String, Color>,
        stack: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        colors.insert(node.clone(), Color::Gray);
        stack.push(node.clone());

        for next in edges_of(view, candidate, &node) {
            match colors.get(&next) {
                Some(Color::Gray) => {
                    // close the loop at the first gray node on the stack
                    let start = stack.iter().position(|n| *n == next).unwrap_or(0);
                    let mut cycle: Vec<String> = stack[start..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Some(Color::Black) => {}
                None => {
                    if let Some(cycle) = visit(view, candidate, next, colors, stack) {
                        return Some(cycle);
                    }
                }
            }
        }

        stack.pop();
        colors.insert(node, Color::Black);
        None
    }

    visit(view, candidate, root, &mut colors, &mut stack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::task::{Task, TaskType};
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

        fn dependents_of(&self, _key: &str) -> Vec<String> {
            Vec::new()
        }
    }

    fn with_deps(path: &str, deps: &[&str]) -> Task {
        let mut task = Task::draft(path, path, TaskType::Task);
        task.dependencies = deps.iter().map(|d| d.to_string()).collect();
        task
    }

    #[test]
    fn missing_dependency_flagged() {
        let view = Graph { tasks: vec![] };
        let task = with_deps("a", &["ghost"]);
        let issues = DependencyRule.validate(&view, &Candidate { task: &task, previous: None });
        assert!(issues.iter().any(|i| i.kind == "missing_dependency"));
    }

    #[test]
    fn two_node_cycle_reported_with_members() {
        let view = Graph {
            tasks: vec![with_deps("b", &["a"])],
        };
        let task = with_deps("a", &["b"]);
        let issues = DependencyRule.validate(&view, &Candidate { task: &task, previous: None });
        let cycle_issue = issues.iter().find(|i| i.kind == "dependency_cycle").expect("cycle issue");
        let cycle: Vec<String> = serde_json::from_value(cycle_issue.value.clone().unwrap()).unwrap();
        assert_eq!(cycle, vec!["a", "b", "a"]);
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let view = Graph {
            tasks: vec![with_deps("b", &["d"]), with_deps("c", &["d"]), with_deps("d", &[])],
        };
        let task = with_deps("a", &["b", "c"]);
        let issues = DependencyRule.validate(&view, &Candidate { task: &task, previous: None });
        assert!(issues.is_empty());
    }

    #[test]
    fn dependency_budget_is_structural() {
        let deps: Vec<String> = (0..51).map(|i| format!("d{i}")).collect();
        let dep_refs: Vec<&str> = deps.iter().map(|s| s.as_str()).collect();
        let view = Graph {
            tasks: dep_refs.iter().map(|d| with_deps(d, &[])).collect(),
        };
        let task = with_deps("a", &dep_refs);
        let issues = DependencyRule.validate(&view, &Candidate { task: &task, previous: None });
        assert!(issues.iter().any(|i| i.kind == "too_many_dependencies" && i.structural));
    }
}
