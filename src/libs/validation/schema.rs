//! Field-level schema validation: lengths, enumerations, path syntax,
//! metadata bag bounds.

use super::{Candidate, ValidationRule, ValidationView};
use crate::libs::error::ValidationIssue;
use crate::libs::task::{self, MetaValue};

pub struct SchemaRule;

const RULE: &str = "schema";

impl ValidationRule for SchemaRule {
    fn name(&self) -> &'static str {
        RULE
    }

    fn validate(&self, _view: &dyn ValidationView, candidate: &Candidate<'_>) -> Vec<ValidationIssue> {
        let task = candidate.task;
        let mut issues = Vec::new();

        if !task::path::is_valid(&task.path) {
            issues.push(
                ValidationIssue::new(RULE, "bad_path", format!("invalid task path: {:?}", task.path))
                    .at(&task.path)
                    .with_value(serde_json::json!(task.path))
                    .structural(),
            );
        }

        if task.name.is_empty() {
            issues.push(ValidationIssue::new(RULE, "empty_name", "task name must not be empty").at(&task.path).structural());
        }
        if task.name.chars().count() > task::MAX_NAME_LEN {
            issues.push(
                ValidationIssue::new(RULE, "name_too_long", format!("name exceeds {} characters", task::MAX_NAME_LEN)).at(&task.path),
            );
        }
        if task.description.chars().count() > task::MAX_DESCRIPTION_LEN {
            issues.push(
                ValidationIssue::new(
                    RULE,
                    "description_too_long",
                    format!("description exceeds {} characters", task::MAX_DESCRIPTION_LEN),
                )
                .at(&task.path),
            );
        }
        if task.reasoning.chars().count() > task::MAX_REASONING_LEN {
            issues.push(
                ValidationIssue::new(RULE, "reasoning_too_long", format!("reasoning exceeds {} characters", task::MAX_REASONING_LEN))
                    .at(&task.path),
            );
        }

        if task.tags.len() > task::MAX_TAGS {
            issues.push(
                ValidationIssue::new(RULE, "too_many_tags", format!("more than {} tags", task::MAX_TAGS))
                    .at(&task.path)
                    .with_value(serde_json::json!(task.tags.len())),
            );
        }

        if task.notes.len() > task::MAX_NOTES {
            issues.push(
                ValidationIssue::new(RULE, "too_many_notes", format!("more than {} notes", task::MAX_NOTES))
                    .at(&task.path)
                    .with_value(serde_json::json!(task.notes.len())),
            );
        }
        for note in &task.notes {
            if note.content.chars().count() > task::MAX_NOTE_LEN {
                issues.push(
                    ValidationIssue::new(RULE, "note_too_long", format!("note exceeds {} characters", task::MAX_NOTE_LEN)).at(&task.path),
                );
            }
        }

        if metadata_key_count(&task.metadata) > task::MAX_METADATA_KEYS {
            issues.push(
                ValidationIssue::new(RULE, "metadata_too_large", format!("more than {} metadata keys", task::MAX_METADATA_KEYS))
                    .at(&task.path),
            );
        }

        issues
    }
}

/// Counts keys recursively; nested object keys consume the same budget.
fn metadata_key_count(bag: &task::MetadataBag) -> usize {
    fn count_value(value: &MetaValue) -> usize {
        match value {
            MetaValue::Object(map) => map.len() + map.values().map(count_value).sum::<usize>(),
            MetaValue::Array(items) => items.iter().map(count_value).sum(),
            _ => 0,
        }
    }
    bag.len() + bag.values().map(count_value).sum::<usize>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::task::{Task, TaskType};
    use crate::libs::validation::EmptyView;

    fn issues_for(task: &Task) -> Vec<ValidationIssue> {
        SchemaRule.validate(
            &EmptyView,
            &Candidate { task, previous: None },
        )
    }

    #[test]
    fn accepts_plain_task() {
        let task = Task::draft("proj/api", "API", TaskType::Milestone);
        assert!(issues_for(&task).is_empty());
    }

    #[test]
    fn rejects_deep_path() {
        let task = Task::draft("a/b/c/d/e/f", "deep", TaskType::Task);
        let issues = issues_for(&task);
        assert!(issues.iter().any(|i| i.kind == "bad_path" && i.structural));
    }

    #[test]
    fn rejects_oversized_fields() {
        let mut task = Task::draft("proj/big", "big", TaskType::Task);
        task.name = "x".repeat(201);
        task.description = "d".repeat(2001);
        let issues = issues_for(&task);
        assert!(issues.iter().any(|i| i.kind == "name_too_long"));
        assert!(issues.iter().any(|i| i.kind == "description_too_long"));
        // length overflows are tolerated in lenient mode
        assert!(issues.iter().all(|i| !i.structural));
    }

    #[test]
    fn flags_metadata_budget() {
        let mut task = Task::draft("proj/meta", "meta", TaskType::Task);
        for i in 0..51 {
            task.metadata.insert(format!("k{i}"), MetaValue::Bool(true));
        }
        let issues = issues_for(&task);
        assert!(issues.iter().any(|i| i.kind == "metadata_too_large"));
    }
}
