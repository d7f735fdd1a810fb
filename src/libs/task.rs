use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 2000;
pub const MAX_REASONING_LEN: usize = 2000;
pub const MAX_DEPENDENCIES: usize = 50;
pub const MAX_NOTES: usize = 25;
pub const MAX_NOTE_LEN: usize = 1000;
pub const MAX_TAGS: usize = 20;
pub const MAX_PATH_DEPTH: usize = 5;
pub const MAX_METADATA_KEYS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Task,
    Milestone,
    Group,
    Research,
    Generation,
    Analysis,
    Integration,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Task => "TASK",
            TaskType::Milestone => "MILESTONE",
            TaskType::Group => "GROUP",
            TaskType::Research => "RESEARCH",
            TaskType::Generation => "GENERATION",
            TaskType::Analysis => "ANALYSIS",
            TaskType::Integration => "INTEGRATION",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "TASK" => Some(TaskType::Task),
            "MILESTONE" => Some(TaskType::Milestone),
            "GROUP" => Some(TaskType::Group),
            "RESEARCH" => Some(TaskType::Research),
            "GENERATION" => Some(TaskType::Generation),
            "ANALYSIS" => Some(TaskType::Analysis),
            "INTEGRATION" => Some(TaskType::Integration),
            _ => None,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Backlog,
    Pending,
    Todo,
    InProgress,
    Completed,
    Blocked,
    Cancelled,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Backlog => "BACKLOG",
            TaskStatus::Pending => "PENDING",
            TaskStatus::Todo => "TODO",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Blocked => "BLOCKED",
            TaskStatus::Cancelled => "CANCELLED",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "BACKLOG" => Some(TaskStatus::Backlog),
            "PENDING" => Some(TaskStatus::Pending),
            "TODO" => Some(TaskStatus::Todo),
            "IN_PROGRESS" => Some(TaskStatus::InProgress),
            "COMPLETED" => Some(TaskStatus::Completed),
            "BLOCKED" => Some(TaskStatus::Blocked),
            "CANCELLED" => Some(TaskStatus::Cancelled),
            "FAILED" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::Failed)
    }

    // Reopen (COMPLETED -> PENDING) is handled separately by the status
    // rule because it depends on dependents.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;

        if *self == to {
            return true;
        }
        match self {
            Backlog => matches!(to, Pending | Todo | Cancelled),
            Todo => matches!(to, Pending | InProgress | Cancelled),
            Pending => matches!(to, InProgress | Blocked | Cancelled),
            InProgress => matches!(to, Completed | Blocked | Failed | Cancelled),
            Blocked => matches!(to, Pending | InProgress | Cancelled),
            Completed | Cancelled | Failed => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Priority::Low),
            "medium" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            "critical" => Some(Priority::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteCategory {
    Planning,
    Progress,
    Completion,
    Troubleshooting,
}

impl NoteCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoteCategory::Planning => "planning",
            NoteCategory::Progress => "progress",
            NoteCategory::Completion => "completion",
            NoteCategory::Troubleshooting => "troubleshooting",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "planning" => Some(NoteCategory::Planning),
            "progress" => Some(NoteCategory::Progress),
            "completion" => Some(NoteCategory::Completion),
            "troubleshooting" => Some(NoteCategory::Troubleshooting),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Note {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub category: NoteCategory,
    pub content: String,
    pub created_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<MetaValue>),
    Object(BTreeMap<String, MetaValue>),
}

pub type MetadataBag = BTreeMap<String, MetaValue>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub priority: Priority,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub subtasks: Vec<String>,
    #[serde(default)]
    pub notes: Vec<Note>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_requirements: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
    #[serde(default)]
    pub metadata: MetadataBag,
    pub created_ms: i64,
    pub updated_ms: i64,
    pub version: i64,
}

impl Task {
    pub fn draft(path: &str, name: &str, task_type: TaskType) -> Self {
        Task {
            id: String::new(),
            path: path.to_string(),
            parent_path: path::parent(path).map(|p| p.to_string()),
            project_id: None,
            name: name.to_string(),
            description: String::new(),
            task_type,
            status: TaskStatus::Pending,
            priority: Priority::Medium,
            dependencies: Vec::new(),
            subtasks: Vec::new(),
            notes: Vec::new(),
            reasoning: String::new(),
            links: Vec::new(),
            tags: Vec::new(),
            assigned_to: None,
            completion_requirements: None,
            output_format: None,
            metadata: MetadataBag::new(),
            created_ms: 0,
            updated_ms: 0,
            version: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub project_id: Option<String>,
    pub dependencies: Option<Vec<String>>,
    pub reasoning: Option<String>,
    pub links: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    pub assigned_to: Option<String>,
    pub completion_requirements: Option<String>,
    pub output_format: Option<String>,
    pub metadata: Option<MetadataBag>,
}

impl TaskPatch {
    pub fn apply_to(&self, task: &Task) -> Task {
        let mut next = task.clone();
        if let Some(name) = &self.name {
            next.name = name.clone();
        }
        if let Some(description) = &self.description {
            next.description = description.clone();
        }
        if let Some(status) = self.status {
            next.status = status;
        }
        if let Some(priority) = self.priority {
            next.priority = priority;
        }
        if let Some(project_id) = &self.project_id {
            next.project_id = Some(project_id.clone());
        }
        if let Some(dependencies) = &self.dependencies {
            next.dependencies = dependencies.clone();
        }
        if let Some(reasoning) = &self.reasoning {
            next.reasoning = reasoning.clone();
        }
        if let Some(links) = &self.links {
            next.links = links.clone();
        }
        if let Some(tags) = &self.tags {
            next.tags = tags.clone();
        }
        if let Some(assigned_to) = &self.assigned_to {
            next.assigned_to = Some(assigned_to.clone());
        }
        if let Some(completion_requirements) = &self.completion_requirements {
            next.completion_requirements = Some(completion_requirements.clone());
        }
        if let Some(output_format) = &self.output_format {
            next.output_format = Some(output_format.clone());
        }
        if let Some(metadata) = &self.metadata {
            next.metadata = metadata.clone();
        }
        next
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
    pub project_id: Option<String>,
    pub parent_path: Option<String>,
    pub tag: Option<String>,
    pub assigned_to: Option<String>,
    pub path_pattern: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pagination {
    pub offset: usize,
    pub limit: usize,
}

pub const DEFAULT_PAGE_LIMIT: usize = 20;
pub const MAX_PAGE_LIMIT: usize = 100;

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl Pagination {
    pub fn clamped(&self) -> Self {
        Self {
            offset: self.offset,
            limit: if self.limit == 0 {
                DEFAULT_PAGE_LIMIT
            } else {
                self.limit.min(MAX_PAGE_LIMIT)
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub limit: usize,
    pub total_pages: usize,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: usize, pagination: Pagination) -> Self {
        let pagination = pagination.clamped();
        Self {
            items,
            total,
            page: pagination.offset / pagination.limit + 1,
            limit: pagination.limit,
            total_pages: total.div_ceil(pagination.limit).max(1),
        }
    }
}

pub mod path {
    pub fn normalize(path: &str) -> String {
        path.to_ascii_lowercase()
    }

    pub fn depth(path: &str) -> usize {
        path.split('/').filter(|s| !s.is_empty()).count()
    }

    pub fn parent(path: &str) -> Option<&str> {
        path.rsplit_once('/').map(|(parent, _)| parent)
    }

    pub fn leaf(path: &str) -> &str {
        path.rsplit_once('/').map(|(_, leaf)| leaf).unwrap_or(path)
    }

    pub fn is_valid_segment(segment: &str) -> bool {
        !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-')
    }

    pub fn is_valid(path: &str) -> bool {
        let segments: Vec<&str> = path.split('/').collect();
        !segments.is_empty() && segments.len() <= super::MAX_PATH_DEPTH && segments.iter().all(|s| is_valid_segment(s))
    }

    pub fn glob_to_like(pattern: &str) -> String {
        let mut like = String::with_capacity(pattern.len() + 4);
        for ch in pattern.chars() {
            match ch {
                '*' => like.push('%'),
                '?' => like.push('_'),
                '%' => like.push_str("\\%"),
                '_' => like.push_str("\\_"),
                '\\' => like.push_str("\\\\"),
                other => like.push(other),
            }
        }
        like
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(Pending.can_transition_to(Blocked));
        assert!(InProgress.can_transition_to(Completed));
        assert!(Blocked.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(InProgress));
        assert!(!Failed.can_transition_to(Pending));
    }

    #[test]
    fn path_validity() {
        assert!(path::is_valid("proj/api/login"));
        assert!(path::is_valid("a.b_c-d"));
        assert!(!path::is_valid("a/b/c/d/e/f"));
        assert!(!path::is_valid("a//b"));
        assert!(!path::is_valid("a/b!"));
        assert_eq!(path::depth("a/b/c"), 3);
        assert_eq!(path::parent("a/b/c"), Some("a/b"));
        assert_eq!(path::parent("a"), None);
        assert_eq!(path::leaf("a/b/c"), "c");
    }

    #[test]
    fn glob_translation() {
        assert_eq!(path::glob_to_like("proj/*"), "proj/%");
        assert_eq!(path::glob_to_like("a?c"), "a_c");
        assert_eq!(path::glob_to_like("lit_eral"), "lit\\_eral");
    }

    #[test]
    fn page_math() {
        let page = Page::new(vec![1, 2, 3], 45, Pagination { offset: 20, limit: 20 });
        assert_eq!(page.page, 2);
        assert_eq!(page.total_pages, 3);
        let empty: Page<i32> = Page::new(vec![], 0, Pagination::default());
        assert_eq!(empty.total_pages, 1);
    }
}
