#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use taskhive::libs::config::Config;
    use taskhive::libs::error::{CoreError, ErrorKind};
    use taskhive::libs::task::{Pagination, Task, TaskFilter, TaskPatch, TaskType};
    use taskhive::services::CoreContext;
    use tempfile::TempDir;
    use test_context::{test_context, TestContext};

    struct CoreTestContext {
        _temp_dir: TempDir,
        core: Arc<CoreContext>,
    }

    impl TestContext for CoreTestContext {
        fn setup() -> Self {
            let temp_dir = tempfile::tempdir().unwrap();
            let mut config = Config::default();
            config.storage.base_dir = Some(temp_dir.path().to_string_lossy().to_string());
            let core = CoreContext::build(config).unwrap();
            CoreTestContext { _temp_dir: temp_dir, core }
        }
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_create_and_get(ctx: &mut CoreTestContext) {
        let created = ctx.core.tasks.create_task(Task::draft("proj/api", "API", TaskType::Milestone)).unwrap();
        assert!(created.id.starts_with("task_"));
        assert_eq!(created.version, 1);
        assert_eq!(created.parent_path.as_deref(), Some("proj"));
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_case_insensitive_match_preserves_case(ctx: &mut CoreTestContext) {
        ctx.core.tasks.create_task(Task::draft("Proj/Api", "API", TaskType::Task)).unwrap();

        let fetched = ctx.core.tasks.get_task("proj/api").unwrap();
        assert_eq!(fetched.path, "Proj/Api");

        let by_id = ctx.core.tasks.get_task(&fetched.id).unwrap();
        assert_eq!(by_id.path, "Proj/Api");
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_duplicate_path_rejected(ctx: &mut CoreTestContext) {
        ctx.core.tasks.create_task(Task::draft("proj", "proj", TaskType::Group)).unwrap();
        let err = ctx.core.tasks.create_task(Task::draft("proj", "again", TaskType::Task)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Duplicate);
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_duplicate_sibling_name_rejected(ctx: &mut CoreTestContext) {
        ctx.core.tasks.create_task(Task::draft("proj", "proj", TaskType::Group)).unwrap();
        ctx.core.tasks.create_task(Task::draft("proj/login", "Login", TaskType::Task)).unwrap();

        let mut sibling = Task::draft("proj/signin", "login", TaskType::Task);
        sibling.name = "LOGIN".to_string();
        let err = ctx.core.tasks.create_task(sibling).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Duplicate);
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_update_increments_version(ctx: &mut CoreTestContext) {
        ctx.core.tasks.create_task(Task::draft("proj/api", "API", TaskType::Milestone)).unwrap();

        let patch = TaskPatch {
            name: Some("API v2".to_string()),
            ..TaskPatch::default()
        };
        let updated = ctx.core.tasks.update_task("proj/api", &patch).unwrap();
        assert_eq!(updated.name, "API v2");
        assert_eq!(updated.version, 2);

        let fetched = ctx.core.tasks.get_task("proj/api").unwrap();
        assert_eq!(fetched.name, "API v2");
        assert_eq!(fetched.version, 2);
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_missing_task_is_not_found(ctx: &mut CoreTestContext) {
        let err = ctx.core.tasks.get_task("no/such").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = ctx.core.tasks.update_task("no/such", &TaskPatch::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_query_pagination(ctx: &mut CoreTestContext) {
        for i in 0..25 {
            ctx.core
                .tasks
                .create_task(Task::draft(&format!("item{i:02}"), &format!("item {i}"), TaskType::Task))
                .unwrap();
        }

        let page = ctx.core.tasks.query_tasks(&TaskFilter::default(), Pagination::default()).unwrap();
        assert_eq!(page.items.len(), 20);
        assert_eq!(page.total, 25);
        assert_eq!(page.limit, 20);
        assert_eq!(page.total_pages, 2);

        let second = ctx
            .core
            .tasks
            .query_tasks(&TaskFilter::default(), Pagination { offset: 20, limit: 20 })
            .unwrap();
        assert_eq!(second.items.len(), 5);
        assert_eq!(second.page, 2);

        // limit ceiling is 100
        let clamped = ctx
            .core
            .tasks
            .query_tasks(&TaskFilter::default(), Pagination { offset: 0, limit: 5000 })
            .unwrap();
        assert_eq!(clamped.limit, 100);
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_query_by_pattern(ctx: &mut CoreTestContext) {
        ctx.core.tasks.create_task(Task::draft("proj", "proj", TaskType::Group)).unwrap();
        ctx.core.tasks.create_task(Task::draft("proj/api", "api", TaskType::Task)).unwrap();
        ctx.core.tasks.create_task(Task::draft("proj/db", "db", TaskType::Task)).unwrap();
        ctx.core.tasks.create_task(Task::draft("other", "other", TaskType::Task)).unwrap();

        let filter = TaskFilter {
            path_pattern: Some("proj/*".to_string()),
            ..TaskFilter::default()
        };
        let page = ctx.core.tasks.query_tasks(&filter, Pagination::default()).unwrap();
        let paths: Vec<&str> = page.items.iter().map(|t| t.path.as_str()).collect();
        assert_eq!(paths, vec!["proj/api", "proj/db"]);
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_add_note_bounds(ctx: &mut CoreTestContext) {
        use taskhive::libs::task::NoteCategory;

        ctx.core.tasks.create_task(Task::draft("proj", "proj", TaskType::Task)).unwrap();
        let task = ctx.core.tasks.add_note("proj", NoteCategory::Planning, "first note").unwrap();
        assert_eq!(task.notes.len(), 1);
        assert_eq!(task.version, 2);

        let long = "x".repeat(1001);
        let err = ctx.core.tasks.add_note("proj", NoteCategory::Progress, &long).unwrap_err();
        assert!(matches!(err, CoreError::LimitExceeded { .. }));
    }
}
