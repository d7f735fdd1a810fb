#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use taskhive::libs::config::Config;
    use taskhive::libs::error::ErrorKind;
    use taskhive::libs::events::EventKind;
    use taskhive::libs::task::{Task, TaskType};
    use taskhive::services::tasks::DeleteStrategy;
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
    fn test_cascade_delete_removes_subtree(ctx: &mut CoreTestContext) {
        // S1: create parent/child, cascade-delete the parent
        ctx.core.tasks.create_task(Task::draft("proj", "proj", TaskType::Group)).unwrap();
        ctx.core.tasks.create_task(Task::draft("proj/api", "API", TaskType::Milestone)).unwrap();
        ctx.core.tasks.create_task(Task::draft("proj/api/login", "Login", TaskType::Task)).unwrap();

        let result = ctx.core.tasks.delete_task("proj/api", DeleteStrategy::Cascade).unwrap();
        assert_eq!(result.deleted, vec!["proj/api/login".to_string(), "proj/api".to_string()]);

        assert_eq!(ctx.core.tasks.get_task("proj/api").unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(ctx.core.tasks.get_task("proj/api/login").unwrap_err().kind(), ErrorKind::NotFound);

        let deletions = ctx
            .core
            .bus
            .recent(100)
            .iter()
            .filter(|e| e.kind == EventKind::TaskDeleted)
            .count();
        assert_eq!(deletions, 2);
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_block_delete_fails_on_children(ctx: &mut CoreTestContext) {
        ctx.core.tasks.create_task(Task::draft("proj", "proj", TaskType::Group)).unwrap();
        ctx.core.tasks.create_task(Task::draft("proj/api", "API", TaskType::Task)).unwrap();

        let err = ctx.core.tasks.delete_task("proj", DeleteStrategy::Block).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HasChildren);

        // still there
        assert!(ctx.core.tasks.get_task("proj").is_ok());
        assert!(ctx.core.tasks.get_task("proj/api").is_ok());
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_missing_parent_rejected(ctx: &mut CoreTestContext) {
        let err = ctx.core.tasks.create_task(Task::draft("ghost/child", "child", TaskType::Task)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_subtasks_reflect_children(ctx: &mut CoreTestContext) {
        ctx.core.tasks.create_task(Task::draft("proj", "proj", TaskType::Group)).unwrap();
        ctx.core.tasks.create_task(Task::draft("proj/a", "a", TaskType::Task)).unwrap();
        ctx.core.tasks.create_task(Task::draft("proj/b", "b", TaskType::Task)).unwrap();

        let parent = ctx.core.tasks.get_task("proj").unwrap();
        assert_eq!(parent.subtasks, vec!["proj/a".to_string(), "proj/b".to_string()]);
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_move_task_rewrites_subtree(ctx: &mut CoreTestContext) {
        ctx.core.tasks.create_task(Task::draft("alpha", "alpha", TaskType::Group)).unwrap();
        ctx.core.tasks.create_task(Task::draft("beta", "beta", TaskType::Group)).unwrap();
        ctx.core.tasks.create_task(Task::draft("alpha/web", "web", TaskType::Group)).unwrap();
        ctx.core.tasks.create_task(Task::draft("alpha/web/ui", "ui", TaskType::Task)).unwrap();

        let moved = ctx.core.tasks.move_task("alpha/web", Some("beta")).unwrap();
        assert_eq!(moved.path, "beta/web");

        let child = ctx.core.tasks.get_task("beta/web/ui").unwrap();
        assert_eq!(child.parent_path.as_deref(), Some("beta/web"));
        assert_eq!(ctx.core.tasks.get_task("alpha/web").unwrap_err().kind(), ErrorKind::NotFound);

        // old parent no longer lists the moved subtree
        let alpha = ctx.core.tasks.get_task("alpha").unwrap();
        assert!(alpha.subtasks.is_empty());
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_move_under_own_subtree_rejected(ctx: &mut CoreTestContext) {
        ctx.core.tasks.create_task(Task::draft("a", "a", TaskType::Group)).unwrap();
        ctx.core.tasks.create_task(Task::draft("a/b", "b", TaskType::Group)).unwrap();

        let err = ctx.core.tasks.move_task("a", Some("a/b")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }
}
