#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use taskhive::libs::config::Config;
    use taskhive::libs::task::{Task, TaskPatch, TaskType};
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
    fn test_update_invalidates_cached_read(ctx: &mut CoreTestContext) {
        // S5: miss, hit, update, miss with fresh value
        ctx.core.tasks.create_task(Task::draft("proj/api", "API", TaskType::Milestone)).unwrap();

        let first = ctx.core.tasks.get_task("proj/api").unwrap(); // miss
        assert_eq!(first.name, "API");
        let second = ctx.core.tasks.get_task("proj/api").unwrap(); // hit
        assert_eq!(second.name, "API");

        let patch = TaskPatch {
            name: Some("API v2".to_string()),
            ..TaskPatch::default()
        };
        ctx.core.tasks.update_task("proj/api", &patch).unwrap();

        let third = ctx.core.tasks.get_task("proj/api").unwrap(); // miss again
        assert_eq!(third.name, "API v2");

        let metrics = ctx.core.cache.metrics();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 2);
        assert!(metrics.invalidations >= 1);
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_cached_value_never_older_than_committed_version(ctx: &mut CoreTestContext) {
        ctx.core.tasks.create_task(Task::draft("t", "t", TaskType::Task)).unwrap();

        for round in 0..5 {
            let fetched = ctx.core.tasks.get_task("t").unwrap();
            assert_eq!(fetched.version, round + 1);

            let patch = TaskPatch {
                description: Some(format!("round {round}")),
                ..TaskPatch::default()
            };
            ctx.core.tasks.update_task("t", &patch).unwrap();
        }

        let last = ctx.core.tasks.get_task("t").unwrap();
        assert_eq!(last.version, 6);
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_delete_invalidates_parent_listing(ctx: &mut CoreTestContext) {
        use taskhive::services::tasks::DeleteStrategy;

        ctx.core.tasks.create_task(Task::draft("proj", "proj", TaskType::Group)).unwrap();
        ctx.core.tasks.create_task(Task::draft("proj/a", "a", TaskType::Task)).unwrap();

        // parent cached with its child listed
        let parent = ctx.core.tasks.get_task("proj").unwrap();
        assert_eq!(parent.subtasks.len(), 1);

        ctx.core.tasks.delete_task("proj/a", DeleteStrategy::Block).unwrap();

        // parent entry was invalidated by the child's deletion
        let parent = ctx.core.tasks.get_task("proj").unwrap();
        assert!(parent.subtasks.is_empty());
    }
}
