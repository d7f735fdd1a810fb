#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use taskhive::libs::config::Config;
    use taskhive::libs::error::{CoreError, ErrorKind};
    use taskhive::libs::task::{MetaValue, Task, TaskPatch, TaskType};
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
    fn test_six_level_path_fails_validation(ctx: &mut CoreTestContext) {
        let err = ctx.core.tasks.create_task(Task::draft("a/b/c/d/e/f", "deep", TaskType::Task)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_five_level_path_is_accepted(ctx: &mut CoreTestContext) {
        ctx.core.tasks.create_task(Task::draft("a", "a", TaskType::Group)).unwrap();
        ctx.core.tasks.create_task(Task::draft("a/b", "b", TaskType::Group)).unwrap();
        ctx.core.tasks.create_task(Task::draft("a/b/c", "c", TaskType::Group)).unwrap();
        ctx.core.tasks.create_task(Task::draft("a/b/c/d", "d", TaskType::Group)).unwrap();
        ctx.core.tasks.create_task(Task::draft("a/b/c/d/e", "e", TaskType::Task)).unwrap();
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_invalid_path_characters_rejected(ctx: &mut CoreTestContext) {
        let err = ctx.core.tasks.create_task(Task::draft("bad path!", "bad", TaskType::Task)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_oversized_fields_fail_on_update(ctx: &mut CoreTestContext) {
        ctx.core.tasks.create_task(Task::draft("t", "t", TaskType::Task)).unwrap();

        let patch = TaskPatch {
            name: Some("x".repeat(201)),
            ..TaskPatch::default()
        };
        let err = ctx.core.tasks.update_task("t", &patch).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let patch = TaskPatch {
            description: Some("d".repeat(2001)),
            ..TaskPatch::default()
        };
        let err = ctx.core.tasks.update_task("t", &patch).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        // the stored task is untouched
        let stored = ctx.core.tasks.get_task("t").unwrap();
        assert_eq!(stored.name, "t");
        assert_eq!(stored.version, 1);
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_tag_budget(ctx: &mut CoreTestContext) {
        let mut task = Task::draft("tagged", "tagged", TaskType::Task);
        task.tags = (0..21).map(|i| format!("tag{i}")).collect();
        let err = ctx.core.tasks.create_task(task).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_metadata_bag_budget(ctx: &mut CoreTestContext) {
        let mut task = Task::draft("meta", "meta", TaskType::Task);
        for i in 0..51 {
            task.metadata.insert(format!("k{i}"), MetaValue::Number(i as f64));
        }
        let err = ctx.core.tasks.create_task(task).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_runtime_rule_mutation_is_gated(ctx: &mut CoreTestContext) {
        // default configuration has rule mutation disabled
        let err = ctx.core.tasks.remove_rule("schema").unwrap_err();
        assert!(matches!(err, CoreError::Conflict { .. }));
    }
}
