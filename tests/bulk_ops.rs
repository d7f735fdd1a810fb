#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use taskhive::db::bulk::{BulkOp, BulkOptions, BulkPayload, ItemStatus};
    use taskhive::libs::cancel::CancelToken;
    use taskhive::libs::config::Config;
    use taskhive::libs::error::CoreError;
    use taskhive::libs::task::{Task, TaskPatch, TaskType};
    use taskhive::libs::validation::Mode;
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

    fn create_op(path: &str, deps: &[&str]) -> BulkOp {
        let mut task = Task::draft(path, path, TaskType::Task);
        task.dependencies = deps.iter().map(|d| d.to_string()).collect();
        BulkOp {
            key: path.to_string(),
            payload: BulkPayload::Create(Box::new(task)),
        }
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_cycle_leaves_no_partial_state(ctx: &mut CoreTestContext) {
        // S3: two creates depending on each other fail whole
        let ops = vec![create_op("a", &["b"]), create_op("b", &["a"])];
        let err = ctx.core.tasks.bulk(&ops, BulkOptions::default(), &CancelToken::new()).unwrap_err();

        match err {
            CoreError::DependencyCycle { cycle } => {
                assert_eq!(cycle.len(), 3);
                assert_eq!(cycle.first(), cycle.last());
            }
            other => panic!("expected DependencyCycle, got {other:?}"),
        }

        assert!(ctx.core.tasks.get_task("a").is_err());
        assert!(ctx.core.tasks.get_task("b").is_err());
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_forward_references_execute_in_order(ctx: &mut CoreTestContext) {
        // the batch lists the dependent before its dependency
        let ops = vec![create_op("consumer", &["producer"]), create_op("producer", &[])];
        let report = ctx.core.tasks.bulk(&ops, BulkOptions::default(), &CancelToken::new()).unwrap();

        assert_eq!(report.summary.succeeded, 2);
        assert_eq!(report.summary.failed, 0);
        assert!(ctx.core.tasks.get_task("consumer").is_ok());
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_strict_failure_rolls_back_whole_batch(ctx: &mut CoreTestContext) {
        // second item is invalid (missing parent), so nothing survives
        let ops = vec![create_op("ok", &[]), create_op("ghost/child", &[])];
        let err = ctx.core.tasks.bulk(&ops, BulkOptions::default(), &CancelToken::new());

        assert!(err.is_err());
        assert!(ctx.core.tasks.get_task("ok").is_err());
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_lenient_records_failure_and_continues(ctx: &mut CoreTestContext) {
        let ops = vec![create_op("ok", &[]), create_op("ghost/child", &[]), create_op("also-ok", &[])];
        let report = ctx.core.tasks.bulk(&ops, BulkOptions { mode: Mode::Lenient }, &CancelToken::new()).unwrap();

        assert_eq!(report.summary.total, 3);
        assert_eq!(report.summary.succeeded, 2);
        assert_eq!(report.summary.failed, 1);

        let failed = report.outcomes.iter().find(|o| o.key == "ghost/child").unwrap();
        assert_eq!(failed.status, ItemStatus::Failed);
        assert!(failed.error.is_some());

        assert!(ctx.core.tasks.get_task("ok").is_ok());
        assert!(ctx.core.tasks.get_task("also-ok").is_ok());
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_mixed_batch_with_updates_and_deletes(ctx: &mut CoreTestContext) {
        ctx.core.tasks.create_task(Task::draft("keep", "keep", TaskType::Task)).unwrap();
        ctx.core.tasks.create_task(Task::draft("drop", "drop", TaskType::Task)).unwrap();

        let ops = vec![
            BulkOp {
                key: "keep".to_string(),
                payload: BulkPayload::Update(TaskPatch {
                    name: Some("kept".to_string()),
                    ..TaskPatch::default()
                }),
            },
            BulkOp {
                key: "drop".to_string(),
                payload: BulkPayload::Delete,
            },
        ];
        let report = ctx.core.tasks.bulk(&ops, BulkOptions::default(), &CancelToken::new()).unwrap();
        assert_eq!(report.summary.succeeded, 2);

        assert_eq!(ctx.core.tasks.get_task("keep").unwrap().name, "kept");
        assert!(ctx.core.tasks.get_task("drop").is_err());
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_create_budget(ctx: &mut CoreTestContext) {
        let ops: Vec<BulkOp> = (0..101).map(|i| create_op(&format!("t{i:03}"), &[])).collect();
        let err = ctx.core.tasks.bulk(&ops, BulkOptions::default(), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, CoreError::LimitExceeded { .. }));
    }
}
