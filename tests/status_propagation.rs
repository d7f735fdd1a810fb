#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use taskhive::libs::config::Config;
    use taskhive::libs::error::ErrorKind;
    use taskhive::libs::events::EventKind;
    use taskhive::libs::task::{Task, TaskStatus, TaskType};
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

    fn in_progress(path: &str, name: &str, task_type: TaskType) -> Task {
        let mut task = Task::draft(path, name, task_type);
        task.status = TaskStatus::InProgress;
        task
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_parent_and_children_complete(ctx: &mut CoreTestContext) {
        // S4: children complete first, then the parent; the status index
        // partition holds all three
        let m = ctx.core.tasks.create_task(in_progress("m", "milestone", TaskType::Milestone)).unwrap();
        let c1 = ctx.core.tasks.create_task(in_progress("m/c1", "c1", TaskType::Task)).unwrap();
        let c2 = ctx.core.tasks.create_task(in_progress("m/c2", "c2", TaskType::Task)).unwrap();

        ctx.core.tasks.change_status("m/c1", TaskStatus::Completed).unwrap();
        ctx.core.tasks.change_status("m/c2", TaskStatus::Completed).unwrap();
        ctx.core.tasks.change_status("m", TaskStatus::Completed).unwrap();

        let completed: BTreeSet<String> = ctx.core.indexes.status.ids_in(TaskStatus::Completed).into_iter().collect();
        let expected: BTreeSet<String> = [m.id, c1.id, c2.id].into_iter().collect();
        assert_eq!(completed, expected);

        let updates = ctx
            .core
            .bus
            .recent(100)
            .iter()
            .filter(|e| e.kind == EventKind::TaskUpdated)
            .count();
        assert_eq!(updates, 3);
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_terminal_states_do_not_transition(ctx: &mut CoreTestContext) {
        let mut task = Task::draft("t", "t", TaskType::Task);
        task.status = TaskStatus::InProgress;
        ctx.core.tasks.create_task(task).unwrap();
        ctx.core.tasks.change_status("t", TaskStatus::Failed).unwrap();

        let err = ctx.core.tasks.change_status("t", TaskStatus::InProgress).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StatusTransition);
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_reopen_allowed_until_dependents_complete(ctx: &mut CoreTestContext) {
        let mut base = Task::draft("base", "base", TaskType::Task);
        base.status = TaskStatus::InProgress;
        ctx.core.tasks.create_task(base).unwrap();
        ctx.core.tasks.change_status("base", TaskStatus::Completed).unwrap();

        // reopen while nothing depends on it
        ctx.core.tasks.change_status("base", TaskStatus::Pending).unwrap();
        assert_eq!(ctx.core.tasks.get_task("base").unwrap().status, TaskStatus::Pending);

        // complete again, then hang a completed dependent off it
        ctx.core.tasks.change_status("base", TaskStatus::InProgress).unwrap();
        ctx.core.tasks.change_status("base", TaskStatus::Completed).unwrap();

        let mut consumer = Task::draft("consumer", "consumer", TaskType::Task);
        consumer.dependencies = vec!["base".to_string()];
        consumer.status = TaskStatus::InProgress;
        ctx.core.tasks.create_task(consumer).unwrap();
        ctx.core.tasks.change_status("consumer", TaskStatus::Completed).unwrap();

        let err = ctx.core.tasks.change_status("base", TaskStatus::Pending).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_blocked_dependent_released_on_completion(ctx: &mut CoreTestContext) {
        let mut upstream = Task::draft("upstream", "upstream", TaskType::Task);
        upstream.status = TaskStatus::InProgress;
        ctx.core.tasks.create_task(upstream).unwrap();

        let mut waiting = Task::draft("waiting", "waiting", TaskType::Task);
        waiting.dependencies = vec!["upstream".to_string()];
        waiting.status = TaskStatus::Blocked;
        ctx.core.tasks.create_task(waiting).unwrap();

        ctx.core.tasks.change_status("upstream", TaskStatus::Completed).unwrap();

        // the blocked dependent was re-evaluated and released
        assert_eq!(ctx.core.tasks.get_task("waiting").unwrap().status, TaskStatus::Pending);
    }
}
