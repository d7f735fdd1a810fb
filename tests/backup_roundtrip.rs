#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use taskhive::libs::config::Config;
    use taskhive::libs::events::EventKind;
    use taskhive::libs::task::{NoteCategory, Pagination, Task, TaskFilter, TaskType};
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

    fn seed(core: &CoreContext) {
        core.tasks.create_task(Task::draft("proj", "proj", TaskType::Group)).unwrap();
        core.tasks.create_task(Task::draft("proj/api", "API", TaskType::Milestone)).unwrap();
        let mut dependent = Task::draft("proj/ui", "UI", TaskType::Task);
        dependent.dependencies = vec!["proj/api".to_string()];
        core.tasks.create_task(dependent).unwrap();
        core.tasks.add_note("proj/api", NoteCategory::Planning, "sketch endpoints").unwrap();

        let project = core.knowledge.create_project("research", "background material").unwrap();
        core.knowledge
            .create_knowledge(&project.id, "HTTP caching semantics", Some("web"), vec!["http".to_string()])
            .unwrap();
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_export_then_import_restores_store(ctx: &mut CoreTestContext) {
        seed(&ctx.core);

        let before = ctx.core.tasks.query_tasks(&TaskFilter::default(), Pagination { offset: 0, limit: 100 }).unwrap();
        let archive = ctx._temp_dir.path().join("snapshot.tar.gz");
        let manifest = ctx.core.export(&archive).unwrap();
        assert_eq!(manifest.task_count, 3);
        assert_eq!(manifest.knowledge_count, 1);
        assert_eq!(manifest.project_count, 1);

        // mutate the store after the snapshot
        ctx.core.tasks.delete_task("proj/ui", DeleteStrategy::Cascade).unwrap();
        ctx.core.tasks.create_task(Task::draft("extra", "extra", TaskType::Task)).unwrap();

        let restored = ctx.core.import(&archive).unwrap();
        assert_eq!(restored.task_count, 3);

        let after = ctx.core.tasks.query_tasks(&TaskFilter::default(), Pagination { offset: 0, limit: 100 }).unwrap();
        let before_paths: Vec<&str> = before.items.iter().map(|t| t.path.as_str()).collect();
        let after_paths: Vec<&str> = after.items.iter().map(|t| t.path.as_str()).collect();
        assert_eq!(before_paths, after_paths);

        // enriched attributes survive the round trip
        let api = ctx.core.tasks.get_task("proj/api").unwrap();
        assert_eq!(api.notes.len(), 1);
        let ui = ctx.core.tasks.get_task("proj/ui").unwrap();
        assert_eq!(ui.dependencies, vec!["proj/api".to_string()]);

        let event_kinds: Vec<EventKind> = ctx.core.bus.recent(200).iter().map(|e| e.kind).collect();
        assert!(event_kinds.contains(&EventKind::BackupCompleted));
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_create_then_cascade_delete_restores_prior_state(ctx: &mut CoreTestContext) {
        seed(&ctx.core);
        let before = ctx.core.tasks.query_tasks(&TaskFilter::default(), Pagination { offset: 0, limit: 100 }).unwrap();

        ctx.core.tasks.create_task(Task::draft("scratch", "scratch", TaskType::Group)).unwrap();
        ctx.core.tasks.create_task(Task::draft("scratch/a", "a", TaskType::Task)).unwrap();
        ctx.core.tasks.create_task(Task::draft("scratch/a/b", "b", TaskType::Task)).unwrap();
        ctx.core.tasks.delete_task("scratch", DeleteStrategy::Cascade).unwrap();

        let after = ctx.core.tasks.query_tasks(&TaskFilter::default(), Pagination { offset: 0, limit: 100 }).unwrap();
        let before_keys: Vec<(String, i64)> = before.items.iter().map(|t| (t.path.clone(), t.version)).collect();
        let after_keys: Vec<(String, i64)> = after.items.iter().map(|t| (t.path.clone(), t.version)).collect();
        assert_eq!(before_keys, after_keys);
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_import_of_incomplete_archive_fails(ctx: &mut CoreTestContext) {
        let bogus = ctx._temp_dir.path().join("bogus.tar.gz");
        std::fs::write(&bogus, b"not an archive").unwrap();
        assert!(ctx.core.import(&bogus).is_err());
    }
}
