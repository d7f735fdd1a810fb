#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use taskhive::libs::config::Config;
    use taskhive::libs::error::ErrorKind;
    use taskhive::libs::knowledge::{Citation, KnowledgeFilter, KnowledgePatch};
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
    fn test_knowledge_requires_project(ctx: &mut CoreTestContext) {
        let err = ctx
            .core
            .knowledge
            .create_knowledge("proj_000000000000", "orphan fact", None, vec![])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_knowledge_lifecycle(ctx: &mut CoreTestContext) {
        let project = ctx.core.knowledge.create_project("research", "notes").unwrap();
        assert!(project.id.starts_with("proj_"));

        let created = ctx
            .core
            .knowledge
            .create_knowledge(&project.id, "TLS 1.3 drops static RSA", Some("security"), vec!["tls".to_string()])
            .unwrap();
        assert!(created.id.starts_with("know_"));
        assert_eq!(created.version, 1);

        let patch = KnowledgePatch {
            text: Some("TLS 1.3 removed static RSA key exchange".to_string()),
            ..KnowledgePatch::default()
        };
        let updated = ctx.core.knowledge.update_knowledge(&created.id, &patch).unwrap();
        assert_eq!(updated.version, 2);

        let fetched = ctx.core.knowledge.get_knowledge(&created.id).unwrap();
        assert_eq!(fetched.text, "TLS 1.3 removed static RSA key exchange");

        assert!(ctx.core.knowledge.delete_knowledge(&created.id).unwrap());
        // deleting again is a no-op
        assert!(!ctx.core.knowledge.delete_knowledge(&created.id).unwrap());
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_citations_attach_and_survive(ctx: &mut CoreTestContext) {
        let project = ctx.core.knowledge.create_project("research", "notes").unwrap();
        let entry = ctx
            .core
            .knowledge
            .create_knowledge(&project.id, "fact with sources", None, vec![])
            .unwrap();

        let citations = vec![
            Citation {
                id: None,
                source: "https://example.org/rfc".to_string(),
                title: Some("The RFC".to_string()),
                note: None,
                created_ms: 0,
            },
            Citation {
                id: None,
                source: "https://example.org/post".to_string(),
                title: None,
                note: Some("secondary".to_string()),
                created_ms: 0,
            },
        ];
        let updated = ctx.core.knowledge.add_citations(&entry.id, citations).unwrap();
        assert_eq!(updated.citations.len(), 2);
        assert!(updated.citations.iter().all(|c| c.id.is_some() && c.created_ms > 0));
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_list_filters(ctx: &mut CoreTestContext) {
        let alpha = ctx.core.knowledge.create_project("alpha", "").unwrap();
        let beta = ctx.core.knowledge.create_project("beta", "").unwrap();

        ctx.core.knowledge.create_knowledge(&alpha.id, "a1", Some("web"), vec!["x".to_string()]).unwrap();
        ctx.core.knowledge.create_knowledge(&alpha.id, "a2", Some("db"), vec![]).unwrap();
        ctx.core.knowledge.create_knowledge(&beta.id, "b1", Some("web"), vec![]).unwrap();

        let by_project = ctx
            .core
            .knowledge
            .list_knowledge(&KnowledgeFilter {
                project_id: Some(alpha.id.clone()),
                ..KnowledgeFilter::default()
            })
            .unwrap();
        assert_eq!(by_project.len(), 2);

        let by_domain = ctx
            .core
            .knowledge
            .list_knowledge(&KnowledgeFilter {
                domain: Some("web".to_string()),
                ..KnowledgeFilter::default()
            })
            .unwrap();
        assert_eq!(by_domain.len(), 2);

        let by_tag = ctx
            .core
            .knowledge
            .list_knowledge(&KnowledgeFilter {
                tag: Some("x".to_string()),
                ..KnowledgeFilter::default()
            })
            .unwrap();
        assert_eq!(by_tag.len(), 1);
        assert_eq!(by_tag[0].text, "a1");
    }

    #[test_context(CoreTestContext)]
    #[test]
    fn test_knowledge_is_isolated_from_task_dag(ctx: &mut CoreTestContext) {
        use taskhive::libs::task::{Task, TaskType};

        let project = ctx.core.knowledge.create_project("research", "").unwrap();
        let entry = ctx.core.knowledge.create_knowledge(&project.id, "isolated", None, vec![]).unwrap();

        // knowledge ids are not valid dependency targets
        ctx.core.tasks.create_task(Task::draft("t", "t", TaskType::Task)).unwrap();
        let err = ctx.core.tasks.add_dependency("t", &entry.id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
