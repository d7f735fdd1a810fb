#[cfg(test)]
mod tests {
    use taskhive::db::db::Db;
    use taskhive::db::migrations::{self, MigrationManager};
    use taskhive::libs::config::StorageConfig;
    use tempfile::TempDir;
    use test_context::{test_context, TestContext};

    struct DbTestContext {
        _temp_dir: TempDir,
        db: Db,
    }

    impl TestContext for DbTestContext {
        fn setup() -> Self {
            let temp_dir = tempfile::tempdir().unwrap();
            let config = StorageConfig {
                base_dir: Some(temp_dir.path().to_string_lossy().to_string()),
                ..StorageConfig::default()
            };
            let db = Db::open(&config).unwrap();
            DbTestContext { _temp_dir: temp_dir, db }
        }
    }

    #[test_context(DbTestContext)]
    #[test]
    fn test_fresh_database_is_fully_migrated(ctx: &mut DbTestContext) {
        let conn = ctx.db.conn.lock();
        let manager = MigrationManager::new();

        assert_eq!(migrations::current_version(&conn).unwrap(), manager.latest_version());
        assert!(!migrations::needs_migration(&conn).unwrap());

        let history = manager.get_migration_history(&conn).unwrap();
        assert_eq!(history.len(), manager.latest_version() as usize);
        assert_eq!(history[0].1, "create_tasks_and_notes");
    }

    #[test_context(DbTestContext)]
    #[test]
    fn test_schema_tables_exist(ctx: &mut DbTestContext) {
        let conn = ctx.db.conn.lock();
        for table in ["tasks", "notes", "projects", "knowledge", "citations", "schema_migrations"] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }

    #[test_context(DbTestContext)]
    #[test]
    fn test_rollback_and_reapply(ctx: &mut DbTestContext) {
        let manager = MigrationManager::new();
        let mut conn = ctx.db.conn.lock();

        manager.rollback_to(&mut conn, 1).unwrap();
        assert_eq!(migrations::current_version(&conn).unwrap(), 1);
        assert!(migrations::needs_migration(&conn).unwrap());

        // knowledge tables are gone, task tables remain
        let knowledge_tables: i64 = conn
            .query_row("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'knowledge'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(knowledge_tables, 0);

        manager.run_migrations(&mut conn).unwrap();
        assert!(!migrations::needs_migration(&conn).unwrap());
    }

    #[test_context(DbTestContext)]
    #[test]
    fn test_integrity_and_maintenance(ctx: &mut DbTestContext) {
        ctx.db.verify_integrity().unwrap();
        ctx.db.analyze().unwrap();
        ctx.db.vacuum().unwrap();
        let checkpoint = ctx.db.checkpoint().unwrap();
        assert_eq!(checkpoint.busy, 0);

        let stats = ctx.db.stats().unwrap();
        assert_eq!(stats.task_count, 0);
        assert!(stats.page_size > 0);

        let metrics = ctx.db.metrics().unwrap();
        assert_eq!(metrics.journal_mode.to_lowercase(), "wal");
    }

    #[test_context(DbTestContext)]
    #[test]
    fn test_repair_relationships_reports_drift(ctx: &mut DbTestContext) {
        {
            let conn = ctx.db.conn.lock();
            conn.execute(
                "INSERT INTO tasks (id, path, path_key, parent_path, parent_key, name, task_type, status, priority, created_ms, updated_ms)
                 VALUES ('task_00000000drift', 'a/b', 'a/b', 'wrong', 'wrong', 'b', 'TASK', 'PENDING', 'medium', 1, 1)",
                [],
            )
            .unwrap();
        }

        let dry = ctx.db.repair_relationships(true).unwrap();
        assert_eq!(dry.fixed, 0);
        assert_eq!(dry.issues.len(), 1);

        let wet = ctx.db.repair_relationships(false).unwrap();
        assert_eq!(wet.fixed, 1);

        let conn = ctx.db.conn.lock();
        let parent: Option<String> = conn
            .query_row("SELECT parent_path FROM tasks WHERE path = 'a/b'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(parent.as_deref(), Some("a"));
    }
}
