//! High-level knowledge service: projects, knowledge entries, citations.
//!
//! Knowledge is isolated from the task dependency graph; entries reference
//! a project and carry citations, nothing else. The orchestration contract
//! matches the task service: gate, trace, scope, store write, cache
//! invalidation, lifecycle event, commit.

use crate::db::knowledge::KnowledgeStore;
use crate::db::projects::ProjectStore;
use crate::db::transaction::{TxnCoordinator, TxnOptions};
use crate::libs::cache::QueryCache;
use crate::libs::error::{CoreError, Result};
use crate::libs::events::{Event, EventBus, EventKind};
use crate::libs::ident::{IdGenerator, MonotonicClock};
use crate::libs::knowledge::{Citation, Knowledge, KnowledgeFilter, KnowledgePatch, Project, MAX_KNOWLEDGE_TEXT_LEN};
use crate::libs::task::MAX_TAGS;
use crate::libs::tracer::Tracer;
use crate::services::Gate;
use rusqlite::Connection;
use std::sync::Arc;
use std::time::Duration;

pub struct KnowledgeService {
    txn: Arc<TxnCoordinator>,
    cache: Arc<QueryCache>,
    bus: Arc<EventBus>,
    tracer: Arc<Tracer>,
    clock: Arc<MonotonicClock>,
    ids: IdGenerator,
    gate: Arc<Gate>,
    txn_timeout: Duration,
}

impl KnowledgeService {
    pub fn new(
        txn: Arc<TxnCoordinator>,
        cache: Arc<QueryCache>,
        bus: Arc<EventBus>,
        tracer: Arc<Tracer>,
        clock: Arc<MonotonicClock>,
        gate: Arc<Gate>,
        txn_timeout: Duration,
    ) -> Self {
        Self {
            txn,
            cache,
            bus,
            tracer,
            clock,
            ids: IdGenerator::new(),
            gate,
            txn_timeout,
        }
    }

    /// Creates a project container. Duplicate names fail.
    pub fn create_project(&self, name: &str, description: &str) -> Result<Project> {
        let _permit = self.gate.acquire()?;
        let trace = self.tracer.start("create_project");

        let result = self.in_scope(|service, conn| {
            if ProjectStore::get_by_name(conn, name)?.is_some() {
                return Err(CoreError::DuplicateName { key: name.to_string() });
            }

            let now = service.clock.now_ms();
            let project = Project {
                id: service.ids.mint("proj"),
                name: name.to_string(),
                description: description.to_string(),
                created_ms: now,
                updated_ms: now,
            };
            ProjectStore::insert(conn, &project)?;
            Ok((project, Vec::new()))
        });

        self.finish(&trace, result)
    }

    pub fn get_project(&self, id: &str) -> Result<Project> {
        let _permit = self.gate.acquire()?;
        let project = self
            .txn
            .with_conn(|conn| ProjectStore::get_by_id(conn, id))?
            .ok_or_else(|| CoreError::NotFound { key: id.to_string() })?;
        Ok(project)
    }

    /// Persists a knowledge entry. The referenced project must exist.
    pub fn create_knowledge(&self, project_id: &str, text: &str, domain: Option<&str>, tags: Vec<String>) -> Result<Knowledge> {
        let _permit = self.gate.acquire()?;
        let trace = self.tracer.start("create_knowledge");

        let result = self.in_scope(|service, conn| {
            service.check_text(text)?;
            service.check_tags(&tags)?;
            if ProjectStore::get_by_id(conn, project_id)?.is_none() {
                return Err(CoreError::NotFound {
                    key: project_id.to_string(),
                });
            }

            let now = service.clock.now_ms();
            let knowledge = Knowledge {
                id: service.ids.mint("know"),
                project_id: project_id.to_string(),
                text: text.to_string(),
                domain: domain.map(|d| d.to_string()),
                tags: tags.clone(),
                citations: Vec::new(),
                created_ms: now,
                updated_ms: now,
                version: 1,
            };
            KnowledgeStore::insert(conn, &knowledge)?;
            service.cache.invalidate_entity(&knowledge.id);

            let event = Event::new(
                EventKind::KnowledgeCreated,
                Some(knowledge.id.clone()),
                serde_json::json!({ "project": project_id }),
            );
            Ok((knowledge, vec![event]))
        });

        self.finish(&trace, result)
    }

    pub fn get_knowledge(&self, id: &str) -> Result<Knowledge> {
        let _permit = self.gate.acquire()?;
        let trace = self.tracer.start("get_knowledge");

        let fingerprint = QueryCache::fingerprint("get_knowledge", &serde_json::json!({ "id": id }));
        if let Some(cached) = self.cache.get(&fingerprint) {
            let knowledge: Knowledge = serde_json::from_value(cached)?;
            self.tracer.end(&trace);
            return Ok(knowledge);
        }

        let result = (|| {
            let knowledge = self
                .txn
                .with_conn(|conn| KnowledgeStore::get_by_id(conn, id))?
                .ok_or_else(|| CoreError::NotFound { key: id.to_string() })?;
            self.cache.put(
                &fingerprint,
                serde_json::to_value(&knowledge)?,
                knowledge.version,
                vec![knowledge.id.clone(), knowledge.project_id.clone()],
            );
            Ok(knowledge)
        })();

        self.finish(&trace, result)
    }

    pub fn list_knowledge(&self, filter: &KnowledgeFilter) -> Result<Vec<Knowledge>> {
        let _permit = self.gate.acquire()?;
        self.txn.with_conn(|conn| KnowledgeStore::list(conn, filter))
    }

    pub fn update_knowledge(&self, id: &str, patch: &KnowledgePatch) -> Result<Knowledge> {
        let _permit = self.gate.acquire()?;
        let trace = self.tracer.start("update_knowledge");

        let result = self.in_scope(|service, conn| {
            let existing = KnowledgeStore::get_by_id(conn, id)?.ok_or_else(|| CoreError::NotFound { key: id.to_string() })?;

            let mut next = patch.apply_to(&existing);
            service.check_text(&next.text)?;
            service.check_tags(&next.tags)?;
            next.updated_ms = service.clock.now_ms();
            next.version = existing.version + 1;

            let affected = KnowledgeStore::update(conn, &next)?;
            if affected == 0 {
                return Err(CoreError::NotFound { key: id.to_string() });
            }
            service.cache.invalidate_entity(id);

            let event = Event::new(EventKind::KnowledgeUpdated, Some(id.to_string()), serde_json::json!({ "version": next.version }));
            Ok((next, vec![event]))
        });

        self.finish(&trace, result)
    }

    /// Deleting a missing entry is a no-op reported through `deleted`.
    pub fn delete_knowledge(&self, id: &str) -> Result<bool> {
        let _permit = self.gate.acquire()?;
        let trace = self.tracer.start("delete_knowledge");

        let result = self.in_scope(|service, conn| {
            let affected = KnowledgeStore::delete(conn, id)?;
            service.cache.invalidate_entity(id);

            let events = if affected > 0 {
                vec![Event::new(EventKind::KnowledgeDeleted, Some(id.to_string()), serde_json::json!({}))]
            } else {
                Vec::new()
            };
            Ok((affected > 0, events))
        });

        self.finish(&trace, result)
    }

    /// Links citations to an existing knowledge entry.
    pub fn add_citations(&self, id: &str, citations: Vec<Citation>) -> Result<Knowledge> {
        let _permit = self.gate.acquire()?;
        let trace = self.tracer.start("add_citations");

        let result = self.in_scope(|service, conn| {
            let existing = KnowledgeStore::get_by_id(conn, id)?.ok_or_else(|| CoreError::NotFound { key: id.to_string() })?;

            for citation in &citations {
                let mut citation = citation.clone();
                if citation.created_ms == 0 {
                    citation.created_ms = service.clock.now_ms();
                }
                KnowledgeStore::insert_citation(conn, &existing.id, &citation)?;
            }

            let mut next = existing.clone();
            next.updated_ms = service.clock.now_ms();
            next.version = existing.version + 1;
            KnowledgeStore::update(conn, &next)?;
            service.cache.invalidate_entity(id);

            let refreshed = KnowledgeStore::get_by_id(conn, id)?.ok_or_else(|| CoreError::NotFound { key: id.to_string() })?;
            let event = Event::new(
                EventKind::KnowledgeUpdated,
                Some(id.to_string()),
                serde_json::json!({ "citations": refreshed.citations.len() }),
            );
            Ok((refreshed, vec![event]))
        });

        self.finish(&trace, result)
    }

    fn check_text(&self, text: &str) -> Result<()> {
        if text.is_empty() || text.chars().count() > MAX_KNOWLEDGE_TEXT_LEN {
            return Err(CoreError::Validation {
                issues: vec![crate::libs::error::ValidationIssue::new(
                    "schema",
                    "bad_knowledge_text",
                    format!("knowledge text must be 1..={MAX_KNOWLEDGE_TEXT_LEN} characters"),
                )],
            });
        }
        Ok(())
    }

    fn check_tags(&self, tags: &[String]) -> Result<()> {
        if tags.len() > MAX_TAGS {
            return Err(CoreError::LimitExceeded {
                what: "tags",
                limit: MAX_TAGS,
                actual: tags.len(),
            });
        }
        Ok(())
    }

    /// One write scope; the work returns its value plus the events to
    /// publish after commit.
    fn in_scope<R>(&self, work: impl Fn(&Self, &Connection) -> Result<(R, Vec<Event>)>) -> Result<R> {
        let options = TxnOptions::with_timeout(self.txn_timeout);
        let (value, events) = self.txn.execute(&options, |conn| work(self, conn))?;
        for event in events {
            self.bus.publish(event);
        }
        Ok(value)
    }

    fn finish<R>(&self, trace: &str, result: Result<R>) -> Result<R> {
        match result {
            Ok(value) => {
                self.tracer.end(trace);
                Ok(value)
            }
            Err(err) => {
                self.tracer.error(trace, &err.to_string());
                self.tracer.end(trace);
                Err(err)
            }
        }
    }
}
