//! Knowledge persistence: facts and research artifacts with citations.
//!
//! Follows the same storage conventions as the task store: minted string
//! ids, JSON-encoded tag sets, millisecond timestamps, and a per-row
//! version counter. Citations live in their own table and cascade with
//! their knowledge entry.

use crate::libs::error::Result;
use crate::libs::knowledge::{Citation, Knowledge, KnowledgeFilter};
use rusqlite::{params, Connection, ToSql};

const KNOWLEDGE_COLUMNS: &str = "id, project_id, text, domain, tags, created_ms, updated_ms, version";

const INSERT_KNOWLEDGE: &str =
    "INSERT INTO knowledge (id, project_id, text, domain, tags, created_ms, updated_ms, version) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)";

const UPDATE_KNOWLEDGE: &str =
    "UPDATE knowledge SET text = ?1, domain = ?2, tags = ?3, updated_ms = ?4, version = ?5 WHERE id = ?6";

const DELETE_KNOWLEDGE: &str = "DELETE FROM knowledge WHERE id = ?1";

const INSERT_CITATION: &str =
    "INSERT INTO citations (id, knowledge_id, source, title, note, created_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6)";

const SELECT_CITATIONS: &str = "SELECT id, source, title, note, created_ms FROM citations WHERE knowledge_id = ?1 ORDER BY created_ms, id";

/// Storage interface for knowledge entries and their citations.
pub struct KnowledgeStore;

impl KnowledgeStore {
    pub fn insert(conn: &Connection, knowledge: &Knowledge) -> Result<()> {
        conn.execute(
            INSERT_KNOWLEDGE,
            params![
                knowledge.id,
                knowledge.project_id,
                knowledge.text,
                knowledge.domain,
                serde_json::to_string(&knowledge.tags)?,
                knowledge.created_ms,
                knowledge.updated_ms,
                knowledge.version,
            ],
        )?;

        for citation in &knowledge.citations {
            Self::insert_citation(conn, &knowledge.id, citation)?;
        }

        Ok(())
    }

    /// Returns rows touched; 0 means the id is unknown.
    pub fn update(conn: &Connection, knowledge: &Knowledge) -> Result<usize> {
        let affected = conn.execute(
            UPDATE_KNOWLEDGE,
            params![
                knowledge.text,
                knowledge.domain,
                serde_json::to_string(&knowledge.tags)?,
                knowledge.updated_ms,
                knowledge.version,
                knowledge.id,
            ],
        )?;
        Ok(affected)
    }

    pub fn delete(conn: &Connection, id: &str) -> Result<usize> {
        let affected = conn.execute(DELETE_KNOWLEDGE, params![id])?;
        Ok(affected)
    }

    pub fn get_by_id(conn: &Connection, id: &str) -> Result<Option<Knowledge>> {
        let mut entries = Self::fetch(conn, "WHERE id = ?1", &[&id.to_string()])?;
        Ok(entries.pop())
    }

    pub fn list(conn: &Connection, filter: &KnowledgeFilter) -> Result<Vec<Knowledge>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut args: Vec<String> = Vec::new();

        if let Some(project_id) = &filter.project_id {
            args.push(project_id.clone());
            clauses.push("project_id = ?");
        }
        if let Some(domain) = &filter.domain {
            args.push(domain.clone());
            clauses.push("domain = ?");
        }
        if let Some(tag) = &filter.tag {
            args.push(tag.clone());
            clauses.push("EXISTS (SELECT 1 FROM json_each(knowledge.tags) je WHERE je.value = ?)");
        }

        let suffix = if clauses.is_empty() {
            "ORDER BY created_ms, id".to_string()
        } else {
            format!("WHERE {} ORDER BY created_ms, id", clauses.join(" AND "))
        };

        let arg_refs: Vec<&String> = args.iter().collect();
        Self::fetch(conn, &suffix, &arg_refs)
    }

    pub fn list_all(conn: &Connection) -> Result<Vec<Knowledge>> {
        Self::fetch(conn, "ORDER BY created_ms, id", &[])
    }

    pub fn count(conn: &Connection) -> Result<usize> {
        let count: usize = conn.query_row("SELECT COUNT(*) FROM knowledge", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn insert_citation(conn: &Connection, knowledge_id: &str, citation: &Citation) -> Result<()> {
        let citation_id = citation
            .id
            .clone()
            .unwrap_or_else(|| crate::libs::ident::IdGenerator::new().mint("cite"));
        conn.execute(
            INSERT_CITATION,
            params![citation_id, knowledge_id, citation.source, citation.title, citation.note, citation.created_ms],
        )?;
        Ok(())
    }

    fn citations_for(conn: &Connection, knowledge_id: &str) -> Result<Vec<Citation>> {
        let mut stmt = conn.prepare(SELECT_CITATIONS)?;
        let citations = stmt
            .query_map(params![knowledge_id], |row| {
                Ok(Citation {
                    id: Some(row.get(0)?),
                    source: row.get(1)?,
                    title: row.get(2)?,
                    note: row.get(3)?,
                    created_ms: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(citations)
    }

    fn fetch(conn: &Connection, suffix: &str, args: &[&String]) -> Result<Vec<Knowledge>> {
        let query = format!("SELECT {KNOWLEDGE_COLUMNS} FROM knowledge {suffix}");
        let mut stmt = conn.prepare(&query)?;
        let params: Vec<&dyn ToSql> = args.iter().map(|a| *a as &dyn ToSql).collect();

        let mut entries = stmt
            .query_map(&params[..], |row| {
                let tags_raw: String = row.get(4)?;
                Ok(Knowledge {
                    id: row.get(0)?,
                    project_id: row.get(1)?,
                    text: row.get(2)?,
                    domain: row.get(3)?,
                    tags: serde_json::from_str(&tags_raw).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, e.to_string().into())
                    })?,
                    citations: Vec::new(),
                    created_ms: row.get(5)?,
                    updated_ms: row.get(6)?,
                    version: row.get(7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);

        for entry in &mut entries {
            entry.citations = Self::citations_for(conn, &entry.id)?;
        }

        Ok(entries)
    }
}
