//! Project persistence: the grouping containers tasks and knowledge hang
//! off of.

use crate::libs::error::Result;
use crate::libs::knowledge::Project;
use rusqlite::{params, Connection};

const INSERT_PROJECT: &str = "INSERT INTO projects (id, name, description, created_ms, updated_ms) VALUES (?1, ?2, ?3, ?4, ?5)";
const UPDATE_PROJECT: &str = "UPDATE projects SET name = ?1, description = ?2, updated_ms = ?3 WHERE id = ?4";
const DELETE_PROJECT: &str = "DELETE FROM projects WHERE id = ?1";
const SELECT_PROJECT: &str = "SELECT id, name, description, created_ms, updated_ms FROM projects WHERE id = ?1";
const SELECT_PROJECT_BY_NAME: &str = "SELECT id, name, description, created_ms, updated_ms FROM projects WHERE name = ?1";
const SELECT_PROJECTS: &str = "SELECT id, name, description, created_ms, updated_ms FROM projects ORDER BY name";

pub struct ProjectStore;

impl ProjectStore {
    pub fn insert(conn: &Connection, project: &Project) -> Result<()> {
        conn.execute(
            INSERT_PROJECT,
            params![project.id, project.name, project.description, project.created_ms, project.updated_ms],
        )?;
        Ok(())
    }

    pub fn update(conn: &Connection, project: &Project) -> Result<usize> {
        let affected = conn.execute(UPDATE_PROJECT, params![project.name, project.description, project.updated_ms, project.id])?;
        Ok(affected)
    }

    pub fn delete(conn: &Connection, id: &str) -> Result<usize> {
        let affected = conn.execute(DELETE_PROJECT, params![id])?;
        Ok(affected)
    }

    pub fn get_by_id(conn: &Connection, id: &str) -> Result<Option<Project>> {
        Self::query_one(conn, SELECT_PROJECT, id)
    }

    pub fn get_by_name(conn: &Connection, name: &str) -> Result<Option<Project>> {
        Self::query_one(conn, SELECT_PROJECT_BY_NAME, name)
    }

    pub fn list_all(conn: &Connection) -> Result<Vec<Project>> {
        let mut stmt = conn.prepare(SELECT_PROJECTS)?;
        let projects = stmt
            .query_map([], row_to_project)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(projects)
    }

    fn query_one(conn: &Connection, query: &str, arg: &str) -> Result<Option<Project>> {
        let mut stmt = conn.prepare(query)?;
        let mut rows = stmt.query_map(params![arg], row_to_project)?;
        match rows.next() {
            Some(project) => Ok(Some(project?)),
            None => Ok(None),
        }
    }
}

fn row_to_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        created_ms: row.get(3)?,
        updated_ms: row.get(4)?,
    })
}
