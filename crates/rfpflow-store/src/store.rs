use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use rfpflow_core::error::{Result, WorkflowError};
use rfpflow_core::traits::{DocumentSource, InsightsRepository};
use rfpflow_core::types::{DocumentId, InsightsRecord, ProjectId};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS documents (
        id INTEGER PRIMARY KEY,
        project_id INTEGER NOT NULL,
        filename TEXT,
        extracted_text TEXT,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_documents_project ON documents(project_id, id);

    CREATE TABLE IF NOT EXISTS insights (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id INTEGER NOT NULL UNIQUE,
        executive_summary TEXT,
        challenges TEXT,
        value_propositions TEXT,
        discovery_questions TEXT,
        tags TEXT,
        matched_cases TEXT,
        model_used TEXT,
        analyzed_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );";

fn db_err(e: impl std::fmt::Display) -> WorkflowError {
    WorkflowError::Database(e.to_string())
}

/// SQLite-backed document source and insights repository.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                WorkflowError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or replace a document's extracted text.
    pub fn put_document(
        &self,
        project_id: ProjectId,
        document_id: DocumentId,
        filename: Option<&str>,
        extracted_text: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().map_err(db_err)?;
        conn.execute(
            "INSERT INTO documents (id, project_id, filename, extracted_text, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                project_id = excluded.project_id,
                filename = excluded.filename,
                extracted_text = excluded.extracted_text",
            params![
                document_id.0,
                project_id.0,
                filename,
                extracted_text,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(db_err)?;
        debug!(document_id = %document_id, project_id = %project_id, "Document stored");
        Ok(())
    }

    /// Documents belonging to a project, oldest first.
    pub fn project_documents(&self, project_id: ProjectId) -> Result<Vec<DocumentId>> {
        let conn = self.conn.lock().map_err(db_err)?;
        let mut stmt = conn
            .prepare("SELECT id FROM documents WHERE project_id = ?1 ORDER BY id ASC")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![project_id.0], |row| row.get::<_, i64>(0))
            .map_err(db_err)?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(DocumentId(row.map_err(db_err)?));
        }
        Ok(ids)
    }
}

fn to_json<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(WorkflowError::from)
}

fn from_json<T: serde::de::DeserializeOwned>(column: Option<String>) -> Result<Option<T>> {
    column
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(WorkflowError::from)
}

impl DocumentSource for SqliteStore {
    fn extracted_text(&self, document_id: DocumentId) -> BoxFuture<'_, Result<Option<String>>> {
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| WorkflowError::DocumentSource(e.to_string()))?;

            let text: Option<Option<String>> = conn
                .query_row(
                    "SELECT extracted_text FROM documents WHERE id = ?1",
                    params![document_id.0],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| WorkflowError::DocumentSource(e.to_string()))?;

            Ok(text.flatten())
        })
    }
}

impl InsightsRepository for SqliteStore {
    fn upsert_insights(&self, record: InsightsRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let challenges = to_json(&record.challenges)?;
            let value_propositions = to_json(&record.value_propositions)?;
            let discovery_questions = to_json(&record.discovery_questions)?;
            let tags = to_json(&record.tags)?;
            let matched_cases = to_json(&record.matched_cases)?;
            let now = Utc::now().to_rfc3339();

            let conn = self
                .conn
                .lock()
                .map_err(|e| WorkflowError::Persistence(e.to_string()))?;

            conn.execute(
                "INSERT INTO insights (
                    project_id, executive_summary, challenges, value_propositions,
                    discovery_questions, tags, matched_cases, model_used, analyzed_at,
                    created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
                 ON CONFLICT(project_id) DO UPDATE SET
                    executive_summary = excluded.executive_summary,
                    challenges = excluded.challenges,
                    value_propositions = excluded.value_propositions,
                    discovery_questions = excluded.discovery_questions,
                    tags = excluded.tags,
                    matched_cases = excluded.matched_cases,
                    model_used = excluded.model_used,
                    analyzed_at = excluded.analyzed_at,
                    updated_at = excluded.updated_at",
                params![
                    record.project_id.0,
                    record.executive_summary,
                    challenges,
                    value_propositions,
                    discovery_questions,
                    tags,
                    matched_cases,
                    record.model_used,
                    record.analyzed_at.to_rfc3339(),
                    now,
                ],
            )
            .map_err(|e| WorkflowError::Persistence(e.to_string()))?;

            debug!(project_id = %record.project_id, "Insights saved");
            Ok(())
        })
    }

    fn load_insights(&self, project_id: ProjectId) -> BoxFuture<'_, Result<Option<InsightsRecord>>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;

            type Row = (
                Option<String>,
                Option<String>,
                Option<String>,
                Option<String>,
                Option<String>,
                Option<String>,
                Option<String>,
                Option<String>,
            );
            let row: Option<Row> = conn
                .query_row(
                    "SELECT executive_summary, challenges, value_propositions, discovery_questions,
                            tags, matched_cases, model_used, analyzed_at
                     FROM insights WHERE project_id = ?1",
                    params![project_id.0],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                            row.get(7)?,
                        ))
                    },
                )
                .optional()
                .map_err(db_err)?;

            let Some((summary, challenges, props, questions, tags, cases, model, analyzed)) = row
            else {
                return Ok(None);
            };

            let analyzed_at = analyzed
                .and_then(|ts| DateTime::parse_from_rfc3339(&ts).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);

            Ok(Some(InsightsRecord {
                project_id,
                executive_summary: summary,
                challenges: from_json(challenges)?,
                value_propositions: from_json(props)?,
                discovery_questions: from_json(questions)?,
                tags: from_json(tags)?,
                matched_cases: from_json(cases)?,
                model_used: model.unwrap_or_default(),
                analyzed_at,
            }))
        })
    }
}
