//! rollcall-store — SQLite persistence for the attendance pipeline.
//!
//! Holds the tenant data the pipeline reads (students and their reference
//! embeddings, scoped by institution) and the records it writes (one
//! immutable attendance row per session and student). All access goes
//! through [`Store`], an async wrapper over a single SQLite connection.

pub mod gallery;

use chrono::{DateTime, Utc};
use rollcall_core::{AttendanceStatus, Embedding, FinalMark, GalleryEntry};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tokio_rusqlite::Connection;
use uuid::Uuid;

pub use gallery::GalleryCache;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS institutions (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS students (
    id              TEXT PRIMARY KEY,
    institution_id  TEXT NOT NULL REFERENCES institutions(id),
    full_name       TEXT NOT NULL,
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_students_institution ON students(institution_id);

CREATE TABLE IF NOT EXISTS reference_embeddings (
    id              TEXT PRIMARY KEY,
    student_id      TEXT NOT NULL REFERENCES students(id),
    embedding       BLOB NOT NULL,
    model_version   TEXT,
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_embeddings_student ON reference_embeddings(student_id);

CREATE TABLE IF NOT EXISTS sessions (
    id              TEXT PRIMARY KEY,
    institution_id  TEXT NOT NULL REFERENCES institutions(id),
    course          TEXT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'not_started',
    started_at      TEXT,
    ended_at        TEXT,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attendance_records (
    session_id  TEXT NOT NULL REFERENCES sessions(id),
    student_id  TEXT NOT NULL REFERENCES students(id),
    status      TEXT NOT NULL,
    confidence  REAL NOT NULL,
    marked_at   TEXT NOT NULL,
    PRIMARY KEY (session_id, student_id)
) WITHOUT ROWID;
"#;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("attendance already recorded for student {student_id} in session {session_id}")]
    DuplicateRecord {
        session_id: Uuid,
        student_id: Uuid,
    },
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("sqlite: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
}

/// Session lifecycle status as persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    NotStarted,
    Active,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::NotStarted => "not_started",
            SessionStatus::Active => "active",
            SessionStatus::Ended => "ended",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(SessionStatus::NotStarted),
            "active" => Ok(SessionStatus::Active),
            "ended" => Ok(SessionStatus::Ended),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// Persisted session metadata.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: Uuid,
    pub institution_id: Uuid,
    pub course: String,
    pub status: SessionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// One attendance record as read back for a report.
#[derive(Debug, Clone, Serialize)]
pub struct ReportEntry {
    pub student_id: Uuid,
    pub full_name: String,
    pub status: AttendanceStatus,
    pub confidence: f32,
    pub marked_at: DateTime<Utc>,
}

/// Async handle to the SQLite store. Cheap to clone; clones share one
/// connection actor.
#[derive(Clone)]
pub struct Store {
    conn: Connection,
}

impl Store {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).await?;
        Self::init(conn).await
    }

    /// In-memory store for tests.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.pragma_update(None, "foreign_keys", "ON")?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    pub async fn create_institution(&self, name: &str) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        let name = name.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO institutions (id, name, created_at) VALUES (?1, ?2, ?3)",
                    (id.to_string(), name, Utc::now().to_rfc3339()),
                )?;
                Ok(())
            })
            .await?;
        Ok(id)
    }

    pub async fn institution_exists(&self, id: Uuid) -> Result<bool, StoreError> {
        let exists = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT 1 FROM institutions WHERE id = ?1")?;
                Ok(stmt.exists((id.to_string(),))?)
            })
            .await?;
        Ok(exists)
    }

    pub async fn create_student(
        &self,
        institution_id: Uuid,
        full_name: &str,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        let full_name = full_name.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO students (id, institution_id, full_name, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    (
                        id.to_string(),
                        institution_id.to_string(),
                        full_name,
                        Utc::now().to_rfc3339(),
                    ),
                )?;
                Ok(())
            })
            .await?;
        Ok(id)
    }

    /// Record one enrollment reference embedding for a student.
    ///
    /// Callers must invalidate the institution's gallery afterwards.
    pub async fn add_reference_embedding(
        &self,
        student_id: Uuid,
        embedding: &Embedding,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        let blob = embedding_to_blob(embedding);
        let model_version = embedding.model_version.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO reference_embeddings (id, student_id, embedding, model_version, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    (
                        id.to_string(),
                        student_id.to_string(),
                        blob,
                        model_version,
                        Utc::now().to_rfc3339(),
                    ),
                )?;
                Ok(())
            })
            .await?;
        Ok(id)
    }

    pub async fn create_session(
        &self,
        institution_id: Uuid,
        course: &str,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        let course = course.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO sessions (id, institution_id, course, status, created_at)
                     VALUES (?1, ?2, ?3, 'not_started', ?4)",
                    (
                        id.to_string(),
                        institution_id.to_string(),
                        course,
                        Utc::now().to_rfc3339(),
                    ),
                )?;
                Ok(())
            })
            .await?;
        Ok(id)
    }

    pub async fn session(&self, id: Uuid) -> Result<Option<SessionRow>, StoreError> {
        let row: Option<(String, String, String, String, Option<String>, Option<String>)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, institution_id, course, status, started_at, ended_at
                     FROM sessions WHERE id = ?1",
                )?;
                let mut rows = stmt.query_map((id.to_string(),), |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?))
                })?;
                rows.next().transpose().map_err(Into::into)
            })
            .await?;

        let Some((id, institution_id, course, status, started_at, ended_at)) = row else {
            return Ok(None);
        };
        Ok(Some(SessionRow {
            id: parse_uuid(&id)?,
            institution_id: parse_uuid(&institution_id)?,
            course,
            status: status
                .parse()
                .map_err(StoreError::Corrupt)?,
            started_at: started_at.as_deref().map(parse_timestamp).transpose()?,
            ended_at: ended_at.as_deref().map(parse_timestamp).transpose()?,
        }))
    }

    pub async fn mark_session_started(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE sessions SET status = 'active', started_at = ?2 WHERE id = ?1",
                    (id.to_string(), at.to_rfc3339()),
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn mark_session_ended(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE sessions SET status = 'ended', ended_at = ?2 WHERE id = ?1",
                    (id.to_string(), at.to_rfc3339()),
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Every student of the institution, eligible for recognition or not.
    /// Finalize defaults the never-matched ones to absent.
    pub async fn enrolled_students(&self, institution_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let ids: Vec<String> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id FROM students WHERE institution_id = ?1 ORDER BY created_at",
                )?;
                let rows = stmt.query_map((institution_id.to_string(),), |r| r.get(0))?;
                rows.collect::<Result<Vec<String>, _>>().map_err(Into::into)
            })
            .await?;
        ids.iter().map(|s| parse_uuid(s)).collect()
    }

    /// Reference embeddings for one institution only. Students without any
    /// embedding contribute nothing — they are not eligible for matching.
    pub async fn gallery_entries(
        &self,
        institution_id: Uuid,
    ) -> Result<Vec<GalleryEntry>, StoreError> {
        let rows: Vec<(String, Vec<u8>, Option<String>)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT e.student_id, e.embedding, e.model_version
                     FROM reference_embeddings e
                     JOIN students s ON s.id = e.student_id
                     WHERE s.institution_id = ?1",
                )?;
                let rows = stmt.query_map((institution_id.to_string(),), |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?))
                })?;
                rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
            })
            .await?;

        rows.into_iter()
            .map(|(student_id, blob, model_version)| {
                let mut embedding = embedding_from_blob(&blob)?;
                embedding.model_version = model_version;
                Ok(GalleryEntry {
                    student_id: parse_uuid(&student_id)?,
                    embedding,
                })
            })
            .collect()
    }

    /// Write one finalized attendance record. First write wins: a second
    /// write for the same (session, student) is rejected, never overwritten.
    pub async fn insert_attendance(
        &self,
        session_id: Uuid,
        mark: &FinalMark,
        marked_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let student_id = mark.student_id;
        let status = mark.status.as_str();
        let confidence = mark.confidence;
        let inserted = self
            .conn
            .call(move |conn| {
                let result = conn.execute(
                    "INSERT INTO attendance_records (session_id, student_id, status, confidence, marked_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    (
                        session_id.to_string(),
                        student_id.to_string(),
                        status,
                        confidence as f64,
                        marked_at.to_rfc3339(),
                    ),
                );
                match result {
                    Ok(_) => Ok(true),
                    // Only a primary-key collision is a duplicate; other
                    // constraint failures (foreign keys) stay errors.
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
                    {
                        Ok(false)
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await?;

        if inserted {
            Ok(())
        } else {
            Err(StoreError::DuplicateRecord {
                session_id,
                student_id: mark.student_id,
            })
        }
    }

    pub async fn attendance_report(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<ReportEntry>, StoreError> {
        let rows: Vec<(String, String, String, f64, String)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT a.student_id, s.full_name, a.status, a.confidence, a.marked_at
                     FROM attendance_records a
                     JOIN students s ON s.id = a.student_id
                     WHERE a.session_id = ?1
                     ORDER BY s.full_name",
                )?;
                let rows = stmt.query_map((session_id.to_string(),), |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
                })?;
                rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
            })
            .await?;

        rows.into_iter()
            .map(|(student_id, full_name, status, confidence, marked_at)| {
                Ok(ReportEntry {
                    student_id: parse_uuid(&student_id)?,
                    full_name,
                    status: status.parse().map_err(StoreError::Corrupt)?,
                    confidence: confidence as f32,
                    marked_at: parse_timestamp(&marked_at)?,
                })
            })
            .collect()
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Corrupt(format!("bad uuid {s:?}: {e}")))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {s:?}: {e}")))
}

/// Little-endian f32 packing for embedding blobs.
fn embedding_to_blob(embedding: &Embedding) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.values.len() * 4);
    for v in &embedding.values {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

fn embedding_from_blob(blob: &[u8]) -> Result<Embedding, StoreError> {
    if blob.len() % 4 != 0 {
        return Err(StoreError::Corrupt(format!(
            "embedding blob length {} not a multiple of 4",
            blob.len()
        )));
    }
    let values = blob
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok(Embedding::new(values))
}
