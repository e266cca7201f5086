//! Relational metadata store on SQLite.
//!
//! Sessions and detections live in two tables joined on `prediction_uid`.
//! Label and score queries are served by secondary indexes. Session writes
//! are primary-key inserts: a duplicate uid fails with `AlreadyExists`.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use drishti_core::{
    BoundingBox, Detection, DetectionObject, Error, PredictionSession, Result, SessionSummary,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::metadata_store::{validate_uid, MetadataStore};

const SCHEMA: &str = r#"
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS prediction_sessions (
        uid TEXT PRIMARY KEY,
        created_at TEXT NOT NULL,
        original_image TEXT NOT NULL,
        predicted_image TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS detection_objects (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        prediction_uid TEXT NOT NULL,
        label TEXT NOT NULL,
        score REAL NOT NULL,
        x1 REAL NOT NULL,
        y1 REAL NOT NULL,
        x2 REAL NOT NULL,
        y2 REAL NOT NULL,
        FOREIGN KEY (prediction_uid) REFERENCES prediction_sessions (uid)
    );

    CREATE INDEX IF NOT EXISTS idx_prediction_uid ON detection_objects (prediction_uid);
    CREATE INDEX IF NOT EXISTS idx_label ON detection_objects (label);
    CREATE INDEX IF NOT EXISTS idx_score ON detection_objects (score);
"#;

pub struct RelationalStore {
    conn: Arc<Mutex<Connection>>,
}

impl RelationalStore {
    /// Open (or create) the database file at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| Error::Storage(format!("Failed to open SQLite database: {}", e)))?;
        let store = Self::with_connection(conn)?;
        info!("Relational metadata store opened at {:?}", path);
        Ok(store)
    }

    /// In-memory database, mostly for tests
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("Failed to create in-memory database: {}", e)))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::Storage(format!("Failed to initialize schema: {}", e)))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut *guard)
        })
        .await
        .map_err(|e| Error::Storage(format!("SQLite task failed: {}", e)))?
    }
}

fn sql_error(context: &str, err: rusqlite::Error) -> Error {
    Error::Storage(format!("{}: {}", context, err))
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("Corrupt created_at '{}': {}", raw, e)))
}

fn insert_session(
    conn: &Connection,
    uid: &str,
    created_at: &str,
    original_ref: &str,
    predicted_ref: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO prediction_sessions (uid, created_at, original_image, predicted_image)
         VALUES (?1, ?2, ?3, ?4)",
        params![uid, created_at, original_ref, predicted_ref],
    )
    .map(|_| ())
    .map_err(|e| {
        if is_constraint_violation(&e) {
            Error::AlreadyExists(format!("Prediction session {}", uid))
        } else {
            sql_error("Failed to insert session", e)
        }
    })
}

fn session_exists(conn: &Connection, uid: &str) -> Result<bool> {
    conn.query_row(
        "SELECT 1 FROM prediction_sessions WHERE uid = ?1",
        [uid],
        |_| Ok(()),
    )
    .optional()
    .map(|row| row.is_some())
    .map_err(|e| sql_error("Failed to look up session", e))
}

fn insert_detection(conn: &Connection, uid: &str, detection: &Detection) -> Result<()> {
    let b = detection.bbox;
    conn.execute(
        "INSERT INTO detection_objects (prediction_uid, label, score, x1, y1, x2, y2)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![uid, detection.label, detection.score, b.x1, b.y1, b.x2, b.y2],
    )
    .map(|_| ())
    .map_err(|e| {
        if is_constraint_violation(&e) {
            Error::SessionNotFound(uid.to_string())
        } else {
            sql_error("Failed to insert detection", e)
        }
    })
}

fn query_summaries(conn: &Connection, sql: &str, param: &dyn rusqlite::ToSql) -> Result<Vec<SessionSummary>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| sql_error("Failed to prepare query", e))?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter([param]), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(|e| sql_error("Failed to run query", e))?;

    let mut summaries = Vec::new();
    for row in rows {
        let (uid, created_at) = row.map_err(|e| sql_error("Failed to read row", e))?;
        summaries.push(SessionSummary {
            uid,
            created_at: parse_timestamp(&created_at)?,
        });
    }
    Ok(summaries)
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[async_trait]
impl MetadataStore for RelationalStore {
    fn backend_name(&self) -> &'static str {
        "relational"
    }

    fn overwrites_sessions(&self) -> bool {
        false
    }

    async fn save_session(&self, uid: &str, original_ref: &str, predicted_ref: &str) -> Result<()> {
        validate_uid(uid)?;
        let (uid, original_ref, predicted_ref) =
            (uid.to_string(), original_ref.to_string(), predicted_ref.to_string());
        self.run(move |conn| {
            insert_session(conn, &uid, &now_timestamp(), &original_ref, &predicted_ref)
        })
        .await
    }

    async fn save_detection(&self, uid: &str, detection: &Detection) -> Result<()> {
        detection.validate()?;
        let uid = uid.to_string();
        let detection = detection.clone();
        self.run(move |conn| {
            if !session_exists(conn, &uid)? {
                return Err(Error::SessionNotFound(uid));
            }
            insert_detection(conn, &uid, &detection)
        })
        .await
    }

    async fn get_session(&self, uid: &str) -> Result<PredictionSession> {
        let uid = uid.to_string();
        self.run(move |conn| {
            let session = conn
                .query_row(
                    "SELECT created_at, original_image, predicted_image
                     FROM prediction_sessions WHERE uid = ?1",
                    [&uid],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()
                .map_err(|e| sql_error("Failed to load session", e))?;

            let (created_at, original_image_ref, predicted_image_ref) =
                session.ok_or_else(|| Error::NotFound(format!("Prediction {}", uid)))?;

            let mut stmt = conn
                .prepare(
                    "SELECT label, score, x1, y1, x2, y2 FROM detection_objects
                     WHERE prediction_uid = ?1 ORDER BY id",
                )
                .map_err(|e| sql_error("Failed to prepare detection query", e))?;
            let rows = stmt
                .query_map([&uid], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        [row.get::<_, f64>(2)?, row.get(3)?, row.get(4)?, row.get(5)?],
                    ))
                })
                .map_err(|e| sql_error("Failed to load detections", e))?;

            let mut detections = Vec::new();
            for row in rows {
                let (label, score, coords) = row.map_err(|e| sql_error("Failed to read detection", e))?;
                detections.push(DetectionObject {
                    prediction_uid: uid.clone(),
                    label,
                    score,
                    bbox: BoundingBox::try_from(coords)?,
                });
            }

            Ok(PredictionSession {
                created_at: parse_timestamp(&created_at)?,
                uid,
                original_image_ref,
                predicted_image_ref,
                detections,
            })
        })
        .await
    }

    async fn list_sessions_by_label(&self, label: &str) -> Result<Vec<SessionSummary>> {
        let label = label.to_string();
        self.run(move |conn| {
            query_summaries(
                conn,
                "SELECT DISTINCT ps.uid, ps.created_at
                 FROM prediction_sessions ps
                 JOIN detection_objects d ON ps.uid = d.prediction_uid
                 WHERE d.label = ?1",
                &label,
            )
        })
        .await
    }

    async fn list_sessions_by_score(&self, min_score: f64) -> Result<Vec<SessionSummary>> {
        self.run(move |conn| {
            query_summaries(
                conn,
                "SELECT DISTINCT ps.uid, ps.created_at
                 FROM prediction_sessions ps
                 JOIN detection_objects d ON ps.uid = d.prediction_uid
                 WHERE d.score >= ?1",
                &min_score,
            )
        })
        .await
    }

    async fn get_predicted_image_ref(&self, uid: &str) -> Result<String> {
        let uid = uid.to_string();
        self.run(move |conn| {
            conn.query_row(
                "SELECT predicted_image FROM prediction_sessions WHERE uid = ?1",
                [&uid],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(|e| sql_error("Failed to load predicted image", e))?
            .ok_or_else(|| Error::NotFound(format!("Prediction {}", uid)))
        })
        .await
    }

    /// One transaction: either the session and all its detections are
    /// committed, or nothing is.
    async fn save_prediction(
        &self,
        uid: &str,
        original_ref: &str,
        predicted_ref: &str,
        detections: &[Detection],
    ) -> Result<()> {
        validate_uid(uid)?;
        for detection in detections {
            detection.validate()?;
        }

        let (uid, original_ref, predicted_ref) =
            (uid.to_string(), original_ref.to_string(), predicted_ref.to_string());
        let detections = detections.to_vec();
        self.run(move |conn| {
            let tx: Transaction<'_> = conn
                .transaction()
                .map_err(|e| sql_error("Failed to begin transaction", e))?;
            insert_session(&tx, &uid, &now_timestamp(), &original_ref, &predicted_ref)?;
            for detection in &detections {
                insert_detection(&tx, &uid, detection)?;
            }
            tx.commit()
                .map_err(|e| sql_error("Failed to commit prediction", e))?;
            debug!("Persisted session {} with {} detections", uid, detections.len());
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person() -> Detection {
        Detection::new("person", 0.91, BoundingBox::new(10.0, 10.0, 50.0, 80.0).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_session_fails() {
        let store = RelationalStore::in_memory().unwrap();
        store.save_session("a", "a.jpg", "predicted/a.jpg").await.unwrap();
        let err = store.save_session("a", "b.jpg", "predicted/b.jpg").await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));

        let session = store.get_session("a").await.unwrap();
        assert_eq!(session.original_image_ref, "a.jpg");
    }

    #[tokio::test]
    async fn test_detection_requires_session() {
        let store = RelationalStore::in_memory().unwrap();
        let err = store.save_detection("missing", &person()).await.unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_batch_rolls_back_on_duplicate() {
        let store = RelationalStore::in_memory().unwrap();
        store
            .save_prediction("a", "a.jpg", "predicted/a.jpg", &[person()])
            .await
            .unwrap();

        let err = store
            .save_prediction("a", "a.jpg", "predicted/a.jpg", &[person(), person()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));

        // First batch intact, second one left no rows behind
        let session = store.get_session("a").await.unwrap();
        assert_eq!(session.detections.len(), 1);
    }

    #[tokio::test]
    async fn test_detections_keep_insertion_order() {
        let store = RelationalStore::in_memory().unwrap();
        let bbox = BoundingBox::new(0.0, 0.0, 1.0, 1.0).unwrap();
        let detections = vec![
            Detection::new("zebra", 0.3, bbox).unwrap(),
            Detection::new("apple", 0.9, bbox).unwrap(),
            Detection::new("zebra", 0.3, bbox).unwrap(),
        ];
        store.save_prediction("s", "s.png", "predicted/s.png", &detections).await.unwrap();

        let session = store.get_session("s").await.unwrap();
        let labels: Vec<_> = session.detections.iter().map(|d| d.label.as_str()).collect();
        assert_eq!(labels, vec!["zebra", "apple", "zebra"]);
    }

    #[tokio::test]
    async fn test_file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("predictions.db");
        {
            let store = RelationalStore::open(&path).unwrap();
            store.save_prediction("a", "a.jpg", "predicted/a.jpg", &[person()]).await.unwrap();
        }
        let store = RelationalStore::open(&path).unwrap();
        assert_eq!(store.get_predicted_image_ref("a").await.unwrap(), "predicted/a.jpg");
    }

    #[tokio::test]
    async fn test_missing_session_not_found() {
        let store = RelationalStore::in_memory().unwrap();
        assert!(matches!(store.get_session("nope").await, Err(Error::NotFound(_))));
        assert!(matches!(
            store.get_predicted_image_ref("nope").await,
            Err(Error::NotFound(_))
        ));
    }
}
