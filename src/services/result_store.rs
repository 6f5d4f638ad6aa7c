//! src/services/result_store.rs
//!
//! Document store for classification verdicts. One document per analysis id
//! in the `results` collection; writes are upserts so a redelivered event
//! overwrites instead of duplicating. The store stamps `created_at` itself.

use crate::models::{envelope::AnalysisId, result::{InferenceResult, ResultDocument}};
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

const INIT_SQL: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Debug, Error)]
pub enum PersistError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type PersistResult<T> = Result<T, PersistError>;

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Create or overwrite the document at `analysis_id`. Returns the document id.
    async fn upsert(
        &self,
        analysis_id: &AnalysisId,
        storage_path: &str,
        result: &InferenceResult,
    ) -> PersistResult<String>;

    async fn get(&self, analysis_id: &str) -> PersistResult<Option<ResultDocument>>;

    /// Cheap connectivity check for readiness probes.
    async fn ping(&self) -> PersistResult<()>;
}

/// `ResultStore` backed by a SQLite `results` table.
#[derive(Clone)]
pub struct SqliteResultStore {
    pub db: Arc<SqlitePool>,
}

impl SqliteResultStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply the embedded schema. Every statement is idempotent.
    pub async fn migrate(&self) -> PersistResult<()> {
        let statements = INIT_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        debug!("running {} migration statements", statements.len());
        for stmt in statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ResultStore for SqliteResultStore {
    async fn upsert(
        &self,
        analysis_id: &AnalysisId,
        storage_path: &str,
        result: &InferenceResult,
    ) -> PersistResult<String> {
        let id = sqlx::query_scalar::<_, String>(
            r#"
            INSERT INTO results (analysis_id, verdict, confidence, storage_path, created_at)
            VALUES (?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            ON CONFLICT(analysis_id) DO UPDATE SET
                verdict = excluded.verdict,
                confidence = excluded.confidence,
                storage_path = excluded.storage_path,
                created_at = excluded.created_at
            RETURNING analysis_id
            "#,
        )
        .bind(analysis_id.as_str())
        .bind(&result.verdict)
        .bind(result.confidence)
        .bind(storage_path)
        .fetch_one(&*self.db)
        .await?;

        Ok(id)
    }

    async fn get(&self, analysis_id: &str) -> PersistResult<Option<ResultDocument>> {
        let doc = sqlx::query_as::<_, ResultDocument>(
            "SELECT analysis_id, verdict, confidence, storage_path, created_at
             FROM results WHERE analysis_id = ?",
        )
        .bind(analysis_id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(doc)
    }

    async fn ping(&self) -> PersistResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }
}
