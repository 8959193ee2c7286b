use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use docflow_core::models::{Document, DocumentUpdate, UploadStatus};

use crate::traits::DocumentStore;

#[derive(Clone)]
pub struct DocumentRepository {
    pool: PgPool,
}

impl DocumentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentStore for DocumentRepository {
    #[tracing::instrument(skip(self))]
    async fn get(&self, id: Uuid) -> Result<Option<Document>> {
        let document: Option<Document> = sqlx::query_as::<Postgres, Document>(
            r#"
            SELECT
                id,
                path,
                mime_type,
                original_name,
                size,
                upload_status,
                metadata
            FROM documents
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch document")?;

        Ok(document)
    }

    #[tracing::instrument(skip(self, update), fields(next_status = ?update.upload_status))]
    async fn update_if_status(
        &self,
        id: Uuid,
        expected: UploadStatus,
        update: DocumentUpdate,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE documents
            SET upload_status = COALESCE($3, upload_status),
                metadata = CASE
                    WHEN $4::jsonb IS NULL THEN metadata
                    ELSE jsonb_deep_merge(COALESCE(metadata, '{}'::jsonb), $4::jsonb)
                END,
                size = COALESCE($5, size),
                updated_at = NOW()
            WHERE id = $1 AND upload_status = $2
            "#,
        )
        .bind(id)
        .bind(expected)
        .bind(update.upload_status)
        .bind(update.metadata)
        .bind(update.size)
        .execute(&self.pool)
        .await
        .context("Failed to update document")?;

        let matched = result.rows_affected() == 1;
        if matched {
            tracing::debug!(
                document_id = %id,
                expected = %expected,
                "Document updated"
            );
        } else {
            tracing::warn!(
                document_id = %id,
                expected = %expected,
                "Document update skipped, status precondition not met"
            );
        }

        Ok(matched)
    }
}
