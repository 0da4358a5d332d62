//! Row Store Client
//!
//! Bookmark rows through PostgREST. Row-level security on the service side
//! scopes every call to the token's user.

use async_trait::async_trait;
use reqwest::Method;

use super::{check_response, request_error, ProjectClient};
use crate::backend::{BackendError, BackendResult, RowStore};
use crate::config::SupabaseConfig;
use crate::model::{Bookmark, NewBookmark, Session};

/// PostgREST-backed [`RowStore`]
pub struct SupabaseRows {
    project: ProjectClient,
    table: String,
    schema: String,
}

impl SupabaseRows {
    pub fn new(project: ProjectClient, config: &SupabaseConfig) -> Self {
        Self {
            project,
            table: config.table.clone(),
            schema: config.schema.clone(),
        }
    }

    fn list_path(&self, owner: &str) -> String {
        format!(
            "/rest/v1/{}?select=*&user_id=eq.{}&order=created_at.desc",
            self.table,
            urlencoding::encode(owner)
        )
    }

    fn row_path(&self, id: &str) -> String {
        format!("/rest/v1/{}?id=eq.{}", self.table, urlencoding::encode(id))
    }
}

#[async_trait]
impl RowStore for SupabaseRows {
    async fn list_bookmarks(&self, session: &Session, owner: &str) -> BackendResult<Vec<Bookmark>> {
        let response = self
            .project
            .request(Method::GET, &self.list_path(owner), Some(&session.access_token))
            .header("Accept-Profile", &self.schema)
            .send()
            .await
            .map_err(request_error)?;

        let rows: Vec<Bookmark> = check_response(response)
            .await?
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;

        tracing::debug!(count = rows.len(), "Fetched bookmarks");
        Ok(rows)
    }

    async fn insert_bookmark(&self, session: &Session, row: NewBookmark) -> BackendResult<()> {
        let response = self
            .project
            .request(
                Method::POST,
                &format!("/rest/v1/{}", self.table),
                Some(&session.access_token),
            )
            .header("Content-Profile", &self.schema)
            .header("Prefer", "return=minimal")
            .json(&[row])
            .send()
            .await
            .map_err(request_error)?;

        check_response(response).await?;
        Ok(())
    }

    async fn delete_bookmark(&self, session: &Session, id: &str) -> BackendResult<()> {
        let response = self
            .project
            .request(Method::DELETE, &self.row_path(id), Some(&session.access_token))
            .header("Content-Profile", &self.schema)
            .send()
            .await
            .map_err(request_error)?;

        check_response(response).await?;
        Ok(())
    }
}
