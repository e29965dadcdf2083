//! Advisory read-side lookups used by the command builders.
//!
//! These consult the eventually consistent projection tables, so they can
//! miss very recent writes; the decider checks on the event streams stay
//! authoritative. Their job is to give fast, friendly rejections (email
//! taken, resource name taken) and to resolve a login email to its user
//! stream.

use std::sync::Arc;

use serde_json::{Value, json};
use uuid::Uuid;

use crate::config::ProjectionTables;
use crate::document_store::{DocumentStore, DocumentStoreError};

/// Internal page size for uniqueness scans.
const SCAN_PAGE: usize = 100;

/// Read-side helper over the projection tables.
#[derive(Clone)]
pub struct ReadSide {
    docs: Arc<dyn DocumentStore>,
    tables: ProjectionTables,
}

impl ReadSide {
    pub fn new(docs: Arc<dyn DocumentStore>, tables: ProjectionTables) -> Self {
        Self { docs, tables }
    }

    /// Resolve an email to its user id, if the projection knows it.
    pub async fn find_user_id_by_email(
        &self,
        email: &str,
    ) -> Result<Option<Uuid>, DocumentStoreError> {
        let row = self
            .first_match(&self.tables.users, "email", json!(email))
            .await?;
        Ok(row
            .as_ref()
            .and_then(|row| row.get("userId"))
            .and_then(Value::as_str)
            .and_then(|id| Uuid::parse_str(id).ok()))
    }

    /// Whether any projected user already claims this email.
    pub async fn email_taken(&self, email: &str) -> Result<bool, DocumentStoreError> {
        Ok(self
            .first_match(&self.tables.users, "email", json!(email))
            .await?
            .is_some())
    }

    /// Whether the projection knows this user id.
    pub async fn user_exists(&self, user_id: Uuid) -> Result<bool, DocumentStoreError> {
        Ok(self
            .docs
            .get(&self.tables.users, &user_id.to_string())
            .await?
            .is_some())
    }

    /// Whether any projected resource already claims this name.
    pub async fn resource_name_taken(&self, name: &str) -> Result<bool, DocumentStoreError> {
        Ok(self
            .first_match(&self.tables.resources, "name", json!(name))
            .await?
            .is_some())
    }

    /// The staleness indicator the query side attaches to responses.
    pub async fn projection_lag(&self) -> Result<Option<Value>, DocumentStoreError> {
        self.docs.get(&self.tables.projection_lag, "main").await
    }

    /// Walk a filtered scan until the first match or exhaustion.
    async fn first_match(
        &self,
        table: &str,
        attr: &str,
        expected: Value,
    ) -> Result<Option<Value>, DocumentStoreError> {
        let filter = vec![(attr.to_string(), expected)];
        let mut cursor = None;
        loop {
            let page = self.docs.scan(table, &filter, SCAN_PAGE, cursor).await?;
            if let Some(item) = page.items.into_iter().next() {
                return Ok(Some(item));
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(None),
            }
        }
    }
}
