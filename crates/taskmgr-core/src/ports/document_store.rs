//! DocumentStore port - the shared backing store.
//!
//! The only mutual-exclusion primitive the scheduler relies on is the
//! conditional write offered here: `update` and `delete` succeed only when
//! the caller's token matches the stored one.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{ConcurrencyToken, TaskDocument, TaskId};
use crate::ports::query::{SearchRequest, SortValue};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("version conflict on document {id}")]
    Conflict { id: String },

    #[error("document {id} not found")]
    NotFound { id: String },

    #[error("{0}")]
    Unavailable(String),
}

/// Visibility of a write to subsequent searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Refresh {
    /// Searches observe the write as soon as the call returns.
    Immediate,
    /// Searches may miss the write until the store refreshes on its own.
    #[default]
    Deferred,
}

/// Index template: a name plus the version of the mapping it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSchema {
    pub name: String,
    pub version: u32,
}

/// A document together with the token required to modify it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub document: TaskDocument,
    pub token: ConcurrencyToken,
    /// Sort key of this hit; empty outside `search`.
    pub sort: Vec<SortValue>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Version of the named schema, `None` if it was never written.
    async fn schema_version(&self, name: &str) -> Result<Option<u32>, StoreError>;

    async fn put_schema(&self, schema: &IndexSchema) -> Result<(), StoreError>;

    /// Fails with `Conflict` if the id already exists.
    async fn create(
        &self,
        document: TaskDocument,
        refresh: Refresh,
    ) -> Result<ConcurrencyToken, StoreError>;

    async fn update(
        &self,
        document: TaskDocument,
        token: &ConcurrencyToken,
        refresh: Refresh,
    ) -> Result<ConcurrencyToken, StoreError>;

    /// Unconditional when `token` is `None`.
    async fn delete(
        &self,
        id: &TaskId,
        token: Option<&ConcurrencyToken>,
        refresh: Refresh,
    ) -> Result<(), StoreError>;

    /// Reads the latest write regardless of refresh state.
    async fn get(&self, id: &TaskId) -> Result<Option<StoredDocument>, StoreError>;

    async fn search(&self, request: &SearchRequest) -> Result<Vec<StoredDocument>, StoreError>;
}
