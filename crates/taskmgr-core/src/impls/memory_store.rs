//! In-memory document store.
//!
//! scheduler が依存する検索エンジン系 store の性質だけを再現する:
//! - ドキュメントごとの sequence number を concurrency token として使う
//! - Deferred な書き込みは `refresh()` まで検索に見えない
//! - filter / sort / `search_after` ページング付きの search
//! - index 名ごとの schema version

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{ConcurrencyToken, TaskDocument, TaskId};
use crate::ports::{
    DocumentStore, IndexSchema, Refresh, SearchRequest, Sort, SortOrder, SortValue, StoreError,
    StoredDocument,
};

#[derive(Debug, Clone)]
struct Entry {
    document: TaskDocument,
    seq_no: u64,
}

impl Entry {
    fn token(&self) -> ConcurrencyToken {
        ConcurrencyToken::new(self.seq_no.to_string())
    }
}

#[derive(Default)]
struct InMemoryStoreState {
    /// Latest write per id (what `get` sees).
    documents: HashMap<TaskId, Entry>,

    /// Last refreshed snapshot (what `search` sees).
    searchable: HashMap<TaskId, Entry>,

    schemas: HashMap<String, u32>,

    /// Store-wide, so a recreated id never gets an old token back.
    next_seq_no: u64,

    /// Simulated outage; every call fails with `Unavailable`.
    unavailable: Option<String>,
}

impl InMemoryStoreState {
    fn check_available(&self) -> Result<(), StoreError> {
        match &self.unavailable {
            Some(reason) => Err(StoreError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }

    fn write(&mut self, document: TaskDocument, refresh: Refresh) -> ConcurrencyToken {
        self.next_seq_no += 1;
        let entry = Entry {
            document,
            seq_no: self.next_seq_no,
        };
        let token = entry.token();
        self.documents.insert(entry.document.id.clone(), entry);
        self.apply_refresh(refresh);
        token
    }

    fn apply_refresh(&mut self, refresh: Refresh) {
        if refresh == Refresh::Immediate {
            self.searchable = self.documents.clone();
        }
    }

    fn check_token(
        &self,
        id: &TaskId,
        token: Option<&ConcurrencyToken>,
    ) -> Result<(), StoreError> {
        let current = self.documents.get(id).ok_or_else(|| StoreError::NotFound {
            id: id.to_string(),
        })?;
        match token {
            Some(token) if *token != current.token() => Err(StoreError::Conflict {
                id: id.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

fn compare_keys(a: &[SortValue], b: &[SortValue], sort: &[Sort]) -> Ordering {
    for ((left, right), field) in a.iter().zip(b).zip(sort) {
        let ordering = match field.order {
            SortOrder::Asc => left.cmp(right),
            SortOrder::Desc => right.cmp(left),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Shared, cloneable handle; clones see the same documents.
#[derive(Clone, Default)]
pub struct InMemoryDocumentStore {
    state: Arc<Mutex<InMemoryStoreState>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every deferred write searchable.
    pub async fn refresh(&self) {
        self.state.lock().await.apply_refresh(Refresh::Immediate);
    }

    /// Fail every call with `Unavailable(reason)` until cleared with `None`.
    pub async fn set_unavailable(&self, reason: Option<&str>) {
        self.state.lock().await.unavailable = reason.map(str::to_string);
    }

    /// Write a raw document, bypassing version checks. For seeding documents
    /// that were written by other (possibly newer) nodes.
    pub async fn insert_raw(&self, document: TaskDocument) -> ConcurrencyToken {
        self.state.lock().await.write(document, Refresh::Immediate)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.documents.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn schema_version(&self, name: &str) -> Result<Option<u32>, StoreError> {
        let state = self.state.lock().await;
        state.check_available()?;
        Ok(state.schemas.get(name).copied())
    }

    async fn put_schema(&self, schema: &IndexSchema) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        state.schemas.insert(schema.name.clone(), schema.version);
        Ok(())
    }

    async fn create(
        &self,
        document: TaskDocument,
        refresh: Refresh,
    ) -> Result<ConcurrencyToken, StoreError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        if state.documents.contains_key(&document.id) {
            return Err(StoreError::Conflict {
                id: document.id.to_string(),
            });
        }
        Ok(state.write(document, refresh))
    }

    async fn update(
        &self,
        document: TaskDocument,
        token: &ConcurrencyToken,
        refresh: Refresh,
    ) -> Result<ConcurrencyToken, StoreError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        state.check_token(&document.id, Some(token))?;
        Ok(state.write(document, refresh))
    }

    async fn delete(
        &self,
        id: &TaskId,
        token: Option<&ConcurrencyToken>,
        refresh: Refresh,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        state.check_token(id, token)?;
        state.documents.remove(id);
        state.apply_refresh(refresh);
        Ok(())
    }

    async fn get(&self, id: &TaskId) -> Result<Option<StoredDocument>, StoreError> {
        let state = self.state.lock().await;
        state.check_available()?;
        Ok(state.documents.get(id).map(|entry| StoredDocument {
            document: entry.document.clone(),
            token: entry.token(),
            sort: Vec::new(),
        }))
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<StoredDocument>, StoreError> {
        let state = self.state.lock().await;
        state.check_available()?;

        let mut hits: Vec<StoredDocument> = state
            .searchable
            .values()
            .filter(|entry| request.filter.matches(&entry.document))
            .map(|entry| StoredDocument {
                sort: request
                    .sort
                    .iter()
                    .map(|s| s.field.value_of(&entry.document))
                    .collect(),
                document: entry.document.clone(),
                token: entry.token(),
            })
            .collect();

        hits.sort_by(|a, b| compare_keys(&a.sort, &b.sort, &request.sort));
        if let Some(after) = &request.search_after {
            hits.retain(|hit| compare_keys(&hit.sort, after, &request.sort) == Ordering::Greater);
        }
        hits.truncate(request.size);
        Ok(hits)
    }
}
