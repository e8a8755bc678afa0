//! TaskStore - repository of task instances over a `DocumentStore`.
//!
//! 永続化ドキュメントの形を知っているのはここだけ。
//!
//! # 責務
//! - 冪等で version 付きの schema bootstrap
//! - 対応 task type の allow-list (available 検索に必ず適用)
//! - concurrency token による条件付き書き込み
//!
//! conflict はここでは retry しない。負けた競合が問題かどうかは呼び出し側が決める。

mod mapping;

use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::{
    ConcreteTaskInstance, ConcurrencyToken, DocumentMetadata, Result, TaskId, TaskInstance,
    TaskManagerError, TaskStatus,
};
use crate::ports::{
    Clock, DocumentStore, IdGenerator, IndexSchema, Refresh, SearchRequest, Sort, SortField,
    SortValue, StoreError, StoredDocument, TaskFilter,
};

/// Version of the index template this code writes.
pub const SCHEMA_VERSION: u32 = 1;

/// Version of the document semantics this code understands.
pub const API_VERSION: u32 = 1;

pub const DEFAULT_FETCH_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStoreOptions {
    pub index: String,
    pub max_attempts: u32,
    pub api_version: u32,
    pub schema_version: u32,
    pub fetch_batch_size: usize,
}

impl Default for TaskStoreOptions {
    fn default() -> Self {
        Self {
            index: ".task_manager".to_string(),
            max_attempts: 3,
            api_version: API_VERSION,
            schema_version: SCHEMA_VERSION,
            fetch_batch_size: 10,
        }
    }
}

/// Query for `TaskStore::fetch`.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOpts {
    pub filter: TaskFilter,
    /// Empty means `runAt` ascending.
    pub sort: Vec<Sort>,
    pub size: usize,
    pub search_after: Option<Vec<SortValue>>,
}

impl Default for FetchOpts {
    fn default() -> Self {
        Self {
            filter: TaskFilter::default(),
            sort: Vec::new(),
            size: DEFAULT_FETCH_SIZE,
            search_after: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    pub docs: Vec<ConcreteTaskInstance>,
    /// Pass back as `FetchOpts::search_after` for the next page.
    pub search_after: Option<Vec<SortValue>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Deleted,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveResult {
    pub id: TaskId,
    pub outcome: RemoveOutcome,
}

#[derive(Debug, Default)]
struct StoreState {
    initialized: bool,
    supported_types: Vec<String>,
}

pub struct TaskStore {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    id_generator: Arc<dyn IdGenerator>,
    options: TaskStoreOptions,
    state: RwLock<StoreState>,
    /// Serializes bootstrap so concurrent first calls write the schema once.
    init_lock: Mutex<()>,
}

impl TaskStore {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        id_generator: Arc<dyn IdGenerator>,
        options: TaskStoreOptions,
    ) -> Self {
        Self {
            store,
            clock,
            id_generator,
            options,
            state: RwLock::new(StoreState::default()),
            init_lock: Mutex::new(()),
        }
    }

    pub fn options(&self) -> &TaskStoreOptions {
        &self.options
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn is_initialized(&self) -> bool {
        self.read_state().initialized
    }

    pub fn supported_types(&self) -> Vec<String> {
        self.read_state().supported_types.clone()
    }

    /// Extend the task-type allow-list. Only allowed before initialization.
    pub fn add_supported_types<I, S>(&self, types: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.initialized {
            return Err(TaskManagerError::lifecycle(
                "add supported types",
                "initialized",
            ));
        }
        for task_type in types {
            let task_type = task_type.into();
            if !state.supported_types.contains(&task_type) {
                state.supported_types.push(task_type);
            }
        }
        state.supported_types.sort();
        Ok(())
    }

    /// Bootstrap the schema. Fails if this store was already initialized.
    pub async fn init(&self) -> Result<()> {
        let _guard = self.init_lock.lock().await;
        if self.is_initialized() {
            return Err(TaskManagerError::AlreadyInitialized);
        }
        self.bootstrap().await
    }

    /// Bootstrap the schema unless that already happened.
    pub async fn ensure_initialized(&self) -> Result<()> {
        let _guard = self.init_lock.lock().await;
        if self.is_initialized() {
            return Ok(());
        }
        self.bootstrap().await
    }

    async fn bootstrap(&self) -> Result<()> {
        let index = &self.options.index;
        let ours = self.options.schema_version;
        match self.store.schema_version(index).await? {
            None => {
                self.put_schema().await?;
                info!(index = %index, version = ours, "created task index schema");
            }
            Some(theirs) if theirs < ours => {
                self.put_schema().await?;
                info!(index = %index, from = theirs, to = ours, "upgraded task index schema");
            }
            Some(theirs) if theirs > ours => {
                warn!(
                    index = %index,
                    stored = theirs,
                    supported = ours,
                    "task index schema is newer than this node understands; leaving it untouched"
                );
            }
            Some(_) => debug!(index = %index, version = ours, "task index schema is current"),
        }
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .initialized = true;
        Ok(())
    }

    async fn put_schema(&self) -> Result<()> {
        self.store
            .put_schema(&IndexSchema {
                name: self.options.index.clone(),
                version: self.options.schema_version,
            })
            .await?;
        Ok(())
    }

    /// Persist a new task instance.
    ///
    /// Defaults: `scheduledAt = now`, `runAt = scheduledAt + interval` for
    /// recurring tasks and `scheduledAt` otherwise, `attempts = 0`,
    /// `status = idle`.
    pub async fn schedule(&self, instance: TaskInstance) -> Result<ConcreteTaskInstance> {
        self.ensure_initialized().await?;

        let supported = self.supported_types();
        if !supported.contains(&instance.task_type) {
            return Err(TaskManagerError::UnsupportedTaskType {
                task_type: instance.task_type,
                supported,
            });
        }
        if instance.interval.is_some_and(|interval| interval.is_zero()) {
            return Err(TaskManagerError::Validation(
                "interval must be greater than zero".to_string(),
            ));
        }

        let scheduled_at = instance.scheduled_at.unwrap_or_else(|| self.clock.now());
        let run_at = instance.run_at.unwrap_or_else(|| match instance.interval {
            Some(interval) => interval.after(scheduled_at),
            None => scheduled_at,
        });
        let mut concrete = ConcreteTaskInstance {
            id: instance
                .id
                .unwrap_or_else(|| self.id_generator.generate_task_id()),
            token: ConcurrencyToken::new(""),
            task_type: instance.task_type,
            params: instance.params,
            state: instance.state,
            scheduled_at,
            run_at,
            interval: instance.interval,
            attempts: 0,
            status: TaskStatus::Idle,
            user: instance.user,
            scope: instance.scope,
        };

        let document = mapping::to_document(&concrete, self.metadata())?;
        concrete.token = self.store.create(document, Refresh::Immediate).await?;
        debug!(task_id = %concrete.id, task_type = %concrete.task_type, run_at = %concrete.run_at, "scheduled task");
        Ok(concrete)
    }

    /// Paginated listing. A trailing `id` descending sort is always added so
    /// `search_after` cursors are unambiguous.
    ///
    /// Fails if any hit cannot be mapped back to an instance.
    pub async fn fetch(&self, opts: FetchOpts) -> Result<FetchResult> {
        let hits = self.search(opts).await?;
        let search_after = hits.last().map(|hit| hit.sort.clone());
        let docs = hits
            .into_iter()
            .map(mapping::from_stored)
            .collect::<Result<Vec<_>>>()?;
        Ok(FetchResult { docs, search_after })
    }

    /// Instances this node may try to claim right now.
    ///
    /// Running instances are not excluded: one whose lease (`runAt`) has
    /// passed is fair game again. Documents that cannot be mapped are logged
    /// and skipped so they never block the rest of the batch.
    pub async fn fetch_available_tasks(&self) -> Result<Vec<ConcreteTaskInstance>> {
        let filter = TaskFilter {
            task_types: Some(self.supported_types()),
            exclude_statuses: vec![TaskStatus::Failed],
            max_attempts: Some(self.options.max_attempts),
            run_at_lte: Some(self.clock.now()),
            max_api_version: Some(self.options.api_version),
            ..TaskFilter::default()
        };
        let hits = self
            .search(FetchOpts {
                filter,
                sort: vec![Sort::asc(SortField::RunAt)],
                size: self.options.fetch_batch_size,
                search_after: None,
            })
            .await?;

        let mut available = Vec::with_capacity(hits.len());
        for hit in hits {
            let id = hit.document.id.clone();
            match mapping::from_stored(hit) {
                Ok(instance) => available.push(instance),
                Err(err) => warn!(task_id = %id, error = %err, "skipping unreadable task document"),
            }
        }
        Ok(available)
    }

    /// Conditional write. Returns the instance carrying its new token.
    pub async fn update(&self, instance: &ConcreteTaskInstance) -> Result<ConcreteTaskInstance> {
        let document = mapping::to_document(instance, self.metadata())?;
        let token = self
            .store
            .update(document, &instance.token, Refresh::Immediate)
            .await?;
        Ok(ConcreteTaskInstance {
            token,
            ..instance.clone()
        })
    }

    /// Unconditional delete; a missing id is reported, not raised.
    pub async fn remove(&self, id: &TaskId) -> Result<RemoveResult> {
        let outcome = match self.store.delete(id, None, Refresh::Immediate).await {
            Ok(()) => RemoveOutcome::Deleted,
            Err(StoreError::NotFound { .. }) => {
                debug!(task_id = %id, "task already removed");
                RemoveOutcome::NotFound
            }
            Err(err) => return Err(err.into()),
        };
        Ok(RemoveResult {
            id: id.clone(),
            outcome,
        })
    }

    /// Delete only if nobody has written the instance since it was read.
    pub async fn remove_claimed(&self, instance: &ConcreteTaskInstance) -> Result<()> {
        self.store
            .delete(&instance.id, Some(&instance.token), Refresh::Immediate)
            .await?;
        Ok(())
    }

    pub async fn get(&self, id: &TaskId) -> Result<Option<ConcreteTaskInstance>> {
        self.store
            .get(id)
            .await?
            .map(mapping::from_stored)
            .transpose()
    }

    async fn search(&self, opts: FetchOpts) -> Result<Vec<StoredDocument>> {
        let mut sort = opts.sort;
        if sort.is_empty() {
            sort.push(Sort::asc(SortField::RunAt));
        }
        if !sort.iter().any(|s| s.field == SortField::Id) {
            sort.push(Sort::desc(SortField::Id));
        }

        let hits = self
            .store
            .search(&SearchRequest {
                filter: opts.filter,
                sort,
                size: opts.size,
                search_after: opts.search_after,
            })
            .await?;
        Ok(hits)
    }

    fn metadata(&self) -> DocumentMetadata {
        DocumentMetadata {
            schema_version: self.options.schema_version,
            api_version: self.options.api_version,
        }
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Interval, TASK_DOCUMENT_TYPE, TaskDocument, TaskFields};
    use crate::impls::InMemoryDocumentStore;
    use crate::ports::{FixedClock, UlidGenerator};
    use chrono::{TimeDelta, TimeZone};
    use rstest::rstest;
    use serde_json::json;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    struct Fixture {
        docs: InMemoryDocumentStore,
        clock: Arc<FixedClock>,
        store: TaskStore,
    }

    fn fixture() -> Fixture {
        let docs = InMemoryDocumentStore::new();
        let clock = Arc::new(FixedClock::new(start()));
        let store = TaskStore::new(
            Arc::new(docs.clone()),
            clock.clone(),
            Arc::new(UlidGenerator::new(clock.clone())),
            TaskStoreOptions::default(),
        );
        store.add_supported_types(["report", "cleanup"]).unwrap();
        Fixture { docs, clock, store }
    }

    #[tokio::test]
    async fn second_init_fails() {
        let f = fixture();
        f.store.init().await.unwrap();
        assert!(matches!(
            f.store.init().await,
            Err(TaskManagerError::AlreadyInitialized)
        ));
        // ensure_initialized stays idempotent
        f.store.ensure_initialized().await.unwrap();
    }

    #[rstest]
    #[case::fresh(None, Some(SCHEMA_VERSION))]
    #[case::older(Some(SCHEMA_VERSION - 1), Some(SCHEMA_VERSION))]
    #[case::equal(Some(SCHEMA_VERSION), Some(SCHEMA_VERSION))]
    #[case::newer(Some(SCHEMA_VERSION + 1), Some(SCHEMA_VERSION + 1))]
    #[tokio::test]
    async fn bootstrap_is_version_gated(
        #[case] existing: Option<u32>,
        #[case] expected: Option<u32>,
    ) {
        let f = fixture();
        if let Some(version) = existing {
            f.docs
                .put_schema(&IndexSchema {
                    name: ".task_manager".into(),
                    version,
                })
                .await
                .unwrap();
        }

        f.store.init().await.unwrap();

        assert!(f.store.is_initialized());
        assert_eq!(f.docs.schema_version(".task_manager").await.unwrap(), expected);
    }

    #[tokio::test]
    async fn init_surfaces_store_outage() {
        let f = fixture();
        f.docs.set_unavailable(Some("no route to host")).await;
        assert!(matches!(
            f.store.init().await,
            Err(TaskManagerError::StoreUnavailable(_))
        ));
        assert!(!f.store.is_initialized());
    }

    #[tokio::test]
    async fn supported_types_are_frozen_after_init() {
        let f = fixture();
        f.store.init().await.unwrap();
        assert!(matches!(
            f.store.add_supported_types(["late"]),
            Err(TaskManagerError::Lifecycle { .. })
        ));
        assert_eq!(f.store.supported_types(), ["cleanup", "report"]);
    }

    #[tokio::test]
    async fn schedule_fills_in_defaults() {
        let f = fixture();
        let one_off = f
            .store
            .schedule(TaskInstance::new("cleanup"))
            .await
            .unwrap();
        assert!(f.store.is_initialized());
        assert_eq!(one_off.scheduled_at, start());
        assert_eq!(one_off.run_at, start());
        assert_eq!(one_off.attempts, 0);
        assert_eq!(one_off.status, TaskStatus::Idle);
        assert_eq!(one_off.params, json!({}));

        let recurring = f
            .store
            .schedule(TaskInstance::new("report").with_interval(Interval::minutes(5)))
            .await
            .unwrap();
        assert_eq!(recurring.run_at, start() + TimeDelta::minutes(5));
        assert_ne!(one_off.id, recurring.id);

        let stored = f.store.get(&recurring.id).await.unwrap().unwrap();
        assert_eq!(stored, recurring);
    }

    #[tokio::test]
    async fn schedule_rejects_unknown_type_and_duplicate_id() {
        let f = fixture();
        let err = f
            .store
            .schedule(TaskInstance::new("nope"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TaskManagerError::UnsupportedTaskType { ref supported, .. }
                if supported == &["cleanup", "report"]
        ));

        f.store
            .schedule(TaskInstance::new("report").with_id("singleton"))
            .await
            .unwrap();
        let err = f
            .store
            .schedule(TaskInstance::new("report").with_id("singleton"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[rstest]
    #[case::seconds(Interval::seconds(0))]
    #[case::minutes(Interval::minutes(0))]
    #[case::hours(Interval::hours(0))]
    #[tokio::test]
    async fn schedule_rejects_zero_interval(#[case] interval: Interval) {
        let f = fixture();
        let err = f
            .store
            .schedule(TaskInstance::new("report").with_interval(interval))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskManagerError::Validation(_)));
        assert!(f.docs.is_empty().await);
    }

    #[tokio::test]
    async fn update_with_stale_token_conflicts_and_keeps_document() {
        let f = fixture();
        let task = f
            .store
            .schedule(TaskInstance::new("report").with_state(json!({ "n": 1 })))
            .await
            .unwrap();

        let updated = f
            .store
            .update(&ConcreteTaskInstance {
                state: json!({ "n": 2 }),
                ..task.clone()
            })
            .await
            .unwrap();

        let err = f
            .store
            .update(&ConcreteTaskInstance {
                state: json!({ "n": 3 }),
                ..task
            })
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let stored = f.store.get(&updated.id).await.unwrap().unwrap();
        assert_eq!(stored.state, json!({ "n": 2 }));
        assert_eq!(stored.token, updated.token);
    }

    #[tokio::test]
    async fn remove_twice_is_benign() {
        let f = fixture();
        let task = f.store.schedule(TaskInstance::new("report")).await.unwrap();

        let first = f.store.remove(&task.id).await.unwrap();
        let second = f.store.remove(&task.id).await.unwrap();

        assert_eq!(first.outcome, RemoveOutcome::Deleted);
        assert_eq!(second.outcome, RemoveOutcome::NotFound);
        assert_eq!(second.id, task.id);
    }

    #[tokio::test]
    async fn remove_claimed_requires_current_token() {
        let f = fixture();
        let task = f.store.schedule(TaskInstance::new("report")).await.unwrap();
        f.store.update(&task).await.unwrap();

        assert!(f.store.remove_claimed(&task).await.unwrap_err().is_conflict());
        assert!(f.store.get(&task.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn fetch_paginates_with_cursor() {
        let f = fixture();
        for minutes in [30, 10, 20] {
            f.store
                .schedule(
                    TaskInstance::new("report").with_run_at(start() + TimeDelta::minutes(minutes)),
                )
                .await
                .unwrap();
        }

        let page1 = f
            .store
            .fetch(FetchOpts {
                size: 2,
                ..FetchOpts::default()
            })
            .await
            .unwrap();
        let run_ats: Vec<_> = page1.docs.iter().map(|d| d.run_at).collect();
        assert_eq!(
            run_ats,
            [start() + TimeDelta::minutes(10), start() + TimeDelta::minutes(20)]
        );

        let page2 = f
            .store
            .fetch(FetchOpts {
                size: 2,
                search_after: page1.search_after,
                ..FetchOpts::default()
            })
            .await
            .unwrap();
        assert_eq!(page2.docs.len(), 1);
        assert_eq!(page2.docs[0].run_at, start() + TimeDelta::minutes(30));
    }

    #[tokio::test]
    async fn available_tasks_respect_run_at_and_type() {
        let f = fixture();
        let due = f.store.schedule(TaskInstance::new("report")).await.unwrap();
        f.store
            .schedule(TaskInstance::new("report").with_run_at(start() + TimeDelta::hours(1)))
            .await
            .unwrap();

        let available = f.store.fetch_available_tasks().await.unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].id, due.id);

        f.clock.advance(TimeDelta::hours(1));
        assert_eq!(f.store.fetch_available_tasks().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn available_tasks_skip_newer_api_versions_and_failed_tasks() {
        let f = fixture();
        f.store.init().await.unwrap();

        let mut newer = TaskDocument {
            id: TaskId::new("from-the-future"),
            doc_type: TASK_DOCUMENT_TYPE.to_string(),
            task: TaskFields {
                task_type: "report".into(),
                scheduled_at: start(),
                run_at: start(),
                interval: None,
                attempts: 0,
                status: TaskStatus::Idle,
                params: "{}".into(),
                state: "{}".into(),
                user: None,
                scope: None,
            },
            metadata: DocumentMetadata {
                schema_version: SCHEMA_VERSION,
                api_version: API_VERSION + 1,
            },
        };
        f.docs.insert_raw(newer.clone()).await;

        newer.id = TaskId::new("failed");
        newer.task.status = TaskStatus::Failed;
        newer.metadata.api_version = API_VERSION;
        f.docs.insert_raw(newer).await;

        assert!(f.store.fetch_available_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreadable_documents_do_not_block_available_tasks() {
        let f = fixture();
        let good = f.store.schedule(TaskInstance::new("report")).await.unwrap();
        f.docs
            .insert_raw(TaskDocument {
                id: TaskId::new("corrupt"),
                doc_type: TASK_DOCUMENT_TYPE.to_string(),
                task: TaskFields {
                    task_type: "report".into(),
                    scheduled_at: start(),
                    run_at: start() - TimeDelta::minutes(1),
                    interval: None,
                    attempts: 0,
                    status: TaskStatus::Idle,
                    params: "{}".into(),
                    state: "{not json".into(),
                    user: None,
                    scope: None,
                },
                metadata: DocumentMetadata {
                    schema_version: SCHEMA_VERSION,
                    api_version: API_VERSION,
                },
            })
            .await;

        let available = f.store.fetch_available_tasks().await.unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].id, good.id);

        // operator listing stays strict
        assert!(f.store.fetch(FetchOpts::default()).await.is_err());
    }
}
