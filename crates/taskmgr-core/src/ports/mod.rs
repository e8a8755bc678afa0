//! Ports: the seams between the scheduler and the outside world.

pub mod clock;
pub mod document_store;
pub mod id_generator;
pub mod query;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::document_store::{DocumentStore, IndexSchema, Refresh, StoreError, StoredDocument};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::query::{SearchRequest, Sort, SortField, SortOrder, SortValue, TaskFilter};
