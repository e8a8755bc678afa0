//! Adapters for the ports.

pub mod memory_store;

pub use self::memory_store::InMemoryDocumentStore;
