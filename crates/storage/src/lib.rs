//! Datastore abstraction and implementations for quality test results.
//!
//! Writes are staged and become visible atomically on `commit`. This crate
//! provides an in-memory backend and a journaled JSON directory backend.

#![warn(missing_docs)]

pub mod trait_;
mod tables;
pub mod memory;
pub mod json_storage;
pub mod codelist;

pub use trait_::{
    Aggregator, CodelistLookup, Datastore, OrganisationSelector, Result, StatusUpdater, Storage,
    StorageError,
};
pub use memory::MemoryStorage;
pub use json_storage::JsonStorage;
pub use codelist::StaticCodelist;
