//! Core history engine for tracklog.
//!
//! Maintains a persistent, time-ordered log of activity entries with
//! derived durations, a bounded undo journal, minimal change notifications
//! and last-writer-wins replica synchronization. This crate is the single
//! source of truth for the engine invariants; hosts own threading, paths
//! and transport.

pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;

pub use logging::{default_log_level, init_logging};
pub use model::entry::{CategoryStats, DerivedEntry, Entry, EntryId, SyncEntry, OPEN_DURATION};
pub use model::fields::FieldMask;
pub use repo::history_repo::{
    HistoryRepository, RepoError, RepoResult, SqliteHistoryRepository,
};
pub use service::history_worker::HistoryWorker;
pub use service::observer::{HistoryObserver, SyncStats};
pub use service::undo::{UndoRecord, UndoStack, MAX_UNDO_DEPTH};
