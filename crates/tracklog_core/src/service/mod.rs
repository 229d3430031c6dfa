//! History engine orchestration.
//!
//! # Responsibility
//! - Expose the command surface of the engine on top of the repository.
//! - Own the undo journal, the size/category properties and the observer
//!   notification discipline.

pub mod history_worker;
pub mod observer;
pub mod undo;
