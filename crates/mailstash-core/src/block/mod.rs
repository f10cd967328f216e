//! Block-structured folder storage.
//!
//! Messages are stored in date-ordered blocks so that the hot paths (the
//! most recent messages) stay in a handful of contiguous chunks. The
//! [`directory`] module owns the generic descriptor-list machinery; the
//! [`store`] module combines a header and a body directory into per-folder
//! storage with async payload loading.

pub mod directory;
pub mod store;

pub use directory::{BlockBudget, BlockDirectory, BlockInfo, DeleteOutcome, InsertOutcome, InsertSlot};
pub use store::{FolderBlockStore, PurgeReport};
