//! Message log persistence backends.

pub mod traits;
pub mod memory;
pub mod sql;

pub use memory::InMemoryLogStore;
pub use sql::SqlLogStore;
pub use traits::{LogStoreError, MessageLogStore};
