//! The encrypted remote-file index: store, streaming importer and helpers.

pub mod indexer;
pub mod lister;
pub mod records;
pub mod store;
pub mod types;

pub use indexer::{IndexProgress, RemoteIndexer};
pub use store::FileIndex;
pub use types::{IndexStats, IndexedEntry};
