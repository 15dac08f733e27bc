mod sqlite;
mod storage_trait;

pub use sqlite::{DbPool, SqliteStorage};
pub use storage_trait::Storage;
