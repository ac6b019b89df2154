mod memory;
mod sqlite;
mod storage_trait;

pub use memory::MemoryFeed;
pub use sqlite::{DbPool, SqliteFeed, SqliteFeedStore};
pub use storage_trait::Feed;
