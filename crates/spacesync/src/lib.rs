// Causal ordering
pub mod clock;
pub mod pipeline;
pub mod selector;
pub mod timeframe;

// Document sync
pub mod crdt;
pub mod data_service;
pub mod doc_handle;
pub mod repo;
pub mod scheduler;

pub mod config;
pub mod error;
pub mod proto;
pub mod storage;
pub mod types;

// Public exports
pub use clock::TimeframeClock;
pub use config::Config;
pub use data_service::{DataService, DataServiceHost, DocumentFilter, SubscribeEvent, Subscription};
pub use doc_handle::{DocHandle, HandleState, OutboundDelta};
pub use error::{Error, Result};
pub use pipeline::Pipeline;
pub use repo::Repo;
pub use scheduler::UpdateScheduler;
pub use selector::{CausalSelector, MessageSelector};
pub use storage::{Feed, MemoryFeed, SqliteFeed, SqliteFeedStore};
pub use timeframe::Timeframe;
pub use types::{Batch, DocUpdate, DocumentId, FeedId, FeedMessage, IdError, Receipt, SpaceId};
