use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::storage::Feed;
use crate::types::{FeedId, Receipt};
use async_trait::async_trait;
use bytes::Bytes;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, params};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{debug, trace};

pub type DbPool = Pool<SqliteConnectionManager>;

/// Durable feed storage: every feed of every space lives in one `blocks`
/// table keyed by (feed id, seq).
pub struct SqliteFeedStore {
    pool: DbPool,
    feeds: Mutex<HashMap<FeedId, FeedState>>,
}

struct FeedState {
    length: watch::Sender<u64>,
    has_writer: bool,
}

impl SqliteFeedStore {
    pub fn open<P: AsRef<Path>>(path: P, config: &StorageConfig) -> Result<Arc<Self>> {
        let cache_size = config.sqlite_cache_size;
        let busy_timeout = config.sqlite_busy_timeout;
        let path_ref = path.as_ref();

        // Initialize schema with a single connection first
        {
            let conn = Connection::open(path_ref)?;
            conn.pragma_update(None, "cache_size", cache_size)?;
            conn.pragma_update(None, "busy_timeout", busy_timeout)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;

            Self::create_schema(&conn)?;
        }

        let manager = SqliteConnectionManager::file(path_ref).with_init(move |conn| {
            conn.pragma_update(None, "cache_size", cache_size)?;
            conn.pragma_update(None, "busy_timeout", busy_timeout)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            Ok(())
        });

        let pool = Pool::builder().max_size(5).min_idle(Some(1)).build(manager)?;
        debug!("opened feed store at {}", path_ref.display());

        Ok(Arc::new(SqliteFeedStore {
            pool,
            feeds: Mutex::new(HashMap::new()),
        }))
    }

    fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS blocks (
                feed_id BLOB NOT NULL,  -- 8-byte FeedId
                seq INTEGER NOT NULL,   -- 1-based
                data BLOB NOT NULL,
                PRIMARY KEY (feed_id, seq)
            ) WITHOUT ROWID;
            "#,
        )
    }

    /// Every feed that has at least one block
    pub fn feed_ids(&self) -> Result<Vec<FeedId>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT DISTINCT feed_id FROM blocks ORDER BY feed_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            let bytes = row?;
            ids.push(FeedId::from_bytes(&bytes).map_err(|e| Error::Decode(e.to_string()))?);
        }
        Ok(ids)
    }

    /// Open a handle on a feed. At most one writable handle may exist per
    /// feed at a time; it is released when the handle is dropped.
    pub fn open_feed(self: &Arc<Self>, id: FeedId, writable: bool) -> Result<SqliteFeed> {
        let stored = self.stored_length(id)?;

        let mut feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
        let state = feeds.entry(id).or_insert_with(|| FeedState {
            length: watch::channel(stored).0,
            has_writer: false,
        });
        if writable {
            if state.has_writer {
                return Err(Error::WriterExists(id));
            }
            state.has_writer = true;
        }

        Ok(SqliteFeed {
            store: self.clone(),
            id,
            writable,
            length: state.length.subscribe(),
        })
    }

    fn stored_length(&self, id: FeedId) -> Result<u64> {
        let conn = self.pool.get()?;
        let length: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM blocks WHERE feed_id = ?1",
            params![id.bytes()],
            |row| row.get(0),
        )?;
        Ok(length as u64)
    }

    fn publish_length(&self, id: FeedId, length: u64) {
        let feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(state) = feeds.get(&id) {
            state.length.send_if_modified(|current| {
                if length > *current {
                    *current = length;
                    true
                } else {
                    false
                }
            });
        }
    }

    fn release_writer(&self, id: FeedId) {
        let mut feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(state) = feeds.get_mut(&id) {
            state.has_writer = false;
        }
    }
}

/// A handle on one feed of a [`SqliteFeedStore`].
pub struct SqliteFeed {
    store: Arc<SqliteFeedStore>,
    id: FeedId,
    writable: bool,
    length: watch::Receiver<u64>,
}

#[async_trait]
impl Feed for SqliteFeed {
    fn id(&self) -> FeedId {
        self.id
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn len(&self) -> u64 {
        *self.length.borrow()
    }

    fn watch_len(&self) -> watch::Receiver<u64> {
        self.length.clone()
    }

    async fn append(&self, payload: Bytes) -> Result<Receipt> {
        if !self.writable {
            return Err(Error::NotWritable(format!("feed {} is read-only", self.id)));
        }

        let seq = {
            let mut conn = self.store.pool.get()?;
            let tx = conn.transaction()?;
            let last: i64 = tx.query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM blocks WHERE feed_id = ?1",
                params![self.id.bytes()],
                |row| row.get(0),
            )?;
            let seq = last + 1;
            tx.execute(
                "INSERT INTO blocks (feed_id, seq, data) VALUES (?1, ?2, ?3)",
                params![self.id.bytes(), seq, payload.as_ref()],
            )?;
            tx.commit()?;
            seq as u64
        };

        self.store.publish_length(self.id, seq);
        trace!("appended {}:{}", self.id, seq);

        Ok(Receipt {
            feed_id: self.id,
            seq,
        })
    }

    async fn read(&self, index: u64) -> Result<Bytes> {
        let conn = self.store.pool.get()?;
        let result = conn.query_row(
            "SELECT data FROM blocks WHERE feed_id = ?1 AND seq = ?2",
            params![self.id.bytes(), (index + 1) as i64],
            |row| row.get::<_, Vec<u8>>(0),
        );

        match result {
            Ok(data) => Ok(Bytes::from(data)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(Error::OutOfRange {
                feed_id: self.id,
                index,
                length: self.len(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for SqliteFeed {
    fn drop(&mut self) {
        if self.writable {
            self.store.release_writer(self.id);
        }
    }
}
