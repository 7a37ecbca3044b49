//! Persistence seam used by resync.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use tracing::{instrument, warn};
use uuid::Uuid;

/// Errors raised while reading unread state from persistence.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database query failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// The backend is unreachable or refused the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A row carried a count that cannot be an unread total.
    #[error("invalid unread count {value} for thread {thread_id}")]
    InvalidCount {
        /// Offending thread.
        thread_id: Uuid,
        /// Raw value returned by the query.
        value: i64,
    },
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// One unread message and the thread it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct UnreadMessageRef {
    /// Unread message.
    pub message_id: Uuid,
    /// Its thread.
    pub thread_id: Uuid,
}

/// What the viewer is allowed to observe.
///
/// Change streams carry every row of a table; only messages in `threads`
/// and receipts or calendar entries from the viewer or from `contacts` are
/// surfaced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewerScope {
    /// Threads the viewer participates in.
    pub threads: HashSet<Uuid>,
    /// Users sharing at least one thread with the viewer.
    pub contacts: HashSet<Uuid>,
}

/// Everything one resync replaces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnreadSnapshot {
    /// Authoritative unread count per thread.
    pub counts: HashMap<Uuid, u64>,
    /// Unread messages behind the counts; may be empty.
    pub index: Vec<UnreadMessageRef>,
    /// Visibility filter; `None` leaves changes unfiltered.
    pub scope: Option<ViewerScope>,
}

/// Source of truth for the viewer's unread counts.
#[async_trait]
pub trait UnreadCountStore: Send + Sync {
    /// Unread count per thread for `user_id`.
    ///
    /// # Errors
    /// Returns an error when the backend cannot answer.
    async fn fetch_unread_counts(&self, user_id: Uuid) -> StoreResult<HashMap<Uuid, u64>>;

    /// The unread messages behind the counts, when the store can list them.
    ///
    /// # Errors
    /// Returns an error when the backend cannot answer.
    async fn fetch_unread_index(&self, _user_id: Uuid) -> StoreResult<Vec<UnreadMessageRef>> {
        Ok(Vec::new())
    }

    /// Threads and contacts visible to `user_id`, when the store knows them.
    ///
    /// # Errors
    /// Returns an error when the backend cannot answer.
    async fn fetch_viewer_scope(&self, _user_id: Uuid) -> StoreResult<Option<ViewerScope>> {
        Ok(None)
    }

    /// Counts, index and scope for one resync.
    ///
    /// The default runs the three fetches one after another; a failed index
    /// fetch degrades to an empty index. Stores that can read all three from
    /// one consistent snapshot should override this.
    ///
    /// # Errors
    /// Returns an error when the counts or the scope cannot be fetched.
    async fn fetch_unread_snapshot(&self, user_id: Uuid) -> StoreResult<UnreadSnapshot> {
        let counts = self.fetch_unread_counts(user_id).await?;
        let index = self
            .fetch_unread_index(user_id)
            .await
            .unwrap_or_else(|err| {
                warn!(error = %err, "unread index unavailable; counts applied without it");
                Vec::new()
            });
        let scope = self.fetch_viewer_scope(user_id).await?;

        Ok(UnreadSnapshot {
            counts,
            index,
            scope,
        })
    }
}

const UNREAD_COUNTS_SQL: &str = "\
SELECT m.thread_id, COUNT(*)::BIGINT AS unread \
FROM messages m \
JOIN thread_participants tp ON tp.thread_id = m.thread_id AND tp.user_id = $1 \
LEFT JOIN read_receipts rr ON rr.message_id = m.id AND rr.user_id = $1 \
WHERE m.sender_id <> $1 AND rr.read_at IS NULL \
GROUP BY m.thread_id";

const UNREAD_INDEX_SQL: &str = "\
SELECT m.id AS message_id, m.thread_id \
FROM messages m \
JOIN thread_participants tp ON tp.thread_id = m.thread_id AND tp.user_id = $1 \
LEFT JOIN read_receipts rr ON rr.message_id = m.id AND rr.user_id = $1 \
WHERE m.sender_id <> $1 AND rr.read_at IS NULL";

const VIEWER_THREADS_SQL: &str = "\
SELECT thread_id FROM thread_participants WHERE user_id = $1";

const VIEWER_CONTACTS_SQL: &str = "\
SELECT DISTINCT other.user_id \
FROM thread_participants me \
JOIN thread_participants other ON other.thread_id = me.thread_id \
WHERE me.user_id = $1 AND other.user_id <> $1";

/// [`UnreadCountStore`] backed by the platform's Postgres tables.
#[derive(Clone)]
pub struct PgUnreadCountStore {
    pool: PgPool,
}

impl std::fmt::Debug for PgUnreadCountStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgUnreadCountStore").finish()
    }
}

impl PgUnreadCountStore {
    /// Wraps an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct UnreadRow {
    thread_id: Uuid,
    unread: i64,
}

fn counts_from_rows(rows: Vec<UnreadRow>) -> StoreResult<HashMap<Uuid, u64>> {
    rows.into_iter()
        .map(|row| {
            u64::try_from(row.unread)
                .map(|count| (row.thread_id, count))
                .map_err(|_| StoreError::InvalidCount {
                    thread_id: row.thread_id,
                    value: row.unread,
                })
        })
        .collect()
}

/// Per-thread counts of an index, so both always agree.
fn counts_from_index(index: &[UnreadMessageRef]) -> HashMap<Uuid, u64> {
    let mut counts = HashMap::new();
    for entry in index {
        *counts.entry(entry.thread_id).or_insert(0) += 1;
    }
    counts
}

#[async_trait]
impl UnreadCountStore for PgUnreadCountStore {
    #[instrument(name = "store.fetch_unread_counts", skip(self), err)]
    async fn fetch_unread_counts(&self, user_id: Uuid) -> StoreResult<HashMap<Uuid, u64>> {
        let rows = sqlx::query_as::<_, UnreadRow>(UNREAD_COUNTS_SQL)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        counts_from_rows(rows)
    }

    #[instrument(name = "store.fetch_unread_index", skip(self), err)]
    async fn fetch_unread_index(&self, user_id: Uuid) -> StoreResult<Vec<UnreadMessageRef>> {
        let rows = sqlx::query_as::<_, UnreadMessageRef>(UNREAD_INDEX_SQL)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    #[instrument(name = "store.fetch_viewer_scope", skip(self), err)]
    async fn fetch_viewer_scope(&self, user_id: Uuid) -> StoreResult<Option<ViewerScope>> {
        let threads = sqlx::query_scalar::<_, Uuid>(VIEWER_THREADS_SQL)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        let contacts = sqlx::query_scalar::<_, Uuid>(VIEWER_CONTACTS_SQL)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(Some(ViewerScope {
            threads: threads.into_iter().collect(),
            contacts: contacts.into_iter().collect(),
        }))
    }

    /// Reads the index and scope inside one `REPEATABLE READ` transaction and
    /// derives the counts from the index.
    #[instrument(name = "store.fetch_unread_snapshot", skip(self), err)]
    async fn fetch_unread_snapshot(&self, user_id: Uuid) -> StoreResult<UnreadSnapshot> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let index = sqlx::query_as::<_, UnreadMessageRef>(UNREAD_INDEX_SQL)
            .bind(user_id)
            .fetch_all(&mut *tx)
            .await?;
        let threads = sqlx::query_scalar::<_, Uuid>(VIEWER_THREADS_SQL)
            .bind(user_id)
            .fetch_all(&mut *tx)
            .await?;
        let contacts = sqlx::query_scalar::<_, Uuid>(VIEWER_CONTACTS_SQL)
            .bind(user_id)
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(UnreadSnapshot {
            counts: counts_from_index(&index),
            index,
            scope: Some(ViewerScope {
                threads: threads.into_iter().collect(),
                contacts: contacts.into_iter().collect(),
            }),
        })
    }
}
