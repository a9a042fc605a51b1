//! Postgres-backed implementation of every storage role.
//!
//! # Schema
//! - `feeds` holds one row per payload id (`UNIQUE (payload_id)`).
//! - `feed_recipients (recipient, feed_id, is_spam)` is the recipient index. The primary key on
//!   `(recipient, feed_id)` makes appends idempotent under concurrent writers.
//! - `feed_outbox` holds feeds awaiting live dispatch. Rows are written in the same transaction
//!   as the feed they reference.
//! - `relay_meta (key, value)` holds scalar state such as the broadcast watermark. The watermark
//!   moves through one conditional upsert, so check-and-advance cannot interleave.
//! - `subscribers` is owned by the subscription service and only read here.
//!
//! Migrations are executed at connect time via `sqlx::migrate!("./migrations")`.
//! Database URLs may contain credentials; they are never logged.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{FromRow, PgPool};

use super::{
    FeedQueries, FeedStore, Paged, RecipientIndex, StoreError, SubscriptionDirectory,
    WatermarkStore,
};
use crate::config::StoreConfig;
use crate::feed::{
    DateFilter, Feed, FeedId, FeedPayload, IdFilter, Inserted, NewFeed, NotificationKind,
    PageRequest, SearchCriteria, SenderType,
};

const FEED_COLUMNS: &str = "id, payload_id, sender, channel, sender_type, recipients, payload, \
     source, is_spam, hidden, epoch, expiry, delegate, processed, attempts";

/// Row shape of the `feeds` table.
#[derive(Debug, Clone, FromRow)]
struct DbFeed {
    id: i64,
    payload_id: String,
    sender: String,
    channel: Option<String>,
    sender_type: String,
    recipients: Value,
    payload: Value,
    source: String,
    is_spam: bool,
    hidden: bool,
    epoch: i64,
    expiry: Option<DateTime<Utc>>,
    delegate: Option<String>,
    processed: bool,
    attempts: i32,
}

impl TryFrom<DbFeed> for Feed {
    type Error = StoreError;

    fn try_from(row: DbFeed) -> Result<Self, Self::Error> {
        let sender_type = SenderType::parse(&row.sender_type).ok_or_else(|| {
            StoreError::Unavailable(format!(
                "feed {} has unknown sender type {}",
                row.id, row.sender_type
            ))
        })?;
        Ok(Feed {
            id: row.id,
            payload_id: row.payload_id,
            sender: row.sender,
            channel: row.channel,
            sender_type,
            recipients: serde_json::from_value(row.recipients)?,
            payload: serde_json::from_value(row.payload)?,
            source: row.source,
            is_spam: row.is_spam,
            hidden: row.hidden,
            epoch: row.epoch,
            expiry: row.expiry,
            delegate: row.delegate,
            processed: row.processed,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
        })
    }
}

fn into_feeds(rows: Vec<DbFeed>) -> Result<Vec<Feed>, StoreError> {
    rows.into_iter().map(Feed::try_from).collect()
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn to_total(count: i64) -> usize {
    usize::try_from(count).unwrap_or(0)
}

/// `%term%` with LIKE metacharacters escaped.
fn like_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect, size the pool from configuration and run pending migrations.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| StoreError::Unavailable("postgres url is not configured".into()))?;
        let connect_options = PgConnectOptions::from_str(url)?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_millis(config.acquire_timeout_ms))
            .connect_with(connect_options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!(
            max_connections = config.max_connections,
            "Connected to Postgres store"
        );

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run `select` for one page and `count` for the total, both bound by `bind`.
    async fn paged<F>(&self, where_clause: &str, order: &str, page: PageRequest, bind: F) -> Result<Paged, StoreError>
    where
        F: Fn(Binder<'_>) -> Binder<'_>,
    {
        let count_sql = format!("SELECT COUNT(*) FROM feeds WHERE {where_clause}");
        let total: i64 = bind(Binder::new(&count_sql))
            .into_scalar()
            .fetch_one(&self.pool)
            .await?;

        let select_sql = format!(
            "SELECT {FEED_COLUMNS} FROM feeds WHERE {where_clause} ORDER BY {order} LIMIT {} OFFSET {}",
            to_i64(page.page_size),
            to_i64(page.offset()),
        );
        let rows = bind(Binder::new(&select_sql))
            .into_rows()
            .fetch_all(&self.pool)
            .await?;

        Ok(Paged {
            feeds: into_feeds(rows)?,
            total: to_total(total),
        })
    }
}

/// Collects positional arguments once and replays them into either a row or a count query.
struct Binder<'q> {
    sql: &'q str,
    args: Vec<Arg>,
}

#[derive(Debug, Clone)]
enum Arg {
    Ids(Vec<i64>),
    Strings(Vec<String>),
    Text(Option<String>),
    Bool(Option<bool>),
    Int(i64),
    Date(Option<chrono::NaiveDate>),
}

impl<'q> Binder<'q> {
    fn new(sql: &'q str) -> Self {
        Self {
            sql,
            args: Vec::new(),
        }
    }

    fn arg(mut self, arg: Arg) -> Self {
        self.args.push(arg);
        self
    }

    fn into_rows(
        self,
    ) -> sqlx::query::QueryAs<'q, sqlx::Postgres, DbFeed, sqlx::postgres::PgArguments> {
        let mut query = sqlx::query_as::<_, DbFeed>(self.sql);
        for arg in self.args {
            query = match arg {
                Arg::Ids(v) => query.bind(v),
                Arg::Strings(v) => query.bind(v),
                Arg::Text(v) => query.bind(v),
                Arg::Bool(v) => query.bind(v),
                Arg::Int(v) => query.bind(v),
                Arg::Date(v) => query.bind(v),
            };
        }
        query
    }

    fn into_scalar(
        self,
    ) -> sqlx::query::QueryScalar<'q, sqlx::Postgres, i64, sqlx::postgres::PgArguments> {
        let mut query = sqlx::query_scalar::<_, i64>(self.sql);
        for arg in self.args {
            query = match arg {
                Arg::Ids(v) => query.bind(v),
                Arg::Strings(v) => query.bind(v),
                Arg::Text(v) => query.bind(v),
                Arg::Bool(v) => query.bind(v),
                Arg::Int(v) => query.bind(v),
                Arg::Date(v) => query.bind(v),
            };
        }
        query
    }
}

#[async_trait]
impl FeedStore for PostgresStore {
    async fn insert_feed(&self, feed: NewFeed) -> Result<Inserted, StoreError> {
        let recipients = serde_json::to_value(&feed.recipients)?;
        let payload = serde_json::to_value(&feed.payload)?;

        let mut tx = self.pool.begin().await?;
        let inserted: Option<i64> = sqlx::query_scalar(
            "INSERT INTO feeds (payload_id, sender, channel, sender_type, recipients, payload, \
             source, is_spam, hidden, epoch, expiry, delegate) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (payload_id) DO NOTHING RETURNING id",
        )
        .bind(&feed.payload_id)
        .bind(&feed.sender)
        .bind(&feed.channel)
        .bind(feed.sender_type.as_str())
        .bind(recipients)
        .bind(payload)
        .bind(&feed.source)
        .bind(feed.is_spam)
        .bind(feed.hidden)
        .bind(feed.epoch)
        .bind(feed.expiry)
        .bind(&feed.delegate)
        .fetch_optional(&mut *tx)
        .await?;

        let result = match inserted {
            Some(id) => {
                sqlx::query("INSERT INTO feed_outbox (feed_id) VALUES ($1)")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                Inserted {
                    feed_id: id,
                    created: true,
                }
            }
            None => {
                let id: i64 = sqlx::query_scalar("SELECT id FROM feeds WHERE payload_id = $1")
                    .bind(&feed.payload_id)
                    .fetch_one(&mut *tx)
                    .await?;
                Inserted {
                    feed_id: id,
                    created: false,
                }
            }
        };
        tx.commit().await?;
        Ok(result)
    }

    async fn get_feed(&self, id: FeedId) -> Result<Option<Feed>, StoreError> {
        let sql = format!("SELECT {FEED_COLUMNS} FROM feeds WHERE id = $1");
        let row = sqlx::query_as::<_, DbFeed>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Feed::try_from).transpose()
    }

    async fn mark_processed(&self, id: FeedId, payload: &FeedPayload) -> Result<(), StoreError> {
        let payload = serde_json::to_value(payload)?;
        let result = sqlx::query("UPDATE feeds SET processed = TRUE, payload = $2 WHERE id = $1")
            .bind(id)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn bump_attempts(&self, id: FeedId) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE feeds SET attempts = attempts + 1 WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn retry_candidates(
        &self,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<Feed>, StoreError> {
        let sql = format!(
            "SELECT {FEED_COLUMNS} FROM feeds \
             WHERE processed = FALSE AND is_spam = FALSE AND attempts < $1 \
             AND NOT EXISTS (SELECT 1 FROM feed_outbox o WHERE o.feed_id = feeds.id) \
             ORDER BY attempts ASC, id DESC LIMIT $2"
        );
        let rows = sqlx::query_as::<_, DbFeed>(&sql)
            .bind(i32::try_from(max_attempts).unwrap_or(i32::MAX))
            .bind(to_i64(limit))
            .fetch_all(&self.pool)
            .await?;
        into_feeds(rows)
    }

    async fn pending_dispatch(&self, limit: usize) -> Result<Vec<FeedId>, StoreError> {
        let ids = sqlx::query_scalar("SELECT feed_id FROM feed_outbox ORDER BY feed_id ASC LIMIT $1")
            .bind(to_i64(limit))
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn ack_dispatch(&self, id: FeedId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM feed_outbox WHERE feed_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RecipientIndex for PostgresStore {
    async fn append_feed(
        &self,
        recipient: &str,
        feed_id: FeedId,
        is_spam: bool,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO feed_recipients (recipient, feed_id, is_spam) VALUES ($1, $2, $3) \
             ON CONFLICT (recipient, feed_id) DO NOTHING",
        )
        .bind(recipient)
        .bind(feed_id)
        .bind(is_spam)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_feed_ids(
        &self,
        recipient: &str,
        is_spam: bool,
    ) -> Result<Vec<FeedId>, StoreError> {
        let ids = sqlx::query_scalar(
            "SELECT feed_id FROM feed_recipients WHERE recipient = $1 AND is_spam = $2 \
             ORDER BY feed_id ASC",
        )
        .bind(recipient)
        .bind(is_spam)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn remove_feeds(&self, ids: &[FeedId]) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM feed_recipients WHERE feed_id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl WatermarkStore for PostgresStore {
    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let value = sqlx::query_scalar("SELECT value FROM relay_meta WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: i64) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO relay_meta (key, value) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn advance_if_at_least(&self, key: &str, value: i64) -> Result<bool, StoreError> {
        // No row comes back when the WHERE guard rejects the update.
        let advanced: Option<i64> = sqlx::query_scalar(
            "INSERT INTO relay_meta (key, value) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value \
             WHERE relay_meta.value <= EXCLUDED.value \
             RETURNING value",
        )
        .bind(key)
        .bind(value)
        .fetch_optional(&self.pool)
        .await?;
        Ok(advanced.is_some())
    }
}

#[async_trait]
impl FeedQueries for PostgresStore {
    async fn page_by_ids(
        &self,
        ids: &[FeedId],
        filter: &IdFilter,
        page: PageRequest,
    ) -> Result<Paged, StoreError> {
        if ids.is_empty() {
            return Ok(Paged::default());
        }
        let ids = ids.to_vec();
        self.paged(
            "id = ANY($1) AND ($2 OR NOT hidden) \
             AND ($3::text IS NULL OR sender = $3) \
             AND ($4::boolean IS NULL OR is_spam = $4)",
            "id DESC",
            page,
            |b| {
                b.arg(Arg::Ids(ids.clone()))
                    .arg(Arg::Bool(Some(filter.include_hidden)))
                    .arg(Arg::Text(filter.sender.clone()))
                    .arg(Arg::Bool(filter.is_spam))
            },
        )
        .await
    }

    async fn page_by_sender(
        &self,
        sender: &str,
        kind: Option<NotificationKind>,
        page: PageRequest,
    ) -> Result<Paged, StoreError> {
        let kind = kind.map(|k| k.code().to_string());
        self.paged(
            "sender = $1 AND NOT hidden \
             AND ($2::text IS NULL OR payload->'data'->>'type' = $2)",
            "id DESC",
            page,
            |b| {
                b.arg(Arg::Text(Some(sender.to_string())))
                    .arg(Arg::Text(kind.clone()))
            },
        )
        .await
    }

    async fn search(
        &self,
        criteria: &SearchCriteria,
        page: PageRequest,
    ) -> Result<Paged, StoreError> {
        if criteria.senders.is_empty() {
            return Ok(Paged::default());
        }
        let pattern = criteria.term.as_deref().map(like_pattern);
        let (on, low, high) = match criteria.date {
            Some(DateFilter::On(day)) => (Some(day), None, None),
            Some(DateFilter::Between { low, high }) => (None, Some(low), Some(high)),
            None => (None, None, None),
        };
        self.paged(
            "is_spam = $1 AND sender = ANY($2) \
             AND ($3::text IS NULL \
                  OR payload->'notification'->>'title' ILIKE $3 \
                  OR payload->'notification'->>'body' ILIKE $3 \
                  OR payload->'data'->>'asub' ILIKE $3 \
                  OR payload->'data'->>'amsg' ILIKE $3) \
             AND ($4::date IS NULL OR (to_timestamp(epoch) AT TIME ZONE 'UTC')::date = $4) \
             AND ($5::date IS NULL OR (to_timestamp(epoch) AT TIME ZONE 'UTC')::date > $5) \
             AND ($6::date IS NULL OR (to_timestamp(epoch) AT TIME ZONE 'UTC')::date <= $6)",
            "id DESC",
            page,
            |b| {
                b.arg(Arg::Bool(Some(criteria.is_spam)))
                    .arg(Arg::Strings(criteria.senders.clone()))
                    .arg(Arg::Text(pattern.clone()))
                    .arg(Arg::Date(on))
                    .arg(Arg::Date(low))
                    .arg(Arg::Date(high))
            },
        )
        .await
    }

    async fn page_between(
        &self,
        start: i64,
        end: i64,
        page: PageRequest,
    ) -> Result<Paged, StoreError> {
        self.paged(
            "is_spam = FALSE AND epoch BETWEEN $1 AND $2",
            "id ASC",
            page,
            |b| b.arg(Arg::Int(start)).arg(Arg::Int(end)),
        )
        .await
    }

    async fn distinct_senders(&self, ids: &[FeedId]) -> Result<Vec<String>, StoreError> {
        let senders = sqlx::query_scalar(
            "SELECT sender FROM feeds WHERE id = ANY($1) GROUP BY sender ORDER BY MIN(id)",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(senders)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<Vec<FeedId>, StoreError> {
        let ids = sqlx::query_scalar(
            "DELETE FROM feeds WHERE expiry IS NOT NULL AND expiry < $1 RETURNING id",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

#[async_trait]
impl SubscriptionDirectory for PostgresStore {
    async fn channels_for(&self, subscriber: &str) -> Result<Vec<String>, StoreError> {
        let channels = sqlx::query_scalar(
            "SELECT channel FROM subscribers WHERE subscriber = $1 ORDER BY channel",
        )
        .bind(subscriber)
        .fetch_all(&self.pool)
        .await?;
        Ok(channels)
    }
}
