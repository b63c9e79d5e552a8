// Copyright (C) 2025 icalproxy contributors
//
// This file is part of icalproxy.
//
// icalproxy is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// icalproxy is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with icalproxy.  If not,
// see <http://www.gnu.org/licenses/>.

//! # postgres
//!
//! The Postgres metadata store. [PgStore] implements [storage::Backend] for the request path, and
//! additionally exposes the connection-level operations the refresher and notifier run inside
//! their explicit transactions (`FOR UPDATE SKIP LOCKED` only means something while the
//! transaction that took the locks is still open, so those operations take a
//! [PgConnection]-- callers decide the transaction boundary).
//!
//! ## The due-chunk query
//!
//! "Which feeds are stale?" is a per-host question: each configured host pattern carries its own
//! TTL. The query is a disjunction with one term per configured pattern plus a default-TTL term:
//!
//! ```sql
//! (starts_with(url_host_rev, $rev) AND checked_at < $now - $ttl) OR ... OR checked_at < $cutoff
//! LIMIT $n FOR UPDATE SKIP LOCKED
//! ```
//!
//! `url_host_rev` stores the *reversed* normalized hostname precisely so this can be a
//! `starts_with`: B-trees index prefixes, not suffixes, and the column is declared with C
//! collation so the planner can rewrite `starts_with` into an index range scan. This query runs
//! every 30 seconds for the life of the deployment; the integration suite pins its plan to the
//! indexes with `EXPLAIN ANALYZE` so a schema edit can't quietly regress it to a sequential scan.

use std::{collections::BTreeMap, str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use snafu::{Backtrace, ResultExt, Snafu};
use sqlx::{
    PgPool, Postgres, QueryBuilder, Row,
    postgres::{PgConnectOptions, PgConnection, PgPoolOptions},
    types::Json,
};
use tracing::info;
use url::Url;

use crate::{
    bodystore,
    config::Config,
    feed::{self, Feed, HeaderMap},
    storage,
    types::{MD5Hash, NormalizedHostname, TTL},
};

/// One transaction as used by the refresher and notifier.
pub type PgTransaction = sqlx::Transaction<'static, Postgres>;

static TABLE: &str = "icalproxy_feeds_v2";

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to begin a transaction: {source}"))]
    Begin {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Storing feed {feed_id}'s body failed: {source}"))]
    Body {
        feed_id: i64,
        source: bodystore::Error,
    },
    #[snafu(display("Failed to clear webhook flags: {source}"))]
    ClearWebhook {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to commit a transaction: {source}"))]
    Commit {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Count query failed: {source}"))]
    Count {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("{url} is not a valid connection string: {source}"))]
    DatabaseUrl {
        url: String,
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("EXPLAIN failed: {source}"))]
    Explain {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to fetch a feed row: {source}"))]
    FetchRow {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Migration failed: {source}"))]
    Migrate {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Ping failed: {source}"))]
    Ping {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Reset failed: {source}"))]
    Reset {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Due-chunk select failed: {source}"))]
    SelectDue {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Pending-webhook select failed: {source}"))]
    SelectWebhooks {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to bump checked_at: {source}"))]
    Unchanged {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to upsert a feed: {source}"))]
    Upsert {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            PgStore                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub struct PgStore {
    pool: PgPool,
}

/// A row as the refresher sees it: just enough to fetch conditionally and to decide whether the
/// result counts as a change.
#[derive(Clone, Debug)]
pub struct RowToProcess {
    pub url: String,
    pub contents_md5: MD5Hash,
    pub fetch_status: u16,
    pub fetch_headers: HeaderMap,
}

/// A row the notifier owes a webhook for.
#[derive(Clone, Debug)]
pub struct PendingWebhook {
    pub id: i64,
    pub url: String,
}

impl PgStore {
    /// Connect (lazily) using the configured URL. When a pooler URL is present it wins, and the
    /// client-side prepared-statement cache is disabled-- transaction-mode poolers hand each
    /// statement to a different server connection, where a cached prepared statement doesn't
    /// exist.
    pub fn connect(cfg: &Config) -> Result<PgStore> {
        let pooled = !cfg.database_connection_pool_url.is_empty();
        let url = if pooled {
            &cfg.database_connection_pool_url
        } else {
            &cfg.database_url
        };
        let mut opts =
            PgConnectOptions::from_str(url).context(DatabaseUrlSnafu { url: url.as_str() })?;
        if pooled {
            opts = opts.statement_cache_capacity(0);
        }
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .acquire_timeout(Duration::from_secs(5))
            .connect_lazy_with(opts);
        Ok(PgStore { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<PgTransaction> {
        self.pool.begin().await.context(BeginSnafu)
    }

    pub async fn commit(tx: PgTransaction) -> Result<()> {
        tx.commit().await.context(CommitSnafu)
    }

    /// Create the table and its indexes if missing. Idempotent.
    pub async fn migrate(&self) -> Result<()> {
        let ddl = format!(
            r#"
CREATE TABLE IF NOT EXISTS {table} (
    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    url TEXT NOT NULL UNIQUE,
    url_host_rev TEXT COLLATE "C" NOT NULL,
    checked_at timestamptz NOT NULL,
    contents_md5 TEXT NOT NULL,
    contents_last_modified timestamptz NOT NULL,
    contents_size INT NOT NULL,
    fetch_status INT NOT NULL,
    fetch_headers JSONB NOT NULL DEFAULT '{{}}',
    fetch_error_body BYTEA NOT NULL DEFAULT '',
    webhook_pending BOOLEAN NOT NULL DEFAULT false
);
CREATE INDEX IF NOT EXISTS {table}_url_host_rev_idx ON {table}(url_host_rev);
CREATE INDEX IF NOT EXISTS {table}_checked_at_idx ON {table}(checked_at);
CREATE INDEX IF NOT EXISTS {table}_webhook_pending_idx ON {table}(webhook_pending) WHERE webhook_pending;
"#,
            table = TABLE
        );
        sqlx::raw_sql(&ddl)
            .execute(&self.pool)
            .await
            .context(MigrateSnafu)?;
        info!("schema_migrated");
        Ok(())
    }

    /// Drop the table. Destructive; development only.
    pub async fn reset(&self) -> Result<()> {
        sqlx::raw_sql(&format!("DROP TABLE IF EXISTS {TABLE}"))
            .execute(&self.pool)
            .await
            .context(ResetSnafu)?;
        info!("schema_reset");
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    //                            connection-level operations                                     //
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// Upsert `fd` by URL on `conn`, writing the body to `bodies` on the success path. See
    /// [storage::Backend::commit_feed] for the field semantics.
    pub async fn commit_feed_on(
        &self,
        conn: &mut PgConnection,
        bodies: &(dyn bodystore::Backend + Send + Sync),
        fd: &Feed,
        opts: storage::CommitFeedOptions,
    ) -> Result<()> {
        // HTTP only knows about whole seconds; truncate so Last-Modified round-trips exactly.
        let checked_at = fd.fetched_at.trunc_subsecs(0);
        let url_host_rev = NormalizedHostname::from_url(&fd.url).reverse();
        if fd.is_error() {
            let q = format!(
                r#"INSERT INTO {TABLE}
(url, url_host_rev, checked_at, fetch_status, fetch_headers, fetch_error_body, contents_md5, contents_last_modified, contents_size, webhook_pending)
VALUES ($1, $2, $3, $4, $5, $6, '', $3, 0, $7)
ON CONFLICT (url) DO UPDATE SET
    url_host_rev=EXCLUDED.url_host_rev,
    checked_at=EXCLUDED.checked_at,
    fetch_status=EXCLUDED.fetch_status,
    fetch_headers=EXCLUDED.fetch_headers,
    fetch_error_body=EXCLUDED.fetch_error_body,
    contents_md5='',
    contents_size=0,
    webhook_pending=$8"#
            );
            sqlx::query(&q)
                .bind(fd.url.as_str())
                .bind(&url_host_rev)
                .bind(checked_at)
                .bind(fd.http_status as i32)
                .bind(Json(&fd.http_headers))
                .bind(&fd.body)
                .bind(opts.webhook_pending_on_insert)
                .bind(opts.webhook_pending_on_update)
                .execute(conn)
                .await
                .context(UpsertSnafu)?;
            return Ok(());
        }
        let q = format!(
            r#"INSERT INTO {TABLE}
(url, url_host_rev, checked_at, fetch_status, fetch_headers, contents_md5, contents_last_modified, contents_size, fetch_error_body, webhook_pending)
VALUES ($1, $2, $3, $4, $5, $6, $3, $7, '', $8)
ON CONFLICT (url) DO UPDATE SET
    url_host_rev=EXCLUDED.url_host_rev,
    checked_at=EXCLUDED.checked_at,
    fetch_status=EXCLUDED.fetch_status,
    fetch_headers=EXCLUDED.fetch_headers,
    contents_md5=EXCLUDED.contents_md5,
    contents_last_modified=EXCLUDED.contents_last_modified,
    contents_size=EXCLUDED.contents_size,
    fetch_error_body='',
    webhook_pending=$9
RETURNING id"#
        );
        let id: i64 = sqlx::query_scalar(&q)
            .bind(fd.url.as_str())
            .bind(&url_host_rev)
            .bind(checked_at)
            .bind(fd.http_status as i32)
            .bind(Json(&fd.http_headers))
            .bind(fd.md5.as_str())
            .bind(fd.body.len() as i32)
            .bind(opts.webhook_pending_on_insert)
            .bind(opts.webhook_pending_on_update)
            .fetch_one(conn)
            .await
            .context(UpsertSnafu)?;
        bodies
            .store(id, &fd.body)
            .await
            .context(BodySnafu { feed_id: id })?;
        Ok(())
    }

    pub async fn commit_unchanged_on(
        &self,
        conn: &mut PgConnection,
        url: &Url,
        fetched_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(&format!("UPDATE {TABLE} SET checked_at=$2 WHERE url=$1"))
            .bind(url.as_str())
            .bind(fetched_at.trunc_subsecs(0))
            .execute(conn)
            .await
            .context(UnchangedSnafu)?;
        Ok(())
    }

    /// The due chunk: rows whose per-host TTL has elapsed, locked for the calling transaction,
    /// skipping rows another instance has already claimed.
    pub async fn select_rows_to_process(
        &self,
        conn: &mut PgConnection,
        now: DateTime<Utc>,
        ttl_map: &BTreeMap<NormalizedHostname, TTL>,
        page_size: i64,
    ) -> Result<Vec<RowToProcess>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT url, contents_md5, fetch_status, fetch_headers FROM {TABLE} WHERE "
        ));
        push_due_conditions(&mut qb, now, ttl_map);
        qb.push(" LIMIT ");
        qb.push_bind(page_size);
        qb.push(" FOR UPDATE SKIP LOCKED");
        let rows = qb
            .build()
            .fetch_all(conn)
            .await
            .context(SelectDueSnafu)?
            .into_iter()
            .map(|row| RowToProcess {
                url: row.get("url"),
                contents_md5: MD5Hash::from(row.get::<String, _>("contents_md5")),
                fetch_status: row.get::<i32, _>("fetch_status") as u16,
                fetch_headers: row.get::<Json<HeaderMap>, _>("fetch_headers").0,
            })
            .collect();
        Ok(rows)
    }

    pub async fn select_pending_webhooks_on(
        &self,
        conn: &mut PgConnection,
        page_size: i64,
    ) -> Result<Vec<PendingWebhook>> {
        let q = format!(
            "SELECT id, url FROM {TABLE} WHERE webhook_pending LIMIT $1 FOR UPDATE SKIP LOCKED"
        );
        let rows = sqlx::query(&q)
            .bind(page_size)
            .fetch_all(conn)
            .await
            .context(SelectWebhooksSnafu)?
            .into_iter()
            .map(|row| PendingWebhook {
                id: row.get("id"),
                url: row.get("url"),
            })
            .collect();
        Ok(rows)
    }

    pub async fn clear_webhook_pending_on(
        &self,
        conn: &mut PgConnection,
        ids: &[i64],
    ) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {TABLE} SET webhook_pending=false WHERE id = ANY($1)"
        ))
        .bind(ids)
        .execute(conn)
        .await
        .context(ClearWebhookSnafu)?;
        Ok(())
    }

    /// The plan for the due-chunk query, for the index-regression test. Seq scans are disabled
    /// and the table re-analyzed first so the planner can't take the easy way out on a small
    /// table.
    pub async fn explain_select_due(
        &self,
        now: DateTime<Utc>,
        ttl_map: &BTreeMap<NormalizedHostname, TTL>,
        page_size: i64,
    ) -> Result<String> {
        let mut tx = self.begin().await?;
        sqlx::raw_sql(&format!("SET enable_seqscan = OFF; ANALYZE {TABLE}"))
            .execute(&mut *tx)
            .await
            .context(ExplainSnafu)?;
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "EXPLAIN ANALYZE SELECT url, contents_md5, fetch_status, fetch_headers FROM {TABLE} WHERE "
        ));
        push_due_conditions(&mut qb, now, ttl_map);
        qb.push(" LIMIT ");
        qb.push_bind(page_size);
        qb.push(" FOR UPDATE SKIP LOCKED");
        let lines: Vec<String> = qb
            .build_query_scalar()
            .fetch_all(&mut *tx)
            .await
            .context(ExplainSnafu)?;
        // Rolls back on drop; ANALYZE side effects are harmless either way.
        Ok(lines.join("\n"))
    }

    pub async fn count_pending_refresh_at(
        &self,
        now: DateTime<Utc>,
        ttl_map: &BTreeMap<NormalizedHostname, TTL>,
    ) -> Result<i64> {
        let mut qb =
            QueryBuilder::<Postgres>::new(format!("SELECT count(1) FROM {TABLE} WHERE "));
        push_due_conditions(&mut qb, now, ttl_map);
        qb.build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .context(CountSnafu)
    }
}

/// Push the shared WHERE disjunction: one `starts_with`/`checked_at` term per configured host
/// pattern, then the default-TTL catch-all.
fn push_due_conditions(
    qb: &mut QueryBuilder<'_, Postgres>,
    now: DateTime<Utc>,
    ttl_map: &BTreeMap<NormalizedHostname, TTL>,
) {
    for (host, ttl) in ttl_map {
        if host.as_str().is_empty() {
            continue;
        }
        qb.push("(starts_with(url_host_rev, ");
        qb.push_bind(host.reverse());
        qb.push(") AND checked_at < ");
        qb.push_bind(now - ttl.as_chrono());
        qb.push(") OR ");
    }
    qb.push("checked_at < ");
    qb.push_bind(now - feed::DEFAULT_TTL.as_chrono());
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                 storage::Backend implementation                                //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[async_trait]
impl storage::Backend for PgStore {
    async fn fetch_feed_row(&self, url: &Url) -> storage::Result<Option<storage::FeedRow>> {
        let q = format!(
            "SELECT contents_md5, contents_last_modified, fetch_headers FROM {TABLE} WHERE url=$1"
        );
        let row = sqlx::query(&q)
            .bind(url.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage::Error::new)?;
        Ok(row.map(|row| storage::FeedRow {
            contents_md5: MD5Hash::from(row.get::<String, _>("contents_md5")),
            contents_last_modified: row.get("contents_last_modified"),
            fetch_headers: row.get::<Json<HeaderMap>, _>("fetch_headers").0,
        }))
    }

    async fn fetch_contents_as_feed(
        &self,
        bodies: &(dyn bodystore::Backend + Send + Sync),
        url: &Url,
    ) -> storage::Result<Option<Feed>> {
        let q = format!(
            "SELECT id, fetch_headers, fetch_status, checked_at, contents_md5, fetch_error_body \
             FROM {TABLE} WHERE url=$1"
        );
        let row = match sqlx::query(&q)
            .bind(url.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage::Error::new)?
        {
            Some(row) => row,
            None => return Ok(None),
        };
        let id: i64 = row.get("id");
        let fetch_status = row.get::<i32, _>("fetch_status") as u16;
        let body = if fetch_status >= 400 {
            row.get::<Vec<u8>, _>("fetch_error_body")
        } else {
            match bodies.fetch(id).await {
                Ok(body) => body,
                Err(err) if err.is_not_found() => return Err(storage::Error::body_missing(id)),
                Err(err) => return Err(storage::Error::new(err)),
            }
        };
        Ok(Some(Feed {
            url: url.clone(),
            http_headers: row.get::<Json<HeaderMap>, _>("fetch_headers").0,
            http_status: fetch_status,
            md5: MD5Hash::from(row.get::<String, _>("contents_md5")),
            body,
            fetched_at: row.get("checked_at"),
        }))
    }

    async fn commit_feed(
        &self,
        bodies: &(dyn bodystore::Backend + Send + Sync),
        fd: &Feed,
        opts: storage::CommitFeedOptions,
    ) -> storage::Result<()> {
        let mut conn = self.pool.acquire().await.map_err(storage::Error::new)?;
        self.commit_feed_on(&mut *conn, bodies, fd, opts)
            .await
            .map_err(storage::Error::new)
    }

    async fn commit_unchanged(&self, url: &Url, fetched_at: DateTime<Utc>) -> storage::Result<()> {
        let mut conn = self.pool.acquire().await.map_err(storage::Error::new)?;
        self.commit_unchanged_on(&mut *conn, url, fetched_at)
            .await
            .map_err(storage::Error::new)
    }

    async fn expire_feed(&self, url: &Url) -> storage::Result<()> {
        sqlx::query(&format!(
            "UPDATE {TABLE} SET checked_at=to_timestamp(0), contents_last_modified=to_timestamp(0) WHERE url=$1"
        ))
        .bind(url.as_str())
        .execute(&self.pool)
        .await
        .map_err(storage::Error::new)?;
        Ok(())
    }

    async fn count_pending_refresh(
        &self,
        now: DateTime<Utc>,
        ttl_map: &BTreeMap<NormalizedHostname, TTL>,
    ) -> storage::Result<i64> {
        self.count_pending_refresh_at(now, ttl_map)
            .await
            .map_err(storage::Error::new)
    }

    async fn count_pending_webhooks(&self) -> storage::Result<i64> {
        sqlx::query_scalar(&format!(
            "SELECT count(1) FROM {TABLE} WHERE webhook_pending"
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(storage::Error::new)
    }

    async fn ping(&self) -> storage::Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(storage::Error::new)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // Everything that talks to a live database lives in icalproxy-test; here we can still pin
    // the shape of the generated due-chunk SQL.
    #[test]
    fn due_conditions_emit_one_term_per_host_plus_the_default() {
        let now = Utc::now();
        let ttl_map = BTreeMap::from([
            (NormalizedHostname::new("EXAMPLEORG"), TTL::from_secs(60)),
            (NormalizedHostname::new("LITHICTECH"), TTL::from_secs(120)),
        ]);
        let mut qb = QueryBuilder::<Postgres>::new("SELECT url FROM t WHERE ");
        push_due_conditions(&mut qb, now, &ttl_map);
        let sql = qb.sql();
        assert_eq!(sql.matches("starts_with(url_host_rev, ").count(), 2);
        assert_eq!(sql.matches(" OR ").count(), 2);
        assert_eq!(sql.matches("checked_at < ").count(), 3);
    }

    #[test]
    fn due_conditions_with_no_hosts_is_just_the_default_cutoff() {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT url FROM t WHERE ");
        push_due_conditions(&mut qb, Utc::now(), &BTreeMap::new());
        let sql = qb.sql();
        assert!(!sql.contains("starts_with"));
        assert_eq!(sql.matches("checked_at < ").count(), 1);
    }
}
