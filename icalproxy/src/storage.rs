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

//! # storage
//!
//! The abstraction over the feed *metadata* store: everything the request path and the stats
//! endpoints need. The chunk-oriented, explicitly-transactional operations used by the refresher
//! and notifier are not part of this trait-- they are inherently relational (`FOR UPDATE SKIP
//! LOCKED`) and live on the concrete [Postgres store](crate::postgres::PgStore).
//!
//! [InMemory] is a real, shipped implementation, not a `#[cfg(test)]` mock; the request handler's
//! test suite runs against it (with fault injection for the degraded-path cases), which keeps
//! those tests free of any backing service.

use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use snafu::Backtrace;
use url::Url;

use crate::{
    bodystore,
    feed::{self, Feed, HeaderMap},
    types::{MD5Hash, NormalizedHostname, TTL},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Storage failures, deliberately coarse: the request path treats every [Error::Backend] the same
/// way (fall back to a direct origin fetch), so fine-grained variants would buy nothing. The one
/// distinction that changes caller behavior-- a feed row whose body object has gone missing--
/// gets its own variant.
#[derive(Debug, snafu::Snafu)]
pub enum Error {
    #[snafu(display("{source}"))]
    Backend {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
    #[snafu(display("feed {feed_id} has a metadata row but no stored body"))]
    BodyMissing { feed_id: i64, backtrace: Backtrace },
}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Backend {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
    pub fn body_missing(feed_id: i64) -> Error {
        Error::BodyMissing {
            feed_id,
            backtrace: Backtrace::capture(),
        }
    }
    pub fn is_body_missing(&self) -> bool {
        matches!(self, Error::BodyMissing { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        data carriers                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The metadata slice of a feed row needed by the request path before it decides whether to touch
/// the body at all.
#[derive(Clone, Debug)]
pub struct FeedRow {
    pub contents_md5: MD5Hash,
    pub contents_last_modified: DateTime<Utc>,
    pub fetch_headers: HeaderMap,
}

/// Webhook-pending dispositions for [Backend::commit_feed]. The request path uses the default
/// (never pending: the client already has the new content, and changes it triggers don't come
/// from the refresher); the refresher sets both when a webhook target is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct CommitFeedOptions {
    pub webhook_pending_on_insert: bool,
    pub webhook_pending_on_update: bool,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         the Backend trait                                      //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[async_trait]
pub trait Backend {
    /// Metadata for `url`, or None if it has never been fetched.
    async fn fetch_feed_row(&self, url: &Url) -> Result<Option<FeedRow>>;
    /// Metadata plus body: the success path reads the body from `bodies`, the error path serves
    /// the inline `fetch_error_body`. A row whose body object is gone yields
    /// [Error::BodyMissing].
    async fn fetch_contents_as_feed(
        &self,
        bodies: &(dyn bodystore::Backend + Send + Sync),
        url: &Url,
    ) -> Result<Option<Feed>>;
    /// Upsert by URL. On success: clears the error body, stores the body via `bodies`. On error:
    /// clears `contents_md5`/`contents_size`, stores the error body inline, and leaves
    /// `contents_last_modified` alone.
    async fn commit_feed(
        &self,
        bodies: &(dyn bodystore::Backend + Send + Sync),
        fd: &Feed,
        opts: CommitFeedOptions,
    ) -> Result<()>;
    /// Bump `checked_at` only.
    async fn commit_unchanged(&self, url: &Url, fetched_at: DateTime<Utc>) -> Result<()>;
    /// Force `checked_at` and `contents_last_modified` back to the epoch so the row is selected
    /// on the next refresh cycle.
    async fn expire_feed(&self, url: &Url) -> Result<()>;
    /// Rows whose TTL (per `ttl_map`) has elapsed as of `now`.
    async fn count_pending_refresh(
        &self,
        now: DateTime<Utc>,
        ttl_map: &std::collections::BTreeMap<NormalizedHostname, TTL>,
    ) -> Result<i64>;
    async fn count_pending_webhooks(&self) -> Result<i64>;
    async fn ping(&self) -> Result<()>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      in-memory backend                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug)]
struct StoredRow {
    id: i64,
    url: String,
    checked_at: DateTime<Utc>,
    contents_md5: MD5Hash,
    contents_last_modified: DateTime<Utc>,
    fetch_status: u16,
    fetch_headers: HeaderMap,
    fetch_error_body: Vec<u8>,
    webhook_pending: bool,
}

/// A hashmap-backed [Backend] mirroring the Postgres commit semantics. Used by the handler test
/// suite; also handy for local hacking without a database.
#[derive(Default)]
pub struct InMemory {
    rows: Mutex<HashMap<String, StoredRow>>,
    next_id: AtomicI64,
    poisoned: AtomicBool,
}

#[derive(Debug, snafu::Snafu)]
#[snafu(display("in-memory store poisoned for testing"))]
struct Poisoned;

impl InMemory {
    pub fn new() -> InMemory {
        InMemory {
            next_id: AtomicI64::new(1),
            ..Default::default()
        }
    }
    /// Make every subsequent operation fail, simulating an unreachable database.
    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::SeqCst);
    }
    pub fn heal(&self) {
        self.poisoned.store(false, Ordering::SeqCst);
    }
    fn check(&self) -> Result<()> {
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(Error::new(Poisoned));
        }
        Ok(())
    }
    /// The feed id assigned to `url`, if committed.
    pub fn feed_id(&self, url: &Url) -> Option<i64> {
        self.rows
            .lock()
            .unwrap()
            .get(url.as_str())
            .map(|row| row.id)
    }
    pub fn webhook_pending(&self, url: &Url) -> Option<bool> {
        self.rows
            .lock()
            .unwrap()
            .get(url.as_str())
            .map(|row| row.webhook_pending)
    }
}

#[async_trait]
impl Backend for InMemory {
    async fn fetch_feed_row(&self, url: &Url) -> Result<Option<FeedRow>> {
        self.check()?;
        let rows = self.rows.lock().unwrap();
        Ok(rows.get(url.as_str()).map(|row| FeedRow {
            contents_md5: row.contents_md5.clone(),
            contents_last_modified: row.contents_last_modified,
            fetch_headers: row.fetch_headers.clone(),
        }))
    }

    async fn fetch_contents_as_feed(
        &self,
        bodies: &(dyn bodystore::Backend + Send + Sync),
        url: &Url,
    ) -> Result<Option<Feed>> {
        self.check()?;
        let row = match self.rows.lock().unwrap().get(url.as_str()) {
            Some(row) => row.clone(),
            None => return Ok(None),
        };
        let body = if row.fetch_status >= 400 {
            row.fetch_error_body.clone()
        } else {
            match bodies.fetch(row.id).await {
                Ok(body) => body,
                Err(err) if err.is_not_found() => return Err(Error::body_missing(row.id)),
                Err(err) => return Err(Error::new(err)),
            }
        };
        Ok(Some(Feed {
            url: url.clone(),
            http_headers: row.fetch_headers,
            http_status: row.fetch_status,
            md5: row.contents_md5,
            body,
            fetched_at: row.checked_at,
        }))
    }

    async fn commit_feed(
        &self,
        bodies: &(dyn bodystore::Backend + Send + Sync),
        fd: &Feed,
        opts: CommitFeedOptions,
    ) -> Result<()> {
        self.check()?;
        let checked_at = fd.fetched_at.trunc_subsecs(0);
        let id = {
            let mut rows = self.rows.lock().unwrap();
            match rows.get_mut(fd.url.as_str()) {
                Some(row) => {
                    row.checked_at = checked_at;
                    row.fetch_status = fd.http_status;
                    row.fetch_headers = fd.http_headers.clone();
                    row.webhook_pending = opts.webhook_pending_on_update;
                    if fd.is_error() {
                        row.contents_md5 = MD5Hash::empty();
                        row.fetch_error_body = fd.body.clone();
                        // contents_last_modified intentionally untouched
                    } else {
                        row.contents_md5 = fd.md5.clone();
                        row.contents_last_modified = checked_at;
                        row.fetch_error_body = Vec::new();
                    }
                    row.id
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                    rows.insert(
                        fd.url.as_str().to_owned(),
                        StoredRow {
                            id,
                            url: fd.url.as_str().to_owned(),
                            checked_at,
                            contents_md5: if fd.is_error() {
                                MD5Hash::empty()
                            } else {
                                fd.md5.clone()
                            },
                            contents_last_modified: checked_at,
                            fetch_status: fd.http_status,
                            fetch_headers: fd.http_headers.clone(),
                            fetch_error_body: if fd.is_error() {
                                fd.body.clone()
                            } else {
                                Vec::new()
                            },
                            webhook_pending: opts.webhook_pending_on_insert,
                        },
                    );
                    id
                }
            }
        };
        if !fd.is_error() {
            bodies.store(id, &fd.body).await.map_err(Error::new)?;
        }
        Ok(())
    }

    async fn commit_unchanged(&self, url: &Url, fetched_at: DateTime<Utc>) -> Result<()> {
        self.check()?;
        if let Some(row) = self.rows.lock().unwrap().get_mut(url.as_str()) {
            row.checked_at = fetched_at.trunc_subsecs(0);
        }
        Ok(())
    }

    async fn expire_feed(&self, url: &Url) -> Result<()> {
        self.check()?;
        if let Some(row) = self.rows.lock().unwrap().get_mut(url.as_str()) {
            row.checked_at = DateTime::<Utc>::UNIX_EPOCH;
            row.contents_last_modified = DateTime::<Utc>::UNIX_EPOCH;
        }
        Ok(())
    }

    async fn count_pending_refresh(
        &self,
        now: DateTime<Utc>,
        ttl_map: &std::collections::BTreeMap<NormalizedHostname, TTL>,
    ) -> Result<i64> {
        self.check()?;
        let rows = self.rows.lock().unwrap();
        let mut count = 0;
        for row in rows.values() {
            let ttl = match Url::parse(&row.url) {
                Ok(url) => feed::ttl_for(&url, ttl_map),
                Err(_) => feed::DEFAULT_TTL,
            };
            if row.checked_at < now - ttl.as_chrono() {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn count_pending_webhooks(&self) -> Result<i64> {
        self.check()?;
        let rows = self.rows.lock().unwrap();
        Ok(rows.values().filter(|row| row.webhook_pending).count() as i64)
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }
}
