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

//! # refresher
//!
//! The background loop that keeps stored feeds warm: select the due chunk, refetch each row in
//! parallel, commit the outcomes, repeat until nothing is due.
//!
//! Each chunk runs inside ONE transaction. That isn't incidental-- the `FOR UPDATE SKIP LOCKED`
//! select claims the chunk's rows for exactly as long as the transaction is open, which is what
//! lets multiple icalproxy instances run the refresher concurrently without duplicating work.
//! The workers all write through that shared transaction, serialized by a [tokio::sync::Mutex];
//! the network fetches (the slow part) run outside the lock, so the mutex costs little and is a
//! lot simpler than a producer/consumer rewrite would be.
//!
//! Workers never write the same URL twice within a run (the select returns each row once), and
//! the row locks prevent overlap across runs & instances.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snafu::{ResultExt, Snafu};
use tokio::{sync::Mutex, task::JoinSet};
use tracing::{error, info};
use url::Url;

use crate::{
    bodystore,
    config::Config,
    counter_add, feed,
    metrics::{Instruments, Registration, Sort},
    postgres::{PgStore, PgTransaction, RowToProcess},
    scheduler,
    storage::CommitFeedOptions,
};

/// How often the scheduler wakes the refresher.
pub const INTERVAL: Duration = Duration::from_secs(30);

inventory::submit! { Registration::new("refresher.chunks", Sort::IntegralCounter) }
inventory::submit! { Registration::new("refresher.feeds.changed", Sort::IntegralCounter) }
inventory::submit! { Registration::new("refresher.feeds.unchanged", Sort::IntegralCounter) }

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{url} was stored but does not parse as a URL: {source}"))]
    BadStoredUrl {
        url: String,
        source: url::ParseError,
    },
    #[snafu(display("A refresh worker panicked: {source}"))]
    Join { source: tokio::task::JoinError },
    #[snafu(display("{source}"))]
    Store { source: crate::postgres::Error },
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Refresher                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub struct Refresher {
    store: Arc<PgStore>,
    bodies: Arc<dyn bodystore::Backend + Send + Sync>,
    client: reqwest::Client,
    config: Arc<Config>,
    instruments: Arc<Instruments>,
}

impl Refresher {
    pub fn new(
        store: Arc<PgStore>,
        bodies: Arc<dyn bodystore::Backend + Send + Sync>,
        client: reqwest::Client,
        config: Arc<Config>,
        instruments: Arc<Instruments>,
    ) -> Refresher {
        Refresher {
            store,
            bodies,
            client,
            config,
            instruments,
        }
    }

    /// Process chunks until a select comes back empty.
    pub async fn run(&self) -> Result<()> {
        loop {
            let rows = self.process_chunk().await?;
            if rows == 0 {
                return Ok(());
            }
        }
    }

    async fn process_chunk(&self) -> Result<usize> {
        let mut tx = self.store.begin().await.context(StoreSnafu)?;
        let rows = self
            .store
            .select_rows_to_process(
                &mut *tx,
                Utc::now(),
                &self.config.ical_ttl_map,
                self.config.refresh_page_size,
            )
            .await
            .context(StoreSnafu)?;
        info!(row_count = rows.len(), "refresher_processing_chunk");
        if rows.is_empty() {
            PgStore::commit(tx).await.context(StoreSnafu)?;
            return Ok(0);
        }
        counter_add!(self.instruments, "refresher.chunks", 1, &[]);
        let count = rows.len();
        // Concurrency is coupled to the page size; at the default 100 that's a tolerable number
        // of in-flight origin fetches, and the commits behind the mutex are quick.
        let tx = Arc::new(Mutex::new(tx));
        let mut workers = JoinSet::new();
        for row in rows {
            workers.spawn(process_url(
                self.store.clone(),
                self.bodies.clone(),
                self.client.clone(),
                self.config.clone(),
                self.instruments.clone(),
                tx.clone(),
                row,
            ));
        }
        let mut first_err: Option<Error> = None;
        while let Some(joined) = workers.join_next().await {
            match joined.context(JoinSnafu)? {
                Ok(()) => (),
                Err(err) => {
                    let _ = first_err.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_err {
            // Dropping the transaction rolls the whole chunk back; the rows stay due and the
            // next run retries them.
            return Err(err);
        }
        let tx = Arc::into_inner(tx)
            .expect("all workers joined, no other clones can remain")
            .into_inner();
        PgStore::commit(tx).await.context(StoreSnafu)?;
        Ok(count)
    }
}

/// One worker: conditional-fetch the URL, then classify & commit under the transaction mutex.
/// Commit failures are logged rather than propagated (one bad row must not roll back its 99
/// chunk-mates); only malformed state and panics fail the chunk.
async fn process_url(
    store: Arc<PgStore>,
    bodies: Arc<dyn bodystore::Backend + Send + Sync>,
    client: reqwest::Client,
    config: Arc<Config>,
    instruments: Arc<Instruments>,
    tx: Arc<Mutex<PgTransaction>>,
    rtp: RowToProcess,
) -> Result<()> {
    let url = Url::parse(&rtp.url).context(BadStoredUrlSnafu { url: rtp.url.clone() })?;
    let started = std::time::Instant::now();
    let outcome = feed::fetch(
        &client,
        &url,
        Some(&rtp.fetch_headers),
        config.refresh_timeout(),
    )
    .await;

    // An observation counts as unchanged if the origin said 304 (or Cache-Control let us skip
    // the call), the body hashed the same, or the origin is failing with the same status as last
    // time. Everything else is a change worth committing (and webhooking).
    let unchanged: Option<DateTime<Utc>> = match &outcome {
        feed::FetchOutcome::NotModified { fetched_at } => Some(*fetched_at),
        feed::FetchOutcome::Ok(fd) if fd.md5 == rtp.contents_md5 => Some(fd.fetched_at),
        feed::FetchOutcome::OriginError(fd) | feed::FetchOutcome::Transport(fd)
            if fd.http_status == rtp.fetch_status =>
        {
            Some(fd.fetched_at)
        }
        _ => None,
    };

    let mut guard = tx.lock().await;
    let conn = &mut **guard;
    match unchanged {
        Some(fetched_at) => {
            if let Err(err) = store.commit_unchanged_on(conn, &url, fetched_at).await {
                error!(url = %url, error = %err, "refresh_commit_feed_error");
            }
            counter_add!(instruments, "refresher.feeds.unchanged", 1, &[]);
            info!(url = %url, "feed_unchanged");
        }
        None => {
            let fd = match outcome {
                feed::FetchOutcome::Ok(fd)
                | feed::FetchOutcome::OriginError(fd)
                | feed::FetchOutcome::Transport(fd) => fd,
                feed::FetchOutcome::NotModified { .. } => unreachable!("handled as unchanged"),
            };
            let webhook = config.webhook_configured();
            let opts = CommitFeedOptions {
                webhook_pending_on_insert: webhook,
                webhook_pending_on_update: webhook,
            };
            if let Err(err) = store.commit_feed_on(conn, &*bodies, &fd, opts).await {
                error!(url = %url, error = %err, "refresh_commit_feed_error");
            }
            counter_add!(instruments, "refresher.feeds.changed", 1, &[]);
            info!(
                url = %url,
                feed_http_status = fd.http_status,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "feed_change_committed"
            );
        }
    }
    Ok(())
}

#[async_trait]
impl scheduler::Runner for Refresher {
    fn name(&self) -> &'static str {
        "refresher"
    }
    async fn run(&self) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Refresher::run(self).await.map_err(|err| Box::new(err) as _)
    }
}
