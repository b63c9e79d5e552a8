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

//! # notifier
//!
//! Drains the `webhook_pending` flag: batch-select flagged rows (locked, skipping rows another
//! instance holds), POST the batch's URLs to the configured webhook, clear the flags, commit.
//!
//! The select and the clear share one transaction, so delivery is at-least-once: a crash between
//! the POST and the commit re-delivers the batch on the next tick, but a notification can never
//! be lost. A failed POST returns an error, which drops (and thereby rolls back) the
//! transaction-- the rows simply stay pending. There's deliberately no backoff; the 10-second
//! scheduler tick bounds the retry rate.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::header::USER_AGENT;
use snafu::{ResultExt, Snafu};
use tracing::info;

use crate::{
    config::{self, Config},
    counter_add,
    metrics::{Instruments, Registration, Sort},
    postgres::PgStore,
    scheduler,
};

/// How often the scheduler wakes the notifier.
pub const INTERVAL: Duration = Duration::from_secs(10);

/// Webhook targets get a fixed, short client timeout; a slow consumer should surface as a failed
/// batch, not a hung notifier.
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

inventory::submit! { Registration::new("notifier.batches", Sort::IntegralCounter) }
inventory::submit! { Registration::new("notifier.urls.delivered", Sort::IntegralCounter) }

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to request the webhook: {source}"))]
    Request { source: reqwest::Error },
    #[snafu(display("{source}"))]
    Store { source: crate::postgres::Error },
    #[snafu(display("Error sending webhook: {status}"))]
    WebhookStatus { status: u16 },
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Notifier                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub struct Notifier {
    store: Arc<PgStore>,
    client: reqwest::Client,
    config: Arc<Config>,
    instruments: Arc<Instruments>,
}

impl Notifier {
    pub fn new(
        store: Arc<PgStore>,
        client: reqwest::Client,
        config: Arc<Config>,
        instruments: Arc<Instruments>,
    ) -> Notifier {
        Notifier {
            store,
            client,
            config,
            instruments,
        }
    }

    /// Drain batches until a select comes back empty.
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
            .select_pending_webhooks_on(&mut *tx, self.config.webhook_page_size)
            .await
            .context(StoreSnafu)?;
        info!(row_count = rows.len(), "notifier_processing_chunk");
        if rows.is_empty() {
            PgStore::commit(tx).await.context(StoreSnafu)?;
            return Ok(0);
        }
        let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
        let urls: Vec<&str> = rows.iter().map(|row| row.url.as_str()).collect();

        let mut req = self
            .client
            .post(&self.config.webhook_url)
            .timeout(WEBHOOK_TIMEOUT)
            .header(USER_AGENT, config::USER_AGENT)
            .json(&serde_json::json!({ "urls": urls }));
        if !self.config.api_key.is_empty() {
            req = req.header(
                reqwest::header::AUTHORIZATION,
                format!("Apikey {}", self.config.api_key),
            );
        }
        let resp = req.send().await.context(RequestSnafu)?;
        if resp.status().as_u16() >= 400 {
            // Returning drops `tx`, rolling back; the rows stay pending for the next tick.
            return WebhookStatusSnafu {
                status: resp.status().as_u16(),
            }
            .fail();
        }

        self.store
            .clear_webhook_pending_on(&mut *tx, &ids)
            .await
            .context(StoreSnafu)?;
        PgStore::commit(tx).await.context(StoreSnafu)?;
        counter_add!(self.instruments, "notifier.batches", 1, &[]);
        counter_add!(
            self.instruments,
            "notifier.urls.delivered",
            ids.len() as u64,
            &[]
        );
        Ok(ids.len())
    }
}

#[async_trait]
impl scheduler::Runner for Notifier {
    fn name(&self) -> &'static str {
        "notifier"
    }
    async fn run(&self) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Notifier::run(self).await.map_err(|err| Box::new(err) as _)
    }
}
