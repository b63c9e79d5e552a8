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

//! # scheduler
//!
//! The one background-loop primitive: run a [Runner] forever at a fixed interval. The refresher
//! and the notifier (and any future periodic job) compose through this. A failing run is logged
//! and counted against the `scheduler.run.errors` metric, and the loop carries on-- a scheduler
//! that stops scheduling because one tick hit a flaky database would be much worse than the
//! error it's reacting to.
//!
//! Cancellation is cooperative: dropping/cancelling the token ends the loop at the next await
//! point. A run aborted mid-flight drops its future, which is what rolls back any open
//! transaction (sqlx transactions roll back on drop) and aborts any in-flight HTTP request.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::metrics::{Instruments, Registration, Sort};

inventory::submit! { Registration::new("scheduler.run.errors", Sort::IntegralCounter) }

/// A periodic job. One `run` call should drain all currently-available work; the scheduler
/// handles the waiting.
#[async_trait]
pub trait Runner: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Spawn a task that executes `runner` forever: run, then sleep `interval` (or exit as soon as
/// `token` is cancelled, including mid-run).
pub fn start<R: Runner>(
    runner: R,
    interval: Duration,
    token: CancellationToken,
    instruments: Arc<Instruments>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let name = runner.name();
        info!(scheduler = name, "scheduler_starting");
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!(scheduler = name, "scheduler_closing");
                    return;
                }
                result = runner.run() => {
                    match result {
                        Ok(()) => debug!(scheduler = name, "scheduler_finished_run"),
                        Err(err) => {
                            error!(scheduler = name, error = %err, "scheduler_run_error");
                            crate::counter_add!(
                                instruments,
                                "scheduler.run.errors",
                                1,
                                &[KeyValue::new("scheduler", name)]
                            );
                        }
                    }
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => (),
                _ = token.cancelled() => {
                    info!(scheduler = name, "scheduler_closing");
                    return;
                }
            }
        }
    })
}
