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

//! # bodystore
//!
//! Bulk storage for feed bodies, keyed by feed id. Bodies can run to megabytes and are only
//! needed on the serve path, so they live in an object store rather than alongside the metadata
//! row; error-response bodies are small and stay inline in the database.
//!
//! The production implementation is S3-compatible (S3 proper, Cloudflare R2, localstack...);
//! objects are keyed `<prefix>/<feed-id>.ics`. A missing object is a distinct [Error::NotFound]
//! because the request path treats it as a cache miss, not a failure.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::{
    config::{Credentials, ResponseChecksumValidation},
    primitives::ByteStream,
};
use snafu::Backtrace;
use tracing::debug;

use crate::config::Config;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, snafu::Snafu)]
pub enum Error {
    #[snafu(display("no body stored for feed {feed_id}"))]
    NotFound { feed_id: i64, backtrace: Backtrace },
    #[snafu(display("body store: {source}"))]
    Store {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
}

impl Error {
    pub fn store(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Store {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
    pub fn not_found(feed_id: i64) -> Error {
        Error::NotFound {
            feed_id,
            backtrace: Backtrace::capture(),
        }
    }
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         the Backend trait                                      //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[async_trait]
pub trait Backend {
    async fn store(&self, feed_id: i64, body: &[u8]) -> Result<()>;
    /// The stored bytes for `feed_id`, or [Error::NotFound].
    async fn fetch(&self, feed_id: i64) -> Result<Vec<u8>>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       S3-compatible store                                      //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub struct S3Storage {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
}

impl S3Storage {
    /// Build a client from configuration. An explicit endpoint (R2, localstack) switches off
    /// strict response-checksum validation, which non-AWS stores don't reliably implement, and
    /// empty credentials fall through to the SDK's default provider chain.
    pub async fn new(cfg: &Config) -> S3Storage {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new("auto"));
        if !cfg.s3_access_key_secret.is_empty() {
            loader = loader.credentials_provider(Credentials::new(
                cfg.s3_access_key_id.clone(),
                cfg.s3_access_key_secret.clone(),
                None,
                None,
                "icalproxy",
            ));
        }
        let shared = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared)
            // Path-style addressing; virtual-host style breaks against localstack.
            .force_path_style(true);
        if !cfg.s3_endpoint.is_empty() {
            builder = builder
                .endpoint_url(&cfg.s3_endpoint)
                .response_checksum_validation(ResponseChecksumValidation::WhenRequired);
        }
        S3Storage {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            bucket: cfg.s3_bucket.clone(),
            prefix: cfg.s3_prefix.clone(),
        }
    }

    /// Create the configured bucket; development helper behind `icalproxy dev create-bucket`.
    pub async fn create_bucket(&self) -> Result<()> {
        self.client
            .create_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(Error::store)?;
        debug!(bucket = %self.bucket, "bucket_created");
        Ok(())
    }

    fn key(&self, feed_id: i64) -> String {
        format!("{}/{}.ics", self.prefix, feed_id)
    }
}

#[async_trait]
impl Backend for S3Storage {
    async fn store(&self, feed_id: i64, body: &[u8]) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(feed_id))
            .body(ByteStream::from(body.to_vec()))
            .send()
            .await
            .map_err(Error::store)?;
        Ok(())
    }

    async fn fetch(&self, feed_id: i64) -> Result<Vec<u8>> {
        let obj = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key(feed_id))
            .send()
            .await
        {
            Ok(obj) => obj,
            Err(err) => {
                if err
                    .as_service_error()
                    .map(|se| se.is_no_such_key())
                    .unwrap_or(false)
                {
                    return Err(Error::not_found(feed_id));
                }
                return Err(Error::store(err));
            }
        };
        let data = obj.body.collect().await.map_err(Error::store)?;
        Ok(data.into_bytes().to_vec())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       in-memory store                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Hashmap-backed body store for tests and local hacking, with the same not-found semantics as
/// the real thing.
#[derive(Default)]
pub struct InMemory {
    objects: std::sync::Mutex<std::collections::HashMap<i64, Vec<u8>>>,
    poisoned: std::sync::atomic::AtomicBool,
}

#[derive(Debug, snafu::Snafu)]
#[snafu(display("in-memory body store poisoned for testing"))]
struct Poisoned;

impl InMemory {
    pub fn new() -> InMemory {
        InMemory::default()
    }
    /// Drop every stored object; simulates body-store truncation underneath live metadata.
    pub fn clear(&self) {
        self.objects.lock().unwrap().clear();
    }
    pub fn poison(&self) {
        self.poisoned
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }
    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Backend for InMemory {
    async fn store(&self, feed_id: i64, body: &[u8]) -> Result<()> {
        if self.poisoned.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::store(Poisoned));
        }
        self.objects.lock().unwrap().insert(feed_id, body.to_vec());
        Ok(())
    }

    async fn fetch(&self, feed_id: i64) -> Result<Vec<u8>> {
        if self.poisoned.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::store(Poisoned));
        }
        self.objects
            .lock()
            .unwrap()
            .get(&feed_id)
            .cloned()
            .ok_or_else(|| Error::not_found(feed_id))
    }
}
