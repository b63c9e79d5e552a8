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

//! Notifier batching semantics: page-sized POSTs, transactional flag clearing, and the retry
//! behavior when a webhook target is failing.

use std::sync::Arc;

use chrono::Utc;
use wiremock::{
    Mock, MockServer, Request, ResponseTemplate,
    matchers::{header, method, path},
};

use icalproxy::{
    bodystore,
    feed::HeaderMap,
    metrics::Instruments,
    notifier::Notifier,
    storage::CommitFeedOptions,
};
use icalproxy_test::{commit, feed_at, raw_row, test_config, test_store, truncate_local};

fn pending_on_insert() -> CommitFeedOptions {
    CommitFeedOptions {
        webhook_pending_on_insert: true,
        webhook_pending_on_update: false,
    }
}

fn urls_in(request: &Request) -> usize {
    let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    body["urls"].as_array().unwrap().len()
}

#[tokio::test]
#[ignore = "requires the dev Postgres at localhost:18042"]
async fn run_notifies_in_batches_and_clears_the_flag() {
    let store = Arc::new(test_store().await);
    truncate_local(&store).await;
    let bodies = bodystore::InMemory::new();
    let webhook = MockServer::start().await;

    // 125 pending rows with a page size of 100 means exactly two POSTs: 100 urls, then 25.
    for i in 0..125 {
        let url = format!("https://localhost/feed-{i}");
        commit(
            &store,
            &bodies,
            &feed_at(&url, HeaderMap::new(), 200, b"FEED", Utc::now()),
            pending_on_insert(),
        )
        .await;
    }
    // And one row that is NOT pending; its URL must never be posted.
    commit(
        &store,
        &bodies,
        &feed_at("https://localhost/feed-10000", HeaderMap::new(), 200, b"FEED", Utc::now()),
        CommitFeedOptions::default(),
    )
    .await;

    Mock::given(method("POST"))
        .and(path("/wh"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&webhook)
        .await;

    let mut cfg = test_config();
    cfg.webhook_url = format!("{}/wh", webhook.uri());
    cfg.webhook_page_size = 100;
    let notifier = Notifier::new(
        store.clone(),
        reqwest::Client::new(),
        Arc::new(cfg),
        Arc::new(Instruments::new("icalproxy-test")),
    );
    notifier.run().await.unwrap();

    let batch_sizes: Vec<usize> = webhook
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(urls_in)
        .collect();
    assert_eq!(batch_sizes, vec![100, 25]);

    let row = raw_row(&store, "https://localhost/feed-5").await;
    assert!(!row.webhook_pending);
    let row = raw_row(&store, "https://localhost/feed-124").await;
    assert!(!row.webhook_pending);
}

#[tokio::test]
#[ignore = "requires the dev Postgres at localhost:18042"]
async fn a_mid_run_failure_keeps_only_the_failed_batch_pending() {
    let store = Arc::new(test_store().await);
    truncate_local(&store).await;
    let bodies = bodystore::InMemory::new();
    let webhook = MockServer::start().await;

    for i in 0..125 {
        let url = format!("https://localhost/feed-{i}");
        commit(
            &store,
            &bodies,
            &feed_at(&url, HeaderMap::new(), 200, b"FEED", Utc::now()),
            pending_on_insert(),
        )
        .await;
    }

    // First batch of 100 succeeds; the second POST fails and must roll back.
    Mock::given(method("POST"))
        .and(path("/wh"))
        .respond_with(ResponseTemplate::new(200))
        .up_to_n_times(1)
        .mount(&webhook)
        .await;
    Mock::given(method("POST"))
        .and(path("/wh"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&webhook)
        .await;

    let mut cfg = test_config();
    cfg.webhook_url = format!("{}/wh", webhook.uri());
    cfg.webhook_page_size = 100;
    let notifier = Notifier::new(
        store.clone(),
        reqwest::Client::new(),
        Arc::new(cfg),
        Arc::new(Instruments::new("icalproxy-test")),
    );
    assert!(notifier.run().await.is_err());

    let still_pending: i64 = sqlx::query_scalar(
        "SELECT count(1) FROM icalproxy_feeds_v2 WHERE webhook_pending AND url_host_rev = 'TSOHLACOL'",
    )
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(still_pending, 25);
}

#[tokio::test]
#[ignore = "requires the dev Postgres at localhost:18042"]
async fn failed_webhooks_roll_back_and_stay_pending() {
    let store = Arc::new(test_store().await);
    truncate_local(&store).await;
    let bodies = bodystore::InMemory::new();
    let webhook = MockServer::start().await;

    commit(
        &store,
        &bodies,
        &feed_at("https://localhost/feed", HeaderMap::new(), 200, b"FEED", Utc::now()),
        pending_on_insert(),
    )
    .await;

    Mock::given(method("POST"))
        .and(path("/wh"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&webhook)
        .await;

    let mut cfg = test_config();
    cfg.webhook_url = format!("{}/wh", webhook.uri());
    let notifier = Notifier::new(
        store.clone(),
        reqwest::Client::new(),
        Arc::new(cfg),
        Arc::new(Instruments::new("icalproxy-test")),
    );
    let err = notifier.run().await.unwrap_err();
    assert!(err.to_string().contains("503"));

    let row = raw_row(&store, "https://localhost/feed").await;
    assert!(row.webhook_pending);
}

#[tokio::test]
#[ignore = "requires the dev Postgres at localhost:18042"]
async fn the_api_key_header_is_included_when_configured() {
    let store = Arc::new(test_store().await);
    truncate_local(&store).await;
    let bodies = bodystore::InMemory::new();
    let webhook = MockServer::start().await;

    commit(
        &store,
        &bodies,
        &feed_at("https://localhost/feed", HeaderMap::new(), 200, b"FEED", Utc::now()),
        pending_on_insert(),
    )
    .await;

    Mock::given(method("POST"))
        .and(path("/wh"))
        .and(header("Authorization", "Apikey sekret"))
        .and(header("Content-Type", "application/json"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&webhook)
        .await;

    let mut cfg = test_config();
    cfg.webhook_url = format!("{}/wh", webhook.uri());
    cfg.api_key = "sekret".to_owned();
    let notifier = Notifier::new(
        store.clone(),
        reqwest::Client::new(),
        Arc::new(cfg),
        Arc::new(Instruments::new("icalproxy-test")),
    );
    notifier.run().await.unwrap();
}
