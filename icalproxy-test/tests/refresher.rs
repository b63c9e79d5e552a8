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

//! Refresher behavior against a live database: per-host due selection, end-to-end refresh runs,
//! and the index-plan regression check.

use std::sync::Arc;

use chrono::Utc;
use url::Url;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

use icalproxy::{
    bodystore,
    feed::HeaderMap,
    metrics::Instruments,
    refresher::Refresher,
    storage::{Backend as _, CommitFeedOptions},
    types::{NormalizedHostname, TTL},
};
use icalproxy_test::{commit, feed_at, raw_row, test_config, test_store, truncate_local};

fn pending_webhook_opts() -> CommitFeedOptions {
    CommitFeedOptions {
        webhook_pending_on_insert: true,
        webhook_pending_on_update: true,
    }
}

#[tokio::test]
#[ignore = "requires the dev Postgres at localhost:18042"]
async fn run_refreshes_all_feeds_that_need_it() {
    let store = Arc::new(test_store().await);
    truncate_local(&store).await;
    let bodies = Arc::new(bodystore::InMemory::new());
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/expired-ttl.ics"))
        .respond_with(ResponseTemplate::new(200).set_body_string("FETCHED"))
        .mount(&origin)
        .await;

    let expired = format!("{}/expired-ttl.ics", origin.uri());
    let recent = format!("{}/recent-ttl.ics", origin.uri());
    commit(
        &store,
        &bodies,
        &feed_at(&expired, HeaderMap::new(), 200, b"EXPIRED", Utc::now() - chrono::Duration::hours(5)),
        CommitFeedOptions::default(),
    )
    .await;
    commit(
        &store,
        &bodies,
        &feed_at(&recent, HeaderMap::new(), 200, b"RECENT", Utc::now() - chrono::Duration::hours(1)),
        CommitFeedOptions::default(),
    )
    .await;

    let cfg = Arc::new(test_config());
    let refresher = Refresher::new(
        store.clone(),
        bodies.clone(),
        reqwest::Client::new(),
        cfg,
        Arc::new(Instruments::new("icalproxy-test")),
    );
    refresher.run().await.unwrap();

    let refreshed = store
        .fetch_contents_as_feed(&*bodies, &Url::parse(&expired).unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refreshed.body, b"FETCHED");
    // The recent row was not due, so the origin was never asked about it (no mock registered for
    // its path; wiremock would have 404'd it and the body would have changed).
    let untouched = store
        .fetch_contents_as_feed(&*bodies, &Url::parse(&recent).unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(untouched.body, b"RECENT");
}

#[tokio::test]
#[ignore = "requires the dev Postgres at localhost:18042"]
async fn run_commits_rows_that_fail_to_fetch() {
    let store = Arc::new(test_store().await);
    truncate_local(&store).await;
    let bodies = Arc::new(bodystore::InMemory::new());
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/expired-ttl.ics"))
        .respond_with(ResponseTemplate::new(401).set_body_string("errbody"))
        .mount(&origin)
        .await;

    let url = format!("{}/expired-ttl.ics", origin.uri());
    commit(
        &store,
        &bodies,
        &feed_at(&url, HeaderMap::new(), 200, b"EXPIRED", Utc::now() - chrono::Duration::hours(5)),
        CommitFeedOptions::default(),
    )
    .await;

    let refresher = Refresher::new(
        store.clone(),
        bodies.clone(),
        reqwest::Client::new(),
        Arc::new(test_config()),
        Arc::new(Instruments::new("icalproxy-test")),
    );
    refresher.run().await.unwrap();

    let row = store
        .fetch_contents_as_feed(&*bodies, &Url::parse(&url).unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.http_status, 401);
    assert_eq!(row.body, b"errbody");
}

#[tokio::test]
#[ignore = "requires the dev Postgres at localhost:18042"]
async fn run_commits_unchanged_rows_without_moving_last_modified() {
    let store = Arc::new(test_store().await);
    truncate_local(&store).await;
    let bodies = Arc::new(bodystore::InMemory::new());
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/expired-ttl.ics"))
        .respond_with(ResponseTemplate::new(200).set_body_string("SAMEBODY"))
        .mount(&origin)
        .await;

    let url = format!("{}/expired-ttl.ics", origin.uri());
    let committed_at = Utc::now() - chrono::Duration::hours(5);
    commit(
        &store,
        &bodies,
        &feed_at(&url, HeaderMap::new(), 200, b"SAMEBODY", committed_at),
        // Rows flagged for webhooks stay flagged through an unchanged refresh.
        pending_webhook_opts(),
    )
    .await;
    let before = raw_row(&store, &url).await;

    let refresher = Refresher::new(
        store.clone(),
        bodies.clone(),
        reqwest::Client::new(),
        Arc::new(test_config()),
        Arc::new(Instruments::new("icalproxy-test")),
    );
    refresher.run().await.unwrap();

    let after = raw_row(&store, &url).await;
    assert!(after.checked_at > before.checked_at);
    assert_eq!(after.contents_last_modified, before.contents_last_modified);
    assert_eq!(after.contents_md5, before.contents_md5);
    assert!(after.webhook_pending);
}

#[tokio::test]
#[ignore = "requires the dev Postgres at localhost:18042"]
async fn select_rows_to_process_honors_per_host_ttls() {
    // Two custom host patterns with 30- and 60-minute TTLs, and two feeds on each (one fresh for
    // its TTL, one expired). The 45-minute-old rows are what prove the per-host matching: due
    // under a 30-minute TTL, live under a 60-minute one.
    let store = test_store().await;
    truncate_local(&store).await;
    let bodies = bodystore::InMemory::new();

    let mut cfg = test_config();
    cfg.ical_ttl_map.insert(
        NormalizedHostname::new("30MINLOCALHOST"),
        TTL::from_secs(30 * 60),
    );
    cfg.ical_ttl_map.insert(
        NormalizedHostname::new("60MINLOCALHOST"),
        TTL::from_secs(60 * 60),
    );

    for (url, minutes) in [
        ("https://30min.localhost/15old", 15),
        ("https://30min.localhost/45old", 45),
        ("https://60min.localhost/45old", 45),
        ("https://60min.localhost/75old", 75),
    ] {
        commit(
            &store,
            &bodies,
            &feed_at(
                url,
                HeaderMap::new(),
                200,
                b"ORIGINAL",
                Utc::now() - chrono::Duration::minutes(minutes),
            ),
            CommitFeedOptions::default(),
        )
        .await;
    }

    let mut tx = store.begin().await.unwrap();
    let rows = store
        .select_rows_to_process(&mut *tx, Utc::now(), &cfg.ical_ttl_map, cfg.refresh_page_size)
        .await
        .unwrap();
    let mut urls: Vec<&str> = rows.iter().map(|row| row.url.as_str()).collect();
    urls.sort();
    assert_eq!(
        urls,
        vec![
            "https://30min.localhost/45old",
            "https://60min.localhost/75old",
        ]
    );
}

#[tokio::test]
#[ignore = "requires the dev Postgres at localhost:18042"]
async fn the_due_chunk_query_uses_the_indexes() {
    // This is a regression test on *performance*: the due-chunk query runs every 30 seconds
    // forever, and silently degrading to a sequential scan would be a production incident, not a
    // test failure. Bitmap scans over the two condition indexes are the accepted plan.
    let store = test_store().await;
    truncate_local(&store).await;

    let mut cfg = test_config();
    cfg.ical_ttl_map
        .insert(NormalizedHostname::new("EXAMPLEORG"), TTL::from_secs(60));

    let plan = store
        .explain_select_due(Utc::now(), &cfg.ical_ttl_map, cfg.refresh_page_size)
        .await
        .unwrap();
    assert!(
        plan.contains("icalproxy_feeds_v2_url_host_rev_idx"),
        "plan should use the url_host_rev index:\n{plan}"
    );
    assert!(
        plan.contains("icalproxy_feeds_v2_checked_at_idx"),
        "plan should use the checked_at index:\n{plan}"
    );
    assert!(plan.contains("LockRows"), "plan should lock rows:\n{plan}");
    assert!(
        !plan.contains("Seq Scan"),
        "plan regressed to a sequential scan:\n{plan}"
    );
}
