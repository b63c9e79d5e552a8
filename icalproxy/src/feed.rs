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

//! # feed
//!
//! The [Feed] value, the per-host TTL lookup, and the origin fetcher.
//!
//! The fetcher deserves a word on its error philosophy. An origin returning a 403, a TLS handshake
//! falling over, a DNS name that stopped resolving-- these are all *data* about the feed, not
//! failures of icalproxy, and they all need to be persisted and served to clients. So the fetcher
//! returns a [FetchOutcome] in every case; there is no `Result` to bubble. Transport-level
//! failures are folded into a synthetic status **599** (0 or -1 would be hazardous: every caller
//! in this codebase, and most downstream consumers, test `status >= 400`).
//!
//! The HTTP client is shared, passed in by the caller, and owned by application state-- no
//! process-global client, no test-only swap hook. Injection is the cleaner seam, and [wiremock]
//! makes a swap hook unnecessary anyway.

use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, SubsecRound, Utc};
use reqwest::{
    StatusCode,
    header::{ACCEPT, IF_MODIFIED_SINCE, IF_NONE_MATCH, USER_AGENT},
};
use tracing::debug;
use url::Url;

use crate::{
    config,
    types::{MD5Hash, NormalizedHostname, TTL},
};

/// The Content-Type icalproxy serves successful feeds with, regardless of what the origin said.
pub static CALENDAR_CONTENT_TYPE: &str = "text/calendar; charset=utf-8";

/// General-purpose slow TTL used as a fallback for hosts that don't match a configured, faster
/// TTL, and as a clamp on configured TTLs slower than it. A constant rather than configuration:
/// it caps worst-case staleness and isn't at the operator's discretion.
pub const DEFAULT_TTL: TTL = TTL::from_secs(2 * 60 * 60);

/// Synthetic status for DNS/connect/TLS/timeout/body-read failures.
pub const TRANSPORT_STATUS: u16 = 599;

/// Upper bound applied to `Cache-Control: max-age`. Some origins (sports schedules, notably)
/// claim immutability measured in years; refetching once a day as a worst case is acceptable.
const MAXIMUM_MAX_AGE: i64 = 24 * 60 * 60;

/// Response headers as stored and replayed: name (canonicalized) to *first* value.
pub type HeaderMap = BTreeMap<String, String>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         TTL lookup                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The TTL for `url`: the minimum among all configured entries whose normalized hostname is a
/// suffix of the URL's normalized hostname, clamped to [DEFAULT_TTL].
///
/// A URL host of `foo.example.org` matches both `ICAL_TTL_EXAMPLEORG` and
/// `ICAL_TTL_FOOEXAMPLEORG` entries; suffix matching is what makes a single entry cover a host
/// and all its subdomains.
pub fn ttl_for(url: &Url, ttl_map: &BTreeMap<NormalizedHostname, TTL>) -> TTL {
    let clean = NormalizedHostname::from_url(url);
    let mut result = DEFAULT_TTL;
    for (host, ttl) in ttl_map {
        if clean.ends_with(host) && *ttl < result {
            result = *ttl;
        }
    }
    result
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Feed                                                //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One observation of a feed: the origin's response (or our synthetic rendition of its failure)
/// at `fetched_at`.
#[derive(Clone, Debug)]
pub struct Feed {
    pub url: Url,
    pub http_headers: HeaderMap,
    pub http_status: u16,
    pub body: Vec<u8>,
    pub md5: MD5Hash,
    pub fetched_at: DateTime<Utc>,
}

impl Feed {
    pub fn new(
        url: Url,
        http_headers: HeaderMap,
        http_status: u16,
        body: Vec<u8>,
        fetched_at: DateTime<Utc>,
    ) -> Feed {
        let md5 = MD5Hash::digest(&body);
        Feed {
            url,
            http_headers,
            http_status,
            body,
            md5,
            fetched_at,
        }
    }
    /// An origin (or transport) failure rather than a calendar body.
    pub fn is_error(&self) -> bool {
        self.http_status >= 400
    }
    pub fn content_type(&self) -> &str {
        self.http_headers
            .get("Content-Type")
            .map(String::as_str)
            .unwrap_or("text/plain")
    }
}

/// The classified result of one origin fetch.
#[derive(Debug)]
pub enum FetchOutcome {
    /// 2xx/3xx with the body fully read.
    Ok(Feed),
    /// Origin answered with status >= 400; the body is the origin's error response.
    OriginError(Feed),
    /// Origin said 304, or the previous response's `Cache-Control` let us skip the network
    /// entirely. `fetched_at` is returned for TTL bookkeeping.
    NotModified { fetched_at: DateTime<Utc> },
    /// DNS, connect, TLS, timeout, or body-read failure, rendered as status 599 with the error
    /// text as the body.
    Transport(Feed),
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          fetching                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Perform a conditional GET against the origin.
///
/// `previous_headers` are the stored response headers from the last observation, if any; they
/// drive both the `Cache-Control` short-circuit and the `If-None-Match` / `If-Modified-Since`
/// request headers. `timeout` covers the whole exchange including the body read; a timeout
/// mid-body yields [FetchOutcome::Transport] even if the status line was a 2xx-- staleness must
/// not win over accuracy.
pub async fn fetch(
    client: &reqwest::Client,
    url: &Url,
    previous_headers: Option<&HeaderMap>,
    timeout: Duration,
) -> FetchOutcome {
    let now = Utc::now().trunc_subsecs(0);
    if let Some(prev) = previous_headers {
        if feed_still_cached(prev, now) {
            debug!(url = %url, "cache_control_short_circuit");
            return FetchOutcome::NotModified { fetched_at: now };
        }
    }
    let mut req = client
        .get(url.clone())
        .timeout(timeout)
        .header(USER_AGENT, config::USER_AGENT)
        // Some hosts (hostfully.com) require text/calendar listed specifically in the Accept
        // header. Everyone else is fine with */*.
        .header(ACCEPT, "text/calendar,*/*");
    if let Some(prev) = previous_headers {
        // An unstorable header value (non-ASCII etag, say) is skipped, not fatal: the worst
        // outcome is an unconditional GET.
        if let Some(etag) = prev.get("Etag") {
            if let Ok(value) = reqwest::header::HeaderValue::from_str(etag) {
                req = req.header(IF_NONE_MATCH, value);
            }
        }
        if let Some(last_mod) = prev.get("Last-Modified") {
            if let Ok(value) = reqwest::header::HeaderValue::from_str(last_mod) {
                req = req.header(IF_MODIFIED_SINCE, value);
            }
        }
    }
    let resp = match req.send().await {
        Ok(resp) => resp,
        Err(err) => {
            return FetchOutcome::Transport(Feed::new(
                url.clone(),
                HeaderMap::new(),
                TRANSPORT_STATUS,
                err.to_string().into_bytes(),
                now,
            ));
        }
    };
    if resp.status() == StatusCode::NOT_MODIFIED {
        return FetchOutcome::NotModified { fetched_at: now };
    }
    let http_status = resp.status().as_u16();
    let http_headers = headers_to_map(resp.headers());
    match resp.bytes().await {
        Ok(body) => {
            let feed = Feed::new(url.clone(), http_headers, http_status, body.to_vec(), now);
            if feed.is_error() {
                FetchOutcome::OriginError(feed)
            } else {
                FetchOutcome::Ok(feed)
            }
        }
        Err(err) => {
            // A failed body read must be recorded as an error even if the status line was a
            // success; keep the origin's status if it was already an error.
            let status = if http_status >= 400 {
                http_status
            } else {
                TRANSPORT_STATUS
            };
            let feed = Feed::new(
                url.clone(),
                http_headers,
                status,
                format!("error reading body: {err}").into_bytes(),
                now,
            );
            if http_status >= 400 {
                FetchOutcome::OriginError(feed)
            } else {
                FetchOutcome::Transport(feed)
            }
        }
    }
}

/// True if the previous response's `Date` plus its (capped) `Cache-Control: max-age` still covers
/// `now`. Anything unparseable disables the short-circuit; it never errors.
fn feed_still_cached(headers: &HeaderMap, now: DateTime<Utc>) -> bool {
    let date = match headers.get("Date").map(|d| httpdate::parse_http_date(d)) {
        Some(Ok(date)) => DateTime::<Utc>::from(date),
        _ => return false,
    };
    let max_age = match headers.get("Cache-Control").and_then(|cc| parse_max_age(cc)) {
        Some(seconds) => seconds.min(MAXIMUM_MAX_AGE),
        None => return false,
    };
    now < date + chrono::Duration::seconds(max_age)
}

/// Extract `max-age=N` from a `Cache-Control` value. Directives are comma-separated and
/// case-insensitive per RFC 9111; everything else in the header is ignored.
fn parse_max_age(cache_control: &str) -> Option<i64> {
    cache_control.split(',').find_map(|directive| {
        let (name, value) = directive.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("max-age") {
            value.trim().trim_matches('"').parse::<i64>().ok()
        } else {
            None
        }
    })
}

/// Flatten response headers to a map of canonical name -> first value.
pub fn headers_to_map(headers: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        if let Ok(text) = value.to_str() {
            map.entry(canonical_header_name(name.as_str()))
                .or_insert_with(|| text.to_owned());
        }
    }
    map
}

/// `content-type` -> `Content-Type`. The http crate stores names lowercased; the stored form
/// (and every lookup in this codebase) uses the traditional canonical casing.
fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}
