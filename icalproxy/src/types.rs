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

//! # types
//!
//! Small, widely-shared newtypes. Keeping these thin wrappers (rather than passing `String`s and
//! `Duration`s around) costs almost nothing and has already caught a few bugs at compile time--
//! most notably confusing a hostname with its *normalized* form, which look identical in a
//! debugger at 2AM.

use std::time::Duration;

/// A hostname reduced to the form used for TTL-map keys and the `url_host_rev` column:
/// upper-cased, with every non-alphanumeric byte removed. `sub.example.org` becomes
/// `SUBEXAMPLEORG`.
///
/// The point of the normalization is that configuration arrives through environment variable
/// *names* (`ICAL_TTL_EXAMPLEORG=15m`), which cannot contain dots, so both sides of the
/// comparison have to meet in a dot-free, case-free space.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NormalizedHostname(String);

impl NormalizedHostname {
    /// Normalize a raw hostname (or an already-normalized env-var suffix; the operation is
    /// idempotent).
    pub fn new(hostname: &str) -> NormalizedHostname {
        NormalizedHostname(
            hostname
                .chars()
                .filter(char::is_ascii_alphanumeric)
                .map(|c| c.to_ascii_uppercase())
                .collect(),
        )
    }
    /// Normalize the hostname of `url`; a URL with no host (`mailto:`, say) normalizes to the
    /// empty string, which matches nothing in the TTL map.
    pub fn from_url(url: &url::Url) -> NormalizedHostname {
        NormalizedHostname::new(url.host_str().unwrap_or(""))
    }
    /// The byte-wise reversal of the normalized hostname. Stored in the `url_host_rev` column so
    /// that "hostname ends with X" becomes "column starts with reverse(X)"-- a form a B-tree can
    /// range-scan.
    pub fn reverse(&self) -> String {
        self.0.chars().rev().collect()
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
    pub fn ends_with(&self, suffix: &NormalizedHostname) -> bool {
        self.0.ends_with(&suffix.0)
    }
}

impl std::fmt::Display for NormalizedHostname {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The lowercase hex digest of an MD5 hash; the empty string for feeds whose last fetch was an
/// error.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct MD5Hash(String);

impl MD5Hash {
    pub fn digest(body: &[u8]) -> MD5Hash {
        MD5Hash(format!("{:x}", md5::compute(body)))
    }
    pub fn empty() -> MD5Hash {
        MD5Hash(String::new())
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MD5Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MD5Hash {
    fn from(value: String) -> Self {
        MD5Hash(value)
    }
}

/// A time-to-live: the maximum allowed age between origin fetches for some set of hosts.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct TTL(pub Duration);

impl TTL {
    pub const fn from_secs(secs: u64) -> TTL {
        TTL(Duration::from_secs(secs))
    }
    pub fn as_duration(&self) -> Duration {
        self.0
    }
    pub fn as_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.0).unwrap_or(chrono::Duration::MAX)
    }
}
