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

use std::sync::Arc;

use crate::{bodystore, config::Config, metrics::Instruments, storage};

/// Application state available to all handlers.
///
/// The HTTP client is shared & safe for concurrent use; handing it around through state (rather
/// than a process global) is what lets tests point everything at local doubles.
pub struct IcalProxy {
    pub config: Arc<Config>,
    pub storage: Arc<dyn storage::Backend + Send + Sync>,
    pub bodies: Arc<dyn bodystore::Backend + Send + Sync>,
    pub client: reqwest::Client,
    pub instruments: Arc<Instruments>,
}
