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

//! # metrics
//!
//! icalproxy uses [OpenTelemetry] to collect & export metrics. OTel instruments are meant to be
//! created once & reused, which raises the question of where to keep them; littering the state
//! type with dozens of `Counter<u64>` fields scales poorly, and a stringly-typed map risks two
//! call sites accidentally claiming the same metric name.
//!
//! [OpenTelemetry]: https://docs.rs/opentelemetry/latest/opentelemetry/index.html
//!
//! Instead, call sites *register* their metric names at link time via [inventory]:
//!
//! ```ignore
//! inventory::submit! { metrics::Registration::new("refresher.chunks", Sort::IntegralCounter) }
//! // ...
//! counter_add!(state.instruments, "refresher.chunks", 1, &[]);
//! ```
//!
//! The [Instruments] constructor pre-builds every registered instrument (and panics on a
//! duplicate name or a sort mismatch-- those are logic errors on the order of a type error, just
//! ones this design can only catch at startup rather than compile time).

use std::collections::{HashMap, hash_map::Entry};

use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Gauge},
};

/// Instrument type.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Sort {
    /// Corresponds to `Counter<u64>`
    IntegralCounter,
    /// Corresponds to `Gauge<f64>`
    FloatGauge,
    /// `Gauge<u64>`
    IntegralGauge,
}

/// The unit of registration: a metric name & its instrument sort.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Registration {
    name: &'static str,
    sort: Sort,
}

impl Registration {
    pub const fn new(name: &'static str, sort: Sort) -> Registration {
        Registration { name, sort }
    }
    pub fn name(&self) -> String {
        self.name.to_string()
    }
    pub fn sort(&self) -> Sort {
        self.sort
    }
}

inventory::collect!(Registration);

enum Instrument {
    CounterU64(Counter<u64>),
    GaugeF64(Gauge<f64>),
    GaugeU64(Gauge<u64>),
}

/// Container for OTel instruments; build one at startup and share it through application state.
pub struct Instruments {
    map: HashMap<String, Instrument>,
}

impl Instruments {
    pub fn new(prefix: &'static str) -> Instruments {
        let meter = global::meter(prefix);
        let mut map: HashMap<String, Instrument> = HashMap::new();
        // Pre-creating every registered instrument may build things that are never used, but it
        // means `add` & `record` don't need `&mut self`, so the container can live in an Arc.
        IntoIterator::into_iter(inventory::iter::<Registration>).for_each(|reg| {
            let name = reg.name();
            match map.entry(reg.name()) {
                Entry::Occupied(_) => {
                    panic!("The metric name {} was used twice", name)
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(match reg.sort() {
                        Sort::IntegralCounter => {
                            Instrument::CounterU64(meter.u64_counter(name).build())
                        }
                        Sort::FloatGauge => Instrument::GaugeF64(meter.f64_gauge(name).build()),
                        Sort::IntegralGauge => Instrument::GaugeU64(meter.u64_gauge(name).build()),
                    });
                }
            }
        });
        Instruments { map }
    }
    // panics if `name` doesn't name a counter
    pub fn add(&self, name: &str, count: u64, attributes: &[KeyValue]) {
        if let Some(Instrument::CounterU64(c)) = self.map.get(name) {
            c.add(count, attributes);
        } else {
            panic!("{} does not name a counter", name);
        }
    }
    pub fn recordf(&self, name: &str, value: f64, attributes: &[KeyValue]) {
        if let Some(Instrument::GaugeF64(g)) = self.map.get(name) {
            g.record(value, attributes);
        } else {
            panic!("{} does not name a gauge", name);
        }
    }
    pub fn recordu(&self, name: &str, value: u64, attributes: &[KeyValue]) {
        if let Some(Instrument::GaugeU64(g)) = self.map.get(name) {
            g.record(value, attributes);
        } else {
            panic!("{} does not name a gauge", name);
        }
    }
}

#[macro_export]
macro_rules! counter_add {
    ($instr:expr, $name:expr, $count:expr, $attrs:expr) => {
        $instr.add($name, $count, $attrs);
    };
}

#[macro_export]
macro_rules! gauge_setu {
    ($instr:expr, $name:expr, $value:expr, $attrs:expr) => {
        $instr.recordu($name, $value, $attrs);
    };
}

#[macro_export]
macro_rules! gauge_setf {
    ($instr:expr, $name:expr, $value:expr, $attrs:expr) => {
        $instr.recordf($name, $value, $attrs);
    };
}

#[cfg(test)]
mod test {
    use super::*;

    inventory::submit! { Registration::new("test.metrics.counter", Sort::IntegralCounter) }

    #[test]
    fn registered_instruments_are_built_and_usable() {
        let instruments = Instruments::new("icalproxy-test");
        instruments.add("test.metrics.counter", 1, &[]);
    }

    #[test]
    #[should_panic]
    fn unregistered_names_panic() {
        let instruments = Instruments::new("icalproxy-test");
        instruments.add("test.metrics.never-registered", 1, &[]);
    }
}
