#![forbid(unsafe_code)]

use crate::sink::MetricSink;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueSource {
    Explicit,
    Forecast,
    Fallback,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueSource::Explicit => "explicit",
            ValueSource::Forecast => "forecast",
            ValueSource::Fallback => "fallback",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResolvedValue {
    pub value: f64,
    pub source: ValueSource,
}

/// Picks an event value: explicit value, then the flex forecast series, then a seeded uniform
/// draw from the fallback range rounded to two decimals.
pub struct ValueResolver {
    sink: Arc<MetricSink>,
    min: f64,
    max: f64,
    rng: Mutex<StdRng>,
}

impl ValueResolver {
    pub fn new(sink: Arc<MetricSink>, min: f64, max: f64, seed: u64) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        Self {
            sink,
            min,
            max,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn range(&self) -> (f64, f64) {
        (self.min, self.max)
    }

    pub async fn resolve(
        &self,
        ven_id: &str,
        resource_id: &str,
        explicit: Option<f64>,
    ) -> ResolvedValue {
        if let Some(value) = explicit {
            return ResolvedValue {
                value,
                source: ValueSource::Explicit,
            };
        }

        let flex = self.sink.flex_series_name(ven_id, resource_id);
        if let Some(value) = self.sink.latest(&flex).await {
            return ResolvedValue {
                value,
                source: ValueSource::Forecast,
            };
        }

        ResolvedValue {
            value: self.fallback(),
            source: ValueSource::Fallback,
        }
    }

    fn fallback(&self) -> f64 {
        let raw = self
            .rng
            .lock()
            .expect("fallback rng poisoned")
            .gen_range(self.min..=self.max);
        ((raw * 100.0).round() / 100.0).clamp(self.min, self.max)
    }
}
