use core::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Bytes accounted per metric sample: an f64 value plus an i64 timestamp.
pub const METRIC_SAMPLE_BYTES: u64 = 16;
/// Bytes accounted per log timestamp: an i64 seconds plus an i32 nanos field.
pub const LOG_TIMESTAMP_BYTES: u64 = 12;

pub trait Sample: Clone + fmt::Debug + Send + Sync + 'static {
    type Stats: Clone + PartialEq + fmt::Debug + Send + Sync + 'static;

    fn payload_bytes(&self) -> u64;
    fn summarize(samples: &[Self], payload_bytes: u64) -> Self::Stats;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricSample {
    pub value: f64,
    /// Milliseconds since the epoch.
    pub time_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricStats {
    pub sample_count: u64,
    pub first_ms: i64,
    pub last_ms: i64,
    pub min: String,
    pub max: String,
    pub variance: String,
    pub payload_bytes: u64,
}
impl MetricStats {
    pub fn from_points(points: &[(i64, f64)]) -> Self {
        let values: Vec<f64> = points.iter().map(|(_, v)| *v).collect();
        let (min, max) = min_max(&values);
        Self {
            sample_count: points.len() as u64,
            first_ms: points.first().map(|(t, _)| *t).unwrap_or_default(),
            last_ms: points.last().map(|(t, _)| *t).unwrap_or_default(),
            min: format_float_for_comparison(min),
            max: format_float_for_comparison(max),
            variance: format_float_for_comparison(variance(&values)),
            payload_bytes: points.len() as u64 * METRIC_SAMPLE_BYTES,
        }
    }
}

impl Sample for MetricSample {
    type Stats = MetricStats;

    fn payload_bytes(&self) -> u64 {
        METRIC_SAMPLE_BYTES
    }
    fn summarize(samples: &[Self], payload_bytes: u64) -> MetricStats {
        let points: Vec<(i64, f64)> = samples.iter().map(|s| (s.time_ms, s.value)).collect();
        let mut stats = MetricStats::from_points(&points);
        stats.payload_bytes = payload_bytes;
        stats
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct LogTimestamp {
    pub seconds: i64,
    pub nanos: u32,
}
impl LogTimestamp {
    pub const NANOS_PER_SEC: i64 = 1_000_000_000;

    pub fn new(seconds: i64, nanos: u32) -> Self {
        debug_assert!(i64::from(nanos) < Self::NANOS_PER_SEC);
        Self { seconds, nanos }
    }
    pub fn from_unix_nanos(nanos: i64) -> Self {
        Self {
            seconds: nanos.div_euclid(Self::NANOS_PER_SEC),
            nanos: nanos.rem_euclid(Self::NANOS_PER_SEC) as u32,
        }
    }
    pub fn to_unix_nanos(self) -> i64 {
        self.seconds * Self::NANOS_PER_SEC + i64::from(self.nanos)
    }
    pub fn as_secs_f64(self) -> f64 {
        self.seconds as f64 + f64::from(self.nanos) / 1e9
    }
    pub fn plus_nanos(self, nanos: i64) -> Self {
        Self::from_unix_nanos(self.to_unix_nanos() + nanos)
    }
}
impl fmt::Display for LogTimestamp {
    /// Integer nanoseconds since the epoch, the way the Loki HTTP API
    /// renders entry timestamps.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:09}", self.seconds, self.nanos)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogSample {
    pub line: String,
    pub time: LogTimestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogStats {
    pub sample_count: u64,
    pub first: LogTimestamp,
    pub last: LogTimestamp,
    /// Hex SHA-256 over all lines, in order.
    pub content_hash: String,
    pub payload_bytes: u64,
}

impl Sample for LogSample {
    type Stats = LogStats;

    fn payload_bytes(&self) -> u64 {
        LOG_TIMESTAMP_BYTES + self.line.len() as u64
    }
    fn summarize(samples: &[Self], payload_bytes: u64) -> LogStats {
        let mut hasher = Sha256::new();
        for sample in samples {
            hasher.update(sample.line.as_bytes());
        }
        let zero = LogTimestamp::new(0, 0);
        LogStats {
            sample_count: samples.len() as u64,
            first: samples.first().map(|s| s.time).unwrap_or(zero),
            last: samples.last().map(|s| s.time).unwrap_or(zero),
            content_hash: format!("{:x}", hasher.finalize()),
            payload_bytes,
        }
    }
}

/// Fixed-precision rendering so that statistics computed on both ends of a
/// write/read round trip compare equal despite float summation order.
pub fn format_float_for_comparison(value: f64) -> String {
    format!("{value:.14}")
}

fn min_max(values: &[f64]) -> (f64, f64) {
    values.iter().fold((f64::NAN, f64::NAN), |(min, max), &v| {
        (min.min(v), max.max(v))
    })
}

/// Unbiased sample variance; 0 for fewer than two values.
pub fn variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let sum_sq: f64 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
    sum_sq / (n - 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_timestamp_nanos_arithmetic() {
        let t = LogTimestamp::new(1_600_000_000, 999_999_999);
        let next = t.plus_nanos(1);
        assert_eq!(next, LogTimestamp::new(1_600_000_001, 0));
        assert_eq!(next.to_unix_nanos(), 1_600_000_001_000_000_000);
        assert_eq!(t.to_string(), "1600000000999999999");
        assert_eq!(LogTimestamp::new(1_600_000_000, 5).to_string(), "1600000000000000005");
    }

    #[test]
    fn metric_stats_fixed_precision() {
        let samples = [1.0, 2.0, 3.0].map(|value| MetricSample {
            value,
            time_ms: (value * 1000.0) as i64,
        });
        let stats = MetricSample::summarize(&samples, 48);
        assert_eq!(stats.sample_count, 3);
        assert_eq!(stats.first_ms, 1000);
        assert_eq!(stats.last_ms, 3000);
        assert_eq!(stats.min, "1.00000000000000");
        assert_eq!(stats.max, "3.00000000000000");
        assert_eq!(stats.variance, "1.00000000000000");
        assert_eq!(stats.payload_bytes, 48);
    }

    #[test]
    fn variance_of_single_value_is_zero() {
        assert_eq!(variance(&[4.2]), 0.0);
        assert_eq!(variance(&[]), 0.0);
    }

    #[test]
    fn log_stats_hash_depends_on_order() {
        let t = LogTimestamp::new(10, 0);
        let a = LogSample {
            line: "a".into(),
            time: t,
        };
        let b = LogSample {
            line: "b".into(),
            time: t.plus_nanos(1),
        };
        let ab = LogSample::summarize(&[a.clone(), b.clone()], 0);
        let ba = LogSample::summarize(&[b, a], 0);
        assert_ne!(ab.content_hash, ba.content_hash);
        assert_eq!(ab.first, t);
        assert_eq!(ab.last, t.plus_nanos(1));
    }
}
