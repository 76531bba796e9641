use core::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{
    clock,
    fragment::{AnyFragment, Family, LogFragment, MetricFragment},
    LabelSet,
};

pub const METRICS_PUSH_PATH: &str = "/api/v1/push";
pub const LOGS_PUSH_PATH: &str = "/loki/api/v1/push";
pub const REMOTE_WRITE_VERSION: &str = "0.1.0";

#[derive(Debug, Error)]
pub enum WireError {
    #[error("cannot build a push message from zero fragments")]
    Empty,
    #[error("push message mixes log and metric fragments")]
    MixedFamilies,
    #[error("snappy: {0}")]
    Snappy(#[from] snap::Error),
    #[error("protobuf: {0}")]
    Decode(#[from] prost::DecodeError),
}

// Prometheus remote-write.

#[derive(Clone, PartialEq, prost::Message)]
pub struct WriteRequest {
    #[prost(message, repeated, tag = "1")]
    pub timeseries: Vec<TimeSeries>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TimeSeries {
    #[prost(message, repeated, tag = "1")]
    pub labels: Vec<Label>,
    #[prost(message, repeated, tag = "2")]
    pub samples: Vec<Sample>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Label {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Sample {
    #[prost(double, tag = "1")]
    pub value: f64,
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
}

// Loki push.

#[derive(Clone, PartialEq, prost::Message)]
pub struct PushRequest {
    #[prost(message, repeated, tag = "1")]
    pub streams: Vec<StreamAdapter>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StreamAdapter {
    #[prost(string, tag = "1")]
    pub labels: String,
    #[prost(message, repeated, tag = "2")]
    pub entries: Vec<EntryAdapter>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct EntryAdapter {
    #[prost(message, optional, tag = "1")]
    pub timestamp: Option<prost_types::Timestamp>,
    #[prost(string, tag = "2")]
    pub line: String,
}

/// One or more sealed fragments of the same family, serialized and
/// compressed. Immutable once built; the fragments are handed back after a
/// successful send for per-series bookkeeping.
#[derive(Debug)]
pub struct PushMessage {
    fragments: Vec<AnyFragment>,
    family: Family,
    body: Arc<[u8]>,
    fingerprint: String,
    uncompressed_bytes: u64,
    serialization_secs: f64,
}
impl PushMessage {
    pub fn new(mut fragments: Vec<AnyFragment>) -> Result<Self, WireError> {
        let family = fragments.first().ok_or(WireError::Empty)?.family();
        if fragments.iter().any(|f| f.family() != family) {
            return Err(WireError::MixedFamilies);
        }
        let t0 = clock::mtime();
        let mut hasher = Sha256::new();
        for fragment in &mut fragments {
            fragment.seal();
            hash_fragment(&mut hasher, fragment);
        }
        let raw = match family {
            Family::Metrics => encode_metrics(fragments.iter().filter_map(|f| match f {
                AnyFragment::Metric(f) => Some(f),
                AnyFragment::Log(_) => None,
            })),
            Family::Logs => encode_logs(fragments.iter().filter_map(|f| match f {
                AnyFragment::Log(f) => Some(f),
                AnyFragment::Metric(_) => None,
            })),
        };
        let body = snap::raw::Encoder::new().compress_vec(&raw)?;
        Ok(Self {
            fragments,
            family,
            body: body.into(),
            fingerprint: format!("{:x}", hasher.finalize()),
            uncompressed_bytes: raw.len() as u64,
            serialization_secs: clock::secs_since(t0),
        })
    }

    pub fn family(&self) -> Family {
        self.family
    }
    pub fn fragments(&self) -> &[AnyFragment] {
        &self.fragments
    }
    pub fn into_fragments(self) -> Vec<AnyFragment> {
        self.fragments
    }
    /// Compressed wire payload.
    pub fn body(&self) -> Arc<[u8]> {
        self.body.clone()
    }
    pub fn body_len(&self) -> usize {
        self.body.len()
    }
    pub fn uncompressed_bytes(&self) -> u64 {
        self.uncompressed_bytes
    }
    /// Hex SHA-256 over the sample payload of all fragments, in order.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
    pub fn serialization_secs(&self) -> f64 {
        self.serialization_secs
    }
    pub fn sample_count(&self) -> u64 {
        self.fragments.iter().map(|f| f.sample_count()).sum()
    }
    /// Sum of the per-fragment payload byte accounting.
    pub fn payload_bytes(&self) -> u64 {
        self.fragments.iter().map(|f| f.payload_bytes()).sum()
    }
    pub fn path(&self) -> &'static str {
        push_path(self.family)
    }
    pub fn headers(&self) -> Vec<(&'static str, &'static str)> {
        let mut headers = vec![
            ("Content-Type", "application/x-protobuf"),
            ("Content-Encoding", "snappy"),
        ];
        if self.family == Family::Metrics {
            headers.push(("X-Prometheus-Remote-Write-Version", REMOTE_WRITE_VERSION));
        }
        headers
    }
}
impl fmt::Display for PushMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PushMessage(sha256={})", &self.fingerprint[..16])
    }
}

pub fn push_path(family: Family) -> &'static str {
    match family {
        Family::Logs => LOGS_PUSH_PATH,
        Family::Metrics => METRICS_PUSH_PATH,
    }
}

fn hash_fragment(hasher: &mut Sha256, fragment: &AnyFragment) {
    match fragment {
        AnyFragment::Metric(f) => {
            for s in f.samples() {
                hasher.update(s.value.to_bits().to_be_bytes());
                hasher.update(s.time_ms.to_be_bytes());
            }
        }
        AnyFragment::Log(f) => {
            for s in f.samples() {
                hasher.update(s.time.to_unix_nanos().to_be_bytes());
                hasher.update(s.line.as_bytes());
            }
        }
    }
}

fn proto_labels(labels: &LabelSet) -> Vec<Label> {
    labels
        .iter()
        .map(|(name, value)| Label {
            name: name.clone(),
            value: value.clone(),
        })
        .collect()
}

fn encode_metrics<'a>(fragments: impl Iterator<Item = &'a MetricFragment>) -> Vec<u8> {
    use prost::Message;
    let timeseries = fragments
        .map(|f| TimeSeries {
            labels: proto_labels(f.labels()),
            samples: f
                .samples()
                .iter()
                .map(|s| Sample {
                    value: s.value,
                    timestamp: s.time_ms,
                })
                .collect(),
        })
        .collect();
    WriteRequest { timeseries }.encode_to_vec()
}

fn encode_logs<'a>(fragments: impl Iterator<Item = &'a LogFragment>) -> Vec<u8> {
    use prost::Message;
    let streams = fragments
        .map(|f| StreamAdapter {
            labels: crate::labels::selector(f.labels()),
            entries: f
                .samples()
                .iter()
                .map(|s| EntryAdapter {
                    timestamp: Some(prost_types::Timestamp {
                        seconds: s.time.seconds,
                        nanos: s.time.nanos as i32,
                    }),
                    line: s.line.clone(),
                })
                .collect(),
        })
        .collect();
    PushRequest { streams }.encode_to_vec()
}

pub fn decode_metrics_body(body: &[u8]) -> Result<WriteRequest, WireError> {
    use prost::Message;
    let raw = snap::raw::Decoder::new().decompress_vec(body)?;
    Ok(WriteRequest::decode(raw.as_slice())?)
}

pub fn decode_logs_body(body: &[u8]) -> Result<PushRequest, WireError> {
    use prost::Message;
    let raw = snap::raw::Decoder::new().decompress_vec(body)?;
    Ok(PushRequest::decode(raw.as_slice())?)
}
