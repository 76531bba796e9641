use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use anyhow::Context;
use serde::Serialize;

use crate::{config::Config, producer::WriteTotals, validate::ReadTotals};

const MIB: f64 = 1024.0 * 1024.0;

fn per_sec(amount: f64, duration_secs: f64) -> f64 {
    if duration_secs > 0.0 {
        amount / duration_secs
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteStats {
    pub n_entries_sent: u64,
    pub n_payload_bytes_sent: u64,
    pub n_push_messages_sent: u64,
    pub n_serialized_bytes_sent: u64,
    pub entries_sent_per_sec: f64,
    pub mib_payload_bytes_sent_per_sec: f64,
    pub duration_seconds: f64,
}
impl From<&WriteTotals> for WriteStats {
    fn from(t: &WriteTotals) -> Self {
        Self {
            n_entries_sent: t.samples,
            n_payload_bytes_sent: t.payload_bytes,
            n_push_messages_sent: t.push_messages,
            n_serialized_bytes_sent: t.serialized_bytes,
            entries_sent_per_sec: per_sec(t.samples as f64, t.duration_secs),
            mib_payload_bytes_sent_per_sec: per_sec(t.payload_bytes as f64 / MIB, t.duration_secs),
            duration_seconds: t.duration_secs,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadStats {
    pub n_entries_read: u64,
    pub n_payload_bytes_read: u64,
    pub n_series_validated: u64,
    pub entries_read_per_sec: f64,
    pub mib_payload_bytes_read_per_sec: f64,
    pub duration_seconds: f64,
}
impl From<&ReadTotals> for ReadStats {
    fn from(t: &ReadTotals) -> Self {
        Self {
            n_entries_read: t.samples,
            n_payload_bytes_read: t.payload_bytes,
            n_series_validated: t.series_validated,
            entries_read_per_sec: per_sec(t.samples as f64, t.duration_secs),
            mib_payload_bytes_read_per_sec: per_sec(t.payload_bytes as f64 / MIB, t.duration_secs),
            duration_seconds: t.duration_secs,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleStats {
    pub cycle_num: usize,
    pub invocation_cycle_id: String,
    pub write: WriteStats,
    pub read: ReadStats,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport<'a> {
    pub argv: &'a [String],
    pub rendered_config: &'a Config,
    /// RFC 3339, nanosecond precision.
    pub invocation_time: String,
    pub cycle_stats: CycleStats,
}
impl<'a> CycleReport<'a> {
    pub fn new(
        argv: &'a [String],
        config: &'a Config,
        invocation_time: SystemTime,
        cycle_stats: CycleStats,
    ) -> Self {
        Self {
            argv,
            rendered_config: config,
            invocation_time: humantime::format_rfc3339_nanos(invocation_time).to_string(),
            cycle_stats,
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.report.json", self.cycle_stats.invocation_cycle_id)
    }

    /// Write `<cycle id>.report.json` into `dir`.
    pub fn write_to(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        let path = dir.join(self.file_name());
        let json = serde_json::to_string_pretty(self).context("serializing the cycle report")?;
        std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}
