use std::{path::PathBuf, time::UNIX_EPOCH};

use clap::{ArgAction, ArgGroup, Parser, ValueEnum};
use rand::Rng;
use serde::Serialize;
use thiserror::Error;

use crate::{
    push::RetryPolicy,
    sample::LogTimestamp,
    series::Compressibility,
    util,
    walltime::WalltimeCouplingOptions,
    LabelSet,
};

pub const DEFAULT_HTTP_SERVER_PORT: u16 = 8900;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "walltime coupling: min lag ({min_lag_secs} s) must be non-negative \
         and more than the leap margin below max lag ({max_lag_secs} s)"
    )]
    LagBounds {
        min_lag_secs: f64,
        max_lag_secs: f64,
    },
    #[error(
        "walltime coupling: max lag ({max_lag_secs} s) must be larger \
         than the fragment time width ({leap_secs} s)"
    )]
    LagWindowTooNarrow { max_lag_secs: f64, leap_secs: f64 },
    #[error("series {series}: {reason}")]
    InvalidSeries { series: String, reason: String },
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}
impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error => "error",
        }
    }
}

/// Synthetic load generator and read validator for Loki and Prometheus
/// remote-write style ingest APIs.
#[derive(Debug, Clone, Parser, Serialize)]
#[command(name = "ingestcheck", version)]
#[command(group(
    ArgGroup::new("stop")
        .required(true)
        .args(["stream_write_n_fragments", "stream_write_n_seconds"])
))]
pub struct Config {
    /// Loki API base URL (Prometheus remote-write API base URL in metrics mode)
    pub api_base_url: String,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Push metric samples instead of log entries
    #[arg(long)]
    pub metrics_mode: bool,

    /// Number of series to create per write/read cycle
    #[arg(long)]
    pub n_series: usize,

    /// Number of samples per series fragment
    #[arg(long)]
    pub n_entries_per_series_fragment: usize,

    /// Number of fragments (from different series) per push message
    #[arg(long, default_value_t = 1)]
    pub n_fragments_per_push_message: usize,

    /// Characters per log message (logs only)
    #[arg(long, default_value_t = 100)]
    pub n_chars_per_msg: usize,

    /// RFC 3339 time of the first entry of every log series; disables
    /// walltime coupling (logs only)
    #[arg(long)]
    pub log_start_time: Option<String>,

    #[arg(long, default_value_t = 1)]
    pub log_time_increment_ns: i64,

    #[arg(long, default_value_t = 1)]
    pub metrics_time_increment_ms: i64,

    /// Concurrent write actors; 0: one per series
    #[arg(long, default_value_t = 0)]
    pub max_concurrent_writes: usize,

    /// Concurrent validation queries; 0: unbounded
    #[arg(long, default_value_t = 0)]
    pub max_concurrent_reads: usize,

    /// Skip the read phase of each cycle
    #[arg(long, conflicts_with = "max_concurrent_reads")]
    pub skip_read: bool,

    /// Validate a random subset of this many series; 0: all
    #[arg(long, default_value_t = 0)]
    pub read_n_series_only: usize,

    #[arg(long, value_enum, default_value_t = Compressibility::Min)]
    pub compressibility: Compressibility,

    #[arg(long, default_value_t = 1)]
    pub n_cycles: usize,

    /// Keep the same series for N cycles, then create new ones
    #[arg(long, default_value_t = 1)]
    pub change_series_every_n_cycles: usize,

    /// Additional label for every series
    #[arg(
        long = "label",
        num_args = 2,
        value_names = ["KEY", "VALUE"],
        action = ArgAction::Append
    )]
    pub labels: Vec<String>,

    /// Port of the /metrics endpoint
    #[arg(long, default_value_t = DEFAULT_HTTP_SERVER_PORT)]
    pub http_server_port: u16,

    /// Stop writing a series after this many fragments per cycle
    #[arg(long)]
    pub stream_write_n_fragments: Option<u64>,

    /// Stop the write phase after approximately this many seconds
    #[arg(long)]
    pub stream_write_n_seconds: Option<u64>,

    /// Add a random number of seconds from [-J, J] to the write duration
    #[arg(long, value_name = "J", default_value_t = 0.0)]
    pub stream_write_n_seconds_jitter: f64,

    /// Maximum number of log entries fetched per query
    #[arg(long, default_value_t = 60_000)]
    pub fetch_n_entries_per_query: usize,

    /// Check the timestamp prefix of every Nth log entry only; 0: all
    #[arg(long, default_value_t = 0)]
    pub inspect_every_nth_entry: u64,

    #[arg(long, default_value_t = 360)]
    pub retry_post_deadline_seconds: u64,

    #[arg(long, default_value_t = 3)]
    pub retry_post_min_delay_seconds: u64,

    #[arg(long, default_value_t = 30)]
    pub retry_post_max_delay_seconds: u64,

    /// Relative jitter of the retry delay (1: max)
    #[arg(long, default_value_t = 0.5)]
    pub retry_post_jitter: f64,

    /// Response body substring of a 5xx after which the write may still
    /// have landed
    #[arg(
        long = "ambiguous-error-signature",
        action = ArgAction::Append,
        default_values_t = RetryPolicy::default_ambiguous_signatures()
    )]
    pub ambiguous_error_signatures: Vec<String>,

    /// Send `Authorization: Bearer <token>` with the token read from this file
    #[arg(long)]
    pub bearer_token_file: Option<PathBuf>,

    /// Seed for reproducible series contents
    #[arg(long)]
    pub seed: Option<u64>,

    /// Directory receiving the per-cycle report files
    #[arg(long, default_value = ".")]
    pub report_dir: PathBuf,
}
impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.n_series == 0 {
            return invalid("--n-series must be positive");
        }
        if self.n_entries_per_series_fragment == 0 {
            return invalid("--n-entries-per-series-fragment must be positive");
        }
        if self.n_fragments_per_push_message == 0 {
            return invalid("--n-fragments-per-push-message must be positive");
        }
        if self.change_series_every_n_cycles == 0 {
            return invalid("--change-series-every-n-cycles must be positive");
        }
        if self.change_series_every_n_cycles > self.n_cycles {
            return invalid("--change-series-every-n-cycles must not be larger than --n-cycles");
        }
        if self.max_concurrent_writes > self.n_series {
            return invalid("--max-concurrent-writes must not be larger than --n-series");
        }
        if self.read_n_series_only != 0 {
            if self.skip_read {
                return invalid("--read-n-series-only cannot be combined with --skip-read");
            }
            if self.read_n_series_only > self.n_series {
                return invalid("--read-n-series-only must not be larger than --n-series");
            }
        }
        if self.stream_write_n_seconds_jitter != 0.0 {
            let Some(secs) = self.stream_write_n_seconds else {
                return invalid(
                    "--stream-write-n-seconds-jitter can only be used \
                     with --stream-write-n-seconds",
                );
            };
            if !(0.0..secs as f64).contains(&self.stream_write_n_seconds_jitter) {
                return invalid(
                    "--stream-write-n-seconds-jitter must be smaller than --stream-write-n-seconds",
                );
            }
        }
        if self.log_start_time.is_some() {
            if self.metrics_mode {
                return invalid("--log-start-time does not apply in metrics mode");
            }
            self.log_start()?;
        }
        if self.retry_post_min_delay_seconds > self.retry_post_max_delay_seconds {
            return invalid(
                "--retry-post-min-delay-seconds must not exceed --retry-post-max-delay-seconds",
            );
        }
        if !(0.0..=1.0).contains(&self.retry_post_jitter) {
            return invalid("--retry-post-jitter must be within [0, 1]");
        }
        Ok(())
    }

    pub fn write_concurrency(&self) -> usize {
        match self.max_concurrent_writes {
            0 => self.n_series,
            n => n,
        }
    }
    /// Per-series fragment quota of one write phase.
    pub fn fragments_per_cycle(&self) -> u64 {
        self.stream_write_n_fragments.unwrap_or(u64::MAX)
    }
    /// Write-phase duration of one cycle, jitter applied; `None` if the
    /// phase ends on the fragment quota.
    pub fn write_duration_secs<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<f64> {
        let secs = self.stream_write_n_seconds? as f64;
        let j = self.stream_write_n_seconds_jitter;
        if j == 0.0 {
            return Some(secs);
        }
        Some(secs + rng.gen_range(-j..=j))
    }

    /// Wall-time width of one fragment.
    pub fn fragment_width_secs(&self) -> f64 {
        let n = self.n_entries_per_series_fragment as f64;
        if self.metrics_mode {
            n * self.metrics_time_increment_ms as f64 / 1e3
        } else {
            n * self.log_time_increment_ns as f64 / 1e9
        }
    }
    pub fn coupling_options(&self) -> WalltimeCouplingOptions {
        WalltimeCouplingOptions::for_leap(self.fragment_width_secs())
    }

    /// Explicit log start time, if configured.
    pub fn log_start(&self) -> Result<Option<LogTimestamp>, ConfigError> {
        let Some(text) = &self.log_start_time else {
            return Ok(None);
        };
        let time = humantime::parse_rfc3339(text)
            .map_err(|e| ConfigError::Invalid(format!("--log-start-time {text:?}: {e}")))?;
        let since_epoch = time
            .duration_since(UNIX_EPOCH)
            .map_err(|_| ConfigError::Invalid("--log-start-time is before the epoch".into()))?;
        let seconds = i64::try_from(since_epoch.as_secs())
            .map_err(|_| ConfigError::Invalid("--log-start-time is out of range".into()))?;
        Ok(Some(LogTimestamp::new(seconds, since_epoch.subsec_nanos())))
    }

    pub fn extra_labels(&self) -> LabelSet {
        self.labels
            .chunks_exact(2)
            .map(|kv| (kv[0].clone(), kv[1].clone()))
            .collect()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            deadline_secs: self.retry_post_deadline_seconds as f64,
            min_delay_secs: self.retry_post_min_delay_seconds as f64,
            max_delay_secs: self.retry_post_max_delay_seconds as f64,
            jitter: self.retry_post_jitter,
            ambiguous_signatures: self.ambiguous_error_signatures.clone(),
            ..RetryPolicy::default()
        }
    }

    pub fn read_bearer_token(&self) -> anyhow::Result<Option<String>> {
        let Some(path) = &self.bearer_token_file else {
            return Ok(None);
        };
        let token = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading bearer token from {}: {e}", path.display()))?;
        Ok(Some(token.trim().to_string()))
    }
}

/// `ingestcheck-<6 random alphanumerics>`.
pub fn new_invocation_id<R: Rng + ?Sized>(rng: &mut R) -> String {
    format!("ingestcheck-{}", util::random_string(rng, 6).to_lowercase())
}

pub fn cycle_id(invocation_id: &str, cycle: usize) -> String {
    format!("{invocation_id}-{cycle}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Result<Config, clap::Error> {
        let mut argv = vec![
            "ingestcheck",
            "http://localhost:3100",
            "--n-series",
            "4",
            "--n-entries-per-series-fragment",
            "10",
        ];
        argv.extend_from_slice(extra);
        Config::try_parse_from(argv)
    }

    #[test]
    fn stop_criterion_is_required_and_exclusive() {
        assert!(parse(&[]).is_err());
        let both = ["--stream-write-n-fragments", "2", "--stream-write-n-seconds", "5"];
        assert!(parse(&both).is_err());
        let cfg = parse(&["--stream-write-n-fragments", "2"]).unwrap();
        assert_eq!(cfg.fragments_per_cycle(), 2);
        let cfg = parse(&["--stream-write-n-seconds", "5"]).unwrap();
        assert_eq!(cfg.fragments_per_cycle(), u64::MAX);
    }

    #[test]
    fn defaults() {
        let cfg = parse(&["--stream-write-n-fragments", "1"]).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.http_server_port, 8900);
        assert_eq!(cfg.write_concurrency(), 4);
        assert_eq!(cfg.compressibility, Compressibility::Min);
        assert_eq!(cfg.ambiguous_error_signatures.len(), 2);
        let policy = cfg.retry_policy();
        assert_eq!(policy.deadline_secs, 360.0);
        assert_eq!(policy.min_delay_secs, 3.0);
        assert_eq!(policy.max_delay_secs, 30.0);
    }

    #[test]
    fn labels_are_pairs() {
        let cfg = parse(&[
            "--stream-write-n-fragments",
            "1",
            "--label",
            "env",
            "ci",
            "--label",
            "team",
            "infra",
        ])
        .unwrap();
        let labels = cfg.extra_labels();
        assert_eq!(labels.get("env").map(String::as_str), Some("ci"));
        assert_eq!(labels.get("team").map(String::as_str), Some("infra"));
    }

    #[test]
    fn cross_field_validation() {
        let invalid = [
            ["--stream-write-n-fragments", "1", "--max-concurrent-writes", "5"],
            ["--stream-write-n-fragments", "1", "--change-series-every-n-cycles", "2"],
            ["--stream-write-n-fragments", "1", "--stream-write-n-seconds-jitter", "1"],
            ["--stream-write-n-seconds", "10", "--stream-write-n-seconds-jitter", "11"],
        ];
        for args in invalid {
            assert!(parse(&args).unwrap().validate().is_err(), "{args:?}");
        }
        let jittered = ["--stream-write-n-seconds", "10", "--stream-write-n-seconds-jitter", "2"];
        parse(&jittered).unwrap().validate().unwrap();
        let cfg = parse(&[
            "--stream-write-n-fragments",
            "1",
            "--skip-read",
            "--read-n-series-only",
            "2",
        ]);
        assert!(cfg.unwrap().validate().is_err());
        let cfg = parse(&[
            "--stream-write-n-fragments",
            "1",
            "--metrics-mode",
            "--log-start-time",
            "2020-02-20T17:46:37.27Z",
        ])
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn log_start_time_keeps_nanoseconds() {
        let cfg = parse(&[
            "--stream-write-n-fragments",
            "1",
            "--log-start-time",
            "2020-02-20T17:46:37.270000001Z",
        ])
        .unwrap();
        cfg.validate().unwrap();
        let start = cfg.log_start().unwrap().unwrap();
        assert_eq!(start, LogTimestamp::new(1_582_220_797, 270_000_001));
    }

    #[test]
    fn coupling_window_follows_fragment_width() {
        let cfg = parse(&[
            "--stream-write-n-fragments",
            "1",
            "--metrics-mode",
            "--metrics-time-increment-ms",
            "1000",
        ])
        .unwrap();
        assert_eq!(cfg.fragment_width_secs(), 10.0);
        let opts = cfg.coupling_options();
        assert_eq!(opts.min_lag_secs, 60.0);
        assert_eq!(opts.max_lag_secs, 300.0);
    }

    #[test]
    fn invocation_id_shape() {
        let mut rng = rand::thread_rng();
        let id = new_invocation_id(&mut rng);
        assert!(id.starts_with("ingestcheck-"));
        assert_eq!(id.len(), "ingestcheck-".len() + 6);
        assert_eq!(cycle_id(&id, 3), format!("{id}-3"));
    }
}
