use serde::Serialize;

use crate::{
    config::ConfigError,
    labels::{self, LabelSet, UNIQUE_NAME_LABEL},
    sample::{LogSample, LogStats, LogTimestamp},
    util,
    walltime::{WalltimeCoupling, WalltimeCouplingOptions},
};

use super::{SeriesCommon, TimeSeries};

/// How well the generated log text compresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Compressibility {
    /// Random text.
    Min,
    /// Half random, half constant fill.
    Medium,
    /// Constant fill.
    Max,
}

/// `<seconds><nanos:09>:` is 20 characters for present-day timestamps.
pub const TIMESTAMP_PREFIX_LEN: usize = 20;

#[derive(Debug, Clone)]
pub struct LogSeriesOptions {
    pub unique_name: String,
    /// Time of the first entry.
    pub start: LogTimestamp,
    pub extra_labels: LabelSet,
    pub sample_interval_ns: i64,
    pub samples_per_fragment: usize,
    pub chars_per_msg: usize,
    pub include_time_in_msg: bool,
    pub compressibility: Compressibility,
    /// `None` decouples the synthetic clock from wall time.
    pub coupling: Option<WalltimeCouplingOptions>,
    pub seed: Option<u64>,
}

/// Log stream with fixed-length synthetic messages.
#[derive(Debug)]
pub struct LogSeries {
    common: SeriesCommon<LogStats>,
    interval_ns: i64,
    last: LogTimestamp,
    chars_per_msg: usize,
    include_time_in_msg: bool,
    compressibility: Compressibility,
}
impl LogSeries {
    pub fn new(opts: LogSeriesOptions) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidSeries {
            series: opts.unique_name.clone(),
            reason,
        };
        let n = opts.samples_per_fragment;
        let inc = opts.sample_interval_ns;
        if n == 0 {
            return Err(invalid("samples per fragment must be positive".into()));
        }
        if !(0 < inc && inc < LogTimestamp::NANOS_PER_SEC) {
            return Err(invalid(format!(
                "sample interval {inc} ns must be positive and below one second"
            )));
        }
        if opts.include_time_in_msg && opts.chars_per_msg < TIMESTAMP_PREFIX_LEN {
            return Err(invalid(format!(
                "messages carrying a timestamp need at least {TIMESTAMP_PREFIX_LEN} characters"
            )));
        }

        let width_secs = n as f64 * inc as f64 / 1e9;
        let coupling = opts
            .coupling
            .map(|o| WalltimeCoupling::new(o, width_secs))
            .transpose()?;

        let mut labels = opts.extra_labels;
        labels.insert(UNIQUE_NAME_LABEL.into(), opts.unique_name.clone());
        let common = SeriesCommon::new(&opts.unique_name, labels, n, coupling, opts.seed);
        Ok(Self {
            common,
            interval_ns: inc,
            last: opts.start.plus_nanos(-inc),
            chars_per_msg: opts.chars_per_msg,
            include_time_in_msg: opts.include_time_in_msg,
            compressibility: opts.compressibility,
        })
    }

    pub fn sample_interval_ns(&self) -> i64 {
        self.interval_ns
    }
    pub fn include_time_in_msg(&self) -> bool {
        self.include_time_in_msg
    }
    pub fn last_sample_time(&self) -> LogTimestamp {
        self.last
    }
    pub fn pending_stats(&self) -> &[LogStats] {
        self.pending_validation()
    }

    fn gen_chars(&mut self, n: usize) -> String {
        let rng = self.common.rng();
        match self.compressibility {
            Compressibility::Min => util::random_string(rng, n),
            Compressibility::Medium => util::random_string_with_fill(rng, n / 2, n / 2 + n % 2),
            Compressibility::Max => "a".repeat(n),
        }
    }

    fn build_line(&mut self, time: LogTimestamp) -> String {
        if !self.include_time_in_msg {
            return self.gen_chars(self.chars_per_msg);
        }
        let prefix = format!("{time}:");
        let rest = self.chars_per_msg.saturating_sub(prefix.len());
        let mut line = prefix;
        line.push_str(&self.gen_chars(rest));
        // past year 2286 the prefix alone exceeds 20 characters
        line.truncate(self.chars_per_msg);
        line
    }
}

impl TimeSeries for LogSeries {
    type Sample = LogSample;

    fn common(&self) -> &SeriesCommon<LogStats> {
        &self.common
    }
    fn common_mut(&mut self) -> &mut SeriesCommon<LogStats> {
        &mut self.common
    }
    fn last_sample_secs(&self) -> f64 {
        self.last.as_secs_f64()
    }
    fn leap_forward(&mut self, by_secs: f64) {
        let nanos = (by_secs * 1e9).round() as i64;
        self.last = self.last.plus_nanos(nanos);
    }
    fn next_sample(&mut self) -> LogSample {
        self.last = self.last.plus_nanos(self.interval_ns);
        let time = self.last;
        LogSample {
            line: self.build_line(time),
            time,
        }
    }
    fn query_selector(&self) -> String {
        labels::selector(self.labels())
    }
    fn fragment_width_secs(&self) -> f64 {
        self.samples_per_fragment() as f64 * self.interval_ns as f64 / 1e9
    }
}
