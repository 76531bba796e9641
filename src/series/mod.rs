use core::fmt;
use std::sync::Arc;

use rand::{rngs::StdRng, SeedableRng};

use crate::{
    clock,
    fragment::{AnyFragment, Family, Fragment},
    sample::Sample,
    walltime::{self, CouplingDecision, WalltimeCoupling},
    LabelSet,
};

mod log;
mod metric;

pub use log::{Compressibility, LogSeries, LogSeriesOptions};
pub use metric::{MetricSeries, MetricSeriesOptions};

pub type StatsOf<S> = <S as Sample>::Stats;

/// Outcome of one `generate_next_fragment_or_skip` call.
#[derive(Debug)]
pub struct FragmentAttempt<F> {
    /// Lag behind wall time of the last generated sample, after the call.
    pub lag_secs: f64,
    pub leaped: bool,
    /// `None` when throttled.
    pub fragment: Option<F>,
}

/// State shared by both series variants.
#[derive(Debug)]
pub struct SeriesCommon<St> {
    name: Arc<str>,
    labels: Arc<LabelSet>,
    samples_per_fragment: usize,
    coupling: Option<WalltimeCoupling>,
    fragments_generated: u64,
    sent_since_validate: u64,
    samples_validated: u64,
    forward_leaps: u64,
    /// `None`: drop mode, nothing retained for the read phase.
    pending: Option<Vec<St>>,
    rng: StdRng,
}
impl<St> SeriesCommon<St> {
    pub fn new(
        name: &str,
        labels: LabelSet,
        samples_per_fragment: usize,
        coupling: Option<WalltimeCoupling>,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            name: Arc::from(name),
            labels: Arc::new(labels),
            samples_per_fragment,
            coupling,
            fragments_generated: 0,
            sent_since_validate: 0,
            samples_validated: 0,
            forward_leaps: 0,
            pending: None,
            rng,
        }
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

/// Capabilities shared by log and metric series.
pub trait TimeSeries {
    type Sample: Sample;

    fn common(&self) -> &SeriesCommon<StatsOf<Self::Sample>>;
    fn common_mut(&mut self) -> &mut SeriesCommon<StatsOf<Self::Sample>>;
    /// Synthetic time of the last generated sample, seconds since the epoch.
    fn last_sample_secs(&self) -> f64;
    /// Move the synthetic clock forward by (about) `by_secs`.
    fn leap_forward(&mut self, by_secs: f64);
    /// Advance the synthetic clock by one interval and build the sample.
    fn next_sample(&mut self) -> Self::Sample;
    /// Selector for the query API.
    fn query_selector(&self) -> String;
    /// Wall-time width of one fragment, the amount the synthetic clock
    /// advances per fragment.
    fn fragment_width_secs(&self) -> f64;

    fn unique_name(&self) -> &str {
        &self.common().name
    }
    fn labels(&self) -> &LabelSet {
        &self.common().labels
    }
    fn samples_per_fragment(&self) -> usize {
        self.common().samples_per_fragment
    }
    fn coupling(&self) -> Option<&WalltimeCoupling> {
        self.common().coupling.as_ref()
    }
    fn fragments_generated(&self) -> u64 {
        self.common().fragments_generated
    }
    fn sent_since_validate(&self) -> u64 {
        self.common().sent_since_validate
    }
    fn samples_validated(&self) -> u64 {
        self.common().samples_validated
    }
    fn forward_leaps(&self) -> u64 {
        self.common().forward_leaps
    }

    /// # Panics
    ///
    /// If walltime coupling is enabled and the synthetic clock is ahead of
    /// `now_secs`.
    fn current_lag_secs_at(&self, now_secs: f64) -> f64 {
        match self.coupling() {
            Some(_) => walltime::lag_secs(now_secs, self.last_sample_secs()),
            None => now_secs - self.last_sample_secs(),
        }
    }

    /// Build the next fragment unconditionally.
    fn generate_next_fragment(&mut self) -> Fragment<Self::Sample> {
        let n = self.samples_per_fragment();
        let common = self.common();
        let mut fragment = Fragment::with_capacity(
            common.labels.clone(),
            common.fragments_generated + 1,
            common.name.clone(),
            n,
        );
        for _ in 0..n {
            let sample = self.next_sample();
            if let Err(e) = fragment.push(sample) {
                unreachable!("{e}");
            }
        }
        self.common_mut().fragments_generated += 1;
        fragment
    }

    fn generate_next_fragment_or_skip_at(
        &mut self,
        now_secs: f64,
    ) -> FragmentAttempt<Fragment<Self::Sample>> {
        let Some(coupling) = self.coupling().copied() else {
            let fragment = self.generate_next_fragment();
            return FragmentAttempt {
                lag_secs: self.current_lag_secs_at(now_secs),
                leaped: false,
                fragment: Some(fragment),
            };
        };
        let mut lag = self.current_lag_secs_at(now_secs);
        let mut leaped = false;
        if let CouplingDecision::Leap { by_secs } = coupling.decide(lag) {
            self.leap_forward(by_secs);
            self.common_mut().forward_leaps += 1;
            leaped = true;
            lag = self.current_lag_secs_at(now_secs);
            tracing::debug!(series = self.unique_name(), by_secs, lag, "forward leap");
        }
        match coupling.decide(lag) {
            CouplingDecision::Generate => {
                let fragment = self.generate_next_fragment();
                FragmentAttempt {
                    lag_secs: self.current_lag_secs_at(now_secs),
                    leaped,
                    fragment: Some(fragment),
                }
            }
            CouplingDecision::Throttle | CouplingDecision::Leap { .. } => FragmentAttempt {
                lag_secs: lag,
                leaped,
                fragment: None,
            },
        }
    }

    fn generate_next_fragment_or_skip(&mut self) -> FragmentAttempt<Fragment<Self::Sample>> {
        self.generate_next_fragment_or_skip_at(clock::wall_now_secs())
    }

    /// Collect mode. Keeps summaries already collected.
    fn enable_validation(&mut self) {
        let common = self.common_mut();
        if common.pending.is_none() {
            common.pending = Some(vec![]);
        }
    }
    /// Drop mode.
    fn disable_validation(&mut self) {
        self.common_mut().pending = None;
    }
    fn should_be_validated(&self) -> bool {
        self.common().pending.is_some()
    }
    fn drop_validation_info(&mut self) {
        if let Some(pending) = &mut self.common_mut().pending {
            pending.clear();
        }
    }
    fn pending_validation(&self) -> &[StatsOf<Self::Sample>] {
        self.common().pending.as_deref().unwrap_or_default()
    }

    /// Bookkeeping after the fragment was accepted by the ingest endpoint.
    ///
    /// # Panics
    ///
    /// If the fragment was generated by another series.
    fn record_sent(&mut self, mut fragment: Fragment<Self::Sample>) {
        assert_eq!(
            fragment.series_name(),
            self.unique_name(),
            "fragment attributed to the wrong series"
        );
        let stats = fragment.seal().clone();
        if let Err(e) = fragment.discard_samples() {
            unreachable!("{e}");
        }
        let common = self.common_mut();
        common.sent_since_validate += 1;
        if let Some(pending) = &mut common.pending {
            pending.push(stats);
        }
    }

    /// All retained summaries were confirmed by the query API.
    fn finish_validation(&mut self, samples: u64) {
        let common = self.common_mut();
        if let Some(pending) = &mut common.pending {
            pending.clear();
        }
        common.sent_since_validate = 0;
        common.samples_validated += samples;
    }
}

/// Either series variant.
#[derive(Debug)]
pub enum Series {
    Log(LogSeries),
    Metric(MetricSeries),
}

macro_rules! each {
    ($self:expr, $s:ident => $body:expr) => {
        match $self {
            Series::Log($s) => $body,
            Series::Metric($s) => $body,
        }
    };
}

impl Series {
    pub fn family(&self) -> Family {
        match self {
            Self::Log(_) => Family::Logs,
            Self::Metric(_) => Family::Metrics,
        }
    }
    pub fn unique_name(&self) -> &str {
        each!(self, s => s.unique_name())
    }
    pub fn labels(&self) -> &LabelSet {
        each!(self, s => s.labels())
    }
    pub fn query_selector(&self) -> String {
        each!(self, s => s.query_selector())
    }
    pub fn samples_per_fragment(&self) -> usize {
        each!(self, s => s.samples_per_fragment())
    }
    pub fn fragments_generated(&self) -> u64 {
        each!(self, s => s.fragments_generated())
    }
    pub fn sent_since_validate(&self) -> u64 {
        each!(self, s => s.sent_since_validate())
    }
    pub fn samples_validated(&self) -> u64 {
        each!(self, s => s.samples_validated())
    }
    pub fn forward_leaps(&self) -> u64 {
        each!(self, s => s.forward_leaps())
    }
    pub fn pending_validation_count(&self) -> usize {
        each!(self, s => s.pending_validation().len())
    }
    pub fn fragment_width_secs(&self) -> f64 {
        each!(self, s => s.fragment_width_secs())
    }
    pub fn current_lag_secs_at(&self, now_secs: f64) -> f64 {
        each!(self, s => s.current_lag_secs_at(now_secs))
    }

    pub fn generate_next_fragment_or_skip_at(
        &mut self,
        now_secs: f64,
    ) -> FragmentAttempt<AnyFragment> {
        each!(self, s => {
            let attempt = s.generate_next_fragment_or_skip_at(now_secs);
            FragmentAttempt {
                lag_secs: attempt.lag_secs,
                leaped: attempt.leaped,
                fragment: attempt.fragment.map(AnyFragment::from),
            }
        })
    }
    pub fn generate_next_fragment_or_skip(&mut self) -> FragmentAttempt<AnyFragment> {
        self.generate_next_fragment_or_skip_at(clock::wall_now_secs())
    }

    pub fn enable_validation(&mut self) {
        each!(self, s => s.enable_validation())
    }
    pub fn disable_validation(&mut self) {
        each!(self, s => s.disable_validation())
    }
    pub fn should_be_validated(&self) -> bool {
        each!(self, s => s.should_be_validated())
    }
    pub fn drop_validation_info(&mut self) {
        each!(self, s => s.drop_validation_info())
    }

    /// # Panics
    ///
    /// If the fragment family or back-link does not match this series.
    pub fn record_sent(&mut self, fragment: AnyFragment) {
        match (self, fragment) {
            (Self::Log(s), AnyFragment::Log(f)) => s.record_sent(f),
            (Self::Metric(s), AnyFragment::Metric(f)) => s.record_sent(f),
            (s, f) => panic!(
                "fragment {}/{} does not belong to series {}",
                f.series_name(),
                f.index(),
                s.unique_name()
            ),
        }
    }
}
impl fmt::Display for Series {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Log(s) => write!(f, "LogSeries({})", s.unique_name()),
            Self::Metric(s) => write!(f, "MetricSeries({})", s.unique_name()),
        }
    }
}
impl From<LogSeries> for Series {
    fn from(s: LogSeries) -> Self {
        Self::Log(s)
    }
}
impl From<MetricSeries> for Series {
    fn from(s: MetricSeries) -> Self {
        Self::Metric(s)
    }
}
