use std::sync::Arc;

use thiserror::Error;

use crate::{
    sample::{LogSample, MetricSample, Sample},
    LabelSet,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FragmentError {
    #[error("fragment {series}/{index} is sealed: samples cannot be appended")]
    Sealed { series: Arc<str>, index: u64 },
    #[error("fragment {series}/{index} is not sealed yet")]
    NotSealed { series: Arc<str>, index: u64 },
}

/// An ordered batch of samples from one series. Open until sealed; sealing
/// freezes the sample list and computes a statistics summary, after which the
/// raw samples may be dropped.
#[derive(Debug, Clone)]
pub struct Fragment<S: Sample> {
    labels: Arc<LabelSet>,
    index: u64,
    series: Arc<str>,
    samples: Vec<S>,
    stats: Option<S::Stats>,
    sample_count: u64,
    payload_bytes: u64,
}
impl<S: Sample> Fragment<S> {
    pub fn new(labels: Arc<LabelSet>, index: u64, series: Arc<str>) -> Self {
        Self {
            labels,
            index,
            series,
            samples: vec![],
            stats: None,
            sample_count: 0,
            payload_bytes: 0,
        }
    }
    pub fn with_capacity(
        labels: Arc<LabelSet>,
        index: u64,
        series: Arc<str>,
        capacity: usize,
    ) -> Self {
        let mut f = Self::new(labels, index, series);
        f.samples.reserve_exact(capacity);
        f
    }

    pub fn push(&mut self, sample: S) -> Result<(), FragmentError> {
        if self.is_sealed() {
            return Err(FragmentError::Sealed {
                series: self.series.clone(),
                index: self.index,
            });
        }
        self.payload_bytes += sample.payload_bytes();
        self.sample_count += 1;
        self.samples.push(sample);
        Ok(())
    }

    /// Idempotent: the first call computes the statistics, later calls
    /// return the same summary.
    pub fn seal(&mut self) -> &S::Stats {
        let stats = match self.stats.take() {
            Some(stats) => stats,
            None => S::summarize(&self.samples, self.payload_bytes),
        };
        self.stats.insert(stats)
    }
    pub fn is_sealed(&self) -> bool {
        self.stats.is_some()
    }

    /// Drop the raw samples of a sealed fragment. Counts and byte accounting
    /// stay intact.
    pub fn discard_samples(&mut self) -> Result<(), FragmentError> {
        if !self.is_sealed() {
            return Err(FragmentError::NotSealed {
                series: self.series.clone(),
                index: self.index,
            });
        }
        self.samples = vec![];
        Ok(())
    }

    pub fn samples(&self) -> &[S] {
        &self.samples
    }
    pub fn stats(&self) -> Option<&S::Stats> {
        self.stats.as_ref()
    }
    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }
    pub fn payload_bytes(&self) -> u64 {
        self.payload_bytes
    }
    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }
    pub fn index(&self) -> u64 {
        self.index
    }
    /// Unique name of the series this fragment was generated from.
    pub fn series_name(&self) -> &str {
        &self.series
    }
    pub fn index_string(&self, width: usize) -> String {
        format!("{:0width$}", self.index)
    }
}

pub type MetricFragment = Fragment<MetricSample>;
pub type LogFragment = Fragment<LogSample>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Logs,
    Metrics,
}

#[derive(Debug, Clone)]
pub enum AnyFragment {
    Log(LogFragment),
    Metric(MetricFragment),
}
impl AnyFragment {
    pub fn family(&self) -> Family {
        match self {
            Self::Log(_) => Family::Logs,
            Self::Metric(_) => Family::Metrics,
        }
    }
    pub fn index(&self) -> u64 {
        match self {
            Self::Log(f) => f.index(),
            Self::Metric(f) => f.index(),
        }
    }
    pub fn series_name(&self) -> &str {
        match self {
            Self::Log(f) => f.series_name(),
            Self::Metric(f) => f.series_name(),
        }
    }
    pub fn sample_count(&self) -> u64 {
        match self {
            Self::Log(f) => f.sample_count(),
            Self::Metric(f) => f.sample_count(),
        }
    }
    pub fn payload_bytes(&self) -> u64 {
        match self {
            Self::Log(f) => f.payload_bytes(),
            Self::Metric(f) => f.payload_bytes(),
        }
    }
    pub fn is_sealed(&self) -> bool {
        match self {
            Self::Log(f) => f.is_sealed(),
            Self::Metric(f) => f.is_sealed(),
        }
    }
    pub fn seal(&mut self) {
        match self {
            Self::Log(f) => {
                f.seal();
            }
            Self::Metric(f) => {
                f.seal();
            }
        }
    }
    pub fn index_string(&self, width: usize) -> String {
        format!("{:0width$}", self.index())
    }
}
impl From<LogFragment> for AnyFragment {
    fn from(f: LogFragment) -> Self {
        Self::Log(f)
    }
}
impl From<MetricFragment> for AnyFragment {
    fn from(f: MetricFragment) -> Self {
        Self::Metric(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric_fragment() -> MetricFragment {
        let labels = Arc::new(LabelSet::from([("uniquename".to_string(), "s-1".to_string())]));
        let mut f = Fragment::new(labels, 1, Arc::from("s-1"));
        for i in 0..4 {
            f.push(MetricSample {
                value: f64::from(i) * 0.5,
                time_ms: 1_000 * i64::from(i),
            })
            .unwrap();
        }
        f
    }

    #[test]
    fn push_after_seal_fails() {
        let mut f = metric_fragment();
        f.seal();
        let err = f
            .push(MetricSample {
                value: 1.0,
                time_ms: 9_000,
            })
            .unwrap_err();
        assert!(matches!(err, FragmentError::Sealed { index: 1, .. }));
        assert_eq!(f.sample_count(), 4);
    }

    #[test]
    fn sealing_twice_yields_identical_stats() {
        let mut f = metric_fragment();
        let first = f.seal().clone();
        let second = f.seal().clone();
        assert_eq!(first, second);
        assert_eq!(first.sample_count, 4);
    }

    #[test]
    fn accounting_survives_discarding_samples() {
        let mut f = metric_fragment();
        assert!(f.discard_samples().is_err());
        f.seal();
        let bytes = f.payload_bytes();
        f.discard_samples().unwrap();
        assert!(f.samples().is_empty());
        assert_eq!(f.payload_bytes(), bytes);
        assert_eq!(f.payload_bytes(), 64);
        assert_eq!(f.sample_count(), 4);
        // sealing again after the drop does not recompute from the empty list
        assert_eq!(f.seal().sample_count, 4);
    }

    #[test]
    fn index_string_is_zero_padded() {
        assert_eq!(metric_fragment().index_string(3), "001");
    }
}
