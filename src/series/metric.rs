use rand::Rng;

use crate::{
    config::ConfigError,
    labels::{self, LabelSet, METRIC_NAME_LABEL, UNIQUE_NAME_LABEL},
    sample::{MetricSample, MetricStats},
    walltime::{WalltimeCoupling, WalltimeCouplingOptions},
};

use super::{SeriesCommon, TimeSeries};

/// Coupling window used when none is configured.
pub const FALLBACK_COUPLING: WalltimeCouplingOptions = WalltimeCouplingOptions {
    min_lag_secs: 120.0,
    max_lag_secs: 1800.0,
};
const RANDOM_WALK_STEP: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct MetricSeriesOptions {
    pub unique_name: String,
    /// Time of the first sample; whole seconds since the epoch.
    pub start_secs: i64,
    pub extra_labels: LabelSet,
    pub sample_interval_ms: i64,
    pub samples_per_fragment: usize,
    pub coupling: Option<WalltimeCouplingOptions>,
    pub seed: Option<u64>,
}

/// Random-walk metric series.
#[derive(Debug)]
pub struct MetricSeries {
    common: SeriesCommon<MetricStats>,
    metric_name: String,
    interval_ms: i64,
    last_ms: i64,
    last_value: f64,
    query_width_secs: i64,
}
impl MetricSeries {
    pub fn new(opts: MetricSeriesOptions) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidSeries {
            series: opts.unique_name.clone(),
            reason,
        };
        let n = opts.samples_per_fragment;
        let inc = opts.sample_interval_ms;
        if n == 0 {
            return Err(invalid("samples per fragment must be positive".into()));
        }
        if inc <= 0 {
            return Err(invalid("sample interval must be positive".into()));
        }
        // the instant query cannot address sub-second right edges for such series
        if inc > 1000 && inc % 1000 != 0 {
            return Err(invalid(format!(
                "sample interval {inc} ms above one second must be a multiple of 1000 ms"
            )));
        }
        if inc < 1000 && (n as i64 * inc) % 1000 != 0 {
            return Err(invalid(format!(
                "with a sample interval of {inc} ms, samples per fragment \
                 ({n}) times the interval must be a multiple of 1000 ms"
            )));
        }

        let width_secs = n as f64 * inc as f64 / 1000.0;
        let coupling_opts = opts.coupling.unwrap_or(FALLBACK_COUPLING);
        let coupling = WalltimeCoupling::new(coupling_opts, width_secs)?;

        let metric_name = labels::metric_name_for(&opts.unique_name);
        let mut labels = opts.extra_labels;
        labels.insert(UNIQUE_NAME_LABEL.into(), opts.unique_name.clone());
        labels.insert(METRIC_NAME_LABEL.into(), metric_name.clone());

        let mut common = SeriesCommon::new(&opts.unique_name, labels, n, Some(coupling), opts.seed);
        let start_value = (common.rng().gen_range(-5.0..5.0) * 10.0_f64).round() / 10.0;
        Ok(Self {
            common,
            metric_name,
            interval_ms: inc,
            last_ms: opts.start_secs * 1000 - inc,
            last_value: start_value,
            query_width_secs: ((n as i64 - 1) * inc + 999) / 1000,
        })
    }

    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }
    pub fn sample_interval_ms(&self) -> i64 {
        self.interval_ms
    }
    /// Range-vector width `W` of the validation query, whole seconds.
    pub fn query_width_secs(&self) -> i64 {
        self.query_width_secs
    }
    pub fn last_sample_ms(&self) -> i64 {
        self.last_ms
    }
    pub fn pending_stats(&self) -> &[MetricStats] {
        self.pending_validation()
    }

    fn next_value(&mut self) -> f64 {
        if self.common.rng().gen::<f64>() >= 0.5 {
            self.last_value += RANDOM_WALK_STEP;
        } else {
            self.last_value -= RANDOM_WALK_STEP;
        }
        self.last_value
    }
}

impl TimeSeries for MetricSeries {
    type Sample = MetricSample;

    fn common(&self) -> &SeriesCommon<MetricStats> {
        &self.common
    }
    fn common_mut(&mut self) -> &mut SeriesCommon<MetricStats> {
        &mut self.common
    }
    fn last_sample_secs(&self) -> f64 {
        self.last_ms as f64 / 1000.0
    }
    /// Whole seconds only, keeping timestamps aligned to the sample grid.
    fn leap_forward(&mut self, by_secs: f64) {
        let secs = by_secs.floor().max(1.0) as i64;
        self.last_ms += secs * 1000;
    }
    fn next_sample(&mut self) -> MetricSample {
        self.last_ms += self.interval_ms;
        MetricSample {
            value: self.next_value(),
            time_ms: self.last_ms,
        }
    }
    fn query_selector(&self) -> String {
        labels::selector(self.labels())
    }
    fn fragment_width_secs(&self) -> f64 {
        self.samples_per_fragment() as f64 * self.interval_ms as f64 / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::walltime::LEAP_SAFETY_MARGIN_SECS;

    fn opts(start_secs: i64) -> MetricSeriesOptions {
        MetricSeriesOptions {
            unique_name: "run-x-0001".into(),
            start_secs,
            extra_labels: LabelSet::new(),
            sample_interval_ms: 1000,
            samples_per_fragment: 10,
            coupling: Some(WalltimeCouplingOptions {
                min_lag_secs: 60.0,
                max_lag_secs: 2400.0,
            }),
            seed: Some(42),
        }
    }

    #[test]
    fn timestamps_advance_by_exactly_one_interval() {
        let mut s = MetricSeries::new(opts(1_000)).unwrap();
        let mut previous = None;
        for index in 1..=5 {
            let f = s.generate_next_fragment();
            assert_eq!(f.index(), index);
            for sample in f.samples() {
                if let Some(p) = previous {
                    assert_eq!(sample.time_ms - p, 1000);
                }
                previous = Some(sample.time_ms);
            }
        }
        assert_eq!(s.fragments_generated(), 5);
        assert_eq!(s.last_sample_ms(), 1_000_000 + 49 * 1000);
    }

    #[test]
    fn random_walk_steps_and_start() {
        let mut s = MetricSeries::new(opts(0)).unwrap();
        let start = s.last_value;
        assert!((-5.0..=5.0).contains(&start));
        assert_eq!((start * 10.0).round() / 10.0, start);
        let f = s.generate_next_fragment();
        let mut prev = start;
        for sample in f.samples() {
            assert!(((sample.value - prev).abs() - 0.1).abs() < 1e-9);
            prev = sample.value;
        }
    }

    #[test]
    fn labels_and_query() {
        let s = MetricSeries::new(opts(0)).unwrap();
        assert_eq!(s.metric_name(), "run_x_0001");
        assert_eq!(
            s.query_selector(),
            r#"{__name__="run_x_0001", uniquename="run-x-0001"}"#
        );
        assert_eq!(s.query_width_secs(), 9);
    }

    #[test]
    fn rejects_unaddressable_intervals() {
        let mut o = opts(0);
        o.sample_interval_ms = 1500;
        assert!(MetricSeries::new(o).is_err());
        let mut o = opts(0);
        o.sample_interval_ms = 3;
        o.samples_per_fragment = 100;
        assert!(MetricSeries::new(o).is_err());
        let mut o = opts(0);
        o.sample_interval_ms = 1;
        o.samples_per_fragment = 1000;
        let s = MetricSeries::new(o).unwrap();
        assert_eq!(s.query_width_secs(), 1);
        let mut o = opts(0);
        o.coupling = Some(WalltimeCouplingOptions {
            min_lag_secs: 1.0,
            max_lag_secs: 8.0,
        });
        assert!(MetricSeries::new(o).is_err());
    }

    #[test]
    fn falls_back_to_default_coupling() {
        let mut o = opts(0);
        o.coupling = None;
        let s = MetricSeries::new(o).unwrap();
        assert_eq!(s.coupling().unwrap().options(), FALLBACK_COUPLING);
    }

    #[test]
    fn leaps_forward_when_too_far_behind() {
        let now = 1_700_000_000.0;
        let mut s = MetricSeries::new(opts(1_600_000_000)).unwrap();
        let attempt = s.generate_next_fragment_or_skip_at(now);
        assert!(attempt.leaped);
        assert_eq!(s.forward_leaps(), 1);
        // after the leap the lag sits at min + margin, too close for a 10 s fragment
        assert!(attempt.fragment.is_none());
        let lag = s.current_lag_secs_at(now);
        assert!((lag - (60.0 + LEAP_SAFETY_MARGIN_SECS)).abs() <= 1.0);

        let later = now + 20.0;
        let attempt = s.generate_next_fragment_or_skip_at(later);
        assert!(!attempt.leaped);
        let f = attempt.fragment.unwrap();
        assert_eq!(f.sample_count(), 10);
        assert!(attempt.lag_secs >= 60.0);
        assert_eq!(s.forward_leaps(), 1);
    }

    #[test]
    #[should_panic(expected = "ahead of wall time")]
    fn synthetic_clock_ahead_of_wall_time_is_fatal() {
        let mut s = MetricSeries::new(opts(2_000)).unwrap();
        s.generate_next_fragment_or_skip_at(1_000.0);
    }

    #[test]
    fn validation_modes() {
        let mut s = MetricSeries::new(opts(0)).unwrap();
        assert!(!s.should_be_validated());
        let f = s.generate_next_fragment();
        s.record_sent(f);
        assert_eq!(s.sent_since_validate(), 1);
        assert!(s.pending_stats().is_empty());

        s.enable_validation();
        let f = s.generate_next_fragment();
        s.record_sent(f);
        s.enable_validation();
        assert_eq!(s.pending_stats().len(), 1);
        assert_eq!(s.pending_stats()[0].sample_count, 10);

        s.finish_validation(10);
        assert_eq!(s.sent_since_validate(), 0);
        assert_eq!(s.samples_validated(), 10);
        assert!(s.should_be_validated());
        s.disable_validation();
        assert!(!s.should_be_validated());
    }

    #[test]
    #[should_panic(expected = "wrong series")]
    fn foreign_fragment_is_rejected() {
        let mut a = MetricSeries::new(opts(0)).unwrap();
        let mut o = opts(0);
        o.unique_name = "other".into();
        let mut b = MetricSeries::new(o).unwrap();
        let f = b.generate_next_fragment();
        a.record_sent(f);
    }
}
