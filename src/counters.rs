use std::time::Instant;

use prometheus::{
    core::Collector, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry,
};

pub const POST_DURATION_BUCKETS: [f64; 12] =
    [0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0];
pub const LAG_BUCKETS: [f64; 9] = [
    30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0, 3600.0, 7200.0,
];
pub const STATUS_CODE_LABEL: &str = "statuscode";

fn register<C: Collector + Clone + 'static>(registry: &Registry, c: C) -> prometheus::Result<C> {
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    register(registry, IntCounter::new(name, help)?)
}

fn by_status(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounterVec> {
    register(
        registry,
        IntCounterVec::new(Opts::new(name, help), &[STATUS_CODE_LABEL])?,
    )
}

fn histogram(
    registry: &Registry,
    name: &str,
    help: &str,
    buckets: &[f64],
) -> prometheus::Result<Histogram> {
    let opts = HistogramOpts::new(name, help).buckets(buckets.to_vec());
    register(registry, Histogram::with_opts(opts)?)
}

/// Process-wide counters, shared by reference between the engine components
/// and the `/metrics` exporter.
///
/// Every metric carries the constant labels `invocation_id` and `hostname`.
pub struct Counters {
    invocation_id: String,
    started: Instant,
    registry: Registry,

    pub fragments_pushed: IntCounter,
    pub samples_pushed: IntCounter,
    pub payload_bytes_pushed: IntCounter,
    pub serialized_bytes_pushed: IntCounter,
    pub last_request_body_bytes: IntGauge,
    pub post_non_http_errors: IntCounter,
    pub get_non_http_errors: IntCounter,
    pub unexpected_query_results: IntCounter,
    pub rw_cycles: IntCounter,
    pub fragment_generation_delayed: IntCounter,
    pub forward_leaps: IntCounter,
    pub ambiguous_push_successes: IntCounter,
    pub post_responses: IntCounterVec,
    pub get_responses: IntCounterVec,
    pub uptime: Gauge,
    pub lag_behind_walltime: Histogram,
    pub post_with_retry_duration: Histogram,
}
impl Counters {
    pub fn new(invocation_id: impl Into<String>) -> prometheus::Result<Self> {
        let invocation_id = invocation_id.into();
        let const_labels = [
            ("invocation_id".to_string(), invocation_id.clone()),
            ("hostname".to_string(), hostname()),
        ]
        .into_iter()
        .collect();
        let r = Registry::new_custom(None, Some(const_labels))?;

        let last_request_body_bytes = register(
            &r,
            IntGauge::new(
                "gauge_last_http_request_body_size_bytes",
                "size of the last successfully pushed request body",
            )?,
        )?;
        let uptime = register(
            &r,
            Gauge::new("gauge_uptime", "uptime of this process in seconds")?,
        )?;
        Ok(Self {
            fragments_pushed: counter(
                &r,
                "counter_fragments_pushed",
                "fragments successfully pushed",
            )?,
            samples_pushed: counter(
                &r,
                "counter_log_entries_pushed",
                "samples (log entries or metric samples) successfully pushed",
            )?,
            payload_bytes_pushed: counter(
                &r,
                "counter_payload_bytes_pushed",
                "sample payload bytes successfully pushed",
            )?,
            serialized_bytes_pushed: counter(
                &r,
                "counter_serialized_fragments_bytes_pushed",
                "compressed push message bytes successfully pushed",
            )?,
            last_request_body_bytes,
            post_non_http_errors: counter(
                &r,
                "counter_post_non_http_errors",
                "POST attempts without HTTP response",
            )?,
            get_non_http_errors: counter(
                &r,
                "counter_get_non_http_errors",
                "GET attempts without HTTP response",
            )?,
            unexpected_query_results: counter(
                &r,
                "counter_unexpected_query_results",
                "query results not matching the expectation",
            )?,
            rw_cycles: counter(&r, "counter_rw_cycles", "write/read cycles performed")?,
            fragment_generation_delayed: counter(
                &r,
                "counter_fragment_generation_delayed",
                "fragment generation delayed to not overtake wall time",
            )?,
            forward_leaps: counter(
                &r,
                "counter_forward_leap",
                "forward leaps of a synthetic clock falling behind wall time",
            )?,
            ambiguous_push_successes: counter(
                &r,
                "counter_ambiguous_push_successes",
                "pushes treated as successful after an ambiguous 5xx",
            )?,
            post_responses: by_status(
                &r,
                "counter_post_responses",
                "HTTP responses to POST requests by status code",
            )?,
            get_responses: by_status(
                &r,
                "counter_get_responses",
                "HTTP responses to GET requests by status code",
            )?,
            uptime,
            lag_behind_walltime: histogram(
                &r,
                "lag_compared_to_wall_time_seconds",
                "lag of the synthetic clock behind wall time when a series is picked",
                &LAG_BUCKETS,
            )?,
            post_with_retry_duration: histogram(
                &r,
                "duration_post_with_retry_seconds",
                "duration of a push including retries, on success",
                &POST_DURATION_BUCKETS,
            )?,
            invocation_id,
            started: Instant::now(),
            registry: r,
        })
    }

    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_post_response(&self, status: u16) {
        self.post_responses
            .with_label_values(&[&status.to_string()])
            .inc();
    }
    pub fn record_get_response(&self, status: u16) {
        self.get_responses
            .with_label_values(&[&status.to_string()])
            .inc();
    }
    pub fn post_responses(&self, status: u16) -> u64 {
        self.post_responses
            .with_label_values(&[&status.to_string()])
            .get()
    }
    pub fn get_responses(&self, status: u16) -> u64 {
        self.get_responses
            .with_label_values(&[&status.to_string()])
            .get()
    }

    /// Bring the uptime gauge up to date; called before every scrape.
    pub fn refresh_uptime(&self) {
        self.uptime.set(self.started.elapsed().as_secs_f64());
    }
}
impl core::fmt::Debug for Counters {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Counters")
            .field("invocation_id", &self.invocation_id)
            .finish()
    }
}

fn hostname() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use prometheus::proto::MetricFamily;

    use super::*;

    fn family<'a>(families: &'a [MetricFamily], name: &str) -> &'a MetricFamily {
        families.iter().find(|f| f.get_name() == name).unwrap()
    }

    #[test]
    fn histograms_use_their_buckets() {
        let c = Counters::new("t").unwrap();
        c.lag_behind_walltime.observe(45.0);
        c.lag_behind_walltime.observe(9000.0);
        assert_eq!(c.lag_behind_walltime.get_sample_count(), 2);
        assert_eq!(c.lag_behind_walltime.get_sample_sum(), 9045.0);

        let families = c.registry().gather();
        let h = family(&families, "lag_compared_to_wall_time_seconds").get_metric()[0]
            .get_histogram();
        let buckets = h.get_bucket();
        assert_eq!(buckets.len(), LAG_BUCKETS.len());
        assert_eq!(buckets[0].get_upper_bound(), 30.0);
        assert_eq!(buckets[0].get_cumulative_count(), 0);
        assert_eq!(buckets[1].get_cumulative_count(), 1);
        assert_eq!(buckets[8].get_cumulative_count(), 1);
    }

    #[test]
    fn responses_are_counted_by_status_code() {
        let c = Counters::new("ingestcheck-abc123").unwrap();
        c.fragments_pushed.inc_by(3);
        c.record_post_response(204);
        c.record_post_response(204);
        c.record_post_response(500);
        assert_eq!(c.post_responses(204), 2);
        assert_eq!(c.post_responses(500), 1);
        assert_eq!(c.get_responses(200), 0);

        let families = c.registry().gather();
        let pushed = &family(&families, "counter_fragments_pushed").get_metric()[0];
        assert_eq!(pushed.get_counter().get_value(), 3.0);
        let labels: Vec<(&str, &str)> = pushed
            .get_label()
            .iter()
            .map(|l| (l.get_name(), l.get_value()))
            .collect();
        assert!(labels.contains(&("invocation_id", "ingestcheck-abc123")));
        assert!(labels.iter().any(|(name, _)| *name == "hostname"));
    }

    #[test]
    fn counters_of_separate_runs_are_independent() {
        let a = Counters::new("a").unwrap();
        let b = Counters::new("b").unwrap();
        a.rw_cycles.inc();
        assert_eq!(a.rw_cycles.get(), 1);
        assert_eq!(b.rw_cycles.get(), 0);
    }
}
