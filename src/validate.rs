use std::sync::Arc;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, info, warn};

use crate::{
    clock::{self, Deadline},
    counters::Counters,
    sample::{LogStats, LogTimestamp, MetricStats},
    series::{LogSeries, MetricSeries, Series, TimeSeries},
    transport::HttpClient,
};

pub const PROM_QUERY_PATH: &str = "/api/v1/query";
pub const LOKI_QUERY_RANGE_PATH: &str = "/loki/api/v1/query_range";

#[derive(Debug, Error)]
pub enum ValidateError {
    #[error("GET {path}: bad request: HTTP {status}: {body}")]
    BadQuery {
        path: &'static str,
        status: u16,
        body: String,
    },
    #[error("GET {path}: failed after {attempts} attempts")]
    AttemptsExhausted { path: &'static str, attempts: u32 },
    #[error("GET {path}: undecodable response body: {source}")]
    Decode {
        path: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{series} fragment {index}: expected one series in the query result, got {got}")]
    NotOneSeries {
        series: String,
        index: u64,
        got: usize,
    },
    #[error(
        "{series} fragment {index}: unexpected entry count returned in query result: \
         {got} (expected: {expected})"
    )]
    UnexpectedCount {
        series: String,
        index: u64,
        expected: u64,
        got: u64,
    },
    #[error(
        "{series} fragment {index}: too many entries returned in query result: \
         {got} (expected: {expected})"
    )]
    TooManyEntries {
        series: String,
        index: u64,
        expected: u64,
        got: u64,
    },
    #[error(
        "{series} fragment {index}: expected {expected} entries not seen \
         within {deadline_secs} s (last count: {got})"
    )]
    CountDeadline {
        series: String,
        index: u64,
        expected: u64,
        got: u64,
        deadline_secs: f64,
    },
    #[error("{series} fragment {index}: query result gave up after {attempts} attempts: {last}")]
    CountRetriesExhausted {
        series: String,
        index: u64,
        attempts: u32,
        last: Box<ValidateError>,
    },
    #[error("{series} fragment {index}: statistics mismatch: sent {expected}, read back {got}")]
    StatsMismatch {
        series: String,
        index: u64,
        expected: String,
        got: String,
    },
    #[error("{series} fragment {index}: content mismatch: {reason}")]
    ContentMismatch {
        series: String,
        index: u64,
        reason: String,
    },
}
impl ValidateError {
    /// Count problems may resolve with time; everything else is permanent.
    pub fn is_count_mismatch(&self) -> bool {
        matches!(
            self,
            Self::UnexpectedCount { .. } | Self::TooManyEntries { .. } | Self::CountDeadline { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Entries fetched per log query.
    pub fetch_n_entries_per_query: u64,
    /// Check the timestamp prefix of every Nth entry; 0 checks all.
    pub inspect_every_nth_entry: u64,
    /// 0 means unbounded.
    pub max_concurrent_reads: usize,
    pub get_attempts: u32,
    pub get_retry_sleep_secs: f64,
    /// Budget for waiting on the expected count of one log query.
    pub count_deadline_secs: f64,
    pub empty_result_sleep_secs: f64,
    pub short_result_sleep_secs: f64,
    pub count_attempts: u32,
    pub count_retry_sleep_secs: f64,
}
impl ReadOptions {
    pub fn new(
        fetch_n_entries_per_query: u64,
        inspect_every_nth_entry: u64,
        max_concurrent_reads: usize,
    ) -> Self {
        Self {
            fetch_n_entries_per_query,
            inspect_every_nth_entry,
            max_concurrent_reads,
            get_attempts: 10,
            get_retry_sleep_secs: 3.0,
            count_deadline_secs: 30.0,
            empty_result_sleep_secs: 0.5,
            short_result_sleep_secs: 1.0,
            count_attempts: 3,
            count_retry_sleep_secs: 5.0,
        }
    }
}

/// Totals of one read phase.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReadTotals {
    pub series_validated: u64,
    pub samples: u64,
    pub payload_bytes: u64,
    pub duration_secs: f64,
}

#[derive(Debug, Deserialize)]
struct QueryResponse<R> {
    status: String,
    #[serde(default = "Option::default")]
    data: Option<QueryData<R>>,
}
#[derive(Debug, Deserialize)]
struct QueryData<R> {
    #[serde(default = "Vec::default")]
    result: Vec<R>,
}
#[derive(Debug, Deserialize)]
struct MatrixSeries {
    #[serde(default)]
    values: Vec<(f64, String)>,
}
#[derive(Debug, Deserialize)]
struct LogStream {
    #[serde(default)]
    values: Vec<(String, String)>,
}
impl<R> QueryResponse<R> {
    fn into_result(self) -> Vec<R> {
        self.data.map(|d| d.result).unwrap_or_default()
    }
}

/// Confirmed samples and payload bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Validated {
    pub samples: u64,
    pub payload_bytes: u64,
}

/// Queries written data back and compares it against fragment summaries.
#[derive(Debug)]
pub struct Validator {
    client: HttpClient,
    opts: ReadOptions,
    counters: Arc<Counters>,
}
impl Validator {
    pub fn new(client: HttpClient, opts: ReadOptions, counters: Arc<Counters>) -> Self {
        Self {
            client,
            opts,
            counters,
        }
    }

    pub fn options(&self) -> &ReadOptions {
        &self.opts
    }

    /// Validate every fragment retained by `series` and reset its
    /// validation bookkeeping.
    pub async fn fetch_and_validate(
        &self,
        series: &mut Series,
    ) -> Result<Validated, ValidateError> {
        let t0 = clock::mtime();
        debug!(
            "{series}: validate. Sent {} fragments since last validation, \
             previously validated: {} samples",
            series.sent_since_validate(),
            series.samples_validated()
        );
        let validated = match series {
            Series::Metric(s) => {
                let v = self.validate_metric_series(s).await?;
                s.finish_validation(v.samples);
                v
            }
            Series::Log(s) => {
                let v = self.validate_log_series(s).await?;
                s.finish_validation(v.samples);
                v
            }
        };
        info!(
            "{series}: validated {} samples, took {:.1} s",
            validated.samples,
            clock::secs_since(t0)
        );
        Ok(validated)
    }

    async fn validate_metric_series(&self, s: &MetricSeries) -> Result<Validated, ValidateError> {
        let mut validated = Validated::default();
        for (i, stats) in s.pending_stats().iter().enumerate() {
            let index = s.fragments_generated() - (s.pending_stats().len() - i - 1) as u64;
            let samples = self
                .with_count_retries(s.unique_name(), index, || {
                    self.validate_metric_fragment(s, index, stats)
                })
                .await?;
            validated.samples += samples;
            validated.payload_bytes += stats.payload_bytes;
            if (i + 1) % 20 == 0 {
                debug!("{}: {} fragments validated", s.unique_name(), i + 1);
            }
        }
        Ok(validated)
    }

    async fn validate_metric_fragment(
        &self,
        s: &MetricSeries,
        index: u64,
        expected: &MetricStats,
    ) -> Result<u64, ValidateError> {
        let query = metric_query_params(s, expected);
        debug!("{}: query params: {query:?}", s.unique_name());
        let body = self.get_retry_until_200(PROM_QUERY_PATH, query).await?;
        let resp: QueryResponse<MatrixSeries> = decode(PROM_QUERY_PATH, &body)?;
        let result = resp.into_result();
        let series = s.unique_name().to_string();
        let Some(found) = single_result(result, &series, index)? else {
            return Err(ValidateError::UnexpectedCount {
                series,
                index,
                expected: expected.sample_count,
                got: 0,
            });
        };

        let mut points: Vec<(i64, f64)> = Vec::with_capacity(found.values.len());
        for (ts, value) in &found.values {
            let value = value.parse::<f64>().map_err(|e| ValidateError::ContentMismatch {
                series: series.clone(),
                index,
                reason: format!("sample value {value:?} is not a number: {e}"),
            })?;
            points.push(((ts * 1000.0).round() as i64, value));
        }
        // The right edge of the instant query only has second resolution: for
        // sub-second intervals it also covers the first sample of the next
        // fragment.
        if s.sample_interval_ms() < 1000 && points.len() == s.samples_per_fragment() + 1 {
            debug!("{series}: last sample in query result belongs to the next fragment, ignore");
            points.pop();
        }

        let got = points.len() as u64;
        if got != expected.sample_count {
            return Err(ValidateError::UnexpectedCount {
                series,
                index,
                expected: expected.sample_count,
                got,
            });
        }
        let read_back = MetricStats::from_points(&points);
        if &read_back != expected {
            return Err(ValidateError::StatsMismatch {
                series,
                index,
                expected: format!("{expected:?}"),
                got: format!("{read_back:?}"),
            });
        }
        Ok(got)
    }

    async fn validate_log_series(&self, s: &LogSeries) -> Result<Validated, ValidateError> {
        let mut validated = Validated::default();
        for (i, stats) in s.pending_stats().iter().enumerate() {
            let index = s.fragments_generated() - (s.pending_stats().len() - i - 1) as u64;
            validated.samples += self.validate_log_fragment(s, index, stats).await?;
            validated.payload_bytes += stats.payload_bytes;
        }
        Ok(validated)
    }

    async fn validate_log_fragment(
        &self,
        s: &LogSeries,
        index: u64,
        expected: &LogStats,
    ) -> Result<u64, ValidateError> {
        let series = s.unique_name();
        let chunk_size = self.opts.fetch_n_entries_per_query.max(1);
        let inc = s.sample_interval_ns();
        let mut hasher = Sha256::new();
        let mut checked: u64 = 0;
        let mut chunk_index: u64 = 0;

        while checked < expected.sample_count {
            let count = chunk_size.min(expected.sample_count - checked);
            let start = expected.first.plus_nanos(checked as i64 * inc);
            let last = start.plus_nanos((count as i64 - 1) * inc);
            let query = log_query_params(&s.query_selector(), chunk_size, start, last);
            info!(
                "{series} fragment {index}: wait for chunk {} (entries {}..={}), \
                 expect {count} entries",
                chunk_index + 1,
                checked + 1,
                checked + count
            );
            let entries = self
                .with_count_retries(series, index, || {
                    self.wait_for_log_entries(series, index, &query, count)
                })
                .await?;

            for (k, (ts, line)) in entries.iter().enumerate() {
                let position = checked + k as u64;
                let want = expected.first.plus_nanos(position as i64 * inc);
                if ts.parse::<i64>().ok() != Some(want.to_unix_nanos()) {
                    return Err(ValidateError::ContentMismatch {
                        series: series.to_string(),
                        index,
                        reason: format!("entry {position} has timestamp {ts}, expected {want}"),
                    });
                }
                let nth = self.opts.inspect_every_nth_entry;
                let inspect = nth == 0 || position % nth == 0;
                if s.include_time_in_msg() && inspect && !carries_timestamp(line, ts) {
                    return Err(ValidateError::ContentMismatch {
                        series: series.to_string(),
                        index,
                        reason: format!(
                            "entry {position} does not start with its timestamp: {line:?}"
                        ),
                    });
                }
                hasher.update(line.as_bytes());
            }
            checked += count;
            chunk_index += 1;
        }

        let content_hash = format!("{:x}", hasher.finalize());
        if content_hash != expected.content_hash {
            return Err(ValidateError::ContentMismatch {
                series: series.to_string(),
                index,
                reason: format!(
                    "content hash {content_hash} differs from the one sent ({})",
                    expected.content_hash
                ),
            });
        }
        Ok(checked)
    }

    /// Poll until the query yields exactly `expected` entries.
    async fn wait_for_log_entries(
        &self,
        series: &str,
        index: u64,
        query: &[(String, String)],
        expected: u64,
    ) -> Result<Vec<(String, String)>, ValidateError> {
        let deadline = Deadline::in_secs(self.opts.count_deadline_secs);
        let t0 = clock::mtime();
        let mut query_count: u64 = 0;
        let mut got = 0;
        while !deadline.passed() {
            query_count += 1;
            let body = self
                .get_retry_until_200(LOKI_QUERY_RANGE_PATH, query.to_vec())
                .await?;
            let resp: QueryResponse<LogStream> = decode(LOKI_QUERY_RANGE_PATH, &body)?;
            if resp.status != "success" {
                warn!("{series}: status property is not `success`: {}", resp.status);
                clock::sleep_secs(self.opts.short_result_sleep_secs).await;
                continue;
            }
            let Some(stream) = single_result(resp.into_result(), series, index)? else {
                if query_count % 10 == 0 {
                    info!("{series}: queried {query_count} times, no log entries seen yet");
                }
                clock::sleep_secs(self.opts.empty_result_sleep_secs).await;
                continue;
            };
            got = stream.values.len() as u64;
            if got == expected {
                debug!(
                    "{series}: got expected result in query {query_count} after {:.2} s",
                    clock::secs_since(t0)
                );
                return Ok(stream.values);
            }
            if got > expected {
                return Err(ValidateError::TooManyEntries {
                    series: series.to_string(),
                    index,
                    expected,
                    got,
                });
            }
            info!("{series}: not enough entries returned yet ({got} of {expected}), waiting");
            clock::sleep_secs(self.opts.short_result_sleep_secs).await;
        }
        Err(ValidateError::CountDeadline {
            series: series.to_string(),
            index,
            expected,
            got,
            deadline_secs: self.opts.count_deadline_secs,
        })
    }

    /// Retry count mismatches a bounded number of times; other errors pass
    /// through.
    async fn with_count_retries<T, F, Fut>(
        &self,
        series: &str,
        index: u64,
        mut f: F,
    ) -> Result<T, ValidateError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ValidateError>>,
    {
        let attempts = self.opts.count_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_count_mismatch() => {
                    self.counters.unexpected_query_results.inc();
                    if attempt >= attempts {
                        return Err(ValidateError::CountRetriesExhausted {
                            series: series.to_string(),
                            index,
                            attempts,
                            last: Box::new(e),
                        });
                    }
                    warn!("{e}: retry in {} s", self.opts.count_retry_sleep_secs);
                    clock::sleep_secs(self.opts.count_retry_sleep_secs).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// GET until HTTP 200. Transport errors, 429 and 5xx are retried, other
    /// 4xx are permanent.
    async fn get_retry_until_200(
        &self,
        path: &'static str,
        query: Vec<(String, String)>,
    ) -> Result<String, ValidateError> {
        let attempts = self.opts.get_attempts;
        for attempt in 1..=attempts {
            let resp = match self.client.get(path, query.clone()).await {
                Ok(resp) => resp,
                Err(e) => {
                    self.counters.get_non_http_errors.inc();
                    warn!("GET {path}: attempt {attempt}/{attempts} failed with {e}");
                    clock::sleep_secs(self.opts.get_retry_sleep_secs).await;
                    continue;
                }
            };
            self.counters.record_get_response(resp.status);
            match resp.status {
                200 => return Ok(resp.body),
                429 => {
                    info!("GET {path}: 429 response, body: {}", resp.body_excerpt());
                    clock::sleep_secs(self.opts.get_retry_sleep_secs).await;
                }
                400..=499 => {
                    return Err(ValidateError::BadQuery {
                        path,
                        status: resp.status,
                        body: resp.body_excerpt().to_string(),
                    });
                }
                status => {
                    warn!(
                        "GET {path}: attempt {attempt}/{attempts}: HTTP {status}: {}: \
                         treat as transient problem, retry",
                        resp.body_excerpt()
                    );
                    clock::sleep_secs(self.opts.get_retry_sleep_secs).await;
                }
            }
        }
        Err(ValidateError::AttemptsExhausted { path, attempts })
    }
}

/// Validate all series marked for validation, at most
/// `max_concurrent_reads` at a time. Returns the series in their input
/// order.
///
/// # Panics
///
/// Re-raises panics of validation tasks.
pub async fn run_read_phase(
    series: Vec<Series>,
    validator: Arc<Validator>,
) -> Result<(Vec<Series>, ReadTotals), ValidateError> {
    let t0 = clock::mtime();
    let semaphore = match validator.opts.max_concurrent_reads {
        0 => None,
        n => Some(Arc::new(Semaphore::new(n))),
    };

    let mut slots: Vec<Option<Series>> = Vec::with_capacity(series.len());
    let mut tasks = JoinSet::new();
    for (position, mut s) in series.into_iter().enumerate() {
        if !s.should_be_validated() {
            slots.push(Some(s));
            continue;
        }
        slots.push(None);
        let validator = validator.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let st0 = clock::mtime();
            let _permit = match semaphore {
                Some(sem) => sem.acquire_owned().await.ok(),
                None => None,
            };
            debug!("{s}: held back by semaphore for {:.2} s", clock::secs_since(st0));
            let validated = validator.fetch_and_validate(&mut s).await?;
            Ok::<_, ValidateError>((position, s, validated))
        });
    }

    let mut totals = ReadTotals::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok((position, s, validated))) => {
                totals.series_validated += 1;
                totals.samples += validated.samples;
                totals.payload_bytes += validated.payload_bytes;
                slots[position] = Some(s);
            }
            Ok(Err(e)) => return Err(e),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => panic!("validation task failed: {e}"),
        }
    }
    totals.duration_secs = clock::secs_since(t0);

    let series: Vec<Series> = slots.into_iter().flatten().collect();
    info!(
        "validation (read) took {:.1} s overall. {} samples read across {} series",
        totals.duration_secs, totals.samples, totals.series_validated
    );
    Ok((series, totals))
}

fn metric_query_params(s: &MetricSeries, stats: &MetricStats) -> Vec<(String, String)> {
    // second resolution only: round up
    let right_edge_secs =
        stats.last_ms.div_euclid(1000) + i64::from(stats.last_ms.rem_euclid(1000) > 0);
    vec![
        (
            "query".to_string(),
            format!("{}[{}s]", s.query_selector(), s.query_width_secs()),
        ),
        ("time".to_string(), right_edge_secs.to_string()),
    ]
}

fn log_query_params(
    selector: &str,
    limit: u64,
    start: LogTimestamp,
    last: LogTimestamp,
) -> Vec<(String, String)> {
    vec![
        ("query".to_string(), selector.to_string()),
        ("direction".to_string(), "FORWARD".to_string()),
        ("limit".to_string(), limit.to_string()),
        ("start".to_string(), start.to_string()),
        // end is exclusive
        ("end".to_string(), last.plus_nanos(1).to_string()),
    ]
}

/// A message cut to its length still carries the start of its timestamp.
fn carries_timestamp(line: &str, ts: &str) -> bool {
    let prefix = format!("{ts}:");
    let n = prefix.len().min(line.len());
    line.as_bytes()[..n] == prefix.as_bytes()[..n]
}

fn decode<R: serde::de::DeserializeOwned>(
    path: &'static str,
    body: &str,
) -> Result<QueryResponse<R>, ValidateError> {
    serde_json::from_str(body).map_err(|source| ValidateError::Decode { path, source })
}

fn single_result<R>(
    mut result: Vec<R>,
    series: &str,
    index: u64,
) -> Result<Option<R>, ValidateError> {
    match result.len() {
        0 => Ok(None),
        1 => Ok(result.pop()),
        got => Err(ValidateError::NotOneSeries {
            series: series.to_string(),
            index,
            got,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        series::{Compressibility, LogSeriesOptions, MetricSeriesOptions},
        transport::{HttpResponse, HttpTransport, TransportError},
        LabelSet,
    };

    /// Answers GETs from a script, last entry repeating.
    struct Scripted {
        responses: Mutex<Vec<Result<HttpResponse, TransportError>>>,
        queries: Mutex<Vec<Vec<(String, String)>>>,
    }
    impl Scripted {
        fn new(mut responses: Vec<Result<HttpResponse, TransportError>>) -> Arc<Self> {
            responses.reverse();
            Arc::new(Self {
                responses: Mutex::new(responses),
                queries: Mutex::new(vec![]),
            })
        }
    }
    impl HttpTransport for Scripted {
        fn post(
            &self,
            _: &str,
            _: &[(&str, &str)],
            _: &[u8],
        ) -> Result<HttpResponse, TransportError> {
            unreachable!()
        }
        fn get(
            &self,
            _url: &str,
            query: &[(String, String)],
        ) -> Result<HttpResponse, TransportError> {
            self.queries.lock().unwrap().push(query.to_vec());
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                responses.pop().unwrap()
            } else {
                match responses.last().unwrap() {
                    Ok(r) => Ok(r.clone()),
                    Err(e) => Err(TransportError::new(e.kind.clone(), e.message.clone())),
                }
            }
        }
    }

    fn fast_opts() -> ReadOptions {
        ReadOptions {
            get_retry_sleep_secs: 0.0,
            count_deadline_secs: 0.2,
            empty_result_sleep_secs: 0.01,
            short_result_sleep_secs: 0.01,
            count_retry_sleep_secs: 0.0,
            ..ReadOptions::new(3, 0, 0)
        }
    }

    fn validator(transport: Arc<Scripted>) -> (Validator, Arc<Counters>) {
        let counters = Arc::new(Counters::new("test").unwrap());
        let client = HttpClient::new(transport, "http://querier");
        (Validator::new(client, fast_opts(), counters.clone()), counters)
    }

    fn metric_series_options() -> MetricSeriesOptions {
        MetricSeriesOptions {
            unique_name: "m-1".into(),
            start_secs: 1_000,
            extra_labels: LabelSet::new(),
            sample_interval_ms: 1000,
            samples_per_fragment: 4,
            coupling: None,
            seed: Some(9),
        }
    }

    fn metric_series() -> MetricSeries {
        MetricSeries::new(metric_series_options()).unwrap()
    }

    fn matrix_body(values: &[(f64, f64)]) -> String {
        let values: Vec<serde_json::Value> = values
            .iter()
            .map(|(t, v)| serde_json::json!([t, v.to_string()]))
            .collect();
        serde_json::json!({
            "status": "success",
            "data": {"resultType": "matrix", "result": [{"metric": {}, "values": values}]}
        })
        .to_string()
    }

    #[tokio::test]
    async fn metric_fragment_round_trip() {
        let mut s = metric_series();
        s.enable_validation();
        let f = s.generate_next_fragment();
        let echoed: Vec<(f64, f64)> = f
            .samples()
            .iter()
            .map(|p| (p.time_ms as f64 / 1000.0, p.value))
            .collect();
        s.record_sent(f);

        let transport = Scripted::new(vec![
            Ok(HttpResponse::new(503, "busy")),
            Ok(HttpResponse::new(200, matrix_body(&echoed))),
        ]);
        let (v, counters) = validator(transport.clone());
        let mut series = Series::from(s);
        let validated = v.fetch_and_validate(&mut series).await.unwrap();
        assert_eq!(validated.samples, 4);
        assert_eq!(series.samples_validated(), 4);
        assert_eq!(series.sent_since_validate(), 0);
        assert_eq!(series.pending_validation_count(), 0);
        assert_eq!(counters.get_responses(503), 1);

        let queries = transport.queries.lock().unwrap();
        let query = &queries[0];
        assert_eq!(query[0].1, "{__name__=\"m_1\", uniquename=\"m-1\"}[3s]");
        assert_eq!(query[1].1, "1003");
    }

    #[tokio::test]
    async fn metric_value_mismatch_is_fatal() {
        let mut s = metric_series();
        s.enable_validation();
        let f = s.generate_next_fragment();
        let echoed: Vec<(f64, f64)> = f
            .samples()
            .iter()
            .map(|p| (p.time_ms as f64 / 1000.0, p.value + 1.0))
            .collect();
        s.record_sent(f);
        let (v, _) = validator(Scripted::new(vec![Ok(HttpResponse::new(
            200,
            matrix_body(&echoed),
        ))]));
        let err = v.fetch_and_validate(&mut Series::from(s)).await.unwrap_err();
        assert!(matches!(err, ValidateError::StatsMismatch { index: 1, .. }), "{err}");
    }

    #[tokio::test]
    async fn sub_second_series_ignores_sample_of_next_fragment() {
        let mut s = MetricSeries::new(MetricSeriesOptions {
            sample_interval_ms: 500,
            ..metric_series_options()
        })
        .unwrap();
        s.enable_validation();
        let f = s.generate_next_fragment();
        let mut echoed: Vec<(f64, f64)> = f
            .samples()
            .iter()
            .map(|p| (p.time_ms as f64 / 1000.0, p.value))
            .collect();
        let (last_t, _) = echoed[3];
        echoed.push((last_t + 0.5, 123.4));
        s.record_sent(f);

        let (v, counters) = validator(Scripted::new(vec![Ok(HttpResponse::new(
            200,
            matrix_body(&echoed),
        ))]));
        let validated = v.fetch_and_validate(&mut Series::from(s)).await.unwrap();
        assert_eq!(validated.samples, 4);
        assert_eq!(counters.unexpected_query_results.get(), 0);
    }

    #[tokio::test]
    async fn whole_second_series_keeps_extra_sample() {
        let mut s = metric_series();
        s.enable_validation();
        let f = s.generate_next_fragment();
        let mut echoed: Vec<(f64, f64)> = f
            .samples()
            .iter()
            .map(|p| (p.time_ms as f64 / 1000.0, p.value))
            .collect();
        let (last_t, _) = echoed[3];
        echoed.push((last_t + 1.0, 123.4));
        s.record_sent(f);

        let (v, _) = validator(Scripted::new(vec![Ok(HttpResponse::new(
            200,
            matrix_body(&echoed),
        ))]));
        let err = v.fetch_and_validate(&mut Series::from(s)).await.unwrap_err();
        assert!(
            matches!(err, ValidateError::CountRetriesExhausted { attempts: 3, .. }),
            "{err}"
        );
    }

    #[tokio::test]
    async fn persistent_count_mismatch_gives_up() {
        let mut s = metric_series();
        s.enable_validation();
        let f = s.generate_next_fragment();
        let short: Vec<(f64, f64)> = f.samples()[..2]
            .iter()
            .map(|p| (p.time_ms as f64 / 1000.0, p.value))
            .collect();
        s.record_sent(f);
        let (v, counters) = validator(Scripted::new(vec![Ok(HttpResponse::new(
            200,
            matrix_body(&short),
        ))]));
        let err = v.fetch_and_validate(&mut Series::from(s)).await.unwrap_err();
        assert!(matches!(err, ValidateError::CountRetriesExhausted { attempts: 3, .. }), "{err}");
        assert_eq!(counters.unexpected_query_results.get(), 3);
    }

    #[tokio::test]
    async fn bad_query_is_permanent() {
        let mut s = metric_series();
        s.enable_validation();
        let f = s.generate_next_fragment();
        s.record_sent(f);
        let transport = Scripted::new(vec![Ok(HttpResponse::new(400, "parse error"))]);
        let (v, _) = validator(transport.clone());
        let err = v.fetch_and_validate(&mut Series::from(s)).await.unwrap_err();
        assert!(matches!(err, ValidateError::BadQuery { status: 400, .. }), "{err}");
        assert_eq!(transport.queries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn transport_errors_exhaust_attempts() {
        let mut s = metric_series();
        s.enable_validation();
        let f = s.generate_next_fragment();
        s.record_sent(f);
        let refused = Err(TransportError::new("io", "refused"));
        let (v, counters) = validator(Scripted::new(vec![refused]));
        let err = v.fetch_and_validate(&mut Series::from(s)).await.unwrap_err();
        assert!(matches!(err, ValidateError::AttemptsExhausted { attempts: 10, .. }), "{err}");
        assert_eq!(counters.get_non_http_errors.get(), 10);
    }

    fn streams_body(values: &[(String, String)]) -> String {
        serde_json::json!({
            "status": "success",
            "data": {"resultType": "streams", "result": [{"stream": {}, "values": values}]}
        })
        .to_string()
    }

    #[tokio::test]
    async fn log_fragment_is_fetched_in_chunks() {
        let mut s = LogSeries::new(LogSeriesOptions {
            unique_name: "l-1".into(),
            start: LogTimestamp::new(1_700_000_000, 0),
            extra_labels: LabelSet::new(),
            sample_interval_ns: 1,
            samples_per_fragment: 5,
            chars_per_msg: 30,
            include_time_in_msg: true,
            compressibility: Compressibility::Min,
            coupling: None,
            seed: Some(1),
        })
        .unwrap();
        s.enable_validation();
        let f = s.generate_next_fragment();
        let entries: Vec<(String, String)> =
            f.samples().iter().map(|e| (e.time.to_string(), e.line.clone())).collect();
        s.record_sent(f);

        // chunk size 3: entries 1-3, then 4-5; the second chunk is short once
        let transport = Scripted::new(vec![
            Ok(HttpResponse::new(200, streams_body(&entries[..3]))),
            Ok(HttpResponse::new(200, streams_body(&entries[3..4]))),
            Ok(HttpResponse::new(200, streams_body(&entries[3..]))),
        ]);
        let (v, _) = validator(transport.clone());
        let mut series = Series::from(s);
        let validated = v.fetch_and_validate(&mut series).await.unwrap();
        assert_eq!(validated.samples, 5);

        let queries = transport.queries.lock().unwrap();
        assert_eq!(queries.len(), 3);
        let param = |q: &Vec<(String, String)>, k: &str| {
            q.iter().find(|(n, _)| n == k).unwrap().1.clone()
        };
        assert_eq!(param(&queries[0], "start"), "1700000000000000000");
        assert_eq!(param(&queries[0], "end"), "1700000000000000003");
        assert_eq!(param(&queries[1], "start"), "1700000000000000003");
        assert_eq!(param(&queries[2], "end"), "1700000000000000005");
        assert_eq!(param(&queries[0], "direction"), "FORWARD");
        assert_eq!(param(&queries[0], "limit"), "3");
    }

    #[tokio::test]
    async fn log_content_mismatch_is_fatal() {
        let mut s = LogSeries::new(LogSeriesOptions {
            unique_name: "l-2".into(),
            start: LogTimestamp::new(1_700_000_000, 0),
            extra_labels: LabelSet::new(),
            sample_interval_ns: 1,
            samples_per_fragment: 2,
            chars_per_msg: 30,
            include_time_in_msg: true,
            compressibility: Compressibility::Min,
            coupling: None,
            seed: Some(1),
        })
        .unwrap();
        s.enable_validation();
        let f = s.generate_next_fragment();
        let mut entries: Vec<(String, String)> =
            f.samples().iter().map(|e| (e.time.to_string(), e.line.clone())).collect();
        s.record_sent(f);
        entries[1].1.push('x');
        let (v, _) = validator(Scripted::new(vec![Ok(HttpResponse::new(
            200,
            streams_body(&entries),
        ))]));
        let err = v.fetch_and_validate(&mut Series::from(s)).await.unwrap_err();
        assert!(matches!(err, ValidateError::ContentMismatch { .. }), "{err}");
    }
}
