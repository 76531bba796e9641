use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    clock::{self, Deadline},
    codec::PushMessage,
    counters::Counters,
    transport::HttpClient,
};

pub const OUT_OF_ORDER_SIGNATURE: &str = "out of order sample";
const LOG_RESPONSE_EVERY_N: u64 = 400;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryPolicy {
    /// Overall budget of one logical send.
    pub deadline_secs: f64,
    /// Unjittered delay before the first retry.
    pub min_delay_secs: f64,
    pub max_delay_secs: f64,
    /// Relative jitter; 0.5 is +/- 50 %.
    pub jitter: f64,
    pub backoff_base: f64,
    /// Pause after a 429; does not advance the backoff.
    pub rate_limit_sleep_secs: f64,
    /// 5xx body substrings after which the write may have landed anyway.
    pub ambiguous_signatures: Vec<String>,
    /// 400 body substring that confirms an earlier ambiguous write.
    pub out_of_order_signature: String,
}
impl RetryPolicy {
    pub fn default_ambiguous_signatures() -> Vec<String> {
        vec![
            "DeadlineExceeded".to_string(),
            "code = Unavailable desc = transport is closing".to_string(),
        ]
    }

    /// Delay before attempt `attempt` (1-based) without jitter or cap.
    /// Attempt 2 waits exactly `min_delay_secs`.
    pub fn unjittered_delay_secs(&self, attempt: u32) -> f64 {
        if attempt <= 1 {
            return 0.0;
        }
        let exp = self.backoff_base.powi(attempt as i32) / self.backoff_base.powi(2);
        exp * self.min_delay_secs
    }

    pub fn delay_before_attempt<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> f64 {
        let unjittered = self.unjittered_delay_secs(attempt);
        if unjittered == 0.0 {
            return 0.0;
        }
        let spread = self.jitter * unjittered;
        let jitter = if spread > 0.0 {
            rng.gen_range(-spread..=spread)
        } else {
            0.0
        };
        (unjittered + jitter).clamp(0.0, self.max_delay_secs)
    }

    fn ambiguous_signature_in<'a>(&'a self, body: &str) -> Option<&'a str> {
        self.ambiguous_signatures
            .iter()
            .find(|sig| body.contains(sig.as_str()))
            .map(String::as_str)
    }
}
impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            deadline_secs: 360.0,
            min_delay_secs: 3.0,
            max_delay_secs: 30.0,
            jitter: 0.5,
            backoff_base: 1.6,
            rate_limit_sleep_secs: 2.0,
            ambiguous_signatures: Self::default_ambiguous_signatures(),
            out_of_order_signature: OUT_OF_ORDER_SIGNATURE.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error(
        "POST {message}: attempt {attempt} would end {over_by_secs:.2} s \
         past the deadline ({deadline_secs} s)"
    )]
    DeadlineExceeded {
        message: String,
        attempt: u32,
        over_by_secs: f64,
        deadline_secs: f64,
    },
    #[error("POST {message}: bad request: HTTP {status}: {body}")]
    BadRequest {
        message: String,
        status: u16,
        body: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PostOutcome {
    pub attempts: u32,
    /// Success was inferred from an out-of-order rejection after an
    /// ambiguous 5xx.
    pub ambiguous: bool,
    pub duration_secs: f64,
}

/// POSTs push messages with retries.
#[derive(Debug)]
pub struct Pusher {
    client: HttpClient,
    policy: RetryPolicy,
    counters: Arc<Counters>,
    responses_seen: AtomicU64,
}
impl Pusher {
    pub fn new(client: HttpClient, policy: RetryPolicy, counters: Arc<Counters>) -> Self {
        Self {
            client,
            policy,
            counters,
            responses_seen: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
    pub fn client(&self) -> &HttpClient {
        &self.client
    }

    pub async fn post_with_retry(&self, msg: &PushMessage) -> Result<PostOutcome, PushError> {
        let deadline = Deadline::in_secs(self.policy.deadline_secs);
        let t0 = clock::mtime();
        let mut attempt: u32 = 0;
        let mut backoff_attempt: u32 = 0;
        let mut rate_limited = false;
        let mut previous_success_ambiguous = false;

        loop {
            attempt += 1;
            let delay = if rate_limited {
                self.policy.rate_limit_sleep_secs
            } else {
                backoff_attempt += 1;
                self.policy
                    .delay_before_attempt(backoff_attempt, &mut rand::thread_rng())
            };
            rate_limited = false;

            if deadline.would_pass_after(delay) {
                return Err(PushError::DeadlineExceeded {
                    message: msg.to_string(),
                    attempt,
                    over_by_secs: delay - deadline.remaining_secs(),
                    deadline_secs: self.policy.deadline_secs,
                });
            }
            if attempt > 1 {
                info!("POST {msg}: perform attempt {attempt} in {delay:.2} s");
                clock::sleep_secs(delay).await;
            }

            let resp = match self
                .client
                .post(msg.path(), msg.headers(), msg.body())
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    self.counters.post_non_http_errors.inc();
                    warn!("POST {msg}: attempt {attempt}: transient problem: {e}");
                    continue;
                }
            };
            self.counters.record_post_response(resp.status);

            match resp.status {
                200 | 204 => {
                    self.log_success(msg, resp.status, attempt);
                    return Ok(self.outcome(t0, attempt, false));
                }
                429 => {
                    info!(
                        "POST {msg}: 429 response, sleep {} s, body: {}",
                        self.policy.rate_limit_sleep_secs,
                        resp.body_excerpt()
                    );
                    rate_limited = true;
                    continue;
                }
                400..=499 => {
                    if resp.status == 400
                        && previous_success_ambiguous
                        && resp.body.contains(&self.policy.out_of_order_signature)
                    {
                        warn!(
                            "POST {msg}: saw '{}' after an ambiguous response: treat as success",
                            self.policy.out_of_order_signature
                        );
                        self.counters.ambiguous_push_successes.inc();
                        return Ok(self.outcome(t0, attempt, true));
                    }
                    return Err(PushError::BadRequest {
                        message: msg.to_string(),
                        status: resp.status,
                        body: resp.body_excerpt().to_string(),
                    });
                }
                500..=599 => {
                    warn!(
                        "POST {msg}: attempt {attempt}: HTTP {}: {}",
                        resp.status,
                        resp.body_excerpt()
                    );
                    if let Some(sig) = self.policy.ambiguous_signature_in(&resp.body) {
                        previous_success_ambiguous = true;
                        warn!(
                            "POST {msg}: write may have landed ({sig}); \
                             a following out-of-order rejection is not fatal"
                        );
                    }
                }
                status => {
                    warn!("POST {msg}: attempt {attempt}: unexpected HTTP {status}");
                }
            }
            info!("POST {msg}: treat as transient problem, retry");
        }
    }

    fn outcome(&self, t0: std::time::Instant, attempts: u32, ambiguous: bool) -> PostOutcome {
        let duration_secs = clock::secs_since(t0);
        self.counters.post_with_retry_duration.observe(duration_secs);
        PostOutcome {
            attempts,
            ambiguous,
            duration_secs,
        }
    }

    fn log_success(&self, msg: &PushMessage, status: u16, attempt: u32) {
        let n = self.responses_seen.fetch_add(1, Ordering::Relaxed);
        if n % LOG_RESPONSE_EVERY_N == 0 {
            info!(
                "POST {msg}: HTTP {status} after {attempt} attempt(s) \
                 (logged every {LOG_RESPONSE_EVERY_N}th response)"
            );
        } else {
            debug!("POST {msg}: HTTP {status} after {attempt} attempt(s)");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::{
        series::{MetricSeries, MetricSeriesOptions, TimeSeries},
        transport::{HttpResponse, HttpTransport, TransportError},
        LabelSet,
    };

    /// Answers POSTs from a script, in order.
    struct Scripted {
        responses: Mutex<Vec<HttpResponse>>,
        posts: AtomicU64,
    }
    impl Scripted {
        fn new(script: &[(u16, &str)]) -> Arc<Self> {
            let mut responses: Vec<HttpResponse> = script
                .iter()
                .map(|(status, body)| HttpResponse::new(*status, *body))
                .collect();
            responses.reverse();
            Arc::new(Self {
                responses: Mutex::new(responses),
                posts: AtomicU64::new(0),
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
            self.posts.fetch_add(1, Ordering::SeqCst);
            Ok(self.responses.lock().unwrap().pop().expect("script exhausted"))
        }
        fn get(&self, _: &str, _: &[(String, String)]) -> Result<HttpResponse, TransportError> {
            unreachable!()
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            deadline_secs: 100.0,
            min_delay_secs: 0.01,
            jitter: 0.0,
            rate_limit_sleep_secs: 0.01,
            ..RetryPolicy::default()
        }
    }

    fn pusher(transport: Arc<Scripted>, policy: RetryPolicy) -> (Pusher, Arc<Counters>) {
        let counters = Arc::new(Counters::new("t").unwrap());
        let client = HttpClient::new(transport, "http://distributor");
        (Pusher::new(client, policy, counters.clone()), counters)
    }

    fn message() -> PushMessage {
        let mut s = MetricSeries::new(MetricSeriesOptions {
            unique_name: "m-1".into(),
            start_secs: 1_000,
            extra_labels: LabelSet::new(),
            sample_interval_ms: 1000,
            samples_per_fragment: 2,
            coupling: None,
            seed: Some(5),
        })
        .unwrap();
        PushMessage::new(vec![s.generate_next_fragment().into()]).unwrap()
    }

    #[test]
    fn first_attempt_has_no_delay() {
        let policy = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(policy.delay_before_attempt(1, &mut rng), 0.0);
        assert_eq!(policy.unjittered_delay_secs(2), 3.0);
    }

    #[test]
    fn backoff_grows_until_capped() {
        let policy = RetryPolicy::default();
        let delays: Vec<f64> = (2..12).map(|a| policy.unjittered_delay_secs(a)).collect();
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
        let mut rng = StdRng::seed_from_u64(11);
        for attempt in 2..30 {
            for _ in 0..50 {
                let d = policy.delay_before_attempt(attempt, &mut rng);
                assert!((0.0..=policy.max_delay_secs).contains(&d), "{d}");
                let unjittered = policy.unjittered_delay_secs(attempt);
                assert!(d >= (unjittered * 0.5).min(policy.max_delay_secs));
            }
        }
        assert_eq!(policy.delay_before_attempt(29, &mut rng), policy.max_delay_secs);
    }

    #[test]
    fn ambiguous_signatures_are_configurable() {
        let mut policy = RetryPolicy::default();
        assert_eq!(
            policy.ambiguous_signature_in("rpc error: DeadlineExceeded"),
            Some("DeadlineExceeded")
        );
        assert_eq!(policy.ambiguous_signature_in("boom"), None);
        policy.ambiguous_signatures = vec!["boom".into()];
        assert_eq!(policy.ambiguous_signature_in("boom"), Some("boom"));
    }

    #[tokio::test]
    async fn client_errors_other_than_400_are_fatal() {
        let transport = Scripted::new(&[(403, "forbidden"), (204, "")]);
        let (p, counters) = pusher(transport.clone(), fast_policy());
        let err = p.post_with_retry(&message()).await.unwrap_err();
        assert!(
            matches!(err, PushError::BadRequest { status: 403, .. }),
            "{err}"
        );
        assert_eq!(transport.posts.load(Ordering::SeqCst), 1);
        assert_eq!(counters.post_responses(403), 1);
    }

    #[tokio::test]
    async fn rate_limiting_does_not_advance_backoff() {
        // backoff would grow 0.2 s -> 2 s -> 20 s if 429s counted
        let policy = RetryPolicy {
            min_delay_secs: 0.2,
            backoff_base: 10.0,
            ..fast_policy()
        };
        let transport = Scripted::new(&[
            (500, "oops"),
            (429, "slow down"),
            (429, "slow down"),
            (429, "slow down"),
            (204, ""),
        ]);
        let (p, counters) = pusher(transport, policy);
        let t0 = clock::mtime();
        let outcome = p.post_with_retry(&message()).await.unwrap();
        assert_eq!(outcome.attempts, 5);
        assert!(!outcome.ambiguous);
        assert!(clock::secs_since(t0) < 1.0);
        assert_eq!(counters.post_responses(429), 3);
    }

    #[tokio::test]
    async fn out_of_order_after_closed_transport_is_success() {
        let transport = Scripted::new(&[
            (503, "rpc error: code = Unavailable desc = transport is closing"),
            (400, "entry out of order sample for series"),
        ]);
        let (p, counters) = pusher(transport, fast_policy());
        let outcome = p.post_with_retry(&message()).await.unwrap();
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.ambiguous);
        assert_eq!(counters.ambiguous_push_successes.get(), 1);
        assert_eq!(counters.post_with_retry_duration.get_sample_count(), 1);
    }

    #[tokio::test]
    async fn out_of_order_after_plain_5xx_is_fatal() {
        let transport = Scripted::new(&[(503, "busy"), (400, "out of order sample")]);
        let (p, _) = pusher(transport, fast_policy());
        let err = p.post_with_retry(&message()).await.unwrap_err();
        assert!(
            matches!(err, PushError::BadRequest { status: 400, .. }),
            "{err}"
        );
    }
}
