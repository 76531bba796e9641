use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};

use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::{
    clock::{self, Deadline},
    codec::{PushMessage, WireError},
    counters::Counters,
    fragment::AnyFragment,
    pool::SeriesPool,
    push::{PushError, Pusher},
    series::Series,
};

const LOG_PUSH_MESSAGE_EVERY_N: u64 = 200;
const TOO_FAST_LOG_INTERVAL_SECS: f64 = 10.0;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error(transparent)]
    Push(#[from] PushError),
    #[error(transparent)]
    Wire(#[from] WireError),
}

#[derive(Debug, Clone)]
pub struct WritePhaseOptions {
    pub actors: usize,
    pub fragments_per_push: usize,
    /// Per-series fragment quota.
    pub fragments_per_cycle: u64,
    /// Wall-clock budget of the phase.
    pub duration_secs: Option<f64>,
    /// Pause once every series was looked at without finding work.
    pub throttle_sleep_secs: f64,
    /// Pause while watching a single candidate near the end of the phase.
    pub idle_watch_sleep_secs: f64,
}
impl WritePhaseOptions {
    pub fn new(actors: usize, fragments_per_push: usize, fragments_per_cycle: u64) -> Self {
        Self {
            actors,
            fragments_per_push,
            fragments_per_cycle,
            duration_secs: None,
            throttle_sleep_secs: 0.5,
            idle_watch_sleep_secs: 5.0,
        }
    }
}

/// Totals of one write phase.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WriteTotals {
    pub push_messages: u64,
    pub fragments: u64,
    pub samples: u64,
    pub payload_bytes: u64,
    pub serialized_bytes: u64,
    pub duration_secs: f64,
}
impl WriteTotals {
    fn merge(&mut self, other: &Self) {
        self.push_messages += other.push_messages;
        self.fragments += other.fragments;
        self.samples += other.samples;
        self.payload_bytes += other.payload_bytes;
        self.serialized_bytes += other.serialized_bytes;
    }
}

struct Shared {
    pool: SeriesPool,
    opts: WritePhaseOptions,
    pusher: Arc<Pusher>,
    counters: Arc<Counters>,
    /// Fragments generated per series before this phase.
    generated_before: HashMap<String, u64>,
    deadline: Option<Deadline>,
    push_messages_logged: AtomicU64,
    too_fast_logged_at: Mutex<Option<Instant>>,
}
impl Shared {
    fn fragments_this_cycle(&self, series: &Series) -> u64 {
        let before = self
            .generated_before
            .get(series.unique_name())
            .copied()
            .unwrap_or(0);
        series.fragments_generated() - before
    }
    fn out_of_time(&self) -> bool {
        self.deadline.map(|d| d.passed()).unwrap_or(false)
    }
}

enum Candidate {
    Ready(AnyFragment),
    PutBack,
    OutOfTime,
}

/// Drive `opts.actors` concurrent producers over `series` until every series
/// reached its quota or the time budget ran out. Returns the series, with
/// their send bookkeeping updated.
///
/// # Panics
///
/// Re-raises panics of actor tasks.
pub async fn run_write_phase(
    series: Vec<Series>,
    opts: WritePhaseOptions,
    pusher: Arc<Pusher>,
    counters: Arc<Counters>,
) -> Result<(Vec<Series>, WriteTotals), WriteError> {
    let t0 = clock::mtime();
    let generated_before = series
        .iter()
        .map(|s| (s.unique_name().to_string(), s.fragments_generated()))
        .collect();
    let actors = opts.actors.max(1);
    let shared = Arc::new(Shared {
        pool: SeriesPool::new(series),
        deadline: opts.duration_secs.map(Deadline::in_secs),
        opts,
        pusher,
        counters,
        generated_before,
        push_messages_logged: AtomicU64::new(0),
        too_fast_logged_at: Mutex::new(None),
    });

    let mut tasks = JoinSet::new();
    for index in 0..actors {
        let shared = shared.clone();
        tasks.spawn(async move { run_actor(index, actors, &shared).await });
    }
    let mut totals = WriteTotals::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(actor_totals)) => totals.merge(&actor_totals),
            Ok(Err(e)) => return Err(e),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => panic!("write actor task failed: {e}"),
        }
    }
    totals.duration_secs = clock::secs_since(t0);

    let Ok(shared) = Arc::try_unwrap(shared) else {
        panic!("write actors still hold the series pool");
    };
    Ok((shared.pool.into_series(), totals))
}

async fn run_actor(
    index: usize,
    actors: usize,
    shared: &Shared,
) -> Result<WriteTotals, WriteError> {
    let mut totals = WriteTotals::default();
    loop {
        let batch = collect_fragments(index, actors, shared).await;
        if batch.is_empty() {
            info!("write actor {index}: no fragment acquired, all work done");
            return Ok(totals);
        }
        let (mut series, fragments): (Vec<Series>, Vec<AnyFragment>) = batch.into_iter().unzip();
        let msg = PushMessage::new(fragments)?;
        log_push_message(index, shared, &msg);

        shared.pusher.post_with_retry(&msg).await?;

        let counters = &shared.counters;
        let n_fragments = msg.fragments().len() as u64;
        counters.fragments_pushed.inc_by(n_fragments);
        counters.samples_pushed.inc_by(msg.sample_count());
        counters.payload_bytes_pushed.inc_by(msg.payload_bytes());
        counters.serialized_bytes_pushed.inc_by(msg.body_len() as u64);
        counters.last_request_body_bytes.set(msg.body_len() as i64);
        totals.merge(&WriteTotals {
            push_messages: 1,
            fragments: n_fragments,
            samples: msg.sample_count(),
            payload_bytes: msg.payload_bytes(),
            serialized_bytes: msg.body_len() as u64,
            duration_secs: 0.0,
        });

        for (s, fragment) in series.iter_mut().zip(msg.into_fragments()) {
            s.record_sent(fragment);
        }

        if shared.out_of_time() {
            debug!("write actor {index}: write time budget used up: stop");
            for s in series {
                shared.pool.retire(s);
            }
            return Ok(totals);
        }
        for s in series {
            if shared.fragments_this_cycle(&s) < shared.opts.fragments_per_cycle {
                shared.pool.requeue(s);
            } else {
                debug!("write actor {index}: quota reached for {}", s.unique_name());
                shared.pool.retire(s);
            }
        }
    }
}

/// Pop candidates until `fragments_per_push` fragments from distinct series
/// are ready or the pool runs dry.
async fn collect_fragments(
    index: usize,
    actors: usize,
    shared: &Shared,
) -> Vec<(Series, AnyFragment)> {
    let mut out = vec![];
    // candidates looked at since the last ready fragment
    let mut popped = 0;
    while out.len() < shared.opts.fragments_per_push {
        let Some(mut s) = shared.pool.pop() else {
            debug!(
                "write actor {index}: series pool is empty, collected {} fragments",
                out.len()
            );
            break;
        };
        popped += 1;
        let candidate = watch_candidate(index, actors, shared, &mut s, &mut popped).await;
        match candidate {
            Candidate::Ready(fragment) => out.push((s, fragment)),
            Candidate::PutBack => shared.pool.requeue(s),
            Candidate::OutOfTime => {
                shared.pool.retire(s);
                break;
            }
        }
    }
    out
}

async fn watch_candidate(
    index: usize,
    actors: usize,
    shared: &Shared,
    s: &mut Series,
    popped_since_last_fragment: &mut usize,
) -> Candidate {
    let mut lag_observed = false;
    loop {
        let attempt = s.generate_next_fragment_or_skip();
        if attempt.leaped {
            shared.counters.forward_leaps.inc();
        }
        if !lag_observed {
            shared.counters.lag_behind_walltime.observe(attempt.lag_secs);
            lag_observed = true;
        }
        if let Some(fragment) = attempt.fragment {
            *popped_since_last_fragment = 0;
            return Candidate::Ready(fragment);
        }

        log_too_fast(index, shared, s, attempt.lag_secs);
        shared.counters.fragment_generation_delayed.inc();

        if *popped_since_last_fragment >= shared.pool.total() {
            // nobody had work ready; don't spin
            clock::sleep_secs(shared.opts.throttle_sleep_secs).await;
        }
        if shared.out_of_time() {
            return Candidate::OutOfTime;
        }
        let queued = shared.pool.len();
        if queued + 1 > actors {
            return Candidate::PutBack;
        }
        debug!("write actor {index}: running out of work (queue length {queued}): idle-watch {s}");
        clock::sleep_secs(shared.opts.idle_watch_sleep_secs).await;
    }
}

fn log_too_fast(index: usize, shared: &Shared, s: &Series, lag_secs: f64) {
    let mut last = shared.too_fast_logged_at.lock().unwrap();
    let due = last
        .map(|t| clock::secs_since(t) > TOO_FAST_LOG_INTERVAL_SECS)
        .unwrap_or(true);
    if !due {
        return;
    }
    *last = Some(clock::mtime());
    info!(
        "write actor {index}: {s}: lag behind wall time is {:.1} minutes: generation too fast, \
         delay the next fragment by up to {:.1} minutes (not logged for every case)",
        lag_secs / 60.0,
        s.fragment_width_secs() / 60.0
    );
}

fn log_push_message(index: usize, shared: &Shared, msg: &PushMessage) {
    let n = shared.push_messages_logged.fetch_add(1, Ordering::Relaxed);
    let (Some(first), Some(last)) = (msg.fragments().first(), msg.fragments().last()) else {
        return;
    };
    let summary = format!(
        "write actor {index}: {msg} with {} fragments (first: {}/{}, last: {}/{}), \
         {:.4} MiB, serialized in {:.3} s",
        msg.fragments().len(),
        first.series_name(),
        first.index_string(3),
        last.series_name(),
        last.index_string(3),
        msg.body_len() as f64 / (1024.0 * 1024.0),
        msg.serialization_secs(),
    );
    if n % LOG_PUSH_MESSAGE_EVERY_N == 0 {
        info!("{summary} (logged every {LOG_PUSH_MESSAGE_EVERY_N}th message)");
    } else {
        debug!("{summary}");
    }
}
