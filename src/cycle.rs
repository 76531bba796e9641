use std::{sync::Arc, time::SystemTime};

use anyhow::Context;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, info};

use crate::{
    clock,
    config::{self, Config, ConfigError},
    counters::Counters,
    exporter::ExporterHandle,
    producer::{self, WritePhaseOptions},
    push::Pusher,
    report::{CycleReport, CycleStats, ReadStats, WriteStats},
    sample::LogTimestamp,
    series::{LogSeries, LogSeriesOptions, MetricSeries, MetricSeriesOptions, Series},
    transport::{HttpClient, HttpTransport},
    util,
    validate::{self, ReadOptions, Validator},
    walltime::WalltimeCouplingOptions,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Write,
    Read,
    Report,
    Done,
}

/// What a finished run leaves behind.
#[derive(Debug)]
pub struct RunOutcome {
    pub cycles: Vec<CycleStats>,
    /// Series of the last cycle.
    pub series: Vec<Series>,
}

/// Drives write/read cycles: init, write, read, report, then the next cycle
/// or done.
#[derive(Debug)]
pub struct CycleRunner {
    config: Config,
    argv: Vec<String>,
    invocation_id: String,
    invocation_time: SystemTime,
    counters: Arc<Counters>,
    pusher: Arc<Pusher>,
    validator: Arc<Validator>,
    coupling: WalltimeCouplingOptions,
    write_tuning: Option<(f64, f64)>,
    rng: StdRng,
}
impl CycleRunner {
    pub fn new(
        config: Config,
        argv: Vec<String>,
        transport: Arc<dyn HttpTransport>,
        counters: Arc<Counters>,
    ) -> Self {
        let client = HttpClient::new(transport, config.api_base_url.clone());
        let pusher = Pusher::new(client.clone(), config.retry_policy(), counters.clone());
        let read_opts = ReadOptions::new(
            config.fetch_n_entries_per_query as u64,
            config.inspect_every_nth_entry,
            config.max_concurrent_reads,
        );
        let validator = Validator::new(client, read_opts, counters.clone());
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let coupling = config.coupling_options();
        info!(
            "walltime coupling: fragment time leap {:.2} s, min lag {} s, max lag {} s",
            config.fragment_width_secs(),
            coupling.min_lag_secs,
            coupling.max_lag_secs
        );
        Self {
            invocation_id: counters.invocation_id().to_string(),
            invocation_time: SystemTime::now(),
            config,
            argv,
            counters,
            pusher: Arc::new(pusher),
            validator: Arc::new(validator),
            coupling,
            write_tuning: None,
            rng,
        }
    }

    pub fn with_coupling(mut self, coupling: WalltimeCouplingOptions) -> Self {
        self.coupling = coupling;
        self
    }

    pub fn with_read_options(mut self, opts: ReadOptions) -> Self {
        let client = self.pusher.client().clone();
        self.validator = Arc::new(Validator::new(client, opts, self.counters.clone()));
        self
    }

    /// Pauses of throttled write actors: all-throttled and idle-watch.
    pub fn with_write_sleeps(mut self, throttle_secs: f64, idle_watch_secs: f64) -> Self {
        self.write_tuning = Some((throttle_secs, idle_watch_secs));
        self
    }

    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    /// Run all cycles, then release the exporter.
    pub async fn run(mut self, exporter: Option<ExporterHandle>) -> anyhow::Result<RunOutcome> {
        let result = self.run_cycles().await;
        if let Some(exporter) = exporter {
            exporter.shutdown().await;
        }
        result
    }

    async fn run_cycles(&mut self) -> anyhow::Result<RunOutcome> {
        let mut phase = Phase::Init;
        let mut cycle_num: usize = 1;
        let mut series: Vec<Series> = vec![];
        let mut write_stats = None;
        let mut read_stats = ReadStats::default();
        let mut cycles = vec![];

        loop {
            let cycle_id = config::cycle_id(&self.invocation_id, cycle_num);
            debug!("cycle {cycle_num}: {phase:?}");
            phase = match phase {
                Phase::Init => {
                    info!("enter write/read cycle {cycle_num}");
                    let every = self.config.change_series_every_n_cycles;
                    if cycle_num == 1 || (cycle_num - 1) % every == 0 {
                        if cycle_num > 1 {
                            info!(
                                "cycle {cycle_num}: fresh series \
                                 as of --change-series-every-n-cycles"
                            );
                        }
                        series = self.create_series(&cycle_id)?;
                    } else {
                        info!(
                            "cycle {cycle_num}: continue to use the series of the previous cycle"
                        );
                    }
                    self.counters.rw_cycles.inc();
                    Phase::Write
                }
                Phase::Write => {
                    info!("cycle {cycle_num}: entering write phase");
                    self.mark_for_validation(&mut series);
                    let n_before = series.len();
                    let (written, stats) = self.write_phase(std::mem::take(&mut series)).await?;
                    assert_eq!(written.len(), n_before, "series lost in the write phase");
                    series = written;
                    write_stats = Some(stats);
                    Phase::Read
                }
                Phase::Read => {
                    info!("cycle {cycle_num}: entering read phase");
                    let (validated, stats) = self.read_phase(std::mem::take(&mut series)).await?;
                    series = validated;
                    read_stats = stats;
                    Phase::Report
                }
                Phase::Report => {
                    let Some(write) = write_stats.take() else {
                        unreachable!("report without write phase");
                    };
                    let stats = CycleStats {
                        cycle_num,
                        invocation_cycle_id: cycle_id.clone(),
                        write,
                        read: read_stats,
                    };
                    let report = CycleReport::new(
                        &self.argv,
                        &self.config,
                        self.invocation_time,
                        stats.clone(),
                    );
                    let path = report.write_to(&self.config.report_dir)?;
                    info!("wrote report to {}", path.display());
                    cycles.push(stats);
                    cycle_num += 1;
                    if cycle_num > self.config.n_cycles {
                        Phase::Done
                    } else {
                        Phase::Init
                    }
                }
                Phase::Done => return Ok(RunOutcome { cycles, series }),
            };
        }
    }

    /// `n_series` new series named `<cycle id>-<i>`, start times smeared
    /// across the admissible lag window.
    pub fn create_series(&mut self, cycle_id: &str) -> Result<Vec<Series>, ConfigError> {
        let cfg = &self.config;
        info!("create {} time series objects", cfg.n_series);
        let extra_labels = cfg.extra_labels();
        if !extra_labels.is_empty() {
            info!("adding additional labels: {extra_labels:?}");
        }
        let log_start = cfg.log_start()?;
        if log_start.is_some() && !cfg.metrics_mode {
            info!("wall time coupling disabled as of --log-start-time");
        }

        let leap = cfg.fragment_width_secs();
        let lo = self.coupling.min_lag_secs + 1.5 * leap;
        let hi = self.coupling.max_lag_secs - 1.5 * leap;
        let now = clock::wall_now_secs();
        let log_every = util::log_every_n(cfg.n_series);

        let mut series = Vec::with_capacity(cfg.n_series);
        for i in 1..=cfg.n_series {
            let unique_name = format!("{cycle_id}-{i}");
            let offset = if lo < hi {
                self.rng.gen_range(lo..hi)
            } else {
                (lo + hi) / 2.0
            };
            let start_secs = (now - offset).floor() as i64;
            let seed = cfg.seed.map(|s| s.wrapping_add(i as u64));

            let s: Series = if cfg.metrics_mode {
                MetricSeries::new(MetricSeriesOptions {
                    unique_name,
                    start_secs,
                    extra_labels: extra_labels.clone(),
                    sample_interval_ms: cfg.metrics_time_increment_ms,
                    samples_per_fragment: cfg.n_entries_per_series_fragment,
                    coupling: Some(self.coupling),
                    seed,
                })?
                .into()
            } else {
                LogSeries::new(LogSeriesOptions {
                    unique_name,
                    start: log_start.unwrap_or(LogTimestamp::new(start_secs, 0)),
                    extra_labels: extra_labels.clone(),
                    sample_interval_ns: cfg.log_time_increment_ns,
                    samples_per_fragment: cfg.n_entries_per_series_fragment,
                    chars_per_msg: cfg.n_chars_per_msg,
                    include_time_in_msg: true,
                    compressibility: cfg.compressibility,
                    coupling: match log_start {
                        Some(_) => None,
                        None => Some(self.coupling),
                    },
                    seed,
                })?
                .into()
            };
            if i % log_every == 0 {
                info!(
                    "initialized series: {s}, {:.0} s behind wall time \
                     ({} msgs like this are hidden)",
                    now - start_secs as f64,
                    log_every - 1
                );
            } else {
                debug!("initialized series: {s}");
            }
            series.push(s);
        }
        info!("time series initialization finished");
        Ok(series)
    }

    fn mark_for_validation(&mut self, series: &mut [Series]) {
        let t0 = clock::mtime();
        let cfg = &self.config;
        if cfg.skip_read {
            info!("mark all series to not keep track of validation info: --skip-read");
            series.iter_mut().for_each(Series::disable_validation);
        } else if cfg.read_n_series_only == 0 {
            info!("mark all series to keep track of validation info");
            series.iter_mut().for_each(Series::enable_validation);
        } else {
            series.iter_mut().for_each(Series::disable_validation);
            info!(
                "randomly marking {}/{} series for validation",
                cfg.read_n_series_only,
                series.len()
            );
            let picked = util::random_indices(&mut self.rng, series.len(), cfg.read_n_series_only);
            if picked.len() < 20 {
                let names: Vec<&str> = picked.iter().map(|&i| series[i].unique_name()).collect();
                info!("selected: {}", names.join(", "));
            }
            for i in picked {
                series[i].enable_validation();
            }
        }
        debug!(
            "marking series for validation info collection took {:.2} s",
            clock::secs_since(t0)
        );
    }

    async fn write_phase(
        &mut self,
        series: Vec<Series>,
    ) -> anyhow::Result<(Vec<Series>, WriteStats)> {
        let cfg = &self.config;
        let mut opts = WritePhaseOptions::new(
            cfg.write_concurrency(),
            cfg.n_fragments_per_push_message,
            cfg.fragments_per_cycle(),
        );
        opts.duration_secs = cfg.write_duration_secs(&mut self.rng);
        if let Some(secs) = opts.duration_secs {
            info!("stop the write phase after {secs:.2} s");
        }
        if let Some((throttle, idle_watch)) = self.write_tuning {
            opts.throttle_sleep_secs = throttle;
            opts.idle_watch_sleep_secs = idle_watch;
        }

        let (series, totals) =
            producer::run_write_phase(series, opts, self.pusher.clone(), self.counters.clone())
                .await
                .context("write phase")?;
        for s in &series {
            debug!("{s}: wrote {} fragment(s) since last validation", s.sent_since_validate());
        }
        let stats = WriteStats::from(&totals);
        info!(
            "End of write phase. Samples sent: {}, payload bytes sent: {:.2} MiB, fragments: {}",
            stats.n_entries_sent,
            stats.n_payload_bytes_sent as f64 / (1024.0 * 1024.0),
            totals.fragments
        );
        info!(
            "Payload write net throughput (mean): {:.5} MiB/s, {:.1} samples/s",
            stats.mib_payload_bytes_sent_per_sec, stats.entries_sent_per_sec
        );
        Ok((series, stats))
    }

    async fn read_phase(
        &mut self,
        series: Vec<Series>,
    ) -> anyhow::Result<(Vec<Series>, ReadStats)> {
        if self.config.skip_read {
            info!("skipping readout as of --skip-read");
            return Ok((series, ReadStats::default()));
        }
        let (mut series, totals) = validate::run_read_phase(series, self.validator.clone())
            .await
            .context("read phase")?;
        if self.config.read_n_series_only != 0 {
            debug!("drop validation info for all series");
            series.iter_mut().for_each(Series::drop_validation_info);
        }
        Ok((series, ReadStats::from(&totals)))
    }
}
