use std::{process::ExitCode, sync::Arc};

use anyhow::Context;
use clap::Parser;
use ingestcheck::{
    config::{self, Config},
    counters::Counters,
    cycle::CycleRunner,
    exporter,
    transport::{self, UreqTransport},
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> ExitCode {
    let argv: Vec<String> = std::env::args().collect();
    let config = Config::parse_from(&argv);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_filter().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("starting the async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    // blocking HTTP calls may still be in flight after SIGINT
    transport::block_on_detached(runtime, async move {
        tokio::select! {
            res = run(config, argv) => match res {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("{e:#}");
                    ExitCode::FAILURE
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, exit");
                ExitCode::FAILURE
            }
        }
    })
}

async fn run(config: Config, argv: Vec<String>) -> anyhow::Result<()> {
    config.validate().context("invalid command line")?;
    let invocation_id = config::new_invocation_id(&mut rand::thread_rng());
    info!("invocation id: {invocation_id}");
    info!("rendered config: {}", serde_json::to_string(&config)?);

    let bearer_token = config.read_bearer_token()?;
    let counters = Arc::new(Counters::new(invocation_id).context("registering counters")?);
    let exporter = exporter::spawn(counters.clone(), config.http_server_port)
        .await
        .with_context(|| format!("binding the metrics port {}", config.http_server_port))?;
    let transport = Arc::new(UreqTransport::new(bearer_token));

    let outcome = CycleRunner::new(config, argv, transport, counters)
        .run(Some(exporter))
        .await?;
    info!("done after {} cycle(s)", outcome.cycles.len());
    Ok(())
}
