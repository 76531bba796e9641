use std::{net::SocketAddr, sync::Arc, time::Duration};

use poem::{
    error::InternalServerError,
    get, handler,
    listener::{Acceptor, Listener, TcpListener},
    middleware::AddData,
    web::Data,
    Endpoint, EndpointExt, Response, Route, Server,
};
use prometheus::{Encoder, TextEncoder};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::counters::Counters;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[handler]
async fn metrics(counters: Data<&Arc<Counters>>) -> poem::Result<Response> {
    counters.refresh_uptime();
    let encoder = TextEncoder::new();
    let metric_families = counters.registry().gather();
    let mut buffer = String::new();
    encoder
        .encode_utf8(&metric_families, &mut buffer)
        .map_err(InternalServerError)?;
    Ok(Response::builder()
        .content_type(encoder.format_type())
        .body(buffer))
}

pub fn routes(counters: Arc<Counters>) -> impl Endpoint {
    Route::new()
        .at("/metrics", get(metrics))
        .with(AddData::new(counters))
}

/// Running `/metrics` server.
#[derive(Debug)]
pub struct ExporterHandle {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<std::io::Result<()>>,
}
impl ExporterHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and wait for the server task.
    pub async fn shutdown(mut self) {
        debug!("shutting down http server");
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("metrics exporter: {e}"),
            Err(e) => warn!("metrics exporter task: {e}"),
        }
    }
}

/// Serve the counters on `0.0.0.0:<port>/metrics`. Port 0 picks a free port.
///
/// Fails if the port cannot be bound.
pub async fn spawn(counters: Arc<Counters>, port: u16) -> std::io::Result<ExporterHandle> {
    let requested = SocketAddr::from(([0, 0, 0, 0], port));
    let acceptor = TcpListener::bind(requested).into_acceptor().await?;
    let addr = acceptor
        .local_addr()
        .first()
        .and_then(|a| a.as_socket_addr().copied())
        .unwrap_or(requested);
    let (tx, rx) = oneshot::channel::<()>();
    let app = routes(counters);
    let task = tokio::spawn(async move {
        Server::new_with_acceptor(acceptor)
            .run_with_graceful_shutdown(
                app,
                async move {
                    let _ = rx.await;
                },
                Some(SHUTDOWN_TIMEOUT),
            )
            .await
    });
    info!("serving Prometheus metrics on http://{addr}/metrics");
    Ok(ExporterHandle {
        addr,
        shutdown: Some(tx),
        task,
    })
}
