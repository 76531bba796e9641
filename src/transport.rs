use std::{future::Future, io::Read, sync::Arc, time::Duration};

use thiserror::Error;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(12);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Cap on how much of a response body is kept.
const MAX_BODY_BYTES: u64 = 64 * 1024 * 1024;

/// Any HTTP response, success or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}
impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Body cut down for log output.
    pub fn body_excerpt(&self) -> &str {
        let mut end = self.body.len().min(300);
        while !self.body.is_char_boundary(end) {
            end -= 1;
        }
        &self.body[..end]
    }
}

/// No HTTP response was received.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: String,
    pub message: String,
}
impl TransportError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Blocking HTTP client seam.
pub trait HttpTransport: Send + Sync + 'static {
    fn post(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> Result<HttpResponse, TransportError>;
    fn get(&self, url: &str, query: &[(String, String)]) -> Result<HttpResponse, TransportError>;
}

#[derive(Debug)]
pub struct UreqTransport {
    agent: ureq::Agent,
    authorization: Option<String>,
}
impl UreqTransport {
    pub fn new(bearer_token: Option<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build();
        Self {
            agent,
            authorization: bearer_token.map(|t| format!("Bearer {t}")),
        }
    }

    fn authorize(&self, req: ureq::Request) -> ureq::Request {
        match &self.authorization {
            Some(value) => req.set("Authorization", value),
            None => req,
        }
    }
}
impl HttpTransport for UreqTransport {
    /// Blocking I/O
    fn post(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> Result<HttpResponse, TransportError> {
        let mut req = self.authorize(self.agent.post(url));
        for (name, value) in headers {
            req = req.set(name, value);
        }
        into_response(req.send_bytes(body))
    }

    /// Blocking I/O
    fn get(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<HttpResponse, TransportError> {
        let mut req = self.authorize(self.agent.get(url));
        for (name, value) in query {
            req = req.query(name, value);
        }
        into_response(req.call())
    }
}

fn into_response(
    result: Result<ureq::Response, ureq::Error>,
) -> Result<HttpResponse, TransportError> {
    let resp = match result {
        Ok(resp) => resp,
        // non-2xx statuses are responses, not errors, at this layer
        Err(ureq::Error::Status(_, resp)) => resp,
        Err(ureq::Error::Transport(t)) => {
            return Err(TransportError::new(t.kind().to_string(), t.to_string()));
        }
    };
    let status = resp.status();
    let mut body = String::new();
    resp.into_reader()
        .take(MAX_BODY_BYTES)
        .read_to_string(&mut body)
        .map_err(|e| TransportError::new("body", e.to_string()))?;
    Ok(HttpResponse { status, body })
}

/// Moves blocking transport calls off the async executor.
#[derive(Clone)]
pub struct HttpClient {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
}
impl HttpClient {
    pub fn new(transport: Arc<dyn HttpTransport>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            transport,
            base_url,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub async fn post(
        &self,
        path: &str,
        headers: Vec<(&'static str, &'static str)>,
        body: Arc<[u8]>,
    ) -> Result<HttpResponse, TransportError> {
        let transport = self.transport.clone();
        let url = self.url(path);
        tokio::task::spawn_blocking(move || transport.post(&url, &headers, &body))
            .await
            .map_err(|e| TransportError::new("task", e.to_string()))?
    }

    pub async fn get(
        &self,
        path: &str,
        query: Vec<(String, String)>,
    ) -> Result<HttpResponse, TransportError> {
        let transport = self.transport.clone();
        let url = self.url(path);
        tokio::task::spawn_blocking(move || transport.get(&url, &query))
            .await
            .map_err(|e| TransportError::new("task", e.to_string()))?
    }
}
impl core::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HttpClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Drive `fut` to completion on `runtime`, then drop the runtime without
/// waiting for blocking HTTP calls still in flight.
pub fn block_on_detached<F: Future>(runtime: tokio::runtime::Runtime, fut: F) -> F::Output {
    let output = runtime.block_on(fut);
    runtime.shutdown_background();
    output
}
