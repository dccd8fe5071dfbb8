//! Local execution of relayed requests.
//!
//! [`LocalExecutor`] is the seam between the agent's polling loop and whatever
//! actually serves requests on the device. [`LoopbackExecutor`] replays each
//! envelope as a plain HTTP request against a server on `127.0.0.1`.

use std::future::Future;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use reqwest::Url;

use crate::envelope::{strip_hop_by_hop, RequestEnvelope, ResponseEnvelope};

/// Why a request could not be executed locally. Becomes a 500 envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// The envelope can't be turned into a local request.
    InvalidRequest(String),
    /// The local server couldn't be reached or broke off mid-response.
    Transport(String),
    /// The local server took longer than the configured timeout.
    Timeout(Duration),
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidRequest(msg) => write!(f, "Invalid request: {msg}"),
            Self::Transport(msg) => write!(f, "Local server unreachable: {msg}"),
            Self::Timeout(d) => write!(f, "Local server timed out after {}s", d.as_secs()),
        }
    }
}

impl std::error::Error for ExecutionError {}

/// Serves one relayed request and produces its response.
///
/// Implementations only need to fill in status, headers, body and content
/// type; the agent stamps `request_id` and `device_id` itself.
pub trait LocalExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        request: &RequestEnvelope,
    ) -> impl Future<Output = Result<ResponseEnvelope, ExecutionError>> + Send;
}

/// Forwards requests to `http://127.0.0.1:<port>`.
#[derive(Clone)]
pub struct LoopbackExecutor {
    client: Client<HttpConnector, Full<Bytes>>,
    port: u16,
    timeout: Duration,
}

impl LoopbackExecutor {
    pub fn new(port: u16, timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            client,
            port,
            timeout,
        }
    }

    fn build(&self, request: &RequestEnvelope) -> Result<hyper::Request<Full<Bytes>>, ExecutionError> {
        // Concatenate rather than join: a path like `//host/x` must stay local.
        let mut url = Url::parse(&format!("http://127.0.0.1:{}{}", self.port, request.path))
            .map_err(|e| ExecutionError::InvalidRequest(e.to_string()))?;
        if !request.params.is_empty() {
            let mut params: Vec<(&String, &String)> = request.params.iter().collect();
            params.sort();
            url.query_pairs_mut().extend_pairs(params);
        }

        let mut body = request
            .body_bytes()
            .map_err(|e| ExecutionError::InvalidRequest(e.to_string()))?;

        let mut headers = request.headers.clone();
        strip_hop_by_hop(&mut headers);
        if let Some(filename) = &request.filename {
            let boundary = format!("burrow-{}", uuid::Uuid::new_v4().simple());
            let dir = request.params.get("path").map(String::as_str);
            body = multipart_file(&boundary, dir, filename, &body);
            headers.retain(|k, _| !k.eq_ignore_ascii_case("content-type"));
            headers.insert(
                "content-type".into(),
                format!("multipart/form-data; boundary={boundary}"),
            );
        }

        let mut builder = hyper::Request::builder()
            .method(request.method.as_str())
            .uri(url.as_str());
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| ExecutionError::InvalidRequest(e.to_string()))
    }
}

/// `multipart/form-data` body with an optional `path` field and one `file` part.
fn multipart_file(boundary: &str, dir: Option<&str>, filename: &str, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 256);
    if let Some(dir) = dir {
        out.extend_from_slice(
            format!("--{boundary}\r\nContent-Disposition: form-data; name=\"path\"\r\n\r\n{dir}\r\n")
                .as_bytes(),
        );
    }
    out.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    out.extend_from_slice(data);
    out.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    out
}

impl LocalExecutor for LoopbackExecutor {
    async fn execute(&self, request: &RequestEnvelope) -> Result<ResponseEnvelope, ExecutionError> {
        let local = self.build(request)?;

        let exchange = async {
            let response = self
                .client
                .request(local)
                .await
                .map_err(|e| ExecutionError::Transport(e.to_string()))?;
            let (parts, body) = response.into_parts();
            let bytes = body
                .collect()
                .await
                .map_err(|e| ExecutionError::Transport(e.to_string()))?
                .to_bytes();
            Ok::<_, ExecutionError>((parts, bytes))
        };
        let (parts, bytes) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ExecutionError::Timeout(self.timeout))??;

        let content_type = parts
            .headers
            .get(hyper::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let mut response =
            ResponseEnvelope::new(&request.request_id, parts.status.as_u16(), &bytes, &content_type);
        response.headers = parts
            .headers
            .iter()
            .filter(|(k, _)| **k != hyper::header::CONTENT_TYPE)
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect();
        strip_hop_by_hop(&mut response.headers);
        Ok(response)
    }
}
