//! HTTP server for the query pipeline.
//! Minimal HTTP/1.1 handling on tokio: `GET /` health and `POST /run`.

use anyhow::Context;
use querygate::config::PipelineConfig;
use querygate::observability::logger::init_tracing;
use querygate::QueryService;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

/// Largest accepted header block.
const MAX_HEADER_BYTES: usize = 16 * 1024;
/// Largest accepted request body.
const MAX_BODY_BYTES: usize = 1024 * 1024;

struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: String,
}

impl HttpRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();
    init_tracing();

    let config = PipelineConfig::from_env();
    if config.internal_token.is_none() {
        warn!("INTERNAL_TOKEN is not set; every /run call will be refused");
    }

    let service = Arc::new(
        QueryService::from_config(&config)
            .await
            .context("failed to initialise the query pipeline")?,
    );

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "server listening");

    loop {
        let (stream, addr) = listener.accept().await?;
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, service).await {
                warn!(%addr, error = %e, "connection failed");
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, service: Arc<QueryService>) -> anyhow::Result<()> {
    let response = match read_request(&mut stream).await {
        Ok(Some(request)) => route(&request, &service).await,
        Ok(None) => return Ok(()),
        Err(e) => {
            warn!(error = %e, "malformed HTTP request");
            create_response(400, r#"{"detail":"Malformed HTTP request."}"#)
        }
    };
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

async fn route(request: &HttpRequest, service: &QueryService) -> String {
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/") => create_response(200, r#"{"status":"ok"}"#),
        ("OPTIONS", _) => create_response(204, ""),
        ("POST", "/run") => {
            let (status, body) = service
                .handle_run(
                    request.header("x-internal-token"),
                    request.header("x-correlation-id"),
                    &request.body,
                )
                .await;
            match serde_json::to_string(&body) {
                Ok(body) => create_response(status, &body),
                Err(e) => {
                    error!(error = %e, "failed to encode response");
                    create_response(500, r#"{"detail":"Internal error."}"#)
                }
            }
        }
        _ => create_response(404, r#"{"detail":"Not Found"}"#),
    }
}

/// Reads one request. `Ok(None)` means the peer closed before sending.
async fn read_request(stream: &mut TcpStream) -> anyhow::Result<Option<HttpRequest>> {
    let mut buffer: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        if let Some(pos) = find_subsequence(&buffer, b"\r\n\r\n") {
            break pos;
        }
        anyhow::ensure!(buffer.len() <= MAX_HEADER_BYTES, "header block too large");
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            anyhow::bail!("connection closed mid-headers");
        }
        buffer.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().context("missing method")?.to_string();
    let target = parts.next().context("missing path")?;
    let path = target.split('?').next().unwrap_or("/");
    let path = if path.len() > 1 { path.trim_end_matches('/') } else { path }.to_string();

    let headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    let content_length: usize = match headers.get("content-length") {
        Some(raw) => raw.parse().context("invalid Content-Length")?,
        None => 0,
    };
    anyhow::ensure!(content_length <= MAX_BODY_BYTES, "request body too large");

    let mut body = buffer[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        anyhow::ensure!(n > 0, "connection closed mid-body");
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(Some(HttpRequest {
        method,
        path,
        headers,
        body: String::from_utf8(body).context("body is not UTF-8")?,
    }))
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        404 => "Not Found",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

fn create_response(status: u16, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type, X-Internal-Token, X-Correlation-Id\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status,
        status_text(status),
        body.len(),
        body
    )
}
