//! Server-sent events transport.
//!
//! The backend exposes a GET stream. Its first `endpoint` event names the URL
//! requests are POSTed to; responses arrive as `message` events on the stream.

use axum::body::{Body, BodyDataStream};
use axum::http::{header, Method, Request, Uri};
use futures_util::StreamExt;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use serde_json::Value;
use url::Url;

use crate::load_balancer::backend::BackendDescriptor;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::transport::{match_response, TransportError};

/// One decoded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event name; `message` when the stream does not name it.
    pub event: String,
    /// Data lines joined with `\n`.
    pub data: String,
}

/// Incremental decoder for `text/event-stream` bodies.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every event it completed.
    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(&chunk.replace("\r\n", "\n"));

        let mut events = Vec::new();
        while let Some(end) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..end + 2).collect();
            if let Some(event) = parse_block(&block) {
                events.push(event);
            }
        }
        events
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            _ => {}
        }
    }

    if event.is_none() && data.is_empty() {
        return None;
    }
    Some(SseEvent {
        event: event.unwrap_or_else(|| "message".to_string()),
        data: data.join("\n"),
    })
}

/// An open event stream plus the endpoint that accepts requests.
pub struct SseConnection {
    client: Client<HttpConnector, Body>,
    stream: BodyDataStream,
    decoder: SseDecoder,
    pending: std::collections::VecDeque<SseEvent>,
    post_uri: Uri,
    alive: bool,
}

impl std::fmt::Debug for SseConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseConnection")
            .field("post_uri", &self.post_uri)
            .field("alive", &self.alive)
            .finish()
    }
}

impl SseConnection {
    /// Open the stream and wait for the `endpoint` event.
    pub async fn connect(descriptor: &BackendDescriptor) -> Result<Self, TransportError> {
        let base = Url::parse(&descriptor.endpoint)
            .map_err(|e| TransportError::Connect(format!("invalid endpoint: {}", e)))?;
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        let request = Request::builder()
            .method(Method::GET)
            .uri(descriptor.endpoint.as_str())
            .header(header::ACCEPT, "text/event-stream")
            .body(Body::empty())
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let response = client
            .request(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }

        let mut conn = Self {
            client,
            stream: Body::new(response.into_body()).into_data_stream(),
            decoder: SseDecoder::new(),
            pending: Default::default(),
            post_uri: Uri::default(),
            alive: true,
        };

        loop {
            let event = conn.next_event().await?;
            if event.event == "endpoint" {
                let target = base
                    .join(event.data.trim())
                    .map_err(|e| TransportError::Protocol(format!("bad endpoint event: {}", e)))?;
                conn.post_uri = target
                    .as_str()
                    .parse()
                    .map_err(|e| TransportError::Protocol(format!("bad endpoint event: {}", e)))?;
                tracing::debug!(backend = %descriptor.id, post_uri = %conn.post_uri, "SSE endpoint announced");
                return Ok(conn);
            }
        }
    }

    pub async fn send(&mut self, request: &JsonRpcRequest, id: &Value) -> Result<JsonRpcResponse, TransportError> {
        self.post(request).await?;
        loop {
            let event = self.next_event().await?;
            if event.event != "message" {
                continue;
            }
            if let Some(response) = match_response(&event.data, id) {
                return Ok(response);
            }
        }
    }

    pub async fn notify(&mut self, notification: &JsonRpcRequest) -> Result<(), TransportError> {
        self.post(notification).await
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    async fn post(&mut self, message: &JsonRpcRequest) -> Result<(), TransportError> {
        let body = serde_json::to_vec(message).map_err(|e| TransportError::Protocol(e.to_string()))?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(self.post_uri.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        let response = self.client.request(request).await.map_err(|e| {
            self.alive = false;
            TransportError::Connect(e.to_string())
        })?;
        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Result<SseEvent, TransportError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }
            match self.stream.next().await {
                Some(Ok(chunk)) => {
                    let text = String::from_utf8_lossy(&chunk);
                    self.pending.extend(self.decoder.push(&text));
                }
                Some(Err(e)) => {
                    self.alive = false;
                    return Err(TransportError::Protocol(format!("stream error: {}", e)));
                }
                None => {
                    self.alive = false;
                    return Err(TransportError::Closed);
                }
            }
        }
    }
}
