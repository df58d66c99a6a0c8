//! HTTP request/response transport.
//!
//! Each request is one POST. A backend may answer with a JSON body or with a
//! short `text/event-stream` body carrying the response as an event; both are
//! accepted. A session id handed out by the backend is echoed on later calls.

use axum::body::Body;
use axum::http::{header, HeaderValue, Method, Request, Response, Uri};
use hyper::body::Incoming;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use serde_json::Value;

use crate::load_balancer::backend::BackendDescriptor;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::transport::sse::SseDecoder;
use crate::transport::{match_response, TransportError, MAX_RESPONSE_BYTES};

const SESSION_HEADER: &str = "mcp-session-id";

pub struct HttpConnection {
    client: Client<HttpConnector, Body>,
    uri: Uri,
    session: Option<HeaderValue>,
}

impl std::fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConnection")
            .field("uri", &self.uri)
            .field("session", &self.session)
            .finish()
    }
}

impl HttpConnection {
    pub fn new(descriptor: &BackendDescriptor) -> Result<Self, TransportError> {
        let uri: Uri = descriptor
            .endpoint
            .parse()
            .map_err(|e| TransportError::Connect(format!("invalid endpoint: {}", e)))?;
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Ok(Self {
            client,
            uri,
            session: None,
        })
    }

    pub async fn send(&mut self, request: &JsonRpcRequest, id: &Value) -> Result<JsonRpcResponse, TransportError> {
        let response = self.post(request).await?;
        let is_stream = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false);

        let bytes = axum::body::to_bytes(Body::new(response.into_body()), MAX_RESPONSE_BYTES)
            .await
            .map_err(|e| TransportError::Protocol(format!("reading body: {}", e)))?;
        let text = String::from_utf8_lossy(&bytes);

        if is_stream {
            let mut decoder = SseDecoder::new();
            let mut events = decoder.push(&text);
            events.extend(decoder.push("\n\n"));
            return events
                .iter()
                .find_map(|event| match_response(&event.data, id))
                .ok_or_else(|| TransportError::Protocol("no response event in stream".into()));
        }

        serde_json::from_str(&text).map_err(|e| TransportError::Protocol(format!("invalid response: {}", e)))
    }

    pub async fn notify(&mut self, notification: &JsonRpcRequest) -> Result<(), TransportError> {
        self.post(notification).await.map(|_| ())
    }

    async fn post(&mut self, message: &JsonRpcRequest) -> Result<Response<Incoming>, TransportError> {
        let body = serde_json::to_vec(message).map_err(|e| TransportError::Protocol(e.to_string()))?;
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(self.uri.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "application/json, text/event-stream");
        if let Some(session) = &self.session {
            builder = builder.header(SESSION_HEADER, session.clone());
        }
        let request = builder
            .body(Body::from(body))
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }
        if let Some(session) = response.headers().get(SESSION_HEADER) {
            self.session = Some(session.clone());
        }
        Ok(response)
    }
}
