//! WebSocket transport: one JSON-RPC message per text frame.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::load_balancer::backend::BackendDescriptor;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::transport::{match_response, TransportError};

#[derive(Debug)]
pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    alive: bool,
}

impl WsConnection {
    pub async fn connect(descriptor: &BackendDescriptor) -> Result<Self, TransportError> {
        let (stream, _response) = connect_async(descriptor.endpoint.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(Self { stream, alive: true })
    }

    pub async fn send(&mut self, request: &JsonRpcRequest, id: &Value) -> Result<JsonRpcResponse, TransportError> {
        self.write(request).await?;
        loop {
            let frame = match self.stream.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    self.alive = false;
                    return Err(TransportError::Protocol(e.to_string()));
                }
                None => {
                    self.alive = false;
                    return Err(TransportError::Closed);
                }
            };
            match frame {
                Message::Text(text) => {
                    if let Some(response) = match_response(text.as_str(), id) {
                        return Ok(response);
                    }
                }
                Message::Binary(bytes) => {
                    if let Some(response) = match_response(&String::from_utf8_lossy(&bytes), id) {
                        return Ok(response);
                    }
                }
                Message::Close(_) => {
                    self.alive = false;
                    return Err(TransportError::Closed);
                }
                // Ping replies are queued by tungstenite itself.
                _ => {}
            }
        }
    }

    pub async fn notify(&mut self, notification: &JsonRpcRequest) -> Result<(), TransportError> {
        self.write(notification).await
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    async fn write(&mut self, message: &JsonRpcRequest) -> Result<(), TransportError> {
        let text = serde_json::to_string(message).map_err(|e| TransportError::Protocol(e.to_string()))?;
        if let Err(e) = self.stream.send(Message::Text(text.into())).await {
            self.alive = false;
            return Err(TransportError::Protocol(e.to_string()));
        }
        Ok(())
    }
}
