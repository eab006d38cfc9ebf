//! WebSocket transport using tokio-tungstenite.

use async_trait::async_trait;
use futures_channel::mpsc::unbounded;
use futures_util::{SinkExt, StreamExt};
use storyweave_shared::WsEnvelope;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::{EndpointConfig, Transport, TransportLink};
use crate::error::{EngineError, EngineResult};

/// Opens a WebSocket per link; JSON text frames carry [`WsEnvelope`]s.
#[derive(Debug, Clone, Default)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, endpoint: &EndpointConfig) -> EngineResult<TransportLink> {
        let host = endpoint.host();
        let (ws_stream, _response) = connect_async(endpoint.url.as_str())
            .await
            .map_err(|e| EngineError::Transport(format!("connect to {} failed: {}", host, e)))?;
        crate::log_info!("WebSocket connected to {}", host);

        let (mut write, mut read) = ws_stream.split();
        let (outgoing, mut outgoing_rx) = unbounded::<WsEnvelope>();
        let (incoming_tx, incoming) = unbounded::<WsEnvelope>();

        // Read task: ends the link (drops `incoming_tx`) on close or error.
        let host_for_read = host.clone();
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        crate::log_debug!("WebSocket received: {}", text.as_str());
                        match serde_json::from_str::<WsEnvelope>(text.as_str()) {
                            Ok(envelope) => {
                                if incoming_tx.unbounded_send(envelope).is_err() {
                                    // Link dropped by the manager.
                                    break;
                                }
                            }
                            Err(e) => crate::log_warn!("Dropping malformed frame: {}", e),
                        }
                    }
                    Ok(Message::Close(_)) => {
                        crate::log_info!("WebSocket to {} received close frame", host_for_read);
                        break;
                    }
                    Ok(Message::Ping(data)) => {
                        // Pong is handled automatically by tungstenite
                        crate::log_debug!("Received ping: {:?}", data);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        crate::log_error!("WebSocket read error: {}", e);
                        break;
                    }
                }
            }
            crate::log_info!("WebSocket to {} closed", host_for_read);
        });

        // Write task: runs until the manager drops its sender.
        tokio::spawn(async move {
            while let Some(envelope) = outgoing_rx.next().await {
                match serde_json::to_string(&envelope) {
                    Ok(json) => {
                        crate::log_debug!("Sending to {}: {}", host, json);
                        if let Err(e) = write.send(Message::Text(json.into())).await {
                            crate::log_error!("Send failed: {}", e);
                            break;
                        }
                    }
                    Err(e) => crate::log_error!("Serialize failed: {}", e),
                }
            }
            let _ = write.close().await;
        });

        Ok(TransportLink { outgoing, incoming })
    }
}
