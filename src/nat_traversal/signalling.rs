/**
 * nat_traversal/signalling.rs
 *
 * TLS WebSocket signalling relay used as a rendezvous transport
 * (self-signed certs allowed for development)
 */

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use native_tls::TlsConnector;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream as TokioTcpStream;
use tokio_native_tls::TlsStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tracing::{debug, info};

use crate::nat_traversal::rendezvous::{RendezvousError, RendezvousTransport};

/// Signalling message types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignallingMessage {
    Register {
        fingerprint: String,
    },
    RegisterAck {
        success: bool,
        message: String,
    },
    Offer {
        target_fingerprint: String,
        fingerprint: String,
        /// base64 rendezvous record
        payload: String,
    },
    ForwardOffer {
        from_fingerprint: String,
        payload: String,
    },
    OfferResponse {
        success: bool,
        message: Option<String>,
    },
    Keepalive,
    Error {
        message: String,
    },
}

fn transport_error(context: &str, e: impl std::fmt::Display) -> RendezvousError {
    RendezvousError::Transport(format!("{}: {}", context, e))
}

/// WebSocket signalling client bound to one remote peer
pub struct WebSocketTransport {
    ws_stream: WebSocketStream<TlsStream<TokioTcpStream>>,
    local_fingerprint: String,
    target_fingerprint: String,
}

impl WebSocketTransport {
    /// Connect to the signalling server (TLS) and register `local_fingerprint`
    pub async fn connect(
        url: &str,
        local_fingerprint: &str,
        target_fingerprint: &str,
        accept_invalid_certs: bool,
    ) -> Result<Self, RendezvousError> {
        let req = url
            .into_client_request()
            .map_err(|e| transport_error("invalid signalling URL", e))?;

        let mut tls_builder = TlsConnector::builder();
        tls_builder.danger_accept_invalid_certs(accept_invalid_certs);
        let tls = tls_builder
            .build()
            .map_err(|e| transport_error("TLS connector", e))?;
        let tls = tokio_native_tls::TlsConnector::from(tls);

        // Parse host + port from URL
        let host = req
            .uri()
            .host()
            .ok_or_else(|| RendezvousError::Transport("missing hostname".into()))?
            .to_string();
        let port = req.uri().port_u16().unwrap_or(443);

        // Raw TCP connect
        let tcp = TokioTcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| transport_error("TCP connection failed", e))?;

        // TLS handshake over TCP
        let tls_stream = tls
            .connect(&host, tcp)
            .await
            .map_err(|e| transport_error("TLS handshake failed", e))?;

        // WebSocket upgrade over TLS
        let (ws_stream, _resp) = tokio_tungstenite::client_async(req, tls_stream)
            .await
            .map_err(|e| transport_error("WebSocket upgrade failed", e))?;

        let mut transport = Self {
            ws_stream,
            local_fingerprint: local_fingerprint.to_string(),
            target_fingerprint: target_fingerprint.to_string(),
        };
        transport.register().await?;
        info!(url, fingerprint = local_fingerprint, "registered with signalling server");
        Ok(transport)
    }

    async fn register(&mut self) -> Result<(), RendezvousError> {
        let msg = SignallingMessage::Register {
            fingerprint: self.local_fingerprint.clone(),
        };
        self.send_message(&msg).await?;

        match self.receive_message().await? {
            SignallingMessage::RegisterAck { success: true, .. } => Ok(()),
            SignallingMessage::RegisterAck { message, .. } => {
                Err(RendezvousError::Transport(format!("registration failed: {}", message)))
            }
            other => Err(RendezvousError::Transport(format!(
                "unexpected registration response: {:?}",
                other
            ))),
        }
    }

    async fn send_message(&mut self, msg: &SignallingMessage) -> Result<(), RendezvousError> {
        let json = serde_json::to_string(msg).map_err(|e| transport_error("serialization failed", e))?;

        self.ws_stream
            .send(Message::Text(json))
            .await
            .map_err(|e| transport_error("WebSocket send failed", e))
    }

    async fn receive_message(&mut self) -> Result<SignallingMessage, RendezvousError> {
        loop {
            let msg = self
                .ws_stream
                .next()
                .await
                .ok_or_else(|| RendezvousError::Transport("connection closed".into()))?
                .map_err(|e| transport_error("WebSocket receive failed", e))?;

            match msg {
                Message::Text(text) => {
                    return serde_json::from_str(&text)
                        .map_err(|e| transport_error("undecodable signalling message", e));
                }
                Message::Ping(data) => {
                    self.ws_stream
                        .send(Message::Pong(data))
                        .await
                        .map_err(|e| transport_error("WebSocket send failed", e))?;
                }
                Message::Close(_) => {
                    return Err(RendezvousError::Transport("server closed WebSocket".into()));
                }
                _ => {}
            }
        }
    }

    pub async fn close(mut self) -> Result<(), RendezvousError> {
        self.ws_stream
            .close(None)
            .await
            .map_err(|e| transport_error("failed closing WebSocket", e))
    }
}

#[async_trait]
impl RendezvousTransport for WebSocketTransport {
    async fn send(&mut self, blob: &[u8]) -> Result<(), RendezvousError> {
        let msg = SignallingMessage::Offer {
            target_fingerprint: self.target_fingerprint.clone(),
            fingerprint: self.local_fingerprint.clone(),
            payload: BASE64.encode(blob),
        };
        self.send_message(&msg).await
    }

    async fn recv(&mut self) -> Result<Vec<u8>, RendezvousError> {
        loop {
            match self.receive_message().await? {
                SignallingMessage::ForwardOffer {
                    from_fingerprint,
                    payload,
                } if from_fingerprint == self.target_fingerprint => {
                    return BASE64
                        .decode(payload)
                        .map_err(|e| RendezvousError::Malformed(format!("not base64: {}", e)));
                }
                SignallingMessage::ForwardOffer { from_fingerprint, .. } => {
                    debug!(from = %from_fingerprint, "ignoring offer from unexpected peer");
                }
                SignallingMessage::OfferResponse { success: false, message } => {
                    // Peer not registered yet; retransmission covers it
                    debug!(?message, "offer not delivered");
                }
                SignallingMessage::Error { message } => {
                    return Err(RendezvousError::Transport(format!("signalling error: {}", message)));
                }
                _ => {}
            }
        }
    }
}
