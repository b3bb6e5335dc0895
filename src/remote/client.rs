use crate::playback::PlaybackHandle;
use crate::remote::protocol::{PutStateRequest, PutStateResponse};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc as tokio_mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, InvalidHeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("invalid data: {0}")]
    InvalidData(#[from] serde_json::Error),
    #[error("invalid token header: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),
}

/// Where and as whom to join the remote session
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub url: String,
    pub token: Option<String>,
}

/// A live connection to the remote playback session.
///
/// Inbound snapshots are handed to the playback service as commands; local
/// transport changes arrive on the outbound channel and are forwarded as-is.
pub struct RemoteSession {
    listener: JoinHandle<()>,
    forwarder: JoinHandle<()>,
}

impl RemoteSession {
    /// Connect, announce this device with `handshake`, and start the
    /// listener and forwarding tasks on the current runtime.
    pub async fn connect(
        config: &RemoteConfig,
        handshake: PutStateRequest,
        outbound: tokio_mpsc::UnboundedReceiver<PutStateRequest>,
        playback: PlaybackHandle,
    ) -> Result<Self, RemoteError> {
        let mut request = config.url.as_str().into_client_request()?;
        if let Some(token) = &config.token {
            request.headers_mut().insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("OAuth {}", token))?,
            );
        }

        let (ws_stream, _) = tokio_tungstenite::connect_async(request).await?;
        let (mut ws_tx, ws_rx) = ws_stream.split();

        let text = serde_json::to_string(&handshake.into_message())?;
        ws_tx.send(Message::Text(text)).await?;
        info!("Remote session connected: {}", config.url);

        let forwarder = tokio::spawn(forward_outbound(ws_tx, outbound));
        let listener = tokio::spawn(listen_inbound(ws_rx, playback));

        Ok(Self {
            listener,
            forwarder,
        })
    }

    pub fn is_connected(&self) -> bool {
        !self.listener.is_finished()
    }

    pub fn close(&self) {
        self.listener.abort();
        self.forwarder.abort();
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn forward_outbound(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: tokio_mpsc::UnboundedReceiver<PutStateRequest>,
) {
    while let Some(request) = outbound.recv().await {
        let text = match serde_json::to_string(&request.into_message()) {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode outbound state: {}", e);
                continue;
            }
        };
        trace!("sending {}", text);
        if let Err(e) = sink.send(Message::Text(text)).await {
            warn!("Remote send failed, stopping forwarder: {}", e);
            break;
        }
    }
    debug!("Outbound forwarding stopped");
}

async fn listen_inbound(mut stream: SplitStream<WsStream>, playback: PlaybackHandle) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<PutStateResponse>(&text) {
                Ok(snapshot) => playback.apply_remote_state(snapshot),
                Err(e) => {
                    trace!("{}", text);
                    error!("Error parsing remote state: {}", e);
                }
            },
            Ok(Message::Close(frame)) => {
                info!("Remote session closed by server: {:?}", frame);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("Error receiving remote message: {}", e);
                break;
            }
        }
    }
    info!("Remote listener stopped");
}
