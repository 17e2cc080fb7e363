//! Client-side socket driver shared by the host agent and the attach CLI.

use anyhow::{Context, Result, bail};
use futures_util::{SinkExt, StreamExt};
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tracing::{debug, info, warn};
use url::Url;

use super::{ConnectionHandle, Frame, OUTBOUND_CAPACITY, ReadyState};

/// A connected client socket
///
/// Frames from the peer arrive on `inbound`; the channel yields a final
/// [`Frame::Close`] and then ends once the socket is gone.
pub struct ClientSocket {
    pub handle: ConnectionHandle,
    pub inbound: mpsc::Receiver<Frame>,
    pub driver: JoinHandle<()>,
}

/// Accepts only plain `ws://` relay URLs: no TLS stack is built in.
pub fn check_relay_url(url: &Url) -> Result<()> {
    match url.scheme() {
        "ws" => Ok(()),
        "wss" => bail!("TLS relay URLs are not supported, use ws:// instead of {url}"),
        _ => bail!("Relay URL must use ws://, got {url}"),
    }
}

/// Builds a WebSocket handshake request carrying the given extra headers.
pub fn build_request(url: &Url, headers: &[(String, String)]) -> Result<Request> {
    check_relay_url(url)?;
    let mut request = url
        .as_str()
        .into_client_request()
        .with_context(|| format!("Invalid relay URL: {url}"))?;

    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("Invalid header name: {name}"))?;
        let header_value = HeaderValue::from_str(value)
            .with_context(|| format!("Invalid value for header {name}"))?;
        request.headers_mut().insert(header_name, header_value);
    }

    Ok(request)
}

/// Performs the handshake and spawns the task that pumps frames both ways.
pub async fn connect(request: Request) -> Result<ClientSocket> {
    let (handle, mut outbound_rx) =
        ConnectionHandle::with_state(ReadyState::Connecting, OUTBOUND_CAPACITY);
    let uri = request.uri().to_string();

    let ws_stream = match connect_async(request).await {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            handle.set_state(ReadyState::Closed);
            return Err(e).with_context(|| format!("Failed to connect to {uri}"));
        }
    };

    handle.set_state(ReadyState::Open);
    info!("Connected to relay at {}", uri);

    let (mut ws_sink, mut ws_stream) = ws_stream.split();
    let (inbound_tx, inbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let state = handle.shared_state();

    let driver = tokio::spawn(async move {
        loop {
            select! {
                frame = outbound_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let message = match frame {
                        Frame::Text(text) => Message::Text(text.into()),
                        Frame::Binary(data) => Message::Binary(data.into()),
                        Frame::Close => {
                            state.begin_close();
                            Message::Close(None)
                        }
                    };
                    if let Err(e) = ws_sink.send(message).await {
                        warn!("Failed to write to relay socket: {}", e);
                        break;
                    }
                }

                incoming = ws_stream.next() => {
                    let frame = match incoming {
                        Some(Ok(Message::Text(text))) => Frame::Text(text.as_str().to_owned()),
                        Some(Ok(Message::Binary(data))) => Frame::Binary(data.to_vec()),
                        Some(Ok(Message::Close(_))) => {
                            // The close reply is flushed by the next poll.
                            state.begin_close();
                            continue;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            debug!("Relay socket ended: {}", e);
                            break;
                        }
                        None => break,
                    };
                    let _ = inbound_tx.send(frame).await;
                }
            }
        }

        state.set(ReadyState::Closed);
        let _ = inbound_tx.send(Frame::Close).await;
        info!("Disconnected from relay at {}", uri);
    });

    Ok(ClientSocket {
        handle,
        inbound: inbound_rx,
        driver,
    })
}
