use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace, warn};
use url::Url;

use super::{Connector, SocketEvent, TerminalSocket, TransportError};
use crate::session::SessionDescriptor;

/// Builds the terminal socket URL for a session: the relay base URL with its
/// scheme upgraded (`http`→`ws`, `https`→`wss`), the `ws` path joined on and
/// the session id as the `id` query parameter.
pub fn socket_url(base: &Url, descriptor: &SessionDescriptor) -> Result<Url, TransportError> {
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TransportError::InvalidUrl(format!(
                "unsupported scheme '{other}' in {base}"
            )));
        }
    };
    let mut url = base
        .join("ws")
        .map_err(|err| TransportError::InvalidUrl(err.to_string()))?;
    url.set_scheme(scheme)
        .map_err(|()| TransportError::InvalidUrl(format!("cannot switch {base} to {scheme}")))?;
    url.set_query(None);
    url.set_fragment(None);
    url.query_pairs_mut().append_pair("id", descriptor.id());
    Ok(url)
}

/// How long a local close waits for the peer to answer the close frame.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn TerminalSocket>, TransportError> {
        debug!(target: "shellrelay::socket", url = %url, "connecting terminal socket");
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        Ok(Box::new(WebSocketSocket::spawn(ws_stream)))
    }
}

enum Outbound {
    Text(String),
    Close(String),
}

/// Socket backed by a tungstenite stream. Reading and writing run in a
/// spawned task; the session talks to it through channels.
pub struct WebSocketSocket {
    tx: mpsc::UnboundedSender<Outbound>,
    rx: mpsc::UnboundedReceiver<SocketEvent>,
    task: Option<JoinHandle<()>>,
    ended: bool,
}

impl WebSocketSocket {
    fn spawn(ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        let (tx_out, rx_out) = mpsc::unbounded_channel::<Outbound>();
        let (tx_in, rx_in) = mpsc::unbounded_channel::<SocketEvent>();
        let task = tokio::spawn(async move {
            handle_websocket(ws_stream, rx_out, tx_in).await;
        });
        Self {
            tx: tx_out,
            rx: rx_in,
            task: Some(task),
            ended: false,
        }
    }
}

#[async_trait]
impl TerminalSocket for WebSocketSocket {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        if self.ended {
            return Err(TransportError::Send("socket closed".into()));
        }
        self.tx
            .send(Outbound::Text(text))
            .map_err(|_| TransportError::Send("socket writer stopped".into()))
    }

    async fn next_event(&mut self) -> SocketEvent {
        if self.ended {
            return SocketEvent::Closed { reason: None };
        }
        match self.rx.recv().await {
            Some(event) => {
                if matches!(event, SocketEvent::Closed { .. }) {
                    self.ended = true;
                }
                event
            }
            None => {
                self.ended = true;
                SocketEvent::Closed { reason: None }
            }
        }
    }

    async fn close(&mut self, reason: &str) {
        if self.ended {
            return;
        }
        let _ = self.tx.send(Outbound::Close(reason.to_string()));
        self.ended = true;
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
                debug!(target: "shellrelay::socket", "peer did not answer close; dropping connection");
                task.abort();
            }
        }
    }
}

impl Drop for WebSocketSocket {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn handle_websocket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut rx_out: mpsc::UnboundedReceiver<Outbound>,
    tx_in: mpsc::UnboundedSender<SocketEvent>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let send_task = tokio::spawn(async move {
        while let Some(outbound) = rx_out.recv().await {
            match outbound {
                Outbound::Text(text) => {
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close(reason) => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: reason.into(),
                    };
                    let _ = ws_sender.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
    });

    let mut close_reason = None;
    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                trace!(target: "shellrelay::socket", bytes = data.len(), "binary frame");
                if tx_in.send(SocketEvent::Binary(data)).is_err() {
                    break;
                }
            }
            Ok(Message::Text(text)) => {
                if tx_in.send(SocketEvent::Text(text)).is_err() {
                    break;
                }
            }
            Ok(Message::Close(frame)) => {
                close_reason = frame
                    .map(|frame| frame.reason.to_string())
                    .filter(|reason| !reason.is_empty());
                break;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(target: "shellrelay::socket", error = %err, "socket error");
                if tx_in.send(SocketEvent::Error(err.to_string())).is_err() {
                    break;
                }
            }
        }
    }

    let _ = tx_in.send(SocketEvent::Closed {
        reason: close_reason,
    });
    send_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;
    use tokio::time::timeout;

    fn descriptor() -> SessionDescriptor {
        SessionDescriptor::new("140580981443160", None)
    }

    #[tokio::test]
    async fn close_gives_up_on_a_silent_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            // Hold the connection open without ever reading the close frame.
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(ws);
        });

        let url = Url::parse(&format!("ws://{addr}/ws?id=1")).unwrap();
        let mut socket = WebSocketConnector.connect(&url).await.unwrap();
        timeout(CLOSE_TIMEOUT * 3, socket.close("client disconnected"))
            .await
            .expect("close waited on an unresponsive peer");

        assert!(matches!(
            socket.next_event().await,
            SocketEvent::Closed { .. }
        ));
        assert!(socket.send_text("late".into()).await.is_err());
        peer.abort();
    }

    #[test]
    fn upgrades_http_to_ws() {
        let base = Url::parse("http://127.0.0.1:8888/").unwrap();
        let url = socket_url(&base, &descriptor()).unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:8888/ws?id=140580981443160");
    }

    #[test]
    fn upgrades_https_to_wss_under_a_prefix() {
        let base = Url::parse("https://relay.example.com/term/?tab=1#top").unwrap();
        let url = socket_url(&base, &descriptor()).unwrap();
        assert_eq!(
            url.as_str(),
            "wss://relay.example.com/term/ws?id=140580981443160"
        );
    }

    #[test]
    fn rejects_non_http_schemes() {
        let base = Url::parse("ftp://relay.example.com/").unwrap();
        assert!(matches!(
            socket_url(&base, &descriptor()),
            Err(TransportError::InvalidUrl(_))
        ));
    }

    #[test]
    fn escapes_session_id() {
        let base = Url::parse("http://localhost:8888/").unwrap();
        let url = socket_url(&base, &SessionDescriptor::new("a b&c", None)).unwrap();
        assert_eq!(url.query(), Some("id=a+b%26c"));
    }
}
