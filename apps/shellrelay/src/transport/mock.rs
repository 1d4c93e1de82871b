//! In-memory socket for driving a session without a relay.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use url::Url;

use super::{Connector, SocketEvent, TerminalSocket, TransportError};

pub struct MockSocket {
    events: mpsc::UnboundedReceiver<SocketEvent>,
    sent: Arc<Mutex<Vec<String>>>,
    closed_with: Arc<Mutex<Option<String>>>,
    failing_sends: Arc<AtomicUsize>,
    ended: bool,
}

/// Test-side handle: inject inbound events and inspect what the session sent.
#[derive(Clone)]
pub struct MockSocketHandle {
    events: mpsc::UnboundedSender<SocketEvent>,
    sent: Arc<Mutex<Vec<String>>>,
    closed_with: Arc<Mutex<Option<String>>>,
    failing_sends: Arc<AtomicUsize>,
}

impl MockSocket {
    pub fn pair() -> (MockSocket, MockSocketHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed_with = Arc::new(Mutex::new(None));
        let failing_sends = Arc::new(AtomicUsize::new(0));
        (
            MockSocket {
                events: rx,
                sent: sent.clone(),
                closed_with: closed_with.clone(),
                failing_sends: failing_sends.clone(),
                ended: false,
            },
            MockSocketHandle {
                events: tx,
                sent,
                closed_with,
                failing_sends,
            },
        )
    }
}

impl MockSocketHandle {
    pub fn push(&self, event: SocketEvent) {
        let _ = self.events.send(event);
    }

    pub fn push_binary(&self, bytes: &[u8]) {
        self.push(SocketEvent::Binary(bytes.to_vec()));
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }

    pub fn closed_with(&self) -> Option<String> {
        self.closed_with.lock().ok().and_then(|slot| slot.clone())
    }

    /// Makes the next `count` sends fail without delivering anything.
    pub fn fail_sends(&self, count: usize) {
        self.failing_sends.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl TerminalSocket for MockSocket {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        if self.ended {
            return Err(TransportError::Send("socket closed".into()));
        }
        let failing = self
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(TransportError::Send("transient".into()));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(text);
        }
        Ok(())
    }

    async fn next_event(&mut self) -> SocketEvent {
        if self.ended {
            return SocketEvent::Closed { reason: None };
        }
        match self.events.recv().await {
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
        self.ended = true;
        if let Ok(mut slot) = self.closed_with.lock() {
            *slot = Some(reason.to_string());
        }
    }
}

/// Hands out a single prepared socket, or fails every connect when built
/// with `refusing`.
pub struct MockConnector {
    socket: Mutex<Option<MockSocket>>,
    connects: AtomicUsize,
    last_url: Mutex<Option<Url>>,
}

impl MockConnector {
    pub fn new(socket: MockSocket) -> Self {
        Self {
            socket: Mutex::new(Some(socket)),
            connects: AtomicUsize::new(0),
            last_url: Mutex::new(None),
        }
    }

    pub fn refusing() -> Self {
        Self {
            socket: Mutex::new(None),
            connects: AtomicUsize::new(0),
            last_url: Mutex::new(None),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn last_url(&self) -> Option<Url> {
        self.last_url.lock().ok().and_then(|url| url.clone())
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn TerminalSocket>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_url.lock() {
            *last = Some(url.clone());
        }
        let socket = self.socket.lock().ok().and_then(|mut slot| slot.take());
        match socket {
            Some(socket) => Ok(Box::new(socket)),
            None => Err(TransportError::Connect("connection refused".into())),
        }
    }
}
