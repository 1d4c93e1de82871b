use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use url::Url;

use super::ClientError;
use super::decoder::StreamDecoder;
use super::geometry::{Geometry, GeometryError, GeometryResolver, RenderSurface};
use super::widget::TerminalWidget;
use crate::protocol::ClientMessage;
use crate::session::{SessionDescriptor, SessionObserver};
use crate::transport::websocket::socket_url;
use crate::transport::{Connector, SocketEvent, TerminalSocket};

pub const DEFAULT_TITLE: &str = "Terminal";
pub const LOCAL_CLOSE_REASON: &str = "client disconnected";
const REMOTE_CLOSE_REASON: &str = "connection closed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Connecting,
    Open,
    Closed,
}

/// Events the local side feeds into a running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionInput {
    /// Keystrokes or pasted text, forwarded verbatim.
    Data(String),
    /// The rendering surface changed size.
    Resize,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub reason: String,
    pub local: bool,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

enum Step {
    Socket(SocketEvent),
    Input(Option<SessionInput>),
}

/// One terminal session: a socket, the decoder for its output and the widget
/// that displays it.
///
/// `Connecting → Open → Closed`; `Closed` is terminal and releases the
/// widget and decoder.
pub struct TerminalSession<W: TerminalWidget, S: RenderSurface> {
    descriptor: SessionDescriptor,
    state: SocketState,
    socket: Option<Box<dyn TerminalSocket>>,
    decoder: Option<StreamDecoder>,
    resolver: GeometryResolver,
    last_sent: Option<(u16, u16)>,
    widget: Option<W>,
    surface: S,
    observer: Arc<dyn SessionObserver>,
    title: Option<String>,
}

impl<W: TerminalWidget, S: RenderSurface> TerminalSession<W, S> {
    pub fn new(
        descriptor: SessionDescriptor,
        widget: W,
        surface: S,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        let decoder = StreamDecoder::for_label(descriptor.encoding());
        Self {
            descriptor,
            state: SocketState::Connecting,
            socket: None,
            decoder: Some(decoder),
            resolver: GeometryResolver::new(),
            last_sent: None,
            widget: Some(widget),
            surface,
            observer,
            title: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn descriptor(&self) -> &SessionDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn last_geometry(&self) -> Option<Geometry> {
        self.resolver.last()
    }

    pub async fn connect(&mut self, connector: &dyn Connector, base: &Url) -> Result<(), ClientError> {
        if self.state != SocketState::Connecting {
            return Err(ClientError::SessionClosed);
        }
        let url = socket_url(base, &self.descriptor)?;
        match connector.connect(&url).await {
            Ok(socket) => self.on_open(socket).await,
            Err(err) => {
                warn!(
                    target: "shellrelay::session",
                    session_id = %self.descriptor.id(),
                    error = %err,
                    "terminal socket failed to open"
                );
                self.on_close(err.to_string(), false);
                Err(err.into())
            }
        }
    }

    /// `Connecting → Open`: attach the widget and send the initial geometry
    /// if it differs from the widget's default.
    pub async fn on_open(&mut self, socket: Box<dyn TerminalSocket>) -> Result<(), ClientError> {
        if self.state != SocketState::Connecting {
            return Err(ClientError::SessionClosed);
        }
        self.socket = Some(socket);
        self.state = SocketState::Open;
        info!(
            target: "shellrelay::session",
            session_id = %self.descriptor.id(),
            encoding = ?self.decoder.as_ref().map(StreamDecoder::encoding_name),
            "terminal session open"
        );

        if let Some(widget) = self.widget.as_mut() {
            if let Err(err) = widget.attach() {
                warn!(target: "shellrelay::session", error = %err, "terminal widget failed to attach");
                if let Some(socket) = self.socket.as_mut() {
                    socket.close(LOCAL_CLOSE_REASON).await;
                }
                self.on_close(err.to_string(), true);
                return Err(err.into());
            }
        }
        self.observer
            .set_title(self.title.as_deref().unwrap_or(DEFAULT_TITLE));

        match self.negotiate_geometry().await {
            Ok(_) => Ok(()),
            Err(ClientError::Geometry(GeometryError::SurfaceNotReady)) => {
                debug!(target: "shellrelay::session", "surface not ready; keeping default geometry");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Re-measures the surface and sends a resize when the grid changed.
    /// Returns whether a resize message went out.
    pub async fn negotiate_geometry(&mut self) -> Result<bool, ClientError> {
        self.ensure_open()?;
        let geometry = self.resolver.measure(&self.surface)?;
        let size = geometry.size();

        let baseline = match (self.last_sent, self.widget.as_ref()) {
            (Some(sent), _) => sent,
            (None, Some(widget)) => widget.size(),
            (None, None) => return Err(ClientError::SessionClosed),
        };
        if size == baseline {
            trace!(target: "shellrelay::session", cols = size.0, rows = size.1, "geometry unchanged");
            return Ok(false);
        }

        let message = ClientMessage::resize(size.0, size.1).to_json()?;
        self.socket_mut()?.send_text(message).await?;
        self.last_sent = Some(size);
        if let Some(widget) = self.widget.as_mut() {
            widget.resize(size.0, size.1);
        }
        debug!(target: "shellrelay::session", cols = size.0, rows = size.1, "sent resize");
        Ok(true)
    }

    pub async fn send_input(&mut self, text: String) -> Result<(), ClientError> {
        self.ensure_open()?;
        let message = ClientMessage::data(text).to_json()?;
        self.socket_mut()?.send_text(message).await?;
        Ok(())
    }

    /// Decodes one binary frame and writes it out. Undecodable frames are
    /// dropped.
    pub fn handle_frame(&mut self, frame: &[u8]) -> Result<(), ClientError> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Err(ClientError::SessionClosed);
        };
        match decoder.decode(frame) {
            Ok(text) => self.write_text(&text),
            Err(err) => {
                warn!(
                    target: "shellrelay::session",
                    session_id = %self.descriptor.id(),
                    error = %err,
                    bytes = frame.len(),
                    "dropping undecodable frame"
                );
                Ok(())
            }
        }
    }

    /// Applies one socket event. Returns the close reason once the socket has
    /// closed.
    pub fn handle_event(&mut self, event: SocketEvent) -> Result<Option<CloseReason>, ClientError> {
        match event {
            SocketEvent::Binary(frame) => self.handle_frame(&frame).map(|_| None),
            SocketEvent::Text(text) => self.write_text(&text).map(|_| None),
            SocketEvent::Error(err) => {
                warn!(
                    target: "shellrelay::session",
                    session_id = %self.descriptor.id(),
                    error = %err,
                    "socket error"
                );
                Ok(None)
            }
            SocketEvent::Closed { reason } => {
                let reason = reason.unwrap_or_else(|| REMOTE_CLOSE_REASON.to_string());
                Ok(Some(self.on_close(reason, false)))
            }
        }
    }

    /// Closes the socket from this side.
    pub async fn close(&mut self) -> Result<CloseReason, ClientError> {
        if self.state == SocketState::Closed {
            return Err(ClientError::SessionClosed);
        }
        if let Some(socket) = self.socket.as_mut() {
            socket.close(LOCAL_CLOSE_REASON).await;
        }
        Ok(self.on_close(LOCAL_CLOSE_REASON.to_string(), true))
    }

    /// `* → Closed`: release everything and tell the observer why.
    pub fn on_close(&mut self, reason: String, local: bool) -> CloseReason {
        if self.state == SocketState::Closed {
            return CloseReason { reason, local };
        }
        self.state = SocketState::Closed;
        self.socket = None;

        if let Some(mut decoder) = self.decoder.take() {
            let tail = decoder.finish();
            if !tail.is_empty() {
                if let Some(widget) = self.widget.as_mut() {
                    if let Err(err) = widget.write(&tail) {
                        debug!(target: "shellrelay::session", error = %err, "decoder tail not written");
                    }
                }
            }
        }
        if let Some(mut widget) = self.widget.take() {
            widget.release();
        }

        info!(
            target: "shellrelay::session",
            session_id = %self.descriptor.id(),
            reason = %reason,
            local,
            "terminal session closed"
        );
        self.observer.set_title(DEFAULT_TITLE);
        self.observer.show_message(&reason);
        CloseReason { reason, local }
    }

    /// Pumps socket events and local input until the session closes. A
    /// dropped input channel counts as a local close.
    pub async fn run(
        &mut self,
        mut inputs: mpsc::UnboundedReceiver<SessionInput>,
    ) -> Result<CloseReason, ClientError> {
        loop {
            let step = {
                let socket = self.socket_mut()?;
                tokio::select! {
                    event = socket.next_event() => Step::Socket(event),
                    input = inputs.recv() => Step::Input(input),
                }
            };

            match step {
                Step::Socket(event) => {
                    if let Some(reason) = self.handle_event(event)? {
                        return Ok(reason);
                    }
                }
                Step::Input(Some(SessionInput::Data(text))) => {
                    if let Err(err) = self.send_input(text).await {
                        match err {
                            ClientError::Transport(err) => {
                                warn!(target: "shellrelay::session", error = %err, "input not delivered");
                            }
                            other => return Err(other),
                        }
                    }
                }
                Step::Input(Some(SessionInput::Resize)) => match self.negotiate_geometry().await {
                    Ok(_) | Err(ClientError::Geometry(_)) => {}
                    Err(ClientError::Transport(err)) => {
                        warn!(target: "shellrelay::session", error = %err, "resize not delivered");
                    }
                    Err(err) => return Err(err),
                },
                Step::Input(Some(SessionInput::Close)) | Step::Input(None) => {
                    return self.close().await;
                }
            }
        }
    }

    fn write_text(&mut self, text: &str) -> Result<(), ClientError> {
        if text.is_empty() {
            return Ok(());
        }
        let widget = self.widget.as_mut().ok_or(ClientError::SessionClosed)?;
        widget.write(text)?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        match self.state {
            SocketState::Open => Ok(()),
            SocketState::Connecting => Err(ClientError::NotOpen),
            SocketState::Closed => Err(ClientError::SessionClosed),
        }
    }

    fn socket_mut(&mut self) -> Result<&mut Box<dyn TerminalSocket>, ClientError> {
        match self.socket.as_mut() {
            Some(socket) => Ok(socket),
            None if self.state == SocketState::Connecting => Err(ClientError::NotOpen),
            None => Err(ClientError::SessionClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::widget::{BufferWidget, TerminalWidget};
    use crate::transport::mock::{MockConnector, MockSocket, MockSocketHandle};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingObserver {
        messages: Mutex<Vec<String>>,
        titles: Mutex<Vec<String>>,
        refreshes: AtomicUsize,
    }

    impl SessionObserver for RecordingObserver {
        fn show_message(&self, message: &str) {
            self.messages.lock().unwrap().push(message.to_string());
        }

        fn refresh_clients(&self) {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
        }

        fn set_title(&self, title: &str) {
            self.titles.lock().unwrap().push(title.to_string());
        }
    }

    #[derive(Clone)]
    struct SharedSurface {
        viewport: Arc<Mutex<(f32, f32)>>,
        cell: Option<(f32, f32)>,
    }

    impl SharedSurface {
        fn new(cell: Option<(f32, f32)>, viewport: (f32, f32)) -> Self {
            Self {
                viewport: Arc::new(Mutex::new(viewport)),
                cell,
            }
        }

        fn set_viewport(&self, viewport: (f32, f32)) {
            *self.viewport.lock().unwrap() = viewport;
        }
    }

    impl RenderSurface for SharedSurface {
        fn cell_size(&self) -> Option<(f32, f32)> {
            self.cell
        }

        fn viewport(&self) -> (f32, f32) {
            *self.viewport.lock().unwrap()
        }
    }

    fn base() -> Url {
        Url::parse("http://127.0.0.1:8888/").unwrap()
    }

    fn descriptor(encoding: Option<&str>) -> SessionDescriptor {
        SessionDescriptor::new("140580981443160", encoding.map(str::to_string))
    }

    async fn open_session(
        surface: SharedSurface,
        encoding: Option<&str>,
    ) -> (
        TerminalSession<BufferWidget, SharedSurface>,
        MockSocketHandle,
        BufferWidget,
        Arc<RecordingObserver>,
    ) {
        let (socket, handle) = MockSocket::pair();
        let connector = MockConnector::new(socket);
        let widget = BufferWidget::new();
        let observer = Arc::new(RecordingObserver::default());
        let mut session = TerminalSession::new(
            descriptor(encoding),
            widget.clone(),
            surface,
            observer.clone(),
        )
        .with_title("ops@port:40122");
        session.connect(&connector, &base()).await.unwrap();
        assert_eq!(
            connector.last_url().unwrap().as_str(),
            "ws://127.0.0.1:8888/ws?id=140580981443160"
        );
        (session, handle, widget, observer)
    }

    #[tokio::test]
    async fn open_sends_resize_only_when_geometry_differs_from_default() {
        let surface = SharedSurface::new(Some((10.0, 20.0)), (800.0, 480.0));
        let (session, handle, widget, observer) = open_session(surface, None).await;
        assert_eq!(session.state(), SocketState::Open);
        assert!(widget.is_attached());
        assert!(handle.sent().is_empty());
        assert_eq!(observer.titles.lock().unwrap().as_slice(), ["ops@port:40122"]);

        let surface = SharedSurface::new(Some((10.0, 20.0)), (1000.0, 500.0));
        let (session, handle, _, _) = open_session(surface, None).await;
        assert_eq!(handle.sent(), vec![r#"{"resize":[100,25]}"#.to_string()]);
        assert_eq!(session.last_geometry().map(|g| g.size()), Some((100, 25)));
    }

    #[tokio::test]
    async fn resize_is_sent_only_on_change() {
        let surface = SharedSurface::new(Some((10.0, 20.0)), (800.0, 480.0));
        let (mut session, handle, widget, _) = open_session(surface.clone(), None).await;

        assert!(!session.negotiate_geometry().await.unwrap());
        surface.set_viewport((1200.0, 600.0));
        assert!(session.negotiate_geometry().await.unwrap());
        assert!(!session.negotiate_geometry().await.unwrap());
        surface.set_viewport((1205.0, 610.0));
        assert!(!session.negotiate_geometry().await.unwrap());
        surface.set_viewport((800.0, 480.0));
        assert!(session.negotiate_geometry().await.unwrap());

        assert_eq!(
            handle.sent(),
            vec![
                r#"{"resize":[120,30]}"#.to_string(),
                r#"{"resize":[80,24]}"#.to_string(),
            ]
        );
        assert_eq!(widget.size(), (80, 24));
    }

    #[tokio::test]
    async fn unready_surface_keeps_default_geometry() {
        let surface = SharedSurface::new(None, (1000.0, 500.0));
        let (mut session, handle, _, _) = open_session(surface, None).await;
        assert!(handle.sent().is_empty());
        assert!(matches!(
            session.negotiate_geometry().await,
            Err(ClientError::Geometry(GeometryError::SurfaceNotReady))
        ));
    }

    #[tokio::test]
    async fn input_is_forwarded_verbatim() {
        let surface = SharedSurface::new(Some((10.0, 20.0)), (800.0, 480.0));
        let (mut session, handle, _, _) = open_session(surface, None).await;
        session.send_input("ls -la\r".into()).await.unwrap();
        session.send_input("\u{1b}[A".into()).await.unwrap();
        assert_eq!(
            handle.sent(),
            vec![
                r#"{"data":"ls -la\r"}"#.to_string(),
                r#"{"data":"\u001b[A"}"#.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn undecodable_frame_is_dropped_and_stream_continues() {
        let surface = SharedSurface::new(Some((10.0, 20.0)), (800.0, 480.0));
        let (mut session, _, widget, _) = open_session(surface, Some("utf-8")).await;

        session.handle_frame(b"one ").unwrap();
        session.handle_frame(&[0xff, 0xfe, 0xfd]).unwrap();
        session.handle_frame(&[0xe2, 0x82]).unwrap();
        session.handle_frame(&[0xac, b' ', b't', b'w', b'o']).unwrap();

        assert_eq!(widget.contents(), "one € two");
    }

    #[tokio::test]
    async fn socket_errors_do_not_close_the_session() {
        let surface = SharedSurface::new(Some((10.0, 20.0)), (800.0, 480.0));
        let (mut session, _, widget, _) = open_session(surface, None).await;

        let outcome = session
            .handle_event(SocketEvent::Error("connection reset".into()))
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(session.state(), SocketState::Open);

        session
            .handle_event(SocketEvent::Binary(b"still here".to_vec()))
            .unwrap();
        assert_eq!(widget.contents(), "still here");
    }

    #[tokio::test]
    async fn run_streams_until_remote_close() {
        let surface = SharedSurface::new(Some((10.0, 20.0)), (800.0, 480.0));
        let (mut session, handle, widget, observer) = open_session(surface, None).await;
        let (tx, rx) = mpsc::unbounded_channel();

        tx.send(SessionInput::Data("whoami\r".into())).unwrap();
        handle.push_binary(b"root\r\n");
        handle.push(SocketEvent::Closed {
            reason: Some("shell exited".into()),
        });

        let reason = session.run(rx).await.unwrap();
        assert_eq!(
            reason,
            CloseReason {
                reason: "shell exited".into(),
                local: false
            }
        );
        assert_eq!(session.state(), SocketState::Closed);
        assert_eq!(widget.contents(), "root\r\n");
        assert!(widget.is_released());
        assert_eq!(
            observer.messages.lock().unwrap().as_slice(),
            ["shell exited"]
        );
        assert_eq!(
            observer.titles.lock().unwrap().last().map(String::as_str),
            Some(DEFAULT_TITLE)
        );
        assert!(matches!(
            session.send_input("late".into()).await,
            Err(ClientError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn local_close_sends_reason_and_blocks_further_sends() {
        let surface = SharedSurface::new(Some((10.0, 20.0)), (800.0, 480.0));
        let (mut session, handle, _, _) = open_session(surface, None).await;
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(SessionInput::Close).unwrap();

        let reason = session.run(rx).await.unwrap();
        assert!(reason.local);
        assert_eq!(reason.reason, LOCAL_CLOSE_REASON);
        assert_eq!(handle.closed_with().as_deref(), Some(LOCAL_CLOSE_REASON));
        assert!(matches!(
            session.negotiate_geometry().await,
            Err(ClientError::SessionClosed)
        ));
        assert!(matches!(session.close().await, Err(ClientError::SessionClosed)));
    }

    #[tokio::test]
    async fn refused_socket_closes_without_opening() {
        let connector = MockConnector::refusing();
        let widget = BufferWidget::new();
        let observer = Arc::new(RecordingObserver::default());
        let mut session = TerminalSession::new(
            descriptor(None),
            widget.clone(),
            SharedSurface::new(Some((10.0, 20.0)), (800.0, 480.0)),
            observer.clone(),
        );

        assert!(matches!(
            session.send_input("early".into()).await,
            Err(ClientError::NotOpen)
        ));
        assert!(matches!(
            session.connect(&connector, &base()).await,
            Err(ClientError::Transport(_))
        ));
        assert_eq!(connector.connects(), 1);
        assert_eq!(session.state(), SocketState::Closed);
        assert!(!widget.is_attached());
        assert_eq!(observer.messages.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_resize_send_is_retried_on_next_measure() {
        let (socket, handle) = MockSocket::pair();
        handle.fail_sends(1);
        let connector = MockConnector::new(socket);
        let widget = BufferWidget::new();
        let mut session = TerminalSession::new(
            descriptor(None),
            widget.clone(),
            SharedSurface::new(Some((10.0, 20.0)), (1000.0, 500.0)),
            Arc::new(RecordingObserver::default()),
        );

        assert!(matches!(
            session.connect(&connector, &base()).await,
            Err(ClientError::Transport(_))
        ));
        assert!(handle.sent().is_empty());
        assert_eq!(widget.size(), (80, 24));

        assert!(session.negotiate_geometry().await.unwrap());
        assert_eq!(handle.sent(), vec![r#"{"resize":[100,25]}"#.to_string()]);
        assert_eq!(widget.size(), (100, 25));
    }

    struct DetachedWidget;

    impl TerminalWidget for DetachedWidget {
        fn attach(&mut self) -> std::io::Result<()> {
            Err(std::io::Error::other("no terminal"))
        }

        fn size(&self) -> (u16, u16) {
            (80, 24)
        }

        fn resize(&mut self, _cols: u16, _rows: u16) {}

        fn write(&mut self, _text: &str) -> std::io::Result<()> {
            Ok(())
        }

        fn release(&mut self) {}
    }

    #[tokio::test]
    async fn attach_failure_closes_the_socket() {
        let (socket, handle) = MockSocket::pair();
        let connector = MockConnector::new(socket);
        let observer = Arc::new(RecordingObserver::default());
        let mut session = TerminalSession::new(
            descriptor(None),
            DetachedWidget,
            SharedSurface::new(Some((10.0, 20.0)), (800.0, 480.0)),
            observer.clone(),
        );

        assert!(matches!(
            session.connect(&connector, &base()).await,
            Err(ClientError::Widget(_))
        ));
        assert_eq!(session.state(), SocketState::Closed);
        assert_eq!(handle.closed_with().as_deref(), Some(LOCAL_CLOSE_REASON));
        assert_eq!(observer.messages.lock().unwrap().as_slice(), ["no terminal"]);
        assert!(matches!(
            session.send_input("ls".into()).await,
            Err(ClientError::SessionClosed)
        ));
    }
}
