use crossterm::execute;
use crossterm::terminal::SetTitle;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::client::SessionInput;
use crate::protocol::ClientEntry;
use crate::session::SessionObserver;
use crate::transfer::ProgressEvent;

/// Ctrl-] detaches from the remote shell, as in telnet.
pub const DETACH_BYTE: u8 = 0x1d;

/// Session observer for the local terminal. Messages go to stderr with CRLF
/// line ends so they render correctly in raw mode.
#[derive(Debug, Default)]
pub struct ConsoleObserver {
    refresh_requested: AtomicBool,
}

impl ConsoleObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a client-list refresh was requested since the last call.
    pub fn take_refresh(&self) -> bool {
        self.refresh_requested.swap(false, Ordering::SeqCst)
    }
}

impl SessionObserver for ConsoleObserver {
    fn show_message(&self, message: &str) {
        let mut stderr = io::stderr().lock();
        let _ = write!(stderr, "\r\n[shellrelay] {message}\r\n");
        let _ = stderr.flush();
    }

    fn refresh_clients(&self) {
        self.refresh_requested.store(true, Ordering::SeqCst);
    }

    fn set_title(&self, title: &str) {
        let _ = execute!(io::stdout(), SetTitle(title));
    }
}

/// Reads raw stdin on its own thread and forwards it as session input. The
/// thread is never joined; it ends with the process.
pub fn spawn_stdin_pump(tx: mpsc::UnboundedSender<SessionInput>) {
    let spawned = std::thread::Builder::new()
        .name("shellrelay-stdin".into())
        .spawn(move || {
            let mut stdin = io::stdin();
            let mut buf = [0u8; 4096];
            let mut pending = Vec::new();
            loop {
                let n = match stdin.read(&mut buf) {
                    Ok(0) => {
                        let _ = tx.send(SessionInput::Close);
                        break;
                    }
                    Ok(n) => n,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        warn!(target: "shellrelay::console", error = %err, "stdin read failed");
                        let _ = tx.send(SessionInput::Close);
                        break;
                    }
                };

                let input = &buf[..n];
                let (input, detach) = match input.iter().position(|&b| b == DETACH_BYTE) {
                    Some(at) => (&input[..at], true),
                    None => (input, false),
                };
                pending.extend_from_slice(input);
                let text = drain_utf8(&mut pending);
                if !text.is_empty() && tx.send(SessionInput::Data(text)).is_err() {
                    break;
                }
                if detach {
                    debug!(target: "shellrelay::console", "detach key pressed");
                    let _ = tx.send(SessionInput::Close);
                    break;
                }
            }
        });
    if let Err(err) = spawned {
        warn!(target: "shellrelay::console", error = %err, "could not start stdin reader");
    }
}

/// Takes the longest decodable prefix out of `pending`, leaving a trailing
/// partial character for the next read. Invalid bytes become U+FFFD.
pub fn drain_utf8(pending: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(&pending[..]) {
            Ok(text) => {
                out.push_str(text);
                pending.clear();
                return out;
            }
            Err(err) => {
                let valid = err.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&pending[..valid]));
                match err.error_len() {
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        pending.drain(..valid + bad);
                    }
                    None => {
                        pending.drain(..valid);
                        return out;
                    }
                }
            }
        }
    }
}

/// Forwards terminal resize signals into the session.
#[cfg(unix)]
pub fn spawn_resize_watcher(tx: mpsc::UnboundedSender<SessionInput>) -> Option<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut winch = match signal(SignalKind::window_change()) {
        Ok(stream) => stream,
        Err(err) => {
            warn!(target: "shellrelay::console", error = %err, "resize notifications unavailable");
            return None;
        }
    };
    Some(tokio::spawn(async move {
        while winch.recv().await.is_some() {
            if tx.send(SessionInput::Resize).is_err() {
                break;
            }
        }
    }))
}

#[cfg(not(unix))]
pub fn spawn_resize_watcher(_tx: mpsc::UnboundedSender<SessionInput>) -> Option<JoinHandle<()>> {
    None
}

/// One-line progress display for uploads.
pub fn print_progress(event: ProgressEvent) {
    let mut stderr = io::stderr().lock();
    let _ = match event {
        ProgressEvent::Started {
            file_name,
            total_bytes,
            chunks,
        } => writeln!(
            stderr,
            "Uploading {file_name} ({total_bytes} bytes, {chunks} chunks)"
        ),
        ProgressEvent::Chunk { percent, .. } => write!(stderr, "\rUploading File - {percent}%"),
        ProgressEvent::Retrying {
            range,
            attempt,
            status,
        } => write!(
            stderr,
            "\rServer busy ({status}), resending {range} (attempt {})",
            attempt + 1
        ),
        ProgressEvent::Completed { bytes, elapsed } => writeln!(
            stderr,
            "\rUploaded {bytes} bytes in {} ms",
            elapsed.as_millis()
        ),
        ProgressEvent::Failed { error } => writeln!(stderr, "\n{error}"),
    };
    let _ = stderr.flush();
}

pub fn print_clients(clients: &[ClientEntry]) {
    if clients.is_empty() {
        println!("no clients registered");
        return;
    }
    let name_width = clients
        .iter()
        .map(|client| client.name.len())
        .max()
        .unwrap_or(0)
        .max(4);
    println!(
        "{:<name_width$}  {:<15}  {:<15}  PORT",
        "NAME", "IP", "PUBLIC IP"
    );
    for client in clients {
        println!(
            "{:<name_width$}  {:<15}  {:<15}  {}",
            client.name, client.ip, client.publicip, client.port
        );
    }
}
