use crossterm::cursor::MoveTo;
use crossterm::terminal::{self, Clear, ClearType};
use crossterm::{execute, queue};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use super::geometry::RenderSurface;

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// The terminal emulator the session renders into. Glyph rendering is the
/// widget's business; the session only feeds it decoded text.
pub trait TerminalWidget {
    fn attach(&mut self) -> io::Result<()>;

    /// Current size in cells. Before the first resize this is the widget's
    /// default geometry.
    fn size(&self) -> (u16, u16);

    fn resize(&mut self, cols: u16, rows: u16);

    fn write(&mut self, text: &str) -> io::Result<()>;

    fn release(&mut self);
}

/// Writes straight to the local terminal, which does its own emulation.
pub struct ConsoleWidget<W: Write = io::Stdout> {
    out: W,
    cols: u16,
    rows: u16,
    attached: bool,
}

impl ConsoleWidget<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> ConsoleWidget<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            attached: false,
        }
    }
}

impl<W: Write> TerminalWidget for ConsoleWidget<W> {
    fn attach(&mut self) -> io::Result<()> {
        execute!(self.out, Clear(ClearType::All), MoveTo(0, 0))?;
        self.attached = true;
        Ok(())
    }

    fn size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        self.cols = cols;
        self.rows = rows;
    }

    fn write(&mut self, text: &str) -> io::Result<()> {
        self.out.write_all(text.as_bytes())?;
        self.out.flush()
    }

    fn release(&mut self) {
        if !self.attached {
            return;
        }
        self.attached = false;
        let _ = queue!(self.out, crossterm::style::ResetColor);
        let _ = self.out.write_all(b"\r\n");
        let _ = self.out.flush();
    }
}

/// Collects output in memory; handy for driving a session headless.
#[derive(Clone)]
pub struct BufferWidget {
    inner: Arc<Mutex<BufferState>>,
}

#[derive(Debug)]
struct BufferState {
    text: String,
    size: (u16, u16),
    attached: bool,
    released: bool,
}

impl Default for BufferWidget {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BufferState {
                text: String::new(),
                size: (DEFAULT_COLS, DEFAULT_ROWS),
                attached: false,
                released: false,
            })),
        }
    }
}

impl BufferWidget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        self.inner
            .lock()
            .map(|state| state.text.clone())
            .unwrap_or_default()
    }

    pub fn is_attached(&self) -> bool {
        self.inner.lock().map(|state| state.attached).unwrap_or(false)
    }

    pub fn is_released(&self) -> bool {
        self.inner.lock().map(|state| state.released).unwrap_or(false)
    }
}

impl TerminalWidget for BufferWidget {
    fn attach(&mut self) -> io::Result<()> {
        if let Ok(mut state) = self.inner.lock() {
            state.attached = true;
        }
        Ok(())
    }

    fn size(&self) -> (u16, u16) {
        self.inner
            .lock()
            .map(|state| state.size)
            .unwrap_or((DEFAULT_COLS, DEFAULT_ROWS))
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        if let Ok(mut state) = self.inner.lock() {
            state.size = (cols, rows);
        }
    }

    fn write(&mut self, text: &str) -> io::Result<()> {
        let mut state = self
            .inner
            .lock()
            .map_err(|_| io::Error::other("buffer widget poisoned"))?;
        if state.released {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "widget released"));
        }
        state.text.push_str(text);
        Ok(())
    }

    fn release(&mut self) {
        if let Ok(mut state) = self.inner.lock() {
            state.attached = false;
            state.released = true;
        }
    }
}

/// Measures the local terminal. Terminals that do not report pixel sizes are
/// treated as having one-pixel cells, so the viewport is the cell grid itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleSurface;

impl ConsoleSurface {
    fn pixel_size() -> Option<terminal::WindowSize> {
        terminal::window_size()
            .ok()
            .filter(|size| size.width > 0 && size.height > 0 && size.columns > 0 && size.rows > 0)
    }
}

impl RenderSurface for ConsoleSurface {
    fn cell_size(&self) -> Option<(f32, f32)> {
        if let Some(size) = Self::pixel_size() {
            return Some((
                f32::from(size.width) / f32::from(size.columns),
                f32::from(size.height) / f32::from(size.rows),
            ));
        }
        terminal::size().ok().map(|_| (1.0, 1.0))
    }

    fn viewport(&self) -> (f32, f32) {
        if let Some(size) = Self::pixel_size() {
            return (f32::from(size.width), f32::from(size.height));
        }
        terminal::size()
            .map(|(cols, rows)| (f32::from(cols), f32::from(rows)))
            .unwrap_or((f32::from(DEFAULT_COLS), f32::from(DEFAULT_ROWS)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_widget_starts_at_default_geometry() {
        let mut widget = ConsoleWidget::new(Vec::new());
        assert_eq!(widget.size(), (80, 24));
        widget.resize(132, 43);
        assert_eq!(widget.size(), (132, 43));
    }

    #[test]
    fn console_widget_passes_text_through() {
        let mut widget = ConsoleWidget::new(Vec::new());
        widget.write("$ uptime\r\n").unwrap();
        assert_eq!(widget.out, b"$ uptime\r\n");
    }

    #[test]
    fn buffer_widget_refuses_output_after_release() {
        let handle = BufferWidget::new();
        let mut widget = handle.clone();
        widget.attach().unwrap();
        widget.write("hello").unwrap();
        widget.release();

        assert!(widget.write("late").is_err());
        assert_eq!(handle.contents(), "hello");
        assert!(handle.is_released());
    }
}
