use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tracing::warn;

/// Puts the local terminal in raw mode for the lifetime of the guard so that
/// keystrokes reach the remote shell unprocessed.
pub struct RawModeGuard {
    active: bool,
}

impl RawModeGuard {
    pub fn new(enable: bool) -> Self {
        if !enable {
            return Self { active: false };
        }
        match enable_raw_mode() {
            Ok(()) => Self { active: true },
            Err(err) => {
                warn!(target: "shellrelay::tty", error = %err, "failed to enable raw mode");
                Self { active: false }
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.active {
            let _ = disable_raw_mode();
        }
    }
}
