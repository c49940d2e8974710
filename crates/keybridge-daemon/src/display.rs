//! Status display collaborator
//!
//! The daemon reports its state (title, watched file contents, interface
//! addresses) as numbered text lines. [`LogDisplay`] renders those lines
//! through `tracing`, logging a line only when its rendered text changes.
//! The display also carries a short indicator pulse, flashed while the
//! modifier button is pressed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use keybridge_config::DISPLAY_LINES;

use crate::button::{ButtonHandle, ButtonId, ButtonSource, HandlerError, SourceError};

/// Characters per display line
pub const DISPLAY_WIDTH: usize = 21;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Align {
    #[default]
    Left,
    Center,
    Right,
}

/// A line-oriented status display. Lines are numbered from 1.
pub trait StatusDisplay: Send + Sync {
    fn display_line(&self, line: u8, text: &str, align: Align) -> anyhow::Result<()>;

    fn clear_line(&self, line: u8) -> anyhow::Result<()>;

    /// Pulse the activity indicator once.
    fn flash_indicator(&self) -> anyhow::Result<()>;
}

/// Flash `display`'s indicator on every press of `id`.
///
/// Registered next to the mapper's own handler, so the modifier both flashes
/// and switches the active key sequences.
pub fn flash_on_press<S: ButtonSource>(
    source: &mut S,
    id: ButtonId,
    display: Arc<dyn StatusDisplay>,
) -> Result<(), SourceError> {
    source.add_handler(
        id,
        Arc::new(move |button: &dyn ButtonHandle| {
            tracing::debug!("{} pressed, flashing indicator", button.id());
            display.flash_indicator().map_err(HandlerError::from)
        }),
    )
}

/// Pad or cut `text` to exactly [`DISPLAY_WIDTH`] characters.
pub fn render(text: &str, align: Align) -> String {
    let text: String = text.chars().take(DISPLAY_WIDTH).collect();
    match align {
        Align::Left => format!("{:<width$}", text, width = DISPLAY_WIDTH),
        Align::Center => format!("{:^width$}", text, width = DISPLAY_WIDTH),
        Align::Right => format!("{:>width$}", text, width = DISPLAY_WIDTH),
    }
}

fn check_line(line: u8) -> anyhow::Result<usize> {
    if line == 0 || line > DISPLAY_LINES {
        bail!("Display line {} out of range 1..={}", line, DISPLAY_LINES);
    }
    Ok(usize::from(line - 1))
}

/// Display that writes lines to the log
#[derive(Debug, Default)]
pub struct LogDisplay {
    lines: Mutex<[Option<String>; DISPLAY_LINES as usize]>,
    flashes: AtomicUsize,
}

impl LogDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current rendered contents of `line`, `None` if blank or out of range.
    pub fn line(&self, line: u8) -> Option<String> {
        let index = check_line(line).ok()?;
        self.lines.lock().ok()?[index].clone()
    }

    /// Number of indicator flashes so far
    pub fn flashes(&self) -> usize {
        self.flashes.load(Ordering::Relaxed)
    }

    fn set(&self, line: u8, value: Option<String>) -> anyhow::Result<bool> {
        let index = check_line(line)?;
        let mut lines = self
            .lines
            .lock()
            .map_err(|_| anyhow::anyhow!("display state poisoned"))?;
        if lines[index] == value {
            return Ok(false);
        }
        lines[index] = value;
        Ok(true)
    }
}

impl StatusDisplay for LogDisplay {
    fn display_line(&self, line: u8, text: &str, align: Align) -> anyhow::Result<()> {
        let rendered = render(text, align);
        if self.set(line, Some(rendered.clone()))? {
            tracing::info!("[display {}] |{}|", line, rendered);
        }
        Ok(())
    }

    fn clear_line(&self, line: u8) -> anyhow::Result<()> {
        if self.set(line, None)? {
            tracing::info!("[display {}] cleared", line);
        }
        Ok(())
    }

    fn flash_indicator(&self) -> anyhow::Result<()> {
        let count = self.flashes.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!("[display] indicator flash #{}", count);
        Ok(())
    }
}
