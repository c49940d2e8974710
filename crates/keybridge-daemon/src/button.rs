//! Physical button collaborator
//!
//! The mapper never talks to the peripheral directly. It registers handlers
//! on a [`ButtonSource`] and receives a [`ButtonHandle`] for every physical
//! press. A handler may block in [`ButtonHandle::wait_for_release`] until the
//! button goes up, so sources must run handlers off their event pump.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::uinput::DeviceError;

/// One physical button, numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ButtonId(pub u8);

impl fmt::Display for ButtonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Button{}", self.0)
    }
}

/// The button a handler was invoked for.
pub trait ButtonHandle {
    fn id(&self) -> ButtonId;

    /// Block the calling thread until the button is released.
    fn wait_for_release(&self);
}

/// Callback invoked once per physical press
pub type ButtonHandler = Arc<dyn Fn(&dyn ButtonHandle) -> Result<(), HandlerError> + Send + Sync>;

/// Something that turns physical button activity into handler calls.
pub trait ButtonSource {
    /// Register `handler` for `id`. Several handlers may share a button; all
    /// of them run for each press.
    fn add_handler(&mut self, id: ButtonId, handler: ButtonHandler) -> Result<(), SourceError>;
}

/// Failure reported by a button handler
#[derive(Debug, Error)]
pub enum HandlerError {
    /// A dispatch handler ran for a button that has no mapping
    #[error("Handler called for {0}, but no mapping found")]
    Unmapped(ButtonId),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from a button source
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to open input device {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to grab input device {path}: {source}")]
    Grab {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{id} has no input code on this device")]
    UnknownButton { id: ButtonId },

    #[error("Unknown input code '{name}'")]
    UnknownCode { name: String },

    #[error("Failed to read from input device: {0}")]
    Read(#[source] io::Error),

    #[error("Handler for {id} failed: {source}")]
    Handler {
        id: ButtonId,
        #[source]
        source: HandlerError,
    },
}
