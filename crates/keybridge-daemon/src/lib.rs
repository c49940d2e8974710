//! keybridge daemon library
//!
//! Bridges the buttons of a physical peripheral to a synthetic `/dev/uinput`
//! keyboard and drives a status display from inotify and network events.
//! The `keybridged` binary wires these pieces together.

pub mod button;
pub mod display;
mod fd;
pub mod inotify;
pub mod keys;
pub mod mapper;
pub mod netmon;
pub mod pidfile;
pub mod shutdown;
pub mod source;
pub mod uinput;

pub use button::{ButtonHandle, ButtonHandler, ButtonId, ButtonSource, HandlerError, SourceError};
pub use display::{Align, LogDisplay, StatusDisplay};
pub use inotify::{EventMask, FileChangeDecoder, FileEvent, ListenError, WatchError};
pub use mapper::{ButtonKeyMapper, ButtonMapping, MapperError};
pub use source::EvdevButtonSource;
pub use uinput::{DeviceError, DeviceOptions, VirtualKeyboardDevice};
