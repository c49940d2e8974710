//! evdev-backed physical button source
//!
//! [`EvdevButtonSource`] reads key events from one input device and maps the
//! configured input codes (in order) onto `Button1`, `Button2`, ... Every
//! press runs its handlers on the blocking thread pool, so a handler that
//! waits for the release does not stall the event pump that delivers it.
//!
//! Handlers still observe presses in event order: the handlers of a press
//! start only after every handler of the previous press has either returned
//! or entered `wait_for_release`. State a handler sets before waiting (the
//! mapper's modifier flag) is therefore visible to the next press, however
//! close together the two events arrive.

use std::collections::HashMap;
use std::mem;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use evdev::{Device, InputEventKind, Key};
use keybridge_config::SourceConfig;
use tokio::sync::{mpsc, watch};

use crate::button::{ButtonHandle, ButtonHandler, ButtonId, ButtonSource, SourceError};

const KEY_RELEASED: i32 = 0;
const KEY_PRESSED: i32 = 1;

/// Information about an input device
#[derive(Debug)]
pub struct DeviceInfo {
    pub path: PathBuf,
    pub name: String,
    pub vendor: u16,
    pub product: u16,
}

impl DeviceInfo {
    /// Get vendor:product string (e.g., "16c0:05e1")
    pub fn vendor_product(&self) -> String {
        format!("{:04x}:{:04x}", self.vendor, self.product)
    }
}

/// Enumerate all `/dev/input/event*` devices that can be opened.
pub fn enumerate_devices() -> std::io::Result<Vec<DeviceInfo>> {
    let mut devices = Vec::new();

    for entry in std::fs::read_dir("/dev/input")? {
        let path = entry?.path();

        if !path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("event"))
            .unwrap_or(false)
        {
            continue;
        }

        match Device::open(&path) {
            Ok(device) => {
                let id = device.input_id();
                devices.push(DeviceInfo {
                    name: device.name().unwrap_or("Unknown").to_string(),
                    vendor: id.vendor(),
                    product: id.product(),
                    path,
                });
            }
            Err(e) => {
                tracing::debug!("Could not open {}: {}", path.display(), e);
            }
        }
    }

    devices.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(devices)
}

/// Resolve the configured input code names, `Button1` first.
pub fn codes_from_config(config: &SourceConfig) -> Result<Vec<Key>, SourceError> {
    config
        .codes
        .iter()
        .map(|name| {
            Key::from_str(&name.to_uppercase())
                .map_err(|_| SourceError::UnknownCode { name: name.clone() })
        })
        .collect()
}

/// A press delivered to handlers
pub struct EvdevButton {
    id: ButtonId,
    released: watch::Receiver<bool>,
    settled: watch::Sender<bool>,
}

impl EvdevButton {
    /// Let the next press's handlers start.
    fn settle(&self) {
        self.settled.send_replace(true);
    }
}

impl ButtonHandle for EvdevButton {
    fn id(&self) -> ButtonId {
        self.id
    }

    fn wait_for_release(&self) {
        self.settle();
        let mut released = self.released.clone();
        // Err means the source is gone, which also ends the press
        let _ = futures::executor::block_on(released.wait_for(|r| *r));
    }
}

/// Routes key transitions to button handlers.
///
/// `pending` holds one settle signal per handler of the last press that had
/// handlers. The next press waits on all of them before running its own.
struct Dispatcher {
    buttons: HashMap<u16, ButtonId>,
    handlers: HashMap<ButtonId, Vec<ButtonHandler>>,
    held: HashMap<ButtonId, watch::Sender<bool>>,
    pending: Vec<watch::Receiver<bool>>,
    errors: mpsc::UnboundedSender<SourceError>,
}

impl Dispatcher {
    fn new(codes: &[Key], errors: mpsc::UnboundedSender<SourceError>) -> Self {
        let buttons = codes
            .iter()
            .zip(1..=u8::MAX)
            .map(|(key, n)| (key.code(), ButtonId(n)))
            .collect();
        Self {
            buttons,
            handlers: HashMap::new(),
            held: HashMap::new(),
            pending: Vec::new(),
            errors,
        }
    }

    fn knows(&self, id: ButtonId) -> bool {
        self.buttons.values().any(|&b| b == id)
    }

    /// Must be called from within a tokio runtime.
    fn on_key(&mut self, code: u16, value: i32) {
        let Some(&id) = self.buttons.get(&code) else {
            return;
        };

        match value {
            KEY_PRESSED => {
                let (tx, rx) = watch::channel(false);
                if let Some(stale) = self.held.insert(id, tx) {
                    // A press without release; let its handlers finish
                    let _ = stale.send(true);
                }

                let handlers = self.handlers.get(&id).cloned().unwrap_or_default();
                tracing::debug!("{} pressed, {} handler(s)", id, handlers.len());
                if handlers.is_empty() {
                    return;
                }

                let before = Arc::new(mem::take(&mut self.pending));
                for handler in handlers {
                    let (settled, settled_rx) = watch::channel(false);
                    self.pending.push(settled_rx);

                    let button = EvdevButton {
                        id,
                        released: rx.clone(),
                        settled,
                    };
                    let before = Arc::clone(&before);
                    let errors = self.errors.clone();
                    tokio::task::spawn_blocking(move || {
                        wait_settled(&before);
                        let result = handler(&button);
                        button.settle();
                        if let Err(source) = result {
                            let _ = errors.send(SourceError::Handler { id, source });
                        }
                    });
                }
            }
            KEY_RELEASED => {
                if let Some(tx) = self.held.remove(&id) {
                    tracing::debug!("{} released", id);
                    let _ = tx.send(true);
                }
            }
            // Autorepeat
            _ => {}
        }
    }
}

/// Block until every handler behind `signals` has settled.
fn wait_settled(signals: &[watch::Receiver<bool>]) {
    for signal in signals {
        let mut signal = signal.clone();
        // Err means the handler's task is gone
        let _ = futures::executor::block_on(signal.wait_for(|s| *s));
    }
}

/// Buttons read from one evdev input device
pub struct EvdevButtonSource {
    path: PathBuf,
    device: Device,
    dispatcher: Dispatcher,
    errors: mpsc::UnboundedReceiver<SourceError>,
}

impl EvdevButtonSource {
    /// Open `path`, mapping `codes[0]` to `Button1` and so on.
    pub fn open(path: &Path, codes: &[Key], grab: bool) -> Result<Self, SourceError> {
        let mut device = Device::open(path).map_err(|source| SourceError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        let name = device.name().unwrap_or("Unknown").to_string();

        if let Some(supported) = device.supported_keys() {
            for key in codes.iter().filter(|k| !supported.contains(**k)) {
                tracing::warn!("Device '{}' does not report {:?}", name, key);
            }
        }

        if grab {
            device.grab().map_err(|source| SourceError::Grab {
                path: path.to_path_buf(),
                source,
            })?;
            tracing::debug!("Grabbed device: {}", name);
        }

        tracing::info!(
            "Reading {} button(s) from '{}' at {}",
            codes.len(),
            name,
            path.display()
        );

        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            path: path.to_path_buf(),
            device,
            dispatcher: Dispatcher::new(codes, tx),
            errors: rx,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pump events until the device fails or a handler returns an error.
    pub async fn listen(self) -> Result<(), SourceError> {
        let Self {
            device,
            mut dispatcher,
            mut errors,
            ..
        } = self;

        let mut stream = device.into_event_stream().map_err(SourceError::Read)?;

        loop {
            tokio::select! {
                event = stream.next_event() => {
                    let event = event.map_err(SourceError::Read)?;
                    if let InputEventKind::Key(key) = event.kind() {
                        dispatcher.on_key(key.code(), event.value());
                    }
                }
                Some(err) = errors.recv() => return Err(err),
            }
        }
    }
}

impl ButtonSource for EvdevButtonSource {
    fn add_handler(&mut self, id: ButtonId, handler: ButtonHandler) -> Result<(), SourceError> {
        if !self.dispatcher.knows(id) {
            return Err(SourceError::UnknownButton { id });
        }
        self.dispatcher.handlers.entry(id).or_default().push(handler);
        Ok(())
    }
}
