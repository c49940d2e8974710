//! Virtual keyboard injection via uinput
//!
//! [`VirtualKeyboardDevice`] owns one synthetic keyboard created through
//! `/dev/uinput` and injects key-down/key-up sequences into the kernel input
//! subsystem.
//!
//! The kernel boundary is the [`UinputControl`] trait: four ioctls, raw
//! writes and a final close. [`UinputFile`] is the real implementation; the
//! sequencing rules (capability registration before creation, one sync
//! report per key, reverse release order) live in the device and are the
//! same for every control.
//!
//! # Wire format
//!
//! The device descriptor (`struct uinput_user_dev`) and each injected
//! `struct input_event` are encoded field by field in little-endian order.
//! The event timestamp uses the target's native `time_t`/`suseconds_t`
//! widths, so on 32-bit targets the seconds field rolls over in January 2038.
//! That is the kernel ABI of those targets and is not worked around here.

use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::mem::size_of;
use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use evdev::{EventType, Key, Synchronization};
use nix::libc;
use nix::sys::time::TimeVal;
use nix::unistd;
use thiserror::Error;

use crate::fd::ClosableFd;

/// Default uinput control node
pub const UINPUT_PATH: &str = "/dev/uinput";

/// `BUS_USB` from `linux/input.h`
pub const BUS_USB: u16 = 0x03;

const UINPUT_MAX_NAME_SIZE: usize = 80;
const ABS_CNT: usize = 64;

/// Size of the encoded `struct uinput_user_dev`
pub const DESCRIPTOR_SIZE: usize = UINPUT_MAX_NAME_SIZE + 4 * size_of::<u16>() + size_of::<u32>() + 4 * ABS_CNT * size_of::<i32>();

/// Size of the encoded `struct input_event` on this target
pub const EVENT_SIZE: usize = size_of::<libc::time_t>() + size_of::<libc::suseconds_t>() + 2 * size_of::<u16>() + size_of::<i32>();

const KEY_UP: i32 = 0;
const KEY_DOWN: i32 = 1;

mod ioctl {
    nix::ioctl_write_int!(ui_set_evbit, b'U', 100);
    nix::ioctl_write_int!(ui_set_keybit, b'U', 101);
    nix::ioctl_none!(ui_dev_create, b'U', 1);
    nix::ioctl_none!(ui_dev_destroy, b'U', 2);
}

/// Errors raised while creating or driving the virtual keyboard
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The uinput node is missing, busy, or not accessible
    #[error("Failed to open {path}: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The kernel refused an event-class or key capability
    #[error("Failed to register {capability} with uinput: {source}")]
    CapabilityRegistration {
        capability: String,
        #[source]
        source: io::Error,
    },

    /// Writing the descriptor or the create request failed
    #[error("Failed to create virtual keyboard '{name}': {source}")]
    Create {
        name: String,
        #[source]
        source: io::Error,
    },

    /// A write failed part-way through a press or release sequence.
    ///
    /// Keys injected before the failure stay held at the OS level.
    #[error("Failed to inject {action} for {key:?}: {source}")]
    Injection {
        key: Key,
        action: KeyAction,
        #[source]
        source: io::Error,
    },

    #[error("Virtual keyboard has been closed")]
    Closed,
}

/// Direction of an injected key transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Press,
    Release,
}

impl KeyAction {
    fn value(self) -> i32 {
        match self {
            KeyAction::Press => KEY_DOWN,
            KeyAction::Release => KEY_UP,
        }
    }
}

impl fmt::Display for KeyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyAction::Press => write!(f, "key-down"),
            KeyAction::Release => write!(f, "key-up"),
        }
    }
}

/// Identity and timing of the virtual keyboard
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    pub name: String,
    pub bus_type: u16,
    pub vendor: u16,
    pub product: u16,
    pub version: u16,
    /// Pause after device creation so the input subsystem finishes
    /// enumerating it. Events written before that are silently dropped.
    pub settle: Duration,
    /// Pause after each key so consumers see distinct transitions
    pub key_delay: Duration,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            name: "octokeyz".to_string(),
            bus_type: BUS_USB,
            vendor: 0,
            product: 0,
            version: 4,
            settle: Duration::from_secs(1),
            key_delay: Duration::from_millis(10),
        }
    }
}

/// The operations a virtual keyboard needs from the uinput node.
pub trait UinputControl: Send + Sync {
    /// `UI_SET_EVBIT`
    fn set_evbit(&self, event_type: u16) -> io::Result<()>;
    /// `UI_SET_KEYBIT`
    fn set_keybit(&self, code: u16) -> io::Result<()>;
    /// Write one complete record (descriptor or event)
    fn write(&self, bytes: &[u8]) -> io::Result<()>;
    /// `UI_DEV_CREATE`
    fn create(&self) -> io::Result<()>;
    /// `UI_DEV_DESTROY`
    fn destroy(&self) -> io::Result<()>;
    /// Close the node. Must be safe to call more than once.
    fn release(&self);
}

/// `/dev/uinput` opened write-only and non-blocking
#[derive(Debug)]
pub struct UinputFile {
    fd: ClosableFd,
}

impl UinputFile {
    pub fn open(path: &Path) -> io::Result<Self> {
        // std opens with O_CLOEXEC already
        let file = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;
        Ok(Self {
            fd: ClosableFd::new(OwnedFd::from(file)),
        })
    }

    fn raw(&self) -> io::Result<RawFd> {
        Ok(self.fd.get()?.as_raw_fd())
    }
}

impl UinputControl for UinputFile {
    fn set_evbit(&self, event_type: u16) -> io::Result<()> {
        unsafe { ioctl::ui_set_evbit(self.raw()?, event_type.into()) }?;
        Ok(())
    }

    fn set_keybit(&self, code: u16) -> io::Result<()> {
        unsafe { ioctl::ui_set_keybit(self.raw()?, code.into()) }?;
        Ok(())
    }

    fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let written = unistd::write(self.fd.get()?, bytes)?;
        if written != bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write to uinput: {} of {} bytes", written, bytes.len()),
            ));
        }
        Ok(())
    }

    fn create(&self) -> io::Result<()> {
        unsafe { ioctl::ui_dev_create(self.raw()?) }?;
        Ok(())
    }

    fn destroy(&self) -> io::Result<()> {
        unsafe { ioctl::ui_dev_destroy(self.raw()?) }?;
        Ok(())
    }

    fn release(&self) {
        self.fd.close();
    }
}

/// Encode a `struct uinput_user_dev` for a keyboard-only device.
///
/// The name is truncated so the 80-byte field always keeps a trailing NUL.
/// Force-feedback and all absolute-axis arrays are zero.
pub fn encode_descriptor(options: &DeviceOptions) -> Vec<u8> {
    let mut buf = Vec::with_capacity(DESCRIPTOR_SIZE);

    let mut name = [0u8; UINPUT_MAX_NAME_SIZE];
    let bytes = options.name.as_bytes();
    let len = bytes.len().min(UINPUT_MAX_NAME_SIZE - 1);
    name[..len].copy_from_slice(&bytes[..len]);
    buf.extend_from_slice(&name);

    for id in [options.bus_type, options.vendor, options.product, options.version] {
        buf.extend_from_slice(&id.to_le_bytes());
    }

    // ff_effects_max, then absmax/absmin/absfuzz/absflat
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.resize(DESCRIPTOR_SIZE, 0);

    buf
}

/// Encode a `struct input_event`.
pub fn encode_event(time: &TimeVal, event_type: u16, code: u16, value: i32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(EVENT_SIZE);
    buf.extend_from_slice(&time.tv_sec().to_le_bytes());
    buf.extend_from_slice(&time.tv_usec().to_le_bytes());
    buf.extend_from_slice(&event_type.to_le_bytes());
    buf.extend_from_slice(&code.to_le_bytes());
    buf.extend_from_slice(&value.to_le_bytes());
    buf
}

fn now() -> TimeVal {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    TimeVal::new(
        elapsed.as_secs() as libc::time_t,
        elapsed.subsec_micros() as libc::suseconds_t,
    )
}

/// A synthetic keyboard registered with the kernel input subsystem.
///
/// There is no internal locking: two threads pressing different sequences at
/// the same time will interleave their key codes at the OS level.
pub struct VirtualKeyboardDevice<C: UinputControl = UinputFile> {
    control: C,
    name: String,
    keys: Vec<Key>,
    key_delay: Duration,
    closed: AtomicBool,
}

impl VirtualKeyboardDevice<UinputFile> {
    /// Create a virtual keyboard on `/dev/uinput` able to emit `keys`.
    pub fn create(keys: &[Key], options: &DeviceOptions) -> Result<Self, DeviceError> {
        let path = Path::new(UINPUT_PATH);
        let control = UinputFile::open(path).map_err(|source| DeviceError::Unavailable {
            path: path.to_path_buf(),
            source,
        })?;
        Self::create_with(control, keys, options)
    }
}

impl<C: UinputControl> VirtualKeyboardDevice<C> {
    /// Register capabilities and create the device on an already opened
    /// control. On failure the control is released before returning.
    pub fn create_with(control: C, keys: &[Key], options: &DeviceOptions) -> Result<Self, DeviceError> {
        let keys: Vec<Key> = keys
            .iter()
            .map(|k| k.code())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(Key::new)
            .collect();

        if let Err(e) = register(&control, &keys, options) {
            control.release();
            return Err(e);
        }

        tracing::info!(
            "Created virtual keyboard '{}' with {} key(s)",
            options.name,
            keys.len()
        );

        if !options.settle.is_zero() {
            std::thread::sleep(options.settle);
        }

        Ok(Self {
            control,
            name: options.name.clone(),
            keys,
            key_delay: options.key_delay,
            closed: AtomicBool::new(false),
        })
    }

    /// Keys registered as capabilities, sorted by code.
    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    /// Inject key-down events for `keys` in order.
    pub fn press(&self, keys: &[Key]) -> Result<(), DeviceError> {
        self.send(keys.iter().copied(), KeyAction::Press)
    }

    /// Inject key-up events for `keys` in reverse order.
    pub fn release(&self, keys: &[Key]) -> Result<(), DeviceError> {
        self.send(keys.iter().rev().copied(), KeyAction::Release)
    }

    fn send(&self, keys: impl Iterator<Item = Key>, action: KeyAction) -> Result<(), DeviceError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DeviceError::Closed);
        }

        for key in keys {
            let time = now();
            let event = encode_event(&time, EventType::KEY.0, key.code(), action.value());
            let sync = encode_event(&time, EventType::SYNCHRONIZATION.0, Synchronization::SYN_REPORT.0, 0);

            for record in [event, sync] {
                self.control
                    .write(&record)
                    .map_err(|source| DeviceError::Injection { key, action, source })?;
            }

            tracing::trace!("Injected {} for {:?}", action, key);

            if !self.key_delay.is_zero() {
                std::thread::sleep(self.key_delay);
            }
        }

        Ok(())
    }

    /// Destroy the device and close the control node.
    ///
    /// Safe to call repeatedly; failures are logged and swallowed.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.control.destroy() {
            tracing::debug!("UI_DEV_DESTROY for '{}' failed: {}", self.name, e);
        }
        self.control.release();
        tracing::info!("Destroyed virtual keyboard '{}'", self.name);
    }
}

impl<C: UinputControl> Drop for VirtualKeyboardDevice<C> {
    fn drop(&mut self) {
        self.close();
    }
}

fn register<C: UinputControl>(control: &C, keys: &[Key], options: &DeviceOptions) -> Result<(), DeviceError> {
    control
        .set_evbit(EventType::KEY.0)
        .map_err(|source| DeviceError::CapabilityRegistration {
            capability: "EV_KEY".to_string(),
            source,
        })?;

    for key in keys {
        control
            .set_keybit(key.code())
            .map_err(|source| DeviceError::CapabilityRegistration {
                capability: format!("{:?}", key),
                source,
            })?;
    }

    let create_error = |source: io::Error| DeviceError::Create {
        name: options.name.clone(),
        source,
    };
    control.write(&encode_descriptor(options)).map_err(create_error)?;
    control.create().map_err(create_error)?;

    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testing::{fast_options, Call, Event, RecordingControl};
    use super::*;

    #[test]
    fn test_wire_sizes_match_kernel_structs() {
        assert_eq!(DESCRIPTOR_SIZE, 1116);
        assert_eq!(EVENT_SIZE, size_of::<libc::input_event>());
    }

    #[test]
    fn test_encode_descriptor_layout() {
        let options = DeviceOptions {
            name: "octokeyz".to_string(),
            vendor: 0x1d50,
            product: 0x6184,
            ..DeviceOptions::default()
        };
        let bytes = encode_descriptor(&options);

        assert_eq!(bytes.len(), DESCRIPTOR_SIZE);
        assert_eq!(&bytes[..8], b"octokeyz");
        assert!(bytes[8..80].iter().all(|&b| b == 0));
        assert_eq!(&bytes[80..82], &BUS_USB.to_le_bytes());
        assert_eq!(&bytes[82..84], &0x1d50u16.to_le_bytes());
        assert_eq!(&bytes[84..86], &0x6184u16.to_le_bytes());
        assert_eq!(&bytes[86..88], &4u16.to_le_bytes());
        assert!(bytes[88..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_encode_descriptor_truncates_long_name() {
        let options = DeviceOptions {
            name: "x".repeat(200),
            ..DeviceOptions::default()
        };
        let bytes = encode_descriptor(&options);

        assert_eq!(bytes.len(), DESCRIPTOR_SIZE);
        assert!(bytes[..79].iter().all(|&b| b == b'x'));
        assert_eq!(bytes[79], 0);
    }

    #[test]
    fn test_encode_event_layout() {
        let time = TimeVal::new(1_700_000_000, 123_456);
        let bytes = encode_event(&time, EventType::KEY.0, Key::KEY_F12.code(), 1);
        let t = size_of::<libc::time_t>();
        let tv = t + size_of::<libc::suseconds_t>();

        assert_eq!(bytes.len(), EVENT_SIZE);
        assert_eq!(&bytes[..t], &(1_700_000_000 as libc::time_t).to_le_bytes());
        assert_eq!(&bytes[t..tv], &(123_456 as libc::suseconds_t).to_le_bytes());
        assert_eq!(&bytes[tv..tv + 2], &1u16.to_le_bytes());
        assert_eq!(&bytes[tv + 2..tv + 4], &88u16.to_le_bytes());
        assert_eq!(&bytes[tv + 4..], &1i32.to_le_bytes());
    }

    #[test]
    fn test_create_registers_each_distinct_key_once() {
        let control = RecordingControl::new();
        let keys = [
            Key::KEY_F12,
            Key::KEY_LEFTALT,
            Key::KEY_F12,
            Key::KEY_ESC,
            Key::KEY_LEFTALT,
        ];

        let device = VirtualKeyboardDevice::create_with(control.clone(), &keys, &fast_options()).unwrap();

        let mut keybits = control.keybits();
        keybits.sort_unstable();
        assert_eq!(
            keybits,
            vec![Key::KEY_ESC.code(), Key::KEY_LEFTALT.code(), Key::KEY_F12.code()]
        );
        assert_eq!(device.keys().len(), 3);
    }

    #[test]
    fn test_create_sequence() {
        let control = RecordingControl::new();
        let _device = VirtualKeyboardDevice::create_with(control.clone(), &[Key::KEY_A], &fast_options()).unwrap();

        let calls = control.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[0], Call::SetEvbit(EventType::KEY.0));
        assert_eq!(calls[1], Call::SetKeybit(Key::KEY_A.code()));
        assert!(matches!(&calls[2], Call::Write(bytes) if bytes.len() == DESCRIPTOR_SIZE));
        assert_eq!(calls[3], Call::Create);
    }

    #[test]
    fn test_press_then_release_orders_events() {
        let control = RecordingControl::new();
        let device = VirtualKeyboardDevice::create_with(
            control.clone(),
            &[Key::KEY_LEFTALT, Key::KEY_F12],
            &fast_options(),
        )
        .unwrap();
        control.clear();

        let seq = [Key::KEY_LEFTALT, Key::KEY_F12];
        device.press(&seq).unwrap();
        device.release(&seq).unwrap();

        assert_eq!(
            control.events(),
            vec![
                Event::key(Key::KEY_LEFTALT, 1),
                Event::sync(),
                Event::key(Key::KEY_F12, 1),
                Event::sync(),
                Event::key(Key::KEY_F12, 0),
                Event::sync(),
                Event::key(Key::KEY_LEFTALT, 0),
                Event::sync(),
            ]
        );
    }

    #[test]
    fn test_injection_failure_mid_sequence() {
        let control = RecordingControl {
            // Third event write: the key-down of the second key
            fail_event_write: Some(2),
            ..RecordingControl::new()
        };
        let device = VirtualKeyboardDevice::create_with(
            control.clone(),
            &[Key::KEY_LEFTCTRL, Key::KEY_C],
            &fast_options(),
        )
        .unwrap();

        let err = device.press(&[Key::KEY_LEFTCTRL, Key::KEY_C]).unwrap_err();
        match err {
            DeviceError::Injection { key, action, .. } => {
                assert_eq!(key, Key::KEY_C);
                assert_eq!(action, KeyAction::Press);
            }
            other => panic!("Expected Injection error, got: {:?}", other),
        }

        // The first key stays held; nothing compensates for it
        assert_eq!(
            control.events(),
            vec![Event::key(Key::KEY_LEFTCTRL, 1), Event::sync()]
        );
    }

    #[test]
    fn test_close_twice_destroys_once() {
        let control = RecordingControl::new();
        let device = VirtualKeyboardDevice::create_with(control.clone(), &[Key::KEY_A], &fast_options()).unwrap();

        device.close();
        device.close();
        drop(device);

        assert_eq!(control.count(&Call::Destroy), 1);
        assert_eq!(control.count(&Call::Release), 1);
    }

    #[test]
    fn test_press_after_close_fails() {
        let control = RecordingControl::new();
        let device = VirtualKeyboardDevice::create_with(control.clone(), &[Key::KEY_A], &fast_options()).unwrap();
        device.close();

        assert!(matches!(device.press(&[Key::KEY_A]), Err(DeviceError::Closed)));
        assert!(control.events().is_empty());
    }

    #[test]
    fn test_failed_keybit_releases_control() {
        let control = RecordingControl {
            fail_keybit: Some(Key::KEY_B.code()),
            ..RecordingControl::new()
        };

        let result = VirtualKeyboardDevice::create_with(
            control.clone(),
            &[Key::KEY_A, Key::KEY_B, Key::KEY_C],
            &fast_options(),
        );

        match result {
            Err(DeviceError::CapabilityRegistration { capability, .. }) => {
                assert!(capability.contains("KEY_B"));
            }
            Err(other) => panic!("Expected CapabilityRegistration error, got: {:?}", other),
            Ok(_) => panic!("Expected CapabilityRegistration error"),
        }
        assert_eq!(control.count(&Call::Create), 0);
        assert_eq!(control.count(&Call::Release), 1);
    }

    #[test]
    fn test_failed_create_releases_control() {
        let control = RecordingControl {
            fail_create: true,
            ..RecordingControl::new()
        };

        let result = VirtualKeyboardDevice::create_with(control.clone(), &[Key::KEY_A], &fast_options());

        assert!(matches!(result, Err(DeviceError::Create { .. })));
        assert_eq!(control.count(&Call::Release), 1);
    }

    #[test]
    fn test_uinput_file_writes_until_released() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let control = UinputFile::open(file.path()).unwrap();

        control.write(&[1, 2, 3]).unwrap();
        control.release();
        control.release();

        let err = control.write(&[4]).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
        assert_eq!(std::fs::read(file.path()).unwrap(), vec![1, 2, 3]);
    }
}
