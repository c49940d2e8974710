//! Button to key-sequence mapping
//!
//! [`ButtonKeyMapper`] sits between the physical button source and the
//! virtual keyboard. One button is the modifier: while it is held, every
//! other button injects its `modifier` sequence instead of its `normal` one.
//!
//! ```text
//!  physical press ──► dispatch handler ──► select sequence ──► press()
//!                                          (modifier held?)        │
//!  physical release ◄── wait_for_release ◄─────────────────────────┘
//!                          │
//!                          └──► release() (reverse order)
//! ```
//!
//! The modifier flag is written only by the modifier button's handler and
//! read on every dispatch. A source must not start a press's handlers before
//! the previous press's handlers have returned or begun waiting for release,
//! as the evdev source guarantees. Buttons held at the same time are not
//! serialized against each other; their injected keys may interleave.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use evdev::Key;
use keybridge_config::KeyboardConfig;
use thiserror::Error;

use crate::button::{ButtonHandle, ButtonId, ButtonSource, HandlerError, SourceError};
use crate::keys::parse_key_sequence;
use crate::uinput::{DeviceError, DeviceOptions, UinputControl, UinputFile, VirtualKeyboardDevice};

/// Key sequences injected by one button
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ButtonMapping {
    pub normal: Vec<Key>,
    /// Injected while the modifier button is held
    pub modifier: Vec<Key>,
}

/// Errors building a mapper
#[derive(Debug, Error)]
pub enum MapperError {
    #[error("{0} is used as modifier and cannot also be an action button")]
    ModifierIsActionButton(ButtonId),

    #[error("Unknown key '{key}' in mapping for {button}")]
    UnknownKey { button: ButtonId, key: String },

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("Failed to register handler for {id}: {source}")]
    Registration {
        id: ButtonId,
        #[source]
        source: SourceError,
    },
}

/// Resolve the configured key names of every button.
pub fn mapping_from_config(config: &KeyboardConfig) -> Result<HashMap<ButtonId, ButtonMapping>, MapperError> {
    config
        .buttons
        .iter()
        .map(|(&id, button)| -> Result<(ButtonId, ButtonMapping), MapperError> {
            let id = ButtonId(id);
            let resolve = |names: &[String]| {
                parse_key_sequence(names).map_err(|key| MapperError::UnknownKey { button: id, key })
            };
            let mapping = ButtonMapping {
                normal: resolve(&button.normal)?,
                modifier: resolve(&button.modifier)?,
            };
            Ok((id, mapping))
        })
        .collect()
}

/// Sorted, deduplicated union of every key any button can inject
pub fn required_keys(mapping: &HashMap<ButtonId, ButtonMapping>) -> Vec<Key> {
    mapping
        .values()
        .flat_map(|m| m.normal.iter().chain(m.modifier.iter()))
        .map(|k| k.code())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(Key::new)
        .collect()
}

struct Shared<C: UinputControl> {
    device: VirtualKeyboardDevice<C>,
    mapping: HashMap<ButtonId, ButtonMapping>,
    modifier_held: AtomicBool,
}

impl<C: UinputControl> Shared<C> {
    fn on_modifier(&self, button: &dyn ButtonHandle) -> Result<(), HandlerError> {
        self.modifier_held.store(true, Ordering::Release);
        tracing::debug!("Modifier {} held", button.id());
        button.wait_for_release();
        self.modifier_held.store(false, Ordering::Release);
        tracing::debug!("Modifier {} released", button.id());
        Ok(())
    }

    fn dispatch(&self, button: &dyn ButtonHandle) -> Result<(), HandlerError> {
        let id = button.id();
        let mapping = self.mapping.get(&id).ok_or(HandlerError::Unmapped(id))?;

        let keys = if self.modifier_held.load(Ordering::Acquire) {
            &mapping.modifier
        } else {
            &mapping.normal
        };

        tracing::debug!("{} pressed, injecting {:?}", id, keys);
        self.device.press(keys)?;
        button.wait_for_release();
        self.device.release(keys)?;

        Ok(())
    }
}

/// Drives a virtual keyboard from physical button presses.
pub struct ButtonKeyMapper<C: UinputControl = UinputFile> {
    shared: Arc<Shared<C>>,
    modifier: ButtonId,
}

impl ButtonKeyMapper<UinputFile> {
    /// Build a mapper backed by a new `/dev/uinput` keyboard.
    pub fn build<S: ButtonSource>(
        source: &mut S,
        modifier: ButtonId,
        mapping: HashMap<ButtonId, ButtonMapping>,
        options: &DeviceOptions,
    ) -> Result<Self, MapperError> {
        Self::build_with(source, modifier, mapping, |keys| {
            VirtualKeyboardDevice::create(keys, options)
        })
    }
}

impl<C: UinputControl + 'static> ButtonKeyMapper<C> {
    /// Build a mapper whose virtual keyboard comes from `create`.
    ///
    /// The configuration is validated before `create` runs, so a rejected
    /// mapping allocates nothing.
    pub fn build_with<S, F>(
        source: &mut S,
        modifier: ButtonId,
        mapping: HashMap<ButtonId, ButtonMapping>,
        create: F,
    ) -> Result<Self, MapperError>
    where
        S: ButtonSource,
        F: FnOnce(&[Key]) -> Result<VirtualKeyboardDevice<C>, DeviceError>,
    {
        if mapping.contains_key(&modifier) {
            return Err(MapperError::ModifierIsActionButton(modifier));
        }

        let device = create(&required_keys(&mapping))?;

        let shared = Arc::new(Shared {
            device,
            mapping,
            modifier_held: AtomicBool::new(false),
        });

        let state = Arc::clone(&shared);
        source
            .add_handler(
                modifier,
                Arc::new(move |button: &dyn ButtonHandle| state.on_modifier(button)),
            )
            .map_err(|source| {
                shared.device.close();
                MapperError::Registration { id: modifier, source }
            })?;

        let mut buttons: Vec<ButtonId> = shared.mapping.keys().copied().collect();
        buttons.sort();
        for id in buttons {
            let state = Arc::clone(&shared);
            source
                .add_handler(id, Arc::new(move |button: &dyn ButtonHandle| state.dispatch(button)))
                .map_err(|source| {
                    shared.device.close();
                    MapperError::Registration { id, source }
                })?;
        }

        tracing::info!(
            "Mapped {} button(s) with {} as modifier",
            shared.mapping.len(),
            modifier
        );

        Ok(Self { shared, modifier })
    }

    pub fn modifier(&self) -> ButtonId {
        self.modifier
    }

    /// Whether the modifier button is currently held
    pub fn modifier_pressed(&self) -> bool {
        self.shared.modifier_held.load(Ordering::Acquire)
    }

    /// Keys registered on the virtual keyboard
    pub fn keys(&self) -> &[Key] {
        self.shared.device.keys()
    }

    /// Destroy the virtual keyboard. Idempotent.
    pub fn close(&self) {
        self.shared.device.close();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use keybridge_config::ButtonConfig;

    use super::*;
    use crate::button::testing::{FakeSource, HeldButton};
    use crate::display::{flash_on_press, LogDisplay};
    use crate::uinput::testing::{fast_options, Call, Event, RecordingControl};

    const MODIFIER: ButtonId = ButtonId(5);
    const BUTTON_1: ButtonId = ButtonId(1);
    const BUTTON_2: ButtonId = ButtonId(2);

    fn example_mapping() -> HashMap<ButtonId, ButtonMapping> {
        HashMap::from([
            (
                BUTTON_1,
                ButtonMapping {
                    normal: vec![Key::KEY_F12],
                    modifier: vec![Key::KEY_LEFTALT, Key::KEY_F12],
                },
            ),
            (
                BUTTON_2,
                ButtonMapping {
                    normal: vec![Key::KEY_ESC],
                    modifier: vec![],
                },
            ),
        ])
    }

    fn build(source: &mut FakeSource, control: &RecordingControl) -> ButtonKeyMapper<RecordingControl> {
        let control = control.clone();
        ButtonKeyMapper::build_with(source, MODIFIER, example_mapping(), |keys| {
            VirtualKeyboardDevice::create_with(control, keys, &fast_options())
        })
        .unwrap()
    }

    /// Hold the modifier on another thread until the returned sender fires.
    fn hold_modifier(
        source: &FakeSource,
        mapper: &ButtonKeyMapper<RecordingControl>,
    ) -> (std::sync::mpsc::Sender<()>, thread::JoinHandle<()>) {
        let handler = source.handlers(MODIFIER).remove(0);
        let (button, release) = HeldButton::new(MODIFIER);
        let join = thread::spawn(move || handler(&button).unwrap());

        let deadline = Instant::now() + Duration::from_secs(5);
        while !mapper.modifier_pressed() {
            assert!(Instant::now() < deadline, "modifier never reported as held");
            thread::sleep(Duration::from_millis(1));
        }
        (release, join)
    }

    #[test]
    fn test_modifier_as_action_button_rejected_before_device() {
        let mut source = FakeSource::new();
        let mut mapping = example_mapping();
        mapping.insert(MODIFIER, ButtonMapping::default());

        let mut created = false;
        let result = ButtonKeyMapper::<RecordingControl>::build_with(&mut source, MODIFIER, mapping, |_| {
            created = true;
            Err(DeviceError::Closed)
        });

        assert!(matches!(result, Err(MapperError::ModifierIsActionButton(ButtonId(5)))));
        assert!(!created);
        assert!(source.registered().is_empty());
    }

    #[test]
    fn test_build_registers_union_of_keys_and_handlers() {
        let mut source = FakeSource::new();
        let control = RecordingControl::new();
        let mapper = build(&mut source, &control);

        let mut keybits = control.keybits();
        keybits.sort_unstable();
        assert_eq!(
            keybits,
            vec![Key::KEY_ESC.code(), Key::KEY_LEFTALT.code(), Key::KEY_F12.code()]
        );
        assert_eq!(mapper.keys().len(), 3);
        assert_eq!(source.registered(), vec![BUTTON_1, BUTTON_2, MODIFIER]);
    }

    #[test]
    fn test_normal_sequence_without_modifier() {
        let mut source = FakeSource::new();
        let control = RecordingControl::new();
        let _mapper = build(&mut source, &control);
        control.clear();

        source.click(BUTTON_1).unwrap();

        assert_eq!(
            control.events(),
            vec![
                Event::key(Key::KEY_F12, 1),
                Event::sync(),
                Event::key(Key::KEY_F12, 0),
                Event::sync(),
            ]
        );
    }

    #[test]
    fn test_modifier_sequence_while_held() {
        let mut source = FakeSource::new();
        let control = RecordingControl::new();
        let mapper = build(&mut source, &control);
        control.clear();

        let (release, join) = hold_modifier(&source, &mapper);
        source.click(BUTTON_1).unwrap();
        release.send(()).unwrap();
        join.join().unwrap();

        assert!(!mapper.modifier_pressed());
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
    fn test_selection_is_evaluated_per_dispatch() {
        let mut source = FakeSource::new();
        let control = RecordingControl::new();
        let mapper = build(&mut source, &control);

        let (release, join) = hold_modifier(&source, &mapper);
        control.clear();
        source.click(BUTTON_1).unwrap();
        assert_eq!(control.events().len(), 8);

        release.send(()).unwrap();
        join.join().unwrap();

        control.clear();
        source.click(BUTTON_1).unwrap();
        assert_eq!(
            control.events(),
            vec![
                Event::key(Key::KEY_F12, 1),
                Event::sync(),
                Event::key(Key::KEY_F12, 0),
                Event::sync(),
            ]
        );
    }

    #[test]
    fn test_empty_modifier_sequence_injects_nothing() {
        let mut source = FakeSource::new();
        let control = RecordingControl::new();
        let mapper = build(&mut source, &control);

        let (release, join) = hold_modifier(&source, &mapper);
        control.clear();
        source.click(BUTTON_2).unwrap();
        release.send(()).unwrap();
        join.join().unwrap();

        assert!(control.events().is_empty());
    }

    #[test]
    fn test_dispatch_for_unmapped_button_is_an_error() {
        let mut source = FakeSource::new();
        let control = RecordingControl::new();
        let _mapper = build(&mut source, &control);

        let handler = source.handlers(BUTTON_1).remove(0);
        let stray = crate::button::testing::InstantButton(ButtonId(7));

        assert!(matches!(handler(&stray), Err(HandlerError::Unmapped(ButtonId(7)))));
    }

    #[test]
    fn test_injection_failure_is_reported_by_handler() {
        let mut source = FakeSource::new();
        let control = RecordingControl {
            fail_event_write: Some(0),
            ..RecordingControl::new()
        };
        let _mapper = build(&mut source, &control);

        let err = source.click(BUTTON_1).unwrap_err();
        assert!(matches!(err, HandlerError::Device(DeviceError::Injection { .. })));
    }

    #[test]
    fn test_registration_failure_is_reported() {
        let mut source = FakeSource::rejecting(BUTTON_2);
        let control = RecordingControl::new();

        let result = ButtonKeyMapper::build_with(&mut source, MODIFIER, example_mapping(), |keys| {
            VirtualKeyboardDevice::create_with(control.clone(), keys, &fast_options())
        });

        match result {
            Err(MapperError::Registration { id, .. }) => assert_eq!(id, BUTTON_2),
            Err(other) => panic!("Expected Registration error, got: {:?}", other),
            Ok(_) => panic!("Expected Registration error"),
        }
        // The half-built mapper destroyed its keyboard even though earlier
        // handlers are still registered
        assert_eq!(control.count(&Call::Destroy), 1);
    }

    #[test]
    fn test_modifier_also_flashes_indicator() {
        let mut source = FakeSource::new();
        let control = RecordingControl::new();
        let mapper = build(&mut source, &control);
        let display = Arc::new(LogDisplay::new());

        flash_on_press(&mut source, MODIFIER, display.clone()).unwrap();
        assert_eq!(source.handlers(MODIFIER).len(), 2);

        source.click(MODIFIER).unwrap();

        assert_eq!(display.flashes(), 1);
        assert!(!mapper.modifier_pressed());
        assert_eq!(control.count(&Call::Destroy), 0);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut source = FakeSource::new();
        let control = RecordingControl::new();
        let mapper = build(&mut source, &control);

        mapper.close();
        mapper.close();

        assert_eq!(control.count(&Call::Destroy), 1);
        assert_eq!(control.count(&Call::Release), 1);
        assert!(matches!(
            source.click(BUTTON_1),
            Err(HandlerError::Device(DeviceError::Closed))
        ));
    }

    #[test]
    fn test_mapping_from_config() {
        let config = KeyboardConfig {
            name: "octokeyz".to_string(),
            modifier: 5,
            buttons: [(
                1,
                ButtonConfig {
                    normal: vec!["F12".to_string()],
                    modifier: vec!["LeftAlt".to_string(), "F12".to_string()],
                },
            )]
            .into_iter()
            .collect(),
        };

        let mapping = mapping_from_config(&config).unwrap();
        assert_eq!(mapping[&BUTTON_1], example_mapping()[&BUTTON_1]);
    }

    #[test]
    fn test_mapping_from_config_unknown_key() {
        let config = KeyboardConfig {
            name: "octokeyz".to_string(),
            modifier: 5,
            buttons: [(
                3,
                ButtonConfig {
                    normal: vec!["Hyper".to_string()],
                    modifier: vec![],
                },
            )]
            .into_iter()
            .collect(),
        };

        match mapping_from_config(&config) {
            Err(MapperError::UnknownKey { button, key }) => {
                assert_eq!(button, ButtonId(3));
                assert_eq!(key, "Hyper");
            }
            other => panic!("Expected UnknownKey error, got: {:?}", other.map(|m| m.len())),
        }
    }
}
