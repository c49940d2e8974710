//! Configuration data model

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize)]
pub struct Config {
    pub global: GlobalConfig,
    pub keyboard: Option<KeyboardConfig>,
    pub source: Option<SourceConfig>,
    pub display: DisplayConfig,
    pub watches: Vec<WatchConfig>,
    pub network: Option<NetworkConfig>,
}

/// Global settings
#[derive(Debug, Clone, Default, Serialize)]
pub struct GlobalConfig {
    pub log_level: LogLevel,
    /// Pidfile used to refuse a second running instance
    pub pidfile: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`
    pub fn as_filter(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!("Unknown log level: {}", s)),
        }
    }
}

/// Virtual keyboard and button mapping
#[derive(Debug, Clone, Serialize)]
pub struct KeyboardConfig {
    /// Name the virtual keyboard registers with the kernel
    pub name: String,
    /// Button whose held state selects the `mod` sequences
    pub modifier: u8,
    /// Button id -> key sequences, ordered by id
    pub buttons: BTreeMap<u8, ButtonConfig>,
}

/// Key sequences for one physical button.
///
/// Key names are kept as written; the daemon resolves them to key codes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ButtonConfig {
    pub normal: Vec<String>,
    /// Sequence used while the modifier button is held. Empty means the
    /// button injects nothing in that state.
    pub modifier: Vec<String>,
}

/// The evdev input device the physical buttons are read from
#[derive(Debug, Clone, Serialize)]
pub struct SourceConfig {
    pub path: PathBuf,
    /// Take exclusive access so button presses do not leak to other readers
    pub grab: bool,
    /// Input code names for Button1, Button2, ... in order
    pub codes: Vec<String>,
}

pub const DEFAULT_SOURCE_CODES: [&str; 8] = [
    "BTN_0", "BTN_1", "BTN_2", "BTN_3", "BTN_4", "BTN_5", "BTN_6", "BTN_7",
];

#[derive(Debug, Clone, Default, Serialize)]
pub struct DisplayConfig {
    /// Centered text shown on line 1 at startup
    pub title: Option<String>,
}

/// A file whose contents are shown on the display whenever it changes
#[derive(Debug, Clone, Serialize)]
pub struct WatchConfig {
    pub path: PathBuf,
    pub events: Vec<WatchEvent>,
    pub label: String,
    pub line: u8,
}

/// Filesystem event kinds a watch can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatchEvent {
    Access,
    Modify,
    Attrib,
    CloseWrite,
    CloseNoWrite,
    Open,
    MovedFrom,
    MovedTo,
    Create,
    Delete,
    DeleteSelf,
    MoveSelf,
}

impl WatchEvent {
    pub const ALL: [WatchEvent; 12] = [
        Self::Access,
        Self::Modify,
        Self::Attrib,
        Self::CloseWrite,
        Self::CloseNoWrite,
        Self::Open,
        Self::MovedFrom,
        Self::MovedTo,
        Self::Create,
        Self::Delete,
        Self::DeleteSelf,
        Self::MoveSelf,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Modify => "modify",
            Self::Attrib => "attrib",
            Self::CloseWrite => "close-write",
            Self::CloseNoWrite => "close-nowrite",
            Self::Open => "open",
            Self::MovedFrom => "moved-from",
            Self::MovedTo => "moved-to",
            Self::Create => "create",
            Self::Delete => "delete",
            Self::DeleteSelf => "delete-self",
            Self::MoveSelf => "move-self",
        }
    }
}

impl fmt::Display for WatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for WatchEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.to_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|event| event.name() == normalized)
            .ok_or_else(|| format!("Unknown watch event: {}", s))
    }
}

/// Interfaces polled for their IPv4 address
#[derive(Debug, Clone, Serialize)]
pub struct NetworkConfig {
    pub interval_secs: u64,
    pub interfaces: Vec<InterfaceConfig>,
}

pub const DEFAULT_NETWORK_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Clone, Serialize)]
pub struct InterfaceConfig {
    pub name: String,
    pub line: u8,
    /// Text shown before the address, defaults to the upper-cased interface name
    pub label: String,
}
