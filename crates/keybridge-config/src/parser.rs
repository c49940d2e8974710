//! KDL configuration parser

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::model::*;

/// Number of text lines on the peripheral's display
pub const DISPLAY_LINES: u8 = 8;

/// Convert byte offset to line and column (1-indexed)
fn offset_to_line_col(source: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut col = 1;

    for (i, ch) in source.char_indices() {
        if i >= offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }

    (line, col)
}

/// Prefix a message with the `line:column` of a node
fn at_node(node: &kdl::KdlNode, source: &str, message: impl AsRef<str>) -> ConfigError {
    let (line, column) = offset_to_line_col(source, node.name().span().offset());
    ConfigError::Invalid {
        message: format!("{}:{}: {}", line, column, message.as_ref()),
    }
}

/// Parse a configuration file from the given path
pub fn parse_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_config_str(&content)
}

/// Parse configuration from a string
pub fn parse_config_str(content: &str) -> Result<Config, ConfigError> {
    let doc: kdl::KdlDocument = content.parse().map_err(|e: kdl::KdlError| {
        // kdl uses an older miette version, so we need to extract offset/len manually
        let offset = e.span.offset();
        let len = e.span.len();
        let span = miette::SourceSpan::from((offset, len));
        ConfigError::ParseError {
            src: content.to_string(),
            span,
            source: e,
        }
    })?;

    let mut config = Config::default();

    for node in doc.nodes() {
        match node.name().value() {
            "global" => {
                config.global = parse_global(node)?;
            }
            "keyboard" => {
                if config.keyboard.is_some() {
                    return Err(at_node(node, content, "only one `keyboard` block is allowed"));
                }
                config.keyboard = Some(parse_keyboard(node, content)?);
            }
            "source" => {
                config.source = Some(parse_source(node, content)?);
            }
            "display" => {
                config.display = parse_display(node);
            }
            "watch" => {
                config.watches.push(parse_watch(node, content)?);
            }
            "network" => {
                config.network = Some(parse_network(node, content)?);
            }
            name => {
                tracing::warn!("Unknown top-level node: {}", name);
            }
        }
    }

    Ok(config)
}

fn first_string(node: &kdl::KdlNode) -> Option<&str> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
}

fn first_int(node: &kdl::KdlNode) -> Option<i64> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_i64())
}

/// All positional string arguments of a node, in order
fn string_args(node: &kdl::KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn property<'a>(node: &'a kdl::KdlNode, key: &str) -> Option<&'a kdl::KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().map(|n| n.value()) == Some(key))
        .map(|e| e.value())
}

fn expand_path(raw: &str) -> PathBuf {
    shellexpand::tilde(raw).into_owned().into()
}

fn parse_display_line(node: &kdl::KdlNode, value: Option<i64>, source: &str) -> Result<u8, ConfigError> {
    match value {
        Some(line) if (1..=DISPLAY_LINES as i64).contains(&line) => Ok(line as u8),
        Some(line) => Err(at_node(
            node,
            source,
            format!("display line {} is out of range 1..={}", line, DISPLAY_LINES),
        )),
        None => Err(ConfigError::MissingField {
            field: format!("display `line` for `{}`", node.name().value()),
        }),
    }
}

fn parse_global(node: &kdl::KdlNode) -> Result<GlobalConfig, ConfigError> {
    let mut global = GlobalConfig::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "log-level" => {
                    if let Some(val) = first_string(child) {
                        global.log_level = val.parse().map_err(|e| ConfigError::Invalid {
                            message: e,
                        })?;
                    }
                }
                "pidfile" => {
                    global.pidfile = first_string(child).map(expand_path);
                }
                name => {
                    tracing::warn!("Unknown global config option: {}", name);
                }
            }
        }
    }

    Ok(global)
}

fn parse_keyboard(node: &kdl::KdlNode, source: &str) -> Result<KeyboardConfig, ConfigError> {
    let mut name = String::from("octokeyz");
    let mut modifier = None;
    let mut buttons = BTreeMap::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "name" => {
                    if let Some(val) = first_string(child) {
                        name = val.to_string();
                    }
                }
                "modifier" => {
                    modifier = Some(parse_button_id(child, source)?);
                }
                "button" => {
                    let id = parse_button_id(child, source)?;
                    let button = parse_button(child, source)?;
                    if buttons.insert(id, button).is_some() {
                        return Err(at_node(child, source, format!("button {} is mapped twice", id)));
                    }
                }
                other => {
                    tracing::warn!("Unknown keyboard config option: {}", other);
                }
            }
        }
    }

    let modifier = modifier.ok_or_else(|| ConfigError::MissingField {
        field: "keyboard `modifier` (e.g., `modifier 5`)".to_string(),
    })?;

    if buttons.contains_key(&modifier) {
        return Err(ConfigError::Invalid {
            message: format!(
                "Button {} is the modifier and cannot also be an action button",
                modifier
            ),
        });
    }

    Ok(KeyboardConfig {
        name,
        modifier,
        buttons,
    })
}

fn parse_button_id(node: &kdl::KdlNode, source: &str) -> Result<u8, ConfigError> {
    match first_int(node) {
        Some(id) if (1..=u8::MAX as i64).contains(&id) => Ok(id as u8),
        Some(id) => Err(at_node(node, source, format!("button id {} is out of range 1..=255", id))),
        None => Err(ConfigError::MissingField {
            field: format!("button id for `{}`", node.name().value()),
        }),
    }
}

fn parse_button(node: &kdl::KdlNode, source: &str) -> Result<ButtonConfig, ConfigError> {
    let mut button = ButtonConfig::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "normal" => button.normal = string_args(child),
                "mod" => button.modifier = string_args(child),
                other => {
                    tracing::warn!("Unknown button config option: {}", other);
                }
            }
        }
    }

    if button.normal.is_empty() {
        return Err(at_node(node, source, "button needs at least one key in `normal`"));
    }

    Ok(button)
}

fn parse_source(node: &kdl::KdlNode, source: &str) -> Result<SourceConfig, ConfigError> {
    let path = first_string(node).map(expand_path).ok_or_else(|| ConfigError::MissingField {
        field: "source device path (e.g., `source \"/dev/input/event5\"`)".to_string(),
    })?;

    let mut config = SourceConfig {
        path,
        grab: false,
        codes: DEFAULT_SOURCE_CODES.iter().map(|c| c.to_string()).collect(),
    };

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "grab" => {
                    config.grab = child
                        .entries()
                        .first()
                        .and_then(|e| e.value().as_bool())
                        .unwrap_or(true);
                }
                "codes" => {
                    let codes = string_args(child);
                    if codes.is_empty() {
                        return Err(at_node(child, source, "`codes` needs at least one input code"));
                    }
                    config.codes = codes;
                }
                other => {
                    tracing::warn!("Unknown source config option: {}", other);
                }
            }
        }
    }

    Ok(config)
}

fn parse_display(node: &kdl::KdlNode) -> DisplayConfig {
    let mut display = DisplayConfig::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "title" => display.title = first_string(child).map(|s| s.to_string()),
                other => {
                    tracing::warn!("Unknown display config option: {}", other);
                }
            }
        }
    }

    display
}

fn parse_watch(node: &kdl::KdlNode, source: &str) -> Result<WatchConfig, ConfigError> {
    let path = first_string(node).map(expand_path).ok_or_else(|| ConfigError::MissingField {
        field: "watch path (e.g., `watch \"/tmp/CORENAME\"`)".to_string(),
    })?;

    let mut events = Vec::new();
    let mut label = None;
    let mut line = None;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "events" => {
                    for entry in child.entries().iter().filter(|e| e.name().is_none()) {
                        let Some(name) = entry.value().as_string() else {
                            continue;
                        };
                        let event = name.parse::<WatchEvent>().map_err(|_| {
                            let (line, column) = offset_to_line_col(source, entry.span().offset());
                            ConfigError::UnknownEvent {
                                name: name.to_string(),
                                line,
                                column,
                            }
                        })?;
                        if !events.contains(&event) {
                            events.push(event);
                        }
                    }
                }
                "label" => label = first_string(child).map(|s| s.to_string()),
                "line" => line = Some(parse_display_line(child, first_int(child), source)?),
                other => {
                    tracing::warn!("Unknown watch config option: {}", other);
                }
            }
        }
    }

    if events.is_empty() {
        events.push(WatchEvent::CloseWrite);
    }

    let line = line.ok_or_else(|| ConfigError::MissingField {
        field: format!("`line` for watch on {}", path.display()),
    })?;

    let label = label.unwrap_or_else(|| {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    });

    Ok(WatchConfig {
        path,
        events,
        label,
        line,
    })
}

fn parse_network(node: &kdl::KdlNode, source: &str) -> Result<NetworkConfig, ConfigError> {
    let mut network = NetworkConfig {
        interval_secs: DEFAULT_NETWORK_INTERVAL_SECS,
        interfaces: Vec::new(),
    };

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "interval" => match first_int(child) {
                    Some(secs) if secs > 0 => network.interval_secs = secs as u64,
                    _ => {
                        return Err(at_node(child, source, "`interval` must be a positive number of seconds"));
                    }
                },
                "interface" => {
                    let name = first_string(child).ok_or_else(|| ConfigError::MissingField {
                        field: "interface name (e.g., `interface \"eth0\" line=7`)".to_string(),
                    })?;
                    let line = parse_display_line(
                        child,
                        property(child, "line").and_then(|v| v.as_i64()),
                        source,
                    )?;
                    let label = property(child, "label")
                        .and_then(|v| v.as_string())
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| name.to_uppercase());
                    network.interfaces.push(InterfaceConfig {
                        name: name.to_string(),
                        line,
                        label,
                    });
                }
                other => {
                    tracing::warn!("Unknown network config option: {}", other);
                }
            }
        }
    }

    Ok(network)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_CONFIG: &str = r#"
        global {
            log-level "debug"
            pidfile "/run/keybridge.pid"
        }

        keyboard {
            name "octokeyz"
            modifier 5
            button 1 {
                normal "F12"
                mod "LeftAlt" "F12"
            }
            button 2 {
                normal "Esc"
            }
        }

        source "/dev/input/event5" {
            grab true
        }

        display {
            title "MiSTer FPGA"
        }

        watch "/tmp/CORENAME" {
            events "close-write"
            label "Core"
            line 4
        }

        network {
            interval 10
            interface "eth0" line=7 label="ETH"
            interface "wlan0" line=6
        }
    "#;

    #[test]
    fn test_parse_full_config() {
        let config = parse_config_str(FULL_CONFIG).unwrap();

        assert_eq!(config.global.log_level, LogLevel::Debug);
        assert_eq!(config.global.pidfile, Some(PathBuf::from("/run/keybridge.pid")));

        let keyboard = config.keyboard.unwrap();
        assert_eq!(keyboard.name, "octokeyz");
        assert_eq!(keyboard.modifier, 5);
        assert_eq!(keyboard.buttons.len(), 2);
        assert_eq!(keyboard.buttons[&1].normal, vec!["F12"]);
        assert_eq!(keyboard.buttons[&1].modifier, vec!["LeftAlt", "F12"]);
        assert!(keyboard.buttons[&2].modifier.is_empty());

        let source = config.source.unwrap();
        assert_eq!(source.path, PathBuf::from("/dev/input/event5"));
        assert!(source.grab);
        assert_eq!(source.codes.len(), 8);
        assert_eq!(source.codes[0], "BTN_0");

        assert_eq!(config.display.title.as_deref(), Some("MiSTer FPGA"));

        assert_eq!(config.watches.len(), 1);
        assert_eq!(config.watches[0].events, vec![WatchEvent::CloseWrite]);
        assert_eq!(config.watches[0].label, "Core");
        assert_eq!(config.watches[0].line, 4);

        let network = config.network.unwrap();
        assert_eq!(network.interval_secs, 10);
        assert_eq!(network.interfaces[0].label, "ETH");
        assert_eq!(network.interfaces[1].name, "wlan0");
        assert_eq!(network.interfaces[1].label, "WLAN0");
        assert_eq!(network.interfaces[1].line, 6);
    }

    #[test]
    fn test_modifier_cannot_be_action_button() {
        let config = r#"
            keyboard {
                modifier 1
                button 1 {
                    normal "F12"
                }
            }
        "#;

        match parse_config_str(config) {
            Err(ConfigError::Invalid { message }) => {
                assert!(message.contains("modifier"));
            }
            other => panic!("Expected Invalid error, got: {:?}", other),
        }
    }

    #[test]
    fn test_keyboard_missing_modifier() {
        let config = r#"
            keyboard {
                button 1 {
                    normal "F12"
                }
            }
        "#;

        match parse_config_str(config) {
            Err(ConfigError::MissingField { field }) => {
                assert!(field.contains("modifier"));
            }
            other => panic!("Expected MissingField error, got: {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_button_rejected() {
        let config = r#"
            keyboard {
                modifier 5
                button 1 {
                    normal "F12"
                }
                button 1 {
                    normal "Esc"
                }
            }
        "#;

        let err = parse_config_str(config).unwrap_err();
        assert!(err.to_string().contains("mapped twice"), "got: {}", err);
    }

    #[test]
    fn test_button_without_normal_keys_rejected() {
        let config = r#"
            keyboard {
                modifier 5
                button 1 {
                    mod "LeftAlt" "F12"
                }
            }
        "#;

        assert!(matches!(
            parse_config_str(config),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_button_id_out_of_range() {
        let config = r#"
            keyboard {
                modifier 0
            }
        "#;

        let err = parse_config_str(config).unwrap_err();
        assert!(err.to_string().contains("out of range"), "got: {}", err);
    }

    #[test]
    fn test_unknown_watch_event() {
        let config = r#"
            watch "/tmp/CORENAME" {
                events "close-write" "explode"
                line 4
            }
        "#;

        match parse_config_str(config) {
            Err(ConfigError::UnknownEvent { name, line, .. }) => {
                assert_eq!(name, "explode");
                assert_eq!(line, 3);
            }
            other => panic!("Expected UnknownEvent error, got: {:?}", other),
        }
    }

    #[test]
    fn test_watch_defaults() {
        let config = r#"
            watch "/tmp/CORENAME" {
                line 4
            }
        "#;

        let config = parse_config_str(config).unwrap();
        assert_eq!(config.watches[0].events, vec![WatchEvent::CloseWrite]);
        assert_eq!(config.watches[0].label, "CORENAME");
    }

    #[test]
    fn test_watch_requires_line() {
        let config = r#"
            watch "/tmp/CORENAME" {
                events "modify"
            }
        "#;

        assert!(matches!(
            parse_config_str(config),
            Err(ConfigError::MissingField { .. })
        ));
    }

    #[test]
    fn test_display_line_out_of_range() {
        let config = r#"
            network {
                interface "eth0" line=9
            }
        "#;

        let err = parse_config_str(config).unwrap_err();
        assert!(err.to_string().contains("out of range"), "got: {}", err);
    }

    #[test]
    fn test_watch_event_names() {
        assert_eq!("close_write".parse::<WatchEvent>(), Ok(WatchEvent::CloseWrite));
        assert_eq!("Delete-Self".parse::<WatchEvent>(), Ok(WatchEvent::DeleteSelf));
        assert!("closewrite".parse::<WatchEvent>().is_err());
    }

    #[test]
    fn test_parse_error_has_span() {
        let result = parse_config_str("keyboard {");
        assert!(matches!(result, Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_unknown_top_level_node_is_ignored() {
        let config = parse_config_str("flux-capacitor 88").unwrap();
        assert!(config.keyboard.is_none());
        assert!(config.watches.is_empty());
    }
}
