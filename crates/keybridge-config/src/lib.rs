//! Configuration parsing for keybridge
//!
//! This crate handles parsing the KDL configuration file that describes the
//! button-to-key mapping, the physical input source, watched files and
//! polled network interfaces.

mod error;
mod model;
mod parser;

pub use error::ConfigError;
pub use model::*;
pub use parser::{parse_config, parse_config_str, DISPLAY_LINES};
