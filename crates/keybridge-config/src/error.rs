use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum ConfigError {
    #[error("Failed to parse KDL")]
    #[diagnostic(code(keybridge::config::parse_error))]
    ParseError {
        #[source_code]
        src: String,
        #[label("here")]
        span: miette::SourceSpan,
        #[source]
        source: kdl::KdlError,
    },

    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(keybridge::config::invalid))]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    #[diagnostic(code(keybridge::config::missing_field))]
    MissingField { field: String },

    #[error("Unknown watch event '{name}' at line {line}, column {column}")]
    #[diagnostic(
        code(keybridge::config::unknown_event),
        help("valid events: access, modify, attrib, close-write, close-nowrite, open, moved-from, moved-to, create, delete, delete-self, move-self")
    )]
    UnknownEvent {
        name: String,
        line: usize,
        column: usize,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
