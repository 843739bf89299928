use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid section name {name:?}: {reason}")]
    InvalidSection { name: String, reason: &'static str },
    #[error("invalid key {key:?} in section [{section}]: {reason}")]
    InvalidKey {
        section: String,
        key: String,
        reason: &'static str,
    },
    #[error("invalid value for {key:?} in section [{section}]: {reason}")]
    InvalidValue {
        section: String,
        key: String,
        reason: &'static str,
    },
    #[error("line {line}: key/value pair outside of any section")]
    OrphanKey { line: usize },
    #[error("line {line}: unable to parse {content:?}")]
    Malformed { line: usize, content: String },
}
