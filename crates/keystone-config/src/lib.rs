//!
//! # Keystone configuration
//!
//! Sectioned configuration as consumed by `keystone.conf`: the built-in default
//! template, override merging and the INI text layout written to the config map.
//!

mod defaults;
mod error;
mod ini;

pub use defaults::{KEYSTONE_CONFIG_FILENAME, keystone_defaults};
pub use error::ConfigError;
pub use ini::{IniConfig, Section};
