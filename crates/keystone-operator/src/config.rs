//!
//! # Operator configuration
//!
//! Values are resolved in the following order:
//!     1) default values
//!     2) TOML configuration file, if provided
//!     3) cli parameters
//!
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use keystone_config::{IniConfig, keystone_defaults};

use crate::error::OperatorConfigError;

pub const DEFAULT_FIELD_OWNER: &str = "keystone-server";

const MIN_RESYNC_INTERVAL: Duration = Duration::from_millis(10);
const MAX_RESYNC_INTERVAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// writer identity used for apply calls
    pub field_owner: String,
    pub apply_mode: ApplyMode,
    /// upper bound for a single store call
    #[serde(with = "humantime_serde")]
    pub apply_timeout: Duration,
    /// replicas used when a spec leaves them unset
    pub default_replicas: u32,
    pub zero_replicas: ZeroReplicas,
    /// INI file replacing the built-in keystone.conf defaults
    pub template: Option<PathBuf>,
    /// only watch this namespace
    pub namespace: Option<String>,
    #[serde(with = "humantime_serde")]
    pub resync_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub backoff_min: Duration,
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,
    pub max_concurrent: usize,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            field_owner: DEFAULT_FIELD_OWNER.to_owned(),
            apply_mode: ApplyMode::default(),
            apply_timeout: Duration::from_secs(30),
            default_replicas: 1,
            zero_replicas: ZeroReplicas::default(),
            template: None,
            namespace: None,
            resync_interval: Duration::from_secs(300),
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            max_concurrent: 4,
        }
    }
}

/// How generated objects are written to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum ApplyMode {
    /// idempotent upsert, claiming fields held by other writers when forced
    Apply {
        #[serde(default = "force_ownership_default")]
        force_ownership: bool,
    },
    /// create only, existing objects are left alone
    Create,
}

fn force_ownership_default() -> bool {
    true
}

impl Default for ApplyMode {
    fn default() -> Self {
        Self::Apply {
            force_ownership: true,
        }
    }
}

/// meaning of an explicit `replicas: 0`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ZeroReplicas {
    #[default]
    ScaleToZero,
    UseDefault,
}

impl OperatorConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, OperatorConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| OperatorConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| OperatorConfigError::Toml {
            path: path.to_owned(),
            source,
        })?;
        debug!(path = %path.display(), "loaded operator config");
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), OperatorConfigError> {
        if self.field_owner.trim().is_empty() {
            return Err(OperatorConfigError::Invalid(
                "field_owner must not be empty".to_owned(),
            ));
        }
        if self.apply_timeout.is_zero() {
            return Err(OperatorConfigError::Invalid(
                "apply_timeout must be positive".to_owned(),
            ));
        }
        if self.resync_interval.is_zero() {
            return Err(OperatorConfigError::Invalid(
                "resync_interval must be positive".to_owned(),
            ));
        }
        if self.resync_interval > MAX_RESYNC_INTERVAL {
            return Err(OperatorConfigError::Invalid(format!(
                "resync_interval {:?} exceeds {:?}",
                self.resync_interval, MAX_RESYNC_INTERVAL
            )));
        }
        if self.backoff_min > self.backoff_max {
            return Err(OperatorConfigError::Invalid(format!(
                "backoff_min {:?} is larger than backoff_max {:?}",
                self.backoff_min, self.backoff_max
            )));
        }
        if self.max_concurrent == 0 {
            return Err(OperatorConfigError::Invalid(
                "max_concurrent must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }

    /// keystone.conf template, either the configured file or the built-in defaults
    pub fn load_template(&self) -> Result<IniConfig, OperatorConfigError> {
        let Some(path) = &self.template else {
            return Ok(keystone_defaults());
        };

        let content = std::fs::read_to_string(path).map_err(|source| OperatorConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        let template: IniConfig =
            content
                .parse()
                .map_err(|source| OperatorConfigError::Template {
                    path: path.to_owned(),
                    source,
                })?;
        template
            .validate()
            .map_err(|source| OperatorConfigError::Template {
                path: path.to_owned(),
                source,
            })?;
        debug!(path = %path.display(), sections = template.len(), "loaded template");
        Ok(template)
    }

    /// replica count for a non negative requested value
    pub fn resolve_replicas(&self, requested: Option<u32>) -> u32 {
        match requested {
            None => self.default_replicas,
            Some(0) if self.zero_replicas == ZeroReplicas::UseDefault => self.default_replicas,
            Some(replicas) => replicas,
        }
    }

    /// resync interval kept within the supported range
    pub fn resync_period(&self) -> Duration {
        self.resync_interval
            .clamp(MIN_RESYNC_INTERVAL, MAX_RESYNC_INTERVAL)
    }

    pub fn force_ownership(&self) -> bool {
        matches!(
            self.apply_mode,
            ApplyMode::Apply {
                force_ownership: true
            }
        )
    }
}
