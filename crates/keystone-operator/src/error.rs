use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use keystone_config::ConfigError;
use keystone_metadata::{ChildKind, ObjectKey};

use crate::controllers::reconciler::Phase;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: ChildKind, key: ObjectKey },
    #[error("{kind} {key} is managed by {manager}")]
    Conflict {
        kind: ChildKind,
        key: ObjectKey,
        manager: String,
    },
    #[error("{kind} {key} changed since it was read")]
    Stale { kind: ChildKind, key: ObjectKey },
    #[error("{kind} {key} is controlled by missing owner {owner}")]
    OwnerGone {
        kind: ChildKind,
        key: ObjectKey,
        owner: String,
    },
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("unable to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to encode or decode {path}: {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// rejected spec content
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid config override: {0}")]
    Config(#[from] ConfigError),
    #[error("replicas must not be negative, got {0}")]
    NegativeReplicas(i32),
    #[error("image is empty")]
    EmptyImage,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("store: {0}")]
    TransientStore(#[from] StoreError),
    #[error("{kind} {key} is controlled by {owner}")]
    AdoptionConflict {
        kind: ChildKind,
        key: ObjectKey,
        owner: String,
    },
    #[error("unable to stamp owner reference for {key}: {reason}")]
    OwnershipStamp { key: ObjectKey, reason: &'static str },
    #[error("cancelled")]
    Cancelled,
}

impl ReconcileError {
    /// true if running the same request again may succeed without any outside change
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientStore(_) | Self::Cancelled)
    }
}

#[derive(Debug, Error)]
#[error("reconcile {key} failed at {phase}: {source}")]
pub struct ReconcileFailure {
    pub key: ObjectKey,
    pub phase: Phase,
    #[source]
    pub source: ReconcileError,
}

impl ReconcileFailure {
    pub fn is_retryable(&self) -> bool {
        self.source.is_retryable()
    }
}

#[derive(Debug, Error)]
pub enum OperatorConfigError {
    #[error("unable to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid operator config {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid template {path}: {source}")]
    Template {
        path: PathBuf,
        #[source]
        source: ConfigError,
    },
    #[error("{0}")]
    Invalid(String),
}
