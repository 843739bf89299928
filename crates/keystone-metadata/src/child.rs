//!
//! # Generated children
//!
//! Objects the operator derives from a `KeystoneServer`. The set of kinds is
//! closed: every child is one of the `ManagedChild` variants.
//!
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{ObjectKey, ObjectMeta};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChildKind {
    ConfigMap,
    Deployment,
}

impl ChildKind {
    pub const ALL: [ChildKind; 2] = [ChildKind::ConfigMap, ChildKind::Deployment];

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigMap => "ConfigMap",
            Self::Deployment => "Deployment",
        }
    }

    pub fn api_version(&self) -> &'static str {
        match self {
            Self::ConfigMap => "v1",
            Self::Deployment => "apps/v1",
        }
    }
}

impl fmt::Display for ChildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMap {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub metadata: ObjectMeta,
    pub spec: DeploymentSpec,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    pub replicas: u32,
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
    pub template: PodTemplate,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplate {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
}

/// volume backed by a config map in the same namespace
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    pub config_map: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ManagedChild {
    ConfigMap(ConfigMap),
    Deployment(Deployment),
}

impl ManagedChild {
    pub fn kind(&self) -> ChildKind {
        match self {
            Self::ConfigMap(_) => ChildKind::ConfigMap,
            Self::Deployment(_) => ChildKind::Deployment,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Self::ConfigMap(config_map) => &config_map.metadata,
            Self::Deployment(deployment) => &deployment.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Self::ConfigMap(config_map) => &mut config_map.metadata,
            Self::Deployment(deployment) => &mut deployment.metadata,
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.metadata().key()
    }

    /// Compare desired content only.
    ///
    /// uid, resource version and field manager are owned by the store and do not
    /// take part in the comparison.
    pub fn same_content(&self, other: &ManagedChild) -> bool {
        self.normalized() == other.normalized()
    }

    fn normalized(&self) -> ManagedChild {
        let mut copy = self.clone();
        let meta = copy.metadata().without_store_fields();
        *copy.metadata_mut() = meta;
        copy
    }
}

impl From<ConfigMap> for ManagedChild {
    fn from(config_map: ConfigMap) -> Self {
        Self::ConfigMap(config_map)
    }
}

impl From<Deployment> for ManagedChild {
    fn from(deployment: Deployment) -> Self {
        Self::Deployment(deployment)
    }
}
