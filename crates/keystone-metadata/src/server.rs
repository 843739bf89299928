//!
//! # KeystoneServer
//!
//! User facing custom resource: desired image, release, replica count and
//! keystone.conf overrides for one keystone deployment.
//!
use std::fmt;

use serde::{Deserialize, Serialize};

use k8_types::{Crd, CrdNames, DefaultHeader, Spec as K8Spec, Status as K8Status};
use keystone_config::IniConfig;

use crate::{ObjectKey, ObjectMeta, OwnerReference};

pub const GROUP: &str = "openstack.osop.org";
pub const V1ALPHA1: &str = "v1alpha1";

const KEYSTONE_SERVER_API: Crd = Crd {
    group: GROUP,
    version: V1ALPHA1,
    names: CrdNames {
        kind: "KeystoneServer",
        plural: "keystoneservers",
        singular: "keystoneserver",
    },
};

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeystoneServerSpec {
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub release: String,
    /// signed so negative input survives decoding and can be rejected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// keystone.conf overrides, section -> key -> value
    #[serde(default, skip_serializing_if = "IniConfig::is_empty")]
    pub config: IniConfig,
}

impl K8Spec for KeystoneServerSpec {
    type Status = KeystoneServerStatus;
    type Header = DefaultHeader;

    fn metadata() -> &'static Crd {
        &KEYSTONE_SERVER_API
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeystoneServerStatus {
    #[serde(default)]
    pub ready: bool,
}

impl K8Status for KeystoneServerStatus {}

impl fmt::Display for KeystoneServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ready {
            write!(f, "ready")
        } else {
            write!(f, "not ready")
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeystoneServer {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: KeystoneServerSpec,
    #[serde(default)]
    pub status: KeystoneServerStatus,
}

impl KeystoneServer {
    pub fn new<S: Into<String>>(name: S, namespace: S, spec: KeystoneServerSpec) -> Self {
        Self {
            metadata: ObjectMeta::new(name, namespace),
            spec,
            status: KeystoneServerStatus::default(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }

    /// controller reference to stamp on generated children
    pub fn owner_reference(&self) -> OwnerReference {
        self.metadata.make_owner_reference::<KeystoneServerSpec>()
    }
}
