//!
//! # Desired state
//!
//! Computes the ConfigMap and Deployment a `KeystoneServer` should have.
//! Nothing here performs I/O.
//!
use std::sync::Arc;

use tracing::trace;

use keystone_config::{IniConfig, KEYSTONE_CONFIG_FILENAME};
use keystone_metadata::{
    ConfigMap, Container, Deployment, DeploymentSpec, KeystoneServer, KeystoneServerSpec,
    ManagedChild, ObjectKey, ObjectMeta, OwnerReference, PodTemplate, Volume, VolumeMount,
};

use crate::config::OperatorConfig;
use crate::error::{ReconcileError, ValidationError};

pub const API_CONTAINER: &str = "keystone-api";
pub const API_COMMAND: &str = "keystone-wsgi-public";
pub const CONFIG_VOLUME: &str = "etc-keystone";
pub const CONFIG_MOUNT_PATH: &str = "/etc/keystone";

const COMPONENT_LABEL: &str = "component";
const API_COMPONENT: &str = "api";

/// Spec accepted for building, with replicas already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedSpec {
    pub metadata: ObjectMeta,
    pub image: String,
    pub replicas: u32,
    pub overrides: IniConfig,
}

impl ValidatedSpec {
    pub fn validate(
        server: &KeystoneServer,
        config: &OperatorConfig,
    ) -> Result<Self, ValidationError> {
        let spec = &server.spec;
        if spec.image.trim().is_empty() {
            return Err(ValidationError::EmptyImage);
        }

        let requested = match spec.replicas {
            Some(replicas) if replicas < 0 => {
                return Err(ValidationError::NegativeReplicas(replicas));
            }
            Some(replicas) => Some(replicas.unsigned_abs()),
            None => None,
        };

        spec.config.validate()?;

        Ok(Self {
            metadata: server.metadata.clone(),
            image: spec.image.clone(),
            replicas: config.resolve_replicas(requested),
            overrides: spec.config.clone(),
        })
    }

    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredState {
    pub config_map: ConfigMap,
    pub deployment: Deployment,
}

impl DesiredState {
    pub fn config_map_child(&self) -> ManagedChild {
        self.config_map.clone().into()
    }

    pub fn deployment_child(&self) -> ManagedChild {
        self.deployment.clone().into()
    }
}

#[derive(Debug, Clone)]
pub struct DesiredStateBuilder {
    template: Arc<IniConfig>,
}

impl DesiredStateBuilder {
    pub fn new(template: Arc<IniConfig>) -> Self {
        Self { template }
    }

    pub fn template(&self) -> &IniConfig {
        &self.template
    }

    /// keystone.conf text for the given overrides
    pub fn render_config(&self, overrides: &IniConfig) -> String {
        self.template.merge(Some(overrides)).render()
    }

    pub fn build(&self, spec: &ValidatedSpec) -> Result<DesiredState, ReconcileError> {
        let owner = owner_reference(spec)?;
        let name = spec.metadata.name.as_str();
        let namespace = spec.metadata.namespace.as_str();

        let mut config_map = ConfigMap {
            metadata: ObjectMeta::new(name, namespace).with_owner(owner.clone()),
            ..Default::default()
        };
        config_map.data.insert(
            KEYSTONE_CONFIG_FILENAME.to_owned(),
            self.render_config(&spec.overrides),
        );

        let labels = ObjectMeta::default()
            .set_labels(vec![(COMPONENT_LABEL, API_COMPONENT)])
            .labels;

        let deployment = Deployment {
            metadata: ObjectMeta::new(name, namespace).with_owner(owner),
            spec: DeploymentSpec {
                replicas: spec.replicas,
                selector: labels.clone(),
                template: PodTemplate {
                    labels,
                    containers: vec![Container {
                        name: API_CONTAINER.to_owned(),
                        image: spec.image.clone(),
                        command: vec![API_COMMAND.to_owned()],
                        volume_mounts: vec![VolumeMount {
                            name: CONFIG_VOLUME.to_owned(),
                            mount_path: CONFIG_MOUNT_PATH.to_owned(),
                        }],
                    }],
                    volumes: vec![Volume {
                        name: CONFIG_VOLUME.to_owned(),
                        config_map: name.to_owned(),
                    }],
                },
            },
        };

        trace!(key = %spec.key(), replicas = spec.replicas, "desired state built");
        Ok(DesiredState {
            config_map,
            deployment,
        })
    }
}

fn owner_reference(spec: &ValidatedSpec) -> Result<OwnerReference, ReconcileError> {
    let reason = if spec.metadata.name.is_empty() {
        Some("owner has no name")
    } else if spec.metadata.uid.is_empty() {
        Some("owner has no uid")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(ReconcileError::OwnershipStamp {
            key: spec.key(),
            reason,
        }),
        None => Ok(spec
            .metadata
            .make_owner_reference::<KeystoneServerSpec>()),
    }
}
