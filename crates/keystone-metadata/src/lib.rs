pub mod child;
pub mod meta;
pub mod server;

pub use child::{
    ChildKind, ConfigMap, Container, Deployment, DeploymentSpec, ManagedChild, PodTemplate, Volume,
    VolumeMount,
};
pub use meta::{ObjectKey, ObjectMeta, OwnerReference};
pub use server::{KeystoneServer, KeystoneServerSpec, KeystoneServerStatus};

// re-export k8-types crate
pub use k8_types;
