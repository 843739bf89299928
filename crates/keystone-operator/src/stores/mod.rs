//!
//! # Resource store
//!
//! Access to `KeystoneServer` objects and the children generated from them.
//!
pub mod local;

use std::fmt;

use async_channel::Receiver;
use async_trait::async_trait;

use keystone_metadata::{ChildKind, KeystoneServer, ManagedChild, ObjectKey};

use crate::error::StoreError;

pub use local::LocalStore;

pub type SharedStore<C> = std::sync::Arc<C>;

/// result of a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
}

impl fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Updated => write!(f, "updated"),
            Self::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// state the stored object must still be in for a write to go ahead
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    Any,
    /// no object with the same kind and key
    Absent,
    /// object at exactly this resource version
    Version(u64),
}

impl Precondition {
    /// precondition matching what a read returned
    pub fn observed(existing: Option<&ManagedChild>) -> Self {
        match existing {
            Some(child) => Self::Version(child.metadata().resource_version),
            None => Self::Absent,
        }
    }

    pub fn holds(&self, current: Option<&ManagedChild>) -> bool {
        match self {
            Self::Any => true,
            Self::Absent => current.is_none(),
            Self::Version(version) => {
                current.is_some_and(|child| child.metadata().resource_version == *version)
            }
        }
    }
}

/// change notification, published after the change is visible to readers
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    ServerApplied(KeystoneServer),
    ServerDeleted(KeystoneServer),
    ChildApplied(ManagedChild),
    ChildDeleted(ManagedChild),
}

#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_server(&self, key: &ObjectKey) -> Result<Option<KeystoneServer>, StoreError>;

    /// all servers, or only those of `namespace`
    async fn list_servers(&self, namespace: Option<&str>)
    -> Result<Vec<KeystoneServer>, StoreError>;

    /// insert or replace a server; uid is assigned on first write
    async fn apply_server(&self, server: KeystoneServer) -> Result<KeystoneServer, StoreError>;

    /// delete server together with every child it controls
    async fn delete_server(&self, key: &ObjectKey) -> Result<Option<KeystoneServer>, StoreError>;

    async fn get_child(
        &self,
        kind: ChildKind,
        key: &ObjectKey,
    ) -> Result<Option<ManagedChild>, StoreError>;

    async fn list_children(
        &self,
        kind: ChildKind,
        namespace: Option<&str>,
    ) -> Result<Vec<ManagedChild>, StoreError>;

    /// Idempotent upsert on behalf of `field_owner`.
    ///
    /// An object last written by another owner is only replaced when `force` is set.
    async fn apply(
        &self,
        child: ManagedChild,
        field_owner: &str,
        force: bool,
    ) -> Result<ApplyOutcome, StoreError> {
        self.apply_if(child, field_owner, force, Precondition::Any)
            .await
    }

    /// `apply`, failing with `Stale` unless the stored object matches `precondition`.
    ///
    /// A child whose controller reference names a server that does not exist
    /// is rejected with `OwnerGone`.
    async fn apply_if(
        &self,
        child: ManagedChild,
        field_owner: &str,
        force: bool,
        precondition: Precondition,
    ) -> Result<ApplyOutcome, StoreError>;

    /// Fails with `AlreadyExists` if an object with the same kind and key is present.
    ///
    /// Rejects dangling controller references like `apply_if`.
    async fn create(
        &self,
        child: ManagedChild,
        field_owner: &str,
    ) -> Result<ApplyOutcome, StoreError>;

    async fn delete_child(
        &self,
        kind: ChildKind,
        key: &ObjectKey,
    ) -> Result<Option<ManagedChild>, StoreError>;

    /// stream of changes made after this call
    fn watch(&self) -> Receiver<StoreEvent>;
}
