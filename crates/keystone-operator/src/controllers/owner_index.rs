//!
//! # Owner index
//!
//! Maps a `KeystoneServer` to the children that name it as controller. Which
//! children are indexed, and how their owner is found, is decided per child
//! kind by the registered extractor.
//!
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use keystone_metadata::{ChildKind, KeystoneServerSpec, ManagedChild, ObjectKey};

pub type SharedOwnerIndex = Arc<OwnerIndex>;

/// returns the name of the owning server, if the child has one
pub type OwnerExtractor = Arc<dyn Fn(&ManagedChild) -> Option<String> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChildRef {
    pub kind: ChildKind,
    pub key: ObjectKey,
}

impl ChildRef {
    pub fn new(kind: ChildKind, key: ObjectKey) -> Self {
        Self { kind, key }
    }
}

impl From<&ManagedChild> for ChildRef {
    fn from(child: &ManagedChild) -> Self {
        Self::new(child.kind(), child.key())
    }
}

/// Extractor matching only controller references to a `KeystoneServer`.
pub fn controller_owner(child: &ManagedChild) -> Option<String> {
    child
        .metadata()
        .controller()
        .filter(|owner| owner.is_kind_of::<KeystoneServerSpec>())
        .map(|owner| owner.name.clone())
}

#[derive(Default)]
pub struct OwnerIndex {
    extractors: RwLock<HashMap<ChildKind, OwnerExtractor>>,
    state: RwLock<IndexState>,
}

#[derive(Debug, Default)]
struct IndexState {
    by_owner: HashMap<ObjectKey, BTreeSet<ChildRef>>,
    owner_of: HashMap<ChildRef, ObjectKey>,
}

impl IndexState {
    fn insert(&mut self, owner: ObjectKey, child: ChildRef) {
        self.remove(&child);
        self.by_owner
            .entry(owner.clone())
            .or_default()
            .insert(child.clone());
        self.owner_of.insert(child, owner);
    }

    fn remove(&mut self, child: &ChildRef) -> Option<ObjectKey> {
        let owner = self.owner_of.remove(child)?;
        if let Some(children) = self.by_owner.get_mut(&owner) {
            children.remove(child);
            if children.is_empty() {
                self.by_owner.remove(&owner);
            }
        }
        Some(owner)
    }
}

impl std::fmt::Debug for OwnerIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<ChildKind> = self.extractors.read().keys().copied().collect();
        f.debug_struct("OwnerIndex")
            .field("kinds", &kinds)
            .field("state", &*self.state.read())
            .finish()
    }
}

impl OwnerIndex {
    pub fn shared() -> SharedOwnerIndex {
        Arc::new(Self::default())
    }

    /// Register the owner extractor for a child kind.
    ///
    /// Children of kinds without an extractor are not indexed. Registering again
    /// replaces the previous extractor; entries already indexed are kept.
    pub fn index_by<F>(&self, kind: ChildKind, extractor: F)
    where
        F: Fn(&ManagedChild) -> Option<String> + Send + Sync + 'static,
    {
        debug!(%kind, "registered owner extractor");
        self.extractors.write().insert(kind, Arc::new(extractor));
    }

    pub fn is_indexed(&self, kind: ChildKind) -> bool {
        self.extractors.read().contains_key(&kind)
    }

    /// children recorded for owner `namespace/owner_name`
    pub fn lookup(&self, namespace: &str, owner_name: &str) -> BTreeSet<ChildRef> {
        let owner = ObjectKey::new(namespace, owner_name);
        self.state
            .read()
            .by_owner
            .get(&owner)
            .cloned()
            .unwrap_or_default()
    }

    pub fn owner_of(&self, child: &ChildRef) -> Option<ObjectKey> {
        self.state.read().owner_of.get(child).cloned()
    }

    /// record a child written on behalf of `owner`
    pub fn record(&self, owner: &ObjectKey, child: ChildRef) {
        if !self.is_indexed(child.kind) {
            return;
        }
        trace!(%owner, kind = %child.kind, key = %child.key, "record");
        self.state.write().insert(owner.clone(), child);
    }

    /// Update from the current content of a child.
    ///
    /// Returns the owner the child is now indexed under, if any.
    pub fn observe(&self, child: &ManagedChild) -> Option<ObjectKey> {
        let extractor = self.extractors.read().get(&child.kind()).cloned()?;
        let child_ref = ChildRef::from(child);
        let owner_name = extractor(child);

        let mut state = self.state.write();
        match owner_name {
            Some(owner_name) => {
                let owner = ObjectKey::new(child_ref.key.namespace.clone(), owner_name);
                state.insert(owner.clone(), child_ref);
                Some(owner)
            }
            None => {
                state.remove(&child_ref);
                None
            }
        }
    }

    /// drop a deleted child, returning the owner it was indexed under
    pub fn forget(&self, kind: ChildKind, key: &ObjectKey) -> Option<ObjectKey> {
        self.state
            .write()
            .remove(&ChildRef::new(kind, key.clone()))
    }

    /// number of indexed children
    pub fn len(&self) -> usize {
        self.state.read().owner_of.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
