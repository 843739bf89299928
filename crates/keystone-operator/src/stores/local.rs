//!
//! # Local store
//!
//! In memory object store with optional YAML persistence. Each object is kept in
//! `<root>/<plural>/<namespace>/<name>.yaml`.
//!
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use async_channel::{Receiver, Sender, unbounded};
use async_lock::RwLock;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use keystone_metadata::k8_types::Spec as K8Spec;
use keystone_metadata::{
    ChildKind, KeystoneServer, KeystoneServerSpec, ManagedChild, ObjectKey, OwnerReference,
};

use crate::error::StoreError;

use super::{ApplyOutcome, Precondition, ResourceStore, StoreEvent};

const YAML_EXTENSION: &str = "yaml";

#[derive(Debug)]
pub struct LocalStore {
    path: Option<PathBuf>,
    state: RwLock<StoreState>,
    subscribers: Mutex<Vec<Sender<StoreEvent>>>,
}

#[derive(Debug, Default)]
struct StoreState {
    version: u64,
    servers: BTreeMap<ObjectKey, KeystoneServer>,
    children: BTreeMap<(ChildKind, ObjectKey), ManagedChild>,
}

impl StoreState {
    fn next_version(&self) -> u64 {
        self.version + 1
    }

    /// controller reference of `child` naming a server instance that is not stored
    fn dangling_controller<'a>(&self, child: &'a ManagedChild) -> Option<&'a OwnerReference> {
        let controller = child
            .metadata()
            .controller()
            .filter(|reference| reference.is_kind_of::<KeystoneServerSpec>())?;
        let key = ObjectKey::new(child.metadata().namespace.as_str(), controller.name.as_str());
        match self.servers.get(&key) {
            Some(server) if server.metadata.uid == controller.uid => None,
            _ => Some(controller),
        }
    }

    /// keys of children controlled by `owner`
    fn controlled_by(&self, owner: &OwnerReference) -> Vec<(ChildKind, ObjectKey)> {
        self.children
            .iter()
            .filter(|(_, child)| {
                child
                    .metadata()
                    .controller()
                    .is_some_and(|reference| reference.is_same_owner(owner))
            })
            .map(|(index, _)| index.clone())
            .collect()
    }
}

fn server_dir() -> &'static str {
    KeystoneServerSpec::metadata().names.plural
}

fn child_dir(kind: ChildKind) -> &'static str {
    match kind {
        ChildKind::ConfigMap => "configmaps",
        ChildKind::Deployment => "deployments",
    }
}

fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

impl LocalStore {
    /// store without persistence
    pub fn memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(StoreState::default()),
            subscribers: Mutex::new(vec![]),
        }
    }

    /// Open store rooted at `path`, loading every object found there.
    ///
    /// Unreadable files are skipped. Servers written without uid get one
    /// assigned and written back. Children controlled by a server that is not
    /// there are deleted.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut state = StoreState::default();

        for (file, mut server) in load_dir::<KeystoneServer>(&path.join(server_dir()))? {
            fill_identity(&mut server.metadata.namespace, &mut server.metadata.name, &file);
            if server.metadata.uid.is_empty() {
                server.metadata.uid = new_uid();
                flush(&file, &server)?;
            }
            state.version = state.version.max(server.metadata.resource_version);
            debug!(key = %server.key(), "loaded server");
            state.servers.insert(server.key(), server);
        }

        for kind in ChildKind::ALL {
            for (file, mut child) in load_dir::<ManagedChild>(&path.join(child_dir(kind)))? {
                if child.kind() != kind {
                    warn!(file = %file.display(), %kind, "skipped child stored under wrong kind");
                    continue;
                }
                {
                    let meta = child.metadata_mut();
                    fill_identity(&mut meta.namespace, &mut meta.name, &file);
                }
                if let Some(owner) = state.dangling_controller(&child) {
                    debug!(%kind, key = %child.key(), %owner, "collecting child of missing owner");
                    if let Err(err) = std::fs::remove_file(&file) {
                        warn!("unable to delete file {}: {err}", file.display());
                    }
                    continue;
                }
                state.version = state.version.max(child.metadata().resource_version);
                debug!(%kind, key = %child.key(), "loaded child");
                state.children.insert((kind, child.key()), child);
            }
        }

        Ok(Self {
            path: Some(path),
            state: RwLock::new(state),
            subscribers: Mutex::new(vec![]),
        })
    }

    /// latest resource version handed out
    pub async fn version(&self) -> u64 {
        self.state.read().await.version
    }

    fn object_path(&self, dir: &str, key: &ObjectKey) -> Option<PathBuf> {
        self.path.as_ref().map(|root| {
            root.join(dir)
                .join(&key.namespace)
                .join(format!("{}.{YAML_EXTENSION}", key.name))
        })
    }

    fn persist<T: Serialize>(&self, dir: &str, key: &ObjectKey, value: &T) -> Result<(), StoreError> {
        match self.object_path(dir, key) {
            Some(path) => flush(&path, value),
            None => Ok(()),
        }
    }

    fn unpersist(&self, dir: &str, key: &ObjectKey) {
        if let Some(path) = self.object_path(dir, key) {
            if let Err(err) = std::fs::remove_file(&path) {
                warn!("unable to delete file {}: {err}", path.display());
            }
        }
    }

    /// send event to every live watcher, dropping closed ones
    fn publish(&self, event: StoreEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sender| sender.try_send(event.clone()).is_ok());
        trace!(watchers = subscribers.len(), "published");
    }

    fn write_child(
        &self,
        state: &mut StoreState,
        mut child: ManagedChild,
        field_owner: &str,
        uid: String,
    ) -> Result<(), StoreError> {
        let kind = child.kind();
        let key = child.key();
        let version = state.next_version();
        {
            let meta = child.metadata_mut();
            meta.uid = uid;
            meta.resource_version = version;
            meta.field_manager = Some(field_owner.to_owned());
        }
        self.persist(child_dir(kind), &key, &child)?;
        state.version = version;
        state.children.insert((kind, key), child.clone());
        self.publish(StoreEvent::ChildApplied(child));
        Ok(())
    }

    fn ensure_owner_exists(state: &StoreState, child: &ManagedChild) -> Result<(), StoreError> {
        match state.dangling_controller(child) {
            Some(owner) => Err(StoreError::OwnerGone {
                kind: child.kind(),
                key: child.key(),
                owner: owner.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// remove every child controlled by `owner`
    fn collect_children(&self, state: &mut StoreState, owner: &OwnerReference) {
        for (kind, child_key) in state.controlled_by(owner) {
            if let Some(child) = state.children.remove(&(kind, child_key.clone())) {
                self.unpersist(child_dir(kind), &child_key);
                state.version = state.next_version();
                debug!(%kind, key = %child_key, "cascade delete");
                self.publish(StoreEvent::ChildDeleted(child));
            }
        }
    }
}

#[async_trait]
impl ResourceStore for LocalStore {
    async fn get_server(&self, key: &ObjectKey) -> Result<Option<KeystoneServer>, StoreError> {
        Ok(self.state.read().await.servers.get(key).cloned())
    }

    async fn list_servers(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<KeystoneServer>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .servers
            .values()
            .filter(|server| namespace.is_none_or(|ns| server.metadata.namespace == ns))
            .cloned()
            .collect())
    }

    #[instrument(skip(self, server), fields(key = %server.key()))]
    async fn apply_server(&self, mut server: KeystoneServer) -> Result<KeystoneServer, StoreError> {
        let key = server.key();
        let mut state = self.state.write().await;
        let version = state.next_version();

        let previous = state.servers.get(&key).cloned();
        if server.metadata.uid.is_empty() {
            server.metadata.uid = match &previous {
                Some(existing) => existing.metadata.uid.clone(),
                None => new_uid(),
            };
        }
        server.metadata.resource_version = version;

        self.persist(server_dir(), &key, &server)?;
        state.version = version;
        state.servers.insert(key, server.clone());
        debug!(version, "server applied");
        self.publish(StoreEvent::ServerApplied(server.clone()));

        // new instance under the same name, children of the old one go
        if let Some(previous) = previous {
            if previous.metadata.uid != server.metadata.uid {
                debug!(uid = %previous.metadata.uid, "server replaced");
                self.collect_children(&mut state, &previous.owner_reference());
            }
        }
        Ok(server)
    }

    #[instrument(skip(self))]
    async fn delete_server(&self, key: &ObjectKey) -> Result<Option<KeystoneServer>, StoreError> {
        let mut state = self.state.write().await;
        let Some(server) = state.servers.remove(key) else {
            return Ok(None);
        };
        self.unpersist(server_dir(), key);
        state.version = state.next_version();
        self.publish(StoreEvent::ServerDeleted(server.clone()));

        self.collect_children(&mut state, &server.owner_reference());
        Ok(Some(server))
    }

    async fn get_child(
        &self,
        kind: ChildKind,
        key: &ObjectKey,
    ) -> Result<Option<ManagedChild>, StoreError> {
        let state = self.state.read().await;
        Ok(state.children.get(&(kind, key.clone())).cloned())
    }

    async fn list_children(
        &self,
        kind: ChildKind,
        namespace: Option<&str>,
    ) -> Result<Vec<ManagedChild>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .children
            .iter()
            .filter(|((child_kind, key), _)| {
                *child_kind == kind && namespace.is_none_or(|ns| key.namespace == ns)
            })
            .map(|(_, child)| child.clone())
            .collect())
    }

    #[instrument(skip(self, child), fields(kind = %child.kind(), key = %child.key()))]
    async fn apply_if(
        &self,
        child: ManagedChild,
        field_owner: &str,
        force: bool,
        precondition: Precondition,
    ) -> Result<ApplyOutcome, StoreError> {
        let kind = child.kind();
        let key = child.key();
        let mut state = self.state.write().await;
        Self::ensure_owner_exists(&state, &child)?;

        let existing = state.children.get(&(kind, key.clone())).cloned();
        if !precondition.holds(existing.as_ref()) {
            debug!(?precondition, "stale write rejected");
            return Err(StoreError::Stale { kind, key });
        }
        let Some(existing) = existing else {
            self.write_child(&mut state, child, field_owner, new_uid())?;
            return Ok(ApplyOutcome::Created);
        };

        let manager = existing.metadata().field_manager.as_deref();
        if let Some(manager) = manager {
            if manager != field_owner && !force {
                return Err(StoreError::Conflict {
                    kind,
                    key,
                    manager: manager.to_owned(),
                });
            }
        }

        if manager == Some(field_owner) && existing.same_content(&child) {
            trace!("no change");
            return Ok(ApplyOutcome::Unchanged);
        }

        let uid = existing.metadata().uid.clone();
        self.write_child(&mut state, child, field_owner, uid)?;
        Ok(ApplyOutcome::Updated)
    }

    #[instrument(skip(self, child), fields(kind = %child.kind(), key = %child.key()))]
    async fn create(
        &self,
        child: ManagedChild,
        field_owner: &str,
    ) -> Result<ApplyOutcome, StoreError> {
        let kind = child.kind();
        let key = child.key();
        let mut state = self.state.write().await;
        Self::ensure_owner_exists(&state, &child)?;

        if state.children.contains_key(&(kind, key.clone())) {
            return Err(StoreError::AlreadyExists { kind, key });
        }

        self.write_child(&mut state, child, field_owner, new_uid())?;
        Ok(ApplyOutcome::Created)
    }

    #[instrument(skip(self))]
    async fn delete_child(
        &self,
        kind: ChildKind,
        key: &ObjectKey,
    ) -> Result<Option<ManagedChild>, StoreError> {
        let mut state = self.state.write().await;
        let removed = state.children.remove(&(kind, key.clone()));
        if let Some(child) = &removed {
            self.unpersist(child_dir(kind), key);
            state.version = state.next_version();
            self.publish(StoreEvent::ChildDeleted(child.clone()));
        }
        Ok(removed)
    }

    fn watch(&self) -> Receiver<StoreEvent> {
        let (sender, receiver) = unbounded();
        self.subscribers.lock().push(sender);
        receiver
    }
}

/// default namespace and name from the file location when the document leaves them out
fn fill_identity(namespace: &mut String, name: &mut String, file: &Path) {
    if name.is_empty() {
        if let Some(stem) = file.file_stem().and_then(OsStr::to_str) {
            *name = stem.to_owned();
        }
    }
    if namespace.is_empty() {
        if let Some(dir) = file
            .parent()
            .and_then(Path::file_name)
            .and_then(OsStr::to_str)
        {
            *namespace = dir.to_owned();
        }
    }
}

fn load_dir<T: DeserializeOwned>(dir: &Path) -> Result<Vec<(PathBuf, T)>, StoreError> {
    let mut items = vec![];
    if !dir.exists() {
        return Ok(items);
    }

    for namespace in read_dir(dir)? {
        if !namespace.is_dir() {
            continue;
        }
        for file in read_dir(&namespace)? {
            if !file.extension().eq(&Some(OsStr::new(YAML_EXTENSION))) {
                continue;
            }
            match load_file::<T>(&file) {
                Ok(item) => items.push((file, item)),
                Err(err) => warn!("skipped file: {err}"),
            }
        }
    }
    Ok(items)
}

fn read_dir(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let entries = std::fs::read_dir(dir).map_err(|source| StoreError::Io {
        path: dir.to_owned(),
        source,
    })?;
    Ok(entries
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .collect())
}

fn load_file<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let file = std::fs::File::open(path).map_err(|source| StoreError::Io {
        path: path.to_owned(),
        source,
    })?;
    serde_yaml::from_reader(file).map_err(|source| StoreError::Serialization {
        path: path.to_owned(),
        source,
    })
}

fn flush<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let io_error = |source| StoreError::Io {
        path: path.to_owned(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_error)?;
    }
    let file = std::fs::File::create(path).map_err(io_error)?;
    serde_yaml::to_writer(file, value).map_err(|source| StoreError::Serialization {
        path: path.to_owned(),
        source,
    })
}
