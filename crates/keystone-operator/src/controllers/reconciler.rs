//!
//! # Reconciler
//!
//! One reconcile drives the ConfigMap and Deployment of a single
//! `KeystoneServer` toward its desired state:
//!
//! ```text
//! Fetching -> BuildDesired -> ApplyConfig -> ApplyWorkload -> Done
//! ```
//!
//! Any phase may fail; running again from the start after a failure is safe.
//! Retries are left to the caller.
//!
use std::fmt;
use std::future::Future;

use fluvio_future::timer::sleep;
use tracing::{debug, info, instrument, trace};

use keystone_metadata::{ChildKind, KeystoneServer, ManagedChild, ObjectKey};

use crate::config::ApplyMode;
use crate::core::{CancelEvent, SharedContext};
use crate::error::{ReconcileError, ReconcileFailure, StoreError};
use crate::stores::{ApplyOutcome, Precondition, ResourceStore};

use super::desired::{DesiredState, ValidatedSpec};
use super::owner_index::ChildRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Fetching,
    BuildDesired,
    ApplyConfig,
    ApplyWorkload,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetching => write!(f, "Fetching"),
            Self::BuildDesired => write!(f, "BuildDesired"),
            Self::ApplyConfig => write!(f, "ApplyConfig"),
            Self::ApplyWorkload => write!(f, "ApplyWorkload"),
            Self::Done => write!(f, "Done"),
        }
    }
}

/// outcome of a successful reconcile
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Action {
    pub requeue: bool,
    /// writes performed, in apply order; empty when the server no longer exists
    pub applied: Vec<(ChildKind, ApplyOutcome)>,
}

impl Action {
    /// true if no write changed anything
    pub fn is_unchanged(&self) -> bool {
        self.applied
            .iter()
            .all(|(_, outcome)| *outcome == ApplyOutcome::Unchanged)
    }
}

fn failed(key: &ObjectKey, phase: Phase) -> impl FnOnce(ReconcileError) -> ReconcileFailure + '_ {
    move |source| ReconcileFailure {
        key: key.clone(),
        phase,
        source,
    }
}

pub struct Reconciler<C> {
    ctx: SharedContext<C>,
}

impl<C> fmt::Debug for Reconciler<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reconciler")
    }
}

impl<C> Reconciler<C>
where
    C: ResourceStore,
{
    pub fn new(ctx: SharedContext<C>) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self, cancel), fields(key = %key))]
    pub async fn reconcile(
        &self,
        key: &ObjectKey,
        cancel: &CancelEvent,
    ) -> Result<Action, ReconcileFailure> {
        let store = self.ctx.store();

        let server = self
            .bounded(cancel, store.get_server(key))
            .await
            .map_err(failed(key, Phase::Fetching))?;
        let Some(server) = server else {
            debug!("server not found, nothing to reconcile");
            return Ok(Action::default());
        };

        let desired = self
            .build_desired(&server)
            .map_err(failed(key, Phase::BuildDesired))?;

        let mut action = Action::default();

        let outcome = self
            .apply_child(&server, desired.config_map_child(), cancel)
            .await
            .map_err(failed(key, Phase::ApplyConfig))?;
        action.applied.push((ChildKind::ConfigMap, outcome));

        let outcome = self
            .apply_workload(&server, desired.deployment_child(), cancel)
            .await
            .map_err(failed(key, Phase::ApplyWorkload))?;
        action.applied.push((ChildKind::Deployment, outcome));

        if action.is_unchanged() {
            debug!(phase = %Phase::Done, "in sync");
        } else {
            info!(phase = %Phase::Done, applied = ?action.applied, "reconciled");
        }
        Ok(action)
    }

    fn build_desired(&self, server: &KeystoneServer) -> Result<DesiredState, ReconcileError> {
        let spec = ValidatedSpec::validate(server, self.ctx.config())?;
        self.ctx.builder().build(&spec)
    }

    /// check the index before touching the workload
    async fn apply_workload(
        &self,
        server: &KeystoneServer,
        desired: ManagedChild,
        cancel: &CancelEvent,
    ) -> Result<ApplyOutcome, ReconcileError> {
        let owner = server.key();
        let child = ChildRef::from(&desired);

        let known = self.ctx.index().lookup(&owner.namespace, &owner.name);
        if !known.contains(&child) {
            if let Some(other) = self.ctx.index().owner_of(&child) {
                return Err(ReconcileError::AdoptionConflict {
                    kind: child.kind,
                    key: child.key,
                    owner: other.to_string(),
                });
            }
        }

        self.apply_child(server, desired, cancel).await
    }

    async fn apply_child(
        &self,
        server: &KeystoneServer,
        desired: ManagedChild,
        cancel: &CancelEvent,
    ) -> Result<ApplyOutcome, ReconcileError> {
        let store = self.ctx.store();
        let config = self.ctx.config();
        let child = ChildRef::from(&desired);

        let existing = self
            .bounded(cancel, store.get_child(child.kind, &child.key))
            .await?;
        if let Some(existing) = &existing {
            ensure_adoptable(server, existing)?;
        }

        let outcome = match config.apply_mode {
            // a write landing after the adoption check fails as stale
            ApplyMode::Apply { force_ownership } => {
                let precondition = Precondition::observed(existing.as_ref());
                self.bounded(
                    cancel,
                    store.apply_if(desired, &config.field_owner, force_ownership, precondition),
                )
                .await?
            }
            ApplyMode::Create if existing.is_some() => ApplyOutcome::Unchanged,
            ApplyMode::Create => {
                match self
                    .bounded(cancel, store.create(desired, &config.field_owner))
                    .await
                {
                    // lost a race with another writer of the same owner
                    Err(ReconcileError::TransientStore(StoreError::AlreadyExists { .. })) => {
                        ApplyOutcome::Unchanged
                    }
                    result => result?,
                }
            }
        };

        trace!(kind = %child.kind, key = %child.key, %outcome, "applied");
        self.ctx.index().record(&server.key(), child);
        Ok(outcome)
    }

    /// run a store call bounded by the apply timeout and the cancel event
    async fn bounded<T, F>(&self, cancel: &CancelEvent, call: F) -> Result<T, ReconcileError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        use tokio::select;

        if cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled);
        }

        let timeout = self.ctx.config().apply_timeout;
        select! {
            result = call => result.map_err(ReconcileError::from),
            _ = sleep(timeout) => Err(StoreError::Timeout(timeout).into()),
            _ = cancel.cancelled() => Err(ReconcileError::Cancelled),
        }
    }
}

/// existing object must be unowned or controlled by this server instance
fn ensure_adoptable(server: &KeystoneServer, existing: &ManagedChild) -> Result<(), ReconcileError> {
    match existing.metadata().controller() {
        Some(controller) if !controller.is_same_owner(&server.owner_reference()) => {
            Err(ReconcileError::AdoptionConflict {
                kind: existing.kind(),
                key: existing.key(),
                owner: controller.to_string(),
            })
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod test {

    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_channel::Receiver;
    use async_trait::async_trait;

    use keystone_config::{IniConfig, keystone_defaults};
    use keystone_metadata::{
        ConfigMap, Deployment, KeystoneServerSpec, ObjectMeta, OwnerReference,
    };

    use crate::config::OperatorConfig;
    use crate::core::Context;
    use crate::error::ValidationError;
    use crate::stores::{LocalStore, StoreEvent};

    use super::*;

    fn spec(image: &str, replicas: Option<i32>) -> KeystoneServerSpec {
        KeystoneServerSpec {
            image: image.to_owned(),
            replicas,
            config: IniConfig::new().with("token", "expiration", "99999"),
            ..Default::default()
        }
    }

    fn setup(config: OperatorConfig) -> (Arc<LocalStore>, Reconciler<LocalStore>) {
        let store = Arc::new(LocalStore::memory());
        let ctx = Context::shared(store.clone(), config, keystone_defaults());
        (store, Reconciler::new(ctx))
    }

    async fn add_server(store: &LocalStore, name: &str, spec: KeystoneServerSpec) -> KeystoneServer {
        store
            .apply_server(KeystoneServer::new(name, "ns1", spec))
            .await
            .expect("server")
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("ns1", name)
    }

    #[fluvio_future::test]
    async fn test_missing_server_is_noop() {
        let (store, reconciler) = setup(OperatorConfig::default());

        let action = reconciler
            .reconcile(&key("abc"), &CancelEvent::default())
            .await
            .expect("reconcile");

        assert_eq!(action, Action::default());
        assert_eq!(store.version().await, 0);
    }

    #[fluvio_future::test]
    async fn test_reconcile_creates_children() {
        let (store, reconciler) = setup(OperatorConfig::default());
        let server = add_server(&store, "abc", spec("img:tag", Some(3))).await;

        let action = reconciler
            .reconcile(&key("abc"), &CancelEvent::default())
            .await
            .expect("reconcile");
        assert_eq!(
            action.applied,
            vec![
                (ChildKind::ConfigMap, ApplyOutcome::Created),
                (ChildKind::Deployment, ApplyOutcome::Created)
            ]
        );
        assert!(!action.requeue);

        let deployment = store
            .get_child(ChildKind::Deployment, &key("abc"))
            .await
            .expect("get")
            .expect("deployment");
        let ManagedChild::Deployment(deployment) = deployment else {
            panic!("wrong kind");
        };
        assert_eq!(deployment.spec.replicas, 3);
        assert_eq!(deployment.spec.template.containers[0].image, "img:tag");
        assert_eq!(
            deployment.metadata.controller(),
            Some(&server.owner_reference())
        );
        assert_eq!(
            deployment.metadata.field_manager.as_deref(),
            Some("keystone-server")
        );

        let indexed = reconciler.ctx.index().lookup("ns1", "abc");
        assert!(indexed.contains(&ChildRef::new(ChildKind::Deployment, key("abc"))));
    }

    #[fluvio_future::test]
    async fn test_reconcile_is_idempotent() {
        let (store, reconciler) = setup(OperatorConfig::default());
        add_server(&store, "abc", spec("img:tag", None)).await;
        let cancel = CancelEvent::default();

        reconciler.reconcile(&key("abc"), &cancel).await.expect("first");
        let version = store.version().await;

        let action = reconciler
            .reconcile(&key("abc"), &cancel)
            .await
            .expect("second");

        assert_eq!(action.applied.len(), 2);
        assert!(action.is_unchanged());
        assert_eq!(store.version().await, version);
    }

    #[fluvio_future::test]
    async fn test_spec_change_updates_children() {
        let (store, reconciler) = setup(OperatorConfig::default());
        add_server(&store, "abc", spec("img:1", Some(1))).await;
        let cancel = CancelEvent::default();
        reconciler.reconcile(&key("abc"), &cancel).await.expect("first");

        let mut server = store
            .get_server(&key("abc"))
            .await
            .expect("get")
            .expect("server");
        server.spec.image = "img:2".to_owned();
        store.apply_server(server).await.expect("update");

        let action = reconciler
            .reconcile(&key("abc"), &cancel)
            .await
            .expect("second");
        assert_eq!(
            action.applied,
            vec![
                (ChildKind::ConfigMap, ApplyOutcome::Unchanged),
                (ChildKind::Deployment, ApplyOutcome::Updated)
            ]
        );
    }

    #[fluvio_future::test]
    async fn test_validation_failure() {
        let (store, reconciler) = setup(OperatorConfig::default());
        add_server(&store, "abc", spec("img:tag", Some(-2))).await;

        let failure = reconciler
            .reconcile(&key("abc"), &CancelEvent::default())
            .await
            .expect_err("invalid");

        assert_eq!(failure.phase, Phase::BuildDesired);
        assert!(matches!(
            failure.source,
            ReconcileError::Validation(ValidationError::NegativeReplicas(-2))
        ));
        assert!(!failure.is_retryable());
        assert!(
            store
                .list_children(ChildKind::ConfigMap, None)
                .await
                .expect("list")
                .is_empty()
        );
    }

    #[fluvio_future::test]
    async fn test_workload_owned_by_other_server() {
        let (store, reconciler) = setup(OperatorConfig::default());
        add_server(&store, "abc", spec("img:tag", Some(1))).await;
        let other = add_server(&store, "xyz", spec("other:img", Some(5))).await;

        let foreign = Deployment {
            metadata: ObjectMeta::new("abc", "ns1").with_owner(other.owner_reference()),
            ..Default::default()
        };
        store
            .apply(foreign.clone().into(), "keystone-server", true)
            .await
            .expect("apply");
        reconciler
            .ctx
            .index()
            .observe(&ManagedChild::from(foreign.clone()));

        let failure = reconciler
            .reconcile(&key("abc"), &CancelEvent::default())
            .await
            .expect_err("conflict");

        assert_eq!(failure.phase, Phase::ApplyWorkload);
        assert!(matches!(
            &failure.source,
            ReconcileError::AdoptionConflict { kind: ChildKind::Deployment, owner, .. } if owner == "ns1/xyz"
        ));
        assert!(!failure.is_retryable());

        let stored = store
            .get_child(ChildKind::Deployment, &key("abc"))
            .await
            .expect("get")
            .expect("deployment");
        assert!(stored.same_content(&foreign.into()));
    }

    #[fluvio_future::test]
    async fn test_config_map_owned_by_other_server() {
        let (store, reconciler) = setup(OperatorConfig::default());
        add_server(&store, "abc", spec("img:tag", Some(1))).await;
        let other = add_server(&store, "xyz", spec("img:tag", Some(1))).await;

        let foreign = ConfigMap {
            metadata: ObjectMeta::new("abc", "ns1").with_owner(other.owner_reference()),
            ..Default::default()
        };
        store
            .apply(foreign.into(), "keystone-server", true)
            .await
            .expect("apply");

        let failure = reconciler
            .reconcile(&key("abc"), &CancelEvent::default())
            .await
            .expect_err("conflict");

        assert_eq!(failure.phase, Phase::ApplyConfig);
        assert!(matches!(
            failure.source,
            ReconcileError::AdoptionConflict {
                kind: ChildKind::ConfigMap,
                ..
            }
        ));
        assert!(
            store
                .get_child(ChildKind::Deployment, &key("abc"))
                .await
                .expect("get")
                .is_none()
        );
    }

    #[test]
    fn test_stale_uid_is_conflict() {
        let mut server = KeystoneServer::new("abc", "ns1", spec("img:tag", Some(1)));
        server.metadata.uid = "current".to_owned();

        let stale = OwnerReference {
            uid: "previous-instance".to_owned(),
            ..server.owner_reference()
        };
        let left_over: ManagedChild = Deployment {
            metadata: ObjectMeta::new("abc", "ns1").with_owner(stale),
            ..Default::default()
        }
        .into();
        assert!(matches!(
            ensure_adoptable(&server, &left_over),
            Err(ReconcileError::AdoptionConflict { .. })
        ));

        let own: ManagedChild = Deployment {
            metadata: ObjectMeta::new("abc", "ns1").with_owner(server.owner_reference()),
            ..Default::default()
        }
        .into();
        assert!(ensure_adoptable(&server, &own).is_ok());
    }

    #[fluvio_future::test]
    async fn test_unowned_workload_is_adopted() {
        let (store, reconciler) = setup(OperatorConfig::default());
        let server = add_server(&store, "abc", spec("img:tag", Some(1))).await;
        let orphan = Deployment {
            metadata: ObjectMeta::new("abc", "ns1"),
            ..Default::default()
        };
        store
            .apply(orphan.into(), "someone-else", true)
            .await
            .expect("apply");

        let action = reconciler
            .reconcile(&key("abc"), &CancelEvent::default())
            .await
            .expect("reconcile");
        assert_eq!(action.applied[1], (ChildKind::Deployment, ApplyOutcome::Updated));

        let adopted = store
            .get_child(ChildKind::Deployment, &key("abc"))
            .await
            .expect("get")
            .expect("deployment");
        assert_eq!(
            adopted.metadata().controller(),
            Some(&server.owner_reference())
        );
    }

    #[fluvio_future::test]
    async fn test_unforced_apply_conflict_is_retryable() {
        let config = OperatorConfig {
            apply_mode: ApplyMode::Apply {
                force_ownership: false,
            },
            ..Default::default()
        };
        let (store, reconciler) = setup(config);
        add_server(&store, "abc", spec("img:tag", Some(1))).await;
        let orphan = ConfigMap {
            metadata: ObjectMeta::new("abc", "ns1"),
            ..Default::default()
        };
        store
            .apply(orphan.into(), "someone-else", true)
            .await
            .expect("apply");

        let failure = reconciler
            .reconcile(&key("abc"), &CancelEvent::default())
            .await
            .expect_err("conflict");
        assert_eq!(failure.phase, Phase::ApplyConfig);
        assert!(matches!(
            failure.source,
            ReconcileError::TransientStore(StoreError::Conflict { .. })
        ));
        assert!(failure.is_retryable());
    }

    #[fluvio_future::test]
    async fn test_create_mode_leaves_existing_objects() {
        let config = OperatorConfig {
            apply_mode: ApplyMode::Create,
            ..Default::default()
        };
        let (store, reconciler) = setup(config);
        add_server(&store, "abc", spec("img:1", Some(1))).await;
        let cancel = CancelEvent::default();

        let action = reconciler.reconcile(&key("abc"), &cancel).await.expect("first");
        assert!(
            action
                .applied
                .iter()
                .all(|(_, outcome)| *outcome == ApplyOutcome::Created)
        );

        let mut server = store
            .get_server(&key("abc"))
            .await
            .expect("get")
            .expect("server");
        server.spec.image = "img:2".to_owned();
        store.apply_server(server).await.expect("update");

        let action = reconciler.reconcile(&key("abc"), &cancel).await.expect("second");
        assert!(action.is_unchanged());

        let ManagedChild::Deployment(deployment) = store
            .get_child(ChildKind::Deployment, &key("abc"))
            .await
            .expect("get")
            .expect("deployment")
        else {
            panic!("wrong kind");
        };
        assert_eq!(deployment.spec.template.containers[0].image, "img:1");
    }

    #[fluvio_future::test]
    async fn test_cancelled_before_start() {
        let (store, reconciler) = setup(OperatorConfig::default());
        add_server(&store, "abc", spec("img:tag", Some(1))).await;
        let cancel = CancelEvent::default();
        cancel.cancel();

        let failure = reconciler
            .reconcile(&key("abc"), &cancel)
            .await
            .expect_err("cancelled");

        assert_eq!(failure.phase, Phase::Fetching);
        assert!(matches!(failure.source, ReconcileError::Cancelled));
        assert!(failure.is_retryable());
    }

    /// what the wrapped store does besides serving a call
    enum Interference {
        /// server reads never complete
        StallServerReads,
        /// server is deleted right after it was read
        DeleteServerAfterRead,
        /// another writer replaces the child right after it was read
        WriteAfterChildRead(ManagedChild),
    }

    struct InterferingStore {
        inner: Arc<LocalStore>,
        interference: Interference,
        fired: AtomicBool,
    }

    impl InterferingStore {
        fn once(&self) -> bool {
            !self.fired.swap(true, Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ResourceStore for InterferingStore {
        async fn get_server(&self, key: &ObjectKey) -> Result<Option<KeystoneServer>, StoreError> {
            match &self.interference {
                Interference::StallServerReads => {
                    sleep(Duration::from_secs(3600)).await;
                    Ok(None)
                }
                Interference::DeleteServerAfterRead => {
                    let server = self.inner.get_server(key).await?;
                    if self.once() {
                        self.inner.delete_server(key).await?;
                    }
                    Ok(server)
                }
                Interference::WriteAfterChildRead(_) => self.inner.get_server(key).await,
            }
        }

        async fn list_servers(
            &self,
            namespace: Option<&str>,
        ) -> Result<Vec<KeystoneServer>, StoreError> {
            self.inner.list_servers(namespace).await
        }

        async fn apply_server(
            &self,
            server: KeystoneServer,
        ) -> Result<KeystoneServer, StoreError> {
            self.inner.apply_server(server).await
        }

        async fn delete_server(
            &self,
            key: &ObjectKey,
        ) -> Result<Option<KeystoneServer>, StoreError> {
            self.inner.delete_server(key).await
        }

        async fn get_child(
            &self,
            kind: ChildKind,
            key: &ObjectKey,
        ) -> Result<Option<ManagedChild>, StoreError> {
            let existing = self.inner.get_child(kind, key).await?;
            if let Interference::WriteAfterChildRead(intruder) = &self.interference {
                if intruder.kind() == kind && self.once() {
                    self.inner.apply(intruder.clone(), "intruder", true).await?;
                }
            }
            Ok(existing)
        }

        async fn list_children(
            &self,
            kind: ChildKind,
            namespace: Option<&str>,
        ) -> Result<Vec<ManagedChild>, StoreError> {
            self.inner.list_children(kind, namespace).await
        }

        async fn apply_if(
            &self,
            child: ManagedChild,
            field_owner: &str,
            force: bool,
            precondition: Precondition,
        ) -> Result<ApplyOutcome, StoreError> {
            self.inner
                .apply_if(child, field_owner, force, precondition)
                .await
        }

        async fn create(
            &self,
            child: ManagedChild,
            field_owner: &str,
        ) -> Result<ApplyOutcome, StoreError> {
            self.inner.create(child, field_owner).await
        }

        async fn delete_child(
            &self,
            kind: ChildKind,
            key: &ObjectKey,
        ) -> Result<Option<ManagedChild>, StoreError> {
            self.inner.delete_child(kind, key).await
        }

        fn watch(&self) -> Receiver<StoreEvent> {
            self.inner.watch()
        }
    }

    fn interfering(
        inner: Arc<LocalStore>,
        interference: Interference,
        config: OperatorConfig,
    ) -> Reconciler<InterferingStore> {
        let store = Arc::new(InterferingStore {
            inner,
            interference,
            fired: AtomicBool::new(false),
        });
        Reconciler::new(Context::shared(store, config, keystone_defaults()))
    }

    fn stalled(config: OperatorConfig) -> Reconciler<InterferingStore> {
        interfering(
            Arc::new(LocalStore::memory()),
            Interference::StallServerReads,
            config,
        )
    }

    #[fluvio_future::test]
    async fn test_store_call_times_out() {
        let reconciler = stalled(OperatorConfig {
            apply_timeout: Duration::from_millis(20),
            ..Default::default()
        });

        let failure = reconciler
            .reconcile(&key("abc"), &CancelEvent::default())
            .await
            .expect_err("timeout");

        assert_eq!(failure.phase, Phase::Fetching);
        assert!(matches!(
            failure.source,
            ReconcileError::TransientStore(StoreError::Timeout(_))
        ));
        assert!(failure.is_retryable());
    }

    #[fluvio_future::test]
    async fn test_cancel_interrupts_store_call() {
        let reconciler = stalled(OperatorConfig::default());
        let cancel = CancelEvent::shared();

        let trigger = cancel.clone();
        fluvio_future::task::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let failure = reconciler
            .reconcile(&key("abc"), &cancel)
            .await
            .expect_err("cancelled");
        assert!(matches!(failure.source, ReconcileError::Cancelled));
    }

    #[fluvio_future::test]
    async fn test_server_deleted_between_fetch_and_apply() {
        let store = Arc::new(LocalStore::memory());
        add_server(&store, "abc", spec("img:tag", Some(1))).await;
        let reconciler = interfering(
            store.clone(),
            Interference::DeleteServerAfterRead,
            OperatorConfig::default(),
        );
        let cancel = CancelEvent::default();

        let failure = reconciler
            .reconcile(&key("abc"), &cancel)
            .await
            .expect_err("owner gone");
        assert_eq!(failure.phase, Phase::ApplyConfig);
        assert!(matches!(
            failure.source,
            ReconcileError::TransientStore(StoreError::OwnerGone { .. })
        ));
        assert!(failure.is_retryable());

        // retry sees the deletion, nothing was left behind
        let action = reconciler.reconcile(&key("abc"), &cancel).await.expect("retry");
        assert!(action.applied.is_empty());
        for kind in ChildKind::ALL {
            assert!(store.list_children(kind, None).await.expect("list").is_empty());
        }
    }

    #[fluvio_future::test]
    async fn test_write_after_adoption_check_is_not_overwritten() {
        let store = Arc::new(LocalStore::memory());
        add_server(&store, "abc", spec("img:tag", Some(1))).await;
        let other = add_server(&store, "xyz", spec("other:img", Some(5))).await;

        let foreign = ConfigMap {
            metadata: ObjectMeta::new("abc", "ns1").with_owner(other.owner_reference()),
            ..Default::default()
        };
        let reconciler = interfering(
            store.clone(),
            Interference::WriteAfterChildRead(foreign.clone().into()),
            OperatorConfig::default(),
        );
        let cancel = CancelEvent::default();

        let failure = reconciler
            .reconcile(&key("abc"), &cancel)
            .await
            .expect_err("stale");
        assert_eq!(failure.phase, Phase::ApplyConfig);
        assert!(matches!(
            failure.source,
            ReconcileError::TransientStore(StoreError::Stale { .. })
        ));
        assert!(failure.is_retryable());

        let stored = store
            .get_child(ChildKind::ConfigMap, &key("abc"))
            .await
            .expect("get")
            .expect("config map");
        assert_eq!(
            stored.metadata().controller(),
            Some(&other.owner_reference())
        );
        assert!(stored.same_content(&foreign.into()));

        // retry reads the new owner and reports the conflict
        let failure = reconciler
            .reconcile(&key("abc"), &cancel)
            .await
            .expect_err("conflict");
        assert!(matches!(
            failure.source,
            ReconcileError::AdoptionConflict {
                kind: ChildKind::ConfigMap,
                ..
            }
        ));
    }
}
