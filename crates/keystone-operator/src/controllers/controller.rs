//!
//! # Keystone controller
//!
//! Turns store changes into reconcile requests. A key is reconciled by at most
//! one task at a time; changes arriving while it runs are folded into one
//! follow up run. Retryable failures come back after an exponential backoff,
//! and every server is revisited on each resync.
//!
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use adaptive_backoff::prelude::{
    Backoff, BackoffBuilder, ExponentialBackoff, ExponentialBackoffBuilder,
};
use async_channel::{Receiver, Sender, unbounded};
use fluvio_future::task::spawn;
use fluvio_future::timer::sleep;
use futures_util::StreamExt;
use tracing::{debug, error, info, instrument, trace, warn};

use keystone_metadata::{ChildKind, ObjectKey};

use crate::config::OperatorConfig;
use crate::core::{CancelEvent, CancelReason, CancelRegistry, SharedContext};
use crate::error::{ReconcileFailure, StoreError};
use crate::stores::{ResourceStore, StoreEvent};

use super::owner_index::controller_owner;
use super::reconciler::{Action, Reconciler};

const BACKOFF_FACTOR: f64 = 2.0;

struct Completion {
    key: ObjectKey,
    result: Result<Action, ReconcileFailure>,
}

pub struct KeystoneController<C> {
    ctx: SharedContext<C>,
    reconciler: Arc<Reconciler<C>>,
    in_flight: CancelRegistry,
    /// changed while in flight
    dirty: HashSet<ObjectKey>,
    /// over the concurrency limit
    waiting: VecDeque<ObjectKey>,
    backoffs: HashMap<ObjectKey, ExponentialBackoff>,
    done_sender: Sender<Completion>,
    done_receiver: Receiver<Completion>,
    retry_sender: Sender<ObjectKey>,
    retry_receiver: Receiver<ObjectKey>,
}

impl<C> KeystoneController<C>
where
    C: ResourceStore + 'static,
{
    /// Spawn the controller; firing the returned event stops it.
    ///
    /// The event also fires once the controller stopped on its own.
    pub fn start(ctx: SharedContext<C>) -> Arc<CancelEvent> {
        let shutdown = CancelEvent::shared();
        let controller = Self::new(ctx);
        spawn(controller.dispatch_loop(shutdown.clone()));
        shutdown
    }

    fn new(ctx: SharedContext<C>) -> Self {
        let (done_sender, done_receiver) = unbounded();
        let (retry_sender, retry_receiver) = unbounded();
        Self {
            reconciler: Arc::new(Reconciler::new(ctx.clone())),
            ctx,
            in_flight: CancelRegistry::default(),
            dirty: HashSet::new(),
            waiting: VecDeque::new(),
            backoffs: HashMap::new(),
            done_sender,
            done_receiver,
            retry_sender,
            retry_receiver,
        }
    }

    async fn dispatch_loop(mut self, shutdown: Arc<CancelEvent>) {
        loop {
            match self.inner_loop(&shutdown).await {
                Ok(()) => break,
                Err(err) => {
                    error!("error with keystone controller loop: {err}");
                    if shutdown.is_cancelled() {
                        break;
                    }
                    let wait = self.ctx.config().backoff_max;
                    debug!(?wait, "sleeping before restarting loop");
                    sleep(wait).await;
                }
            }
        }

        self.in_flight.cancel_all(CancelReason::Shutdown);
        shutdown.cancel();
        info!("keystone controller stopped");
    }

    #[instrument(skip(self, shutdown), name = "KeystoneController")]
    async fn inner_loop(&mut self, shutdown: &CancelEvent) -> Result<(), StoreError> {
        use tokio::select;

        // subscribe first so nothing between the initial listing and the loop is missed
        let events = self.ctx.store().watch();
        let done = self.done_receiver.clone();
        let retries = self.retry_receiver.clone();

        self.sync_index().await?;
        self.enqueue_all().await?;

        let resync_period = self.ctx.config().resync_period();
        let mut next_resync = resync_deadline(resync_period);

        loop {
            let until_resync = next_resync.saturating_duration_since(Instant::now());
            select! {
                _ = shutdown.cancelled() => {
                    debug!("shutdown requested");
                    return Ok(());
                },
                event = events.recv() => {
                    match event {
                        Ok(event) => self.handle_event(event),
                        Err(_) => {
                            info!("store change stream closed");
                            return Ok(());
                        }
                    }
                },
                completion = done.recv() => {
                    if let Ok(completion) = completion {
                        self.complete(completion);
                    }
                },
                key = retries.recv() => {
                    if let Ok(key) = key {
                        debug!(%key, "retrying");
                        self.enqueue(key);
                    }
                },
                _ = sleep(until_resync) => {
                    debug!("resync");
                    self.enqueue_all().await?;
                    next_resync = resync_deadline(resync_period);
                }
            }
        }
    }

    fn config(&self) -> &OperatorConfig {
        self.ctx.config()
    }

    fn in_scope(&self, namespace: &str) -> bool {
        self.config()
            .namespace
            .as_deref()
            .is_none_or(|scope| scope == namespace)
    }

    async fn sync_index(&self) -> Result<(), StoreError> {
        let namespace = self.config().namespace.as_deref();
        for kind in ChildKind::ALL {
            if !self.ctx.index().is_indexed(kind) {
                continue;
            }
            let children = self.ctx.store().list_children(kind, namespace).await?;
            debug!(%kind, count = children.len(), "initial index sync");
            for child in children {
                self.ctx.index().observe(&child);
            }
        }
        Ok(())
    }

    async fn enqueue_all(&mut self) -> Result<(), StoreError> {
        let namespace = self.config().namespace.clone();
        let servers = self.ctx.store().list_servers(namespace.as_deref()).await?;
        trace!(count = servers.len(), "enqueue all");
        for server in servers {
            self.enqueue(server.key());
        }
        Ok(())
    }

    fn handle_event(&mut self, event: StoreEvent) {
        match event {
            StoreEvent::ServerApplied(server) => {
                if self.in_scope(&server.metadata.namespace) {
                    self.enqueue(server.key());
                }
            }
            StoreEvent::ServerDeleted(server) => {
                let key = server.key();
                if self.in_flight.cancel(&key, CancelReason::ServerDeleted) {
                    debug!(%key, "server deleted, cancelling reconcile");
                }
                self.dirty.remove(&key);
                self.waiting.retain(|waiting| waiting != &key);
                self.backoffs.remove(&key);
            }
            StoreEvent::ChildApplied(child) => {
                if !self.in_scope(&child.metadata().namespace) {
                    return;
                }
                self.ctx.index().observe(&child);
                if let Some(owner) = controller_owner(&child) {
                    self.enqueue(ObjectKey::new(child.metadata().namespace.clone(), owner));
                }
            }
            StoreEvent::ChildDeleted(child) => {
                if !self.in_scope(&child.metadata().namespace) {
                    return;
                }
                let indexed = self.ctx.index().forget(child.kind(), &child.key());
                let owner = indexed.or_else(|| {
                    controller_owner(&child)
                        .map(|owner| ObjectKey::new(child.metadata().namespace.clone(), owner))
                });
                if let Some(owner) = owner {
                    self.enqueue(owner);
                }
            }
        }
    }

    fn enqueue(&mut self, key: ObjectKey) {
        if self.in_flight.contains(&key) {
            trace!(%key, "in flight, marking dirty");
            self.dirty.insert(key);
            return;
        }
        if self.in_flight.len() >= self.config().max_concurrent {
            if !self.waiting.contains(&key) {
                self.waiting.push_back(key);
            }
            return;
        }

        let cancel = self.in_flight.register(key.clone());

        let reconciler = self.reconciler.clone();
        let done = self.done_sender.clone();
        spawn(async move {
            let result = reconciler.reconcile(&key, &cancel).await;
            if let Err(err) = done.send(Completion { key, result }).await {
                trace!("controller gone: {err}");
            }
        });
    }

    fn complete(&mut self, completion: Completion) {
        let Completion { key, result } = completion;
        self.in_flight.release(&key);

        match result {
            Ok(action) => {
                self.backoffs.remove(&key);
                if action.requeue {
                    self.dirty.insert(key.clone());
                }
            }
            Err(failure) if failure.is_retryable() && !self.dirty.contains(&key) => {
                let wait = self.retry_delay(&key);
                warn!(%failure, ?wait, "reconcile failed, retrying");
                let retries = self.retry_sender.clone();
                let retry_key = key.clone();
                spawn(async move {
                    sleep(wait).await;
                    if let Err(err) = retries.send(retry_key).await {
                        trace!("controller gone: {err}");
                    }
                });
            }
            Err(failure) => {
                error!(%failure, "reconcile failed");
                self.backoffs.remove(&key);
            }
        }

        if self.dirty.remove(&key) {
            self.enqueue(key);
        }
        while self.in_flight.len() < self.config().max_concurrent {
            let Some(next) = self.waiting.pop_front() else {
                break;
            };
            self.enqueue(next);
        }
    }

    fn retry_delay(&mut self, key: &ObjectKey) -> Duration {
        if let Some(backoff) = self.backoffs.get_mut(key) {
            return backoff.wait();
        }
        match create_backoff(self.config()) {
            Ok(mut backoff) => {
                let wait = backoff.wait();
                self.backoffs.insert(key.clone(), backoff);
                wait
            }
            Err(err) => {
                warn!("unable to create backoff: {err}");
                self.config().backoff_max
            }
        }
    }
}

const FALLBACK_RESYNC: Duration = Duration::from_secs(3600);

fn resync_deadline(period: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(period)
        .unwrap_or_else(|| now + FALLBACK_RESYNC)
}

fn create_backoff(config: &OperatorConfig) -> anyhow::Result<ExponentialBackoff> {
    ExponentialBackoffBuilder::default()
        .factor(BACKOFF_FACTOR)
        .min(config.backoff_min)
        .max(config.backoff_max)
        .build()
}

/// Reconcile every server once, at most `max_concurrent` at a time.
pub async fn reconcile_all<C>(
    ctx: SharedContext<C>,
) -> Result<Vec<(ObjectKey, Result<Action, ReconcileFailure>)>, StoreError>
where
    C: ResourceStore + 'static,
{
    let namespace = ctx.config().namespace.as_deref();
    for kind in ChildKind::ALL {
        if ctx.index().is_indexed(kind) {
            for child in ctx.store().list_children(kind, namespace).await? {
                ctx.index().observe(&child);
            }
        }
    }

    let servers = ctx.store().list_servers(namespace).await?;
    let reconciler = Reconciler::new(ctx.clone());
    let reconciler = &reconciler;

    let results = futures_util::stream::iter(servers)
        .map(|server| async move {
            let key = server.key();
            let cancel = CancelEvent::default();
            let result = reconciler.reconcile(&key, &cancel).await;
            (key, result)
        })
        .buffer_unordered(ctx.config().max_concurrent)
        .collect::<Vec<_>>()
        .await;

    Ok(results)
}

#[cfg(test)]
mod test {

    use std::time::Duration;

    use async_trait::async_trait;
    use fluvio_future::timer::sleep;

    use keystone_config::keystone_defaults;
    use keystone_metadata::{KeystoneServer, ManagedChild};

    use crate::core::Context;
    use crate::stores::{ApplyOutcome, LocalStore, Precondition};

    use super::*;

    /// store whose change stream is already closed
    struct ClosedWatchStore {
        inner: LocalStore,
    }

    #[async_trait]
    impl ResourceStore for ClosedWatchStore {
        async fn get_server(&self, key: &ObjectKey) -> Result<Option<KeystoneServer>, StoreError> {
            self.inner.get_server(key).await
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
            self.inner.get_child(kind, key).await
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
            let (_, receiver) = unbounded();
            receiver
        }
    }

    #[fluvio_future::test]
    async fn test_closed_change_stream_stops_controller() {
        let store = Arc::new(ClosedWatchStore {
            inner: LocalStore::memory(),
        });
        let ctx = Context::shared(store, OperatorConfig::default(), keystone_defaults());
        let shutdown = KeystoneController::start(ctx);

        for _ in 0..200 {
            if shutdown.is_cancelled() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(shutdown.reason(), Some(CancelReason::Shutdown));
        // waiters such as the cli return
        shutdown.cancelled().await;
    }

    #[test]
    fn test_resync_deadline_does_not_overflow() {
        let now = Instant::now();
        let deadline = resync_deadline(Duration::MAX);
        assert!(deadline > now);
        assert!(deadline <= Instant::now() + FALLBACK_RESYNC);

        let deadline = resync_deadline(Duration::from_millis(50));
        assert!(deadline >= now + Duration::from_millis(50));
    }
}
