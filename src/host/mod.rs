//! Host runtime
//!
//! Loads interceptor versions, delivers their lifecycle events, tracks the
//! open client contexts and routes each client's requests either through the
//! controlling instance or, for uncontrolled clients, straight to the
//! network.
//!
//! Lifecycle events are serialized: at most one install/activate sequence is
//! in flight at a time. Fetches are not serialized and never hold a lock
//! across an await.

mod events;

pub use events::{HostEvent, HostEventKind, HostStatsSnapshot};

use crate::dispatch::{DispatchError, FetchEvent, FetchOutcome};
use crate::interceptor::Interceptor;
use crate::lifecycle::{LifecycleError, LifecycleState};
use crate::models::{ClientId, InterceptedRequest, InterceptedResponse};
use crate::network::{Network, NetworkError};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use events::HostStats;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Failure surfaced to the original requester
#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Network(#[from] NetworkError),
}

/// What `register` did with the new version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisterOutcome {
    Activated,
    Waiting,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub id: String,
    pub version: String,
    pub state: LifecycleState,
    pub controlled_clients: usize,
}

impl From<&Interceptor> for InstanceSummary {
    fn from(value: &Interceptor) -> Self {
        Self {
            id: value.id().to_string(),
            version: value.version().to_string(),
            state: value.state(),
            controlled_clients: value.client_count(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostStatus {
    pub active: Option<InstanceSummary>,
    pub waiting: Option<InstanceSummary>,
    pub open_clients: usize,
    pub stats: HostStatsSnapshot,
}

#[derive(Default)]
struct Registration {
    active: Option<Arc<Interceptor>>,
    waiting: Option<Arc<Interceptor>>,
}

pub struct HostRuntime {
    network: Arc<dyn Network>,
    registration: Mutex<Registration>,
    lifecycle_lock: tokio::sync::Mutex<()>,
    clients: DashMap<ClientId, DateTime<Utc>>,
    events: broadcast::Sender<HostEvent>,
    stats: HostStats,
}

impl HostRuntime {
    pub fn new(network: Arc<dyn Network>) -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            network,
            registration: Mutex::new(Registration::default()),
            lifecycle_lock: tokio::sync::Mutex::new(()),
            clients: DashMap::new(),
            events,
            stats: HostStats::default(),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    fn emit(&self, instance: &Interceptor, kind: HostEventKind) {
        let _ = self
            .events
            .send(HostEvent::new(instance.id(), instance.version(), kind));
    }

    fn registration(&self) -> std::sync::MutexGuard<'_, Registration> {
        self.registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn active(&self) -> Option<Arc<Interceptor>> {
        self.registration().active.clone()
    }

    pub fn waiting(&self) -> Option<Arc<Interceptor>> {
        self.registration().waiting.clone()
    }

    pub fn stats(&self) -> HostStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn status(&self) -> HostStatus {
        let (active, waiting) = {
            let reg = self.registration();
            (reg.active.clone(), reg.waiting.clone())
        };
        HostStatus {
            active: active.as_deref().map(InstanceSummary::from),
            waiting: waiting.as_deref().map(InstanceSummary::from),
            open_clients: self.clients.len(),
            stats: self.stats.snapshot(),
        }
    }

    /// Load a new interceptor version: deliver Install, then either activate
    /// it or park it as the waiting version. A lifecycle failure discards
    /// this instance only; the current active instance keeps serving.
    pub async fn register(
        &self,
        interceptor: Arc<Interceptor>,
    ) -> Result<RegisterOutcome, LifecycleError> {
        let _serial = self.lifecycle_lock.lock().await;
        tracing::info!(
            "Registering interceptor {} ({})",
            interceptor.version(),
            interceptor.id()
        );

        let installed = match interceptor.install().await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!("Install of {} failed: {}", interceptor.version(), err);
                self.emit(
                    &interceptor,
                    HostEventKind::InstallFailed {
                        reason: err.to_string(),
                    },
                );
                return Err(err);
            }
        };
        self.emit(&interceptor, HostEventKind::Installed);

        let active_in_use = self
            .active()
            .map(|active| active.client_count() > 0)
            .unwrap_or(false);
        if installed.skip_waiting || !active_in_use {
            self.promote(interceptor).await?;
            return Ok(RegisterOutcome::Activated);
        }

        let superseded = self.registration().waiting.replace(interceptor.clone());
        if let Some(old) = superseded {
            tracing::info!("Waiting version {} superseded", old.version());
            self.emit(&old, HostEventKind::Evicted);
        }
        tracing::info!(
            "Interceptor {} installed; waiting for clients of the active version to close",
            interceptor.version()
        );
        self.emit(&interceptor, HostEventKind::Waiting);
        Ok(RegisterOutcome::Waiting)
    }

    /// Deliver Activate and make `interceptor` the active version. Callers
    /// hold `lifecycle_lock`.
    async fn promote(&self, interceptor: Arc<Interceptor>) -> Result<(), LifecycleError> {
        let activated = match interceptor.activate().await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!("Activation of {} failed: {}", interceptor.version(), err);
                {
                    let mut reg = self.registration();
                    if reg
                        .waiting
                        .as_ref()
                        .is_some_and(|w| Arc::ptr_eq(w, &interceptor))
                    {
                        reg.waiting = None;
                    }
                }
                self.emit(
                    &interceptor,
                    HostEventKind::ActivateFailed {
                        reason: err.to_string(),
                    },
                );
                return Err(err);
            }
        };

        let (previous, stale_waiting) = {
            let mut reg = self.registration();
            let stale = reg
                .waiting
                .take()
                .filter(|w| !Arc::ptr_eq(w, &interceptor));
            (reg.active.replace(interceptor.clone()), stale)
        };

        if let Some(previous) = previous {
            let moved = previous.release_all();
            for client in moved {
                interceptor.control(client);
            }
            tracing::info!(
                "Interceptor {} replaced by {}",
                previous.version(),
                interceptor.version()
            );
            self.emit(&previous, HostEventKind::Evicted);
        }
        if let Some(stale) = stale_waiting {
            self.emit(&stale, HostEventKind::Evicted);
        }

        tracing::info!("Interceptor {} active", interceptor.version());
        self.emit(&interceptor, HostEventKind::Activated);

        if activated.claim_clients {
            let claimed = self
                .clients
                .iter()
                .filter(|entry| interceptor.control(entry.key().clone()))
                .count();
            tracing::info!(
                "Interceptor {} claimed {} client(s)",
                interceptor.version(),
                claimed
            );
            self.emit(&interceptor, HostEventKind::Claimed { clients: claimed });
        }
        Ok(())
    }

    /// Open a new client context. A client opened while an instance is
    /// active is controlled by it from the start.
    pub fn open_client(&self) -> ClientId {
        let id = ClientId::new();
        self.attach_client(id.clone());
        id
    }

    /// Open a client context under a caller-chosen id. Returns false if the
    /// client is already open.
    pub fn attach_client(&self, id: ClientId) -> bool {
        // Held across `control` so a concurrent promotion either sees this
        // client on the previous instance and moves it, or is seen here.
        let reg = self.registration();
        match self.clients.entry(id.clone()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(slot) => {
                slot.insert(Utc::now());
            }
        }
        if let Some(active) = &reg.active {
            active.control(id);
        }
        true
    }

    pub fn is_client_open(&self, id: &ClientId) -> bool {
        self.clients.contains_key(id)
    }

    /// Close a client context. Closing the last client of the active
    /// instance lets a waiting version take over.
    pub async fn close_client(&self, id: &ClientId) -> bool {
        let _serial = self.lifecycle_lock.lock().await;
        if self.clients.remove(id).is_none() {
            return false;
        }

        let (active, waiting) = {
            let reg = self.registration();
            (reg.active.clone(), reg.waiting.clone())
        };
        if let Some(active) = &active {
            active.release(id);
        }

        let released = active.map(|a| a.client_count() == 0).unwrap_or(true);
        if let (Some(waiting), true) = (waiting, released) {
            tracing::info!(
                "Active version released its clients; promoting {}",
                waiting.version()
            );
            if let Err(err) = self.promote(waiting).await {
                tracing::warn!("Promotion of waiting version failed: {}", err);
            }
        }
        true
    }

    fn controller_of(&self, client: &ClientId) -> Option<Arc<Interceptor>> {
        self.active().filter(|active| active.controls(client))
    }

    /// Issue a request on behalf of `client`. Resolves exactly once: with the
    /// response produced for it, or with the single failure reported by the
    /// interceptor or the network.
    pub async fn fetch(
        &self,
        client: &ClientId,
        request: InterceptedRequest,
    ) -> Result<InterceptedResponse, FetchError> {
        let Some(instance) = self.controller_of(client) else {
            self.stats.record_passthrough();
            tracing::trace!("Uncontrolled client {}; passthrough", client);
            return Ok(self.network.fetch(request).await?);
        };

        self.stats.record_dispatched();
        let fallback = request.clone();
        let (event, resolution) = FetchEvent::new(request, Some(client.clone()));
        let (_, outcome) = tokio::join!(instance.dispatch(event), resolution.outcome());

        match outcome {
            FetchOutcome::Responded(Ok(response)) => {
                self.stats.record_resolved();
                self.emit(
                    &instance,
                    HostEventKind::FetchResolved {
                        status_code: response.status_code,
                    },
                );
                Ok(response)
            }
            FetchOutcome::Responded(Err(err)) => {
                self.stats.record_failed();
                tracing::debug!("Fetch {} failed: {}", fallback.url(), err);
                self.emit(
                    &instance,
                    HostEventKind::FetchFailed {
                        reason: err.to_string(),
                    },
                );
                Err(err.into())
            }
            FetchOutcome::Declined => {
                self.stats.record_fallback();
                self.emit(&instance, HostEventKind::FetchFallback);
                Ok(self.network.fetch(fallback).await?)
            }
        }
    }

    /// Host-driven teardown: discard every instance and release their
    /// clients. Returns the number of instances evicted.
    pub async fn unregister(&self) -> usize {
        let _serial = self.lifecycle_lock.lock().await;
        let (active, waiting) = {
            let mut reg = self.registration();
            (reg.active.take(), reg.waiting.take())
        };
        let mut evicted = 0;
        for instance in [active, waiting].into_iter().flatten() {
            instance.release_all();
            self.emit(&instance, HostEventKind::Evicted);
            evicted += 1;
        }
        tracing::info!("Unregistered {} interceptor instance(s)", evicted);
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::test_support::StubNetwork;
    use crate::dispatch::{Dispatcher, FetchHandler};
    use crate::models::ResponseSource;
    use futures::future::BoxFuture;

    fn staged(version: &str, network: Arc<StubNetwork>) -> Arc<Interceptor> {
        Interceptor::builder(version)
            .on_fetch(Dispatcher::passthrough(network))
            .build()
    }

    fn drain(rx: &mut broadcast::Receiver<HostEvent>) -> Vec<(String, HostEventKind)> {
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push((event.version, event.kind));
        }
        seen
    }

    #[tokio::test]
    async fn install_is_observed_before_activate() {
        let host = HostRuntime::new(StubNetwork::ok(200));
        let mut rx = host.subscribe_events();
        let outcome = host
            .register(Interceptor::passthrough("v1", StubNetwork::ok(200)))
            .await
            .unwrap();
        assert_eq!(outcome, RegisterOutcome::Activated);

        let kinds: Vec<_> = drain(&mut rx).into_iter().map(|(_, k)| k).collect();
        let installed = kinds
            .iter()
            .position(|k| *k == HostEventKind::Installed)
            .unwrap();
        let activated = kinds
            .iter()
            .position(|k| *k == HostEventKind::Activated)
            .unwrap();
        assert!(installed < activated);
    }

    #[tokio::test]
    async fn without_skip_waiting_new_version_waits_for_clients() {
        let network = StubNetwork::ok(200);
        let host = HostRuntime::new(network.clone());
        host.register(staged("v1", network.clone())).await.unwrap();
        let client = host.open_client();
        assert!(host.active().unwrap().controls(&client));

        let v2 = staged("v2", network.clone());
        let outcome = host.register(v2.clone()).await.unwrap();
        assert_eq!(outcome, RegisterOutcome::Waiting);
        assert_eq!(v2.state(), LifecycleState::Installed);
        assert_eq!(host.active().unwrap().version(), "v1");

        assert!(host.close_client(&client).await);
        assert_eq!(host.active().unwrap().version(), "v2");
        assert!(v2.is_active());
        assert!(host.waiting().is_none());
    }

    #[tokio::test]
    async fn skip_waiting_replaces_active_and_inherits_its_clients() {
        let network = StubNetwork::ok(200);
        let host = HostRuntime::new(network.clone());
        let v1 = staged("v1", network.clone());
        host.register(v1.clone()).await.unwrap();
        let client = host.open_client();

        let v2 = Interceptor::builder("v2")
            .skip_waiting(true)
            .on_fetch(Dispatcher::passthrough(network.clone()))
            .build();
        let outcome = host.register(v2.clone()).await.unwrap();
        assert_eq!(outcome, RegisterOutcome::Activated);
        assert!(v2.is_active());
        assert!(v2.controls(&client));
        assert!(!v1.controls(&client));
    }

    #[tokio::test]
    async fn claim_adopts_previously_uncontrolled_clients() {
        let network = StubNetwork::ok(200);
        let host = HostRuntime::new(network.clone());
        let early = host.open_client();

        host.register(staged("unclaimed", network.clone()))
            .await
            .unwrap();
        assert!(!host.active().unwrap().controls(&early));
        host.fetch(&early, InterceptedRequest::get("https://example.com/"))
            .await
            .unwrap();
        assert_eq!(host.stats().passthrough, 1);
        assert_eq!(host.stats().dispatched, 0);

        host.unregister().await;
        let mut rx = host.subscribe_events();
        host.register(Interceptor::passthrough("claiming", network.clone()))
            .await
            .unwrap();
        assert!(host.active().unwrap().controls(&early));
        assert!(drain(&mut rx)
            .iter()
            .any(|(_, k)| *k == HostEventKind::Claimed { clients: 1 }));

        host.fetch(&early, InterceptedRequest::get("https://example.com/"))
            .await
            .unwrap();
        assert_eq!(host.stats().dispatched, 1);
        assert_eq!(host.stats().resolved, 1);
    }

    #[tokio::test]
    async fn failed_install_keeps_current_active() {
        let network = StubNetwork::ok(200);
        let host = HostRuntime::new(network.clone());
        host.register(Interceptor::passthrough("v1", network.clone()))
            .await
            .unwrap();

        let broken = Interceptor::builder("v2")
            .skip_waiting(true)
            .on_install(|_| async { Err(LifecycleError::InstallFailed("boom".into())) })
            .build();
        assert!(host.register(broken.clone()).await.is_err());
        assert_eq!(broken.state(), LifecycleState::Uninstalled);
        assert_eq!(host.active().unwrap().version(), "v1");
    }

    #[tokio::test]
    async fn failed_activation_discards_waiting_instance() {
        let network = StubNetwork::ok(200);
        let host = HostRuntime::new(network.clone());
        host.register(staged("v1", network.clone())).await.unwrap();
        let client = host.open_client();

        let broken = Interceptor::builder("v2")
            .on_activate(|_| async { Err(LifecycleError::ActivateFailed("boom".into())) })
            .build();
        assert_eq!(
            host.register(broken).await.unwrap(),
            RegisterOutcome::Waiting
        );

        host.close_client(&client).await;
        assert!(host.waiting().is_none());
        assert_eq!(host.active().unwrap().version(), "v1");
    }

    #[tokio::test]
    async fn every_dispatched_fetch_has_exactly_one_outcome() {
        let network = StubNetwork::ok(200);
        let host = Arc::new(HostRuntime::new(network.clone()));
        host.register(Interceptor::passthrough("v1", network.clone()))
            .await
            .unwrap();
        let client = host.open_client();

        let mut tasks = Vec::new();
        for i in 0..32 {
            let host = host.clone();
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                host.fetch(
                    &client,
                    InterceptedRequest::get(format!("https://example.com/{i}")),
                )
                .await
            }));
        }
        for task in tasks {
            let response = task.await.unwrap().unwrap();
            assert_eq!(response.status_code, 200);
        }

        let stats = host.stats();
        assert_eq!(stats.dispatched, 32);
        assert_eq!(stats.resolved + stats.failed + stats.fallbacks, 32);
        assert_eq!(network.calls(), 32);
    }

    struct DecliningHandler;

    impl FetchHandler for DecliningHandler {
        fn handle(&self, event: FetchEvent) -> BoxFuture<'_, ()> {
            Box::pin(async move { drop(event) })
        }
    }

    #[tokio::test]
    async fn declined_fetch_falls_back_to_network_once() {
        let network = StubNetwork::ok(200);
        let host = HostRuntime::new(network.clone());
        host.register(
            Interceptor::builder("v1")
                .skip_waiting(true)
                .claim_clients(true)
                .on_fetch(DecliningHandler)
                .build(),
        )
        .await
        .unwrap();
        let client = host.open_client();

        let response = host
            .fetch(&client, InterceptedRequest::get("https://example.com/a"))
            .await
            .unwrap();
        assert_eq!(response.source, ResponseSource::Network);
        assert_eq!(network.calls(), 1);
        assert_eq!(host.stats().fallbacks, 1);
    }

    #[tokio::test]
    async fn unregister_releases_clients() {
        let network = StubNetwork::ok(200);
        let host = HostRuntime::new(network.clone());
        host.register(Interceptor::passthrough("v1", network.clone()))
            .await
            .unwrap();
        let client = host.open_client();
        assert_eq!(host.unregister().await, 1);
        assert!(host.active().is_none());
        assert!(host.is_client_open(&client));

        host.fetch(&client, InterceptedRequest::get("https://example.com/"))
            .await
            .unwrap();
        assert_eq!(host.stats().passthrough, 1);
        assert_eq!(host.status().open_clients, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn clients_attached_during_promotion_are_never_orphaned() {
        let network = StubNetwork::ok(200);
        let host = Arc::new(HostRuntime::new(network.clone()));
        host.register(staged("v1", network.clone())).await.unwrap();
        let _busy = host.open_client();

        let attachers: Vec<_> = (0..64)
            .map(|_| {
                let host = host.clone();
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    host.open_client()
                })
            })
            .collect();
        let v2 = Interceptor::builder("v2")
            .skip_waiting(true)
            .on_fetch(Dispatcher::passthrough(network.clone()))
            .build();
        host.register(v2.clone()).await.unwrap();

        for attacher in attachers {
            let client = attacher.await.unwrap();
            assert!(v2.controls(&client), "client {client} left uncontrolled");
        }
        assert_eq!(v2.client_count(), 65);
    }
}
