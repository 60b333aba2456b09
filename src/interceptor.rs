//! Interceptor instance
//!
//! One instance exists per loaded interceptor version. It owns its lifecycle
//! state, the set of client contexts it controls and the handlers registered
//! for the three event kinds.

use crate::config::InterceptorConfig;
use crate::dispatch::{Dispatcher, FetchEvent, FetchHandler};
use crate::lifecycle::{
    ActivateContext, ActivateHandler, ActivateOutcome, InstallContext, InstallHandler,
    InstallOutcome, LifecycleError, LifecycleManager, LifecycleState,
};
use crate::models::ClientId;
use crate::network::Network;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

/// The events an interceptor can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Install,
    Activate,
    Fetch,
}

pub struct Interceptor {
    id: String,
    version: String,
    lifecycle: LifecycleManager,
    fetch_handler: Option<Arc<dyn FetchHandler>>,
    clients: RwLock<BTreeSet<ClientId>>,
}

impl std::fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptor")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("state", &self.state())
            .finish()
    }
}

impl Interceptor {
    pub fn builder(version: impl Into<String>) -> InterceptorBuilder {
        InterceptorBuilder::new(version)
    }

    /// Interceptor that activates immediately, claims every open client and
    /// forwards each request unmodified to the network.
    pub fn passthrough(version: impl Into<String>, network: Arc<dyn Network>) -> Arc<Self> {
        Self::builder(version)
            .skip_waiting(true)
            .claim_clients(true)
            .on_fetch(Dispatcher::passthrough(network))
            .build()
    }

    /// Passthrough interceptor whose takeover behaviour follows `config`.
    pub fn from_config(config: &InterceptorConfig, network: Arc<dyn Network>) -> Arc<Self> {
        Self::builder(config.version.clone())
            .skip_waiting(config.skip_waiting)
            .claim_clients(config.claim_clients)
            .on_fetch(Dispatcher::passthrough(network))
            .build()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    /// Whether an explicit handler is registered for `kind`. Events without
    /// one complete with the host's default behaviour.
    pub fn handles(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Install => self.lifecycle.has_install_handler(),
            EventKind::Activate => self.lifecycle.has_activate_handler(),
            EventKind::Fetch => self.fetch_handler.is_some(),
        }
    }

    pub(crate) async fn install(&self) -> Result<InstallOutcome, LifecycleError> {
        tracing::debug!("Delivering install to {} ({})", self.version, self.id);
        self.lifecycle.on_install().await
    }

    pub(crate) async fn activate(&self) -> Result<ActivateOutcome, LifecycleError> {
        tracing::debug!("Delivering activate to {} ({})", self.version, self.id);
        self.lifecycle.on_activate().await
    }

    /// Deliver a fetch event. Without a fetch handler, or before activation,
    /// the event is dropped and the host default applies.
    pub(crate) fn dispatch(&self, event: FetchEvent) -> BoxFuture<'_, ()> {
        match &self.fetch_handler {
            Some(handler) if self.is_active() => handler.handle(event),
            Some(_) => {
                tracing::warn!(
                    "Fetch for {} delivered to {} in state {:?}; declining",
                    event.request().url(),
                    self.version,
                    self.state()
                );
                Box::pin(async move { drop(event) })
            }
            None => Box::pin(async move { drop(event) }),
        }
    }

    pub fn controls(&self, client: &ClientId) -> bool {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(client)
    }

    pub fn controlled_clients(&self) -> Vec<ClientId> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn client_count(&self) -> usize {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub(crate) fn control(&self, client: ClientId) -> bool {
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(client)
    }

    pub(crate) fn release(&self, client: &ClientId) -> bool {
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(client)
    }

    pub(crate) fn release_all(&self) -> Vec<ClientId> {
        let mut guard = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *guard).into_iter().collect()
    }
}

/// Registers handlers against the typed [`EventKind`]s.
pub struct InterceptorBuilder {
    version: String,
    install: Option<InstallHandler>,
    activate: Option<ActivateHandler>,
    fetch: Option<Arc<dyn FetchHandler>>,
    skip_waiting: bool,
    claim_clients: bool,
}

impl InterceptorBuilder {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            install: None,
            activate: None,
            fetch: None,
            skip_waiting: false,
            claim_clients: false,
        }
    }

    pub fn on_install<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(InstallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), LifecycleError>> + Send + 'static,
    {
        self.install = Some(Arc::new(
            move |ctx: InstallContext| -> BoxFuture<'static, Result<(), LifecycleError>> {
                Box::pin(handler(ctx))
            },
        ));
        self
    }

    pub fn on_activate<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ActivateContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), LifecycleError>> + Send + 'static,
    {
        self.activate = Some(Arc::new(
            move |ctx: ActivateContext| -> BoxFuture<'static, Result<(), LifecycleError>> {
                Box::pin(handler(ctx))
            },
        ));
        self
    }

    pub fn on_fetch<H>(mut self, handler: H) -> Self
    where
        H: FetchHandler + 'static,
    {
        self.fetch = Some(Arc::new(handler));
        self
    }

    /// Request immediate activation at install time.
    pub fn skip_waiting(mut self, enabled: bool) -> Self {
        self.skip_waiting = enabled;
        self
    }

    /// Request immediate client claim at activation time.
    pub fn claim_clients(mut self, enabled: bool) -> Self {
        self.claim_clients = enabled;
        self
    }

    pub fn build(self) -> Arc<Interceptor> {
        let lifecycle = LifecycleManager::new(self.install, self.activate)
            .with_takeover(self.skip_waiting, self.claim_clients);
        Arc::new(Interceptor {
            id: uuid::Uuid::new_v4().to_string(),
            version: self.version,
            lifecycle,
            fetch_handler: self.fetch,
            clients: RwLock::new(BTreeSet::new()),
        })
    }
}
