//! Completion handles carried by Install and Activate events.
//!
//! A handler may request the opt-in takeover behaviour through these handles
//! and may extend the event with additional asynchronous work via
//! `wait_until`. The event is only considered handled once every extension
//! has resolved.

use super::LifecycleError;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

type Extension = BoxFuture<'static, Result<(), LifecycleError>>;

#[derive(Default)]
struct Extensions {
    pending: Mutex<Vec<Extension>>,
    settled: AtomicBool,
}

impl Extensions {
    fn push(&self, ext: Extension) {
        if self.settled.load(Ordering::SeqCst) {
            tracing::warn!("wait_until called after the event was handled; extension ignored");
            return;
        }
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ext);
    }

    /// Await extensions until none are left, including any registered by an
    /// extension while it ran.
    async fn settle(&self) -> Result<(), LifecycleError> {
        loop {
            let pending = std::mem::take(
                &mut *self
                    .pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner),
            );
            if pending.is_empty() {
                self.settled.store(true, Ordering::SeqCst);
                return Ok(());
            }
            if let Err(err) = futures::future::try_join_all(pending).await {
                self.settled.store(true, Ordering::SeqCst);
                return Err(err);
            }
        }
    }
}

/// Handle passed to the install handler
#[derive(Clone, Default)]
pub struct InstallContext {
    skip_waiting: Arc<AtomicBool>,
    extensions: Arc<Extensions>,
}

impl InstallContext {
    pub(crate) fn new(skip_waiting: bool) -> Self {
        Self {
            skip_waiting: Arc::new(AtomicBool::new(skip_waiting)),
            extensions: Arc::default(),
        }
    }

    /// Request immediate activation, bypassing the host's wait for other
    /// instances to release their clients.
    pub fn skip_waiting(&self) {
        self.skip_waiting.store(true, Ordering::SeqCst);
    }

    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    /// Extend the install event until `fut` resolves. A failure aborts the
    /// installation.
    pub fn wait_until<F>(&self, fut: F)
    where
        F: Future<Output = Result<(), LifecycleError>> + Send + 'static,
    {
        self.extensions.push(Box::pin(fut));
    }

    pub(crate) async fn settle(&self) -> Result<(), LifecycleError> {
        self.extensions.settle().await
    }
}

/// Handle passed to the activate handler
#[derive(Clone, Default)]
pub struct ActivateContext {
    claim: Arc<AtomicBool>,
    extensions: Arc<Extensions>,
}

impl ActivateContext {
    pub(crate) fn new(claim: bool) -> Self {
        Self {
            claim: Arc::new(AtomicBool::new(claim)),
            extensions: Arc::default(),
        }
    }

    /// Take control of open client contexts not yet controlled by this
    /// interceptor.
    pub fn claim_clients(&self) {
        self.claim.store(true, Ordering::SeqCst);
    }

    pub fn claim_requested(&self) -> bool {
        self.claim.load(Ordering::SeqCst)
    }

    pub fn wait_until<F>(&self, fut: F)
    where
        F: Future<Output = Result<(), LifecycleError>> + Send + 'static,
    {
        self.extensions.push(Box::pin(fut));
    }

    pub(crate) async fn settle(&self) -> Result<(), LifecycleError> {
        self.extensions.settle().await
    }
}
